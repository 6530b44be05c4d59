//! Settings that control payment admission and the URLs the gateway calls back.

use crate::{Error, endpoints};

/// The smallest deposit the gateway accepts.
pub const DEFAULT_MINIMUM_DEPOSIT: f64 = 1.0;
/// The smallest withdrawal a user may request.
pub const DEFAULT_MINIMUM_WITHDRAWAL: f64 = 10.0;
/// The timezone the gateway expects request timestamps in.
pub const DEFAULT_TIMEZONE: &str = "Africa/Nairobi";

/// The configuration for initiating payments.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentConfig {
    /// The public base URL of this server, e.g. "https://pesa.example.com".
    ///
    /// The gateway sends its callbacks to endpoints under this URL.
    pub site_url: String,
    /// The smallest amount that can be deposited.
    pub minimum_deposit: f64,
    /// The smallest amount that can be withdrawn.
    pub minimum_withdrawal: f64,
    /// The canonical timezone for gateway timestamps and payment references.
    pub timezone: String,
}

impl PaymentConfig {
    /// Create a config with the default limits for a server hosted at `site_url`.
    pub fn new(site_url: &str) -> Self {
        Self {
            site_url: site_url.trim_end_matches('/').to_owned(),
            minimum_deposit: DEFAULT_MINIMUM_DEPOSIT,
            minimum_withdrawal: DEFAULT_MINIMUM_WITHDRAWAL,
            timezone: DEFAULT_TIMEZONE.to_owned(),
        }
    }

    /// The URL the gateway posts STK push results to.
    pub fn deposit_callback_url(&self) -> String {
        format!("{}{}", self.site_url, endpoints::MPESA_CALLBACK)
    }

    /// The URL the gateway posts B2C results to.
    pub fn withdrawal_result_url(&self) -> String {
        format!("{}{}", self.site_url, endpoints::B2C_RESULT)
    }

    /// The URL the gateway posts B2C queue timeouts to.
    pub fn withdrawal_timeout_url(&self) -> String {
        format!("{}{}", self.site_url, endpoints::B2C_TIMEOUT)
    }
}

/// Truncate `amount` to whole shillings and check it against `minimum`.
///
/// The gateway only accepts whole amounts, so any fraction is dropped before
/// the check.
///
/// # Errors
/// Returns [Error::AmountBelowMinimum] if the whole amount is below `minimum`
/// or `amount` is not a finite number.
pub fn whole_shillings(amount: f64, minimum: f64) -> Result<u64, Error> {
    let whole = amount.trunc();

    if !whole.is_finite() || whole < minimum || whole < 1.0 {
        return Err(Error::AmountBelowMinimum { amount, minimum });
    }

    Ok(whole as u64)
}

#[cfg(test)]
mod tests {
    use crate::Error;

    use super::{PaymentConfig, whole_shillings};

    #[test]
    fn amounts_are_truncated_before_the_minimum_check() {
        assert_eq!(whole_shillings(100.75, 1.0), Ok(100));
        assert_eq!(whole_shillings(10.0, 10.0), Ok(10));
        assert_eq!(
            whole_shillings(9.99, 10.0),
            Err(Error::AmountBelowMinimum {
                amount: 9.99,
                minimum: 10.0
            })
        );
    }

    #[test]
    fn non_finite_and_fractional_amounts_are_rejected() {
        assert!(whole_shillings(f64::NAN, 1.0).is_err());
        assert!(whole_shillings(f64::INFINITY, 1.0).is_err());
        assert!(whole_shillings(0.5, 0.0).is_err());
        assert!(whole_shillings(-5.0, 1.0).is_err());
    }

    #[test]
    fn callback_urls_are_under_site_url() {
        let config = PaymentConfig::new("https://pesa.example.com/");

        assert_eq!(
            config.deposit_callback_url(),
            "https://pesa.example.com/api/mpesa/callback"
        );
        assert_eq!(
            config.withdrawal_result_url(),
            "https://pesa.example.com/api/mpesa/b2c-result"
        );
        assert_eq!(
            config.withdrawal_timeout_url(),
            "https://pesa.example.com/api/mpesa/b2c-timeout"
        );
    }
}

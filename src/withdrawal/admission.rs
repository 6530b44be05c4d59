//! The checks a withdrawal must pass before the gateway is asked to pay out.

use rusqlite::Connection;

use crate::{
    Error, PaymentConfig, PhoneNumber, UserID, balance::available_balance,
    config::whole_shillings, credentials::GatewayCredentials, credentials::require_credentials,
};

/// A withdrawal that passed every check.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmittedWithdrawal {
    /// The credentials to pay out with.
    pub credentials: GatewayCredentials,
    /// The amount in whole shillings.
    pub amount: u64,
    /// The phone receiving the money.
    pub phone_number: PhoneNumber,
}

/// Check that `user_id` may withdraw `amount` to `phone_number`.
///
/// The checks run in order: the credentials are saved, active and complete
/// enough for payouts, the amount is at least the configured minimum, the
/// amount is at most the available balance, and the phone number can be
/// normalized. Nothing is written and no network call is made.
///
/// # Errors
/// Returns the validation error of the first check that fails.
pub fn admit_withdrawal(
    user_id: UserID,
    amount: f64,
    phone_number: &str,
    config: &PaymentConfig,
    connection: &Connection,
) -> Result<AdmittedWithdrawal, Error> {
    let credentials = require_credentials(user_id, connection)?;
    credentials.ensure_can_withdraw()?;

    let amount = whole_shillings(amount, config.minimum_withdrawal)?;

    let available = available_balance(user_id, connection)?;
    if amount as f64 > available {
        return Err(Error::InsufficientBalance {
            requested: amount as f64,
            available,
        });
    }

    let phone_number = PhoneNumber::parse(phone_number)?;

    Ok(AdmittedWithdrawal {
        credentials,
        amount,
        phone_number,
    })
}

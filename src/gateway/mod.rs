//! The adapter for the mobile-money payment gateway.
//!
//! [Gateway] is the seam between the ledger and the network: [MpesaClient]
//! talks to the real API, tests substitute a stub. Implementations only make
//! network calls, recording the outcome in the ledger is the caller's job.

mod client;
mod payload;
mod token;

use async_trait::async_trait;

use crate::{PhoneNumber, UserID, credentials::GatewayCredentials};

pub use client::{GatewayConfig, MpesaClient, PRODUCTION_BASE_URL, SANDBOX_BASE_URL};
pub use payload::{
    B2CCallback, CallbackMetadata, MetadataItem, StkCallback, TransactionResult,
    UNKNOWN_RESULT_CODE, metadata_value,
};
pub use token::{TOKEN_LIFETIME, TokenCache};

/// The error code the gateway uses for bad consumer credentials on
/// initiation, and for "still processing" on status queries.
pub const WRONG_CREDENTIALS_CODE: &str = "500.001.1001";

/// The errors returned by a [Gateway].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// An access token could not be obtained with the owner's credentials.
    ///
    /// This is not retried automatically, the credentials need fixing.
    #[error("could not authenticate with the payment gateway: {0}")]
    Auth(String),

    /// The gateway answered with an error.
    #[error("the payment gateway rejected the request ({code}): {message}")]
    Rejected {
        /// The HTTP status code of the response.
        status: u16,
        /// The gateway's error code, or the HTTP status if it sent none.
        code: String,
        /// The gateway's error message.
        message: String,
    },

    /// The gateway could not be reached or did not answer in time.
    #[error("could not reach the payment gateway: {0}")]
    Transport(String),

    /// The gateway answered with a body that could not be understood.
    #[error("unexpected response from the payment gateway: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Whether repeating the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Transport(_) => true,
            GatewayError::Rejected { status, code, .. } => {
                code != WRONG_CREDENTIALS_CODE && (*status >= 500 || *status == 429)
            }
            GatewayError::Auth(_) | GatewayError::InvalidResponse(_) => false,
        }
    }

    /// Whether the gateway rejected the consumer key and secret.
    pub fn is_wrong_credentials(&self) -> bool {
        match self {
            GatewayError::Rejected { code, message, .. } => {
                code == WRONG_CREDENTIALS_CODE || message.contains("Wrong credentials")
            }
            _ => false,
        }
    }

    /// The message to show the user who started the request.
    pub fn user_message(&self) -> String {
        match self {
            error if error.is_wrong_credentials() => "Invalid M-Pesa credentials. Please verify your \
                Consumer Key and Consumer Secret in the M-Pesa settings page."
                .to_owned(),
            GatewayError::Rejected { code, message, .. } => format!(
                "M-Pesa API error ({code}): {message}. Please check your settings and try again."
            ),
            GatewayError::Auth(_) => "Could not authenticate with M-Pesa. Please verify your \
                Consumer Key and Consumer Secret in the M-Pesa settings page."
                .to_owned(),
            GatewayError::Transport(_) => {
                "Could not reach M-Pesa. Please try again in a moment.".to_owned()
            }
            GatewayError::InvalidResponse(_) => {
                "M-Pesa sent an unexpected response. Please try again later.".to_owned()
            }
        }
    }
}

/// A request to collect money from a phone with an STK push.
#[derive(Debug, Clone, PartialEq)]
pub struct DepositRequest {
    /// The phone that will be prompted to authorise the payment.
    pub phone_number: PhoneNumber,
    /// The amount in whole shillings.
    pub amount: u64,
    /// The reference shown on the payer's statement.
    pub account_reference: String,
    /// A short description of the payment.
    pub description: String,
}

/// The gateway's synchronous acceptance of a [DepositRequest].
#[derive(Debug, Clone, PartialEq)]
pub struct DepositAcknowledgement {
    /// The first half of the correlation pair.
    pub merchant_request_id: String,
    /// The second half of the correlation pair, used to match the callback.
    pub checkout_request_id: String,
    /// "0" when the request was accepted.
    pub response_code: String,
    /// The gateway's description of the response.
    pub response_description: Option<String>,
    /// A message to show the payer.
    pub customer_message: Option<String>,
}

/// A request to pay money out to a phone.
#[derive(Debug, Clone, PartialEq)]
pub struct WithdrawalRequest {
    /// The phone receiving the money.
    pub phone_number: PhoneNumber,
    /// The amount in whole shillings.
    pub amount: u64,
    /// A note attached to the payment.
    pub remarks: String,
}

/// The gateway's synchronous acceptance of a [WithdrawalRequest].
#[derive(Debug, Clone, PartialEq)]
pub struct WithdrawalAcknowledgement {
    /// The correlation ID used to match the result callback.
    pub conversation_id: String,
    /// The gateway's secondary correlation ID.
    pub originator_conversation_id: Option<String>,
    /// "0" when the request was accepted.
    pub response_code: String,
    /// The gateway's description of the response.
    pub response_description: Option<String>,
}

/// The answer to a status query.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusQueryOutcome {
    /// The gateway has not resolved the transaction yet.
    Pending {
        /// What the gateway said about the transaction, if anything.
        description: Option<String>,
    },
    /// The gateway reported the transaction's final result.
    Resolved(TransactionResult),
}

/// The operations the ledger needs from a payment gateway.
///
/// Every call is made on behalf of the owner of `credentials`.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Get a bearer token for `credentials`, from the cache if possible.
    async fn get_access_token(&self, credentials: &GatewayCredentials)
    -> Result<String, GatewayError>;

    /// Prompt the payer's phone to authorise a deposit.
    async fn initiate_deposit(
        &self,
        credentials: &GatewayCredentials,
        request: &DepositRequest,
    ) -> Result<DepositAcknowledgement, GatewayError>;

    /// Pay out a withdrawal.
    async fn initiate_withdrawal(
        &self,
        credentials: &GatewayCredentials,
        request: &WithdrawalRequest,
    ) -> Result<WithdrawalAcknowledgement, GatewayError>;

    /// Ask for the result of the deposit identified by `checkout_request_id`.
    async fn query_deposit_status(
        &self,
        credentials: &GatewayCredentials,
        checkout_request_id: &str,
    ) -> Result<StatusQueryOutcome, GatewayError>;

    /// Ask for the result of the withdrawal identified by `conversation_id`.
    async fn query_withdrawal_status(
        &self,
        credentials: &GatewayCredentials,
        conversation_id: &str,
    ) -> Result<StatusQueryOutcome, GatewayError>;

    /// Forget any cached token for `owner`.
    fn forget_token(&self, _owner: UserID) {}
}

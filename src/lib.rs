//! pesa_ledger tracks mobile-money savings deposits and withdrawals for a
//! personal finance tracker.
//!
//! Deposits are collected with an STK push and withdrawals are paid out with a
//! B2C payment. Both are recorded in a ledger as `pending` and resolved to a
//! terminal state by whichever of the gateway callback, the timeout callback,
//! or a status poll arrives first.
//!
//! This library provides a JSON API for initiating payments, receiving the
//! gateway's callbacks, reconciling pending payments and reading the
//! withdrawable balance.

#![warn(missing_docs)]

use std::{net::SocketAddr, time::Duration};

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum_server::Handle;
use serde_json::json;
use tokio::signal;

mod app_state;
mod auth;
mod balance;
mod config;
mod credentials;
mod database_id;
mod db;
mod deposit;
mod endpoints;
mod expense;
mod gateway;
mod logging;
mod phone;
mod reconcile;
mod routing;
mod timezone;
mod user;
mod withdrawal;

#[cfg(test)]
mod test_utils;

pub use app_state::AppState;
pub use auth::{COOKIE_USER_ID, set_auth_cookie};
pub use balance::{Balance, available_balance, get_balance};
pub use config::PaymentConfig;
pub use credentials::{CredentialsForm, GatewayCredentials, get_credentials, upsert_credentials};
pub use db::initialize as initialize_db;
pub use deposit::{DepositStatus, DepositTransaction, initiate_deposit};
pub use expense::{Expense, create_expense, get_total_expenses};
pub use gateway::{
    Gateway, GatewayConfig, GatewayError, MpesaClient, StatusQueryOutcome, TransactionResult,
};
pub use logging::{LOG_BODY_LENGTH_LIMIT, logging_middleware};
pub use phone::PhoneNumber;
pub use reconcile::{
    Applied, LedgerEntry, ReconcileSummary, Resolution, apply_result, reconcile_all_pending,
    reconcile_pending, spawn_periodic_reconciliation,
};
pub use routing::build_router;
pub use user::{User, UserID, create_user, get_user_by_id};
pub use withdrawal::{
    WithdrawalStatus, WithdrawalTransaction, admit_withdrawal, initiate_withdrawal,
};

/// An async task that waits for either the ctrl+c or terminate signal, whichever comes first, and
/// then signals the server to shut down gracefully.
///
/// `handle` is a handle to an Axum `Server`.
pub async fn graceful_shutdown(handle: Handle<SocketAddr>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::debug!("Received ctrl+c signal.");
            handle.graceful_shutdown(Some(Duration::from_secs(1)));
        },
        _ = terminate => {
            tracing::debug!("Received terminate signal.");
            handle.graceful_shutdown(Some(Duration::from_secs(1)));
        },
    }
}

/// The errors that may occur in the application.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// The phone number is not a Kenyan mobile number in any of the accepted
    /// formats.
    #[error("\"{0}\" is not a valid Kenyan phone number")]
    InvalidPhoneNumber(String),

    /// The amount is not a finite number or is below the minimum allowed for
    /// the operation.
    #[error("the amount {amount} is below the minimum of {minimum}")]
    AmountBelowMinimum {
        /// The requested amount.
        amount: f64,
        /// The smallest amount allowed.
        minimum: f64,
    },

    /// The withdrawal would take more than the withdrawable balance.
    #[error("cannot withdraw {requested}, only {available} is available")]
    InsufficientBalance {
        /// The requested amount.
        requested: f64,
        /// The withdrawable balance at the time of the request.
        available: f64,
    },

    /// The user has not saved any gateway credentials.
    #[error("the payment gateway has not been configured")]
    CredentialsMissing,

    /// The user's gateway credentials have been saved but not activated.
    #[error("the payment gateway integration is not active")]
    CredentialsInactive,

    /// A credential needed for the operation has not been set.
    ///
    /// The string names the missing field.
    #[error("the payment gateway credentials are incomplete: {0} is not set")]
    IncompleteCredentials(&'static str),

    /// A request to the payment gateway failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The requested resource was not found.
    ///
    /// Internally, this error may occur when a query returns no rows.
    #[error("the requested resource could not be found")]
    NotFound,

    /// The username already exists in the database.
    #[error("the username \"{0}\" is already taken")]
    DuplicateUsername(String),

    /// An unhandled/unexpected SQL error.
    #[error("an unexpected SQL error occurred: {0}")]
    SqlError(rusqlite::Error),

    /// Could not acquire the database lock
    #[error("could not acquire the database lock")]
    DatabaseLockError,
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        match value {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound,
            error => {
                tracing::error!("an unhandled SQL error occurred: {}", error);
                Error::SqlError(error)
            }
        }
    }
}

impl Error {
    /// Whether the error was caused by the request itself and was detected
    /// before anything was sent to the payment gateway.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidPhoneNumber(_)
                | Error::AmountBelowMinimum { .. }
                | Error::InsufficientBalance { .. }
                | Error::CredentialsMissing
                | Error::CredentialsInactive
                | Error::IncompleteCredentials(_)
        )
    }

    fn status_code(&self) -> StatusCode {
        match self {
            error if error.is_validation_error() => StatusCode::BAD_REQUEST,
            Error::Gateway(GatewayError::Transport(_)) => StatusCode::GATEWAY_TIMEOUT,
            Error::Gateway(_) => StatusCode::BAD_GATEWAY,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::DuplicateUsername(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message shown to the user for this error.
    fn user_message(&self) -> String {
        match self {
            Error::InvalidPhoneNumber(_) => "Please enter a valid Kenyan phone number.".to_owned(),
            Error::AmountBelowMinimum { minimum, .. } => {
                format!("Amount must be at least KSH {minimum}.")
            }
            Error::InsufficientBalance { available, .. } => {
                format!("Insufficient balance. Available balance: KSH {available:.2}")
            }
            Error::CredentialsMissing => "Please configure your M-Pesa settings first.".to_owned(),
            Error::CredentialsInactive => {
                "M-Pesa integration is not active. Please activate it in settings.".to_owned()
            }
            Error::IncompleteCredentials(field) => {
                format!("M-Pesa credentials are not configured. Please set your {field}.")
            }
            Error::Gateway(error) => error.user_message(),
            Error::NotFound => "The requested resource could not be found.".to_owned(),
            Error::DuplicateUsername(username) => {
                format!("The username \"{username}\" is already taken.")
            }
            _ => "An unexpected error occurred, check the server logs for more details.".to_owned(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!("An unexpected error occurred: {}", self);
        } else {
            tracing::warn!("Rejected request: {}", self);
        }

        (status, Json(json!({ "error": self.user_message() }))).into_response()
    }
}

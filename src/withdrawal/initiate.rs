//! Paying savings out to a phone.

use std::sync::{Arc, Mutex};

use axum::{
    Extension, Json,
    extract::{FromRef, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rusqlite::Connection;
use serde::Deserialize;

use crate::{
    AppState, Error, PaymentConfig, UserID,
    db::lock_connection,
    gateway::{Gateway, GatewayError, WithdrawalRequest},
    withdrawal::{
        admission::{AdmittedWithdrawal, admit_withdrawal},
        core::{
            WithdrawalTransaction, create_pending_withdrawal, delete_withdrawal,
            mark_withdrawal_rejected, record_withdrawal_acknowledgement,
        },
    },
};

/// The details a user submits to withdraw savings.
#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawalForm {
    /// The amount to withdraw. Any fraction of a shilling is dropped.
    pub amount: f64,
    /// The phone to pay the money to, in any accepted format.
    pub phone_number: String,
}

/// Withdraw `form.amount` from the savings of `user_id` to `form.phone_number`.
///
/// The withdrawal must pass [admit_withdrawal] first. It is then recorded as
/// pending before the gateway is called, and moves to processing once the
/// gateway accepts it. The database lock is released while the request is in
/// flight. If the gateway rejects the request the withdrawal is kept as
/// failed. If the gateway could not be reached, or the credentials could not
/// be used to authenticate, the withdrawal is removed again.
///
/// # Errors
/// Returns a validation error if admission fails, in which case nothing is
/// recorded and the gateway is not called. Returns [Error::Gateway] if the
/// gateway call fails.
pub async fn initiate_withdrawal(
    user_id: UserID,
    form: &WithdrawalForm,
    db_connection: &Mutex<Connection>,
    gateway: &dyn Gateway,
    config: &PaymentConfig,
) -> Result<WithdrawalTransaction, Error> {
    let (credentials, withdrawal, request) = {
        let connection = lock_connection(db_connection)?;

        let AdmittedWithdrawal {
            credentials,
            amount,
            phone_number,
        } = admit_withdrawal(user_id, form.amount, &form.phone_number, config, &connection)?;

        let withdrawal =
            create_pending_withdrawal(user_id, amount as f64, &phone_number, &connection)?;
        let request = WithdrawalRequest {
            remarks: format!("Withdrawal to {phone_number}"),
            phone_number,
            amount,
        };

        (credentials, withdrawal, request)
    };

    tracing::info!(
        "Initiating withdrawal {} of KSh {} for user {user_id}",
        withdrawal.id,
        request.amount
    );
    let result = gateway.initiate_withdrawal(&credentials, &request).await;
    let connection = lock_connection(db_connection)?;

    match result {
        Ok(acknowledgement) => {
            record_withdrawal_acknowledgement(withdrawal.id, &acknowledgement, &connection)
        }
        Err(error) => {
            match &error {
                GatewayError::Rejected { code, message, .. } => {
                    tracing::warn!("Withdrawal {} was rejected: {error}", withdrawal.id);
                    mark_withdrawal_rejected(
                        withdrawal.id,
                        Some(code.as_str()),
                        message,
                        &connection,
                    )?;
                }
                GatewayError::InvalidResponse(message) => {
                    tracing::error!(
                        "Withdrawal {} got an invalid response: {message}",
                        withdrawal.id
                    );
                    mark_withdrawal_rejected(withdrawal.id, None, message, &connection)?;
                }
                GatewayError::Auth(_) | GatewayError::Transport(_) => {
                    tracing::warn!("Withdrawal {} was not sent: {error}", withdrawal.id);
                    delete_withdrawal(withdrawal.id, &connection)?;
                }
            }

            Err(error.into())
        }
    }
}

/// The state needed to initiate a withdrawal.
#[derive(Clone)]
pub struct InitiateWithdrawalState {
    /// The database connection for the ledger.
    pub db_connection: Arc<Mutex<Connection>>,
    /// The gateway to send the payout through.
    pub gateway: Arc<dyn Gateway>,
    /// The withdrawal limits.
    pub payment_config: PaymentConfig,
}

impl FromRef<AppState> for InitiateWithdrawalState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            db_connection: state.db_connection.clone(),
            gateway: state.gateway.clone(),
            payment_config: state.payment_config.clone(),
        }
    }
}

/// A route handler for withdrawing savings, responds with the withdrawal.
pub async fn initiate_withdrawal_endpoint(
    State(state): State<InitiateWithdrawalState>,
    Extension(user_id): Extension<UserID>,
    Json(form): Json<WithdrawalForm>,
) -> Result<Response, Error> {
    let withdrawal = initiate_withdrawal(
        user_id,
        &form,
        &state.db_connection,
        state.gateway.as_ref(),
        &state.payment_config,
    )
    .await?;

    Ok((StatusCode::CREATED, Json(withdrawal)).into_response())
}

//! The endpoints the gateway posts payment results and timeouts to.
//!
//! The gateway retries callbacks that are not acknowledged, so every callback
//! that could be read is answered with `200 {"status": "success"}`, including
//! ones that match no ledger entry and ones for entries that are already
//! terminal. Bodies that cannot be parsed are logged and acknowledged too,
//! since resending them will not help. Only a failure to update the ledger is
//! answered with an error, so that the gateway tries again.

use std::sync::{Arc, Mutex};

use axum::{
    Json,
    body::Bytes,
    extract::{FromRef, State},
};
use rusqlite::Connection;
use serde_json::{Value, json};

use crate::{
    AppState, Error,
    db::lock_connection,
    deposit::get_deposit_by_checkout_request_id,
    gateway::{B2CCallback, StkCallback},
    reconcile::{LedgerEntry, Resolution, apply_result},
    withdrawal::get_withdrawal_by_conversation_id,
};

/// The state needed to handle gateway callbacks.
#[derive(Debug, Clone)]
pub struct CallbackState {
    /// The database connection for the ledger.
    pub db_connection: Arc<Mutex<Connection>>,
}

impl FromRef<AppState> for CallbackState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            db_connection: state.db_connection.clone(),
        }
    }
}

fn acknowledgement() -> Json<Value> {
    Json(json!({ "status": "success" }))
}

/// A route handler for STK push results.
///
/// The deposit is matched by its checkout request ID. If the callback also
/// carries a merchant request ID, it must match the stored one.
pub async fn deposit_callback_endpoint(
    State(state): State<CallbackState>,
    body: Bytes,
) -> Result<Json<Value>, Error> {
    let callback = match StkCallback::parse(&body) {
        Ok(callback) => callback,
        Err(error) => {
            tracing::error!("Could not parse STK callback: {error}");
            return Ok(acknowledgement());
        }
    };

    tracing::info!(
        "STK callback received for checkout request {:?} with result code {:?}",
        callback.checkout_request_id,
        callback.result_code
    );

    let Some(checkout_request_id) = callback.checkout_request_id.as_deref() else {
        tracing::warn!("STK callback without a checkout request ID");
        return Ok(acknowledgement());
    };

    let connection = lock_connection(&state.db_connection)?;
    let deposit = get_deposit_by_checkout_request_id(checkout_request_id, &connection)?
        .filter(|deposit| match &callback.merchant_request_id {
            Some(merchant_request_id) => {
                deposit.merchant_request_id.as_ref() == Some(merchant_request_id)
            }
            None => true,
        });

    let Some(deposit) = deposit else {
        tracing::warn!(
            "Deposit not found for STK callback: checkout request {checkout_request_id}, \
            merchant request {:?}",
            callback.merchant_request_id
        );
        return Ok(acknowledgement());
    };

    let resolution = Resolution::from_result(&callback.result());
    apply_result(LedgerEntry::Deposit(deposit.id), &resolution, &connection)?;

    Ok(acknowledgement())
}

/// A route handler for B2C payment results.
pub async fn withdrawal_result_endpoint(
    State(state): State<CallbackState>,
    body: Bytes,
) -> Result<Json<Value>, Error> {
    let callback = match B2CCallback::parse(&body) {
        Ok(callback) => callback,
        Err(error) => {
            tracing::error!("Could not parse B2C result: {error}");
            return Ok(acknowledgement());
        }
    };

    tracing::info!(
        "B2C result received for conversation {:?} with result code {}",
        callback.conversation_id,
        callback.result.result_code
    );

    resolve_withdrawal(
        &state.db_connection,
        callback.conversation_id.as_deref(),
        &Resolution::from_result(&callback.result),
    )?;

    Ok(acknowledgement())
}

/// A route handler for B2C queue timeouts, fails the withdrawal.
pub async fn withdrawal_timeout_endpoint(
    State(state): State<CallbackState>,
    body: Bytes,
) -> Result<Json<Value>, Error> {
    let callback = match B2CCallback::parse(&body) {
        Ok(callback) => callback,
        Err(error) => {
            tracing::error!("Could not parse B2C timeout: {error}");
            return Ok(acknowledgement());
        }
    };

    tracing::warn!("B2C timeout received for conversation {:?}", callback.conversation_id);

    resolve_withdrawal(
        &state.db_connection,
        callback.conversation_id.as_deref(),
        &Resolution::timed_out(),
    )?;

    Ok(acknowledgement())
}

fn resolve_withdrawal(
    db_connection: &Mutex<Connection>,
    conversation_id: Option<&str>,
    resolution: &Resolution,
) -> Result<(), Error> {
    let Some(conversation_id) = conversation_id else {
        tracing::warn!("B2C callback without a conversation ID");
        return Ok(());
    };

    let connection = lock_connection(db_connection)?;

    match get_withdrawal_by_conversation_id(conversation_id, &connection)? {
        Some(withdrawal) => {
            apply_result(LedgerEntry::Withdrawal(withdrawal.id), resolution, &connection)?;
        }
        None => {
            tracing::warn!("Withdrawal not found for B2C callback: {conversation_id}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod deposit_callback_tests {
    use serde_json::{Value, json};

    use crate::{
        PhoneNumber,
        deposit::{
            DepositStatus, DepositTransaction, create_pending_deposit, get_deposit,
            record_deposit_acknowledgement,
        },
        endpoints,
        gateway::DepositAcknowledgement,
        test_utils::{TestApp, get_test_app},
    };

    fn pending_deposit(app: &TestApp) -> DepositTransaction {
        let connection = app.connection();
        let phone = PhoneNumber::parse("0712345678").unwrap();
        let deposit = create_pending_deposit(app.user.id, 100.0, &phone, &connection).unwrap();

        record_deposit_acknowledgement(
            deposit.id,
            &DepositAcknowledgement {
                merchant_request_id: "M1".to_owned(),
                checkout_request_id: "X".to_owned(),
                response_code: "0".to_owned(),
                response_description: Some("Success. Request accepted for processing".to_owned()),
                customer_message: None,
            },
            &connection,
        )
        .unwrap()
    }

    fn success_body(receipt_number: &str) -> Value {
        json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "M1",
                    "CheckoutRequestID": "X",
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {"Item": [
                        {"Name": "Amount", "Value": 100},
                        {"Name": "MpesaReceiptNumber", "Value": receipt_number},
                        {"Name": "PhoneNumber", "Value": 254712345678_i64}
                    ]}
                }
            }
        })
    }

    #[tokio::test]
    async fn success_completes_the_deposit_once() {
        let app = get_test_app();
        let deposit = pending_deposit(&app);

        let response = app
            .server
            .post(endpoints::MPESA_CALLBACK)
            .json(&success_body("R1"))
            .await;

        response.assert_status_ok();
        response.assert_json(&json!({"status": "success"}));
        let completed = get_deposit(deposit.id, &app.connection()).unwrap();
        assert_eq!(completed.status, DepositStatus::Completed);
        assert_eq!(completed.mpesa_receipt_number.as_deref(), Some("R1"));
        assert!(completed.completed_at.is_some());

        let response = app
            .server
            .post(endpoints::MPESA_CALLBACK)
            .json(&success_body("R2"))
            .await;

        response.assert_status_ok();
        assert_eq!(get_deposit(deposit.id, &app.connection()).unwrap(), completed);
    }

    #[tokio::test]
    async fn failure_records_the_description() {
        let app = get_test_app();
        let deposit = pending_deposit(&app);

        app.server
            .post(endpoints::MPESA_CALLBACK)
            .json(&json!({
                "MerchantRequestID": "M1",
                "CheckoutRequestID": "X",
                "ResultCode": "1032",
                "ResultDesc": "Request cancelled by user"
            }))
            .await
            .assert_status_ok();

        let deposit = get_deposit(deposit.id, &app.connection()).unwrap();
        assert_eq!(deposit.status, DepositStatus::Failed);
        assert_eq!(
            deposit.response_description.as_deref(),
            Some("Request cancelled by user")
        );
        assert_eq!(deposit.completed_at, None);
    }

    #[tokio::test]
    async fn mismatched_merchant_request_id_is_ignored() {
        let app = get_test_app();
        let deposit = pending_deposit(&app);

        app.server
            .post(endpoints::MPESA_CALLBACK)
            .json(&json!({
                "MerchantRequestID": "someone-else",
                "CheckoutRequestID": "X",
                "ResultCode": 0
            }))
            .await
            .assert_status_ok();

        assert_eq!(
            get_deposit(deposit.id, &app.connection()).unwrap().status,
            DepositStatus::Pending
        );
    }

    #[tokio::test]
    async fn unknown_checkout_request_is_acknowledged() {
        let app = get_test_app();

        let response = app
            .server
            .post(endpoints::MPESA_CALLBACK)
            .json(&json!({"MerchantRequestID": "M1", "CheckoutRequestID": "nope", "ResultCode": 0}))
            .await;

        response.assert_status_ok();
        response.assert_json(&json!({"status": "success"}));
    }

    #[tokio::test]
    async fn malformed_body_is_acknowledged() {
        let app = get_test_app();

        let response = app
            .server
            .post(endpoints::MPESA_CALLBACK)
            .text("this is not json")
            .await;

        response.assert_status_ok();
        response.assert_json(&json!({"status": "success"}));
    }
}

#[cfg(test)]
mod withdrawal_callback_tests {
    use serde_json::json;

    use crate::{
        PhoneNumber, endpoints,
        gateway::WithdrawalAcknowledgement,
        test_utils::{TestApp, get_test_app},
        withdrawal::{
            WithdrawalStatus, WithdrawalTransaction, create_pending_withdrawal, get_withdrawal,
            record_withdrawal_acknowledgement,
        },
    };

    fn processing_withdrawal(app: &TestApp) -> WithdrawalTransaction {
        let connection = app.connection();
        let phone = PhoneNumber::parse("0712345678").unwrap();
        let withdrawal = create_pending_withdrawal(app.user.id, 50.0, &phone, &connection).unwrap();

        record_withdrawal_acknowledgement(
            withdrawal.id,
            &WithdrawalAcknowledgement {
                conversation_id: "C1".to_owned(),
                originator_conversation_id: Some("O1".to_owned()),
                response_code: "0".to_owned(),
                response_description: None,
            },
            &connection,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn nested_result_completes_the_withdrawal() {
        let app = get_test_app();
        let withdrawal = processing_withdrawal(&app);

        app.server
            .post(endpoints::B2C_RESULT)
            .json(&json!({
                "Result": {
                    "ResultType": 0,
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "OriginatorConversationID": "O1",
                    "ConversationID": "C1",
                    "TransactionID": "T1",
                    "ResultParameters": {"ResultParameter": [
                        {"Key": "TransactionReceipt", "Value": "T1"},
                        {"Key": "TransactionAmount", "Value": 50}
                    ]}
                }
            }))
            .await
            .assert_status_ok();

        let withdrawal = get_withdrawal(withdrawal.id, &app.connection()).unwrap();
        assert_eq!(withdrawal.status, WithdrawalStatus::Completed);
        assert_eq!(withdrawal.transaction_id.as_deref(), Some("T1"));
        assert_eq!(withdrawal.mpesa_receipt_number.as_deref(), Some("T1"));
    }

    #[tokio::test]
    async fn flat_result_on_the_alternative_route_completes_the_withdrawal() {
        let app = get_test_app();
        let withdrawal = processing_withdrawal(&app);

        app.server
            .post(endpoints::B2C_CALLBACK)
            .json(&json!({
                "ConversationID": "C1",
                "ResultCode": 0,
                "ResultDesc": "Done",
                "CallbackMetadata": {"Item": [
                    {"Name": "TransactionId", "Value": "T7"},
                    {"Name": "MpesaReceiptNumber", "Value": "R7"}
                ]}
            }))
            .await
            .assert_status_ok();

        let withdrawal = get_withdrawal(withdrawal.id, &app.connection()).unwrap();
        assert_eq!(withdrawal.status, WithdrawalStatus::Completed);
        assert_eq!(withdrawal.transaction_id.as_deref(), Some("T7"));
        assert_eq!(withdrawal.mpesa_receipt_number.as_deref(), Some("R7"));
    }

    #[tokio::test]
    async fn timeout_fails_the_withdrawal_and_later_results_are_ignored() {
        let app = get_test_app();
        let withdrawal = processing_withdrawal(&app);

        app.server
            .post(endpoints::B2C_TIMEOUT)
            .json(&json!({"ConversationID": "C1"}))
            .await
            .assert_status_ok();
        app.server
            .post(endpoints::B2C_RESULT)
            .json(&json!({"ConversationID": "C1", "ResultCode": 0}))
            .await
            .assert_status_ok();

        let withdrawal = get_withdrawal(withdrawal.id, &app.connection()).unwrap();
        assert_eq!(withdrawal.status, WithdrawalStatus::Failed);
        assert_eq!(
            withdrawal.response_description.as_deref(),
            Some("Transaction timed out")
        );
        assert_eq!(withdrawal.completed_at, None);
    }

    #[tokio::test]
    async fn unknown_conversation_is_acknowledged() {
        let app = get_test_app();

        let response = app
            .server
            .post(endpoints::B2C_TIMEOUT)
            .json(&json!({"ConversationID": "unknown"}))
            .await;

        response.assert_status_ok();
        response.assert_json(&json!({"status": "success"}));
    }
}

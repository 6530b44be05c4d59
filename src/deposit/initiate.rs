//! Starting a deposit with an STK push to the payer's phone.

use std::sync::{Arc, Mutex};

use axum::{
    Extension, Json,
    extract::{FromRef, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rusqlite::Connection;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::{
    AppState, Error, PaymentConfig, PhoneNumber, UserID,
    config::whole_shillings,
    credentials::require_credentials,
    db::lock_connection,
    deposit::core::{
        DepositTransaction, create_pending_deposit, delete_deposit, mark_deposit_rejected,
        record_deposit_acknowledgement,
    },
    gateway::{DepositRequest, Gateway, GatewayError},
    timezone::gateway_timestamp,
    user::get_user_by_id,
};

/// The details a user submits to start a deposit.
#[derive(Debug, Clone, Deserialize)]
pub struct DepositForm {
    /// The amount to save. Any fraction of a shilling is dropped.
    pub amount: f64,
    /// The phone to collect the money from, in any accepted format.
    pub phone_number: String,
}

/// Start a deposit of `form.amount` from `form.phone_number` into the savings
/// of `user_id`.
///
/// The deposit is recorded as pending before the gateway is called, and the
/// database lock is released while the request is in flight. If the gateway
/// rejects the request the deposit is kept as failed. If the gateway could not
/// be reached, or the credentials could not be used to authenticate, the
/// deposit is removed again.
///
/// # Errors
/// Returns a validation error if the credentials, amount or phone number are
/// not usable, in which case nothing is recorded and the gateway is not
/// called. Returns [Error::Gateway] if the gateway call fails.
pub async fn initiate_deposit(
    user_id: UserID,
    form: &DepositForm,
    db_connection: &Mutex<Connection>,
    gateway: &dyn Gateway,
    config: &PaymentConfig,
) -> Result<DepositTransaction, Error> {
    let (credentials, deposit, request) = {
        let connection = lock_connection(db_connection)?;

        let credentials = require_credentials(user_id, &connection)?;
        credentials.ensure_can_deposit()?;

        let amount = whole_shillings(form.amount, config.minimum_deposit)?;
        let phone_number = PhoneNumber::parse(&form.phone_number)?;
        let user = get_user_by_id(user_id, &connection)?.ok_or(Error::NotFound)?;

        let deposit = create_pending_deposit(user_id, amount as f64, &phone_number, &connection)?;
        let timestamp = gateway_timestamp(&config.timezone, OffsetDateTime::now_utc());
        let request = DepositRequest {
            phone_number,
            amount,
            account_reference: format!("Save-{}-{}", user.username, timestamp),
            description: format!("Save Money - {}", user.username),
        };

        (credentials, deposit, request)
    };

    tracing::info!(
        "Initiating deposit {} of KSh {} for user {user_id}",
        deposit.id,
        request.amount
    );
    let result = gateway.initiate_deposit(&credentials, &request).await;
    let connection = lock_connection(db_connection)?;

    match result {
        Ok(acknowledgement) => {
            record_deposit_acknowledgement(deposit.id, &acknowledgement, &connection)
        }
        Err(error) => {
            match &error {
                GatewayError::Rejected { code, message, .. } => {
                    tracing::warn!("Deposit {} was rejected: {error}", deposit.id);
                    mark_deposit_rejected(
                        deposit.id,
                        Some(code.as_str()),
                        message,
                        &connection,
                    )?;
                }
                GatewayError::InvalidResponse(message) => {
                    tracing::error!("Deposit {} got an invalid response: {message}", deposit.id);
                    mark_deposit_rejected(deposit.id, None, message, &connection)?;
                }
                GatewayError::Auth(_) | GatewayError::Transport(_) => {
                    tracing::warn!("Deposit {} was not sent: {error}", deposit.id);
                    delete_deposit(deposit.id, &connection)?;
                }
            }

            Err(error.into())
        }
    }
}

/// The state needed to initiate a deposit.
#[derive(Clone)]
pub struct InitiateDepositState {
    /// The database connection for the ledger.
    pub db_connection: Arc<Mutex<Connection>>,
    /// The gateway to send the STK push through.
    pub gateway: Arc<dyn Gateway>,
    /// The deposit limits.
    pub payment_config: PaymentConfig,
}

impl FromRef<AppState> for InitiateDepositState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            db_connection: state.db_connection.clone(),
            gateway: state.gateway.clone(),
            payment_config: state.payment_config.clone(),
        }
    }
}

/// A route handler for starting a deposit, responds with the pending deposit.
pub async fn initiate_deposit_endpoint(
    State(state): State<InitiateDepositState>,
    Extension(user_id): Extension<UserID>,
    Json(form): Json<DepositForm>,
) -> Result<Response, Error> {
    let deposit = initiate_deposit(
        user_id,
        &form,
        &state.db_connection,
        state.gateway.as_ref(),
        &state.payment_config,
    )
    .await?;

    Ok((StatusCode::CREATED, Json(deposit)).into_response())
}

#[cfg(test)]
mod initiate_deposit_tests {
    use std::sync::{Mutex, atomic::Ordering};

    use rusqlite::Connection;

    use crate::{
        Error, PaymentConfig, User,
        credentials::{CredentialsForm, upsert_credentials},
        deposit::{
            DepositStatus,
            core::{get_deposit_by_checkout_request_id, get_user_deposits},
            initiate::{DepositForm, initiate_deposit},
        },
        gateway::GatewayError,
        test_utils::{
            StubGateway, create_test_user, get_test_connection, insert_test_credentials,
        },
    };

    fn setup() -> (Mutex<Connection>, User) {
        let connection = get_test_connection();
        let user = create_test_user(&connection, "wanjiku");
        insert_test_credentials(&connection, user.id);

        (Mutex::new(connection), user)
    }

    fn form(amount: f64, phone_number: &str) -> DepositForm {
        DepositForm {
            amount,
            phone_number: phone_number.to_owned(),
        }
    }

    #[tokio::test]
    async fn accepted_deposit_is_pending_with_correlation_ids() {
        let (db, user) = setup();
        let gateway = StubGateway::new();

        let deposit = initiate_deposit(
            user.id,
            &form(100.0, "0712345678"),
            &db,
            &gateway,
            &PaymentConfig::new("https://pesa.example.com"),
        )
        .await
        .unwrap();

        assert_eq!(deposit.status, DepositStatus::Pending);
        assert_eq!(deposit.checkout_request_id.as_deref(), Some("X"));
        assert_eq!(deposit.amount, 100.0);
        assert_eq!(deposit.phone_number, "254712345678");
        let connection = db.lock().unwrap();
        assert_eq!(
            get_deposit_by_checkout_request_id("X", &connection),
            Ok(Some(deposit))
        );
    }

    #[tokio::test]
    async fn request_carries_reference_and_whole_amount() {
        let (db, user) = setup();
        let gateway = StubGateway::new();

        initiate_deposit(
            user.id,
            &form(100.9, "+254 712 345 678"),
            &db,
            &gateway,
            &PaymentConfig::new("https://pesa.example.com"),
        )
        .await
        .unwrap();

        let requests = gateway.deposit_requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].amount, 100);
        assert_eq!(requests[0].phone_number.as_str(), "254712345678");
        assert!(requests[0].account_reference.starts_with("Save-wanjiku-"));
        assert_eq!(requests[0].description, "Save Money - wanjiku");
    }

    #[tokio::test]
    async fn invalid_phone_is_rejected_before_the_gateway() {
        let (db, user) = setup();
        let gateway = StubGateway::new();

        let result = initiate_deposit(
            user.id,
            &form(100.0, "812345678"),
            &db,
            &gateway,
            &PaymentConfig::new("https://pesa.example.com"),
        )
        .await;

        assert_eq!(result, Err(Error::InvalidPhoneNumber("812345678".to_owned())));
        assert_eq!(gateway.deposit_calls.load(Ordering::SeqCst), 0);
        assert!(get_user_deposits(user.id, &db.lock().unwrap()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn amount_below_minimum_is_rejected() {
        let (db, user) = setup();
        let gateway = StubGateway::new();

        let result = initiate_deposit(
            user.id,
            &form(0.5, "0712345678"),
            &db,
            &gateway,
            &PaymentConfig::new("https://pesa.example.com"),
        )
        .await;

        assert!(matches!(result, Err(Error::AmountBelowMinimum { .. })));
        assert_eq!(gateway.deposit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inactive_credentials_are_rejected() {
        let (db, user) = setup();
        upsert_credentials(
            user.id,
            &CredentialsForm {
                is_active: false,
                ..Default::default()
            },
            &db.lock().unwrap(),
        )
        .unwrap();
        let gateway = StubGateway::new();

        let result = initiate_deposit(
            user.id,
            &form(100.0, "0712345678"),
            &db,
            &gateway,
            &PaymentConfig::new("https://pesa.example.com"),
        )
        .await;

        assert_eq!(result, Err(Error::CredentialsInactive));
        assert_eq!(gateway.deposit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_credentials_are_rejected() {
        let connection = get_test_connection();
        let user = create_test_user(&connection, "wanjiku");
        let db = Mutex::new(connection);
        let gateway = StubGateway::new();

        let result = initiate_deposit(
            user.id,
            &form(100.0, "0712345678"),
            &db,
            &gateway,
            &PaymentConfig::new("https://pesa.example.com"),
        )
        .await;

        assert_eq!(result, Err(Error::CredentialsMissing));
    }

    #[tokio::test]
    async fn rejected_deposit_is_recorded_as_failed() {
        let (db, user) = setup();
        let gateway = StubGateway::new();
        gateway.fail_deposits_with(GatewayError::Rejected {
            status: 400,
            code: "400.002.02".to_owned(),
            message: "Bad Request - Invalid Amount".to_owned(),
        });

        let result = initiate_deposit(
            user.id,
            &form(100.0, "0712345678"),
            &db,
            &gateway,
            &PaymentConfig::new("https://pesa.example.com"),
        )
        .await;

        assert!(matches!(result, Err(Error::Gateway(GatewayError::Rejected { .. }))));
        let deposits = get_user_deposits(user.id, &db.lock().unwrap()).unwrap();
        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].status, DepositStatus::Failed);
        assert_eq!(deposits[0].response_code.as_deref(), Some("400.002.02"));
        assert_eq!(deposits[0].completed_at, None);
    }

    #[tokio::test]
    async fn unreachable_gateway_leaves_no_deposit() {
        let (db, user) = setup();
        let gateway = StubGateway::new();
        gateway.fail_deposits_with(GatewayError::Transport("timed out".to_owned()));

        let result = initiate_deposit(
            user.id,
            &form(100.0, "0712345678"),
            &db,
            &gateway,
            &PaymentConfig::new("https://pesa.example.com"),
        )
        .await;

        let error = result.unwrap_err();
        assert!(matches!(&error, Error::Gateway(error) if error.is_retryable()));
        assert!(get_user_deposits(user.id, &db.lock().unwrap()).unwrap().is_empty());
    }
}

#[cfg(test)]
mod initiate_deposit_endpoint_tests {
    use axum::http::StatusCode;
    use serde_json::{Value, json};

    use crate::{endpoints, test_utils::get_test_app};

    #[tokio::test]
    async fn returns_created_deposit() {
        let app = get_test_app();
        app.insert_credentials();

        let response = app
            .post(endpoints::DEPOSITS)
            .json(&json!({"amount": 100, "phone_number": "0712345678"}))
            .await;

        response.assert_status(StatusCode::CREATED);
        let body: Value = response.json();
        assert_eq!(body["status"], "pending");
        assert_eq!(body["checkout_request_id"], "X");
        assert_eq!(body["amount"], 100.0);
    }

    #[tokio::test]
    async fn validation_errors_are_bad_requests() {
        let app = get_test_app();
        app.insert_credentials();

        let response = app
            .post(endpoints::DEPOSITS)
            .json(&json!({"amount": 100, "phone_number": "12345"}))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(
            response.json::<Value>()["error"],
            "Please enter a valid Kenyan phone number."
        );
    }
}

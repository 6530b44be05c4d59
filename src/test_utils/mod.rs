#![allow(missing_docs)]

//! Fixtures shared by the unit tests.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use axum::{http::header::SET_COOKIE, response::IntoResponse};
use axum_extra::extract::{PrivateCookieJar, cookie::Cookie};
use axum_test::{TestRequest, TestServer};
use rusqlite::Connection;
use time::OffsetDateTime;

use crate::{
    AppState, PaymentConfig, User, UserID,
    auth::set_auth_cookie,
    build_router,
    credentials::{CredentialsForm, GatewayCredentials, upsert_credentials},
    db::initialize,
    gateway::{
        DepositAcknowledgement, DepositRequest, Gateway, GatewayError, StatusQueryOutcome,
        WithdrawalAcknowledgement, WithdrawalRequest,
    },
    user::create_user,
};

pub(crate) const TEST_PASSKEY: &str =
    "bfb279f9aa9bdbcf158e97dd71a467cd2e0c893059b10f78e6b72ada1ed2c919";

pub(crate) fn get_test_connection() -> Connection {
    let connection =
        Connection::open_in_memory().expect("Could not open in-memory SQLite database");
    initialize(&connection).expect("Could not initialize database");

    connection
}

pub(crate) fn create_test_user(connection: &Connection, username: &str) -> User {
    create_user(username, connection).expect("Could not create test user")
}

/// Sandbox credentials that can deposit and withdraw.
pub(crate) fn test_credentials(user_id: UserID) -> GatewayCredentials {
    let now = OffsetDateTime::now_utc();

    GatewayCredentials {
        user_id,
        shortcode: "174379".to_owned(),
        passkey: TEST_PASSKEY.to_owned(),
        consumer_key: "consumer-key".to_owned(),
        consumer_secret: "consumer-secret".to_owned(),
        initiator_name: "api".to_owned(),
        security_credential: Some("encrypted-credential".to_owned()),
        is_sandbox: true,
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

/// Save [test_credentials] for `user_id`.
pub(crate) fn insert_test_credentials(
    connection: &Connection,
    user_id: UserID,
) -> GatewayCredentials {
    let credentials = test_credentials(user_id);
    let form = CredentialsForm {
        shortcode: credentials.shortcode,
        passkey: Some(credentials.passkey),
        consumer_key: Some(credentials.consumer_key),
        consumer_secret: Some(credentials.consumer_secret),
        initiator_name: Some(credentials.initiator_name),
        security_credential: credentials.security_credential,
        is_sandbox: credentials.is_sandbox,
        is_active: credentials.is_active,
    };

    upsert_credentials(user_id, &form, connection).expect("Could not save test credentials")
}

// ============================================================================
// STUB GATEWAY
// ============================================================================

/// A [Gateway] that records its calls and answers from canned responses.
///
/// Deposits are acknowledged with checkout request IDs "X", "X2", "X3", ...
/// and withdrawals with conversation IDs "C1", "C2", ... Status queries answer
/// pending unless an outcome has been set for the ID.
#[derive(Default)]
pub(crate) struct StubGateway {
    pub token_requests: AtomicUsize,
    pub forgotten_tokens: AtomicUsize,
    pub deposit_calls: AtomicUsize,
    pub withdrawal_calls: AtomicUsize,
    pub query_calls: AtomicUsize,
    pub deposit_requests: Mutex<Vec<DepositRequest>>,
    pub withdrawal_requests: Mutex<Vec<WithdrawalRequest>>,
    deposit_error: Mutex<Option<GatewayError>>,
    withdrawal_error: Mutex<Option<GatewayError>>,
    query_error: Mutex<Option<GatewayError>>,
    deposit_outcomes: Mutex<HashMap<String, StatusQueryOutcome>>,
    withdrawal_outcomes: Mutex<HashMap<String, StatusQueryOutcome>>,
}

impl StubGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_deposits_with(&self, error: GatewayError) {
        *self.deposit_error.lock().unwrap() = Some(error);
    }

    pub fn fail_withdrawals_with(&self, error: GatewayError) {
        *self.withdrawal_error.lock().unwrap() = Some(error);
    }

    pub fn fail_queries_with(&self, error: GatewayError) {
        *self.query_error.lock().unwrap() = Some(error);
    }

    pub fn set_deposit_outcome(&self, checkout_request_id: &str, outcome: StatusQueryOutcome) {
        self.deposit_outcomes
            .lock()
            .unwrap()
            .insert(checkout_request_id.to_owned(), outcome);
    }

    pub fn set_withdrawal_outcome(&self, conversation_id: &str, outcome: StatusQueryOutcome) {
        self.withdrawal_outcomes
            .lock()
            .unwrap()
            .insert(conversation_id.to_owned(), outcome);
    }

    fn query(
        &self,
        outcomes: &Mutex<HashMap<String, StatusQueryOutcome>>,
        id: &str,
    ) -> Result<StatusQueryOutcome, GatewayError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.query_error.lock().unwrap().clone() {
            return Err(error);
        }

        Ok(outcomes
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or(StatusQueryOutcome::Pending { description: None }))
    }
}

#[async_trait]
impl Gateway for StubGateway {
    async fn get_access_token(
        &self,
        _credentials: &GatewayCredentials,
    ) -> Result<String, GatewayError> {
        self.token_requests.fetch_add(1, Ordering::SeqCst);

        Ok("stub-token".to_owned())
    }

    async fn initiate_deposit(
        &self,
        _credentials: &GatewayCredentials,
        request: &DepositRequest,
    ) -> Result<DepositAcknowledgement, GatewayError> {
        let call = self.deposit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.deposit_requests.lock().unwrap().push(request.clone());

        if let Some(error) = self.deposit_error.lock().unwrap().clone() {
            return Err(error);
        }

        Ok(DepositAcknowledgement {
            merchant_request_id: format!("M{call}"),
            checkout_request_id: if call == 1 {
                "X".to_owned()
            } else {
                format!("X{call}")
            },
            response_code: "0".to_owned(),
            response_description: Some("Success. Request accepted for processing".to_owned()),
            customer_message: Some("Success. Request accepted for processing".to_owned()),
        })
    }

    async fn initiate_withdrawal(
        &self,
        _credentials: &GatewayCredentials,
        request: &WithdrawalRequest,
    ) -> Result<WithdrawalAcknowledgement, GatewayError> {
        let call = self.withdrawal_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.withdrawal_requests.lock().unwrap().push(request.clone());

        if let Some(error) = self.withdrawal_error.lock().unwrap().clone() {
            return Err(error);
        }

        Ok(WithdrawalAcknowledgement {
            conversation_id: format!("C{call}"),
            originator_conversation_id: Some(format!("O{call}")),
            response_code: "0".to_owned(),
            response_description: Some("Accept the service request successfully.".to_owned()),
        })
    }

    async fn query_deposit_status(
        &self,
        _credentials: &GatewayCredentials,
        checkout_request_id: &str,
    ) -> Result<StatusQueryOutcome, GatewayError> {
        self.query(&self.deposit_outcomes, checkout_request_id)
    }

    async fn query_withdrawal_status(
        &self,
        _credentials: &GatewayCredentials,
        conversation_id: &str,
    ) -> Result<StatusQueryOutcome, GatewayError> {
        self.query(&self.withdrawal_outcomes, conversation_id)
    }

    fn forget_token(&self, _owner: UserID) {
        self.forgotten_tokens.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// TEST APP
// ============================================================================

/// The full router backed by an in-memory database and a [StubGateway],
/// with a logged in user.
pub(crate) struct TestApp {
    pub server: TestServer,
    pub db_connection: Arc<Mutex<Connection>>,
    pub gateway: Arc<StubGateway>,
    pub user: User,
    auth_cookie: Cookie<'static>,
}

impl TestApp {
    /// A GET request as the logged in user.
    pub fn get(&self, path: &str) -> TestRequest {
        self.server.get(path).add_cookie(self.auth_cookie.clone())
    }

    /// A POST request as the logged in user.
    pub fn post(&self, path: &str) -> TestRequest {
        self.server.post(path).add_cookie(self.auth_cookie.clone())
    }

    /// A PUT request as the logged in user.
    pub fn put(&self, path: &str) -> TestRequest {
        self.server.put(path).add_cookie(self.auth_cookie.clone())
    }

    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.db_connection.lock().unwrap()
    }

    /// Save [test_credentials] for the logged in user.
    pub fn insert_credentials(&self) -> GatewayCredentials {
        insert_test_credentials(&self.connection(), self.user.id)
    }
}

pub(crate) fn get_test_app() -> TestApp {
    let gateway = Arc::new(StubGateway::new());
    let state = AppState::new(
        Connection::open_in_memory().expect("Could not open in-memory SQLite database"),
        "test secret",
        PaymentConfig::new("https://pesa.example.com"),
        gateway.clone(),
    )
    .expect("Could not create app state");
    let user = create_test_user(&state.db_connection.lock().unwrap(), "wanjiku");

    let response = set_auth_cookie(PrivateCookieJar::new(state.cookie_key.clone()), user.id)
        .into_response();
    let set_cookie = response
        .headers()
        .get(SET_COOKIE)
        .expect("auth cookie was not set")
        .to_str()
        .expect("auth cookie is not valid text")
        .to_owned();
    let auth_cookie = Cookie::parse(set_cookie).expect("Could not parse auth cookie");

    TestApp {
        server: TestServer::new(build_router(state.clone())).expect("Could not create test server."),
        db_connection: state.db_connection,
        gateway,
        user,
        auth_cookie,
    }
}

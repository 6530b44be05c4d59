//! Per-user payment gateway credentials and the endpoints for managing them.

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use axum::{
    Extension, Json,
    extract::{FromRef, State},
};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::{AppState, Error, UserID, gateway::Gateway};

/// The shortcode of the gateway's public test till.
pub const DEFAULT_SHORTCODE: &str = "174379";

/// The credentials a user has configured for the payment gateway.
#[derive(Clone, PartialEq)]
pub struct GatewayCredentials {
    /// The user the credentials belong to.
    pub user_id: UserID,
    /// The paybill or till number payments are made to and from.
    pub shortcode: String,
    /// The secret used to sign STK push requests.
    pub passkey: String,
    /// The key used to obtain access tokens.
    pub consumer_key: String,
    /// The secret used to obtain access tokens.
    pub consumer_secret: String,
    /// The name of the API operator that initiates withdrawals.
    pub initiator_name: String,
    /// The initiator's password, already encrypted with the gateway's public
    /// certificate.
    pub security_credential: Option<String>,
    /// Whether requests go to the sandbox rather than production.
    pub is_sandbox: bool,
    /// Whether the user has switched the integration on.
    pub is_active: bool,
    /// When the credentials were first saved.
    pub created_at: OffsetDateTime,
    /// When the credentials were last saved.
    pub updated_at: OffsetDateTime,
}

const REDACTED: &str = "********";

impl Debug for GatewayCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayCredentials")
            .field("user_id", &self.user_id)
            .field("shortcode", &self.shortcode)
            .field("passkey", &REDACTED)
            .field("consumer_key", &self.consumer_key)
            .field("consumer_secret", &REDACTED)
            .field("initiator_name", &self.initiator_name)
            .field(
                "security_credential",
                &self.security_credential.as_ref().map(|_| REDACTED),
            )
            .field("is_sandbox", &self.is_sandbox)
            .field("is_active", &self.is_active)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

impl GatewayCredentials {
    /// Check the fields needed to obtain an access token.
    ///
    /// # Errors
    /// Returns [Error::IncompleteCredentials] naming the first empty field.
    pub fn ensure_can_authenticate(&self) -> Result<(), Error> {
        if self.consumer_key.trim().is_empty() {
            return Err(Error::IncompleteCredentials("Consumer Key"));
        }

        if self.consumer_secret.trim().is_empty() {
            return Err(Error::IncompleteCredentials("Consumer Secret"));
        }

        Ok(())
    }

    /// Check that deposits can be initiated with these credentials.
    ///
    /// # Errors
    /// Returns [Error::CredentialsInactive] if the integration is switched off,
    /// or [Error::IncompleteCredentials] naming the first empty field.
    pub fn ensure_can_deposit(&self) -> Result<(), Error> {
        if !self.is_active {
            return Err(Error::CredentialsInactive);
        }

        self.ensure_can_authenticate()?;

        if self.shortcode.trim().is_empty() {
            return Err(Error::IncompleteCredentials("Shortcode"));
        }

        if self.passkey.trim().is_empty() {
            return Err(Error::IncompleteCredentials("Passkey"));
        }

        Ok(())
    }

    /// Check that withdrawals can be initiated with these credentials.
    ///
    /// # Errors
    /// Returns [Error::CredentialsInactive] if the integration is switched off,
    /// or [Error::IncompleteCredentials] naming the first empty field.
    pub fn ensure_can_withdraw(&self) -> Result<(), Error> {
        if !self.is_active {
            return Err(Error::CredentialsInactive);
        }

        self.ensure_can_authenticate()?;

        if self.shortcode.trim().is_empty() {
            return Err(Error::IncompleteCredentials("Shortcode"));
        }

        if self.initiator_name.trim().is_empty() {
            return Err(Error::IncompleteCredentials("Initiator Name"));
        }

        match self.security_credential.as_deref() {
            Some(credential) if !credential.trim().is_empty() => Ok(()),
            _ => Err(Error::IncompleteCredentials("Security Credential")),
        }
    }
}

/// The settings a user submits to save their credentials.
///
/// Secrets that are left out keep their saved value, so the settings can be
/// edited without re-entering them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialsForm {
    /// The paybill or till number.
    #[serde(default = "default_shortcode")]
    pub shortcode: String,
    /// The STK push passkey.
    #[serde(default)]
    pub passkey: Option<String>,
    /// The consumer key.
    #[serde(default)]
    pub consumer_key: Option<String>,
    /// The consumer secret.
    #[serde(default)]
    pub consumer_secret: Option<String>,
    /// The initiator name for withdrawals.
    #[serde(default)]
    pub initiator_name: Option<String>,
    /// The pre-encrypted security credential for withdrawals.
    #[serde(default)]
    pub security_credential: Option<String>,
    /// Whether to use the sandbox.
    #[serde(default = "default_true")]
    pub is_sandbox: bool,
    /// Whether to switch the integration on.
    #[serde(default)]
    pub is_active: bool,
}

fn default_shortcode() -> String {
    DEFAULT_SHORTCODE.to_owned()
}

fn default_true() -> bool {
    true
}

/// Create the table for gateway credentials, one row per user.
pub fn create_credentials_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS mpesa_credentials (
            user_id INTEGER PRIMARY KEY,
            shortcode TEXT NOT NULL,
            passkey TEXT NOT NULL,
            consumer_key TEXT NOT NULL,
            consumer_secret TEXT NOT NULL,
            initiator_name TEXT NOT NULL,
            security_credential TEXT,
            is_sandbox INTEGER NOT NULL,
            is_active INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES user(id) ON UPDATE CASCADE ON DELETE CASCADE
        )",
        (),
    )?;

    Ok(())
}

fn map_credentials_row(row: &Row) -> Result<GatewayCredentials, rusqlite::Error> {
    Ok(GatewayCredentials {
        user_id: UserID::new(row.get(0)?),
        shortcode: row.get(1)?,
        passkey: row.get(2)?,
        consumer_key: row.get(3)?,
        consumer_secret: row.get(4)?,
        initiator_name: row.get(5)?,
        security_credential: row.get(6)?,
        is_sandbox: row.get(7)?,
        is_active: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// Get the credentials saved by `user_id`, if any.
///
/// # Errors
/// Returns an [Error::SqlError] if the query fails.
pub fn get_credentials(
    user_id: UserID,
    connection: &Connection,
) -> Result<Option<GatewayCredentials>, Error> {
    connection
        .query_row(
            "SELECT user_id, shortcode, passkey, consumer_key, consumer_secret, initiator_name,
                security_credential, is_sandbox, is_active, created_at, updated_at
            FROM mpesa_credentials WHERE user_id = :user_id",
            &[(":user_id", &user_id.as_i64())],
            map_credentials_row,
        )
        .optional()
        .map_err(Error::from)
}

/// Get the credentials saved by `user_id`.
///
/// # Errors
/// Returns [Error::CredentialsMissing] if the user has not saved any.
pub fn require_credentials(
    user_id: UserID,
    connection: &Connection,
) -> Result<GatewayCredentials, Error> {
    get_credentials(user_id, connection)?.ok_or(Error::CredentialsMissing)
}

/// Save `form` as the credentials for `user_id`, replacing the fields it sets.
///
/// # Errors
/// Returns an [Error::SqlError] if the query fails, e.g. because the user
/// does not exist.
pub fn upsert_credentials(
    user_id: UserID,
    form: &CredentialsForm,
    connection: &Connection,
) -> Result<GatewayCredentials, Error> {
    let now = OffsetDateTime::now_utc();
    let non_empty = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
    };

    connection.execute(
        "INSERT INTO mpesa_credentials (user_id, shortcode, passkey, consumer_key,
            consumer_secret, initiator_name, security_credential, is_sandbox, is_active,
            created_at, updated_at)
        VALUES (?1, ?2, COALESCE(?3, ''), COALESCE(?4, ''), COALESCE(?5, ''),
            COALESCE(?6, ''), ?7, ?8, ?9, ?10, ?10)
        ON CONFLICT(user_id) DO UPDATE SET
            shortcode = excluded.shortcode,
            passkey = COALESCE(?3, passkey),
            consumer_key = COALESCE(?4, consumer_key),
            consumer_secret = COALESCE(?5, consumer_secret),
            initiator_name = COALESCE(?6, initiator_name),
            security_credential = COALESCE(?7, security_credential),
            is_sandbox = excluded.is_sandbox,
            is_active = excluded.is_active,
            updated_at = excluded.updated_at",
        rusqlite::params![
            user_id.as_i64(),
            form.shortcode.trim(),
            non_empty(&form.passkey),
            non_empty(&form.consumer_key),
            non_empty(&form.consumer_secret),
            non_empty(&form.initiator_name),
            non_empty(&form.security_credential),
            form.is_sandbox,
            form.is_active,
            now,
        ],
    )?;

    tracing::info!("Saved M-Pesa settings for user {user_id}");

    require_credentials(user_id, connection)
}

/// The state needed by the settings endpoints.
#[derive(Clone)]
pub struct CredentialsState {
    /// The database connection for managing credentials.
    pub db_connection: Arc<Mutex<Connection>>,
    /// The gateway the credentials are used with.
    pub gateway: Arc<dyn Gateway>,
}

impl FromRef<AppState> for CredentialsState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            db_connection: state.db_connection.clone(),
            gateway: state.gateway.clone(),
        }
    }
}

/// The saved settings as shown to their owner, without the secrets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingsView {
    /// Whether any settings have been saved.
    pub configured: bool,
    /// The paybill or till number.
    pub shortcode: String,
    /// The initiator name for withdrawals.
    pub initiator_name: String,
    /// Whether the sandbox is used.
    pub is_sandbox: bool,
    /// Whether the integration is switched on.
    pub is_active: bool,
    /// Whether a passkey has been saved.
    pub has_passkey: bool,
    /// Whether a consumer key has been saved.
    pub has_consumer_key: bool,
    /// Whether a consumer secret has been saved.
    pub has_consumer_secret: bool,
    /// Whether a security credential has been saved.
    pub has_security_credential: bool,
    /// When the settings were last saved.
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl From<Option<GatewayCredentials>> for SettingsView {
    fn from(credentials: Option<GatewayCredentials>) -> Self {
        match credentials {
            Some(credentials) => Self {
                configured: true,
                has_passkey: !credentials.passkey.is_empty(),
                has_consumer_key: !credentials.consumer_key.is_empty(),
                has_consumer_secret: !credentials.consumer_secret.is_empty(),
                has_security_credential: credentials.security_credential.is_some(),
                shortcode: credentials.shortcode,
                initiator_name: credentials.initiator_name,
                is_sandbox: credentials.is_sandbox,
                is_active: credentials.is_active,
                updated_at: Some(credentials.updated_at),
            },
            None => Self {
                configured: false,
                shortcode: DEFAULT_SHORTCODE.to_owned(),
                initiator_name: String::new(),
                is_sandbox: true,
                is_active: false,
                has_passkey: false,
                has_consumer_key: false,
                has_consumer_secret: false,
                has_security_credential: false,
                updated_at: None,
            },
        }
    }
}

/// A route handler for getting the user's settings, with secrets redacted.
pub async fn get_settings_endpoint(
    State(state): State<CredentialsState>,
    Extension(user_id): Extension<UserID>,
) -> Result<Json<SettingsView>, Error> {
    let connection = state
        .db_connection
        .lock()
        .inspect_err(|error| tracing::error!("could not acquire database lock: {error}"))
        .map_err(|_| Error::DatabaseLockError)?;

    let credentials = get_credentials(user_id, &connection)?;

    Ok(Json(credentials.into()))
}

/// A route handler for saving the user's settings.
///
/// Any cached access token for the user is dropped so the next request
/// authenticates with the new credentials.
pub async fn update_settings_endpoint(
    State(state): State<CredentialsState>,
    Extension(user_id): Extension<UserID>,
    Json(form): Json<CredentialsForm>,
) -> Result<Json<SettingsView>, Error> {
    let credentials = {
        let connection = state
            .db_connection
            .lock()
            .inspect_err(|error| tracing::error!("could not acquire database lock: {error}"))
            .map_err(|_| Error::DatabaseLockError)?;

        upsert_credentials(user_id, &form, &connection)?
    };

    state.gateway.forget_token(user_id);

    Ok(Json(Some(credentials).into()))
}

/// A route handler that checks the user's credentials by requesting an access
/// token.
pub async fn test_connection_endpoint(
    State(state): State<CredentialsState>,
    Extension(user_id): Extension<UserID>,
) -> Result<Json<Value>, Error> {
    let credentials = {
        let connection = state
            .db_connection
            .lock()
            .inspect_err(|error| tracing::error!("could not acquire database lock: {error}"))
            .map_err(|_| Error::DatabaseLockError)?;

        require_credentials(user_id, &connection)?
    };
    credentials.ensure_can_authenticate()?;

    state.gateway.forget_token(user_id);
    state.gateway.get_access_token(&credentials).await?;

    Ok(Json(json!({
        "status": "success",
        "message": "Successfully connected to M-Pesa API."
    })))
}

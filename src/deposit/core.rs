//! Defines the deposit ledger: the model, its table and the queries on it.

use std::{fmt::Display, str::FromStr};

use rusqlite::{
    Connection, OptionalExtension, Row, ToSql,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    Error, PhoneNumber, UserID, database_id::DepositId, gateway::DepositAcknowledgement,
};

// ============================================================================
// MODELS
// ============================================================================

/// Where a deposit is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DepositStatus {
    /// Waiting for the payer or the gateway.
    Pending,
    /// The money was received.
    Completed,
    /// The gateway or payer declined the payment.
    Failed,
    /// The payment was called off.
    Cancelled,
}

impl DepositStatus {
    /// The status as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Pending => "pending",
            DepositStatus::Completed => "completed",
            DepositStatus::Failed => "failed",
            DepositStatus::Cancelled => "cancelled",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DepositStatus::Pending)
    }
}

impl Display for DepositStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DepositStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DepositStatus::Pending),
            "completed" => Ok(DepositStatus::Completed),
            "failed" => Ok(DepositStatus::Failed),
            "cancelled" => Ok(DepositStatus::Cancelled),
            other => Err(format!("unknown deposit status \"{other}\"")),
        }
    }
}

impl ToSql for DepositStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for DepositStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error: String| FromSqlError::Other(error.into()))
    }
}

/// An attempt to move money from a phone into the user's savings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepositTransaction {
    /// The ID of the deposit.
    pub id: DepositId,
    /// The user that owns the deposit.
    pub user_id: UserID,
    /// The amount in whole shillings.
    pub amount: f64,
    /// The phone that paid, in the `254XXXXXXXXX` form.
    pub phone_number: String,
    /// The first half of the gateway's correlation pair.
    pub merchant_request_id: Option<String>,
    /// The second half of the gateway's correlation pair, unique per deposit.
    pub checkout_request_id: Option<String>,
    /// Where the deposit is in its lifecycle.
    pub status: DepositStatus,
    /// The gateway's response code.
    pub response_code: Option<String>,
    /// The gateway's description of the latest response or result.
    pub response_description: Option<String>,
    /// The message the gateway wants shown to the payer.
    pub customer_message: Option<String>,
    /// The gateway's receipt number, set on completion.
    pub mpesa_receipt_number: Option<String>,
    /// When the deposit was initiated.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// When the deposit completed, set if and only if it completed.
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

// ============================================================================
// DATABASE FUNCTIONS
// ============================================================================

/// Create the deposit table.
///
/// # Errors
/// Returns an error if the SQL query fails.
pub fn create_deposit_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute_batch(
        "CREATE TABLE IF NOT EXISTS mpesa_deposit (
            id INTEGER PRIMARY KEY,
            user_id INTEGER NOT NULL,
            amount REAL NOT NULL CHECK (amount > 0),
            phone_number TEXT NOT NULL,
            merchant_request_id TEXT,
            checkout_request_id TEXT UNIQUE,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'completed', 'failed', 'cancelled')),
            response_code TEXT,
            response_description TEXT,
            customer_message TEXT,
            mpesa_receipt_number TEXT,
            created_at TEXT NOT NULL,
            completed_at TEXT,
            CHECK ((status = 'completed') = (completed_at IS NOT NULL)),
            FOREIGN KEY(user_id) REFERENCES user(id) ON UPDATE CASCADE ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_mpesa_deposit_user_status
            ON mpesa_deposit(user_id, status);",
    )?;

    Ok(())
}

const DEPOSIT_COLUMNS: &str = "id, user_id, amount, phone_number, merchant_request_id, \
    checkout_request_id, status, response_code, response_description, customer_message, \
    mpesa_receipt_number, created_at, completed_at";

/// Map a row selected with all deposit columns to a [DepositTransaction].
pub fn map_deposit_row(row: &Row) -> Result<DepositTransaction, rusqlite::Error> {
    Ok(DepositTransaction {
        id: row.get(0)?,
        user_id: UserID::new(row.get(1)?),
        amount: row.get(2)?,
        phone_number: row.get(3)?,
        merchant_request_id: row.get(4)?,
        checkout_request_id: row.get(5)?,
        status: row.get(6)?,
        response_code: row.get(7)?,
        response_description: row.get(8)?,
        customer_message: row.get(9)?,
        mpesa_receipt_number: row.get(10)?,
        created_at: row.get(11)?,
        completed_at: row.get(12)?,
    })
}

/// Record a new pending deposit with no correlation IDs.
///
/// # Errors
/// Returns an [Error::SqlError] if the insert fails.
pub fn create_pending_deposit(
    user_id: UserID,
    amount: f64,
    phone_number: &PhoneNumber,
    connection: &Connection,
) -> Result<DepositTransaction, Error> {
    connection.execute(
        "INSERT INTO mpesa_deposit (user_id, amount, phone_number, status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            user_id.as_i64(),
            amount,
            phone_number.as_str(),
            DepositStatus::Pending,
            OffsetDateTime::now_utc(),
        ],
    )?;

    get_deposit(connection.last_insert_rowid(), connection)
}

/// Get a deposit by its ID.
///
/// # Errors
/// Returns [Error::NotFound] if there is no deposit with `id`.
pub fn get_deposit(id: DepositId, connection: &Connection) -> Result<DepositTransaction, Error> {
    connection
        .query_row(
            &format!("SELECT {DEPOSIT_COLUMNS} FROM mpesa_deposit WHERE id = :id"),
            &[(":id", &id)],
            map_deposit_row,
        )
        .map_err(Error::from)
}

/// Get the deposit the gateway identifies by `checkout_request_id`.
///
/// # Errors
/// Returns an [Error::SqlError] if the query fails.
pub fn get_deposit_by_checkout_request_id(
    checkout_request_id: &str,
    connection: &Connection,
) -> Result<Option<DepositTransaction>, Error> {
    connection
        .query_row(
            &format!(
                "SELECT {DEPOSIT_COLUMNS} FROM mpesa_deposit
                WHERE checkout_request_id = :checkout_request_id"
            ),
            &[(":checkout_request_id", &checkout_request_id)],
            map_deposit_row,
        )
        .optional()
        .map_err(Error::from)
}

/// Fill in the correlation IDs and messages from the gateway's acknowledgement.
///
/// Deposits that are no longer pending are left unchanged.
///
/// # Errors
/// Returns an [Error::SqlError] if the update fails, e.g. because the gateway
/// reused a checkout request ID.
pub fn record_deposit_acknowledgement(
    id: DepositId,
    acknowledgement: &DepositAcknowledgement,
    connection: &Connection,
) -> Result<DepositTransaction, Error> {
    connection.execute(
        "UPDATE mpesa_deposit
        SET merchant_request_id = ?1, checkout_request_id = ?2, response_code = ?3,
            response_description = ?4, customer_message = ?5
        WHERE id = ?6 AND status = ?7",
        rusqlite::params![
            acknowledgement.merchant_request_id,
            acknowledgement.checkout_request_id,
            acknowledgement.response_code,
            acknowledgement.response_description,
            acknowledgement.customer_message,
            id,
            DepositStatus::Pending,
        ],
    )?;

    get_deposit(id, connection)
}

/// Mark a pending deposit as failed because the gateway rejected it.
///
/// # Errors
/// Returns an [Error::SqlError] if the update fails.
pub fn mark_deposit_rejected(
    id: DepositId,
    response_code: Option<&str>,
    description: &str,
    connection: &Connection,
) -> Result<(), Error> {
    connection.execute(
        "UPDATE mpesa_deposit
        SET status = ?1, response_code = ?2, response_description = ?3
        WHERE id = ?4 AND status = ?5",
        rusqlite::params![
            DepositStatus::Failed,
            response_code,
            description,
            id,
            DepositStatus::Pending,
        ],
    )?;

    Ok(())
}

/// Delete a deposit that never reached the gateway.
///
/// # Errors
/// Returns an [Error::SqlError] if the delete fails.
pub fn delete_deposit(id: DepositId, connection: &Connection) -> Result<(), Error> {
    connection.execute("DELETE FROM mpesa_deposit WHERE id = ?1", [id])?;

    Ok(())
}

/// Complete a pending deposit.
///
/// Returns whether the deposit was pending and has been updated. `phone_number`
/// replaces the stored number when the gateway reports the paying phone.
///
/// # Errors
/// Returns an [Error::SqlError] if the update fails.
pub fn complete_deposit(
    id: DepositId,
    receipt_number: Option<&str>,
    phone_number: Option<&str>,
    description: Option<&str>,
    completed_at: OffsetDateTime,
    connection: &Connection,
) -> Result<bool, Error> {
    let rows_changed = connection.execute(
        "UPDATE mpesa_deposit
        SET status = ?1, mpesa_receipt_number = ?2, phone_number = COALESCE(?3, phone_number),
            response_description = COALESCE(?4, response_description), completed_at = ?5
        WHERE id = ?6 AND status = ?7",
        rusqlite::params![
            DepositStatus::Completed,
            receipt_number,
            phone_number,
            description,
            completed_at,
            id,
            DepositStatus::Pending,
        ],
    )?;

    Ok(rows_changed == 1)
}

/// Move a pending deposit to a terminal status other than completed.
///
/// Returns whether the deposit was pending and has been updated.
///
/// # Errors
/// Returns an [Error::SqlError] if the update fails.
pub fn fail_deposit(
    id: DepositId,
    status: DepositStatus,
    description: Option<&str>,
    connection: &Connection,
) -> Result<bool, Error> {
    debug_assert!(
        matches!(status, DepositStatus::Failed | DepositStatus::Cancelled),
        "fail_deposit called with {status}"
    );

    let rows_changed = connection.execute(
        "UPDATE mpesa_deposit
        SET status = ?1, response_description = COALESCE(?2, response_description)
        WHERE id = ?3 AND status = ?4",
        rusqlite::params![status, description, id, DepositStatus::Pending],
    )?;

    Ok(rows_changed == 1)
}

/// Get all of a user's deposits, newest first.
///
/// # Errors
/// Returns an [Error::SqlError] if the query fails.
pub fn get_user_deposits(
    user_id: UserID,
    connection: &Connection,
) -> Result<Vec<DepositTransaction>, Error> {
    connection
        .prepare(&format!(
            "SELECT {DEPOSIT_COLUMNS} FROM mpesa_deposit
            WHERE user_id = :user_id ORDER BY created_at DESC, id DESC"
        ))?
        .query_map(&[(":user_id", &user_id.as_i64())], map_deposit_row)?
        .map(|deposit| deposit.map_err(Error::from))
        .collect()
}

/// Get a user's pending deposits that the gateway has acknowledged.
///
/// # Errors
/// Returns an [Error::SqlError] if the query fails.
pub fn get_pending_deposits(
    user_id: UserID,
    connection: &Connection,
) -> Result<Vec<DepositTransaction>, Error> {
    connection
        .prepare(&format!(
            "SELECT {DEPOSIT_COLUMNS} FROM mpesa_deposit
            WHERE user_id = :user_id AND status = 'pending'
                AND checkout_request_id IS NOT NULL
            ORDER BY created_at ASC, id ASC"
        ))?
        .query_map(&[(":user_id", &user_id.as_i64())], map_deposit_row)?
        .map(|deposit| deposit.map_err(Error::from))
        .collect()
}

/// Get the sum of a user's completed deposits.
///
/// # Errors
/// Returns an [Error::SqlError] if the query fails.
pub fn get_total_completed_deposits(
    user_id: UserID,
    connection: &Connection,
) -> Result<f64, Error> {
    connection
        .query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM mpesa_deposit
            WHERE user_id = :user_id AND status = 'completed'",
            &[(":user_id", &user_id.as_i64())],
            |row| row.get(0),
        )
        .map_err(Error::from)
}

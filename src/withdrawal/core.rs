//! Defines the withdrawal ledger: the model, its table and the queries on it.

use std::{fmt::Display, str::FromStr};

use rusqlite::{
    Connection, OptionalExtension, Row, ToSql,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    Error, PhoneNumber, UserID, database_id::WithdrawalId, gateway::WithdrawalAcknowledgement,
};

// ============================================================================
// MODELS
// ============================================================================

/// Where a withdrawal is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    /// Recorded, waiting for the gateway to accept the request.
    Pending,
    /// Accepted by the gateway, waiting for the result.
    Processing,
    /// The money was paid out.
    Completed,
    /// The gateway declined or timed out the payment.
    Failed,
    /// The payment was called off.
    Cancelled,
}

impl WithdrawalStatus {
    /// The status as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Failed => "failed",
            WithdrawalStatus::Cancelled => "cancelled",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            WithdrawalStatus::Pending | WithdrawalStatus::Processing
        )
    }
}

impl Display for WithdrawalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WithdrawalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WithdrawalStatus::Pending),
            "processing" => Ok(WithdrawalStatus::Processing),
            "completed" => Ok(WithdrawalStatus::Completed),
            "failed" => Ok(WithdrawalStatus::Failed),
            "cancelled" => Ok(WithdrawalStatus::Cancelled),
            other => Err(format!("unknown withdrawal status \"{other}\"")),
        }
    }
}

impl ToSql for WithdrawalStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for WithdrawalStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error: String| FromSqlError::Other(error.into()))
    }
}

/// An attempt to pay money out of the user's savings to a phone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WithdrawalTransaction {
    /// The ID of the withdrawal.
    pub id: WithdrawalId,
    /// The user that owns the withdrawal.
    pub user_id: UserID,
    /// The amount in whole shillings.
    pub amount: f64,
    /// The phone receiving the money, in the `254XXXXXXXXX` form.
    pub phone_number: String,
    /// The gateway's correlation ID, unique per withdrawal.
    pub conversation_id: Option<String>,
    /// The gateway's secondary correlation ID.
    pub originator_conversation_id: Option<String>,
    /// Where the withdrawal is in its lifecycle.
    pub status: WithdrawalStatus,
    /// The gateway's response code.
    pub response_code: Option<String>,
    /// The gateway's description of the latest response or result.
    pub response_description: Option<String>,
    /// The gateway's transaction ID, set on completion.
    pub transaction_id: Option<String>,
    /// The gateway's receipt number, set on completion.
    pub mpesa_receipt_number: Option<String>,
    /// When the withdrawal was initiated.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// When the withdrawal completed, set if and only if it completed.
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

// ============================================================================
// DATABASE FUNCTIONS
// ============================================================================

/// Create the withdrawal table.
///
/// # Errors
/// Returns an error if the SQL query fails.
pub fn create_withdrawal_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute_batch(
        "CREATE TABLE IF NOT EXISTS mpesa_withdrawal (
            id INTEGER PRIMARY KEY,
            user_id INTEGER NOT NULL,
            amount REAL NOT NULL CHECK (amount > 0),
            phone_number TEXT NOT NULL,
            conversation_id TEXT UNIQUE,
            originator_conversation_id TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'cancelled')),
            response_code TEXT,
            response_description TEXT,
            transaction_id TEXT,
            mpesa_receipt_number TEXT,
            created_at TEXT NOT NULL,
            completed_at TEXT,
            CHECK ((status = 'completed') = (completed_at IS NOT NULL)),
            FOREIGN KEY(user_id) REFERENCES user(id) ON UPDATE CASCADE ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_mpesa_withdrawal_user_status
            ON mpesa_withdrawal(user_id, status);",
    )?;

    Ok(())
}

const WITHDRAWAL_COLUMNS: &str = "id, user_id, amount, phone_number, conversation_id, \
    originator_conversation_id, status, response_code, response_description, transaction_id, \
    mpesa_receipt_number, created_at, completed_at";

/// Map a row selected with all withdrawal columns to a [WithdrawalTransaction].
pub fn map_withdrawal_row(row: &Row) -> Result<WithdrawalTransaction, rusqlite::Error> {
    Ok(WithdrawalTransaction {
        id: row.get(0)?,
        user_id: UserID::new(row.get(1)?),
        amount: row.get(2)?,
        phone_number: row.get(3)?,
        conversation_id: row.get(4)?,
        originator_conversation_id: row.get(5)?,
        status: row.get(6)?,
        response_code: row.get(7)?,
        response_description: row.get(8)?,
        transaction_id: row.get(9)?,
        mpesa_receipt_number: row.get(10)?,
        created_at: row.get(11)?,
        completed_at: row.get(12)?,
    })
}

/// Record a new pending withdrawal with no correlation IDs.
///
/// # Errors
/// Returns an [Error::SqlError] if the insert fails.
pub fn create_pending_withdrawal(
    user_id: UserID,
    amount: f64,
    phone_number: &PhoneNumber,
    connection: &Connection,
) -> Result<WithdrawalTransaction, Error> {
    connection.execute(
        "INSERT INTO mpesa_withdrawal (user_id, amount, phone_number, status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            user_id.as_i64(),
            amount,
            phone_number.as_str(),
            WithdrawalStatus::Pending,
            OffsetDateTime::now_utc(),
        ],
    )?;

    get_withdrawal(connection.last_insert_rowid(), connection)
}

/// Get a withdrawal by its ID.
///
/// # Errors
/// Returns [Error::NotFound] if there is no withdrawal with `id`.
pub fn get_withdrawal(
    id: WithdrawalId,
    connection: &Connection,
) -> Result<WithdrawalTransaction, Error> {
    connection
        .query_row(
            &format!("SELECT {WITHDRAWAL_COLUMNS} FROM mpesa_withdrawal WHERE id = :id"),
            &[(":id", &id)],
            map_withdrawal_row,
        )
        .map_err(Error::from)
}

/// Get the withdrawal the gateway identifies by `conversation_id`.
///
/// # Errors
/// Returns an [Error::SqlError] if the query fails.
pub fn get_withdrawal_by_conversation_id(
    conversation_id: &str,
    connection: &Connection,
) -> Result<Option<WithdrawalTransaction>, Error> {
    connection
        .query_row(
            &format!(
                "SELECT {WITHDRAWAL_COLUMNS} FROM mpesa_withdrawal
                WHERE conversation_id = :conversation_id"
            ),
            &[(":conversation_id", &conversation_id)],
            map_withdrawal_row,
        )
        .optional()
        .map_err(Error::from)
}

/// Fill in the correlation IDs from the gateway's acknowledgement and move the
/// withdrawal to processing.
///
/// # Errors
/// Returns an [Error::SqlError] if the update fails, e.g. because the gateway
/// reused a conversation ID.
pub fn record_withdrawal_acknowledgement(
    id: WithdrawalId,
    acknowledgement: &WithdrawalAcknowledgement,
    connection: &Connection,
) -> Result<WithdrawalTransaction, Error> {
    connection.execute(
        "UPDATE mpesa_withdrawal
        SET conversation_id = ?1, originator_conversation_id = ?2, response_code = ?3,
            response_description = ?4, status = ?5
        WHERE id = ?6 AND status = ?7",
        rusqlite::params![
            acknowledgement.conversation_id,
            acknowledgement.originator_conversation_id,
            acknowledgement.response_code,
            acknowledgement.response_description,
            WithdrawalStatus::Processing,
            id,
            WithdrawalStatus::Pending,
        ],
    )?;

    get_withdrawal(id, connection)
}

/// Mark a pending withdrawal as failed because the gateway rejected it.
///
/// # Errors
/// Returns an [Error::SqlError] if the update fails.
pub fn mark_withdrawal_rejected(
    id: WithdrawalId,
    response_code: Option<&str>,
    description: &str,
    connection: &Connection,
) -> Result<(), Error> {
    connection.execute(
        "UPDATE mpesa_withdrawal
        SET status = ?1, response_code = ?2, response_description = ?3
        WHERE id = ?4 AND status = ?5",
        rusqlite::params![
            WithdrawalStatus::Failed,
            response_code,
            description,
            id,
            WithdrawalStatus::Pending,
        ],
    )?;

    Ok(())
}

/// Delete a withdrawal that never reached the gateway.
///
/// # Errors
/// Returns an [Error::SqlError] if the delete fails.
pub fn delete_withdrawal(id: WithdrawalId, connection: &Connection) -> Result<(), Error> {
    connection.execute("DELETE FROM mpesa_withdrawal WHERE id = ?1", [id])?;

    Ok(())
}

/// Complete a withdrawal that is pending or processing.
///
/// Returns whether the withdrawal was not yet terminal and has been updated.
///
/// # Errors
/// Returns an [Error::SqlError] if the update fails.
pub fn complete_withdrawal(
    id: WithdrawalId,
    transaction_id: Option<&str>,
    receipt_number: Option<&str>,
    description: Option<&str>,
    completed_at: OffsetDateTime,
    connection: &Connection,
) -> Result<bool, Error> {
    let rows_changed = connection.execute(
        "UPDATE mpesa_withdrawal
        SET status = ?1, transaction_id = ?2, mpesa_receipt_number = ?3,
            response_description = COALESCE(?4, response_description), completed_at = ?5
        WHERE id = ?6 AND status IN ('pending', 'processing')",
        rusqlite::params![
            WithdrawalStatus::Completed,
            transaction_id,
            receipt_number,
            description,
            completed_at,
            id,
        ],
    )?;

    Ok(rows_changed == 1)
}

/// Move a withdrawal that is pending or processing to a terminal status other
/// than completed.
///
/// Returns whether the withdrawal was not yet terminal and has been updated.
///
/// # Errors
/// Returns an [Error::SqlError] if the update fails.
pub fn fail_withdrawal(
    id: WithdrawalId,
    status: WithdrawalStatus,
    description: Option<&str>,
    connection: &Connection,
) -> Result<bool, Error> {
    debug_assert!(
        matches!(
            status,
            WithdrawalStatus::Failed | WithdrawalStatus::Cancelled
        ),
        "fail_withdrawal called with {status}"
    );

    let rows_changed = connection.execute(
        "UPDATE mpesa_withdrawal
        SET status = ?1, response_description = COALESCE(?2, response_description)
        WHERE id = ?3 AND status IN ('pending', 'processing')",
        rusqlite::params![status, description, id],
    )?;

    Ok(rows_changed == 1)
}

/// Get all of a user's withdrawals, newest first.
///
/// # Errors
/// Returns an [Error::SqlError] if the query fails.
pub fn get_user_withdrawals(
    user_id: UserID,
    connection: &Connection,
) -> Result<Vec<WithdrawalTransaction>, Error> {
    connection
        .prepare(&format!(
            "SELECT {WITHDRAWAL_COLUMNS} FROM mpesa_withdrawal
            WHERE user_id = :user_id ORDER BY created_at DESC, id DESC"
        ))?
        .query_map(&[(":user_id", &user_id.as_i64())], map_withdrawal_row)?
        .map(|withdrawal| withdrawal.map_err(Error::from))
        .collect()
}

/// Get a user's unresolved withdrawals that the gateway has acknowledged.
///
/// # Errors
/// Returns an [Error::SqlError] if the query fails.
pub fn get_pending_withdrawals(
    user_id: UserID,
    connection: &Connection,
) -> Result<Vec<WithdrawalTransaction>, Error> {
    connection
        .prepare(&format!(
            "SELECT {WITHDRAWAL_COLUMNS} FROM mpesa_withdrawal
            WHERE user_id = :user_id AND status IN ('pending', 'processing')
                AND conversation_id IS NOT NULL
            ORDER BY created_at ASC, id ASC"
        ))?
        .query_map(&[(":user_id", &user_id.as_i64())], map_withdrawal_row)?
        .map(|withdrawal| withdrawal.map_err(Error::from))
        .collect()
}

/// Get the sum of a user's completed withdrawals.
///
/// # Errors
/// Returns an [Error::SqlError] if the query fails.
pub fn get_total_completed_withdrawals(
    user_id: UserID,
    connection: &Connection,
) -> Result<f64, Error> {
    connection
        .query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM mpesa_withdrawal
            WHERE user_id = :user_id AND status = 'completed'",
            &[(":user_id", &user_id.as_i64())],
            |row| row.get(0),
        )
        .map_err(Error::from)
}

/// Count a user's withdrawals that are still pending or processing.
///
/// # Errors
/// Returns an [Error::SqlError] if the query fails.
pub fn count_unresolved_withdrawals(
    user_id: UserID,
    connection: &Connection,
) -> Result<i64, Error> {
    connection
        .query_row(
            "SELECT COUNT(*) FROM mpesa_withdrawal
            WHERE user_id = :user_id AND status IN ('pending', 'processing')",
            &[(":user_id", &user_id.as_i64())],
            |row| row.get(0),
        )
        .map_err(Error::from)
}


#[cfg(test)]
mod withdrawal_query_tests {
    use time::OffsetDateTime;

    use crate::{
        Error, PhoneNumber,
        gateway::WithdrawalAcknowledgement,
        test_utils::{create_test_user, get_test_connection},
        withdrawal::core::{
            WithdrawalStatus, complete_withdrawal, count_unresolved_withdrawals,
            create_pending_withdrawal, delete_withdrawal, fail_withdrawal, get_pending_withdrawals,
            get_total_completed_withdrawals, get_user_withdrawals, get_withdrawal,
            get_withdrawal_by_conversation_id, mark_withdrawal_rejected,
            record_withdrawal_acknowledgement,
        },
    };

    fn acknowledgement(conversation_id: &str) -> WithdrawalAcknowledgement {
        WithdrawalAcknowledgement {
            conversation_id: conversation_id.to_owned(),
            originator_conversation_id: Some(format!("O-{conversation_id}")),
            response_code: "0".to_owned(),
            response_description: Some("Accept the service request successfully.".to_owned()),
        }
    }

    fn phone() -> PhoneNumber {
        PhoneNumber::parse("0712345678").unwrap()
    }

    #[test]
    fn acknowledgement_moves_withdrawal_to_processing() {
        let connection = get_test_connection();
        let user = create_test_user(&connection, "wanjiku");
        let withdrawal = create_pending_withdrawal(user.id, 50.0, &phone(), &connection).unwrap();
        assert_eq!(withdrawal.status, WithdrawalStatus::Pending);
        assert_eq!(withdrawal.conversation_id, None);

        let updated =
            record_withdrawal_acknowledgement(withdrawal.id, &acknowledgement("C1"), &connection)
                .unwrap();

        assert_eq!(updated.status, WithdrawalStatus::Processing);
        assert_eq!(updated.conversation_id.as_deref(), Some("C1"));
        assert_eq!(updated.originator_conversation_id.as_deref(), Some("O-C1"));
        assert_eq!(
            get_withdrawal_by_conversation_id("C1", &connection),
            Ok(Some(updated))
        );
    }

    #[test]
    fn processing_withdrawal_completes_once() {
        let connection = get_test_connection();
        let user = create_test_user(&connection, "wanjiku");
        let withdrawal = create_pending_withdrawal(user.id, 50.0, &phone(), &connection).unwrap();
        record_withdrawal_acknowledgement(withdrawal.id, &acknowledgement("C1"), &connection)
            .unwrap();

        let first = complete_withdrawal(
            withdrawal.id,
            Some("T1"),
            Some("T1"),
            None,
            OffsetDateTime::now_utc(),
            &connection,
        )
        .unwrap();
        let second = fail_withdrawal(
            withdrawal.id,
            WithdrawalStatus::Failed,
            Some("Transaction timed out"),
            &connection,
        )
        .unwrap();

        assert!(first);
        assert!(!second);
        let got = get_withdrawal(withdrawal.id, &connection).unwrap();
        assert_eq!(got.status, WithdrawalStatus::Completed);
        assert_eq!(got.transaction_id.as_deref(), Some("T1"));
        assert!(got.completed_at.is_some());
    }

    #[test]
    fn failed_withdrawal_stays_failed() {
        let connection = get_test_connection();
        let user = create_test_user(&connection, "wanjiku");
        let withdrawal = create_pending_withdrawal(user.id, 50.0, &phone(), &connection).unwrap();

        assert!(fail_withdrawal(withdrawal.id, WithdrawalStatus::Failed, None, &connection).unwrap());
        assert!(
            !complete_withdrawal(
                withdrawal.id,
                None,
                None,
                None,
                OffsetDateTime::now_utc(),
                &connection
            )
            .unwrap()
        );

        let got = get_withdrawal(withdrawal.id, &connection).unwrap();
        assert_eq!(got.status, WithdrawalStatus::Failed);
        assert_eq!(got.completed_at, None);
    }

    #[test]
    fn rejected_and_deleted_withdrawals() {
        let connection = get_test_connection();
        let user = create_test_user(&connection, "wanjiku");
        let rejected = create_pending_withdrawal(user.id, 50.0, &phone(), &connection).unwrap();
        let abandoned = create_pending_withdrawal(user.id, 50.0, &phone(), &connection).unwrap();

        mark_withdrawal_rejected(rejected.id, Some("401.002.01"), "Invalid Initiator", &connection)
            .unwrap();
        delete_withdrawal(abandoned.id, &connection).unwrap();

        assert_eq!(
            get_withdrawal(rejected.id, &connection).unwrap().status,
            WithdrawalStatus::Failed
        );
        assert_eq!(get_withdrawal(abandoned.id, &connection), Err(Error::NotFound));
    }

    #[test]
    fn pending_and_totals() {
        let connection = get_test_connection();
        let user = create_test_user(&connection, "wanjiku");
        let processing = create_pending_withdrawal(user.id, 50.0, &phone(), &connection).unwrap();
        let completed = create_pending_withdrawal(user.id, 20.0, &phone(), &connection).unwrap();
        create_pending_withdrawal(user.id, 10.0, &phone(), &connection).unwrap();
        record_withdrawal_acknowledgement(processing.id, &acknowledgement("C1"), &connection)
            .unwrap();
        complete_withdrawal(
            completed.id,
            None,
            None,
            None,
            OffsetDateTime::now_utc(),
            &connection,
        )
        .unwrap();

        let pending = get_pending_withdrawals(user.id, &connection).unwrap();

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, processing.id);
        assert_eq!(get_total_completed_withdrawals(user.id, &connection), Ok(20.0));
        assert_eq!(count_unresolved_withdrawals(user.id, &connection), Ok(2));
        assert_eq!(get_user_withdrawals(user.id, &connection).unwrap().len(), 3);
    }
}

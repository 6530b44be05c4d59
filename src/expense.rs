//! A minimal expense ledger, used to work out how much savings can be withdrawn.

use rusqlite::{Connection, Row};
use serde::Serialize;
use time::Date;

use crate::{Error, UserID, database_id::ExpenseId};

/// Money a user has spent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Expense {
    /// The ID of the expense.
    pub id: ExpenseId,
    /// The user that spent the money.
    pub user_id: UserID,
    /// The amount spent.
    pub amount: f64,
    /// What the money was spent on.
    pub description: String,
    /// When the money was spent.
    pub date: Date,
}

/// Create the expense table.
///
/// # Errors
/// Returns an error if the SQL query fails.
pub fn create_expense_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS expense (
            id INTEGER PRIMARY KEY,
            user_id INTEGER NOT NULL,
            amount REAL NOT NULL CHECK (amount >= 0),
            description TEXT NOT NULL,
            date TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES user(id) ON UPDATE CASCADE ON DELETE CASCADE
        )",
        (),
    )?;

    Ok(())
}

fn map_expense_row(row: &Row) -> Result<Expense, rusqlite::Error> {
    Ok(Expense {
        id: row.get(0)?,
        user_id: UserID::new(row.get(1)?),
        amount: row.get(2)?,
        description: row.get(3)?,
        date: row.get(4)?,
    })
}

/// Record an expense for `user_id`.
///
/// # Errors
/// Returns an [Error::SqlError] if the insert fails, e.g. because `amount` is
/// negative or the user does not exist.
pub fn create_expense(
    user_id: UserID,
    amount: f64,
    description: &str,
    date: Date,
    connection: &Connection,
) -> Result<Expense, Error> {
    connection.execute(
        "INSERT INTO expense (user_id, amount, description, date) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![user_id.as_i64(), amount, description, date],
    )?;

    connection
        .query_row(
            "SELECT id, user_id, amount, description, date FROM expense WHERE id = :id",
            &[(":id", &connection.last_insert_rowid())],
            map_expense_row,
        )
        .map_err(Error::from)
}

/// Get the sum of a user's expenses.
///
/// # Errors
/// Returns an [Error::SqlError] if the query fails.
pub fn get_total_expenses(user_id: UserID, connection: &Connection) -> Result<f64, Error> {
    connection
        .query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM expense WHERE user_id = :user_id",
            &[(":user_id", &user_id.as_i64())],
            |row| row.get(0),
        )
        .map_err(Error::from)
}

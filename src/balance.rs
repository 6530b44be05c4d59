//! Derives how much of a user's savings can be withdrawn.

use std::sync::{Arc, Mutex};

use axum::{
    Extension, Json,
    extract::{FromRef, State},
};
use rusqlite::Connection;
use serde::Serialize;

use crate::{
    AppState, Error, UserID,
    db::lock_connection,
    deposit::get_total_completed_deposits,
    expense::get_total_expenses,
    withdrawal::{count_unresolved_withdrawals, get_total_completed_withdrawals},
};

/// Get the amount `user_id` may withdraw: completed deposits minus expenses,
/// never less than zero.
///
/// Only completed deposits count, so money still on its way never becomes
/// withdrawable early.
///
/// # Errors
/// Returns an [Error::SqlError] if a query fails.
pub fn available_balance(user_id: UserID, connection: &Connection) -> Result<f64, Error> {
    let total_saved = get_total_completed_deposits(user_id, connection)?;
    let total_expenses = get_total_expenses(user_id, connection)?;

    Ok((total_saved - total_expenses).max(0.0))
}

/// A summary of a user's savings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Balance {
    /// The amount that may be withdrawn.
    pub available_balance: f64,
    /// The sum of completed deposits.
    pub total_saved: f64,
    /// The sum of recorded expenses.
    pub total_expenses: f64,
    /// The sum of completed withdrawals.
    pub total_withdrawn: f64,
    /// The number of withdrawals that have not been resolved yet.
    pub pending_withdrawals: i64,
}

/// Get the savings summary for `user_id`.
///
/// # Errors
/// Returns an [Error::SqlError] if a query fails.
pub fn get_balance(user_id: UserID, connection: &Connection) -> Result<Balance, Error> {
    let total_saved = get_total_completed_deposits(user_id, connection)?;
    let total_expenses = get_total_expenses(user_id, connection)?;

    Ok(Balance {
        available_balance: (total_saved - total_expenses).max(0.0),
        total_saved,
        total_expenses,
        total_withdrawn: get_total_completed_withdrawals(user_id, connection)?,
        pending_withdrawals: count_unresolved_withdrawals(user_id, connection)?,
    })
}

/// The state needed to get the balance.
#[derive(Debug, Clone)]
pub struct BalanceState {
    /// The database connection for the ledgers.
    pub db_connection: Arc<Mutex<Connection>>,
}

impl FromRef<AppState> for BalanceState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            db_connection: state.db_connection.clone(),
        }
    }
}

/// A route handler for getting the user's savings summary.
pub async fn get_balance_endpoint(
    State(state): State<BalanceState>,
    Extension(user_id): Extension<UserID>,
) -> Result<Json<Balance>, Error> {
    let connection = lock_connection(&state.db_connection)?;

    get_balance(user_id, &connection).map(Json)
}

//! The endpoint for listing a user's deposits.

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
    deposit::core::{DepositTransaction, get_total_completed_deposits, get_user_deposits},
};

/// The state needed to list deposits.
#[derive(Debug, Clone)]
pub struct DepositListState {
    /// The database connection for the ledger.
    pub db_connection: Arc<Mutex<Connection>>,
}

impl FromRef<AppState> for DepositListState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            db_connection: state.db_connection.clone(),
        }
    }
}

/// A user's deposits and how much they have saved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepositList {
    /// The deposits, newest first.
    pub deposits: Vec<DepositTransaction>,
    /// The sum of the completed deposits.
    pub total_saved: f64,
}

/// A route handler for listing the user's deposits.
pub async fn get_deposits_endpoint(
    State(state): State<DepositListState>,
    Extension(user_id): Extension<UserID>,
) -> Result<Json<DepositList>, Error> {
    let connection = lock_connection(&state.db_connection)?;

    let deposits = get_user_deposits(user_id, &connection)
        .inspect_err(|error| tracing::error!("could not get deposits: {error}"))?;
    let total_saved = get_total_completed_deposits(user_id, &connection)?;

    Ok(Json(DepositList {
        deposits,
        total_saved,
    }))
}

//! The endpoint for listing a user's withdrawals.

use std::sync::{Arc, Mutex};

use axum::{
    Extension, Json,
    extract::{FromRef, State},
};
use rusqlite::Connection;
use serde::Serialize;

use crate::{
    AppState, Error, UserID,
    balance::available_balance,
    db::lock_connection,
    withdrawal::core::{
        WithdrawalTransaction, count_unresolved_withdrawals, get_total_completed_withdrawals,
        get_user_withdrawals,
    },
};

/// The state needed to list withdrawals.
#[derive(Debug, Clone)]
pub struct WithdrawalListState {
    /// The database connection for the ledger.
    pub db_connection: Arc<Mutex<Connection>>,
}

impl FromRef<AppState> for WithdrawalListState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            db_connection: state.db_connection.clone(),
        }
    }
}

/// A user's withdrawals with their totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WithdrawalList {
    /// The withdrawals, newest first.
    pub withdrawals: Vec<WithdrawalTransaction>,
    /// The sum of the completed withdrawals.
    pub total_withdrawn: f64,
    /// The number of withdrawals still pending or processing.
    pub pending_count: i64,
    /// The amount that may still be withdrawn.
    pub available_balance: f64,
}

/// A route handler for listing the user's withdrawals.
pub async fn get_withdrawals_endpoint(
    State(state): State<WithdrawalListState>,
    Extension(user_id): Extension<UserID>,
) -> Result<Json<WithdrawalList>, Error> {
    let connection = lock_connection(&state.db_connection)?;

    let withdrawals = get_user_withdrawals(user_id, &connection)
        .inspect_err(|error| tracing::error!("could not get withdrawals: {error}"))?;

    Ok(Json(WithdrawalList {
        withdrawals,
        total_withdrawn: get_total_completed_withdrawals(user_id, &connection)?,
        pending_count: count_unresolved_withdrawals(user_id, &connection)?,
        available_balance: available_balance(user_id, &connection)?,
    }))
}

#[cfg(test)]
mod get_withdrawals_endpoint_tests {
    use serde_json::Value;

    use crate::{
        PhoneNumber, endpoints, test_utils::get_test_app,
        withdrawal::core::create_pending_withdrawal,
    };

    #[tokio::test]
    async fn lists_withdrawals_with_totals() {
        let app = get_test_app();
        {
            let connection = app.connection();
            let phone = PhoneNumber::parse("0712345678").unwrap();
            create_pending_withdrawal(app.user.id, 50.0, &phone, &connection).unwrap();
        }

        let response = app.get(endpoints::WITHDRAWALS).await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["withdrawals"].as_array().unwrap().len(), 1);
        assert_eq!(body["withdrawals"][0]["status"], "pending");
        assert_eq!(body["total_withdrawn"], 0.0);
        assert_eq!(body["pending_count"], 1);
    }
}

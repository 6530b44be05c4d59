//! Asking the gateway about payments that have not been resolved yet.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Extension, Json,
    extract::{FromRef, State},
};
use rusqlite::Connection;
use serde::Serialize;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{
    AppState, Error, UserID,
    credentials::require_credentials,
    db::lock_connection,
    deposit::get_pending_deposits,
    gateway::{Gateway, StatusQueryOutcome},
    reconcile::{Applied, LedgerEntry, Resolution, apply_result},
    withdrawal::get_pending_withdrawals,
};

/// The outcome of a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    /// The number of entries the gateway was asked about.
    pub checked: usize,
    /// The number of entries moved to a terminal state.
    pub updated: usize,
    /// The number of entries the gateway has not resolved yet.
    pub still_pending: usize,
    /// The number of status queries that failed.
    pub errors: usize,
}

impl ReconcileSummary {
    fn add(&mut self, other: ReconcileSummary) {
        self.checked += other.checked;
        self.updated += other.updated;
        self.still_pending += other.still_pending;
        self.errors += other.errors;
    }

    fn record(&mut self, entry: LedgerEntry, outcome: Result<Applied, Error>) {
        match outcome {
            Ok(Applied::Updated) => self.updated += 1,
            Ok(Applied::AlreadyTerminal) => {}
            Err(error) => {
                tracing::error!("Could not apply the status of {entry:?}: {error}");
                self.errors += 1;
            }
        }
    }
}

/// Apply the answer to a status query for `entry`.
///
/// The lock is only taken after the gateway has answered.
fn settle(
    entry: LedgerEntry,
    outcome: StatusQueryOutcome,
    db_connection: &Mutex<Connection>,
    summary: &mut ReconcileSummary,
) {
    match outcome {
        StatusQueryOutcome::Pending { description } => {
            tracing::debug!("{entry:?} is still pending: {description:?}");
            summary.still_pending += 1;
        }
        StatusQueryOutcome::Resolved(result) => {
            let resolution = Resolution::from_result(&result);
            let applied = lock_connection(db_connection)
                .and_then(|connection| apply_result(entry, &resolution, &connection));
            summary.record(entry, applied);
        }
    }
}

/// Query the gateway for each of `owner`'s unresolved payments and apply the
/// results.
///
/// Only entries the gateway has acknowledged are queried. The ledger is not
/// locked while a query is in flight, so a callback may resolve an entry in
/// the meantime. In that case the callback wins and the poll result is
/// dropped. A failed query is counted and the remaining entries are still
/// checked.
///
/// # Errors
/// Returns an error if the owner's credentials are missing, inactive or
/// incomplete, or if the pending entries cannot be read.
pub async fn reconcile_pending(
    owner: UserID,
    db_connection: &Mutex<Connection>,
    gateway: &dyn Gateway,
) -> Result<ReconcileSummary, Error> {
    let (credentials, deposits, withdrawals) = {
        let connection = lock_connection(db_connection)?;
        let credentials = require_credentials(owner, &connection)?;

        if !credentials.is_active {
            return Err(Error::CredentialsInactive);
        }
        credentials.ensure_can_authenticate()?;

        (
            credentials,
            get_pending_deposits(owner, &connection)?,
            get_pending_withdrawals(owner, &connection)?,
        )
    };

    let mut summary = ReconcileSummary::default();

    for deposit in deposits {
        let Some(checkout_request_id) = deposit.checkout_request_id else {
            continue;
        };
        let entry = LedgerEntry::Deposit(deposit.id);
        summary.checked += 1;

        match gateway
            .query_deposit_status(&credentials, &checkout_request_id)
            .await
        {
            Ok(outcome) => settle(entry, outcome, db_connection, &mut summary),
            Err(error) => {
                tracing::warn!("Could not query the status of {entry:?}: {error}");
                summary.errors += 1;
            }
        }
    }

    for withdrawal in withdrawals {
        let Some(conversation_id) = withdrawal.conversation_id else {
            continue;
        };
        let entry = LedgerEntry::Withdrawal(withdrawal.id);
        summary.checked += 1;

        match gateway
            .query_withdrawal_status(&credentials, &conversation_id)
            .await
        {
            Ok(outcome) => settle(entry, outcome, db_connection, &mut summary),
            Err(error) => {
                tracing::warn!("Could not query the status of {entry:?}: {error}");
                summary.errors += 1;
            }
        }
    }

    tracing::info!("Reconciled pending payments for user {owner}: {summary:?}");

    Ok(summary)
}

/// Get the users that have payments the gateway has acknowledged but not
/// resolved.
fn get_owners_with_pending_payments(connection: &Connection) -> Result<Vec<UserID>, Error> {
    connection
        .prepare(
            "SELECT user_id FROM mpesa_deposit
            WHERE status = 'pending' AND checkout_request_id IS NOT NULL
            UNION
            SELECT user_id FROM mpesa_withdrawal
            WHERE status IN ('pending', 'processing') AND conversation_id IS NOT NULL
            ORDER BY user_id",
        )?
        .query_map([], |row| row.get(0).map(UserID::new))?
        .map(|user_id| user_id.map_err(Error::from))
        .collect()
}

/// Run [reconcile_pending] for every user with unresolved payments.
///
/// Users whose credentials cannot be used are skipped with a warning.
///
/// # Errors
/// Returns an error if the users cannot be read.
pub async fn reconcile_all_pending(
    db_connection: &Mutex<Connection>,
    gateway: &dyn Gateway,
) -> Result<ReconcileSummary, Error> {
    let owners = {
        let connection = lock_connection(db_connection)?;
        get_owners_with_pending_payments(&connection)?
    };

    let mut summary = ReconcileSummary::default();

    for owner in owners {
        match reconcile_pending(owner, db_connection, gateway).await {
            Ok(owner_summary) => summary.add(owner_summary),
            Err(error) => {
                tracing::warn!("Skipping reconciliation for user {owner}: {error}");
            }
        }
    }

    Ok(summary)
}

/// Start a task that runs [reconcile_all_pending] every `period`.
///
/// The first pass runs straight away.
///
/// # Panics
/// The task panics if `period` is zero.
pub fn spawn_periodic_reconciliation(
    db_connection: Arc<Mutex<Connection>>,
    gateway: Arc<dyn Gateway>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            match reconcile_all_pending(&db_connection, gateway.as_ref()).await {
                Ok(summary) if summary.checked > 0 => {
                    tracing::info!("Periodic reconciliation finished: {summary:?}");
                }
                Ok(_) => {}
                Err(error) => tracing::error!("Periodic reconciliation failed: {error}"),
            }
        }
    })
}

/// The state needed to reconcile a user's pending payments.
#[derive(Clone)]
pub struct CheckPendingState {
    /// The database connection for the ledger.
    pub db_connection: Arc<Mutex<Connection>>,
    /// The gateway to query.
    pub gateway: Arc<dyn Gateway>,
}

impl FromRef<AppState> for CheckPendingState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            db_connection: state.db_connection.clone(),
            gateway: state.gateway.clone(),
        }
    }
}

/// The response to a request to check pending payments.
#[derive(Debug, Serialize)]
pub struct CheckPendingResponse {
    /// What the reconciliation pass did.
    #[serde(flatten)]
    pub summary: ReconcileSummary,
    /// A message for the user.
    pub message: String,
}

/// A route handler that polls the gateway for the user's pending payments.
pub async fn check_pending_endpoint(
    State(state): State<CheckPendingState>,
    Extension(user_id): Extension<UserID>,
) -> Result<Json<CheckPendingResponse>, Error> {
    let summary =
        reconcile_pending(user_id, &state.db_connection, state.gateway.as_ref()).await?;

    let message = if summary.updated > 0 {
        format!(
            "Updated status for {} pending transaction(s).",
            summary.updated
        )
    } else {
        "No pending transactions found or no updates available.".to_owned()
    };

    Ok(Json(CheckPendingResponse { summary, message }))
}


#[cfg(test)]
mod check_pending_endpoint_tests {
    use serde_json::Value;

    use crate::{endpoints, test_utils::get_test_app};

    #[tokio::test]
    async fn reports_nothing_to_update() {
        let app = get_test_app();
        app.insert_credentials();

        let response = app.post(endpoints::CHECK_PENDING).await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["checked"], 0);
        assert_eq!(body["updated"], 0);
        assert_eq!(
            body["message"],
            "No pending transactions found or no updates available."
        );
    }

    #[tokio::test]
    async fn requires_credentials() {
        let app = get_test_app();

        let response = app.post(endpoints::CHECK_PENDING).await;

        response.assert_status_bad_request();
    }
}

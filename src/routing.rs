//! Application router configuration with protected and unprotected route definitions.

use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::{
    AppState,
    auth::auth_guard,
    balance::get_balance_endpoint,
    credentials::{get_settings_endpoint, test_connection_endpoint, update_settings_endpoint},
    deposit::{get_deposits_endpoint, initiate_deposit_endpoint},
    endpoints,
    reconcile::{
        check_pending_endpoint, deposit_callback_endpoint, withdrawal_result_endpoint,
        withdrawal_timeout_endpoint,
    },
    withdrawal::{get_withdrawals_endpoint, initiate_withdrawal_endpoint},
};

/// Return a router with all the app's routes.
///
/// The gateway's callback routes are unprotected, everything else needs an
/// auth cookie.
pub fn build_router(state: AppState) -> Router {
    let unprotected_routes = Router::new()
        .route(endpoints::MPESA_CALLBACK, post(deposit_callback_endpoint))
        .route(endpoints::B2C_RESULT, post(withdrawal_result_endpoint))
        .route(endpoints::B2C_CALLBACK, post(withdrawal_result_endpoint))
        .route(endpoints::B2C_TIMEOUT, post(withdrawal_timeout_endpoint));

    let protected_routes = Router::new()
        .route(
            endpoints::DEPOSITS,
            get(get_deposits_endpoint).post(initiate_deposit_endpoint),
        )
        .route(
            endpoints::WITHDRAWALS,
            get(get_withdrawals_endpoint).post(initiate_withdrawal_endpoint),
        )
        .route(endpoints::CHECK_PENDING, post(check_pending_endpoint))
        .route(endpoints::BALANCE, get(get_balance_endpoint))
        .route(
            endpoints::SETTINGS,
            get(get_settings_endpoint).put(update_settings_endpoint),
        )
        .route(endpoints::TEST_CONNECTION, post(test_connection_endpoint))
        .layer(middleware::from_fn_with_state(state.clone(), auth_guard));

    protected_routes
        .merge(unprotected_routes)
        .with_state(state)
}

//! The API endpoints URIs.

/// The route the gateway posts STK push (deposit) results to.
pub const MPESA_CALLBACK: &str = "/api/mpesa/callback";
/// The route the gateway posts B2C (withdrawal) results to.
pub const B2C_RESULT: &str = "/api/mpesa/b2c-result";
/// An alternative route for B2C results, kept for gateways configured with it.
pub const B2C_CALLBACK: &str = "/api/mpesa/b2c-callback";
/// The route the gateway posts B2C queue timeouts to.
pub const B2C_TIMEOUT: &str = "/api/mpesa/b2c-timeout";

/// The route to list and initiate deposits.
pub const DEPOSITS: &str = "/api/mpesa/deposits";
/// The route to list and initiate withdrawals.
pub const WITHDRAWALS: &str = "/api/mpesa/withdrawals";
/// The route to poll the gateway for the user's pending payments.
pub const CHECK_PENDING: &str = "/api/mpesa/check-pending";
/// The route to get the user's withdrawable balance.
pub const BALANCE: &str = "/api/mpesa/balance";
/// The route to get and save the user's gateway credentials.
pub const SETTINGS: &str = "/api/mpesa/settings";
/// The route to check the user's gateway credentials against the gateway.
pub const TEST_CONNECTION: &str = "/api/mpesa/settings/test";

//! Database ID type definitions.

/// Alias for the integer type used for mapping to database IDs.
pub type DatabaseId = i64;
/// The ID of a deposit in the deposit ledger.
pub type DepositId = DatabaseId;
/// The ID of a withdrawal in the withdrawal ledger.
pub type WithdrawalId = DatabaseId;
/// The ID of a recorded expense.
pub type ExpenseId = DatabaseId;

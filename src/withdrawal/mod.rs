//! The withdrawal ledger, and admitting, initiating and listing withdrawals.

mod admission;
mod core;
mod initiate;
mod list;

pub use admission::{AdmittedWithdrawal, admit_withdrawal};
pub use core::{
    WithdrawalStatus, WithdrawalTransaction, complete_withdrawal, count_unresolved_withdrawals,
    create_pending_withdrawal, create_withdrawal_table, fail_withdrawal, get_pending_withdrawals,
    get_total_completed_withdrawals, get_withdrawal, get_withdrawal_by_conversation_id,
    record_withdrawal_acknowledgement,
};
pub use initiate::{WithdrawalForm, initiate_withdrawal, initiate_withdrawal_endpoint};
pub use list::get_withdrawals_endpoint;

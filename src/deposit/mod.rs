//! The deposit ledger, and initiating and listing deposits.

mod core;
mod initiate;
mod list;

pub use core::{
    DepositStatus, DepositTransaction, complete_deposit, create_deposit_table,
    create_pending_deposit, fail_deposit, get_deposit, get_deposit_by_checkout_request_id,
    get_pending_deposits, get_total_completed_deposits, record_deposit_acknowledgement,
};
pub use initiate::{DepositForm, initiate_deposit, initiate_deposit_endpoint};
pub use list::get_deposits_endpoint;

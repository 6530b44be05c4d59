//! Moving ledger entries from pending to a terminal state.
//!
//! A payment is resolved by whichever of the gateway's result callback, its
//! timeout callback, or a status poll arrives first. All three go through
//! [apply_result], which only ever changes an entry that is not yet terminal,
//! so the later triggers become no-ops.

mod callback;
mod poll;

use rusqlite::Connection;
use time::OffsetDateTime;

use crate::{
    Error,
    database_id::{DepositId, WithdrawalId},
    deposit::{DepositStatus, complete_deposit, fail_deposit},
    gateway::{TransactionResult, metadata_value},
    withdrawal::{WithdrawalStatus, complete_withdrawal, fail_withdrawal},
};

pub use callback::{
    deposit_callback_endpoint, withdrawal_result_endpoint, withdrawal_timeout_endpoint,
};
pub use poll::{
    ReconcileSummary, check_pending_endpoint, reconcile_all_pending, reconcile_pending,
    spawn_periodic_reconciliation,
};

/// The description recorded on a withdrawal the gateway gave up on.
pub const TIMED_OUT_DESCRIPTION: &str = "Transaction timed out";
/// The description recorded on a failure the gateway did not describe.
pub const FAILED_DESCRIPTION: &str = "Transaction failed";

/// A ledger entry that can be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEntry {
    /// An entry in the deposit ledger.
    Deposit(DepositId),
    /// An entry in the withdrawal ledger.
    Withdrawal(WithdrawalId),
}

/// The terminal state a ledger entry should move to.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The money moved.
    Completed {
        /// The gateway's receipt number.
        receipt_number: Option<String>,
        /// The gateway's transaction ID, only sent for withdrawals.
        transaction_id: Option<String>,
        /// The phone that paid, only sent for deposits.
        phone_number: Option<String>,
        /// The gateway's description of the result.
        description: Option<String>,
    },
    /// The money did not move.
    Failed {
        /// Why the payment failed.
        description: String,
    },
}

impl Resolution {
    /// Map a result from a callback or status query to a resolution.
    ///
    /// Result code zero completes the entry, anything else fails it. Missing
    /// metadata items are left unset and unknown items are ignored.
    pub fn from_result(result: &TransactionResult) -> Self {
        if !result.is_success() {
            return Resolution::Failed {
                description: result
                    .description
                    .clone()
                    .unwrap_or_else(|| FAILED_DESCRIPTION.to_owned()),
            };
        }

        let metadata = &result.metadata;

        Resolution::Completed {
            receipt_number: metadata_value(metadata, "MpesaReceiptNumber")
                .or_else(|| metadata_value(metadata, "TransactionReceipt")),
            transaction_id: metadata_value(metadata, "TransactionId")
                .or_else(|| metadata_value(metadata, "TransactionID")),
            phone_number: metadata_value(metadata, "PhoneNumber"),
            description: result.description.clone(),
        }
    }

    /// The resolution for a payment the gateway timed out.
    pub fn timed_out() -> Self {
        Resolution::Failed {
            description: TIMED_OUT_DESCRIPTION.to_owned(),
        }
    }
}

/// What [apply_result] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The entry moved to its terminal state.
    Updated,
    /// The entry was already terminal and was left unchanged.
    AlreadyTerminal,
}

/// Move `entry` to the terminal state given by `resolution`.
///
/// The update is conditional on the entry not being terminal, so when two
/// triggers race the first one wins and the second one changes nothing.
///
/// # Errors
/// Returns an [Error::SqlError] if the update fails.
pub fn apply_result(
    entry: LedgerEntry,
    resolution: &Resolution,
    connection: &Connection,
) -> Result<Applied, Error> {
    let updated = match (entry, resolution) {
        (
            LedgerEntry::Deposit(id),
            Resolution::Completed {
                receipt_number,
                phone_number,
                description,
                ..
            },
        ) => complete_deposit(
            id,
            receipt_number.as_deref(),
            phone_number.as_deref(),
            description.as_deref(),
            OffsetDateTime::now_utc(),
            connection,
        )?,
        (LedgerEntry::Deposit(id), Resolution::Failed { description }) => {
            fail_deposit(id, DepositStatus::Failed, Some(description), connection)?
        }
        (
            LedgerEntry::Withdrawal(id),
            Resolution::Completed {
                receipt_number,
                transaction_id,
                description,
                ..
            },
        ) => complete_withdrawal(
            id,
            transaction_id.as_deref(),
            receipt_number.as_deref(),
            description.as_deref(),
            OffsetDateTime::now_utc(),
            connection,
        )?,
        (LedgerEntry::Withdrawal(id), Resolution::Failed { description }) => {
            fail_withdrawal(id, WithdrawalStatus::Failed, Some(description), connection)?
        }
    };

    if updated {
        tracing::info!("{entry:?} resolved as {resolution:?}");
        Ok(Applied::Updated)
    } else {
        tracing::info!("{entry:?} is already terminal, ignoring {resolution:?}");
        Ok(Applied::AlreadyTerminal)
    }
}

#[cfg(test)]
mod resolution_tests {
    use crate::gateway::{MetadataItem, TransactionResult};

    use super::{FAILED_DESCRIPTION, Resolution, TIMED_OUT_DESCRIPTION};

    #[test]
    fn success_extracts_metadata_by_name() {
        let result = TransactionResult {
            result_code: 0,
            description: Some("Done".to_owned()),
            metadata: vec![
                MetadataItem::new("Amount", "100"),
                MetadataItem::new("MpesaReceiptNumber", "R1"),
                MetadataItem::new("PhoneNumber", "254712345678"),
                MetadataItem::new("SomethingNew", "ignored"),
            ],
        };

        assert_eq!(
            Resolution::from_result(&result),
            Resolution::Completed {
                receipt_number: Some("R1".to_owned()),
                transaction_id: None,
                phone_number: Some("254712345678".to_owned()),
                description: Some("Done".to_owned()),
            }
        );
    }

    #[test]
    fn withdrawal_receipts_fall_back_to_transaction_receipt() {
        let result = TransactionResult {
            result_code: 0,
            description: None,
            metadata: vec![
                MetadataItem::new("TransactionID", "T1"),
                MetadataItem::new("TransactionReceipt", "T1"),
            ],
        };

        let Resolution::Completed {
            receipt_number,
            transaction_id,
            ..
        } = Resolution::from_result(&result)
        else {
            panic!("expected a completed resolution");
        };

        assert_eq!(receipt_number.as_deref(), Some("T1"));
        assert_eq!(transaction_id.as_deref(), Some("T1"));
    }

    #[test]
    fn nonzero_codes_fail_with_the_gateway_description() {
        let result = TransactionResult {
            result_code: 1032,
            description: Some("Request cancelled by user".to_owned()),
            metadata: Vec::new(),
        };

        assert_eq!(
            Resolution::from_result(&result),
            Resolution::Failed {
                description: "Request cancelled by user".to_owned()
            }
        );
    }

    #[test]
    fn undescribed_failures_get_a_default_description() {
        let result = TransactionResult {
            result_code: 1,
            description: None,
            metadata: Vec::new(),
        };

        assert_eq!(
            Resolution::from_result(&result),
            Resolution::Failed {
                description: FAILED_DESCRIPTION.to_owned()
            }
        );
    }

    #[test]
    fn timeouts_fail() {
        assert_eq!(
            Resolution::timed_out(),
            Resolution::Failed {
                description: TIMED_OUT_DESCRIPTION.to_owned()
            }
        );
    }
}

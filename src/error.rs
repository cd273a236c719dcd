use thiserror::Error;

use crate::db::models::WagerStatus;

/// Domain errors surfaced by placement and settlement.
///
/// Infrastructure layers (`db`, HTTP adapters) speak `anyhow`; anything that
/// crosses into the settlement workflow is folded into `Storage`.
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Insufficient funds: required {required:.2}, available {available:.2}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("No confident match for event {event_id}")]
    AmbiguousMatch { event_id: String },

    #[error("Ledger consistency violation on wager {wager_id}: already {current}, attempted {attempted}")]
    LedgerConsistency {
        wager_id: String,
        current: WagerStatus,
        attempted: WagerStatus,
    },

    #[error("Unknown wager: {0}")]
    UnknownWager(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl SettlementError {
    /// Errors that should leave the item for the next sweep rather than
    /// count as a failure.
    pub fn is_reschedule(&self) -> bool {
        matches!(self, SettlementError::AmbiguousMatch { .. })
    }
}

impl From<rusqlite::Error> for SettlementError {
    fn from(e: rusqlite::Error) -> Self {
        SettlementError::Storage(e.into())
    }
}

pub type SettlementResult<T> = std::result::Result<T, SettlementError>;

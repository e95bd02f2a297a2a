//! Error taxonomy shared by the coordinator, allocator, exchange client and worker.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the library.
///
/// A zero grant from the allocator is deliberately absent here: running out of
/// allocation is a normal outcome and is reported as a skipped buy, not a failure.
#[derive(Error, Debug)]
pub enum RotatorError {
    /// The shared sequence file lock was not obtained in time. No request may be
    /// signed without a sequence value, so the tick stops here.
    #[error("sequence coordinator unavailable: lock on {path:?} not acquired within {waited_ms}ms")]
    CoordinatorUnavailable { path: PathBuf, waited_ms: u64 },

    #[error("unknown asset: {0}")]
    UnknownAsset(String),

    /// Network or HTTP failure after the retry budget was spent.
    #[error("exchange unavailable: {0}")]
    ExchangeUnavailable(String),

    #[error("rate limited by exchange: {0}")]
    RateLimited(String),

    /// The exchange answered but refused the request.
    #[error("exchange rejected request: {}", .0.join(", "))]
    ExchangeRejected(Vec<String>),

    /// An order request may or may not have executed. Never retried automatically.
    #[error("order outcome unknown, manual reconciliation required: {0}")]
    OrderUnconfirmed(String),

    #[error("request signing failed: {0}")]
    Signing(String),

    /// The notification sink refused or could not be reached.
    #[error("notification failed: {0}")]
    Notification(String),

    #[error("invalid state file {path:?}: {reason}")]
    InvalidState { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RotatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_message_joins_errors() {
        let err = RotatorError::ExchangeRejected(vec![
            "EOrder:Insufficient funds".to_string(),
            "EGeneral:Invalid arguments".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "exchange rejected request: EOrder:Insufficient funds, EGeneral:Invalid arguments"
        );
    }
}

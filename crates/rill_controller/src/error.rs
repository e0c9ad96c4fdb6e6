//! Public failure taxonomy of the controller façade.

use uuid::Uuid;

use crate::model::{Epoch, StreamId, TxnStatus};
use rill_meta::StoreError;

/// Errors surfaced by controller operations.
///
/// `Conflict` and `StoreUnavailable` are retryable by the caller after
/// backoff; the rest are definitive. Idempotent operations never surface a
/// duplicate error to a retrying caller.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("scope {0} not found")]
    ScopeNotFound(String),

    #[error("stream {0} not found")]
    StreamNotFound(StreamId),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("transaction {txn} not found for stream {stream}")]
    TransactionNotFound { stream: StreamId, txn: Uuid },

    #[error("transaction {txn} already closed with status {status:?}")]
    TransactionAlreadyClosed { txn: Uuid, status: TxnStatus },

    #[error("lease expired for transaction {0}")]
    LeaseExpired(Uuid),

    #[error("epoch {epoch} not found for stream {stream}")]
    EpochNotFound { stream: StreamId, epoch: Epoch },

    #[error("scale conflict on stream {0}: another rescale is in flight")]
    ScaleConflict(StreamId),

    #[error("invalid scale request: {0}")]
    InvalidScaleRequest(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A concurrent writer (or a newer owner's fence) won the race.
    #[error("concurrent update conflict: {0}")]
    Conflict(String),

    /// The metadata store stayed unavailable through bounded retries.
    #[error("metadata store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<StoreError> for ControllerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionMismatch { key } => ControllerError::Conflict(key),
            StoreError::Fenced { resource } => {
                ControllerError::Conflict(format!("fenced out on {resource}"))
            }
            StoreError::Unavailable(msg) => ControllerError::StoreUnavailable(msg),
        }
    }
}

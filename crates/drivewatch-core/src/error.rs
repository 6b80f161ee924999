//! Error taxonomy for the coordination core.

use thiserror::Error;

/// Errors raised by the lease lock, ingestion engine, ledger, and relay.
///
/// A duplicate document is not an error: [`record_if_new`] reports it via
/// [`RecordOutcome::is_new`](crate::models::RecordOutcome).
///
/// [`record_if_new`]: crate::store::DocumentLedger::record_if_new
#[derive(Debug, Error)]
pub enum CoordError {
    /// Another invocation holds an unexpired lease on the channel.
    #[error("lease for channel {0} is currently held")]
    LockHeld(String),

    /// No lease record was seeded for the channel.
    #[error("no lease seeded for channel {0}")]
    LeaseMissing(String),

    /// The lease expired and was reclaimed before the holder released it.
    #[error("lease for channel {0} was reclaimed by another holder")]
    LeaseLost(String),

    /// Inbound signal does not belong to a registered channel.
    #[error("invalid channel notification: {0}")]
    InvalidChannel(String),

    /// Transient failure talking to the change-feed provider.
    #[error("change feed unavailable: {0}")]
    FeedUnavailable(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A stage record was restarted or already finished by another attempt.
    #[error("stage {stage} of document {document_id} is not held by this attempt")]
    StageConflict { document_id: String, stage: String },

    /// A fresh attempt of the stage is still running under another owner.
    #[error("stage {stage} of document {document_id} is running; retry in {retry_after_secs}s")]
    StageBusy {
        document_id: String,
        stage: String,
        retry_after_secs: u64,
    },

    #[error("queue error: {0}")]
    Queue(String),

    #[error("workflow error: {0}")]
    Workflow(String),

    #[error("store error: {0}")]
    Store(String),
}

impl CoordError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CoordError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the error is an expected back-off signal rather than a failure.
    pub fn is_lock_held(&self) -> bool {
        matches!(self, CoordError::LockHeld(_))
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;

//! Error types for the feed processor.

use crate::observer::CloseReason;
use leasefeed_protocol::{ContinuationToken, DocDbError, PageFailure, ProtocolError};
use thiserror::Error;

/// Result type for processor operations.
pub type ProcessorResult<T> = Result<T, ProcessorError>;

/// Result type for lease store operations.
pub type LeaseResult<T> = Result<T, LeaseError>;

/// Boxed error returned by observer callbacks.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that stop or interrupt a feed processor.
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// A page read failed; the failure carries its classification.
    #[error("change feed read failed: {0}")]
    Fetch(PageFailure),

    /// Transient failures kept occurring past the retry budget.
    #[error("gave up after {attempts} transient failures: {last}")]
    RetriesExhausted {
        /// Consecutive failed attempts.
        attempts: u32,
        /// The last failure seen.
        last: PageFailure,
    },

    /// The lease changed underneath the processor; ownership is lost.
    #[error("checkpoint conflict on lease {lease_token}")]
    CheckpointConflict {
        /// Lease that could not be checkpointed.
        lease_token: String,
    },

    /// The lease store rejected a checkpoint for another reason.
    #[error("checkpoint failed on lease {lease_token}: {source}")]
    Checkpoint {
        /// Lease that could not be checkpointed.
        lease_token: String,
        /// Store error.
        #[source]
        source: LeaseError,
    },

    /// The user observer failed.
    #[error("observer failed on lease {lease_token} (last checkpoint {last_checkpoint:?}): {source}")]
    Observer {
        /// Lease being processed.
        lease_token: String,
        /// Last continuation successfully checkpointed.
        last_checkpoint: Option<ContinuationToken>,
        /// Observer error.
        #[source]
        source: ObserverError,
    },

    /// State that the protocol does not allow; an implementation defect.
    #[error("malformed change feed state: {0}")]
    MalformedState(#[from] ProtocolError),

    /// Invalid observer state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// A checkpoint write missed its deadline.
    #[error("checkpoint on lease {lease_token} timed out")]
    CheckpointTimeout {
        /// Lease being checkpointed.
        lease_token: String,
    },

    /// The processor was stopped.
    #[error("processor cancelled")]
    Cancelled,

    /// The spawned processor task panicked or was aborted.
    #[error("processor task failed: {0}")]
    TaskFailed(String),
}

impl ProcessorError {
    /// Returns true if this error can be retried in place.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessorError::Fetch(failure) if failure.error.is_transient())
    }

    /// Returns the classification of a read failure, if this is one.
    pub fn doc_db_error(&self) -> Option<DocDbError> {
        match self {
            ProcessorError::Fetch(failure) => Some(failure.error),
            ProcessorError::RetriesExhausted { last, .. } => Some(last.error),
            _ => None,
        }
    }

    /// Attaches the last checkpointed continuation to an observer failure.
    pub fn with_last_checkpoint(self, checkpoint: Option<ContinuationToken>) -> Self {
        match self {
            ProcessorError::Observer {
                lease_token,
                source,
                ..
            } => ProcessorError::Observer {
                lease_token,
                last_checkpoint: checkpoint,
                source,
            },
            other => other,
        }
    }

    /// Maps the error to the reason the observer is closed with.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            ProcessorError::Fetch(failure) => match failure.error {
                DocDbError::PartitionSplit | DocDbError::PartitionNotFound => {
                    CloseReason::ResourceGone
                }
                DocDbError::TransientError
                | DocDbError::MaxItemCountTooLarge
                | DocDbError::Undefined => CloseReason::Unknown,
            },
            ProcessorError::RetriesExhausted { .. }
            | ProcessorError::CheckpointConflict { .. }
            | ProcessorError::Checkpoint { .. }
            | ProcessorError::CheckpointTimeout { .. } => CloseReason::ResourceGone,
            ProcessorError::Observer { .. } => CloseReason::ObserverError,
            ProcessorError::Cancelled => CloseReason::Shutdown,
            ProcessorError::MalformedState(_)
            | ProcessorError::InvalidStateTransition { .. }
            | ProcessorError::TaskFailed(_) => CloseReason::Unknown,
        }
    }
}

/// Errors returned by a lease store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// The lease etag no longer matches; another owner took over.
    #[error("lease {lease_token} was updated concurrently")]
    Conflict {
        /// Conflicting lease.
        lease_token: String,
    },

    /// The lease does not exist.
    #[error("lease {lease_token} not found")]
    NotFound {
        /// Missing lease.
        lease_token: String,
    },

    /// The lease is owned by someone else.
    #[error("lease {lease_token} is owned by {owner}")]
    AlreadyOwned {
        /// Requested lease.
        lease_token: String,
        /// Current owner.
        owner: String,
    },

    /// Store failure.
    #[error("lease store error: {0}")]
    Store(String),
}

impl LeaseError {
    /// Returns true if the error means ownership was lost.
    pub fn is_ownership_lost(&self) -> bool {
        matches!(
            self,
            LeaseError::Conflict { .. }
                | LeaseError::NotFound { .. }
                | LeaseError::AlreadyOwned { .. }
        )
    }
}

/// Error returned by a change feed source when no response was received.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("change feed source unavailable: {message}")]
pub struct SourceError {
    /// Error message.
    pub message: String,
}

impl SourceError {
    /// Creates a source error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

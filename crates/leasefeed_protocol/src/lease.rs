//! Leases and continuation tokens.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque cursor marking the next unread position of a range.
///
/// The token belongs to the document store's wire protocol. It is stored
/// and resubmitted verbatim; nothing in this workspace parses it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    /// Wraps a token received from the document store.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token exactly as received.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the token, returning the raw value.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContinuationToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ContinuationToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Ownership and progress record for one range of the change feed.
///
/// Leases are created and renewed by the lease store. The pump only ever
/// changes a lease through a checkpoint, and the etag guards that write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Identity of the range this lease covers.
    pub lease_token: String,
    /// Last checkpointed position, if any.
    pub continuation: Option<ContinuationToken>,
    /// Current owner (host instance name).
    pub owner: Option<String>,
    /// Version used for optimistic concurrency.
    pub etag: u64,
}

impl Lease {
    /// Creates an unowned lease with no checkpoint.
    pub fn new(lease_token: impl Into<String>) -> Self {
        Self {
            lease_token: lease_token.into(),
            continuation: None,
            owner: None,
            etag: 0,
        }
    }

    /// Sets the checkpointed continuation.
    pub fn with_continuation(mut self, continuation: ContinuationToken) -> Self {
        self.continuation = Some(continuation);
        self
    }

    /// Sets the owner.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Returns true if `owner` currently holds this lease.
    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner.as_deref() == Some(owner)
    }
}

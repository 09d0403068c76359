//! Change feed pages and classified failures.

use crate::classify::DocDbError;
use crate::lease::ContinuationToken;
use crate::state::FeedRangeState;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// A changed document as delivered by the store.
pub type Document = serde_json::Value;

/// Response headers forwarded to observers.
pub type ResponseHeaders = BTreeMap<String, String>;

/// Result of one successful change feed read.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeFeedPage {
    /// The store returned changes.
    ///
    /// `documents` is empty for the priming read of a `Now` state.
    Success {
        /// Changed documents in log order.
        documents: Vec<Document>,
        /// Cost of the read.
        request_charge: f64,
        /// Server-side identifier of the read.
        activity_id: String,
        /// Remaining response headers.
        headers: ResponseHeaders,
        /// Position after this page.
        state: FeedRangeState,
    },
    /// Nothing changed since the supplied position.
    NotModified {
        /// Cost of the read.
        request_charge: f64,
        /// Server-side identifier of the read.
        activity_id: String,
        /// Remaining response headers.
        headers: ResponseHeaders,
        /// Position after this read.
        state: FeedRangeState,
    },
}

impl ChangeFeedPage {
    /// Returns the position that follows this page.
    pub fn state(&self) -> &FeedRangeState {
        match self {
            ChangeFeedPage::Success { state, .. } | ChangeFeedPage::NotModified { state, .. } => {
                state
            }
        }
    }

    /// Consumes the page, returning the position that follows it.
    pub fn into_state(self) -> FeedRangeState {
        match self {
            ChangeFeedPage::Success { state, .. } | ChangeFeedPage::NotModified { state, .. } => {
                state
            }
        }
    }

    /// Returns the continuation of the next position, if resolved.
    pub fn continuation(&self) -> Option<&ContinuationToken> {
        self.state().state.continuation_token()
    }

    /// Returns the delivered documents (empty when not modified).
    pub fn documents(&self) -> &[Document] {
        match self {
            ChangeFeedPage::Success { documents, .. } => documents,
            ChangeFeedPage::NotModified { .. } => &[],
        }
    }

    /// Returns the server-side identifier of the read.
    pub fn activity_id(&self) -> &str {
        match self {
            ChangeFeedPage::Success { activity_id, .. }
            | ChangeFeedPage::NotModified { activity_id, .. } => activity_id,
        }
    }

    /// Returns the cost of the read.
    pub fn request_charge(&self) -> f64 {
        match self {
            ChangeFeedPage::Success { request_charge, .. }
            | ChangeFeedPage::NotModified { request_charge, .. } => *request_charge,
        }
    }

    /// Returns true if the store reported no changes.
    pub fn is_not_modified(&self) -> bool {
        matches!(self, ChangeFeedPage::NotModified { .. })
    }
}

/// A failed change feed read, classified for the pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFailure {
    /// Classification of the failure.
    pub error: DocDbError,
    /// Raw status code.
    pub status: u16,
    /// Raw sub-status code.
    pub sub_status: u32,
    /// Delay requested by the store before retrying.
    pub retry_after: Option<Duration>,
    /// Server-side identifier of the read, if any.
    pub activity_id: Option<String>,
    /// Diagnostic message.
    pub message: Option<String>,
}

impl PageFailure {
    /// Creates a failure with only status information.
    pub fn new(error: DocDbError, status: u16, sub_status: u32) -> Self {
        Self {
            error,
            status,
            sub_status,
            retry_after: None,
            activity_id: None,
            message: None,
        }
    }

    /// Sets the retry-after hint.
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Sets the activity id.
    pub fn with_activity_id(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    /// Sets the diagnostic message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl fmt::Display for PageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} (status {}, sub-status {})",
            self.error, self.status, self.sub_status
        )?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

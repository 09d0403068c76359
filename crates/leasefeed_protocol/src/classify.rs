//! Fault classification for change feed responses.

use crate::status::{code, sub_status as sub};

/// Message fragment the service uses when a page size is rejected.
const REDUCE_PAGE_SIZE_MESSAGE: &str = "Reduce page size and try again";

/// Closed taxonomy of change feed failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DocDbError {
    /// No rule matched.
    Undefined,
    /// The range no longer exists in this exact form (e.g. merged).
    PartitionNotFound,
    /// The range was split into child ranges.
    PartitionSplit,
    /// Retryable in place.
    TransientError,
    /// The requested page size was rejected.
    MaxItemCountTooLarge,
}

impl DocDbError {
    /// Returns true if the failure invalidates the range identity.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            DocDbError::PartitionNotFound | DocDbError::PartitionSplit
        )
    }

    /// Returns true if the failure can be retried against the same range.
    pub fn is_transient(&self) -> bool {
        matches!(self, DocDbError::TransientError)
    }
}

/// Classifies a status/sub-status pair.
///
/// Rules are evaluated in order and the first match wins:
///
/// 1. `404` unless the sub-status is `READ_SESSION_NOT_AVAILABLE`
/// 2. `410` with `PARTITION_KEY_RANGE_GONE` or `COMPLETING_SPLIT`
/// 3. `304`, `429` or any `5xx`
/// 4. everything else
///
/// The order must not change: new status/sub-status combinations may match
/// more than one rule.
pub fn classify(status: u16, sub_status: u32) -> DocDbError {
    if status == code::NOT_FOUND && sub_status != sub::READ_SESSION_NOT_AVAILABLE {
        return DocDbError::PartitionNotFound;
    }

    if status == code::GONE
        && (sub_status == sub::PARTITION_KEY_RANGE_GONE
            || sub_status == sub::COMPLETING_SPLIT)
    {
        return DocDbError::PartitionSplit;
    }

    if status == code::NOT_MODIFIED
        || status == code::TOO_MANY_REQUESTS
        || status >= code::INTERNAL_SERVER_ERROR
    {
        return DocDbError::TransientError;
    }

    DocDbError::Undefined
}

/// Classifies a full failed response.
///
/// Runs [`classify`] first. Only when that yields `Undefined` is the
/// response checked for a page size rejection.
pub fn classify_response(status: u16, sub_status: u32, message: Option<&str>) -> DocDbError {
    match classify(status, sub_status) {
        DocDbError::Undefined if is_page_size_rejection(status, message) => {
            DocDbError::MaxItemCountTooLarge
        }
        other => other,
    }
}

fn is_page_size_rejection(status: u16, message: Option<&str>) -> bool {
    status == code::REQUEST_ENTITY_TOO_LARGE
        || (status == code::BAD_REQUEST
            && message.is_some_and(|m| m.contains(REDUCE_PAGE_SIZE_MESSAGE)))
}

//! # leasefeed protocol
//!
//! Change feed protocol types for the leasefeed pump.
//!
//! This crate provides:
//! - `ChangeFeedState` / `FeedRangeState` cursor positions
//! - Request header population for each cursor state
//! - `ChangeFeedPage` and `PageFailure` results
//! - `DocDbError` and the status/sub-status fault classifier
//! - `Lease` and the opaque `ContinuationToken`
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod classify;
mod error;
mod lease;
mod page;
mod state;
pub mod status;

pub use classify::{classify, classify_response, DocDbError};
pub use error::{ProtocolError, ProtocolResult};
pub use lease::{ContinuationToken, Lease};
pub use page::{ChangeFeedPage, Document, PageFailure, ResponseHeaders};
pub use state::{
    headers, ChangeFeedRequest, ChangeFeedState, FeedRange, FeedRangeState, RequestHeaders,
};

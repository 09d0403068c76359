//! # leasefeed engine
//!
//! Lease-driven change feed pump.
//!
//! This crate provides:
//! - The per-lease `FeedProcessor` polling loop and its `ProcessorHandle`
//! - `PageEnumerator` over a pluggable `ChangeFeedSource`
//! - Checkpoint cadence (`AutoCheckpointer`) over a `LeaseStore`
//! - Observer lifecycle enforcement
//! - Retry with exponential backoff for transient failures
//! - Bounded ring buffer diagnostics
//! - In-memory sources and lease store for testing
//!
//! ## Architecture
//!
//! Each owned lease runs one pump on its own Tokio task:
//! 1. Fetch the page after the current position
//! 2. Deliver its documents to the observer
//! 3. Checkpoint the returned continuation when the cadence says so
//! 4. Sleep after a not-modified response, back off after a transient failure
//!
//! ## Key Invariants
//!
//! - Delivery is at least once
//! - A checkpoint never covers a partially delivered page
//! - Continuations are opaque and stored verbatim
//! - Splits and vanished ranges are never retried in place

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod clock;
mod config;
mod diagnostics;
mod enumerator;
mod error;
mod health;
mod lease_store;
mod memory;
mod observer;
mod processor;
mod source;

pub use checkpoint::{AutoCheckpointer, LeaseCheckpointer, PartitionCheckpointer};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{CheckpointFrequency, ProcessorOptions, RetryConfig};
pub use diagnostics::{
    BoundedRingBuffer, DiagnosticEvent, DiagnosticKind, Diagnostics, SharedRingBuffer,
};
pub use enumerator::PageEnumerator;
pub use error::{
    LeaseError, LeaseResult, ObserverError, ProcessorError, ProcessorResult, SourceError,
};
pub use health::{HealthMonitor, TracingHealthMonitor};
pub use lease_store::{LeaseStore, MemoryLeaseStore};
pub use memory::{lsn_token, FaultRule, InMemoryChangeFeedSource};
pub use observer::{
    ChangeFeedObserver, CloseReason, ObserverContext, ObserverLifecycle, ObserverState,
};
pub use processor::{FeedProcessor, ProcessorHandle, ProcessorOutcome, ProcessorStats};
pub use source::{ChangeFeedSource, MockChangeFeedSource, SourceResponse};

pub use leasefeed_protocol as protocol;

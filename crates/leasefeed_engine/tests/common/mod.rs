//! Shared observers and helpers for processor integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use leasefeed_engine::protocol::Document;
use leasefeed_engine::{
    ChangeFeedObserver, CloseReason, HealthMonitor, ObserverContext, ObserverError, ProcessorError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything an observer was called with.
#[derive(Debug, Default)]
pub struct Calls {
    pub opened: usize,
    pub batches: Vec<Vec<Document>>,
    pub closed: Vec<CloseReason>,
}

impl Calls {
    /// All delivered `_lsn` values, in delivery order.
    pub fn lsns(&self) -> Vec<u64> {
        self.batches
            .iter()
            .flatten()
            .filter_map(|d| d["_lsn"].as_u64())
            .collect()
    }

    pub fn document_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

/// Observer that records calls and optionally stops the processor.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    pub calls: Arc<Mutex<Calls>>,
    stop_after: Option<(usize, CancellationToken)>,
    fail_on_batch: Option<usize>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels `token` once `documents` documents were delivered.
    pub fn stop_after(mut self, documents: usize, token: CancellationToken) -> Self {
        self.stop_after = Some((documents, token));
        self
    }

    /// Fails the `batch`-th delivery (1-based).
    pub fn fail_on_batch(mut self, batch: usize) -> Self {
        self.fail_on_batch = Some(batch);
        self
    }
}

#[async_trait]
impl ChangeFeedObserver for RecordingObserver {
    async fn open(&mut self, _ctx: &ObserverContext) -> Result<(), ObserverError> {
        self.calls.lock().opened += 1;
        Ok(())
    }

    async fn process_changes(
        &mut self,
        _ctx: &ObserverContext,
        documents: &[Document],
    ) -> Result<(), ObserverError> {
        let mut calls = self.calls.lock();
        calls.batches.push(documents.to_vec());

        if self.fail_on_batch == Some(calls.batches.len()) {
            return Err("observer rejected batch".into());
        }
        if let Some((limit, token)) = &self.stop_after {
            if calls.document_count() >= *limit {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn close(
        &mut self,
        _ctx: &ObserverContext,
        reason: CloseReason,
    ) -> Result<(), ObserverError> {
        self.calls.lock().closed.push(reason);
        Ok(())
    }
}

/// Health monitor that records notifications as strings.
#[derive(Debug, Default)]
pub struct RecordingHealth {
    pub events: Mutex<Vec<String>>,
}

impl HealthMonitor for RecordingHealth {
    fn notify_started(&self, lease_token: &str) {
        self.events.lock().push(format!("started:{lease_token}"));
    }

    fn notify_error(&self, lease_token: &str, error: &ProcessorError) {
        let kind = error
            .doc_db_error()
            .map_or_else(|| "other".to_string(), |kind| format!("{kind:?}"));
        self.events.lock().push(format!("error:{lease_token}:{kind}"));
    }

    fn notify_closed(&self, lease_token: &str, reason: CloseReason) {
        self.events.lock().push(format!("closed:{lease_token}:{reason:?}"));
    }
}

//! Checkpoint cadence.
//!
//! [`AutoCheckpointer`] sits between the pump and the observer. It delivers
//! each batch, counts the batches, and persists the continuation returned
//! with that batch once the configured count or interval is reached.

use crate::clock::Clock;
use crate::config::CheckpointFrequency;
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::error::{ProcessorError, ProcessorResult};
use crate::lease_store::LeaseStore;
use crate::observer::{ChangeFeedObserver, CloseReason, ObserverContext, ObserverLifecycle, ObserverState};
use async_trait::async_trait;
use leasefeed_protocol::{ContinuationToken, Document, Lease};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Persists the position of one partition.
#[async_trait]
pub trait PartitionCheckpointer: Send {
    /// Persists `continuation`. Never retried by the caller.
    async fn checkpoint(&mut self, continuation: &ContinuationToken) -> ProcessorResult<()>;
}

/// Checkpoints into a lease store.
///
/// Holds the lease as last written, so every write presents the newest etag.
#[derive(Debug)]
pub struct LeaseCheckpointer<S> {
    store: S,
    lease: Lease,
    timeout: Duration,
}

impl<S: LeaseStore> LeaseCheckpointer<S> {
    /// Creates a checkpointer for `lease` whose writes must finish within `timeout`.
    pub fn new(store: S, lease: Lease, timeout: Duration) -> Self {
        Self {
            store,
            lease,
            timeout,
        }
    }

    /// Returns the lease as last written.
    pub fn lease(&self) -> &Lease {
        &self.lease
    }
}

#[async_trait]
impl<S: LeaseStore> PartitionCheckpointer for LeaseCheckpointer<S> {
    async fn checkpoint(&mut self, continuation: &ContinuationToken) -> ProcessorResult<()> {
        let lease_token = self.lease.lease_token.clone();

        let written = tokio::time::timeout(
            self.timeout,
            self.store.checkpoint(&self.lease, continuation),
        )
        .await
        .map_err(|_| ProcessorError::CheckpointTimeout {
            lease_token: lease_token.clone(),
        })?;

        let lease = written.map_err(|source| {
            if source.is_ownership_lost() {
                ProcessorError::CheckpointConflict {
                    lease_token: lease_token.clone(),
                }
            } else {
                ProcessorError::Checkpoint {
                    lease_token: lease_token.clone(),
                    source,
                }
            }
        })?;

        debug!(lease_token = %lease_token, continuation = %continuation, etag = lease.etag, "checkpointed lease");
        self.lease = lease;
        Ok(())
    }
}

/// Delivers batches to the observer and checkpoints on a cadence.
pub struct AutoCheckpointer<O, C> {
    lifecycle: ObserverLifecycle<O>,
    checkpointer: C,
    frequency: CheckpointFrequency,
    clock: Arc<dyn Clock>,
    diagnostics: Option<Diagnostics>,
    processed_count: u64,
    last_checkpoint_at: Instant,
    last_checkpoint: Option<ContinuationToken>,
}

impl<O: ChangeFeedObserver, C: PartitionCheckpointer> AutoCheckpointer<O, C> {
    /// Creates a checkpointer around `observer`.
    pub fn new(
        observer: O,
        checkpointer: C,
        frequency: CheckpointFrequency,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let last_checkpoint_at = clock.now();
        Self {
            lifecycle: ObserverLifecycle::new(observer),
            checkpointer,
            frequency,
            clock,
            diagnostics: None,
            processed_count: 0,
            last_checkpoint_at,
            last_checkpoint: None,
        }
    }

    /// Records checkpoints into `diagnostics`.
    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Sets the position already persisted before this pump started.
    pub fn with_last_checkpoint(mut self, continuation: Option<ContinuationToken>) -> Self {
        self.last_checkpoint = continuation;
        self
    }

    /// Batches delivered since the last checkpoint.
    pub fn processed_count(&self) -> u64 {
        self.processed_count
    }

    /// Last continuation persisted.
    pub fn last_checkpoint(&self) -> Option<&ContinuationToken> {
        self.last_checkpoint.as_ref()
    }

    /// Lifecycle state of the observer.
    pub fn observer_state(&self) -> ObserverState {
        self.lifecycle.state()
    }

    /// Returns the wrapped observer.
    pub fn observer(&self) -> &O {
        self.lifecycle.observer()
    }

    /// Returns the wrapped checkpointer.
    pub fn checkpointer(&self) -> &C {
        &self.checkpointer
    }

    /// Opens the observer and starts the checkpoint interval.
    pub async fn open(&mut self, ctx: &ObserverContext) -> ProcessorResult<()> {
        self.lifecycle.open(ctx).await?;
        self.last_checkpoint_at = self.clock.now();
        Ok(())
    }

    /// Delivers one page and checkpoints `continuation` if due.
    ///
    /// Returns true if a checkpoint was written.
    pub async fn process_changes(
        &mut self,
        ctx: &ObserverContext,
        documents: &[Document],
        continuation: &ContinuationToken,
    ) -> ProcessorResult<bool> {
        self.lifecycle
            .process_changes(ctx, documents)
            .await
            .map_err(|e| e.with_last_checkpoint(self.last_checkpoint.clone()))?;

        self.processed_count += 1;

        if !self.is_checkpoint_needed() {
            return Ok(false);
        }
        self.checkpoint(continuation).await?;
        Ok(true)
    }

    /// Returns true if either threshold is reached, or none is configured.
    pub fn is_checkpoint_needed(&self) -> bool {
        if self.frequency.is_every_page() {
            return true;
        }

        let count_reached = self
            .frequency
            .processed_document_count
            .is_some_and(|count| self.processed_count >= count);
        let interval_reached = self.frequency.time_interval.is_some_and(|interval| {
            self.clock.now().saturating_duration_since(self.last_checkpoint_at) >= interval
        });

        count_reached || interval_reached
    }

    async fn checkpoint(&mut self, continuation: &ContinuationToken) -> ProcessorResult<()> {
        self.checkpointer.checkpoint(continuation).await?;

        self.processed_count = 0;
        self.last_checkpoint_at = self.clock.now();
        self.last_checkpoint = Some(continuation.clone());
        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.record(DiagnosticKind::Checkpointed {
                continuation: continuation.clone(),
            });
        }
        Ok(())
    }

    /// Closes the observer. Idempotent.
    pub async fn close(&mut self, ctx: &ObserverContext, reason: CloseReason) -> ProcessorResult<()> {
        self.lifecycle
            .close(ctx, reason)
            .await
            .map_err(|e| e.with_last_checkpoint(self.last_checkpoint.clone()))
    }
}

impl<O, C> std::fmt::Debug for AutoCheckpointer<O, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoCheckpointer")
            .field("frequency", &self.frequency)
            .field("processed_count", &self.processed_count)
            .field("last_checkpoint", &self.last_checkpoint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::error::{LeaseError, LeaseResult, ObserverError};
    use crate::lease_store::MemoryLeaseStore;
    use serde_json::json;

    #[derive(Debug, Default)]
    struct CountingObserver {
        batches: usize,
        fail: bool,
    }

    #[async_trait]
    impl ChangeFeedObserver for CountingObserver {
        async fn open(&mut self, _ctx: &ObserverContext) -> Result<(), ObserverError> {
            Ok(())
        }

        async fn process_changes(
            &mut self,
            _ctx: &ObserverContext,
            _documents: &[Document],
        ) -> Result<(), ObserverError> {
            if self.fail {
                return Err("cannot handle".into());
            }
            self.batches += 1;
            Ok(())
        }

        async fn close(
            &mut self,
            _ctx: &ObserverContext,
            _reason: CloseReason,
        ) -> Result<(), ObserverError> {
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct RecordingCheckpointer {
        written: Vec<ContinuationToken>,
        reject: bool,
    }

    #[async_trait]
    impl PartitionCheckpointer for RecordingCheckpointer {
        async fn checkpoint(&mut self, continuation: &ContinuationToken) -> ProcessorResult<()> {
            if self.reject {
                return Err(ProcessorError::CheckpointConflict {
                    lease_token: "0".into(),
                });
            }
            self.written.push(continuation.clone());
            Ok(())
        }
    }

    fn doc() -> Vec<Document> {
        vec![json!({"id": "x"})]
    }

    async fn opened(
        frequency: CheckpointFrequency,
        clock: Arc<MockClock>,
    ) -> AutoCheckpointer<CountingObserver, RecordingCheckpointer> {
        let mut checkpointer = AutoCheckpointer::new(
            CountingObserver::default(),
            RecordingCheckpointer::default(),
            frequency,
            clock,
        );
        checkpointer
            .open(&ObserverContext::new("0"))
            .await
            .unwrap();
        checkpointer
    }

    #[tokio::test]
    async fn checkpoints_every_n_calls() {
        let clock = Arc::new(MockClock::new());
        let frequency = CheckpointFrequency::default().with_processed_document_count(5);
        let mut auto = opened(frequency, clock).await;
        let ctx = ObserverContext::new("0");

        let mut checkpointed_at = Vec::new();
        for call in 1..=15 {
            let token = ContinuationToken::new(format!("\"{call}\""));
            if auto.process_changes(&ctx, &doc(), &token).await.unwrap() {
                checkpointed_at.push(call);
            }
        }

        assert_eq!(checkpointed_at, vec![5, 10, 15]);
        assert_eq!(auto.processed_count(), 0);
        assert_eq!(auto.last_checkpoint().unwrap().as_str(), "\"15\"");
        assert_eq!(auto.checkpointer().written.len(), 3);
    }

    #[tokio::test]
    async fn counts_calls_not_documents() {
        let clock = Arc::new(MockClock::new());
        let frequency = CheckpointFrequency::default().with_processed_document_count(5);
        let mut auto = opened(frequency, clock).await;
        let ctx = ObserverContext::new("0");

        let pair = vec![json!({"id": 1}), json!({"id": 2})];
        let mut checkpointed_at = Vec::new();
        for call in 1..=10 {
            let token = ContinuationToken::new(format!("\"{call}\""));
            if auto.process_changes(&ctx, &pair, &token).await.unwrap() {
                checkpointed_at.push(call);
            }
            if call == 3 {
                assert_eq!(auto.processed_count(), 3);
            }
        }

        assert_eq!(checkpointed_at, vec![5, 10]);
        assert_eq!(auto.observer().batches, 10);
        assert_eq!(
            auto.checkpointer().written,
            vec![ContinuationToken::new("\"5\""), ContinuationToken::new("\"10\"")]
        );
    }

    #[tokio::test]
    async fn checkpoints_every_page_without_thresholds() {
        let clock = Arc::new(MockClock::new());
        let mut auto = opened(CheckpointFrequency::every_page(), clock).await;
        let ctx = ObserverContext::new("0");

        for call in 0..4 {
            let token = ContinuationToken::new(call.to_string());
            assert!(auto.process_changes(&ctx, &doc(), &token).await.unwrap());
        }
        assert_eq!(auto.checkpointer().written.len(), 4);
    }

    #[tokio::test]
    async fn checkpoints_after_interval() {
        let clock = Arc::new(MockClock::new());
        let frequency =
            CheckpointFrequency::default().with_time_interval(Duration::from_millis(200));
        let mut auto = opened(frequency, clock.clone()).await;
        let ctx = ObserverContext::new("0");

        clock.advance(Duration::from_millis(150));
        for call in 0..50 {
            let token = ContinuationToken::new(format!("\"{call}\""));
            assert!(!auto.process_changes(&ctx, &doc(), &token).await.unwrap());
        }
        assert!(auto.checkpointer().written.is_empty());
        assert_eq!(auto.processed_count(), 50);

        clock.advance(Duration::from_millis(60));
        assert!(auto.process_changes(&ctx, &doc(), &"\"50\"".into()).await.unwrap());
        assert_eq!(auto.processed_count(), 0);

        clock.advance(Duration::from_millis(10));
        assert!(!auto.is_checkpoint_needed());
    }

    #[tokio::test]
    async fn observer_failure_skips_checkpoint() {
        let clock = Arc::new(MockClock::new());
        let mut auto = AutoCheckpointer::new(
            CountingObserver {
                fail: true,
                ..CountingObserver::default()
            },
            RecordingCheckpointer::default(),
            CheckpointFrequency::every_page(),
            clock,
        )
        .with_last_checkpoint(Some("\"7\"".into()));
        let ctx = ObserverContext::new("0");
        auto.open(&ctx).await.unwrap();

        let err = auto
            .process_changes(&ctx, &doc(), &"\"8\"".into())
            .await
            .unwrap_err();
        match err {
            ProcessorError::Observer {
                last_checkpoint, ..
            } => assert_eq!(last_checkpoint.unwrap().as_str(), "\"7\""),
            other => panic!("unexpected error: {other}"),
        }
        assert!(auto.checkpointer().written.is_empty());
    }

    #[tokio::test]
    async fn failed_checkpoint_keeps_count() {
        let clock = Arc::new(MockClock::new());
        let mut auto = AutoCheckpointer::new(
            CountingObserver::default(),
            RecordingCheckpointer {
                reject: true,
                ..RecordingCheckpointer::default()
            },
            CheckpointFrequency::every_page(),
            clock,
        );
        let ctx = ObserverContext::new("0");
        auto.open(&ctx).await.unwrap();

        let err = auto
            .process_changes(&ctx, &doc(), &"\"1\"".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::CheckpointConflict { .. }));
        assert_eq!(auto.processed_count(), 1);
        assert!(auto.last_checkpoint().is_none());
    }

    #[tokio::test]
    async fn checkpoint_is_recorded_in_diagnostics() {
        let clock = Arc::new(MockClock::new());
        let diagnostics = Diagnostics::new(8, clock.clone());
        let mut auto = opened(CheckpointFrequency::every_page(), clock)
            .await
            .with_diagnostics(diagnostics.clone());

        auto.process_changes(&ObserverContext::new("0"), &doc(), &"\"4\"".into())
            .await
            .unwrap();

        assert_eq!(
            diagnostics.snapshot()[0].kind,
            DiagnosticKind::Checkpointed {
                continuation: "\"4\"".into()
            }
        );
    }

    #[tokio::test]
    async fn lease_checkpointer_tracks_etag() {
        let store = Arc::new(MemoryLeaseStore::new());
        store.create("0");
        let lease = store.acquire("0", "host").await.unwrap();

        let mut checkpointer =
            LeaseCheckpointer::new(store.clone(), lease, Duration::from_secs(1));
        checkpointer.checkpoint(&"\"1\"".into()).await.unwrap();
        checkpointer.checkpoint(&"\"2\"".into()).await.unwrap();

        assert_eq!(checkpointer.lease().etag, 3);
        assert_eq!(
            store.get("0").unwrap().continuation.unwrap().as_str(),
            "\"2\""
        );
    }

    #[tokio::test]
    async fn lease_checkpointer_maps_errors() {
        let store = Arc::new(MemoryLeaseStore::new());
        store.create("0");
        let lease = store.acquire("0", "host").await.unwrap();
        let mut checkpointer =
            LeaseCheckpointer::new(store.clone(), lease, Duration::from_secs(1));

        store.fail_next_checkpoint(LeaseError::Store("unavailable".into()));
        let err = checkpointer.checkpoint(&"\"1\"".into()).await.unwrap_err();
        assert!(matches!(err, ProcessorError::Checkpoint { .. }));

        store.steal("0", "other-host").unwrap();
        let err = checkpointer.checkpoint(&"\"1\"".into()).await.unwrap_err();
        assert!(matches!(err, ProcessorError::CheckpointConflict { .. }));
    }

    #[derive(Debug)]
    struct SlowStore;

    #[async_trait]
    impl LeaseStore for SlowStore {
        async fn acquire(&self, lease_token: &str, _owner: &str) -> LeaseResult<Lease> {
            Ok(Lease::new(lease_token))
        }

        async fn renew(&self, lease: &Lease) -> LeaseResult<Lease> {
            Ok(lease.clone())
        }

        async fn checkpoint(
            &self,
            lease: &Lease,
            _continuation: &ContinuationToken,
        ) -> LeaseResult<Lease> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(lease.clone())
        }

        async fn release(&self, _lease: &Lease) -> LeaseResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lease_checkpointer_times_out() {
        let mut checkpointer =
            LeaseCheckpointer::new(SlowStore, Lease::new("5"), Duration::from_secs(2));
        let err = checkpointer.checkpoint(&"\"1\"".into()).await.unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::CheckpointTimeout { ref lease_token } if lease_token == "5"
        ));
    }
}

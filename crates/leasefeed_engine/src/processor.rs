//! The per-lease change feed pump.
//!
//! A [`FeedProcessor`] owns one lease. It opens the observer, then loops:
//! fetch the next page, deliver it, checkpoint on cadence, and sleep after
//! a not-modified response. Transient failures are retried with backoff up
//! to the configured budget. A split or a vanished range ends the loop with
//! [`CloseReason::ResourceGone`] so the host can rebalance.

use crate::checkpoint::{AutoCheckpointer, LeaseCheckpointer, PartitionCheckpointer};
use crate::clock::{Clock, SystemClock};
use crate::config::ProcessorOptions;
use crate::diagnostics::{DiagnosticEvent, DiagnosticKind, Diagnostics};
use crate::enumerator::PageEnumerator;
use crate::error::{ProcessorError, ProcessorResult};
use crate::health::{HealthMonitor, TracingHealthMonitor};
use crate::lease_store::LeaseStore;
use crate::observer::{ChangeFeedObserver, CloseReason, ObserverContext};
use crate::source::ChangeFeedSource;
use leasefeed_protocol::status::{code, sub_status};
use leasefeed_protocol::{
    ChangeFeedPage, ContinuationToken, DocDbError, FeedRange, FeedRangeState, Lease, PageFailure,
    ProtocolError,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};

/// Counters kept by a processor over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Pages delivered to the observer.
    pub pages: u64,
    /// Documents delivered to the observer.
    pub documents: u64,
    /// Not-modified responses and empty pages that were waited out.
    pub not_modified: u64,
    /// Checkpoints written.
    pub checkpoints: u64,
    /// Transient failures retried in place.
    pub transient_retries: u64,
    /// Page size reductions after a rejection.
    pub page_size_reductions: u64,
    /// Failed reads per classification.
    pub failures: BTreeMap<DocDbError, u64>,
}

impl ProcessorStats {
    /// Returns the number of failed reads classified as `kind`.
    pub fn failures_of(&self, kind: DocDbError) -> u64 {
        self.failures.get(&kind).copied().unwrap_or(0)
    }

    fn record_failure(&mut self, kind: DocDbError) {
        *self.failures.entry(kind).or_default() += 1;
    }
}

/// How a processor ended.
#[derive(Debug)]
pub struct ProcessorOutcome {
    /// Reason the observer was closed with.
    pub close_reason: CloseReason,
    /// The error that ended the loop; `None` after a requested stop.
    pub error: Option<ProcessorError>,
    /// Last continuation persisted.
    pub last_checkpoint: Option<ContinuationToken>,
    /// Position reached, including pages not yet checkpointed.
    pub state: FeedRangeState,
    /// Lifetime counters.
    pub stats: ProcessorStats,
}

/// Pumps one lease from its current position into an observer.
pub struct FeedProcessor<S, O, C> {
    options: ProcessorOptions,
    source: S,
    observer: O,
    checkpointer: C,
    state: FeedRangeState,
    last_checkpoint: Option<ContinuationToken>,
    clock: Arc<dyn Clock>,
    health: Arc<dyn HealthMonitor>,
    diagnostics: Diagnostics,
    cancel: CancellationToken,
    span: Span,
}

impl<S, O, C> FeedProcessor<S, O, C>
where
    S: ChangeFeedSource + 'static,
    O: ChangeFeedObserver + 'static,
    C: PartitionCheckpointer + 'static,
{
    /// Creates a processor starting from the position selected by `options`.
    pub fn new(options: ProcessorOptions, source: S, observer: O, checkpointer: C) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let state = FeedRangeState::new(
            FeedRange::new(options.lease_token.clone()),
            options.initial_state(None),
        );
        let span = info_span!("feed_processor", lease_token = %options.lease_token);
        Self {
            diagnostics: Diagnostics::new(options.diagnostics_capacity, Arc::clone(&clock)),
            options,
            source,
            observer,
            checkpointer,
            state,
            last_checkpoint: None,
            clock,
            health: Arc::new(TracingHealthMonitor),
            cancel: CancellationToken::new(),
            span,
        }
    }

    /// Resumes from the continuation checkpointed on `lease`, if any.
    pub fn with_lease(mut self, lease: &Lease) -> Self {
        self.state = self.state.with_state(self.options.initial_state(Some(lease)));
        self.last_checkpoint = lease.continuation.clone();
        self
    }

    /// Starts from an explicit position.
    pub fn with_state(mut self, state: FeedRangeState) -> Self {
        self.state = state;
        self
    }

    /// Replaces the clock used for checkpoint intervals and diagnostics.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.diagnostics = Diagnostics::new(self.options.diagnostics_capacity, Arc::clone(&clock));
        self.clock = clock;
        self
    }

    /// Replaces the health monitor.
    pub fn with_health_monitor(mut self, health: Arc<dyn HealthMonitor>) -> Self {
        self.health = health;
        self
    }

    /// Uses `token` to stop the processor, e.g. a child of the host's token.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Logs under `span` instead of the default `feed_processor` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Returns the token that stops this processor.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns the position the processor starts from.
    pub fn state(&self) -> &FeedRangeState {
        &self.state
    }

    /// Runs the processor to completion on the current task.
    pub async fn run(self) -> ProcessorOutcome {
        let span = self.span.clone();
        self.execute().instrument(span).await
    }

    /// Spawns the processor on the Tokio runtime.
    ///
    /// Must be called from within a runtime.
    pub fn start(self) -> ProcessorHandle {
        let lease_token = self.options.lease_token.clone();
        let cancel = self.cancel.clone();
        let diagnostics = self.diagnostics.clone();
        ProcessorHandle {
            lease_token,
            cancel,
            diagnostics,
            task: tokio::spawn(self.run()),
        }
    }

    async fn execute(self) -> ProcessorOutcome {
        let FeedProcessor {
            options,
            source,
            observer,
            checkpointer,
            state,
            last_checkpoint,
            clock,
            health,
            diagnostics,
            cancel,
            span: _,
        } = self;

        let ctx = ObserverContext::new(options.lease_token.clone());
        let mut pump = Pump {
            enumerator: PageEnumerator::new(source)
                .with_session_token(options.session_token.clone()),
            auto: AutoCheckpointer::new(observer, checkpointer, options.checkpoint_frequency, clock)
                .with_diagnostics(diagnostics.clone())
                .with_last_checkpoint(last_checkpoint),
            state,
            stats: ProcessorStats::default(),
            page_size: options.max_item_count,
            attempts: 0,
            options,
            health,
            diagnostics,
            cancel,
        };

        let error = match pump.auto.open(&ctx).await {
            Ok(()) => {
                pump.health.notify_started(&pump.options.lease_token);
                info!(state = %pump.state.state, "processor started");
                pump.run().await
            }
            Err(error) => error,
        };
        pump.finish(&ctx, error).await
    }
}

impl<S, O, L> FeedProcessor<S, O, LeaseCheckpointer<L>>
where
    S: ChangeFeedSource + 'static,
    O: ChangeFeedObserver + 'static,
    L: LeaseStore + 'static,
{
    /// Creates a processor that checkpoints into `store` and resumes from `lease`.
    pub fn for_lease(
        options: ProcessorOptions,
        source: S,
        observer: O,
        store: L,
        lease: Lease,
    ) -> Self {
        let timeout = options.request_timeout;
        let resume = lease.clone();
        Self::new(
            options,
            source,
            observer,
            LeaseCheckpointer::new(store, lease, timeout),
        )
        .with_lease(&resume)
    }
}

/// Handle to a spawned processor.
#[derive(Debug)]
pub struct ProcessorHandle {
    lease_token: String,
    cancel: CancellationToken,
    diagnostics: Diagnostics,
    task: JoinHandle<ProcessorOutcome>,
}

impl ProcessorHandle {
    /// Lease the processor consumes.
    pub fn lease_token(&self) -> &str {
        &self.lease_token
    }

    /// Requests a stop. The observer is closed with [`CloseReason::Shutdown`].
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Waits for the processor to end.
    pub async fn completion(self) -> ProcessorResult<ProcessorOutcome> {
        self.task
            .await
            .map_err(|e| ProcessorError::TaskFailed(e.to_string()))
    }

    /// Returns the retained diagnostic events, oldest first.
    pub fn diagnostics(&self) -> Vec<DiagnosticEvent> {
        self.diagnostics.snapshot()
    }

    /// Returns true once the processor has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Loop state of a running processor.
struct Pump<S, O, C> {
    options: ProcessorOptions,
    enumerator: PageEnumerator<S>,
    auto: AutoCheckpointer<O, C>,
    state: FeedRangeState,
    stats: ProcessorStats,
    page_size: Option<u32>,
    attempts: u32,
    health: Arc<dyn HealthMonitor>,
    diagnostics: Diagnostics,
    cancel: CancellationToken,
}

impl<S, O, C> Pump<S, O, C>
where
    S: ChangeFeedSource,
    O: ChangeFeedObserver,
    C: PartitionCheckpointer,
{
    /// Loops until something ends the lease and returns that error.
    async fn run(&mut self) -> ProcessorError {
        loop {
            if self.cancel.is_cancelled() {
                return ProcessorError::Cancelled;
            }

            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ProcessorError::Cancelled,
                fetched = tokio::time::timeout(
                    self.options.request_timeout,
                    self.enumerator.fetch_next(&self.state, self.page_size),
                ) => fetched,
            };

            let step = match fetched.unwrap_or_else(|_| Err(timed_out())) {
                Ok(page) => self.handle_page(page).await,
                Err(ProcessorError::Fetch(failure)) => self.handle_failure(failure).await,
                Err(other) => Err(other),
            };
            if let Err(error) = step {
                return error;
            }
        }
    }

    async fn handle_page(&mut self, page: ChangeFeedPage) -> ProcessorResult<()> {
        self.attempts = 0;
        if self.page_size != self.options.max_item_count {
            debug!(max_item_count = ?self.options.max_item_count, "page size restored");
            self.page_size = self.options.max_item_count;
        }

        // `self.state` is still the position the request was built from.
        let resolved_tail = !page.is_not_modified() && self.state.state.is_priming();
        if resolved_tail && page.documents().is_empty() {
            self.state = page.into_state();
            debug!(state = %self.state.state, "start position resolved");
            return Ok(());
        }

        if page.is_not_modified() || page.documents().is_empty() {
            self.stats.not_modified += 1;
            self.diagnostics.record(DiagnosticKind::NotModified {
                activity_id: page.activity_id().to_string(),
            });
            self.state = page.into_state();
            trace!(state = %self.state.state, delay = ?self.options.feed_poll_delay, "no changes");
            return pause(&self.cancel, self.options.feed_poll_delay).await;
        }

        let continuation = page.continuation().cloned().ok_or_else(|| {
            ProcessorError::MalformedState(ProtocolError::MissingContinuation {
                state: page.state().state.to_string(),
            })
        })?;
        let documents = page.documents().len();
        self.stats.pages += 1;
        self.stats.documents += documents as u64;
        self.diagnostics.record(DiagnosticKind::PageReceived {
            documents,
            request_charge: page.request_charge(),
            activity_id: page.activity_id().to_string(),
        });
        debug!(documents, continuation = %continuation, "delivering page");

        let ctx = ObserverContext::for_page(self.options.lease_token.clone(), &page);
        if self
            .auto
            .process_changes(&ctx, page.documents(), &continuation)
            .await?
        {
            self.stats.checkpoints += 1;
        }
        self.state = page.into_state();
        Ok(())
    }

    async fn handle_failure(&mut self, failure: PageFailure) -> ProcessorResult<()> {
        self.stats.record_failure(failure.error);

        match failure.error {
            DocDbError::TransientError => {
                self.attempts += 1;
                if self.attempts > self.options.retry.max_attempts {
                    return Err(ProcessorError::RetriesExhausted {
                        attempts: self.attempts,
                        last: failure,
                    });
                }

                self.stats.transient_retries += 1;
                self.diagnostics.record(DiagnosticKind::TransientFailure {
                    status: failure.status,
                    sub_status: failure.sub_status,
                    attempt: self.attempts,
                });
                let delay = failure
                    .retry_after
                    .unwrap_or_else(|| self.options.retry.delay_for_attempt(self.attempts));
                warn!(
                    status = failure.status,
                    sub_status = failure.sub_status,
                    attempt = self.attempts,
                    ?delay,
                    "transient read failure, retrying"
                );
                self.health
                    .notify_error(&self.options.lease_token, &ProcessorError::Fetch(failure));
                pause(&self.cancel, delay).await
            }
            DocDbError::MaxItemCountTooLarge => {
                let reduced = match self.page_size {
                    None => ProcessorOptions::DEFAULT_MAX_ITEM_COUNT,
                    Some(size) if size > 1 => size / 2,
                    Some(_) => return Err(ProcessorError::Fetch(failure)),
                };
                self.page_size = Some(reduced);
                self.stats.page_size_reductions += 1;
                self.diagnostics.record(DiagnosticKind::PageSizeReduced {
                    max_item_count: reduced,
                });
                warn!(max_item_count = reduced, "page rejected as too large, reducing page size");
                Ok(())
            }
            DocDbError::PartitionSplit | DocDbError::PartitionNotFound | DocDbError::Undefined => {
                Err(ProcessorError::Fetch(failure))
            }
        }
    }

    async fn finish(mut self, ctx: &ObserverContext, error: ProcessorError) -> ProcessorOutcome {
        let reason = error.close_reason();
        let lease_token = self.options.lease_token.clone();

        match reason {
            CloseReason::Shutdown => info!("processor stopped"),
            CloseReason::ResourceGone => {
                warn!(error = %error, kind = ?error.doc_db_error(), "lease no longer readable")
            }
            CloseReason::ObserverError => error!(
                lease_token = %lease_token,
                last_checkpoint = ?self.auto.last_checkpoint(),
                error = %error,
                "observer failed"
            ),
            CloseReason::Unknown => error!(
                lease_token = %lease_token,
                state = %self.state.state,
                error = %error,
                "processor ended for an unexpected reason"
            ),
        }

        if !matches!(error, ProcessorError::Cancelled) {
            self.health.notify_error(&lease_token, &error);
        }
        if let Err(close_error) = self.auto.close(ctx, reason).await {
            warn!(error = %close_error, "observer close failed");
            self.health.notify_error(&lease_token, &close_error);
        }
        self.diagnostics.record(DiagnosticKind::Closed { reason });
        self.health.notify_closed(&lease_token, reason);

        ProcessorOutcome {
            close_reason: reason,
            error: match error {
                ProcessorError::Cancelled => None,
                other => Some(other),
            },
            last_checkpoint: self.auto.last_checkpoint().cloned(),
            state: self.state,
            stats: self.stats,
        }
    }
}

/// Sleeps for `delay` unless cancelled first.
async fn pause(cancel: &CancellationToken, delay: Duration) -> ProcessorResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProcessorError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

fn timed_out() -> ProcessorError {
    ProcessorError::Fetch(
        PageFailure::new(DocDbError::TransientError, code::REQUEST_TIMEOUT, sub_status::NONE)
            .with_message("change feed read timed out"),
    )
}

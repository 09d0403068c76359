//! User observer and its lifecycle.

use crate::error::{ObserverError, ProcessorError, ProcessorResult};
use async_trait::async_trait;
use leasefeed_protocol::{ChangeFeedPage, Document, ResponseHeaders};
use std::fmt;

/// Why an observer was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The host asked the processor to stop.
    Shutdown,
    /// The range split or disappeared, or ownership of the lease was lost.
    ResourceGone,
    /// The observer itself failed.
    ObserverError,
    /// Anything else. Always logged at error level.
    Unknown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::Shutdown => "shutdown",
            CloseReason::ResourceGone => "resource gone",
            CloseReason::ObserverError => "observer error",
            CloseReason::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Context handed to every observer callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObserverContext {
    /// Lease being processed.
    pub lease_token: String,
    /// Server-side identifier of the read that produced the batch.
    pub activity_id: Option<String>,
    /// Cost of that read.
    pub request_charge: f64,
    /// Response headers of that read.
    pub headers: ResponseHeaders,
}

impl ObserverContext {
    /// Context not tied to a read, as used by `open` and `close`.
    pub fn new(lease_token: impl Into<String>) -> Self {
        Self {
            lease_token: lease_token.into(),
            ..Self::default()
        }
    }

    /// Context for the batch carried by `page`.
    pub fn for_page(lease_token: impl Into<String>, page: &ChangeFeedPage) -> Self {
        let headers = match page {
            ChangeFeedPage::Success { headers, .. } | ChangeFeedPage::NotModified { headers, .. } => {
                headers.clone()
            }
        };
        Self {
            lease_token: lease_token.into(),
            activity_id: Some(page.activity_id().to_string()),
            request_charge: page.request_charge(),
            headers,
        }
    }
}

/// Receives the changes of one lease.
///
/// Delivery is at least once: after a crash between processing and
/// checkpointing, the same documents are delivered again.
#[async_trait]
pub trait ChangeFeedObserver: Send {
    /// Called once before the first batch.
    async fn open(&mut self, ctx: &ObserverContext) -> Result<(), ObserverError>;

    /// Called once per non-empty page, in log order.
    async fn process_changes(
        &mut self,
        ctx: &ObserverContext,
        documents: &[Document],
    ) -> Result<(), ObserverError>;

    /// Called once when processing of the lease ends.
    async fn close(&mut self, ctx: &ObserverContext, reason: CloseReason)
        -> Result<(), ObserverError>;
}

#[async_trait]
impl<O: ChangeFeedObserver + ?Sized> ChangeFeedObserver for Box<O> {
    async fn open(&mut self, ctx: &ObserverContext) -> Result<(), ObserverError> {
        (**self).open(ctx).await
    }

    async fn process_changes(
        &mut self,
        ctx: &ObserverContext,
        documents: &[Document],
    ) -> Result<(), ObserverError> {
        (**self).process_changes(ctx, documents).await
    }

    async fn close(
        &mut self,
        ctx: &ObserverContext,
        reason: CloseReason,
    ) -> Result<(), ObserverError> {
        (**self).close(ctx, reason).await
    }
}

/// Where an observer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    /// `open` has not succeeded yet.
    NotStarted,
    /// Opened, no batch delivered yet.
    Opened,
    /// At least one batch delivered.
    Processing,
    /// Closed; terminal.
    Closed,
}

impl ObserverState {
    /// Returns true if `open` is allowed.
    pub fn can_open(&self) -> bool {
        matches!(self, ObserverState::NotStarted)
    }

    /// Returns true if batches may be delivered.
    pub fn can_process(&self) -> bool {
        matches!(self, ObserverState::Opened | ObserverState::Processing)
    }
}

/// Enforces the observer call order: open, any number of batches, close.
///
/// `close` is accepted from any state and only the first one reaches the
/// observer. An observer whose `open` never succeeded is not closed.
#[derive(Debug)]
pub struct ObserverLifecycle<O> {
    observer: O,
    state: ObserverState,
}

impl<O: ChangeFeedObserver> ObserverLifecycle<O> {
    /// Wraps an observer.
    pub fn new(observer: O) -> Self {
        Self {
            observer,
            state: ObserverState::NotStarted,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> ObserverState {
        self.state
    }

    /// Returns the wrapped observer.
    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Consumes the lifecycle, returning the observer.
    pub fn into_inner(self) -> O {
        self.observer
    }

    fn invalid(&self, to: &str) -> ProcessorError {
        ProcessorError::InvalidStateTransition {
            from: format!("{:?}", self.state),
            to: to.into(),
        }
    }

    /// Opens the observer.
    pub async fn open(&mut self, ctx: &ObserverContext) -> ProcessorResult<()> {
        if !self.state.can_open() {
            return Err(self.invalid("Opened"));
        }

        self.observer
            .open(ctx)
            .await
            .map_err(|source| observer_failure(ctx, source))?;
        self.state = ObserverState::Opened;
        Ok(())
    }

    /// Delivers one batch.
    pub async fn process_changes(
        &mut self,
        ctx: &ObserverContext,
        documents: &[Document],
    ) -> ProcessorResult<()> {
        if !self.state.can_process() {
            return Err(self.invalid("Processing"));
        }

        self.state = ObserverState::Processing;
        self.observer
            .process_changes(ctx, documents)
            .await
            .map_err(|source| observer_failure(ctx, source))
    }

    /// Closes the observer. A second call is a no-op.
    pub async fn close(&mut self, ctx: &ObserverContext, reason: CloseReason) -> ProcessorResult<()> {
        let was_open = self.state.can_process();
        if self.state == ObserverState::Closed {
            return Ok(());
        }
        self.state = ObserverState::Closed;

        if !was_open {
            return Ok(());
        }
        self.observer
            .close(ctx, reason)
            .await
            .map_err(|source| observer_failure(ctx, source))
    }
}

fn observer_failure(ctx: &ObserverContext, source: ObserverError) -> ProcessorError {
    ProcessorError::Observer {
        lease_token: ctx.lease_token.clone(),
        last_checkpoint: None,
        source,
    }
}

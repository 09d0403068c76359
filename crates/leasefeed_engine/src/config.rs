//! Configuration for the feed processor.

use chrono::{DateTime, Utc};
use leasefeed_protocol::{ChangeFeedState, ContinuationToken, Lease};
use rand::Rng;
use std::time::Duration;

/// Options for one feed processor instance.
///
/// Immutable once the processor is built.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Range (lease) this processor consumes.
    pub lease_token: String,
    /// Position to start from when the lease has no checkpoint.
    pub start_continuation: Option<ContinuationToken>,
    /// Delay after a not-modified response.
    pub feed_poll_delay: Duration,
    /// Page size hint; `None` lets the store choose.
    pub max_item_count: Option<u32>,
    /// Start from the beginning of the log when nothing else is set.
    pub start_from_beginning: bool,
    /// Start from changes made at or after this time.
    pub start_time: Option<DateTime<Utc>>,
    /// Session token forwarded on every read.
    pub session_token: Option<String>,
    /// Deadline for each fetch and checkpoint write.
    pub request_timeout: Duration,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
    /// When to checkpoint.
    pub checkpoint_frequency: CheckpointFrequency,
    /// Number of diagnostic events kept by the processor.
    pub diagnostics_capacity: usize,
}

impl ProcessorOptions {
    /// Page size used when the store rejects an unset page size.
    pub const DEFAULT_MAX_ITEM_COUNT: u32 = 100;

    /// Creates options for a lease.
    pub fn new(lease_token: impl Into<String>) -> Self {
        Self {
            lease_token: lease_token.into(),
            start_continuation: None,
            feed_poll_delay: Duration::from_secs(5),
            max_item_count: None,
            start_from_beginning: false,
            start_time: None,
            session_token: None,
            request_timeout: Duration::from_secs(65),
            retry: RetryConfig::default(),
            checkpoint_frequency: CheckpointFrequency::default(),
            diagnostics_capacity: 64,
        }
    }

    /// Sets the start continuation.
    pub fn with_start_continuation(mut self, continuation: ContinuationToken) -> Self {
        self.start_continuation = Some(continuation);
        self
    }

    /// Sets the poll delay after a not-modified response.
    pub fn with_feed_poll_delay(mut self, delay: Duration) -> Self {
        self.feed_poll_delay = delay;
        self
    }

    /// Sets the page size hint.
    pub fn with_max_item_count(mut self, count: u32) -> Self {
        self.max_item_count = Some(count);
        self
    }

    /// Starts from the beginning of the log.
    pub fn with_start_from_beginning(mut self) -> Self {
        self.start_from_beginning = true;
        self
    }

    /// Sets the start time.
    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    /// Sets the session token.
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Sets the fetch/checkpoint deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the checkpoint frequency.
    pub fn with_checkpoint_frequency(mut self, frequency: CheckpointFrequency) -> Self {
        self.checkpoint_frequency = frequency;
        self
    }

    /// Sets the number of diagnostic events kept.
    pub fn with_diagnostics_capacity(mut self, capacity: usize) -> Self {
        self.diagnostics_capacity = capacity;
        self
    }

    /// Resolves the position to start reading from.
    ///
    /// Precedence: lease checkpoint, start continuation, start time,
    /// start from beginning, and finally the current tail.
    pub fn initial_state(&self, lease: Option<&Lease>) -> ChangeFeedState {
        if let Some(continuation) = lease.and_then(|l| l.continuation.clone()) {
            return ChangeFeedState::Continuation(continuation);
        }
        if let Some(continuation) = &self.start_continuation {
            return ChangeFeedState::Continuation(continuation.clone());
        }
        if let Some(start) = self.start_time {
            return ChangeFeedState::Time(start);
        }
        if self.start_from_beginning {
            return ChangeFeedState::Beginning;
        }
        ChangeFeedState::Now
    }
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self::new("")
    }
}

/// When the processor persists its position.
///
/// With neither field set, a checkpoint is written after every page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointFrequency {
    /// Checkpoint once this many batches were delivered to the observer.
    pub processed_document_count: Option<u64>,
    /// Checkpoint once this much time passed since the last checkpoint.
    pub time_interval: Option<Duration>,
}

impl CheckpointFrequency {
    /// Checkpoint after every page.
    pub fn every_page() -> Self {
        Self::default()
    }

    /// Sets the delivered batch count threshold.
    pub fn with_processed_document_count(mut self, count: u64) -> Self {
        self.processed_document_count = Some(count);
        self
    }

    /// Sets the time threshold.
    pub fn with_time_interval(mut self, interval: Duration) -> Self {
        self.time_interval = Some(interval);
        self
    }

    /// Returns true if neither threshold is configured.
    pub fn is_every_page(&self) -> bool {
        self.processed_document_count.is_none() && self.time_interval.is_none()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of consecutive transient failures tolerated.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

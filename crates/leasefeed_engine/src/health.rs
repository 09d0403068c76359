//! Health notifications emitted by the processor.

use crate::error::ProcessorError;
use crate::observer::CloseReason;
use tracing::{error, info, warn};

/// Receives lifecycle notifications from a running processor.
pub trait HealthMonitor: Send + Sync {
    /// The processor took the lease and opened its observer.
    fn notify_started(&self, lease_token: &str);

    /// The processor hit an error. Transient errors are reported too.
    fn notify_error(&self, lease_token: &str, error: &ProcessorError);

    /// The processor closed its observer.
    fn notify_closed(&self, lease_token: &str, reason: CloseReason);
}

/// Reports health through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHealthMonitor;

impl HealthMonitor for TracingHealthMonitor {
    fn notify_started(&self, lease_token: &str) {
        info!(lease_token, "lease acquired");
    }

    fn notify_error(&self, lease_token: &str, error: &ProcessorError) {
        if error.is_retryable() {
            warn!(lease_token, %error, "transient processor error");
        } else {
            error!(lease_token, %error, "processor error");
        }
    }

    fn notify_closed(&self, lease_token: &str, reason: CloseReason) {
        match reason {
            CloseReason::Unknown => error!(lease_token, %reason, "lease released for unknown reason"),
            _ => info!(lease_token, %reason, "lease released"),
        }
    }
}

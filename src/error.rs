//! Error types for offload.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::RemoteError;
use crate::signals::TerminationReason;

/// Main error type for pool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Invalid configuration value, reported before any worker is touched.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The task queue already holds `max_queue_size` tasks.
    #[error("task queue is full (limit {limit})")]
    QueueFull {
        /// The configured `max_queue_size`.
        limit: usize,
    },

    /// An error raised by user code inside a worker, reconstructed from the wire.
    #[error(transparent)]
    Remote(RemoteError),

    /// The task future was cancelled by the caller.
    #[error("task cancelled")]
    Cancelled,

    /// The task deadline elapsed.
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),

    /// The worker was torn down while the task was still in flight.
    #[error("worker terminated while task was in flight")]
    WorkerTerminated,

    /// The worker endpoint died unexpectedly.
    #[error(transparent)]
    WorkerCrashed(#[from] CrashReport),

    /// The pool was terminated while the task was still queued.
    #[error("pool terminated")]
    PoolTerminated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Diagnostic report for a worker that died without being asked to.
///
/// Carries the analyzed exit reason, the script (or spawn mode) of the
/// endpoint, and the last stderr lines seen before death.
#[derive(Debug, Clone)]
pub struct CrashReport {
    /// Why the endpoint terminated.
    pub reason: TerminationReason,
    /// Description of what was spawned (script path, `<current-exe>`, or `<thread>`).
    pub script: String,
    /// Most recent stderr lines from the worker, oldest first.
    pub stderr_tail: Vec<String>,
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker {} crashed: {}", self.script, self.reason)?;
        if let Some(last) = self.stderr_tail.last() {
            write!(f, " (last stderr: {})", last)?;
        }
        Ok(())
    }
}

impl std::error::Error for CrashReport {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_report_display() {
        let report = CrashReport {
            reason: TerminationReason::Exited(7),
            script: "<current-exe>".to_string(),
            stderr_tail: vec!["thread panicked".to_string()],
        };
        let text = report.to_string();
        assert!(text.contains("exited with code 7"));
        assert!(text.contains("thread panicked"));
    }

    #[test]
    fn test_queue_full_display() {
        let err = PoolError::QueueFull { limit: 4 };
        assert_eq!(err.to_string(), "task queue is full (limit 4)");
    }

    #[test]
    fn test_remote_error_passthrough() {
        let err = PoolError::Remote(RemoteError::new("boom"));
        assert_eq!(err.to_string(), "boom");
    }
}

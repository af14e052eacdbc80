//! Error types for external process execution.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while launching, reading from or tearing down external processes.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The executable could not be started.
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// No output arrived within the read window.
    ///
    /// Callers treat this as "no progress this round", never as a task failure.
    #[error("No output received within {0:?}")]
    OutputTimeout(Duration),

    /// I/O error while talking to a running process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An output handler failed to make sense of what the process wrote.
    #[error("Output handler failed for {command}: {reason}")]
    Handler { command: String, reason: String },

    /// The surrounding run was cancelled.
    #[error("Cancelled")]
    Cancelled,
}

impl ProcessError {
    /// Creates a handler error for the given command line.
    pub fn handler(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Handler {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error stems from cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Returns true if an `anyhow` error chain was caused by cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<ProcessError>()
            .map(ProcessError::is_cancelled)
            .unwrap_or(false)
    })
}

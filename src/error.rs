//! Error types for pwsh-bridge.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::session::CommandResponse;

/// Main error type for pwsh-bridge operations.
#[derive(Error, Debug)]
pub enum PwshBridgeError {
    /// The interpreter process could not be started or failed its
    /// readiness probe.
    #[error("failed to start powershell: {0}")]
    Startup(String),

    /// An operation did not complete within its effective timeout.
    #[error("{phase} timed out after {limit:?}")]
    Timeout {
        /// Which phase of the session lifecycle timed out.
        phase: TimeoutPhase,
        /// The effective timeout that expired.
        limit: Duration,
    },

    /// Reading from or writing to the interpreter's streams failed,
    /// including protocol desync on the framing layer.
    #[error("communication with powershell failed: {0}")]
    Communication(String),

    /// The interpreter process exited unexpectedly or could not be
    /// controlled at the OS level.
    #[error("powershell process error: {0}")]
    Process(String),

    /// The interpreter ran the command and reported failure. Carries the
    /// full response, including captured stderr.
    #[error("command failed: {}", .0.stderr.trim())]
    Execution(Box<CommandResponse>),

    /// Invalid session state transition attempted.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        from: crate::session::SessionState,
        to: crate::session::SessionState,
    },

    /// A precondition check at a public operation boundary failed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl PwshBridgeError {
    /// Whether this error is a transient infrastructure failure.
    ///
    /// Transient errors are eligible for retry during session startup.
    /// `Execution` is never transient: re-running a command that already
    /// ran could repeat its side effects. `Process` is never transient:
    /// interpreter state died with the process and a silent restart would
    /// hide that loss.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PwshBridgeError::Startup(_)
                | PwshBridgeError::Communication(_)
                | PwshBridgeError::Timeout { .. }
        )
    }

    /// Shorthand for a `Communication` error from any displayable cause.
    pub(crate) fn comm(err: impl fmt::Display) -> Self {
        PwshBridgeError::Communication(err.to_string())
    }
}

/// Lifecycle phase in which a timeout occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Process spawn plus readiness probe.
    Startup,
    /// A submitted command, measured from submission.
    Command,
    /// Graceful shutdown.
    Shutdown,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::Startup => write!(f, "startup"),
            TimeoutPhase::Command => write!(f, "command"),
            TimeoutPhase::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Convenience Result type for pwsh-bridge operations.
pub type Result<T> = std::result::Result<T, PwshBridgeError>;

//! Command request and response types.

use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use crate::error::PwshBridgeError;
use crate::Result;

/// Correlation token tying a request to its response and sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationToken(Uuid);

impl CorrelationToken {
    /// Generate a fresh random token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The sentinel line derived from this token.
    ///
    /// Random per request, so a sentinel from one command cannot terminate
    /// another command's output.
    pub fn sentinel(&self) -> String {
        format!("__PWSH_EOC_{}__", self.0.simple())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// A command or multi-line script to submit to the interpreter.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// The command text. May span multiple lines.
    pub text: String,
    /// Per-request timeout override; the session default applies otherwise.
    pub timeout: Option<Duration>,
    /// Correlation token; also seeds the request's sentinel.
    pub token: CorrelationToken,
}

impl CommandRequest {
    /// Create a request for a single command.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timeout: None,
            token: CorrelationToken::new(),
        }
    }

    /// Create a request for a multi-line script.
    ///
    /// Scripts travel the same path as single commands; the constructor
    /// exists to make call sites read naturally.
    pub fn script(text: impl Into<String>) -> Self {
        Self::new(text)
    }

    /// Set a per-request timeout override.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Precondition checks applied at the public operation boundary.
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(PwshBridgeError::InvalidRequest(
                "command text is empty".into(),
            ));
        }
        if self.text.contains('\0') {
            return Err(PwshBridgeError::InvalidRequest(
                "command text contains a NUL byte".into(),
            ));
        }
        Ok(())
    }
}

/// Captured result of one command execution. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    /// Captured standard output, without the protocol sentinel.
    pub stdout: String,
    /// Standard error text associated with this command.
    pub stderr: String,
    /// Whether the interpreter reported success and stderr stayed empty.
    pub success: bool,
    /// Wall-clock execution duration, measured inside the event loop.
    pub duration: Duration,
    /// Token of the originating request.
    pub token: CorrelationToken,
}

impl CommandResponse {
    /// Get stdout with surrounding whitespace trimmed.
    pub fn output_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Iterate over stdout lines.
    pub fn output_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }
}

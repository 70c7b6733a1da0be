//! # pwsh-bridge
//!
//! Persistent PowerShell session controller. Drives a long-lived `pwsh`
//! subprocess over its stdio streams, one command at a time, recovering
//! structured results through a sentinel-based output framing protocol.
//!
//! ## Features
//!
//! - **Stateful sessions**: working directory and variables persist across
//!   commands within one session, scoped to its subprocess
//! - **Sentinel framing**: per-request random markers delimit each
//!   command's output on an otherwise unstructured stream
//! - **Blocking and async surfaces**: both call styles drive one event loop
//!   per session, FIFO-ordered and single-flight
//! - **Fail-fast faults**: timeouts and protocol desync tear the session
//!   down instead of misattributing output
//!
//! ## Quick Start
//!
//! ```no_run
//! use pwsh_bridge::{Config, Session};
//!
//! fn main() -> pwsh_bridge::Result<()> {
//!     pwsh_bridge::logging::try_init().ok();
//!
//!     let session = Session::open(Config::default())?;
//!     let response = session.execute_command("Get-Location")?;
//!     println!("cwd: {}", response.output_trimmed());
//!
//!     session.close()?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod mock;
pub mod process;
pub mod retry;
pub mod session;

// Re-export commonly used types
pub use bridge::{ExecutionBridge, PendingClose, PendingCommand};
pub use channel::SessionChannel;
pub use config::{Config, RetrySection, TextEncoding, TimeoutSection};
pub use error::{PwshBridgeError, Result, TimeoutPhase};
pub use mock::{MockReply, MockResponder};
pub use process::{ExitInfo, ProcessStreams, ProcessSupervisor};
pub use retry::{RetryPolicy, RetryState};
pub use session::{
    CommandRequest, CommandResponse, CorrelationToken, Session, SessionId, SessionState,
};

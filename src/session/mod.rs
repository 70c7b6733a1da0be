//! Session management: one logical, stateful conversation with a single
//! controlled interpreter subprocess.
//!
//! Working-directory and variable continuity live inside the interpreter,
//! not in this layer: `$x = 1` in one command is visible to the next command
//! of the same session, and invisible to every other session. That state
//! dies with the subprocess, which is why a faulted session is recreated,
//! never silently restarted.

mod id;
mod request;
mod state;

pub use id::SessionId;
pub use request::{CommandRequest, CommandResponse, CorrelationToken};
pub use state::SessionState;

use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::debug;

use crate::bridge::{
    startup_budget, ExecutionBridge, Job, PendingClose, PendingCommand, ReplySlot,
    FORCED_TEARDOWN_WINDOW,
};
use crate::config::Config;
use crate::error::{PwshBridgeError, TimeoutPhase};
use crate::mock::MockResponder;
use crate::Result;

/// A live PowerShell session: one subprocess, one event loop, one command
/// in flight at a time.
///
/// Every operation exists in a blocking form (`execute_*`, `close`) that
/// parks the calling thread, and a non-blocking form (`submit_*`) that
/// returns a pending handle to await. Both forms drive the same event loop
/// and share one error classification. The blocking forms must not be
/// called from async context.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    config: Config,
    bridge: ExecutionBridge,
    pid: Option<u32>,
}

impl Session {
    /// Open a session, blocking until the interpreter is ready or startup
    /// (including retries) has failed.
    pub fn open(config: Config) -> Result<Self> {
        Self::open_inner(config, None)
    }

    /// Open a mock session with a programmable responder. Forces
    /// `Config::mock`.
    pub fn open_with_responder(mut config: Config, responder: MockResponder) -> Result<Self> {
        config.mock = true;
        Self::open_inner(config, Some(responder))
    }

    fn open_inner(config: Config, responder: Option<MockResponder>) -> Result<Self> {
        config
            .validate()
            .map_err(|err| PwshBridgeError::InvalidRequest(err.to_string()))?;
        let id = SessionId::new();
        let budget = startup_budget(&config);

        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        let bridge = ExecutionBridge::spawn(id, config.clone(), responder, ReplySlot::Parked(tx))?;

        match rx.recv_timeout(budget) {
            Ok(Ok(info)) => Ok(Self {
                id,
                config,
                bridge,
                pid: info.pid,
            }),
            Ok(Err(err)) => Err(err),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(PwshBridgeError::Process(
                "session event loop terminated during startup".into(),
            )),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                bridge.force_teardown();
                Err(PwshBridgeError::Timeout {
                    phase: TimeoutPhase::Startup,
                    limit: budget,
                })
            }
        }
    }

    /// Open a session from async context.
    pub async fn open_async(config: Config) -> Result<Self> {
        Self::open_async_inner(config, None).await
    }

    /// Async variant of [`Session::open_with_responder`].
    pub async fn open_async_with_responder(
        mut config: Config,
        responder: MockResponder,
    ) -> Result<Self> {
        config.mock = true;
        Self::open_async_inner(config, Some(responder)).await
    }

    async fn open_async_inner(config: Config, responder: Option<MockResponder>) -> Result<Self> {
        config
            .validate()
            .map_err(|err| PwshBridgeError::InvalidRequest(err.to_string()))?;
        let id = SessionId::new();
        let budget = startup_budget(&config);

        let (tx, rx) = oneshot::channel();
        let bridge = ExecutionBridge::spawn(id, config.clone(), responder, ReplySlot::Pending(tx))?;

        match tokio::time::timeout(budget, rx).await {
            Ok(Ok(startup)) => startup.map(|info| Self {
                id,
                config,
                bridge,
                pid: info.pid,
            }),
            Ok(Err(_)) => Err(PwshBridgeError::Process(
                "session event loop terminated during startup".into(),
            )),
            Err(_) => {
                bridge.force_teardown();
                Err(PwshBridgeError::Timeout {
                    phase: TimeoutPhase::Startup,
                    limit: budget,
                })
            }
        }
    }

    // ---- blocking surface -------------------------------------------------

    /// Execute a single command, blocking until its response arrives.
    pub fn execute_command(&self, text: &str) -> Result<CommandResponse> {
        self.execute(CommandRequest::new(text))
    }

    /// Execute a single command with a per-request timeout override.
    pub fn execute_command_with_timeout(
        &self,
        text: &str,
        timeout: Duration,
    ) -> Result<CommandResponse> {
        self.execute(CommandRequest::new(text).with_timeout(timeout))
    }

    /// Execute a multi-line script, blocking until its response arrives.
    pub fn execute_script(&self, script: &str) -> Result<CommandResponse> {
        self.execute(CommandRequest::script(script))
    }

    /// Execute a multi-line script with a per-request timeout override.
    pub fn execute_script_with_timeout(
        &self,
        script: &str,
        timeout: Duration,
    ) -> Result<CommandResponse> {
        self.execute(CommandRequest::script(script).with_timeout(timeout))
    }

    /// Run several commands sequentially on this session, stopping at the
    /// first error.
    pub fn execute_commands(&self, commands: &[&str]) -> Result<Vec<CommandResponse>> {
        let mut responses = Vec::with_capacity(commands.len());
        for command in commands {
            responses.push(self.execute_command(command)?);
        }
        Ok(responses)
    }

    /// Execute a fully-built request, blocking until its response arrives.
    ///
    /// The effective timeout (override or session default) is enforced by
    /// the event loop, measured from submission, so queue time counts
    /// against the request's own budget. The parked thread additionally
    /// grants a short forced-teardown window; if the loop fails to answer
    /// inside it, the session and its subprocess are torn down rather than
    /// left ambiguous.
    pub fn execute(&self, request: CommandRequest) -> Result<CommandResponse> {
        request.validate()?;
        let effective = request.timeout.unwrap_or(self.config.timeouts.command());

        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.enqueue_execute(request, effective, ReplySlot::Parked(tx))?;

        match rx.recv_timeout(effective + FORCED_TEARDOWN_WINDOW) {
            Ok(result) => result,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(PwshBridgeError::Process(
                "session event loop terminated before replying".into(),
            )),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                debug!(session = %self.id, "loop missed the forced-teardown window");
                self.bridge.force_teardown();
                Err(PwshBridgeError::Timeout {
                    phase: TimeoutPhase::Command,
                    limit: effective,
                })
            }
        }
    }

    // ---- non-blocking surface ---------------------------------------------

    /// Submit a command without blocking; await the returned handle for the
    /// response.
    pub fn submit_command(&self, text: &str) -> Result<PendingCommand> {
        self.submit(CommandRequest::new(text))
    }

    /// Submit a multi-line script without blocking.
    pub fn submit_script(&self, script: &str) -> Result<PendingCommand> {
        self.submit(CommandRequest::script(script))
    }

    /// Submit a fully-built request without blocking.
    ///
    /// Requests queue FIFO behind any outstanding command; ordering across
    /// blocking and non-blocking callers is submission order.
    pub fn submit(&self, request: CommandRequest) -> Result<PendingCommand> {
        request.validate()?;
        let effective = request.timeout.unwrap_or(self.config.timeouts.command());
        let token = request.token;

        let (tx, rx) = oneshot::channel();
        self.enqueue_execute(request, effective, ReplySlot::Pending(tx))?;
        Ok(PendingCommand::new(rx, token))
    }

    fn enqueue_execute(
        &self,
        request: CommandRequest,
        effective: Duration,
        reply: ReplySlot<CommandResponse>,
    ) -> Result<()> {
        let job = Job::Execute {
            request,
            effective,
            enqueued_at: Instant::now(),
            reply,
        };
        self.bridge
            .enqueue(job)
            .map_err(|_| PwshBridgeError::Process("session event loop is gone".into()))
    }

    // ---- unchecked surface ------------------------------------------------

    /// Panicking variant of [`Session::execute_command`] for callers that
    /// prefer unchecked propagation. Reports the same error kind and
    /// message as the Result surface.
    ///
    /// # Panics
    ///
    /// Panics if the command fails for any reason.
    pub fn execute_command_unchecked(&self, text: &str) -> CommandResponse {
        match self.execute_command(text) {
            Ok(response) => response,
            Err(err) => panic!("powershell command failed: {err}"),
        }
    }

    /// Panicking variant of [`Session::execute_script`].
    ///
    /// # Panics
    ///
    /// Panics if the script fails for any reason.
    pub fn execute_script_unchecked(&self, script: &str) -> CommandResponse {
        match self.execute_script(script) {
            Ok(response) => response,
            Err(err) => panic!("powershell script failed: {err}"),
        }
    }

    // ---- shutdown ---------------------------------------------------------

    /// Close the session gracefully, blocking until the subprocess has been
    /// released. Closing twice is a no-op the second time; closing a
    /// faulted session still releases the underlying process.
    pub fn close(&self) -> Result<()> {
        self.close_with_timeout(self.config.timeouts.shutdown())
    }

    /// Close with an explicit grace period before the subprocess is killed.
    pub fn close_with_timeout(&self, grace: Duration) -> Result<()> {
        if self.state() == SessionState::Closed {
            return Ok(());
        }

        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        if self
            .bridge
            .enqueue(Job::Close {
                grace,
                reply: ReplySlot::Parked(tx),
            })
            .is_err()
        {
            // Loop already gone; the subprocess has been released.
            return Ok(());
        }

        match rx.recv_timeout(grace + FORCED_TEARDOWN_WINDOW) {
            Ok(result) => result,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Ok(()),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                self.bridge.force_teardown();
                Err(PwshBridgeError::Process(
                    "shutdown did not complete in time; forced teardown".into(),
                ))
            }
        }
    }

    /// Close from async context.
    pub async fn close_async(&self) -> Result<()> {
        if self.state() == SessionState::Closed {
            return Ok(());
        }
        self.submit_close().wait().await
    }

    /// Enqueue a close without blocking; await the returned handle for the
    /// shutdown result.
    pub fn submit_close(&self) -> PendingClose {
        let grace = self.config.timeouts.shutdown();
        let (tx, rx) = oneshot::channel();
        if let Err(Job::Close { reply, .. }) = self.bridge.enqueue(Job::Close {
            grace,
            reply: ReplySlot::Pending(tx),
        }) {
            // Loop already gone; report the close as already done.
            reply.deliver(Ok(()));
        }
        PendingClose::new(rx)
    }

    // ---- accessors --------------------------------------------------------

    /// Unique identifier of this session.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Snapshot of the session lifecycle state.
    pub fn state(&self) -> SessionState {
        self.bridge.state()
    }

    /// OS process ID of the interpreter, if a real subprocess is running.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the session can still make progress.
    pub fn is_alive(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Starting | SessionState::Ready | SessionState::Busy
        )
    }

    /// The configuration this session was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

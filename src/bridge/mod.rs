//! The per-session event loop and the layer bridging blocking and
//! non-blocking callers onto it.
//!
//! Exactly one cooperative loop exists per session, running a
//! `current_thread` tokio runtime on a dedicated worker thread. All channel
//! I/O happens on that loop; jobs are executed one at a time in submission
//! order, so single-flight holds by construction and the two call styles can
//! never race each other. A second call arriving while one is outstanding
//! queues FIFO rather than being rejected.
//!
//! A blocking caller parks on a rendezvous channel; a non-blocking caller
//! holds a pending handle. Timeouts are enforced loop-side against the
//! caller's submission instant, so time spent queued counts against a
//! request's own budget, never a later caller's.

mod pending;

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{self, DynRead, DynWrite, SessionChannel};
use crate::config::Config;
use crate::error::{PwshBridgeError, TimeoutPhase};
use crate::mock::{self, MockHandle, MockResponder};
use crate::process::{ExitInfo, ProcessSupervisor};
use crate::retry::{RetryPolicy, RetryState};
use crate::session::{CommandRequest, CommandResponse, SessionId, SessionState};
use crate::Result;

pub use pending::{PendingClose, PendingCommand};
pub(crate) use pending::ReplySlot;

/// Extra wait a parked caller grants the loop beyond the operation's own
/// timeout before declaring the loop wedged and forcing teardown. A stuck
/// command must never silently continue consuming a future caller's
/// response.
pub(crate) const FORCED_TEARDOWN_WINDOW: Duration = Duration::from_secs(2);

/// Probe framed through the real protocol path to confirm the interpreter
/// responds after spawn. Also yields the interpreter version for the log.
const READY_PROBE: &str = "$PSVersionTable.PSVersion.ToString()";

/// Result of a successful startup, reported to the opener.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StartupInfo {
    pub(crate) pid: Option<u32>,
}

/// A unit of work enqueued onto the loop.
pub(crate) enum Job {
    Execute {
        request: CommandRequest,
        /// Effective timeout: the request override or the session default.
        effective: Duration,
        /// When the caller enqueued; queue time counts against `effective`.
        enqueued_at: Instant,
        reply: ReplySlot<CommandResponse>,
    },
    Close {
        grace: Duration,
        reply: ReplySlot<()>,
    },
}

/// Worst-case wall-clock budget for startup including retries, used by
/// openers parking on the startup reply.
pub(crate) fn startup_budget(config: &Config) -> Duration {
    let policy = RetryPolicy::from_config(&config.retry);
    let attempts = config.retry.max_attempts.max(1);
    let mut budget = config.timeouts.startup().saturating_mul(attempts);
    for attempt in 1..attempts {
        budget += policy.max_delay_for(attempt);
    }
    budget + FORCED_TEARDOWN_WINDOW
}

/// Owns the loop thread of one session and carries jobs to it.
#[derive(Debug)]
pub struct ExecutionBridge {
    job_tx: mpsc::UnboundedSender<Job>,
    state_rx: watch::Receiver<SessionState>,
    cancel: CancellationToken,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ExecutionBridge {
    /// Spawn the loop thread and begin startup. The startup outcome is
    /// delivered through `startup_reply`.
    pub(crate) fn spawn(
        id: SessionId,
        config: Config,
        responder: Option<MockResponder>,
        startup_reply: ReplySlot<StartupInfo>,
    ) -> Result<Self> {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();

        let worker = thread::Builder::new()
            .name(format!("{id}-loop"))
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => {
                        let session_loop = SessionLoop {
                            id,
                            config,
                            responder,
                            job_rx,
                            state_tx,
                            state: SessionState::Starting,
                            cancel: loop_cancel,
                        };
                        runtime.block_on(session_loop.run(startup_reply));
                    }
                    Err(err) => {
                        error!(session = %id, %err, "failed to build session runtime");
                        let _ = state_tx.send(SessionState::Faulted);
                        startup_reply.deliver(Err(PwshBridgeError::Startup(format!(
                            "failed to build session runtime: {err}"
                        ))));
                    }
                }
            })
            .map_err(|err| {
                PwshBridgeError::Startup(format!("failed to spawn session thread: {err}"))
            })?;

        Ok(Self {
            job_tx,
            state_rx,
            cancel,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue a job in FIFO order. Never blocks and never rejects while
    /// the loop is reachable; returns the job back if the loop is gone.
    pub(crate) fn enqueue(&self, job: Job) -> std::result::Result<(), Job> {
        self.job_tx.send(job).map_err(|err| err.0)
    }

    /// Snapshot of the session state, as last published by the loop.
    pub(crate) fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Request immediate teardown of the loop and its subprocess.
    pub(crate) fn force_teardown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ExecutionBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

/// The interpreter backend behind the channel: a real subprocess or the
/// in-process mock. Same lifecycle surface either way.
enum Backend {
    Process(ProcessSupervisor),
    Mock(MockHandle),
}

impl Backend {
    fn pid(&self) -> Option<u32> {
        match self {
            Backend::Process(supervisor) => supervisor.pid(),
            Backend::Mock(_) => None,
        }
    }

    async fn wait_exit(&mut self) -> ExitInfo {
        match self {
            Backend::Process(supervisor) => supervisor.wait_exit().await,
            Backend::Mock(handle) => handle.wait_exit().await,
        }
    }

    async fn terminate(&mut self, grace: Duration) -> Result<ExitInfo> {
        match self {
            Backend::Process(supervisor) => supervisor.terminate(grace).await,
            Backend::Mock(handle) => handle.terminate(grace).await,
        }
    }
}

type LoopChannel = SessionChannel<DynWrite, DynRead>;

/// Why the serving phase ended.
enum ServeEnd {
    /// Graceful close; keep answering late jobs.
    Closed,
    /// Unrecoverable fault; keep answering late jobs.
    Faulted,
    /// Every handle was dropped; nobody is left to answer.
    Abandoned,
}

/// State owned by the event loop thread. Session state is mutated only
/// here; callers read snapshots through the watch channel.
struct SessionLoop {
    id: SessionId,
    config: Config,
    responder: Option<MockResponder>,
    job_rx: mpsc::UnboundedReceiver<Job>,
    state_tx: watch::Sender<SessionState>,
    state: SessionState,
    cancel: CancellationToken,
}

impl SessionLoop {
    async fn run(mut self, startup_reply: ReplySlot<StartupInfo>) {
        let (mut backend, chan) = match self.start_with_retry().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(session = %self.id, %err, "startup failed");
                self.set_state(SessionState::Faulted);
                startup_reply.deliver(Err(err));
                self.drain(None).await;
                return;
            }
        };

        info!(session = %self.id, pid = ?backend.pid(), "session ready");
        self.set_state(SessionState::Ready);
        startup_reply.deliver(Ok(StartupInfo { pid: backend.pid() }));

        match self.serve(&mut backend, chan).await {
            ServeEnd::Abandoned => {}
            ServeEnd::Closed | ServeEnd::Faulted => self.drain(Some(backend)).await,
        }
    }

    /// Startup with capped exponential backoff on transient failures.
    async fn start_with_retry(&mut self) -> Result<(Backend, LoopChannel)> {
        let policy = RetryPolicy::from_config(&self.config.retry);
        let mut retry = RetryState::new();
        loop {
            match self.start_backend().await {
                Ok(pair) => return Ok(pair),
                Err(err) => match policy.backoff(&mut retry, &err) {
                    Some(delay) => {
                        warn!(
                            session = %self.id,
                            attempt = retry.attempts(),
                            ?delay,
                            %err,
                            "startup failed; backing off"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.cancel.cancelled() => return Err(err),
                        }
                    }
                    // Exhausted or not transient: surface the last error
                    // unchanged.
                    None => return Err(err),
                },
            }
        }
    }

    /// Spawn the backend and run the readiness probe through the real
    /// framing path.
    async fn start_backend(&self) -> Result<(Backend, LoopChannel)> {
        let (backend, stdin, stdout, stderr) = if self.config.mock {
            let responder = self.responder.clone().unwrap_or_default();
            let (handle, stdin, stdout, stderr) = mock::spawn_interpreter(responder);
            (Backend::Mock(handle), stdin, stdout, stderr)
        } else {
            let (supervisor, streams) = ProcessSupervisor::start(&self.config)?;
            (
                Backend::Process(supervisor),
                Box::new(streams.stdin) as DynWrite,
                Box::new(streams.stdout) as DynRead,
                Box::new(streams.stderr) as DynRead,
            )
        };

        let stderr_rx = channel::spawn_pump(stderr, self.config.encoding);
        let mut chan = SessionChannel::new(stdin, stdout, stderr_rx, self.config.encoding);

        let probe = CommandRequest::new(READY_PROBE);
        let startup_timeout = self.config.timeouts.startup();
        match timeout(startup_timeout, chan.submit(&probe)).await {
            Ok(Ok(response)) if response.success => {
                debug!(
                    session = %self.id,
                    version = response.output_trimmed(),
                    "interpreter ready"
                );
                Ok((backend, chan))
            }
            Ok(Ok(response)) => Err(PwshBridgeError::Startup(format!(
                "readiness probe reported failure: {}",
                response.stderr.trim()
            ))),
            // A process that dies during the probe is a startup failure,
            // not a mid-session death.
            Ok(Err(PwshBridgeError::Process(msg))) => Err(PwshBridgeError::Startup(format!(
                "interpreter exited during startup: {msg}"
            ))),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(PwshBridgeError::Timeout {
                phase: TimeoutPhase::Startup,
                limit: startup_timeout,
            }),
        }
    }

    /// Serve jobs one at a time until close, fault, or abandonment.
    async fn serve(&mut self, backend: &mut Backend, chan: LoopChannel) -> ServeEnd {
        let mut chan = chan;
        loop {
            tokio::select! {
                job = self.job_rx.recv() => match job {
                    None => {
                        debug!(session = %self.id, "all handles dropped; tearing down");
                        drop(chan);
                        let _ = backend.terminate(Duration::ZERO).await;
                        return ServeEnd::Abandoned;
                    }
                    Some(Job::Execute { request, effective, enqueued_at, reply }) => {
                        let remaining = effective.saturating_sub(enqueued_at.elapsed());
                        if remaining.is_zero() {
                            // The request spent its whole budget queued; the
                            // channel was never touched, so the session
                            // stays usable.
                            debug!(session = %self.id, token = %request.token, "request timed out in queue");
                            reply.deliver(Err(PwshBridgeError::Timeout {
                                phase: TimeoutPhase::Command,
                                limit: effective,
                            }));
                            continue;
                        }

                        self.set_state(SessionState::Busy);
                        debug!(session = %self.id, token = %request.token, "executing command");

                        let outcome = tokio::select! {
                            submitted = timeout(remaining, chan.submit(&request)) => match submitted {
                                Ok(done) => done,
                                Err(_) => Err(PwshBridgeError::Timeout {
                                    phase: TimeoutPhase::Command,
                                    limit: effective,
                                }),
                            },
                            exit = backend.wait_exit() => Err(PwshBridgeError::Process(format!(
                                "interpreter exited mid-command with code {:?}",
                                exit.code
                            ))),
                            _ = self.cancel.cancelled() => Err(PwshBridgeError::Process(
                                "session torn down mid-command".into(),
                            )),
                        };

                        match outcome {
                            Ok(response) if response.success => {
                                self.set_state(SessionState::Ready);
                                reply.deliver(Ok(response));
                            }
                            Ok(response) => {
                                // The interpreter ran the command and
                                // reported failure; the protocol is still
                                // in sync, so the session stays usable and
                                // the command is never retried.
                                self.set_state(SessionState::Ready);
                                reply.deliver(Err(PwshBridgeError::Execution(Box::new(response))));
                            }
                            Err(err) => {
                                // Timeout, desync, or process death mid
                                // command: the stream position is unknown.
                                // Fail fast instead of misattributing a
                                // later response.
                                error!(session = %self.id, %err, "command failed; faulting session");
                                self.set_state(SessionState::Faulted);
                                reply.deliver(Err(err));
                                drop(chan);
                                let _ = backend.terminate(Duration::ZERO).await;
                                return ServeEnd::Faulted;
                            }
                        }
                    }
                    Some(Job::Close { grace, reply }) => {
                        self.set_state(SessionState::Closing);
                        // Closing stdin first lets the interpreter exit
                        // cleanly within the grace period.
                        drop(chan);
                        match backend.terminate(grace).await {
                            Ok(info) => {
                                info!(
                                    session = %self.id,
                                    code = ?info.code,
                                    forced = info.forced,
                                    "session closed"
                                );
                                self.set_state(SessionState::Closed);
                                reply.deliver(Ok(()));
                            }
                            Err(err) => {
                                error!(session = %self.id, %err, "shutdown failed");
                                self.set_state(SessionState::Faulted);
                                reply.deliver(Err(err));
                            }
                        }
                        return ServeEnd::Closed;
                    }
                },
                exit = backend.wait_exit() => {
                    error!(session = %self.id, code = ?exit.code, "interpreter exited unexpectedly");
                    self.set_state(SessionState::Faulted);
                    return ServeEnd::Faulted;
                }
                _ = self.cancel.cancelled() => {
                    warn!(session = %self.id, "forced teardown requested");
                    self.set_state(SessionState::Faulted);
                    drop(chan);
                    let _ = backend.terminate(Duration::ZERO).await;
                    return ServeEnd::Faulted;
                }
            }
        }
    }

    /// Answer remaining and future jobs after the session reached a
    /// terminal state, until every handle is gone.
    async fn drain(&mut self, mut backend: Option<Backend>) {
        loop {
            let job = tokio::select! {
                job = self.job_rx.recv() => job,
                _ = self.cancel.cancelled() => None,
            };
            match job {
                None => {
                    if let Some(backend) = backend.as_mut() {
                        let _ = backend.terminate(Duration::ZERO).await;
                    }
                    return;
                }
                Some(Job::Execute { reply, .. }) => {
                    reply.deliver(Err(self.unavailable()));
                }
                Some(Job::Close { grace, reply }) => {
                    // Closing twice is a no-op; closing a faulted session
                    // still releases the underlying process.
                    let result = match backend.as_mut() {
                        Some(backend) => backend.terminate(grace).await.map(|_| ()),
                        None => Ok(()),
                    };
                    if result.is_ok() && self.state == SessionState::Faulted {
                        self.set_state(SessionState::Closed);
                    }
                    reply.deliver(result);
                }
            }
        }
    }

    fn set_state(&mut self, next: SessionState) {
        match self.state.transition_to(next) {
            Ok(()) => {
                let _ = self.state_tx.send(next);
            }
            Err(err) => debug!(session = %self.id, %err, "suppressed state transition"),
        }
    }

    fn unavailable(&self) -> PwshBridgeError {
        match self.state {
            SessionState::Closing | SessionState::Closed => {
                PwshBridgeError::Process("session is closed".into())
            }
            SessionState::Faulted => PwshBridgeError::Process("session is faulted".into()),
            _ => PwshBridgeError::Process("session is unavailable".into()),
        }
    }
}

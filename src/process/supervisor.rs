//! OS-level lifecycle of one interpreter subprocess.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::PwshBridgeError;
use crate::Result;

/// The three byte streams of a freshly spawned interpreter, consumed by the
/// session channel. The supervisor never touches them again.
#[derive(Debug)]
pub struct ProcessStreams {
    /// Write side of the interpreter's stdin.
    pub stdin: ChildStdin,
    /// Read side of the interpreter's stdout.
    pub stdout: ChildStdout,
    /// Read side of the interpreter's stderr.
    pub stderr: ChildStderr,
}

/// How the subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Whether the process had to be killed after the grace period.
    pub forced: bool,
}

/// Owns exactly one subprocess's OS-level lifecycle: spawn, liveness,
/// exit monitoring, and termination.
#[derive(Debug)]
pub struct ProcessSupervisor {
    child: Child,
    pid: Option<u32>,
    exit: Option<ExitInfo>,
}

impl ProcessSupervisor {
    /// Launch the configured executable with piped stdio.
    ///
    /// The child is spawned with `kill_on_drop` so an abandoned supervisor
    /// cannot leak a live interpreter. Spawn failure is terminal for the
    /// session and reported as a `Startup` error.
    pub fn start(config: &Config) -> Result<(Self, ProcessStreams)> {
        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            PwshBridgeError::Startup(format!(
                "failed to spawn {}: {err}",
                config.executable.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PwshBridgeError::Startup("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PwshBridgeError::Startup("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PwshBridgeError::Startup("failed to capture stderr".into()))?;

        let pid = child.id();
        info!(pid, executable = %config.executable.display(), "interpreter spawned");

        Ok((
            Self {
                child,
                pid,
                exit: None,
            },
            ProcessStreams {
                stdin,
                stdout,
                stderr,
            },
        ))
    }

    /// OS process ID, if the process has not been reaped yet.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking liveness probe.
    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(ExitInfo {
                    code: status.code(),
                    forced: false,
                });
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(%err, "liveness probe failed");
                false
            }
        }
    }

    /// Resolve when the subprocess exits. Cached after the first
    /// completion, so the loop may poll this repeatedly.
    pub async fn wait_exit(&mut self) -> ExitInfo {
        if let Some(info) = self.exit {
            return info;
        }
        let info = match self.child.wait().await {
            Ok(status) => ExitInfo {
                code: status.code(),
                forced: false,
            },
            Err(err) => {
                warn!(%err, "waiting for interpreter exit failed");
                ExitInfo {
                    code: None,
                    forced: false,
                }
            }
        };
        self.exit = Some(info);
        info
    }

    /// Terminate the subprocess.
    ///
    /// The caller closes stdin first (by dropping the session channel) so
    /// the interpreter can exit cleanly; this method then waits up to
    /// `grace` before escalating to a kill. Terminating an already-exited
    /// process returns the cached exit info.
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitInfo> {
        if let Some(info) = self.exit {
            debug!(?info, "terminate on already-exited process");
            return Ok(info);
        }

        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                let info = ExitInfo {
                    code: status.code(),
                    forced: false,
                };
                self.exit = Some(info);
                debug!(code = ?info.code, "interpreter exited within grace period");
                Ok(info)
            }
            Ok(Err(err)) => Err(PwshBridgeError::Process(format!(
                "waiting for interpreter exit failed: {err}"
            ))),
            Err(_) => {
                warn!(?grace, "grace period elapsed; killing interpreter");
                self.child
                    .kill()
                    .await
                    .map_err(|err| PwshBridgeError::Process(format!("kill failed: {err}")))?;
                let status = self.child.wait().await.ok();
                let info = ExitInfo {
                    code: status.and_then(|s| s.code()),
                    forced: true,
                };
                self.exit = Some(info);
                Ok(info)
            }
        }
    }
}

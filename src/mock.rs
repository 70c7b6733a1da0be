//! Mock mode: an in-process canned responder standing in for the real
//! interpreter.
//!
//! When `Config::mock` is set, the session spawns no OS process. Instead an
//! in-memory task speaks the same framing protocol over duplex pipes, so
//! every layer above the streams (channel, bridge, session) runs its real
//! code path. Used by testing and tooling layers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::channel::{DynRead, DynWrite, EPILOGUE_GUARD};
use crate::process::ExitInfo;
use crate::Result;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Canned reply for one command.
#[derive(Debug, Clone, Default)]
pub struct MockReply {
    /// Text echoed to stdout before the sentinel.
    pub stdout: String,
    /// Text echoed to stderr.
    pub stderr: String,
    /// Whether the status line reports success. Defaults to failure; use
    /// the constructors.
    pub ok: bool,
    /// Artificial latency before the reply is produced.
    pub delay: Option<Duration>,
}

impl MockReply {
    /// Successful reply with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ok: true,
            ..Default::default()
        }
    }

    /// Successful reply with no output.
    pub fn empty() -> Self {
        Self::ok("")
    }

    /// Failed reply with the given stderr.
    pub fn failure(stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            ok: false,
            ..Default::default()
        }
    }

    /// Add stderr text to the reply.
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Delay the reply, simulating a slow command.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Maps command text to canned replies and records what was asked.
///
/// Rules match on exact trimmed command text, first match wins. Without a
/// matching rule, `echo <text>` / `Write-Output <text>` are emulated so
/// round-trip tests read naturally; anything else gets the fallback reply
/// (empty success by default).
#[derive(Debug, Clone, Default)]
pub struct MockResponder {
    rules: Vec<(String, MockReply)>,
    fallback: Option<MockReply>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockResponder {
    /// Responder with no rules: echo emulation plus empty-success fallback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule matching exact trimmed command text.
    pub fn on(mut self, command: impl Into<String>, reply: MockReply) -> Self {
        self.rules.push((command.into(), reply));
        self
    }

    /// Replace the fallback reply for unmatched commands.
    pub fn with_fallback(mut self, reply: MockReply) -> Self {
        self.fallback = Some(reply);
        self
    }

    /// Resolve the reply for a command, recording the call.
    pub fn reply_for(&self, command: &str) -> MockReply {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(command.to_string());
        }
        for (pattern, reply) in &self.rules {
            if pattern == command {
                return reply.clone();
            }
        }
        if let Some(reply) = builtin_echo(command) {
            return reply;
        }
        self.fallback.clone().unwrap_or_else(MockReply::empty)
    }

    /// Commands seen so far, in submission order. Shared across clones.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

fn builtin_echo(command: &str) -> Option<MockReply> {
    let rest = command
        .strip_prefix("echo ")
        .or_else(|| command.strip_prefix("Write-Output "))?;
    Some(MockReply::ok(rest.trim().trim_matches('\'').trim_matches('"')))
}

/// Handle to the mock interpreter task, mirroring the supervisor's
/// lifecycle surface.
pub(crate) struct MockHandle {
    task: Option<JoinHandle<()>>,
    exit: Option<ExitInfo>,
}

impl MockHandle {
    /// Non-blocking liveness probe.
    pub(crate) fn is_alive(&self) -> bool {
        self.exit.is_none() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Resolve when the interpreter task ends. Cached after first
    /// completion.
    pub(crate) async fn wait_exit(&mut self) -> ExitInfo {
        if let Some(info) = self.exit {
            return info;
        }
        if let Some(task) = self.task.as_mut() {
            let _ = task.await;
        }
        let info = ExitInfo {
            code: Some(0),
            forced: false,
        };
        self.exit = Some(info);
        info
    }

    /// Wait up to `grace` for the task to end on its own (it exits when
    /// stdin closes), then abort it. Idempotent.
    pub(crate) async fn terminate(&mut self, grace: Duration) -> Result<ExitInfo> {
        if let Some(info) = self.exit {
            return Ok(info);
        }
        let info = match self.task.take() {
            Some(mut task) => match tokio::time::timeout(grace, &mut task).await {
                Ok(_) => ExitInfo {
                    code: Some(0),
                    forced: false,
                },
                Err(_) => {
                    task.abort();
                    let _ = task.await;
                    ExitInfo {
                        code: None,
                        forced: true,
                    }
                }
            },
            None => ExitInfo {
                code: Some(0),
                forced: false,
            },
        };
        self.exit = Some(info);
        Ok(info)
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Spawn the mock interpreter onto the current runtime and hand back the
/// controller-side ends of its three streams.
pub(crate) fn spawn_interpreter(
    responder: MockResponder,
) -> (MockHandle, DynWrite, DynRead, DynRead) {
    let (stdin_ours, stdin_theirs) = tokio::io::duplex(PIPE_CAPACITY);
    let (stdout_theirs, stdout_ours) = tokio::io::duplex(PIPE_CAPACITY);
    let (stderr_theirs, stderr_ours) = tokio::io::duplex(PIPE_CAPACITY);

    let task = tokio::spawn(run_interpreter(
        responder,
        stdin_theirs,
        stdout_theirs,
        stderr_theirs,
    ));

    (
        MockHandle {
            task: Some(task),
            exit: None,
        },
        Box::new(stdin_ours),
        Box::new(stdout_ours),
        Box::new(stderr_ours),
    )
}

/// The interpreter side of the conversation: accumulate command lines until
/// the epilogue, then produce the canned reply framed exactly like the real
/// interpreter would.
async fn run_interpreter(
    responder: MockResponder,
    stdin: DuplexStream,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
) {
    let mut reader = BufReader::new(stdin);
    let mut pending: Vec<String> = Vec::new();

    loop {
        let Some(line) = read_line(&mut reader).await else {
            debug!("mock interpreter: stdin closed");
            break;
        };

        if line != EPILOGUE_GUARD {
            pending.push(line);
            continue;
        }

        // Epilogue: sentinel echo line, then the status expression line.
        let Some(sentinel_line) = read_line(&mut reader).await else {
            break;
        };
        let Some(_status_expr) = read_line(&mut reader).await else {
            break;
        };
        let Some(sentinel) = parse_sentinel(&sentinel_line) else {
            debug!(line = %sentinel_line, "mock interpreter: malformed epilogue");
            break;
        };

        let command = pending.join("\n");
        pending.clear();
        let reply = responder.reply_for(command.trim());

        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }

        for line in reply.stderr.lines() {
            if stderr
                .write_all(format!("{line}\n").as_bytes())
                .await
                .is_err()
            {
                return;
            }
        }

        let mut out = String::new();
        for line in reply.stdout.lines() {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&sentinel);
        out.push('\n');
        out.push_str(if reply.ok { "0" } else { "1" });
        out.push('\n');
        if stdout.write_all(out.as_bytes()).await.is_err() {
            return;
        }
    }
}

async fn read_line(reader: &mut BufReader<DuplexStream>) -> Option<String> {
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

/// Extract the sentinel from its echo line: `Write-Output '<sentinel>'`.
fn parse_sentinel(line: &str) -> Option<String> {
    line.strip_prefix("Write-Output '")
        .and_then(|rest| rest.strip_suffix('\''))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::frame_command;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_reply_constructors() {
        let ok = MockReply::ok("out");
        assert!(ok.ok);
        assert_eq!(ok.stdout, "out");

        let failure = MockReply::failure("bad");
        assert!(!failure.ok);
        assert_eq!(failure.stderr, "bad");

        let delayed = MockReply::empty().with_delay(Duration::from_millis(5));
        assert_eq!(delayed.delay, Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_responder_rules_and_fallback() {
        let responder = MockResponder::new()
            .on("Get-Date", MockReply::ok("2024-01-01"))
            .with_fallback(MockReply::failure("unknown command"));

        assert_eq!(responder.reply_for("Get-Date").stdout, "2024-01-01");
        assert!(!responder.reply_for("Get-Location").ok);
        assert_eq!(responder.calls(), vec!["Get-Date", "Get-Location"]);
    }

    #[test]
    fn test_responder_echo_emulation() {
        let responder = MockResponder::new();
        assert_eq!(responder.reply_for("echo hello").stdout, "hello");
        assert_eq!(responder.reply_for("echo 'quoted'").stdout, "quoted");
        assert_eq!(responder.reply_for("Write-Output hi").stdout, "hi");
    }

    #[test]
    fn test_responder_calls_shared_across_clones() {
        let responder = MockResponder::new();
        let clone = responder.clone();
        clone.reply_for("pwd");
        assert_eq!(responder.calls(), vec!["pwd"]);
    }

    #[test]
    fn test_parse_sentinel() {
        assert_eq!(
            parse_sentinel("Write-Output '__PWSH_EOC_ab__'").as_deref(),
            Some("__PWSH_EOC_ab__")
        );
        assert!(parse_sentinel("Write-Output 0").is_none());
        assert!(parse_sentinel("echo hi").is_none());
    }

    #[tokio::test]
    async fn test_interpreter_round_trip_on_the_wire() {
        let responder = MockResponder::new().on("Get-Date", MockReply::ok("2024-01-01"));
        let (_handle, mut stdin, stdout, _stderr) = spawn_interpreter(responder);

        let framed = frame_command("Get-Date", "__PWSH_EOC_test__");
        tokio::io::AsyncWriteExt::write_all(&mut stdin, framed.as_bytes())
            .await
            .unwrap();

        let mut reader = tokio::io::BufReader::new(stdout);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "2024-01-01\n");
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "__PWSH_EOC_test__\n");
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "0\n");
    }

    #[tokio::test]
    async fn test_interpreter_exits_on_stdin_close() {
        let (mut handle, stdin, _stdout, _stderr) = spawn_interpreter(MockResponder::new());
        assert!(handle.is_alive());

        drop(stdin);

        let info = handle.wait_exit().await;
        assert_eq!(info.code, Some(0));
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_interpreter_failure_reply_on_the_wire() {
        let responder =
            MockResponder::new().on("Remove-Item x", MockReply::failure("not found"));
        let (_handle, mut stdin, stdout, stderr) = spawn_interpreter(responder);

        let framed = frame_command("Remove-Item x", "__PWSH_EOC_f__");
        tokio::io::AsyncWriteExt::write_all(&mut stdin, framed.as_bytes())
            .await
            .unwrap();

        let mut out_reader = tokio::io::BufReader::new(stdout);
        let mut line = String::new();
        out_reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "__PWSH_EOC_f__\n");
        line.clear();
        out_reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "1\n");

        let mut err_text = String::new();
        drop(stdin);
        let mut err_reader = tokio::io::BufReader::new(stderr);
        err_reader.read_to_string(&mut err_text).await.unwrap();
        assert_eq!(err_text, "not found\n");
    }
}

//! Output-framing protocol over the interpreter's stdio streams.
//!
//! PowerShell has no machine-readable end-of-output marker, so each request
//! is framed with a sentinel: the command text is followed by an epilogue
//! that captures `$?`, echoes a per-request random sentinel line, and then
//! echoes a one-line exit status. The channel reads stdout until the
//! sentinel reappears; everything before it is the command's output.
//!
//! Desync policy is fail-fast: if the status line after the sentinel is not
//! `0` or `1` (for example because legitimate output echoed the sentinel
//! early), or the sentinel never arrives within the effective timeout, the
//! session is faulted rather than guessing at where the response ended.

mod stderr;

use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::TextEncoding;
use crate::error::PwshBridgeError;
use crate::session::{CommandRequest, CommandResponse};
use crate::Result;

pub(crate) use stderr::spawn_pump;

/// First epilogue line; captures the command's `$?` before the sentinel
/// echo can overwrite it.
pub(crate) const EPILOGUE_GUARD: &str = "$script:__pwshBridgeOk = $?";

/// Window after stdout's sentinel during which late stderr lines are still
/// attributed to the same command (the interpreter does not order stderr
/// relative to stdout).
const STDERR_GRACE: Duration = Duration::from_millis(50);

/// Type-erased stdin stream, so the channel serves both real child pipes
/// and in-memory mock pipes.
pub(crate) type DynWrite = Box<dyn AsyncWrite + Send + Unpin>;
/// Type-erased stdout stream.
pub(crate) type DynRead = Box<dyn AsyncRead + Send + Unpin>;

/// Build the framed submission for a request: command text plus the
/// sentinel/status epilogue.
pub(crate) fn frame_command(text: &str, sentinel: &str) -> String {
    let mut framed = String::with_capacity(text.len() + sentinel.len() + 128);
    framed.push_str(text);
    if !framed.ends_with('\n') {
        framed.push('\n');
    }
    framed.push_str(EPILOGUE_GUARD);
    framed.push('\n');
    framed.push_str("Write-Output '");
    framed.push_str(sentinel);
    framed.push_str("'\n");
    framed.push_str(
        "if ($script:__pwshBridgeOk) { Write-Output '0' } else { Write-Output '1' }\n",
    );
    framed
}

/// One-request-at-a-time framing protocol over a duplex byte stream.
///
/// The channel exclusively owns the subprocess's streams; no other
/// component reads or writes them. It enforces single-flight by
/// construction: `submit` borrows the channel mutably for the whole
/// request/response exchange.
pub struct SessionChannel<W, R> {
    stdin: W,
    stdout: BufReader<R>,
    stderr_rx: mpsc::UnboundedReceiver<String>,
    encoding: TextEncoding,
}

impl<W, R> SessionChannel<W, R>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    /// Create a channel over the given streams.
    ///
    /// `stderr_rx` is the output of [`spawn_pump`] running on the same
    /// runtime.
    pub(crate) fn new(
        stdin: W,
        stdout: R,
        stderr_rx: mpsc::UnboundedReceiver<String>,
        encoding: TextEncoding,
    ) -> Self {
        Self {
            stdin,
            stdout: BufReader::new(stdout),
            stderr_rx,
            encoding,
        }
    }

    /// Submit one request and read its complete response.
    ///
    /// This future does not enforce a timeout itself; the caller wraps it in
    /// one and treats expiry as protocol desync. If this future is dropped
    /// mid-read the channel's stream position is undefined and the channel
    /// must not be reused.
    pub async fn submit(&mut self, request: &CommandRequest) -> Result<CommandResponse> {
        let started = Instant::now();
        let sentinel = request.token.sentinel();
        let framed = frame_command(&request.text, &sentinel);

        // Stale stderr from before this command would be misattributed;
        // discard it before the interpreter can produce fresh lines.
        while let Ok(line) = self.stderr_rx.try_recv() {
            debug!(%line, "discarding stderr received before submission");
        }

        trace!(token = %request.token, bytes = framed.len(), "submitting command");
        self.stdin
            .write_all(framed.as_bytes())
            .await
            .map_err(PwshBridgeError::comm)?;
        self.stdin.flush().await.map_err(PwshBridgeError::comm)?;

        let mut stderr_lines = Vec::new();
        let mut stdout_lines = Vec::new();
        loop {
            let line = self.read_stdout_line().await?;
            if line == sentinel {
                break;
            }
            stdout_lines.push(line);
        }

        let status = self.read_stdout_line().await?;
        let exit_ok = match status.trim() {
            "0" => true,
            "1" => false,
            other => {
                return Err(PwshBridgeError::Communication(format!(
                    "protocol desync: expected status line after sentinel, got {other:?}"
                )));
            }
        };

        self.drain_stderr(&mut stderr_lines).await;

        let stderr_text = stderr_lines.join("\n");
        let success = exit_ok && stderr_text.is_empty();
        let response = CommandResponse {
            stdout: stdout_lines.join("\n"),
            stderr: stderr_text,
            success,
            duration: started.elapsed(),
            token: request.token,
        };
        trace!(
            token = %request.token,
            success,
            stdout_len = response.stdout.len(),
            "response assembled"
        );
        Ok(response)
    }

    /// Read one line from stdout, without its line ending.
    async fn read_stdout_line(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        let n = self
            .stdout
            .read_until(b'\n', &mut buf)
            .await
            .map_err(PwshBridgeError::comm)?;
        if n == 0 {
            return Err(PwshBridgeError::Process(
                "stdout closed before the sentinel arrived".into(),
            ));
        }
        stderr::trim_line_ending(&mut buf);
        self.encoding
            .decode(buf)
            .map_err(|err| PwshBridgeError::comm(format!("stdout is not valid utf-8: {err}")))
    }

    /// Collect everything the stderr pump buffered, plus whatever straggles
    /// in during the grace window.
    async fn drain_stderr(&mut self, lines: &mut Vec<String>) {
        while let Ok(line) = self.stderr_rx.try_recv() {
            lines.push(line);
        }
        let deadline = tokio::time::Instant::now() + STDERR_GRACE;
        loop {
            match tokio::time::timeout_at(deadline, self.stderr_rx.recv()).await {
                Ok(Some(line)) => lines.push(line),
                // Pump ended (process exit) or grace window elapsed.
                Ok(None) | Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// Build a channel plus the far ends of its pipes, simulating the
    /// subprocess side of the conversation.
    fn harness() -> (
        SessionChannel<tokio::io::DuplexStream, tokio::io::DuplexStream>,
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
    ) {
        let (stdin_ours, stdin_theirs) = tokio::io::duplex(64 * 1024);
        let (stdout_theirs, stdout_ours) = tokio::io::duplex(64 * 1024);
        let (stderr_theirs, stderr_ours) = tokio::io::duplex(64 * 1024);
        let stderr_rx = spawn_pump(stderr_ours, TextEncoding::Utf8);
        let channel = SessionChannel::new(stdin_ours, stdout_ours, stderr_rx, TextEncoding::Utf8);
        (channel, stdin_theirs, stdout_theirs, stderr_theirs)
    }

    #[test]
    fn test_frame_command_layout() {
        let framed = frame_command("Get-Date", "__PWSH_EOC_abc__");
        let lines: Vec<_> = framed.lines().collect();
        assert_eq!(lines[0], "Get-Date");
        assert_eq!(lines[1], EPILOGUE_GUARD);
        assert_eq!(lines[2], "Write-Output '__PWSH_EOC_abc__'");
        assert!(lines[3].contains("Write-Output '0'"));
        assert!(lines[3].contains("Write-Output '1'"));
        assert!(framed.ends_with('\n'));
    }

    #[test]
    fn test_frame_command_keeps_multiline_text() {
        let framed = frame_command("$x = 1\n$x + 1\n", "S");
        assert!(framed.starts_with("$x = 1\n$x + 1\n"));
        // No doubled newline between text and epilogue.
        assert!(!framed.contains("\n\n"));
    }

    #[tokio::test]
    async fn test_submit_round_trip() {
        let (mut channel, _stdin, mut stdout, _stderr) = harness();
        let request = CommandRequest::new("echo hello");
        let sentinel = request.token.sentinel();

        let far_side = tokio::spawn(async move {
            stdout
                .write_all(format!("hello\n{sentinel}\n0\n").as_bytes())
                .await
                .unwrap();
            stdout
        });

        let response = channel.submit(&request).await.unwrap();
        assert!(response.success);
        assert_eq!(response.stdout, "hello");
        assert_eq!(response.stderr, "");
        assert_eq!(response.token, request.token);
        far_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_multiline_output() {
        let (mut channel, _stdin, mut stdout, _stderr) = harness();
        let request = CommandRequest::new("Get-ChildItem");
        let sentinel = request.token.sentinel();

        tokio::spawn(async move {
            stdout
                .write_all(format!("a\r\nb\r\nc\r\n{sentinel}\r\n0\r\n").as_bytes())
                .await
                .unwrap();
            stdout
        });

        let response = channel.submit(&request).await.unwrap();
        assert_eq!(response.stdout, "a\nb\nc");
    }

    #[tokio::test]
    async fn test_submit_failed_status() {
        let (mut channel, _stdin, mut stdout, mut stderr) = harness();
        let request = CommandRequest::new("Remove-Item missing.txt");
        let sentinel = request.token.sentinel();

        tokio::spawn(async move {
            stderr
                .write_all(b"Remove-Item: path not found\n")
                .await
                .unwrap();
            stdout
                .write_all(format!("{sentinel}\n1\n").as_bytes())
                .await
                .unwrap();
            (stdout, stderr)
        });

        let response = channel.submit(&request).await.unwrap();
        assert!(!response.success);
        assert!(response.stderr.contains("path not found"));
    }

    #[tokio::test]
    async fn test_stderr_alone_marks_failure() {
        let (mut channel, _stdin, mut stdout, mut stderr) = harness();
        let request = CommandRequest::new("Write-Error oops");
        let sentinel = request.token.sentinel();

        tokio::spawn(async move {
            stderr.write_all(b"oops\n").await.unwrap();
            // Exit status still reports success.
            stdout
                .write_all(format!("{sentinel}\n0\n").as_bytes())
                .await
                .unwrap();
            (stdout, stderr)
        });

        let response = channel.submit(&request).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.stderr, "oops");
    }

    #[tokio::test]
    async fn test_desync_status_line_detected() {
        let (mut channel, _stdin, mut stdout, _stderr) = harness();
        let request = CommandRequest::new("echo trap");
        let sentinel = request.token.sentinel();

        tokio::spawn(async move {
            // Legitimate output echoes the sentinel early; the line after it
            // is more output, not a status digit.
            stdout
                .write_all(format!("{sentinel}\nreal output\n{sentinel}\n0\n").as_bytes())
                .await
                .unwrap();
            stdout
        });

        let err = channel.submit(&request).await.unwrap_err();
        assert!(matches!(err, PwshBridgeError::Communication(_)));
        assert!(err.to_string().contains("desync"));
    }

    #[tokio::test]
    async fn test_eof_before_sentinel_is_process_error() {
        let (mut channel, _stdin, stdout, _stderr) = harness();
        let request = CommandRequest::new("exit 0");

        drop(stdout);

        let err = channel.submit(&request).await.unwrap_err();
        assert!(matches!(err, PwshBridgeError::Process(_)));
    }

    #[tokio::test]
    async fn test_sentinel_never_arrives_times_out() {
        let (mut channel, _stdin, mut stdout, _stderr) = harness();
        let request = CommandRequest::new("Start-Sleep 60");

        tokio::spawn(async move {
            stdout.write_all(b"partial output\n").await.unwrap();
            // Keep the pipe open without ever writing the sentinel.
            tokio::time::sleep(Duration::from_secs(60)).await;
            stdout
        });

        let result =
            tokio::time::timeout(Duration::from_millis(100), channel.submit(&request)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_submission_is_framed_on_the_wire() {
        let (mut channel, stdin_theirs, mut stdout, _stderr) = harness();
        let request = CommandRequest::new("pwd");
        let sentinel = request.token.sentinel();

        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(stdin_theirs);
            let mut received = String::new();
            // Four lines: command, guard, sentinel echo, status echo.
            for _ in 0..4 {
                reader.read_line(&mut received).await.unwrap();
            }
            received
        });

        let expected_sentinel = sentinel.clone();
        tokio::spawn(async move {
            stdout
                .write_all(format!("/home\n{expected_sentinel}\n0\n").as_bytes())
                .await
                .unwrap();
            stdout
        });

        channel.submit(&request).await.unwrap();
        let wire = reader.await.unwrap();
        assert!(wire.starts_with("pwd\n"));
        assert!(wire.contains(EPILOGUE_GUARD));
        assert!(wire.contains(&sentinel));
    }
}

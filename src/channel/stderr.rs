//! Background pump draining the interpreter's stderr.
//!
//! stderr is read continuously into an unbounded line buffer so that a
//! blocked stdout read can never back-pressure the interpreter's error
//! stream into a pipe deadlock. The channel drains the buffer when it
//! assembles a response.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::TextEncoding;

/// Spawn the stderr pump task onto the current runtime.
///
/// The task ends when the stream reaches EOF (process exit) or the receiver
/// is dropped. Lines are forwarded without their trailing newline.
pub(crate) fn spawn_pump<R>(stderr: R, encoding: TextEncoding) -> mpsc::UnboundedReceiver<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    debug!("stderr pump: EOF");
                    break;
                }
                Ok(_) => {
                    trim_line_ending(&mut buf);
                    let line = match encoding.decode(buf.clone()) {
                        Ok(line) => line,
                        Err(err) => {
                            // stderr is advisory text; degrade to lossy
                            // rather than abandoning the stream.
                            warn!(%err, "stderr pump: invalid bytes, decoding lossily");
                            String::from_utf8_lossy(err.as_bytes()).into_owned()
                        }
                    };
                    if tx.send(line).is_err() {
                        debug!("stderr pump: receiver dropped");
                        break;
                    }
                }
                Err(err) => {
                    debug!(%err, "stderr pump: read failed");
                    break;
                }
            }
        }
    });

    rx
}

/// Strip a trailing `\n` or `\r\n`.
pub(crate) fn trim_line_ending(buf: &mut Vec<u8>) {
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pump_forwards_lines() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut rx = spawn_pump(reader, TextEncoding::Utf8);

        use tokio::io::AsyncWriteExt;
        writer.write_all(b"warning one\r\nwarning two\n").await.unwrap();
        drop(writer);

        assert_eq!(rx.recv().await.unwrap(), "warning one");
        assert_eq!(rx.recv().await.unwrap(), "warning two");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pump_ends_on_eof() {
        let (writer, reader) = tokio::io::duplex(64);
        let mut rx = spawn_pump(reader, TextEncoding::Utf8);
        drop(writer);

        let next = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(next.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pump_degrades_invalid_bytes_lossily() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut rx = spawn_pump(reader, TextEncoding::Utf8);

        use tokio::io::AsyncWriteExt;
        writer.write_all(&[b'b', b'a', b'd', 0xff, b'\n']).await.unwrap();
        drop(writer);

        let line = rx.recv().await.unwrap();
        assert!(line.starts_with("bad"));
        assert!(line.contains('\u{fffd}'));
    }

    #[test]
    fn test_trim_line_ending() {
        let mut buf = b"text\r\n".to_vec();
        trim_line_ending(&mut buf);
        assert_eq!(buf, b"text");

        let mut buf = b"text\n".to_vec();
        trim_line_ending(&mut buf);
        assert_eq!(buf, b"text");

        let mut buf = b"text".to_vec();
        trim_line_ending(&mut buf);
        assert_eq!(buf, b"text");
    }
}

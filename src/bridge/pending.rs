//! Reply plumbing between the event loop and its callers.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::PwshBridgeError;
use crate::session::{CommandResponse, CorrelationToken};
use crate::Result;

/// Where the loop delivers an operation's result.
///
/// Blocking callers park on a rendezvous std channel; non-blocking callers
/// hold a oneshot wrapped in a pending handle. Both receive the identical
/// `Result`, so the two call styles cannot diverge in error semantics.
pub(crate) enum ReplySlot<T> {
    /// A parked thread waiting on `recv_timeout`.
    Parked(std::sync::mpsc::SyncSender<Result<T>>),
    /// A pending handle that will be polled.
    Pending(oneshot::Sender<Result<T>>),
}

impl<T> ReplySlot<T> {
    /// Deliver the result, ignoring callers that stopped listening.
    pub(crate) fn deliver(self, result: Result<T>) {
        match self {
            ReplySlot::Parked(tx) => {
                let _ = tx.try_send(result);
            }
            ReplySlot::Pending(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}

fn loop_gone<T>(_: oneshot::error::RecvError) -> Result<T> {
    Err(PwshBridgeError::Process(
        "session event loop terminated before replying".into(),
    ))
}

/// Handle to a command submitted without blocking.
///
/// Await it (or poll it) to obtain the command's result. Dropping the handle
/// abandons the result but does not cancel the command: it already occupies
/// its place in the session's FIFO order.
#[derive(Debug)]
pub struct PendingCommand {
    rx: oneshot::Receiver<Result<CommandResponse>>,
    token: CorrelationToken,
}

impl PendingCommand {
    pub(crate) fn new(
        rx: oneshot::Receiver<Result<CommandResponse>>,
        token: CorrelationToken,
    ) -> Self {
        Self { rx, token }
    }

    /// Token of the request this handle tracks.
    pub fn token(&self) -> CorrelationToken {
        self.token
    }

    /// Await the result.
    pub async fn wait(self) -> Result<CommandResponse> {
        self.rx.await.unwrap_or_else(loop_gone)
    }
}

impl Future for PendingCommand {
    type Output = Result<CommandResponse>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(loop_gone))
    }
}

/// Handle to a close operation submitted without blocking.
#[derive(Debug)]
pub struct PendingClose {
    rx: oneshot::Receiver<Result<()>>,
}

impl PendingClose {
    pub(crate) fn new(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self { rx }
    }

    /// Await the shutdown result.
    pub async fn wait(self) -> Result<()> {
        self.rx.await.unwrap_or_else(loop_gone)
    }
}

impl Future for PendingClose {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(loop_gone))
    }
}

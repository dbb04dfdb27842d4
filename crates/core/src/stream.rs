//! The stream type shared by every transport.
//!
//! A [`Stream`] is an ordered, reliable, bidirectional byte channel carved
//! out of a connection: boxed duplex I/O plus metadata (id, endpoint pair,
//! lifecycle token) and optional read/write deadlines. Transports construct
//! streams around whatever their mux hands back (a yamux substream, a QUIC
//! bidi pair, an in-memory pipe); everything above the transport sees this
//! one type.

use crate::addr::EndpointPair;
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Duplex byte channel a stream runs over.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// Boxed stream I/O.
pub type BoxIo = Box<dyn StreamIo>;

/// Hook run exactly once when the stream closes (or is dropped unclosed).
/// The dial strategy uses this to decrement its per-connection refcount.
pub type CloseHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// One optional deadline applied to a poll direction.
struct Deadline {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    fn unset() -> Self {
        Self { sleep: None }
    }

    fn set(&mut self, at: Option<Instant>) {
        self.sleep = at.map(|at| Box::pin(sleep_until(at)));
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
            None => false,
        }
    }
}

/// An ordered bidirectional byte stream multiplexed within a connection.
pub struct Stream {
    id: u64,
    io: BoxIo,
    endpoint: EndpointPair,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    cancel_seen: bool,
    read_deadline: Deadline,
    write_deadline: Deadline,
    closed: bool,
    on_close: Option<CloseHook>,
}

impl Stream {
    /// Wraps raw duplex I/O with stream metadata. `token` should be a child
    /// of the owning connection's lifecycle token so that closing the
    /// connection cancels the stream.
    pub fn new(id: u64, io: BoxIo, endpoint: EndpointPair, token: CancellationToken) -> Self {
        let cancelled = Box::pin(token.clone().cancelled_owned());
        Self {
            id,
            io,
            endpoint,
            token,
            cancelled,
            cancel_seen: false,
            read_deadline: Deadline::unset(),
            write_deadline: Deadline::unset(),
            closed: false,
            on_close: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &EndpointPair {
        &self.endpoint
    }

    /// Token cancelled when this stream (or its connection) closes.
    pub fn closed(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.token.is_cancelled()
    }

    /// Registers a hook run exactly once on close or drop.
    pub fn set_close_hook(&mut self, hook: CloseHook) {
        self.on_close = Some(hook);
    }

    /// Sets the read deadline; `None` clears it. An expired deadline fails
    /// in-flight and future reads with `TimedOut`.
    pub fn set_read_deadline(&mut self, at: Option<Instant>) {
        self.read_deadline.set(at);
    }

    /// Sets the write deadline; `None` clears it.
    pub fn set_write_deadline(&mut self, at: Option<Instant>) {
        self.write_deadline.set(at);
    }

    /// Sets both deadlines at once.
    pub fn set_deadline(&mut self, at: Option<Instant>) {
        self.set_read_deadline(at);
        self.set_write_deadline(at);
    }

    /// Closes the stream: shuts down the write side, cancels the lifecycle
    /// token, and runs the close hook. The second call reports
    /// [`Error::Closed`].
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.closed = true;

        let shut = self.io.shutdown().await;
        self.token.cancel();
        if let Some(hook) = self.on_close.take() {
            hook().await;
        }
        shut.map_err(|e| Error::Io(e.to_string()))
    }

    /// Checks closure/cancellation common to both poll directions.
    fn poll_live(&mut self, cx: &mut Context<'_>) -> Option<io::Error> {
        if self.closed {
            return Some(Error::Closed.into());
        }
        if !self.cancel_seen && self.cancelled.as_mut().poll(cx).is_ready() {
            self.cancel_seen = true;
        }
        if self.cancel_seen {
            return Some(Error::Closed.into());
        }
        None
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = this.poll_live(cx) {
            return Poll::Ready(Err(err));
        }
        if this.read_deadline.poll_expired(cx) {
            return Poll::Ready(Err(io::ErrorKind::TimedOut.into()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(err) = this.poll_live(cx) {
            return Poll::Ready(Err(err));
        }
        if this.write_deadline.poll_expired(cx) {
            return Poll::Ready(Err(io::ErrorKind::TimedOut.into()));
        }
        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(Error::Closed.into()));
        }
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.token.cancel();
        if let Some(hook) = self.on_close.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(hook());
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Addr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (Stream, Stream) {
        let (a, b) = tokio::io::duplex(1024);
        let ep = EndpointPair::new(Addr::inproc("/local"), Addr::inproc("/remote"));
        let token = CancellationToken::new();
        let left = Stream::new(1, Box::new(a), ep.clone(), token.child_token());
        let right = Stream::new(1, Box::new(b), ep.flipped(), token.child_token());
        (left, right)
    }

    #[tokio::test]
    async fn round_trip() {
        let (mut left, mut right) = pair();
        left.write_all(b"hello, world!").await.unwrap();
        left.close().await.unwrap();

        let mut buf = Vec::new();
        right.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello, world!");
    }

    #[tokio::test]
    async fn double_close_reports_closed() {
        let (mut left, _right) = pair();
        assert!(left.close().await.is_ok());
        assert_eq!(left.close().await, Err(Error::Closed));
    }

    #[tokio::test]
    async fn connection_cancel_fails_pending_read() {
        let (a, _b) = tokio::io::duplex(16);
        let ep = EndpointPair::new(Addr::inproc("/l"), Addr::inproc("/r"));
        let conn_token = CancellationToken::new();
        let mut s = Stream::new(7, Box::new(a), ep, conn_token.child_token());

        let cancel = conn_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let mut buf = [0u8; 4];
        let err = s.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn read_deadline_expires() {
        let (mut left, _right) = pair();
        left.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));

        let mut buf = [0u8; 4];
        let err = left.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn close_hook_runs_once() {
        let (mut left, _right) = pair();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        left.set_close_hook(Box::new(move || {
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
            })
        }));

        left.close().await.unwrap();
        assert!(fired.load(Ordering::SeqCst));
        // Second close fails without re-running anything.
        assert_eq!(left.close().await, Err(Error::Closed));
    }

    #[tokio::test]
    async fn drop_fires_hook() {
        let (left, _right) = pair();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        {
            let mut left = left;
            left.set_close_hook(Box::new(move || {
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                })
            }));
        }
        tokio::task::yield_now().await;
        assert!(fired.load(Ordering::SeqCst));
    }
}

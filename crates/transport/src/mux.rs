//! Stream mux adapter: turns a raw duplex channel into a multiplexed
//! connection.
//!
//! The provided implementation is [`YamuxAdapter`] over the `yamux` crate.
//! yamux is poll-driven and must be continuously polled to make progress,
//! so the adapter spawns one driver task per connection; the
//! [`MuxedConnection`] handle talks to it over channels. Frame-level flow
//! control, per-stream ordering, and close propagation are yamux's job.

use crate::net::RawConn;
use async_trait::async_trait;
use futures::channel::mpsc as futures_mpsc;
use raceway_core::stream::BoxIo;
use raceway_core::sync::ErrorCell;
use raceway_core::{Connection, EndpointPair, Error, Result, Stream};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Poll;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Mux tuning knobs, applied symmetrically to both roles.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Upper bound on concurrently open streams per connection.
    pub max_num_streams: usize,
    /// Capacity of the inbound-stream queue between the driver task and
    /// `accept_stream` callers.
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_num_streams: 512,
            accept_backlog: 32,
        }
    }
}

impl MuxConfig {
    fn to_yamux(&self) -> yamux::Config {
        let mut cfg = yamux::Config::default();
        cfg.set_max_num_streams(self.max_num_streams);
        cfg
    }
}

/// Adapts an established duplex byte channel into a multiplexed
/// [`Connection`].
#[async_trait]
pub trait MuxAdapter: Send + Sync {
    /// Server-role adaptation, used on accepted channels.
    async fn adapt_server(&self, conn: RawConn) -> Result<Arc<dyn Connection>>;

    /// Client-role adaptation, used on dialed channels.
    async fn adapt_client(&self, conn: RawConn) -> Result<Arc<dyn Connection>>;
}

/// yamux-backed [`MuxAdapter`].
#[derive(Debug, Clone, Default)]
pub struct YamuxAdapter {
    config: MuxConfig,
}

impl YamuxAdapter {
    pub fn new(config: MuxConfig) -> Self {
        Self { config }
    }

    fn adapt(&self, conn: RawConn, mode: yamux::Mode) -> Arc<dyn Connection> {
        let RawConn { io, endpoint } = conn;
        let muxed = yamux::Connection::new(io.compat(), self.config.to_yamux(), mode);
        Arc::new(MuxedConnection::spawn(muxed, endpoint, &self.config))
    }
}

#[async_trait]
impl MuxAdapter for YamuxAdapter {
    async fn adapt_server(&self, conn: RawConn) -> Result<Arc<dyn Connection>> {
        Ok(self.adapt(conn, yamux::Mode::Server))
    }

    async fn adapt_client(&self, conn: RawConn) -> Result<Arc<dyn Connection>> {
        Ok(self.adapt(conn, yamux::Mode::Client))
    }
}

enum Cmd {
    Open(oneshot::Sender<Result<yamux::Stream>>),
    Close(oneshot::Sender<()>),
}

/// A connection multiplexed by a spawned yamux driver task.
pub struct MuxedConnection {
    endpoint: EndpointPair,
    token: CancellationToken,
    cmd_tx: mpsc::Sender<Cmd>,
    inbound: Mutex<futures_mpsc::Receiver<yamux::Stream>>,
    cause: Arc<ErrorCell>,
    next_id: AtomicU64,
}

impl MuxedConnection {
    fn spawn(
        muxed: yamux::Connection<Compat<BoxIo>>,
        endpoint: EndpointPair,
        config: &MuxConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = futures_mpsc::channel(config.accept_backlog);
        let token = CancellationToken::new();
        let cause = Arc::new(ErrorCell::new());

        tokio::spawn(drive(muxed, cmd_rx, in_tx, token.clone(), cause.clone()));

        Self {
            endpoint,
            token,
            cmd_tx,
            inbound: Mutex::new(in_rx),
            cause,
            next_id: AtomicU64::new(0),
        }
    }

    fn wrap(&self, stream: yamux::Stream) -> Stream {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Stream::new(
            id,
            Box::new(stream.compat()),
            self.endpoint.clone(),
            self.token.child_token(),
        )
    }
}

#[async_trait]
impl Connection for MuxedConnection {
    fn endpoint(&self) -> EndpointPair {
        self.endpoint.clone()
    }

    fn closed(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn open_stream(&self) -> Result<Stream> {
        if self.token.is_cancelled() {
            return Err(self.cause.cause());
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Open(tx))
            .await
            .map_err(|_| self.cause.cause())?;
        let stream = rx.await.map_err(|_| self.cause.cause())??;
        Ok(self.wrap(stream))
    }

    async fn accept_stream(&self) -> Result<Stream> {
        use futures::StreamExt;
        let mut inbound = self.inbound.lock().await;
        match inbound.next().await {
            Some(stream) => Ok(self.wrap(stream)),
            None => Err(self.cause.cause()),
        }
    }

    async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Close(tx)).await.is_err() {
            // Driver already gone; the connection is closed.
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }
}

/// Owns the yamux state machine: services outbound-open requests, forwards
/// inbound streams, and shuts the session down on close or failure.
async fn drive(
    mut muxed: yamux::Connection<Compat<BoxIo>>,
    mut cmds: mpsc::Receiver<Cmd>,
    mut inbound: futures_mpsc::Sender<yamux::Stream>,
    token: CancellationToken,
    cause: Arc<ErrorCell>,
) {
    let mut opens: VecDeque<oneshot::Sender<Result<yamux::Stream>>> = VecDeque::new();
    let mut close_acks: Vec<oneshot::Sender<()>> = Vec::new();
    let mut stashed: Option<yamux::Stream> = None;
    let mut closing = false;
    let mut cmds_done = false;

    let result = futures::future::poll_fn(|cx| {
        if !cmds_done {
            loop {
                match cmds.poll_recv(cx) {
                    Poll::Ready(Some(Cmd::Open(tx))) => {
                        if closing {
                            let _ = tx.send(Err(Error::Closed));
                        } else {
                            opens.push_back(tx);
                        }
                    }
                    Poll::Ready(Some(Cmd::Close(tx))) => {
                        closing = true;
                        close_acks.push(tx);
                    }
                    Poll::Ready(None) => {
                        // Connection handle dropped without close.
                        cmds_done = true;
                        closing = true;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }

        if closing {
            for tx in opens.drain(..) {
                let _ = tx.send(Err(Error::Closed));
            }
            return muxed.poll_close(cx);
        }

        while !opens.is_empty() {
            match muxed.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    if let Some(tx) = opens.pop_front() {
                        let _ = tx.send(Ok(stream));
                    }
                }
                Poll::Ready(Err(err)) => {
                    if let Some(tx) = opens.pop_front() {
                        let _ = tx.send(Err(map_mux_err(&err)));
                    }
                    return Poll::Ready(Err(err));
                }
                Poll::Pending => break,
            }
        }

        if let Some(stream) = stashed.take() {
            match inbound.poll_ready(cx) {
                Poll::Ready(Ok(())) => {
                    let _ = inbound.start_send(stream);
                }
                Poll::Ready(Err(_)) => {} // accept side dropped; discard
                Poll::Pending => stashed = Some(stream),
            }
        }

        // poll_next_inbound also drives connection-level I/O, so keep
        // polling it until either it or the accept queue has no capacity.
        while stashed.is_none() {
            match muxed.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => match inbound.poll_ready(cx) {
                    Poll::Ready(Ok(())) => {
                        let _ = inbound.start_send(stream);
                    }
                    Poll::Ready(Err(_)) => {}
                    Poll::Pending => stashed = Some(stream),
                },
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(err)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => break,
            }
        }

        Poll::Pending
    })
    .await;

    match result {
        Ok(()) => cause.store(Error::Closed),
        Err(err) => {
            debug!(error = %err, "mux connection terminated");
            cause.store(map_mux_err(&err));
        }
    }

    for tx in opens {
        let _ = tx.send(Err(cause.cause()));
    }
    for tx in close_acks {
        let _ = tx.send(());
    }
    token.cancel();
    // Dropping `inbound` here fails pending accept_stream calls.
}

fn map_mux_err(err: &yamux::ConnectionError) -> Error {
    match err {
        yamux::ConnectionError::Closed => Error::Closed,
        yamux::ConnectionError::TooManyStreams => Error::Temporary(err.to_string()),
        other => Error::Io(other.to_string()),
    }
}

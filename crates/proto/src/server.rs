//! A generic stream-accepting server.
//!
//! The server owns a set of listeners and a set of live connections. Each
//! listener gets an accept loop; each connection gets a stream-accept loop;
//! each stream gets a handler task. Transient accept failures back off
//! exponentially. Shutdown comes in two flavors: immediate (`close`) and
//! drain (`shutdown`).

use crate::backoff::BackoffPolicy;
use async_trait::async_trait;
use raceway_core::state::{ConnState, ConnStateHandler, StreamInfo, StreamState, StreamStateHandler};
use raceway_core::sync::RefCount;
use raceway_core::{Connection, Error, Listener, Result, Stream};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Interval at which graceful shutdown re-checks the connection set.
const DRAIN_POLL: Duration = Duration::from_millis(500);

/// Responds to an incoming stream. The handler owns the stream and should
/// eventually close it.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn serve_stream(&self, stream: Stream);
}

/// Adapts an async closure into a [`StreamHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn StreamHandler>
where
    F: Fn(Stream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    struct FnHandler<F>(F);

    #[async_trait]
    impl<F, Fut> StreamHandler for FnHandler<F>
    where
        F: Fn(Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        async fn serve_stream(&self, stream: Stream) {
            (self.0)(stream).await;
        }
    }

    Arc::new(FnHandler(f))
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    handler: Arc<dyn StreamHandler>,
    backoff: BackoffPolicy,
    on_conn_state: Option<ConnStateHandler>,
    on_stream_state: Option<StreamStateHandler>,
}

impl ServerBuilder {
    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = policy;
        self
    }

    pub fn on_conn_state(mut self, handler: ConnStateHandler) -> Self {
        self.on_conn_state = Some(handler);
        self
    }

    pub fn on_stream_state(mut self, handler: StreamStateHandler) -> Self {
        self.on_stream_state = Some(handler);
        self
    }

    pub fn build(self) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                handler: self.handler,
                backoff: self.backoff,
                on_conn_state: self.on_conn_state.unwrap_or_else(|| Arc::new(|_, _| {})),
                on_stream_state: self.on_stream_state.unwrap_or_else(|| Arc::new(|_, _| {})),
                cq: CancellationToken::new(),
                closed: AtomicBool::new(false),
                listeners: Mutex::new(ListenerSet::default()),
                conns: ConnSet::default(),
            }),
        }
    }
}

/// A server that accepts streams from every connection of every listener
/// handed to [`Server::serve`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    handler: Arc<dyn StreamHandler>,
    backoff: BackoffPolicy,
    on_conn_state: ConnStateHandler,
    on_stream_state: StreamStateHandler,
    /// Close signal observed by every loop.
    cq: CancellationToken,
    closed: AtomicBool,
    listeners: Mutex<ListenerSet>,
    conns: ConnSet,
}

impl Server {
    pub fn builder(handler: Arc<dyn StreamHandler>) -> ServerBuilder {
        ServerBuilder {
            handler,
            backoff: BackoffPolicy::default(),
            on_conn_state: None,
            on_stream_state: None,
        }
    }

    pub fn new(handler: Arc<dyn StreamHandler>) -> Self {
        Self::builder(handler).build()
    }

    /// Serves streams from `listener` until the server closes or accepting
    /// fails non-transiently. Always returns a non-`Ok` value and closes
    /// the listener on the way out.
    pub async fn serve(&self, listener: Box<dyn Listener>) -> Result<()> {
        let listener = Arc::new(CloseOnceListener::new(listener.into()));
        let id = {
            let mut set = self.inner.listeners.lock().expect("listener set poisoned");
            if set.closed {
                return Err(Error::ServerClosed);
            }
            set.insert(listener.clone())
        };

        let result = self.accept_loop(&listener).await;

        self.inner
            .listeners
            .lock()
            .expect("listener set poisoned")
            .remove(id);
        let _ = listener.close().await;
        result
    }

    async fn accept_loop(&self, listener: &CloseOnceListener) -> Result<()> {
        let mut backoff = self.inner.backoff.start();
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.inner.cq.cancelled() => return Err(Error::ServerClosed),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(conn) => {
                    backoff.reset();
                    let server = self.clone();
                    tokio::spawn(async move { server.serve_conn(conn).await });
                }
                Err(err) => {
                    if self.inner.cq.is_cancelled() {
                        return Err(Error::ServerClosed);
                    }
                    if err.is_temporary() {
                        let delay = backoff.next();
                        debug!(addr = %listener.addr(), error = %err, retry = ?delay,
                            "failed to accept connection");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn serve_conn(&self, conn: Arc<dyn Connection>) {
        // The initial reference represents the accept loop itself and keeps
        // the connection from closing underneath live streams.
        let entry = self.inner.conns.insert(conn.clone());
        self.emit_conn(&entry, ConnState::Open);

        let mut backoff = self.inner.backoff.start();
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.inner.cq.cancelled() => break,
                accepted = conn.accept_stream() => accepted,
            };

            match accepted {
                Ok(stream) => {
                    backoff.reset();
                    entry.refs.incr();
                    self.emit_conn(&entry, ConnState::Open);
                    let server = self.clone();
                    let entry = entry.clone();
                    tokio::spawn(async move { server.serve_stream(stream, entry).await });
                }
                Err(err) if err.is_temporary() => {
                    let delay = backoff.next();
                    debug!(remote = %conn.endpoint().remote, error = %err, retry = ?delay,
                        "failed to accept stream");
                    tokio::time::sleep(delay).await;
                }
                Err(_) => break,
            }
        }

        self.release(&entry, false).await;
    }

    async fn serve_stream(&self, stream: Stream, entry: Arc<ConnEntry>) {
        let info = StreamInfo {
            id: stream.id(),
            endpoint: stream.endpoint().clone(),
        };
        (self.inner.on_stream_state)(&info, StreamState::Open);

        self.inner.handler.serve_stream(stream).await;

        let remaining = self.release(&entry, true).await;
        let state = if remaining > 0 {
            StreamState::Idle
        } else {
            StreamState::Closed
        };
        (self.inner.on_stream_state)(&info, state);
    }

    /// Drops one reference on the connection. The last reference closes it;
    /// a stream completion that leaves only the accept loop's reference
    /// marks the connection idle.
    async fn release(&self, entry: &Arc<ConnEntry>, from_stream: bool) -> u32 {
        let remaining = entry.refs.decr();
        match remaining {
            0 => {
                if let Err(err) = entry.conn.close().await {
                    warn!(remote = %entry.conn.endpoint().remote, error = %err,
                        "error closing connection");
                }
                self.inner.conns.remove(entry.id);
                self.emit_conn(entry, ConnState::Closed);
            }
            1 if from_stream => self.emit_conn(entry, ConnState::Idle),
            _ => {}
        }
        remaining
    }

    /// Emits a connection state change, suppressing consecutive duplicates.
    fn emit_conn(&self, entry: &ConnEntry, state: ConnState) {
        if entry.last_state.swap(state as u8, Ordering::SeqCst) != state as u8 {
            (self.inner.on_conn_state)(entry.conn.as_ref(), state);
        }
    }

    /// Closes the server immediately: signals every loop, closes all
    /// listeners and all tracked connections. The second call reports
    /// [`Error::ServerClosed`].
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::ServerClosed);
        }
        self.inner.cq.cancel();

        for listener in self.take_listeners() {
            let _ = listener.close().await;
        }

        let mut first_err = None;
        for entry in self.inner.conns.snapshot() {
            if let Err(err) = entry.conn.close().await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Gracefully shuts down: refuses new connections and waits for the
    /// connection set to drain, polling every 500 ms. Active streams are
    /// never interrupted. Returns [`Error::Cancelled`] if `deadline` fires
    /// first.
    pub async fn shutdown(&self, deadline: CancellationToken) -> Result<()> {
        for listener in self.take_listeners() {
            let _ = listener.close().await;
        }

        let mut poll = tokio::time::interval(DRAIN_POLL);
        loop {
            if self.inner.conns.is_empty() {
                return Ok(());
            }
            tokio::select! {
                _ = deadline.cancelled() => return Err(Error::Cancelled),
                _ = poll.tick() => {}
            }
        }
    }

    fn take_listeners(&self) -> Vec<Arc<CloseOnceListener>> {
        let mut set = self.inner.listeners.lock().expect("listener set poisoned");
        set.closed = true;
        set.items.drain().map(|(_, l)| l).collect()
    }
}

#[derive(Default)]
struct ListenerSet {
    items: HashMap<u64, Arc<CloseOnceListener>>,
    next: u64,
    closed: bool,
}

impl ListenerSet {
    fn insert(&mut self, listener: Arc<CloseOnceListener>) -> u64 {
        self.next += 1;
        self.items.insert(self.next, listener);
        self.next
    }

    fn remove(&mut self, id: u64) {
        self.items.remove(&id);
    }
}

/// Idempotent close that memoizes the first result.
struct CloseOnceListener {
    inner: Arc<dyn Listener>,
    done: AsyncMutex<Option<Result<()>>>,
}

impl CloseOnceListener {
    fn new(inner: Arc<dyn Listener>) -> Self {
        Self {
            inner,
            done: AsyncMutex::new(None),
        }
    }

    fn addr(&self) -> raceway_core::Addr {
        self.inner.addr()
    }

    async fn accept(&self) -> Result<Arc<dyn Connection>> {
        self.inner.accept().await
    }

    async fn close(&self) -> Result<()> {
        let mut done = self.done.lock().await;
        if let Some(result) = done.as_ref() {
            return result.clone();
        }
        let result = self.inner.close().await;
        *done = Some(result.clone());
        result
    }
}

struct ConnEntry {
    id: u64,
    conn: Arc<dyn Connection>,
    refs: RefCount,
    last_state: AtomicU8,
}

#[derive(Default)]
struct ConnSet {
    items: Mutex<HashMap<u64, Arc<ConnEntry>>>,
    next: AtomicU64,
}

impl ConnSet {
    fn insert(&self, conn: Arc<dyn Connection>) -> Arc<ConnEntry> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(ConnEntry {
            id,
            conn,
            refs: RefCount::new(1),
            // An impossible state so the first Open always fires.
            last_state: AtomicU8::new(u8::MAX),
        });
        self.items
            .lock()
            .expect("conn set poisoned")
            .insert(id, entry.clone());
        entry
    }

    fn remove(&self, id: u64) {
        self.items.lock().expect("conn set poisoned").remove(&id);
    }

    fn is_empty(&self) -> bool {
        self.items.lock().expect("conn set poisoned").is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<ConnEntry>> {
        self.items
            .lock()
            .expect("conn set poisoned")
            .values()
            .cloned()
            .collect()
    }
}

//! The dial strategy: a reference-counted connection pool.
//!
//! One cached connection per address. Concurrent dials to the same address
//! coalesce onto a single underlying dial; streams opened or accepted
//! through a pooled connection are counted, and when the count returns to
//! zero the connection is closed and its slot discarded. A dial failure is
//! delivered to every waiter of that attempt and never cached.

use once_cell::sync::Lazy;
use raceway_core::sync::RefCount;
use raceway_core::{Addr, Connection, Dialer, EndpointPair, Error, Result, Stream};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

static DEFAULT: Lazy<StreamCountStrategy> = Lazy::new(StreamCountStrategy::new);

/// The process-wide dial strategy, shared by clients that don't supply
/// their own.
pub fn default_strategy() -> StreamCountStrategy {
    DEFAULT.clone()
}

/// Closes pooled connections when their stream count reaches zero. Cheap to
/// clone; clones share the same pool.
#[derive(Clone, Default)]
pub struct StreamCountStrategy {
    inner: Arc<Pool>,
}

#[derive(Default)]
struct Pool {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

/// Per-address slot: pending dial, ready connection, or the error of the
/// in-flight attempt.
struct Slot {
    state: Mutex<SlotState>,
    ready: Notify,
}

enum SlotState {
    Pending,
    Ready(Arc<dyn Connection>),
    Failed(Error),
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            ready: Notify::new(),
        }
    }
}

/// Pool bookkeeping shared between a counted connection and the close hooks
/// of its streams.
struct Entry {
    conn: Arc<dyn Connection>,
    streams: RefCount,
    /// Shared for stream open/accept + increment; exclusive for the
    /// decrement-to-zero close, so a close can't race a concurrent open.
    guard: RwLock<()>,
    pool: Weak<Pool>,
    slot: Weak<Slot>,
    key: String,
}

impl Entry {
    /// Stream-close hook: decrement, and on zero close the connection and
    /// drop the slot.
    async fn release(self: Arc<Self>) {
        let _guard = self.guard.write().await;
        if self.streams.decr() == 0 {
            debug!(addr = %self.key, "last stream closed, evicting pooled connection");
            self.remove_slot();
            let _ = self.conn.close().await;
        }
    }

    /// Removes this entry's slot from the pool, unless a newer slot has
    /// already replaced it.
    fn remove_slot(&self) {
        let (Some(pool), Some(slot)) = (self.pool.upgrade(), self.slot.upgrade()) else {
            return;
        };
        let mut slots = pool.slots.lock().expect("pool poisoned");
        if let Some(current) = slots.get(&self.key) {
            if Arc::ptr_eq(current, &slot) {
                slots.remove(&self.key);
            }
        }
    }

    fn hook_stream(self: &Arc<Self>, stream: &mut Stream) {
        let entry = self.clone();
        stream.set_close_hook(Box::new(move || Box::pin(entry.release())));
    }
}

/// A pooled connection: delegates to the cached connection, counting the
/// streams that flow through it.
struct CountedConn {
    entry: Arc<Entry>,
}

#[async_trait]
impl Connection for CountedConn {
    fn endpoint(&self) -> EndpointPair {
        self.entry.conn.endpoint()
    }

    fn closed(&self) -> CancellationToken {
        self.entry.conn.closed()
    }

    async fn open_stream(&self) -> Result<Stream> {
        let _guard = self.entry.guard.read().await;
        // A failed open is not grounds for eviction; it may be transient.
        let mut stream = self.entry.conn.open_stream().await?;
        self.entry.streams.incr();
        self.entry.hook_stream(&mut stream);
        Ok(stream)
    }

    async fn accept_stream(&self) -> Result<Stream> {
        let _guard = self.entry.guard.read().await;
        let mut stream = self.entry.conn.accept_stream().await?;
        self.entry.streams.incr();
        self.entry.hook_stream(&mut stream);
        Ok(stream)
    }

    async fn close(&self) -> Result<()> {
        self.entry.conn.close().await
    }
}

impl StreamCountStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached connection for `addr`, dialing if necessary.
    ///
    /// `cached` is `false` only for the caller whose dial actually ran.
    /// Every concurrent caller observes the same connection, or the same
    /// dial error.
    pub async fn get_conn(
        &self,
        dialer: &dyn Dialer,
        addr: Addr,
    ) -> Result<(Arc<dyn Connection>, bool)> {
        let key = addr.to_string();
        let (slot, existed) = {
            let mut slots = self.inner.slots.lock().expect("pool poisoned");
            match slots.get(&key) {
                Some(slot) => (slot.clone(), true),
                None => {
                    let slot = Arc::new(Slot::new());
                    slots.insert(key.clone(), slot.clone());
                    (slot, false)
                }
            }
        };

        if existed {
            return Ok((wait_ready(&slot).await?, true));
        }

        // If this caller is dropped mid-dial, the guard fails the slot so
        // parked waiters don't hang on Pending forever.
        let mut guard = DialGuard {
            strategy: self.clone(),
            slot: slot.clone(),
            key: key.clone(),
            armed: true,
        };

        match dialer.dial(addr).await {
            Ok(conn) => {
                guard.armed = false;
                let counted = self.install(&slot, key, conn, 0);
                Ok((counted, false))
            }
            Err(err) => {
                guard.armed = false;
                self.fail_slot(&slot, &key, err.clone());
                Err(err)
            }
        }
    }

    /// Delivers `err` to the slot's waiters, then discards the slot: a
    /// failure is sticky only for the attempt that produced it.
    fn fail_slot(&self, slot: &Arc<Slot>, key: &str, err: Error) {
        *slot.state.lock().expect("slot poisoned") = SlotState::Failed(err);
        slot.ready.notify_waiters();

        let mut slots = self.inner.slots.lock().expect("pool poisoned");
        if let Some(current) = slots.get(key) {
            if Arc::ptr_eq(current, slot) {
                slots.remove(key);
            }
        }
    }

    /// Inserts an externally-obtained connection (e.g. from the listener
    /// side) so it participates in refcount eviction. `streams` is the
    /// number of streams already open on it. Returns the counted view;
    /// fails if the address is already tracked.
    pub fn track(&self, conn: Arc<dyn Connection>, streams: u32) -> Result<Arc<dyn Connection>> {
        let key = conn.endpoint().remote.to_string();
        let slot = {
            let mut slots = self.inner.slots.lock().expect("pool poisoned");
            if slots.contains_key(&key) {
                return Err(Error::AlreadyTracking(key));
            }
            let slot = Arc::new(Slot::new());
            slots.insert(key.clone(), slot.clone());
            slot
        };
        Ok(self.install(&slot, key, conn, streams))
    }

    /// Number of live slots; exposed for tests and introspection.
    pub fn len(&self) -> usize {
        self.inner.slots.lock().expect("pool poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn install(
        &self,
        slot: &Arc<Slot>,
        key: String,
        conn: Arc<dyn Connection>,
        streams: u32,
    ) -> Arc<dyn Connection> {
        let entry = Arc::new(Entry {
            conn: conn.clone(),
            streams: RefCount::new(streams),
            guard: RwLock::new(()),
            pool: Arc::downgrade(&self.inner),
            slot: Arc::downgrade(slot),
            key,
        });
        let counted: Arc<dyn Connection> = Arc::new(CountedConn {
            entry: entry.clone(),
        });

        *slot.state.lock().expect("slot poisoned") = SlotState::Ready(counted.clone());
        slot.ready.notify_waiters();

        // Remote close evicts the slot even with streams outstanding.
        let token = conn.closed();
        tokio::spawn(async move {
            token.cancelled().await;
            entry.remove_slot();
        });

        counted
    }
}

/// Fails a pending slot if the dialing caller is cancelled.
struct DialGuard {
    strategy: StreamCountStrategy,
    slot: Arc<Slot>,
    key: String,
    armed: bool,
}

impl Drop for DialGuard {
    fn drop(&mut self) {
        if self.armed {
            self.strategy
                .fail_slot(&self.slot, &self.key, Error::Cancelled);
        }
    }
}

/// Parks until the slot's dial resolves.
async fn wait_ready(slot: &Arc<Slot>) -> Result<Arc<dyn Connection>> {
    loop {
        let notified = slot.ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match &*slot.state.lock().expect("slot poisoned") {
            SlotState::Ready(conn) => return Ok(conn.clone()),
            SlotState::Failed(err) => return Err(err.clone()),
            SlotState::Pending => {}
        }
        notified.await;
    }
}

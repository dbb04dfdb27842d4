//! Connect hooks: user transforms applied to raw channels before muxing.
//!
//! Hooks run in insertion order on every raw connection the generic
//! transport establishes, on both the dial and listen side. A hook may
//! rewrap the channel (handshake, framing) or reject it, aborting the
//! connection.

use crate::net::RawConn;
use async_trait::async_trait;
use futures::future::BoxFuture;
use raceway_core::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Which side of the connection the hook is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Dial,
    Listen,
}

/// A transform applied to a raw channel before it is muxed.
#[async_trait]
pub trait ConnectHook: Send + Sync {
    async fn on_connect(&self, conn: RawConn, role: EndpointRole) -> Result<RawConn>;
}

/// Adapts a closure into a [`ConnectHook`].
pub fn hook_fn<F>(f: F) -> Arc<dyn ConnectHook>
where
    F: Fn(RawConn, EndpointRole) -> BoxFuture<'static, Result<RawConn>> + Send + Sync + 'static,
{
    struct FnHook<F>(F);

    #[async_trait]
    impl<F> ConnectHook for FnHook<F>
    where
        F: Fn(RawConn, EndpointRole) -> BoxFuture<'static, Result<RawConn>>
            + Send
            + Sync
            + 'static,
    {
        async fn on_connect(&self, conn: RawConn, role: EndpointRole) -> Result<RawConn> {
            (self.0)(conn, role).await
        }
    }

    Arc::new(FnHook(f))
}

/// Identity handle for a registered hook; pass back to
/// [`ConnectHooks::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookHandle(u64);

/// Ordered, dynamically mutable hook registry. Cheap to clone; clones share
/// the same registry.
#[derive(Clone, Default)]
pub struct ConnectHooks {
    inner: Arc<Registry>,
}

#[derive(Default)]
struct Registry {
    hooks: Mutex<Vec<(u64, Arc<dyn ConnectHook>)>>,
    next: AtomicU64,
}

impl ConnectHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a hook, returning its removal handle.
    pub fn add(&self, hook: Arc<dyn ConnectHook>) -> HookHandle {
        let id = self.inner.next.fetch_add(1, Ordering::Relaxed);
        self.inner
            .hooks
            .lock()
            .expect("hook registry poisoned")
            .push((id, hook));
        HookHandle(id)
    }

    /// Removes by identity; returns whether the hook was present.
    pub fn remove(&self, handle: HookHandle) -> bool {
        let mut hooks = self.inner.hooks.lock().expect("hook registry poisoned");
        let before = hooks.len();
        hooks.retain(|(id, _)| *id != handle.0);
        hooks.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .hooks
            .lock()
            .expect("hook registry poisoned")
            .is_empty()
    }

    /// Runs every hook in insertion order; the first failure aborts the
    /// connection.
    pub async fn run(&self, mut conn: RawConn, role: EndpointRole) -> Result<RawConn> {
        let snapshot: Vec<Arc<dyn ConnectHook>> = self
            .inner
            .hooks
            .lock()
            .expect("hook registry poisoned")
            .iter()
            .map(|(_, h)| h.clone())
            .collect();

        for hook in snapshot {
            conn = hook.on_connect(conn, role).await?;
        }
        Ok(conn)
    }
}

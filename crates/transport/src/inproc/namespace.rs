//! The inproc address namespace: a registry of listener bindings.
//!
//! At most one listener may be bound to a given address string at a time.
//! The process-wide default namespace is shared by every
//! [`super::InprocTransport`] that doesn't supply its own, which lets
//! independent subsystems reach each other by name; tests isolate
//! themselves by constructing a fresh one.

use once_cell::sync::Lazy;
use raceway_core::Connection;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

static DEFAULT: Lazy<Namespace> = Lazy::new(Namespace::new);

/// The process-wide default namespace.
pub fn default_namespace() -> Namespace {
    DEFAULT.clone()
}

/// The listener side of a binding: where dialers deliver the remote view of
/// a freshly built connection pair.
#[derive(Clone)]
pub(crate) struct Binding {
    pub(crate) pending: mpsc::Sender<Arc<dyn Connection>>,
    pub(crate) token: CancellationToken,
}

/// An isolated set of inproc listener bindings. Cheap to clone; clones share
/// the same address space.
#[derive(Clone, Default)]
pub struct Namespace {
    inner: Arc<Mutex<HashMap<String, Binding>>>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically installs a binding. Returns `false` if the address is
    /// already bound.
    pub(crate) fn bind(&self, addr: &str, binding: Binding) -> bool {
        let mut map = self.inner.lock().expect("namespace poisoned");
        if map.contains_key(addr) {
            return false;
        }
        debug!(addr, "inproc bind");
        map.insert(addr.to_string(), binding);
        true
    }

    pub(crate) fn get(&self, addr: &str) -> Option<Binding> {
        self.inner
            .lock()
            .expect("namespace poisoned")
            .get(addr)
            .cloned()
    }

    /// Removes a binding; called by listener close.
    pub(crate) fn free(&self, addr: &str) {
        debug!(addr, "inproc unbind");
        self.inner.lock().expect("namespace poisoned").remove(addr);
    }

    /// Whether an address is currently bound.
    pub fn contains(&self, addr: &str) -> bool {
        self.inner
            .lock()
            .expect("namespace poisoned")
            .contains_key(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding() -> Binding {
        let (tx, _rx) = mpsc::channel(1);
        Binding {
            pending: tx,
            token: CancellationToken::new(),
        }
    }

    #[test]
    fn bind_rejects_duplicates() {
        let ns = Namespace::new();
        assert!(ns.bind("/a", binding()));
        assert!(!ns.bind("/a", binding()));
        assert!(ns.bind("/b", binding()));
    }

    #[test]
    fn free_allows_rebind() {
        let ns = Namespace::new();
        assert!(ns.bind("/a", binding()));
        ns.free("/a");
        assert!(!ns.contains("/a"));
        assert!(ns.bind("/a", binding()));
    }

    #[test]
    fn get_missing_is_none() {
        let ns = Namespace::new();
        assert!(ns.get("/missing").is_none());
    }

    #[test]
    fn clones_share_address_space() {
        let ns = Namespace::new();
        let other = ns.clone();
        assert!(ns.bind("/a", binding()));
        assert!(other.contains("/a"));
        // But a fresh namespace is isolated.
        assert!(!Namespace::new().contains("/a"));
    }
}

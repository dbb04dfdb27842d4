//! Inproc listener: a bounded queue of pending connections plus a close
//! signal.

use super::namespace::Namespace;
use async_trait::async_trait;
use raceway_core::{Addr, Connection, Error, Listener, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub struct InprocListener {
    addr: Addr,
    pending: Mutex<mpsc::Receiver<Arc<dyn Connection>>>,
    token: CancellationToken,
    namespace: Namespace,
    closed: AtomicBool,
}

impl InprocListener {
    pub(crate) fn new(
        addr: Addr,
        pending: mpsc::Receiver<Arc<dyn Connection>>,
        token: CancellationToken,
        namespace: Namespace,
    ) -> Self {
        Self {
            addr,
            pending: Mutex::new(pending),
            token,
            namespace,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Listener for InprocListener {
    fn addr(&self) -> Addr {
        self.addr.clone()
    }

    async fn accept(&self) -> Result<Arc<dyn Connection>> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Closed),
            conn = async { self.pending.lock().await.recv().await } => {
                conn.ok_or(Error::Closed)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.namespace.free(self.addr.as_str());
        self.token.cancel();
        Ok(())
    }
}

impl Drop for InprocListener {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.namespace.free(self.addr.as_str());
            self.token.cancel();
        }
    }
}

//! In-process transport.
//!
//! Everything the OS would normally provide is implemented in memory:
//! naming (a [`Namespace`] of listener bindings), the connection handshake
//! (a rendezvous on the listener's pending queue), and stream transport
//! (per-stream duplex pipes). Addresses use the `inproc` network tag and an
//! arbitrary string, conventionally path-like (`"/echo"`).
//!
//! Because dialers are frequently also listeners, a transport may carry a
//! *dialback* address: the accepting side then observes that address as the
//! dialer's identity instead of the anonymous placeholder, and can dial it
//! back later.

mod conn;
mod listener;
mod namespace;

pub use conn::InprocConn;
pub use listener::InprocListener;
pub use namespace::{default_namespace, Namespace};

use async_trait::async_trait;
use conn::conn_pair;
use namespace::Binding;
use raceway_core::{
    Addr, Connection, Dialer, EndpointPair, Error, Listener, Network, Result, Transport,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Local address reported by dialers that did not configure a dialback.
const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Clone)]
pub struct InprocConfig {
    /// Pending connections a listener queues before dials block.
    pub backlog: usize,
    /// Buffer size of each stream's in-memory pipe.
    pub stream_buffer: usize,
}

impl Default for InprocConfig {
    fn default() -> Self {
        Self {
            backlog: 64,
            stream_buffer: 64 * 1024,
        }
    }
}

/// Transports bytes around the process.
#[derive(Clone)]
pub struct InprocTransport {
    namespace: Namespace,
    dialback: Option<Addr>,
    config: InprocConfig,
}

impl Default for InprocTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InprocTransport {
    /// Transport bound to the process-wide default namespace.
    pub fn new() -> Self {
        Self {
            namespace: default_namespace(),
            dialback: None,
            config: InprocConfig::default(),
        }
    }

    /// Uses an isolated namespace instead of the process-wide one.
    pub fn with_namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = namespace;
        self
    }

    /// Advertises `addr` as this dialer's identity: the accepting side will
    /// see it as the connection's remote address.
    pub fn with_dialback(mut self, addr: Addr) -> Self {
        self.dialback = Some(addr);
        self
    }

    pub fn with_config(mut self, config: InprocConfig) -> Self {
        self.config = config;
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn check_network(&self, addr: &Addr) -> Result<()> {
        if addr.network() != Network::Inproc {
            return Err(Error::InvalidNetwork {
                expected: Network::Inproc,
                actual: addr.network(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Dialer for InprocTransport {
    async fn dial(&self, addr: Addr) -> Result<Arc<dyn Connection>> {
        self.check_network(&addr)?;
        let local = match &self.dialback {
            Some(dialback) => {
                self.check_network(dialback)?;
                dialback.clone()
            }
            None => Addr::inproc(ANONYMOUS),
        };

        let binding = self
            .namespace
            .get(addr.as_str())
            .ok_or_else(|| Error::ConnectionRefused(addr.to_string()))?;

        let (local_view, remote_view) =
            conn_pair(EndpointPair::new(local, addr.clone()), self.config.stream_buffer);

        tokio::select! {
            sent = binding.pending.send(Arc::new(remote_view)) => {
                if sent.is_err() {
                    return Err(Error::ConnectionRefused(addr.to_string()));
                }
            }
            _ = binding.token.cancelled() => {
                return Err(Error::ConnectionRefused(addr.to_string()));
            }
        }

        debug!(%addr, "inproc dial accepted");
        Ok(Arc::new(local_view))
    }
}

#[async_trait]
impl Transport for InprocTransport {
    fn network(&self) -> Network {
        Network::Inproc
    }

    async fn listen(&self, addr: Addr) -> Result<Box<dyn Listener>> {
        self.check_network(&addr)?;

        let (tx, rx) = mpsc::channel(self.config.backlog);
        let token = CancellationToken::new();
        let binding = Binding {
            pending: tx,
            token: token.clone(),
        };
        if !self.namespace.bind(addr.as_str(), binding) {
            return Err(Error::AddressInUse(addr.to_string()));
        }

        Ok(Box::new(InprocListener::new(
            addr,
            rx,
            token,
            self.namespace.clone(),
        )))
    }
}

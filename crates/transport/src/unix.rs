//! Unix domain socket transport, muxed through the generic transport.

use crate::generic::GenericTransport;
use crate::hooks::ConnectHooks;
use crate::mux::{MuxConfig, YamuxAdapter};
use crate::net::{NetDialer, NetListener, RawConn, RawListener};
use async_trait::async_trait;
use raceway_core::{
    Addr, Connection, Dialer, EndpointPair, Error, Listener, Network, Result, Transport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener as TokioUnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

/// Peer addresses of Unix sockets are usually unnamed; dialed connections
/// report this placeholder as their local endpoint.
const ANONYMOUS: &str = "anonymous";

struct UnixConnector;

#[async_trait]
impl NetListener for UnixConnector {
    async fn listen(&self, addr: &Addr) -> Result<Box<dyn RawListener>> {
        let listener = TokioUnixListener::bind(addr.as_str())?;
        Ok(Box::new(UnixRawListener {
            listener,
            local: addr.clone(),
            token: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl NetDialer for UnixConnector {
    async fn dial(&self, addr: &Addr) -> Result<RawConn> {
        let stream = UnixStream::connect(addr.as_str())
            .await
            .map_err(|e| Error::Dial(e.to_string()))?;
        let endpoint = EndpointPair::new(Addr::unix(ANONYMOUS), addr.clone());
        Ok(RawConn::new(Box::new(stream), endpoint))
    }
}

struct UnixRawListener {
    listener: TokioUnixListener,
    local: Addr,
    token: CancellationToken,
    closed: AtomicBool,
}

#[async_trait]
impl RawListener for UnixRawListener {
    fn local_addr(&self) -> Addr {
        self.local.clone()
    }

    async fn accept(&self) -> Result<RawConn> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Closed),
            accepted = self.listener.accept() => {
                let (stream, _peer) = accepted?;
                let endpoint = EndpointPair::new(self.local.clone(), Addr::unix(ANONYMOUS));
                Ok(RawConn::new(Box::new(stream), endpoint))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.token.cancel();
        // The bound socket file outlives the listener otherwise.
        let _ = std::fs::remove_file(self.local.as_str());
        Ok(())
    }
}

/// Stream-multiplexed transport over Unix domain sockets.
#[derive(Clone)]
pub struct UnixTransport {
    inner: GenericTransport,
}

impl UnixTransport {
    pub fn new() -> Self {
        Self::with_config(MuxConfig::default())
    }

    pub fn with_config(config: MuxConfig) -> Self {
        let connector = Arc::new(UnixConnector);
        Self {
            inner: GenericTransport::new(
                Network::Unix,
                connector.clone(),
                connector,
                Arc::new(YamuxAdapter::new(config)),
            ),
        }
    }

    pub fn hooks(&self) -> &ConnectHooks {
        self.inner.hooks()
    }
}

impl Default for UnixTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for UnixTransport {
    async fn dial(&self, addr: Addr) -> Result<Arc<dyn Connection>> {
        self.inner.dial(addr).await
    }
}

#[async_trait]
impl Transport for UnixTransport {
    fn network(&self) -> Network {
        Network::Unix
    }

    async fn listen(&self, addr: Addr) -> Result<Box<dyn Listener>> {
        self.inner.listen(addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_wrong_network() {
        let transport = UnixTransport::new();
        let err = transport.dial(Addr::tcp("127.0.0.1:1")).await.unwrap_err();
        assert_eq!(
            err,
            Error::InvalidNetwork {
                expected: Network::Unix,
                actual: Network::Tcp,
            }
        );
    }

    #[tokio::test]
    async fn close_removes_socket_file() {
        let dir = std::env::temp_dir().join(format!("raceway-unix-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("listener.sock");
        let addr = Addr::unix(path.to_string_lossy().to_string());

        let transport = UnixTransport::new();
        let listener = transport.listen(addr).await.unwrap();
        assert!(path.exists());
        listener.close().await.unwrap();
        assert!(!path.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}

//! TCP transport: tokio sockets muxed through the generic transport.

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
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Raw TCP listen/dial.
struct TcpConnector;

#[async_trait]
impl NetListener for TcpConnector {
    async fn listen(&self, addr: &Addr) -> Result<Box<dyn RawListener>> {
        let listener = TokioTcpListener::bind(addr.as_str()).await?;
        let local = Addr::tcp(listener.local_addr()?.to_string());
        Ok(Box::new(TcpRawListener {
            listener,
            local,
            token: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl NetDialer for TcpConnector {
    async fn dial(&self, addr: &Addr) -> Result<RawConn> {
        let stream = TcpStream::connect(addr.as_str())
            .await
            .map_err(|e| Error::Dial(e.to_string()))?;
        let endpoint = EndpointPair::new(
            Addr::tcp(stream.local_addr()?.to_string()),
            Addr::tcp(stream.peer_addr()?.to_string()),
        );
        Ok(RawConn::new(Box::new(stream), endpoint))
    }
}

struct TcpRawListener {
    listener: TokioTcpListener,
    local: Addr,
    token: CancellationToken,
    closed: AtomicBool,
}

#[async_trait]
impl RawListener for TcpRawListener {
    fn local_addr(&self) -> Addr {
        self.local.clone()
    }

    async fn accept(&self) -> Result<RawConn> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Closed),
            accepted = self.listener.accept() => {
                let (stream, peer) = accepted?;
                let endpoint = EndpointPair::new(self.local.clone(), Addr::tcp(peer.to_string()));
                Ok(RawConn::new(Box::new(stream), endpoint))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.token.cancel();
        Ok(())
    }
}

/// Stream-multiplexed transport over TCP.
#[derive(Clone)]
pub struct TcpTransport {
    inner: GenericTransport,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::with_config(MuxConfig::default())
    }

    pub fn with_config(config: MuxConfig) -> Self {
        let connector = Arc::new(TcpConnector);
        Self {
            inner: GenericTransport::new(
                Network::Tcp,
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

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for TcpTransport {
    async fn dial(&self, addr: Addr) -> Result<Arc<dyn Connection>> {
        self.inner.dial(addr).await
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn network(&self) -> Network {
        Network::Tcp
    }

    async fn listen(&self, addr: Addr) -> Result<Box<dyn Listener>> {
        self.inner.listen(addr).await
    }
}

//! The generic transport: OS-level listen/dial composed with connect hooks
//! and a stream mux.
//!
//! Anything that can produce a raw duplex channel becomes a full
//! stream-multiplexed transport here; TCP and Unix are thin network-tag
//! wrappers around this type.

use crate::hooks::{ConnectHooks, EndpointRole};
use crate::mux::MuxAdapter;
use crate::net::{NetDialer, NetListener, RawListener};
use async_trait::async_trait;
use raceway_core::{Addr, Connection, Dialer, Error, Listener, Network, Result, Transport};
use std::sync::Arc;
use tracing::debug;

/// A transport assembled from a raw listener, a raw dialer, and a mux
/// adapter. Hooks run on every raw channel before muxing.
#[derive(Clone)]
pub struct GenericTransport {
    network: Network,
    listener: Arc<dyn NetListener>,
    dialer: Arc<dyn NetDialer>,
    mux: Arc<dyn MuxAdapter>,
    hooks: ConnectHooks,
}

impl GenericTransport {
    pub fn new(
        network: Network,
        listener: Arc<dyn NetListener>,
        dialer: Arc<dyn NetDialer>,
        mux: Arc<dyn MuxAdapter>,
    ) -> Self {
        Self {
            network,
            listener,
            dialer,
            mux,
            hooks: ConnectHooks::new(),
        }
    }

    /// The connect-hook registry shared by all listeners and dials of this
    /// transport.
    pub fn hooks(&self) -> &ConnectHooks {
        &self.hooks
    }

    fn check_network(&self, addr: &Addr) -> Result<()> {
        if addr.network() != self.network {
            return Err(Error::InvalidNetwork {
                expected: self.network,
                actual: addr.network(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Dialer for GenericTransport {
    async fn dial(&self, addr: Addr) -> Result<Arc<dyn Connection>> {
        self.check_network(&addr)?;
        let raw = self.dialer.dial(&addr).await?;
        let raw = self.hooks.run(raw, EndpointRole::Dial).await?;
        debug!(%addr, "dialed raw channel, adapting client mux");
        self.mux.adapt_client(raw).await
    }
}

#[async_trait]
impl Transport for GenericTransport {
    fn network(&self) -> Network {
        self.network
    }

    async fn listen(&self, addr: Addr) -> Result<Box<dyn Listener>> {
        self.check_network(&addr)?;
        let raw = self.listener.listen(&addr).await?;
        Ok(Box::new(GenericListener {
            raw,
            mux: self.mux.clone(),
            hooks: self.hooks.clone(),
        }))
    }
}

/// Wraps a raw listener so each accept muxes the accepted channel.
struct GenericListener {
    raw: Box<dyn RawListener>,
    mux: Arc<dyn MuxAdapter>,
    hooks: ConnectHooks,
}

#[async_trait]
impl Listener for GenericListener {
    fn addr(&self) -> Addr {
        self.raw.local_addr()
    }

    async fn accept(&self) -> Result<Arc<dyn Connection>> {
        let raw = self.raw.accept().await?;
        // On hook or mux failure the raw channel is dropped, which closes it.
        let raw = self.hooks.run(raw, EndpointRole::Listen).await?;
        self.mux.adapt_server(raw).await
    }

    async fn close(&self) -> Result<()> {
        self.raw.close().await
    }
}

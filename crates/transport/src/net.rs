//! Raw (pre-mux) listen/dial seams consumed by the generic transport.
//!
//! A net listener/dialer produces plain duplex byte channels; it knows
//! nothing about streams or muxing. The generic transport composes these
//! with connect hooks and a [`crate::mux::MuxAdapter`].

use async_trait::async_trait;
use raceway_core::stream::BoxIo;
use raceway_core::{Addr, EndpointPair, Result};

/// An established raw duplex channel plus its endpoint addresses.
pub struct RawConn {
    pub io: BoxIo,
    pub endpoint: EndpointPair,
}

impl RawConn {
    pub fn new(io: BoxIo, endpoint: EndpointPair) -> Self {
        Self { io, endpoint }
    }

    /// Replaces the byte channel, keeping the endpoints. Connect hooks use
    /// this to interpose handshakes or framing.
    pub fn map_io(self, wrap: impl FnOnce(BoxIo) -> BoxIo) -> Self {
        Self {
            io: wrap(self.io),
            endpoint: self.endpoint,
        }
    }
}

impl std::fmt::Debug for RawConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConn")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Produces raw listeners bound to an address.
#[async_trait]
pub trait NetListener: Send + Sync {
    async fn listen(&self, addr: &Addr) -> Result<Box<dyn RawListener>>;
}

/// A bound raw listener yielding duplex channels.
#[async_trait]
pub trait RawListener: Send + Sync {
    fn local_addr(&self) -> Addr;

    async fn accept(&self) -> Result<RawConn>;

    async fn close(&self) -> Result<()>;
}

/// Dials a raw duplex channel to an address.
#[async_trait]
pub trait NetDialer: Send + Sync {
    async fn dial(&self, addr: &Addr) -> Result<RawConn>;
}

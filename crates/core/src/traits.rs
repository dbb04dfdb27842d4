//! The transport trait surface.
//!
//! `Transport -> Listener -> Connection -> Stream` is the whole contract:
//! a transport listens and dials, a listener accepts connections, and a
//! connection multiplexes streams. Implementations live in
//! `raceway-transport`; the pool and server in `raceway-proto` consume only
//! these traits.

use crate::addr::{Addr, EndpointPair, Network};
use crate::error::Result;
use crate::stream::Stream;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A logical connection between two peers onto which streams are
/// multiplexed.
///
/// The endpoint pair is fixed for the connection's lifetime, and the
/// lifecycle token transitions exactly once from live to cancelled. Closing
/// the connection cancels every stream derived from it.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The (local, remote) address pair of this connection.
    fn endpoint(&self) -> EndpointPair;

    /// Lifecycle token; cancelled exactly when the connection closes.
    fn closed(&self) -> CancellationToken;

    fn is_closed(&self) -> bool {
        self.closed().is_cancelled()
    }

    /// Opens a fresh outbound stream, usable immediately.
    async fn open_stream(&self) -> Result<Stream>;

    /// Waits until the peer opens a stream, or the connection closes.
    async fn accept_stream(&self) -> Result<Stream>;

    /// Closes the connection and all derived streams.
    async fn close(&self) -> Result<()>;
}

/// Accepts incoming connections at a bound local address.
///
/// `close` succeeds once; subsequent calls report `Closed`. Closing a
/// listener does not close connections it already produced.
#[async_trait]
pub trait Listener: Send + Sync {
    fn addr(&self) -> Addr;

    /// Yields connections one at a time. Fails with `Closed` once the
    /// listener is closed.
    async fn accept(&self) -> Result<Arc<dyn Connection>>;

    async fn close(&self) -> Result<()>;
}

/// The client end of a transport. Split out from [`Transport`] so dial
/// strategies can wrap any dialer without caring about the listen side.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: Addr) -> Result<Arc<dyn Connection>>;
}

/// A means of listening for and dialing connections over one network family.
#[async_trait]
pub trait Transport: Dialer {
    /// The network tag this transport accepts.
    fn network(&self) -> Network;

    async fn listen(&self, addr: Addr) -> Result<Box<dyn Listener>>;
}

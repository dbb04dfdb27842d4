//! Strategy-backed client: one call from address to open stream.

use crate::strategy::{default_strategy, StreamCountStrategy};
use raceway_core::{Addr, Dialer, Result, Stream};
use std::sync::Arc;

/// Connects to servers, reusing pooled connections via a
/// [`StreamCountStrategy`].
#[derive(Clone)]
pub struct Client {
    dialer: Arc<dyn Dialer>,
    strategy: StreamCountStrategy,
}

impl Client {
    /// Client over the process-wide default strategy.
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            strategy: default_strategy(),
        }
    }

    /// Uses an isolated strategy instead of the process-wide one.
    pub fn with_strategy(mut self, strategy: StreamCountStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> &StreamCountStrategy {
        &self.strategy
    }

    /// Opens a stream to the server at `addr`, dialing a connection only if
    /// the pool has none.
    pub async fn connect(&self, addr: Addr) -> Result<Stream> {
        let (conn, _cached) = self.strategy.get_conn(self.dialer.as_ref(), addr).await?;
        conn.open_stream().await
    }
}

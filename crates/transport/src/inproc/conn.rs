//! In-memory connection pairs.
//!
//! A dial constructs two connection views sharing one cancellation token,
//! two stream channels (one per direction), and a pair of error cells. No
//! bytes flow at the connection level; each stream gets its own in-memory
//! duplex pipe, handed across the peer's stream channel on open.

use async_trait::async_trait;
use raceway_core::sync::ErrorCell;
use raceway_core::{Connection, EndpointPair, Error, Result, Stream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// One side's view of an in-memory connection.
pub struct InprocConn {
    endpoint: EndpointPair,
    token: CancellationToken,
    /// Streams we open travel to the peer here.
    outbound: mpsc::Sender<Stream>,
    /// Streams the peer opens arrive here.
    inbound: Mutex<mpsc::Receiver<Stream>>,
    /// Cause of closure as stored by the peer; read on our failures.
    local_cause: Arc<ErrorCell>,
    /// The peer's cell; we store our cause here when closing.
    peer_cause: Arc<ErrorCell>,
    next_id: Arc<AtomicU64>,
    stream_buffer: usize,
}

/// Builds the two views of a connection. `endpoint` is as seen from the
/// dialing (local) side; the accepting side sees it flipped.
pub(crate) fn conn_pair(endpoint: EndpointPair, stream_buffer: usize) -> (InprocConn, InprocConn) {
    let token = CancellationToken::new();
    let next_id = Arc::new(AtomicU64::new(0));
    let (l2r_tx, l2r_rx) = mpsc::channel(1);
    let (r2l_tx, r2l_rx) = mpsc::channel(1);
    let dial_cell = Arc::new(ErrorCell::new());
    let accept_cell = Arc::new(ErrorCell::new());

    let local = InprocConn {
        endpoint: endpoint.clone(),
        token: token.clone(),
        outbound: l2r_tx,
        inbound: Mutex::new(r2l_rx),
        local_cause: dial_cell.clone(),
        peer_cause: accept_cell.clone(),
        next_id: next_id.clone(),
        stream_buffer,
    };
    let remote = InprocConn {
        endpoint: endpoint.flipped(),
        token,
        outbound: r2l_tx,
        inbound: Mutex::new(l2r_rx),
        local_cause: accept_cell,
        peer_cause: dial_cell,
        next_id,
        stream_buffer,
    };
    (local, remote)
}

impl InprocConn {
    fn cause(&self) -> Error {
        self.local_cause.cause()
    }

    /// Closes the connection, recording `cause` for the peer to observe.
    pub fn close_with_error(&self, cause: Error) -> Result<()> {
        if self.token.is_cancelled() {
            return Ok(());
        }
        self.peer_cause.store(cause);
        self.token.cancel();
        Ok(())
    }
}

#[async_trait]
impl Connection for InprocConn {
    fn endpoint(&self) -> EndpointPair {
        self.endpoint.clone()
    }

    fn closed(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn open_stream(&self) -> Result<Stream> {
        if self.token.is_cancelled() {
            return Err(self.cause());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (local_io, remote_io) = tokio::io::duplex(self.stream_buffer);
        let local = Stream::new(
            id,
            Box::new(local_io),
            self.endpoint.clone(),
            self.token.child_token(),
        );
        let remote = Stream::new(
            id,
            Box::new(remote_io),
            self.endpoint.flipped(),
            self.token.child_token(),
        );

        tokio::select! {
            sent = self.outbound.send(remote) => match sent {
                Ok(()) => Ok(local),
                Err(_) => Err(self.cause()),
            },
            _ = self.token.cancelled() => Err(self.cause()),
        }
    }

    async fn accept_stream(&self) -> Result<Stream> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.cause()),
            stream = async { self.inbound.lock().await.recv().await } => {
                stream.ok_or_else(|| self.cause())
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.close_with_error(Error::Closed)
    }
}

impl Drop for InprocConn {
    fn drop(&mut self) {
        // A view dropped without close still terminates the connection;
        // the peer would otherwise block forever on a half-dead pair.
        let _ = self.close_with_error(Error::Closed);
    }
}

impl std::fmt::Debug for InprocConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InprocConn")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.token.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raceway_core::Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (InprocConn, InprocConn) {
        let ep = EndpointPair::new(Addr::inproc("/dialer"), Addr::inproc("/listener"));
        conn_pair(ep, 64 * 1024)
    }

    #[tokio::test]
    async fn endpoints_are_mirrored() {
        let (local, remote) = pair();
        assert_eq!(local.endpoint().local, Addr::inproc("/dialer"));
        assert_eq!(local.endpoint().remote, Addr::inproc("/listener"));
        assert_eq!(remote.endpoint().local, Addr::inproc("/listener"));
        assert_eq!(remote.endpoint().remote, Addr::inproc("/dialer"));
    }

    #[tokio::test]
    async fn open_and_accept_round_trip() {
        let (local, remote) = pair();

        let acceptor = tokio::spawn(async move {
            let mut stream = remote.accept_stream().await.unwrap();
            let mut buf = vec![0u8; 6];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = local.open_stream().await.unwrap();
        stream.write_all(b"dialer").await.unwrap();

        assert_eq!(acceptor.await.unwrap(), b"dialer");
    }

    #[tokio::test]
    async fn stream_endpoints_mirror_conn() {
        let (local, remote) = pair();
        let opened = local.open_stream().await.unwrap();
        let accepted = remote.accept_stream().await.unwrap();

        assert_eq!(opened.endpoint(), &local.endpoint());
        assert_eq!(accepted.endpoint(), &remote.endpoint());
        assert_eq!(opened.id(), accepted.id());
    }

    #[tokio::test]
    async fn close_unblocks_peer_accept() {
        let (local, remote) = pair();

        let acceptor = tokio::spawn(async move { remote.accept_stream().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        local.close().await.unwrap();

        assert_eq!(acceptor.await.unwrap().unwrap_err(), Error::Closed);
    }

    #[tokio::test]
    async fn close_cause_reaches_peer() {
        let (local, remote) = pair();
        local
            .close_with_error(Error::Temporary("going away".into()))
            .unwrap();

        let err = remote.accept_stream().await.unwrap_err();
        assert_eq!(err, Error::Temporary("going away".into()));
        // Dialer-side operations report the default cause.
        assert_eq!(local.open_stream().await.unwrap_err(), Error::Closed);
    }

    #[tokio::test]
    async fn close_cascades_to_streams() {
        let (local, remote) = pair();
        let mut opened = local.open_stream().await.unwrap();
        let mut accepted = remote.accept_stream().await.unwrap();

        local.close().await.unwrap();

        let mut buf = [0u8; 1];
        assert!(opened.read(&mut buf).await.is_err());
        assert!(accepted.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn drop_terminates_pair() {
        let (local, remote) = pair();
        drop(local);
        assert!(remote.is_closed());
        assert_eq!(remote.accept_stream().await.unwrap_err(), Error::Closed);
    }
}

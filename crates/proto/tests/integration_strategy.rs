//! Pool behavior over a live inproc transport: dial coalescing, refcount
//! eviction, failure delivery, and tracking.

use async_trait::async_trait;
use raceway_core::{Addr, Connection, Dialer, Error, Listener, Result, Transport};
use raceway_proto::strategy::StreamCountStrategy;
use raceway_transport::inproc::{InprocTransport, Namespace};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counts how many times the underlying dial actually runs.
struct CountingDialer {
    inner: InprocTransport,
    dials: AtomicUsize,
}

impl CountingDialer {
    fn new(inner: InprocTransport) -> Self {
        Self {
            inner,
            dials: AtomicUsize::new(0),
        }
    }

    fn count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for CountingDialer {
    async fn dial(&self, addr: Addr) -> Result<Arc<dyn Connection>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.dial(addr).await
    }
}

/// Keeps accepting connections, and streams on them, so dials and opens
/// rendezvous.
fn accept_forever(listener: Box<dyn Listener>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(conn) = listener.accept().await {
            tokio::spawn(async move {
                let mut held = Vec::new();
                while let Ok(stream) = conn.accept_stream().await {
                    held.push(stream);
                }
            });
        }
    })
}

#[tokio::test]
async fn concurrent_dials_coalesce() {
    let transport = InprocTransport::new().with_namespace(Namespace::new());
    let listener = transport.listen(Addr::inproc("/pool")).await.unwrap();
    let _acceptor = accept_forever(listener);

    let dialer = Arc::new(CountingDialer::new(transport));
    let strategy = StreamCountStrategy::new();

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let dialer = dialer.clone();
        let strategy = strategy.clone();
        tasks.push(tokio::spawn(async move {
            strategy
                .get_conn(dialer.as_ref(), Addr::inproc("/pool"))
                .await
        }));
    }

    let mut conns = Vec::new();
    let mut fresh = 0;
    for task in tasks {
        let (conn, cached) = task.await.unwrap().unwrap();
        if !cached {
            fresh += 1;
        }
        conns.push(conn);
    }

    assert_eq!(dialer.count(), 1, "exactly one underlying dial");
    assert_eq!(fresh, 1, "exactly one caller sees cached=false");
    for conn in &conns[1..] {
        assert!(
            Arc::ptr_eq(&conns[0], conn),
            "all callers share one connection"
        );
    }
}

#[tokio::test]
async fn eviction_after_last_stream_closes() {
    let transport = InprocTransport::new().with_namespace(Namespace::new());
    let listener = transport.listen(Addr::inproc("/evict")).await.unwrap();
    let _acceptor = accept_forever(listener);

    let dialer = Arc::new(CountingDialer::new(transport));
    let strategy = StreamCountStrategy::new();

    let (conn, cached) = strategy
        .get_conn(dialer.as_ref(), Addr::inproc("/evict"))
        .await
        .unwrap();
    assert!(!cached);

    let mut streams = Vec::new();
    for _ in 0..10 {
        streams.push(conn.open_stream().await.unwrap());
    }
    assert_eq!(strategy.len(), 1);

    for mut stream in streams {
        stream.close().await.unwrap();
    }

    // The last close evicted the slot and closed the connection.
    assert!(strategy.is_empty());
    assert!(conn.is_closed());

    let (fresh, cached) = strategy
        .get_conn(dialer.as_ref(), Addr::inproc("/evict"))
        .await
        .unwrap();
    assert!(!cached);
    assert_eq!(dialer.count(), 2, "eviction forces a fresh dial");
    assert!(!Arc::ptr_eq(&conn, &fresh));
}

#[tokio::test]
async fn dial_failure_is_not_cached() {
    let transport = InprocTransport::new().with_namespace(Namespace::new());
    let dialer = Arc::new(CountingDialer::new(transport.clone()));
    let strategy = StreamCountStrategy::new();

    let err = strategy
        .get_conn(dialer.as_ref(), Addr::inproc("/nobody"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConnectionRefused(_)));
    assert!(strategy.is_empty(), "failed slots are discarded");

    // Binding a listener makes the next call succeed; no stale failure.
    let listener = transport.listen(Addr::inproc("/nobody")).await.unwrap();
    let _acceptor = accept_forever(listener);
    let (_, cached) = strategy
        .get_conn(dialer.as_ref(), Addr::inproc("/nobody"))
        .await
        .unwrap();
    assert!(!cached);
    assert_eq!(dialer.count(), 2);
}

#[tokio::test]
async fn remote_close_evicts_slot() {
    let transport = InprocTransport::new().with_namespace(Namespace::new());
    let listener = transport.listen(Addr::inproc("/remote")).await.unwrap();

    let strategy = StreamCountStrategy::new();
    let dialer = Arc::new(CountingDialer::new(transport));

    let accepted = {
        let get = strategy.get_conn(dialer.as_ref(), Addr::inproc("/remote"));
        let accept = listener.accept();
        let (got, accepted) = tokio::join!(get, accept);
        got.unwrap();
        accepted.unwrap()
    };
    assert_eq!(strategy.len(), 1);

    // Remote side closes; the slot goes away even with zero streams.
    accepted.close().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), async {
        while !strategy.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("slot never evicted after remote close");
}

#[tokio::test]
async fn track_participates_in_eviction() {
    let transport = InprocTransport::new().with_namespace(Namespace::new());
    let listener = transport.listen(Addr::inproc("/track")).await.unwrap();

    let client = InprocTransport::new()
        .with_namespace(transport.namespace().clone())
        .with_dialback(Addr::inproc("/client"));
    let dialed = client.dial(Addr::inproc("/track")).await.unwrap();
    let accepted = listener.accept().await.unwrap();

    // The listener side caches the accepted connection under the dialback
    // address so it can open streams back to the dialer.
    let strategy = StreamCountStrategy::new();
    let counted = strategy.track(accepted.clone(), 0).unwrap();
    assert_eq!(strategy.len(), 1);

    // Tracking the same address twice is rejected.
    let err = strategy.track(accepted, 0).unwrap_err();
    assert_eq!(err, Error::AlreadyTracking("inproc:///client".into()));

    // Streams through the tracked connection drive eviction as usual.
    let open = counted.open_stream();
    let accept = dialed.accept_stream();
    let (opened, _accepted_stream) = tokio::join!(open, accept);
    let mut stream = opened.unwrap();
    stream.close().await.unwrap();
    assert!(strategy.is_empty());
}

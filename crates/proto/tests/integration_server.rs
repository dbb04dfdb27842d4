//! Server behavior over the inproc transport: echo service, state
//! transitions, backoff, and both shutdown flavors.

use async_trait::async_trait;
use raceway_core::state::{ConnState, StreamState};
use raceway_core::{Addr, Connection, Dialer, Error, Listener, Result, Transport};
use raceway_proto::backoff::BackoffPolicy;
use raceway_proto::{handler_fn, Client, Server, StreamCountStrategy};
use raceway_transport::inproc::{InprocTransport, Namespace};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

fn isolated() -> InprocTransport {
    InprocTransport::new().with_namespace(Namespace::new())
}

fn echo_handler() -> Arc<dyn raceway_proto::StreamHandler> {
    handler_fn(|mut stream| async move {
        let mut buf = [0u8; 32];
        if let Ok(n) = stream.read(&mut buf).await {
            let _ = stream.write_all(&buf[..n]).await;
        }
        let _ = stream.close().await;
    })
}

#[tokio::test]
async fn echo_through_pooled_client() {
    let transport = isolated();
    let listener = transport.listen(Addr::inproc("/echo")).await.unwrap();

    let server = Server::new(echo_handler());
    let serve = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    let client = Client::new(Arc::new(transport)).with_strategy(StreamCountStrategy::new());
    let mut stream = client.connect(Addr::inproc("/echo")).await.unwrap();
    stream.write_all(b"hello, world!").await.unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"hello, world!");

    stream.close().await.unwrap();
    server.close().await.unwrap();
    assert_eq!(serve.await.unwrap(), Err(Error::ServerClosed));
}

#[tokio::test]
async fn graceful_shutdown_preserves_streams() {
    let transport = isolated();
    let listener = transport.listen(Addr::inproc("/drain")).await.unwrap();

    // Writes the ack, then stays busy past the shutdown call.
    let server = Server::new(handler_fn(|mut stream| async move {
        let mut buf = [0u8; 4];
        let _ = stream.read_exact(&mut buf).await;
        let _ = stream.write_all(b"ack").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = stream.close().await;
    }));
    let serve = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    let client = Client::new(Arc::new(transport.clone())).with_strategy(StreamCountStrategy::new());
    let mut stream = client.connect(Addr::inproc("/drain")).await.unwrap();
    stream.write_all(b"ping").await.unwrap();

    let deadline = CancellationToken::new();
    let shutdown = {
        let server = server.clone();
        let deadline = deadline.clone();
        tokio::spawn(async move { server.shutdown(deadline).await })
    };

    // The in-flight handler still answers after shutdown began.
    let mut ack = [0u8; 3];
    stream.read_exact(&mut ack).await.unwrap();
    assert_eq!(&ack, b"ack");
    stream.close().await.unwrap();

    assert_eq!(shutdown.await.unwrap(), Ok(()));
    // The listener is gone: fresh dials are refused.
    assert!(matches!(
        transport.dial(Addr::inproc("/drain")).await.unwrap_err(),
        Error::ConnectionRefused(_)
    ));
    assert!(serve.await.unwrap().is_err());
}

#[tokio::test]
async fn shutdown_times_out_with_connection_held_open() {
    let transport = isolated();
    let listener = transport.listen(Addr::inproc("/stuck")).await.unwrap();

    let server = Server::new(echo_handler());
    let _serve = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    // Dial and keep the connection open so the set never drains.
    let conn = transport.dial(Addr::inproc("/stuck")).await.unwrap();
    let _held = conn.open_stream().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let deadline = CancellationToken::new();
    {
        let deadline = deadline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            deadline.cancel();
        });
    }
    assert_eq!(server.shutdown(deadline).await, Err(Error::Cancelled));
}

#[tokio::test]
async fn server_closed_is_sticky() {
    let transport = isolated();
    let listener = transport.listen(Addr::inproc("/sticky")).await.unwrap();

    let server = Server::new(echo_handler());
    assert_eq!(server.close().await, Ok(()));
    assert_eq!(server.close().await, Err(Error::ServerClosed));
    assert_eq!(server.serve(listener).await, Err(Error::ServerClosed));
}

#[tokio::test]
async fn state_observers_see_transitions() {
    let transport = isolated();
    let listener = transport.listen(Addr::inproc("/states")).await.unwrap();

    let conn_states = Arc::new(Mutex::new(Vec::new()));
    let stream_states = Arc::new(Mutex::new(Vec::new()));

    let server = {
        let conn_states = conn_states.clone();
        let stream_states = stream_states.clone();
        Server::builder(echo_handler())
            .on_conn_state(Arc::new(move |_conn, state| {
                conn_states.lock().unwrap().push(state);
            }))
            .on_stream_state(Arc::new(move |_info, state| {
                stream_states.lock().unwrap().push(state);
            }))
            .build()
    };
    let _serve = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    let conn = transport.dial(Addr::inproc("/states")).await.unwrap();
    let mut stream = conn.open_stream().await.unwrap();
    stream.write_all(b"hi").await.unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    stream.close().await.unwrap();

    // Let the handler's completion land before closing the connection, so
    // the idle transition is observable.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if stream_states.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stream never went idle");
    conn.close().await.unwrap();

    // Transitions land asynchronously; wait for the terminal conn state.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if conn_states.lock().unwrap().last() == Some(&ConnState::Closed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection never closed");

    assert_eq!(
        *conn_states.lock().unwrap(),
        vec![ConnState::Open, ConnState::Idle, ConnState::Closed]
    );
    assert_eq!(
        *stream_states.lock().unwrap(),
        vec![StreamState::Open, StreamState::Idle]
    );
}

/// Listener whose accept fails transiently before failing for good.
struct FlakyListener {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Listener for FlakyListener {
    fn addr(&self) -> Addr {
        Addr::inproc("/flaky")
    }

    async fn accept(&self) -> Result<Arc<dyn Connection>> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 | 1 => Err(Error::Temporary("accept overload".into())),
            _ => Err(Error::Io("boom".into())),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn temporary_accept_errors_back_off() {
    let calls = Arc::new(AtomicUsize::new(0));
    let listener = Box::new(FlakyListener {
        calls: calls.clone(),
    });

    let server = Server::builder(echo_handler())
        .backoff(BackoffPolicy {
            min: Duration::from_millis(10),
            max: Duration::from_millis(100),
            factor: 2.0,
            jitter: false,
        })
        .build();

    let started = tokio::time::Instant::now();
    let result = server.serve(listener).await;

    assert_eq!(result, Err(Error::Io("boom".into())));
    assert_eq!(calls.load(Ordering::SeqCst), 3, "two retries then fatal");
    // Two backoff sleeps: 10ms + 20ms.
    assert!(started.elapsed() >= Duration::from_millis(30));
}

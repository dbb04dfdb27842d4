//! A negation service with state observers: every connection and stream
//! transition is logged as it happens.
//!
//! Five clients connect through a pooled [`Client`]; each sends one byte
//! and reads back its negation.

use anyhow::Context;
use raceway_core::{Addr, Connection, Transport};
use raceway_proto::{handler_fn, Client, Server};
use raceway_transport::logging::init_tracing;
use raceway_transport::InprocTransport;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let transport = InprocTransport::new();
    let addr = Addr::inproc("/test");
    let listener = transport.listen(addr.clone()).await.context("listen")?;

    let server = Server::builder(handler_fn(|mut stream| async move {
        let mut byte = [0u8; 1];
        if stream.read_exact(&mut byte).await.is_ok() {
            let negated = (byte[0] as i8).wrapping_neg() as u8;
            let _ = stream.write_all(&[negated]).await;
        }
        let _ = stream.close().await;
    }))
    .on_conn_state(Arc::new(|conn, state| {
        info!(remote = %conn.endpoint().remote, "connection {state}");
    }))
    .on_stream_state(Arc::new(|stream, state| {
        info!(id = stream.id, "stream {state}");
    }))
    .build();

    let serve = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    let client = Client::new(Arc::new(transport));
    let mut requests = Vec::new();
    for i in 0..5i8 {
        let client = client.clone();
        let addr = addr.clone();
        requests.push(tokio::spawn(async move {
            let mut stream = client.connect(addr).await.context("connect")?;
            stream.write_all(&[i as u8]).await.context("write")?;

            let mut reply = [0u8; 1];
            stream.read_exact(&mut reply).await.context("read")?;
            info!(sent = i, received = reply[0] as i8, "round trip");

            stream.close().await.context("close stream")?;
            anyhow::Ok(())
        }));
    }
    for request in requests {
        request.await??;
    }

    server.close().await.context("close server")?;
    let _ = serve.await?;
    Ok(())
}

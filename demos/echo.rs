//! Minimal inproc round trip: one side listens and reads, the other dials
//! and writes.

use anyhow::Context;
use raceway_core::{Addr, Connection, Dialer, Transport};
use raceway_transport::logging::init_tracing;
use raceway_transport::InprocTransport;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let transport = InprocTransport::new();
    let addr = Addr::inproc("/test");

    let listener = transport.listen(addr.clone()).await.context("listen")?;
    let listen_side = tokio::spawn(async move {
        let conn = listener.accept().await.context("accept")?;
        let mut stream = conn.accept_stream().await.context("accept stream")?;

        let mut message = String::new();
        stream
            .read_to_string(&mut message)
            .await
            .context("read bytes")?;
        println!("{message}");

        conn.close().await.context("close")?;
        anyhow::Ok(())
    });

    let conn = transport.dial(addr).await.context("dial")?;
    let mut stream = conn.open_stream().await.context("open stream")?;
    stream
        .write_all(b"hello, world!")
        .await
        .context("write bytes")?;
    stream.close().await.context("close stream")?;

    listen_side.await??;
    Ok(())
}

//! QUIC transport via quinn.
//!
//! QUIC multiplexes natively, so no mux adapter is involved: a quinn
//! connection *is* a stream-multiplexed connection. Addresses use the
//! `udp` network tag.
//!
//! Uses quinn + rustls with ring crypto. Certificates are self-signed and
//! client verification is skipped; production deployments should install a
//! proper PKI via [`QuicConfig`].

use async_trait::async_trait;
use quinn::{ClientConfig, Endpoint, ServerConfig};
use raceway_core::{
    Addr, Connection, Dialer, EndpointPair, Error, Listener, Network, Result, Stream, Transport,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// QUIC transport tuning.
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Upper bound on concurrent bidirectional streams per connection.
    pub max_concurrent_streams: u32,
    /// Keep-alive interval for idle connections.
    pub keep_alive: Duration,
    /// Dial timeout.
    pub connect_timeout: Duration,
    /// TLS server name presented on dial.
    pub server_name: String,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 100,
            keep_alive: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            server_name: "localhost".into(),
        }
    }
}

/// Stream-multiplexed transport over QUIC.
pub struct QuicTransport {
    config: QuicConfig,
    server_config: ServerConfig,
    client_config: ClientConfig,
    /// Client endpoint, lazily bound on first dial.
    client_endpoint: Mutex<Option<Endpoint>>,
}

impl QuicTransport {
    pub fn new() -> Result<Self> {
        Self::with_config(QuicConfig::default())
    }

    pub fn with_config(config: QuicConfig) -> Result<Self> {
        let (cert, key) = generate_self_signed_cert()?;
        let server_config = build_server_config(cert, key, &config)?;
        let client_config = build_client_config_insecure(&config)?;

        Ok(Self {
            config,
            server_config,
            client_config,
            client_endpoint: Mutex::new(None),
        })
    }

    fn check_network(&self, addr: &Addr) -> Result<()> {
        if addr.network() != Network::Udp {
            return Err(Error::InvalidNetwork {
                expected: Network::Udp,
                actual: addr.network(),
            });
        }
        Ok(())
    }

    async fn client_endpoint(&self, remote: SocketAddr) -> Result<Endpoint> {
        let mut guard = self.client_endpoint.lock().await;
        if let Some(endpoint) = guard.as_ref() {
            return Ok(endpoint.clone());
        }

        let bind: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().expect("static addr")
        } else {
            "[::]:0".parse().expect("static addr")
        };
        let mut endpoint = Endpoint::client(bind).map_err(|e| Error::Dial(e.to_string()))?;
        endpoint.set_default_client_config(self.client_config.clone());
        *guard = Some(endpoint.clone());
        Ok(endpoint)
    }
}

#[async_trait]
impl Dialer for QuicTransport {
    async fn dial(&self, addr: Addr) -> Result<Arc<dyn Connection>> {
        self.check_network(&addr)?;
        let remote: SocketAddr = addr
            .as_str()
            .parse()
            .map_err(|_| Error::Dial(format!("invalid socket address: {}", addr.as_str())))?;

        let endpoint = self.client_endpoint(remote).await?;
        let connecting = endpoint
            .connect(remote, &self.config.server_name)
            .map_err(|e| Error::Dial(e.to_string()))?;

        let connection = tokio::time::timeout(self.config.connect_timeout, connecting)
            .await
            .map_err(|_| {
                Error::Dial(format!(
                    "connect to {remote} timed out after {:?}",
                    self.config.connect_timeout
                ))
            })?
            .map_err(|e| Error::Dial(e.to_string()))?;

        let local = endpoint
            .local_addr()
            .map(|a| Addr::quic(a.to_string()))
            .unwrap_or_else(|_| Addr::quic("0.0.0.0:0"));
        debug!(%addr, "quic connection established");
        Ok(Arc::new(QuicConnection::new(
            connection,
            EndpointPair::new(local, addr),
        )))
    }
}

#[async_trait]
impl Transport for QuicTransport {
    fn network(&self) -> Network {
        Network::Udp
    }

    async fn listen(&self, addr: Addr) -> Result<Box<dyn Listener>> {
        self.check_network(&addr)?;
        let bind: SocketAddr = addr
            .as_str()
            .parse()
            .map_err(|_| Error::Io(format!("invalid socket address: {}", addr.as_str())))?;

        let endpoint = Endpoint::server(self.server_config.clone(), bind)?;
        let local = Addr::quic(endpoint.local_addr()?.to_string());
        Ok(Box::new(QuicListener {
            endpoint,
            local,
            token: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct QuicListener {
    endpoint: Endpoint,
    local: Addr,
    token: CancellationToken,
    closed: AtomicBool,
}

#[async_trait]
impl Listener for QuicListener {
    fn addr(&self) -> Addr {
        self.local.clone()
    }

    async fn accept(&self) -> Result<Arc<dyn Connection>> {
        loop {
            let incoming = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(Error::Closed),
                incoming = self.endpoint.accept() => incoming.ok_or(Error::Closed)?,
            };

            let remote = incoming.remote_address();
            match incoming.await {
                Ok(connection) => {
                    let endpoint = EndpointPair::new(
                        self.local.clone(),
                        Addr::quic(remote.to_string()),
                    );
                    return Ok(Arc::new(QuicConnection::new(connection, endpoint)));
                }
                // A failed handshake only concerns that one peer.
                Err(err) => {
                    warn!(%remote, error = %err, "quic handshake failed");
                    continue;
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        // The endpoint itself stays open: quinn's Endpoint::close would tear
        // down connections this listener already produced.
        self.token.cancel();
        Ok(())
    }
}

struct QuicConnection {
    connection: quinn::Connection,
    endpoint: EndpointPair,
    token: CancellationToken,
    next_id: AtomicU64,
}

impl QuicConnection {
    fn new(connection: quinn::Connection, endpoint: EndpointPair) -> Self {
        let token = CancellationToken::new();

        let watched = connection.clone();
        let watch_token = token.clone();
        tokio::spawn(async move {
            watched.closed().await;
            watch_token.cancel();
        });

        Self {
            connection,
            endpoint,
            token,
            next_id: AtomicU64::new(0),
        }
    }

    fn wrap(&self, send: quinn::SendStream, recv: quinn::RecvStream) -> Stream {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Stream::new(
            id,
            Box::new(tokio::io::join(recv, send)),
            self.endpoint.clone(),
            self.token.child_token(),
        )
    }
}

#[async_trait]
impl Connection for QuicConnection {
    fn endpoint(&self) -> EndpointPair {
        self.endpoint.clone()
    }

    fn closed(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn open_stream(&self) -> Result<Stream> {
        let (send, recv) = self.connection.open_bi().await.map_err(map_conn_err)?;
        Ok(self.wrap(send, recv))
    }

    async fn accept_stream(&self) -> Result<Stream> {
        let (send, recv) = self.connection.accept_bi().await.map_err(map_conn_err)?;
        Ok(self.wrap(send, recv))
    }

    async fn close(&self) -> Result<()> {
        self.connection.close(0u32.into(), b"closed");
        self.token.cancel();
        Ok(())
    }
}

fn map_conn_err(err: quinn::ConnectionError) -> Error {
    match err {
        quinn::ConnectionError::ApplicationClosed(_)
        | quinn::ConnectionError::LocallyClosed
        | quinn::ConnectionError::ConnectionClosed(_)
        | quinn::ConnectionError::Reset => Error::Closed,
        quinn::ConnectionError::TimedOut => Error::Temporary(err.to_string()),
        other => Error::Io(other.to_string()),
    }
}

fn generate_self_signed_cert() -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
        .map_err(|e| Error::MuxSetup(format!("failed to generate cert: {e}")))?;

    let cert_der = CertificateDer::from(cert.cert);
    let key_der = PrivateKeyDer::try_from(cert.key_pair.serialize_der())
        .map_err(|e| Error::MuxSetup(format!("failed to serialize key: {e}")))?;

    Ok((cert_der, key_der))
}

fn build_server_config(
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
    config: &QuicConfig,
) -> Result<ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| Error::MuxSetup(format!("failed to build TLS config: {e}")))?;
    server_crypto.alpn_protocols = vec![b"raceway".to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .map_err(|e| Error::MuxSetup(format!("quic crypto config failed: {e}")))?,
    ));
    server_config.transport_config(Arc::new(transport_config(config)));
    Ok(server_config)
}

fn build_client_config_insecure(config: &QuicConfig) -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![b"raceway".to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .map_err(|e| Error::MuxSetup(format!("quic crypto config failed: {e}")))?,
    ));
    client_config.transport_config(Arc::new(transport_config(config)));
    Ok(client_config)
}

fn transport_config(config: &QuicConfig) -> quinn::TransportConfig {
    let mut transport = quinn::TransportConfig::default();
    transport.max_concurrent_bidi_streams(config.max_concurrent_streams.into());
    transport.max_concurrent_uni_streams(config.max_concurrent_streams.into());
    transport.keep_alive_interval(Some(config.keep_alive));
    transport
}

/// Certificate verifier that skips all validation. Testing only.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn rejects_wrong_network() {
        let transport = QuicTransport::new().unwrap();
        let err = transport.dial(Addr::tcp("127.0.0.1:1")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidNetwork { .. }));
    }

    #[tokio::test]
    async fn dial_without_listener_times_out() {
        let transport = QuicTransport::with_config(QuicConfig {
            connect_timeout: Duration::from_millis(200),
            ..QuicConfig::default()
        })
        .unwrap();

        let result = transport.dial(Addr::quic("127.0.0.1:9")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn listen_dial_echo() {
        let server = QuicTransport::new().unwrap();
        let client = QuicTransport::new().unwrap();

        let listener = server.listen(Addr::quic("127.0.0.1:0")).await.unwrap();
        let addr = listener.addr();

        let server_task = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            let mut stream = conn.accept_stream().await.unwrap();
            let mut buf = vec![0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.close().await.unwrap();
        });

        let conn = client.dial(addr).await.unwrap();
        let mut stream = conn.open_stream().await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut echo = vec![0u8; 4];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");

        server_task.await.unwrap();
        conn.close().await.unwrap();
    }
}

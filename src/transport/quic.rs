//! QUIC: native bidirectional streams, no extra multiplexer.

use super::{resolve_dial, resolve_listen, run_setup_loop, Acceptor};
use crate::backlog::{Backlog, ShutdownSignal};
use crate::config::{QuicConfig, TunnelConfig};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::stream::Stream;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::fs::File;
use std::io::{self, BufReader};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

// ── TLS ─────────────────────────────────────────────────────────────────────

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(e: rustls::Error) -> Error {
    Error::Config(format!("TLS configuration: {}", e))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Config(format!("{}: no certificates found", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| Error::Config(format!("{}: no private key found", path.display())))
}

/// Certificate for `localhost` and the bound IP.
fn self_signed(bound: SocketAddr) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut names = vec!["localhost".to_string()];
    if !bound.ip().is_unspecified() {
        names.push(bound.ip().to_string());
    }
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names)
        .map_err(|e| Error::Config(format!("self-signed certificate: {}", e)))?;
    let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
    Ok((vec![cert.der().clone()], key.into()))
}

fn transport_config(cfg: &QuicConfig) -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(cfg.keep_alive_interval);
    let idle = cfg
        .max_idle_timeout
        .map(quinn::IdleTimeout::try_from)
        .transpose()
        .map_err(|e| Error::Config(format!("max idle timeout: {}", e)))?;
    transport.max_idle_timeout(idle);
    Ok(transport)
}

/// Server config plus the certificate chain it presents.
pub(crate) fn server_config(
    cfg: &QuicConfig,
    bound: SocketAddr,
) -> Result<(quinn::ServerConfig, Vec<CertificateDer<'static>>)> {
    let (chain, key) = match (&cfg.cert_chain, &cfg.private_key) {
        (Some(chain), Some(key)) => (load_certs(chain)?, load_key(key)?),
        (None, None) => self_signed(bound)?,
        _ => {
            return Err(Error::Config(
                "certificate chain and private key must be configured together".into(),
            ))
        }
    };

    let mut tls = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(chain.clone(), key)
        .map_err(tls_error)?;
    tls.alpn_protocols = cfg.alpn.clone();

    let crypto = QuicServerConfig::try_from(tls).map_err(|e| Error::Config(e.to_string()))?;
    let mut server = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    server.transport_config(Arc::new(transport_config(cfg)?));
    Ok((server, chain))
}

pub(crate) fn client_config(cfg: &QuicConfig) -> Result<quinn::ClientConfig> {
    let provider = provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?;

    let mut tls = if cfg.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        for cert in &cfg.trusted_certs {
            roots.add(cert.clone()).map_err(tls_error)?;
        }
        if let Some(path) = &cfg.ca_cert {
            for cert in load_certs(path)? {
                roots.add(cert).map_err(tls_error)?;
            }
        }
        if roots.is_empty() {
            return Err(Error::Config(
                "QUIC dialer needs trusted certificates or insecure_skip_verify".into(),
            ));
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    tls.alpn_protocols = cfg.alpn.clone();

    let crypto = QuicClientConfig::try_from(tls).map_err(|e| Error::Config(e.to_string()))?;
    let mut client = quinn::ClientConfig::new(Arc::new(crypto));
    client.transport_config(Arc::new(transport_config(cfg)?));
    Ok(client)
}

/// Accepts any server certificate. Signatures are still checked.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

// ── Streams and connections ─────────────────────────────────────────────────

/// One QUIC bidirectional stream as a single duplex object.
struct QuicStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl AsyncRead for QuicStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.get_mut().recv), cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.get_mut().send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().send), cx)
    }
}

/// A QUIC connection. Addresses are captured once at establishment.
pub struct QuicConnection {
    conn: quinn::Connection,
    /// Client endpoint owned by this connection (dialing side only)
    endpoint: Option<quinn::Endpoint>,
    local: Option<SocketAddr>,
    remote: SocketAddr,
}

impl QuicConnection {
    fn new(conn: quinn::Connection, endpoint: Option<quinn::Endpoint>, local: Option<SocketAddr>) -> Self {
        let remote = conn.remote_address();
        Self {
            conn,
            endpoint,
            local,
            remote,
        }
    }

    fn wrap(&self, send: quinn::SendStream, recv: quinn::RecvStream) -> Stream {
        let id = quinn::VarInt::from(send.id()).into_inner();
        Stream::new(QuicStream { send, recv }, id, self.local, Some(self.remote))
    }

    pub async fn open_stream(&self) -> Result<Stream> {
        let (send, recv) = self.conn.open_bi().await?;
        trace!(id = %send.id(), "Opened QUIC stream");
        Ok(self.wrap(send, recv))
    }

    pub async fn accept_stream(&self) -> Result<Stream> {
        let (send, recv) = self.conn.accept_bi().await?;
        trace!(id = %send.id(), "Accepted QUIC stream");
        Ok(self.wrap(send, recv))
    }

    /// Close with application error code 0 and no reason.
    pub fn close(&self) {
        if self.conn.close_reason().is_none() {
            debug!(remote = %self.remote, "Closing QUIC connection");
            self.conn.close(0u32.into(), b"");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl Drop for QuicConnection {
    fn drop(&mut self) {
        self.close();
        if let Some(endpoint) = &self.endpoint {
            endpoint.close(0u32.into(), b"");
        }
    }
}

// ── Listener and dialer ─────────────────────────────────────────────────────

impl Acceptor for quinn::Endpoint {
    type Unit = quinn::Incoming;

    async fn next_inbound(&mut self) -> Option<io::Result<quinn::Incoming>> {
        self.accept().await.map(Ok)
    }
}

/// Listening side of the QUIC transport.
pub struct QuicTunnel {
    endpoint: quinn::Endpoint,
    backlog: Arc<Backlog<Result<Connection>>>,
    local: SocketAddr,
    certs: Vec<CertificateDer<'static>>,
}

impl QuicTunnel {
    pub async fn bind(config: &TunnelConfig, addr: &str) -> Result<Self> {
        let resolved = resolve_listen(addr).await?;
        let (server, certs) = server_config(&config.quic, resolved)?;
        let endpoint = quinn::Endpoint::server(server, resolved).map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local = endpoint.local_addr()?;
        debug!(%local, "QUIC tunnel listening");

        let backlog = Arc::new(Backlog::new(config.backlog));
        tokio::spawn(run_setup_loop(endpoint.clone(), backlog.clone(), move |incoming| {
            handshake(incoming, local)
        }));
        Ok(Self {
            endpoint,
            backlog,
            local,
            certs,
        })
    }

    pub async fn accept(&self) -> Result<Connection> {
        self.backlog.pop().await?
    }

    /// Stop accepting. Established connections stay open.
    pub fn close(&self) -> bool {
        let first = self.backlog.close(None);
        if first {
            self.endpoint.set_server_config(None);
        }
        first
    }

    pub fn signal(&self) -> &ShutdownSignal {
        self.backlog.signal()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }
}

/// Complete the handshake of one incoming connection.
async fn handshake(incoming: quinn::Incoming, local: SocketAddr) -> Result<Connection> {
    let conn = incoming.accept()?.await?;
    debug!(peer = %conn.remote_address(), "Accepted QUIC connection");
    Ok(Connection::quic(QuicConnection::new(conn, None, Some(local))))
}

pub async fn dial(config: &TunnelConfig, addr: &str) -> Result<Connection> {
    let remote = resolve_dial(addr).await?;
    let client = client_config(&config.quic)?;

    let bind: SocketAddr = if remote.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let endpoint = quinn::Endpoint::client(bind).map_err(|e| Error::connect(addr, e))?;
    let connecting = endpoint
        .connect_with(client, remote, &config.quic.server_name)
        .map_err(|e| Error::connect(addr, Error::Protocol(e.to_string())))?;
    let conn = connecting.await.map_err(|e| Error::connect(addr, e))?;
    debug!(%remote, "QUIC connection established");

    let local = endpoint.local_addr().ok();
    Ok(Connection::quic(QuicConnection::new(conn, Some(endpoint), local)))
}

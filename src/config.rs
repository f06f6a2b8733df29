//! Tunnel configuration.

use crate::backlog::DEFAULT_BACKLOG;
use crate::error::Error;
use rustls::pki_types::CertificateDer;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Transport selected at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    /// Plain TCP with a yamux session
    #[default]
    Tcp,
    /// Reliable UDP (KCP) with a yamux session
    Kcp,
    /// QUIC, natively multiplexed
    Quic,
    /// HTTP/2 over TCP, a yamux session inside one long-lived request
    H2,
    /// WebSocket messages adapted to a byte stream, with a yamux session
    Ws,
}

impl TransportKind {
    pub const ALL: [TransportKind; 5] = [
        TransportKind::Tcp,
        TransportKind::Kcp,
        TransportKind::Quic,
        TransportKind::H2,
        TransportKind::Ws,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Kcp => "kcp",
            TransportKind::Quic => "quic",
            TransportKind::H2 => "h2",
            TransportKind::Ws => "ws",
        }
    }

    /// Whether streams are carried by a yamux session on top of the transport.
    pub fn uses_mux(&self) -> bool {
        !matches!(self, TransportKind::Quic)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "kcp" => Ok(TransportKind::Kcp),
            "quic" => Ok(TransportKind::Quic),
            "h2" | "http2" | "spdy" => Ok(TransportKind::H2),
            "ws" | "websocket" => Ok(TransportKind::Ws),
            other => Err(Error::Config(format!("unknown transport '{}'", other))),
        }
    }
}

/// yamux session settings.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Maximum number of concurrently open streams per session
    pub max_streams: usize,
    /// Largest frame body sent in one piece
    pub split_send_size: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_streams: 512,
            split_send_size: 16 * 1024,
        }
    }
}

impl MuxConfig {
    pub fn to_yamux(&self) -> yamux::Config {
        let mut cfg = yamux::Config::default();
        cfg.set_max_num_streams(self.max_streams);
        cfg.set_split_send_size(self.split_send_size);
        cfg
    }
}

/// QUIC endpoint settings.
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Name the client expects in the server certificate
    pub server_name: String,
    /// ALPN protocol identifiers offered and accepted
    pub alpn: Vec<Vec<u8>>,
    /// PEM certificate chain for the listener. Self-signed when unset.
    pub cert_chain: Option<PathBuf>,
    /// PEM private key matching `cert_chain`
    pub private_key: Option<PathBuf>,
    /// Certificates the dialer trusts, in addition to `ca_cert`
    pub trusted_certs: Vec<CertificateDer<'static>>,
    /// PEM file with certificates the dialer trusts
    pub ca_cert: Option<PathBuf>,
    /// Accept any server certificate
    pub insecure_skip_verify: bool,
    pub keep_alive_interval: Option<Duration>,
    pub max_idle_timeout: Option<Duration>,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            alpn: vec![b"qtunnel".to_vec()],
            cert_chain: None,
            private_key: None,
            trusted_certs: Vec::new(),
            ca_cert: None,
            insecure_skip_verify: false,
            keep_alive_interval: Some(Duration::from_secs(10)),
            max_idle_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Everything a [`Listener`](crate::Listener) or [`Dialer`](crate::Dialer) needs.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub transport: TransportKind,
    /// Capacity of the queue between a transport and `accept()`
    pub backlog: usize,
    pub mux: MuxConfig,
    pub kcp: tokio_kcp::KcpConfig,
    pub quic: QuicConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        let mut kcp = tokio_kcp::KcpConfig::default();
        // yamux needs a byte stream, not KCP's message mode
        kcp.stream = true;
        Self {
            transport: TransportKind::default(),
            backlog: DEFAULT_BACKLOG,
            mux: MuxConfig::default(),
            kcp,
            quic: QuicConfig::default(),
        }
    }
}

impl TunnelConfig {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            ..Self::default()
        }
    }
}

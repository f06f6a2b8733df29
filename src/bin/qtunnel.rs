use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qtunnel::{
    Dialer, Error, Listener, LocalForward, RemoteForward, Result, TransportKind, TunnelConfig,
};

#[derive(Parser, Debug)]
#[command(name = "qtunnel")]
#[command(about = "TCP port forwarding over TCP, KCP, QUIC, HTTP/2 or WebSocket tunnels", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct TunnelArgs {
    /// Tunnel transport: tcp, kcp, quic, h2 or ws
    #[arg(short, long, default_value = "tcp")]
    transport: TransportKind,

    /// Capacity of the accept backlog
    #[arg(long, default_value_t = qtunnel::DEFAULT_BACKLOG)]
    backlog: usize,
}

impl TunnelArgs {
    fn config(&self) -> TunnelConfig {
        TunnelConfig {
            transport: self.transport,
            backlog: self.backlog,
            ..TunnelConfig::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept tunnels and forward their streams to a TCP target
    Server {
        #[command(flatten)]
        tunnel: TunnelArgs,

        /// Tunnel listen address
        #[arg(short, long, default_value = "0.0.0.0:4000")]
        listen: String,

        /// TCP address every stream is forwarded to
        #[arg(short = 'T', long)]
        target: SocketAddr,

        /// PEM certificate chain (QUIC). Self-signed when omitted.
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,

        /// PEM private key (QUIC)
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,
    },

    /// Forward a local TCP port through a tunnel
    Client {
        #[command(flatten)]
        tunnel: TunnelArgs,

        /// Local TCP listen address
        #[arg(short, long, default_value = "127.0.0.1:9000")]
        local: String,

        /// Tunnel server address
        #[arg(short, long)]
        server: String,

        /// PEM CA certificate trusted for the QUIC server
        #[arg(long)]
        ca_cert: Option<PathBuf>,

        /// Skip QUIC server certificate verification
        #[arg(long)]
        insecure: bool,

        /// Server name expected in the QUIC certificate
        #[arg(long, default_value = "localhost")]
        server_name: String,
    },
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
            }
            cancel.cancel();
        }
    });
    cancel
}

async fn run(command: Commands) -> Result<()> {
    let cancel = shutdown_on_ctrl_c();

    match command {
        Commands::Server {
            tunnel,
            listen,
            target,
            cert,
            key,
        } => {
            let mut config = tunnel.config();
            config.quic.cert_chain = cert;
            config.quic.private_key = key;

            let listener = Listener::bind(&config, &listen).await?;
            info!("Listening on {} ({})", listener.local_addr(), listener.transport());
            match RemoteForward::new(listener, target).run(cancel).await {
                Err(Error::Closed) => Ok(()),
                other => other,
            }
        }

        Commands::Client {
            tunnel,
            local,
            server,
            ca_cert,
            insecure,
            server_name,
        } => {
            let mut config = tunnel.config();
            config.quic.ca_cert = ca_cert;
            config.quic.insecure_skip_verify = insecure;
            config.quic.server_name = server_name;

            let forward = LocalForward::bind(Dialer::new(config), &local, server).await?;
            forward.run(cancel).await
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("qtunnel={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(cli.command).await {
        error!("{}", e);
        return Err(e);
    }
    Ok(())
}

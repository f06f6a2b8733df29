//! Simple echo server example
//!
//! Accepts tunnel connections and their streams, echoes back any data received.
//!
//! ```text
//! cargo run --example echo -- ws 127.0.0.1:4000
//! ```

use qtunnel::{Connection, Listener, TransportKind, TunnelConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("info,qtunnel=debug")
        .init();

    let mut args = std::env::args().skip(1);
    let transport: TransportKind = args.next().as_deref().unwrap_or("tcp").parse()?;
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:4000".to_string());

    let listener = Listener::bind(&TunnelConfig::new(transport), &addr).await?;
    info!("Echo server listening on {} ({})", listener.local_addr(), transport);

    loop {
        match listener.accept().await {
            Ok(conn) => {
                info!("Accepted connection from {:?}", conn.peer_addr());
                tokio::spawn(handle_connection(conn));
            }
            Err(e) if e.is_closed() => break,
            Err(e) => error!("Error accepting connection: {}", e),
        }
    }

    Ok(())
}

async fn handle_connection(conn: Connection) {
    loop {
        match conn.accept_stream().await {
            Ok(stream) => {
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(stream).await {
                        error!("Stream error: {}", e);
                    }
                });
            }
            Err(e) => {
                info!("Connection from {:?} ended: {}", conn.peer_addr(), e);
                return;
            }
        }
    }
}

async fn handle_stream(mut stream: qtunnel::Stream) -> Result<(), Box<dyn std::error::Error>> {
    let mut buf = vec![0u8; 1024];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            // EOF
            info!("Stream {} closed by peer", stream.id());
            break;
        }

        info!("Stream {}: received {} bytes", stream.id(), n);
        stream.write_all(&buf[..n]).await?;
        stream.flush().await?;
    }

    stream.close().await?;
    Ok(())
}

//! Concrete transports and the accept loop they share.

pub mod http2;
pub mod kcp;
pub mod quic;
pub mod tcp;
pub mod websocket;

use crate::backlog::Backlog;
use crate::error::{Error, Result};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Pause after a failed accept before trying again.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Upper bound on per-peer session setup (handshakes, preambles).
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Native source of inbound units (sockets, sessions, handshakes).
pub(crate) trait Acceptor: Send + 'static {
    type Unit: Send + 'static;

    /// Next inbound unit. `None` once the source is exhausted.
    fn next_inbound(&mut self) -> impl Future<Output = Option<io::Result<Self::Unit>>> + Send;
}

impl Acceptor for tokio::net::TcpListener {
    type Unit = (tokio::net::TcpStream, SocketAddr);

    async fn next_inbound(&mut self) -> Option<io::Result<Self::Unit>> {
        Some(self.accept().await)
    }
}

/// Pump `acceptor` into `backlog` until the backlog closes.
///
/// Accept errors are delivered to `accept()` callers like any other unit;
/// the loop keeps running after them. Dropping the acceptor on exit releases
/// the native socket.
pub(crate) async fn run_accept_loop<A: Acceptor>(
    mut acceptor: A,
    backlog: Arc<Backlog<io::Result<A::Unit>>>,
) {
    let signal = backlog.signal().clone();
    loop {
        let next = tokio::select! {
            biased;
            _ = signal.triggered() => break,
            next = acceptor.next_inbound() => next,
        };
        match next {
            Some(Ok(unit)) => {
                if backlog.push(Ok(unit)).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!("Accept failed: {}", e);
                if backlog.push(Err(e)).await.is_err() {
                    break;
                }
                tokio::select! {
                    _ = signal.triggered() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
            None => {
                backlog.close(None);
                break;
            }
        }
    }
    debug!("Accept loop stopped");
}

/// Pump `acceptor` and run `setup` on every unit in its own task.
///
/// A slow or silent peer only holds up its own setup task. Finished
/// connections and setup failures are queued in arrival order of completion;
/// a setup that exceeds [`HANDSHAKE_TIMEOUT`] is queued as a timeout error.
pub(crate) async fn run_setup_loop<A, F, Fut, T>(
    mut acceptor: A,
    backlog: Arc<Backlog<Result<T>>>,
    setup: F,
) where
    A: Acceptor,
    F: Fn(A::Unit) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let signal = backlog.signal().clone();
    let setup = Arc::new(setup);
    loop {
        let next = tokio::select! {
            biased;
            _ = signal.triggered() => break,
            next = acceptor.next_inbound() => next,
        };
        match next {
            Some(Ok(unit)) => {
                let backlog = backlog.clone();
                let setup = setup.clone();
                tokio::spawn(async move {
                    let signal = backlog.signal().clone();
                    let result = tokio::select! {
                        biased;
                        _ = signal.triggered() => return,
                        result = tokio::time::timeout(HANDSHAKE_TIMEOUT, setup(unit)) => {
                            result.unwrap_or(Err(Error::Timeout { written: 0 }))
                        }
                    };
                    if let Err(e) = &result {
                        debug!("Session setup failed: {}", e);
                    }
                    if backlog.push(result).await.is_err() {
                        trace!("Listener closed, discarding set-up session");
                    }
                });
            }
            Some(Err(e)) => {
                warn!("Accept failed: {}", e);
                if backlog.push(Err(e.into())).await.is_err() {
                    break;
                }
                tokio::select! {
                    _ = signal.triggered() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
            None => {
                backlog.close(None);
                break;
            }
        }
    }
    debug!("Accept loop stopped");
}

/// Resolve a listen address. Unusable strings are configuration errors.
pub(crate) async fn resolve_listen(addr: &str) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| Error::Config(format!("invalid listen address '{}': {}", addr, e)))?;
    addrs
        .next()
        .ok_or_else(|| Error::Config(format!("listen address '{}' resolved to nothing", addr)))
}

/// Resolve a dial address. Any failure is a connect error.
pub(crate) async fn resolve_dial(addr: &str) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| Error::connect(addr, e))?;
    addrs.next().ok_or_else(|| {
        Error::connect(
            addr,
            io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    struct Scripted(Vec<Option<io::Result<u32>>>);

    impl Acceptor for Scripted {
        type Unit = u32;

        async fn next_inbound(&mut self) -> Option<io::Result<u32>> {
            if self.0.is_empty() {
                std::future::pending::<()>().await;
            }
            self.0.remove(0)
        }
    }

    #[tokio::test]
    async fn test_accept_errors_are_delivered_and_loop_continues() {
        let backlog = Arc::new(Backlog::new(8));
        let script = Scripted(vec![
            Some(Ok(1)),
            Some(Err(io::Error::new(io::ErrorKind::Other, "too many open files"))),
            Some(Ok(2)),
        ]);
        let task = tokio::spawn(run_accept_loop(script, backlog.clone()));

        assert_eq!(backlog.pop().await.unwrap().unwrap(), 1);
        assert!(backlog.pop().await.unwrap().is_err());
        assert_eq!(backlog.pop().await.unwrap().unwrap(), 2);

        backlog.close(None);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("accept loop should stop on close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_acceptor_closes_backlog() {
        let backlog: Arc<Backlog<io::Result<u32>>> = Arc::new(Backlog::new(8));
        tokio::spawn(run_accept_loop(Scripted(vec![None]), backlog.clone()));

        let err = tokio::time::timeout(Duration::from_secs(1), backlog.pop())
            .await
            .expect("pop should fail once the source is gone")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    #[tokio::test]
    async fn test_slow_setup_does_not_hold_up_others() {
        let backlog: Arc<Backlog<Result<u32>>> = Arc::new(Backlog::new(8));
        let script = Scripted(vec![Some(Ok(1)), Some(Ok(2))]);
        tokio::spawn(run_setup_loop(script, backlog.clone(), |unit| async move {
            if unit == 1 {
                std::future::pending::<()>().await;
            }
            Ok(unit * 10)
        }));

        let first = tokio::time::timeout(Duration::from_secs(1), backlog.pop())
            .await
            .expect("second unit should not wait for the first")
            .unwrap();
        assert_eq!(first.unwrap(), 20);
        backlog.close(None);
    }

    #[tokio::test]
    async fn test_setup_failures_are_queued() {
        let backlog: Arc<Backlog<Result<u32>>> = Arc::new(Backlog::new(8));
        let script = Scripted(vec![
            Some(Ok(1)),
            Some(Err(io::Error::new(io::ErrorKind::Other, "too many open files"))),
        ]);
        tokio::spawn(run_setup_loop(script, backlog.clone(), |_| async {
            Err::<u32, _>(Error::Protocol("bad preamble".into()))
        }));

        let mut kinds = Vec::new();
        for _ in 0..2 {
            kinds.push(backlog.pop().await.unwrap().unwrap_err().kind());
        }
        kinds.sort_by_key(|k| format!("{:?}", k));
        assert_eq!(kinds, vec![ErrorKind::Io, ErrorKind::Protocol]);
        backlog.close(None);
    }

    #[tokio::test]
    async fn test_resolve_listen_rejects_garbage() {
        let err = resolve_listen("not an address").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        let addr = resolve_listen("127.0.0.1:0").await.unwrap();
        assert_eq!(addr.port(), 0);
    }
}

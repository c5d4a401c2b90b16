// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use crate::proxy::{ConnectionRelay, ProxyError};
use crate::server::listener::{bind_tcp, StartupError};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const DEFAULT_BACKLOG: u32 = 1024;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder pattern so `main.rs` can inject the relay and listener limits.
pub struct ServerBuilder {
    addr: SocketAddr,
    backlog: u32,
    max_connections: usize,
    drain_timeout: Duration,
    relay: Arc<ConnectionRelay>,
}

impl ServerBuilder {
    pub fn new(addr: SocketAddr, relay: Arc<ConnectionRelay>) -> Self {
        Self {
            addr,
            backlog: DEFAULT_BACKLOG,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            relay,
        }
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Bind the listening socket. Failing here is the only fatal error the
    /// server has.
    pub async fn bind(self) -> Result<Server, StartupError> {
        let listener = bind_tcp(self.addr, self.backlog).await?;
        let local_addr = listener.local_addr().map_err(|source| StartupError::LocalAddr {
            addr: self.addr,
            source,
        })?;

        info!(
            bind_addr = %local_addr,
            backlog = self.backlog,
            max_connections = self.max_connections,
            "Load balancer listening"
        );

        Ok(Server {
            listener,
            local_addr,
            relay: self.relay,
            permits: Arc::new(Semaphore::new(self.max_connections)),
            sessions: JoinSet::new(),
            drain_timeout: self.drain_timeout,
        })
    }
}

/// How the accept loop ended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub accepted: u64,
    pub rejected: u64,
    /// Relays that finished on their own during the drain window.
    pub drained: usize,
    /// Relays force-closed once the drain window ran out.
    pub aborted: usize,
}

/// A bound listener plus the set of relays it has spawned.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    relay: Arc<ConnectionRelay>,
    permits: Arc<Semaphore>,
    sessions: JoinSet<()>,
    drain_timeout: Duration,
}

impl Server {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until `shutdown` resolves, then stop accepting, wait up to the
    /// drain timeout for in-flight relays and abort whatever is left.
    pub async fn serve_until<F>(mut self, shutdown: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        let mut report = ShutdownReport::default();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        report.accepted += 1;
                        if !self.spawn_relay(stream, peer) {
                            report.rejected += 1;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        // Brief sleep to avoid tight loop on persistent errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(finished) = self.sessions.join_next(), if !self.sessions.is_empty() => {
                    log_join(finished);
                }
            }
        }

        drop(self.listener);
        let (drained, aborted) = drain(&mut self.sessions, self.drain_timeout).await;
        report.drained = drained;
        report.aborted = aborted;

        info!(
            accepted = report.accepted,
            rejected = report.rejected,
            drained,
            aborted,
            "Listener stopped"
        );
        report
    }

    fn spawn_relay(&mut self, stream: tokio::net::TcpStream, peer: SocketAddr) -> bool {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(%peer, "Connection rejected: max connections reached");
                return false;
            }
        };

        debug!(%peer, "Accepted connection");
        let relay = Arc::clone(&self.relay);
        self.sessions.spawn(async move {
            match relay.handle(stream, peer).await {
                Ok(_) => {}
                Err(ProxyError::RelayIo(e)) if is_disconnect(&e) => {
                    debug!(%peer, "Peer disconnected: {}", e);
                }
                Err(e) => debug!(%peer, "Session ended with error: {}", e),
            }
            drop(permit);
        });
        true
    }
}

async fn drain(sessions: &mut JoinSet<()>, drain_timeout: Duration) -> (usize, usize) {
    let in_flight = sessions.len();
    if in_flight == 0 {
        return (0, 0);
    }
    info!(in_flight, ?drain_timeout, "Waiting for in-flight relays to finish");

    let mut drained = 0;
    let waited = tokio::time::timeout(drain_timeout, async {
        while let Some(finished) = sessions.join_next().await {
            log_join(finished);
            drained += 1;
        }
    })
    .await;

    if waited.is_ok() {
        return (drained, 0);
    }

    let aborted = sessions.len();
    warn!(aborted, "Drain timeout elapsed, force-closing remaining relays");
    sessions.abort_all();
    while sessions.join_next().await.is_some() {}
    (drained, aborted)
}

fn log_join(finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        if e.is_panic() {
            error!("Relay task panicked: {}", e);
        }
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted
    )
}

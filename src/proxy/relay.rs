// ────────────────────────────────
// src/proxy/relay.rs
// Per-connection relay: select a backend, connect, pump bytes, clean up.
// ────────────────────────────────

use super::backend::BackendEndpoint;
use super::registry::BackendRegistry;
use crate::config::RelayConfig;
use crate::load_balancer::StrategyHandle;
use crate::metrics::{MetricsCollector, Timer};
use crate::telemetry::{RoutingRecord, RoutingSink};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Selecting,
    Connecting,
    Relaying,
    Closed,
}

/// Which side ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

#[derive(Debug)]
struct RelaySession {
    id: Uuid,
    phase: RelayPhase,
    attempts: usize,
    tried: Vec<BackendEndpoint>,
}

impl RelaySession {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            phase: RelayPhase::Selecting,
            attempts: 0,
            tried: Vec::new(),
        }
    }

    fn transition(&mut self, next: RelayPhase) {
        debug!(session = %self.id, from = ?self.phase, to = ?next, "relay phase");
        self.phase = next;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
    pub closed_by: Option<Side>,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: Uuid,
    pub backend: BackendEndpoint,
    pub strategy: &'static str,
    pub attempts: usize,
    pub stats: PumpStats,
    pub duration: Duration,
}

/// Shared per-process relay context; one `handle` call per accepted client.
pub struct ConnectionRelay {
    config: RelayConfig,
    registry: Arc<BackendRegistry>,
    strategy: Arc<StrategyHandle>,
    sink: Arc<dyn RoutingSink>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ConnectionRelay {
    pub fn new(
        config: RelayConfig,
        registry: Arc<BackendRegistry>,
        strategy: Arc<StrategyHandle>,
        sink: Arc<dyn RoutingSink>,
    ) -> Self {
        Self {
            config,
            registry,
            strategy,
            sink,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Drive one client connection to completion. On any error the client
    /// socket is simply dropped, so unroutable traffic sees a closed
    /// connection and nothing else.
    pub async fn handle(
        &self,
        client: TcpStream,
        peer: SocketAddr,
    ) -> Result<SessionSummary, ProxyError> {
        let session = RelaySession::new();
        let span = tracing::info_span!("connection", session = %session.id, peer = %peer);
        self.run(session, client).instrument(span).await
    }

    async fn run(
        &self,
        mut session: RelaySession,
        mut client: TcpStream,
    ) -> Result<SessionSummary, ProxyError> {
        let (mut upstream, endpoint, strategy) = match self.establish(&mut session).await {
            Ok(established) => established,
            Err(e) => {
                session.transition(RelayPhase::Closed);
                if let Some(metrics) = &self.metrics {
                    metrics.record_selection_exhausted();
                }
                warn!("Closing client without a backend: {}", e);
                return Err(e);
            }
        };

        let mut active = self.registry.acquire(endpoint.clone());
        self.publish_active(&endpoint);
        let _gauge = self.metrics.clone().map(SessionGauge::new);
        info!(backend = %endpoint, strategy, "Routed connection");
        self.emit_record(&endpoint, strategy).await;

        session.transition(RelayPhase::Relaying);
        let timer = Timer::new();
        let mut stats = PumpStats::default();
        let outcome = pump_counted(
            &mut client,
            &mut upstream,
            self.config.buffer_size,
            &mut stats,
        )
        .await;

        session.transition(RelayPhase::Closed);
        active.release();
        self.publish_active(&endpoint);
        drop(upstream);
        drop(client);

        // bytes moved before a reset still count
        if let Some(metrics) = &self.metrics {
            metrics.record_session_end(
                endpoint.as_str(),
                stats.bytes_to_upstream,
                stats.bytes_to_client,
                timer.elapsed(),
            );
        }

        if let Err(e) = outcome {
            debug!(
                backend = %endpoint,
                bytes_to_upstream = stats.bytes_to_upstream,
                bytes_to_client = stats.bytes_to_client,
                "Relay ended with error: {}",
                e
            );
            return Err(ProxyError::RelayIo(e));
        }

        debug!(
            backend = %endpoint,
            bytes_to_upstream = stats.bytes_to_upstream,
            bytes_to_client = stats.bytes_to_client,
            closed_by = ?stats.closed_by,
            "Connection closed"
        );

        Ok(SessionSummary {
            id: session.id,
            backend: endpoint,
            strategy,
            attempts: session.attempts,
            stats,
            duration: timer.elapsed(),
        })
    }

    /// SELECTING/CONNECTING loop. Each failed connect fast-fails the backend
    /// in the registry and excludes it for the rest of this session.
    async fn establish(
        &self,
        session: &mut RelaySession,
    ) -> Result<(TcpStream, BackendEndpoint, &'static str), ProxyError> {
        while session.attempts < self.config.max_attempts {
            session.transition(RelayPhase::Selecting);

            let strategy = self.strategy.current();
            let candidates: Vec<BackendEndpoint> = self
                .registry
                .list_eligible()
                .into_iter()
                .filter(|ep| !session.tried.contains(ep))
                .collect();

            let Some(endpoint) = strategy.select_server(&candidates) else {
                debug!(
                    attempt = session.attempts,
                    candidates = candidates.len(),
                    strategy = strategy.name(),
                    "No selectable backend"
                );
                break;
            };

            session.attempts += 1;
            session.transition(RelayPhase::Connecting);
            match self.connect(&endpoint).await {
                Ok(stream) => return Ok((stream, endpoint, strategy.name())),
                Err(e) => {
                    warn!(attempt = session.attempts, "{}", e);
                    if self.registry.set_health(&endpoint, false) == Some(true) {
                        warn!(backend = %endpoint, "Backend marked unhealthy after failed connect");
                    }
                    if let Some(metrics) = &self.metrics {
                        metrics.record_connect_failure(endpoint.as_str());
                    }
                    session.tried.push(endpoint);
                }
            }
        }

        Err(ProxyError::SelectionExhausted {
            attempts: session.attempts,
        })
    }

    async fn connect(&self, endpoint: &BackendEndpoint) -> Result<TcpStream, ProxyError> {
        match timeout(
            self.config.connect_timeout(),
            TcpStream::connect(endpoint.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ProxyError::UpstreamConnect {
                backend: endpoint.clone(),
                source,
            }),
            Err(_) => Err(ProxyError::UpstreamTimeout {
                backend: endpoint.clone(),
            }),
        }
    }

    fn publish_active(&self, endpoint: &BackendEndpoint) {
        if let Some(metrics) = &self.metrics {
            let count = self.registry.active_connections(endpoint).unwrap_or(0);
            metrics.update_backend_connections(endpoint.as_str(), count as i64);
        }
    }

    async fn emit_record(&self, endpoint: &BackendEndpoint, strategy: &'static str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_routed(endpoint.as_str(), strategy);
        }

        let record = RoutingRecord::now(endpoint.clone(), strategy);
        if let Err(e) = self.sink.append(&record).await {
            warn!(sink = self.sink.name(), "Failed to write routing record: {}", e);
        }
    }
}

/// Keeps the active-session gauge balanced even if the relay task is
/// aborted mid-flight.
struct SessionGauge(Arc<MetricsCollector>);

impl SessionGauge {
    fn new(metrics: Arc<MetricsCollector>) -> Self {
        metrics.increment_active_sessions();
        Self(metrics)
    }
}

impl Drop for SessionGauge {
    fn drop(&mut self) {
        self.0.decrement_active_sessions();
    }
}

/// Symmetric byte pump. Waits on both sides at once, forwards whichever
/// chunk arrives first verbatim, and stops at the first end-of-stream or
/// I/O error from either side.
pub async fn pump<C, U>(client: &mut C, upstream: &mut U, buffer_size: usize) -> io::Result<PumpStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut stats = PumpStats::default();
    pump_counted(client, upstream, buffer_size, &mut stats).await?;
    Ok(stats)
}

/// [`pump`] that leaves its counters with the caller, so a session cut
/// short by an I/O error still reports what it moved.
async fn pump_counted<C, U>(
    client: &mut C,
    upstream: &mut U,
    buffer_size: usize,
    stats: &mut PumpStats,
) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; buffer_size];
    let mut upstream_buf = vec![0u8; buffer_size];

    loop {
        // select! polls branches in random order, so neither direction is
        // favoured; both reads are cancel safe.
        tokio::select! {
            read = client.read(&mut client_buf) => {
                let n = read?;
                if n == 0 {
                    stats.closed_by = Some(Side::Client);
                    return Ok(());
                }
                upstream.write_all(&client_buf[..n]).await?;
                stats.bytes_to_upstream += n as u64;
            }
            read = upstream.read(&mut upstream_buf) => {
                let n = read?;
                if n == 0 {
                    stats.closed_by = Some(Side::Upstream);
                    return Ok(());
                }
                client.write_all(&upstream_buf[..n]).await?;
                stats.bytes_to_client += n as u64;
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no reachable backend after {attempts} attempt(s)")]
    SelectionExhausted { attempts: usize },

    #[error("connect to {backend} failed: {source}")]
    UpstreamConnect {
        backend: BackendEndpoint,
        #[source]
        source: io::Error,
    },

    #[error("connect to {backend} timed out")]
    UpstreamTimeout { backend: BackendEndpoint },

    #[error("relay I/O error: {0}")]
    RelayIo(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::load_balancer::{LeastConnections, Strategy};
    use crate::metrics::MetricsRegistry;
    use crate::telemetry::MemorySink;
    use std::collections::HashMap;
    use tokio::io::duplex;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_pump_forwards_both_directions() {
        let (mut client, mut client_peer) = duplex(64);
        let (mut upstream, mut upstream_peer) = duplex(64);

        let relay = tokio::spawn(async move { pump(&mut client_peer, &mut upstream_peer, 16).await });

        client.write_all(b"ping from client").await.unwrap();
        let mut buf = [0u8; 16];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping from client");

        upstream.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(upstream);
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats.bytes_to_upstream, 16);
        assert_eq!(stats.bytes_to_client, 4);
        assert_eq!(stats.closed_by, Some(Side::Upstream));
    }

    #[tokio::test]
    async fn test_pump_chunks_larger_than_buffer() {
        let (mut client, mut client_peer) = duplex(1024);
        let (mut upstream, mut upstream_peer) = duplex(1024);
        let payload: Vec<u8> = (0..200u8).collect();

        let relay = tokio::spawn(async move { pump(&mut client_peer, &mut upstream_peer, 7).await });

        client.write_all(&payload).await.unwrap();
        let mut received = vec![0u8; payload.len()];
        upstream.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);

        drop(client);
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats.bytes_to_upstream, 200);
        assert_eq!(stats.closed_by, Some(Side::Client));
    }

    fn relay_for(endpoints: &[BackendEndpoint], sink: Arc<MemorySink>) -> ConnectionRelay {
        let configs: Vec<BackendConfig> = endpoints
            .iter()
            .map(|ep| BackendConfig::new(ep.clone(), 1))
            .collect();
        ConnectionRelay::new(
            RelayConfig {
                connect_timeout_ms: 500,
                max_attempts: 3,
                buffer_size: 1024,
            },
            Arc::new(BackendRegistry::new(&configs)),
            Arc::new(StrategyHandle::default()),
            sink,
        )
    }

    async fn client_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let outside = TcpStream::connect(addr).await.unwrap();
        let (inside, peer) = listener.accept().await.unwrap();
        (outside, inside, peer)
    }

    async fn closed_endpoint() -> BackendEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string().parse().unwrap();
        drop(listener);
        endpoint
    }

    #[tokio::test]
    async fn test_failed_connect_marks_unhealthy_and_moves_on() {
        let dead = closed_endpoint().await;
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live: BackendEndpoint = backend.local_addr().unwrap().to_string().parse().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            stream.write_all(b"hello").await.unwrap();
        });

        let sink = Arc::new(MemorySink::new());
        let relay = relay_for(&[dead.clone(), live.clone()], sink.clone());
        let (mut outside, inside, peer) = client_pair().await;

        let summary = relay.handle(inside, peer).await.unwrap();

        let mut reply = Vec::new();
        outside.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"hello");

        assert_eq!(summary.backend, live);
        assert_eq!(summary.attempts, 2);
        assert_eq!(summary.stats.closed_by, Some(Side::Upstream));
        assert_eq!(relay.registry().is_healthy(&dead), Some(false));
        assert_eq!(relay.registry().list_eligible(), vec![live.clone()]);
        assert_eq!(relay.registry().total_active(), 0);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].backend, live);
        assert_eq!(records[0].strategy, "round_robin");
    }

    #[tokio::test]
    async fn test_exhausted_closes_client_silently() {
        let a = closed_endpoint().await;
        let b = closed_endpoint().await;
        let sink = Arc::new(MemorySink::new());
        let relay = relay_for(&[a, b], sink.clone());
        let (mut outside, inside, peer) = client_pair().await;

        let err = relay.handle(inside, peer).await.unwrap_err();
        assert!(matches!(err, ProxyError::SelectionExhausted { attempts: 2 }));

        let mut reply = Vec::new();
        outside.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
        assert!(sink.records().is_empty());
        assert_eq!(relay.registry().total_active(), 0);
    }

    #[tokio::test]
    async fn test_unselectable_candidates_exhaust() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live: BackendEndpoint = backend.local_addr().unwrap().to_string().parse().unwrap();
        let relay = relay_for(&[live], Arc::new(MemorySink::new()));

        // a least-connections snapshot that knows none of the backends
        relay
            .strategy
            .swap(Strategy::LeastConnections(LeastConnections::new(HashMap::new())));

        let (_outside, inside, peer) = client_pair().await;
        let err = relay.handle(inside, peer).await.unwrap_err();
        assert!(matches!(err, ProxyError::SelectionExhausted { attempts: 0 }));
    }

    /// Backend that reads `expect` bytes, reports them, then holds the
    /// connection open until the relay lets go of it.
    async fn holding_backend(expect: usize) -> (BackendEndpoint, oneshot::Receiver<Vec<u8>>) {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = backend.local_addr().unwrap().to_string().parse().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut received = vec![0u8; expect];
            stream.read_exact(&mut received).await.unwrap();
            let _ = tx.send(received);
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });

        (endpoint, rx)
    }

    fn gathered(metrics: &MetricsRegistry) -> String {
        String::from_utf8(metrics.gather()).unwrap()
    }

    #[tokio::test]
    async fn test_client_eof_ends_session_and_releases_backend() {
        let (backend, received) = holding_backend(5).await;
        let metrics = MetricsRegistry::new().unwrap();
        let relay = Arc::new(
            relay_for(&[backend.clone()], Arc::new(MemorySink::new()))
                .with_metrics(metrics.collector()),
        );
        let (mut outside, inside, peer) = client_pair().await;

        let session = tokio::spawn({
            let relay = relay.clone();
            async move { relay.handle(inside, peer).await }
        });

        outside.write_all(b"hello").await.unwrap();
        assert_eq!(received.await.unwrap(), b"hello");
        assert_eq!(relay.registry().active_connections(&backend), Some(1));
        assert!(gathered(&metrics).contains(&format!(
            "lb_backend_connections_active{{backend=\"{backend}\"}} 1"
        )));

        drop(outside);
        let summary = session.await.unwrap().unwrap();

        assert_eq!(summary.stats.closed_by, Some(Side::Client));
        assert_eq!(summary.stats.bytes_to_upstream, 5);
        assert_eq!(relay.registry().total_active(), 0);
        assert!(gathered(&metrics).contains(&format!(
            "lb_backend_connections_active{{backend=\"{backend}\"}} 0"
        )));
    }

    #[tokio::test]
    async fn test_client_reset_is_relay_io_and_still_counted() {
        let (backend, received) = holding_backend(3).await;
        let metrics = MetricsRegistry::new().unwrap();
        let relay = Arc::new(
            relay_for(&[backend.clone()], Arc::new(MemorySink::new()))
                .with_metrics(metrics.collector()),
        );
        let (mut outside, inside, peer) = client_pair().await;

        let session = tokio::spawn({
            let relay = relay.clone();
            async move { relay.handle(inside, peer).await }
        });

        outside.write_all(b"abc").await.unwrap();
        assert_eq!(received.await.unwrap(), b"abc");

        // zero linger turns the close into an RST
        outside.set_linger(Some(Duration::ZERO)).unwrap();
        drop(outside);

        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::RelayIo(_)), "unexpected error {err:?}");
        assert_eq!(relay.registry().total_active(), 0);

        let text = gathered(&metrics);
        assert!(text.contains("lb_bytes_relayed_total{direction=\"upstream\"} 3"));
        assert!(text.contains(&format!(
            "lb_session_duration_seconds_count{{backend=\"{backend}\"}} 1"
        )));
    }
}

// src/metrics/server.rs
use super::MetricsRegistry;
use anyhow::{Context, Result};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

fn respond(registry: &MetricsRegistry, path: &str, req: &Request<Body>) -> Response<Body> {
    let (status, content_type, body) = if req.uri().path() == path {
        (
            StatusCode::OK,
            "text/plain; version=0.0.4",
            Body::from(registry.gather()),
        )
    } else {
        (StatusCode::NOT_FOUND, "text/plain", Body::from("Not Found"))
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Serve the Prometheus text exposition on `addr` at `path` in a
/// background task. Returns the bound address.
pub async fn start_metrics_server(
    addr: SocketAddr,
    registry: Arc<MetricsRegistry>,
    path: String,
) -> Result<SocketAddr> {
    let metrics_path = Arc::new(path);
    let service_path = metrics_path.clone();

    let make_service = hyper::service::make_service_fn(move |_| {
        let registry = registry.clone();
        let path = service_path.clone();

        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                let response = respond(&registry, path.as_str(), &req);
                async move { Ok::<_, Infallible>(response) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind metrics server on {}", addr))?
        .serve(make_service);
    let local_addr = server.local_addr();

    info!(
        "Metrics server listening on http://{}{}",
        local_addr,
        metrics_path.as_str()
    );

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(local_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serves_metrics_path() {
        let registry = Arc::new(MetricsRegistry::new().unwrap());
        registry.collector().update_backend_counts(1, 2);

        let addr = start_metrics_server(
            "127.0.0.1:0".parse().unwrap(),
            registry,
            "/metrics".to_string(),
        )
        .await
        .unwrap();

        let ok = get(addr, "/metrics").await;
        assert!(ok.starts_with("HTTP/1.1 200"));
        assert!(ok.contains("lb_total_backends 2"));

        let missing = get(addr, "/other").await;
        assert!(missing.starts_with("HTTP/1.1 404"));
    }
}

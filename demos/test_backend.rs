//! demos/test_backend.rs
//! Run: cargo run --example test_backend -- <port> [name]
//!
//! Plain TCP backend: reads one chunk from each client, answers with a
//! small HTTP-shaped greeting naming itself, then closes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

async fn handle(mut stream: TcpStream, name: Arc<String>, n: u64, delay_ms: u64) -> anyhow::Result<()> {
    let mut buf = [0u8; 4096];
    let read = stream.read(&mut buf).await?;
    if read == 0 {
        return Ok(());
    }

    if delay_ms > 0 {
        sleep(Duration::from_millis(delay_ms)).await;
    }

    let body = format!("Hello from {} (request {})\n", name, n);
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Backend-Name: {}\r\n\r\n{}",
        body.len(),
        name,
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let port: u16 = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "8081".into())
        .parse()?;
    let name = Arc::new(
        std::env::args()
            .nth(2)
            .or_else(|| std::env::var("BACKEND_NAME").ok())
            .unwrap_or_else(|| format!("backend-{port}")),
    );
    let delay_ms = std::env::var("BASE_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    println!("Demo backend '{}' on {} [delay={}ms]", name, listener.local_addr()?, delay_ms);

    let counter = AtomicU64::new(0);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                eprintln!("[{}] accept failed: {}", name, e);
                continue;
            }
        };
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let name = name.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(stream, name.clone(), n, delay_ms).await {
                eprintln!("[{}] {}: {}", name, peer, e);
            }
        });
    }
}

// ────────────────────────────────
// src/server/listener.rs
// Encapsulates low‑level TCP bind/listen so the accept loop stays clean.
// ────────────────────────────────
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to create socket for {addr}: {source}")]
    Socket {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to read local address of listener bound to {addr}: {source}")]
    LocalAddr {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

pub async fn bind_tcp(addr: SocketAddr, backlog: u32) -> Result<TcpListener, StartupError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|source| StartupError::Socket { addr, source })?;

    #[cfg(unix)]
    socket
        .set_reuseaddr(true)
        .map_err(|source| StartupError::Socket { addr, source })?;

    socket
        .bind(addr)
        .map_err(|source| StartupError::Bind { addr, source })?;

    socket
        .listen(backlog)
        .map_err(|source| StartupError::Listen { addr, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = bind_tcp("127.0.0.1:0".parse().unwrap(), 16).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_startup_error() {
        let first = bind_tcp("127.0.0.1:0".parse().unwrap(), 16).await.unwrap();
        let taken = first.local_addr().unwrap();

        let err = bind_tcp(taken, 16).await.unwrap_err();
        assert!(matches!(err, StartupError::Bind { .. }));
        assert!(err.to_string().contains(&taken.to_string()));
    }

    #[test]
    fn test_local_addr_failure_names_requested_addr() {
        let err = StartupError::LocalAddr {
            addr: "0.0.0.0:8080".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::NotConnected),
        };
        assert!(err.to_string().contains("local address"));
        assert!(err.to_string().contains("0.0.0.0:8080"));
    }
}

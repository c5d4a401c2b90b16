// src/proxy/backend.rs
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of one backend service, kept as the `host:port` string it was
/// configured with so it resolves the same way on every connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackendEndpoint(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointParseError {
    #[error("backend address `{0}` is missing a `:port` suffix")]
    MissingPort(String),

    #[error("backend address `{0}` has an empty host")]
    EmptyHost(String),

    #[error("backend address `{0}` has an invalid port")]
    InvalidPort(String),
}

impl BackendEndpoint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn host(&self) -> &str {
        // validated on construction, so the split always succeeds
        self.0.rsplit_once(':').map(|(host, _)| host).unwrap_or(&self.0)
    }

    pub fn port(&self) -> u16 {
        self.0
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or_default()
    }
}

impl FromStr for BackendEndpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| EndpointParseError::MissingPort(s.to_string()))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost(s.to_string()));
        }
        if port.parse::<u16>().is_err() {
            return Err(EndpointParseError::InvalidPort(s.to_string()));
        }

        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for BackendEndpoint {
    type Error = EndpointParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackendEndpoint> for String {
    fn from(endpoint: BackendEndpoint) -> Self {
        endpoint.0
    }
}

impl fmt::Display for BackendEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mutable per-backend state held by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendState {
    pub healthy: bool,
    pub active_connections: usize,
    /// Load/weight signal used when building weighted strategies.
    pub metric: u32,
}

impl BackendState {
    pub fn new(metric: u32) -> Self {
        Self {
            healthy: true,
            active_connections: 0,
            metric,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        let ep: BackendEndpoint = "127.0.0.1:8081".parse().unwrap();
        assert_eq!(ep.host(), "127.0.0.1");
        assert_eq!(ep.port(), 8081);
        assert_eq!(ep.to_string(), "127.0.0.1:8081");

        let named: BackendEndpoint = "backend.internal:9000".parse().unwrap();
        assert_eq!(named.host(), "backend.internal");
    }

    #[test]
    fn test_parse_endpoint_errors() {
        assert!(matches!(
            "localhost".parse::<BackendEndpoint>(),
            Err(EndpointParseError::MissingPort(_))
        ));
        assert!(matches!(
            ":8080".parse::<BackendEndpoint>(),
            Err(EndpointParseError::EmptyHost(_))
        ));
        assert!(matches!(
            "localhost:99999".parse::<BackendEndpoint>(),
            Err(EndpointParseError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_endpoint_serde() {
        let ep: BackendEndpoint = serde_json::from_str("\"10.0.0.1:80\"").unwrap();
        assert_eq!(ep.port(), 80);
        assert!(serde_json::from_str::<BackendEndpoint>("\"nope\"").is_err());
    }
}

// src/proxy/mod.rs
mod backend;
mod registry;
mod relay;

pub use backend::{BackendEndpoint, BackendState, EndpointParseError};
pub use registry::{ActiveConnection, BackendRegistry, EligibilityUpdate, RegistrySnapshot};
pub use relay::{pump, ConnectionRelay, ProxyError, PumpStats, RelayPhase, SessionSummary, Side};

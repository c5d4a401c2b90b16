mod collector;
mod server;

pub use collector::{MetricsCollector, MetricsRegistry, Timer};
pub use server::start_metrics_server;

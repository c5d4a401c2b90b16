pub mod builder;
pub mod listener;

pub use builder::{Server, ServerBuilder, ShutdownReport};
pub use listener::{bind_tcp, StartupError};

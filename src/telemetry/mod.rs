mod sink;

pub use sink::{CsvFileSink, MemorySink, NullSink, RoutingRecord, RoutingSink, SinkError};

// src/telemetry/sink.rs
use crate::proxy::BackendEndpoint;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One successfully routed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRecord {
    pub timestamp: DateTime<Utc>,
    pub backend: BackendEndpoint,
    pub strategy: &'static str,
}

impl RoutingRecord {
    pub fn now(backend: BackendEndpoint, strategy: &'static str) -> Self {
        Self {
            timestamp: Utc::now(),
            backend,
            strategy,
        }
    }

    /// `timestamp,backend,strategy`, no trailing newline.
    pub fn to_line(&self) -> String {
        format!(
            "{},{},{}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.backend,
            self.strategy
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("telemetry sink {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Append-only destination for routing records.
#[async_trait]
pub trait RoutingSink: Send + Sync {
    async fn append(&self, record: &RoutingRecord) -> Result<(), SinkError>;

    fn name(&self) -> &'static str;
}

/// Appends one CSV line per record to a file, creating it if needed.
pub struct CsvFileSink {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
}

impl CsvFileSink {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| SinkError::Io {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RoutingSink for CsvFileSink {
    async fn append(&self, record: &RoutingRecord) -> Result<(), SinkError> {
        let mut line = record.to_line();
        line.push('\n');

        let mut file = self.file.lock().await;
        let io = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        };
        io.await.map_err(|source| SinkError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn name(&self) -> &'static str {
        "csv_file"
    }
}

/// Discards every record; used when telemetry is disabled.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl RoutingSink for NullSink {
    async fn append(&self, _record: &RoutingRecord) -> Result<(), SinkError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<RoutingRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RoutingRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RoutingSink for MemorySink {
    async fn append(&self, record: &RoutingRecord) -> Result<(), SinkError> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> RoutingRecord {
        RoutingRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap(),
            backend: "127.0.0.1:8081".parse().unwrap(),
            strategy: "round_robin",
        }
    }

    #[test]
    fn test_record_line_format() {
        assert_eq!(record().to_line(), "2024-03-09 14:05:07,127.0.0.1:8081,round_robin");
    }

    #[tokio::test]
    async fn test_csv_sink_appends() {
        let path = std::env::temp_dir().join(format!("routing-{}.csv", uuid::Uuid::new_v4()));

        let sink = CsvFileSink::open(&path).await.unwrap();
        sink.append(&record()).await.unwrap();
        sink.append(&record()).await.unwrap();
        drop(sink);

        // reopening appends rather than truncating
        let sink = CsvFileSink::open(&path).await.unwrap();
        sink.append(&record()).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| *l == "2024-03-09 14:05:07,127.0.0.1:8081,round_robin"));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_csv_sink_open_failure() {
        let err = CsvFileSink::open("/nonexistent-dir/routing.csv").await.err().unwrap();
        assert!(err.to_string().contains("/nonexistent-dir/routing.csv"));
    }

    #[tokio::test]
    async fn test_memory_sink_collects() {
        let sink = MemorySink::new();
        sink.append(&record()).await.unwrap();
        assert_eq!(sink.records(), vec![record()]);
        assert_eq!(NullSink.name(), "null");
    }
}

//! Result hand-off to the storage collaborator.
//!
//! Results are queued on an mpsc channel and flushed to a [`ResultSink`] in
//! batches by a background writer task.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::probe::{DetailedTestResult, TestResult};

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const MAX_BATCH: usize = 500;

/// Sink errors.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One record as handed to storage: scheduled runs produce plain results,
/// manual runs carry their phase log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultRecord {
    Detailed(DetailedTestResult),
    Basic(TestResult),
}

impl ResultRecord {
    pub fn result(&self) -> &TestResult {
        match self {
            ResultRecord::Detailed(d) => &d.result,
            ResultRecord::Basic(r) => r,
        }
    }
}

impl From<TestResult> for ResultRecord {
    fn from(r: TestResult) -> Self {
        ResultRecord::Basic(r)
    }
}

impl From<DetailedTestResult> for ResultRecord {
    fn from(d: DetailedTestResult) -> Self {
        ResultRecord::Detailed(d)
    }
}

/// The storage boundary. Delivery is at-least-once; implementations persist
/// idempotently.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn store(&self, batch: &[ResultRecord]) -> Result<(), SinkError>;
}

/// Keeps every record in memory. Used by tests and embedders.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<ResultRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ResultRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn store(&self, batch: &[ResultRecord]) -> Result<(), SinkError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.extend_from_slice(batch);
        Ok(())
    }
}

/// Appends one JSON document per line.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResultSink for JsonLinesSink {
    async fn store(&self, batch: &[ResultRecord]) -> Result<(), SinkError> {
        let mut buf = Vec::with_capacity(batch.len() * 160);
        for record in batch {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Spawn the batch writer. It drains `rx` until every sender is gone, flushing
/// every two seconds or whenever the buffer reaches its batch limit.
pub fn spawn_batch_writer(rx: mpsc::Receiver<ResultRecord>, sink: Arc<dyn ResultSink>) -> JoinHandle<()> {
    tokio::spawn(run_batch_writer(rx, sink))
}

async fn run_batch_writer(mut rx: mpsc::Receiver<ResultRecord>, sink: Arc<dyn ResultSink>) {
    let mut buffer: Vec<ResultRecord> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Some(r) => {
                        buffer.push(r);
                        if buffer.len() >= MAX_BATCH {
                            flush_buffer(sink.as_ref(), &mut buffer).await;
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(sink.as_ref(), &mut buffer).await;
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(sink.as_ref(), &mut buffer).await;
            }
        }
    }
}

async fn flush_buffer(sink: &dyn ResultSink, buffer: &mut Vec<ResultRecord>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = sink.store(buffer).await {
        tracing::error!("Failed to flush {} results: {}", buffer.len(), e);
    }

    buffer.clear();
}

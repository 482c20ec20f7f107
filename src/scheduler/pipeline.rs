//! Fan-out of finished results to the aggregator and the storage sink.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::aggregate::{AggregateError, Aggregator, IngestOutcome};
use crate::sink::ResultRecord;

/// Every produced result passes through here exactly once.
#[derive(Clone)]
pub struct ResultPipeline {
    aggregator: Arc<Aggregator>,
    tx: mpsc::Sender<ResultRecord>,
}

impl ResultPipeline {
    pub fn new(aggregator: Arc<Aggregator>, tx: mpsc::Sender<ResultRecord>) -> Self {
        Self { aggregator, tx }
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// Ingest into the aggregator, then queue for storage. A stale result is
    /// still stored; the aggregator just refuses to fold it into a closed bucket.
    pub async fn publish(&self, record: impl Into<ResultRecord>) -> Result<IngestOutcome, AggregateError> {
        let record = record.into();
        let outcome = self.aggregator.ingest(record.result());
        if let Err(e) = &outcome {
            tracing::warn!("Dropping result from aggregation: {}", e);
        }

        if self.tx.send(record).await.is_err() {
            tracing::error!("Result sink channel closed, result not stored");
        }
        outcome
    }
}

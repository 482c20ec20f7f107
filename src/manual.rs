//! On-demand test runs outside the scheduler's cadence.
//!
//! Manual runs go through the same probe registry as scheduled ones but use
//! their own worker pool, so neither path can starve the other.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::{Endpoint, SharedSnapshot};
use crate::probe::{DetailedTestResult, PhaseLog, ProbeContext, ProbeRegistry, TestResult, TestStatus};
use crate::scheduler::ResultPipeline;

/// Manual run errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManualRunError {
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),
    #[error("unknown region: {0}")]
    UnknownRegion(String),
}

pub struct ManualRunController {
    registry: Arc<ProbeRegistry>,
    snapshot: SharedSnapshot,
    pipeline: ResultPipeline,
    pool: Arc<Semaphore>,
    cancel: Mutex<CancellationToken>,
}

impl ManualRunController {
    pub fn new(registry: Arc<ProbeRegistry>, snapshot: SharedSnapshot, pipeline: ResultPipeline, workers: usize) -> Self {
        Self {
            registry,
            snapshot,
            pipeline,
            pool: Arc::new(Semaphore::new(workers.max(1))),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub async fn run_one(&self, endpoint_id: &str) -> Result<DetailedTestResult, ManualRunError> {
        let endpoint = self
            .snapshot
            .load()
            .endpoint(endpoint_id)
            .cloned()
            .ok_or_else(|| ManualRunError::UnknownEndpoint(endpoint_id.to_string()))?;

        let mut results = self.run_batch(vec![endpoint]).await;
        results
            .pop()
            .ok_or_else(|| ManualRunError::UnknownEndpoint(endpoint_id.to_string()))
    }

    /// Run every endpoint of a region. Results keep the configured order.
    pub async fn run_region(&self, region: &str) -> Result<Vec<DetailedTestResult>, ManualRunError> {
        let endpoints = self
            .snapshot
            .load()
            .region(region)
            .map(|r| r.endpoints.clone())
            .ok_or_else(|| ManualRunError::UnknownRegion(region.to_string()))?;
        Ok(self.run_batch(endpoints).await)
    }

    pub async fn run_all(&self) -> Vec<DetailedTestResult> {
        let endpoints: Vec<Endpoint> = self.snapshot.load().endpoints().cloned().collect();
        self.run_batch(endpoints).await
    }

    /// Cancel every in-flight manual probe. Runs started afterwards are unaffected.
    pub fn cancel(&self) {
        let previous = {
            let mut token = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *token, CancellationToken::new())
        };
        tracing::info!("Cancelling in-flight manual tests");
        previous.cancel();
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Fan out, then collect one entry per endpoint in input order. A failed
    /// task becomes an error-status entry rather than dropping the batch.
    async fn run_batch(&self, endpoints: Vec<Endpoint>) -> Vec<DetailedTestResult> {
        let token = self.current_token();

        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| {
                let registry = self.registry.clone();
                let pipeline = self.pipeline.clone();
                let pool = self.pool.clone();
                let token = token.clone();
                let fallback = endpoint.clone();
                let handle = tokio::spawn(async move {
                    let detailed = run_endpoint(&registry, &pool, &token, &endpoint).await;
                    let _ = pipeline.publish(detailed.clone()).await;
                    detailed
                });
                (fallback, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (endpoint, handle) in handles {
            let detailed = match handle.await {
                Ok(detailed) => detailed,
                Err(e) => {
                    tracing::error!("Manual test task for {} failed: {}", endpoint.id, e);
                    let result = TestResult::new(&endpoint.test_config(), Utc::now(), TestStatus::NetworkUnreachable)
                        .with_message(format!("test task failed: {e}"));
                    detailed_result(result, Duration::ZERO)
                }
            };
            results.push(detailed);
        }
        results
    }
}

fn detailed_result(result: TestResult, execution_time: Duration) -> DetailedTestResult {
    DetailedTestResult {
        result,
        phases: PhaseLog::new(),
        execution_time,
    }
}

async fn run_endpoint(
    registry: &ProbeRegistry,
    pool: &Arc<Semaphore>,
    token: &CancellationToken,
    endpoint: &Endpoint,
) -> DetailedTestResult {
    let config = endpoint.test_config();
    let queued = std::time::Instant::now();

    let _permit = tokio::select! {
        permit = pool.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                let result = TestResult::new(&config, Utc::now(), TestStatus::Cancelled).with_message("worker pool closed");
                return detailed_result(result, queued.elapsed());
            }
        },
        _ = token.cancelled() => {
            let result = TestResult::new(&config, Utc::now(), TestStatus::Cancelled).with_message("cancelled");
            return detailed_result(result, queued.elapsed());
        }
    };

    if let Err(e) = registry.validate(&config) {
        tracing::warn!("Manual test for {} has invalid configuration: {}", endpoint.id, e);
        let result = TestResult::new(&config, Utc::now(), TestStatus::InvalidConfig).with_message(e.to_string());
        return detailed_result(result, Duration::ZERO);
    }

    let ctx = ProbeContext::with_cancellation(token.child_token());
    registry.execute_detailed(&ctx, &config).await
}

//! JSON API over the manual-run controller, health and aggregates.

mod handlers;

pub use handlers::*;

use crate::aggregate::Aggregator;
use crate::config::{ServerConfig, SharedSnapshot};
use crate::manual::ManualRunController;
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub snapshot: SharedSnapshot,
    pub aggregator: Arc<Aggregator>,
    pub scheduler: Arc<Scheduler>,
    pub manual: Arc<ManualRunController>,
}

pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/api/status", get(handlers::handle_status))
            .route("/api/endpoints", get(handlers::handle_get_endpoints))
            // Manual runs
            .route("/api/run", post(handlers::handle_run_all))
            .route("/api/run/{id}", post(handlers::handle_run_endpoint))
            .route("/api/regions/{name}/run", post(handlers::handle_run_region))
            .route("/api/cancel", post(handlers::handle_cancel))
            // Aggregates
            .route("/api/buckets/{id}", get(handlers::handle_get_bucket))
            .route("/api/buckets/{id}/range", get(handlers::handle_get_range))
            .route("/api/regions/{name}/rollup", get(handlers::handle_region_rollup))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start(
        &self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.router();

        tracing::info!("API server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, Region, Snapshot};
    use crate::probe::{Protocol, ProbeRegistry, TestStatus};
    use crate::scheduler::{ResultPipeline, SchedulerOptions};
    use serde_json::Value;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Serve the API on an ephemeral port with one TCP endpoint pointing at a
    /// local listener. Returns the base URL.
    async fn spawn_api() -> (String, mpsc::Receiver<crate::sink::ResultRecord>, TcpListener) {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let mut endpoint = Endpoint::new("local", Protocol::Tcp, target.local_addr().unwrap().to_string());
        endpoint.timeout_ms = 2000;
        let mut snapshot = Snapshot::default();
        snapshot.regions.clear();
        snapshot.regions.insert(
            "Lab".into(),
            Region {
                endpoints: vec![endpoint],
                ..Default::default()
            },
        );
        snapshot.normalize();
        let shared = snapshot.into_shared();

        let registry = Arc::new(ProbeRegistry::with_defaults());
        let aggregator = Arc::new(Aggregator::new());
        aggregator.assign_regions(&shared.load());
        let (tx, rx) = mpsc::channel(64);
        let pipeline = ResultPipeline::new(aggregator.clone(), tx);

        let state = AppState {
            config: ServerConfig::default(),
            snapshot: shared.clone(),
            aggregator,
            scheduler: Arc::new(Scheduler::new(registry.clone(), pipeline.clone(), SchedulerOptions::default())),
            manual: Arc::new(ManualRunController::new(registry, shared, pipeline, 2)),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let router = Server::new(state).router();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (base, rx, target)
    }

    #[tokio::test]
    async fn test_run_endpoint_then_read_bucket() {
        let (base, mut rx, _target) = spawn_api().await;
        let client = reqwest::Client::new();

        let resp = client.post(format!("{base}/api/run/Lab-local")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["endpoint_id"], "Lab-local");
        assert_eq!(body["status"], TestStatus::Success.as_str());
        assert!(rx.recv().await.is_some());

        let bucket: Value = client
            .get(format!("{base}/api/buckets/Lab-local?period=hourly"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(bucket["test_count"], 1);
        assert_eq!(bucket["region"], "Lab");

        let rollup: Value = client
            .get(format!("{base}/api/regions/Lab/rollup"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(rollup["endpoint_count"], 1);

        let range: Value = client
            .get(format!("{base}/api/buckets/Lab-local/range?period=daily"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(range.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_targets_and_bad_queries() {
        let (base, _rx, _target) = spawn_api().await;
        let client = reqwest::Client::new();

        let resp = client.post(format!("{base}/api/run/nope")).send().await.unwrap();
        assert_eq!(resp.status(), 404);
        let resp = client.post(format!("{base}/api/regions/Mars/run")).send().await.unwrap();
        assert_eq!(resp.status(), 404);
        let resp = client.get(format!("{base}/api/buckets/Lab-local")).send().await.unwrap();
        assert_eq!(resp.status(), 404);
        let resp = client
            .get(format!("{base}/api/buckets/Lab-local?time=yesterday"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let resp = client
            .get(format!("{base}/api/buckets/Lab-local?period=weekly"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_status_and_endpoints() {
        let (base, _rx, _target) = spawn_api().await;
        let client = reqwest::Client::new();

        let status: Value = client.get(format!("{base}/api/status")).send().await.unwrap().json().await.unwrap();
        assert_eq!(status["health"]["overall"], "healthy");
        assert_eq!(status["scheduler"]["running"], false);

        let endpoints: Value = client.get(format!("{base}/api/endpoints")).send().await.unwrap().json().await.unwrap();
        let endpoints = endpoints.as_array().unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0]["id"], "Lab-local");
        assert_eq!(endpoints[0]["type"], "TCP");

        let resp = client.post(format!("{base}/api/cancel")).send().await.unwrap();
        assert_eq!(resp.status(), 204);
    }
}

//! HTTP server for the Prometheus metrics endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use json_exporter_common::ConfigSnapshot;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::ExporterConfig;
use crate::registry::Registry;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    configs: watch::Receiver<Option<ConfigSnapshot<ExporterConfig>>>,
}

/// Create the HTTP router.
fn create_router(
    registry: Arc<Registry>,
    configs: watch::Receiver<Option<ConfigSnapshot<ExporterConfig>>>,
    metrics_path: &str,
) -> Router {
    let state = AppState { registry, configs };

    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for the metrics endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = state.registry.render();

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Handler for the /ready endpoint. Ready once a configuration snapshot has
/// been decoded.
async fn ready_handler(State(state): State<AppState>) -> Response {
    if state.configs.borrow().is_some() {
        (StatusCode::OK, "ready\n").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready - no configuration loaded yet\n",
        )
            .into_response()
    }
}

/// HTTP server exposing the registry.
pub struct HttpServer {
    registry: Arc<Registry>,
    configs: watch::Receiver<Option<ConfigSnapshot<ExporterConfig>>>,
    listen_addr: SocketAddr,
    metrics_path: String,
}

impl HttpServer {
    pub fn new(
        registry: Arc<Registry>,
        configs: watch::Receiver<Option<ConfigSnapshot<ExporterConfig>>>,
        listen_addr: SocketAddr,
        metrics_path: String,
    ) -> Self {
        Self {
            registry,
            configs,
            listen_addr,
            metrics_path,
        }
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let router = create_router(self.registry, self.configs, &self.metrics_path);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(
            addr = %self.listen_addr,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MetricName;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_router(config_loaded: bool, metrics_path: &str) -> (Arc<Registry>, Router) {
        let registry = Arc::new(Registry::new());
        let snapshot = config_loaded.then(|| ConfigSnapshot {
            config: Arc::new(ExporterConfig::default()),
            fingerprint: "test".to_string(),
        });
        let (_tx, rx) = watch::channel(snapshot);
        let router = create_router(Arc::clone(&registry), rx, metrics_path);
        (registry, router)
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (registry, router) = make_router(true, "/metrics");
        let gauge = registry
            .register_gauge(&MetricName::parse("ns_sub_name"), "a value")
            .unwrap();
        gauge.set(5.0);

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/plain"));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.contains("# TYPE ns_sub_name gauge"));
        assert!(body.contains("ns_sub_name 5"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (_registry, router) = make_router(false, "/metrics");

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_endpoint_not_ready() {
        let (_registry, router) = make_router(false, "/metrics");

        let response = router
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        // Not ready because no configuration has been decoded yet.
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_ready_endpoint_ready() {
        let (_registry, router) = make_router(true, "/metrics");

        let response = router
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_custom_metrics_path() {
        let (_registry, router) = make_router(true, "/prometheus/metrics");

        let response = router
            .clone()
            .oneshot(
                Request::get("/prometheus/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Default path should 404
        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

use crate::stream_runtime::RuntimeStatus;
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Content type of the Prometheus text exposition format
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeStatus>,
    pub metrics: PrometheusHandle,
}

/// Create the health and metrics router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/isalive", get(is_alive))
        .route("/isready", get(is_ready))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn is_alive() -> impl IntoResponse {
    (StatusCode::OK, "ALIVE")
}

/// Ready while the stream runtime runs with at least one live worker
async fn is_ready(State(state): State<AppState>) -> impl IntoResponse {
    if state.runtime.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

/// Prometheus exposition, optionally restricted by repeated `name[]` parameters
async fn metrics(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> impl IntoResponse {
    let names: HashSet<String> = params
        .into_iter()
        .filter(|(key, _)| key == "name[]")
        .map(|(_, value)| value)
        .collect();

    let body = filter_metric_families(&state.metrics.render(), &names);

    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body)
}

/// Keep only the metric families whose names are in `names`.
///
/// An empty set keeps everything. `_bucket`, `_sum` and `_count` samples
/// belong to the family they were rendered for.
pub fn filter_metric_families(exposition: &str, names: &HashSet<String>) -> String {
    if names.is_empty() {
        return exposition.to_string();
    }

    let mut filtered = String::with_capacity(exposition.len());

    for line in exposition.lines() {
        let name = if let Some(comment) = line.strip_prefix("# ") {
            match comment.split_whitespace().collect::<Vec<_>>().as_slice() {
                ["HELP" | "TYPE", name, ..] => *name,
                _ => continue,
            }
        } else if line.trim().is_empty() {
            continue;
        } else {
            line.split(|c: char| c == '{' || c.is_whitespace())
                .next()
                .unwrap_or_default()
        };

        if family_selected(name, names) {
            filtered.push_str(line);
            filtered.push('\n');
        }
    }

    filtered
}

fn family_selected(sample_name: &str, names: &HashSet<String>) -> bool {
    if names.contains(sample_name) {
        return true;
    }

    ["_bucket", "_sum", "_count"].iter().any(|suffix| {
        sample_name
            .strip_suffix(suffix)
            .map(|family| names.contains(family))
            .unwrap_or(false)
    })
}

/// Serve the health and metrics endpoints until `shutdown` resolves
pub async fn start_http_server<F>(state: AppState, port: u16, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state);
    let addr = format!("0.0.0.0:{}", port);

    info!(address = %addr, "Starting health and metrics server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    const EXPOSITION: &str = "\
# TYPE panel_sink_records_total counter
panel_sink_records_total 3

# TYPE panel_sink_uploads_total counter
panel_sink_uploads_total{outcome=\"success\"} 2
panel_sink_uploads_total{outcome=\"failure\"} 1

# TYPE panel_sink_upload_duration_seconds summary
panel_sink_upload_duration_seconds{quantile=\"0.5\"} 0.01
panel_sink_upload_duration_seconds_sum 0.03
panel_sink_upload_duration_seconds_count 2
";

    fn test_state() -> AppState {
        AppState {
            runtime: Arc::new(RuntimeStatus::new()),
            metrics: PrometheusBuilder::new().build_recorder().handle(),
        }
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_filter_without_names_keeps_everything() {
        assert_eq!(filter_metric_families(EXPOSITION, &HashSet::new()), EXPOSITION);
    }

    #[test]
    fn test_filter_selects_named_families() {
        let names = HashSet::from(["panel_sink_uploads_total".to_string()]);
        let filtered = filter_metric_families(EXPOSITION, &names);

        assert!(filtered.contains("# TYPE panel_sink_uploads_total counter"));
        assert!(filtered.contains("panel_sink_uploads_total{outcome=\"failure\"} 1"));
        assert!(!filtered.contains("panel_sink_records_total"));
        assert!(!filtered.contains("panel_sink_upload_duration_seconds"));
    }

    #[test]
    fn test_filter_keeps_summary_samples() {
        let names = HashSet::from(["panel_sink_upload_duration_seconds".to_string()]);
        let filtered = filter_metric_families(EXPOSITION, &names);

        assert!(filtered.contains("panel_sink_upload_duration_seconds_sum 0.03"));
        assert!(filtered.contains("panel_sink_upload_duration_seconds_count 2"));
        assert!(!filtered.contains("panel_sink_uploads_total"));
    }

    #[tokio::test]
    async fn test_is_alive() {
        let (status, body) = get(create_router(test_state()), "/isalive").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ALIVE");
    }

    #[tokio::test]
    async fn test_is_ready_reflects_runtime() {
        let (status, body) = get(create_router(test_state()), "/isready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "NOT READY");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = create_router(test_state())
            .oneshot(
                Request::builder()
                    .uri("/metrics?name%5B%5D=panel_sink_records_total")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            PROMETHEUS_CONTENT_TYPE
        );
    }
}

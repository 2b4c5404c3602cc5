//! HTTP route definitions

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::app::AppState;
use crate::store::{GatewayError, StatsGateway};
use crate::util::time::uptime_secs;

/// Build the application router
pub fn build_router<G: StatsGateway + 'static>(state: AppState<G>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/clients/:client_id/metrics", get(client_metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_matches: usize,
    tracked_clients: usize,
}

async fn health_handler<G: StatsGateway>(
    State(state): State<AppState<G>>,
) -> Json<HealthResponse> {
    let (active_matches, tracked_clients) = state.manager.snapshot_counts().await;

    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_matches,
        tracked_clients,
    })
}

// ============================================================================
// Client metrics endpoint
// ============================================================================

#[derive(Deserialize)]
struct MetricsQuery {
    server_id: Option<i64>,
}

#[derive(Serialize)]
struct MetricEntry {
    key: String,
    value: String,
}

async fn client_metrics_handler<G: StatsGateway>(
    State(state): State<AppState<G>>,
    Path(client_id): Path<i64>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<Vec<MetricEntry>>, AppError> {
    let metrics = state
        .manager
        .client_metrics(client_id, query.server_id)
        .await?;

    if metrics.is_empty() {
        return Err(AppError::NotFound);
    }

    Ok(Json(
        metrics
            .into_iter()
            .map(|(key, value)| MetricEntry { key, value })
            .collect(),
    ))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("no stats recorded for client")]
    NotFound,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Gateway(_) => (StatusCode::BAD_GATEWAY, "upstream store error".to_string()),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::ClientStateManager;
    use crate::store::MemoryGateway;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_config() -> Config {
        Config {
            server_addr: "127.0.0.1:8080".parse().unwrap(),
            ingest_addr: "127.0.0.1:2448".parse().unwrap(),
            log_level: "debug".to_string(),
            flush_interval_secs: 15,
            supabase_url: "http://localhost".to_string(),
            supabase_service_role_key: "key".to_string(),
        }
    }

    #[tokio::test]
    async fn health_reports_live_counts() {
        let manager = Arc::new(ClientStateManager::new(MemoryGateway::new()));
        let router = build_router(AppState::new(test_config(), manager));

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_for_unknown_client_is_not_found() {
        let manager = Arc::new(ClientStateManager::new(MemoryGateway::new()));
        let router = build_router(AppState::new(test_config(), manager));

        let response = router
            .oneshot(
                Request::get("/clients/12345/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

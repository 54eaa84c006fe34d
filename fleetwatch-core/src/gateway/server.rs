//! HTTP gateway server built on axum.

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::DEFAULT_HISTORY_LIMIT;
use super::error::ApiError;
use crate::cache::SummaryService;
use crate::error::SummaryError;
use crate::store::SummaryStore;

/// State shared by all handlers.
pub struct GatewayState {
    service: SummaryService,
    store: Arc<dyn SummaryStore>,
    started_at: DateTime<Utc>,
}

/// Thread-safe shared gateway reference for axum handlers.
pub type SharedGateway = Arc<GatewayState>;

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("service", &self.service)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl GatewayState {
    pub fn new(service: SummaryService, store: Arc<dyn SummaryStore>) -> Self {
        Self {
            service,
            store,
            started_at: Utc::now(),
        }
    }

    pub fn service(&self) -> &SummaryService {
        &self.service
    }

    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}

#[derive(Debug, Default, Deserialize)]
struct BatchParams {
    /// Comma-separated agent ids.
    agents: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RefreshBody {
    project_key: Option<String>,
    session_id: Option<String>,
}

/// Build the gateway router.
pub fn router(state: SharedGateway) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/summaries", get(batch_handler))
        .route("/api/agents/{id}/summary", get(summary_handler))
        .route("/api/agents/{id}/summaries", get(history_handler))
        .route("/api/agents/{id}/refresh", post(refresh_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(gw): State<SharedGateway>) -> impl IntoResponse {
    let stats = gw.service.stats();
    let body = serde_json::json!({
        "status": "ok",
        "enabled": gw.service.is_enabled(),
        "cached_agents": stats.entries,
        "generating": stats.generating,
        "uptime_secs": gw.uptime_secs(),
    });
    Json(body)
}

/// `GET /api/agents/{id}/summary`
async fn summary_handler(
    State(gw): State<SharedGateway>,
    Path(agent_id): Path<String>,
) -> Result<Response, ApiError> {
    match gw.service.get_summary(&agent_id).await? {
        Some(result) => Ok(Json(result).into_response()),
        None => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "pending", "agent_id": agent_id })),
        )
            .into_response()),
    }
}

/// `GET /api/summaries?agents=a,b,c`
async fn batch_handler(
    State(gw): State<SharedGateway>,
    Query(params): Query<BatchParams>,
) -> Result<Response, ApiError> {
    let agent_ids: Vec<String> = match params.agents.as_deref() {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect(),
        None => {
            if !gw.service.is_enabled() {
                return Err(SummaryError::ServiceDisabled.into());
            }
            gw.store
                .list_agents()
                .await
                .map_err(SummaryError::StoreQueryFailed)?
                .into_iter()
                .map(|a| a.id)
                .collect()
        }
    };
    let summaries = gw.service.get_all_summaries(&agent_ids).await?;
    Ok(Json(serde_json::json!({
        "summaries": summaries,
        "requested": agent_ids.len(),
    }))
    .into_response())
}

/// `GET /api/agents/{id}/summaries?limit=N`
async fn history_handler(
    State(gw): State<SharedGateway>,
    Path(agent_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Response, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let history = gw.service.get_summary_history(&agent_id, limit).await?;
    Ok(Json(serde_json::json!({ "agent_id": agent_id, "summaries": history })).into_response())
}

/// `POST /api/agents/{id}/refresh`
async fn refresh_handler(
    State(gw): State<SharedGateway>,
    Path(agent_id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let body: RefreshBody = if body.iter().all(u8::is_ascii_whitespace) {
        RefreshBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid refresh body: {e}")))?
    };

    let outcome = gw
        .service
        .refresh_agent(
            &agent_id,
            body.project_key.as_deref(),
            body.session_id.as_deref(),
        )
        .await?;
    Ok(Json(serde_json::json!({
        "agent_id": agent_id,
        "outcome": outcome,
        "summary": gw.service.cached_summary(&agent_id),
    }))
    .into_response())
}

/// Serve the gateway on `addr` until `shutdown` resolves.
pub async fn run<F>(state: SharedGateway, addr: &str, shutdown: F) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Gateway listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SummaryConfig;
    use crate::store::InMemoryStore;
    use crate::summarizer::{MockSummaryModel, Summarizer};
    use crate::transcript::TranscriptReader;
    use axum::body::Body;
    use tower::ServiceExt;

    fn make_gateway() -> SharedGateway {
        let config = SummaryConfig::default();
        let store: Arc<dyn SummaryStore> = Arc::new(InMemoryStore::new());
        let summarizer = Arc::new(Summarizer::new(
            Arc::new(MockSummaryModel::new()),
            config.call_timeout(),
        ));
        let reader = Arc::new(TranscriptReader::new("/nonexistent", 10));
        let service = SummaryService::new(config, store.clone(), summarizer, reader);
        Arc::new(GatewayState::new(service, store))
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router(make_gateway());
        let req = axum::http::Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["cached_agents"], 0);
    }

    #[tokio::test]
    async fn test_malformed_refresh_body_is_rejected() {
        let app = router(make_gateway());
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/api/agents/a1/refresh")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}

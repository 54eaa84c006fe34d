//! Integration tests for the gateway REST API endpoints.

use axum::body::Body;
use chrono::Utc;
use fleetwatch_core::gateway::{GatewayState, SharedGateway, gateway_router};
use fleetwatch_core::{
    Agent, InMemoryStore, MockSummaryModel, SummaryConfig, SummaryResult, SummaryService,
    SummaryStore, Summarizer, TranscriptReader,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const PROJECT: &str = "-home-dev-app";

struct Fixture {
    gw: SharedGateway,
    store: Arc<InMemoryStore>,
    model: Arc<MockSummaryModel>,
    _tmp: TempDir,
}

fn fixture_with(config: SummaryConfig, model: MockSummaryModel) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join(PROJECT);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("s1.jsonl"), "{\"text\":\"refactor config\"}\n").unwrap();

    let store = Arc::new(InMemoryStore::new());
    store.add_agent(Agent {
        id: "a1".into(),
        name: "builder".into(),
        project_key: Some(PROJECT.into()),
        current_session_id: Some("s1".into()),
        last_active_at: Utc::now(),
    });
    let model = Arc::new(model);
    let summarizer = Arc::new(Summarizer::new(model.clone(), config.call_timeout()));
    let reader = Arc::new(TranscriptReader::new(tmp.path(), config.max_transcript_lines));
    let dyn_store: Arc<dyn SummaryStore> = store.clone();
    let service = SummaryService::new(config, dyn_store.clone(), summarizer, reader);
    Fixture {
        gw: Arc::new(GatewayState::new(service, dyn_store)),
        store,
        model,
        _tmp: tmp,
    }
}

fn fixture() -> Fixture {
    fixture_with(
        SummaryConfig::default(),
        MockSummaryModel::with_response("SUMMARY: Refactoring config\nDELTA: Started refactor"),
    )
}

fn make_request(uri: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn make_post_request(uri: &str, body: Option<serde_json::Value>) -> axum::http::Request<Body> {
    let builder = axum::http::Request::builder().method("POST").uri(uri);
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(
    gw: &SharedGateway,
    req: axum::http::Request<Body>,
) -> (axum::http::StatusCode, serde_json::Value) {
    let app = gateway_router(gw.clone());
    let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
        .await
        .unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 100_000)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    (status, json)
}

async fn get_json(gw: &SharedGateway, uri: &str) -> (axum::http::StatusCode, serde_json::Value) {
    send(gw, make_request(uri)).await
}

async fn wait_idle(gw: &SharedGateway) {
    for _ in 0..200 {
        if gw.service().stats().generating == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("refreshes did not settle");
}

// --- /health ---

#[tokio::test]
async fn test_health_reports_cache_size() {
    let f = fixture();
    let (status, json) = get_json(&f.gw, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["cached_agents"], 0);
    assert!(json.get("uptime_secs").is_some());
}

// --- /api/agents/{id}/summary ---

#[tokio::test]
async fn test_summary_pending_then_ready() {
    let f = fixture();
    let (status, json) = get_json(&f.gw, "/api/agents/a1/summary").await;
    assert_eq!(status, 202);
    assert_eq!(json["status"], "pending");

    wait_idle(&f.gw).await;
    let (status, json) = get_json(&f.gw, "/api/agents/a1/summary").await;
    assert_eq!(status, 200);
    assert_eq!(json["summary"], "Refactoring config");
    assert_eq!(json["delta"], "Started refactor");
    assert_eq!(json["is_stale"], false);
    assert_eq!(f.model.call_count(), 1);
}

#[tokio::test]
async fn test_summary_served_stale_from_store() {
    let f = fixture_with(
        SummaryConfig::default(),
        MockSummaryModel::new().with_latency(Duration::from_millis(50)),
    );
    f.store
        .seed_summary(SummaryResult::new("a1", "Reviewing PR", "Opened PR", "fp"));
    let (status, json) = get_json(&f.gw, "/api/agents/a1/summary").await;
    assert_eq!(status, 200);
    assert_eq!(json["summary"], "Reviewing PR");
    assert_eq!(json["is_stale"], true);
    wait_idle(&f.gw).await;
}

#[tokio::test]
async fn test_summary_store_failure_is_500() {
    let f = fixture();
    f.store.set_fail_reads(true);
    let (status, json) = get_json(&f.gw, "/api/agents/a1/summary").await;
    assert_eq!(status, 500);
    assert_eq!(json["code"], "store_error");
    assert!(json["error"].as_str().unwrap().contains("injected"));
}

#[tokio::test]
async fn test_disabled_service_is_503() {
    let config = SummaryConfig {
        enabled: false,
        ..SummaryConfig::default()
    };
    let f = fixture_with(config, MockSummaryModel::new());
    for uri in [
        "/api/agents/a1/summary",
        "/api/agents/a1/summaries",
        "/api/summaries",
        "/api/summaries?agents=a1",
    ] {
        let (status, json) = get_json(&f.gw, uri).await;
        assert_eq!(status, 503, "{uri}");
        assert_eq!(json["code"], "service_disabled");
    }
    let (status, _) = send(&f.gw, make_post_request("/api/agents/a1/refresh", None)).await;
    assert_eq!(status, 503);
}

// --- /api/agents/{id}/refresh ---

#[tokio::test]
async fn test_refresh_from_registry() {
    let f = fixture();
    let (status, json) = send(&f.gw, make_post_request("/api/agents/a1/refresh", None)).await;
    assert_eq!(status, 200);
    assert_eq!(json["outcome"], "generated");
    assert_eq!(json["summary"]["summary"], "Refactoring config");
    assert_eq!(f.store.write_count(), 1);

    let (_, json) = send(&f.gw, make_post_request("/api/agents/a1/refresh", None)).await;
    assert_eq!(json["outcome"], "unchanged");
    assert_eq!(f.model.call_count(), 1);
}

#[tokio::test]
async fn test_refresh_with_explicit_keys() {
    let f = fixture();
    let body = serde_json::json!({ "project_key": PROJECT, "session_id": "s1" });
    let (status, json) = send(
        &f.gw,
        make_post_request("/api/agents/adhoc/refresh", Some(body)),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(json["agent_id"], "adhoc");
}

#[tokio::test]
async fn test_refresh_missing_transcript_is_unavailable() {
    let f = fixture();
    let body = serde_json::json!({ "project_key": PROJECT, "session_id": "nope" });
    let (status, json) = send(
        &f.gw,
        make_post_request("/api/agents/a1/refresh", Some(body)),
    )
    .await;
    assert_eq!(status, 404);
    assert_eq!(json["status"], "unavailable");
}

#[tokio::test]
async fn test_refresh_unknown_agent_is_404() {
    let f = fixture();
    let (status, json) = send(&f.gw, make_post_request("/api/agents/ghost/refresh", None)).await;
    assert_eq!(status, 404);
    assert_eq!(json["code"], "agent_not_found");
}

#[tokio::test]
async fn test_refresh_conflict_while_in_flight() {
    let f = fixture_with(
        SummaryConfig::default(),
        MockSummaryModel::new().with_latency(Duration::from_millis(200)),
    );
    assert!(f.gw.service().trigger_refresh("a1"));
    let (status, json) = send(&f.gw, make_post_request("/api/agents/a1/refresh", None)).await;
    assert_eq!(status, 409);
    assert_eq!(json["code"], "refresh_in_progress");
    wait_idle(&f.gw).await;
}

// --- /api/summaries ---

#[tokio::test]
async fn test_batch_uses_registry_when_unfiltered() {
    let f = fixture();
    f.gw.service().refresh_agent("a1", None, None).await.unwrap();

    let (status, json) = get_json(&f.gw, "/api/summaries").await;
    assert_eq!(status, 200);
    assert_eq!(json["requested"], 1);
    assert_eq!(json["summaries"].as_array().unwrap().len(), 1);

    let (_, json) = get_json(&f.gw, "/api/summaries?agents=a1,,ghost").await;
    assert_eq!(json["requested"], 2);
    let summaries = json["summaries"].as_array().unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["agent_id"], "a1");
    wait_idle(&f.gw).await;
}

// --- /api/agents/{id}/summaries ---

#[tokio::test]
async fn test_history_newest_first_with_limit() {
    let f = fixture();
    for text in ["first", "second", "third"] {
        f.store.create_summary("a1", text, "d", "fp").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let (status, json) = get_json(&f.gw, "/api/agents/a1/summaries?limit=2").await;
    assert_eq!(status, 200);
    let texts: Vec<_> = json["summaries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["summary"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(texts, vec!["third", "second"]);
}

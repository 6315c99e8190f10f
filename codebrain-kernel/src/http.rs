//! The loopback HTTP surface
//!
//! Thin JSON handlers over `DaemonState`. Every request passes through
//! the activity middleware, which resets the idle clock and bumps the
//! request counter before the handler runs.

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::debug;

use crate::state::DaemonState;
use codebrain_core::ChangeType;

/// Build the daemon router
pub fn router(state: Arc<DaemonState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/projects", get(projects))
        .route("/watchers", get(watchers))
        .route("/tools", get(tools))
        .route("/tool/:name", post(invoke_tool))
        .route("/queue-file-change", post(queue_file_change))
        .route("/shutdown", post(shutdown))
        .route("/logs", get(logs))
        .route("/logs/stream", get(logs_stream))
        .route("/persona/active", get(persona_active))
        .route("/persona/list", get(persona_list))
        .route("/persona/set", post(persona_set))
        .route("/persona/create", post(persona_create))
        .route("/persona/delete", post(persona_delete))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            track_activity,
        ))
        .layer(cors)
        .with_state(state)
}

async fn track_activity(
    State(state): State<Arc<DaemonState>>,
    request: axum::extract::Request,
    next: middleware::Next,
) -> axum::response::Response {
    state.lifecycle.touch();
    next.run(request).await
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn status(State(state): State<Arc<DaemonState>>) -> Json<Value> {
    Json(state.status_json())
}

async fn projects(State(state): State<Arc<DaemonState>>) -> Json<Value> {
    Json(json!({"projects": state.projects()}))
}

async fn watchers(State(state): State<Arc<DaemonState>>) -> Json<Value> {
    Json(json!({"watchers": state.watcher_statuses()}))
}

async fn tools(State(state): State<Arc<DaemonState>>) -> Json<Value> {
    let names = state.tools.names();
    Json(json!({"count": names.len(), "tools": names}))
}

async fn invoke_tool(
    State(state): State<Arc<DaemonState>>,
    AxumPath(name): AxumPath<String>,
    Json(args): Json<Value>,
) -> impl IntoResponse {
    if !state.tools.contains(&name) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": format!("unknown tool: {name}")})),
        );
    }

    match state.tools.invoke(&name, args).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "result": outcome.result,
                "duration_ms": outcome.duration_ms,
            })),
        ),
        Err(e) => {
            debug!(tool = %name, error = %e, "Tool call failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": e.to_string()})),
            )
        }
    }
}

#[derive(Deserialize)]
struct FileChangeBody {
    path: PathBuf,
    change_type: ChangeType,
}

async fn queue_file_change(
    State(state): State<Arc<DaemonState>>,
    Json(body): Json<FileChangeBody>,
) -> impl IntoResponse {
    if state.queue_file_change(&body.path, body.change_type) {
        (StatusCode::OK, Json(json!({"success": true})))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "error": "no registered project contains this path",
            })),
        )
    }
}

async fn shutdown(State(state): State<Arc<DaemonState>>) -> Json<Value> {
    state.lifecycle.trigger_drain("shutdown endpoint");
    Json(json!({"status": "shutting_down"}))
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default = "default_lines")]
    lines: usize,
}

const fn default_lines() -> usize {
    100
}

async fn logs(
    State(state): State<Arc<DaemonState>>,
    Query(query): Query<LogsQuery>,
) -> Json<Value> {
    let (total, lines) = state.log_sink.tail(query.lines);
    Json(json!({
        "log_file": state.log_sink.path().display().to_string(),
        "total_lines": total,
        "returned_lines": lines.len(),
        "logs": lines,
    }))
}

#[derive(Deserialize)]
struct StreamQuery {
    #[serde(default)]
    tail: usize,
}

async fn logs_stream(
    State(state): State<Arc<DaemonState>>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, BroadcastStreamRecvError>>> {
    let (_, backlog) = if query.tail > 0 {
        state.log_sink.tail(query.tail)
    } else {
        (0, Vec::new())
    };

    let live = BroadcastStream::new(state.log_sink.subscribe());
    let stream = tokio_stream::iter(backlog.into_iter().map(Ok))
        .chain(live)
        .map(|line| line.map(|l| Event::default().data(l)));

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

async fn persona_active(State(state): State<Arc<DaemonState>>) -> Json<Value> {
    Json(json!({"persona": state.personas.active()}))
}

async fn persona_list(State(state): State<Arc<DaemonState>>) -> Json<Value> {
    Json(json!({"personas": state.personas.list()}))
}

#[derive(Deserialize)]
struct PersonaSetBody {
    identifier: String,
}

async fn persona_set(
    State(state): State<Arc<DaemonState>>,
    Json(body): Json<PersonaSetBody>,
) -> impl IntoResponse {
    match state.personas.set_active(&body.identifier) {
        Ok(persona) => (StatusCode::OK, Json(json!({"persona": persona}))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": e.to_string()})),
        ),
    }
}

#[derive(Deserialize)]
struct PersonaCreateBody {
    name: String,
    #[serde(default = "default_color")]
    color: String,
    #[serde(default = "default_language")]
    language: String,
    #[serde(default)]
    description: String,
}

fn default_color() -> String {
    "#64748b".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

async fn persona_create(
    State(state): State<Arc<DaemonState>>,
    Json(body): Json<PersonaCreateBody>,
) -> impl IntoResponse {
    match state
        .personas
        .create(&body.name, &body.color, &body.language, &body.description)
    {
        Ok(persona) => (StatusCode::OK, Json(json!({"persona": persona}))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": e.to_string()})),
        ),
    }
}

#[derive(Deserialize)]
struct PersonaDeleteBody {
    name: String,
}

async fn persona_delete(
    State(state): State<Arc<DaemonState>>,
    Json(body): Json<PersonaDeleteBody>,
) -> impl IntoResponse {
    match state.personas.delete(&body.name) {
        Ok(()) => (StatusCode::OK, Json(json!({"success": true}))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": e.to_string()})),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use codebrain_config::{BrainConfig, ConfigDir};
    use codebrain_graph::MemoryGraphStore;
    use tower::ServiceExt as _;

    async fn test_router() -> (Router, Arc<DaemonState>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = BrainConfig::default();
        config.embeddings.defaults.provider = "local".to_string();
        config.embeddings.defaults.dimension = 32;
        let sink = crate::logsink::LogSink::open(tmp.path().join("daemon.log"), false).unwrap();
        let state = DaemonState::for_tests(
            config,
            ConfigDir::at(tmp.path().to_path_buf()),
            sink,
            Arc::new(MemoryGraphStore::new()),
            None,
        );
        crate::brain_tools::register_all(&state);
        state.lifecycle.mark_ready();
        (router(Arc::clone(&state)), state, tmp)
    }

    async fn get_json(router: &Router, path: &str) -> (StatusCode, Value) {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn post_json(router: &Router, path: &str, body: Value) -> (StatusCode, Value) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _state, _tmp) = test_router().await;
        let (status, body) = get_json(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_status_counts_requests() {
        let (router, state, _tmp) = test_router().await;
        let _ = get_json(&router, "/health").await;
        let (_, body) = get_json(&router, "/status").await;
        assert_eq!(body["request_count"], json!(2));
        assert_eq!(state.lifecycle.request_count(), 2);
    }

    #[tokio::test]
    async fn test_tools_listing_sorted() {
        let (router, _state, _tmp) = test_router().await;
        let (status, body) = get_json(&router, "/tools").await;
        assert_eq!(status, StatusCode::OK);
        let tools: Vec<String> = body["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        let mut sorted = tools.clone();
        sorted.sort();
        assert_eq!(tools, sorted);
        assert!(tools.contains(&"brain_search".to_string()));
        assert_eq!(body["count"], json!(tools.len()));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_404() {
        let (router, _state, _tmp) = test_router().await;
        let (status, body) = post_json(&router, "/tool/nonexistent", json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], json!(false));
    }

    #[tokio::test]
    async fn test_tool_success_shape() {
        let (router, _state, _tmp) = test_router().await;
        let (status, body) = post_json(&router, "/tool/list_brain_projects", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert!(body["duration_ms"].is_u64());
        assert!(body["result"]["projects"].is_array());
    }

    #[tokio::test]
    async fn test_read_only_tool_does_not_mutate_registries() {
        let (router, state, _tmp) = test_router().await;
        let before = (state.projects().len(), state.watcher_statuses().len());
        let _ = post_json(&router, "/tool/list_brain_projects", json!({})).await;
        let after = (state.projects().len(), state.watcher_statuses().len());
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_shutdown_triggers_drain() {
        let (router, state, _tmp) = test_router().await;
        let (status, body) = post_json(&router, "/shutdown", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("shutting_down"));
        assert_eq!(state.lifecycle.phase(), crate::lifecycle::DaemonPhase::Draining);
    }

    #[tokio::test]
    async fn test_persona_lifecycle_over_http() {
        let (router, _state, _tmp) = test_router().await;

        let (_, active) = get_json(&router, "/persona/active").await;
        assert_eq!(active["persona"]["id"], json!("default"));

        let (status, created) = post_json(
            &router,
            "/persona/create",
            json!({"name": "Reviewer", "description": "terse reviews"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = created["persona"]["id"].as_str().unwrap().to_string();

        let (status, set) =
            post_json(&router, "/persona/set", json!({"identifier": "Reviewer"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(set["persona"]["id"], json!(id));

        let (status, _) =
            post_json(&router, "/persona/delete", json!({"name": "Reviewer"})).await;
        assert_eq!(status, StatusCode::OK);

        let (_, list) = get_json(&router, "/persona/list").await;
        assert_eq!(list["personas"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_logs_endpoint() {
        let (router, state, _tmp) = test_router().await;
        state.log_sink.write_line("one");
        state.log_sink.write_line("two");

        let (status, body) = get_json(&router, "/logs?lines=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["returned_lines"], json!(1));
        assert_eq!(body["logs"], json!(["two"]));
        assert_eq!(body["total_lines"], json!(2));
    }

    #[tokio::test]
    async fn test_queue_file_change_without_project_is_404() {
        let (router, _state, _tmp) = test_router().await;
        let (status, body) = post_json(
            &router,
            "/queue-file-change",
            json!({"path": "/nowhere/x.rs", "change_type": "updated"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], json!(false));
    }
}

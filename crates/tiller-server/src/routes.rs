// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! HTTP surface of the agent server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use tiller_client::protocol::WsFrame;
use tiller_tools::{LocalWorkspace, ToolSpec, Workspace};

use crate::service::{status_label, AppState, ServerConversation};

const SESSION_KEY_HEADER: &str = "X-Session-API-Key";

/// Subdirectory of a project holding the hooks file.
const HOOKS_FILE: &str = ".tiller/hooks.json";

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/conversations", post(create_conversation))
        .route("/api/conversations/:id", get(get_conversation))
        .route("/api/conversations/:id/messages", post(post_message))
        .route("/api/conversations/:id/run", post(run_conversation))
        .route("/api/conversations/:id/events/search", get(search_events))
        .route("/api/conversations/:id/events", get(ws_events))
        .route("/api/execute_command", post(execute_command))
        .route("/api/file", get(read_file).post(write_file))
        .route("/api/vscode/url", get(vscode_url))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_session_key,
        ));

    Router::new()
        .route("/alive", get(alive))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/server_info", get(server_info))
        .route("/hooks", post(hooks))
        .merge(api)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_session_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: middleware::Next,
) -> Response {
    state.touch().await;
    // WebSocket clients cannot always set headers; the key may ride in the
    // query string instead.
    let query_key = request.uri().query().and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("session_api_key="))
            .map(str::to_string)
    });
    let provided = headers
        .get(SESSION_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query_key);
    if !state.session_key_valid(provided.as_deref()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "invalid or missing session API key"})),
        )
            .into_response();
    }
    next.run(request).await
}

// ─── Liveness and metadata ────────────────────────────────────────────────────

async fn alive() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn health() -> &'static str {
    "OK"
}

async fn ready(State(state): State<Arc<AppState>>) -> Response {
    if state.is_ready() {
        Json(json!({"status": "ok"})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "starting"})),
        )
            .into_response()
    }
}

async fn server_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "uptime": state.uptime_secs(),
        "idle_time": state.idle_secs().await,
        "title": "Tiller Agent Server",
        "version": env!("CARGO_PKG_VERSION"),
        "docs": "/docs",
        "redoc": "/redoc",
    }))
}

#[derive(Deserialize)]
struct HooksRequest {
    #[serde(default)]
    project_dir: Option<PathBuf>,
}

async fn hooks(Json(body): Json<HooksRequest>) -> Json<Value> {
    let hook_config = body
        .project_dir
        .map(|dir| dir.join(HOOKS_FILE))
        .filter(|path| path.is_file())
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|text| serde_json::from_str::<Value>(&text).ok());
    Json(json!({ "hook_config": hook_config }))
}

// ─── Conversations ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateConversationRequest {
    #[serde(default)]
    tools: Option<Vec<ToolSpec>>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    max_iteration_per_run: Option<u32>,
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateConversationRequest>,
) -> Response {
    match state.create_conversation(
        body.tools.unwrap_or_default(),
        body.system_prompt,
        body.max_iteration_per_run,
    ) {
        Ok(managed) => {
            let id = managed.conversation.id().to_string();
            debug!(id = %id, "conversation created");
            Json(json!({"id": id, "status": "idle"})).into_response()
        }
        Err(e) => {
            warn!("conversation creation failed: {e:#}");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"detail": e.to_string()})),
            )
                .into_response()
        }
    }
}

fn lookup(
    state: &AppState,
    id: &str,
) -> Result<Arc<ServerConversation>, Response> {
    state.get_conversation(id).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": format!("no conversation {id}")})),
        )
            .into_response()
    })
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let managed = match lookup(&state, &id) {
        Ok(c) => c,
        Err(r) => return r,
    };
    let status = managed.conversation.status().await;
    let events = managed.conversation.events_snapshot().await;
    Json(json!({
        "id": id,
        "status": status_label(status),
        "event_count": events.len(),
    }))
    .into_response()
}

#[derive(Deserialize)]
struct MessageRequest {
    content: String,
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<MessageRequest>,
) -> Response {
    let managed = match lookup(&state, &id) {
        Ok(c) => c,
        Err(r) => return r,
    };
    match managed.conversation.send_message(body.content).await {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"detail": e.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct RunRequest {
    #[serde(default)]
    run_id: Option<String>,
}

async fn run_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RunRequest>,
) -> Response {
    let managed = match lookup(&state, &id) {
        Ok(c) => c,
        Err(r) => return r,
    };
    let run_id = body
        .run_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let status = match managed.conversation.run().await {
        Ok(status) => status,
        Err(e) => {
            warn!(id = %id, "run failed: {e:#}");
            // The completion marker still goes out: the client's barrier
            // must release even on a failed run.
            let last_order = managed
                .conversation
                .events_snapshot()
                .await
                .last()
                .map(|e| e.order);
            managed.emit_run_finished(run_id, last_order).await;
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"detail": e.to_string()})),
            )
                .into_response();
        }
    };

    let last_order = managed
        .conversation
        .events_snapshot()
        .await
        .last()
        .map(|e| e.order);
    managed.emit_run_finished(run_id.clone(), last_order).await;

    Json(json!({"run_id": run_id, "status": status_label(status)})).into_response()
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    order__gt: Option<u64>,
    #[serde(default)]
    kind__eq: Option<String>,
}

async fn search_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let managed = match lookup(&state, &id) {
        Ok(c) => c,
        Err(r) => return r,
    };
    let events = managed.conversation.events_snapshot().await;
    let filtered: Vec<_> = events
        .into_iter()
        .filter(|e| query.order__gt.is_none_or(|gt| e.order > gt))
        .filter(|e| {
            query
                .kind__eq
                .as_deref()
                .is_none_or(|kind| event_kind_label(e) == kind)
        })
        .take(query.limit.unwrap_or(usize::MAX))
        .collect();
    Json(json!({ "events": filtered })).into_response()
}

fn event_kind_label(event: &tiller_core::Event) -> &'static str {
    use tiller_core::EventKind::*;
    match &event.kind {
        SystemPrompt { .. } => "SystemPrompt",
        Message { .. } => "Message",
        Action { .. } => "Action",
        Observation { .. } => "Observation",
        UserReject { .. } => "UserReject",
        AgentError { .. } => "AgentError",
        Condensation { .. } => "Condensation",
        StateUpdate { .. } => "StateUpdate",
        PauseRequested { .. } => "PauseRequested",
    }
}

// ─── WebSocket streaming ──────────────────────────────────────────────────────

async fn ws_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let managed = match lookup(&state, &id) {
        Ok(c) => c,
        Err(r) => return r,
    };
    ws.on_upgrade(move |socket| stream_events(socket, managed))
}

/// Replay the snapshot, then forward live frames, skipping any event the
/// snapshot already covered — each event id crosses the socket exactly
/// once.
async fn stream_events(mut socket: WebSocket, managed: Arc<ServerConversation>) {
    let mut frames = managed.subscribe_frames();
    let snapshot = managed.conversation.events_snapshot().await;
    let replayed_up_to: i64 = snapshot.last().map(|e| e.order as i64).unwrap_or(-1);

    for event in snapshot {
        if send_frame(&mut socket, &WsFrame::Event { event }).await.is_err() {
            return;
        }
    }

    loop {
        match frames.recv().await {
            Ok(WsFrame::Event { event }) => {
                if (event.order as i64) <= replayed_up_to {
                    continue;
                }
                if send_frame(&mut socket, &WsFrame::Event { event }).await.is_err() {
                    break;
                }
            }
            Ok(marker @ WsFrame::RunFinished { .. }) => {
                if send_frame(&mut socket, &marker).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(lost = n, "websocket subscriber lagged; closing");
                break;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn send_frame(socket: &mut WebSocket, frame: &WsFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).expect("frame serialization");
    socket.send(Message::Text(text)).await
}

// ─── Workspace endpoints (backing RemoteWorkspace) ────────────────────────────

#[derive(Deserialize)]
struct ExecuteCommandRequest {
    command: String,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

async fn execute_command(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExecuteCommandRequest>,
) -> Response {
    let workspace = LocalWorkspace::new(state.config.workspace_path.clone());
    let timeout = Duration::from_secs(body.timeout_secs.unwrap_or(30));
    match workspace
        .execute_command(&body.command, body.cwd.as_deref(), timeout)
        .await
    {
        Ok(result) => Json(serde_json::to_value(result).expect("command result")).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"detail": e.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct FileQuery {
    path: PathBuf,
}

async fn read_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FileQuery>,
) -> Response {
    let workspace = LocalWorkspace::new(state.config.workspace_path.clone());
    match workspace.read_file(&query.path).await {
        Ok(contents) => Json(json!({"contents": contents})).into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": e.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct WriteFileRequest {
    path: PathBuf,
    contents: String,
}

async fn write_file(
    State(state): State<Arc<AppState>>,
    Json(body): Json<WriteFileRequest>,
) -> Response {
    let workspace = LocalWorkspace::new(state.config.workspace_path.clone());
    match workspace.write_file(&body.path, &body.contents).await {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"detail": e.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct VscodeQuery {
    workspace_dir: PathBuf,
}

async fn vscode_url(Query(query): Query<VscodeQuery>) -> Json<Value> {
    Json(json!({
        "url": format!("vscode://file{}", query.workspace_dir.display())
    }))
}

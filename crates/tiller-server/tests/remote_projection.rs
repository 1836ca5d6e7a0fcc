// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Remote projection contract: a thin client mirrors a server-side
//! conversation without losing or duplicating events.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tiller_client::{CreateConversationOptions, RemoteConversation};
use tiller_config::ServerConfig;
use tiller_llm::{Completion, Llm, RetryPolicy, ScriptedProvider};
use tiller_server::{build_router, AppState};

fn scripted_state(dir: &std::path::Path, session_api_keys: Vec<String>) -> Arc<AppState> {
    let mut config = ServerConfig::default();
    config.conversations_path = dir.join("conversations");
    config.workspace_path = dir.join("workspace");
    config.session_api_keys = session_api_keys;
    AppState::with_llm_factory(
        config,
        Box::new(|| {
            // Every conversation's model immediately finishes.
            let provider = Arc::new(ScriptedProvider::new(vec![Completion::tool_call(
                "finish",
                json!({"message": "done"}),
            )]));
            Ok(Arc::new(Llm::new("agent", provider, RetryPolicy::none())?))
        }),
    )
}

async fn spawn_server(state: Arc<AppState>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("ephemeral port");
    let addr = listener.local_addr().unwrap();
    let router = build_router(Arc::clone(&state));
    state.mark_ready();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Before `run()` returns, every event the server produced must have been
/// delivered over the WebSocket: the mirror and the REST view agree on
/// cardinality and ids.
#[tokio::test]
async fn run_mirrors_every_server_event() {
    let dir = tempfile::tempdir().unwrap();
    let host = spawn_server(scripted_state(dir.path(), vec![])).await;

    let conv = RemoteConversation::create(&host, CreateConversationOptions::default())
        .await
        .unwrap();
    conv.send_message("hi").await.unwrap();
    let status = conv.run(Duration::from_secs(10)).await.unwrap();
    assert_eq!(status, "finished");

    let mirrored = conv.events();
    let rest = conv.search_events(None, None, None).await.unwrap();

    let mirrored_ids: Vec<&str> = mirrored.iter().map(|e| e.id.as_str()).collect();
    let rest_ids: Vec<&str> = rest.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(mirrored_ids, rest_ids, "no event lost or duplicated");

    // SystemPrompt, user Message, finish Action, Observation.
    assert_eq!(rest.len(), 4);
    let kinds: Vec<String> = rest
        .iter()
        .map(|e| {
            serde_json::to_value(e).unwrap()["kind"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(kinds, vec!["SystemPrompt", "Message", "Action", "Observation"]);

    conv.close().await;
}

#[tokio::test]
async fn search_filters_by_order_and_kind() {
    let dir = tempfile::tempdir().unwrap();
    let host = spawn_server(scripted_state(dir.path(), vec![])).await;

    let conv = RemoteConversation::create(&host, CreateConversationOptions::default())
        .await
        .unwrap();
    conv.send_message("hi").await.unwrap();
    conv.run(Duration::from_secs(10)).await.unwrap();

    let all = conv.search_events(None, None, None).await.unwrap();
    assert_eq!(all.len(), 4);
    for (i, e) in all.iter().enumerate() {
        assert_eq!(e.order, i as u64, "totally ordered by order");
    }

    let after_one = conv.search_events(Some(1), None, None).await.unwrap();
    assert_eq!(after_one.len(), 2);
    assert!(after_one.iter().all(|e| e.order > 1));

    let actions = conv.search_events(None, Some("Action"), None).await.unwrap();
    assert_eq!(actions.len(), 1);

    let limited = conv.search_events(None, None, Some(2)).await.unwrap();
    assert_eq!(limited.len(), 2);

    conv.close().await;
}

/// Long-command polling passes the last-seen order; nothing at or below
/// the watermark ever comes back.
#[tokio::test]
async fn polling_never_replays_seen_orders() {
    let dir = tempfile::tempdir().unwrap();
    let host = spawn_server(scripted_state(dir.path(), vec![])).await;

    let conv = RemoteConversation::create(&host, CreateConversationOptions::default())
        .await
        .unwrap();
    conv.send_message("hi").await.unwrap();

    let first = conv.poll_new_events().await.unwrap();
    assert!(!first.is_empty());
    let second = conv.poll_new_events().await.unwrap();
    assert!(second.is_empty(), "no duplicated chunks on re-poll");

    conv.run(Duration::from_secs(10)).await.unwrap();
    let third = conv.poll_new_events().await.unwrap();
    assert!(!third.is_empty());
    let min_new = third.iter().map(|e| e.order).min().unwrap();
    let max_old = first.iter().map(|e| e.order).max().unwrap();
    assert!(min_new > max_old);

    conv.close().await;
}

#[tokio::test]
async fn liveness_and_metadata_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let host = spawn_server(scripted_state(dir.path(), vec![])).await;
    let http = reqwest::Client::new();

    let alive: serde_json::Value = http
        .get(format!("{host}/alive"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(alive["status"], "ok");

    let health = http
        .get(format!("{host}/health"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(health, "OK");

    let ready = http.get(format!("{host}/ready")).send().await.unwrap();
    assert_eq!(ready.status().as_u16(), 200);

    let info: serde_json::Value = http
        .get(format!("{host}/server_info"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(info["uptime"].as_f64().unwrap() >= 0.0);
    assert_eq!(info["title"], "Tiller Agent Server");
    assert!(info.get("docs").is_some());
    assert!(info.get("redoc").is_some());
}

#[tokio::test]
async fn hooks_endpoint_reads_project_file() {
    let dir = tempfile::tempdir().unwrap();
    let host = spawn_server(scripted_state(dir.path(), vec![])).await;
    let http = reqwest::Client::new();

    // No hooks file: null config.
    let empty: serde_json::Value = http
        .post(format!("{host}/hooks"))
        .json(&json!({"project_dir": dir.path()}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(empty["hook_config"].is_null());

    // With a hooks file in place.
    let hooks_dir = dir.path().join(".tiller");
    std::fs::create_dir_all(&hooks_dir).unwrap();
    std::fs::write(
        hooks_dir.join("hooks.json"),
        r#"{"on_start": "echo started"}"#,
    )
    .unwrap();
    let loaded: serde_json::Value = http
        .post(format!("{host}/hooks"))
        .json(&json!({"project_dir": dir.path()}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(loaded["hook_config"]["on_start"], "echo started");
}

#[tokio::test]
async fn session_api_key_gates_the_api() {
    let dir = tempfile::tempdir().unwrap();
    let host = spawn_server(scripted_state(dir.path(), vec!["sekrit".into()])).await;
    let http = reqwest::Client::new();

    // Liveness stays open.
    assert_eq!(
        http.get(format!("{host}/alive"))
            .send()
            .await
            .unwrap()
            .status()
            .as_u16(),
        200
    );

    // API without the key is rejected.
    let denied = http
        .post(format!("{host}/api/conversations"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status().as_u16(), 401);

    // With the key, the full client flow works.
    let conv = RemoteConversation::create(
        &host,
        CreateConversationOptions {
            session_api_key: Some("sekrit".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    conv.send_message("hi").await.unwrap();
    assert_eq!(conv.run(Duration::from_secs(10)).await.unwrap(), "finished");
    conv.close().await;
}

#[tokio::test]
async fn execute_command_backs_remote_workspaces() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("workspace")).unwrap();
    let host = spawn_server(scripted_state(dir.path(), vec![])).await;

    use tiller_tools::{Workspace, WorkspaceSpec};
    let ws = WorkspaceSpec::Remote {
        host: host.clone(),
        working_dir: "workspace".into(),
        session_api_key: None,
    }
    .connect();

    let result = ws
        .execute_command("echo remote-check", None, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.contains("remote-check"));

    ws.write_file(std::path::Path::new("note.txt"), "over the wire")
        .await
        .unwrap();
    let read = ws.read_file(std::path::Path::new("note.txt")).await.unwrap();
    assert_eq!(read, "over the wire");
}

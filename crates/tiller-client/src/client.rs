// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Remote conversation mirror.
//!
//! The client mirrors a server-authoritative conversation: REST for
//! lifecycle operations, a WebSocket for the event stream. Three
//! invariants are enforced here, not merely hoped for:
//!
//! - **no duplicated events** — a re-delivered event id trips an
//!   assertion-level protocol error instead of being silently deduped;
//! - **no lost events around termination** — `run()` returns only after
//!   the server's `run_finished` marker arrived on the WebSocket, which
//!   (by stream ordering) means every event of the run was delivered;
//! - **monotonic polling** — REST polls pass `order__gt`; a response
//!   event at or below the watermark is a protocol error, never silently
//!   collapsed output.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use tiller_core::Event;
use tiller_tools::ToolSpec;

use crate::protocol::WsFrame;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(String),

    #[error("websocket error: {0}")]
    Ws(String),

    /// An invariant of the remote projection was violated — duplicated
    /// event id, non-monotonic order, malformed frame. Fail fast.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("timed out waiting for the run completion marker")]
    RunBarrierTimeout,
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateConversationOptions {
    pub tools: Vec<ToolSpec>,
    pub system_prompt: Option<String>,
    pub max_iteration_per_run: Option<u32>,
    pub session_api_key: Option<String>,
}

/// Mirror state shared with the WebSocket reader task.
#[derive(Default)]
struct Mirror {
    events: Mutex<Vec<Event>>,
    seen: Mutex<HashSet<String>>,
    run_barriers: Mutex<HashMap<String, oneshot::Sender<()>>>,
    protocol_error: Mutex<Option<String>>,
}

impl Mirror {
    /// Apply one frame from the stream. Returns `false` once the mirror is
    /// poisoned and the reader should stop.
    fn ingest(&self, frame: WsFrame) -> bool {
        match frame {
            WsFrame::Event { event } => {
                let mut seen = self.seen.lock().expect("seen lock");
                if !seen.insert(event.id.clone()) {
                    let msg = format!("event {} delivered twice over the WebSocket", event.id);
                    warn!("{msg}");
                    *self.protocol_error.lock().expect("error lock") = Some(msg);
                    return false;
                }
                drop(seen);
                self.events.lock().expect("events lock").push(event);
                true
            }
            WsFrame::RunFinished { run_id } => {
                if let Some(tx) = self
                    .run_barriers
                    .lock()
                    .expect("barriers lock")
                    .remove(&run_id)
                {
                    let _ = tx.send(());
                } else {
                    debug!(run_id = %run_id, "completion marker for an unknown run");
                }
                true
            }
        }
    }

    fn poisoned(&self) -> Option<String> {
        self.protocol_error.lock().expect("error lock").clone()
    }
}

pub struct RemoteConversation {
    id: String,
    host: String,
    http: reqwest::Client,
    session_api_key: Option<String>,
    mirror: Arc<Mirror>,
    ws_task: tokio::task::JoinHandle<()>,
    /// Highest order handed out by `poll_new_events`.
    poll_watermark: Mutex<Option<u64>>,
}

#[derive(Deserialize)]
struct ConversationInfo {
    id: String,
}

#[derive(Deserialize)]
struct RunResponse {
    status: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    events: Vec<Event>,
}

impl RemoteConversation {
    /// Create a conversation on the server and start mirroring its events.
    pub async fn create(
        host: impl Into<String>,
        options: CreateConversationOptions,
    ) -> Result<Self, ClientError> {
        let host = host.into();
        let host = host.trim_end_matches('/').to_string();
        let http = reqwest::Client::new();

        let mut req = http.post(format!("{host}/api/conversations")).json(&json!({
            "tools": options.tools,
            "system_prompt": options.system_prompt,
            "max_iteration_per_run": options.max_iteration_per_run,
        }));
        if let Some(key) = &options.session_api_key {
            req = req.header("X-Session-API-Key", key);
        }
        let info: ConversationInfo = req
            .send()
            .await?
            .error_for_status()
            .map_err(|e| ClientError::Http(e.to_string()))?
            .json()
            .await?;

        let mut ws_url = format!(
            "{}/api/conversations/{}/events",
            host.replacen("http", "ws", 1),
            info.id
        );
        if let Some(key) = &options.session_api_key {
            ws_url.push_str(&format!("?session_api_key={key}"));
        }
        let (stream, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .map_err(|e| ClientError::Ws(e.to_string()))?;

        let mirror = Arc::new(Mirror::default());
        let reader_mirror = Arc::clone(&mirror);
        let ws_task = tokio::spawn(async move {
            let (_write, mut read) = stream.split();
            while let Some(message) = read.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<WsFrame>(&text) {
                        Ok(frame) => {
                            if !reader_mirror.ingest(frame) {
                                break;
                            }
                        }
                        Err(e) => {
                            *reader_mirror.protocol_error.lock().expect("error lock") =
                                Some(format!("malformed frame: {e}"));
                            break;
                        }
                    },
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        Ok(Self {
            id: info.id,
            host,
            http,
            session_api_key: options.session_api_key,
            mirror,
            ws_task,
            poll_watermark: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method, format!("{}{path}", self.host));
        if let Some(key) = &self.session_api_key {
            req = req.header("X-Session-API-Key", key);
        }
        req
    }

    fn check_poisoned(&self) -> Result<(), ClientError> {
        match self.mirror.poisoned() {
            Some(msg) => Err(ClientError::Protocol(msg)),
            None => Ok(()),
        }
    }

    /// Send a user message.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.check_poisoned()?;
        self.request(
            reqwest::Method::POST,
            &format!("/api/conversations/{}/messages", self.id),
        )
        .json(&json!({ "content": text.into() }))
        .send()
        .await?
        .error_for_status()
        .map_err(|e| ClientError::Http(e.to_string()))?;
        Ok(())
    }

    /// Drive the server-side loop to its next terminal condition.
    ///
    /// Returns only after the server's completion marker arrived over the
    /// WebSocket — every event the run produced is in the local mirror by
    /// then.
    pub async fn run(&self, barrier_timeout: Duration) -> Result<String, ClientError> {
        self.check_poisoned()?;
        let run_id = uuid::Uuid::new_v4().to_string();

        // Register the barrier before the request: the marker may arrive
        // before the HTTP response does.
        let (tx, rx) = oneshot::channel();
        self.mirror
            .run_barriers
            .lock()
            .expect("barriers lock")
            .insert(run_id.clone(), tx);

        let response: RunResponse = self
            .request(
                reqwest::Method::POST,
                &format!("/api/conversations/{}/run", self.id),
            )
            .json(&json!({ "run_id": run_id }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| ClientError::Http(e.to_string()))?
            .json()
            .await?;

        match tokio::time::timeout(barrier_timeout, rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(ClientError::Ws("event stream closed during run".into()))
            }
            Err(_) => return Err(ClientError::RunBarrierTimeout),
        }

        self.check_poisoned()?;
        Ok(response.status)
    }

    /// The locally mirrored events, ordered.
    pub fn events(&self) -> Vec<Event> {
        let mut events = self.mirror.events.lock().expect("events lock").clone();
        events.sort_by_key(|e| e.order);
        events
    }

    /// Server-side event query, totally ordered by `order`.
    pub async fn search_events(
        &self,
        order_gt: Option<u64>,
        kind_eq: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, ClientError> {
        let mut query: Vec<(String, String)> = Vec::new();
        if let Some(order) = order_gt {
            query.push(("order__gt".into(), order.to_string()));
        }
        if let Some(kind) = kind_eq {
            query.push(("kind__eq".into(), kind.to_string()));
        }
        if let Some(limit) = limit {
            query.push(("limit".into(), limit.to_string()));
        }
        let response: SearchResponse = self
            .request(
                reqwest::Method::GET,
                &format!("/api/conversations/{}/events/search", self.id),
            )
            .query(&query)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| ClientError::Http(e.to_string()))?
            .json()
            .await?;
        Ok(response.events)
    }

    /// Poll events past the last-seen order — the streaming path for
    /// long-running commands. A returned event at or below the watermark
    /// is a protocol violation.
    pub async fn poll_new_events(&self) -> Result<Vec<Event>, ClientError> {
        let watermark = *self.poll_watermark.lock().expect("watermark lock");
        let events = self.search_events(watermark, None, None).await?;
        if let Some(watermark) = watermark {
            if let Some(stale) = events.iter().find(|e| e.order <= watermark) {
                return Err(ClientError::Protocol(format!(
                    "poll returned order {} at or below watermark {watermark}",
                    stale.order
                )));
            }
        }
        if let Some(last) = events.last() {
            *self.poll_watermark.lock().expect("watermark lock") = Some(last.order);
        }
        Ok(events)
    }

    /// Drop the mirror and its WebSocket task.
    pub async fn close(self) {
        self.ws_task.abort();
        let _ = self.ws_task.await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

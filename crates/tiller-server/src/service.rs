// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Server-side conversation management.
//!
//! Each conversation owns a frame channel feeding its WebSocket
//! subscribers. A forwarder task relays appended events into frames and
//! publishes a high-water mark of the last forwarded order; the run
//! handler waits on that mark before emitting the `run_finished` marker,
//! so the marker can never overtake an event of its own run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use tiller_client::protocol::WsFrame;
use tiller_config::{
    ConfirmationSetting, RiskLevelSetting, SecurityAnalyzerSetting, ServerConfig,
};
use tiller_core::{
    AgentConfig, ConfirmationPolicy, ExecutionStatus, GraySwanAnalyzer, LlmSecurityAnalyzer,
    LocalConversation, SecurityAnalyzer, SecurityRisk,
};
use tiller_llm::{Llm, OpenAiCompatProvider, RetryPolicy};
use tiller_tools::{ToolSpec, WorkspaceSpec};

/// Builds the LLM for a new conversation. Swappable so tests can inject a
/// scripted provider.
pub type LlmFactory = Box<dyn Fn() -> anyhow::Result<Arc<Llm>> + Send + Sync>;

/// Capacity of a conversation's WebSocket frame channel.
const FRAME_CHANNEL_CAPACITY: usize = 1024;

pub struct ServerConversation {
    pub conversation: Arc<LocalConversation>,
    frames_tx: broadcast::Sender<WsFrame>,
    /// Order of the last event relayed into the frame channel; -1 before
    /// the first.
    forwarded: watch::Receiver<i64>,
}

impl std::fmt::Debug for ServerConversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConversation").finish_non_exhaustive()
    }
}

impl ServerConversation {
    fn spawn(conversation: Arc<LocalConversation>) -> Arc<Self> {
        let (frames_tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let (mark_tx, forwarded) = watch::channel(-1i64);

        let mut events_rx = conversation.subscribe();
        let relay_tx = frames_tx.clone();
        tokio::spawn(async move {
            loop {
                match events_rx.recv().await {
                    Ok(event) => {
                        let order = event.order as i64;
                        let _ = relay_tx.send(WsFrame::Event { event });
                        let _ = mark_tx.send(order);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // A lagged relay would silently lose events for
                        // every subscriber; surface loudly and stop.
                        warn!(lost = n, "event relay lagged; closing frame stream");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Arc::new(Self {
            conversation,
            frames_tx,
            forwarded,
        })
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<WsFrame> {
        self.frames_tx.subscribe()
    }

    /// Wait until every event up to `order` has been relayed, then emit
    /// the completion marker for `run_id`.
    pub async fn emit_run_finished(&self, run_id: String, last_order: Option<u64>) {
        if let Some(last_order) = last_order {
            let mut mark = self.forwarded.clone();
            let target = last_order as i64;
            // The relay task only stops when the conversation is dropped;
            // wait_for errors then, and there is nobody left to notify.
            if mark.wait_for(|v| *v >= target).await.is_err() {
                return;
            }
        }
        debug!(run_id = %run_id, "emitting run completion marker");
        let _ = self.frames_tx.send(WsFrame::RunFinished { run_id });
    }
}

pub struct AppState {
    pub config: ServerConfig,
    conversations: DashMap<String, Arc<ServerConversation>>,
    llm_factory: LlmFactory,
    started_at: Instant,
    last_activity: Mutex<Instant>,
    ready: AtomicBool,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let settings = config.llm.clone().with_env_overrides();
        Self::with_llm_factory(
            config,
            Box::new(move || {
                let provider = Arc::new(OpenAiCompatProvider::from_settings(&settings));
                Ok(Arc::new(Llm::new("agent", provider, RetryPolicy::default())?))
            }),
        )
    }

    pub fn with_llm_factory(config: ServerConfig, llm_factory: LlmFactory) -> Arc<Self> {
        Arc::new(Self {
            config,
            conversations: DashMap::new(),
            llm_factory,
            started_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            ready: AtomicBool::new(false),
        })
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub async fn idle_secs(&self) -> f64 {
        self.last_activity.lock().await.elapsed().as_secs_f64()
    }

    pub async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    /// Create and register a conversation.
    pub fn create_conversation(
        &self,
        tools: Vec<ToolSpec>,
        system_prompt: Option<String>,
        max_iteration_per_run: Option<u32>,
    ) -> anyhow::Result<Arc<ServerConversation>> {
        let llm = (self.llm_factory)()?;
        let mut agent_config = AgentConfig::new(llm);
        agent_config.tools = tools;
        agent_config.system_prompt =
            system_prompt.or_else(|| self.config.agent.system_prompt.clone());
        agent_config.max_iteration_per_run =
            max_iteration_per_run.unwrap_or(self.config.agent.max_iteration_per_run);
        agent_config.security_analyzer = self.build_security_analyzer()?;

        let persistence_dir: PathBuf = self
            .config
            .conversations_path
            .join(Uuid::new_v4().to_string());
        let conversation = Arc::new(LocalConversation::new(
            agent_config,
            WorkspaceSpec::local(self.config.workspace_path.clone()),
            confirmation_policy(self.config.agent.confirmation),
            Some(persistence_dir),
        )?);

        let managed = ServerConversation::spawn(conversation);
        self.conversations
            .insert(managed.conversation.id().to_string(), Arc::clone(&managed));
        Ok(managed)
    }

    /// Analyzer configured for this server's conversations. A risky
    /// confirmation policy without an analyzer would see every risk as
    /// unknown and demand confirmation for every action.
    fn build_security_analyzer(&self) -> anyhow::Result<Option<Arc<dyn SecurityAnalyzer>>> {
        Ok(match self.config.security_analyzer {
            SecurityAnalyzerSetting::None => None,
            SecurityAnalyzerSetting::Llm => Some(Arc::new(LlmSecurityAnalyzer)),
            SecurityAnalyzerSetting::Grayswan => Some(Arc::new(GraySwanAnalyzer::new(
                self.config.grayswan.clone().with_env_overrides(),
            )?)),
        })
    }

    pub fn get_conversation(&self, id: &str) -> Option<Arc<ServerConversation>> {
        self.conversations.get(id).map(|c| Arc::clone(&c))
    }

    pub fn session_key_valid(&self, provided: Option<&str>) -> bool {
        if self.config.session_api_keys.is_empty() {
            return true;
        }
        provided.is_some_and(|key| self.config.session_api_keys.iter().any(|k| k == key))
    }
}

fn confirmation_policy(setting: ConfirmationSetting) -> ConfirmationPolicy {
    match setting {
        ConfirmationSetting::AlwaysConfirm => ConfirmationPolicy::AlwaysConfirm,
        ConfirmationSetting::NeverConfirm => ConfirmationPolicy::NeverConfirm,
        ConfirmationSetting::ConfirmRisky { threshold } => ConfirmationPolicy::ConfirmRisky {
            threshold: match threshold {
                RiskLevelSetting::Low => SecurityRisk::Low,
                RiskLevelSetting::Medium => SecurityRisk::Medium,
                RiskLevelSetting::High => SecurityRisk::High,
            },
        },
    }
}

/// Human-readable status label used by the HTTP surface.
pub fn status_label(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Idle => "idle",
        ExecutionStatus::Running => "running",
        ExecutionStatus::AwaitingConfirmation => "awaiting_confirmation",
        ExecutionStatus::Finished => "finished",
        ExecutionStatus::Paused => "paused",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

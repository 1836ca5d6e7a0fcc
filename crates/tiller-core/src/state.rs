// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversation state: the event log plus everything around it.
//!
//! ## Autosave contract
//!
//! `agent_state`, the confirmation policy, the execution status and the
//! stats are reachable only through setters on this type, and every setter
//! rewrites `base_state.json` (temp + rename) before returning. Replacing
//! the map through [`ConversationState::set_agent_state`] is the one write
//! path — there is no way to mutate the stored map in place, which turns
//! the autosave trigger into a compile-time property.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tiller_llm::Usage;
use tiller_tools::WorkspaceSpec;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::event::{Event, EventKind};
use crate::log::{write_atomic, EventLog};
use crate::security::ConfirmationPolicy;
use crate::stats::ConversationStats;

/// `agent_state` key holding tool-call ids awaiting user confirmation.
pub const PENDING_ACTIONS_KEY: &str = "pending_actions";

const BASE_STATE_FILE: &str = "base_state.json";
const STATS_FILE: &str = "stats.json";

/// Capacity of the per-conversation event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Idle,
    Running,
    AwaitingConfirmation,
    Finished,
    Paused,
}

/// Everything in `base_state.json`: the conversation minus its events.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BaseState {
    id: String,
    workspace: WorkspaceSpec,
    agent_state: BTreeMap<String, Value>,
    confirmation_policy: ConfirmationPolicy,
    status: ExecutionStatus,
    iterations_since_user_message: u32,
}

pub struct ConversationState {
    id: String,
    workspace: WorkspaceSpec,
    log: EventLog,
    persistence_dir: Option<PathBuf>,
    agent_state: BTreeMap<String, Value>,
    confirmation_policy: ConfirmationPolicy,
    status: ExecutionStatus,
    iterations_since_user_message: u32,
    stats: ConversationStats,
    pause_requested: bool,
    events_tx: broadcast::Sender<Event>,
}

impl ConversationState {
    /// Fresh conversation with a new uuid.
    pub fn new(
        workspace: WorkspaceSpec,
        confirmation_policy: ConfirmationPolicy,
        persistence_dir: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let log = match &persistence_dir {
            Some(dir) => EventLog::open(dir)?,
            None => EventLog::new(),
        };
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = Self {
            id: Uuid::new_v4().to_string(),
            workspace,
            log,
            persistence_dir,
            agent_state: BTreeMap::new(),
            confirmation_policy,
            status: ExecutionStatus::Idle,
            iterations_since_user_message: 0,
            stats: ConversationStats::default(),
            pause_requested: false,
            events_tx,
        };
        state.save()?;
        Ok(state)
    }

    /// Resume a persisted conversation from its directory.
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        let base_path = dir.join(BASE_STATE_FILE);
        let text = std::fs::read_to_string(&base_path)
            .with_context(|| format!("reading {}", base_path.display()))?;
        let base: BaseState = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", base_path.display()))?;

        let stats = match std::fs::read_to_string(dir.join(STATS_FILE)) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => ConversationStats::default(),
        };

        let log = EventLog::open(dir)?;
        validate_prefix(&log)?;

        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            id: base.id,
            workspace: base.workspace,
            log,
            persistence_dir: Some(dir.to_path_buf()),
            agent_state: base.agent_state,
            confirmation_policy: base.confirmation_policy,
            status: base.status,
            iterations_since_user_message: base.iterations_since_user_message,
            stats,
            pause_requested: false,
            events_tx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workspace(&self) -> &WorkspaceSpec {
        &self.workspace
    }

    pub fn persistence_dir(&self) -> Option<&Path> {
        self.persistence_dir.as_deref()
    }

    pub fn events(&self) -> &[Event] {
        self.log.events()
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.log.snapshot()
    }

    pub fn find_event(&self, id: &str) -> Option<&Event> {
        self.log.find(id)
    }

    /// Append an event, persist it, and fan it out to subscribers.
    pub fn append(&mut self, event: Event) -> anyhow::Result<Event> {
        validate_append(&self.log, &event)?;
        let event = self.log.append(event)?;
        let _ = self.events_tx.send(event.clone());
        Ok(event)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    pub(crate) fn events_sender(&self) -> broadcast::Sender<Event> {
        self.events_tx.clone()
    }

    // ── Autosaved fields ──────────────────────────────────────────────────────

    pub fn agent_state(&self) -> &BTreeMap<String, Value> {
        &self.agent_state
    }

    /// Replace the whole map. This is the only write path to `agent_state`
    /// and it performs the durable write.
    pub fn set_agent_state(&mut self, map: BTreeMap<String, Value>) -> anyhow::Result<()> {
        self.agent_state = map;
        self.save()
    }

    pub fn confirmation_policy(&self) -> &ConfirmationPolicy {
        &self.confirmation_policy
    }

    pub fn set_confirmation_policy(&mut self, policy: ConfirmationPolicy) -> anyhow::Result<()> {
        self.confirmation_policy = policy;
        self.save()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ExecutionStatus) -> anyhow::Result<()> {
        self.status = status;
        self.save()
    }

    pub fn iterations_since_user_message(&self) -> u32 {
        self.iterations_since_user_message
    }

    pub fn set_iterations_since_user_message(&mut self, value: u32) -> anyhow::Result<()> {
        self.iterations_since_user_message = value;
        self.save()
    }

    pub fn stats(&self) -> &ConversationStats {
        &self.stats
    }

    pub fn record_usage(&mut self, usage_id: &str, usage: &Usage) -> anyhow::Result<()> {
        self.stats.record(usage_id, usage);
        self.save()
    }

    // ── Pause flag (advisory, observed at step boundaries) ───────────────────

    pub fn pause_requested(&self) -> bool {
        self.pause_requested
    }

    pub fn set_pause_requested(&mut self, value: bool) {
        self.pause_requested = value;
    }

    // ── Pending confirmation helpers ──────────────────────────────────────────

    pub fn pending_action_ids(&self) -> Vec<String> {
        self.agent_state
            .get(PENDING_ACTIONS_KEY)
            .and_then(|v| v.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_pending_action_ids(&mut self, ids: Vec<String>) -> anyhow::Result<()> {
        let mut map = self.agent_state.clone();
        if ids.is_empty() {
            map.remove(PENDING_ACTIONS_KEY);
        } else {
            map.insert(PENDING_ACTIONS_KEY.into(), serde_json::json!(ids));
        }
        self.set_agent_state(map)
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    fn save(&self) -> anyhow::Result<()> {
        let Some(dir) = &self.persistence_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        let base = BaseState {
            id: self.id.clone(),
            workspace: self.workspace.clone(),
            agent_state: self.agent_state.clone(),
            confirmation_policy: self.confirmation_policy.clone(),
            status: self.status,
            iterations_since_user_message: self.iterations_since_user_message,
        };
        write_atomic(
            &dir.join(BASE_STATE_FILE),
            &serde_json::to_vec_pretty(&base)?,
        )?;
        write_atomic(
            &dir.join(STATS_FILE),
            &serde_json::to_vec_pretty(&self.stats)?,
        )?;
        Ok(())
    }
}

/// Structural invariants enforced at append time: the first events must be
/// a `SystemPrompt`, optionally preceded by a single `StateUpdate` (the
/// remote prefix), and at most one `SystemPrompt` ever exists.
fn validate_append(log: &EventLog, event: &Event) -> anyhow::Result<()> {
    let has_system = log
        .events()
        .iter()
        .any(|e| matches!(e.kind, EventKind::SystemPrompt { .. }));
    match &event.kind {
        EventKind::SystemPrompt { .. } => {
            if has_system {
                anyhow::bail!("a conversation carries at most one system prompt");
            }
            if log.len() > 1
                || (log.len() == 1
                    && !matches!(log.events()[0].kind, EventKind::StateUpdate { .. }))
            {
                anyhow::bail!("system prompt must be at order 0, or 1 after a state-update prefix");
            }
        }
        EventKind::StateUpdate { .. } => {}
        _ => {
            if !has_system {
                anyhow::bail!("first conversation event must be the system prompt");
            }
        }
    }
    Ok(())
}

fn validate_prefix(log: &EventLog) -> anyhow::Result<()> {
    let events = log.events();
    if events.is_empty() {
        return Ok(());
    }
    let system_ok = match &events[0].kind {
        EventKind::SystemPrompt { .. } => true,
        EventKind::StateUpdate { .. } => events
            .get(1)
            .is_some_and(|e| matches!(e.kind, EventKind::SystemPrompt { .. })),
        _ => false,
    };
    if !system_ok {
        anyhow::bail!("corrupted event log: system prompt is not at order 0 or 1");
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tiller_llm::{ContentPart, Role, ToolSchema};
use uuid::Uuid;

use crate::critic::CriticResult;
use crate::security::SecurityRisk;

pub type EventId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    User,
    Agent,
    Environment,
}

/// The atomic unit of conversation history.
///
/// `order` is dense from 0 and assigned at append time; events are
/// immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub order: u64,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Event payloads, discriminated by `kind` on the wire. The discriminator
/// is internal: it never appears in externally rendered tool schemas.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EventKind {
    SystemPrompt {
        prompt: String,
        tools: Vec<ToolSchema>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dynamic_context: Option<String>,
    },
    Message {
        role: Role,
        content: Vec<ContentPart>,
    },
    Action {
        tool_name: String,
        tool_call_id: String,
        llm_response_id: String,
        arguments: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        risk: Option<SecurityRisk>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        critic: Option<CriticResult>,
    },
    Observation {
        tool_name: String,
        tool_call_id: String,
        action_id: EventId,
        content: Vec<ContentPart>,
        #[serde(default)]
        is_error: bool,
        /// Typed observation payload as produced by the tool.
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
    },
    UserReject {
        tool_call_id: String,
        reason: String,
    },
    AgentError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        error: String,
    },
    Condensation {
        summary: String,
        /// How many events after the system prompt are kept verbatim;
        /// 0 means a hard context reset.
        summary_offset: usize,
        forgotten_event_ids: Vec<EventId>,
        /// Id minted for the synthetic summary event inserted into views.
        summary_event_id: EventId,
    },
    StateUpdate {
        key: String,
        value: Value,
    },
    PauseRequested {
        reason: String,
    },
}

impl Event {
    /// Mint a new event; `order` is assigned by the log at append time.
    pub fn new(source: EventSource, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            order: 0,
            timestamp: Utc::now(),
            source,
            kind,
        }
    }

    /// Whether this event participates in the LLM view.
    pub fn is_llm_convertible(&self) -> bool {
        match &self.kind {
            EventKind::SystemPrompt { .. }
            | EventKind::Message { .. }
            | EventKind::Action { .. }
            | EventKind::Observation { .. }
            | EventKind::UserReject { .. } => true,
            // Only tool-scoped errors replay to the model; conversation-level
            // failures are operator-facing.
            EventKind::AgentError { tool_call_id, .. } => tool_call_id.is_some(),
            EventKind::Condensation { .. }
            | EventKind::StateUpdate { .. }
            | EventKind::PauseRequested { .. } => false,
        }
    }

    /// Tool-call id this event terminates, if it is a terminator
    /// (`Observation`, `UserReject`, or a tool-scoped `AgentError`).
    pub fn terminates_tool_call(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Observation { tool_call_id, .. } => Some(tool_call_id),
            EventKind::UserReject { tool_call_id, .. } => Some(tool_call_id),
            EventKind::AgentError {
                tool_call_id: Some(id),
                ..
            } => Some(id),
            _ => None,
        }
    }

    pub fn user_message(text: impl Into<String>) -> Self {
        Self::new(
            EventSource::User,
            EventKind::Message {
                role: Role::User,
                content: vec![ContentPart::text(text)],
            },
        )
    }

    pub fn agent_message(text: impl Into<String>) -> Self {
        Self::new(
            EventSource::Agent,
            EventKind::Message {
                role: Role::Assistant,
                content: vec![ContentPart::text(text)],
            },
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

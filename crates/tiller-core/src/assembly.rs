// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversion of an event view into provider chat messages.
//!
//! Rules:
//! - the first `SystemPrompt` becomes one `system` message: a static text
//!   block, plus a second uncached block when dynamic context is attached;
//! - `Message` events map to user/assistant messages with blocks in order;
//! - consecutive `Action` events from one LLM response merge into a single
//!   assistant message carrying all tool calls; the internal
//!   `security_risk` argument is stripped before transport and no content
//!   string is sent when there is no thought;
//! - `Observation`, `AgentError` and `UserReject` map to tool-role
//!   messages keyed by tool-call id;
//! - with prompt caching on, the static system block and the last user
//!   content block are marked — never the dynamic context block;
//! - tool-role text blocks beyond the provider limit are clipped with a
//!   marker.

use serde_json::Value;
use tiller_llm::{ChatMessage, ContentPart, Role, ToolCallRequest};

use crate::event::EventKind;
use crate::view::View;

/// Marker appended to tool content cut at the provider limit.
pub const CLIPPED_MARKER: &str = "\n[Output clipped: exceeded tool content limit]";

/// Argument field carrying the model's own risk prediction; consumed by the
/// security analyzer and never replayed to the provider.
pub const SECURITY_RISK_ARG: &str = "security_risk";

pub fn events_to_messages(
    view: &View,
    prompt_cache: bool,
    tool_content_limit: usize,
) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = Vec::with_capacity(view.events.len());
    // Response id of the assistant tool-call message currently at the tail,
    // so parallel calls from one LLM response merge into it.
    let mut tail_response_id: Option<String> = None;

    for event in &view.events {
        if !matches!(event.kind, EventKind::Action { .. }) {
            tail_response_id = None;
        }
        match &event.kind {
            EventKind::SystemPrompt {
                prompt,
                dynamic_context,
                ..
            } => {
                let mut msg = ChatMessage::system(prompt.clone());
                if prompt_cache {
                    msg.cache_marks = vec![0];
                }
                if let Some(dynamic) = dynamic_context {
                    // Separate, never cache-marked block.
                    msg.content.push(ContentPart::text(dynamic.clone()));
                }
                messages.push(msg);
            }
            EventKind::Message { role, content } => {
                messages.push(ChatMessage {
                    role: *role,
                    content: content.clone(),
                    tool_calls: Vec::new(),
                    tool_call_id: None,
                    cache_marks: Vec::new(),
                });
            }
            EventKind::Action {
                tool_name,
                tool_call_id,
                llm_response_id,
                arguments,
                thought,
                ..
            } => {
                let call = ToolCallRequest {
                    id: tool_call_id.clone(),
                    name: tool_name.clone(),
                    arguments: strip_security_risk(arguments.clone()),
                };
                // Parallel calls from one response share the response id and
                // collapse into one assistant message.
                if tail_response_id.as_deref() == Some(llm_response_id.as_str()) {
                    if let Some(last) = messages.last_mut() {
                        last.tool_calls.push(call);
                        continue;
                    }
                }
                tail_response_id = Some(llm_response_id.clone());
                messages.push(ChatMessage::assistant_tool_calls(thought.clone(), vec![call]));
            }
            EventKind::Observation {
                tool_call_id,
                content,
                is_error,
                ..
            } => {
                let mut parts = content.clone();
                if *is_error {
                    parts.insert(0, ContentPart::text("[tool reported an error]"));
                }
                messages.push(ChatMessage::tool_result(tool_call_id.clone(), parts));
            }
            EventKind::AgentError {
                tool_call_id: Some(tool_call_id),
                error,
            } => {
                messages.push(ChatMessage::tool_result(
                    tool_call_id.clone(),
                    vec![ContentPart::text(format!("[error] {error}"))],
                ));
            }
            EventKind::UserReject {
                tool_call_id,
                reason,
            } => {
                messages.push(ChatMessage::tool_result(
                    tool_call_id.clone(),
                    vec![ContentPart::text(format!(
                        "[action rejected by the user] {reason}"
                    ))],
                ));
            }
            // Not LLM-convertible; views never contain these.
            EventKind::AgentError { .. }
            | EventKind::Condensation { .. }
            | EventKind::StateUpdate { .. }
            | EventKind::PauseRequested { .. } => {}
        }
    }

    clip_tool_content(&mut messages, tool_content_limit);
    if prompt_cache {
        mark_last_user_block(&mut messages);
    }
    messages
}

fn strip_security_risk(mut arguments: Value) -> Value {
    if let Value::Object(map) = &mut arguments {
        map.remove(SECURITY_RISK_ARG);
    }
    arguments
}

fn clip_tool_content(messages: &mut [ChatMessage], limit: usize) {
    if limit == 0 {
        return;
    }
    for msg in messages.iter_mut().filter(|m| m.role == Role::Tool) {
        for part in &mut msg.content {
            if let ContentPart::Text { text } = part {
                if text.len() > limit {
                    let mut cut = limit;
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    text.truncate(cut);
                    text.push_str(CLIPPED_MARKER);
                }
            }
        }
    }
}

fn mark_last_user_block(messages: &mut [ChatMessage]) {
    if let Some(msg) = messages
        .iter_mut()
        .rev()
        .find(|m| m.role == Role::User && !m.content.is_empty())
    {
        msg.cache_marks = vec![msg.content.len() - 1];
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

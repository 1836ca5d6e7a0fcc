// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! GraySwan Cygnal analyzer: posts the recent conversation plus the
//! pending action to an external policy API and maps the returned
//! violation score through two thresholds. Any transport or parse failure
//! degrades to `UNKNOWN`; an indirect-prompt-injection flag forces `HIGH`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tiller_config::GraySwanSettings;
use tracing::{debug, warn};

use crate::event::{Event, EventKind};

use super::analyzer::SecurityAnalyzer;
use super::risk::SecurityRisk;

const DEFAULT_API_URL: &str = "https://api.grayswan.ai/cygnal/monitor";

/// Default coding-agent policy applied when none is configured.
const DEFAULT_POLICY_ID: &str = "689ca4885af3538a39b2ba04";

/// Recent events included as context.
const HISTORY_LIMIT: usize = 20;

pub struct GraySwanAnalyzer {
    api_url: String,
    api_key: Option<String>,
    policy_id: String,
    low_threshold: f64,
    medium_threshold: f64,
    client: reqwest::Client,
}

impl GraySwanAnalyzer {
    /// Build from settings (already merged with `GRAYSWAN_API_KEY` /
    /// `GRAYSWAN_POLICY_ID`). Thresholds must satisfy `low < medium`.
    pub fn new(settings: GraySwanSettings) -> anyhow::Result<Self> {
        if settings.low_threshold >= settings.medium_threshold {
            anyhow::bail!(
                "low_threshold ({}) must be less than medium_threshold ({})",
                settings.low_threshold,
                settings.medium_threshold
            );
        }
        if settings.api_key.is_none() {
            warn!("GRAYSWAN_API_KEY not set; analyzer will report UNKNOWN risk");
        }
        Ok(Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: settings.api_key,
            policy_id: settings
                .policy_id
                .unwrap_or_else(|| DEFAULT_POLICY_ID.to_string()),
            low_threshold: settings.low_threshold,
            medium_threshold: settings.medium_threshold,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs_f64(settings.timeout_secs))
                .build()
                .expect("reqwest client"),
        })
    }

    #[doc(hidden)]
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    fn map_violation(&self, score: f64) -> SecurityRisk {
        if score <= self.low_threshold {
            SecurityRisk::Low
        } else if score <= self.medium_threshold {
            SecurityRisk::Medium
        } else {
            SecurityRisk::High
        }
    }

    fn interpret(&self, body: &Value) -> SecurityRisk {
        let Some(score) = body.get("violation").and_then(Value::as_f64) else {
            warn!("GraySwan response missing `violation` field");
            return SecurityRisk::Unknown;
        };
        let mut risk = self.map_violation(score);
        if body.get("ipi").and_then(Value::as_bool).unwrap_or(false) {
            warn!("indirect prompt injection detected; escalating to HIGH");
            risk = SecurityRisk::High;
        }
        debug!(%risk, violation = score, "GraySwan risk assessment");
        risk
    }
}

#[async_trait]
impl SecurityAnalyzer for GraySwanAnalyzer {
    async fn security_risk(&self, action: &Event, history: &[Event]) -> SecurityRisk {
        if self.api_key.is_none() {
            return SecurityRisk::Unknown;
        }

        let recent = if history.len() > HISTORY_LIMIT {
            &history[history.len() - HISTORY_LIMIT..]
        } else {
            history
        };
        let mut messages: Vec<Value> = recent.iter().filter_map(event_to_message).collect();
        match event_to_message(action) {
            Some(m) => messages.push(m),
            None => return SecurityRisk::Unknown,
        }

        let payload = json!({ "messages": messages, "policy_id": self.policy_id });
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(self.api_key.as_deref().unwrap_or_default())
            .json(&payload)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(body) => self.interpret(&body),
                Err(e) => {
                    warn!("invalid JSON from GraySwan API: {e}");
                    SecurityRisk::Unknown
                }
            },
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "GraySwan API error");
                SecurityRisk::Unknown
            }
            Err(e) => {
                warn!("GraySwan request failed: {e}");
                SecurityRisk::Unknown
            }
        }
    }
}

/// Flatten an event into the OpenAI-style message shape the policy API
/// consumes.
fn event_to_message(event: &Event) -> Option<Value> {
    match &event.kind {
        EventKind::Message { role, content } => {
            let text: Vec<&str> = content.iter().filter_map(|p| p.as_text()).collect();
            Some(json!({
                "role": match role {
                    tiller_llm::Role::Assistant => "assistant",
                    _ => "user",
                },
                "content": text.join("\n"),
            }))
        }
        EventKind::Action {
            tool_name,
            arguments,
            thought,
            ..
        } => Some(json!({
            "role": "assistant",
            "content": format!(
                "{}[tool call] {tool_name} {arguments}",
                thought.as_deref().map(|t| format!("{t}\n")).unwrap_or_default()
            ),
        })),
        EventKind::Observation { content, .. } => {
            let text: Vec<&str> = content.iter().filter_map(|p| p.as_text()).collect();
            Some(json!({ "role": "user", "content": format!("[tool output] {}", text.join("\n")) }))
        }
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Critic: a scoring function over the trajectory, used to drive
//! iterative refinement of finished tasks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::event::{Event, EventKind};

/// `agent_state` key holding the refinement iteration counter.
pub const REFINEMENT_ITERATION_KEY: &str = "refinement_iteration";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticResult {
    /// Quality score in `[0, 1]`.
    pub score: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// When the critic fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticMode {
    /// Only agent messages and finish actions (default).
    FinishAndMessage,
    /// Every agent action.
    AllActions,
}

#[async_trait]
pub trait Critic: Send + Sync {
    fn mode(&self) -> CriticMode {
        CriticMode::FinishAndMessage
    }

    async fn evaluate(&self, events: &[Event], diff: Option<&str>)
        -> anyhow::Result<CriticResult>;
}

/// Bounds for the refinement retry loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RefinementConfig {
    /// Scores at or above this finish the conversation.
    pub success_threshold: f64,
    pub max_iterations: u32,
}

impl RefinementConfig {
    /// Follow-up prompt injected when the critic keeps the agent working.
    pub fn follow_up_prompt(&self, result: &CriticResult) -> String {
        format!(
            "Your previous attempt was reviewed and scored {:.2} (threshold {:.2}). \
             Reviewer feedback:\n{}\n\nAddress the feedback and finish the task again.",
            result.score, self.success_threshold, result.message
        )
    }
}

/// Fixed-score critic for tests and wiring checks.
pub struct FixedScoreCritic {
    pub score: f64,
    pub mode: CriticMode,
}

impl FixedScoreCritic {
    pub fn passing() -> Self {
        Self {
            score: 1.0,
            mode: CriticMode::FinishAndMessage,
        }
    }

    pub fn failing() -> Self {
        Self {
            score: 0.0,
            mode: CriticMode::FinishAndMessage,
        }
    }
}

#[async_trait]
impl Critic for FixedScoreCritic {
    fn mode(&self) -> CriticMode {
        self.mode
    }

    async fn evaluate(
        &self,
        _events: &[Event],
        _diff: Option<&str>,
    ) -> anyhow::Result<CriticResult> {
        Ok(CriticResult {
            score: self.score,
            message: format!("fixed critic score {:.2}", self.score),
            metadata: Value::Null,
        })
    }
}

/// Critic backed by an external scoring API: posts the serialized
/// trajectory (plus an optional workspace diff) and expects
/// `{score, message, metadata?}` back.
pub struct ApiCritic {
    url: String,
    api_key: Option<String>,
    mode: CriticMode,
    client: reqwest::Client,
}

impl ApiCritic {
    pub fn new(url: impl Into<String>, api_key: Option<String>, mode: CriticMode) -> Self {
        Self {
            url: url.into(),
            api_key,
            mode,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Critic for ApiCritic {
    fn mode(&self) -> CriticMode {
        self.mode
    }

    async fn evaluate(
        &self,
        events: &[Event],
        diff: Option<&str>,
    ) -> anyhow::Result<CriticResult> {
        let trajectory: Vec<Value> = events
            .iter()
            .filter(|e| e.is_llm_convertible())
            .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
            .collect();
        let payload = json!({ "trajectory": trajectory, "diff": diff });

        let mut req = self.client.post(&self.url).json(&payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let body: Value = req.send().await?.error_for_status()?.json().await?;

        let score = body
            .get("score")
            .and_then(Value::as_f64)
            .ok_or_else(|| anyhow::anyhow!("critic response missing `score`"))?;
        debug!(score, "critic evaluation");
        Ok(CriticResult {
            score: score.clamp(0.0, 1.0),
            message: body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            metadata: body.get("metadata").cloned().unwrap_or(Value::Null),
        })
    }
}

/// Whether the critic should fire for this candidate action under its mode.
pub(crate) fn critic_applies(mode: CriticMode, kind: &EventKind, finish_tool: &str) -> bool {
    match mode {
        CriticMode::AllActions => matches!(kind, EventKind::Action { .. }),
        CriticMode::FinishAndMessage => match kind {
            EventKind::Message { .. } => true,
            EventKind::Action { tool_name, .. } => tool_name == finish_tool,
            _ => false,
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSource;
    use tiller_llm::Role;

    fn action(tool_name: &str) -> EventKind {
        EventKind::Action {
            tool_name: tool_name.into(),
            tool_call_id: "c".into(),
            llm_response_id: "r".into(),
            arguments: json!({}),
            thought: None,
            risk: None,
            critic: None,
        }
    }

    #[test]
    fn finish_and_message_mode_matches_finish_and_messages() {
        let mode = CriticMode::FinishAndMessage;
        assert!(critic_applies(mode, &action("finish"), "finish"));
        assert!(!critic_applies(mode, &action("terminal"), "finish"));
        assert!(critic_applies(
            mode,
            &EventKind::Message {
                role: Role::Assistant,
                content: vec![]
            },
            "finish"
        ));
    }

    #[test]
    fn all_actions_mode_matches_every_action() {
        let mode = CriticMode::AllActions;
        assert!(critic_applies(mode, &action("terminal"), "finish"));
        assert!(critic_applies(mode, &action("finish"), "finish"));
        assert!(!critic_applies(
            mode,
            &EventKind::Message {
                role: Role::Assistant,
                content: vec![]
            },
            "finish"
        ));
    }

    #[tokio::test]
    async fn fixed_score_critic_reports_its_score() {
        let c = FixedScoreCritic::failing();
        let r = c.evaluate(&[], None).await.unwrap();
        assert_eq!(r.score, 0.0);
        let c = FixedScoreCritic::passing();
        let r = c
            .evaluate(&[Event::user_message("x")], Some("diff"))
            .await
            .unwrap();
        assert_eq!(r.score, 1.0);
    }

    #[test]
    fn follow_up_prompt_carries_feedback() {
        let cfg = RefinementConfig {
            success_threshold: 0.8,
            max_iterations: 3,
        };
        let prompt = cfg.follow_up_prompt(&CriticResult {
            score: 0.4,
            message: "tests are failing".into(),
            metadata: Value::Null,
        });
        assert!(prompt.contains("0.40"));
        assert!(prompt.contains("tests are failing"));
    }
}

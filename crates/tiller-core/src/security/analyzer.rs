// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use crate::assembly::SECURITY_RISK_ARG;
use crate::event::{Event, EventKind};

use super::risk::SecurityRisk;

/// Maps a pending action plus the conversation history to a risk level.
///
/// Analyzers are infallible by contract: anything that prevents a verdict
/// (transport failure, missing data, parse error) degrades to
/// [`SecurityRisk::Unknown`] rather than failing the step.
#[async_trait]
pub trait SecurityAnalyzer: Send + Sync {
    async fn security_risk(&self, action: &Event, history: &[Event]) -> SecurityRisk;

    /// Whether tool schemas should be augmented with the `security_risk`
    /// field the model must fill in.
    fn wants_risk_prediction(&self) -> bool {
        false
    }
}

/// Analyzer that reads the model's own risk prediction.
///
/// When attached, every tool schema gains a required `security_risk` enum
/// field; the model fills it in alongside the real arguments, and this
/// analyzer parses it back out. The field is stripped from the arguments
/// before any later replay to the provider.
#[derive(Debug, Default)]
pub struct LlmSecurityAnalyzer;

#[async_trait]
impl SecurityAnalyzer for LlmSecurityAnalyzer {
    async fn security_risk(&self, action: &Event, _history: &[Event]) -> SecurityRisk {
        match &action.kind {
            EventKind::Action { arguments, .. } => arguments
                .get(SECURITY_RISK_ARG)
                .and_then(|v| v.as_str())
                .map(SecurityRisk::parse)
                .unwrap_or(SecurityRisk::Unknown),
            _ => SecurityRisk::Unknown,
        }
    }

    fn wants_risk_prediction(&self) -> bool {
        true
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSource;

    fn action_with_args(args: serde_json::Value) -> Event {
        Event::new(
            EventSource::Agent,
            EventKind::Action {
                tool_name: "terminal".into(),
                tool_call_id: "c1".into(),
                llm_response_id: "r1".into(),
                arguments: args,
                thought: None,
                risk: None,
                critic: None,
            },
        )
    }

    #[tokio::test]
    async fn reads_predicted_risk_from_arguments() {
        let analyzer = LlmSecurityAnalyzer;
        let action = action_with_args(serde_json::json!({
            "command": "rm -rf /", "security_risk": "HIGH"
        }));
        assert_eq!(
            analyzer.security_risk(&action, &[]).await,
            SecurityRisk::High
        );
    }

    #[tokio::test]
    async fn missing_prediction_is_unknown() {
        let analyzer = LlmSecurityAnalyzer;
        let action = action_with_args(serde_json::json!({"command": "ls"}));
        assert_eq!(
            analyzer.security_risk(&action, &[]).await,
            SecurityRisk::Unknown
        );
    }

    #[tokio::test]
    async fn non_action_events_are_unknown() {
        let analyzer = LlmSecurityAnalyzer;
        assert_eq!(
            analyzer
                .security_risk(&Event::user_message("hi"), &[])
                .await,
            SecurityRisk::Unknown
        );
    }
}

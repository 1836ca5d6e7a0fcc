// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end conversation scenarios against a scripted provider.

use std::sync::Arc;

use serde_json::json;
use tiller_core::{
    AgentConfig, ConfirmationPolicy, Event, EventKind, ExecutionStatus, FixedScoreCritic,
    LlmSummarizingCondenser, LocalConversation, LlmSecurityAnalyzer, RefinementConfig,
    SecurityRisk, View, REFINEMENT_ITERATION_KEY,
};
use tiller_llm::{Completion, Llm, RetryPolicy, ScriptedProvider};
use tiller_tools::{ToolSpec, WorkspaceSpec};

fn llm(provider: Arc<ScriptedProvider>) -> Arc<Llm> {
    Arc::new(Llm::new("agent", provider, RetryPolicy::none()).unwrap())
}

fn conversation(config: AgentConfig, policy: ConfirmationPolicy) -> LocalConversation {
    LocalConversation::new(config, WorkspaceSpec::local("/tmp"), policy, None).unwrap()
}

fn kinds(events: &[Event]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match &e.kind {
            EventKind::SystemPrompt { .. } => "SystemPrompt",
            EventKind::Message { .. } => "Message",
            EventKind::Action { .. } => "Action",
            EventKind::Observation { .. } => "Observation",
            EventKind::UserReject { .. } => "UserReject",
            EventKind::AgentError { .. } => "AgentError",
            EventKind::Condensation { .. } => "Condensation",
            EventKind::StateUpdate { .. } => "StateUpdate",
            EventKind::PauseRequested { .. } => "PauseRequested",
        })
        .collect()
}

/// Scenario: send "hi", the model answers with a finish call.
#[tokio::test]
async fn finish_on_first_message() {
    let provider = Arc::new(ScriptedProvider::new(vec![Completion::tool_call(
        "finish",
        json!({"message": "done"}),
    )]));
    let conv = conversation(
        AgentConfig::new(llm(provider)),
        ConfirmationPolicy::NeverConfirm,
    );

    conv.send_message("hi").await.unwrap();
    let status = conv.run().await.unwrap();

    assert_eq!(status, ExecutionStatus::Finished);
    let events = conv.events_snapshot().await;
    assert_eq!(
        kinds(&events),
        vec!["SystemPrompt", "Message", "Action", "Observation"]
    );
    // Orders are dense from 0.
    for (i, e) in events.iter().enumerate() {
        assert_eq!(e.order, i as u64);
    }
}

/// Scenario: a tool round-trip followed by a finish on the second turn.
#[tokio::test]
async fn tool_round_trip_then_finish() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Completion::tool_call("terminal", json!({"command": "pwd"})),
        Completion::tool_call("finish", json!({"message": "all good"})),
    ]));
    let mut config = AgentConfig::new(llm(provider.clone()));
    config.tools = vec![ToolSpec::new("terminal")];
    let conv = conversation(config, ConfirmationPolicy::NeverConfirm);

    conv.send_message("where are we?").await.unwrap();
    let status = conv.run().await.unwrap();

    assert_eq!(status, ExecutionStatus::Finished);
    let events = conv.events_snapshot().await;
    assert_eq!(
        kinds(&events),
        vec![
            "SystemPrompt",
            "Message",
            "Action",
            "Observation",
            "Action",
            "Observation"
        ]
    );
    // The observation carries the terminal output back to the model.
    match &events[3].kind {
        EventKind::Observation { content, .. } => {
            assert!(content[0].as_text().unwrap().contains("/tmp"));
        }
        other => panic!("expected observation, got {other:?}"),
    }
    // Both LLM turns were made.
    assert_eq!(provider.requests().len(), 2);
}

/// Log invariant: every action has exactly one terminator.
#[tokio::test]
async fn every_action_is_terminated() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Completion::tool_call("terminal", json!({"command": "echo one"})),
        Completion::tool_call("terminal", json!({"command": 42})),
        Completion::tool_call("finish", json!({"message": "done"})),
    ]));
    let mut config = AgentConfig::new(llm(provider));
    config.tools = vec![ToolSpec::new("terminal")];
    let conv = conversation(config, ConfirmationPolicy::NeverConfirm);

    conv.send_message("go").await.unwrap();
    conv.run().await.unwrap();

    let events = conv.events_snapshot().await;
    assert!(View::unmatched_tool_calls(&events).is_empty());
    // The malformed terminal call produced a keyed AgentError, not an
    // observation.
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::AgentError { tool_call_id: Some(_), .. }
    )));
}

/// Scenario: ConfirmRisky(MEDIUM) + model-predicted HIGH defers execution;
/// the next message rejects it.
#[tokio::test]
async fn confirmation_deferral_and_rejection() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Completion::tool_call(
            "terminal",
            json!({"command": "rm -rf /", "security_risk": "HIGH"}),
        ),
        // After the rejection lands, the model gives up politely.
        Completion::tool_call("finish", json!({"message": "stopping"})),
    ]));
    let mut config = AgentConfig::new(llm(provider));
    config.tools = vec![ToolSpec::new("terminal")];
    config.security_analyzer = Some(Arc::new(LlmSecurityAnalyzer));
    let conv = conversation(
        config,
        ConfirmationPolicy::ConfirmRisky {
            threshold: SecurityRisk::Medium,
        },
    );

    conv.send_message("clean the disk").await.unwrap();
    let status = conv.run().await.unwrap();
    assert_eq!(status, ExecutionStatus::AwaitingConfirmation);

    // No execution happened: the action is unterminated so far.
    let events = conv.events_snapshot().await;
    assert_eq!(View::unmatched_tool_calls(&events).len(), 1);
    assert!(!events
        .iter()
        .any(|e| matches!(e.kind, EventKind::Observation { .. })));

    // The next message carries the decision.
    conv.send_message("no").await.unwrap();
    let events = conv.events_snapshot().await;
    let reject = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::UserReject { reason, .. } => Some(reason.clone()),
            _ => None,
        })
        .expect("a UserReject event");
    assert_eq!(reject, "no");
    assert!(View::unmatched_tool_calls(&events).is_empty());
}

/// Accepting a deferred action: running again executes it.
#[tokio::test]
async fn confirmation_acceptance_executes_pending() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Completion::tool_call(
            "terminal",
            json!({"command": "echo confirmed-run", "security_risk": "HIGH"}),
        ),
        Completion::tool_call("finish", json!({"message": "done"})),
    ]));
    let mut config = AgentConfig::new(llm(provider));
    config.tools = vec![ToolSpec::new("terminal")];
    config.security_analyzer = Some(Arc::new(LlmSecurityAnalyzer));
    let conv = conversation(
        config,
        ConfirmationPolicy::ConfirmRisky {
            threshold: SecurityRisk::Medium,
        },
    );

    conv.send_message("run it").await.unwrap();
    assert_eq!(conv.run().await.unwrap(), ExecutionStatus::AwaitingConfirmation);

    // Running again without a new message accepts the pending action.
    let status = conv.run().await.unwrap();
    assert_eq!(status, ExecutionStatus::Finished);
    let events = conv.events_snapshot().await;
    let output = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::Observation {
                tool_name, content, ..
            } if tool_name == "terminal" => content[0].as_text().map(str::to_string),
            _ => None,
        })
        .expect("terminal observation after acceptance");
    assert!(output.contains("confirmed-run"));
}

/// Scenario: explicit condense with few events hard-resets; a later
/// condense is normal and keeps the reset's summary event.
#[tokio::test]
async fn hard_reset_then_normal_condensation() {
    let agent_provider = Arc::new(ScriptedProvider::new(vec![Completion::tool_call(
        "finish",
        json!({"message": "done"}),
    )]));
    let condenser_provider = Arc::new(ScriptedProvider::new(vec![Completion::message_only(
        "summary of the early conversation",
    )]));
    let condenser_llm =
        Arc::new(Llm::new("condenser", condenser_provider, RetryPolicy::none()).unwrap());

    let mut config = AgentConfig::new(llm(agent_provider.clone()));
    config.condenser = Some(Arc::new(
        // max_size high enough to never fire automatically.
        LlmSummarizingCondenser::new(condenser_llm, 100, 4).unwrap(),
    ));
    let conv = conversation(config, ConfirmationPolicy::NeverConfirm);

    conv.send_message("echo back hello").await.unwrap();
    conv.run().await.unwrap();

    // Too few events for a valid range: hard reset.
    conv.condense().await.unwrap();
    let events = conv.events_snapshot().await;
    let (first_offset, first_summary_id) = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::Condensation {
                summary_offset,
                summary_event_id,
                ..
            } => Some((*summary_offset, summary_event_id.clone())),
            _ => None,
        })
        .expect("a condensation event");
    assert_eq!(first_offset, 0, "explicit condense with few events hard-resets");

    // Add enough turns for a valid range, then condense again.
    for i in 0..20 {
        agent_provider.push(Completion::tool_call(
            "finish",
            json!({"message": format!("done {i}")}),
        ));
        conv.send_message(format!("task {i}")).await.unwrap();
        conv.run().await.unwrap();
    }
    conv.condense().await.unwrap();

    let events = conv.events_snapshot().await;
    let last = events
        .iter()
        .rev()
        .find_map(|e| match &e.kind {
            EventKind::Condensation {
                summary_offset,
                forgotten_event_ids,
                ..
            } => Some((*summary_offset, forgotten_event_ids.clone())),
            _ => None,
        })
        .unwrap();
    assert!(last.0 > 0, "second condensation is a normal one");
    assert!(
        !last.1.contains(&first_summary_id),
        "the hard reset's summary event is never forgotten"
    );
}

/// Iterative refinement: the counter increments exactly when refinement
/// continues, never once the score passes.
#[tokio::test]
async fn refinement_retries_until_critic_passes() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Completion::tool_call("finish", json!({"message": "first try"})),
        Completion::tool_call("finish", json!({"message": "second try"})),
    ]));

    // Score below threshold once, then above.
    struct TwoPhaseCritic {
        calls: std::sync::atomic::AtomicU32,
    }
    #[async_trait::async_trait]
    impl tiller_core::Critic for TwoPhaseCritic {
        async fn evaluate(
            &self,
            _events: &[Event],
            _diff: Option<&str>,
        ) -> anyhow::Result<tiller_core::CriticResult> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(tiller_core::CriticResult {
                score: if n == 0 { 0.2 } else { 0.9 },
                message: "keep at it".into(),
                metadata: serde_json::Value::Null,
            })
        }
    }

    let mut config = AgentConfig::new(llm(provider));
    config.critic = Some(Arc::new(TwoPhaseCritic {
        calls: std::sync::atomic::AtomicU32::new(0),
    }));
    config.refinement = Some(RefinementConfig {
        success_threshold: 0.8,
        max_iterations: 3,
    });
    let conv = conversation(config, ConfirmationPolicy::NeverConfirm);

    conv.send_message("write the report").await.unwrap();
    let status = conv.run().await.unwrap();
    assert_eq!(status, ExecutionStatus::Finished);

    let events = conv.events_snapshot().await;
    // Two finish attempts, with a synthetic follow-up user message between.
    let finish_count = events
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::Action { tool_name, .. } if tool_name == "finish"))
        .count();
    assert_eq!(finish_count, 2);
    let follow_up = events.iter().any(|e| match &e.kind {
        EventKind::Message { content, .. } => content
            .first()
            .and_then(|p| p.as_text())
            .is_some_and(|t| t.contains("Reviewer feedback")),
        _ => false,
    });
    assert!(follow_up, "refinement injects a follow-up user message");
}

/// The refinement counter is not incremented when the first score already
/// passes.
#[tokio::test]
async fn refinement_counter_untouched_on_success() {
    let provider = Arc::new(ScriptedProvider::new(vec![Completion::tool_call(
        "finish",
        json!({"message": "done"}),
    )]));
    let mut config = AgentConfig::new(llm(provider));
    config.critic = Some(Arc::new(FixedScoreCritic::passing()));
    config.refinement = Some(RefinementConfig {
        success_threshold: 0.8,
        max_iterations: 3,
    });
    let dir = tempfile::tempdir().unwrap();
    let conv = LocalConversation::new(
        config,
        WorkspaceSpec::local("/tmp"),
        ConfirmationPolicy::NeverConfirm,
        Some(dir.path().to_path_buf()),
    )
    .unwrap();

    conv.send_message("do it").await.unwrap();
    assert_eq!(conv.run().await.unwrap(), ExecutionStatus::Finished);

    let base: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("base_state.json")).unwrap(),
    )
    .unwrap();
    assert!(
        base["agent_state"].get(REFINEMENT_ITERATION_KEY).is_none(),
        "counter must not move speculatively"
    );
}

/// The iteration budget stops a model that never finishes.
#[tokio::test]
async fn iteration_budget_terminates_run() {
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    for i in 0..10 {
        provider.push(Completion::tool_call(
            "terminal",
            json!({"command": format!("echo step {i}")}),
        ));
    }
    let mut config = AgentConfig::new(llm(provider));
    config.tools = vec![ToolSpec::new("terminal")];
    config.max_iteration_per_run = 3;
    let conv = conversation(config, ConfirmationPolicy::NeverConfirm);

    conv.send_message("loop forever").await.unwrap();
    let status = conv.run().await.unwrap();
    assert_eq!(status, ExecutionStatus::Idle);

    let actions = conv
        .events_snapshot()
        .await
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Action { .. }))
        .count();
    assert_eq!(actions, 3);
}

/// Persistence round trip: a finished conversation resumes with its
/// history and state intact.
#[tokio::test]
async fn persisted_conversation_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![Completion::tool_call(
        "finish",
        json!({"message": "done"}),
    )]));
    let id = {
        let conv = LocalConversation::new(
            AgentConfig::new(llm(provider.clone())),
            WorkspaceSpec::local("/tmp"),
            ConfirmationPolicy::NeverConfirm,
            Some(dir.path().to_path_buf()),
        )
        .unwrap();
        conv.send_message("hi").await.unwrap();
        conv.run().await.unwrap();
        conv.id().to_string()
    };

    let resumed = LocalConversation::resume(
        AgentConfig::new(llm(Arc::new(ScriptedProvider::new(vec![])))),
        dir.path(),
    )
    .unwrap();
    assert_eq!(resumed.id(), id);
    assert_eq!(resumed.status().await, ExecutionStatus::Finished);
    let events = resumed.events_snapshot().await;
    assert_eq!(
        kinds(&events),
        vec!["SystemPrompt", "Message", "Action", "Observation"]
    );
}

/// Cancellation before run: no events are produced.
#[tokio::test]
async fn cancellation_is_quiet() {
    let provider = Arc::new(ScriptedProvider::new(vec![Completion::tool_call(
        "finish",
        json!({"message": "unreached"}),
    )]));
    let conv = conversation(
        AgentConfig::new(llm(provider)),
        ConfirmationPolicy::NeverConfirm,
    );
    conv.send_message("hi").await.unwrap();
    let before = conv.events_snapshot().await.len();

    conv.cancel();
    let status = conv.run().await.unwrap();
    assert_ne!(status, ExecutionStatus::Finished);
    assert_eq!(conv.events_snapshot().await.len(), before);
}

/// Pause requests are advisory and observed at step boundaries.
#[tokio::test]
async fn pause_stops_at_step_boundary() {
    let provider = Arc::new(ScriptedProvider::new(vec![Completion::tool_call(
        "finish",
        json!({"message": "unreached"}),
    )]));
    let conv = conversation(
        AgentConfig::new(llm(provider)),
        ConfirmationPolicy::NeverConfirm,
    );
    conv.send_message("hi").await.unwrap();
    conv.pause("operator request").await.unwrap();

    let status = conv.run().await.unwrap();
    assert_eq!(status, ExecutionStatus::Paused);
    // The pause event is recorded; nothing else ran.
    let events = conv.events_snapshot().await;
    assert!(matches!(
        events.last().unwrap().kind,
        EventKind::PauseRequested { .. }
    ));
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent step: one turn of the conversation state machine.
//!
//! A step serializes the condensed view for the LLM, parses the response
//! into a message or tool calls, runs the confirmation and security gates,
//! executes accepted actions, and evaluates critic-driven refinement when
//! the agent tries to finish.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use tiller_llm::{CompletionRequest, ContentPart, Llm, LlmError, Role, ToolSchema};
use tiller_tools::{
    register_builtin_tools, resolve_tool, to_mcp_schema, ObservationPart, Tool, ToolCall,
    ToolContext, ToolError, ToolSpec, FINISH_TOOL_NAME,
};

use crate::assembly::{events_to_messages, SECURITY_RISK_ARG};
use crate::condenser::Condenser;
use crate::critic::{critic_applies, Critic, CriticResult, RefinementConfig,
    REFINEMENT_ITERATION_KEY};
use crate::event::{Event, EventKind, EventSource};
use crate::security::{ConfirmationDecision, SecurityAnalyzer, SecurityRisk};
use crate::state::ConversationState;
use crate::view::View;

const DEFAULT_SYSTEM_PROMPT: &str = "You are an autonomous software agent operating inside a \
sandboxed workspace. Work step by step: inspect before you change, verify after you change, \
and call the `finish` tool with a final message when the task is complete.";

/// Result of one agent step, driving the conversation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// More work to do; take another step.
    Continue,
    /// The agent finished (terminal finish action or final message).
    Finished,
    /// An action awaits user confirmation; the loop must return.
    AwaitingConfirmation,
}

pub struct AgentConfig {
    pub llm: Arc<Llm>,
    pub tools: Vec<ToolSpec>,
    pub system_prompt: Option<String>,
    /// Volatile context appended to the system prompt as a separate,
    /// never-cached block.
    pub dynamic_context: Option<String>,
    pub max_iteration_per_run: u32,
    pub prompt_cache: bool,
    pub security_analyzer: Option<Arc<dyn SecurityAnalyzer>>,
    pub condenser: Option<Arc<dyn Condenser>>,
    pub critic: Option<Arc<dyn Critic>>,
    pub refinement: Option<RefinementConfig>,
}

impl AgentConfig {
    pub fn new(llm: Arc<Llm>) -> Self {
        Self {
            llm,
            tools: Vec::new(),
            system_prompt: None,
            dynamic_context: None,
            max_iteration_per_run: 500,
            prompt_cache: true,
            security_analyzer: None,
            condenser: None,
            critic: None,
            refinement: None,
        }
    }
}

pub struct Agent {
    config: AgentConfig,
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Agent {
    /// Resolve the configured tool specs against the registry and bind
    /// them to the conversation's workspace. The built-in `finish` tool is
    /// always present.
    pub fn new(mut config: AgentConfig, ctx: &ToolContext) -> anyhow::Result<Self> {
        register_builtin_tools();
        if !config.tools.iter().any(|s| s.name == FINISH_TOOL_NAME) {
            config.tools.push(ToolSpec::new(FINISH_TOOL_NAME));
        }
        let mut tools = HashMap::new();
        for spec in &config.tools {
            let tool = resolve_tool(spec, ctx)?;
            tools.insert(spec.name.clone(), tool);
        }
        Ok(Self { config, tools })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn condenser(&self) -> Option<&Arc<dyn Condenser>> {
        self.config.condenser.as_ref()
    }

    /// Append the `SystemPrompt` event on a fresh conversation. A no-op
    /// when the log already carries one (resume).
    pub fn init_state(&self, state: &mut ConversationState) -> anyhow::Result<()> {
        let has_system = state
            .events()
            .iter()
            .any(|e| matches!(e.kind, EventKind::SystemPrompt { .. }));
        if has_system {
            return Ok(());
        }
        let prompt = self
            .config
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        state.append(Event::new(
            EventSource::Agent,
            EventKind::SystemPrompt {
                prompt,
                tools: self.request_schemas(),
                dynamic_context: self.config.dynamic_context.clone(),
            },
        ))?;
        Ok(())
    }

    /// Externally visible tool schemas: MCP-rendered, with the
    /// `security_risk` prediction field added when the analyzer asks for it.
    pub fn request_schemas(&self) -> Vec<ToolSchema> {
        let predict_risk = self
            .config
            .security_analyzer
            .as_ref()
            .is_some_and(|a| a.wants_risk_prediction());
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| {
                let mut parameters = to_mcp_schema(&t.action_schema());
                if predict_risk && t.name() != FINISH_TOOL_NAME {
                    add_risk_field(&mut parameters);
                }
                ToolSchema {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters,
                }
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// One step of the conversation state machine.
    pub async fn step(&self, state: &mut ConversationState) -> anyhow::Result<StepOutcome> {
        let view = View::from_events(state.events());

        // Condensation fires before the model sees the view.
        if let Some(condenser) = &self.config.condenser {
            if let Some(condensation) = condenser.condense(&view).await? {
                state.append(Event::new(EventSource::Environment, condensation.into_kind()))?;
                return Ok(StepOutcome::Continue);
            }
        }

        let request = CompletionRequest {
            messages: events_to_messages(
                &view,
                self.config.prompt_cache,
                self.config.llm.tool_content_limit(),
            ),
            tools: self.request_schemas(),
            prompt_cache: self.config.prompt_cache,
        };

        let completion = match self.config.llm.complete(request.clone()).await {
            Ok(c) => c,
            Err(LlmError::ContextWindowExceeded(msg)) => {
                let Some(condenser) = &self.config.condenser else {
                    anyhow::bail!("context window exceeded and no condenser attached: {msg}");
                };
                warn!("context window exceeded; applying hard reset");
                let condensation = condenser.hard_reset(&view);
                state.append(Event::new(EventSource::Environment, condensation.into_kind()))?;
                return Ok(StepOutcome::Continue);
            }
            // One immediate retry with the same view for an unusable
            // response, then surface it as an agent error.
            Err(e @ (LlmError::MalformedResponse(_) | LlmError::NoResponse)) => {
                warn!("unusable model response, retrying once: {e}");
                match self.config.llm.complete(request).await {
                    Ok(c) => c,
                    Err(e) => {
                        state.append(Event::new(
                            EventSource::Environment,
                            EventKind::AgentError {
                                tool_call_id: None,
                                error: e.to_string(),
                            },
                        ))?;
                        return Err(e.into());
                    }
                }
            }
            Err(e) => return Err(e.into()),
        };
        state.record_usage(self.config.llm.usage_id(), &completion.usage)?;

        // Message-only outcome.
        if completion.tool_calls.is_empty() {
            let text = completion.message.unwrap_or_default();
            let kind = EventKind::Message {
                role: Role::Assistant,
                content: vec![ContentPart::text(text)],
            };
            let critic = self.maybe_evaluate_critic(&view, &kind).await;
            state.append(Event::new(EventSource::Agent, kind))?;
            return self.finish_or_refine(state, critic).await;
        }

        // Typed-construction gate: unknown tool names fail the whole batch.
        for call in &completion.tool_calls {
            if !self.tools.contains_key(&call.name) {
                warn!(tool = %call.name, "model requested an unregistered tool");
                state.append(Event::new(
                    EventSource::Environment,
                    EventKind::AgentError {
                        tool_call_id: Some(call.id.clone()),
                        error: format!("unknown tool `{}`", call.name),
                    },
                ))?;
                return Ok(StepOutcome::Continue);
            }
        }

        // Phase 1: append every action event.
        let mut action_events = Vec::with_capacity(completion.tool_calls.len());
        for (i, call) in completion.tool_calls.iter().enumerate() {
            let risk = call
                .arguments
                .get(SECURITY_RISK_ARG)
                .and_then(|v| v.as_str())
                .map(SecurityRisk::parse);
            let mut kind = EventKind::Action {
                tool_name: call.name.clone(),
                tool_call_id: call.id.clone(),
                llm_response_id: completion.response_id.clone(),
                arguments: call.arguments.clone(),
                thought: if i == 0 { completion.message.clone() } else { None },
                risk,
                critic: None,
            };
            if let Some(result) = self.maybe_evaluate_critic(&view, &kind).await {
                if let EventKind::Action { critic, .. } = &mut kind {
                    *critic = Some(result);
                }
            }
            action_events.push(state.append(Event::new(EventSource::Agent, kind))?);
        }

        // Phase 2: confirmation and security gates over the whole batch.
        let history = state.snapshot();
        let mut requires_confirmation = false;
        let mut rejected: Vec<String> = Vec::new();
        for event in &action_events {
            let risk = match &self.config.security_analyzer {
                Some(analyzer) => Some(analyzer.security_risk(event, &history).await),
                None => None,
            };
            match state.confirmation_policy().decide(risk) {
                ConfirmationDecision::Allow => {}
                ConfirmationDecision::RequireConfirmation => requires_confirmation = true,
                ConfirmationDecision::Reject => {
                    if let EventKind::Action { tool_call_id, .. } = &event.kind {
                        rejected.push(tool_call_id.clone());
                        state.append(Event::new(
                            EventSource::User,
                            EventKind::UserReject {
                                tool_call_id: tool_call_id.clone(),
                                reason: "rejected by confirmation policy".into(),
                            },
                        ))?;
                    }
                }
            }
        }
        if requires_confirmation {
            let pending: Vec<String> = action_events
                .iter()
                .filter_map(|e| match &e.kind {
                    EventKind::Action { tool_call_id, .. }
                        if !rejected.contains(tool_call_id) =>
                    {
                        Some(tool_call_id.clone())
                    }
                    _ => None,
                })
                .collect();
            state.set_pending_action_ids(pending)?;
            return Ok(StepOutcome::AwaitingConfirmation);
        }

        // Phase 3: execute accepted actions in order.
        let mut finish_critic: Option<Option<CriticResult>> = None;
        for event in &action_events {
            let EventKind::Action {
                tool_name,
                tool_call_id,
                critic,
                ..
            } = &event.kind
            else {
                continue;
            };
            if rejected.contains(tool_call_id) {
                continue;
            }
            let observed = self.execute_action(state, event).await?;
            if observed && tool_name == FINISH_TOOL_NAME {
                finish_critic = Some(critic.clone());
            }
        }

        match finish_critic {
            Some(critic) => self.finish_or_refine(state, critic).await,
            None => Ok(StepOutcome::Continue),
        }
    }

    /// Execute one accepted action and append its terminator. Returns true
    /// when an `Observation` was appended (false means `AgentError`).
    pub(crate) async fn execute_action(
        &self,
        state: &mut ConversationState,
        action_event: &Event,
    ) -> anyhow::Result<bool> {
        let EventKind::Action {
            tool_name,
            tool_call_id,
            arguments,
            ..
        } = &action_event.kind
        else {
            anyhow::bail!("execute_action called on a non-action event");
        };
        let tool = self
            .tools
            .get(tool_name)
            .ok_or_else(|| anyhow::anyhow!("unknown tool `{tool_name}`"))?;

        debug!(tool = %tool_name, call = %tool_call_id, "executing action");
        let call = ToolCall {
            id: tool_call_id.clone(),
            name: tool_name.clone(),
            args: arguments.clone(),
        };
        match tool.execute(&call).await {
            Ok(output) => {
                let content = output
                    .parts
                    .iter()
                    .map(|p| match p {
                        ObservationPart::Text(t) => ContentPart::text(t.clone()),
                        ObservationPart::Image(url) => ContentPart::image(url.clone()),
                    })
                    .collect();
                state.append(Event::new(
                    EventSource::Environment,
                    EventKind::Observation {
                        tool_name: tool_name.clone(),
                        tool_call_id: tool_call_id.clone(),
                        action_id: action_event.id.clone(),
                        content,
                        is_error: output.is_error,
                        data: output.data,
                    },
                ))?;
                Ok(true)
            }
            Err(e @ ToolError::Validation { .. }) => {
                state.append(Event::new(
                    EventSource::Environment,
                    EventKind::AgentError {
                        tool_call_id: Some(tool_call_id.clone()),
                        error: e.to_string(),
                    },
                ))?;
                Ok(false)
            }
            Err(e) => {
                state.append(Event::new(
                    EventSource::Environment,
                    EventKind::AgentError {
                        tool_call_id: Some(tool_call_id.clone()),
                        error: e.to_string(),
                    },
                ))?;
                Ok(false)
            }
        }
    }

    /// Execute previously deferred actions after the user accepted them.
    pub(crate) async fn execute_pending(
        &self,
        state: &mut ConversationState,
    ) -> anyhow::Result<StepOutcome> {
        let ids = state.pending_action_ids();
        state.set_pending_action_ids(Vec::new())?;

        let mut finish_critic: Option<Option<CriticResult>> = None;
        for id in ids {
            let Some(action_event) = state
                .events()
                .iter()
                .find(|e| {
                    matches!(&e.kind, EventKind::Action { tool_call_id, .. } if *tool_call_id == id)
                })
                .cloned()
            else {
                warn!(call = %id, "pending action no longer present in the log");
                continue;
            };
            let observed = self.execute_action(state, &action_event).await?;
            if let EventKind::Action {
                tool_name, critic, ..
            } = &action_event.kind
            {
                if observed && tool_name == FINISH_TOOL_NAME {
                    finish_critic = Some(critic.clone());
                }
            }
        }
        match finish_critic {
            Some(critic) => self.finish_or_refine(state, critic).await,
            None => Ok(StepOutcome::Continue),
        }
    }

    /// Out-of-band tool invocation bypassing the LLM and the gates; still
    /// appends `Action` + terminator so the log invariant holds.
    pub(crate) async fn execute_tool(
        &self,
        state: &mut ConversationState,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> anyhow::Result<Event> {
        if !self.tools.contains_key(tool_name) {
            anyhow::bail!("unknown tool `{tool_name}`");
        }
        let tool_call_id = format!("manual_{}", uuid::Uuid::new_v4().simple());
        let action = state.append(Event::new(
            EventSource::Environment,
            EventKind::Action {
                tool_name: tool_name.to_string(),
                tool_call_id,
                llm_response_id: String::new(),
                arguments,
                thought: None,
                risk: None,
                critic: None,
            },
        ))?;
        self.execute_action(state, &action).await?;
        Ok(state.events().last().expect("terminator just appended").clone())
    }

    async fn maybe_evaluate_critic(&self, view: &View, kind: &EventKind) -> Option<CriticResult> {
        let critic = self.config.critic.as_ref()?;
        if !critic_applies(critic.mode(), kind, FINISH_TOOL_NAME) {
            return None;
        }
        match critic.evaluate(&view.events, None).await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!("critic evaluation failed: {e}");
                None
            }
        }
    }

    /// Terminal-finish handling: either the critic keeps the agent working
    /// (refinement) or the conversation finishes.
    async fn finish_or_refine(
        &self,
        state: &mut ConversationState,
        critic: Option<CriticResult>,
    ) -> anyhow::Result<StepOutcome> {
        if let (Some(config), Some(result)) = (&self.config.refinement, critic) {
            if result.score < config.success_threshold {
                let iteration = state
                    .agent_state()
                    .get(REFINEMENT_ITERATION_KEY)
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
                if iteration < config.max_iterations {
                    // The counter moves only when refinement actually
                    // continues, via map reassignment (autosave trigger).
                    let mut map = state.agent_state().clone();
                    map.insert(REFINEMENT_ITERATION_KEY.into(), json!(iteration + 1));
                    state.set_agent_state(map)?;
                    state.append(Event::new(
                        EventSource::Environment,
                        EventKind::Message {
                            role: Role::User,
                            content: vec![ContentPart::text(config.follow_up_prompt(&result))],
                        },
                    ))?;
                    debug!(iteration = iteration + 1, score = result.score, "refinement continues");
                    return Ok(StepOutcome::Continue);
                }
            }
        }
        Ok(StepOutcome::Finished)
    }
}

fn add_risk_field(parameters: &mut serde_json::Value) {
    if let Some(properties) = parameters
        .get_mut("properties")
        .and_then(|p| p.as_object_mut())
    {
        properties.insert(
            SECURITY_RISK_ARG.to_string(),
            json!({
                "type": "string",
                "enum": ["LOW", "MEDIUM", "HIGH"],
                "description": "Your own assessment of how much damage this action could cause."
            }),
        );
    }
    if let Some(required) = parameters.get_mut("required").and_then(|r| r.as_array_mut()) {
        required.push(json!(SECURITY_RISK_ARG));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::LlmSecurityAnalyzer;
    use tiller_llm::{Completion, RetryPolicy, ScriptedProvider};
    use tiller_tools::{LocalWorkspace, WorkspaceSpec};

    fn ctx() -> ToolContext {
        ToolContext {
            workspace: Arc::new(LocalWorkspace::new(std::env::temp_dir())),
        }
    }

    fn agent_with(provider: Arc<ScriptedProvider>) -> Agent {
        let llm = Arc::new(Llm::new("agent", provider, RetryPolicy::none()).unwrap());
        Agent::new(AgentConfig::new(llm), &ctx()).unwrap()
    }

    fn fresh_state() -> ConversationState {
        ConversationState::new(
            WorkspaceSpec::local("/tmp"),
            crate::security::ConfirmationPolicy::NeverConfirm,
            None,
        )
        .unwrap()
    }

    #[test]
    fn finish_tool_is_always_registered() {
        let agent = agent_with(Arc::new(ScriptedProvider::new(vec![])));
        assert!(agent.tools.contains_key(FINISH_TOOL_NAME));
        let schemas = agent.request_schemas();
        assert!(schemas.iter().any(|s| s.name == FINISH_TOOL_NAME));
    }

    #[test]
    fn schemas_are_mcp_rendered_without_discriminator() {
        let agent = agent_with(Arc::new(ScriptedProvider::new(vec![])));
        for schema in agent.request_schemas() {
            assert!(
                schema.parameters["properties"].get("kind").is_none(),
                "{} leaked its discriminator",
                schema.name
            );
        }
    }

    #[test]
    fn risk_prediction_field_is_added_when_analyzer_wants_it() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let llm = Arc::new(Llm::new("agent", provider, RetryPolicy::none()).unwrap());
        let mut config = AgentConfig::new(llm);
        config.tools = vec![ToolSpec::new("terminal")];
        config.security_analyzer = Some(Arc::new(LlmSecurityAnalyzer));
        let agent = Agent::new(config, &ctx()).unwrap();

        let schemas = agent.request_schemas();
        let terminal = schemas.iter().find(|s| s.name == "terminal").unwrap();
        assert!(terminal.parameters["properties"]
            .get(SECURITY_RISK_ARG)
            .is_some());
        // The finish action carries no risk field.
        let finish = schemas.iter().find(|s| s.name == FINISH_TOOL_NAME).unwrap();
        assert!(finish.parameters["properties"]
            .get(SECURITY_RISK_ARG)
            .is_none());
    }

    #[tokio::test]
    async fn message_only_step_finishes() {
        let provider = Arc::new(ScriptedProvider::new(vec![Completion::message_only(
            "all done",
        )]));
        let agent = agent_with(provider);
        let mut state = fresh_state();
        agent.init_state(&mut state).unwrap();
        state.append(Event::user_message("hi")).unwrap();

        let outcome = agent.step(&mut state).await.unwrap();
        assert_eq!(outcome, StepOutcome::Finished);
        assert!(matches!(
            state.events().last().unwrap().kind,
            EventKind::Message { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_tool_call_produces_keyed_agent_error() {
        let provider = Arc::new(ScriptedProvider::new(vec![Completion::tool_call(
            "no-such-tool",
            json!({}),
        )]));
        let agent = agent_with(provider);
        let mut state = fresh_state();
        agent.init_state(&mut state).unwrap();
        state.append(Event::user_message("go")).unwrap();

        let outcome = agent.step(&mut state).await.unwrap();
        assert_eq!(outcome, StepOutcome::Continue);
        match &state.events().last().unwrap().kind {
            EventKind::AgentError {
                tool_call_id: Some(_),
                error,
            } => assert!(error.contains("no-such-tool")),
            other => panic!("expected keyed agent error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn execute_tool_bypasses_llm_and_keeps_invariant() {
        let agent = agent_with(Arc::new(ScriptedProvider::new(vec![])));
        let mut state = fresh_state();
        agent.init_state(&mut state).unwrap();

        let terminator = agent
            .execute_tool(&mut state, FINISH_TOOL_NAME, json!({"message": "manual"}))
            .await
            .unwrap();
        assert!(matches!(terminator.kind, EventKind::Observation { .. }));
        assert!(View::unmatched_tool_calls(state.events()).is_empty());
    }
}

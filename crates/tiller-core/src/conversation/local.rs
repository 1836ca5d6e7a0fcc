// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! In-process conversation: the agent loop under a per-conversation
//! exclusive lock.
//!
//! All mutations — message appends, agent steps, tool execution,
//! persistence — happen while the lock is held, so they never overlap.
//! Reads for snapshotting go through [`LocalConversation::events_snapshot`]
//! and do not block the loop for longer than a clone.
//!
//! Cancellation is a cooperative token observed at step boundaries and at
//! the step's suspension points. It produces no events of its own; if it
//! interrupts a step that already appended actions, those actions receive
//! an `AgentError` terminator so the log invariant holds.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tiller_tools::{ToolContext, WorkspaceSpec};

use crate::agent::{Agent, AgentConfig, StepOutcome};
use crate::event::{Event, EventKind, EventSource};
use crate::security::ConfirmationPolicy;
use crate::state::{ConversationState, ExecutionStatus};
use crate::view::View;

pub struct LocalConversation {
    state: Mutex<ConversationState>,
    agent: Agent,
    cancel: CancellationToken,
    events_tx: broadcast::Sender<Event>,
    id: String,
}

impl LocalConversation {
    /// Create a fresh conversation bound to an agent and a workspace.
    pub fn new(
        agent_config: AgentConfig,
        workspace: WorkspaceSpec,
        confirmation_policy: ConfirmationPolicy,
        persistence_dir: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let mut state =
            ConversationState::new(workspace.clone(), confirmation_policy, persistence_dir)?;
        let ctx = ToolContext {
            workspace: workspace.connect(),
        };
        let agent = Agent::new(agent_config, &ctx)?;
        agent.init_state(&mut state)?;
        Ok(Self::assemble(state, agent))
    }

    /// Resume a persisted conversation.
    pub fn resume(agent_config: AgentConfig, dir: &std::path::Path) -> anyhow::Result<Self> {
        let mut state = ConversationState::open(dir)?;
        let ctx = ToolContext {
            workspace: state.workspace().connect(),
        };
        let agent = Agent::new(agent_config, &ctx)?;
        agent.init_state(&mut state)?;
        info!(id = %state.id(), events = state.events().len(), "resumed conversation");
        Ok(Self::assemble(state, agent))
    }

    fn assemble(state: ConversationState, agent: Agent) -> Self {
        let id = state.id().to_string();
        let events_tx = state.events_sender();
        Self {
            state: Mutex::new(state),
            agent,
            cancel: CancellationToken::new(),
            events_tx,
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    pub async fn status(&self) -> ExecutionStatus {
        self.state.lock().await.status()
    }

    pub async fn events_snapshot(&self) -> Vec<Event> {
        self.state.lock().await.snapshot()
    }

    /// Append a user message.
    ///
    /// While an action awaits confirmation, the message doubles as the
    /// user's decision: it rejects every pending action with the message
    /// text as the reason, then lands as a regular user message.
    pub async fn send_message(&self, text: impl Into<String>) -> anyhow::Result<()> {
        let text = text.into();
        let mut state = self.state.lock().await;

        let pending = state.pending_action_ids();
        if !pending.is_empty() {
            for tool_call_id in pending {
                state.append(Event::new(
                    EventSource::User,
                    EventKind::UserReject {
                        tool_call_id,
                        reason: text.clone(),
                    },
                ))?;
            }
            state.set_pending_action_ids(Vec::new())?;
        }

        state.append(Event::user_message(text))?;
        state.set_iterations_since_user_message(0)?;
        state.set_status(ExecutionStatus::Idle)?;
        Ok(())
    }

    /// Drive the agent until a terminal condition: finish, iteration
    /// budget, pending confirmation, pause, cancellation, or a fatal error.
    pub async fn run(&self) -> anyhow::Result<ExecutionStatus> {
        let mut state = self.state.lock().await;
        if self.cancel.is_cancelled() {
            return Ok(state.status());
        }
        if state.status() == ExecutionStatus::Finished {
            return Ok(ExecutionStatus::Finished);
        }
        state.set_status(ExecutionStatus::Running)?;

        // Re-entry after a confirmation: running again accepts the pending
        // actions.
        if !state.pending_action_ids().is_empty() {
            match self.agent.execute_pending(&mut state).await? {
                StepOutcome::Finished => {
                    state.set_status(ExecutionStatus::Finished)?;
                    return Ok(ExecutionStatus::Finished);
                }
                _ => {}
            }
        }

        let status = loop {
            if self.cancel.is_cancelled() {
                break ExecutionStatus::Idle;
            }
            if state.pause_requested() {
                state.set_pause_requested(false);
                break ExecutionStatus::Paused;
            }
            if state.iterations_since_user_message()
                >= self.agent.config().max_iteration_per_run
            {
                debug!(id = %self.id, "iteration budget exhausted");
                break ExecutionStatus::Idle;
            }
            let next_iterations = state.iterations_since_user_message() + 1;
            state.set_iterations_since_user_message(next_iterations)?;

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = self.agent.step(&mut state) => Some(result),
            };
            match outcome {
                None => {
                    // Step aborted mid-flight; terminate any action it
                    // appended that has no terminator yet.
                    self.terminate_dangling_actions(&mut state, "cancelled")?;
                    break ExecutionStatus::Idle;
                }
                Some(result) => match result? {
                    StepOutcome::Continue => continue,
                    StepOutcome::Finished => break ExecutionStatus::Finished,
                    StepOutcome::AwaitingConfirmation => {
                        break ExecutionStatus::AwaitingConfirmation
                    }
                },
            }
        };

        state.set_status(status)?;
        Ok(status)
    }

    /// Out-of-band tool invocation; appends `Action` + terminator without
    /// consulting the LLM or the gates. Returns the terminator event.
    pub async fn execute_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> anyhow::Result<Event> {
        let mut state = self.state.lock().await;
        self.agent.execute_tool(&mut state, tool_name, arguments).await
    }

    /// Explicitly condense the history; hard reset when no valid range
    /// exists.
    pub async fn condense(&self) -> anyhow::Result<()> {
        let condenser = self
            .agent
            .condenser()
            .ok_or_else(|| anyhow::anyhow!("no condenser attached to this agent"))?
            .clone();
        let mut state = self.state.lock().await;
        let view = View::from_events(state.events());
        let condensation = condenser.request_condensation(&view).await?;
        state.append(Event::new(EventSource::Environment, condensation.into_kind()))?;
        Ok(())
    }

    /// Advisory pause: records the request and stops the loop at the next
    /// step boundary.
    pub async fn pause(&self, reason: impl Into<String>) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.append(Event::new(
            EventSource::Environment,
            EventKind::PauseRequested {
                reason: reason.into(),
            },
        ))?;
        state.set_pause_requested(true);
        Ok(())
    }

    /// Request cooperative cancellation of in-flight work.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel in-flight work and flush state. The conversation is not
    /// usable afterwards.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.cancel.cancel();
        let mut state = self.state.lock().await;
        self.terminate_dangling_actions(&mut state, "conversation closed")?;
        state.set_status(ExecutionStatus::Idle)?;
        Ok(())
    }

    fn terminate_dangling_actions(
        &self,
        state: &mut ConversationState,
        reason: &str,
    ) -> anyhow::Result<()> {
        let pending = state.pending_action_ids();
        let dangling: Vec<String> = View::unmatched_tool_calls(state.events())
            .into_iter()
            .filter(|id| !pending.contains(id))
            .collect();
        for tool_call_id in dangling {
            state.append(Event::new(
                EventSource::Environment,
                EventKind::AgentError {
                    tool_call_id: Some(tool_call_id),
                    error: reason.to_string(),
                },
            ))?;
        }
        Ok(())
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod agent;
mod assembly;
mod condenser;
pub mod conversation;
mod critic;
mod event;
mod log;
pub mod security;
mod state;
mod stats;

pub use agent::{Agent, AgentConfig, StepOutcome};
pub use assembly::events_to_messages;
pub use condenser::{Condensation, Condenser, LlmSummarizingCondenser};
pub use conversation::LocalConversation;
pub use critic::{
    ApiCritic, Critic, CriticMode, CriticResult, FixedScoreCritic, RefinementConfig,
    REFINEMENT_ITERATION_KEY,
};
pub use event::{Event, EventId, EventKind, EventSource};
pub use log::EventLog;
pub use security::{
    ConfirmationDecision, ConfirmationPolicy, GraySwanAnalyzer, LlmSecurityAnalyzer,
    SecurityAnalyzer, SecurityRisk,
};
pub use state::{ConversationState, ExecutionStatus, PENDING_ACTIONS_KEY};
pub use stats::ConversationStats;

mod view;
pub use view::View;

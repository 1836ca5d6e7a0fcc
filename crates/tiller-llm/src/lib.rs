// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod chat;
mod error;
mod llm;
mod metrics;
mod mock;
mod provider;
mod registry;
mod retry;
mod types;

pub use chat::OpenAiCompatProvider;
pub use error::LlmError;
pub use llm::{Llm, MIN_CONTEXT_WINDOW};
pub use metrics::{Metrics, MetricsHandle};
pub use mock::{MockProvider, ScriptedProvider};
pub use provider::LlmProvider;
pub use registry::LlmRegistry;
pub use retry::RetryPolicy;
pub use types::{
    ChatMessage, Completion, CompletionRequest, ContentPart, Role, ToolCallRequest, ToolSchema,
    Usage,
};

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use crate::{Completion, CompletionRequest, LlmError};

/// A chat-completion backend.
///
/// Implementations perform exactly one request per `complete` call; retry,
/// metrics and error policy live in [`crate::Llm`], which wraps a provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Context window size, when known.
    fn context_window(&self) -> Option<u32> {
        None
    }

    /// Maximum characters accepted in a single tool-role content block
    /// before truncation applies.
    fn tool_content_limit(&self) -> usize {
        64_000
    }

    /// Send one completion request.
    async fn complete(&self, req: CompletionRequest) -> Result<Completion, LlmError>;
}

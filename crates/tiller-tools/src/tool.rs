// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::workspace::Workspace;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub args: Value,
}

/// A single content item in a rich observation.
///
/// Most tools produce only `Text`. Vision-capable tools may mix `Text` and
/// `Image` items; images are base64 data URLs.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservationPart {
    Text(String),
    Image(String),
}

/// The result of executing a tool.
///
/// `content` is the plain-text rendering (concatenation of all `Text`
/// parts); `parts` preserve structure for the LLM conversion; `data` holds
/// the tool's typed observation payload for the event log.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub parts: Vec<ObservationPart>,
    pub is_error: bool,
    pub data: Value,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(content: impl Into<String>) -> Self {
        let text = content.into();
        Self {
            content: text.clone(),
            parts: vec![ObservationPart::Text(text)],
            is_error: false,
            data: Value::Null,
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(msg: impl Into<String>) -> Self {
        let text = msg.into();
        Self {
            content: text.clone(),
            parts: vec![ObservationPart::Text(text)],
            is_error: true,
            data: Value::Null,
        }
    }

    /// Result with arbitrary parts (text and/or images).
    pub fn with_parts(parts: Vec<ObservationPart>) -> Self {
        let text = parts
            .iter()
            .filter_map(|p| match p {
                ObservationPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            content: text,
            parts,
            is_error: false,
            data: Value::Null,
        }
    }

    /// Attach the typed observation payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn has_images(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ObservationPart::Image(_)))
    }
}

/// Tool failures, split by where the fault lies.
///
/// `Validation` means the model's arguments did not match the action
/// schema; the runtime records it against the tool-call id and continues.
/// `Execution` means the executor itself failed.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments for `{tool}`: {message}")]
    Validation { tool: String, message: String },

    #[error("tool `{tool}` failed: {message}")]
    Execution { tool: String, message: String },
}

impl ToolError {
    pub fn validation(tool: impl Into<String>, message: impl ToString) -> Self {
        Self::Validation {
            tool: tool.into(),
            message: message.to_string(),
        }
    }

    pub fn execution(tool: impl Into<String>, message: impl ToString) -> Self {
        Self::Execution {
            tool: tool.into(),
            message: message.to_string(),
        }
    }
}

/// The slice of conversation state a tool factory binds against:
/// the workspace the conversation runs in.
#[derive(Clone)]
pub struct ToolContext {
    pub workspace: Arc<dyn Workspace>,
}

/// Trait every built-in and user-defined tool implements.
///
/// `action_schema` is the raw JSON schema of the arguments object; the
/// externally visible MCP rendering is produced by
/// [`crate::to_mcp_schema`], which strips the internal discriminator and
/// bounds cyclic references.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn action_schema(&self) -> Value;
    fn observation_schema(&self) -> Value {
        serde_json::json!({ "type": "object" })
    }
    /// Execute the tool. Validation failures surface as
    /// [`ToolError::Validation`]; runtime failures either as
    /// [`ToolError::Execution`] or as a `ToolOutput` with `is_error` set
    /// when the failure is something the model should see and react to.
    async fn execute(&self, call: &ToolCall) -> Result<ToolOutput, ToolError>;
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("name", &self.name()).finish()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

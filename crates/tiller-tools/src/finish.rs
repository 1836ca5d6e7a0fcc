// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCall, ToolContext, ToolError, ToolOutput};

/// Name of the terminal finish action every agent carries.
pub const FINISH_TOOL_NAME: &str = "finish";

#[derive(Debug, Deserialize)]
struct FinishAction {
    message: String,
}

/// The built-in finish tool: the agent calls it to signal task completion
/// with a final message for the user.
pub struct FinishTool;

pub fn factory(_params: &Value, _ctx: &ToolContext) -> anyhow::Result<Arc<dyn Tool>> {
    Ok(Arc::new(FinishTool))
}

#[async_trait]
impl Tool for FinishTool {
    fn name(&self) -> &str {
        FINISH_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Signal that the task is complete. `message` is the final answer \
         shown to the user."
    }

    fn action_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "kind": { "const": "FinishAction" },
                "message": {
                    "type": "string",
                    "description": "Final message summarising the outcome."
                }
            },
            "required": ["kind", "message"]
        })
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let action: FinishAction = serde_json::from_value(call.args.clone())
            .map_err(|e| ToolError::validation(self.name(), e))?;
        Ok(ToolOutput::ok(action.message))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

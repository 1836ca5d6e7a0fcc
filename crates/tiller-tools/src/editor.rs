// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! File editor tool: view, create, string replacement and line insertion
//! against the conversation's workspace.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCall, ToolContext, ToolError, ToolOutput};
use crate::workspace::Workspace;

/// Width of the line-number gutter in `view` output.
const VIEW_LINE_NUMBER_WIDTH: usize = 6;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EditorCommand {
    View,
    Create,
    StrReplace,
    Insert,
}

#[derive(Debug, Deserialize)]
struct EditorAction {
    command: EditorCommand,
    path: PathBuf,
    #[serde(default)]
    file_text: Option<String>,
    #[serde(default)]
    old_str: Option<String>,
    #[serde(default)]
    new_str: Option<String>,
    #[serde(default)]
    insert_line: Option<usize>,
    /// Inclusive 1-based `[start, end]`; `end = -1` means end of file.
    #[serde(default)]
    view_range: Option<[i64; 2]>,
}

pub struct FileEditorTool {
    workspace: Arc<dyn Workspace>,
}

pub fn factory(_params: &Value, ctx: &ToolContext) -> anyhow::Result<Arc<dyn Tool>> {
    Ok(Arc::new(FileEditorTool {
        workspace: Arc::clone(&ctx.workspace),
    }))
}

impl FileEditorTool {
    pub fn new(workspace: Arc<dyn Workspace>) -> Self {
        Self { workspace }
    }

    async fn view(&self, action: &EditorAction) -> Result<ToolOutput, ToolError> {
        let text = self
            .workspace
            .read_file(&action.path)
            .await
            .map_err(|e| ToolError::execution("file_editor", e))?;
        let lines: Vec<&str> = text.lines().collect();
        let (start, end) = match action.view_range {
            Some([s, e]) => {
                let start = s.max(1) as usize;
                let end = if e < 0 { lines.len() } else { (e as usize).min(lines.len()) };
                if start > lines.len() || start > end {
                    return Err(ToolError::validation(
                        "file_editor",
                        format!("view_range [{s}, {e}] is outside the file ({} lines)", lines.len()),
                    ));
                }
                (start, end)
            }
            None => (1, lines.len()),
        };
        let width = VIEW_LINE_NUMBER_WIDTH;
        let numbered: Vec<String> = lines[start - 1..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>width$}\t{line}", start + i))
            .collect();
        Ok(ToolOutput::ok(numbered.join("\n")))
    }

    async fn create(&self, action: &EditorAction) -> Result<ToolOutput, ToolError> {
        let Some(file_text) = &action.file_text else {
            return Err(ToolError::validation(
                "file_editor",
                "`create` requires `file_text`",
            ));
        };
        self.workspace
            .write_file(&action.path, file_text)
            .await
            .map_err(|e| ToolError::execution("file_editor", e))?;
        Ok(ToolOutput::ok(format!(
            "Created {} ({} bytes)",
            action.path.display(),
            file_text.len()
        )))
    }

    async fn str_replace(&self, action: &EditorAction) -> Result<ToolOutput, ToolError> {
        let Some(old_str) = &action.old_str else {
            return Err(ToolError::validation(
                "file_editor",
                "`str_replace` requires `old_str`",
            ));
        };
        let new_str = action.new_str.as_deref().unwrap_or("");
        let text = self
            .workspace
            .read_file(&action.path)
            .await
            .map_err(|e| ToolError::execution("file_editor", e))?;

        let occurrences = text.matches(old_str.as_str()).count();
        if occurrences == 0 {
            return Ok(ToolOutput::err(format!(
                "old_str not found in {}; no edit performed",
                action.path.display()
            )));
        }
        if occurrences > 1 {
            return Ok(ToolOutput::err(format!(
                "old_str occurs {occurrences} times in {}; make it unique and retry",
                action.path.display()
            )));
        }
        let updated = text.replacen(old_str.as_str(), new_str, 1);
        self.workspace
            .write_file(&action.path, &updated)
            .await
            .map_err(|e| ToolError::execution("file_editor", e))?;
        Ok(ToolOutput::ok(format!("Edited {}", action.path.display())))
    }

    async fn insert(&self, action: &EditorAction) -> Result<ToolOutput, ToolError> {
        let Some(insert_line) = action.insert_line else {
            return Err(ToolError::validation(
                "file_editor",
                "`insert` requires `insert_line`",
            ));
        };
        let Some(new_str) = &action.new_str else {
            return Err(ToolError::validation(
                "file_editor",
                "`insert` requires `new_str`",
            ));
        };
        let text = self
            .workspace
            .read_file(&action.path)
            .await
            .map_err(|e| ToolError::execution("file_editor", e))?;
        let mut lines: Vec<&str> = text.lines().collect();
        if insert_line > lines.len() {
            return Err(ToolError::validation(
                "file_editor",
                format!("insert_line {insert_line} beyond end of file ({} lines)", lines.len()),
            ));
        }
        lines.insert(insert_line, new_str);
        let mut updated = lines.join("\n");
        if text.ends_with('\n') {
            updated.push('\n');
        }
        self.workspace
            .write_file(&action.path, &updated)
            .await
            .map_err(|e| ToolError::execution("file_editor", e))?;
        Ok(ToolOutput::ok(format!(
            "Inserted 1 line into {}",
            action.path.display()
        )))
    }
}

#[async_trait]
impl Tool for FileEditorTool {
    fn name(&self) -> &str {
        "file_editor"
    }

    fn description(&self) -> &str {
        "View and edit files in the workspace. Commands: `view` (numbered \
         lines, optional view_range), `create` (write file_text), \
         `str_replace` (replace a unique old_str with new_str), `insert` \
         (insert new_str after insert_line)."
    }

    fn action_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "kind": { "const": "EditorAction" },
                "command": { "enum": ["view", "create", "str_replace", "insert"] },
                "path": { "type": "string" },
                "file_text": { "type": "string" },
                "old_str": { "type": "string" },
                "new_str": { "type": "string" },
                "insert_line": { "type": "integer", "minimum": 0 },
                "view_range": {
                    "type": "array",
                    "items": { "type": "integer" },
                    "minItems": 2,
                    "maxItems": 2
                }
            },
            "required": ["kind", "command", "path"]
        })
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let action: EditorAction = serde_json::from_value(call.args.clone())
            .map_err(|e| ToolError::validation(self.name(), e))?;
        match action.command {
            EditorCommand::View => self.view(&action).await,
            EditorCommand::Create => self.create(&action).await,
            EditorCommand::StrReplace => self.str_replace(&action).await,
            EditorCommand::Insert => self.insert(&action).await,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

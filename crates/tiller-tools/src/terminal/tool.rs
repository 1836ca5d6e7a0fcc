// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::session::{TerminalError, TerminalSession};
use crate::flush::PeriodicFlusher;
use crate::tool::{Tool, ToolCall, ToolContext, ToolError, ToolOutput};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// How often buffered transcript chunks are persisted when session
/// recording is enabled.
const RECORD_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct TerminalAction {
    /// The command to run; empty keeps waiting on a running command.
    #[serde(default)]
    command: String,
    /// Send `command` as keystrokes to the running process instead of
    /// starting a new command. `C-c` sends an interrupt.
    #[serde(default)]
    is_input: bool,
    timeout_secs: Option<u64>,
}

struct SessionState {
    session: TerminalSession,
    /// Transcript recorder: buffered chunks flushed to timestamped files
    /// under the configured directory. `None` when recording is off.
    recorder: Option<PeriodicFlusher<String>>,
}

/// Stateful shell tool backed by a persistent PS1-fenced session.
///
/// The session is owned exclusively by this tool instance (and therefore
/// by its conversation); it is spawned lazily on first use. With a
/// `record_dir` factory param, every command round is also queued into a
/// periodic flusher that persists transcript chunk files in the
/// background.
pub struct TerminalTool {
    working_dir: PathBuf,
    default_timeout_secs: u64,
    record_dir: Option<PathBuf>,
    record_flush_interval: Duration,
    session: Mutex<Option<SessionState>>,
}

impl TerminalTool {
    pub fn new(working_dir: PathBuf, default_timeout_secs: u64) -> Self {
        Self {
            working_dir,
            default_timeout_secs,
            record_dir: None,
            record_flush_interval: RECORD_FLUSH_INTERVAL,
            session: Mutex::new(None),
        }
    }

    /// Enable transcript recording into `record_dir`.
    pub fn with_recording(mut self, record_dir: PathBuf) -> Self {
        self.record_dir = Some(record_dir);
        self
    }

    #[cfg(test)]
    fn with_record_flush_interval(mut self, interval: Duration) -> Self {
        self.record_flush_interval = interval;
        self
    }
}

pub fn factory(params: &Value, ctx: &ToolContext) -> anyhow::Result<Arc<dyn Tool>> {
    let timeout = params
        .get("timeout_secs")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    let mut tool = TerminalTool::new(ctx.workspace.working_dir().to_path_buf(), timeout);
    if let Some(dir) = params.get("record_dir").and_then(|v| v.as_str()) {
        tool = tool.with_recording(PathBuf::from(dir));
    }
    Ok(Arc::new(tool))
}

/// Sink writing each drained batch to a timestamped chunk file.
fn transcript_recorder(dir: PathBuf, interval: Duration) -> PeriodicFlusher<String> {
    let sequence = AtomicU64::new(0);
    PeriodicFlusher::start(interval, move |batch: Vec<String>| -> anyhow::Result<()> {
        std::fs::create_dir_all(&dir)?;
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let seq = sequence.fetch_add(1, Ordering::SeqCst);
        let path = dir.join(format!("transcript-{stamp}-{seq:04}.log"));
        std::fs::write(path, batch.concat())?;
        Ok(())
    })
}

#[async_trait]
impl Tool for TerminalTool {
    fn name(&self) -> &str {
        "terminal"
    }

    fn description(&self) -> &str {
        "Execute a bash command in a persistent shell session. State (cwd, \
         environment, background jobs) survives across calls. When a command \
         outlives its timeout the shell keeps running: call again with an \
         empty command to keep waiting, set is_input to feed the running \
         process, or send `C-c` with is_input to interrupt."
    }

    fn action_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "kind": { "const": "TerminalAction" },
                "command": {
                    "type": "string",
                    "description": "Bash command to execute; empty string waits on the running command."
                },
                "is_input": {
                    "type": "boolean",
                    "description": "Send `command` as keystrokes to the running process (`C-c` interrupts)."
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Seconds to wait before returning a partial result."
                }
            },
            "required": ["kind", "command"]
        })
    }

    fn observation_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "output": { "type": "string" },
                "exit_code": { "type": ["integer", "null"] },
                "timed_out": { "type": "boolean" },
                "running_pid": { "type": ["integer", "null"] }
            }
        })
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let action: TerminalAction = serde_json::from_value(call.args.clone())
            .map_err(|e| ToolError::validation(self.name(), e))?;

        let mut guard = self.session.lock().await;
        if guard.is_none() {
            let dir = self.working_dir.clone();
            let session = tokio::task::spawn_blocking(move || TerminalSession::start(&dir))
                .await
                .map_err(|e| ToolError::execution("terminal", e))?
                .map_err(|e| ToolError::execution("terminal", e))?;
            let recorder = self
                .record_dir
                .clone()
                .map(|dir| transcript_recorder(dir, self.record_flush_interval));
            *guard = Some(SessionState { session, recorder });
        }
        let state = guard.as_mut().expect("session initialized above");
        let session = &mut state.session;

        let timeout = Duration::from_secs(
            action.timeout_secs.unwrap_or(self.default_timeout_secs),
        );
        let observation = match session
            .execute(&action.command, action.is_input, timeout)
            .await
        {
            Ok(obs) => obs,
            // A completed command without a parseable metadata block is a
            // hard failure, surfaced with the transcript attached.
            Err(e @ TerminalError::NoValidBlock { .. }) => {
                return Err(ToolError::execution("terminal", e));
            }
            Err(e) => return Err(ToolError::execution("terminal", e)),
        };

        if let Some(recorder) = &state.recorder {
            recorder.push(format!("$ {}\n{}\n", action.command, observation.output));
        }

        let mut content = observation.output.clone();
        if observation.timed_out {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str(&format!(
                "[Command timed out after {}s and is still running (pid {}). Call again \
                 with an empty command to keep waiting, or `C-c` with is_input to interrupt.]",
                timeout.as_secs(),
                observation.running_pid.unwrap_or(-1)
            ));
        }

        let data = serde_json::to_value(&observation).unwrap_or(Value::Null);
        let out = match observation.exit_code {
            Some(0) | None => ToolOutput::ok(content),
            // Exit 1 is the Unix "no matches / condition false" convention,
            // not a tool failure.
            Some(1) => ToolOutput::ok(format!("[exit 1]\n{content}")),
            Some(code) => ToolOutput::err(format!("[exit {code}]\n{content}")),
        };
        Ok(out.with_data(data))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "t1".into(),
            name: "terminal".into(),
            args,
        }
    }

    fn tool() -> TerminalTool {
        TerminalTool::new(PathBuf::from("/tmp"), 10)
    }

    #[tokio::test]
    async fn runs_a_command_and_reports_output() {
        let t = tool();
        let out = t
            .execute(&call(json!({"command": "echo tool-check"})))
            .await
            .unwrap();
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("tool-check"));
        assert_eq!(out.data["exit_code"], json!(0));
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error_with_marker() {
        let t = tool();
        let out = t
            .execute(&call(json!({"command": "exit 7"})))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("[exit 7]"));
    }

    #[tokio::test]
    async fn exit_one_is_not_an_error() {
        let t = tool();
        let out = t.execute(&call(json!({"command": "false"}))).await.unwrap();
        assert!(!out.is_error);
        assert!(out.content.contains("[exit 1]"));
    }

    #[tokio::test]
    async fn invalid_arguments_are_a_validation_error() {
        let t = tool();
        let err = t
            .execute(&call(json!({"command": 42})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation { .. }));
    }

    #[tokio::test]
    async fn model_predicted_risk_field_is_tolerated() {
        // The LLM risk analyzer asks the model to add a security_risk field
        // to every action; the terminal must not reject it.
        let t = tool();
        let out = t
            .execute(&call(json!({"command": "echo ok", "security_risk": "LOW"})))
            .await
            .unwrap();
        assert!(!out.is_error);
    }

    #[tokio::test]
    async fn recording_persists_transcript_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let t = TerminalTool::new(PathBuf::from("/tmp"), 10)
            .with_recording(dir.path().to_path_buf())
            .with_record_flush_interval(Duration::from_millis(20));

        t.execute(&call(json!({"command": "echo recorded-round"})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let chunks: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert!(!chunks.is_empty(), "a transcript chunk file was written");
        let text = std::fs::read_to_string(&chunks[0]).unwrap();
        assert!(text.contains("echo recorded-round"));
        assert!(text.contains("recorded-round"));
    }

    #[test]
    fn schema_keeps_internal_discriminator_until_rendering() {
        let t = tool();
        let schema = t.action_schema();
        assert!(schema["properties"].get("kind").is_some());
        let rendered = crate::to_mcp_schema(&schema);
        assert!(rendered["properties"].get("kind").is_none());
    }
}

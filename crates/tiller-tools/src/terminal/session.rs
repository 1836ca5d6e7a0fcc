// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Persistent shell session on a PTY.
//!
//! A single `bash --norc -i` child runs for the lifetime of the session;
//! its PS1 is programmed to print the fenced metadata block, so every
//! rendered prompt both frames the previous command's output and carries
//! its exit metadata. Timeouts never kill the shell: they return a partial
//! observation and the caller may keep waiting, feed stdin, or interrupt.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::metadata::{count_ps1_ends, extract_ps1_blocks, ps1_prompt, CmdOutputMetadata};

/// Keystroke sent for `C-c` input.
const CTRL_C: &[u8] = b"\x03";

/// How long to wait for the first prompt after spawning the shell.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(30);

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("failed to start terminal session: {0}")]
    Spawn(String),

    /// A command completed (a prompt rendered) but no parseable metadata
    /// block exists in the transcript. Surfaced with the transcript so the
    /// failure can be diagnosed.
    #[error("no valid PS1 metadata block in completed command transcript:\n{transcript}")]
    NoValidBlock { transcript: String },

    #[error("terminal I/O error: {0}")]
    Io(String),
}

/// Result of one `execute` round against the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalObservation {
    pub output: String,
    pub exit_code: Option<i32>,
    /// Set when the wait deadline fired before the command finished. The
    /// shell keeps running; a follow-up call can continue or interrupt.
    pub timed_out: bool,
    pub running_pid: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CmdOutputMetadata>,
}

struct PendingCommand {
    command: String,
    baseline_ends: usize,
}

pub struct TerminalSession {
    // Held to keep the PTY pair alive for the session's lifetime.
    _master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    transcript: Arc<Mutex<String>>,
    /// Transcript bytes already claimed by earlier commands.
    consumed: usize,
    pending: Option<PendingCommand>,
}

impl TerminalSession {
    pub fn start(working_dir: &Path) -> Result<Self, TerminalError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 500,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new("bash");
        cmd.args(["--norc", "--noprofile", "-i"]);
        cmd.env("PS1", ps1_prompt());
        cmd.env("PS2", "");
        cmd.env("TERM", "dumb");
        cmd.cwd(working_dir);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::Spawn(e.to_string()))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TerminalError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TerminalError::Spawn(e.to_string()))?;

        let transcript = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&transcript);
        std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        // The PTY line discipline emits \r\n; carriage
                        // returns carry no information for the transcript.
                        let chunk = String::from_utf8_lossy(&buf[..n]).replace('\r', "");
                        sink.lock().expect("transcript lock").push_str(&chunk);
                    }
                }
            }
        });

        let mut session = Self {
            _master: pair.master,
            child,
            writer,
            transcript,
            consumed: 0,
            pending: None,
        };
        session.await_startup_prompt()?;
        Ok(session)
    }

    fn await_startup_prompt(&mut self) -> Result<(), TerminalError> {
        let deadline = std::time::Instant::now() + STARTUP_TIMEOUT;
        loop {
            {
                let text = self.transcript.lock().expect("transcript lock");
                if count_ps1_ends(&text) >= 1 {
                    if let Some(block) = extract_ps1_blocks(&text).last() {
                        self.consumed = block.end;
                        return Ok(());
                    }
                }
            }
            if std::time::Instant::now() >= deadline {
                return Err(TerminalError::Spawn(
                    "shell did not render its first prompt in time".into(),
                ));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TerminalError> {
        self.writer
            .write_all(bytes)
            .and_then(|_| self.writer.flush())
            .map_err(|e| TerminalError::Io(e.to_string()))
    }

    fn snapshot(&self) -> String {
        self.transcript.lock().expect("transcript lock").clone()
    }

    fn shell_pid(&self) -> Option<i32> {
        self.child.process_id().map(|p| p as i32)
    }

    /// Run a command (or continue / feed a still-running one) and wait up
    /// to `timeout` for the post-command prompt.
    ///
    /// - fresh command: `is_input = false`, non-empty `command`;
    /// - keep waiting: empty `command`;
    /// - feed stdin: `is_input = true` (the literal `C-c` sends an
    ///   interrupt keystroke).
    pub async fn execute(
        &mut self,
        command: &str,
        is_input: bool,
        timeout: Duration,
    ) -> Result<TerminalObservation, TerminalError> {
        enum Entry {
            Continue(usize),
            Feed(usize),
            Refused(String),
            NoRunningCommand,
            Fresh,
        }
        let entry = match &self.pending {
            Some(p) if command.is_empty() => Entry::Continue(p.baseline_ends),
            Some(p) if is_input => Entry::Feed(p.baseline_ends),
            Some(p) => Entry::Refused(p.command.clone()),
            None if is_input => Entry::NoRunningCommand,
            None => Entry::Fresh,
        };

        let baseline_ends = match entry {
            // Continuation of a running command.
            Entry::Continue(baseline) => baseline,
            Entry::Feed(baseline) => {
                if command == "C-c" {
                    self.write_bytes(CTRL_C)?;
                } else {
                    self.write_bytes(format!("{command}\n").as_bytes())?;
                }
                baseline
            }
            Entry::Refused(running) => {
                return Ok(TerminalObservation {
                    output: format!(
                        "[A previous command is still running (pid {}). Send an empty \
                         command to keep waiting, is_input to feed it, or `C-c` with \
                         is_input to interrupt — `{running}` is still in progress.]",
                        self.shell_pid().unwrap_or(-1),
                    ),
                    exit_code: None,
                    timed_out: false,
                    running_pid: self.shell_pid(),
                    metadata: None,
                });
            }
            Entry::NoRunningCommand => {
                return Ok(TerminalObservation {
                    output: "[No running command to feed input to.]".into(),
                    exit_code: None,
                    timed_out: false,
                    running_pid: None,
                    metadata: None,
                });
            }
            Entry::Fresh => {
                let baseline = count_ps1_ends(&self.snapshot());
                debug!(cmd = %command, "terminal execute");
                self.write_bytes(format!("{command}\n").as_bytes())?;
                self.pending = Some(PendingCommand {
                    command: command.to_string(),
                    baseline_ends: baseline,
                });
                baseline
            }
        };

        let fresh_command = self
            .pending
            .as_ref()
            .map(|p| p.command.clone())
            .unwrap_or_default();

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if count_ps1_ends(&self.snapshot()) > baseline_ends {
                return self.finish_command(&fresh_command);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(self.partial_observation(&fresh_command));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Frame the completed command: output is everything between the
    /// consumed offset and the winning metadata block of the new prompt.
    fn finish_command(&mut self, command: &str) -> Result<TerminalObservation, TerminalError> {
        let text = self.snapshot();
        let tail = &text[self.consumed.min(text.len())..];

        let blocks = extract_ps1_blocks(tail);
        let Some(last) = blocks.last() else {
            self.pending = None;
            return Err(TerminalError::NoValidBlock {
                transcript: tail.to_string(),
            });
        };

        let output = strip_command_echo(&tail[..last.marker_start], command)
            .trim_end()
            .to_string();
        self.consumed += last.end;
        self.pending = None;

        Ok(TerminalObservation {
            output,
            exit_code: last.metadata.exit_code(),
            timed_out: false,
            running_pid: None,
            metadata: Some(last.metadata.clone()),
        })
    }

    /// Deadline fired: report what arrived so far and leave the shell
    /// running. The consumed offset advances so a follow-up call returns
    /// only new output — never a duplicated chunk.
    fn partial_observation(&mut self, command: &str) -> TerminalObservation {
        let text = self.snapshot();
        let tail = &text[self.consumed.min(text.len())..];
        let output = strip_command_echo(tail, command).trim_end().to_string();
        self.consumed = text.len();
        TerminalObservation {
            output,
            exit_code: None,
            timed_out: true,
            running_pid: self.shell_pid(),
            metadata: None,
        }
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

/// Drop the PTY's echo of the typed command from the start of the output
/// region.
fn strip_command_echo<'a>(region: &'a str, command: &str) -> &'a str {
    if command.is_empty() {
        return region;
    }
    let trimmed = region.trim_start_matches('\n');
    if let Some(rest) = trimmed.strip_prefix(command) {
        return rest.strip_prefix('\n').unwrap_or(rest);
    }
    region
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! PS1-fenced metadata blocks.
//!
//! The shell prompt is programmed to print a fenced JSON block around every
//! command:
//!
//! ```text
//! ###PS1JSON###
//! { "pid": ..., "exit_code": ..., "username": ..., "hostname": ...,
//!   "working_dir": ..., "py_interpreter_path": ... }
//! ###PS1END###
//! ```
//!
//! Concurrent output (progress bars, spinners) can interleave with the
//! prompt rendering and corrupt a block mid-JSON. The extractor therefore
//! anchors on each `###PS1END###` and takes only the **last**
//! `###PS1JSON###` before it: a corrupted opener earlier in the stream is
//! ignored and the intact re-render wins. Malformed JSON between markers is
//! silently skipped.

use serde::{Deserialize, Serialize};

pub const PS1_JSON_MARKER: &str = "###PS1JSON###";
pub const PS1_END_MARKER: &str = "###PS1END###";

/// Metadata printed by the prompt. Fields are stringly typed on the wire:
/// `exit_code` is a decimal integer string, `pid` an integer string or
/// empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CmdOutputMetadata {
    #[serde(default)]
    pub pid: String,
    #[serde(default)]
    pub exit_code: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub py_interpreter_path: String,
}

impl CmdOutputMetadata {
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.trim().parse().ok()
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid.trim().parse().ok()
    }
}

/// The prompt string handed to bash. `$?`, `$!` and `$(pwd)` expand at
/// prompt-display time; `\u` and `\h` are prompt escapes.
pub fn ps1_prompt() -> String {
    format!(
        "{PS1_JSON_MARKER}\n{{\"pid\":\"$!\",\"exit_code\":\"$?\",\
         \"username\":\"\\u\",\"hostname\":\"\\h\",\
         \"working_dir\":\"$(pwd)\",\
         \"py_interpreter_path\":\"$(command -v python3 2>/dev/null || true)\"}}\n\
         {PS1_END_MARKER}\n"
    )
}

/// One successfully parsed fenced block and its span in the transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct Ps1Block {
    /// Byte offset of the winning `###PS1JSON###` marker.
    pub marker_start: usize,
    /// Byte offset just past the `###PS1END###` marker.
    pub end: usize,
    pub metadata: CmdOutputMetadata,
}

/// Extract every valid fenced block from a transcript.
///
/// For each `###PS1END###`, only the last `###PS1JSON###` preceding it (and
/// following the previous end marker) is considered; blocks whose payload
/// fails to parse as JSON are skipped.
pub fn extract_ps1_blocks(transcript: &str) -> Vec<Ps1Block> {
    let mut blocks = Vec::new();
    let mut search_from = 0usize;

    while let Some(rel_end) = transcript[search_from..].find(PS1_END_MARKER) {
        let end_start = search_from + rel_end;
        let end = end_start + PS1_END_MARKER.len();

        if let Some(rel_marker) = transcript[search_from..end_start].rfind(PS1_JSON_MARKER) {
            let marker_start = search_from + rel_marker;
            let payload = &transcript[marker_start + PS1_JSON_MARKER.len()..end_start];
            if let Ok(metadata) = serde_json::from_str::<CmdOutputMetadata>(payload.trim()) {
                blocks.push(Ps1Block {
                    marker_start,
                    end,
                    metadata,
                });
            }
        }

        search_from = end;
    }
    blocks
}

/// Number of complete `###PS1END###` markers in the transcript — the cheap
/// signal that another prompt rendered, i.e. a command finished.
pub fn count_ps1_ends(transcript: &str) -> usize {
    transcript.matches(PS1_END_MARKER).count()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

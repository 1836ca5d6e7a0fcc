// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod metadata;
mod session;
mod tool;

pub use metadata::{
    count_ps1_ends, extract_ps1_blocks, ps1_prompt, CmdOutputMetadata, Ps1Block, PS1_END_MARKER,
    PS1_JSON_MARKER,
};
pub use session::{TerminalError, TerminalObservation, TerminalSession};
pub use tool::{factory, TerminalTool};

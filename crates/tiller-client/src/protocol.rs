// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire frames of the per-conversation WebSocket.
//!
//! The stream is totally ordered by event `order`. After a `run` completes
//! on the server, a `run_finished` marker follows every event of that run;
//! the client's run barrier releases only when the marker arrives, which
//! is what guarantees no event is lost around termination.

use serde::{Deserialize, Serialize};
use tiller_core::Event;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsFrame {
    Event { event: Event },
    RunFinished { run_id: String },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

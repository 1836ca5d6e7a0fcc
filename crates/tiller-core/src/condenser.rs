// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! History compaction.
//!
//! When the view outgrows `max_size`, the condenser summarizes a middle
//! range of events into a `Condensation` payload: the first `keep_first`
//! events after the system prompt stay verbatim, a recent tail stays
//! verbatim, and everything between is replaced in later views by a single
//! summary event. An explicit request with no valid range — and a context
//! window overflow — produce a **hard reset**: `summary_offset == 0` and
//! every non-pinned event forgotten.
//!
//! Summary events of earlier hard resets are pinned: they are never
//! selected into a later forgotten set, so a reset survives subsequent
//! normal condensations.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tiller_llm::{ChatMessage, CompletionRequest, Llm};
use tracing::{debug, info};
use uuid::Uuid;

use crate::event::{Event, EventKind};
use crate::view::View;

/// Condensation payload produced by a condenser; the caller wraps it in a
/// `Condensation` event and appends it.
#[derive(Debug, Clone)]
pub struct Condensation {
    pub summary: String,
    pub summary_offset: usize,
    pub forgotten_event_ids: Vec<String>,
    pub summary_event_id: String,
}

impl Condensation {
    pub fn into_kind(self) -> EventKind {
        EventKind::Condensation {
            summary: self.summary,
            summary_offset: self.summary_offset,
            forgotten_event_ids: self.forgotten_event_ids,
            summary_event_id: self.summary_event_id,
        }
    }

    pub fn is_hard_reset(&self) -> bool {
        self.summary_offset == 0
    }
}

#[async_trait]
pub trait Condenser: Send + Sync {
    /// Automatic trigger: `Some` when the view exceeds the size budget.
    async fn condense(&self, view: &View) -> anyhow::Result<Option<Condensation>>;

    /// Explicit request: always produces a condensation, falling back to a
    /// hard reset when no valid range exists.
    async fn request_condensation(&self, view: &View) -> anyhow::Result<Condensation>;

    /// Deterministic recovery, used directly on context-window overflow
    /// (another model call could overflow again).
    fn hard_reset(&self, view: &View) -> Condensation;
}

pub struct LlmSummarizingCondenser {
    llm: Arc<Llm>,
    max_size: usize,
    keep_first: usize,
}

impl LlmSummarizingCondenser {
    pub fn new(llm: Arc<Llm>, max_size: usize, keep_first: usize) -> anyhow::Result<Self> {
        // The post-condensation view must keep room for the tail:
        // max_size/2 - keep_first - 1 events.
        if max_size / 2 <= keep_first + 1 {
            anyhow::bail!(
                "invalid condenser config: max_size ({max_size}) must exceed \
                 2 * (keep_first ({keep_first}) + 1)"
            );
        }
        Ok(Self {
            llm,
            max_size,
            keep_first,
        })
    }

    /// Events eligible for forgetting: everything after the system prompt
    /// that is not a pinned summary.
    fn eligible<'a>(&self, view: &'a View) -> Vec<&'a Event> {
        let pinned: HashSet<&str> = view
            .pinned_summary_ids
            .iter()
            .map(String::as_str)
            .collect();
        view.events
            .iter()
            .filter(|e| !matches!(e.kind, EventKind::SystemPrompt { .. }))
            .filter(|e| !pinned.contains(e.id.as_str()))
            .collect()
    }

    /// The forgotten slice for a normal condensation, or `None` when the
    /// range would be empty.
    fn forgotten_range<'a>(&self, eligible: &[&'a Event]) -> Option<Vec<&'a Event>> {
        let tail_keep = self.max_size / 2 - self.keep_first - 1;
        if eligible.len() <= self.keep_first + tail_keep {
            return None;
        }
        let range = &eligible[self.keep_first..eligible.len() - tail_keep];
        if range.is_empty() {
            None
        } else {
            Some(range.to_vec())
        }
    }

    async fn summarize(
        &self,
        forgotten: &[&Event],
        previous_summary: Option<&str>,
    ) -> anyhow::Result<String> {
        let mut transcript = String::new();
        if let Some(prev) = previous_summary {
            transcript.push_str("Previous summary:\n");
            transcript.push_str(prev);
            transcript.push_str("\n\n");
        }
        transcript.push_str("Events to fold into the summary:\n");
        for event in forgotten {
            transcript.push_str(&render_event(event));
            transcript.push('\n');
        }

        let req = CompletionRequest {
            messages: vec![
                ChatMessage::system(
                    "You maintain a running summary of an agent conversation. Rewrite \
                     the summary to fold in the new events. Keep task goals, decisions, \
                     file paths, and unresolved problems. Be concise; plain text only.",
                ),
                ChatMessage::user(transcript),
            ],
            tools: Vec::new(),
            prompt_cache: false,
        };
        let completion = self.llm.complete(req).await?;
        completion
            .message
            .filter(|m| !m.is_empty())
            .ok_or_else(|| anyhow::anyhow!("condensation summary came back empty"))
    }

    async fn normal_condensation(
        &self,
        view: &View,
        forgotten: Vec<&Event>,
    ) -> anyhow::Result<Condensation> {
        let summary = self
            .summarize(&forgotten, view.last_summary.as_deref())
            .await?;
        info!(
            forgotten = forgotten.len(),
            keep_first = self.keep_first,
            "condensing conversation history"
        );
        Ok(Condensation {
            summary,
            summary_offset: self.keep_first,
            forgotten_event_ids: forgotten.iter().map(|e| e.id.clone()).collect(),
            summary_event_id: Uuid::new_v4().to_string(),
        })
    }
}

#[async_trait]
impl Condenser for LlmSummarizingCondenser {
    async fn condense(&self, view: &View) -> anyhow::Result<Option<Condensation>> {
        if view.len() <= self.max_size {
            return Ok(None);
        }
        let eligible = self.eligible(view);
        match self.forgotten_range(&eligible) {
            Some(forgotten) => Ok(Some(self.normal_condensation(view, forgotten).await?)),
            None => Ok(Some(self.hard_reset(view))),
        }
    }

    async fn request_condensation(&self, view: &View) -> anyhow::Result<Condensation> {
        let eligible = self.eligible(view);
        match self.forgotten_range(&eligible) {
            Some(forgotten) => self.normal_condensation(view, forgotten).await,
            None => {
                debug!("no valid condensation range; performing hard reset");
                Ok(self.hard_reset(view))
            }
        }
    }

    fn hard_reset(&self, view: &View) -> Condensation {
        let eligible = self.eligible(view);
        let summary = match &view.last_summary {
            Some(prev) => format!(
                "Context was reset; {} event(s) were dropped. Carried-over summary:\n{prev}",
                eligible.len()
            ),
            None => format!(
                "Context was reset; {} event(s) from the earlier conversation were dropped.",
                eligible.len()
            ),
        };
        info!(dropped = eligible.len(), "hard context reset");
        Condensation {
            summary,
            summary_offset: 0,
            forgotten_event_ids: eligible.iter().map(|e| e.id.clone()).collect(),
            summary_event_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Compact single-line rendering for the summarization prompt.
fn render_event(event: &Event) -> String {
    match &event.kind {
        EventKind::Message { role, content } => {
            let text: Vec<&str> = content.iter().filter_map(|p| p.as_text()).collect();
            format!("[{role:?}] {}", text.join(" "))
        }
        EventKind::Action {
            tool_name,
            arguments,
            ..
        } => format!("[action] {tool_name} {arguments}"),
        EventKind::Observation {
            content, is_error, ..
        } => {
            let text: Vec<&str> = content.iter().filter_map(|p| p.as_text()).collect();
            format!(
                "[observation{}] {}",
                if *is_error { " error" } else { "" },
                text.join(" ")
            )
        }
        EventKind::UserReject { reason, .. } => format!("[rejected] {reason}"),
        EventKind::AgentError { error, .. } => format!("[error] {error}"),
        other => format!("[{other:?}]"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

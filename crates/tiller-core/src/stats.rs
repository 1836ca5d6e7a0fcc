// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tiller_llm::{Metrics, Usage};

/// Aggregated token accounting per LLM usage slot for one conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationStats {
    pub usage: BTreeMap<String, Metrics>,
}

impl ConversationStats {
    pub fn record(&mut self, usage_id: &str, usage: &Usage) {
        self.usage.entry(usage_id.to_string()).or_default().record(usage);
    }

    pub fn total_prompt_tokens(&self) -> u64 {
        self.usage.values().map(|m| m.prompt_tokens).sum()
    }

    pub fn total_completion_tokens(&self) -> u64 {
        self.usage.values().map(|m| m.completion_tokens).sum()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keeps_usage_slots_separate() {
        let mut s = ConversationStats::default();
        s.record(
            "agent",
            &Usage {
                prompt_tokens: 10,
                completion_tokens: 2,
                ..Default::default()
            },
        );
        s.record(
            "condenser",
            &Usage {
                prompt_tokens: 5,
                completion_tokens: 1,
                ..Default::default()
            },
        );
        assert_eq!(s.usage["agent"].prompt_tokens, 10);
        assert_eq!(s.usage["condenser"].prompt_tokens, 5);
        assert_eq!(s.total_prompt_tokens(), 15);
        assert_eq!(s.total_completion_tokens(), 3);
    }
}

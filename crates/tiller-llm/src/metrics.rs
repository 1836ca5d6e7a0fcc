// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::Usage;

/// Accumulated token accounting for one LLM usage slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl Metrics {
    pub fn record(&mut self, usage: &Usage) {
        self.requests += 1;
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.cache_read_tokens += usage.cache_read_tokens;
        self.cache_write_tokens += usage.cache_write_tokens;
    }
}

/// Shared handle to a metrics object.
///
/// Sharing the handle between two registered LLMs is exactly the condition
/// the registry detects and repairs — see [`crate::LlmRegistry`].
pub type MetricsHandle = Arc<Mutex<Metrics>>;

pub(crate) fn new_handle() -> MetricsHandle {
    Arc::new(Mutex::new(Metrics::default()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_accumulates_usage() {
        let mut m = Metrics::default();
        m.record(&Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            cache_read_tokens: 3,
            cache_write_tokens: 0,
        });
        m.record(&Usage {
            prompt_tokens: 7,
            completion_tokens: 2,
            cache_read_tokens: 0,
            cache_write_tokens: 1,
        });
        assert_eq!(m.requests, 2);
        assert_eq!(m.prompt_tokens, 17);
        assert_eq!(m.completion_tokens, 7);
        assert_eq!(m.cache_read_tokens, 3);
        assert_eq!(m.cache_write_tokens, 1);
    }
}

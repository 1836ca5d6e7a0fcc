// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! LLM registry: maps a stable `usage_id` to an [`Llm`] instance.
//!
//! The registry enforces **independent metrics per registered LLM**. An LLM
//! derived from another one (same provider, different usage slot — e.g. a
//! condenser LLM built from the agent LLM) can accidentally share the
//! original's metrics handle; token and cost accounting would then leak
//! between usage slots. Sharing is detected by object identity on the
//! metrics allocation and repaired by resetting the newcomer's metrics.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::Llm;

#[derive(Default)]
pub struct LlmRegistry {
    usage_to_llm: HashMap<String, Arc<Llm>>,
    /// Raw addresses of every registered metrics allocation.
    metrics_ids: HashSet<usize>,
}

impl LlmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an LLM under its usage id.
    ///
    /// Duplicate usage ids are rejected. If the LLM's metrics object is
    /// already tracked for another registered LLM, the metrics are reset to
    /// a fresh allocation before registration.
    pub fn add(&mut self, mut llm: Llm) -> anyhow::Result<Arc<Llm>> {
        let usage_id = llm.usage_id().to_string();
        if self.usage_to_llm.contains_key(&usage_id) {
            anyhow::bail!(
                "usage id `{usage_id}` already exists in the registry; \
                 use get() to retrieve the existing LLM"
            );
        }

        let metrics_id = Arc::as_ptr(&llm.metrics_handle()) as usize;
        if self.metrics_ids.contains(&metrics_id) {
            debug!(usage_id = %usage_id, "detected shared metrics; resetting to independent metrics");
            llm.reset_metrics();
        }
        self.metrics_ids
            .insert(Arc::as_ptr(&llm.metrics_handle()) as usize);

        let llm = Arc::new(llm);
        self.usage_to_llm.insert(usage_id, Arc::clone(&llm));
        Ok(llm)
    }

    pub fn get(&self, usage_id: &str) -> Option<Arc<Llm>> {
        self.usage_to_llm.get(usage_id).cloned()
    }

    pub fn usage_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.usage_to_llm.keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Risk classification for a pending action.
///
/// Ordering drives the `ConfirmRisky` threshold comparison; `Unknown`
/// ranks above every concrete level so that an analyzer failure is always
/// treated as at least as risky as the configured threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityRisk {
    Low,
    Medium,
    High,
    Unknown,
}

impl SecurityRisk {
    pub fn parse(text: &str) -> Self {
        match text.trim().to_uppercase().as_str() {
            "LOW" => Self::Low,
            "MEDIUM" => Self::Medium,
            "HIGH" => Self::High,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for SecurityRisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{name}")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

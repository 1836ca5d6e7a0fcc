// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

use super::risk::SecurityRisk;

/// What the policy says about a pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationDecision {
    Allow,
    RequireConfirmation,
    Reject,
}

/// Gate evaluated before executing any action, orthogonal to the security
/// analyzer: the analyzer produces a risk, the policy maps (risk, action)
/// to a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ConfirmationPolicy {
    AlwaysConfirm,
    NeverConfirm,
    ConfirmRisky { threshold: SecurityRisk },
}

impl ConfirmationPolicy {
    pub fn decide(&self, risk: Option<SecurityRisk>) -> ConfirmationDecision {
        match self {
            Self::AlwaysConfirm => ConfirmationDecision::RequireConfirmation,
            Self::NeverConfirm => ConfirmationDecision::Allow,
            Self::ConfirmRisky { threshold } => {
                // With no analyzer attached there is no risk signal; treat
                // as unknown, which ranks above every threshold.
                let risk = risk.unwrap_or(SecurityRisk::Unknown);
                if risk >= *threshold {
                    ConfirmationDecision::RequireConfirmation
                } else {
                    ConfirmationDecision::Allow
                }
            }
        }
    }
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self::NeverConfirm
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_confirm_requires_confirmation_for_low_risk() {
        let p = ConfirmationPolicy::AlwaysConfirm;
        assert_eq!(
            p.decide(Some(SecurityRisk::Low)),
            ConfirmationDecision::RequireConfirmation
        );
    }

    #[test]
    fn never_confirm_allows_high_risk() {
        let p = ConfirmationPolicy::NeverConfirm;
        assert_eq!(p.decide(Some(SecurityRisk::High)), ConfirmationDecision::Allow);
    }

    #[test]
    fn confirm_risky_compares_against_threshold() {
        let p = ConfirmationPolicy::ConfirmRisky {
            threshold: SecurityRisk::Medium,
        };
        assert_eq!(p.decide(Some(SecurityRisk::Low)), ConfirmationDecision::Allow);
        assert_eq!(
            p.decide(Some(SecurityRisk::Medium)),
            ConfirmationDecision::RequireConfirmation
        );
        assert_eq!(
            p.decide(Some(SecurityRisk::High)),
            ConfirmationDecision::RequireConfirmation
        );
    }

    #[test]
    fn unknown_risk_requires_confirmation_under_confirm_risky() {
        let p = ConfirmationPolicy::ConfirmRisky {
            threshold: SecurityRisk::High,
        };
        assert_eq!(
            p.decide(Some(SecurityRisk::Unknown)),
            ConfirmationDecision::RequireConfirmation
        );
        assert_eq!(p.decide(None), ConfirmationDecision::RequireConfirmation);
    }

    #[test]
    fn policy_serializes_with_tag() {
        let p = ConfirmationPolicy::ConfirmRisky {
            threshold: SecurityRisk::Medium,
        };
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"policy\":\"confirm_risky\""));
        let back: ConfirmationPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod analyzer;
mod confirmation;
mod grayswan;
mod risk;

pub use analyzer::{LlmSecurityAnalyzer, SecurityAnalyzer};
pub use confirmation::{ConfirmationDecision, ConfirmationPolicy};
pub use grayswan::GraySwanAnalyzer;
pub use risk::SecurityRisk;

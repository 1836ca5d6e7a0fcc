// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod logging;
mod schema;

pub use logging::{init_logging, LoggingConfig};
pub use schema::{
    AgentSettings, ConfirmationSetting, GraySwanSettings, LlmSettings, RiskLevelSetting,
    SecurityAnalyzerSetting, ServerConfig,
};

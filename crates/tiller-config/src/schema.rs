// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_max_iterations() -> u32 {
    500
}

fn default_timeout_secs() -> f64 {
    30.0
}

fn default_low_threshold() -> f64 {
    0.3
}

fn default_medium_threshold() -> f64 {
    0.7
}

/// Default LLM wiring.
///
/// Resolved from config first, then from the `LLM_MODEL`, `LLM_API_KEY` and
/// `LLM_BASE_URL` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Model name forwarded to the provider API.
    pub model: String,
    /// Explicit API key; prefer environment wiring to avoid secrets in
    /// version-controlled files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Base URL of the OpenAI-compatible endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Attach explicit prompt-cache markers to the static system block and
    /// the last user block. Providers without cache support ignore them.
    #[serde(default = "default_true")]
    pub prompt_cache: bool,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".into(),
            api_key: None,
            base_url: None,
            max_output_tokens: None,
            temperature: None,
            prompt_cache: true,
        }
    }
}

impl LlmSettings {
    /// Apply `LLM_MODEL` / `LLM_API_KEY` / `LLM_BASE_URL` overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(model) = std::env::var("LLM_MODEL") {
            if !model.is_empty() {
                self.model = model;
            }
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            if !key.is_empty() {
                self.api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            if !url.is_empty() {
                self.base_url = Some(url);
            }
        }
        self
    }
}

/// Risk levels usable in configuration (mirrors the runtime enum without
/// depending on it — config stays a leaf crate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevelSetting {
    Low,
    Medium,
    High,
}

/// Confirmation policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ConfirmationSetting {
    AlwaysConfirm,
    NeverConfirm,
    ConfirmRisky { threshold: RiskLevelSetting },
}

impl Default for ConfirmationSetting {
    fn default() -> Self {
        Self::NeverConfirm
    }
}

/// GraySwan security analyzer wiring.
///
/// The API key and policy id are resolved from `GRAYSWAN_API_KEY` and
/// `GRAYSWAN_POLICY_ID` when not set here. Thresholds must satisfy
/// `low < medium`; this is validated at analyzer construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraySwanSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(default = "default_low_threshold")]
    pub low_threshold: f64,
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
}

impl Default for GraySwanSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            policy_id: None,
            low_threshold: default_low_threshold(),
            medium_threshold: default_medium_threshold(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl GraySwanSettings {
    pub fn with_env_overrides(mut self) -> Self {
        if self.api_key.is_none() {
            self.api_key = std::env::var("GRAYSWAN_API_KEY").ok().filter(|k| !k.is_empty());
        }
        if self.policy_id.is_none() {
            self.policy_id = std::env::var("GRAYSWAN_POLICY_ID").ok().filter(|p| !p.is_empty());
        }
        self
    }
}

/// Agent behaviour knobs shared by the local and server runtimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Iteration budget per `run()` since the last user message.
    #[serde(default = "default_max_iterations")]
    pub max_iteration_per_run: u32,
    /// Optional system prompt override for the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub confirmation: ConfirmationSetting,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iteration_per_run: default_max_iterations(),
            system_prompt: None,
            confirmation: ConfirmationSetting::default(),
        }
    }
}

/// Security analyzer selection for server-created conversations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityAnalyzerSetting {
    /// No risk analysis; the confirmation policy sees no risk signal.
    #[default]
    None,
    /// Read the model's own `security_risk` prediction from its tool
    /// arguments.
    Llm,
    /// GraySwan Cygnal policy API (wired via the `grayswan` section and
    /// the `GRAYSWAN_*` environment variables).
    Grayswan,
}

/// Agent server configuration, loaded from the JSON file named by the
/// `TILLER_SERVER_CONFIG_PATH` environment variable (falling back to
/// defaults when the variable is unset).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Accepted values for the `X-Session-API-Key` header. Empty list
    /// disables the check.
    #[serde(default)]
    pub session_api_keys: Vec<String>,
    /// Directory holding persisted conversations.
    #[serde(default = "default_conversations_path")]
    pub conversations_path: PathBuf,
    /// Working directory handed to conversation workspaces.
    #[serde(default = "default_workspace_path")]
    pub workspace_path: PathBuf,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub security_analyzer: SecurityAnalyzerSetting,
    #[serde(default)]
    pub grayswan: GraySwanSettings,
}

fn default_conversations_path() -> PathBuf {
    PathBuf::from("workspace/conversations")
}

fn default_workspace_path() -> PathBuf {
    PathBuf::from("workspace/project")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session_api_keys: Vec::new(),
            conversations_path: default_conversations_path(),
            workspace_path: default_workspace_path(),
            llm: LlmSettings::default(),
            agent: AgentSettings::default(),
            security_analyzer: SecurityAnalyzerSetting::default(),
            grayswan: GraySwanSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load from `TILLER_SERVER_CONFIG_PATH`, or defaults when unset.
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var("TILLER_SERVER_CONFIG_PATH") {
            Ok(path) if !path.is_empty() => Self::from_file(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut cfg: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        cfg.llm = cfg.llm.with_env_overrides();
        Ok(cfg)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_server_config_has_no_api_keys() {
        let cfg = ServerConfig::default();
        assert!(cfg.session_api_keys.is_empty());
    }

    #[test]
    fn server_config_parses_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"session_api_keys": ["secret"], "conversations_path": "/tmp/convos"}"#,
        )
        .unwrap();
        let cfg = ServerConfig::from_file(&path).unwrap();
        assert_eq!(cfg.session_api_keys, vec!["secret"]);
        assert_eq!(cfg.conversations_path, PathBuf::from("/tmp/convos"));
    }

    #[test]
    fn server_config_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(ServerConfig::from_file(&path).is_err());
    }

    #[test]
    fn confirmation_setting_round_trips() {
        let s = ConfirmationSetting::ConfirmRisky {
            threshold: RiskLevelSetting::Medium,
        };
        let json = serde_json::to_string(&s).unwrap();
        let back: ConfirmationSetting = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn grayswan_defaults_are_ordered() {
        let g = GraySwanSettings::default();
        assert!(g.low_threshold < g.medium_threshold);
    }

    #[test]
    fn security_analyzer_defaults_to_none_and_round_trips() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.security_analyzer, SecurityAnalyzerSetting::None);

        let cfg: ServerConfig = serde_json::from_str(
            r#"{"security_analyzer": "grayswan", "grayswan": {"low_threshold": 0.2}}"#,
        )
        .unwrap();
        assert_eq!(cfg.security_analyzer, SecurityAnalyzerSetting::Grayswan);
        assert_eq!(cfg.grayswan.low_threshold, 0.2);
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_params() -> Value {
    Value::Object(Default::default())
}

/// Serializable reference to a registered tool: the name resolved against
/// the process-wide registry, plus factory parameters.
///
/// This is the form tools take in configuration and over the wire; the
/// concrete [`crate::Tool`] is produced by [`crate::resolve_tool`] against
/// a conversation's [`crate::ToolContext`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default = "default_params")]
    pub params: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: default_params(),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_default_to_empty_object() {
        let spec: ToolSpec = serde_json::from_str(r#"{"name": "terminal"}"#).unwrap();
        assert_eq!(spec.params, serde_json::json!({}));
    }

    #[test]
    fn round_trips_with_params() {
        let spec = ToolSpec::new("terminal").with_params(serde_json::json!({"timeout_secs": 10}));
        let json = serde_json::to_string(&spec).unwrap();
        let back: ToolSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}

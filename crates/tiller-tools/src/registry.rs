// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Process-wide tool registry.
//!
//! Registration is append-only and idempotent: registering the same name
//! with the same factory is a no-op; registering the same name with a
//! *different* factory is a configuration error. Reads take a snapshot, so
//! resolution never holds the lock across factory calls.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::{spec::ToolSpec, tool::Tool, ToolContext};

/// Builds a tool instance from factory params and a conversation context.
pub type ToolFactory = fn(&serde_json::Value, &ToolContext) -> anyhow::Result<Arc<dyn Tool>>;

fn registry() -> &'static RwLock<HashMap<String, ToolFactory>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, ToolFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a tool factory under `name`.
pub fn register_tool(name: &str, factory: ToolFactory) -> anyhow::Result<()> {
    let mut map = registry().write().expect("tool registry lock");
    match map.get(name) {
        Some(existing) if *existing as usize == factory as usize => Ok(()),
        Some(_) => anyhow::bail!("tool `{name}` is already registered with a different factory"),
        None => {
            map.insert(name.to_string(), factory);
            Ok(())
        }
    }
}

/// Resolve a [`ToolSpec`] into a live tool bound to `ctx`.
///
/// Unknown names are a configuration error.
pub fn resolve_tool(spec: &ToolSpec, ctx: &ToolContext) -> anyhow::Result<Arc<dyn Tool>> {
    let factory = {
        let map = registry().read().expect("tool registry lock");
        map.get(&spec.name).copied()
    };
    match factory {
        Some(factory) => factory(&spec.params, ctx),
        None => anyhow::bail!("unknown tool: `{}` is not in the registry", spec.name),
    }
}

pub fn registered_tool_names() -> Vec<String> {
    let map = registry().read().expect("tool registry lock");
    let mut names: Vec<String> = map.keys().cloned().collect();
    names.sort();
    names
}

/// Register the built-in tool set. Idempotent; every runtime entry point
/// calls this before resolving specs.
pub fn register_builtin_tools() {
    register_tool(crate::finish::FINISH_TOOL_NAME, crate::finish::factory)
        .expect("finish tool registration");
    register_tool("terminal", crate::terminal::factory).expect("terminal tool registration");
    register_tool("file_editor", crate::editor::factory).expect("file editor registration");
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

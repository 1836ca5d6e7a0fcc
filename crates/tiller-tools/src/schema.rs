// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! MCP-style schema rendering.
//!
//! Action types serialize with an internal `kind` discriminator used for
//! polymorphic deserialization; that field must never leak into the schema
//! handed to models or MCP clients. Self-referential action types
//! (tree-shaped arguments) carry `$ref` cycles; rendering inlines refs and
//! short-circuits any cycle with a bare `{"type": "object"}` instead of
//! recursing.

use serde_json::{Map, Value};

/// Field used internally to discriminate polymorphic action payloads.
const DISCRIMINATOR: &str = "kind";

/// Maximum inline depth before a `$ref` is replaced with a placeholder,
/// covering pathological non-cyclic nesting as well.
const MAX_DEPTH: usize = 32;

/// Render an action schema for external consumption: inline local `$ref`s,
/// replace cyclic or over-deep references with `{"type": "object"}`, and
/// strip the internal discriminator from every object level.
pub fn to_mcp_schema(schema: &Value) -> Value {
    let mut stack = Vec::new();
    let rendered = render(schema, schema, &mut stack, 0);
    strip_discriminator(rendered)
}

fn render(node: &Value, root: &Value, ref_stack: &mut Vec<String>, depth: usize) -> Value {
    if depth > MAX_DEPTH {
        return serde_json::json!({ "type": "object" });
    }
    match node {
        Value::Object(map) => {
            if let Some(Value::String(reference)) = map.get("$ref") {
                if ref_stack.contains(reference) {
                    // Cycle: the referenced definition is already being
                    // rendered above us.
                    return serde_json::json!({ "type": "object" });
                }
                return match lookup_ref(root, reference) {
                    Some(target) => {
                        ref_stack.push(reference.clone());
                        let rendered = render(target, root, ref_stack, depth + 1);
                        ref_stack.pop();
                        rendered
                    }
                    // Unresolvable (external or malformed) reference.
                    None => serde_json::json!({ "type": "object" }),
                };
            }
            let mut out = Map::new();
            for (k, v) in map {
                // Definition tables are inlined at use sites; dropping them
                // keeps the rendered schema self-contained.
                if k == "$defs" || k == "definitions" {
                    continue;
                }
                out.insert(k.clone(), render(v, root, ref_stack, depth + 1));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render(v, root, ref_stack, depth + 1))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve a local JSON pointer reference (`#/...`) against the root schema.
fn lookup_ref<'a>(root: &'a Value, reference: &str) -> Option<&'a Value> {
    let pointer = reference.strip_prefix('#')?;
    root.pointer(pointer)
}

/// Remove the discriminator from every `properties` map and `required` list.
fn strip_discriminator(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if k == "properties" {
                    if let Value::Object(mut props) = v {
                        props.remove(DISCRIMINATOR);
                        out.insert(
                            k,
                            Value::Object(
                                props
                                    .into_iter()
                                    .map(|(pk, pv)| (pk, strip_discriminator(pv)))
                                    .collect(),
                            ),
                        );
                        continue;
                    }
                    out.insert(k, strip_discriminator(v));
                } else if k == "required" {
                    if let Value::Array(items) = v {
                        let filtered: Vec<Value> = items
                            .into_iter()
                            .filter(|i| i.as_str() != Some(DISCRIMINATOR))
                            .collect();
                        if !filtered.is_empty() {
                            out.insert(k, Value::Array(filtered));
                        }
                        continue;
                    }
                    out.insert(k, v);
                } else {
                    out.insert(k, strip_discriminator(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(strip_discriminator).collect())
        }
        other => other,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

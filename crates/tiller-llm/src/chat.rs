// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-compatible chat-completions driver.
//!
//! Speaks the `/chat/completions` wire format used by OpenAI, OpenRouter,
//! LiteLLM, vLLM, llama.cpp and most gateways. Tool calls use the standard
//! `tool_calls` array; prompt-cache marks are serialized as
//! `cache_control` blocks, which caching gateways honour and everything
//! else ignores.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::LlmProvider, ChatMessage, Completion, CompletionRequest, ContentPart, LlmError,
    Role, ToolCallRequest, Usage,
};

pub struct OpenAiCompatProvider {
    model: String,
    api_key: Option<String>,
    chat_url: String,
    max_output_tokens: Option<u32>,
    temperature: Option<f32>,
    context_window: Option<u32>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        model: impl Into<String>,
        api_key: Option<String>,
        base_url: impl AsRef<str>,
        max_output_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        let base = base_url.as_ref().trim_end_matches('/');
        Self {
            model: model.into(),
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_output_tokens,
            temperature,
            context_window: None,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(180))
                .build()
                .expect("reqwest client"),
        }
    }

    pub fn with_context_window(mut self, window: u32) -> Self {
        self.context_window = Some(window);
        self
    }

    /// Build from resolved settings (config file merged with the
    /// `LLM_MODEL` / `LLM_API_KEY` / `LLM_BASE_URL` environment wiring).
    pub fn from_settings(settings: &tiller_config::LlmSettings) -> Self {
        Self::new(
            settings.model.clone(),
            settings.api_key.clone(),
            settings
                .base_url
                .as_deref()
                .unwrap_or("https://api.openai.com/v1"),
            settings.max_output_tokens,
            settings.temperature,
        )
    }

    fn build_payload(&self, req: &CompletionRequest) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| serialize_message(m, req.prompt_cache))
            .collect();

        let mut payload = json!({
            "model": self.model,
            "messages": messages,
        });
        if !req.tools.is_empty() {
            payload["tools"] = Value::Array(
                req.tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        if let Some(max) = self.max_output_tokens {
            payload["max_tokens"] = json!(max);
        }
        if let Some(t) = self.temperature {
            payload["temperature"] = json!(t);
        }
        payload
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compat"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> Option<u32> {
        self.context_window
    }

    async fn complete(&self, req: CompletionRequest) -> Result<Completion, LlmError> {
        let payload = self.build_payload(&req);
        debug!(model = %self.model, messages = req.messages.len(), "chat completion request");

        let mut http = self.client.post(&self.chat_url).json(&payload);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(e.to_string())
            } else {
                LlmError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(LlmError::from_status(status, &body));
        }

        parse_completion(&body)
    }
}

fn serialize_message(m: &ChatMessage, prompt_cache: bool) -> Value {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let content = serialize_content(m, prompt_cache);
    let mut out = json!({ "role": role });
    match content {
        Some(c) => out["content"] = c,
        // Assistant tool-call messages without a thought send null content.
        None if m.role == Role::Assistant => out["content"] = Value::Null,
        None => out["content"] = json!(""),
    }

    if !m.tool_calls.is_empty() {
        out["tool_calls"] = Value::Array(
            m.tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect(),
        );
    }
    if let Some(id) = &m.tool_call_id {
        out["tool_call_id"] = json!(id);
    }
    out
}

fn serialize_content(m: &ChatMessage, prompt_cache: bool) -> Option<Value> {
    if m.content.is_empty() {
        return None;
    }
    let marked = |idx: usize| prompt_cache && m.cache_marks.contains(&idx);

    // Collapse a single unmarked text block to a plain string — the most
    // compatible encoding for older backends.
    if m.content.len() == 1 && !marked(0) {
        if let ContentPart::Text { text } = &m.content[0] {
            return Some(json!(text));
        }
    }

    let blocks: Vec<Value> = m
        .content
        .iter()
        .enumerate()
        .map(|(i, part)| {
            let mut block = match part {
                ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                ContentPart::Image { image_url } => {
                    json!({ "type": "image_url", "image_url": { "url": image_url } })
                }
                ContentPart::Pdf { pdf_url } => {
                    json!({ "type": "file", "file": { "file_data": pdf_url } })
                }
            };
            if marked(i) {
                block["cache_control"] = json!({ "type": "ephemeral" });
            }
            block
        })
        .collect();
    Some(Value::Array(blocks))
}

fn parse_completion(body: &str) -> Result<Completion, LlmError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| LlmError::MalformedResponse(format!("invalid JSON: {e}")))?;

    let choice = value["choices"]
        .as_array()
        .and_then(|c| c.first())
        .ok_or(LlmError::NoResponse)?;
    let message = &choice["message"];

    let text = message["content"].as_str().filter(|s| !s.is_empty());
    let tool_calls = match message["tool_calls"].as_array() {
        None => Vec::new(),
        Some(calls) => calls
            .iter()
            .map(parse_tool_call)
            .collect::<Result<Vec<_>, _>>()?,
    };

    if text.is_none() && tool_calls.is_empty() {
        return Err(LlmError::MalformedResponse(
            "response carried neither content nor tool calls".into(),
        ));
    }

    let usage = Usage {
        prompt_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: value["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        cache_read_tokens: value["usage"]["prompt_tokens_details"]["cached_tokens"]
            .as_u64()
            .unwrap_or(0),
        cache_write_tokens: 0,
    };

    Ok(Completion {
        response_id: value["id"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        message: text.map(str::to_string),
        tool_calls,
        usage,
    })
}

fn parse_tool_call(call: &Value) -> Result<ToolCallRequest, LlmError> {
    let id = call["id"].as_str().unwrap_or_default().to_string();
    let name = call["function"]["name"]
        .as_str()
        .ok_or_else(|| LlmError::MalformedResponse("tool call without a name".into()))?
        .to_string();
    let raw_args = call["function"]["arguments"].as_str().unwrap_or("{}");
    let arguments: Value = serde_json::from_str(raw_args).map_err(|e| {
        LlmError::MalformedResponse(format!("tool call `{name}` has invalid JSON arguments: {e}"))
    })?;
    Ok(ToolCallRequest {
        id,
        name,
        arguments,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

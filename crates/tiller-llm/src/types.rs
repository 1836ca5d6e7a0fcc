// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

// ─── Content part types ───────────────────────────────────────────────────────

/// A single content block in a chat message.
///
/// Images and PDFs are carried as URLs — either data URLs
/// (`data:<mime>;base64,<b64>`) or HTTPS references the provider can fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { image_url: String },
    Pdf { pdf_url: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image_url: impl Into<String>) -> Self {
        Self::Image {
            image_url: image_url.into(),
        }
    }

    pub fn pdf(pdf_url: impl Into<String>) -> Self {
        Self::Pdf {
            pdf_url: pdf_url.into(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model (or replayed back to it).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    /// Opaque identifier from the model, forwarded verbatim.
    pub id: String,
    pub name: String,
    /// Parsed JSON argument object.
    pub arguments: serde_json::Value,
}

/// One message in the provider payload.
///
/// `cache_marks` lists indexes of content blocks that should carry an
/// explicit prompt-cache marker. Providers without cache-mark support
/// ignore the list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
    /// Present only on assistant messages that carry tool calls.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Present only on tool-role messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cache_marks: Vec<usize>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentPart::text(text)],
            tool_calls: Vec::new(),
            tool_call_id: None,
            cache_marks: Vec::new(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentPart::text(text)],
            tool_calls: Vec::new(),
            tool_call_id: None,
            cache_marks: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentPart::text(text)],
            tool_calls: Vec::new(),
            tool_call_id: None,
            cache_marks: Vec::new(),
        }
    }

    pub fn assistant_tool_calls(
        thought: Option<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        // No content string is sent when there is no thought text.
        let content = match thought {
            Some(t) if !t.is_empty() => vec![ContentPart::text(t)],
            _ => Vec::new(),
        };
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
            cache_marks: Vec::new(),
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::Tool,
            content: parts,
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            cache_marks: Vec::new(),
        }
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| p.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

/// Request sent to a provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    /// Honour the `cache_marks` carried on messages. When false, marks are
    /// dropped before serialization.
    pub prompt_cache: bool,
}

/// Token usage from one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

/// A parsed, non-streaming provider response.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    /// Provider response id, forwarded into `Action.llm_response_id`.
    pub response_id: String,
    /// Assistant text, if any.
    pub message: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Usage,
}

impl Completion {
    pub fn message_only(text: impl Into<String>) -> Self {
        Self {
            response_id: uuid::Uuid::new_v4().to_string(),
            message: Some(text.into()),
            tool_calls: Vec::new(),
            usage: Usage::default(),
        }
    }

    pub fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
        Self {
            response_id: uuid::Uuid::new_v4().to_string(),
            message: None,
            tool_calls: vec![ToolCallRequest {
                id: format!("call_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
                name: name.into(),
                arguments,
            }],
            usage: Usage::default(),
        }
    }

    /// Attach a thought string to a tool-call completion.
    pub fn with_message(mut self, text: impl Into<String>) -> Self {
        self.message = Some(text.into());
        self
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_has_single_text_block() {
        let m = ChatMessage::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.content, vec![ContentPart::text("hello")]);
        assert!(m.tool_calls.is_empty());
    }

    #[test]
    fn assistant_tool_calls_without_thought_has_no_content() {
        let m = ChatMessage::assistant_tool_calls(
            None,
            vec![ToolCallRequest {
                id: "c1".into(),
                name: "terminal".into(),
                arguments: serde_json::json!({"command": "pwd"}),
            }],
        );
        assert!(m.content.is_empty());
        assert_eq!(m.tool_calls.len(), 1);
    }

    #[test]
    fn assistant_tool_calls_with_empty_thought_has_no_content() {
        let m = ChatMessage::assistant_tool_calls(Some(String::new()), vec![]);
        assert!(m.content.is_empty());
    }

    #[test]
    fn tool_result_carries_call_id() {
        let m = ChatMessage::tool_result("call-9", vec![ContentPart::text("/workspace\n")]);
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("call-9"));
    }

    #[test]
    fn content_part_round_trips_with_type_tag() {
        let p = ContentPart::pdf("data:application/pdf;base64,AAA");
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"type\":\"pdf\""));
        let back: ContentPart = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn completion_tool_call_constructor_mints_ids() {
        let a = Completion::tool_call("finish", serde_json::json!({"message": "done"}));
        let b = Completion::tool_call("finish", serde_json::json!({"message": "done"}));
        assert_ne!(a.tool_calls[0].id, b.tool_calls[0].id);
        assert_ne!(a.response_id, b.response_id);
    }

    #[test]
    fn message_text_joins_text_blocks_only() {
        let m = ChatMessage {
            role: Role::User,
            content: vec![
                ContentPart::text("a"),
                ContentPart::image("data:image/png;base64,X"),
                ContentPart::text("b"),
            ],
            tool_calls: Vec::new(),
            tool_call_id: None,
            cache_marks: Vec::new(),
        };
        assert_eq!(m.text(), "a\nb");
    }
}

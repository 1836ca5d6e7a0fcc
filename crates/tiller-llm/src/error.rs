// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Classified provider failures.
///
/// Authentication and bad-request are fatal for the step; rate-limit,
/// timeout, service-unavailable and no-response retry inside the bounded
/// policy; context-window-exceeded is surfaced to the condenser, which may
/// trigger a hard reset.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("context window exceeded: {0}")]
    ContextWindowExceeded(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("provider returned no response")]
    NoResponse,

    #[error("transport error: {0}")]
    Transport(String),
}

impl LlmError {
    /// Errors worth another attempt under the bounded retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit(_)
                | Self::Timeout(_)
                | Self::ServiceUnavailable(_)
                | Self::NoResponse
                | Self::Transport(_)
        )
    }

    /// Errors that end the step immediately, with no retry and no recovery.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication(_) | Self::BadRequest(_))
    }

    /// Classify an HTTP error response by status code and body.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::Authentication(clip(body)),
            400 | 413 | 422 => {
                if body_signals_context_overflow(body) {
                    Self::ContextWindowExceeded(clip(body))
                } else {
                    Self::BadRequest(clip(body))
                }
            }
            408 => Self::Timeout(clip(body)),
            429 => Self::RateLimit(clip(body)),
            500..=599 => Self::ServiceUnavailable(format!("status {status}: {}", clip(body))),
            _ => Self::Transport(format!("unexpected status {status}: {}", clip(body))),
        }
    }
}

/// Markers various OpenAI-compatible backends use to report a hard context
/// overflow inside an otherwise generic 400 response.
fn body_signals_context_overflow(body: &str) -> bool {
    const MARKERS: &[&str] = &[
        "context_length_exceeded",
        "exceed_context_size_error",
        "maximum context length",
        "context window",
        "prompt is too long",
    ];
    let lower = body.to_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

fn clip(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body.to_string();
    }
    // Error bodies are arbitrary provider text; the cut must land on a
    // char boundary or slicing panics on multibyte UTF-8.
    let mut cut = MAX;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &body[..cut])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

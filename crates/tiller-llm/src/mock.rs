// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Test doubles: a fixed-answer provider and a scripted provider that
//! replays a queue of completions or errors and records every request it
//! receives, so tests can assert on the exact wire payload.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{Completion, CompletionRequest, LlmError, LlmProvider};

/// Always answers `"ok"`. No network.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, _req: CompletionRequest) -> Result<Completion, LlmError> {
        Ok(Completion::message_only("ok"))
    }
}

enum ScriptItem {
    Reply(Completion),
    Fail(LlmError),
}

/// Replays a scripted sequence of completions and errors in order.
///
/// When the script runs dry, `complete` returns [`LlmError::NoResponse`].
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ScriptItem>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(completions: Vec<Completion>) -> Self {
        Self {
            script: Mutex::new(completions.into_iter().map(ScriptItem::Reply).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Append a completion to the end of the script.
    pub fn push(&self, completion: Completion) {
        self.script
            .lock()
            .expect("script lock")
            .push_back(ScriptItem::Reply(completion));
    }

    /// Append an error to the end of the script.
    pub fn push_error(&self, error: LlmError) {
        self.script
            .lock()
            .expect("script lock")
            .push_back(ScriptItem::Fail(error));
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// Number of unconsumed scripted errors.
    pub fn remaining_errors(&self) -> usize {
        self.script
            .lock()
            .expect("script lock")
            .iter()
            .filter(|i| matches!(i, ScriptItem::Fail(_)))
            .count()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().expect("script lock").len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted-model"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<Completion, LlmError> {
        self.requests.lock().expect("requests lock").push(req);
        match self.script.lock().expect("script lock").pop_front() {
            Some(ScriptItem::Reply(c)) => Ok(c),
            Some(ScriptItem::Fail(e)) => Err(e),
            None => Err(LlmError::NoResponse),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_provider_replays_in_order() {
        let p = ScriptedProvider::new(vec![
            Completion::message_only("first"),
            Completion::message_only("second"),
        ]);
        let a = p.complete(CompletionRequest::default()).await.unwrap();
        let b = p.complete(CompletionRequest::default()).await.unwrap();
        assert_eq!(a.message.as_deref(), Some("first"));
        assert_eq!(b.message.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn exhausted_script_returns_no_response() {
        let p = ScriptedProvider::new(vec![]);
        assert!(matches!(
            p.complete(CompletionRequest::default()).await,
            Err(LlmError::NoResponse)
        ));
    }

    #[tokio::test]
    async fn requests_are_recorded() {
        let p = ScriptedProvider::new(vec![Completion::message_only("x")]);
        let mut req = CompletionRequest::default();
        req.prompt_cache = true;
        p.complete(req).await.unwrap();
        let seen = p.requests();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].prompt_cache);
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tracing::warn;

use crate::{
    metrics, Completion, CompletionRequest, LlmError, LlmProvider, Metrics, MetricsHandle,
    RetryPolicy,
};

/// Models below this context window are rejected at construction. Agent
/// trajectories routinely exceed tiny windows within a handful of turns,
/// so failing early beats failing mid-conversation. Set
/// `ALLOW_SHORT_CONTEXT_WINDOWS=1` to bypass.
pub const MIN_CONTEXT_WINDOW: u32 = 8192;

/// A provider wrapped with retry policy and usage metrics, addressed by a
/// stable `usage_id` in the [`crate::LlmRegistry`].
pub struct Llm {
    usage_id: String,
    provider: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
    metrics: MetricsHandle,
    /// Notified with `(attempt, max_attempts)` before each retry sleep.
    retry_listener: Option<Box<dyn Fn(u32, u32) + Send + Sync>>,
}

impl Llm {
    pub fn new(
        usage_id: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        if let Some(window) = provider.context_window() {
            let allow_short = matches!(
                std::env::var("ALLOW_SHORT_CONTEXT_WINDOWS")
                    .unwrap_or_default()
                    .to_lowercase()
                    .as_str(),
                "1" | "true" | "yes" | "on"
            );
            if window < MIN_CONTEXT_WINDOW && !allow_short {
                anyhow::bail!(
                    "model {} has a {window}-token context window, below the \
                     {MIN_CONTEXT_WINDOW} minimum; set ALLOW_SHORT_CONTEXT_WINDOWS=1 \
                     to use it anyway",
                    provider.model_name()
                );
            }
        }
        Ok(Self {
            usage_id: usage_id.into(),
            provider,
            retry,
            metrics: metrics::new_handle(),
            retry_listener: None,
        })
    }

    /// Derive a copy of this LLM under a new usage id.
    ///
    /// The derived instance shares this LLM's metrics handle — the same
    /// shallow-copy behaviour that makes derived condenser/critic LLMs
    /// convenient to build. Registering the copy through
    /// [`crate::LlmRegistry::add`] detects the sharing and resets the
    /// copy's metrics so accounting stays independent per usage slot.
    pub fn derive(&self, usage_id: impl Into<String>) -> Self {
        Self {
            usage_id: usage_id.into(),
            provider: Arc::clone(&self.provider),
            retry: self.retry.clone(),
            metrics: Arc::clone(&self.metrics),
            retry_listener: None,
        }
    }

    pub fn with_retry_listener(
        mut self,
        listener: impl Fn(u32, u32) + Send + Sync + 'static,
    ) -> Self {
        self.retry_listener = Some(Box::new(listener));
        self
    }

    pub fn usage_id(&self) -> &str {
        &self.usage_id
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn tool_content_limit(&self) -> usize {
        self.provider.tool_content_limit()
    }

    /// Shared metrics handle. Two `Llm`s holding the same handle is the
    /// sharing condition the registry repairs on registration.
    pub fn metrics_handle(&self) -> MetricsHandle {
        Arc::clone(&self.metrics)
    }

    pub fn metrics_snapshot(&self) -> Metrics {
        self.metrics.lock().expect("metrics lock").clone()
    }

    /// Replace the metrics object with a fresh, unshared one.
    pub fn reset_metrics(&mut self) {
        self.metrics = metrics::new_handle();
    }

    /// Complete with the bounded retry policy.
    ///
    /// Fatal classifications (authentication, bad request) and
    /// context-window overflows return immediately; retryable ones back off
    /// and try again until the attempt budget runs out.
    pub async fn complete(&self, req: CompletionRequest) -> Result<Completion, LlmError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.provider.complete(req.clone()).await {
                Ok(completion) => {
                    self.metrics
                        .lock()
                        .expect("metrics lock")
                        .record(&completion.usage);
                    return Ok(completion);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        usage_id = %self.usage_id,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "completion failed, retrying: {e}"
                    );
                    if let Some(listener) = &self.retry_listener {
                        listener(attempt, self.retry.max_attempts);
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{MockProvider, ScriptedProvider};

    struct FlakyProvider {
        failures: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }
        fn model_name(&self) -> &str {
            "flaky-1"
        }
        async fn complete(&self, _req: CompletionRequest) -> Result<Completion, LlmError> {
            if self.failures.fetch_sub(1, Ordering::SeqCst) > 1 {
                Err(LlmError::ServiceUnavailable("overloaded".into()))
            } else {
                Ok(Completion::message_only("recovered"))
            }
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(2),
            multiplier: 1.0,
        }
    }

    #[tokio::test]
    async fn retries_recover_from_transient_failures() {
        let llm = Llm::new(
            "agent",
            Arc::new(FlakyProvider {
                failures: AtomicU32::new(2),
            }),
            fast_retry(3),
        )
        .unwrap();
        let c = llm.complete(CompletionRequest::default()).await.unwrap();
        assert_eq!(c.message.as_deref(), Some("recovered"));
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let llm = Llm::new(
            "agent",
            Arc::new(FlakyProvider {
                failures: AtomicU32::new(100),
            }),
            fast_retry(2),
        )
        .unwrap();
        let err = llm.complete(CompletionRequest::default()).await.unwrap_err();
        assert!(matches!(err, LlmError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let scripted = Arc::new(ScriptedProvider::new(vec![]));
        scripted.push_error(LlmError::Authentication("bad key".into()));
        scripted.push_error(LlmError::Authentication("should not be reached".into()));
        let llm = Llm::new("agent", scripted.clone(), fast_retry(5)).unwrap();
        let err = llm.complete(CompletionRequest::default()).await.unwrap_err();
        assert!(matches!(err, LlmError::Authentication(_)));
        // Only one attempt was consumed.
        assert_eq!(scripted.remaining_errors(), 1);
    }

    #[tokio::test]
    async fn usage_is_recorded_into_metrics() {
        let llm = Llm::new("agent", Arc::new(MockProvider::default()), fast_retry(1)).unwrap();
        llm.complete(CompletionRequest::default()).await.unwrap();
        llm.complete(CompletionRequest::default()).await.unwrap();
        assert_eq!(llm.metrics_snapshot().requests, 2);
    }

    #[test]
    fn short_context_window_is_rejected() {
        std::env::remove_var("ALLOW_SHORT_CONTEXT_WINDOWS");
        struct Tiny;
        #[async_trait]
        impl LlmProvider for Tiny {
            fn name(&self) -> &str {
                "tiny"
            }
            fn model_name(&self) -> &str {
                "tiny-2k"
            }
            fn context_window(&self) -> Option<u32> {
                Some(2048)
            }
            async fn complete(&self, _req: CompletionRequest) -> Result<Completion, LlmError> {
                Ok(Completion::message_only("x"))
            }
        }
        assert!(Llm::new("agent", Arc::new(Tiny), RetryPolicy::none()).is_err());
    }

    #[test]
    fn reset_metrics_detaches_the_handle() {
        let mut llm =
            Llm::new("agent", Arc::new(MockProvider::default()), RetryPolicy::none()).unwrap();
        let before = llm.metrics_handle();
        llm.reset_metrics();
        let after = llm.metrics_handle();
        assert!(!Arc::ptr_eq(&before, &after));
    }
}

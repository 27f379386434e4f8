//! Resilient upstream model client
//!
//! Wraps a [`ModelBackend`] with per-attempt timeouts, exponential backoff
//! with full jitter, an overall deadline, and a per-endpoint circuit breaker.

use std::sync::Arc;

use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};

use crate::config::Config;
use crate::decomposition::DecompositionError;

use super::backend::ModelBackend;
use super::circuit::CircuitBreaker;
use super::error::ModelError;
use super::retry::RetryPolicy;
use super::types::{Message, RawModelOutput};

/// Explicitly owned upstream client shared by the orchestrator
#[derive(Clone)]
pub struct ModelClient {
    backend: Arc<dyn ModelBackend>,
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for ModelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelClient")
            .field("endpoint", &self.backend.endpoint())
            .field("policy", &self.policy)
            .finish()
    }
}

impl ModelClient {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        policy: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            backend,
            policy,
            breaker,
        }
    }

    pub fn from_config(backend: Arc<dyn ModelBackend>, config: &Config) -> Self {
        Self::new(
            backend,
            RetryPolicy::from_config(&config.retry),
            Arc::new(CircuitBreaker::from_config(&config.circuit_breaker)),
        )
    }

    pub fn endpoint(&self) -> &str {
        self.backend.endpoint()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Call the upstream model, retrying transient failures
    ///
    /// Fails fast with `CircuitOpen` without contacting the upstream while
    /// the endpoint's circuit is open. Permanent upstream errors are
    /// surfaced immediately as `Upstream`. No attempt or backoff runs past
    /// `deadline`.
    pub async fn call(
        &self,
        messages: &[Message],
        deadline: Instant,
    ) -> Result<RawModelOutput, DecompositionError> {
        let endpoint = self.backend.endpoint();
        let permit = self
            .breaker
            .acquire(endpoint)
            .map_err(|retry_in| DecompositionError::CircuitOpen {
                endpoint: endpoint.to_string(),
                retry_in,
            })?;

        let outcome = self.call_with_retries(messages, deadline).await;

        // Only terminal failures count against the endpoint
        match &outcome {
            Ok(_) => permit.success(),
            Err(e) if e.is_terminal_upstream_failure() => permit.failure(),
            Err(_) => permit.release(),
        }
        outcome
    }

    async fn call_with_retries(
        &self,
        messages: &[Message],
        deadline: Instant,
    ) -> Result<RawModelOutput, DecompositionError> {
        let endpoint = self.backend.endpoint();
        let started = Instant::now();
        let mut backoff = self.policy.backoff();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DecompositionError::DeadlineExceeded(started.elapsed()));
            }

            let attempt = backoff.begin_attempt();
            let attempt_timeout = self.policy.attempt_timeout.min(remaining);
            debug!(endpoint = %endpoint, attempt, "Calling upstream model");

            let result = match timeout(attempt_timeout, self.backend.complete(messages)).await {
                Ok(result) => result,
                Err(_) => Err(ModelError::Timeout(attempt_timeout)),
            };

            let error = match result {
                Ok(raw) => return Ok(raw),
                Err(e) if e.is_transient() => e,
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Permanent upstream error");
                    return Err(DecompositionError::Upstream(e.to_string()));
                }
            };

            let Some(delay) = backoff.next_delay(error.retry_after()) else {
                warn!(
                    endpoint = %endpoint,
                    attempts = attempt,
                    error = %error,
                    "Upstream retries exhausted"
                );
                return Err(DecompositionError::UpstreamExhausted {
                    attempts: attempt,
                    last_error: error.to_string(),
                });
            };

            if Instant::now() + delay >= deadline {
                warn!(
                    endpoint = %endpoint,
                    attempts = attempt,
                    "Deadline leaves no room for another attempt"
                );
                return Err(DecompositionError::DeadlineExceeded(started.elapsed()));
            }

            warn!(
                attempt,
                wait_ms = delay.as_millis() as u64,
                error = %error,
                "Transient upstream error, retrying after backoff"
            );
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::llm::CircuitState;

    /// Backend that replays a script of outcomes, then repeats the last one
    struct ScriptedBackend {
        script: Mutex<VecDeque<Result<RawModelOutput, ModelError>>>,
        last: Result<RawModelOutput, ModelError>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<RawModelOutput, ModelError>>) -> Arc<Self> {
            let last = script
                .last()
                .cloned()
                .unwrap_or_else(|| Err(ModelError::Network("empty script".to_string())));
            Arc::new(Self {
                script: Mutex::new(script.into()),
                last,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        fn endpoint(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _messages: &[Message]) -> Result<RawModelOutput, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.last.clone())
        }
    }

    fn unavailable() -> Result<RawModelOutput, ModelError> {
        Err(ModelError::Server {
            status: 503,
            message: "unavailable".to_string(),
        })
    }

    fn client(backend: Arc<ScriptedBackend>, attempts: u32, threshold: u32) -> ModelClient {
        let policy = RetryPolicy::default().with_max_attempts(attempts);
        let breaker = Arc::new(CircuitBreaker::new(threshold, Duration::from_secs(30)));
        ModelClient::new(backend, policy, breaker)
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(600)
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt() {
        let backend = ScriptedBackend::new(vec![
            unavailable(),
            Err(ModelError::Timeout(Duration::from_secs(1))),
            Ok(RawModelOutput::text("done")),
        ]);
        let client = client(backend.clone(), 3, 5);

        let raw = client.call(&[Message::user("go")], far_deadline()).await.unwrap();
        assert_eq!(raw.content, "done");
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let backend = ScriptedBackend::new(vec![unavailable()]);
        let client = client(backend.clone(), 3, 5);

        let err = client.call(&[], far_deadline()).await.unwrap_err();
        assert!(matches!(err, DecompositionError::UpstreamExhausted { attempts: 3, .. }));
        assert_eq!(backend.calls(), 3);
        assert_eq!(client.circuit_breaker().consecutive_failures("scripted"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let backend = ScriptedBackend::new(vec![Err(ModelError::Unauthorized("bad key".to_string()))]);
        let client = client(backend.clone(), 3, 5);

        let err = client.call(&[], far_deadline()).await.unwrap_err();
        assert!(matches!(err, DecompositionError::Upstream(_)));
        assert_eq!(backend.calls(), 1);
        assert_eq!(client.circuit_breaker().consecutive_failures("scripted"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_and_fails_fast() {
        let backend = ScriptedBackend::new(vec![unavailable()]);
        let client = client(backend.clone(), 1, 5);

        for _ in 0..5 {
            let err = client.call(&[], far_deadline()).await.unwrap_err();
            assert!(matches!(err, DecompositionError::UpstreamExhausted { .. }));
        }
        assert_eq!(backend.calls(), 5);
        assert_eq!(client.circuit_breaker().state("scripted"), CircuitState::Open);

        let err = client.call(&[], far_deadline()).await.unwrap_err();
        assert!(matches!(err, DecompositionError::CircuitOpen { .. }));
        assert_eq!(backend.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_retries() {
        let backend = ScriptedBackend::new(vec![unavailable()]);
        let policy = RetryPolicy::default()
            .with_max_attempts(10)
            .without_jitter();
        let client = ModelClient::new(
            backend.clone(),
            policy,
            Arc::new(CircuitBreaker::new(5, Duration::from_secs(30))),
        );

        // 500ms + 1s backoffs fit, the 2s one does not
        let deadline = Instant::now() + Duration::from_millis(2_500);
        let err = client.call(&[], deadline).await.unwrap_err();
        assert!(matches!(err, DecompositionError::DeadlineExceeded(_)));
        assert_eq!(backend.calls(), 3);
        assert_eq!(client.circuit_breaker().consecutive_failures("scripted"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let backend = ScriptedBackend::new(vec![
            unavailable(),
            unavailable(),
            unavailable(),
            Ok(RawModelOutput::text("done")),
        ]);
        let client = client(backend.clone(), 3, 5);

        assert!(client.call(&[], far_deadline()).await.is_err());
        assert_eq!(client.circuit_breaker().consecutive_failures("scripted"), 1);

        client.call(&[], far_deadline()).await.unwrap();
        assert_eq!(client.circuit_breaker().consecutive_failures("scripted"), 0);
        assert_eq!(client.circuit_breaker().state("scripted"), CircuitState::Closed);
    }
}

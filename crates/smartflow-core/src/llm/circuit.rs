//! Per-endpoint circuit breaker
//!
//! Tracks consecutive terminal failures for each upstream endpoint. After
//! the configured threshold the circuit opens and calls fail fast until the
//! cooldown elapses; then a single trial call is let through (half-open).
//! The trial's outcome closes or re-opens the circuit.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;

/// Observable state of one endpoint's circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls fail fast until the cooldown elapses
    Open,
    /// One trial call is allowed through
    HalfOpen,
}

#[derive(Debug)]
struct EndpointCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl EndpointCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

/// Circuit breaker keyed by upstream endpoint
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    circuits: Mutex<HashMap<String, EndpointCircuit>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.failure_threshold, config.cooldown())
    }

    fn circuits(&self) -> MutexGuard<'_, HashMap<String, EndpointCircuit>> {
        self.circuits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask permission to contact the endpoint
    ///
    /// Returns the time left in the cooldown when the call must fail fast.
    pub fn acquire(&self, endpoint: &str) -> Result<CircuitPermit<'_>, Duration> {
        let mut circuits = self.circuits();
        let circuit = circuits
            .entry(endpoint.to_string())
            .or_insert_with(EndpointCircuit::new);

        let trial = match circuit.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let opened_at = circuit.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened_at.elapsed();
                if elapsed < self.cooldown {
                    return Err(self.cooldown - elapsed);
                }
                info!(endpoint = %endpoint, "Circuit half-open, allowing trial call");
                circuit.state = CircuitState::HalfOpen;
                circuit.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if circuit.trial_in_flight {
                    return Err(Duration::ZERO);
                }
                circuit.trial_in_flight = true;
                true
            }
        };

        Ok(CircuitPermit {
            breaker: self,
            endpoint: endpoint.to_string(),
            trial,
            settled: false,
        })
    }

    /// Current state for an endpoint (closed if never seen)
    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.circuits()
            .get(endpoint)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn consecutive_failures(&self, endpoint: &str) -> u32 {
        self.circuits()
            .get(endpoint)
            .map(|c| c.consecutive_failures)
            .unwrap_or(0)
    }

    fn on_success(&self, endpoint: &str) {
        let mut circuits = self.circuits();
        if let Some(circuit) = circuits.get_mut(endpoint) {
            if circuit.state != CircuitState::Closed {
                info!(endpoint = %endpoint, "Circuit closed after successful trial");
            }
            *circuit = EndpointCircuit::new();
        }
    }

    fn on_failure(&self, endpoint: &str, trial: bool) {
        let mut circuits = self.circuits();
        let circuit = circuits
            .entry(endpoint.to_string())
            .or_insert_with(EndpointCircuit::new);

        circuit.consecutive_failures += 1;
        if trial {
            circuit.trial_in_flight = false;
        }

        let should_open = trial
            || (circuit.state == CircuitState::Closed
                && circuit.consecutive_failures >= self.failure_threshold);
        if should_open {
            warn!(
                endpoint = %endpoint,
                failures = circuit.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit opened"
            );
            circuit.state = CircuitState::Open;
            circuit.opened_at = Some(Instant::now());
        }
    }

    fn on_neutral(&self, endpoint: &str, trial: bool) {
        if !trial {
            return;
        }
        if let Some(circuit) = self.circuits().get_mut(endpoint) {
            circuit.trial_in_flight = false;
        }
    }
}

/// Permission to make one (possibly retried) upstream call
///
/// Dropping an unsettled permit releases a half-open trial slot without
/// recording an outcome.
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    endpoint: String,
    trial: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// The call succeeded; reset the failure count and close the circuit
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(&self.endpoint);
    }

    /// The call ended in a terminal upstream failure
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(&self.endpoint, self.trial);
    }

    /// The call ended without evidence about upstream health
    pub fn release(mut self) {
        self.settled = true;
        self.breaker.on_neutral(&self.endpoint, self.trial);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_neutral(&self.endpoint, self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EP: &str = "https://upstream.test/chat/completions";

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));

        for _ in 0..2 {
            breaker.acquire(EP).unwrap().failure();
        }
        assert_eq!(breaker.state(EP), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(EP), 2);

        breaker.acquire(EP).unwrap().failure();
        assert_eq!(breaker.state(EP), CircuitState::Open);

        let retry_in = breaker.acquire(EP).unwrap_err();
        assert_eq!(retry_in, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.acquire(EP).unwrap().failure();
        breaker.acquire(EP).unwrap().failure();
        breaker.acquire(EP).unwrap().success();
        assert_eq!(breaker.consecutive_failures(EP), 0);

        breaker.acquire(EP).unwrap().failure();
        assert_eq!(breaker.state(EP), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_single_trial() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.acquire(EP).unwrap().failure();
        assert!(breaker.acquire(EP).is_err());

        tokio::time::advance(Duration::from_secs(10)).await;

        let trial = breaker.acquire(EP).unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state(EP), CircuitState::HalfOpen);
        assert_eq!(breaker.acquire(EP).unwrap_err(), Duration::ZERO);

        trial.success();
        assert_eq!(breaker.state(EP), CircuitState::Closed);
        assert!(!breaker.acquire(EP).unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.acquire(EP).unwrap().failure();
        tokio::time::advance(Duration::from_secs(11)).await;

        breaker.acquire(EP).unwrap().failure();
        assert_eq!(breaker.state(EP), CircuitState::Open);
        assert_eq!(breaker.acquire(EP).unwrap_err(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_slot() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.acquire(EP).unwrap().failure();
        tokio::time::advance(Duration::from_secs(10)).await;

        drop(breaker.acquire(EP).unwrap());
        assert_eq!(breaker.state(EP), CircuitState::HalfOpen);
        assert!(breaker.acquire(EP).unwrap().is_trial());
    }

    #[test]
    fn test_endpoints_are_independent() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.acquire("a").unwrap().failure();
        assert_eq!(breaker.state("a"), CircuitState::Open);
        assert_eq!(breaker.state("b"), CircuitState::Closed);
        assert!(breaker.acquire("b").is_ok());
    }
}

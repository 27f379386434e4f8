//! Decomposition orchestrator - the engine's public entry point
//!
//! Sequences cache lookup, coalescing, prompt rendering, the upstream call,
//! validation, and cache population:
//!
//! ```text
//! caller -> cache hit? -> join or lead -> prompt -> model call -> validate -> cache put
//! ```
//!
//! The leader's work runs on its own task, so a caller that stops waiting
//! does not cancel work other callers are subscribed to.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cache::{CacheStats, DecompositionCache};
use super::coalescer::{Coalescer, LeaderHandle, Outcome, Role};
use super::error::{DecompositionError, ValidationError};
use super::prompt::{Prompt, PromptBuilder};
use super::request::{DecompositionRequest, Fingerprint};
use super::result::{DecompositionResult, ResultSource};
use super::validator::ResultValidator;
use crate::config::{Config, DecompositionConfig};
use crate::llm::{ModelBackend, ModelClient, RawModelOutput};

/// Times a caller re-enters after its leader was abandoned
const MAX_LEADER_RETRIES: u32 = 3;

/// Counters since the orchestrator was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Model calls made, strict re-requests included
    pub upstream_calls: u64,
    /// Callers that waited on another caller's flight
    pub coalesced_followers: u64,
    pub fallbacks: u64,
    pub cache: CacheStats,
}

#[derive(Debug, Default)]
struct Counters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    upstream_calls: AtomicU64,
    coalesced_followers: AtomicU64,
    fallbacks: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct Engine {
    cache: DecompositionCache,
    coalescer: Coalescer,
    model: ModelClient,
    prompts: PromptBuilder,
    validator: ResultValidator,
    settings: DecompositionConfig,
    counters: Counters,
}

/// Turns task descriptions into validated decompositions
///
/// Cheap to clone; clones share the same cache, in-flight registry, and
/// upstream client.
#[derive(Debug, Clone)]
pub struct DecompositionOrchestrator {
    engine: Arc<Engine>,
}

impl DecompositionOrchestrator {
    /// Create an orchestrator around an explicitly constructed model client
    pub fn new(model: ModelClient, config: &Config) -> Self {
        Self {
            engine: Arc::new(Engine {
                cache: DecompositionCache::from_config(&config.cache),
                coalescer: Coalescer::new(),
                model,
                prompts: PromptBuilder::new(),
                validator: ResultValidator::from_config(&config.decomposition),
                settings: config.decomposition.clone(),
                counters: Counters::default(),
            }),
        }
    }

    /// Create an orchestrator whose retry and breaker settings come from `config`
    pub fn with_backend(backend: Arc<dyn ModelBackend>, config: &Config) -> Self {
        Self::new(ModelClient::from_config(backend, config), config)
    }

    /// Decompose a task
    ///
    /// Invalid input is rejected before any upstream work. Concurrent calls
    /// for the same fingerprint share one upstream call and observe the same
    /// outcome.
    pub async fn decompose(&self, request: DecompositionRequest) -> Outcome {
        request.validate()?;
        let fingerprint = request.fingerprint();
        let request = Arc::new(request);
        let mut abandoned = 0;

        loop {
            if let Some(hit) = self.cached(&fingerprint) {
                return Ok(hit);
            }

            let outcome = match self.engine.coalescer.join_or_lead(&fingerprint) {
                Role::Leader(leader) => match leader.subscribe() {
                    Some(waiter) => {
                        let this = self.clone();
                        let request = Arc::clone(&request);
                        tokio::spawn(async move { this.lead(leader, &request).await });
                        waiter.wait().await
                    }
                    None => Err(DecompositionError::LeaderAbandoned),
                },
                Role::Follower(waiter) => {
                    Counters::bump(&self.engine.counters.coalesced_followers);
                    waiter.wait().await
                }
            };

            match outcome {
                Err(DecompositionError::LeaderAbandoned) if abandoned < MAX_LEADER_RETRIES => {
                    abandoned += 1;
                    debug!(fingerprint = %fingerprint.short(), abandoned, "Leader abandoned, re-entering");
                }
                outcome => return outcome,
            }
        }
    }

    fn cached(&self, fingerprint: &Fingerprint) -> Option<DecompositionResult> {
        let counters = &self.engine.counters;
        match self.engine.cache.get(fingerprint) {
            Some(result) => {
                Counters::bump(&counters.cache_hits);
                debug!(fingerprint = %fingerprint.short(), "Cache hit");
                Some(result.with_source(ResultSource::CacheHit))
            }
            None => {
                Counters::bump(&counters.cache_misses);
                None
            }
        }
    }

    async fn lead(&self, leader: LeaderHandle, request: &DecompositionRequest) {
        let fingerprint = leader.fingerprint().clone();

        // A previous leader may have published between our lookup and
        // winning leadership
        let outcome = match self.engine.cache.get(&fingerprint) {
            Some(hit) => Ok(hit.with_source(ResultSource::CacheHit)),
            None => self.compute(request, &fingerprint).await,
        };

        leader.publish(outcome);
    }

    async fn compute(&self, request: &DecompositionRequest, fingerprint: &Fingerprint) -> Outcome {
        let settings = &self.engine.settings;
        let started = Instant::now();
        let deadline = started + settings.request_deadline();

        match self.fetch(request, deadline).await {
            Ok(result) => {
                info!(
                    fingerprint = %fingerprint.short(),
                    subtasks = result.subtasks.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Decomposition complete"
                );
                self.engine.cache.put(
                    fingerprint.clone(),
                    result.clone(),
                    self.engine.cache.default_ttl(),
                );
                Ok(result)
            }
            Err(e) if e.allows_fallback() && settings.fallback_enabled => {
                warn!(
                    fingerprint = %fingerprint.short(),
                    error = %e,
                    code = e.code(),
                    "Decomposition failed, serving fallback"
                );
                Counters::bump(&self.engine.counters.fallbacks);
                Ok(DecompositionResult::fallback(
                    request,
                    settings.default_estimated_minutes,
                    settings.default_priority,
                ))
            }
            Err(e) => {
                warn!(
                    fingerprint = %fingerprint.short(),
                    error = %e,
                    code = e.code(),
                    "Decomposition failed"
                );
                Err(e)
            }
        }
    }

    /// Prompt, call, and validate, with one strict re-request on malformed output
    async fn fetch(
        &self,
        request: &DecompositionRequest,
        deadline: Instant,
    ) -> Result<DecompositionResult, DecompositionError> {
        let engine = &self.engine;
        let prompt = engine.prompts.build(request)?;
        let raw = self.call_upstream(&prompt, deadline).await?;

        let result = match engine.validator.validate(&raw, request.preferences()) {
            Ok(result) => result,
            Err(ValidationError::Malformed(reason)) if engine.settings.strict_reprompt => {
                debug!(%reason, "Malformed model output, re-requesting strict formatting");
                let strict = engine.prompts.build_strict(request, &raw.content)?;
                let raw = self.call_upstream(&strict, deadline).await?;
                engine.validator.validate(&raw, request.preferences())?
            }
            Err(e) => return Err(e.into()),
        };

        // Upstream output is fresh whatever source it claims
        Ok(DecompositionResult {
            source: ResultSource::Model,
            ..result
        })
    }

    async fn call_upstream(
        &self,
        prompt: &Prompt,
        deadline: Instant,
    ) -> Result<RawModelOutput, DecompositionError> {
        Counters::bump(&self.engine.counters.upstream_calls);
        self.engine.model.call(&prompt.messages(), deadline).await
    }

    /// Fingerprint under which a request is cached and coalesced
    pub fn fingerprint(&self, request: &DecompositionRequest) -> Fingerprint {
        request.fingerprint()
    }

    /// Drop the cached result for a fingerprint, e.g. after the task was edited
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let removed = self.engine.cache.invalidate(fingerprint);
        if removed {
            debug!(fingerprint = %fingerprint.short(), "Invalidated cached decomposition");
        }
        removed
    }

    pub fn invalidate_request(&self, request: &DecompositionRequest) -> bool {
        self.invalidate(&request.fingerprint())
    }

    pub fn stats(&self) -> OrchestratorStats {
        let counters = &self.engine.counters;
        OrchestratorStats {
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: counters.cache_misses.load(Ordering::Relaxed),
            upstream_calls: counters.upstream_calls.load(Ordering::Relaxed),
            coalesced_followers: counters.coalesced_followers.load(Ordering::Relaxed),
            fallbacks: counters.fallbacks.load(Ordering::Relaxed),
            cache: self.engine.cache.stats(),
        }
    }

    /// Fingerprints currently being computed
    pub fn in_flight(&self) -> usize {
        self.engine.coalescer.in_flight()
    }

    pub fn model_client(&self) -> &ModelClient {
        &self.engine.model
    }

    pub fn cache(&self) -> &DecompositionCache {
        &self.engine.cache
    }
}

//! Where engagement decisions come from.
//!
//! A [`DecisionSource`] turns an event plus subject context into an
//! [`AgentDecision`]. Remote sources are wrapped in [`Retrying`] so a slow or
//! failing dependency is bounded by a per-call timeout and a capped number of
//! jittered, exponentially spaced attempts. [`DecisionPipeline`] applies the
//! configured fail mode once retries are exhausted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engage_config::{Builtin, Config};
use engage_contracts::{AgentAction, AgentDecision, AgentDecisionRequest};
use engage_kernel::backoff_delay_ms;
use reqwest::Client;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::clock::Clock;

#[derive(Debug, Error)]
pub enum DecisionSourceError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decision source returned HTTP {0}")]
    Http(u16),
    #[error("decision source response violates contract: {0}")]
    Contract(String),
    #[error("decision source timed out after {0:?}")]
    Timeout(Duration),
}

impl DecisionSourceError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DecisionSourceError::Transport(_) | DecisionSourceError::Timeout(_) => true,
            DecisionSourceError::Http(status) => *status == 429 || *status >= 500,
            DecisionSourceError::Contract(_) => false,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            DecisionSourceError::Transport(_) => "decision_source_transport_error",
            DecisionSourceError::Http(_) => "decision_source_http_error",
            DecisionSourceError::Contract(_) => "decision_source_contract_invalid",
            DecisionSourceError::Timeout(_) => "decision_source_timeout",
        }
    }
}

#[async_trait]
pub trait DecisionSource: Send + Sync {
    async fn decide(
        &self,
        request: &AgentDecisionRequest,
    ) -> Result<AgentDecision, DecisionSourceError>;
}

/// Event-type lookup used when no remote source is configured.
pub struct BuiltinDecisionSource {
    cfg: Builtin,
    clock: Arc<dyn Clock>,
}

impl BuiltinDecisionSource {
    pub fn new(cfg: Builtin, clock: Arc<dyn Clock>) -> Self {
        Self { cfg, clock }
    }
}

#[async_trait]
impl DecisionSource for BuiltinDecisionSource {
    async fn decide(
        &self,
        request: &AgentDecisionRequest,
    ) -> Result<AgentDecision, DecisionSourceError> {
        let event_type = &request.event.event_type;
        let action = if self.cfg.message_event_types.iter().any(|t| t == event_type) {
            AgentAction::Message {
                body: self.cfg.message_body.clone(),
            }
        } else if self.cfg.task_event_types.iter().any(|t| t == event_type) {
            let delay = chrono::Duration::milliseconds(
                self.cfg.task_delay_ms.min(i64::MAX as u64) as i64,
            );
            AgentAction::Task {
                run_at: self.clock.now() + delay,
            }
        } else {
            AgentAction::None
        };
        Ok(AgentDecision {
            action,
            reason: Some("builtin".to_string()),
            score: None,
        })
    }
}

pub struct HttpDecisionSource {
    endpoint: String,
    client: Client,
}

impl HttpDecisionSource {
    pub fn new(endpoint: String) -> Result<Self, String> {
        let client = Client::builder().build().map_err(|e| e.to_string())?;
        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl DecisionSource for HttpDecisionSource {
    async fn decide(
        &self,
        request: &AgentDecisionRequest,
    ) -> Result<AgentDecision, DecisionSourceError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| DecisionSourceError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DecisionSourceError::Http(response.status().as_u16()));
        }
        response
            .json::<AgentDecision>()
            .await
            .map_err(|e| DecisionSourceError::Contract(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl RetryPolicy {
    pub fn from_config(cfg: &engage_config::DecisionSource) -> Self {
        Self {
            max_attempts: cfg.retry_max_attempts.max(1),
            attempt_timeout: Duration::from_millis(cfg.timeout_ms.max(1)),
            base_delay_ms: cfg.retry_base_delay_ms,
            max_delay_ms: cfg.retry_max_delay_ms,
            jitter_factor: cfg.jitter_factor,
        }
    }
}

/// Adds per-attempt timeouts and jittered exponential backoff to any source.
pub struct Retrying<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> Retrying<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<S: DecisionSource> DecisionSource for Retrying<S> {
    async fn decide(
        &self,
        request: &AgentDecisionRequest,
    ) -> Result<AgentDecision, DecisionSourceError> {
        let mut attempt = 0u32;
        loop {
            let result = match timeout(self.policy.attempt_timeout, self.inner.decide(request)).await
            {
                Ok(v) => v,
                Err(_) => Err(DecisionSourceError::Timeout(self.policy.attempt_timeout)),
            };
            match result {
                Ok(decision) => return Ok(decision),
                Err(err) if err.is_retryable() && attempt + 1 < self.policy.max_attempts => {
                    let delay_ms = backoff_delay_ms(
                        attempt,
                        self.policy.base_delay_ms,
                        self.policy.max_delay_ms,
                        self.policy.jitter_factor,
                        rand::random::<f64>(),
                    );
                    warn!(
                        attempt = attempt + 1,
                        delay_ms,
                        error = %err,
                        "decision source call failed; retrying"
                    );
                    if delay_ms > 0 {
                        sleep(Duration::from_millis(delay_ms)).await;
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Resolved decision plus the failure that forced a fallback, if any.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub decision: AgentDecision,
    pub fallback_reason: Option<&'static str>,
}

pub struct DecisionPipeline {
    primary: Arc<dyn DecisionSource>,
    fallback: Option<Arc<dyn DecisionSource>>,
}

impl DecisionPipeline {
    pub fn new(primary: Arc<dyn DecisionSource>, fallback: Option<Arc<dyn DecisionSource>>) -> Self {
        Self { primary, fallback }
    }

    pub fn from_config(cfg: &Config, clock: Arc<dyn Clock>) -> Result<Self, String> {
        let builtin: Arc<dyn DecisionSource> =
            Arc::new(BuiltinDecisionSource::new(cfg.builtin.clone(), clock));
        match cfg.decision_source.mode.as_str() {
            "http" => {
                let endpoint = cfg
                    .decision_source
                    .endpoint
                    .clone()
                    .filter(|v| !v.trim().is_empty())
                    .ok_or_else(|| "decision_source.endpoint is required for http mode".to_string())?;
                let primary = Retrying::new(
                    HttpDecisionSource::new(endpoint)?,
                    RetryPolicy::from_config(&cfg.decision_source),
                );
                let fallback = (cfg.decision_source.fail_mode == "builtin").then_some(builtin);
                Ok(Self::new(Arc::new(primary), fallback))
            }
            _ => Ok(Self::new(builtin, None)),
        }
    }

    pub async fn resolve(&self, request: &AgentDecisionRequest) -> Resolved {
        let err = match self.primary.decide(request).await {
            Ok(decision) => {
                return Resolved {
                    decision,
                    fallback_reason: None,
                }
            }
            Err(err) => err,
        };
        warn!(
            subject_id = %request.event.subject_id,
            event_id = %request.event.event_id,
            error = %err,
            "decision source unavailable; applying fail mode"
        );
        let reason = err.reason_code();
        if let Some(fallback) = &self.fallback {
            match fallback.decide(request).await {
                Ok(decision) => {
                    return Resolved {
                        decision,
                        fallback_reason: Some(reason),
                    }
                }
                Err(err) => warn!(error = %err, "fallback decision source failed"),
            }
        }
        Resolved {
            decision: AgentDecision {
                action: AgentAction::None,
                reason: Some(reason.to_string()),
                score: None,
            },
            fallback_reason: Some(reason),
        }
    }
}

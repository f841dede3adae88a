use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use engage_config::Config;
use engage_contracts::{
    contracts_manifest_v1, AgentAction, AgentDecisionRequest, BlockReason, BucketView,
    ConsumeRequest, ConsumeResponse, Decision, ErrorBody, ErrorResponse, EvaluateRequest,
    EventOutcome, InboundEvent, OutcomeStatus, SubjectContext, API_VERSION,
};
use engage_kernel::{jcs_sha256_hex, parse_rfc3339};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub mod audit;
pub mod bucket;
pub mod clock;
pub mod decision_source;
pub mod policy;
pub mod records;

pub use audit::{verify_audit_chain, AuditSummary, StatusCounts};
pub use clock::{Clock, FixedClock, SystemClock};

use audit::{AuditLog, AuditRecord, AuditStage, DecisionTrace};
use bucket::{BucketStore, MemoryBucketStore, SqliteBucketStore, StoreError};
use decision_source::DecisionPipeline;
use policy::{ConsumeOutcome, Policy};
use records::{Claim, EventKey, EventState, MemoryRecords, OutboxEntry, RecordStore, SqliteRecords};

/// How long a claim on an undecided event holds before another request may take it over.
const IN_FLIGHT_LEASE_SECS: i64 = 300;

/// Outcome reason when the bucket store fails while spending a token.
const CONSUME_ERROR_REASON: &str = "error";

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "engage listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    build_app_with_clock(cfg, Arc::new(SystemClock)).await
}

pub async fn build_app_with_clock(cfg: Config, clock: Arc<dyn Clock>) -> Result<Router, String> {
    let state = AppState::new(cfg, clock).await?;
    Ok(router(state))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/contracts", get(contracts))
        .route("/v1/evaluate", post(evaluate))
        .route("/v1/consume", post(consume))
        .route("/v1/events", post(events))
        .route("/v1/subjects/{subject_id}/context", put(put_subject_context))
        .route("/v1/subjects/{subject_id}/bucket", get(get_bucket))
        .route("/v1/subjects/{subject_id}/outbox", get(get_outbox))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("event {event_id} was already recorded with a different payload")]
    PayloadMismatch {
        event_id: String,
        existing_hash: String,
        incoming_hash: String,
    },
    #[error("event {event_id} is still being processed")]
    InFlight { event_id: String },
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, details) = match &self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error", None),
            ApiError::PayloadMismatch {
                existing_hash,
                incoming_hash,
                ..
            } => (
                StatusCode::CONFLICT,
                "conflict.payload_mismatch",
                Some(json!({
                    "existing_hash": existing_hash,
                    "incoming_hash": incoming_hash,
                })),
            ),
            ApiError::InFlight { .. } => (StatusCode::CONFLICT, "conflict.in_flight", None),
            ApiError::StoreUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", None)
            }
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None),
        };
        if status.is_server_error() {
            warn!(error = %self, code, "request failed");
        }
        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: self.to_string(),
                details,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
struct AppState {
    policy: Arc<Policy>,
    records: Arc<Mutex<RecordStore>>,
    decisions: Arc<DecisionPipeline>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl AppState {
    async fn new(cfg: Config, clock: Arc<dyn Clock>) -> Result<Self, String> {
        let (buckets, records): (Arc<dyn BucketStore>, RecordStore) = if cfg.store.kind == "sqlite"
        {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            (
                Arc::new(SqliteBucketStore::new(&sqlite_path).map_err(|e| e.to_string())?),
                RecordStore::Sqlite(SqliteRecords::new(&sqlite_path).map_err(|e| e.to_string())?),
            )
        } else {
            (
                Arc::new(MemoryBucketStore::default()),
                RecordStore::Memory(MemoryRecords::default()),
            )
        };
        Ok(Self {
            policy: Arc::new(Policy::from_config(&cfg, buckets, clock.clone())?),
            records: Arc::new(Mutex::new(records)),
            decisions: Arc::new(DecisionPipeline::from_config(&cfg, clock.clone())?),
            audit: Arc::new(AuditLog::open(&cfg.audit.jsonl_path).await?),
            clock,
        })
    }

    async fn load_context(&self, subject_id: &str) -> Result<SubjectContext, ApiError> {
        let records = self.records.lock().await;
        Ok(records.get_subject(subject_id)?.unwrap_or_default())
    }

    #[tracing::instrument(
        skip(self, event),
        fields(subject_id = %event.subject_id, event_id = %event.event_id, event_type = %event.event_type)
    )]
    async fn process_event(&self, event: InboundEvent) -> Result<EventOutcome, ApiError> {
        validate_event(&event)?;
        let now = self.clock.now();
        let key = EventKey::of(&event);
        let payload = serde_json::to_value(&event).map_err(|e| ApiError::Internal(e.to_string()))?;
        let incoming_hash = jcs_sha256_hex(&payload).map_err(ApiError::Internal)?;

        if let Some(outcome) = self.claim(&key, incoming_hash, now).await? {
            self.audit
                .append(AuditRecord::new(
                    &event.subject_id,
                    &event.event_id,
                    AuditStage::Replay,
                    outcome.status,
                    outcome.reason.as_deref().unwrap_or_default(),
                    now,
                ))
                .await;
            return Ok(outcome);
        }

        match self.decide(&key, event, now).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let mut records = self.records.lock().await;
                if let Err(mark_err) = records.mark_failed(&key) {
                    warn!(error = %mark_err, "could not mark event as failed");
                }
                Err(err)
            }
        }
    }

    /// Claims the event for this request. Returns the stored outcome when it was already decided.
    async fn claim(
        &self,
        key: &EventKey,
        incoming_hash: String,
        now: DateTime<Utc>,
    ) -> Result<Option<EventOutcome>, ApiError> {
        let mut records = self.records.lock().await;
        let existing = match records.claim_event(key, &incoming_hash, now)? {
            Claim::Claimed => return Ok(None),
            Claim::Existing(record) => record,
        };
        if existing.payload_hash != incoming_hash {
            return Err(ApiError::PayloadMismatch {
                event_id: key.event_id.clone(),
                existing_hash: existing.payload_hash,
                incoming_hash,
            });
        }
        match existing.state {
            EventState::Decided(outcome) => Ok(Some(outcome)),
            EventState::InFlight { claimed_at }
                if now - claimed_at < chrono::Duration::seconds(IN_FLIGHT_LEASE_SECS) =>
            {
                Err(ApiError::InFlight {
                    event_id: key.event_id.clone(),
                })
            }
            EventState::InFlight { claimed_at } => {
                warn!(%claimed_at, "taking over abandoned event claim");
                records.reclaim_event(key, now)?;
                Ok(None)
            }
            EventState::Failed => {
                records.reclaim_event(key, now)?;
                Ok(None)
            }
        }
    }

    async fn decide(
        &self,
        key: &EventKey,
        event: InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, ApiError> {
        let context = self.load_context(&event.subject_id).await?;
        let mut decision = self
            .policy
            .evaluate(&event.event_type, &context, &event.subject_id)
            .await;
        let mut trace = DecisionTrace {
            rate_limited: decision.details.rate_limited,
            quiet: decision.details.quiet,
            cap_exceeded: decision.details.cap_exceeded,
            tokens_available: decision.details.tokens_available,
            ..DecisionTrace::default()
        };

        if let Some(reason) = decision.reason.filter(|_| decision.blocked) {
            let outcome = blocked(&event, reason.as_str(), None, decision);
            return self.finish(key, outcome, AuditStage::Policy, trace, now).await;
        }

        let resolved = self
            .decisions
            .resolve(&AgentDecisionRequest {
                event: event.clone(),
                context,
            })
            .await;
        trace.action = Some(resolved.decision.action.name().to_string());
        trace.decision_source_fallback = resolved.fallback_reason.map(|v| v.to_string());
        let action = resolved.decision.action;

        if action.requires_quota() {
            match self.policy.consume(&event.subject_id).await {
                ConsumeOutcome::Consumed { tokens_remaining } => {
                    trace.consumed = Some(true);
                    decision.details.tokens_available = tokens_remaining;
                }
                ConsumeOutcome::VelocityLimit => {
                    trace.consumed = Some(false);
                    decision.blocked = true;
                    decision.reason = Some(BlockReason::VelocityLimit);
                    decision.details.cap_exceeded = true;
                    decision.details.tokens_available = 0;
                    let outcome = blocked(
                        &event,
                        BlockReason::VelocityLimit.as_str(),
                        Some(action),
                        decision,
                    );
                    return self.finish(key, outcome, AuditStage::Consume, trace, now).await;
                }
                ConsumeOutcome::Error(err) => {
                    warn!(error = %err, "token spend failed; blocking event");
                    trace.consumed = Some(false);
                    let outcome = blocked(&event, CONSUME_ERROR_REASON, Some(action), decision);
                    return self.finish(key, outcome, AuditStage::Consume, trace, now).await;
                }
            }
        }

        let status = match &action {
            AgentAction::None => OutcomeStatus::Skipped,
            AgentAction::Message { .. } | AgentAction::Task { .. } => {
                let mut records = self.records.lock().await;
                records.push_outbox(OutboxEntry {
                    subject_id: event.subject_id.clone(),
                    event_id: event.event_id.clone(),
                    action: action.clone(),
                    created_at: now,
                })?;
                if action.requires_quota() {
                    records.touch_last_engaged(&event.subject_id, now)?;
                }
                OutcomeStatus::Routed
            }
        };

        let reason = match status {
            OutcomeStatus::Skipped => Some(
                resolved
                    .decision
                    .reason
                    .unwrap_or_else(|| "no_action".to_string()),
            ),
            _ => None,
        };
        let outcome = EventOutcome {
            event_id: event.event_id,
            subject_id: event.subject_id,
            status,
            reason,
            action: Some(action),
            decision,
        };
        self.finish(key, outcome, AuditStage::Route, trace, now).await
    }

    async fn finish(
        &self,
        key: &EventKey,
        outcome: EventOutcome,
        stage: AuditStage,
        trace: DecisionTrace,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, ApiError> {
        {
            let mut records = self.records.lock().await;
            records.save_outcome(key, &outcome)?;
        }
        let reason_code = outcome
            .reason
            .clone()
            .or_else(|| outcome.action.as_ref().map(|a| a.name().to_string()))
            .unwrap_or_default();
        info!(
            status = outcome.status.as_str(),
            reason = %reason_code,
            "event processed"
        );
        self.audit
            .append(
                AuditRecord::new(
                    &outcome.subject_id,
                    &outcome.event_id,
                    stage,
                    outcome.status,
                    &reason_code,
                    now,
                )
                .with_trace(trace),
            )
            .await;
        Ok(outcome)
    }
}

fn blocked(
    event: &InboundEvent,
    reason: &str,
    action: Option<AgentAction>,
    decision: Decision,
) -> EventOutcome {
    EventOutcome {
        event_id: event.event_id.clone(),
        subject_id: event.subject_id.clone(),
        status: OutcomeStatus::Blocked,
        reason: Some(reason.to_string()),
        action,
        decision,
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn contracts() -> Json<Value> {
    let manifest = contracts_manifest_v1();
    let schemas: serde_json::Map<String, Value> = manifest
        .schemas
        .iter()
        .map(|s| (s.path.to_string(), Value::String(s.sha256.to_string())))
        .collect();
    Json(json!({
        "api_version": API_VERSION,
        "contracts_set_sha256": manifest.contracts_set_sha256,
        "generated_at": manifest.generated_at,
        "schemas": schemas,
        "actions": ["message", "task", "none"],
        "quota_gated_actions": ["message"],
        "block_reasons": ["rate_limit", "quiet_hours", "velocity_limit"],
    }))
}

async fn evaluate(
    State(state): State<AppState>,
    Json(input): Json<EvaluateRequest>,
) -> Result<Json<Decision>, ApiError> {
    require_non_empty(&[
        ("subject_id", &input.subject_id),
        ("event_type", &input.event_type),
    ])?;
    let context = match input.context {
        Some(ctx) => {
            validate_context(&ctx)?;
            ctx
        }
        None => state.load_context(&input.subject_id).await?,
    };
    Ok(Json(
        state
            .policy
            .evaluate(&input.event_type, &context, &input.subject_id)
            .await,
    ))
}

async fn consume(
    State(state): State<AppState>,
    Json(input): Json<ConsumeRequest>,
) -> Result<Json<ConsumeResponse>, ApiError> {
    require_non_empty(&[("subject_id", &input.subject_id)])?;
    let outcome = state.policy.consume(&input.subject_id).await;
    Ok(Json(outcome.to_response()))
}

async fn events(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> Result<Json<EventOutcome>, ApiError> {
    state.process_event(event).await.map(Json)
}

async fn put_subject_context(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
    Json(context): Json<SubjectContext>,
) -> Result<Json<SubjectContext>, ApiError> {
    require_non_empty(&[("subject_id", &subject_id)])?;
    validate_context(&context)?;
    let now = state.clock.now();
    let mut records = state.records.lock().await;
    records.save_subject(&subject_id, &context, now)?;
    Ok(Json(context))
}

async fn get_bucket(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> Result<Json<BucketView>, ApiError> {
    Ok(Json(state.policy.bucket_view(&subject_id).await?))
}

async fn get_outbox(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> Result<Json<Vec<OutboxEntry>>, ApiError> {
    let records = state.records.lock().await;
    Ok(Json(records.outbox_for(&subject_id)?))
}

fn require_non_empty(fields: &[(&str, &String)]) -> Result<(), ApiError> {
    for (name, value) in fields {
        if value.trim().is_empty() {
            return Err(ApiError::Validation(format!("{name} is required")));
        }
    }
    Ok(())
}

fn validate_event(e: &InboundEvent) -> Result<(), ApiError> {
    require_non_empty(&[
        ("event_id", &e.event_id),
        ("subject_id", &e.subject_id),
        ("event_type", &e.event_type),
    ])?;
    if parse_rfc3339(&e.occurred_at).is_none() {
        return Err(ApiError::Validation(
            "occurred_at must be RFC3339".to_string(),
        ));
    }
    Ok(())
}

fn validate_context(ctx: &SubjectContext) -> Result<(), ApiError> {
    let prefs = &ctx.preferences;
    if prefs.quiet_hours_start.is_some_and(|h| h > 23) || prefs.quiet_hours_end.is_some_and(|h| h > 23)
    {
        return Err(ApiError::Validation(
            "preferences.quiet_hours_* must be within 0..=23".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::bucket::{RateBucket, Versioned};
    use crate::decision_source::{DecisionSource, DecisionSourceError};
    use engage_contracts::{AgentDecision, SubjectPreferences};
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio::sync::Notify;

    fn event() -> InboundEvent {
        InboundEvent {
            event_id: "evt-1".to_string(),
            subject_id: "u1".to_string(),
            event_type: "drop_nearby".to_string(),
            occurred_at: "2025-10-19T10:00:00Z".to_string(),
            attributes: Default::default(),
        }
    }

    fn midday() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(
            parse_rfc3339("2025-10-19T12:00:00Z").unwrap(),
        ))
    }

    fn temp_audit() -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("engage-lib-audit-{nanos}.jsonl"))
            .to_string_lossy()
            .to_string()
    }

    async fn state_with(
        buckets: Arc<dyn BucketStore>,
        decisions: DecisionPipeline,
        clock: Arc<FixedClock>,
    ) -> AppState {
        let cfg = Config::default();
        AppState {
            policy: Arc::new(Policy::from_config(&cfg, buckets, clock.clone()).unwrap()),
            records: Arc::new(Mutex::new(RecordStore::Memory(MemoryRecords::default()))),
            decisions: Arc::new(decisions),
            audit: Arc::new(AuditLog::open(&temp_audit()).await.unwrap()),
            clock,
        }
    }

    async fn builtin_state(clock: Arc<FixedClock>) -> AppState {
        let decisions = DecisionPipeline::from_config(&Config::default(), clock.clone()).unwrap();
        state_with(Arc::new(MemoryBucketStore::default()), decisions, clock).await
    }

    /// Reads succeed and report no bucket; every write fails.
    struct ReadOnlyBuckets;

    #[async_trait]
    impl BucketStore for ReadOnlyBuckets {
        async fn get_versioned(&self, _: &str) -> Result<Option<Versioned>, StoreError> {
            Ok(None)
        }

        async fn compare_and_swap(
            &self,
            _: &str,
            _: Option<u64>,
            _: RateBucket,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Backend("disk full".to_string()))
        }
    }

    /// Signals `entered` on each call, then holds until `release` fires.
    struct GatedSource {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl DecisionSource for GatedSource {
        async fn decide(
            &self,
            _: &AgentDecisionRequest,
        ) -> Result<AgentDecision, DecisionSourceError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(AgentDecision {
                action: AgentAction::Message {
                    body: "hello".to_string(),
                },
                reason: None,
                score: None,
            })
        }
    }

    async fn gated_state() -> (AppState, Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let source = GatedSource {
            entered: entered.clone(),
            release: release.clone(),
        };
        let state = state_with(
            Arc::new(MemoryBucketStore::default()),
            DecisionPipeline::new(Arc::new(source), None),
            midday(),
        )
        .await;
        (state, entered, release)
    }

    #[test]
    fn validate_event_requires_ids_and_rfc3339() {
        assert!(validate_event(&event()).is_ok());

        let mut missing = event();
        missing.subject_id = " ".to_string();
        assert!(matches!(validate_event(&missing), Err(ApiError::Validation(_))));

        let mut bad_ts = event();
        bad_ts.occurred_at = "yesterday".to_string();
        assert!(matches!(validate_event(&bad_ts), Err(ApiError::Validation(_))));
    }

    #[test]
    fn validate_context_rejects_out_of_range_hours() {
        let ctx = SubjectContext {
            preferences: SubjectPreferences {
                quiet_hours_start: Some(24),
                quiet_hours_end: Some(6),
            },
            ..SubjectContext::default()
        };
        assert!(validate_context(&ctx).is_err());
        assert!(validate_context(&SubjectContext::default()).is_ok());
    }

    #[tokio::test]
    async fn consume_store_failure_blocks_event_with_error_reason() {
        let clock = midday();
        let decisions = DecisionPipeline::from_config(&Config::default(), clock.clone()).unwrap();
        let state = state_with(Arc::new(ReadOnlyBuckets), decisions, clock).await;

        let outcome = state.process_event(event()).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Blocked);
        assert_eq!(outcome.reason.as_deref(), Some("error"));
        assert!(matches!(outcome.action, Some(AgentAction::Message { .. })));

        let records = state.records.lock().await;
        assert!(records.outbox_for("u1").unwrap().is_empty());
        assert!(records.get_subject("u1").unwrap().is_none());
        let stored = records.get_event(&EventKey::of(&event())).unwrap().unwrap();
        assert_eq!(stored.state, EventState::Decided(outcome));
    }

    #[tokio::test]
    async fn duplicate_of_in_flight_event_is_rejected_without_spending() {
        let (state, entered, release) = gated_state().await;
        let first = tokio::spawn({
            let state = state.clone();
            async move { state.process_event(event()).await }
        });
        entered.notified().await;

        let duplicate = state.process_event(event()).await;
        assert!(matches!(duplicate, Err(ApiError::InFlight { .. })));

        release.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Routed);

        assert_eq!(state.policy.bucket_view("u1").await.unwrap().tokens, 4);
        assert_eq!(state.records.lock().await.outbox_for("u1").unwrap().len(), 1);
        assert_eq!(state.process_event(event()).await.unwrap(), outcome);
    }

    #[tokio::test]
    async fn context_written_mid_flight_survives_engagement_update() {
        let (state, entered, release) = gated_state().await;
        let first = tokio::spawn({
            let state = state.clone();
            async move { state.process_event(event()).await }
        });
        entered.notified().await;

        let updated = SubjectContext {
            time_zone: Some("Asia/Tokyo".to_string()),
            preferences: SubjectPreferences {
                quiet_hours_start: Some(1),
                quiet_hours_end: Some(5),
            },
            ..SubjectContext::default()
        };
        state
            .records
            .lock()
            .await
            .save_subject("u1", &updated, state.clock.now())
            .unwrap();

        release.notify_one();
        first.await.unwrap().unwrap();

        let stored = state.records.lock().await.get_subject("u1").unwrap().unwrap();
        assert_eq!(stored.time_zone.as_deref(), Some("Asia/Tokyo"));
        assert_eq!(stored.preferences, updated.preferences);
        assert_eq!(stored.last_engaged_at, Some(state.clock.now()));
    }

    #[tokio::test]
    async fn failed_claim_is_retried_by_next_delivery() {
        let clock = midday();
        let state = builtin_state(clock.clone()).await;
        let key = EventKey::of(&event());
        let hash = jcs_sha256_hex(&serde_json::to_value(event()).unwrap()).unwrap();
        {
            let mut records = state.records.lock().await;
            records.claim_event(&key, &hash, clock.now()).unwrap();
            records.mark_failed(&key).unwrap();
        }

        let outcome = state.process_event(event()).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Routed);
    }

    #[tokio::test]
    async fn abandoned_claim_is_taken_over_after_lease() {
        let clock = midday();
        let state = builtin_state(clock.clone()).await;
        let key = EventKey::of(&event());
        let hash = jcs_sha256_hex(&serde_json::to_value(event()).unwrap()).unwrap();
        state
            .records
            .lock()
            .await
            .claim_event(&key, &hash, clock.now())
            .unwrap();

        assert!(matches!(
            state.process_event(event()).await,
            Err(ApiError::InFlight { .. })
        ));

        clock.advance(chrono::Duration::seconds(IN_FLIGHT_LEASE_SECS));
        let outcome = state.process_event(event()).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Routed);
    }

    #[tokio::test]
    async fn colliding_joined_ids_are_distinct_events() {
        let state = builtin_state(midday()).await;
        let mut left = event();
        left.subject_id = "a:b".to_string();
        left.event_id = "c".to_string();
        let mut right = event();
        right.subject_id = "a".to_string();
        right.event_id = "b:c".to_string();

        assert_eq!(
            state.process_event(left).await.unwrap().status,
            OutcomeStatus::Routed
        );
        assert_eq!(
            state.process_event(right).await.unwrap().status,
            OutcomeStatus::Routed
        );
    }
}

use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use engage_config::Config;
use engage_contracts::{
    BucketView, ConsumeFailure, ConsumeResponse, Decision, PolicyConfig, SubjectContext,
};
use engage_kernel::{
    combine_rules, is_quiet_hours, parse_time_zone, recently_engaged, refill, BucketParams,
    RuleInputs,
};
use tracing::{debug, warn};

use crate::bucket::{run_transaction, BucketStore, RateBucket, StoreError, TxnStep};
use crate::clock::Clock;

#[derive(Debug)]
pub enum ConsumeOutcome {
    Consumed { tokens_remaining: u32 },
    VelocityLimit,
    Error(StoreError),
}

impl ConsumeOutcome {
    pub fn to_response(&self) -> ConsumeResponse {
        match self {
            ConsumeOutcome::Consumed { tokens_remaining } => ConsumeResponse {
                ok: true,
                reason: None,
                tokens_remaining: Some(*tokens_remaining),
            },
            ConsumeOutcome::VelocityLimit => ConsumeResponse {
                ok: false,
                reason: Some(ConsumeFailure::VelocityLimit),
                tokens_remaining: None,
            },
            ConsumeOutcome::Error(_) => ConsumeResponse {
                ok: false,
                reason: Some(ConsumeFailure::Error),
                tokens_remaining: None,
            },
        }
    }
}

/// Token bucket, quiet hours and recency rules over a shared bucket store.
pub struct Policy {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    params: BucketParams,
    quiet_start: u8,
    quiet_end: u8,
    time_zone: Tz,
    cooldown_ms: u64,
    max_attempts: usize,
}

impl Policy {
    pub fn from_config(
        cfg: &Config,
        store: Arc<dyn BucketStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, String> {
        let time_zone = parse_time_zone(&cfg.quiet_hours.time_zone)
            .ok_or_else(|| format!("unknown time zone {}", cfg.quiet_hours.time_zone))?;
        if cfg.bucket.refill_interval_ms == 0 {
            return Err("bucket.refill_interval_ms must be >= 1".to_string());
        }
        Ok(Self {
            store,
            clock,
            params: BucketParams {
                capacity: cfg.bucket.capacity,
                refill_interval_ms: cfg.bucket.refill_interval_ms,
                refill_tokens: cfg.bucket.refill_tokens,
            },
            quiet_start: cfg.quiet_hours.start,
            quiet_end: cfg.quiet_hours.end,
            time_zone,
            cooldown_ms: cfg.recency.cooldown_ms,
            max_attempts: cfg.transaction.max_attempts,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.params.capacity
    }

    /// Read-only decision for one event. Never writes the bucket.
    pub async fn evaluate(
        &self,
        event_type: &str,
        context: &SubjectContext,
        subject_id: &str,
    ) -> Decision {
        let now = self.clock.now();
        let (tz, tz_name) = self.subject_time_zone(context, subject_id);
        let start = context
            .preferences
            .quiet_hours_start
            .unwrap_or(self.quiet_start);
        let end = context.preferences.quiet_hours_end.unwrap_or(self.quiet_end);

        let rate_limited = recently_engaged(context.last_engaged_at, now, self.cooldown_ms);
        let quiet = is_quiet_hours(tz, start, end, now);
        let tokens_available = match self.store.get(subject_id).await {
            Ok(bucket) => self.refilled(bucket.as_ref(), now).tokens,
            Err(err) => {
                warn!(subject_id, error = %err, "bucket read failed; treating bucket as full");
                self.params.capacity
            }
        };

        let decision = combine_rules(
            RuleInputs {
                rate_limited,
                quiet,
                tokens_available,
            },
            PolicyConfig {
                capacity: self.params.capacity,
                refill_interval_ms: self.params.refill_interval_ms,
                refill_tokens: self.params.refill_tokens,
                quiet_hours_start: start,
                quiet_hours_end: end,
                time_zone: tz_name,
                cooldown_ms: self.cooldown_ms,
            },
        );
        debug!(
            subject_id,
            event_type,
            blocked = decision.blocked,
            reason = decision.reason.map(|r| r.as_str()),
            tokens_available,
            "policy evaluated"
        );
        decision
    }

    /// Spends one token for `subject_id`, atomically with respect to other consumers.
    pub async fn consume(&self, subject_id: &str) -> ConsumeOutcome {
        let now = self.clock.now();
        let params = self.params;
        let result = run_transaction(self.store.as_ref(), subject_id, self.max_attempts, |current| {
            let (stored, last_ms, extra) = match current {
                Some(b) => (Some(b.tokens), b.last_refill_at.timestamp_millis(), b.extra.clone()),
                None => (None, now.timestamp_millis(), Default::default()),
            };
            let r = refill(stored, last_ms, now.timestamp_millis(), params);
            if r.tokens < 1 {
                return TxnStep::Abort(None);
            }
            let last_refill_at = DateTime::from_timestamp_millis(r.new_last_ms).unwrap_or(now);
            let remaining = r.tokens - 1;
            TxnStep::Commit(
                RateBucket {
                    tokens: remaining,
                    last_refill_at,
                    extra,
                },
                Some(remaining),
            )
        })
        .await;

        match result {
            Ok(Some(tokens_remaining)) => {
                debug!(subject_id, tokens_remaining, "token consumed");
                ConsumeOutcome::Consumed { tokens_remaining }
            }
            Ok(None) => {
                debug!(subject_id, "bucket empty");
                ConsumeOutcome::VelocityLimit
            }
            Err(err) => {
                warn!(subject_id, error = %err, "token consumption failed");
                ConsumeOutcome::Error(err)
            }
        }
    }

    pub async fn bucket_view(&self, subject_id: &str) -> Result<BucketView, StoreError> {
        let now = self.clock.now();
        let bucket = self.store.get(subject_id).await?;
        let r = self.refilled(bucket.as_ref(), now);
        Ok(BucketView {
            subject_id: subject_id.to_string(),
            tokens: r.tokens,
            last_refill_at: bucket
                .as_ref()
                .and_then(|_| DateTime::from_timestamp_millis(r.new_last_ms)),
            capacity: self.params.capacity,
        })
    }

    fn refilled(&self, bucket: Option<&RateBucket>, now: DateTime<Utc>) -> engage_kernel::Refill {
        let (stored, last_ms) = match bucket {
            Some(b) => (Some(b.tokens), b.last_refill_at.timestamp_millis()),
            None => (None, 0),
        };
        refill(stored, last_ms, now.timestamp_millis(), self.params)
    }

    fn subject_time_zone(&self, context: &SubjectContext, subject_id: &str) -> (Tz, String) {
        match context.time_zone.as_deref() {
            Some(name) => match parse_time_zone(name) {
                Some(tz) => (tz, tz.name().to_string()),
                None => {
                    warn!(subject_id, time_zone = name, "unknown subject time zone; using default");
                    (self.time_zone, self.time_zone.name().to_string())
                }
            },
            None => (self.time_zone, self.time_zone.name().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{MemoryBucketStore, Versioned};
    use crate::clock::FixedClock;
    use async_trait::async_trait;
    use engage_contracts::{BlockReason, SubjectPreferences};
    use engage_kernel::parse_rfc3339;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    fn at(ts: &str) -> DateTime<Utc> {
        parse_rfc3339(ts).unwrap()
    }

    fn config() -> Config {
        let mut cfg = Config::default();
        cfg.bucket.capacity = 5;
        cfg.bucket.refill_interval_ms = 60_000;
        cfg.bucket.refill_tokens = 1;
        cfg
    }

    fn policy_with(
        cfg: &Config,
        store: Arc<dyn BucketStore>,
        now: &str,
    ) -> (Policy, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(at(now)));
        let policy = Policy::from_config(cfg, store, clock.clone()).unwrap();
        (policy, clock)
    }

    async fn seed(store: &dyn BucketStore, subject_id: &str, tokens: u32, last: &str) {
        assert!(store
            .compare_and_swap(subject_id, None, RateBucket::new(tokens, at(last)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn consume_creates_bucket_lazily_and_decrements() {
        let store = Arc::new(MemoryBucketStore::default());
        let (policy, _) = policy_with(&config(), store.clone(), "2025-10-19T12:00:00Z");

        match policy.consume("u1").await {
            ConsumeOutcome::Consumed { tokens_remaining } => assert_eq!(tokens_remaining, 4),
            other => panic!("unexpected outcome {other:?}"),
        }
        let bucket = store.get("u1").await.unwrap().unwrap();
        assert_eq!(bucket.tokens, 4);
        assert_eq!(bucket.last_refill_at, at("2025-10-19T12:00:00Z"));
    }

    #[tokio::test]
    async fn consume_at_zero_is_velocity_limit_without_write() {
        let store = Arc::new(MemoryBucketStore::default());
        seed(store.as_ref(), "u1", 0, "2025-10-19T12:00:00Z").await;
        let (policy, _) = policy_with(&config(), store.clone(), "2025-10-19T12:00:30Z");

        for _ in 0..3 {
            assert!(matches!(
                policy.consume("u1").await,
                ConsumeOutcome::VelocityLimit
            ));
        }
        let stored = store.get_versioned("u1").await.unwrap().unwrap();
        assert_eq!(stored.bucket.tokens, 0);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn consume_applies_refill_and_advances_in_whole_intervals() {
        let store = Arc::new(MemoryBucketStore::default());
        seed(store.as_ref(), "u1", 0, "2025-10-19T12:00:00Z").await;
        let (policy, _) = policy_with(&config(), store.clone(), "2025-10-19T12:02:30Z");

        assert!(matches!(
            policy.consume("u1").await,
            ConsumeOutcome::Consumed { tokens_remaining: 1 }
        ));
        let bucket = store.get("u1").await.unwrap().unwrap();
        assert_eq!(bucket.last_refill_at, at("2025-10-19T12:02:00Z"));
    }

    #[tokio::test]
    async fn consume_preserves_unrelated_fields() {
        let store = Arc::new(MemoryBucketStore::default());
        let mut bucket = RateBucket::new(2, at("2025-10-19T12:00:00Z"));
        bucket
            .extra
            .insert("plan".to_string(), Value::String("pro".to_string()));
        assert!(store.compare_and_swap("u1", None, bucket).await.unwrap());
        let (policy, _) = policy_with(&config(), store.clone(), "2025-10-19T12:00:10Z");

        assert!(matches!(
            policy.consume("u1").await,
            ConsumeOutcome::Consumed { tokens_remaining: 1 }
        ));
        let bucket = store.get("u1").await.unwrap().unwrap();
        assert_eq!(bucket.extra.get("plan"), Some(&Value::String("pro".to_string())));
    }

    #[tokio::test]
    async fn over_capacity_record_is_clamped_on_consume() {
        let store = Arc::new(MemoryBucketStore::default());
        seed(store.as_ref(), "u1", 40, "2025-10-19T12:00:00Z").await;
        let (policy, _) = policy_with(&config(), store.clone(), "2025-10-19T12:00:00Z");

        assert!(matches!(
            policy.consume("u1").await,
            ConsumeOutcome::Consumed { tokens_remaining: 4 }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_consumers_never_double_spend_the_last_token() {
        for round in 0..25 {
            let store = Arc::new(MemoryBucketStore::default());
            seed(store.as_ref(), "u1", 1, "2025-10-19T12:00:00Z").await;
            let (policy, _) = policy_with(&config(), store.clone(), "2025-10-19T12:00:01Z");
            let policy = Arc::new(policy);

            let a = tokio::spawn({
                let policy = policy.clone();
                async move { policy.consume("u1").await }
            });
            let b = tokio::spawn({
                let policy = policy.clone();
                async move { policy.consume("u1").await }
            });
            let outcomes = [a.await.unwrap(), b.await.unwrap()];
            let consumed = outcomes
                .iter()
                .filter(|o| matches!(o, ConsumeOutcome::Consumed { .. }))
                .count();
            let limited = outcomes
                .iter()
                .filter(|o| matches!(o, ConsumeOutcome::VelocityLimit))
                .count();
            assert_eq!((consumed, limited), (1, 1), "round {round}");
            assert_eq!(store.get("u1").await.unwrap().unwrap().tokens, 0);
        }
    }

    /// Makes the first two readers wait for each other so both see the same version.
    struct LockstepReads {
        inner: MemoryBucketStore,
        reads: AtomicUsize,
        barrier: Barrier,
    }

    #[async_trait]
    impl BucketStore for LockstepReads {
        async fn get_versioned(&self, subject_id: &str) -> Result<Option<Versioned>, StoreError> {
            let current = self.inner.get_versioned(subject_id).await;
            if self.reads.fetch_add(1, Ordering::SeqCst) < 2 {
                self.barrier.wait().await;
            }
            current
        }

        async fn compare_and_swap(
            &self,
            subject_id: &str,
            expected: Option<u64>,
            bucket: RateBucket,
        ) -> Result<bool, StoreError> {
            self.inner.compare_and_swap(subject_id, expected, bucket).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interleaved_reads_resolve_to_one_success() {
        let store = Arc::new(LockstepReads {
            inner: MemoryBucketStore::default(),
            reads: AtomicUsize::new(0),
            barrier: Barrier::new(2),
        });
        seed(&store.inner, "u1", 1, "2025-10-19T12:00:00Z").await;
        let (policy, _) = policy_with(&config(), store.clone(), "2025-10-19T12:00:01Z");
        let policy = Arc::new(policy);

        let a = tokio::spawn({
            let policy = policy.clone();
            async move { policy.consume("u1").await }
        });
        let b = tokio::spawn({
            let policy = policy.clone();
            async move { policy.consume("u1").await }
        });
        let outcomes = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, ConsumeOutcome::Consumed { tokens_remaining: 0 }))
                .count(),
            1
        );
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, ConsumeOutcome::VelocityLimit))
                .count(),
            1
        );
        assert!(store.reads.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn evaluate_is_read_only_and_repeatable() {
        let store = Arc::new(MemoryBucketStore::default());
        seed(store.as_ref(), "u1", 2, "2025-10-19T12:00:00Z").await;
        let (policy, _) = policy_with(&config(), store.clone(), "2025-10-19T12:03:00Z");
        let ctx = SubjectContext::default();

        let first = policy.evaluate("drop_nearby", &ctx, "u1").await;
        let second = policy.evaluate("drop_nearby", &ctx, "u1").await;
        assert_eq!(first.details.tokens_available, 5);
        assert_eq!(first.details.tokens_available, second.details.tokens_available);
        let stored = store.get_versioned("u1").await.unwrap().unwrap();
        assert_eq!(stored.bucket.tokens, 2);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn evaluate_prefers_rate_limit_over_quiet_hours() {
        let store = Arc::new(MemoryBucketStore::default());
        let (policy, _) = policy_with(&config(), store, "2025-10-19T23:00:00Z");
        let ctx = SubjectContext {
            last_engaged_at: Some(at("2025-10-19T22:50:00Z")),
            ..SubjectContext::default()
        };

        let decision = policy.evaluate("drop_nearby", &ctx, "u1").await;
        assert!(decision.blocked);
        assert!(decision.details.rate_limited);
        assert!(decision.details.quiet);
        assert_eq!(decision.reason, Some(BlockReason::RateLimit));
    }

    #[tokio::test]
    async fn evaluate_uses_subject_zone_and_window() {
        let store = Arc::new(MemoryBucketStore::default());
        // 06:00 UTC is 23:00 the previous evening in Los Angeles.
        let (policy, _) = policy_with(&config(), store, "2025-10-20T06:00:00Z");

        let la = SubjectContext {
            time_zone: Some("America/Los_Angeles".to_string()),
            ..SubjectContext::default()
        };
        let decision = policy.evaluate("drop_nearby", &la, "u1").await;
        assert_eq!(decision.reason, Some(BlockReason::QuietHours));
        assert_eq!(decision.details.config.time_zone, "America/Los_Angeles");

        let night_owl = SubjectContext {
            preferences: SubjectPreferences {
                quiet_hours_start: Some(2),
                quiet_hours_end: Some(4),
            },
            ..la
        };
        let decision = policy.evaluate("drop_nearby", &night_owl, "u1").await;
        assert!(!decision.blocked);
        assert_eq!(decision.details.config.quiet_hours_start, 2);
    }

    #[tokio::test]
    async fn evaluate_falls_back_to_default_zone_for_unknown_names() {
        let store = Arc::new(MemoryBucketStore::default());
        let (policy, _) = policy_with(&config(), store, "2025-10-19T10:00:00Z");
        let ctx = SubjectContext {
            time_zone: Some("Nowhere/Special".to_string()),
            ..SubjectContext::default()
        };
        let decision = policy.evaluate("drop_nearby", &ctx, "u1").await;
        assert_eq!(decision.details.config.time_zone, "UTC");
        assert!(!decision.blocked);
    }

    #[tokio::test]
    async fn evaluate_reports_velocity_limit_for_empty_bucket() {
        let store = Arc::new(MemoryBucketStore::default());
        seed(store.as_ref(), "u1", 0, "2025-10-19T12:00:00Z").await;
        let (policy, clock) = policy_with(&config(), store, "2025-10-19T12:00:30Z");

        let ctx = SubjectContext::default();
        let decision = policy.evaluate("drop_nearby", &ctx, "u1").await;
        assert_eq!(decision.reason, Some(BlockReason::VelocityLimit));

        clock.advance(chrono::Duration::seconds(30));
        let decision = policy.evaluate("drop_nearby", &ctx, "u1").await;
        assert!(!decision.blocked);
        assert_eq!(decision.details.tokens_available, 1);
    }

    struct Unreachable;

    #[async_trait]
    impl BucketStore for Unreachable {
        async fn get_versioned(&self, _: &str) -> Result<Option<Versioned>, StoreError> {
            Err(StoreError::Backend("connection refused".to_string()))
        }

        async fn compare_and_swap(
            &self,
            _: &str,
            _: Option<u64>,
            _: RateBucket,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Backend("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn store_failure_is_full_bucket_for_evaluate_but_error_for_consume() {
        let (policy, _) = policy_with(&config(), Arc::new(Unreachable), "2025-10-19T12:00:00Z");

        let decision = policy
            .evaluate("drop_nearby", &SubjectContext::default(), "u1")
            .await;
        assert!(!decision.blocked);
        assert_eq!(decision.details.tokens_available, 5);

        let outcome = policy.consume("u1").await;
        assert!(matches!(outcome, ConsumeOutcome::Error(StoreError::Backend(_))));
        assert_eq!(outcome.to_response().reason, Some(ConsumeFailure::Error));
    }
}

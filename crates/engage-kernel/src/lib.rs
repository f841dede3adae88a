use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use engage_contracts::{BlockReason, Decision, DecisionDetails, PolicyConfig};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

pub fn parse_time_zone(name: &str) -> Option<Tz> {
    name.trim().parse::<Tz>().ok()
}

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketParams {
    pub capacity: u32,
    /// Must be non-zero; config validation rejects zero before any bucket math runs.
    pub refill_interval_ms: u64,
    pub refill_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refill {
    pub tokens: u32,
    pub new_last_ms: i64,
    pub intervals: u64,
}

/// Lazily refills a bucket from its stored state.
///
/// Only whole intervals count, and the baseline advances by exactly the
/// intervals consumed so partial progress toward the next token is kept.
/// A `now_ms` earlier than `last_refill_at_ms` yields zero intervals.
/// A stored count above `capacity` is clamped before the refill is added.
pub fn refill(
    stored_tokens: Option<u32>,
    last_refill_at_ms: i64,
    now_ms: i64,
    params: BucketParams,
) -> Refill {
    let interval = params.refill_interval_ms.max(1);
    let elapsed = now_ms.saturating_sub(last_refill_at_ms).max(0) as u64;
    let intervals = elapsed / interval;

    let base = stored_tokens.unwrap_or(params.capacity).min(params.capacity) as u64;
    let added = intervals.saturating_mul(params.refill_tokens as u64);
    let tokens = base.saturating_add(added).min(params.capacity as u64) as u32;

    let new_last_ms = if intervals > 0 {
        // intervals * interval <= elapsed, so this never passes now_ms.
        last_refill_at_ms.saturating_add((intervals * interval) as i64)
    } else {
        last_refill_at_ms
    };

    Refill {
        tokens,
        new_last_ms,
        intervals,
    }
}

/// Whether `at`, localized to `tz`, falls in the `[start, end)` hour window.
///
/// `start > end` wraps past midnight. `start == end` is an empty window.
pub fn is_quiet_hours(tz: Tz, start: u8, end: u8, at: DateTime<Utc>) -> bool {
    let hour = at.with_timezone(&tz).hour();
    let (start, end) = (start as u32, end as u32);
    if start < end {
        hour >= start && hour < end
    } else if start > end {
        hour >= start || hour < end
    } else {
        false
    }
}

/// A subject that never engaged is treated as last engaged at the epoch.
pub fn recently_engaged(
    last_engaged_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown_ms: u64,
) -> bool {
    let last_ms = last_engaged_at.map(|v| v.timestamp_millis()).unwrap_or(0);
    let since = now.timestamp_millis().saturating_sub(last_ms);
    (since as i128) < cooldown_ms as i128
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleInputs {
    pub rate_limited: bool,
    pub quiet: bool,
    pub tokens_available: u32,
}

pub fn combine_rules(inputs: RuleInputs, config: PolicyConfig) -> Decision {
    let cap_exceeded = inputs.tokens_available < 1;
    let reason = if inputs.rate_limited {
        Some(BlockReason::RateLimit)
    } else if inputs.quiet {
        Some(BlockReason::QuietHours)
    } else if cap_exceeded {
        Some(BlockReason::VelocityLimit)
    } else {
        None
    };
    Decision {
        blocked: reason.is_some(),
        reason,
        details: DecisionDetails {
            rate_limited: inputs.rate_limited,
            quiet: inputs.quiet,
            cap_exceeded,
            tokens_available: inputs.tokens_available,
            config,
        },
    }
}

/// Exponential backoff for retry `attempt` (0-based) with symmetric jitter.
///
/// `random` is expected in `[0.0, 1.0)`; `0.5` yields the un-jittered delay.
pub fn backoff_delay_ms(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_delay_ms) as f64;
    let jitter = capped * jitter_factor.clamp(0.0, 1.0) * (random.clamp(0.0, 1.0) * 2.0 - 1.0);
    (capped + jitter).max(0.0).round() as u64
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

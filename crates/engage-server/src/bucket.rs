//! Rate-bucket persistence.
//!
//! Buckets live in the `rate_limiting` collection, one record per subject.
//! Reads are free; every write goes through [`run_transaction`], which does an
//! optimistic read-modify-write against the record version and retries on
//! conflict.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend failed: {0}")]
    Backend(String),
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
    #[error("transaction for {subject_id} gave up after {attempts} conflicting attempts")]
    Contention { subject_id: String, attempts: usize },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateBucket {
    pub tokens: u32,
    pub last_refill_at: DateTime<Utc>,
    /// Fields written by other tooling on the same record. Carried through every write.
    pub extra: Map<String, Value>,
}

impl RateBucket {
    pub fn new(tokens: u32, last_refill_at: DateTime<Utc>) -> Self {
        Self {
            tokens,
            last_refill_at,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub bucket: RateBucket,
    pub version: u64,
}

#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn get(&self, subject_id: &str) -> Result<Option<RateBucket>, StoreError> {
        Ok(self.get_versioned(subject_id).await?.map(|v| v.bucket))
    }

    async fn get_versioned(&self, subject_id: &str) -> Result<Option<Versioned>, StoreError>;

    /// Writes `bucket` only if the stored version still equals `expected`
    /// (`None` meaning the record must not exist yet). Returns `false` on conflict.
    async fn compare_and_swap(
        &self,
        subject_id: &str,
        expected: Option<u64>,
        bucket: RateBucket,
    ) -> Result<bool, StoreError>;
}

pub enum TxnStep<T> {
    Commit(RateBucket, T),
    Abort(T),
}

/// Runs `step` against the current record until its write lands without conflict.
///
/// `step` may run several times and must be free of side effects. An `Abort`
/// writes nothing.
pub async fn run_transaction<T, F>(
    store: &dyn BucketStore,
    subject_id: &str,
    max_attempts: usize,
    mut step: F,
) -> Result<T, StoreError>
where
    F: FnMut(Option<&RateBucket>) -> TxnStep<T>,
{
    let max_attempts = max_attempts.max(1);
    for attempt in 1..=max_attempts {
        let current = store.get_versioned(subject_id).await?;
        let expected = current.as_ref().map(|v| v.version);
        match step(current.as_ref().map(|v| &v.bucket)) {
            TxnStep::Abort(out) => return Ok(out),
            TxnStep::Commit(bucket, out) => {
                if store.compare_and_swap(subject_id, expected, bucket).await? {
                    return Ok(out);
                }
                debug!(subject_id, attempt, "bucket write conflicted; retrying");
            }
        }
    }
    Err(StoreError::Contention {
        subject_id: subject_id.to_string(),
        attempts: max_attempts,
    })
}

#[derive(Default)]
pub struct MemoryBucketStore {
    records: Mutex<HashMap<String, Versioned>>,
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn get_versioned(&self, subject_id: &str) -> Result<Option<Versioned>, StoreError> {
        Ok(self.records.lock().await.get(subject_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        subject_id: &str,
        expected: Option<u64>,
        bucket: RateBucket,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        let current = records.get(subject_id).map(|v| v.version);
        if current != expected {
            return Ok(false);
        }
        records.insert(
            subject_id.to_string(),
            Versioned {
                bucket,
                version: current.unwrap_or(0) + 1,
            },
        );
        Ok(true)
    }
}

pub struct SqliteBucketStore {
    conn: Mutex<Connection>,
}

impl SqliteBucketStore {
    pub fn new(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS rate_limiting (
                subject_id TEXT PRIMARY KEY,
                tokens INTEGER NOT NULL,
                last_refill_at_ms INTEGER NOT NULL,
                extra_json TEXT NOT NULL DEFAULT '{}',
                version INTEGER NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl BucketStore for SqliteBucketStore {
    async fn get_versioned(&self, subject_id: &str) -> Result<Option<Versioned>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT tokens, last_refill_at_ms, extra_json, version FROM rate_limiting WHERE subject_id = ?1",
                params![subject_id],
                |row| {
                    let tokens: i64 = row.get(0)?;
                    let last_refill_at_ms: i64 = row.get(1)?;
                    let extra_json: String = row.get(2)?;
                    let version: i64 = row.get(3)?;
                    Ok((tokens, last_refill_at_ms, extra_json, version))
                },
            )
            .optional()?;

        let Some((tokens, last_refill_at_ms, extra_json, version)) = row else {
            return Ok(None);
        };
        let last_refill_at = DateTime::from_timestamp_millis(last_refill_at_ms).ok_or_else(|| {
            StoreError::Corrupt(format!("last_refill_at_ms={last_refill_at_ms} out of range"))
        })?;
        let extra: Map<String, Value> = serde_json::from_str(&extra_json)
            .map_err(|e| StoreError::Corrupt(format!("extra_json: {e}")))?;
        Ok(Some(Versioned {
            bucket: RateBucket {
                tokens: tokens.clamp(0, u32::MAX as i64) as u32,
                last_refill_at,
                extra,
            },
            version: version as u64,
        }))
    }

    async fn compare_and_swap(
        &self,
        subject_id: &str,
        expected: Option<u64>,
        bucket: RateBucket,
    ) -> Result<bool, StoreError> {
        let extra_json = serde_json::to_string(&bucket.extra)
            .map_err(|e| StoreError::Corrupt(format!("extra_json: {e}")))?;
        let conn = self.conn.lock().await;
        let changed = match expected {
            None => conn.execute(
                "
                INSERT INTO rate_limiting (subject_id, tokens, last_refill_at_ms, extra_json, version)
                VALUES (?1, ?2, ?3, ?4, 1)
                ON CONFLICT(subject_id) DO NOTHING
                ",
                params![
                    subject_id,
                    bucket.tokens as i64,
                    bucket.last_refill_at.timestamp_millis(),
                    extra_json
                ],
            )?,
            Some(version) => conn.execute(
                "
                UPDATE rate_limiting
                SET tokens = ?2, last_refill_at_ms = ?3, extra_json = ?4, version = version + 1
                WHERE subject_id = ?1 AND version = ?5
                ",
                params![
                    subject_id,
                    bucket.tokens as i64,
                    bucket.last_refill_at.timestamp_millis(),
                    extra_json,
                    version as i64
                ],
            )?,
        };
        Ok(changed == 1)
    }
}

//! Append-only JSONL audit trail. Each record carries the hash of its
//! predecessor so tampering or truncation is detectable with
//! [`verify_audit_chain`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use engage_contracts::OutcomeStatus;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

pub struct AuditLog {
    file: Arc<Mutex<tokio::fs::File>>,
    last_hash: Arc<Mutex<Option<String>>>,
}

/// Orchestrator step that settled the event.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    Policy,
    Consume,
    Route,
    Replay,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct AuditRecord {
    pub audit_id: String,
    pub subject_id: String,
    pub event_id: String,
    pub stage: AuditStage,
    pub result: OutcomeStatus,
    pub reason_code: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<DecisionTrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DecisionTrace {
    pub rate_limited: bool,
    pub quiet: bool,
    pub cap_exceeded: bool,
    pub tokens_available: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_source_fallback: Option<String>,
}

impl AuditRecord {
    pub fn new(
        subject_id: &str,
        event_id: &str,
        stage: AuditStage,
        result: OutcomeStatus,
        reason_code: &str,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            subject_id: subject_id.to_string(),
            event_id: event_id.to_string(),
            stage,
            result,
            reason_code: reason_code.to_string(),
            ts,
            trace: None,
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    pub fn with_trace(mut self, trace: DecisionTrace) -> Self {
        self.trace = Some(trace);
        self
    }

    /// SHA-256 over the record serialized with an empty `record_hash`.
    fn digest(&self) -> Result<String, serde_json::Error> {
        let mut seed = self.clone();
        seed.record_hash.clear();
        let bytes = serde_json::to_vec(&seed)?;
        Ok(Sha256::digest(&bytes)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect())
    }
}

impl AuditLog {
    pub async fn open(path: &str) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines()
                .rev()
                .find_map(|line| serde_json::from_str::<AuditRecord>(line).ok())
                .map(|rec| rec.record_hash)
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| format!("open audit log {path}: {e}"))?;

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            last_hash: Arc::new(Mutex::new(last_hash)),
        })
    }

    /// Audit failures are logged and never fail the request that produced them.
    pub async fn append(&self, mut rec: AuditRecord) {
        let mut last_hash = self.last_hash.lock().await;
        rec.prev_hash = last_hash.clone();
        let line = rec.digest().and_then(|hash| {
            rec.record_hash = hash;
            serde_json::to_string(&rec)
        });
        let line = match line {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, audit_id = %rec.audit_id, "audit record serialization failed");
                return;
            }
        };
        let mut file = self.file.lock().await;
        let written = async {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;
        match written {
            Ok(()) => *last_hash = Some(rec.record_hash),
            Err(err) => warn!(error = %err, audit_id = %rec.audit_id, "audit append failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub routed: usize,
    pub blocked: usize,
    pub skipped: usize,
}

/// What a verified audit file says about the events it covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditSummary {
    pub records: usize,
    /// Replays of already decided events; not counted in `by_subject`.
    pub replays: usize,
    pub by_subject: BTreeMap<String, StatusCounts>,
}

/// Checks every link of the chain and tallies decided outcomes per subject.
///
/// Lines must parse as [`AuditRecord`], so unknown stages or results fail verification.
pub fn verify_audit_chain(path: &str) -> Result<AuditSummary, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut summary = AuditSummary::default();
    let mut expected_prev: Option<String> = None;

    for (line_no, line) in text.lines().enumerate().map(|(i, l)| (i + 1, l)) {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord =
            serde_json::from_str(line).map_err(|e| format!("line {line_no}: {e}"))?;
        if rec.prev_hash != expected_prev {
            return Err(format!(
                "line {line_no}: chain broken before audit {}",
                rec.audit_id
            ));
        }
        let digest = rec
            .digest()
            .map_err(|e| format!("line {line_no}: {e}"))?;
        if digest != rec.record_hash {
            return Err(format!("line {line_no}: record_hash does not match contents"));
        }

        summary.records += 1;
        if rec.stage == AuditStage::Replay {
            summary.replays += 1;
        } else {
            let counts = summary.by_subject.entry(rec.subject_id).or_default();
            match rec.result {
                OutcomeStatus::Routed => counts.routed += 1,
                OutcomeStatus::Blocked => counts.blocked += 1,
                OutcomeStatus::Skipped => counts.skipped += 1,
            }
        }
        expected_prev = Some(rec.record_hash);
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path() -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("engage-audit-test-{nanos}.jsonl"))
            .to_string_lossy()
            .to_string()
    }

    fn record(subject: &str, event: &str, stage: AuditStage, result: OutcomeStatus) -> AuditRecord {
        AuditRecord::new(subject, event, stage, result, "rate_limit", Utc::now())
    }

    #[tokio::test]
    async fn chain_verifies_and_survives_reopen() {
        let path = temp_path();
        let log = AuditLog::open(&path).await.unwrap();
        log.append(record("u1", "e1", AuditStage::Policy, OutcomeStatus::Blocked))
            .await;
        log.append(
            record("u1", "e2", AuditStage::Route, OutcomeStatus::Routed).with_trace(
                DecisionTrace {
                    tokens_available: 4,
                    action: Some("message".to_string()),
                    consumed: Some(true),
                    ..DecisionTrace::default()
                },
            ),
        )
        .await;
        drop(log);

        let reopened = AuditLog::open(&path).await.unwrap();
        reopened
            .append(record("u2", "e3", AuditStage::Route, OutcomeStatus::Skipped))
            .await;
        reopened
            .append(record("u1", "e2", AuditStage::Replay, OutcomeStatus::Routed))
            .await;

        let summary = verify_audit_chain(&path).unwrap();
        assert_eq!(summary.records, 4);
        assert_eq!(summary.replays, 1);
        assert_eq!(
            summary.by_subject["u1"],
            StatusCounts {
                routed: 1,
                blocked: 1,
                skipped: 0
            }
        );
        assert_eq!(summary.by_subject["u2"].skipped, 1);
    }

    #[tokio::test]
    async fn tampering_is_detected() {
        let path = temp_path();
        let log = AuditLog::open(&path).await.unwrap();
        log.append(record("u1", "e1", AuditStage::Policy, OutcomeStatus::Blocked))
            .await;
        log.append(record("u1", "e2", AuditStage::Policy, OutcomeStatus::Blocked))
            .await;

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replacen("rate_limit", "quiet_hours", 1)).unwrap();
        assert!(verify_audit_chain(&path)
            .unwrap_err()
            .contains("record_hash does not match"));
    }

    #[tokio::test]
    async fn unknown_results_and_dropped_lines_fail_verification() {
        let path = temp_path();
        let log = AuditLog::open(&path).await.unwrap();
        for event in ["e1", "e2", "e3"] {
            log.append(record("u1", event, AuditStage::Policy, OutcomeStatus::Blocked))
                .await;
        }
        let text = std::fs::read_to_string(&path).unwrap();

        let lines: Vec<&str> = text.lines().collect();
        std::fs::write(&path, format!("{}\n{}\n", lines[0], lines[2])).unwrap();
        assert!(verify_audit_chain(&path).unwrap_err().contains("chain broken"));

        std::fs::write(&path, text.replacen("\"blocked\"", "\"approved\"", 1)).unwrap();
        assert!(verify_audit_chain(&path).unwrap_err().starts_with("line 1:"));
    }
}

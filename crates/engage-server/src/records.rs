use std::collections::HashMap;

use chrono::{DateTime, Utc};
use engage_contracts::{AgentAction, EventOutcome, InboundEvent, SubjectContext};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::bucket::StoreError;

/// Event log key. Ids are kept apart rather than joined so no pair can collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub subject_id: String,
    pub event_id: String,
}

impl EventKey {
    pub fn new(subject_id: &str, event_id: &str) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            event_id: event_id.to_string(),
        }
    }

    pub fn of(event: &InboundEvent) -> Self {
        Self::new(&event.subject_id, &event.event_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventState {
    /// Claimed by a request that has not finished yet.
    InFlight { claimed_at: DateTime<Utc> },
    /// The claiming request errored before an outcome was stored.
    Failed,
    Decided(EventOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub payload_hash: String,
    pub state: EventState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    Claimed,
    Existing(EventRecord),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxEntry {
    pub subject_id: String,
    pub event_id: String,
    #[serde(flatten)]
    pub action: AgentAction,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryRecords {
    subjects: HashMap<String, SubjectContext>,
    events: HashMap<EventKey, EventRecord>,
    outbox: Vec<OutboxEntry>,
}

pub struct SqliteRecords {
    conn: Connection,
}

/// Subject contexts, the inbound event log and the outbound action queue.
pub enum RecordStore {
    Memory(MemoryRecords),
    Sqlite(SqliteRecords),
}

impl RecordStore {
    pub fn get_subject(&self, subject_id: &str) -> Result<Option<SubjectContext>, StoreError> {
        match self {
            RecordStore::Memory(store) => Ok(store.subjects.get(subject_id).cloned()),
            RecordStore::Sqlite(store) => store.get_subject(subject_id),
        }
    }

    pub fn save_subject(
        &mut self,
        subject_id: &str,
        context: &SubjectContext,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match self {
            RecordStore::Memory(store) => {
                store
                    .subjects
                    .insert(subject_id.to_string(), context.clone());
                Ok(())
            }
            RecordStore::Sqlite(store) => store.save_subject(subject_id, context, updated_at),
        }
    }

    /// Sets `last_engaged_at` on the stored context, leaving every other field as stored.
    pub fn touch_last_engaged(
        &mut self,
        subject_id: &str,
        at: DateTime<Utc>,
    ) -> Result<SubjectContext, StoreError> {
        let mut context = self.get_subject(subject_id)?.unwrap_or_default();
        context.last_engaged_at = Some(at);
        self.save_subject(subject_id, &context, at)?;
        Ok(context)
    }

    pub fn get_event(&self, key: &EventKey) -> Result<Option<EventRecord>, StoreError> {
        match self {
            RecordStore::Memory(store) => Ok(store.events.get(key).cloned()),
            RecordStore::Sqlite(store) => store.get_event(key),
        }
    }

    /// Inserts an in-flight record unless one exists. The existing record is returned untouched.
    pub fn claim_event(
        &mut self,
        key: &EventKey,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Claim, StoreError> {
        match self {
            RecordStore::Memory(store) => match store.events.get(key) {
                Some(existing) => Ok(Claim::Existing(existing.clone())),
                None => {
                    store.events.insert(
                        key.clone(),
                        EventRecord {
                            payload_hash: payload_hash.to_string(),
                            state: EventState::InFlight { claimed_at: now },
                        },
                    );
                    Ok(Claim::Claimed)
                }
            },
            RecordStore::Sqlite(store) => store.claim_event(key, payload_hash, now),
        }
    }

    /// Takes over a failed or abandoned record.
    pub fn reclaim_event(&mut self, key: &EventKey, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.set_state(key, EventState::InFlight { claimed_at: now })
    }

    pub fn mark_failed(&mut self, key: &EventKey) -> Result<(), StoreError> {
        self.set_state(key, EventState::Failed)
    }

    pub fn save_outcome(&mut self, key: &EventKey, outcome: &EventOutcome) -> Result<(), StoreError> {
        self.set_state(key, EventState::Decided(outcome.clone()))
    }

    fn set_state(&mut self, key: &EventKey, state: EventState) -> Result<(), StoreError> {
        match self {
            RecordStore::Memory(store) => {
                if let Some(record) = store.events.get_mut(key) {
                    record.state = state;
                }
                Ok(())
            }
            RecordStore::Sqlite(store) => store.set_state(key, &state),
        }
    }

    pub fn push_outbox(&mut self, entry: OutboxEntry) -> Result<(), StoreError> {
        match self {
            RecordStore::Memory(store) => {
                store.outbox.push(entry);
                Ok(())
            }
            RecordStore::Sqlite(store) => store.push_outbox(&entry),
        }
    }

    pub fn outbox_for(&self, subject_id: &str) -> Result<Vec<OutboxEntry>, StoreError> {
        match self {
            RecordStore::Memory(store) => Ok(store
                .outbox
                .iter()
                .filter(|e| e.subject_id == subject_id)
                .cloned()
                .collect()),
            RecordStore::Sqlite(store) => store.outbox_for(subject_id),
        }
    }
}

fn corrupt(err: serde_json::Error) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

const STATE_IN_FLIGHT: &str = "in_flight";
const STATE_FAILED: &str = "failed";
const STATE_DECIDED: &str = "decided";

impl SqliteRecords {
    pub fn new(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS subjects (
                subject_id TEXT PRIMARY KEY,
                context_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS events (
                subject_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                payload_hash TEXT NOT NULL,
                state TEXT NOT NULL,
                claimed_at TEXT NOT NULL,
                outcome_json TEXT,
                PRIMARY KEY (subject_id, event_id)
            );
            CREATE TABLE IF NOT EXISTS outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                entry_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS outbox_subject ON outbox(subject_id);
            ",
        )?;
        Ok(Self { conn })
    }

    fn get_subject(&self, subject_id: &str) -> Result<Option<SubjectContext>, StoreError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT context_json FROM subjects WHERE subject_id = ?1",
                params![subject_id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|v| serde_json::from_str(&v).map_err(corrupt))
            .transpose()
    }

    fn save_subject(
        &mut self,
        subject_id: &str,
        context: &SubjectContext,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(context).map_err(corrupt)?;
        self.conn.execute(
            "
            INSERT INTO subjects (subject_id, context_json, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(subject_id) DO UPDATE SET
                context_json=excluded.context_json,
                updated_at=excluded.updated_at
            ",
            params![subject_id, json, updated_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn get_event(&self, key: &EventKey) -> Result<Option<EventRecord>, StoreError> {
        let row: Option<(String, String, String, Option<String>)> = self
            .conn
            .query_row(
                "
                SELECT payload_hash, state, claimed_at, outcome_json
                FROM events WHERE subject_id = ?1 AND event_id = ?2
                ",
                params![key.subject_id, key.event_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((payload_hash, state, claimed_at, outcome_json)) = row else {
            return Ok(None);
        };
        let state = match (state.as_str(), outcome_json) {
            (STATE_DECIDED, Some(json)) => {
                EventState::Decided(serde_json::from_str(&json).map_err(corrupt)?)
            }
            (STATE_FAILED, _) => EventState::Failed,
            (STATE_IN_FLIGHT, _) => EventState::InFlight {
                claimed_at: engage_kernel::parse_rfc3339(&claimed_at).ok_or_else(|| {
                    StoreError::Corrupt(format!("claimed_at={claimed_at} is not RFC3339"))
                })?,
            },
            (other, _) => {
                return Err(StoreError::Corrupt(format!(
                    "event {}/{} has state {other} without an outcome",
                    key.subject_id, key.event_id
                )))
            }
        };
        Ok(Some(EventRecord {
            payload_hash,
            state,
        }))
    }

    fn claim_event(
        &mut self,
        key: &EventKey,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Claim, StoreError> {
        let inserted = self.conn.execute(
            "
            INSERT INTO events (subject_id, event_id, payload_hash, state, claimed_at, outcome_json)
            VALUES (?1, ?2, ?3, ?4, ?5, NULL)
            ON CONFLICT(subject_id, event_id) DO NOTHING
            ",
            params![
                key.subject_id,
                key.event_id,
                payload_hash,
                STATE_IN_FLIGHT,
                now.to_rfc3339()
            ],
        )?;
        if inserted == 1 {
            return Ok(Claim::Claimed);
        }
        self.get_event(key)?
            .map(Claim::Existing)
            .ok_or_else(|| StoreError::Backend("event vanished after conflicting insert".to_string()))
    }

    fn set_state(&mut self, key: &EventKey, state: &EventState) -> Result<(), StoreError> {
        let (name, claimed_at, outcome_json) = match state {
            EventState::InFlight { claimed_at } => {
                (STATE_IN_FLIGHT, Some(claimed_at.to_rfc3339()), None)
            }
            EventState::Failed => (STATE_FAILED, None, None),
            EventState::Decided(outcome) => (
                STATE_DECIDED,
                None,
                Some(serde_json::to_string(outcome).map_err(corrupt)?),
            ),
        };
        self.conn.execute(
            "
            UPDATE events
            SET state = ?3, claimed_at = COALESCE(?4, claimed_at), outcome_json = ?5
            WHERE subject_id = ?1 AND event_id = ?2
            ",
            params![key.subject_id, key.event_id, name, claimed_at, outcome_json],
        )?;
        Ok(())
    }

    fn push_outbox(&mut self, entry: &OutboxEntry) -> Result<(), StoreError> {
        let json = serde_json::to_string(entry).map_err(corrupt)?;
        self.conn.execute(
            "INSERT INTO outbox (subject_id, event_id, entry_json) VALUES (?1, ?2, ?3)",
            params![entry.subject_id, entry.event_id, json],
        )?;
        Ok(())
    }

    fn outbox_for(&self, subject_id: &str) -> Result<Vec<OutboxEntry>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT entry_json FROM outbox WHERE subject_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![subject_id], |row| row.get::<_, String>(0))?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(serde_json::from_str(&row?).map_err(corrupt)?);
        }
        Ok(entries)
    }
}

//! Append-only, tamper-evident audit trail.
//!
//! Every decision and delivery attempt lands here. Records are hash-chained:
//! each append hashes the new record's content together with the previous
//! record's hash, so any retroactive edit breaks the chain for every record
//! after it. Append is the only mutating operation; there is no update or
//! delete API. Sequence numbers are strictly increasing and survive process
//! restarts.
//!
//! The log keeps its own SQLite file so its lifecycle is independent of the
//! state store.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::{AuditKind, AuditRecord};

/// Link value hashed into the first record.
const GENESIS: &str = "healthguard-genesis";

/// Errors from audit log operations.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create audit directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Chain state unreadable: {0}")]
    ChainState(String),

    #[error("Chain broken at seq {seq}")]
    ChainBroken { seq: u64 },

    #[error("Unknown record kind: {0}")]
    UnknownKind(String),
}

/// Query filter for reads. Empty filter = everything, ascending.
#[derive(Debug, Default, Clone)]
pub struct AuditFilter {
    pub kind: Option<AuditKind>,
    pub action_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// The append-only audit log.
pub struct AuditLog {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audit_log (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    action_id  TEXT NOT NULL,
    kind       TEXT NOT NULL,
    timestamp  TEXT NOT NULL,
    payload    TEXT NOT NULL,
    prev_hash  TEXT NOT NULL,
    hash       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_kind ON audit_log(kind, seq);
CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action_id);
";

impl AuditLog {
    pub fn open_at(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(AuditError::CreateDir)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append one record and return its sequence number.
    ///
    /// The payload must already be scrubbed: no raw media, no display names.
    pub fn append(
        &self,
        kind: AuditKind,
        action_id: &str,
        payload: serde_json::Value,
    ) -> Result<u64, AuditError> {
        let conn = self.conn.lock();

        let tail: Option<(u64, String)> = conn
            .query_row(
                "SELECT seq, hash FROM audit_log ORDER BY seq DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let (seq, prev_hash) = match tail {
            Some((last_seq, last_hash)) => (last_seq + 1, last_hash),
            None => (1, GENESIS.to_string()),
        };

        let timestamp = Utc::now();
        let payload_text = payload.to_string();
        let hash = chain_hash(
            seq,
            kind.label(),
            action_id,
            &timestamp.to_rfc3339(),
            &payload_text,
            &prev_hash,
        );

        conn.execute(
            "INSERT INTO audit_log (seq, action_id, kind, timestamp, payload, prev_hash, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                seq as i64,
                action_id,
                kind.label(),
                timestamp.to_rfc3339(),
                payload_text,
                prev_hash,
                hash,
            ],
        )?;

        log::debug!("audit seq={} kind={}", seq, kind.label());
        Ok(seq)
    }

    /// Read records matching the filter, always in ascending sequence order.
    pub fn read(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        let mut sql = String::from(
            "SELECT seq, action_id, kind, timestamp, payload, prev_hash, hash
             FROM audit_log WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(kind) = filter.kind {
            sql.push_str(" AND kind = ?");
            args.push(Box::new(kind.label().to_string()));
        }
        if let Some(action_id) = &filter.action_id {
            sql.push_str(" AND action_id = ?");
            args.push(Box::new(action_id.clone()));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND timestamp >= ?");
            args.push(Box::new(since.to_rfc3339()));
        }
        sql.push_str(" ORDER BY seq ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            args.push(Box::new(limit as i64));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_ref.as_slice(), row_to_parts)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(parts_to_record(row?)?);
        }
        Ok(records)
    }

    /// Recompute the chain over every record in sequence order.
    ///
    /// Returns the number of verified records, or the first sequence number
    /// at which the stored hashes no longer reproduce.
    pub fn verify_chain(&self) -> Result<u64, AuditError> {
        let records = self.read(&AuditFilter::default())?;
        let mut expected_prev = GENESIS.to_string();
        let mut verified = 0u64;

        for record in records {
            if record.prev_hash != expected_prev {
                return Err(AuditError::ChainBroken { seq: record.seq });
            }
            let recomputed = chain_hash(
                record.seq,
                record.kind.label(),
                &record.action_id,
                &record.timestamp.to_rfc3339(),
                &record.payload.to_string(),
                &record.prev_hash,
            );
            if recomputed != record.hash {
                return Err(AuditError::ChainBroken { seq: record.seq });
            }
            expected_prev = record.hash;
            verified += 1;
        }
        Ok(verified)
    }

    pub fn len(&self) -> Result<u64, AuditError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool, AuditError> {
        Ok(self.len()? == 0)
    }
}

type RowParts = (i64, String, String, String, String, String, String);

fn row_to_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<RowParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn parts_to_record(parts: RowParts) -> Result<AuditRecord, AuditError> {
    let (seq, action_id, kind, timestamp, payload, prev_hash, hash) = parts;
    let kind = AuditKind::parse(&kind).ok_or(AuditError::UnknownKind(kind))?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| AuditError::ChainState(format!("bad timestamp: {e}")))?
        .with_timezone(&Utc);
    let payload = serde_json::from_str(&payload)
        .map_err(|e| AuditError::ChainState(format!("bad payload json: {e}")))?;
    Ok(AuditRecord {
        seq: seq as u64,
        action_id,
        kind,
        timestamp,
        payload,
        prev_hash,
        hash,
    })
}

/// Link value for one record: SHA-256 over the record content and the
/// previous record's hash.
fn chain_hash(
    seq: u64,
    kind: &str,
    action_id: &str,
    timestamp: &str,
    payload: &str,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seq.to_be_bytes());
    hasher.update(kind.as_bytes());
    hasher.update(action_id.as_bytes());
    hasher.update(timestamp.as_bytes());
    hasher.update(payload.as_bytes());
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_log() -> AuditLog {
        AuditLog::open_in_memory().expect("in-memory audit log")
    }

    #[test]
    fn sequence_numbers_increase_from_one() {
        let log = test_log();
        let a = log
            .append(AuditKind::InfoLogged, "act-1", json!({"ok": true}))
            .unwrap();
        let b = log
            .append(AuditKind::InfoLogged, "act-2", json!({"ok": true}))
            .unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn sequence_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.db");

        {
            let log = AuditLog::open_at(&path).unwrap();
            log.append(AuditKind::InfoLogged, "act-1", json!({})).unwrap();
            log.append(AuditKind::InfoLogged, "act-2", json!({})).unwrap();
        }

        let log = AuditLog::open_at(&path).unwrap();
        let seq = log
            .append(AuditKind::DeliveryOutcome, "act-3", json!({}))
            .unwrap();
        assert_eq!(seq, 3);
        assert_eq!(log.verify_chain().unwrap(), 3);
    }

    #[test]
    fn reads_are_ascending_and_filterable() {
        let log = test_log();
        log.append(AuditKind::InfoLogged, "a", json!({})).unwrap();
        log.append(AuditKind::DeliveryOutcome, "b", json!({})).unwrap();
        log.append(AuditKind::InfoLogged, "c", json!({})).unwrap();

        let all = log.read(&AuditFilter::default()).unwrap();
        let seqs: Vec<u64> = all.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let info_only = log
            .read(&AuditFilter {
                kind: Some(AuditKind::InfoLogged),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(info_only.len(), 2);

        let by_action = log
            .read(&AuditFilter {
                action_id: Some("b".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_action.len(), 1);
        assert_eq!(by_action[0].kind, AuditKind::DeliveryOutcome);
    }

    #[test]
    fn chain_verifies_clean() {
        let log = test_log();
        for i in 0..5 {
            log.append(AuditKind::InfoLogged, &format!("act-{i}"), json!({"i": i}))
                .unwrap();
        }
        assert_eq!(log.verify_chain().unwrap(), 5);
    }

    #[test]
    fn tampering_with_a_payload_breaks_the_chain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.db");

        {
            let log = AuditLog::open_at(&path).unwrap();
            for i in 0..4 {
                log.append(AuditKind::InfoLogged, &format!("act-{i}"), json!({"i": i}))
                    .unwrap();
            }
            assert_eq!(log.verify_chain().unwrap(), 4);
        }

        // There is no mutation API; a tamperer has to go at the file directly.
        let raw = Connection::open(&path).unwrap();
        raw.execute(
            "UPDATE audit_log SET payload = '{\"i\":99}' WHERE seq = 2",
            [],
        )
        .unwrap();
        drop(raw);

        let log = AuditLog::open_at(&path).unwrap();
        match log.verify_chain() {
            Err(AuditError::ChainBroken { seq }) => assert_eq!(seq, 2),
            other => panic!("expected broken chain, got {other:?}"),
        }
    }
}

//! SQLite-backed patient state store.
//!
//! Holds the patient roster, the append-only signal history, verdicts, and
//! alerts. A single connection behind a mutex gives linearizable reads per
//! patient: a read issued after a write completes sees that write.
//! Cross-patient operations are independent row ranges and order-insensitive.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::rules::Reading;
use crate::types::{
    Alert, Patient, PatientId, Signal, SignalBody, Verdict, VitalMetric,
};

/// Errors specific to state-store operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

/// SQLite connection wrapper for patients, signals, verdicts, and alerts.
///
/// The connection is guarded internally, so the store can be shared as an
/// `Arc<StateDb>` between the request path and the autonomous cycle.
pub struct StateDb {
    conn: Mutex<Connection>,
}

impl StateDb {
    /// Open (or create) the database at the given path and apply the schema.
    pub fn open_at(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL for concurrent read performance while the cycle writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        // Idempotent schema
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // =========================================================================
    // Patients
    // =========================================================================

    /// Insert a patient at onboarding. Patients are never deleted during
    /// normal operation; re-inserting an existing ID is a no-op.
    pub fn add_patient(&self, patient: &Patient) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO patients (id, name, demographics, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                patient.id.as_str(),
                patient.name,
                patient.demographics,
                patient.created_at.to_rfc3339(),
            ],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO patient_state (patient_id, last_evaluated_at)
             VALUES (?1, NULL)",
            params![patient.id.as_str()],
        )?;
        Ok(())
    }

    pub fn get_patient(&self, id: &PatientId) -> Result<Option<Patient>, DbError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, name, demographics, created_at FROM patients WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, name, demographics, created_at)| {
            Ok(Patient {
                id: PatientId(id),
                name,
                demographics,
                created_at: parse_ts(&created_at)?,
            })
        })
        .transpose()
    }

    pub fn list_patients(&self) -> Result<Vec<Patient>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, demographics, created_at FROM patients ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut patients = Vec::new();
        for row in rows {
            let (id, name, demographics, created_at) = row?;
            patients.push(Patient {
                id: PatientId(id),
                name,
                demographics,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(patients)
    }

    pub fn patient_count(&self) -> Result<usize, DbError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM patients", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // =========================================================================
    // Signals (append-only)
    // =========================================================================

    pub fn append_signal(&self, signal: &Signal) -> Result<i64, DbError> {
        let (kind, metric, value, unit, body_text) = match &signal.body {
            SignalBody::VitalReading {
                metric,
                value,
                unit,
            } => (
                signal.body.kind(),
                Some(metric.label().to_string()),
                Some(*value),
                Some(unit.clone()),
                None,
            ),
            SignalBody::SymptomText { text } => {
                (signal.body.kind(), None, None, None, Some(text.clone()))
            }
            SignalBody::TranscribedVoice { transcript } => (
                signal.body.kind(),
                None,
                None,
                None,
                Some(transcript.clone()),
            ),
            SignalBody::ImageFinding { observations } => (
                signal.body.kind(),
                None,
                None,
                None,
                Some(observations.clone()),
            ),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO signals
                (patient_id, kind, metric, value, unit, body_text, session_id, captured_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                signal.patient_id.as_str(),
                kind,
                metric,
                value,
                unit,
                body_text,
                signal.session_id,
                signal.captured_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Rolling history for a patient, most recent first, bounded by `limit`.
    pub fn recent_signals(
        &self,
        patient_id: &PatientId,
        limit: usize,
    ) -> Result<Vec<Signal>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT kind, metric, value, unit, body_text, session_id, captured_at
             FROM signals
             WHERE patient_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![patient_id.as_str(), limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut signals = Vec::new();
        for row in rows {
            let (kind, metric, value, unit, body_text, session_id, captured_at) = row?;
            let body = rebuild_body(&kind, metric, value, unit, body_text)?;
            signals.push(Signal {
                patient_id: patient_id.clone(),
                body,
                captured_at: parse_ts(&captured_at)?,
                session_id,
            });
        }
        Ok(signals)
    }

    /// Most recent reading per vital metric for a patient.
    pub fn latest_vitals(&self, patient_id: &PatientId) -> Result<Vec<Reading>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT metric, value, unit, MAX(id)
             FROM signals
             WHERE patient_id = ?1 AND kind = 'vital_reading'
             GROUP BY metric
             ORDER BY metric",
        )?;
        let rows = stmt.query_map(params![patient_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut readings = Vec::new();
        for row in rows {
            let (metric, value, unit) = row?;
            readings.push(Reading {
                metric: VitalMetric::parse(&metric),
                value,
                unit: unit.unwrap_or_default(),
            });
        }
        Ok(readings)
    }

    /// Recent pain readings, most recent first, for the trend rule.
    pub fn recent_pain(
        &self,
        patient_id: &PatientId,
        limit: usize,
    ) -> Result<Vec<f64>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT value FROM signals
             WHERE patient_id = ?1 AND kind = 'vital_reading' AND metric = 'pain_level'
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![patient_id.as_str(), limit as i64], |row| {
            row.get::<_, f64>(0)
        })?;
        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }

    // =========================================================================
    // Verdicts & alerts
    // =========================================================================

    pub fn record_verdict(&self, verdict: &Verdict) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO verdicts
                (patient_id, severity, reason, source, rule_id, anomaly_score,
                 summary, degraded, evaluated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                verdict.patient_id.as_str(),
                verdict.severity.as_u8(),
                verdict.reason,
                verdict.source.label(),
                verdict.rule_id,
                verdict.anomaly_score,
                verdict.summary,
                verdict.degraded as i32,
                verdict.evaluated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn record_alert(&self, alert: &Alert) -> Result<(), DbError> {
        let actions = serde_json::to_string(&alert.actions)
            .map_err(|e| DbError::CorruptRow(e.to_string()))?;
        let outcomes = serde_json::to_string(&alert.outcomes)
            .map_err(|e| DbError::CorruptRow(e.to_string()))?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO alerts
                (id, patient_id, severity, reason, actions, dedup_key, created_at, outcomes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                alert.id,
                alert.patient_id.as_str(),
                alert.severity.as_u8(),
                alert.reason,
                actions,
                alert.dedup_key,
                alert.created_at.to_rfc3339(),
                outcomes,
            ],
        )?;
        Ok(())
    }

    /// When an alert with this dedup key was last created, if ever.
    /// Persisted, so the cooldown window survives restarts.
    pub fn last_alert_with_key(
        &self,
        dedup_key: &str,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn.lock();
        let created: Option<String> = conn
            .query_row(
                "SELECT created_at FROM alerts
                 WHERE dedup_key = ?1
                 ORDER BY created_at DESC
                 LIMIT 1",
                params![dedup_key],
                |row| row.get(0),
            )
            .optional()?;
        created.map(|ts| parse_ts(&ts)).transpose()
    }

    pub fn alerts_since(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM alerts WHERE created_at >= ?1",
            params![cutoff.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // =========================================================================
    // Evaluation bookkeeping
    // =========================================================================

    pub fn set_last_evaluated(
        &self,
        patient_id: &PatientId,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO patient_state (patient_id, last_evaluated_at)
             VALUES (?1, ?2)
             ON CONFLICT(patient_id) DO UPDATE SET last_evaluated_at = excluded.last_evaluated_at",
            params![patient_id.as_str(), at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn last_evaluated(
        &self,
        patient_id: &PatientId,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn.lock();
        let ts: Option<Option<String>> = conn
            .query_row(
                "SELECT last_evaluated_at FROM patient_state WHERE patient_id = ?1",
                params![patient_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        ts.flatten().map(|t| parse_ts(&t)).transpose()
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::CorruptRow(format!("bad timestamp {raw}: {e}")))
}

fn rebuild_body(
    kind: &str,
    metric: Option<String>,
    value: Option<f64>,
    unit: Option<String>,
    body_text: Option<String>,
) -> Result<SignalBody, DbError> {
    match kind {
        "vital_reading" => {
            let metric = metric
                .ok_or_else(|| DbError::CorruptRow("vital_reading without metric".into()))?;
            let value =
                value.ok_or_else(|| DbError::CorruptRow("vital_reading without value".into()))?;
            Ok(SignalBody::VitalReading {
                metric: VitalMetric::parse(&metric),
                value,
                unit: unit.unwrap_or_default(),
            })
        }
        "symptom_text" => Ok(SignalBody::SymptomText {
            text: body_text.unwrap_or_default(),
        }),
        "transcribed_voice" => Ok(SignalBody::TranscribedVoice {
            transcript: body_text.unwrap_or_default(),
        }),
        "image_finding" => Ok(SignalBody::ImageFinding {
            observations: body_text.unwrap_or_default(),
        }),
        other => Err(DbError::CorruptRow(format!("unknown signal kind {other}"))),
    }
}

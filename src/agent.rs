//! The pipeline orchestrator.
//!
//! Owns the store, audit log, retention enforcer, dispatcher, and provider
//! clients, and drives the evaluation flow for both inbound submissions and
//! the autonomous cycle:
//!
//!   signal -> store (append) -> rules -> (non-critical) summarize ->
//!   fusion -> dispatch -> audit
//!
//! At most one evaluation is in flight per patient at any time (a
//! patient-scoped async lock); different patients evaluate concurrently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use crate::audit::{AuditFilter, AuditLog};
use crate::clients::{ClinicalReasoner, MediaAnalyzer, SummaryOutcome};
use crate::config::AppConfig;
use crate::dispatch::Dispatcher;
use crate::error::PipelineError;
use crate::fusion;
use crate::ingest::{self, MediaSubmission, Submission};
use crate::retention::RetentionEnforcer;
use crate::rules;
use crate::store::StateDb;
use crate::types::{
    AuditKind, AuditRecord, CycleState, Patient, PatientId, Severity, Signal, SignalBody,
    StatusSummary, Verdict, VerdictSource,
};
use crate::util::{truncate, Clock};

/// What happened to the optional reasoning call for one evaluation.
enum SummaryAttempt {
    Completed(SummaryOutcome),
    /// Attempted but failed or timed out: the degraded-mode path.
    Failed,
    /// Not attempted (rule-critical fast path, or no reasoner configured).
    Skipped,
}

/// Outcome of one autonomous cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub patients_evaluated: usize,
    pub patient_failures: usize,
    pub retention_violations: usize,
    /// True when shutdown interrupted the cycle after the in-flight patient.
    pub interrupted: bool,
    /// True when the cycle never ran because the previous one was still
    /// in flight (at-most-one concurrent cycle).
    pub skipped: bool,
}

pub struct Agent {
    config: AppConfig,
    store: Arc<StateDb>,
    audit: Arc<AuditLog>,
    retention: Arc<RetentionEnforcer>,
    dispatcher: Dispatcher,
    analyzer: Option<Arc<dyn MediaAnalyzer>>,
    reasoner: Option<Arc<dyn ClinicalReasoner>>,
    clock: Arc<dyn Clock>,
    patient_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    cycle_state: parking_lot::Mutex<CycleState>,
    last_cycle_time: parking_lot::Mutex<Option<DateTime<Utc>>>,
    signals_processed: AtomicU64,
    cycles_completed: AtomicU64,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        store: Arc<StateDb>,
        audit: Arc<AuditLog>,
        retention: Arc<RetentionEnforcer>,
        dispatcher: Dispatcher,
        analyzer: Option<Arc<dyn MediaAnalyzer>>,
        reasoner: Option<Arc<dyn ClinicalReasoner>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            audit,
            retention,
            dispatcher,
            analyzer,
            reasoner,
            clock,
            patient_locks: DashMap::new(),
            cycle_state: parking_lot::Mutex::new(CycleState::Idle),
            last_cycle_time: parking_lot::Mutex::new(None),
            signals_processed: AtomicU64::new(0),
            cycles_completed: AtomicU64::new(0),
        }
    }

    fn patient_lock(&self, patient_id: &PatientId) -> Arc<tokio::sync::Mutex<()>> {
        self.patient_locks
            .entry(patient_id.as_str().to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn require_patient(&self, patient_id: &PatientId) -> Result<(), PipelineError> {
        match self.store.get_patient(patient_id)? {
            Some(_) => Ok(()),
            None => Err(PipelineError::UnknownPatient(
                patient_id.as_str().to_string(),
            )),
        }
    }

    /// Onboard a patient into the roster. Idempotent.
    pub fn onboard(&self, id: &str, name: &str, demographics: Option<String>) -> Result<Patient, PipelineError> {
        let patient = Patient {
            id: PatientId(id.to_string()),
            name: name.to_string(),
            demographics,
            created_at: self.clock.now(),
        };
        self.store.add_patient(&patient)?;
        Ok(patient)
    }

    // =========================================================================
    // Inbound submission paths
    // =========================================================================

    /// Append a typed/text signal and run the full evaluation flow.
    pub async fn submit_signal(
        &self,
        patient_id: &PatientId,
        submission: Submission,
    ) -> Result<Verdict, PipelineError> {
        self.require_patient(patient_id)?;
        let signal = ingest::build_signal(patient_id, submission, self.clock.now())?;

        let lock = self.patient_lock(patient_id);
        let _guard = lock.lock().await;

        self.store.append_signal(&signal)?;
        self.signals_processed.fetch_add(1, Ordering::Relaxed);

        self.evaluate_locked(patient_id, Some(&signal), false).await
    }

    /// Analyze raw media (photo/voice), convert the result to a signal, and
    /// run the evaluation flow. The raw asset is released (deleted) as soon
    /// as the analysis call returns, success or not.
    pub async fn process_media(
        &self,
        patient_id: &PatientId,
        media: MediaSubmission,
    ) -> Result<Verdict, PipelineError> {
        self.require_patient(patient_id)?;

        let session_id = ingest::generate_session_id();
        let path = ingest::save_ephemeral(&self.config.ephemeral_dir(), &media.bytes, media.kind)?;
        let asset = self.retention.register(media.kind, path);

        let analysis = match &self.analyzer {
            Some(analyzer) => {
                let result = analyzer.analyze(&session_id, media.kind, &media.bytes).await;
                // Hand-off is over either way; the bytes go now.
                self.retention.release(&asset.id);
                result
            }
            None => {
                self.retention.release(&asset.id);
                Err(crate::clients::ClientError::NotConfigured)
            }
        };

        let lock = self.patient_lock(patient_id);
        let _guard = lock.lock().await;

        match analysis {
            Ok(text) => {
                let body = match media.kind {
                    crate::retention::MediaKind::Audio => SignalBody::TranscribedVoice {
                        transcript: text,
                    },
                    crate::retention::MediaKind::Photo => SignalBody::ImageFinding {
                        observations: text,
                    },
                };
                let signal = Signal {
                    patient_id: patient_id.clone(),
                    body,
                    captured_at: self.clock.now(),
                    session_id,
                };
                self.store.append_signal(&signal)?;
                self.signals_processed.fetch_add(1, Ordering::Relaxed);
                self.evaluate_locked(patient_id, Some(&signal), false).await
            }
            Err(e) => {
                // Analysis is an external collaborator: a failure degrades,
                // it never blocks evaluation of what we already know.
                log::warn!("media analysis failed for session {session_id}: {e}");
                self.evaluate_locked(patient_id, None, false).await
            }
        }
    }

    // =========================================================================
    // Evaluation flow
    // =========================================================================

    /// Rules → (non-critical) summarize → fusion → dispatch → bookkeeping.
    /// Caller must hold the patient lock.
    async fn evaluate_locked(
        &self,
        patient_id: &PatientId,
        new_signal: Option<&Signal>,
        autonomous: bool,
    ) -> Result<Verdict, PipelineError> {
        let latest = self.store.latest_vitals(patient_id)?;
        let recent_pain = self
            .store
            .recent_pain(patient_id, self.config.history_window)?;
        let rule_verdict = rules::evaluate(&latest, &recent_pain);

        // A rule-triggered critical goes straight to dispatch: the external
        // score could not change it and must never delay it.
        let attempt = if rule_verdict.severity == Severity::Critical {
            SummaryAttempt::Skipped
        } else {
            self.summarize(patient_id, new_signal, &latest).await?
        };
        let (summary, degraded) = match attempt {
            SummaryAttempt::Completed(outcome) => (Some(outcome), false),
            // Attempted and failed: fusion proceeds on rules alone
            SummaryAttempt::Failed => (None, true),
            SummaryAttempt::Skipped => (None, false),
        };

        let mut verdict = fusion::fuse(
            patient_id.clone(),
            rule_verdict,
            summary,
            self.clock.now(),
        );
        if autonomous {
            verdict.source = VerdictSource::AutonomousCycle;
        }
        verdict.degraded = degraded;

        self.store.record_verdict(&verdict)?;
        let receipt = self.dispatcher.dispatch(&verdict).await?;
        self.store.set_last_evaluated(patient_id, self.clock.now())?;

        log::info!(
            "evaluated {}: severity={} source={} alert={} suppressed={}",
            patient_id.redacted(),
            verdict.severity,
            verdict.source.label(),
            receipt.alert.is_some(),
            receipt.suppressed,
        );
        Ok(verdict)
    }

    /// Call the reasoning service over anonymized text. A failed or timed
    /// out call comes back as `Failed` (degraded mode) and the degradation
    /// itself is audited; only the audit append can error out of here.
    async fn summarize(
        &self,
        patient_id: &PatientId,
        new_signal: Option<&Signal>,
        latest: &[rules::Reading],
    ) -> Result<SummaryAttempt, PipelineError> {
        let reasoner = match &self.reasoner {
            Some(r) => r,
            None => return Ok(SummaryAttempt::Skipped),
        };

        let session_id = ingest::generate_session_id();
        let current = describe_current(new_signal, latest);
        let history = self
            .store
            .recent_signals(patient_id, self.config.history_window)?;
        let history_text = describe_history(&history);

        match reasoner.summarize(&session_id, &current, &history_text).await {
            Ok(outcome) => Ok(SummaryAttempt::Completed(outcome)),
            Err(e) => {
                log::warn!(
                    "reasoning call failed for {} (session {session_id}): {e}",
                    patient_id.redacted()
                );
                self.audit.append(
                    AuditKind::DegradedFusion,
                    &format!("degrade-{}", Uuid::new_v4().simple()),
                    json!({
                        "patient": patient_id.redacted(),
                        "error": truncate(&e.to_string(), 200),
                    }),
                )?;
                Ok(SummaryAttempt::Failed)
            }
        }
    }

    // =========================================================================
    // Autonomous cycle
    // =========================================================================

    /// Re-evaluate every patient from stored history, then sweep retention.
    ///
    /// Per-patient failures are audited and skipped; an audit-write failure
    /// aborts the cycle so it retries whole next period. On shutdown the
    /// in-flight patient completes and the rest are skipped.
    pub async fn run_cycle(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<CycleReport, PipelineError> {
        if !self.begin_cycle() {
            log::warn!("cycle: previous cycle still running, skipping this period");
            return Ok(CycleReport {
                skipped: true,
                ..CycleReport::default()
            });
        }

        let result = self.run_cycle_inner(shutdown).await;
        *self.cycle_state.lock() = CycleState::Idle;

        if result.is_ok() {
            self.cycles_completed.fetch_add(1, Ordering::Relaxed);
            *self.last_cycle_time.lock() = Some(self.clock.now());
        }
        result
    }

    /// Idle -> RunningCycle transition. Returns false when a cycle is
    /// already in flight, in which case this period is skipped rather than
    /// overlapped.
    fn begin_cycle(&self) -> bool {
        let mut state = self.cycle_state.lock();
        match *state {
            CycleState::RunningCycle => false,
            CycleState::Idle => {
                *state = CycleState::RunningCycle;
                true
            }
        }
    }

    async fn run_cycle_inner(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<CycleReport, PipelineError> {
        let mut report = CycleReport::default();

        for patient in self.store.list_patients()? {
            if *shutdown.borrow() {
                report.interrupted = true;
                log::info!("cycle: shutdown requested, skipping remaining patients");
                break;
            }

            let lock = self.patient_lock(&patient.id);
            let _guard = lock.lock().await;

            match self.evaluate_locked(&patient.id, None, true).await {
                Ok(_) => report.patients_evaluated += 1,
                Err(e) if e.halts_cycle() => {
                    log::error!("cycle: audit trail unavailable, aborting cycle: {e}");
                    return Err(e);
                }
                Err(e) => {
                    report.patient_failures += 1;
                    log::warn!("cycle: evaluation failed for {}: {e}", patient.id.redacted());
                    self.audit.append(
                        AuditKind::CyclePatientFailed,
                        &format!("cycle-{}", Uuid::new_v4().simple()),
                        json!({
                            "patient": patient.id.redacted(),
                            "error": truncate(&e.to_string(), 200),
                        }),
                    )?;
                }
            }
        }

        for violation in self.retention.sweep() {
            report.retention_violations += 1;
            self.audit.append(
                AuditKind::RetentionViolation,
                &violation.asset_id,
                json!({
                    "kind": violation.kind.label(),
                    "deadline": violation.deadline.to_rfc3339(),
                    "destroyed_at": violation.destroyed_at.to_rfc3339(),
                }),
            )?;
        }

        self.audit.append(
            AuditKind::CycleCompleted,
            &format!("cycle-{}", Uuid::new_v4().simple()),
            json!({
                "patients_evaluated": report.patients_evaluated,
                "patient_failures": report.patient_failures,
                "retention_violations": report.retention_violations,
                "interrupted": report.interrupted,
            }),
        )?;

        Ok(report)
    }

    // =========================================================================
    // Exposed read surface
    // =========================================================================

    pub fn get_status(&self) -> Result<StatusSummary, PipelineError> {
        let cutoff = self.clock.now() - chrono::Duration::hours(24);
        Ok(StatusSummary {
            patients_monitored: self.store.patient_count()?,
            last_cycle_time: *self.last_cycle_time.lock(),
            alerts_last_24h: self.store.alerts_since(cutoff)?,
            cycle_state: *self.cycle_state.lock(),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            signals_processed: self.signals_processed.load(Ordering::Relaxed),
            ephemeral_assets: self.retention.live_count(),
        })
    }

    pub fn get_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, PipelineError> {
        Ok(self.audit.read(filter)?)
    }

    pub fn cycle_state(&self) -> CycleState {
        *self.cycle_state.lock()
    }

    pub fn retention(&self) -> &Arc<RetentionEnforcer> {
        &self.retention
    }

    #[cfg(test)]
    pub(crate) fn begin_cycle_for_test(&self) -> bool {
        self.begin_cycle()
    }

    #[cfg(test)]
    pub(crate) fn end_cycle_for_test(&self) {
        *self.cycle_state.lock() = CycleState::Idle;
    }
}

/// Current-signal description for the reasoning call: metrics and signal
/// text only, no identity.
fn describe_current(new_signal: Option<&Signal>, latest: &[rules::Reading]) -> String {
    let mut parts = Vec::new();
    if !latest.is_empty() {
        let vitals: Vec<String> = latest
            .iter()
            .map(|r| format!("{}={}{}", r.metric.label(), r.value, r.unit))
            .collect();
        parts.push(format!("Current vitals: {}", vitals.join(", ")));
    }
    if let Some(signal) = new_signal {
        match &signal.body {
            SignalBody::SymptomText { text } => {
                parts.push(format!("Reported symptoms: {}", truncate(text, 300)))
            }
            SignalBody::TranscribedVoice { transcript } => {
                parts.push(format!("Voice note transcript: {}", truncate(transcript, 300)))
            }
            SignalBody::ImageFinding { observations } => {
                parts.push(format!("Image observations: {}", truncate(observations, 300)))
            }
            SignalBody::VitalReading { .. } => {}
        }
    }
    if parts.is_empty() {
        "No current data.".to_string()
    } else {
        parts.join("\n")
    }
}

/// Rolling-history description for the reasoning call, newest first.
fn describe_history(history: &[Signal]) -> String {
    if history.is_empty() {
        return "No history available.".to_string();
    }
    history
        .iter()
        .map(|signal| match &signal.body {
            SignalBody::VitalReading {
                metric,
                value,
                unit,
            } => format!(
                "{} {}={}{}",
                signal.captured_at.format("%Y-%m-%d %H:%M"),
                metric.label(),
                value,
                unit
            ),
            SignalBody::SymptomText { text } => format!(
                "{} symptom: {}",
                signal.captured_at.format("%Y-%m-%d %H:%M"),
                truncate(text, 80)
            ),
            SignalBody::TranscribedVoice { transcript } => format!(
                "{} voice: {}",
                signal.captured_at.format("%Y-%m-%d %H:%M"),
                truncate(transcript, 80)
            ),
            SignalBody::ImageFinding { observations } => format!(
                "{} image: {}",
                signal.captured_at.format("%Y-%m-%d %H:%M"),
                truncate(observations, 80)
            ),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::types::VitalMetric;

    #[test]
    fn history_description_carries_no_identity() {
        let history = vec![Signal {
            patient_id: PatientId("patient-full-id".into()),
            body: SignalBody::VitalReading {
                metric: VitalMetric::Glucose,
                value: 65.0,
                unit: "mg/dL".into(),
            },
            captured_at: Utc::now(),
            session_id: "session_abc".into(),
        }];
        let text = describe_history(&history);
        assert!(text.contains("glucose=65"));
        assert!(!text.contains("patient-full-id"));
    }

    #[test]
    fn current_description_includes_symptoms_and_vitals() {
        let signal = Signal {
            patient_id: PatientId("p".into()),
            body: SignalBody::SymptomText {
                text: "dizzy and sweating".into(),
            },
            captured_at: Utc::now(),
            session_id: "session_x".into(),
        };
        let latest = vec![rules::Reading {
            metric: VitalMetric::Glucose,
            value: 64.0,
            unit: "mg/dL".into(),
        }];
        let text = describe_current(Some(&signal), &latest);
        assert!(text.contains("glucose=64"));
        assert!(text.contains("dizzy and sweating"));
    }
}

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Urgency tier of a verdict. Lower numeric value = more urgent.
///
/// Severity 1 triggers the full multi-channel alert, 2 a single-channel
/// notification, 3 is log-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical = 1,
    Warning = 2,
    Info = 3,
}

impl Severity {
    /// Numeric tier as stored/audited (1=critical, 2=warning, 3=info).
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            1 => Some(Severity::Critical),
            2 => Some(Severity::Warning),
            3 => Some(Severity::Info),
            _ => None,
        }
    }

    /// The more urgent of two severities. Total order: 1 wins over 2, 2 over 3.
    ///
    /// This is the only combinator the fusion layer is allowed to use, which
    /// makes "rules are never overridden downward" a structural property
    /// rather than call-order discipline.
    pub fn more_urgent(self, other: Severity) -> Severity {
        if (self as u8) <= (other as u8) {
            self
        } else {
            other
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Opaque patient identifier. Never the ephemeral session ID used toward
/// inference providers, and never sent to them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatientId(pub String);

impl PatientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for audit payloads and delivery messages. Full IDs stay
    /// inside the store.
    pub fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(8).collect();
        format!("{}...", prefix)
    }
}

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A monitored patient. Display fields never leave the process toward
/// inference providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: PatientId,
    pub name: String,
    pub demographics: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Known vital metrics plus a catch-all for unrecognized kinds.
///
/// Unknown metrics must flow through evaluation (as info) rather than error
/// out, so `Other` carries whatever label the caller supplied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VitalMetric {
    BpSystolic,
    BpDiastolic,
    Glucose,
    HeartRate,
    OxygenSaturation,
    Temperature,
    PainLevel,
    Other(String),
}

impl VitalMetric {
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "bp_systolic" | "systolic" => VitalMetric::BpSystolic,
            "bp_diastolic" | "diastolic" => VitalMetric::BpDiastolic,
            "glucose" | "blood_glucose" => VitalMetric::Glucose,
            "heart_rate" | "pulse" => VitalMetric::HeartRate,
            "oxygen_saturation" | "spo2" => VitalMetric::OxygenSaturation,
            "temperature" => VitalMetric::Temperature,
            "pain_level" | "pain" => VitalMetric::PainLevel,
            other => VitalMetric::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            VitalMetric::BpSystolic => "bp_systolic",
            VitalMetric::BpDiastolic => "bp_diastolic",
            VitalMetric::Glucose => "glucose",
            VitalMetric::HeartRate => "heart_rate",
            VitalMetric::OxygenSaturation => "oxygen_saturation",
            VitalMetric::Temperature => "temperature",
            VitalMetric::PainLevel => "pain_level",
            VitalMetric::Other(s) => s,
        }
    }
}

impl Serialize for VitalMetric {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for VitalMetric {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(VitalMetric::parse(&s))
    }
}

/// The typed content of a signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalBody {
    VitalReading {
        metric: VitalMetric,
        value: f64,
        unit: String,
    },
    SymptomText {
        text: String,
    },
    TranscribedVoice {
        transcript: String,
    },
    ImageFinding {
        observations: String,
    },
}

impl SignalBody {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalBody::VitalReading { .. } => "vital_reading",
            SignalBody::SymptomText { .. } => "symptom_text",
            SignalBody::TranscribedVoice { .. } => "transcribed_voice",
            SignalBody::ImageFinding { .. } => "image_finding",
        }
    }
}

/// One inbound or derived health signal. Immutable once stored; history is
/// append-only per patient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub patient_id: PatientId,
    pub body: SignalBody,
    pub captured_at: DateTime<Utc>,
    /// Ephemeral, rotated per inference call. Safe to log.
    pub session_id: String,
}

/// Where the final severity of a verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    RuleEngine,
    RuleEngineAndAnomaly,
    AnomalyOnly,
    AutonomousCycle,
}

impl VerdictSource {
    pub fn label(self) -> &'static str {
        match self {
            VerdictSource::RuleEngine => "rule_engine",
            VerdictSource::RuleEngineAndAnomaly => "rule_engine+anomaly",
            VerdictSource::AnomalyOnly => "anomaly",
            VerdictSource::AutonomousCycle => "autonomous_cycle",
        }
    }
}

/// Result of one evaluation pass for one patient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub patient_id: PatientId,
    pub severity: Severity,
    pub reason: String,
    pub source: VerdictSource,
    /// Identifier of the threshold/trend rule that fired, if any.
    pub rule_id: Option<String>,
    /// Normalized [0,1] score from the reasoning service, if it responded.
    pub anomaly_score: Option<f64>,
    /// Structured summary attached for audit/display. Never changes severity.
    pub summary: Option<String>,
    /// Set when the external reasoning call failed or timed out and the
    /// verdict proceeded on rules alone.
    pub degraded: bool,
    pub evaluated_at: DateTime<Utc>,
}

/// Delivery channels an alert can fan out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertAction {
    Telegram,
    Tts,
    DoctorNotify,
}

impl AlertAction {
    pub fn label(self) -> &'static str {
        match self {
            AlertAction::Telegram => "telegram_alert",
            AlertAction::Tts => "tts_alert",
            AlertAction::DoctorNotify => "doctor_notify",
        }
    }

    /// Action set for a severity tier. Severity 3 is log-only.
    pub fn for_severity(severity: Severity) -> &'static [AlertAction] {
        match severity {
            Severity::Critical => &[
                AlertAction::Telegram,
                AlertAction::Tts,
                AlertAction::DoctorNotify,
            ],
            Severity::Warning => &[AlertAction::Telegram],
            Severity::Info => &[],
        }
    }
}

/// Outcome of a single delivery action attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: AlertAction,
    pub ok: bool,
    pub detail: Option<String>,
}

/// A decision to notify. Immutable after creation except for the delivery
/// outcomes filled in by the dispatch pass that created it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub patient_id: PatientId,
    pub severity: Severity,
    pub reason: String,
    pub actions: Vec<AlertAction>,
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
    pub outcomes: Vec<ActionOutcome>,
}

/// The dispatcher's receipt: exactly one per dispatch call, produced even
/// when every action fails or the alert is suppressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub alert: Option<Alert>,
    pub suppressed: bool,
    pub audit_seq: u64,
}

impl Receipt {
    pub fn actions_taken(&self) -> Vec<&'static str> {
        self.alert
            .as_ref()
            .map(|a| {
                a.outcomes
                    .iter()
                    .filter(|o| o.ok)
                    .map(|o| o.action.label())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Kinds of records the audit log distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    InfoLogged,
    DeliveryOutcome,
    Deduplicated,
    DegradedFusion,
    RetentionViolation,
    CyclePatientFailed,
    CycleCompleted,
}

impl AuditKind {
    pub fn label(self) -> &'static str {
        match self {
            AuditKind::InfoLogged => "info_logged",
            AuditKind::DeliveryOutcome => "delivery_outcome",
            AuditKind::Deduplicated => "deduplicated",
            AuditKind::DegradedFusion => "degraded_fusion",
            AuditKind::RetentionViolation => "retention_violation",
            AuditKind::CyclePatientFailed => "cycle_patient_failed",
            AuditKind::CycleCompleted => "cycle_completed",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "info_logged" => Some(AuditKind::InfoLogged),
            "delivery_outcome" => Some(AuditKind::DeliveryOutcome),
            "deduplicated" => Some(AuditKind::Deduplicated),
            "degraded_fusion" => Some(AuditKind::DegradedFusion),
            "retention_violation" => Some(AuditKind::RetentionViolation),
            "cycle_patient_failed" => Some(AuditKind::CyclePatientFailed),
            "cycle_completed" => Some(AuditKind::CycleCompleted),
            _ => None,
        }
    }
}

/// Append-only audit entry. The payload never includes raw media bytes or
/// patient display names; patient references are redacted IDs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Strictly increasing, never reused, survives restarts.
    pub seq: u64,
    pub action_id: String,
    pub kind: AuditKind,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

/// Current state of the autonomous scheduler, surfaced via status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    RunningCycle,
}

/// Operator-facing status summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSummary {
    pub patients_monitored: usize,
    pub last_cycle_time: Option<DateTime<Utc>>,
    pub alerts_last_24h: usize,
    pub cycle_state: CycleState,
    pub cycles_completed: u64,
    pub signals_processed: u64,
    pub ephemeral_assets: usize,
}

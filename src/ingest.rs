//! Signal ingestion: validation, ephemeral session IDs, raw media staging.
//!
//! Everything that leaves this process toward an inference provider is keyed
//! by an ephemeral session ID generated here, never a patient name or
//! long-lived identity. Raw media bytes are written under the ephemeral dir
//! and must be registered with the retention enforcer by the caller before
//! any analysis call is made.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::retention::MediaKind;
use crate::types::{PatientId, Signal, SignalBody, VitalMetric};

/// What the (out-of-scope) API layer submits for a patient.
#[derive(Debug, Clone)]
pub enum Submission {
    /// Structured vital reading.
    Vital {
        metric: String,
        value: f64,
        unit: String,
    },
    /// Free-form vital entry, e.g. `"glucose: 65 mg/dL"`.
    VitalText { text: String },
    /// Symptom description typed by the patient.
    Symptom { text: String },
}

/// Raw media submitted for analysis (photo of a wound, voice note).
#[derive(Debug, Clone)]
pub struct MediaSubmission {
    pub kind: MediaKind,
    pub bytes: Vec<u8>,
}

/// Ephemeral session ID, rotated per inference call.
pub fn generate_session_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("session_{}", &hex[..12])
}

/// Validate a submission and build the signal to append.
///
/// Rejections here are `ValidationError`s: surfaced to the caller, never
/// audited as clinical events, never reaching the rule engine.
pub fn build_signal(
    patient_id: &PatientId,
    submission: Submission,
    captured_at: DateTime<Utc>,
) -> Result<Signal, PipelineError> {
    let body = match submission {
        Submission::Vital {
            metric,
            value,
            unit,
        } => vital_body(&metric, value, unit)?,
        Submission::VitalText { text } => {
            let (metric, value, unit) = parse_vital_entry(&text)?;
            vital_body(&metric, value, unit)?
        }
        Submission::Symptom { text } => {
            let text = text.trim().to_string();
            if text.is_empty() {
                return Err(PipelineError::Validation("empty symptom text".to_string()));
            }
            SignalBody::SymptomText { text }
        }
    };

    Ok(Signal {
        patient_id: patient_id.clone(),
        body,
        captured_at,
        session_id: generate_session_id(),
    })
}

fn vital_body(metric: &str, value: f64, unit: String) -> Result<SignalBody, PipelineError> {
    if metric.trim().is_empty() {
        return Err(PipelineError::Validation("empty metric name".to_string()));
    }
    if !value.is_finite() {
        return Err(PipelineError::Validation(format!(
            "non-finite value for {metric}"
        )));
    }
    Ok(SignalBody::VitalReading {
        metric: VitalMetric::parse(metric),
        value,
        unit,
    })
}

/// Parse a free-form vital entry of the shape `metric: value [unit]`.
pub fn parse_vital_entry(text: &str) -> Result<(String, f64, String), PipelineError> {
    // Compiled per call; ingestion volume is human-paced.
    let re = Regex::new(r"^\s*([A-Za-z][A-Za-z0-9_ ]*?)\s*:\s*(-?\d+(?:\.\d+)?)\s*(\S*)\s*$")
        .map_err(|e| PipelineError::Validation(e.to_string()))?;

    let captures = re
        .captures(text)
        .ok_or_else(|| PipelineError::Validation(format!("unparseable vital entry: {text}")))?;

    let metric = captures[1].trim().replace(' ', "_").to_ascii_lowercase();
    let value: f64 = captures[2]
        .parse()
        .map_err(|e| PipelineError::Validation(format!("bad numeric value: {e}")))?;
    let unit = captures
        .get(3)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();

    Ok((metric, value, unit))
}

/// Write raw media bytes under the ephemeral directory.
///
/// The caller registers the returned path with the retention enforcer; the
/// bytes never touch durable storage.
pub fn save_ephemeral(
    ephemeral_dir: &Path,
    bytes: &[u8],
    kind: MediaKind,
) -> Result<PathBuf, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::Validation("empty media payload".to_string()));
    }
    std::fs::create_dir_all(ephemeral_dir)
        .map_err(|e| PipelineError::ExternalFailure(format!("ephemeral dir: {e}")))?;

    let suffix = match kind {
        MediaKind::Audio => "wav",
        MediaKind::Photo => "png",
    };
    let path = ephemeral_dir.join(format!("{}.{}", Uuid::new_v4().simple(), suffix));
    std::fs::write(&path, bytes)
        .map_err(|e| PipelineError::ExternalFailure(format!("ephemeral write: {e}")))?;
    log::debug!(
        "ingest: staged {} bytes of {} at {}",
        bytes.len(),
        kind.label(),
        path.display()
    );
    Ok(path)
}

/// Remove ephemeral files left behind by an earlier process (crash mid
/// cycle). Called once at startup; live assets are re-staged on demand.
pub fn clear_stale_ephemeral(ephemeral_dir: &Path) -> usize {
    let entries = match std::fs::read_dir(ephemeral_dir) {
        Ok(e) => e,
        Err(_) => return 0,
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() && std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        log::info!("ingest: cleared {removed} stale ephemeral file(s)");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid() -> PatientId {
        PatientId("p-1".to_string())
    }

    #[test]
    fn session_ids_are_ephemeral_and_never_patient_derived() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert!(a.starts_with("session_"));
        assert_eq!(a.len(), "session_".len() + 12);
        assert_ne!(a, b);
    }

    #[test]
    fn vital_text_parses_metric_value_unit() {
        let (metric, value, unit) = parse_vital_entry("glucose: 65 mg/dL").unwrap();
        assert_eq!(metric, "glucose");
        assert_eq!(value, 65.0);
        assert_eq!(unit, "mg/dL");

        let (metric, value, unit) = parse_vital_entry("heart rate: 72").unwrap();
        assert_eq!(metric, "heart_rate");
        assert_eq!(value, 72.0);
        assert_eq!(unit, "");
    }

    #[test]
    fn malformed_vital_text_is_a_validation_error() {
        for bad in ["", "glucose", "glucose: high", ": 65"] {
            let err = parse_vital_entry(bad).unwrap_err();
            assert!(err.is_rejection(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn build_signal_rejects_non_finite_values() {
        let err = build_signal(
            &pid(),
            Submission::Vital {
                metric: "glucose".into(),
                value: f64::NAN,
                unit: "mg/dL".into(),
            },
            Utc::now(),
        )
        .unwrap_err();
        assert!(err.is_rejection());
    }

    #[test]
    fn build_signal_rejects_empty_symptom_text() {
        let err = build_signal(
            &pid(),
            Submission::Symptom { text: "   ".into() },
            Utc::now(),
        )
        .unwrap_err();
        assert!(err.is_rejection());
    }

    #[test]
    fn build_signal_maps_unknown_metrics_without_error() {
        let signal = build_signal(
            &pid(),
            Submission::Vital {
                metric: "ketones".into(),
                value: 4.0,
                unit: "mmol/L".into(),
            },
            Utc::now(),
        )
        .unwrap();
        match signal.body {
            SignalBody::VitalReading { metric, .. } => {
                assert_eq!(metric, VitalMetric::Other("ketones".into()))
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn ephemeral_files_are_staged_and_clearable() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_ephemeral(dir.path(), b"bytes", MediaKind::Photo).unwrap();
        assert!(path.exists());
        assert_eq!(path.extension().unwrap(), "png");

        assert_eq!(clear_stale_ephemeral(dir.path()), 1);
        assert!(!path.exists());
    }

    #[test]
    fn empty_media_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = save_ephemeral(dir.path(), b"", MediaKind::Audio).unwrap_err();
        assert!(err.is_rejection());
    }
}

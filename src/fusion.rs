//! Fusion of the rule verdict with the external anomaly assessment.
//!
//! The combinator is an explicit min over the severity total order: the more
//! urgent side always wins, so the external score can escalate but can never
//! downgrade a rule-triggered severity. If the reasoning call failed, fusion
//! proceeds on the rule verdict alone with the degraded flag set.

use chrono::{DateTime, Utc};

use crate::clients::SummaryOutcome;
use crate::rules::RuleVerdict;
use crate::types::{PatientId, Severity, Verdict, VerdictSource};

/// Anomaly score above which the external layer escalates to at least
/// warning.
pub const ANOMALY_WARNING_FLOOR: f64 = 0.7;
/// Anomaly score above which a mild anomaly is noted (no severity change
/// unless the rules produced info).
pub const ANOMALY_NOTE_FLOOR: f64 = 0.4;

/// Severity the anomaly score maps to on its own.
fn anomaly_severity(score: f64) -> Severity {
    if score > ANOMALY_WARNING_FLOOR {
        Severity::Warning
    } else {
        // A mild anomaly (0.4, 0.7] is informational only; it never moves a
        // rule verdict that already said warning or critical.
        Severity::Info
    }
}

/// Combine the rule verdict with the external summary into the final verdict.
///
/// `summary` is `None` when the external call failed or timed out; the
/// verdict then carries `degraded = true` and the rule outcome stands. This
/// path must never block a rule-triggered critical.
pub fn fuse(
    patient_id: PatientId,
    rule: RuleVerdict,
    summary: Option<SummaryOutcome>,
    evaluated_at: DateTime<Utc>,
) -> Verdict {
    match summary {
        Some(outcome) => {
            let score = outcome.anomaly_score.clamp(0.0, 1.0);
            let severity = rule.severity.more_urgent(anomaly_severity(score));

            let escalated = severity != rule.severity;
            let noted = score > ANOMALY_NOTE_FLOOR;
            let source = if escalated && rule.rule_id.is_none() {
                VerdictSource::AnomalyOnly
            } else if escalated || (noted && rule.rule_id.is_some()) {
                VerdictSource::RuleEngineAndAnomaly
            } else {
                VerdictSource::RuleEngine
            };

            let reason = if escalated && rule.rule_id.is_none() {
                format!("Anomaly pattern detected (score {score:.2}).")
            } else if noted {
                format!("{} (anomaly score: {score:.2})", rule.reason)
            } else {
                rule.reason.clone()
            };

            Verdict {
                patient_id,
                severity,
                reason,
                source,
                rule_id: rule.rule_id.map(str::to_string),
                anomaly_score: Some(score),
                summary: if outcome.summary.is_empty() {
                    None
                } else {
                    Some(outcome.summary)
                },
                degraded: false,
                evaluated_at,
            }
        }
        None => Verdict {
            patient_id,
            severity: rule.severity,
            reason: rule.reason.clone(),
            source: VerdictSource::RuleEngine,
            rule_id: rule.rule_id.map(str::to_string),
            anomaly_score: None,
            summary: None,
            degraded: true,
            evaluated_at,
        },
    }
}

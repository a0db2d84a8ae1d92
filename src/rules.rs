//! Deterministic rule engine.
//!
//! Pure function of the latest readings: no I/O, no AI. The threshold table
//! is fixed and evaluated in priority order, first match wins; boundary
//! values are inclusive per the comparison operators. The anomaly layer can
//! escalate but never override anything decided here.

use crate::types::{Severity, VitalMetric};

/// Systolic BP at or above this is a hypertensive crisis.
pub const BP_SYSTOLIC_CRITICAL: f64 = 180.0;
/// Glucose at or below this is severe hypoglycemia.
pub const GLUCOSE_CRITICAL_LOW: f64 = 50.0;
/// Upper bound of the hypoglycemia warning band (50, 70].
pub const GLUCOSE_WARNING_LOW: f64 = 70.0;
/// Self-reported pain at or above this is an emergency.
pub const PAIN_CRITICAL: f64 = 9.0;
/// Sustained pain at or above this feeds the escalation trend rule.
pub const PAIN_TREND_FLOOR: f64 = 7.0;
/// Consecutive elevated pain reports required before the trend rule fires.
pub const PAIN_TREND_RUN: usize = 3;
/// SpO2 at or below this is severe hypoxia.
pub const SPO2_CRITICAL_LOW: f64 = 90.0;
/// Upper bound of the low-oxygen warning band (90, 94].
pub const SPO2_WARNING_LOW: f64 = 94.0;
/// Heart rate at or above this is tachycardia.
pub const HR_CRITICAL_HIGH: f64 = 150.0;
/// Heart rate at or below this is bradycardia.
pub const HR_CRITICAL_LOW: f64 = 40.0;

/// The most recent reading for one metric.
#[derive(Debug, Clone)]
pub struct Reading {
    pub metric: VitalMetric,
    pub value: f64,
    pub unit: String,
}

/// Verdict of the rule layer alone, before fusion.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleVerdict {
    pub severity: Severity,
    pub reason: String,
    /// Stable identifier of the rule that fired; `None` when nothing matched.
    pub rule_id: Option<&'static str>,
}

impl RuleVerdict {
    fn hit(severity: Severity, rule_id: &'static str, reason: String) -> Self {
        Self {
            severity,
            reason,
            rule_id: Some(rule_id),
        }
    }

    fn info(reason: &str) -> Self {
        Self {
            severity: Severity::Info,
            reason: reason.to_string(),
            rule_id: None,
        }
    }
}

fn value_of(latest: &[Reading], metric: &VitalMetric) -> Option<f64> {
    latest.iter().find(|r| &r.metric == metric).map(|r| r.value)
}

/// Evaluate the fixed threshold table against the latest reading per metric.
///
/// `recent_pain` is the rolling pain history, most recent first, consulted
/// only by the trend rule and only when no instantaneous threshold fired.
pub fn evaluate(latest: &[Reading], recent_pain: &[f64]) -> RuleVerdict {
    if let Some(v) = value_of(latest, &VitalMetric::BpSystolic) {
        if v >= BP_SYSTOLIC_CRITICAL {
            return RuleVerdict::hit(
                Severity::Critical,
                "bp_systolic_high",
                format!("Systolic BP {v} mmHg >= {BP_SYSTOLIC_CRITICAL}. Hypertensive crisis."),
            );
        }
    }

    if let Some(v) = value_of(latest, &VitalMetric::Glucose) {
        if v <= GLUCOSE_CRITICAL_LOW {
            return RuleVerdict::hit(
                Severity::Critical,
                "glucose_critical_low",
                format!("Blood glucose {v} mg/dL <= {GLUCOSE_CRITICAL_LOW}. Severe hypoglycemia."),
            );
        }
    }

    if let Some(v) = value_of(latest, &VitalMetric::PainLevel) {
        if v >= PAIN_CRITICAL {
            return RuleVerdict::hit(
                Severity::Critical,
                "pain_critical",
                format!("Pain level {v}/10. Severe pain."),
            );
        }
    }

    if let Some(v) = value_of(latest, &VitalMetric::OxygenSaturation) {
        if v <= SPO2_CRITICAL_LOW {
            return RuleVerdict::hit(
                Severity::Critical,
                "spo2_critical_low",
                format!("SpO2 {v}% <= {SPO2_CRITICAL_LOW}%. Severe hypoxia."),
            );
        }
    }

    if let Some(v) = value_of(latest, &VitalMetric::HeartRate) {
        if v >= HR_CRITICAL_HIGH {
            return RuleVerdict::hit(
                Severity::Critical,
                "heart_rate_high",
                format!("Heart rate {v} bpm >= {HR_CRITICAL_HIGH}. Tachycardia."),
            );
        }
        if v <= HR_CRITICAL_LOW {
            return RuleVerdict::hit(
                Severity::Critical,
                "heart_rate_low",
                format!("Heart rate {v} bpm <= {HR_CRITICAL_LOW}. Bradycardia."),
            );
        }
    }

    if let Some(v) = value_of(latest, &VitalMetric::Glucose) {
        if v > GLUCOSE_CRITICAL_LOW && v <= GLUCOSE_WARNING_LOW {
            return RuleVerdict::hit(
                Severity::Warning,
                "glucose_low",
                format!("Blood glucose {v} mg/dL <= {GLUCOSE_WARNING_LOW}. Low glucose."),
            );
        }
    }

    if let Some(v) = value_of(latest, &VitalMetric::OxygenSaturation) {
        if v > SPO2_CRITICAL_LOW && v <= SPO2_WARNING_LOW {
            return RuleVerdict::hit(
                Severity::Warning,
                "spo2_low",
                format!("SpO2 {v}% <= {SPO2_WARNING_LOW}%. Low oxygen."),
            );
        }
    }

    // Trend rule: sustained elevated pain escalates even when no single
    // reading crosses the emergency threshold. Runs last so it can never
    // mask an instantaneous rule.
    if pain_escalation(recent_pain) {
        return RuleVerdict::hit(
            Severity::Warning,
            "pain_escalation",
            format!(
                "Pain >= {PAIN_TREND_FLOOR}/10 in {PAIN_TREND_RUN} consecutive reports. Escalating trend."
            ),
        );
    }

    if latest
        .iter()
        .all(|r| matches!(r.metric, VitalMetric::Other(_)))
        && !latest.is_empty()
    {
        return RuleVerdict::info("unrecognized metric");
    }

    RuleVerdict::info("All vitals within normal range.")
}

/// True when the most recent `PAIN_TREND_RUN` pain reports all sit at or
/// above the trend floor.
fn pain_escalation(recent_pain: &[f64]) -> bool {
    recent_pain.len() >= PAIN_TREND_RUN
        && recent_pain
            .iter()
            .take(PAIN_TREND_RUN)
            .all(|&p| p >= PAIN_TREND_FLOOR)
}

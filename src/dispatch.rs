//! Alert dispatch: verdict → delivery actions → receipt.
//!
//! Severity decides the action set (1 fans out to every channel, 2 is a
//! single notification, 3 is log-only). Repeat alerts inside the cooldown
//! window are suppressed with a `deduplicated` audit record, except a new,
//! distinct critical condition, which always fires. Every action is
//! attempted independently; one channel being down never blocks the others
//! or the audit write. Exactly one terminal `delivery_outcome` record is
//! appended per created alert, even when every action fails.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::clients::{AlertMessage, DeliveryChannel};
use crate::error::PipelineError;
use crate::store::StateDb;
use crate::types::{
    ActionOutcome, Alert, AlertAction, AuditKind, Receipt, Severity, Verdict,
};
use crate::util::{truncate, Clock};

/// Delivery channels by action. A missing channel records a per-action
/// failure rather than panicking or blocking the rest.
#[derive(Default, Clone)]
pub struct ChannelSet {
    pub telegram: Option<Arc<dyn DeliveryChannel>>,
    pub tts: Option<Arc<dyn DeliveryChannel>>,
    pub doctor: Option<Arc<dyn DeliveryChannel>>,
}

impl ChannelSet {
    fn for_action(&self, action: AlertAction) -> Option<&Arc<dyn DeliveryChannel>> {
        match action {
            AlertAction::Telegram => self.telegram.as_ref(),
            AlertAction::Tts => self.tts.as_ref(),
            AlertAction::DoctorNotify => self.doctor.as_ref(),
        }
    }
}

pub struct Dispatcher {
    store: Arc<StateDb>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    channels: ChannelSet,
    cooldown: chrono::Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<StateDb>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
        channels: ChannelSet,
        cooldown_secs: u64,
    ) -> Self {
        Self {
            store,
            audit,
            clock,
            channels,
            cooldown: chrono::Duration::seconds(cooldown_secs as i64),
        }
    }

    /// Convert a verdict into zero or one alert and exactly one receipt.
    pub async fn dispatch(&self, verdict: &Verdict) -> Result<Receipt, PipelineError> {
        if verdict.severity == Severity::Info {
            return self.log_info(verdict);
        }

        let dedup_key = dedup_key(verdict);
        if let Some(previous) = self.store.last_alert_with_key(&dedup_key)? {
            let age = self.clock.now() - previous;
            if age < self.cooldown {
                return self.suppress(verdict, &dedup_key, age.num_seconds());
            }
        }

        let alert_id = format!("al-{}", Uuid::new_v4());
        let actions = AlertAction::for_severity(verdict.severity);
        let message = AlertMessage {
            severity: verdict.severity,
            text: format!(
                "{}\n\nPatient: {}\n{}",
                verdict.reason,
                verdict.patient_id.redacted(),
                match verdict.severity {
                    Severity::Critical => "Action required immediately.",
                    _ => "Monitor closely.",
                }
            ),
        };

        let mut outcomes = Vec::with_capacity(actions.len());
        for &action in actions {
            outcomes.push(self.attempt(action, &message).await);
        }

        let alert = Alert {
            id: alert_id.clone(),
            patient_id: verdict.patient_id.clone(),
            severity: verdict.severity,
            reason: verdict.reason.clone(),
            actions: actions.to_vec(),
            dedup_key,
            created_at: self.clock.now(),
            outcomes,
        };
        self.store.record_alert(&alert)?;

        let actions_taken: Vec<&str> = alert
            .outcomes
            .iter()
            .filter(|o| o.ok)
            .map(|o| o.action.label())
            .collect();
        let failures: Vec<serde_json::Value> = alert
            .outcomes
            .iter()
            .filter(|o| !o.ok)
            .map(|o| json!({ "action": o.action.label(), "detail": o.detail }))
            .collect();

        // Terminal receipt record. This is the one append that must exist
        // for every created alert.
        let audit_seq = self.audit.append(
            AuditKind::DeliveryOutcome,
            &alert_id,
            json!({
                "patient": verdict.patient_id.redacted(),
                "severity": verdict.severity.as_u8(),
                "reason": truncate(&verdict.reason, 200),
                "source": verdict.source.label(),
                "rule_id": verdict.rule_id,
                "anomaly_score": verdict.anomaly_score,
                "degraded": verdict.degraded,
                "actions_taken": actions_taken,
                "failures": failures,
                "delivery_outcome": if failures.is_empty() { "delivered" } else if actions_taken.is_empty() { "failed" } else { "partial" },
                "raw_data_retained": false,
            }),
        )?;

        log::info!(
            "dispatch: alert {} severity={} actions_ok={}/{}",
            alert.id,
            verdict.severity,
            actions_taken.len(),
            alert.outcomes.len()
        );

        Ok(Receipt {
            alert: Some(alert),
            suppressed: false,
            audit_seq,
        })
    }

    async fn attempt(&self, action: AlertAction, message: &AlertMessage) -> ActionOutcome {
        match self.channels.for_action(action) {
            Some(channel) => match channel.send(message).await {
                Ok(()) => ActionOutcome {
                    action,
                    ok: true,
                    detail: None,
                },
                Err(e) => {
                    log::warn!("dispatch: {} failed: {}", action.label(), e);
                    ActionOutcome {
                        action,
                        ok: false,
                        detail: Some(e.to_string()),
                    }
                }
            },
            None => ActionOutcome {
                action,
                ok: false,
                detail: Some("channel not configured".to_string()),
            },
        }
    }

    fn log_info(&self, verdict: &Verdict) -> Result<Receipt, PipelineError> {
        let audit_seq = self.audit.append(
            AuditKind::InfoLogged,
            &format!("verdict-{}", Uuid::new_v4().simple()),
            json!({
                "patient": verdict.patient_id.redacted(),
                "severity": verdict.severity.as_u8(),
                "reason": truncate(&verdict.reason, 200),
                "source": verdict.source.label(),
                "anomaly_score": verdict.anomaly_score,
                "degraded": verdict.degraded,
                "actions_taken": Vec::<String>::new(),
            }),
        )?;
        Ok(Receipt {
            alert: None,
            suppressed: false,
            audit_seq,
        })
    }

    fn suppress(
        &self,
        verdict: &Verdict,
        dedup_key: &str,
        age_secs: i64,
    ) -> Result<Receipt, PipelineError> {
        log::info!(
            "dispatch: suppressed duplicate {} for {} ({}s old)",
            dedup_key,
            verdict.patient_id.redacted(),
            age_secs
        );
        let audit_seq = self.audit.append(
            AuditKind::Deduplicated,
            &format!("dedup-{}", Uuid::new_v4().simple()),
            json!({
                "patient": verdict.patient_id.redacted(),
                "severity": verdict.severity.as_u8(),
                "dedup_key": dedup_key,
                "seconds_since_original": age_secs,
            }),
        )?;
        Ok(Receipt {
            alert: None,
            suppressed: true,
            audit_seq,
        })
    }
}

/// Dedup fingerprint. Warnings collapse per patient + severity bucket.
/// Criticals additionally key on the triggering condition, so a repeat of
/// the *same* emergency is suppressed but a new distinct critical is never
/// held back by the cooldown.
fn dedup_key(verdict: &Verdict) -> String {
    match verdict.severity {
        Severity::Critical => format!(
            "{}:{}:{}",
            verdict.patient_id.as_str(),
            verdict.severity.as_u8(),
            verdict.rule_id.as_deref().unwrap_or("anomaly")
        ),
        _ => format!(
            "{}:{}",
            verdict.patient_id.as_str(),
            verdict.severity.as_u8()
        ),
    }
}

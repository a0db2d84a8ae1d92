//! Error types for the decision & alert pipeline.
//!
//! Errors are classified by what the pipeline does next:
//! - Validation: rejected before the rule engine, surfaced to the caller
//! - External service trouble: degraded-mode fusion, audited, never fatal
//! - Delivery failure: per-action, recorded in the receipt
//! - Audit write failure: fatal for the cycle. An unrecorded alert cannot
//!   be trusted, so the cycle halts and retries whole

use thiserror::Error;

use crate::audit::AuditError;
use crate::store::DbError;

/// Error taxonomy for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    // Rejected before reaching the rule engine; not audited as a clinical event
    #[error("Invalid signal: {0}")]
    Validation(String),

    #[error("Unknown patient: {0}")]
    UnknownPatient(String),

    // Degraded-mode triggers
    #[error("External service timed out after {0} seconds")]
    ExternalTimeout(u64),

    #[error("External service failure: {0}")]
    ExternalFailure(String),

    // Per-action, never blocks other actions or the audit write
    #[error("Delivery failed on {channel}: {detail}")]
    Delivery { channel: String, detail: String },

    // An asset alive past its deadline: systemic bug, not a patient condition
    #[error("Retention violation: asset {0} outlived its deadline")]
    RetentionViolation(String),

    // If the audit trail cannot be extended, nothing in this step is trusted
    #[error("Audit write failed: {0}")]
    AuditWrite(#[from] AuditError),

    #[error("State store error: {0}")]
    Store(#[from] DbError),
}

impl PipelineError {
    /// True for failures the pipeline absorbs by degrading (fusion proceeds
    /// on rules alone, dispatch records a partial receipt).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::ExternalTimeout(_)
                | PipelineError::ExternalFailure(_)
                | PipelineError::Delivery { .. }
                | PipelineError::RetentionViolation(_)
        )
    }

    /// True when the current evaluation cycle must halt and be retried
    /// whole rather than proceed with an untrustworthy trail.
    pub fn halts_cycle(&self) -> bool {
        matches!(self, PipelineError::AuditWrite(_))
    }

    /// True for caller mistakes surfaced synchronously and never audited
    /// as clinical events.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            PipelineError::Validation(_) | PipelineError::UnknownPatient(_)
        )
    }
}

//! Error types for speql.
//!
//! All fallible operations in the crate return `Result<T, SpeqlError>`.
//! Errors are classified (§7 of the design doc) into categories that
//! determine retry behaviour and whether the orchestrator should surface a
//! user-visible modification or silently downgrade to an empty frame.
//!
//! # Error Classification
//!
//! - **ParseReject / RewriteMiss** — not really "errors": the target SQL
//!   could not be extracted or no cached fragment matched. The caller falls
//!   back to the unmodified query.
//! - **Warehouse{TimeoutCancel,Other}** — come back from the Create Engine.
//!   A timeout-cancel is retried with a smaller sample; anything else is
//!   terminal for the current script.
//! - **Llm{Timeout,Transport}** — the Debug loop treats these as a failed
//!   iteration, not a crash.
//! - **ValidationFailure** — a candidate rule set failed local validation;
//!   non-fatal, the Debug loop just keeps iterating until budget runs out.
//! - **CancelledByPreemption** — observed at every await boundary; the
//!   caller must return without mutating shared state.
//! - **ContractViolation** — an invariant (pool, rewriter) was broken. This
//!   is a bug, not a user-facing condition, and is propagated for
//!   visibility rather than swallowed.

use std::fmt;

/// Primary error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum SpeqlError {
    /// The target SQL is not a single SELECT/UNION/INTERSECT the clause
    /// extractor can reason about.
    #[error("query could not be extracted into a clause tree: {0}")]
    ParseReject(String),

    /// No cached origin in the MRU list matched the target; this is the
    /// normal "no cache hit" outcome, not a failure.
    #[error("no cached fragment matched the target query")]
    RewriteMiss,

    /// The warehouse cancelled the in-flight query (timeout or preemption).
    /// Retryable with a smaller sample ratio, up to `max_iteration`.
    #[error("warehouse query cancelled by timeout")]
    WarehouseTimeoutCancel,

    /// Any other warehouse-side failure. Terminal for this script; prior
    /// pool/cache state is preserved.
    #[error("warehouse error: {0}")]
    WarehouseOther(String),

    /// The LLM transport did not respond in time.
    #[error("Inference timeout")]
    LlmTimeout,

    /// The LLM transport returned a transport-level error (HTTP failure,
    /// malformed response envelope, etc).
    #[error("Error: LLM API error: {0}")]
    LlmTransport(String),

    /// A candidate rule set or rewrite failed local validation.
    #[error("validation failed: {0}")]
    ValidationFailure(String),

    /// This task's job-slot holder was preempted by a newer request.
    /// Must terminate silently with no state mutation.
    #[error("cancelled by preemption")]
    CancelledByPreemption,

    /// An internal invariant (pool, rewriter) was violated. Indicates a bug.
    #[error("contract violation: {0}")]
    ContractViolation(String),
}

impl SpeqlError {
    /// Whether this error is retryable by the Create Engine / Debug loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SpeqlError::WarehouseTimeoutCancel
                | SpeqlError::LlmTimeout
                | SpeqlError::LlmTransport(_)
                | SpeqlError::ValidationFailure(_)
        )
    }

    /// Whether the orchestrator should downgrade this to a silent, empty
    /// (`show=false`) frame rather than surface it to the user (§7).
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            SpeqlError::CancelledByPreemption
                | SpeqlError::RewriteMiss
                | SpeqlError::WarehouseOther(_)
        )
    }

    /// Classify the error for monitoring and alerting.
    pub fn kind(&self) -> SpeqlErrorKind {
        match self {
            SpeqlError::ParseReject(_) | SpeqlError::RewriteMiss => SpeqlErrorKind::Input,
            SpeqlError::WarehouseTimeoutCancel | SpeqlError::WarehouseOther(_) => {
                SpeqlErrorKind::Warehouse
            }
            SpeqlError::LlmTimeout | SpeqlError::LlmTransport(_) => SpeqlErrorKind::Llm,
            SpeqlError::ValidationFailure(_) => SpeqlErrorKind::Validation,
            SpeqlError::CancelledByPreemption => SpeqlErrorKind::Preemption,
            SpeqlError::ContractViolation(_) => SpeqlErrorKind::Internal,
        }
    }
}

/// Classification of error severity/kind for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeqlErrorKind {
    Input,
    Warehouse,
    Llm,
    Validation,
    Preemption,
    Internal,
}

impl fmt::Display for SpeqlErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeqlErrorKind::Input => write!(f, "INPUT"),
            SpeqlErrorKind::Warehouse => write!(f, "WAREHOUSE"),
            SpeqlErrorKind::Llm => write!(f, "LLM"),
            SpeqlErrorKind::Validation => write!(f, "VALIDATION"),
            SpeqlErrorKind::Preemption => write!(f, "PREEMPTION"),
            SpeqlErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

pub type Result<T> = std::result::Result<T, SpeqlError>;

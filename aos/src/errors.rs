//! Kernel error types.
//!
//! Two layers live here: [`ErrorKind`], the stable attempt-level taxonomy that
//! is persisted in the evidence logs and must never change meaning across
//! releases, and [`KernelError`], the crate-wide error enum returned by every
//! fallible API.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable classification of why an attempt (or a run) did not succeed.
///
/// The wire form is the snake_case name; these strings appear in persisted
/// events and in CLI output, so variants are append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Required parameter absent; attempt skipped, never retried.
    MissingInput,
    /// Policy rejected the attempt before invocation; skipped.
    GovernanceBlock,
    /// Operator-mode step lacks a valid approval; skipped.
    ApprovalRequired,
    /// Runtime safety scan failure; the whole run aborts.
    PolicyViolation,
    /// Transient connectivity / 5xx-equivalent; retried then falls back.
    ServiceUnavailable,
    /// Deadline exceeded; retried then falls back.
    ToolTimeout,
    /// Response failed an acceptance post-condition; falls back, no retry.
    ContractViolation,
    /// Admission queue full; surfaced to the caller, not retried internally.
    Backpressure,
    /// Unexpected failure; attempt fails, run falls back.
    InternalError,
}

impl ErrorKind {
    /// Whether the runtime may retry an attempt that failed with this kind.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::ServiceUnavailable | ErrorKind::ToolTimeout)
    }

    /// Kinds that halt the run instead of advancing the fallback pointer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::PolicyViolation)
    }

    /// Kinds recorded as `skipped` rather than `failed` (eligibility, not error).
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            ErrorKind::MissingInput | ErrorKind::GovernanceBlock | ErrorKind::ApprovalRequired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingInput => "missing_input",
            ErrorKind::GovernanceBlock => "governance_block",
            ErrorKind::ApprovalRequired => "approval_required",
            ErrorKind::PolicyViolation => "policy_violation",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::ToolTimeout => "tool_timeout",
            ErrorKind::ContractViolation => "contract_violation",
            ErrorKind::Backpressure => "backpressure",
            ErrorKind::InternalError => "internal_error",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "missing_input" => ErrorKind::MissingInput,
            "governance_block" => ErrorKind::GovernanceBlock,
            "approval_required" => ErrorKind::ApprovalRequired,
            "policy_violation" => ErrorKind::PolicyViolation,
            "service_unavailable" => ErrorKind::ServiceUnavailable,
            "tool_timeout" => ErrorKind::ToolTimeout,
            "contract_violation" => ErrorKind::ContractViolation,
            "backpressure" => ErrorKind::Backpressure,
            _ => ErrorKind::InternalError,
        }
    }

    /// Stable process exit code for surfacing this kind from the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::GovernanceBlock => 10,
            ErrorKind::MissingInput => 11,
            ErrorKind::ServiceUnavailable
            | ErrorKind::ToolTimeout
            | ErrorKind::ContractViolation
            | ErrorKind::InternalError => 12,
            ErrorKind::ApprovalRequired => 13,
            ErrorKind::PolicyViolation => 14,
            ErrorKind::Backpressure => 15,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("index error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("unknown run '{0}'")]
    UnknownRun(String),

    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("unknown snapshot '{0}'")]
    UnknownSnapshot(String),

    #[error("contract lint failed for '{service}': {}", problems.join("; "))]
    ContractLint { service: String, problems: Vec<String> },

    #[error("run cancelled")]
    Cancelled,

    /// Attempt-level failure carrying the stable taxonomy kind.
    #[error("{kind}: {message}")]
    Attempt {
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },
}

impl KernelError {
    /// Non-retryable attempt failure.
    pub fn attempt(kind: ErrorKind, message: impl Into<String>) -> Self {
        KernelError::Attempt {
            kind,
            message: message.into(),
            retryable: false,
        }
    }

    /// Transient attempt failure the retry chain may re-run.
    pub fn transient(kind: ErrorKind, message: impl Into<String>) -> Self {
        KernelError::Attempt {
            kind,
            message: message.into(),
            retryable: kind.is_transient(),
        }
    }

    /// The attempt-level kind, if this error maps onto the taxonomy.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            KernelError::Attempt { kind, .. } => Some(*kind),
            KernelError::Cancelled => None,
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, KernelError::Attempt { retryable: true, .. })
    }
}

//! Error types for vmshift.
//!
//! Two layers of errors exist:
//!
//! - [`VmshiftError`] is the crate-wide error type returned by library
//!   operations (plan validation, state persistence, orchestration).
//! - [`StageError`] is the structured failure value returned by stage
//!   handlers. Handlers never panic and never throw out-of-band; the
//!   pipeline executor inspects `kind` and `retryable` to decide between
//!   retry, VM failure, and batch-level propagation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VmshiftError>;

#[derive(Error, Debug)]
pub enum VmshiftError {
    /// Plan or config invariant broken. Fatal before any VM is launched.
    #[error("Validation error: {0}")]
    Validation(String),

    /// VM-level pre-validation failure (RDM disk, unsupported OS, disk too
    /// large). Marks that VM failed at the validate stage; others proceed.
    #[error("Preflight check failed for '{vm}': {message}")]
    Preflight { vm: String, message: String },

    /// Network/API timeout, rate limit, or a subprocess exit known to be
    /// retryable.
    #[error("Transient infrastructure error: {0}")]
    TransientInfra(String),

    /// Expected artifact missing or corrupt on resume.
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// Unrecoverable stage failure (e.g. adaptation tool not found).
    #[error("Fatal stage error: {0}")]
    FatalStage(String),

    /// Cooperative stop.
    #[error("Cancelled")]
    Cancelled,

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Classification of a stage failure, persisted with the VM state so a
/// report can show what kind of thing went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    Preflight,
    TransientInfra,
    Artifact,
    Fatal,
    Cancelled,
}

impl std::fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageErrorKind::Preflight => "preflight",
            StageErrorKind::TransientInfra => "transient_infra",
            StageErrorKind::Artifact => "artifact",
            StageErrorKind::Fatal => "fatal",
            StageErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Structured failure returned by a stage handler.
///
/// Handlers return this instead of mutating state; the executor owns all
/// state transitions.
#[derive(Debug, Clone, Error)]
#[error("{kind} error in stage: {message}")]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl StageError {
    pub fn preflight(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Preflight,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::TransientInfra,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn artifact(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Artifact,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Fatal,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: StageErrorKind::Cancelled,
            message: "cancelled".to_string(),
            retryable: false,
        }
    }
}

impl From<StageError> for VmshiftError {
    fn from(e: StageError) -> Self {
        match e.kind {
            StageErrorKind::Preflight => VmshiftError::Preflight {
                vm: String::new(),
                message: e.message,
            },
            StageErrorKind::TransientInfra => VmshiftError::TransientInfra(e.message),
            StageErrorKind::Artifact => VmshiftError::Artifact(e.message),
            StageErrorKind::Fatal => VmshiftError::FatalStage(e.message),
            StageErrorKind::Cancelled => VmshiftError::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(StageError::transient("timeout").retryable);
        assert!(StageError::artifact("missing qcow2").retryable);
        assert!(!StageError::fatal("virt-customize not found").retryable);
        assert!(!StageError::preflight("RDM disk").retryable);
    }

    #[test]
    fn kind_display_is_snake_case() {
        assert_eq!(StageErrorKind::TransientInfra.to_string(), "transient_infra");
        assert_eq!(StageErrorKind::Fatal.to_string(), "fatal");
    }
}

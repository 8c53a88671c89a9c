//! Crate-wide error taxonomy and small shared types.
//!
//! Errors follow the propagation policy used throughout the pipeline:
//! per-chunk failures are absorbed into [`crate::diagnostics::JobDiagnostics`]
//! and never surface as `Err`; per-document failures abort the ingestion job;
//! configuration problems fail fast at startup.

use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;

/// Top-level error for ingestion and retrieval operations.
#[derive(Debug, Error)]
pub enum LoomError {
    /// The input document was rejected before chunking (empty, unsupported kind).
    #[error("invalid input: {0}")]
    Input(String),

    /// An external provider (chat or embedding) failed.
    #[error("provider error ({provider}): {message}")]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// A provider call exceeded its per-request or per-stage budget.
    #[error("{what} timed out after {budget_ms}ms")]
    Timeout { what: &'static str, budget_ms: u64 },

    /// Model output could not be parsed into the expected schema,
    /// even after the repair retry.
    #[error("unparseable model output: {0}")]
    Parse(String),

    /// Graph store failure after the retry budget was exhausted.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A proposed edge or link violated the ontology.
    #[error("ontology violation: {0}")]
    Ontology(String),

    /// Configuration was missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The job's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Filesystem failure (prompt templates, config files).
    #[error("io error: {0}")]
    Io(String),

    /// JSON (de)serialization failure outside of model-output parsing.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<std::io::Error> for LoomError {
    fn from(err: std::io::Error) -> Self {
        LoomError::Io(err.to_string())
    }
}

impl LoomError {
    /// Short taxonomy tag for job-status reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            LoomError::Input(_) => "input",
            LoomError::Provider { .. } => "provider",
            LoomError::Timeout { .. } => "timeout",
            LoomError::Parse(_) => "parse",
            LoomError::Store(_) => "store",
            LoomError::Ontology(_) => "ontology",
            LoomError::Config(_) => "config",
            LoomError::Cancelled => "cancelled",
            LoomError::Io(_) => "io",
            LoomError::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(LoomError::Input("empty".into()).kind(), "input");
        assert_eq!(LoomError::Cancelled.kind(), "cancelled");
        assert_eq!(
            LoomError::Timeout {
                what: "chat",
                budget_ms: 100
            }
            .kind(),
            "timeout"
        );
    }
}

//! Error types for the export pipeline.
//!
//! Stage handlers return [`PipelineError`]; the engine tags it with the stage
//! that raised it as a [`PipelineFailure`] and decides between retry and
//! terminal failure. Callers of the engine never see either type directly:
//! they receive a `PipelineResult` with the errors recorded.

use crate::core::PipelineStage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The source could not be fetched, or its kind is not supported.
    #[error("Source fetch failed: {0}")]
    SourceFetch(String),

    /// The fetched document is malformed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// An artifact generator reported failure.
    #[error("Artifact generation failed: {0}")]
    Generation(String),

    /// Finalizing outputs failed. Degrades to a warning.
    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    /// The run was cancelled by its owner.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// Any other failure during a stage.
    #[error("{0}")]
    Transient(String),

    /// A stage exceeded the configured stage timeout.
    #[error("Stage timed out after {0}s")]
    Timeout(f64),

    /// The state store failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Returns true if the engine may retry after this error.
    ///
    /// Everything except cancellation is retried while attempts remain, even
    /// failures that will repeat identically (such as an unsupported source
    /// kind); those exhaust `max_retries` and end the run as failed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled(_))
    }

    /// Returns the taxonomy name of the error.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SourceFetch(_) => "SourceFetchFailure",
            Self::Validation(_) => "ValidationFailure",
            Self::Generation(_) => "GenerationFailure",
            Self::Cleanup(_) => "CleanupFailure",
            Self::Cancelled(_) => "Cancelled",
            Self::Transient(_)
            | Self::Timeout(_)
            | Self::Store(_)
            | Self::Serialization(_)
            | Self::Io(_) => "RetryableTransient",
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A stage error tagged with the stage that raised it.
#[derive(Debug, Error)]
#[error("Stage '{stage}' failed: {message}")]
pub struct PipelineFailure {
    /// The error message.
    pub message: String,
    /// The stage that failed.
    pub stage: PipelineStage,
    /// The underlying error.
    #[source]
    pub error: PipelineError,
    /// Diagnostic context.
    pub context: HashMap<String, serde_json::Value>,
}

impl PipelineFailure {
    /// Wraps an error raised by `stage`.
    #[must_use]
    pub fn new(stage: PipelineStage, error: PipelineError) -> Self {
        let mut context = HashMap::new();
        context.insert("error_kind".to_string(), serde_json::json!(error.kind()));
        Self {
            message: error.to_string(),
            stage,
            error,
            context,
        }
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Returns true if the engine may retry the run.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("message".to_string(), serde_json::json!(self.message));
        map.insert("stage".to_string(), serde_json::json!(self.stage.as_str()));
        if !self.context.is_empty() {
            let context_map: serde_json::Map<String, serde_json::Value> = self
                .context
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            map.insert("context".to_string(), serde_json::Value::Object(context_map));
        }
        map
    }
}

/// Errors raised by state store backends.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("State store unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected an operation.
    #[error("State store error: {0}")]
    Backend(String),

    /// A stored record could not be encoded or decoded.
    #[error("State record serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_cancellation_is_not_retryable() {
        assert!(PipelineError::SourceFetch("x".into()).is_retryable());
        assert!(PipelineError::Validation("x".into()).is_retryable());
        assert!(PipelineError::Generation("x".into()).is_retryable());
        assert!(PipelineError::Timeout(1.0).is_retryable());
        assert!(!PipelineError::Cancelled("user".into()).is_retryable());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(PipelineError::SourceFetch("x".into()).kind(), "SourceFetchFailure");
        assert_eq!(PipelineError::Cleanup("x".into()).kind(), "CleanupFailure");
        assert_eq!(
            PipelineError::Store(StoreError::Backend("down".into())).kind(),
            "RetryableTransient"
        );
    }

    #[test]
    fn test_failure_carries_stage() {
        let failure = PipelineFailure::new(
            PipelineStage::FetchSource,
            PipelineError::SourceFetch("Unsupported source kind: invalid".into()),
        )
        .with_context_entry("source_kind", serde_json::json!("invalid"));

        assert_eq!(failure.stage, PipelineStage::FetchSource);
        assert!(failure.message.contains("invalid"));
        assert!(failure.to_string().contains("fetch_source"));

        let dict = failure.to_dict();
        assert_eq!(dict.get("stage").unwrap(), "fetch_source");
        assert_eq!(dict["context"]["error_kind"], "SourceFetchFailure");
        assert_eq!(dict["context"]["source_kind"], "invalid");
    }

    #[test]
    fn test_io_error_conversion() {
        let err: PipelineError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, PipelineError::Io(_)));
        assert!(err.is_retryable());
    }
}

//! Terminal result returned to callers of the engine.

use super::{ErrorEntry, PipelineContext};
use crate::core::PipelineStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// The outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Whether the run completed.
    pub success: bool,
    /// Run identifier.
    pub id: Uuid,
    /// Final status of the run.
    pub status: PipelineStatus,
    /// Output artifacts; empty unless the run succeeded.
    pub output_files: Vec<PathBuf>,
    /// Wall time from first start to completion.
    pub duration_seconds: f64,
    /// Validator quality score (0-100), 0 if validation never ran.
    pub quality_score: f64,
    /// Records counted by the validator.
    pub records_processed: u64,
    /// Errors recorded across all attempts.
    pub errors: Vec<ErrorEntry>,
    /// Warnings recorded across all attempts.
    pub warnings: Vec<ErrorEntry>,
    /// Final metadata.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PipelineResult {
    /// Builds the result for a terminal context.
    #[must_use]
    pub fn from_context(ctx: &PipelineContext) -> Self {
        let success = ctx.status == PipelineStatus::Completed;
        Self {
            success,
            id: ctx.id,
            status: ctx.status,
            output_files: if success {
                ctx.output_files.clone()
            } else {
                Vec::new()
            },
            duration_seconds: ctx.duration_seconds(),
            quality_score: ctx.quality_score().unwrap_or(0.0),
            records_processed: ctx.records_processed(),
            errors: ctx.errors.clone(),
            warnings: ctx.warnings.clone(),
            metadata: ctx.metadata.clone(),
        }
    }

    /// Returns the first error message, if any.
    #[must_use]
    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(|e| e.message.as_str())
    }
}

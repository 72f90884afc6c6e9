//! The per-run context record.

use crate::config::RunConfig;
use crate::core::{PipelineStage, PipelineStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use uuid::Uuid;

/// Well-known metadata keys used for stage hand-off.
pub mod keys {
    /// The run configuration.
    pub const CONFIG: &str = "config";
    /// Path of the fetched source document.
    pub const SOURCE_DOCUMENT_PATH: &str = "source_document_path";
    /// Title of the fetched source.
    pub const SOURCE_TITLE: &str = "source_title";
    /// Number of responses fetched.
    pub const RESPONSE_COUNT: &str = "response_count";
    /// Path of the validated document.
    pub const VALIDATED_DOCUMENT_PATH: &str = "validated_document_path";
    /// Validator summary.
    pub const VALIDATION_SUMMARY: &str = "validation_summary";
    /// Path of the spreadsheet artifact.
    pub const SPREADSHEET_PATH: &str = "spreadsheet_path";
    /// Rows written to the spreadsheet.
    pub const SPREADSHEET_ROWS: &str = "spreadsheet_rows";
    /// Path of the report artifact.
    pub const REPORT_PATH: &str = "report_path";
    /// Format of the report artifact.
    pub const REPORT_FORMAT: &str = "report_format";
    /// Compression outcome of the cleanup stage.
    pub const COMPRESSION: &str = "compression";
}

/// An error or warning recorded against a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// The stage the entry refers to.
    pub stage: PipelineStage,
    /// Human-readable message.
    pub message: String,
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Additional diagnostic data.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ErrorEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn new(stage: PipelineStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            timestamp: Utc::now(),
            extra: HashMap::new(),
        }
    }

    /// Attaches diagnostic data.
    #[must_use]
    pub fn with_extra(mut self, extra: HashMap<String, serde_json::Value>) -> Self {
        self.extra.extend(extra);
        self
    }
}

/// The mutable record describing one run.
///
/// This is also the persisted snapshot: the state store serializes it as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    /// Run identifier.
    pub id: Uuid,
    /// Who requested the run.
    pub owner: String,
    /// The source (form) being exported.
    pub source_id: String,
    /// Provider kind, as requested. Parsed by the fetch stage.
    pub source_kind: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the first attempt started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// The stage currently (or last) executing.
    pub current_stage: PipelineStage,
    /// Lifecycle status.
    pub status: PipelineStatus,
    /// Overall progress, 0-100.
    pub progress: f64,
    /// Per-stage progress, ordered by stage.
    #[serde(default)]
    pub stage_progress: BTreeMap<PipelineStage, f64>,
    /// Errors in the order they were recorded.
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    /// Warnings in the order they were recorded.
    #[serde(default)]
    pub warnings: Vec<ErrorEntry>,
    /// Retries performed so far.
    pub retry_count: u32,
    /// Retry bound.
    pub max_retries: u32,
    /// Temporary files owned by the run.
    #[serde(default)]
    pub temp_files: Vec<PathBuf>,
    /// Output artifacts.
    #[serde(default)]
    pub output_files: Vec<PathBuf>,
    /// Configuration and stage hand-off data.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PipelineContext {
    /// Creates a pending context with a fresh id.
    #[must_use]
    pub fn new(
        owner: impl Into<String>,
        source_id: impl Into<String>,
        source_kind: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            source_id: source_id.into(),
            source_kind: source_kind.into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            current_stage: PipelineStage::Initialized,
            status: PipelineStatus::Pending,
            progress: 0.0,
            stage_progress: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            retry_count: 0,
            max_retries,
            temp_files: Vec::new(),
            output_files: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Stores the run configuration in metadata.
    #[must_use]
    pub fn with_config(mut self, config: &RunConfig) -> Self {
        if let Ok(value) = serde_json::to_value(config) {
            self.metadata.insert(keys::CONFIG.to_string(), value);
        }
        self
    }

    /// Sets the creation time.
    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Returns the run configuration, or defaults if none is stored.
    #[must_use]
    pub fn run_config(&self) -> RunConfig {
        self.metadata
            .get(keys::CONFIG)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Returns a metadata value.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    /// Returns a metadata value as a string.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(serde_json::Value::as_str)
    }

    /// Returns a metadata value as a path.
    #[must_use]
    pub fn metadata_path(&self, key: &str) -> Option<PathBuf> {
        self.metadata_str(key).map(PathBuf::from)
    }

    /// Merges a stage's output into metadata.
    pub fn merge_metadata(&mut self, data: HashMap<String, serde_json::Value>) {
        self.metadata.extend(data);
    }

    /// Moves to `next`. Illegal transitions are logged and ignored.
    pub fn set_status(&mut self, next: PipelineStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                run_id = %self.id,
                from = %self.status,
                to = %next,
                "Ignoring illegal status transition"
            );
            return false;
        }
        self.status = next;
        true
    }

    /// Marks the start of an attempt.
    pub fn mark_running(&mut self) {
        if self.set_status(PipelineStatus::Running) && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Records that `stage` is about to run.
    pub fn begin_stage(&mut self, stage: PipelineStage) {
        self.current_stage = stage;
        if let Some(index) = stage.execution_index() {
            self.progress = stage_percentage(index);
        }
    }

    /// Records that `stage` finished and returns the new overall progress.
    pub fn complete_stage(&mut self, stage: PipelineStage) -> f64 {
        if let Some(index) = stage.execution_index() {
            self.progress = stage_percentage(index + 1);
        }
        self.stage_progress.insert(stage, 100.0);
        self.progress
    }

    /// Marks the run completed.
    pub fn mark_completed(&mut self) {
        if self.set_status(PipelineStatus::Completed) {
            self.current_stage = PipelineStage::Completed;
            self.progress = 100.0;
            self.completed_at = Some(Utc::now());
        }
    }

    /// Marks the run failed.
    pub fn mark_failed(&mut self) {
        if self.set_status(PipelineStatus::Failed) {
            self.completed_at = Some(Utc::now());
        }
    }

    /// Marks the run cancelled.
    pub fn mark_cancelled(&mut self) -> bool {
        let changed = self.set_status(PipelineStatus::Cancelled);
        if changed {
            self.completed_at = Some(Utc::now());
        }
        changed
    }

    /// Fails a run whose driver stopped before reaching a terminal state.
    ///
    /// A run caught between attempts is walked back to `Running` first, so
    /// every move stays on the transition table.
    pub fn mark_abandoned(&mut self, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        if self.status == PipelineStatus::Retrying {
            self.reset_for_retry();
        }
        if self.status == PipelineStatus::Pending {
            self.mark_running();
        }
        self.add_error(self.current_stage, message);
        self.mark_failed();
    }

    /// Enters the retry wait and bumps the retry counter.
    pub fn mark_retrying(&mut self) {
        if self.set_status(PipelineStatus::Retrying) {
            self.retry_count += 1;
        }
    }

    /// Resets per-attempt state for another attempt.
    ///
    /// Errors, warnings, and temp files accumulate across attempts. Stage
    /// hand-off data and output tracking are dropped (the engine deletes the
    /// files first); only the run configuration survives in metadata.
    pub fn reset_for_retry(&mut self) {
        if self.set_status(PipelineStatus::Pending) {
            self.current_stage = PipelineStage::Initialized;
            self.progress = 0.0;
            self.stage_progress.clear();
            self.output_files.clear();
            self.metadata.retain(|key, _| key == keys::CONFIG);
        }
    }

    /// Returns true if another attempt is allowed.
    #[must_use]
    pub const fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Appends an error entry.
    pub fn add_error(&mut self, stage: PipelineStage, message: impl Into<String>) {
        self.errors.push(ErrorEntry::new(stage, message));
    }

    /// Appends an error entry with diagnostic data.
    pub fn add_error_with(
        &mut self,
        stage: PipelineStage,
        message: impl Into<String>,
        extra: HashMap<String, serde_json::Value>,
    ) {
        self.errors.push(ErrorEntry::new(stage, message).with_extra(extra));
    }

    /// Appends a warning entry.
    pub fn add_warning(&mut self, stage: PipelineStage, message: impl Into<String>) {
        self.warnings.push(ErrorEntry::new(stage, message));
    }

    /// Registers a temporary file.
    pub fn track_temp_file(&mut self, path: PathBuf) {
        if !self.temp_files.contains(&path) {
            self.temp_files.push(path);
        }
    }

    /// Registers an output artifact.
    pub fn track_output_file(&mut self, path: PathBuf) {
        if !self.output_files.contains(&path) {
            self.output_files.push(path);
        }
    }

    /// Seconds from start (or creation) to completion (or now).
    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        let start = self.started_at.unwrap_or(self.created_at);
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - start).num_milliseconds().max(0) as f64 / 1000.0
    }

    /// Quality score reported by the validator, if validation ran.
    #[must_use]
    pub fn quality_score(&self) -> Option<f64> {
        self.metadata
            .get(keys::VALIDATION_SUMMARY)
            .and_then(|s| s.get("quality_score"))
            .and_then(serde_json::Value::as_f64)
    }

    /// Records counted by the validator, if validation ran.
    #[must_use]
    pub fn records_processed(&self) -> u64 {
        self.metadata
            .get(keys::VALIDATION_SUMMARY)
            .and_then(|s| s.get("total_records"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
    }
}

fn stage_percentage(completed: usize) -> f64 {
    let total = PipelineStage::EXECUTION_ORDER.len();
    completed as f64 / total as f64 * 100.0
}

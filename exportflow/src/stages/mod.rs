//! Stage handlers and the dispatch table that binds them to stages.
//!
//! Each executable [`PipelineStage`] has exactly one [`StageHandler`]. A
//! handler reads the run's context, talks to its collaborator, and returns a
//! [`StageOutcome`] that the engine merges into the context.

pub mod ports;
mod standard;

pub use standard::{
    CleanupStage, FetchSourceStage, GenerateReportStage, GenerateSpreadsheetStage,
    ValidateDataStage,
};

use crate::context::PipelineContext;
use crate::core::PipelineStage;
use crate::errors::PipelineError;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use ports::Collaborators;

/// Trait for stage handlers.
#[async_trait]
pub trait StageHandler: Send + Sync + Debug {
    /// Returns the stage this handler implements.
    fn stage(&self) -> PipelineStage;

    /// Executes the stage.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Read access to the run plus helpers for artifacts and progress
    ///
    /// # Returns
    ///
    /// The metadata delta and files produced, or the error that stopped the stage.
    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome, PipelineError>;
}

/// What a stage hands back to the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutcome {
    /// Merged into the run's metadata.
    pub data: HashMap<String, serde_json::Value>,
    /// Temporary files to remove when the run ends.
    pub temp_files: Vec<PathBuf>,
    /// Output artifacts to append.
    pub output_files: Vec<PathBuf>,
    /// Replaces the whole output set when present.
    pub replace_outputs: Option<Vec<PathBuf>>,
    /// Non-fatal problems.
    pub warnings: Vec<String>,
}

impl StageOutcome {
    /// Creates an empty outcome.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a metadata value.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Adds a temporary file.
    #[must_use]
    pub fn with_temp_file(mut self, path: PathBuf) -> Self {
        self.temp_files.push(path);
        self
    }

    /// Adds an output artifact.
    #[must_use]
    pub fn with_output_file(mut self, path: PathBuf) -> Self {
        self.output_files.push(path);
        self
    }

    /// Replaces the run's output set.
    #[must_use]
    pub fn replacing_outputs(mut self, outputs: Vec<PathBuf>) -> Self {
        self.replace_outputs = Some(outputs);
        self
    }

    /// Adds a warning.
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Applies the outcome to `run` on behalf of `stage`.
    pub fn apply_to(self, run: &mut PipelineContext, stage: PipelineStage) {
        run.merge_metadata(self.data);
        for path in self.temp_files {
            run.track_temp_file(path);
        }
        if let Some(outputs) = self.replace_outputs {
            run.output_files.clear();
            for path in outputs {
                run.track_output_file(path);
            }
        }
        for path in self.output_files {
            run.track_output_file(path);
        }
        for warning in self.warnings {
            run.add_warning(stage, warning);
        }
    }
}

/// Progress sink for the stage in flight. Receives 0-100.
pub type StageProgressFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// What a handler sees while it runs.
pub struct StageContext<'a> {
    run: &'a PipelineContext,
    stage: PipelineStage,
    work_dir: &'a Path,
    progress: Option<StageProgressFn<'a>>,
}

impl Debug for StageContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("run_id", &self.run.id)
            .field("stage", &self.stage)
            .field("work_dir", &self.work_dir)
            .finish()
    }
}

impl<'a> StageContext<'a> {
    /// Creates a stage context.
    #[must_use]
    pub fn new(run: &'a PipelineContext, stage: PipelineStage, work_dir: &'a Path) -> Self {
        Self {
            run,
            stage,
            work_dir,
            progress: None,
        }
    }

    /// Attaches a progress sink.
    #[must_use]
    pub fn with_progress(mut self, progress: StageProgressFn<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Returns the run.
    #[must_use]
    pub const fn run(&self) -> &PipelineContext {
        self.run
    }

    /// Returns the stage being executed.
    #[must_use]
    pub const fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Returns the run's artifact directory.
    #[must_use]
    pub fn run_dir(&self) -> PathBuf {
        self.work_dir.join(self.run.id.to_string())
    }

    /// Creates the run's artifact directory if needed.
    pub async fn ensure_run_dir(&self) -> Result<PathBuf, PipelineError> {
        let dir = self.run_dir();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Returns a file path inside the run directory, named after the source.
    #[must_use]
    pub fn artifact_path(&self, prefix: &str, extension: &str) -> PathBuf {
        self.run_dir().join(format!(
            "{prefix}_{}.{extension}",
            sanitize_file_component(&self.run.source_id)
        ))
    }

    /// Reports progress within the stage.
    pub fn report_progress(&self, percent: f64) {
        if let Some(progress) = self.progress {
            progress(percent.clamp(0.0, 100.0));
        }
    }
}

/// Replaces characters that are unsafe in file names.
#[must_use]
pub fn sanitize_file_component(raw: &str) -> String {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    let pattern = UNSAFE
        .get_or_init(|| Regex::new(r"[^A-Za-z0-9_.-]+").expect("unsafe-character pattern compiles"));
    let cleaned = pattern.replace_all(raw, "_");
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "source".to_string()
    } else {
        trimmed.chars().take(96).collect()
    }
}

/// The dispatch table: one handler per executable stage.
#[derive(Debug, Clone)]
pub struct StageSet {
    handlers: [Arc<dyn StageHandler>; 5],
}

impl StageSet {
    /// Binds the standard handlers to `collaborators`.
    #[must_use]
    pub fn standard(collaborators: &Collaborators, compression_threshold_bytes: u64) -> Self {
        Self {
            handlers: [
                Arc::new(FetchSourceStage::new(collaborators.fetchers.clone())),
                Arc::new(ValidateDataStage::new(collaborators.validator.clone())),
                Arc::new(GenerateSpreadsheetStage::new(collaborators.spreadsheet.clone())),
                Arc::new(GenerateReportStage::new(collaborators.report.clone())),
                Arc::new(CleanupStage::new(compression_threshold_bytes)),
            ],
        }
    }

    /// Replaces the handler for `handler.stage()`.
    ///
    /// Handlers for the marker stages are ignored.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn StageHandler>) -> Self {
        if let Some(index) = handler.stage().execution_index() {
            self.handlers[index] = handler;
        }
        self
    }

    /// Returns the handler for `stage`.
    #[must_use]
    pub fn handler(&self, stage: PipelineStage) -> Option<&Arc<dyn StageHandler>> {
        stage.execution_index().map(|i| &self.handlers[i])
    }

    /// Iterates the handlers in execution order.
    pub fn iter(&self) -> impl Iterator<Item = (PipelineStage, &Arc<dyn StageHandler>)> {
        PipelineStage::EXECUTION_ORDER.iter().copied().zip(self.handlers.iter())
    }
}

/// A stage that does nothing.
#[derive(Debug, Clone)]
pub struct NoOpStage {
    stage: PipelineStage,
}

impl NoOpStage {
    /// Creates a no-op handler for `stage`.
    #[must_use]
    pub const fn new(stage: PipelineStage) -> Self {
        Self { stage }
    }
}

#[async_trait]
impl StageHandler for NoOpStage {
    fn stage(&self) -> PipelineStage {
        self.stage
    }

    async fn run(&self, _ctx: &StageContext<'_>) -> Result<StageOutcome, PipelineError> {
        Ok(StageOutcome::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> PipelineContext {
        PipelineContext::new("u1", "forms/abc 123", "google_forms", 3)
    }

    #[test]
    fn test_sanitize_file_component() {
        assert_eq!(sanitize_file_component("abc-123_x.y"), "abc-123_x.y");
        assert_eq!(sanitize_file_component("forms/abc 123"), "forms_abc_123");
        assert_eq!(sanitize_file_component("../.."), "_");
        assert_eq!(sanitize_file_component(""), "source");
    }

    #[test]
    fn test_artifact_path_is_scoped_to_run() {
        let ctx = run();
        let stage_ctx = StageContext::new(&ctx, PipelineStage::FetchSource, Path::new("/work"));
        let path = stage_ctx.artifact_path("source", "json");
        assert_eq!(
            path,
            PathBuf::from(format!("/work/{}/source_forms_abc_123.json", ctx.id))
        );
    }

    #[test]
    fn test_outcome_apply() {
        let mut ctx = run();
        ctx.track_output_file(PathBuf::from("/work/old.xlsx"));

        StageOutcome::new()
            .with_data("k", serde_json::json!(1))
            .with_temp_file(PathBuf::from("/work/t.json"))
            .with_warning("careful")
            .apply_to(&mut ctx, PipelineStage::ValidateData);
        assert_eq!(ctx.metadata["k"], 1);
        assert_eq!(ctx.temp_files, vec![PathBuf::from("/work/t.json")]);
        assert_eq!(ctx.warnings[0].stage, PipelineStage::ValidateData);

        StageOutcome::new()
            .replacing_outputs(vec![PathBuf::from("/work/old.xlsx.gz")])
            .apply_to(&mut ctx, PipelineStage::Cleanup);
        assert_eq!(ctx.output_files, vec![PathBuf::from("/work/old.xlsx.gz")]);
    }

    #[test]
    fn test_stage_set_dispatch() {
        let set = StageSet::standard(&Collaborators::new(), 1024);
        let stages: Vec<_> = set.iter().map(|(s, h)| (s, h.stage())).collect();
        for (slot, handler_stage) in stages {
            assert_eq!(slot, handler_stage);
        }
        assert!(set.handler(PipelineStage::Initialized).is_none());

        let set = set.with_handler(Arc::new(NoOpStage::new(PipelineStage::GenerateArtifactB)));
        let handler = set.handler(PipelineStage::GenerateArtifactB).unwrap();
        assert!(format!("{handler:?}").contains("NoOpStage"));
    }

    #[tokio::test]
    async fn test_progress_is_clamped() {
        let ctx = run();
        let seen = parking_lot::Mutex::new(Vec::new());
        let sink = |p: f64| seen.lock().push(p);
        let stage_ctx = StageContext::new(&ctx, PipelineStage::GenerateArtifactA, Path::new("/w"))
            .with_progress(&sink);

        stage_ctx.report_progress(50.0);
        stage_ctx.report_progress(150.0);
        assert_eq!(*seen.lock(), vec![50.0, 100.0]);

        let noop = NoOpStage::new(PipelineStage::Cleanup);
        assert_eq!(noop.run(&stage_ctx).await.unwrap(), StageOutcome::new());
    }
}

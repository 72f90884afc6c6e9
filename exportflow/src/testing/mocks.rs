//! Fake collaborators and stages for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::config::ReportFormat;
use crate::core::PipelineStage;
use crate::errors::PipelineError;
use crate::stages::ports::{
    DataValidator, GeneratorProgress, ReportGenerator, ReportOutput, ReportRequest,
    SourceDocument, SourceFetcher, SpreadsheetGenerator, SpreadsheetOutput, ValidationOptions,
    ValidationOutcome, ValidationSummary,
};
use crate::stages::{StageContext, StageHandler, StageOutcome};

/// A fetcher that returns a fixed document.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    document: SourceDocument,
    calls: AtomicUsize,
}

impl StaticFetcher {
    /// Creates a fetcher returning `document`.
    #[must_use]
    pub fn new(document: SourceDocument) -> Self {
        Self {
            document,
            calls: AtomicUsize::new(0),
        }
    }

    /// A document with `responses` single-answer responses.
    #[must_use]
    pub fn with_responses(responses: usize) -> Self {
        Self::new(SourceDocument {
            responses: (0..responses)
                .map(|i| serde_json::json!({ "q1": format!("answer {i}") }))
                .collect(),
            fields: vec![serde_json::json!({ "id": "q1", "title": "Question 1" })],
            title: "Customer survey".to_string(),
        })
    }

    /// Returns the number of fetches.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for StaticFetcher {
    async fn fetch(
        &self,
        _source_id: &str,
        _owner: &str,
        include_responses: bool,
    ) -> anyhow::Result<SourceDocument> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut document = self.document.clone();
        if !include_responses {
            document.responses.clear();
        }
        Ok(document)
    }
}

/// A fetcher that always fails.
#[derive(Debug)]
pub struct FailingFetcher {
    message: String,
    calls: AtomicUsize,
}

impl FailingFetcher {
    /// Creates a fetcher failing with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of fetches.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for FailingFetcher {
    async fn fetch(
        &self,
        _source_id: &str,
        _owner: &str,
        _include_responses: bool,
    ) -> anyhow::Result<SourceDocument> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("{}", self.message))
    }
}

/// A validator that accepts everything and counts responses as records.
#[derive(Debug, Clone)]
pub struct PassthroughValidator {
    quality_score: f64,
    issues: u64,
}

impl Default for PassthroughValidator {
    fn default() -> Self {
        Self {
            quality_score: 100.0,
            issues: 0,
        }
    }
}

impl PassthroughValidator {
    /// Creates a validator reporting a perfect score.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `issues` issues and the given score.
    #[must_use]
    pub fn with_issues(mut self, issues: u64, quality_score: f64) -> Self {
        self.issues = issues;
        self.quality_score = quality_score;
        self
    }
}

#[async_trait]
impl DataValidator for PassthroughValidator {
    async fn validate(
        &self,
        document: &serde_json::Value,
        _rules: &serde_json::Value,
        options: &ValidationOptions,
    ) -> anyhow::Result<ValidationOutcome> {
        let total_records = document
            .get("responses")
            .and_then(serde_json::Value::as_array)
            .map_or(0, |r| r.len() as u64);
        Ok(ValidationOutcome {
            validated_document: document.clone(),
            summary: ValidationSummary {
                total_records,
                quality_score: self.quality_score,
                issues_count: self.issues,
                sanitization_applied: options.sanitize,
            },
        })
    }
}

/// Writes the validated data as a CSV-like file.
#[derive(Debug, Default)]
pub struct FileSpreadsheetGenerator {
    fail_with: Option<String>,
    padding: usize,
}

impl FileSpreadsheetGenerator {
    /// Creates a generator that succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the generator report `success: false`.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_with: Some(message.into()),
            padding: 0,
        }
    }

    /// Appends `bytes` of repetitive filler so the file compresses well.
    #[must_use]
    pub fn with_padding(mut self, bytes: usize) -> Self {
        self.padding = bytes;
        self
    }
}

#[async_trait]
impl SpreadsheetGenerator for FileSpreadsheetGenerator {
    async fn generate(
        &self,
        data: &serde_json::Value,
        _config: &serde_json::Value,
        output_dir: &Path,
        on_progress: GeneratorProgress<'_>,
    ) -> anyhow::Result<SpreadsheetOutput> {
        if let Some(message) = &self.fail_with {
            return Ok(SpreadsheetOutput {
                success: false,
                errors: vec![message.clone()],
                ..SpreadsheetOutput::default()
            });
        }

        let rows: Vec<String> = data
            .get("responses")
            .and_then(serde_json::Value::as_array)
            .map(|responses| responses.iter().map(ToString::to_string).collect())
            .unwrap_or_default();
        on_progress(50.0);

        let mut body = rows.join("\n");
        body.push_str(&"row,".repeat(self.padding / 4));
        let path = output_dir.join("export.csv");
        tokio::fs::write(&path, body.as_bytes()).await?;
        on_progress(100.0);

        Ok(SpreadsheetOutput {
            success: true,
            file_size: body.len() as u64,
            file_path: Some(path),
            total_rows: rows.len() as u64,
            duration_seconds: 0.0,
            errors: Vec::new(),
        })
    }
}

/// Writes a small report next to the spreadsheet.
#[derive(Debug, Default)]
pub struct FileReportGenerator;

#[async_trait]
impl ReportGenerator for FileReportGenerator {
    async fn generate(&self, request: ReportRequest<'_>) -> anyhow::Result<ReportOutput> {
        let format: ReportFormat = request.format;
        let path = request
            .output_dir
            .join(format!("report.{}", format.extension()));
        let body = format!(
            "report for {} from {}",
            request.source_id,
            request.spreadsheet.display()
        );
        tokio::fs::write(&path, body.as_bytes()).await?;
        Ok(ReportOutput {
            success: true,
            file_path: Some(path),
            file_size: body.len() as u64,
            format,
            duration_seconds: 0.0,
            errors: Vec::new(),
        })
    }
}

/// A stage that blocks until released, for observing runs mid-flight.
#[derive(Debug)]
pub struct GateStage {
    stage: PipelineStage,
    entered: Notify,
    release: Notify,
    runs: AtomicUsize,
}

impl GateStage {
    /// Creates a gate occupying `stage`.
    #[must_use]
    pub fn new(stage: PipelineStage) -> Arc<Self> {
        Arc::new(Self {
            stage,
            entered: Notify::new(),
            release: Notify::new(),
            runs: AtomicUsize::new(0),
        })
    }

    /// Waits until a run has entered the stage.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    /// Lets one waiting run continue.
    pub fn release(&self) {
        self.release.notify_one();
    }

    /// Returns how many times the stage ran.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageHandler for GateStage {
    fn stage(&self) -> PipelineStage {
        self.stage
    }

    async fn run(&self, _ctx: &StageContext<'_>) -> Result<StageOutcome, PipelineError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(StageOutcome::new())
    }
}

/// Records the order in which stages run.
#[derive(Debug)]
pub struct RecordingStage {
    stage: PipelineStage,
    log: Arc<Mutex<Vec<PipelineStage>>>,
}

impl RecordingStage {
    /// Creates a stage that appends `stage` to `log` each time it runs.
    #[must_use]
    pub fn new(stage: PipelineStage, log: Arc<Mutex<Vec<PipelineStage>>>) -> Self {
        Self { stage, log }
    }
}

#[async_trait]
impl StageHandler for RecordingStage {
    fn stage(&self) -> PipelineStage {
        self.stage
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome, PipelineError> {
        // Every earlier stage must already be complete.
        let done: Vec<PipelineStage> = ctx.run().stage_progress.keys().copied().collect();
        let expected: Vec<PipelineStage> = PipelineStage::EXECUTION_ORDER
            .iter()
            .copied()
            .take_while(|s| *s != self.stage)
            .collect();
        if done != expected {
            return Err(PipelineError::Transient(format!(
                "{} started before its predecessors finished",
                self.stage.as_str()
            )));
        }
        self.log.lock().push(self.stage);
        Ok(StageOutcome::new())
    }
}

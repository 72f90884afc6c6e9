//! The standard export stages.

use super::ports::{
    DataValidator, ReportGenerator, ReportRequest, SourceFetcher, SpreadsheetGenerator,
    ValidationOptions,
};
use super::{StageContext, StageHandler, StageOutcome};
use crate::compression::{compress_outputs, CompressionOutcome};
use crate::context::keys;
use crate::core::{PipelineStage, SourceKind};
use crate::errors::PipelineError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

async fn write_json(path: &Path, value: &serde_json::Value) -> Result<(), PipelineError> {
    let bytes = serde_json::to_vec(value)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

async fn read_json(path: &Path) -> Result<serde_json::Value, PipelineError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn required_path(ctx: &StageContext<'_>, key: &str) -> Option<PathBuf> {
    ctx.run().metadata_path(key)
}

/// Fetches the source document and stores it as a temp file.
pub struct FetchSourceStage {
    fetchers: HashMap<SourceKind, Arc<dyn SourceFetcher>>,
}

impl FetchSourceStage {
    /// Creates the stage with fetchers keyed by provider.
    #[must_use]
    pub fn new(fetchers: HashMap<SourceKind, Arc<dyn SourceFetcher>>) -> Self {
        Self { fetchers }
    }
}

impl fmt::Debug for FetchSourceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchSourceStage")
            .field("fetchers", &self.fetchers.len())
            .finish()
    }
}

#[async_trait]
impl StageHandler for FetchSourceStage {
    fn stage(&self) -> PipelineStage {
        PipelineStage::FetchSource
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome, PipelineError> {
        let run = ctx.run();
        let kind: SourceKind = run
            .source_kind
            .parse()
            .map_err(|e: crate::core::UnsupportedSourceKind| {
                PipelineError::SourceFetch(e.to_string())
            })?;
        let fetcher = self.fetchers.get(&kind).ok_or_else(|| {
            PipelineError::SourceFetch(format!("No fetcher registered for source kind: {kind}"))
        })?;

        let config = run.run_config();
        let document = fetcher
            .fetch(&run.source_id, &run.owner, config.include_responses)
            .await
            .map_err(|e| PipelineError::SourceFetch(format!("{e:#}")))?;

        ctx.ensure_run_dir().await?;
        let path = ctx.artifact_path("source", "json");
        write_json(&path, &serde_json::to_value(&document)?).await?;

        debug!(
            run_id = %run.id,
            responses = document.responses.len(),
            fields = document.fields.len(),
            "Fetched source document"
        );

        Ok(StageOutcome::new()
            .with_data(keys::SOURCE_DOCUMENT_PATH, serde_json::json!(path))
            .with_data(keys::SOURCE_TITLE, serde_json::json!(document.title))
            .with_data(keys::RESPONSE_COUNT, serde_json::json!(document.responses.len()))
            .with_temp_file(path))
    }
}

/// Validates and sanitizes the fetched document.
pub struct ValidateDataStage {
    validator: Option<Arc<dyn DataValidator>>,
}

impl ValidateDataStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(validator: Option<Arc<dyn DataValidator>>) -> Self {
        Self { validator }
    }
}

impl fmt::Debug for ValidateDataStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidateDataStage")
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

#[async_trait]
impl StageHandler for ValidateDataStage {
    fn stage(&self) -> PipelineStage {
        PipelineStage::ValidateData
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome, PipelineError> {
        let validator = self
            .validator
            .as_ref()
            .ok_or_else(|| PipelineError::Validation("No validator configured".to_string()))?;
        let source = required_path(ctx, keys::SOURCE_DOCUMENT_PATH).ok_or_else(|| {
            PipelineError::Validation("Source document missing from context".to_string())
        })?;
        let document = read_json(&source)
            .await
            .map_err(|e| PipelineError::Validation(format!("Unreadable source document: {e}")))?;

        let config = ctx.run().run_config();
        let options = ValidationOptions {
            strict: config.strict_validation,
            sanitize: config.sanitize,
        };
        let outcome = validator
            .validate(&document, &config.validation_rules, &options)
            .await
            .map_err(|e| PipelineError::Validation(format!("{e:#}")))?;

        if options.strict && outcome.summary.issues_count > 0 {
            return Err(PipelineError::Validation(format!(
                "{} issue(s) found in strict mode",
                outcome.summary.issues_count
            )));
        }

        ctx.ensure_run_dir().await?;
        let path = ctx.artifact_path("validated", "json");
        write_json(&path, &outcome.validated_document).await?;

        let mut result = StageOutcome::new()
            .with_data(keys::VALIDATED_DOCUMENT_PATH, serde_json::json!(path))
            .with_data(keys::VALIDATION_SUMMARY, serde_json::to_value(&outcome.summary)?)
            .with_temp_file(path);
        if outcome.summary.issues_count > 0 {
            result = result.with_warning(format!(
                "{} data quality issue(s) found",
                outcome.summary.issues_count
            ));
        }
        Ok(result)
    }
}

/// Renders the validated document into a spreadsheet.
pub struct GenerateSpreadsheetStage {
    generator: Option<Arc<dyn SpreadsheetGenerator>>,
}

impl GenerateSpreadsheetStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(generator: Option<Arc<dyn SpreadsheetGenerator>>) -> Self {
        Self { generator }
    }
}

impl fmt::Debug for GenerateSpreadsheetStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerateSpreadsheetStage")
            .field("has_generator", &self.generator.is_some())
            .finish()
    }
}

#[async_trait]
impl StageHandler for GenerateSpreadsheetStage {
    fn stage(&self) -> PipelineStage {
        PipelineStage::GenerateArtifactA
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome, PipelineError> {
        let generator = self.generator.as_ref().ok_or_else(|| {
            PipelineError::Generation("No spreadsheet generator configured".to_string())
        })?;
        let validated = required_path(ctx, keys::VALIDATED_DOCUMENT_PATH).ok_or_else(|| {
            PipelineError::Generation("Validated document missing from context".to_string())
        })?;
        let data = read_json(&validated).await?;
        let config = ctx.run().run_config();
        let output_dir = ctx.ensure_run_dir().await?;

        let on_progress = |percent: f64| ctx.report_progress(percent);
        let output = generator
            .generate(&data, &config.spreadsheet, &output_dir, &on_progress)
            .await
            .map_err(|e| PipelineError::Generation(format!("{e:#}")))?;

        if !output.success {
            return Err(PipelineError::Generation(failure_message(
                "Spreadsheet generation",
                &output.errors,
            )));
        }
        let path = output.file_path.ok_or_else(|| {
            PipelineError::Generation("Spreadsheet generator returned no file".to_string())
        })?;

        let mut result = StageOutcome::new()
            .with_data(keys::SPREADSHEET_PATH, serde_json::json!(path))
            .with_data(keys::SPREADSHEET_ROWS, serde_json::json!(output.total_rows))
            .with_output_file(path);
        for error in output.errors {
            result = result.with_warning(error);
        }
        Ok(result)
    }
}

/// Renders the report from the spreadsheet.
pub struct GenerateReportStage {
    generator: Option<Arc<dyn ReportGenerator>>,
}

impl GenerateReportStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(generator: Option<Arc<dyn ReportGenerator>>) -> Self {
        Self { generator }
    }
}

impl fmt::Debug for GenerateReportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerateReportStage")
            .field("has_generator", &self.generator.is_some())
            .finish()
    }
}

#[async_trait]
impl StageHandler for GenerateReportStage {
    fn stage(&self) -> PipelineStage {
        PipelineStage::GenerateArtifactB
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome, PipelineError> {
        let generator = self.generator.as_ref().ok_or_else(|| {
            PipelineError::Generation("No report generator configured".to_string())
        })?;
        let spreadsheet = required_path(ctx, keys::SPREADSHEET_PATH).ok_or_else(|| {
            PipelineError::Generation("Spreadsheet missing from context".to_string())
        })?;
        let config = ctx.run().run_config();
        let output_dir = ctx.ensure_run_dir().await?;

        let output = generator
            .generate(ReportRequest {
                source_id: &ctx.run().source_id,
                spreadsheet: &spreadsheet,
                template_id: config.template_id.as_deref(),
                format: config.report_format,
                customizations: &config.customizations,
                output_dir: &output_dir,
            })
            .await
            .map_err(|e| PipelineError::Generation(format!("{e:#}")))?;

        if !output.success {
            return Err(PipelineError::Generation(failure_message(
                "Report generation",
                &output.errors,
            )));
        }
        let path = output.file_path.ok_or_else(|| {
            PipelineError::Generation("Report generator returned no file".to_string())
        })?;

        let mut result = StageOutcome::new()
            .with_data(keys::REPORT_PATH, serde_json::json!(path))
            .with_data(keys::REPORT_FORMAT, serde_json::json!(output.format))
            .with_output_file(path);
        for error in output.errors {
            result = result.with_warning(error);
        }
        Ok(result)
    }
}

/// Finalizes outputs: compresses artifacts when it pays off.
///
/// Never fails. Problems become warnings and the affected originals stay.
#[derive(Debug, Clone)]
pub struct CleanupStage {
    threshold_bytes: u64,
}

impl CleanupStage {
    /// Creates the stage with a compression threshold.
    #[must_use]
    pub const fn new(threshold_bytes: u64) -> Self {
        Self { threshold_bytes }
    }
}

#[async_trait]
impl StageHandler for CleanupStage {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Cleanup
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome, PipelineError> {
        let report = compress_outputs(&ctx.run().output_files, self.threshold_bytes).await;

        let summary = serde_json::json!({
            "replaced": report.replaced_count(),
            "outcomes": report.outcomes,
        });
        let mut result = StageOutcome::new()
            .with_data(keys::COMPRESSION, summary)
            .replacing_outputs(report.outputs);
        // Hand-off paths follow their artifact to the compressed copy.
        for outcome in &report.outcomes {
            let CompressionOutcome::Replaced { original, compressed, .. } = outcome else {
                continue;
            };
            for key in [keys::SPREADSHEET_PATH, keys::REPORT_PATH] {
                if ctx.run().metadata_path(key).as_ref() == Some(original) {
                    result = result.with_data(key, serde_json::json!(compressed));
                }
            }
        }
        for warning in report.warnings {
            result = result.with_warning(PipelineError::Cleanup(warning).to_string());
        }
        Ok(result)
    }
}

fn failure_message(what: &str, errors: &[String]) -> String {
    if errors.is_empty() {
        format!("{what} reported failure")
    } else {
        format!("{what} reported failure: {}", errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReportFormat, RunConfig};
    use crate::context::PipelineContext;
    use crate::stages::ports::{
        MockSourceFetcher, ReportOutput, SourceDocument, SpreadsheetOutput, ValidationOutcome,
        ValidationSummary,
    };
    use mockall::predicate::eq;
    use tempfile::TempDir;

    fn fetcher_map(fetcher: MockSourceFetcher) -> HashMap<SourceKind, Arc<dyn SourceFetcher>> {
        let mut map: HashMap<SourceKind, Arc<dyn SourceFetcher>> = HashMap::new();
        map.insert(SourceKind::GoogleForms, Arc::new(fetcher));
        map
    }

    #[tokio::test]
    async fn test_fetch_rejects_unknown_kind() {
        let dir = TempDir::new().unwrap();
        let run = PipelineContext::new("u1", "f1", "invalid", 3);
        let ctx = StageContext::new(&run, PipelineStage::FetchSource, dir.path());

        let stage = FetchSourceStage::new(fetcher_map(MockSourceFetcher::new()));
        let err = stage.run(&ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::SourceFetch(_)));
        assert!(err.to_string().contains("Unsupported source kind: invalid"));
    }

    #[tokio::test]
    async fn test_fetch_without_registered_fetcher() {
        let dir = TempDir::new().unwrap();
        let run = PipelineContext::new("u1", "f1", "typeform", 3);
        let ctx = StageContext::new(&run, PipelineStage::FetchSource, dir.path());

        let stage = FetchSourceStage::new(fetcher_map(MockSourceFetcher::new()));
        let err = stage.run(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("No fetcher registered"));
    }

    #[tokio::test]
    async fn test_fetch_writes_document_to_temp_file() {
        let dir = TempDir::new().unwrap();
        let run = PipelineContext::new("u1", "f1", "google_forms", 3)
            .with_config(&RunConfig::default());
        let ctx = StageContext::new(&run, PipelineStage::FetchSource, dir.path());

        let mut fetcher = MockSourceFetcher::new();
        fetcher
            .expect_fetch()
            .with(eq("f1"), eq("u1"), eq(true))
            .times(1)
            .returning(|_, _, _| {
                Ok(SourceDocument {
                    responses: vec![serde_json::json!({"q1": "yes"})],
                    fields: vec![serde_json::json!({"id": "q1"})],
                    title: "Survey".to_string(),
                })
            });

        let outcome = FetchSourceStage::new(fetcher_map(fetcher)).run(&ctx).await.unwrap();
        assert_eq!(outcome.data[keys::SOURCE_TITLE], "Survey");
        assert_eq!(outcome.data[keys::RESPONSE_COUNT], 1);
        assert_eq!(outcome.temp_files.len(), 1);

        let stored: SourceDocument =
            serde_json::from_slice(&std::fs::read(&outcome.temp_files[0]).unwrap()).unwrap();
        assert_eq!(stored.title, "Survey");
    }

    #[tokio::test]
    async fn test_fetch_error_is_source_fetch_failure() {
        let dir = TempDir::new().unwrap();
        let run = PipelineContext::new("u1", "f1", "google_forms", 3);
        let ctx = StageContext::new(&run, PipelineStage::FetchSource, dir.path());

        let mut fetcher = MockSourceFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|_, _, _| Err(anyhow::anyhow!("provider returned 503")));

        let err = FetchSourceStage::new(fetcher_map(fetcher)).run(&ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::SourceFetch(ref m) if m.contains("503")));
    }

    #[derive(Debug)]
    struct StrictValidator;

    #[async_trait]
    impl DataValidator for StrictValidator {
        async fn validate(
            &self,
            document: &serde_json::Value,
            _rules: &serde_json::Value,
            _options: &ValidationOptions,
        ) -> anyhow::Result<ValidationOutcome> {
            Ok(ValidationOutcome {
                validated_document: document.clone(),
                summary: ValidationSummary {
                    total_records: 3,
                    quality_score: 70.0,
                    issues_count: 2,
                    sanitization_applied: false,
                },
            })
        }
    }

    async fn run_with_source(dir: &TempDir, config: &RunConfig) -> PipelineContext {
        let mut run = PipelineContext::new("u1", "f1", "google_forms", 3).with_config(config);
        let path = dir.path().join("source.json");
        std::fs::write(&path, br#"{"responses":[],"fields":[],"title":"t"}"#).unwrap();
        run.metadata
            .insert(keys::SOURCE_DOCUMENT_PATH.into(), serde_json::json!(path));
        run
    }

    #[tokio::test]
    async fn test_validation_issues_become_warnings() {
        let dir = TempDir::new().unwrap();
        let run = run_with_source(&dir, &RunConfig::default()).await;
        let ctx = StageContext::new(&run, PipelineStage::ValidateData, dir.path());

        let outcome = ValidateDataStage::new(Some(Arc::new(StrictValidator)))
            .run(&ctx)
            .await
            .unwrap();
        assert_eq!(outcome.data[keys::VALIDATION_SUMMARY]["total_records"], 3);
        assert_eq!(outcome.warnings, vec!["2 data quality issue(s) found".to_string()]);
    }

    #[tokio::test]
    async fn test_strict_validation_fails_on_issues() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig {
            strict_validation: true,
            ..RunConfig::default()
        };
        let run = run_with_source(&dir, &config).await;
        let ctx = StageContext::new(&run, PipelineStage::ValidateData, dir.path());

        let err = ValidateDataStage::new(Some(Arc::new(StrictValidator)))
            .run(&ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_validation_without_source_document() {
        let dir = TempDir::new().unwrap();
        let run = PipelineContext::new("u1", "f1", "google_forms", 3);
        let ctx = StageContext::new(&run, PipelineStage::ValidateData, dir.path());

        let err = ValidateDataStage::new(Some(Arc::new(StrictValidator)))
            .run(&ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Source document missing"));
    }

    #[derive(Debug)]
    struct RejectingSpreadsheet;

    #[async_trait]
    impl SpreadsheetGenerator for RejectingSpreadsheet {
        async fn generate(
            &self,
            _data: &serde_json::Value,
            _config: &serde_json::Value,
            _output_dir: &Path,
            on_progress: &(dyn Fn(f64) + Send + Sync),
        ) -> anyhow::Result<SpreadsheetOutput> {
            on_progress(50.0);
            Ok(SpreadsheetOutput {
                success: false,
                errors: vec!["sheet limit exceeded".to_string()],
                ..SpreadsheetOutput::default()
            })
        }
    }

    #[tokio::test]
    async fn test_spreadsheet_failure_is_generation_failure() {
        let dir = TempDir::new().unwrap();
        let mut run = PipelineContext::new("u1", "f1", "google_forms", 3);
        let validated = dir.path().join("validated.json");
        std::fs::write(&validated, b"{}").unwrap();
        run.metadata
            .insert(keys::VALIDATED_DOCUMENT_PATH.into(), serde_json::json!(validated));

        let seen = parking_lot::Mutex::new(Vec::new());
        let sink = |p: f64| seen.lock().push(p);
        let ctx = StageContext::new(&run, PipelineStage::GenerateArtifactA, dir.path())
            .with_progress(&sink);

        let err = GenerateSpreadsheetStage::new(Some(Arc::new(RejectingSpreadsheet)))
            .run(&ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Generation(ref m) if m.contains("sheet limit exceeded")));
        assert_eq!(*seen.lock(), vec![50.0]);
    }

    #[derive(Debug)]
    struct EchoReport;

    #[async_trait]
    impl ReportGenerator for EchoReport {
        async fn generate(&self, request: ReportRequest<'_>) -> anyhow::Result<ReportOutput> {
            let path = request
                .output_dir
                .join(format!("report.{}", request.format.extension()));
            std::fs::write(&path, request.source_id)?;
            Ok(ReportOutput {
                success: true,
                file_path: Some(path),
                file_size: request.source_id.len() as u64,
                format: request.format,
                duration_seconds: 0.0,
                errors: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_report_uses_configured_format() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig::new().with_report_format(ReportFormat::Html);
        let mut run = PipelineContext::new("u1", "f1", "google_forms", 3).with_config(&config);
        run.metadata.insert(
            keys::SPREADSHEET_PATH.into(),
            serde_json::json!(dir.path().join("sheet.xlsx")),
        );
        let ctx = StageContext::new(&run, PipelineStage::GenerateArtifactB, dir.path());

        let outcome = GenerateReportStage::new(Some(Arc::new(EchoReport)))
            .run(&ctx)
            .await
            .unwrap();
        assert_eq!(outcome.data[keys::REPORT_FORMAT], "html");
        assert_eq!(outcome.output_files.len(), 1);
        assert!(outcome.output_files[0].ends_with("report.html"));
    }

    #[tokio::test]
    async fn test_report_without_generator() {
        let dir = TempDir::new().unwrap();
        let run = PipelineContext::new("u1", "f1", "google_forms", 3);
        let ctx = StageContext::new(&run, PipelineStage::GenerateArtifactB, dir.path());

        let err = GenerateReportStage::new(None).run(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("No report generator configured"));
    }

    #[tokio::test]
    async fn test_cleanup_stage_never_fails() {
        let dir = TempDir::new().unwrap();
        let mut run = PipelineContext::new("u1", "f1", "google_forms", 3);
        let big = dir.path().join("big.xlsx");
        std::fs::write(&big, vec![b'x'; 4096]).unwrap();
        run.track_output_file(big.clone());
        run.track_output_file(dir.path().join("vanished.pdf"));
        run.metadata.insert(keys::SPREADSHEET_PATH.into(), serde_json::json!(big));
        run.metadata.insert(
            keys::REPORT_PATH.into(),
            serde_json::json!(dir.path().join("vanished.pdf")),
        );
        let ctx = StageContext::new(&run, PipelineStage::Cleanup, dir.path());

        let outcome = CleanupStage::new(1024).run(&ctx).await.unwrap();
        let outputs = outcome.replace_outputs.clone().unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(outputs[0].to_string_lossy().ends_with("big.xlsx.gz"));
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].starts_with("Cleanup failed"));
        assert_eq!(outcome.data[keys::COMPRESSION]["replaced"], 1);
        assert_eq!(outcome.data[keys::SPREADSHEET_PATH], serde_json::json!(outputs[0]));
        assert!(!outcome.data.contains_key(keys::REPORT_PATH));
    }
}

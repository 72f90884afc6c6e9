//! Ports for the external collaborators the stages drive.
//!
//! Each provider, validator, and renderer lives outside this crate and is
//! injected behind one of these traits. Implementations report failure through
//! `anyhow::Result`; the owning stage maps it onto the pipeline error taxonomy.

use crate::config::ReportFormat;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::SourceKind;

/// A fetched form: its fields, responses and title.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    /// Individual responses.
    #[serde(default)]
    pub responses: Vec<serde_json::Value>,
    /// Field (question) definitions.
    #[serde(default)]
    pub fields: Vec<serde_json::Value>,
    /// Form title.
    #[serde(default)]
    pub title: String,
}

/// Fetches source documents from a form-data provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetches `source_id` on behalf of `owner`.
    async fn fetch(
        &self,
        source_id: &str,
        owner: &str,
        include_responses: bool,
    ) -> anyhow::Result<SourceDocument>;
}

/// Options passed to the validator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOptions {
    /// Reject the document on any issue.
    pub strict: bool,
    /// Sanitize values in place.
    pub sanitize: bool,
}

/// Summary statistics reported by the validator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    /// Records in the validated document.
    pub total_records: u64,
    /// Cleanliness score, 0-100.
    pub quality_score: f64,
    /// Issues found.
    pub issues_count: u64,
    /// Whether values were rewritten.
    pub sanitization_applied: bool,
}

/// The validator's output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    /// The validated (possibly sanitized) document.
    pub validated_document: serde_json::Value,
    /// Summary statistics.
    pub summary: ValidationSummary,
}

/// Validates and sanitizes a fetched document.
#[async_trait]
pub trait DataValidator: Send + Sync {
    /// Validates `document` against `rules`.
    async fn validate(
        &self,
        document: &serde_json::Value,
        rules: &serde_json::Value,
        options: &ValidationOptions,
    ) -> anyhow::Result<ValidationOutcome>;
}

/// Progress sink handed to long-running generators. Receives 0-100.
pub type GeneratorProgress<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// Result of spreadsheet generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpreadsheetOutput {
    /// Whether generation succeeded.
    pub success: bool,
    /// Path of the produced file.
    pub file_path: Option<PathBuf>,
    /// Size of the produced file.
    pub file_size: u64,
    /// Rows written.
    pub total_rows: u64,
    /// Generation time.
    pub duration_seconds: f64,
    /// Errors reported by the generator.
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Produces the spreadsheet artifact.
#[async_trait]
pub trait SpreadsheetGenerator: Send + Sync {
    /// Renders `data` into a spreadsheet under `output_dir`.
    async fn generate(
        &self,
        data: &serde_json::Value,
        config: &serde_json::Value,
        output_dir: &Path,
        on_progress: GeneratorProgress<'_>,
    ) -> anyhow::Result<SpreadsheetOutput>;
}

/// Inputs for report generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRequest<'a> {
    /// The exported source.
    pub source_id: &'a str,
    /// The spreadsheet produced by the previous stage.
    pub spreadsheet: &'a Path,
    /// Report template.
    pub template_id: Option<&'a str>,
    /// Output format.
    pub format: ReportFormat,
    /// Template customizations.
    pub customizations: &'a serde_json::Value,
    /// Directory for the produced file.
    pub output_dir: &'a Path,
}

/// Result of report generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportOutput {
    /// Whether generation succeeded.
    pub success: bool,
    /// Path of the produced file.
    pub file_path: Option<PathBuf>,
    /// Size of the produced file.
    pub file_size: u64,
    /// Format of the produced file.
    pub format: ReportFormat,
    /// Generation time.
    pub duration_seconds: f64,
    /// Errors reported by the generator.
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Produces the report artifact.
#[async_trait]
pub trait ReportGenerator: Send + Sync {
    /// Renders a report from the spreadsheet artifact.
    async fn generate(&self, request: ReportRequest<'_>) -> anyhow::Result<ReportOutput>;
}

/// The collaborators injected into the standard stages.
#[derive(Clone, Default)]
pub struct Collaborators {
    /// Fetchers keyed by provider.
    pub fetchers: HashMap<SourceKind, Arc<dyn SourceFetcher>>,
    /// Document validator.
    pub validator: Option<Arc<dyn DataValidator>>,
    /// Spreadsheet renderer.
    pub spreadsheet: Option<Arc<dyn SpreadsheetGenerator>>,
    /// Report renderer.
    pub report: Option<Arc<dyn ReportGenerator>>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.fetchers.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("Collaborators")
            .field("fetchers", &kinds)
            .field("has_validator", &self.validator.is_some())
            .field("has_spreadsheet", &self.spreadsheet.is_some())
            .field("has_report", &self.report.is_some())
            .finish()
    }
}

impl Collaborators {
    /// Creates an empty set of collaborators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the fetcher for a provider.
    #[must_use]
    pub fn with_fetcher(mut self, kind: SourceKind, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetchers.insert(kind, fetcher);
        self
    }

    /// Sets the validator.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn DataValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Sets the spreadsheet renderer.
    #[must_use]
    pub fn with_spreadsheet(mut self, generator: Arc<dyn SpreadsheetGenerator>) -> Self {
        self.spreadsheet = Some(generator);
        self
    }

    /// Sets the report renderer.
    #[must_use]
    pub fn with_report(mut self, generator: Arc<dyn ReportGenerator>) -> Self {
        self.report = Some(generator);
        self
    }
}

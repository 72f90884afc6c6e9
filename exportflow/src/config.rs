//! Configuration for the engine and for individual runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Process-wide engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retries allowed per run after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff table in seconds, indexed by retry number.
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: Vec<u64>,
    /// Jitter ratio (0.0-1.0) applied on top of each backoff delay.
    #[serde(default)]
    pub backoff_jitter: f64,
    /// TTL of a persisted record in the external store, refreshed on every save.
    #[serde(default = "default_state_ttl_seconds")]
    pub state_ttl_seconds: u64,
    /// Directory for temporary and output artifacts.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Output files at or below this size are not compressed.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: u64,
    /// Pause between stages; 0 yields to the scheduler without sleeping.
    #[serde(default)]
    pub stage_yield_ms: u64,
    /// Optional per-stage timeout. `None` lets a stalled collaborator stall the run.
    #[serde(default)]
    pub stage_timeout_seconds: Option<f64>,
    /// Maximum number of records returned by history queries.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Bound on detached cleanup after cancellation.
    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_timeout_seconds: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_seconds() -> Vec<u64> {
    vec![1, 5, 15, 60, 300]
}

fn default_state_ttl_seconds() -> u64 {
    3600
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("exportflow")
}

fn default_compression_threshold() -> u64 {
    1024 * 1024 // 1MB
}

fn default_history_limit() -> usize {
    50
}

fn default_cleanup_timeout() -> f64 {
    30.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_seconds: default_backoff_seconds(),
            backoff_jitter: 0.0,
            state_ttl_seconds: default_state_ttl_seconds(),
            work_dir: default_work_dir(),
            compression_threshold_bytes: default_compression_threshold(),
            stage_yield_ms: 0,
            stage_timeout_seconds: None,
            history_limit: default_history_limit(),
            cleanup_timeout_seconds: default_cleanup_timeout(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON configuration document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Sets the retry bound.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the backoff table.
    #[must_use]
    pub fn with_backoff_seconds(mut self, table: Vec<u64>) -> Self {
        self.backoff_seconds = table;
        self
    }

    /// Sets the artifact directory.
    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Sets the compression threshold.
    #[must_use]
    pub fn with_compression_threshold(mut self, bytes: u64) -> Self {
        self.compression_threshold_bytes = bytes;
        self
    }

    /// Sets a per-stage timeout.
    #[must_use]
    pub fn with_stage_timeout(mut self, seconds: f64) -> Self {
        self.stage_timeout_seconds = Some(seconds);
        self
    }

    /// Sets the history cap.
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Returns the stage timeout as a Duration.
    #[must_use]
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_seconds
            .filter(|s| *s > 0.0)
            .map(Duration::from_secs_f64)
    }

    /// Returns the state TTL as a Duration.
    #[must_use]
    pub const fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_seconds)
    }
}

/// Output format of the report artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// PDF document.
    #[default]
    Pdf,
    /// Word document.
    Docx,
    /// HTML page.
    Html,
}

impl ReportFormat {
    /// Returns the file extension for the format.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Html => "html",
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Per-run configuration, stored under `metadata["config"]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Fetch individual responses, not only the form definition.
    #[serde(default = "default_include_responses")]
    pub include_responses: bool,
    /// Rules handed to the validator.
    #[serde(default)]
    pub validation_rules: serde_json::Value,
    /// Fail validation on any issue instead of reporting it.
    #[serde(default)]
    pub strict_validation: bool,
    /// Let the validator sanitize values.
    #[serde(default = "default_sanitize")]
    pub sanitize: bool,
    /// Options handed to the spreadsheet generator.
    #[serde(default)]
    pub spreadsheet: serde_json::Value,
    /// Report template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Report format.
    #[serde(default)]
    pub report_format: ReportFormat,
    /// Report customizations.
    #[serde(default)]
    pub customizations: serde_json::Value,
    /// Overrides the engine's retry bound for this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

fn default_include_responses() -> bool {
    true
}

fn default_sanitize() -> bool {
    true
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            include_responses: default_include_responses(),
            validation_rules: serde_json::Value::Null,
            strict_validation: false,
            sanitize: default_sanitize(),
            spreadsheet: serde_json::Value::Null,
            template_id: None,
            report_format: ReportFormat::default(),
            customizations: serde_json::Value::Null,
            max_retries: None,
        }
    }
}

impl RunConfig {
    /// Creates a run configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the report template.
    #[must_use]
    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    /// Sets the report format.
    #[must_use]
    pub const fn with_report_format(mut self, format: ReportFormat) -> Self {
        self.report_format = format;
        self
    }

    /// Sets the validation rules.
    #[must_use]
    pub fn with_validation_rules(mut self, rules: serde_json::Value) -> Self {
        self.validation_rules = rules;
        self
    }

    /// Overrides the retry bound.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_seconds, vec![1, 5, 15, 60, 300]);
        assert_eq!(config.state_ttl(), Duration::from_secs(3600));
        assert!(config.stage_timeout().is_none());
    }

    #[test]
    fn test_engine_config_from_partial_json() {
        let config = EngineConfig::from_json(r#"{"max_retries": 5, "history_limit": 10}"#).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.history_limit, 10);
        assert_eq!(config.backoff_seconds, vec![1, 5, 15, 60, 300]);
    }

    #[test]
    fn test_zero_stage_timeout_means_none() {
        let config = EngineConfig::new().with_stage_timeout(0.0);
        assert!(config.stage_timeout().is_none());

        let config = EngineConfig::new().with_stage_timeout(2.5);
        assert_eq!(config.stage_timeout(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_run_config_round_trip_through_metadata() {
        let config = RunConfig::new()
            .with_template("quarterly")
            .with_report_format(ReportFormat::Docx);
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["report_format"], "docx");

        let parsed: RunConfig = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_run_config_defaults_from_empty_object() {
        let parsed: RunConfig = serde_json::from_str("{}").unwrap();
        assert!(parsed.include_responses);
        assert!(parsed.sanitize);
        assert_eq!(parsed.report_format, ReportFormat::Pdf);
    }
}

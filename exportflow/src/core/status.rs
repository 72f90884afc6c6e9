//! Pipeline stage, run status and source kind enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A step in the fixed export sequence.
///
/// `Initialized` and `Completed` are position markers: they are recorded as
/// `current_stage` but never have a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Run created, no stage started yet.
    Initialized,
    /// Fetch the source document from its provider.
    FetchSource,
    /// Validate and sanitize the fetched document.
    ValidateData,
    /// Produce the spreadsheet artifact.
    GenerateArtifactA,
    /// Produce the report artifact from the spreadsheet.
    GenerateArtifactB,
    /// Finalize outputs (compression).
    Cleanup,
    /// Every stage has finished.
    Completed,
}

impl PipelineStage {
    /// The stages that carry a handler, in execution order.
    pub const EXECUTION_ORDER: [Self; 5] = [
        Self::FetchSource,
        Self::ValidateData,
        Self::GenerateArtifactA,
        Self::GenerateArtifactB,
        Self::Cleanup,
    ];

    /// Returns the stable key used in `stage_progress` and error entries.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::FetchSource => "fetch_source",
            Self::ValidateData => "validate_data",
            Self::GenerateArtifactA => "generate_artifact_a",
            Self::GenerateArtifactB => "generate_artifact_b",
            Self::Cleanup => "cleanup",
            Self::Completed => "completed",
        }
    }

    /// Returns the position of an executable stage within [`Self::EXECUTION_ORDER`].
    #[must_use]
    pub fn execution_index(self) -> Option<usize> {
        Self::EXECUTION_ORDER.iter().position(|s| *s == self)
    }

    /// Returns true for stages that have a handler.
    #[must_use]
    pub fn is_executable(self) -> bool {
        self.execution_index().is_some()
    }
}

impl Default for PipelineStage {
    fn default() -> Self {
        Self::Initialized
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStatus {
    /// Created or reset for another attempt, not yet running.
    Pending,
    /// Stages are executing.
    Running,
    /// Every stage succeeded.
    Completed,
    /// The run failed and will not be retried.
    Failed,
    /// The owner cancelled the run.
    Cancelled,
    /// Waiting out a backoff delay before the next attempt.
    Retrying,
}

impl PipelineStatus {
    /// Returns true if the status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true while the run belongs in the active-run registry.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    ///
    /// `Pending → Running → {Completed | Failed | Cancelled | Retrying}` and
    /// `Retrying → Pending`. Non-terminal runs may also be cancelled directly.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running)
            | (Self::Running, Self::Completed | Self::Failed | Self::Cancelled | Self::Retrying)
            | (Self::Retrying, Self::Pending)
            | (Self::Pending | Self::Retrying, Self::Cancelled) => true,
            _ => false,
        }
    }
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Retrying => write!(f, "Retrying"),
        }
    }
}

/// The form-data providers a run can fetch from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Google Forms.
    GoogleForms,
    /// Microsoft Forms.
    MicrosoftForms,
    /// Typeform.
    Typeform,
}

impl SourceKind {
    /// Returns the wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GoogleForms => "google_forms",
            Self::MicrosoftForms => "microsoft_forms",
            Self::Typeform => "typeform",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown source kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported source kind: {0}")]
pub struct UnsupportedSourceKind(pub String);

impl FromStr for SourceKind {
    type Err = UnsupportedSourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google_forms" | "google" => Ok(Self::GoogleForms),
            "microsoft_forms" | "microsoft" => Ok(Self::MicrosoftForms),
            "typeform" => Ok(Self::Typeform),
            _ => Err(UnsupportedSourceKind(s.to_string())),
        }
    }
}

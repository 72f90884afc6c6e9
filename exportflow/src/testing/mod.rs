//! Testing utilities for export pipelines.
//!
//! This module provides:
//! - File-writing fakes for every collaborator port
//! - Stages for observing ordering and holding runs mid-flight
//! - A helper wiring the fakes into [`Collaborators`]

mod mocks;

pub use mocks::{
    FailingFetcher, FileReportGenerator, FileSpreadsheetGenerator, GateStage, PassthroughValidator,
    RecordingStage, StaticFetcher,
};

use crate::core::SourceKind;
use crate::stages::ports::Collaborators;
use std::sync::Arc;

/// Collaborators that succeed for every provider, fetching `responses`
/// responses per source.
#[must_use]
pub fn fake_collaborators(responses: usize) -> Collaborators {
    let fetcher = Arc::new(StaticFetcher::with_responses(responses));
    Collaborators::new()
        .with_fetcher(SourceKind::GoogleForms, fetcher.clone())
        .with_fetcher(SourceKind::MicrosoftForms, fetcher.clone())
        .with_fetcher(SourceKind::Typeform, fetcher)
        .with_validator(Arc::new(PassthroughValidator::new()))
        .with_spreadsheet(Arc::new(FileSpreadsheetGenerator::new()))
        .with_report(Arc::new(FileReportGenerator))
}

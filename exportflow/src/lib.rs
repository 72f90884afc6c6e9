//! # Exportflow
//!
//! A resumable export pipeline engine for form data.
//!
//! Every run drives the same five stages in order: fetch the source, validate
//! it, render a spreadsheet, render a report, and finalize the outputs.
//! Exportflow provides:
//!
//! - **Persisted run state**: every transition is written to a [`store::StateStore`]
//! - **In-place retries**: failed attempts back off on a fixed table under one run id
//! - **Cooperative cancellation**: checked between stages and during backoff
//! - **Hygiene**: temp-file cleanup, output compression, and an expiry sweep
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use exportflow::prelude::*;
//!
//! let store = connect_state_store(None, config.state_ttl()).await;
//! let engine = PipelineEngine::with_collaborators(store, &collaborators, config);
//!
//! let result = engine
//!     .execute(RunRequest::new("user-1", "form-42", "google_forms"), None)
//!     .await;
//! assert!(result.success);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation
)]

pub mod cleanup;
pub mod compression;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod store;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{EngineConfig, ReportFormat, RunConfig};
    pub use crate::context::{ErrorEntry, PipelineContext, PipelineResult};
    pub use crate::core::{PipelineStage, PipelineStatus, SourceKind};
    pub use crate::errors::{PipelineError, PipelineFailure, StoreError};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{PipelineEngine, ProgressCallback, RetryPolicy, RunRequest};
    pub use crate::stages::ports::{
        Collaborators, DataValidator, ReportGenerator, SourceFetcher, SpreadsheetGenerator,
    };
    pub use crate::stages::{StageHandler, StageSet};
    pub use crate::store::{connect_state_store, InMemoryStateStore, StateStore};
}

//! Run orchestration.
//!
//! This module provides:
//! - The engine that sequences stages, persists state and retries failures
//! - The backoff-table retry policy
//! - The registry of in-flight runs used by cancellation

mod engine;
mod registry;
mod retry;

pub use engine::{PipelineEngine, ProgressCallback, RunRequest};
pub use registry::{ActiveRunRegistry, RunHandle};
pub use retry::{RetryDecision, RetryPolicy, DEFAULT_BACKOFF_SECONDS};

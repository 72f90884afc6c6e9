//! Run state.
//!
//! This module provides:
//! - `PipelineContext`: the mutable, persisted record of a run
//! - `ErrorEntry`: stage-tagged errors and warnings
//! - `PipelineResult`: the terminal value returned to callers

mod result;
mod run;

pub use result::PipelineResult;
pub use run::{keys, ErrorEntry, PipelineContext};

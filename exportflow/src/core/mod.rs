//! Core types for pipeline runs.
//!
//! This module contains:
//! - `PipelineStage`: the fixed stage sequence
//! - `PipelineStatus`: run lifecycle states and legal transitions
//! - `SourceKind`: supported form-data providers

mod status;

pub use status::{PipelineStage, PipelineStatus, SourceKind, UnsupportedSourceKind};

//! Gzip compression of output artifacts.
//!
//! A file is compressed only when it exceeds the size threshold, and the
//! compressed copy replaces it only when strictly smaller. Otherwise the
//! compressed attempt is deleted and the original is kept untouched.

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Metrics about a compression operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressionMetrics {
    /// Original size in bytes.
    pub original_bytes: u64,
    /// Compressed size in bytes.
    pub compressed_bytes: u64,
    /// Reduction in bytes.
    pub reduction_bytes: u64,
    /// Compression ratio (compressed/original).
    pub ratio: f64,
}

impl CompressionMetrics {
    /// Creates new metrics.
    #[must_use]
    pub fn new(original_bytes: u64, compressed_bytes: u64) -> Self {
        let reduction_bytes = original_bytes.saturating_sub(compressed_bytes);
        let ratio = if original_bytes == 0 {
            1.0
        } else {
            compressed_bytes as f64 / original_bytes as f64
        };

        Self {
            original_bytes,
            compressed_bytes,
            reduction_bytes,
            ratio,
        }
    }

    /// Returns true if the compressed form is strictly smaller.
    #[must_use]
    pub const fn is_beneficial(&self) -> bool {
        self.compressed_bytes < self.original_bytes
    }
}

/// What happened to one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompressionOutcome {
    /// The file was at or below the threshold.
    Skipped {
        /// The file.
        path: PathBuf,
        /// Its size.
        size: u64,
    },
    /// The compressed copy replaced the original.
    Replaced {
        /// The original file (now deleted).
        original: PathBuf,
        /// The compressed file.
        compressed: PathBuf,
        /// Sizes.
        metrics: CompressionMetrics,
    },
    /// Compression did not help; the original was kept.
    Retained {
        /// The file.
        path: PathBuf,
        /// Sizes.
        metrics: CompressionMetrics,
    },
}

impl CompressionOutcome {
    /// Returns the path that should be reported as the output.
    #[must_use]
    pub fn output_path(&self) -> &Path {
        match self {
            Self::Skipped { path, .. } | Self::Retained { path, .. } => path,
            Self::Replaced { compressed, .. } => compressed,
        }
    }
}

/// Summary of compressing a set of outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionReport {
    /// The output set after compression, in the original order.
    pub outputs: Vec<PathBuf>,
    /// Per-file outcomes.
    pub outcomes: Vec<CompressionOutcome>,
    /// Files that could not be processed; their originals are kept.
    pub warnings: Vec<String>,
}

impl CompressionReport {
    /// Returns the number of files replaced by a compressed copy.
    #[must_use]
    pub fn replaced_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, CompressionOutcome::Replaced { .. }))
            .count()
    }
}

/// Returns the path of the compressed sibling of `path`.
#[must_use]
pub fn compressed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".gz");
    PathBuf::from(name)
}

/// Compresses one file if it exceeds `threshold_bytes`.
pub async fn compress_file(path: &Path, threshold_bytes: u64) -> io::Result<CompressionOutcome> {
    let original_bytes = tokio::fs::metadata(path).await?.len();
    if original_bytes <= threshold_bytes {
        return Ok(CompressionOutcome::Skipped {
            path: path.to_path_buf(),
            size: original_bytes,
        });
    }

    let source = path.to_path_buf();
    let target = compressed_path(path);
    let compressed_bytes = {
        let (source, target) = (source.clone(), target.clone());
        tokio::task::spawn_blocking(move || gzip(&source, &target))
            .await
            .map_err(io::Error::other)?
    };

    let compressed_bytes = match compressed_bytes {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = tokio::fs::remove_file(&target).await;
            return Err(e);
        }
    };

    let metrics = CompressionMetrics::new(original_bytes, compressed_bytes);
    if metrics.is_beneficial() {
        promote(&source, &target).await?;
        debug!(
            path = %source.display(),
            original_bytes,
            compressed_bytes,
            "Replaced output with compressed copy"
        );
        Ok(CompressionOutcome::Replaced {
            original: source,
            compressed: target,
            metrics,
        })
    } else {
        tokio::fs::remove_file(&target).await?;
        debug!(
            path = %source.display(),
            original_bytes,
            compressed_bytes,
            "Compression not beneficial, keeping original"
        );
        Ok(CompressionOutcome::Retained {
            path: source,
            metrics,
        })
    }
}

/// Drops `source` in favour of its compressed copy.
///
/// If the original cannot be removed it remains the output, and the copy is
/// deleted so it does not linger next to it.
async fn promote(source: &Path, target: &Path) -> io::Result<()> {
    if let Err(e) = tokio::fs::remove_file(source).await {
        let _ = tokio::fs::remove_file(target).await;
        return Err(e);
    }
    Ok(())
}

/// Compresses every output, keeping whichever version of each file wins.
///
/// Failures never propagate: the affected original stays in the output set
/// and the failure is reported as a warning.
pub async fn compress_outputs(outputs: &[PathBuf], threshold_bytes: u64) -> CompressionReport {
    let mut report = CompressionReport::default();

    for path in outputs {
        match compress_file(path, threshold_bytes).await {
            Ok(outcome) => {
                report.outputs.push(outcome.output_path().to_path_buf());
                report.outcomes.push(outcome);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to compress output");
                report
                    .warnings
                    .push(format!("Failed to compress {}: {e}", path.display()));
                report.outputs.push(path.clone());
            }
        }
    }

    report
}

fn gzip(source: &Path, target: &Path) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(source)?);
    let writer = BufWriter::new(File::create(target)?);
    let mut encoder = GzEncoder::new(writer, Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    let mut writer = encoder.finish()?;
    io::Write::flush(&mut writer)?;
    drop(writer);
    Ok(std::fs::metadata(target)?.len())
}

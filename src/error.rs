//! Error types shared by the collector, the aggregation pipeline and the
//! build comparison store.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised or reported by [`crate::collector::MetricCollector`].
///
/// The type is `Clone` because a single persist outcome is handed to every
/// `flush()` caller waiting on it; I/O sources are wrapped in `Arc` for that.
#[derive(Debug, Clone, Error)]
pub enum CollectorError {
    /// A metric event was rejected before buffering.
    #[error("invalid metric: {0}")]
    Validation(String),

    /// The filesystem refused the persist of a batch.
    #[error("failed to write {records} metrics to {path:?}: {source}")]
    Write {
        path: PathBuf,
        records: usize,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The in-memory buffer is at its hard cap.
    #[error("metric buffer full ({limit} records); record dropped until the pending flush completes")]
    ResourceLimit { limit: usize },

    /// The collector was configured with unusable options.
    #[error("invalid collector configuration: {0}")]
    Configuration(String),

    /// A flush task ended without reporting an outcome (runtime shutdown or panic).
    #[error("flush task ended before completing")]
    FlushAbandoned,
}

impl CollectorError {
    pub(crate) fn write(path: &std::path::Path, records: usize, source: std::io::Error) -> Self {
        CollectorError::Write {
            path: path.to_path_buf(),
            records,
            source: Arc::new(source),
        }
    }
}

/// Errors that abort an aggregation run.
///
/// Row-level and file-level problems are warnings on the report, not errors.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("no sources were given")]
    NoSources,

    #[error("no valid records found in {files} input file(s)")]
    NoValidRecords { files: usize, warnings: Vec<String> },

    #[error("failed to write report to {path:?}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Errors from persisting a build snapshot. Reads never fail.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to serialize build snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write build snapshot {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

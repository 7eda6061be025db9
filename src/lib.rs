//! # Performance Telemetry Library
//!
//! Collects per-request load-test measurements into JMeter-compatible CSV
//! logs and aggregates those logs into report data with build-over-build
//! comparison.
//!
//! ## Architecture Overview
//!
//! ```text
//! adapter -> MetricCollector -> CSV log -> CsvRecordParser -> AggregationPipeline
//!                                                                  |
//!                      report-data.json <- ReportWriter <- AggregationReport
//!                                                                  |
//!                                           BuildComparisonStore <-+
//! ```
//!
//! - `collector`: buffered, append-only CSV writer used at the point of measurement
//! - `record`: the metric event and persisted row types and their CSV encoding
//! - `parser`: tolerant CSV line parser with validation and injection checks
//! - `metrics`: percentiles, APDEX and dispersion
//! - `aggregation`: streams logs and computes summary, endpoint, time and error statistics
//! - `comparison`: build snapshot persistence and delta classification
//! - `results`: report data model and the JSON writer
//! - `cli`, `logging`, `utils`: driver plumbing
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use perf_telemetry::{AggregationConfig, AggregationPipeline, CollectorConfig, MetricCollector, MetricEvent};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let collector = MetricCollector::new(CollectorConfig::new("results/run.csv"))?;
//!     collector.record_metric(MetricEvent::new("/api/users", "GET", 245.0, 200));
//!     collector.dispose().await?;
//!
//!     let config = AggregationConfig {
//!         sources: vec!["results/run.csv".into()],
//!         ..AggregationConfig::default()
//!     };
//!     let report = AggregationPipeline::new(config).run().await?;
//!     println!("p95: {:?}", report.summary.p95);
//!     Ok(())
//! }
//! ```

/// Log aggregation and statistics
///
/// Streams one or more CSV logs through the parser into endpoint groups and
/// computes the report data model. Memory is bounded by a record cap derived
/// from the configured budget.
pub mod aggregation;

/// Command-line interface and configuration
pub mod cli;

/// Metric collection at the point of measurement
///
/// Buffers events and appends them to a CSV log in batches, with at most one
/// write in flight per collector.
pub mod collector;

/// Build-over-build comparison
pub mod comparison;

pub mod error;

pub mod logging;

/// Statistics engine
///
/// Nearest-rank percentiles, APDEX scoring and population standard deviation.
pub mod metrics;

/// CSV line parsing
pub mod parser;

/// Metric and CSV row types
pub mod record;

/// Report data model and output
pub mod results;

pub mod utils;

// Re-export key types for convenient library usage
pub use aggregation::{AggregationConfig, AggregationPipeline};
pub use collector::{CollectorConfig, CollectorOptions, CollectorStats, MetricCollector};
pub use comparison::{BuildComparisonStore, BuildSnapshot};
pub use error::{AggregationError, CollectorError, SnapshotError};
pub use parser::CsvRecordParser;
pub use record::{MetricEvent, PersistedRecord};
pub use results::{AggregationReport, ReportWriter};

/// The current version of the telemetry library
///
/// Populated from Cargo.toml and stamped into every report.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Records buffered before a collector flushes
    pub const BUFFER_SIZE: usize = 1000;

    /// Upper clamp for the configured buffer size
    pub const MAX_BUFFER_SIZE: usize = 10_000;

    /// Periodic flush interval in milliseconds
    pub const FLUSH_INTERVAL_MS: u64 = 5000;

    /// Hard cap on records a collector holds while a write is pending
    ///
    /// Past this, new records are refused and reported through the error
    /// callback rather than growing memory without bound.
    pub const MAX_BUFFERED_RECORDS: usize = 100_000;

    /// Written to the `Filename` column when an event names no test
    pub const TEST_NAME: &str = "perf-test";

    /// Aggregation memory budget in megabytes
    pub const MAX_MEMORY_USAGE_MB: usize = 512;

    /// Assumed in-memory cost of one aggregated record
    pub const RECORD_FOOTPRINT_BYTES: usize = 256;

    /// APDEX satisfaction threshold in milliseconds
    pub const APDEX_THRESHOLD_MS: f64 = crate::metrics::DEFAULT_APDEX_THRESHOLD_MS;

    /// Report output directory
    pub const OUTPUT_DIR: &str = "performance-report";
}

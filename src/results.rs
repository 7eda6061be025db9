use crate::error::AggregationError;
use crate::metrics::ApdexScore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of the report data model inside the output directory.
pub const REPORT_FILE_NAME: &str = "report-data.json";

/// Build-over-build movement of an endpoint's average response time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Stable,
    Improved,
    Degraded,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trend::Stable => write!(f, "stable"),
            Trend::Improved => write!(f, "improved"),
            Trend::Degraded => write!(f, "degraded"),
        }
    }
}

/// Per-endpoint statistics for one aggregation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStats {
    pub label: String,
    pub samples: usize,
    pub average: f64,
    pub median: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p90: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p99: Option<f64>,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    /// Failed / total, 0–1
    pub error_rate: f64,
    /// Requests per second over the whole dataset's duration
    pub throughput: f64,
    pub received_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apdex: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_average: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend: Option<Trend>,
}

/// One non-empty time bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesPoint {
    /// Bucket start, milliseconds since epoch
    pub timestamp: u64,
    pub samples: usize,
    pub average_response_time: f64,
    pub throughput: f64,
    pub error_rate: f64,
    pub max_threads: u32,
}

/// Failed requests sharing one response code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub status_code: u16,
    pub count: usize,
    /// Share of all requests, 0–100
    pub percentage: f64,
    pub message: String,
}

/// Whole-run statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub average: f64,
    pub median: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p90: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p99: Option<f64>,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub error_rate: f64,
    pub throughput: f64,
    pub duration_seconds: f64,
    pub start_time: u64,
    pub end_time: u64,
    pub total_bytes: u64,
    pub endpoint_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apdex: Option<ApdexScore>,
}

/// How much input an aggregation run consumed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStats {
    pub files_read: usize,
    pub files_failed: usize,
    pub lines_read: usize,
    pub records_accepted: usize,
    pub records_rejected: usize,
}

/// What the run was compared against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonInfo {
    pub previous_build: String,
    pub previous_timestamp: chrono::DateTime<chrono::Utc>,
    pub improved: usize,
    pub degraded: usize,
    pub stable: usize,
    pub unmatched: usize,
}

/// The data model handed to the report renderer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationReport {
    pub build_number: String,
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub summary: Summary,
    pub endpoint_stats: Vec<EndpointStats>,
    pub time_series_data: Vec<TimeSeriesPoint>,
    pub error_summary: Vec<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apdex_data: Option<Vec<ApdexScore>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison: Option<ComparisonInfo>,
    pub ingest: IngestStats,
    pub truncated: bool,
    pub warnings: Vec<String>,
}

/// Writes the report data model for the external renderer
pub struct ReportWriter {
    output_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
        }
    }

    pub fn report_path(&self) -> PathBuf {
        self.output_dir.join(REPORT_FILE_NAME)
    }

    /// Write the report as pretty JSON, creating the output directory.
    pub async fn write(&self, report: &AggregationReport) -> Result<PathBuf, AggregationError> {
        let path = self.report_path();
        let io_err = |source| AggregationError::Output {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(io_err)?;

        let json = serde_json::to_string_pretty(report)
            .map_err(|e| io_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        tokio::fs::write(&path, json).await.map_err(io_err)?;

        debug!(
            "Report data: {} endpoints, {} time buckets",
            report.endpoint_stats.len(),
            report.time_series_data.len()
        );
        info!("Report data written to: {:?}", path);
        Ok(path)
    }
}

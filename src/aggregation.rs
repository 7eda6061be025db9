//! # Aggregation Pipeline
//!
//! Turns one or more CSV logs into the report data model.
//!
//! ## Flow
//!
//! 1. **Resolve sources**: files are taken as given; a directory contributes
//!    its `*.csv` files in name order.
//! 2. **Ingest**: every file is streamed line by line through
//!    [`CsvRecordParser`]. Accepted records land in an arena of endpoint
//!    groups (first-seen order) and a flat sample list for time bucketing.
//! 3. **Compute**: summary, per-endpoint statistics, time series, error
//!    summary and APDEX.
//! 4. **Compare**: optionally annotate endpoints against the previous build
//!    and store this build as the next baseline.
//!
//! ## Failure Model
//!
//! Bad rows and unreadable files become warnings on the report. The run only
//! fails when no file yields a single valid record, or when the build
//! snapshot cannot be written.
//!
//! ## Memory
//!
//! Retained records are capped at `max_memory_usage_mb` divided by an assumed
//! footprint of 256 bytes per record. Reaching the cap stops ingestion and
//! marks the report as truncated.

use crate::comparison::BuildComparisonStore;
use crate::error::AggregationError;
use crate::metrics::{self, ApdexScore};
use crate::parser::{is_header_line, CsvRecordParser, ParserOptions};
use crate::record::PersistedRecord;
use crate::results::{
    AggregationReport, EndpointStats, ErrorInfo, IngestStats, Summary, TimeSeriesPoint,
};
use crate::utils;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// Lines read between cooperative yields to the scheduler.
const YIELD_EVERY_LINES: usize = 512;

/// Row-level diagnostics kept verbatim per file.
const MAX_DIAGNOSTICS_PER_FILE: usize = 100;

/// Target number of time buckets across the dataset.
const TARGET_BUCKETS: f64 = 100.0;

/// Aggregation run configuration
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// CSV files or directories of CSV files
    pub sources: Vec<PathBuf>,
    /// Where the report and, by default, the build snapshot go
    pub output_dir: PathBuf,
    pub max_memory_usage_mb: usize,
    /// Only structural checks and numeric coercion when true
    pub skip_validation: bool,
    pub apdex_threshold_ms: f64,
    pub include_percentiles: bool,
    pub include_apdex: bool,
    pub compare_to_previous: bool,
    /// Overrides `output_dir/build-snapshot.json`
    pub comparison_snapshot_path: Option<PathBuf>,
    /// Identifier stored with the snapshot; a UUID is generated when absent
    pub build_number: Option<String>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            output_dir: PathBuf::from(crate::defaults::OUTPUT_DIR),
            max_memory_usage_mb: crate::defaults::MAX_MEMORY_USAGE_MB,
            skip_validation: false,
            apdex_threshold_ms: crate::defaults::APDEX_THRESHOLD_MS,
            include_percentiles: true,
            include_apdex: true,
            compare_to_previous: true,
            comparison_snapshot_path: None,
            build_number: None,
        }
    }
}

impl AggregationConfig {
    /// Maximum number of records a run retains.
    pub fn record_limit(&self) -> usize {
        (self.max_memory_usage_mb.saturating_mul(1024 * 1024)
            / crate::defaults::RECORD_FOOTPRINT_BYTES)
            .max(1)
    }
}

/// Per-record data needed after grouping
#[derive(Debug, Clone, Copy)]
struct Sample {
    timestamp: u64,
    elapsed: f64,
    success: bool,
    all_threads: u32,
    response_code: u16,
}

#[derive(Debug)]
struct EndpointGroup {
    label: String,
    elapsed: Vec<f64>,
    failures: usize,
    received_bytes: u64,
}

/// Everything ingested so far, across files
#[derive(Debug, Default)]
struct Dataset {
    groups: Vec<EndpointGroup>,
    index: HashMap<String, usize>,
    samples: Vec<Sample>,
    total_bytes: u64,
    truncated: bool,
}

impl Dataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn push(&mut self, record: PersistedRecord) {
        let slot = match self.index.get(&record.label) {
            Some(&slot) => slot,
            None => {
                let slot = self.groups.len();
                self.index.insert(record.label.clone(), slot);
                self.groups.push(EndpointGroup {
                    label: record.label.clone(),
                    elapsed: Vec::new(),
                    failures: 0,
                    received_bytes: 0,
                });
                slot
            }
        };

        let group = &mut self.groups[slot];
        group.elapsed.push(record.elapsed);
        group.received_bytes = group.received_bytes.saturating_add(record.bytes);
        if !record.success {
            group.failures += 1;
        }

        self.total_bytes = self.total_bytes.saturating_add(record.bytes);
        self.samples.push(Sample {
            timestamp: record.timestamp,
            elapsed: record.elapsed,
            success: record.success,
            all_threads: record.all_threads,
            response_code: record.response_code,
        });
    }
}

/// Collects row diagnostics for one file, keeping the first few verbatim.
struct FileDiagnostics {
    file: String,
    kept: Vec<String>,
    omitted: usize,
}

impl FileDiagnostics {
    fn new(path: &Path) -> Self {
        let file = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            file,
            kept: Vec::new(),
            omitted: 0,
        }
    }

    fn push(&mut self, message: String) {
        if self.kept.len() < MAX_DIAGNOSTICS_PER_FILE {
            self.kept.push(format!("{}: {}", self.file, message));
        } else {
            self.omitted += 1;
        }
    }

    fn finish(self, warnings: &mut Vec<String>) {
        warnings.extend(self.kept);
        if self.omitted > 0 {
            warnings.push(format!(
                "{}: {} further diagnostics omitted",
                self.file, self.omitted
            ));
        }
    }
}

/// Streams CSV logs into an [`AggregationReport`]
pub struct AggregationPipeline {
    config: AggregationConfig,
    parser: CsvRecordParser,
}

impl AggregationPipeline {
    pub fn new(config: AggregationConfig) -> Self {
        let parser = CsvRecordParser::new(ParserOptions {
            validate: !config.skip_validation,
        });
        Self { config, parser }
    }

    /// Replace the line parser, e.g. to pin its clock.
    pub fn with_parser(mut self, parser: CsvRecordParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Run the whole pipeline.
    ///
    /// ## Errors
    ///
    /// - [`AggregationError::NoSources`] when `sources` is empty
    /// - [`AggregationError::NoValidRecords`] when nothing parsed
    /// - [`AggregationError::Snapshot`] when the build snapshot cannot be saved
    pub async fn run(&self) -> Result<AggregationReport, AggregationError> {
        if self.config.sources.is_empty() {
            return Err(AggregationError::NoSources);
        }

        let mut warnings = Vec::new();
        let mut ingest = IngestStats::default();
        let files = resolve_sources(&self.config.sources, &mut warnings).await;
        info!("Aggregating {} source file(s)", files.len());

        let limit = self.config.record_limit();
        let mut dataset = Dataset::default();

        for path in &files {
            if dataset.truncated {
                break;
            }
            match self.ingest_file(path, limit, &mut dataset, &mut ingest, &mut warnings).await {
                Ok(()) => ingest.files_read += 1,
                Err(e) => {
                    warn!("Skipping {:?}: {}", path, e);
                    warnings.push(format!("Could not read {}: {}", path.display(), e));
                    ingest.files_failed += 1;
                }
            }
        }

        if dataset.truncated {
            warnings.push(format!(
                "Record limit of {} reached ({} MB budget); remaining input was not aggregated",
                limit, self.config.max_memory_usage_mb
            ));
        }

        if dataset.samples.is_empty() {
            return Err(AggregationError::NoValidRecords {
                files: files.len(),
                warnings,
            });
        }

        let mut report = self.compute(dataset, ingest, warnings);

        if self.config.compare_to_previous {
            let store = match &self.config.comparison_snapshot_path {
                Some(path) => BuildComparisonStore::new(path.clone()),
                None => BuildComparisonStore::for_output_dir(&self.config.output_dir),
            };
            report.comparison = store
                .compare_and_store(
                    &report.build_number,
                    &mut report.endpoint_stats,
                    &report.summary,
                )
                .await?;
        }

        info!(
            "Aggregated {} requests across {} endpoints ({} warnings)",
            report.summary.total_requests,
            report.summary.endpoint_count,
            report.warnings.len()
        );
        Ok(report)
    }

    async fn ingest_file(
        &self,
        path: &Path,
        limit: usize,
        dataset: &mut Dataset,
        ingest: &mut IngestStats,
        warnings: &mut Vec<String>,
    ) -> std::io::Result<()> {
        let file = tokio::fs::File::open(path).await?;
        let mut reader = BufReader::new(file);
        let mut raw = Vec::new();
        let mut diagnostics = FileDiagnostics::new(path);
        let mut line_number = 0usize;
        let mut accepted = 0usize;

        let result = loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break Ok(()),
                Ok(_) => {}
                Err(e) => break Err(e),
            }
            line_number += 1;
            if line_number % YIELD_EVERY_LINES == 0 {
                tokio::task::yield_now().await;
            }
            let line = match std::str::from_utf8(trim_line_ending(&raw)) {
                Ok(line) => line,
                Err(_) => {
                    if dataset.len() >= limit {
                        dataset.truncated = true;
                        break Ok(());
                    }
                    ingest.lines_read += 1;
                    ingest.records_rejected += 1;
                    diagnostics.push(format!("Line {}: not valid UTF-8", line_number));
                    continue;
                }
            };
            if line.trim().is_empty() || is_header_line(line) {
                continue;
            }
            if dataset.len() >= limit {
                dataset.truncated = true;
                break Ok(());
            }

            ingest.lines_read += 1;
            let outcome = self.parser.parse_line(line, line_number);
            for message in outcome.errors.into_iter().chain(outcome.warnings) {
                diagnostics.push(message);
            }
            match outcome.record {
                Some(record) => {
                    dataset.push(record);
                    accepted += 1;
                }
                None => ingest.records_rejected += 1,
            }
        };

        ingest.records_accepted += accepted;
        diagnostics.finish(warnings);
        debug!("{:?}: {} lines, {} records accepted", path, line_number, accepted);
        result
    }

    fn compute(
        &self,
        dataset: Dataset,
        ingest: IngestStats,
        warnings: Vec<String>,
    ) -> AggregationReport {
        let config = &self.config;
        let Dataset {
            groups,
            samples,
            total_bytes,
            truncated,
            ..
        } = dataset;

        let start_time = samples.iter().map(|s| s.timestamp).min().unwrap_or(0);
        let end_time = samples.iter().map(|s| s.timestamp).max().unwrap_or(0);
        let duration_seconds = (end_time - start_time) as f64 / 1000.0;
        let rate_window = duration_seconds.max(1.0);

        let mut apdex_data = Vec::new();
        let endpoint_stats: Vec<EndpointStats> = groups
            .into_iter()
            .map(|mut group| {
                group.elapsed.sort_by(f64::total_cmp);
                let sorted = &group.elapsed;
                let samples = sorted.len();
                let dispersion = metrics::summarize(sorted);
                let apdex = config.include_apdex.then(|| {
                    metrics::apdex(sorted, config.apdex_threshold_ms, Some(&group.label))
                });
                let score = apdex.as_ref().map(|a| a.score);
                if let Some(apdex) = apdex {
                    apdex_data.push(apdex);
                }

                EndpointStats {
                    samples,
                    average: dispersion.mean,
                    median: metrics::percentile_sorted(sorted, 50.0),
                    p90: percentile_if(config.include_percentiles, sorted, 90.0),
                    p95: percentile_if(config.include_percentiles, sorted, 95.0),
                    p99: percentile_if(config.include_percentiles, sorted, 99.0),
                    min: dispersion.min,
                    max: dispersion.max,
                    std_dev: dispersion.std_dev,
                    error_rate: group.failures as f64 / samples as f64,
                    throughput: samples as f64 / rate_window,
                    received_bytes: group.received_bytes,
                    apdex: score,
                    previous_average: None,
                    delta: None,
                    delta_percent: None,
                    trend: None,
                    label: group.label,
                }
            })
            .collect();

        let mut all: Vec<f64> = samples.iter().map(|s| s.elapsed).collect();
        all.sort_by(f64::total_cmp);
        let dispersion = metrics::summarize(&all);
        let failed_requests = samples.iter().filter(|s| !s.success).count();
        let total_requests = samples.len();

        let summary = Summary {
            total_requests,
            failed_requests,
            average: dispersion.mean,
            median: metrics::percentile_sorted(&all, 50.0),
            p90: percentile_if(config.include_percentiles, &all, 90.0),
            p95: percentile_if(config.include_percentiles, &all, 95.0),
            p99: percentile_if(config.include_percentiles, &all, 99.0),
            min: dispersion.min,
            max: dispersion.max,
            std_dev: dispersion.std_dev,
            error_rate: failed_requests as f64 / total_requests as f64,
            throughput: total_requests as f64 / rate_window,
            duration_seconds,
            start_time,
            end_time,
            total_bytes,
            endpoint_count: endpoint_stats.len(),
            apdex: config
                .include_apdex
                .then(|| metrics::apdex(&all, config.apdex_threshold_ms, None)),
        };

        let build_number = config
            .build_number
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::to_string)
            .unwrap_or_else(utils::generate_run_id);

        AggregationReport {
            build_number,
            generated_at: chrono::Utc::now(),
            version: crate::VERSION.to_string(),
            time_series_data: time_series(&samples, start_time, duration_seconds),
            error_summary: error_summary(&samples),
            apdex_data: config.include_apdex.then_some(apdex_data),
            summary,
            endpoint_stats,
            comparison: None,
            ingest,
            truncated,
            warnings,
        }
    }
}

fn percentile_if(enabled: bool, sorted: &[f64], p: f64) -> Option<f64> {
    enabled.then(|| metrics::percentile_sorted(sorted, p))
}

/// Strip a trailing `\n` or `\r\n`.
fn trim_line_ending(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

/// Expand directories into their CSV files; plain paths pass through.
async fn resolve_sources(sources: &[PathBuf], warnings: &mut Vec<String>) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for source in sources {
        let is_dir = tokio::fs::metadata(source)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            files.push(source.clone());
            continue;
        }

        match csv_files_in(source).await {
            Ok(found) if found.is_empty() => {
                warnings.push(format!("No CSV files in {}", source.display()));
            }
            Ok(found) => files.extend(found),
            Err(e) => {
                warn!("Cannot list {:?}: {}", source, e);
                warnings.push(format!("Could not list {}: {}", source.display(), e));
            }
        }
    }
    files
}

async fn csv_files_in(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_csv = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if is_csv && entry.file_type().await?.is_file() {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

#[derive(Default)]
struct Bucket {
    elapsed_sum: f64,
    samples: usize,
    failures: usize,
    max_threads: u32,
}

/// Fixed-width buckets over the dataset; empty buckets are omitted.
fn time_series(samples: &[Sample], start_time: u64, duration_seconds: f64) -> Vec<TimeSeriesPoint> {
    let width_s = ((duration_seconds / TARGET_BUCKETS).floor() as u64).max(1);
    let width_ms = width_s * 1000;

    let mut buckets: BTreeMap<u64, Bucket> = BTreeMap::new();
    for sample in samples {
        let bucket = buckets
            .entry((sample.timestamp - start_time) / width_ms)
            .or_default();
        bucket.elapsed_sum += sample.elapsed;
        bucket.samples += 1;
        if !sample.success {
            bucket.failures += 1;
        }
        bucket.max_threads = bucket.max_threads.max(sample.all_threads);
    }

    buckets
        .into_iter()
        .map(|(slot, bucket)| TimeSeriesPoint {
            timestamp: start_time + slot * width_ms,
            samples: bucket.samples,
            average_response_time: bucket.elapsed_sum / bucket.samples as f64,
            throughput: bucket.samples as f64 / width_s as f64,
            error_rate: bucket.failures as f64 / bucket.samples as f64,
            max_threads: bucket.max_threads,
        })
        .collect()
}

/// Failed requests grouped by response code, most frequent first.
fn error_summary(samples: &[Sample]) -> Vec<ErrorInfo> {
    let mut counts: BTreeMap<u16, usize> = BTreeMap::new();
    for sample in samples.iter().filter(|s| !s.success) {
        *counts.entry(sample.response_code).or_default() += 1;
    }

    let total = samples.len() as f64;
    let mut summary: Vec<ErrorInfo> = counts
        .into_iter()
        .map(|(status_code, count)| ErrorInfo {
            status_code,
            count,
            percentage: count as f64 / total * 100.0,
            message: status_text(status_code)
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status_code)),
        })
        .collect();
    summary.sort_by(|a, b| b.count.cmp(&a.count).then(a.status_code.cmp(&b.status_code)));
    summary
}

/// Reason phrases for the codes load tests commonly fail with.
pub fn status_text(code: u16) -> Option<&'static str> {
    let text = match code {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => return None,
    };
    Some(text)
}

/// APDEX of the whole run, if the report carries one.
pub fn overall_apdex(report: &AggregationReport) -> Option<&ApdexScore> {
    report.summary.apdex.as_ref()
}

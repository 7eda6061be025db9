//! # Performance Telemetry - Main Entry Point
//!
//! Aggregates load-test CSV logs into `report-data.json` for the report
//! renderer.
//!
//! ## Flow
//!
//! 1. **Initialize logging**: colorized console output, optional log file
//! 2. **Parse arguments**: clap flags converted into an `AggregationConfig`
//! 3. **Aggregate**: run the pipeline, including the build comparison
//! 4. **Write**: persist the report data and print a summary table
//!
//! ## Error Handling
//!
//! Row and file problems are printed as warnings and do not fail the run.
//! The process exits non-zero when no valid record was found or an output
//! could not be written.

use anyhow::{Context, Result};
use clap::Parser;
use perf_telemetry::{
    aggregation::{self, AggregationConfig, AggregationPipeline},
    cli::Args,
    error::AggregationError,
    logging,
    results::{AggregationReport, ReportWriter},
    utils,
};
use tracing::{info, warn};

/// Warnings printed individually before the rest are summarised.
const MAX_PRINTED_WARNINGS: usize = 20;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Held until exit so the file appender drains.
    let _log_guard = logging::init_logging(args.verbose, args.log_file.as_deref())?;

    utils::validate_memory_budget(args.max_memory_mb)?;
    utils::validate_apdex_threshold(args.apdex_threshold)?;

    info!("Starting Performance Telemetry v{}", perf_telemetry::VERSION);
    let config = AggregationConfig::from(&args);
    info!("Configuration: {:?}", config);

    let report = match AggregationPipeline::new(config.clone()).run().await {
        Ok(report) => report,
        Err(AggregationError::NoValidRecords { files, warnings }) => {
            print_warnings(&warnings);
            anyhow::bail!("No valid records found in {} input file(s)", files);
        }
        Err(e) => return Err(e).context("Aggregation failed"),
    };

    print_warnings(&report.warnings);

    let writer = ReportWriter::new(&config.output_dir);
    let path = writer
        .write(&report)
        .await
        .context("Failed to write report data")?;

    print_summary(&report);
    info!("Performance Telemetry completed: {:?}", path);
    Ok(())
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings.iter().take(MAX_PRINTED_WARNINGS) {
        warn!("{}", warning);
    }
    if warnings.len() > MAX_PRINTED_WARNINGS {
        warn!(
            "... and {} more warnings (see report data)",
            warnings.len() - MAX_PRINTED_WARNINGS
        );
    }
}

/// Print overall and per-endpoint results as a table.
fn print_summary(report: &AggregationReport) {
    let summary = &report.summary;

    println!();
    println!("Build {} ({})", report.build_number, report.generated_at.to_rfc3339());
    println!(
        "Requests: {}  Failed: {} ({})  Duration: {:.1}s  Throughput: {}",
        summary.total_requests,
        summary.failed_requests,
        utils::format_percent(summary.error_rate),
        summary.duration_seconds,
        utils::format_request_rate(summary.throughput)
    );
    println!(
        "Latency: avg {}  median {}  p95 {}  max {}",
        utils::format_millis(summary.average),
        utils::format_millis(summary.median),
        summary
            .p95
            .map(utils::format_millis)
            .unwrap_or_else(|| "-".to_string()),
        utils::format_millis(summary.max)
    );
    if let Some(apdex) = aggregation::overall_apdex(report) {
        println!("APDEX: {:.3} ({})", apdex.score, apdex.rating);
    }
    println!("Received: {}", utils::format_bytes(summary.total_bytes));
    if report.truncated {
        println!("Input truncated at the memory budget; statistics cover a prefix of the data.");
    }

    let widths = [32, 8, 10, 10, 8, 12, 10];
    println!();
    utils::print_table_separator(&widths);
    utils::print_table_row(
        &["Endpoint", "Samples", "Average", "Median", "Errors", "Throughput", "Trend"],
        &widths,
    );
    utils::print_table_separator(&widths);
    for stats in &report.endpoint_stats {
        let samples = stats.samples.to_string();
        let average = utils::format_millis(stats.average);
        let median = utils::format_millis(stats.median);
        let errors = utils::format_percent(stats.error_rate);
        let throughput = utils::format_request_rate(stats.throughput);
        let trend = match (stats.trend, stats.delta_percent) {
            (Some(trend), Some(pct)) => format!("{} {:+.1}%", trend, pct),
            (Some(trend), None) => trend.to_string(),
            (None, _) => "-".to_string(),
        };
        utils::print_table_row(
            &[
                utils::clamp_text(&stats.label, 32),
                samples.as_str(),
                average.as_str(),
                median.as_str(),
                errors.as_str(),
                throughput.as_str(),
                trend.as_str(),
            ],
            &widths,
        );
    }
    utils::print_table_separator(&widths);

    if let Some(comparison) = &report.comparison {
        println!(
            "Compared with build {}: {} improved, {} degraded, {} stable, {} new",
            comparison.previous_build,
            comparison.improved,
            comparison.degraded,
            comparison.stable,
            comparison.unmatched
        );
    }
}

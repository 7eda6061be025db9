use crate::aggregation::AggregationConfig;
use clap::Parser;
use std::path::PathBuf;

/// Performance Telemetry - aggregate load-test CSV logs into report data
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// CSV logs or directories of CSV logs to aggregate
    #[clap(required = true, num_args = 1.., help_heading = "Core Options")]
    pub sources: Vec<PathBuf>,

    /// Directory for report-data.json and the build snapshot
    #[clap(
        short = 'o',
        long,
        default_value = crate::defaults::OUTPUT_DIR,
        help_heading = "Core Options"
    )]
    pub output_dir: PathBuf,

    /// Build identifier stored with the snapshot (generated when absent)
    #[clap(short = 'b', long, env = "BUILD_NUMBER", help_heading = "Core Options")]
    pub build_number: Option<String>,

    /// Memory budget for retained records, in megabytes
    #[clap(long = "max-memory", default_value_t = crate::defaults::MAX_MEMORY_USAGE_MB)]
    pub max_memory_mb: usize,

    /// Accept rows with implausible values, coercing numbers
    #[clap(long, default_value_t = false)]
    pub skip_validation: bool,

    /// APDEX satisfaction threshold (e.g. "500", "500ms", "1.5s")
    #[clap(long, value_parser = parse_threshold, default_value = "500ms")]
    pub apdex_threshold: f64,

    /// Omit p90/p95/p99 from the report
    #[clap(long, default_value_t = false)]
    pub no_percentiles: bool,

    /// Omit APDEX scores from the report
    #[clap(long, default_value_t = false)]
    pub no_apdex: bool,

    /// Skip the build-over-build comparison
    #[clap(long, default_value_t = false)]
    pub no_compare: bool,

    /// Build snapshot location (defaults to OUTPUT_DIR/build-snapshot.json)
    #[clap(long)]
    pub snapshot: Option<PathBuf>,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,

    /// Also write logs to this file
    #[clap(long)]
    pub log_file: Option<PathBuf>,
}

impl From<&Args> for AggregationConfig {
    fn from(args: &Args) -> Self {
        Self {
            sources: args.sources.clone(),
            output_dir: args.output_dir.clone(),
            max_memory_usage_mb: args.max_memory_mb,
            skip_validation: args.skip_validation,
            apdex_threshold_ms: args.apdex_threshold,
            include_percentiles: !args.no_percentiles,
            include_apdex: !args.no_apdex,
            compare_to_previous: !args.no_compare,
            comparison_snapshot_path: args.snapshot.clone(),
            build_number: args.build_number.clone(),
        }
    }
}

/// Parse a threshold in milliseconds from string (e.g., "500", "500ms", "2s")
fn parse_threshold(s: &str) -> Result<f64, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Threshold cannot be empty".to_string());
    }

    let (num_str, scale) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, 1.0)
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, 1000.0)
    } else {
        (s, 1.0) // Default to milliseconds
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in threshold: {}", num_str))?;

    let threshold = num * scale;
    if !threshold.is_finite() || threshold <= 0.0 {
        return Err(format!("Threshold must be positive: {}", s));
    }
    Ok(threshold)
}

//! # Utility Functions and Helper Module
//!
//! Helpers used across the telemetry pipeline: sanitization of free-text
//! values before they reach a persisted or rendered artifact, human-readable
//! formatters for the console summary, small validation helpers and
//! identifier generation.
//!
//! ## Key Functionality Categories
//!
//! - **Sanitization**: HTML-entity escaping, length clamping, spreadsheet
//!   formula neutralization
//! - **Formatting**: Human-readable display of milliseconds, bytes and rates
//! - **Validation**: Collector buffer sizing and memory budget checks
//! - **Display Helpers**: Table formatting for the console summary
//!
//! ## Usage Examples
//!
//! ```rust
//! use perf_telemetry::utils::*;
//!
//! assert_eq!(escape_html("<b>"), "&lt;b&gt;");
//! assert_eq!(format_millis(1500.0), "1.50s");
//! assert_eq!(neutralize_formula("=SUM(A1)"), "'=SUM(A1)");
//! ```

use anyhow::Result;
use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Maximum length, in characters, of any free-text field.
pub const MAX_TEXT_LEN: usize = 1000;

/// Largest integer that survives a round trip through an IEEE-754 double.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Characters that make a spreadsheet treat a cell as a formula.
const FORMULA_PREFIXES: [char; 5] = ['@', '=', '+', '-', '|'];

/// Entities produced by [`escape_html`]; recognised so escaping is idempotent.
const KNOWN_ENTITIES: [&str; 5] = ["&amp;", "&lt;", "&gt;", "&quot;", "&#x27;"];

/// Generate a unique identifier for a build or test run
///
/// Used as the build identifier of a snapshot when neither the caller nor
/// the environment supplies one.
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get current timestamp as milliseconds since Unix epoch
///
/// The CSV log stores JMeter-style millisecond timestamps. If the system
/// clock is before the epoch, returns 0 rather than panicking.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Escape a value for safe inclusion in HTML
///
/// Replaces `&`, `<`, `>`, `"` and `'` with their entities. An `&` that
/// already starts one of the entities this function produces is left alone,
/// so escaping an escaped value is a no-op. Values written by the collector
/// are therefore read back unchanged by the parser.
///
/// ## Examples
///
/// ```rust
/// # use perf_telemetry::utils::escape_html;
/// assert_eq!(escape_html("a & b"), "a &amp; b");
/// assert_eq!(escape_html("a &amp; b"), "a &amp; b");
/// assert_eq!(escape_html("\"x\""), "&quot;x&quot;");
/// ```
pub fn escape_html(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(value);
    }

    let mut out = String::with_capacity(value.len() + 16);
    for (i, c) in value.char_indices() {
        match c {
            '&' if KNOWN_ENTITIES.iter().any(|e| value[i..].starts_with(e)) => out.push('&'),
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

/// Truncate a value to at most `max_chars` characters
///
/// Counts characters, not bytes, so multi-byte text is never split inside
/// a code point.
pub fn clamp_text(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &value[..byte_index],
        None => value,
    }
}

/// Truncate escaped text to at most `max_chars` characters without
/// splitting an entity.
fn clamp_escaped(value: &str, max_chars: usize) -> &str {
    let mut chars = 0;
    let mut end = 0;
    while end < value.len() {
        let rest = &value[end..];
        let entity = KNOWN_ENTITIES.iter().find(|e| rest.starts_with(**e));
        let (token_bytes, token_chars) = match (entity, rest.chars().next()) {
            (Some(entity), _) => (entity.len(), entity.len()),
            (None, Some(c)) => (c.len_utf8(), 1),
            (None, None) => break,
        };
        if chars + token_chars > max_chars {
            break;
        }
        chars += token_chars;
        end += token_bytes;
    }
    &value[..end]
}

/// HTML-escape, then clamp to [`MAX_TEXT_LEN`] characters
///
/// This is the single sanitization step applied to every free-text field
/// before it is buffered, persisted or handed downstream. The clamp never
/// cuts an entity in half, so sanitizing an already sanitized value returns
/// it unchanged.
pub fn sanitize_text(value: &str) -> String {
    let escaped = escape_html(value.trim());
    clamp_escaped(&escaped, MAX_TEXT_LEN).trim_end().to_string()
}

/// Check whether a value would be interpreted as a spreadsheet formula
pub fn is_formula_injection(value: &str) -> bool {
    value.starts_with(FORMULA_PREFIXES)
}

/// Prefix formula-like values with a quote so spreadsheets treat them as text
///
/// ## Examples
///
/// ```rust
/// # use perf_telemetry::utils::neutralize_formula;
/// assert_eq!(neutralize_formula("=cmd|calc"), "'=cmd|calc");
/// assert_eq!(neutralize_formula("/api/users"), "/api/users");
/// ```
pub fn neutralize_formula(value: &str) -> Cow<'_, str> {
    if is_formula_injection(value) {
        Cow::Owned(format!("'{}", value))
    } else {
        Cow::Borrowed(value)
    }
}

/// Format a millisecond value in a human-readable way
///
/// ## Unit Selection Logic
///
/// - **Microseconds**: < 1 ms (e.g., "250μs")
/// - **Milliseconds**: < 1,000 ms (e.g., "25.75ms")
/// - **Seconds**: < 60 s (e.g., "5.25s")
/// - **Minutes and Hours**: For longer durations (e.g., "5m 30s", "2h 15m 30s")
///
/// ## Examples
///
/// ```rust
/// # use perf_telemetry::utils::format_millis;
/// assert_eq!(format_millis(0.25), "250μs");
/// assert_eq!(format_millis(245.0), "245.00ms");
/// assert_eq!(format_millis(90_000.0), "1m 30s");
/// ```
pub fn format_millis(ms: f64) -> String {
    if ms < 1.0 {
        format!("{:.0}μs", ms * 1_000.0)
    } else if ms < 1_000.0 {
        format!("{:.2}ms", ms)
    } else if ms < 60_000.0 {
        format!("{:.2}s", ms / 1_000.0)
    } else {
        let seconds = (ms / 1_000.0) as u64;
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format bytes in a human-readable way
///
/// Uses binary (1024-based) scaling:
/// - Bytes: < 1024 (e.g., "500 B")
/// - Kilobytes: < 1024² (e.g., "1.50 KB")
/// - Megabytes: < 1024³ (e.g., "2.25 MB")
/// - Gigabytes: ≥ 1024³ (e.g., "1.75 GB")
pub fn format_bytes(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{:.0} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a request rate in a human-readable way
///
/// Uses decimal scaling (powers of 1000):
/// - < 1,000 (e.g., "750.0 req/s")
/// - Thousands (e.g., "15.50K req/s")
/// - Millions (e.g., "2.30M req/s")
pub fn format_request_rate(requests_per_second: f64) -> String {
    if requests_per_second < 1000.0 {
        format!("{:.1} req/s", requests_per_second)
    } else if requests_per_second < 1_000_000.0 {
        format!("{:.2}K req/s", requests_per_second / 1000.0)
    } else {
        format!("{:.2}M req/s", requests_per_second / 1_000_000.0)
    }
}

/// Format a 0–1 fraction as a percentage with two decimals
pub fn format_percent(fraction: f64) -> String {
    format!("{:.2}%", fraction * 100.0)
}

/// Clamp a requested collector flush threshold into the supported range
///
/// ## Validation Rules
///
/// - **Minimum**: 1 record (a zero threshold would flush on every call)
/// - **Maximum**: [`crate::defaults::MAX_BUFFER_SIZE`] records
pub fn clamp_buffer_size(requested: usize) -> usize {
    requested.clamp(1, crate::defaults::MAX_BUFFER_SIZE)
}

/// Validate that an aggregation memory budget is usable
///
/// The budget is converted into a record cap; anything under 1 MB would
/// retain so few records that a run could not produce meaningful statistics.
pub fn validate_memory_budget(max_memory_mb: usize) -> Result<()> {
    if max_memory_mb == 0 {
        anyhow::bail!("Memory budget cannot be zero");
    }
    if max_memory_mb > 64 * 1024 {
        anyhow::bail!(
            "Memory budget {} MB is too large (maximum 64 GB)",
            max_memory_mb
        );
    }
    Ok(())
}

/// Validate an APDEX threshold in milliseconds
pub fn validate_apdex_threshold(threshold_ms: f64) -> Result<()> {
    if !threshold_ms.is_finite() || threshold_ms <= 0.0 {
        anyhow::bail!("APDEX threshold must be a positive number of milliseconds");
    }
    Ok(())
}

/// Print a formatted table row
///
/// Left-aligns each column within its width and separates columns with `|`.
///
/// ```rust
/// # use perf_telemetry::utils::{print_table_row, print_table_separator};
/// let widths = [20, 10, 12];
/// print_table_separator(&widths);
/// print_table_row(&["Endpoint", "Avg", "Throughput"], &widths);
/// print_table_separator(&widths);
/// ```
pub fn print_table_row(columns: &[&str], widths: &[usize]) {
    print!("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        print!(" {:width$} |", column, width = width);
    }
    println!();
}

/// Print a table separator matching the given column widths
pub fn print_table_separator(widths: &[usize]) {
    print!("+");
    for &width in widths {
        print!("{}", "-".repeat(width + 2));
        print!("+");
    }
    println!();
}

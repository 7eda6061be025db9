//! # CSV Record Parser
//!
//! Turns one raw line of a JMeter-style log into a validated
//! [`PersistedRecord`] plus row-level diagnostics.
//!
//! The tokenizer is hand-rolled rather than delegated to a CSV library so
//! that every field can be bounds-checked and screened as it is read:
//!
//! - fields split on commas outside quotes; `""` inside a quoted field is a
//!   literal quote
//! - structural check: fewer than ten fields rejects the row
//! - semantic checks: timestamp, elapsed and response code are validated,
//!   out-of-range-but-plausible values only warn
//! - security: formula-like values warn and free text is clamped and
//!   HTML-escaped before it leaves the parser
//! - numeric coercion never fails: garbage becomes 0, values are clamped into
//!   `[0, 2^53 - 1]`

use crate::record::{PersistedRecord, JMETER_FIELD_COUNT};
use crate::utils::{self, is_formula_injection, sanitize_text, MAX_SAFE_INTEGER};

/// Lines longer than this are rejected without tokenizing.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Elapsed times above this only produce a warning.
pub const SLOW_RESPONSE_MS: f64 = 300_000.0;

const ONE_YEAR_MS: u64 = 365 * 24 * 60 * 60 * 1000;
const ONE_HOUR_MS: u64 = 60 * 60 * 1000;

const FIELD_NAMES: [&str; JMETER_FIELD_COUNT] = [
    "timestamp",
    "elapsed",
    "label",
    "responseCode",
    "success",
    "bytes",
    "sentBytes",
    "grpThreads",
    "allThreads",
    "Filename",
];

/// Result of parsing one line.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    /// `None` when the row was rejected; `errors` then says why
    pub record: Option<PersistedRecord>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ParseOutcome {
    fn reject(mut self, message: String) -> Self {
        self.errors.push(message);
        self.record = None;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParserOptions {
    /// When false only the structural check and numeric coercion apply
    pub validate: bool,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self { validate: true }
    }
}

/// Stateless line parser with an injectable notion of "now".
#[derive(Debug, Clone)]
pub struct CsvRecordParser {
    now_ms: u64,
    options: ParserOptions,
}

impl Default for CsvRecordParser {
    fn default() -> Self {
        Self::new(ParserOptions::default())
    }
}

impl CsvRecordParser {
    pub fn new(options: ParserOptions) -> Self {
        Self {
            now_ms: utils::current_timestamp_ms(),
            options,
        }
    }

    /// Fix the clock used for the timestamp plausibility window.
    pub fn with_now(mut self, now_ms: u64) -> Self {
        self.now_ms = now_ms;
        self
    }

    /// Parse one line. `line_number` is 1-based and only used in messages.
    pub fn parse_line(&self, raw: &str, line_number: usize) -> ParseOutcome {
        let outcome = ParseOutcome::default();
        let line = raw.trim_end_matches(['\r', '\n']);

        if line.len() > MAX_LINE_LEN {
            return outcome.reject(format!(
                "Line {}: line exceeds {} bytes",
                line_number, MAX_LINE_LEN
            ));
        }

        let fields = tokenize(line);
        if fields.len() < JMETER_FIELD_COUNT {
            return outcome.reject(format!(
                "Line {}: insufficient fields (expected {}, found {})",
                line_number,
                JMETER_FIELD_COUNT,
                fields.len()
            ));
        }

        self.build_record(fields, line_number, outcome)
    }

    fn build_record(
        &self,
        mut fields: Vec<String>,
        line_number: usize,
        mut outcome: ParseOutcome,
    ) -> ParseOutcome {
        if fields.len() > JMETER_FIELD_COUNT {
            outcome.warnings.push(format!(
                "Line {}: {} extra field(s) ignored",
                line_number,
                fields.len() - JMETER_FIELD_COUNT
            ));
            fields.truncate(JMETER_FIELD_COUNT);
        }

        for (name, field) in FIELD_NAMES.iter().zip(fields.iter_mut()) {
            // Undo the quote the writer adds in front of formula-like values.
            if field.starts_with('\'') && is_formula_injection(&field[1..]) {
                field.remove(0);
            }
            if is_formula_injection(field) {
                outcome.warnings.push(format!(
                    "Line {}: field {} starts with '{}' and may be interpreted as a formula",
                    line_number,
                    name,
                    field.chars().next().unwrap_or_default()
                ));
            }
        }

        let validate = self.options.validate;

        let timestamp = if validate {
            match fields[0].trim().parse::<i64>() {
                Ok(ts) if ts > 0 => {
                    let ts = (ts as u64).min(MAX_SAFE_INTEGER);
                    let lower = self.now_ms.saturating_sub(ONE_YEAR_MS);
                    let upper = self.now_ms.saturating_add(ONE_HOUR_MS);
                    if ts < lower || ts > upper {
                        outcome.warnings.push(format!(
                            "Line {}: timestamp {} is outside the expected range",
                            line_number, ts
                        ));
                    }
                    ts
                }
                _ => {
                    return outcome.reject(format!(
                        "Line {}: invalid timestamp '{}'",
                        line_number,
                        sanitize_text(&fields[0])
                    ))
                }
            }
        } else {
            coerce_int(&fields[0])
        };

        let elapsed = if validate {
            match fields[1].trim().parse::<f64>() {
                Ok(value) if value.is_finite() && value >= 0.0 => {
                    if value > SLOW_RESPONSE_MS {
                        outcome.warnings.push(format!(
                            "Line {}: elapsed {}ms exceeds {}ms",
                            line_number, value, SLOW_RESPONSE_MS
                        ));
                    }
                    value.min(MAX_SAFE_INTEGER as f64)
                }
                _ => {
                    return outcome.reject(format!(
                        "Line {}: invalid elapsed time '{}'",
                        line_number,
                        sanitize_text(&fields[1])
                    ))
                }
            }
        } else {
            coerce_float(&fields[1])
        };

        let response_code = if validate {
            match fields[3].trim().parse::<i64>() {
                Ok(code) if (100..=599).contains(&code) => code as u16,
                _ => {
                    return outcome.reject(format!(
                        "Line {}: invalid response code '{}'",
                        line_number,
                        sanitize_text(&fields[3])
                    ))
                }
            }
        } else {
            coerce_int(&fields[3]).min(u16::MAX as u64) as u16
        };

        outcome.record = Some(PersistedRecord {
            timestamp,
            elapsed,
            label: sanitize_text(&fields[2]),
            response_code,
            success: fields[4].trim().eq_ignore_ascii_case("true"),
            bytes: coerce_int(&fields[5]),
            sent_bytes: coerce_int(&fields[6]),
            grp_threads: coerce_int(&fields[7]).min(u32::MAX as u64) as u32,
            all_threads: coerce_int(&fields[8]).min(u32::MAX as u64) as u32,
            filename: sanitize_text(&fields[9]),
        });
        outcome
    }
}

/// Whether a line is the CSV header rather than data.
pub fn is_header_line(line: &str) -> bool {
    line.trim_start_matches('\u{feff}')
        .split(',')
        .next()
        .map(|first| first.trim().trim_matches('"').eq_ignore_ascii_case("timestamp"))
        .unwrap_or(false)
}

/// Split a line into fields, honouring quotes.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut fields = Vec::with_capacity(JMETER_FIELD_COUNT);
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    fields.push(current);
    fields
}

/// Parse an integer, never failing: garbage is 0, the result is clamped
/// into `[0, MAX_SAFE_INTEGER]`. Fractional input is truncated.
pub fn coerce_int(raw: &str) -> u64 {
    let raw = raw.trim();
    if let Ok(value) = raw.parse::<i64>() {
        return (value.max(0) as u64).min(MAX_SAFE_INTEGER);
    }
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => value.trunc().clamp(0.0, MAX_SAFE_INTEGER as f64) as u64,
        _ => 0,
    }
}

/// Parse a float, never failing: garbage and non-finite values are 0, the
/// result is clamped into `[0, MAX_SAFE_INTEGER]`.
pub fn coerce_float(raw: &str) -> f64 {
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => value.clamp(0.0, MAX_SAFE_INTEGER as f64),
        _ => 0.0,
    }
}

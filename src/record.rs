//! Metric events, persisted CSV records and the row formats they are written in.

use crate::utils::{self, neutralize_formula};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// JMeter-compatible header, one column per [`PersistedRecord`] field.
pub const JMETER_HEADER: &str =
    "timestamp,elapsed,label,responseCode,success,bytes,sentBytes,grpThreads,allThreads,Filename";

/// Header of the compact schema.
pub const COMPACT_HEADER: &str = "timestamp,elapsed,label,responseCode,success";

/// Number of columns in a JMeter row.
pub const JMETER_FIELD_COUNT: usize = 10;

/// A single measurement, as reported by a request or test-framework adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricEvent {
    pub endpoint: String,
    #[serde(default)]
    pub method: String,
    /// Response time in milliseconds
    pub response_time: f64,
    pub status_code: u16,
    /// Milliseconds since the Unix epoch; defaults to the time of recording
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub test_name: Option<String>,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default)]
    pub bytes_sent: u64,
    /// Overrides the `status_code < 400` success rule
    #[serde(default)]
    pub success: Option<bool>,
    /// Active threads/virtual users when the request completed
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

impl MetricEvent {
    /// Create an event with the required fields; everything else defaults.
    pub fn new(
        endpoint: impl Into<String>,
        method: impl Into<String>,
        response_time: f64,
        status_code: u16,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.into(),
            response_time,
            status_code,
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }

    pub fn with_test_name(mut self, test_name: impl Into<String>) -> Self {
        self.test_name = Some(test_name.into());
        self
    }

    pub fn with_bytes(mut self, received: u64, sent: u64) -> Self {
        self.bytes_received = received;
        self.bytes_sent = sent;
        self
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = Some(threads);
        self
    }
}

/// One durable row of the CSV log. Never mutated after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    pub timestamp: u64,
    pub elapsed: f64,
    pub label: String,
    pub response_code: u16,
    pub success: bool,
    pub bytes: u64,
    pub sent_bytes: u64,
    pub grp_threads: u32,
    pub all_threads: u32,
    pub filename: String,
}

/// Row layout used by the collector when persisting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CsvSchema {
    /// The ten JMeter columns; readable by the aggregation pipeline
    Jmeter,
    /// `timestamp,elapsed,label,responseCode,success` only
    Compact,
}

impl CsvSchema {
    pub fn from_compatibility(schema_compatible: bool) -> Self {
        if schema_compatible {
            CsvSchema::Jmeter
        } else {
            CsvSchema::Compact
        }
    }

    pub fn header(&self) -> &'static str {
        match self {
            CsvSchema::Jmeter => JMETER_HEADER,
            CsvSchema::Compact => COMPACT_HEADER,
        }
    }

    /// Append one row (without line terminator) to `out`.
    pub fn write_row(&self, out: &mut String, record: &PersistedRecord) {
        // Writing into a String cannot fail.
        let _ = write!(out, "{},{},", record.timestamp, format_elapsed(record.elapsed));
        push_quoted(out, &record.label);
        let _ = write!(out, ",{},{}", record.response_code, record.success);
        if *self == CsvSchema::Jmeter {
            let _ = write!(
                out,
                ",{},{},{},{},",
                record.bytes, record.sent_bytes, record.grp_threads, record.all_threads
            );
            push_quoted(out, &record.filename);
        }
    }
}

impl PersistedRecord {
    /// Serialize as a JMeter row, neutralising formula-like text fields.
    pub fn to_csv_row(&self) -> String {
        let mut row = String::with_capacity(96);
        CsvSchema::Jmeter.write_row(&mut row, self);
        row
    }
}

/// Integral values are written without a fractional part, as JMeter does.
fn format_elapsed(elapsed: f64) -> String {
    if elapsed.fract() == 0.0 && elapsed <= utils::MAX_SAFE_INTEGER as f64 {
        format!("{}", elapsed as u64)
    } else {
        format!("{}", elapsed)
    }
}

fn push_quoted(out: &mut String, value: &str) {
    let value = neutralize_formula(value);
    out.push('"');
    for c in value.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PersistedRecord {
        PersistedRecord {
            timestamp: 1691234567890,
            elapsed: 245.0,
            label: "/api/users".to_string(),
            response_code: 200,
            success: true,
            bytes: 1024,
            sent_bytes: 256,
            grp_threads: 1,
            all_threads: 1,
            filename: "Test".to_string(),
        }
    }

    #[test]
    fn test_jmeter_row_layout() {
        assert_eq!(
            sample().to_csv_row(),
            "1691234567890,245,\"/api/users\",200,true,1024,256,1,1,\"Test\""
        );
        assert_eq!(JMETER_HEADER.split(',').count(), JMETER_FIELD_COUNT);
    }

    #[test]
    fn test_compact_row_layout() {
        let mut row = String::new();
        CsvSchema::Compact.write_row(&mut row, &sample());
        assert_eq!(row, "1691234567890,245,\"/api/users\",200,true");
        assert_eq!(CsvSchema::from_compatibility(false).header(), COMPACT_HEADER);
    }

    #[test]
    fn test_row_escapes_quotes_and_formulas() {
        let mut record = sample();
        record.label = "say \"hi\"".to_string();
        record.filename = "=cmd|calc".to_string();
        assert_eq!(
            record.to_csv_row(),
            "1691234567890,245,\"say \"\"hi\"\"\",200,true,1024,256,1,1,\"'=cmd|calc\""
        );
    }

    #[test]
    fn test_fractional_elapsed() {
        let mut record = sample();
        record.elapsed = 12.5;
        assert!(record.to_csv_row().starts_with("1691234567890,12.5,"));
    }
}

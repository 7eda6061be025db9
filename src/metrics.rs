//! Statistics engine: nearest-rank percentiles, APDEX and dispersion.
//!
//! Everything here is a pure function over response times in milliseconds.

use serde::{Deserialize, Serialize};

/// Default APDEX satisfaction threshold in milliseconds.
pub const DEFAULT_APDEX_THRESHOLD_MS: f64 = 500.0;

/// Tolerating responses are at most this multiple of the threshold.
const TOLERATING_FACTOR: f64 = 4.0;

/// APDEX classification of a set of response times
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApdexScore {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub score: f64,
    pub satisfied: usize,
    pub tolerating: usize,
    pub frustrated: usize,
    pub total: usize,
    pub threshold: f64,
    pub rating: String,
}

/// Mean, extremes and population standard deviation in one value
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispersion {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
}

/// Nearest-rank percentile.
///
/// Sorts a copy of `values` ascending and returns the element at
/// `ceil(p / 100 * n) - 1`, clamped to `[0, n - 1]`. No interpolation.
/// Returns 0 for empty input.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    percentile_sorted(&sorted, p)
}

/// [`percentile`] over data the caller has already sorted ascending.
///
/// The pipeline sorts each group once and reads several percentiles from it.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = (p / 100.0 * n as f64).ceil() as i64 - 1;
    let index = rank.clamp(0, n as i64 - 1) as usize;
    sorted[index]
}

/// APDEX score for `values` against `threshold` milliseconds.
///
/// - satisfied: `v <= T`
/// - tolerating: `T < v <= 4T`
/// - frustrated: everything else
///
/// `score = (satisfied + tolerating / 2) / n`; an empty input yields a zeroed
/// structure rated "No data".
pub fn apdex(values: &[f64], threshold: f64, label: Option<&str>) -> ApdexScore {
    let tolerating_limit = threshold * TOLERATING_FACTOR;
    let mut satisfied = 0;
    let mut tolerating = 0;

    for &value in values {
        if value <= threshold {
            satisfied += 1;
        } else if value <= tolerating_limit {
            tolerating += 1;
        }
    }

    let total = values.len();
    let score = if total == 0 {
        0.0
    } else {
        (satisfied as f64 + tolerating as f64 * 0.5) / total as f64
    };

    ApdexScore {
        label: label.map(str::to_string),
        score,
        satisfied,
        tolerating,
        frustrated: total - satisfied - tolerating,
        total,
        threshold,
        rating: apdex_rating(score, total).to_string(),
    }
}

/// Standard rating bands for an APDEX score
pub fn apdex_rating(score: f64, total: usize) -> &'static str {
    if total == 0 {
        "No data"
    } else if score >= 0.94 {
        "Excellent"
    } else if score >= 0.85 {
        "Good"
    } else if score >= 0.70 {
        "Fair"
    } else if score >= 0.50 {
        "Poor"
    } else {
        "Unacceptable"
    }
}

/// Population standard deviation (divides by `n`) around `mean`.
pub fn stddev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Mean, min, max and standard deviation; all zero for empty input.
pub fn summarize(values: &[f64]) -> Dispersion {
    if values.is_empty() {
        return Dispersion::default();
    }

    let count = values.len() as f64;
    let mean = values.iter().sum::<f64>() / count;
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    Dispersion {
        mean,
        min,
        max,
        std_dev: stddev(values, mean),
    }
}

//! # Build Comparison Store
//!
//! Persists a per-endpoint summary of each aggregation run and annotates the
//! next run's endpoints with the change in average response time.
//!
//! Reads are best-effort: a missing or unreadable snapshot simply means
//! "no baseline". The snapshot is overwritten after every run, including the
//! first. The read-then-write is not coordinated across processes; one
//! aggregation run per output directory at a time.

use crate::error::SnapshotError;
use crate::results::{ComparisonInfo, EndpointStats, Summary, Trend};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Snapshot file name inside the output directory.
pub const SNAPSHOT_FILE_NAME: &str = "build-snapshot.json";

/// An average within this fraction of the previous one is "stable".
pub const STABLE_BAND: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSnapshot {
    pub average: f64,
    pub samples: usize,
    pub error_rate: f64,
    pub throughput: f64,
}

/// Persisted summary of one aggregation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSnapshot {
    pub build_number: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub endpoints: BTreeMap<String, EndpointSnapshot>,
    pub summary: Summary,
}

impl BuildSnapshot {
    pub fn from_run(build_number: &str, endpoints: &[EndpointStats], summary: &Summary) -> Self {
        Self {
            build_number: build_number.to_string(),
            timestamp: chrono::Utc::now(),
            endpoints: endpoints
                .iter()
                .map(|stats| {
                    (
                        stats.label.clone(),
                        EndpointSnapshot {
                            average: stats.average,
                            samples: stats.samples,
                            error_rate: stats.error_rate,
                            throughput: stats.throughput,
                        },
                    )
                })
                .collect(),
            summary: summary.clone(),
        }
    }
}

/// Classify the move from `previous` to `current` average.
///
/// A zero baseline has no meaningful 5% band: an unchanged zero is stable,
/// anything slower is degraded.
pub fn classify(previous: f64, current: f64) -> Trend {
    let delta = current - previous;
    if previous <= 0.0 {
        return if current <= previous {
            Trend::Stable
        } else {
            Trend::Degraded
        };
    }
    if delta.abs() <= STABLE_BAND * previous {
        Trend::Stable
    } else if delta < 0.0 {
        Trend::Improved
    } else {
        Trend::Degraded
    }
}

/// Snapshot file keyed to one output location
pub struct BuildComparisonStore {
    path: PathBuf,
}

impl BuildComparisonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the well-known location inside `output_dir`.
    pub fn for_output_dir(output_dir: &Path) -> Self {
        Self::new(output_dir.join(SNAPSHOT_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the previous snapshot; `None` if missing or corrupt.
    pub async fn load(&self) -> Option<BuildSnapshot> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No previous build snapshot at {:?}", self.path);
                return None;
            }
            Err(e) => {
                warn!("Ignoring unreadable build snapshot {:?}: {}", self.path, e);
                return None;
            }
        };

        match serde_json::from_str(&text) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Ignoring corrupt build snapshot {:?}: {}", self.path, e);
                None
            }
        }
    }

    /// Overwrite the snapshot. Written to a sibling temp file and renamed.
    pub async fn save(&self, snapshot: &BuildSnapshot) -> Result<(), SnapshotError> {
        let io_err = |source| SnapshotError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let json = serde_json::to_string_pretty(snapshot)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        debug!("Build snapshot {} saved to {:?}", snapshot.build_number, self.path);
        Ok(())
    }

    /// Load the baseline, annotate `endpoints`, then persist the current run.
    ///
    /// Returns what the run was compared against, or `None` on a first run.
    pub async fn compare_and_store(
        &self,
        build_number: &str,
        endpoints: &mut [EndpointStats],
        summary: &Summary,
    ) -> Result<Option<ComparisonInfo>, SnapshotError> {
        let previous = self.load().await;
        let info = previous
            .as_ref()
            .map(|snapshot| annotate(snapshot, endpoints));

        let current = BuildSnapshot::from_run(build_number, endpoints, summary);
        self.save(&current).await?;
        Ok(info)
    }
}

/// Fill previous-average, delta and trend on every endpoint the baseline knows.
pub fn annotate(previous: &BuildSnapshot, endpoints: &mut [EndpointStats]) -> ComparisonInfo {
    let mut info = ComparisonInfo {
        previous_build: previous.build_number.clone(),
        previous_timestamp: previous.timestamp,
        improved: 0,
        degraded: 0,
        stable: 0,
        unmatched: 0,
    };

    for stats in endpoints.iter_mut() {
        let Some(before) = previous.endpoints.get(&stats.label) else {
            info.unmatched += 1;
            continue;
        };

        let delta = stats.average - before.average;
        let trend = classify(before.average, stats.average);
        stats.previous_average = Some(before.average);
        stats.delta = Some(delta);
        stats.delta_percent = (before.average > 0.0).then(|| delta / before.average * 100.0);
        stats.trend = Some(trend);

        match trend {
            Trend::Stable => info.stable += 1,
            Trend::Improved => info.improved += 1,
            Trend::Degraded => info.degraded += 1,
        }
    }

    info
}

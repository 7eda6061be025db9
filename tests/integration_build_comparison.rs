use anyhow::Result;
use perf_telemetry::{
    comparison::SNAPSHOT_FILE_NAME, results::Trend, utils, AggregationConfig, AggregationPipeline,
    BuildComparisonStore,
};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Write a JMeter log with one row per (label, elapsed) pair.
fn write_log(dir: &Path, name: &str, rows: &[(&str, u64)]) -> Result<PathBuf> {
    let base = utils::current_timestamp_ms() - 30_000;
    let mut text = String::from(perf_telemetry::record::JMETER_HEADER);
    text.push('\n');
    for (i, (label, elapsed)) in rows.iter().enumerate() {
        text.push_str(&format!(
            "{},{},\"{}\",200,true,100,10,1,1,\"suite\"\n",
            base + i as u64 * 500,
            elapsed,
            label
        ));
    }
    let path = dir.join(name);
    std::fs::write(&path, text)?;
    Ok(path)
}

fn config(dir: &TempDir, log: PathBuf, build: &str) -> AggregationConfig {
    AggregationConfig {
        sources: vec![log],
        output_dir: dir.path().join("report"),
        build_number: Some(build.to_string()),
        ..AggregationConfig::default()
    }
}

/// Two consecutive builds: the second is annotated against the first.
#[tokio::test]
async fn second_build_is_compared_with_first() -> Result<()> {
    let dir = TempDir::new()?;

    let first = write_log(
        dir.path(),
        "build1.csv",
        &[("/stable", 200), ("/slower", 200), ("/faster", 200), ("/gone", 50)],
    )?;
    let report = AggregationPipeline::new(config(&dir, first, "41")).run().await?;
    assert!(report.comparison.is_none());
    assert!(report.endpoint_stats.iter().all(|s| s.trend.is_none()));
    assert!(dir.path().join("report").join(SNAPSHOT_FILE_NAME).exists());

    let second = write_log(
        dir.path(),
        "build2.csv",
        &[("/stable", 210), ("/slower", 230), ("/faster", 170), ("/new", 10)],
    )?;
    let report = AggregationPipeline::new(config(&dir, second, "42")).run().await?;

    let comparison = report.comparison.as_ref().expect("baseline exists");
    assert_eq!(comparison.previous_build, "41");
    assert_eq!(
        (comparison.stable, comparison.degraded, comparison.improved, comparison.unmatched),
        (1, 1, 1, 1)
    );

    let trend = |label: &str| {
        report
            .endpoint_stats
            .iter()
            .find(|s| s.label == label)
            .and_then(|s| s.trend)
    };
    assert_eq!(trend("/stable"), Some(Trend::Stable));
    assert_eq!(trend("/slower"), Some(Trend::Degraded));
    assert_eq!(trend("/faster"), Some(Trend::Improved));
    assert_eq!(trend("/new"), None);

    let stored = BuildComparisonStore::for_output_dir(&dir.path().join("report"))
        .load()
        .await
        .expect("snapshot saved");
    assert_eq!(stored.build_number, "42");
    assert!(stored.endpoints.contains_key("/new"));
    assert!(!stored.endpoints.contains_key("/gone"));
    Ok(())
}

/// A corrupt snapshot means "no baseline" and is replaced by the current run.
#[tokio::test]
async fn corrupt_snapshot_is_replaced() -> Result<()> {
    let dir = TempDir::new()?;
    let snapshot = dir.path().join("history").join("snap.json");
    std::fs::create_dir_all(snapshot.parent().unwrap_or(dir.path()))?;
    std::fs::write(&snapshot, "{ truncated")?;

    let log = write_log(dir.path(), "run.csv", &[("/a", 100)])?;
    let mut config = config(&dir, log, "7");
    config.comparison_snapshot_path = Some(snapshot.clone());

    let report = AggregationPipeline::new(config).run().await?;
    assert!(report.comparison.is_none());

    let stored = BuildComparisonStore::new(snapshot).load().await.expect("rewritten");
    assert_eq!(stored.build_number, "7");
    Ok(())
}

#[tokio::test]
async fn comparison_can_be_disabled() -> Result<()> {
    let dir = TempDir::new()?;
    let log = write_log(dir.path(), "run.csv", &[("/a", 100)])?;
    let mut config = config(&dir, log, "1");
    config.compare_to_previous = false;

    AggregationPipeline::new(config).run().await?;
    assert!(!dir.path().join("report").join(SNAPSHOT_FILE_NAME).exists());
    Ok(())
}

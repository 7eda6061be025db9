use anyhow::Result;
use perf_telemetry::{
    results::REPORT_FILE_NAME, utils, AggregationConfig, AggregationError, AggregationPipeline,
    CollectorConfig, MetricCollector, MetricEvent, ReportWriter,
};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

async fn write_run(dir: &Path, file: &str, events: Vec<MetricEvent>) -> Result<PathBuf> {
    let mut config = CollectorConfig::new(file).with_base_dir(dir);
    config.flush_interval_ms = 0;
    config.silent = true;
    let collector = MetricCollector::new(config)?;
    for event in events {
        collector.record_metric(event);
    }
    collector.dispose().await?;
    Ok(collector.output_path().to_path_buf())
}

fn config_for(dir: &TempDir, sources: Vec<PathBuf>) -> AggregationConfig {
    AggregationConfig {
        sources,
        output_dir: dir.path().join("report"),
        compare_to_previous: false,
        build_number: Some("1".to_string()),
        ..AggregationConfig::default()
    }
}

/// Collector output flows through the pipeline into report-data.json.
#[tokio::test]
async fn collector_log_to_report_data() -> Result<()> {
    let dir = TempDir::new()?;
    let base = utils::current_timestamp_ms() - 10_000;
    let events = [(100.0, 200), (200.0, 200), (300.0, 200), (400.0, 500)]
        .iter()
        .enumerate()
        .map(|(i, &(elapsed, status))| {
            MetricEvent::new("/a", "GET", elapsed, status).with_timestamp(base + i as u64 * 1000)
        })
        .collect();
    let log = write_run(dir.path(), "run.csv", events).await?;

    let config = config_for(&dir, vec![log]);
    let report = AggregationPipeline::new(config.clone()).run().await?;

    let stats = &report.endpoint_stats[0];
    assert_eq!(stats.label, "/a");
    assert_eq!(stats.error_rate, 0.25);
    assert_eq!(stats.median, 200.0);
    assert_eq!(report.error_summary.len(), 1);
    assert_eq!(report.error_summary[0].status_code, 500);
    assert_eq!(report.error_summary[0].message, "Internal Server Error");
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);

    let path = ReportWriter::new(&config.output_dir).write(&report).await?;
    assert_eq!(path, config.output_dir.join(REPORT_FILE_NAME));

    let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    for key in ["summary", "endpointStats", "timeSeriesData", "errorSummary", "apdexData"] {
        assert!(value.get(key).is_some(), "missing {key}");
    }
    assert_eq!(value["summary"]["totalRequests"], 4);
    assert_eq!(value["endpointStats"][0]["errorRate"], 0.25);
    Ok(())
}

/// Several logs form one dataset; an unreadable one only warns.
#[tokio::test]
async fn multiple_logs_form_one_dataset() -> Result<()> {
    let dir = TempDir::new()?;
    let base = utils::current_timestamp_ms() - 100_000;

    let first = write_run(
        dir.path(),
        "node1.csv",
        (0..50)
            .map(|i| MetricEvent::new("/login", "POST", 120.0, 200).with_timestamp(base + i * 1000))
            .collect(),
    )
    .await?;
    let second = write_run(
        dir.path(),
        "node2.csv",
        (0..50)
            .map(|i| {
                MetricEvent::new("/cart", "GET", 80.0, 404).with_timestamp(base + 50_000 + i * 1000)
            })
            .collect(),
    )
    .await?;
    let missing = dir.path().join("node3.csv");

    let report = AggregationPipeline::new(config_for(&dir, vec![first, second, missing]))
        .run()
        .await?;

    assert_eq!(report.summary.total_requests, 100);
    assert_eq!(report.summary.endpoint_count, 2);
    assert_eq!(report.summary.failed_requests, 50);
    assert_eq!(report.summary.duration_seconds, 99.0);
    assert_eq!(report.ingest.files_read, 2);
    assert_eq!(report.ingest.files_failed, 1);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("node3.csv"));

    // 99 s span gives 1 s buckets, one sample each
    assert_eq!(report.time_series_data.len(), 100);
    assert!(report.time_series_data.iter().all(|p| p.samples == 1));
    Ok(())
}

#[tokio::test]
async fn unparseable_input_is_an_error() -> Result<()> {
    let dir = TempDir::new()?;
    let log = dir.path().join("junk.csv");
    std::fs::write(&log, "timestamp,elapsed\nnot,a,valid,row\n")?;

    let err = AggregationPipeline::new(config_for(&dir, vec![log]))
        .run()
        .await
        .expect_err("no valid records");
    assert!(matches!(err, AggregationError::NoValidRecords { files: 1, .. }));
    Ok(())
}

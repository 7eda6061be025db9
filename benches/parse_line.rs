use criterion::{black_box, criterion_group, criterion_main, Criterion};
use perf_telemetry::{record::CsvSchema, CsvRecordParser, PersistedRecord};

fn sample_record() -> PersistedRecord {
    PersistedRecord {
        timestamp: 1_700_000_000_000,
        elapsed: 245.0,
        label: "/api/v1/users/{id}/orders".to_string(),
        response_code: 200,
        success: true,
        bytes: 2048,
        sent_bytes: 312,
        grp_threads: 16,
        all_threads: 64,
        filename: "checkout-flow".to_string(),
    }
}

fn bench_parse_line(c: &mut Criterion) {
    let parser = CsvRecordParser::default().with_now(1_700_000_000_000);
    let line = sample_record().to_csv_row();

    c.bench_function("parse_line", |b| {
        b.iter(|| parser.parse_line(black_box(&line), 1))
    });
}

fn bench_write_row(c: &mut Criterion) {
    let record = sample_record();
    let mut out = String::with_capacity(128);

    c.bench_function("write_row", |b| {
        b.iter(|| {
            out.clear();
            CsvSchema::Jmeter.write_row(&mut out, black_box(&record));
        })
    });
}

criterion_group!(benches, bench_parse_line, bench_write_row);
criterion_main!(benches);

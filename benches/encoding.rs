use binform::codec::{from_binary, from_decimal, from_hex};
use binform::record::TableSource;
use binform::{to_bytes, Options};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const RECORD: &str = r#"
<format>
    <repeat name="row" fetch="true">
        <item name="id" bytes="8" lpadding="0"/>
        <item name="name" bytes="24" rpadding=" "/>
        <item name="amount" bytes="8" encoding="decimal"/>
        <item bytes="1" encoding="decimal" eval="lazy">
            <default-value type="xpath">sum(../item/@result-bytes)</default-value>
        </item>
    </repeat>
</format>"#;

fn records(rows: usize) -> TableSource {
    (0..rows).fold(
        TableSource::new(["row/id", "row/name", "row/amount"]),
        |table, i| {
            table.with_row([
                i.to_string(),
                format!("customer number {}", i),
                (i as i64 * 1_000_003).to_string(),
            ])
        },
    )
}

fn benchmark_codecs(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let bits = "01101000".repeat(64);
    let hex = "CAFEBABE".repeat(16);
    let decimal = "123456789012345678901234567890";

    group.bench_function("binary", |b| b.iter(|| from_binary(black_box(&bits))));
    group.bench_function("hexadecimal", |b| b.iter(|| from_hex(black_box(&hex))));
    group.bench_function("decimal", |b| {
        b.iter(|| from_decimal(black_box(decimal), 16))
    });
    group.finish();
}

fn benchmark_records(c: &mut Criterion) {
    let mut group = c.benchmark_group("records");
    for rows in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(rows), rows, |b, &rows| {
            b.iter(|| to_bytes(black_box(RECORD), Some(records(rows)), Options::new()))
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_codecs, benchmark_records);
criterion_main!(benches);

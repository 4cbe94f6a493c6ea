//! Testcase matcher throughput benchmark.
//!
//! Measures `matches` per strategy over growing outputs, plus the cost of
//! normalizing command output before comparison.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use toolhub::engine::{matches, normalize_output, MatchType};

fn output_of(size: usize) -> String {
    let mut out = "x".repeat(size);
    out.push_str("Hello, World!\n");
    out
}

fn bench_strategies(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 1024, 65536];
    let cases = [
        (MatchType::Exact, "Hello, World!"),
        (MatchType::Contains, "World"),
        (MatchType::Prefix, "xxxx"),
        (MatchType::Suffix, "World!"),
        (MatchType::Regex, r"Hello, \w+!$"),
    ];

    for (match_type, expected) in cases {
        let mut group = c.benchmark_group(format!("matches/{match_type}"));
        for &size in sizes {
            let output = output_of(size);
            group.bench_with_input(BenchmarkId::from_parameter(size), &output, |b, out| {
                b.iter(|| {
                    matches(normalize_output(black_box(out)), black_box(expected), match_type)
                        .unwrap()
                });
            });
        }
        group.finish();
    }
}

fn bench_normalize(c: &mut Criterion) {
    let output = format!("{}\r\n\n\n", "line\n".repeat(1000));
    c.bench_function("normalize_output", |b| {
        b.iter(|| normalize_output(black_box(&output)).len())
    });
}

criterion_group!(benches, bench_strategies, bench_normalize);
criterion_main!(benches);

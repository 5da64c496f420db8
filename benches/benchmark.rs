use criterion::{black_box, criterion_group, criterion_main, Criterion};
use site_capture::{sort_by_path, LimitSpec, RateLimiter, SitemapResolver, SitemapUrlEntry};
use std::time::Duration;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn urlset(pages: usize) -> String {
    let urls: String = (0..pages)
        .map(|i| {
            format!(
                "<url><loc>https://example.com/section-{}/page-{i}</loc><lastmod>2024-05-01</lastmod><priority>0.5</priority></url>",
                i % 7
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">{urls}</urlset>"#
    )
}

fn benchmark_limit_spec_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("limit_spec");
    configure_fast_group(&mut group);

    let specs = ["10/minute", "2/second", "100/m", "garbage", "0/second"];

    group.bench_function("parse", |b| {
        b.iter(|| {
            for spec in &specs {
                black_box(LimitSpec::parse(black_box(spec)));
            }
        });
    });

    group.finish();
}

fn benchmark_sitemap_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("sitemap");
    configure_fast_group(&mut group);

    let small = urlset(50);
    let large = urlset(5_000);

    group.bench_function("parse_50", |b| {
        b.iter(|| {
            let _ = black_box(SitemapResolver::parse("bench", black_box(&small)));
        });
    });

    group.bench_function("parse_5000", |b| {
        b.iter(|| {
            let _ = black_box(SitemapResolver::parse("bench", black_box(&large)));
        });
    });

    let entries: Vec<SitemapUrlEntry> = (0..500)
        .rev()
        .map(|i| SitemapUrlEntry::new(format!("https://example.com/p/{i}")))
        .collect();
    group.bench_function("sort_500", |b| {
        b.iter(|| {
            let mut batch = entries.clone();
            sort_by_path(&mut batch);
            black_box(batch);
        });
    });

    group.finish();
}

fn benchmark_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");
    configure_fast_group(&mut group);

    group.bench_function("admit_single_key", |b| {
        let limiter = RateLimiter::new("10/minute");
        b.iter(|| {
            black_box(limiter.admit("caller", "1000000/second"));
        });
    });

    group.bench_function("admit_many_keys", |b| {
        let limiter = RateLimiter::new("10/minute");
        let keys: Vec<String> = (0..256).map(|i| format!("caller-{i}")).collect();
        let mut next = 0;
        b.iter(|| {
            let key = &keys[next % keys.len()];
            next += 1;
            black_box(limiter.admit(key, "100/second"));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_limit_spec_parsing,
    benchmark_sitemap_parsing,
    benchmark_rate_limiter
);
criterion_main!(benches);

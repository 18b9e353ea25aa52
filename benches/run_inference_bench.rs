use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use elogfetch::run_inference::{ElogEntry, RunNumberResolver, sort_chronologically};

/// One explicit run boundary every `stride` entries, a DAQ narrative line
/// every few strides, everything else unattributed.
fn synthetic_logbook(len: usize, stride: usize) -> Vec<ElogEntry> {
    (0..len)
        .map(|i| {
            let run = i / stride;
            let content = if i % (stride * 4) == 1 {
                format!("Running run number {}: DAQ started", run)
            } else {
                format!("shift note {}", i)
            };
            ElogEntry {
                id: Some(format!("id{}", i)),
                insert_time: format!("2024-01-01T{:02}:{:02}:{:02}", (i / 3600) % 24, (i / 60) % 60, i % 60),
                run_num: if i % stride == 0 { Some(run as i64) } else { None },
                content: Some(content),
                ..Default::default()
            }
        })
        .rev()
        .collect()
}

fn bench_resolve(c: &mut Criterion) {
    let resolver = RunNumberResolver::default();
    let mut group = c.benchmark_group("resolve_run_numbers");
    for len in [100, 1_000, 10_000] {
        let mut entries = synthetic_logbook(len, 25);
        sort_chronologically(&mut entries);
        group.bench_with_input(BenchmarkId::from_parameter(len), &entries, |b, entries| {
            b.iter(|| resolver.resolve(black_box(entries)))
        });
    }
    group.finish();
}

fn bench_sort(c: &mut Criterion) {
    let entries = synthetic_logbook(10_000, 25);
    c.bench_function("sort_chronologically_10k", |b| {
        b.iter(|| {
            let mut copy = entries.clone();
            sort_chronologically(black_box(&mut copy));
            copy
        })
    });
}

fn bench_explicit_only(c: &mut Criterion) {
    let resolver = RunNumberResolver::explicit_only();
    let mut entries = synthetic_logbook(10_000, 25);
    sort_chronologically(&mut entries);
    c.bench_function("resolve_explicit_only_10k", |b| {
        b.iter(|| resolver.resolve(black_box(&entries)))
    });
}

criterion_group!(benches, bench_resolve, bench_sort, bench_explicit_only);
criterion_main!(benches);

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ftw::{Strategy, VisitAction, WalkBuilder};
use std::hint::black_box;
use std::path::Path;

/// Builds a `width^depth` directory grid with `files` files per leaf.
fn build_fixture(base: &Path, width: usize, depth: usize, files: usize) -> usize {
    fn fill(dir: &Path, width: usize, depth: usize, files: usize, count: &mut usize) {
        if depth == 0 {
            for index in 0..files {
                std::fs::write(dir.join(format!("f{index}")), b"").unwrap();
                *count += 1;
            }
            return;
        }
        for index in 0..width {
            let sub = dir.join(format!("d{index}"));
            std::fs::create_dir(&sub).unwrap();
            *count += 1;
            fill(&sub, width, depth - 1, files, count);
        }
    }

    let mut count = 1; // the root itself
    fill(base, width, depth, files, &mut count);
    count
}

fn walk_entries(root: &Path, strategy: Strategy, threads: usize, fd_budget: usize) -> usize {
    let mut visits = 0usize;
    WalkBuilder::new(root)
        .strategy(strategy)
        .threads(threads)
        .max_open_fd(fd_budget)
        .run(|visit| {
            black_box(visit.path());
            visits += 1;
            VisitAction::Continue
        })
        .unwrap();
    visits
}

fn bench_traversal(c: &mut Criterion) {
    let tmp = tempfile::tempdir().unwrap();
    let entries = build_fixture(tmp.path(), 8, 3, 4);

    let mut group = c.benchmark_group("traversal");
    group.throughput(Throughput::Elements(entries as u64));

    for strategy in [Strategy::Bfs, Strategy::Dfs] {
        group.bench_with_input(
            BenchmarkId::new("sync", format!("{strategy:?}")),
            &strategy,
            |b, &strategy| b.iter(|| walk_entries(tmp.path(), strategy, 0, 4096)),
        );
    }
    for threads in [2usize, 4] {
        group.bench_with_input(
            BenchmarkId::new("async", threads),
            &threads,
            |b, &threads| b.iter(|| walk_entries(tmp.path(), Strategy::Bfs, threads, 4096)),
        );
    }
    group.finish();
}

fn bench_fd_pressure(c: &mut Criterion) {
    let tmp = tempfile::tempdir().unwrap();
    let entries = build_fixture(tmp.path(), 4, 4, 2);

    let mut group = c.benchmark_group("fd_pressure");
    group.throughput(Throughput::Elements(entries as u64));

    // Shrinking budgets force eviction and openat recomposition.
    for budget in [4096usize, 16, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(budget), &budget, |b, &budget| {
            b.iter(|| walk_entries(tmp.path(), Strategy::Bfs, 0, budget));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_traversal, bench_fd_pressure);
criterion_main!(benches);

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use rb_sor::config::SorConfig;
use rb_sor::data::grid::{Color, GridStore};
use rb_sor::data::partition::{Partition, SorParams};
use rb_sor::halo::ExchangeMode;
use rb_sor::launch::LocalCluster;

fn bench_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep");
    for &interior in &[126usize, 510] {
        let n = interior + 2;
        let part = Partition::compute(n, 1, 0).unwrap();
        let omega = SorParams::for_grid(n).omega;
        let mut grid = GridStore::new(&part);
        grid.initialize();
        group.bench_with_input(BenchmarkId::from_parameter(interior), &part, |b, part| {
            b.iter(|| {
                let mut diff = 0.0_f64;
                for color in Color::BOTH {
                    diff = diff.max(grid.sweep(color, part.rows(), omega));
                }
                black_box(diff)
            });
        });
    }
    group.finish();
}

fn bench_local_cluster(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_cluster");
    group.sample_size(10);
    for exchange in [ExchangeMode::Sync, ExchangeMode::Async] {
        let cfg = SorConfig {
            n: 258,
            max_iters: 100,
            exchange,
            ranks: 4,
            ..SorConfig::default()
        };
        group.bench_with_input(
            BenchmarkId::new("4_ranks_100_iters", format!("{exchange:?}")),
            &cfg,
            |b, cfg| {
                b.iter(|| {
                    let reports = LocalCluster::new(cfg.clone()).unwrap().solve().unwrap();
                    black_box(reports)
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_sweep, bench_local_cluster);
criterion_main!(benches);

#![allow(dead_code)]
use rb_sor::config::SorConfig;
use rb_sor::data::partition::Partition;
use rb_sor::halo::{Delivery, ExchangeMode};
use rb_sor::launch::LocalCluster;
use rb_sor::solver::RunReport;

/// Config for an `interior`×`interior` problem on `ranks` in-process ranks;
/// `iters == 0` selects dynamic termination.
pub fn config(interior: usize, iters: usize, ranks: usize) -> SorConfig {
    SorConfig {
        n: interior + 2,
        max_iters: iters,
        ranks,
        ..SorConfig::default()
    }
}

pub fn with_modes(mut cfg: SorConfig, exchange: ExchangeMode, delivery: Delivery) -> SorConfig {
    cfg.exchange = exchange;
    cfg.delivery = delivery;
    cfg
}

/// Run once and stitch the owned rows of every rank into the full interior
/// row block `[1, n-1)`, row-major.
pub fn solve_and_gather(cfg: SorConfig) -> (Vec<f64>, Vec<RunReport>) {
    let n = cfg.n;
    let cluster = LocalCluster::new(cfg).unwrap();
    let per_rank = cluster
        .run(|solver| {
            let report = solver.start("SOR")?;
            let grid = solver.grid();
            let rows: Vec<f64> = grid
                .owned_rows()
                .flat_map(|i| grid.row(i).to_vec())
                .collect();
            Ok((*solver.partition(), rows, report))
        })
        .unwrap();

    let mut cells = Vec::with_capacity((n - 2) * n);
    let mut reports = Vec::new();
    let mut next_row = 1;
    for (part, rows, report) in per_rank {
        assert_eq!(part.lb, next_row, "partitions must tile the interior");
        next_row = part.ub;
        cells.extend(rows);
        reports.push(report);
    }
    assert_eq!(next_row, n - 1);
    assert_eq!(cluster.pool().members(), 0);
    assert_eq!(cluster.fabric().ports_opened(), cluster.fabric().ports_closed());
    (cells, reports)
}

pub fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

pub fn partitions(n: usize, ranks: usize) -> Vec<Partition> {
    Partition::all(n, ranks).unwrap()
}

//! In-process pool: one thread per rank over a shared [`LocalFabric`] and
//! [`LocalPool`].

use crate::algs::communicator::{LocalComm, LocalFabric};
use crate::config::SorConfig;
use crate::solver::{RunReport, Solver, WARMUP_RUN};
use crate::sor_error::SorError;
use crate::topology::rank::Topology;
use crate::topology::registry::{LocalPool, Registry};
use std::sync::Arc;
use std::thread;

/// Name of the measured run.
pub const TIMED_RUN: &str = "SOR";

pub struct LocalCluster {
    config: SorConfig,
    fabric: Arc<LocalFabric>,
    pool: Arc<LocalPool>,
}

impl LocalCluster {
    /// A pool of `config.ranks` ranks spread over `config.clusters` clusters.
    /// The configuration is validated here, before any rank starts.
    pub fn new(config: SorConfig) -> Result<Self, SorError> {
        config.validate(config.ranks)?;
        Ok(Self {
            fabric: LocalFabric::new(config.ranks),
            pool: LocalPool::new(config.ranks, config.clusters),
            config,
        })
    }

    pub fn config(&self) -> &SorConfig {
        &self.config
    }

    pub fn fabric(&self) -> &Arc<LocalFabric> {
        &self.fabric
    }

    pub fn pool(&self) -> &Arc<LocalPool> {
        &self.pool
    }

    /// Start every rank, hand its solver to `body`, then clean it up.
    /// Results come back indexed by rank; the first failing rank's error wins.
    ///
    /// Ranks are assigned by election, so thread `k` need not become rank `k`.
    pub fn run<T, F>(&self, body: F) -> Result<Vec<T>, SorError>
    where
        T: Send,
        F: Fn(&mut Solver<LocalComm>) -> Result<T, SorError> + Sync,
    {
        let members = (0..self.config.ranks)
            .map(|_| self.pool.join().map(|m| Arc::new(m) as Arc<dyn Registry>))
            .collect::<Result<Vec<_>, _>>()?;

        let outcomes: Vec<Result<(usize, T), SorError>> = thread::scope(|s| {
            let handles: Vec<_> = members
                .into_iter()
                .map(|member| {
                    let body = &body;
                    s.spawn(move || self.run_rank(member, body))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|p| std::panic::resume_unwind(p)))
                .collect()
        });

        let mut out = outcomes.into_iter().collect::<Result<Vec<_>, _>>()?;
        out.sort_by_key(|(rank, _)| *rank);
        Ok(out.into_iter().map(|(_, v)| v).collect())
    }

    fn run_rank<T, F>(&self, member: Arc<dyn Registry>, body: &F) -> Result<(usize, T), SorError>
    where
        F: Fn(&mut Solver<LocalComm>) -> Result<T, SorError>,
    {
        let topology = match Topology::resolve(member.as_ref()) {
            Ok(t) => t,
            Err(e) => {
                if let Err(leave) = member.leave() {
                    log::error!("leaving pool: {leave}");
                }
                return Err(e);
            }
        };
        let rank = topology.rank();
        log::debug!("{} runs as rank {rank}", member.identifier());

        let comm = self.fabric.endpoint(rank);
        let mut solver = Solver::new(self.config.clone(), comm, topology, Some(member))?;
        let out = body(&mut solver);
        let cleaned = solver.cleanup();
        let out = out?;
        cleaned?;
        Ok((rank, out))
    }

    /// The standard sequence: an optional warm-up run, then the timed run.
    /// Returns every rank's reports in run order.
    pub fn solve(&self) -> Result<Vec<Vec<RunReport>>, SorError> {
        let warmup = self.config.warmup;
        self.run(|solver| {
            let mut reports = Vec::with_capacity(2);
            if warmup {
                reports.push(solver.start(WARMUP_RUN)?);
            }
            reports.push(solver.start(TIMED_RUN)?);
            Ok(reports)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_rank_reports_the_same_iteration_count() {
        let mut cfg = SorConfig::from_args(["-ranks", "3", "-warmup", "12"]).unwrap();
        cfg.clusters = 2;
        let cluster = LocalCluster::new(cfg).unwrap();
        let reports = cluster.solve().unwrap();
        assert_eq!(reports.len(), 3);
        for (rank, runs) in reports.iter().enumerate() {
            assert_eq!(runs.len(), 2);
            assert_eq!(runs[0].run_name, WARMUP_RUN);
            assert_eq!(runs[1].rank, rank);
            assert_eq!(runs[1].iterations, reports[0][1].iterations);
            assert_eq!(runs[0].iterations, runs[1].iterations);
        }
        assert_eq!(cluster.pool().members(), 0);
        assert_eq!(cluster.fabric().ports_opened(), cluster.fabric().ports_closed());
    }

    #[test]
    fn invalid_pool_size_is_rejected_up_front() {
        let cfg = SorConfig::from_args(["-ranks", "5", "3"]).unwrap();
        assert!(matches!(
            LocalCluster::new(cfg),
            Err(SorError::ProblemTooSmall { interior_rows: 3, ranks: 5 })
        ));
    }
}

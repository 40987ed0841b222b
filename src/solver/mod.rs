//! The red/black SOR driver for one rank.
//!
//! A [`Solver`] owns its slice of the grid, the neighbour exchange and the
//! reducer. [`Solver::start`] runs one complete solve:
//!
//! 1. re-initialize the grid and barrier,
//! 2. iterate red then black sweeps, each preceded by a halo exchange,
//! 3. reduce the per-iteration residual when required and apply the
//!    termination policy,
//! 4. barrier again and return a [`RunReport`].
//!
//! Any transport failure aborts the run, releases every channel and is
//! returned to the caller. Cleanup also runs through [`Solver::cleanup`] or a
//! [`ShutdownHandle`]; whichever comes first does the work.

mod shutdown;

pub use shutdown::ShutdownHandle;

use crate::algs::communicator::{Communicator, NoComm};
use crate::algs::reduction::BARRIER_SENTINEL;
use crate::config::SorConfig;
use crate::data::grid::{Color, GridStore};
use crate::data::partition::{Partition, SorParams};
use crate::halo::{ExchangeMode, HaloExchange};
use crate::sor_error::SorError;
use crate::timing::{Phase, Timings};
use crate::topology::rank::Topology;
use crate::topology::registry::{PeerId, Registry};
use parking_lot::Mutex;
use serde::Serialize;
use shutdown::Channels;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Name of the run whose timings are never reported.
pub const WARMUP_RUN: &str = "warmup";

/// Announced once every rank has passed the start barrier.
pub const START_LINE: &str = "... and they're off !";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SolverState {
    Uninitialized,
    BoundaryInitialized,
    Running,
    Converged,
    MaxItersReached,
    Cleaned,
}

/// Outcome of one [`Solver::start`] on one rank.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunReport {
    pub run_name: String,
    pub rank: usize,
    pub ranks: usize,
    pub n: usize,
    pub iterations: usize,
    /// Global max residual of the last reduce, or this rank's last local
    /// residual when the final iteration did not reduce.
    pub max_diff: f64,
    pub stopdiff: f64,
    pub elapsed: Duration,
    pub state: SolverState,
}

impl RunReport {
    pub fn converged(&self) -> bool {
        self.state == SolverState::Converged
    }
}

/// The two summary lines of a run; `n` includes the boundary rows.
impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: application {} {} x {} took {:.3} sec.",
            self.rank,
            self.run_name,
            self.n,
            self.n,
            self.elapsed.as_secs_f64()
        )?;
        write!(
            f,
            "using {} iterations, diff is {} (allowed diff {})",
            self.iterations, self.max_diff, self.stopdiff
        )
    }
}

pub struct Solver<C: Communicator> {
    config: SorConfig,
    topology: Topology,
    part: Partition,
    params: SorParams,
    grid: GridStore,
    timings: Timings,
    channels: Arc<Mutex<Channels<C>>>,
    state: SolverState,
}

impl Solver<NoComm> {
    /// A one-rank solver with no transport and no pool membership.
    pub fn standalone(config: SorConfig) -> Result<Self, SorError> {
        Solver::new(config, NoComm, Topology::single(PeerId::new("local", "local")), None)
    }
}

impl<C: Communicator> Solver<C> {
    /// Validate `config` against the pool, compute this rank's bounds and
    /// open the neighbour and reducer ports.
    ///
    /// `membership`, when given, is left as the last step of cleanup, or right
    /// away if construction fails.
    pub fn new(
        config: SorConfig,
        comm: C,
        topology: Topology,
        membership: Option<Arc<dyn Registry>>,
    ) -> Result<Self, SorError> {
        match Self::connect(config, comm, topology, membership.clone()) {
            Ok(solver) => Ok(solver),
            Err(e) => {
                if let Some(member) = membership {
                    if let Err(leave) = member.leave() {
                        log::error!("leaving pool: {leave}");
                    }
                }
                Err(e)
            }
        }
    }

    fn connect(
        config: SorConfig,
        comm: C,
        topology: Topology,
        membership: Option<Arc<dyn Registry>>,
    ) -> Result<Self, SorError> {
        config.validate(topology.size())?;
        if comm.rank() != topology.rank() || comm.size() != topology.size() {
            return Err(SorError::Configuration(format!(
                "communicator is rank {} of {}, topology says {} of {}",
                comm.rank(),
                comm.size(),
                topology.rank(),
                topology.size()
            )));
        }

        let part = Partition::compute(config.n, topology.size(), topology.rank())?;
        let params = SorParams::for_grid(config.n);
        let grid = GridStore::new(&part);

        let mut halo = HaloExchange::new(comm.clone(), &part, config.delivery)?;
        let reducer = match config.reducer.build(comm, &topology) {
            Ok(r) => r,
            Err(e) => {
                if let Err(close) = halo.close() {
                    log::error!("closing neighbour ports: {close}");
                }
                return Err(e);
            }
        };

        if topology.is_first() {
            log::info!(
                "problem parameters: r = {}, omega = {}, stopdiff = {}",
                params.r,
                params.omega,
                params.stopdiff
            );
        }
        log::info!(
            "{}: lb = {}, ub = {}",
            topology.rank(),
            part.lb,
            part.ub
        );

        Ok(Self {
            timings: Timings::new(config.timings),
            config,
            topology,
            part,
            params,
            grid,
            channels: Arc::new(Mutex::new(Channels::new(halo, reducer, membership))),
            state: SolverState::Uninitialized,
        })
    }

    pub fn state(&self) -> SolverState {
        self.state
    }

    pub fn config(&self) -> &SorConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn partition(&self) -> &Partition {
        &self.part
    }

    pub fn params(&self) -> &SorParams {
        &self.params
    }

    pub fn grid(&self) -> &GridStore {
        &self.grid
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle<C> {
        ShutdownHandle {
            channels: Arc::clone(&self.channels),
        }
    }

    /// Run one complete solve from the initial boundary conditions.
    ///
    /// # Errors
    /// Any transport failure. The solver is cleaned up before the error is
    /// returned and cannot be started again.
    pub fn start(&mut self, run_name: &str) -> Result<RunReport, SorError> {
        if self.state == SolverState::Cleaned || self.channels.lock().is_finished() {
            return Err(SorError::Configuration(format!(
                "run `{run_name}` started after cleanup"
            )));
        }
        match self.run(run_name) {
            Ok(report) => Ok(report),
            Err(e) => {
                log::error!("{}: run `{run_name}` failed: {e}", self.topology.rank());
                if let Err(cleanup) = self.cleanup() {
                    log::error!("cleanup after failure: {cleanup}");
                }
                Err(e)
            }
        }
    }

    /// Release neighbour ports, reducer ports and pool membership, in that
    /// order. Only the first call (here or through a [`ShutdownHandle`])
    /// does anything.
    pub fn cleanup(&mut self) -> Result<(), SorError> {
        let res = self.channels.lock().cleanup();
        self.state = SolverState::Cleaned;
        res
    }

    fn run(&mut self, run_name: &str) -> Result<RunReport, SorError> {
        let rank = self.topology.rank();
        self.grid.initialize();
        self.state = SolverState::BoundaryInitialized;

        self.reduce(BARRIER_SENTINEL)?;
        if self.topology.is_first() {
            log::info!("{START_LINE}");
        }
        self.timings.reset();
        self.state = SolverState::Running;
        let t0 = Instant::now();

        let dynamic = self.config.is_dynamic();
        let reducing = dynamic || self.config.reduce_always;
        let mut iteration = 0;
        let max_diff = loop {
            let mut diff = 0.0_f64;
            for color in Color::BOTH {
                let d = match self.config.exchange {
                    ExchangeMode::Sync => self.exchange_then_sweep(color)?,
                    ExchangeMode::Async => self.overlapped_sweep(color)?,
                };
                diff = diff.max(d);
            }
            iteration += 1;

            let reduced = reducing && iteration % self.config.iters_per_reduce == 0;
            let reported = if reduced { self.reduce(diff)? } else { diff };
            log::trace!("{rank}: iteration {iteration} diff {reported}");

            let done = if dynamic {
                reduced && reported <= self.params.stopdiff
            } else {
                iteration >= self.config.max_iters
            };
            if done {
                break reported;
            }
        };

        self.reduce(BARRIER_SENTINEL)?;
        let elapsed = t0.elapsed();
        self.state = if dynamic {
            SolverState::Converged
        } else {
            SolverState::MaxItersReached
        };
        if run_name != WARMUP_RUN {
            self.timings.report(rank);
        }

        Ok(RunReport {
            run_name: run_name.to_owned(),
            rank,
            ranks: self.topology.size(),
            n: self.config.n,
            iterations: iteration,
            max_diff,
            stopdiff: self.params.stopdiff,
            elapsed,
            state: self.state,
        })
    }

    fn reduce(&mut self, value: f64) -> Result<f64, SorError> {
        self.timings.start(Phase::Reduce);
        let global = self.channels.lock().reducer.reduce(value)?;
        self.timings.stop(Phase::Reduce);
        Ok(global)
    }

    fn sweep(&mut self, color: Color, rows: Range<usize>) -> f64 {
        self.timings.start(Phase::Compute);
        let diff = self.grid.sweep(color, rows, self.params.omega);
        self.timings.stop(Phase::Compute);
        diff
    }

    fn exchange_then_sweep(&mut self, color: Color) -> Result<f64, SorError> {
        self.timings.start(Phase::Communicate);
        self.channels.lock().halo.send_receive(&mut self.grid)?;
        self.timings.stop(Phase::Communicate);
        Ok(self.sweep(color, self.part.rows()))
    }

    /// Rows `lb+1 .. ub-1` never read a halo, so they are computed while the
    /// boundary rows are in flight. Each boundary-adjacent row is computed
    /// once even when the slice is only one or two rows tall.
    fn overlapped_sweep(&mut self, color: Color) -> Result<f64, SorError> {
        let (lb, ub) = (self.part.lb, self.part.ub);

        self.timings.start(Phase::Communicate);
        self.channels.lock().halo.send(&self.grid)?;
        self.timings.stop(Phase::Communicate);

        let mut diff = self.sweep(color, lb + 1..ub - 1);

        self.timings.start(Phase::Communicate);
        self.channels.lock().halo.receive(&mut self.grid)?;
        self.timings.stop(Phase::Communicate);

        diff = diff.max(self.sweep(color, lb..lb + 1));
        if ub - 1 > lb {
            diff = diff.max(self.sweep(color, ub - 1..ub));
        }
        Ok(diff)
    }
}

impl<C: Communicator> Drop for Solver<C> {
    fn drop(&mut self) {
        if let Err(e) = self.channels.lock().cleanup() {
            log::error!("{}: cleanup on drop: {e}", self.topology.rank());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::LocalFabric;
    use crate::topology::registry::LocalPool;

    fn fixed(interior: usize, iters: usize) -> SorConfig {
        SorConfig::from_args([interior.to_string(), iters.to_string()]).unwrap()
    }

    #[test]
    fn fixed_count_runs_exactly_max_iters() {
        let mut solver = Solver::standalone(fixed(8, 50)).unwrap();
        assert_eq!(solver.state(), SolverState::Uninitialized);
        let report = solver.start("SOR").unwrap();
        assert_eq!(report.iterations, 50);
        assert_eq!(report.state, SolverState::MaxItersReached);
        assert!(!report.converged());
        solver.cleanup().unwrap();
        assert_eq!(solver.state(), SolverState::Cleaned);
    }

    #[test]
    fn dynamic_single_rank_converges() {
        let cfg = SorConfig::from_args(["8"]).unwrap();
        let mut solver = Solver::standalone(cfg).unwrap();
        let report = solver.start("SOR").unwrap();
        assert!(report.converged());
        assert!(report.max_diff <= report.stopdiff);
        assert!(report.iterations > 1);
    }

    #[test]
    fn reduce_factor_delays_the_stop() {
        let every = Solver::standalone(SorConfig::from_args(["8"]).unwrap())
            .unwrap()
            .start("SOR")
            .unwrap();
        let mut cfg = SorConfig::from_args(["8"]).unwrap();
        cfg.iters_per_reduce = 7;
        let sparse = Solver::standalone(cfg).unwrap().start("SOR").unwrap();
        assert_eq!(sparse.iterations % 7, 0);
        assert!(sparse.iterations >= every.iterations);
    }

    #[test]
    fn warmup_and_timed_runs_start_from_the_same_grid() {
        let mut solver = Solver::standalone(fixed(6, 10)).unwrap();
        solver.start(WARMUP_RUN).unwrap();
        let after_warmup = solver.grid().clone();
        solver.start("SOR").unwrap();
        assert_eq!(solver.grid(), &after_warmup);
    }

    #[test]
    fn async_single_rank_matches_sync() {
        let mut sync = Solver::standalone(fixed(5, 20)).unwrap();
        let mut cfg = fixed(5, 20);
        cfg.exchange = ExchangeMode::Async;
        let mut overlapped = Solver::standalone(cfg).unwrap();
        sync.start("SOR").unwrap();
        overlapped.start("SOR").unwrap();
        assert_eq!(sync.grid(), overlapped.grid());
    }

    #[test]
    fn timings_count_phases_when_enabled() {
        let mut cfg = fixed(6, 4);
        cfg.timings = true;
        let mut solver = Solver::standalone(cfg).unwrap();
        solver.start("SOR").unwrap();
        // two sweeps per iteration, two barriers plus one reduce per iteration
        assert_eq!(solver.timings().timer(Phase::Compute).count(), 8);
        assert_eq!(solver.timings().timer(Phase::Reduce).count(), 4 + 1);
    }

    #[test]
    fn too_small_problem_opens_nothing() {
        let fabric = LocalFabric::new(3);
        let peers = (0..3).map(|r| PeerId::new(format!("p{r}"), "c")).collect();
        let topo = Topology::from_peers(0, peers).unwrap();
        let err = Solver::new(fixed(2, 1), fabric.endpoint(0), topo, None)
            .err()
            .unwrap();
        assert!(matches!(err, SorError::ProblemTooSmall { .. }));
        assert_eq!(fabric.ports_opened(), 0);
    }

    #[test]
    fn report_summary_uses_the_full_grid() {
        let mut solver = Solver::standalone(fixed(6, 3)).unwrap();
        let report = solver.start("SOR").unwrap();
        let text = report.to_string();
        let mut lines = text.lines();
        let first = lines.next().unwrap();
        assert!(first.starts_with("0: application SOR 8 x 8 took "), "{first}");
        assert!(first.ends_with(" sec."), "{first}");
        assert_eq!(
            lines.next().unwrap(),
            format!("using 3 iterations, diff is {} (allowed diff {})", report.max_diff, report.stopdiff)
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn failed_construction_leaves_the_pool() {
        let pool = LocalPool::new(1, 1);
        let member: Arc<dyn Registry> = Arc::new(pool.join().unwrap());
        let topo = Topology::resolve(member.as_ref()).unwrap();
        assert_eq!(pool.members(), 1);
        let fabric = LocalFabric::new(1);
        let err = Solver::new(fixed(0, 1), fabric.endpoint(0), topo, Some(member))
            .err()
            .unwrap();
        assert!(matches!(err, SorError::ProblemTooSmall { .. }));
        assert_eq!(pool.members(), 0);
    }

    #[test]
    fn mismatched_communicator_is_rejected() {
        let fabric = LocalFabric::new(2);
        let err = Solver::new(
            fixed(4, 1),
            fabric.endpoint(0),
            Topology::single(PeerId::new("a", "c")),
            None,
        )
        .err()
        .unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn start_after_shutdown_is_refused() {
        let mut solver = Solver::standalone(fixed(4, 1)).unwrap();
        let handle = solver.shutdown_handle();
        handle.shutdown().unwrap();
        assert!(handle.is_finished());
        assert!(solver.start("SOR").is_err());
        solver.cleanup().unwrap();
        handle.shutdown().unwrap();
    }
}

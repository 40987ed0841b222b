//! Distributed red/black SOR.
//!
//! ```sh
//! sor -ranks 4 -async 1024        # dynamic termination on 4 in-process ranks
//! sor -no-reduce 512 200          # fixed 200 iterations, no reduction
//! RUST_LOG=info SOR_TIMING=1 sor -ranks 2 256
//! ```

use rb_sor::config::SorConfig;
use rb_sor::launch::LocalCluster;
use rb_sor::solver::{RunReport, START_LINE};
use rb_sor::sor_error::SorError;
use std::process;

fn main() {
    env_logger::init();
    let args: Vec<String> = std::env::args().skip(1).collect();

    let config = match SorConfig::from_args(&args) {
        Ok(c) => c.with_process_env(),
        Err(e) => {
            eprintln!("{e}");
            println!("{}", SorConfig::usage());
            for (i, a) in args.iter().enumerate() {
                println!("{i} : {a}");
            }
            process::exit(e.exit_code());
        }
    };

    match run(&config) {
        Ok(reports) => {
            for r in reports.iter().filter(|r| r.rank == 0) {
                println!("{r}");
            }
        }
        Err(e) => {
            eprintln!("{e}");
            process::exit(e.exit_code());
        }
    }
}

fn banner(config: &SorConfig, ranks: usize) {
    println!("{}", config.banner(ranks));
    println!("{START_LINE}");
}

fn run(config: &SorConfig) -> Result<Vec<RunReport>, SorError> {
    if config.mpi {
        return run_mpi(config);
    }
    let cluster = LocalCluster::new(config.clone())?;
    banner(config, config.ranks);
    let per_rank = cluster.solve()?;
    Ok(per_rank.into_iter().flatten().collect())
}

#[cfg(feature = "mpi-support")]
fn run_mpi(config: &SorConfig) -> Result<Vec<RunReport>, SorError> {
    use rb_sor::algs::communicator::{Communicator, MpiComm};
    use rb_sor::launch::TIMED_RUN;
    use rb_sor::solver::{Solver, WARMUP_RUN};
    use rb_sor::topology::rank::Topology;
    use rb_sor::topology::registry::{MpiRegistry, Registry};
    use std::sync::Arc;

    let comm = MpiComm::new().map_err(|e| SorError::comm(0, e))?;
    let registry: Arc<dyn Registry> = Arc::new(MpiRegistry::new(&comm));
    config.validate(registry.pool_size())?;
    let topology = Topology::resolve(registry.as_ref())?;
    if topology.is_first() {
        banner(config, comm.size());
    }

    let mut solver = Solver::new(config.clone(), comm, topology, Some(registry))?;
    let mut reports = Vec::with_capacity(2);
    let mut runs = || -> Result<(), SorError> {
        if config.warmup {
            reports.push(solver.start(WARMUP_RUN)?);
        }
        reports.push(solver.start(TIMED_RUN)?);
        Ok(())
    };
    let outcome = runs();
    let cleaned = solver.cleanup();
    outcome?;
    cleaned?;
    Ok(reports)
}

#[cfg(not(feature = "mpi-support"))]
fn run_mpi(_config: &SorConfig) -> Result<Vec<RunReport>, SorError> {
    Err(SorError::Configuration(
        "built without the `mpi-support` feature".into(),
    ))
}

#![cfg_attr(docsrs, feature(doc_cfg))]
//! # rb-sor
//!
//! Red/black successive over-relaxation of the 2-D Laplace equation on a
//! grid split into contiguous row slices, one per rank.
//!
//! ## Features
//! - Row partition with fixed boundary values and one halo row per neighbour
//! - Synchronous or latency-hiding asynchronous halo exchange, with pull or
//!   push (upcall) delivery
//! - Linear, binary-tree and cluster-hierarchical all-reduce-max, doubling as
//!   barriers
//! - Fixed-count or dynamic termination on the global residual
//! - Pluggable transports: serial, in-process threads, and MPI
//!   (feature `mpi-support`)
//!
//! ## Usage
//! ```no_run
//! use rb_sor::prelude::*;
//!
//! # fn main() -> Result<(), SorError> {
//! let config = SorConfig::from_args(["-ranks", "4", "254"])?;
//! let reports = LocalCluster::new(config)?.solve()?;
//! println!("{} iterations", reports[0][0].iterations);
//! # Ok(())
//! # }
//! ```

pub mod algs;
pub mod config;
pub mod data;
pub mod halo;
pub mod launch;
pub mod solver;
pub mod sor_error;
pub mod timing;
pub mod topology;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, LocalComm, LocalFabric, NoComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::reduction::{Reducer, ReducerStrategy};
    pub use crate::config::SorConfig;
    pub use crate::data::grid::{Color, GridStore};
    pub use crate::data::partition::{Partition, SorParams};
    pub use crate::halo::{Delivery, ExchangeMode, HaloExchange};
    pub use crate::launch::LocalCluster;
    pub use crate::solver::{RunReport, ShutdownHandle, Solver, SolverState};
    pub use crate::sor_error::{CommError, SorError};
    pub use crate::topology::rank::Topology;
    pub use crate::topology::registry::{LocalPool, PeerId, Registry};
}

//! Process-group membership: peer identities, pool size and strict elections.
//!
//! The solver only consumes this interface; [`LocalPool`] realizes it for
//! in-process pools (one thread per rank) and `MpiRegistry` for MPI worlds.

use crate::sor_error::SorError;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Stable identity of a pool member. `cluster` carries network-locality
/// metadata: peers sharing it are cheap to talk to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId {
    pub name: String,
    pub cluster: String,
}

impl PeerId {
    pub fn new(name: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cluster: cluster.into(),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.cluster)
    }
}

/// Membership service consumed by [`Topology::resolve`](super::rank::Topology::resolve).
pub trait Registry: Send + Sync {
    /// Identity of the calling member.
    fn identifier(&self) -> &PeerId;
    /// Number of members in the (closed) pool.
    fn pool_size(&self) -> usize;
    /// Take part in election `name`; returns the winner (first caller wins).
    fn elect(&self, name: &str) -> Result<PeerId, SorError>;
    /// Block until election `name` is decided and return its winner.
    fn election_result(&self, name: &str) -> Result<PeerId, SorError>;
    /// Leave the pool. A second call is a no-op.
    fn leave(&self) -> Result<(), SorError>;
}

/// Shared state of an in-process pool.
pub struct LocalPool {
    size: usize,
    clusters: usize,
    timeout: Duration,
    elections: Mutex<HashMap<String, PeerId>>,
    decided: Condvar,
    joined: AtomicUsize,
    left: AtomicUsize,
}

impl LocalPool {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Pool of `size` members spread over `clusters` contiguous clusters.
    pub fn new(size: usize, clusters: usize) -> Arc<Self> {
        Self::with_timeout(size, clusters, Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(size: usize, clusters: usize, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            size,
            clusters: clusters.clamp(1, size.max(1)),
            timeout,
            elections: Mutex::new(HashMap::new()),
            decided: Condvar::new(),
            joined: AtomicUsize::new(0),
            left: AtomicUsize::new(0),
        })
    }

    /// Register a new member and return its registry handle.
    pub fn join(self: &Arc<Self>) -> Result<LocalRegistry, SorError> {
        let k = self.joined.fetch_add(1, Ordering::AcqRel);
        if k >= self.size {
            return Err(SorError::Topology(format!(
                "pool of {} is closed; member {k} rejected",
                self.size
            )));
        }
        let cluster = k * self.clusters / self.size;
        Ok(LocalRegistry {
            pool: Arc::clone(self),
            me: PeerId::new(format!("peer-{k}"), format!("cluster-{cluster}")),
            left: AtomicBool::new(false),
        })
    }

    /// Members that joined and have not left yet.
    pub fn members(&self) -> usize {
        self.joined.load(Ordering::Acquire).min(self.size) - self.left.load(Ordering::Acquire)
    }
}

/// One member's handle on a [`LocalPool`].
pub struct LocalRegistry {
    pool: Arc<LocalPool>,
    me: PeerId,
    left: AtomicBool,
}

impl Registry for LocalRegistry {
    fn identifier(&self) -> &PeerId {
        &self.me
    }

    fn pool_size(&self) -> usize {
        self.pool.size
    }

    fn elect(&self, name: &str) -> Result<PeerId, SorError> {
        let winner = {
            let mut elections = self.pool.elections.lock();
            elections
                .entry(name.to_owned())
                .or_insert_with(|| self.me.clone())
                .clone()
        };
        self.pool.decided.notify_all();
        Ok(winner)
    }

    fn election_result(&self, name: &str) -> Result<PeerId, SorError> {
        let deadline = Instant::now() + self.pool.timeout;
        let mut elections = self.pool.elections.lock();
        loop {
            if let Some(winner) = elections.get(name) {
                return Ok(winner.clone());
            }
            if self
                .pool
                .decided
                .wait_until(&mut elections, deadline)
                .timed_out()
            {
                return Err(SorError::Topology(format!(
                    "election `{name}` undecided after {:?}",
                    self.pool.timeout
                )));
            }
        }
    }

    fn leave(&self) -> Result<(), SorError> {
        if !self.left.swap(true, Ordering::AcqRel) {
            self.pool.left.fetch_add(1, Ordering::AcqRel);
            log::debug!("{} left the pool", self.me);
        }
        Ok(())
    }
}

#[cfg(feature = "mpi-support")]
mod mpi_registry {
    use super::*;
    use crate::algs::communicator::{Communicator, MpiComm};

    /// MPI ranks are fixed by the launcher, so election `i` is won by rank `i`.
    pub struct MpiRegistry {
        me: PeerId,
        size: usize,
    }

    impl MpiRegistry {
        pub fn new(comm: &MpiComm) -> Self {
            Self {
                me: Self::peer(comm.rank()),
                size: comm.size(),
            }
        }

        fn peer(rank: usize) -> PeerId {
            PeerId::new(format!("mpi-{rank}"), "mpi")
        }

        fn winner(&self, name: &str) -> Result<PeerId, SorError> {
            match name.parse::<usize>() {
                Ok(i) if i < self.size => Ok(Self::peer(i)),
                _ => Err(SorError::Topology(format!("no MPI rank for election `{name}`"))),
            }
        }
    }

    impl Registry for MpiRegistry {
        fn identifier(&self) -> &PeerId {
            &self.me
        }
        fn pool_size(&self) -> usize {
            self.size
        }
        fn elect(&self, name: &str) -> Result<PeerId, SorError> {
            self.winner(name)
        }
        fn election_result(&self, name: &str) -> Result<PeerId, SorError> {
            self.winner(name)
        }
        fn leave(&self) -> Result<(), SorError> {
            Ok(())
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_registry::MpiRegistry;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_caller_wins_election() {
        let pool = LocalPool::new(2, 1);
        let a = pool.join().unwrap();
        let b = pool.join().unwrap();
        assert_eq!(a.elect("0").unwrap(), *a.identifier());
        assert_eq!(b.elect("0").unwrap(), *a.identifier());
        assert_eq!(b.election_result("0").unwrap(), *a.identifier());
    }

    #[test]
    fn pool_is_closed_world() {
        let pool = LocalPool::new(1, 1);
        let _a = pool.join().unwrap();
        assert!(matches!(pool.join(), Err(SorError::Topology(_))));
    }

    #[test]
    fn undecided_election_times_out() {
        let pool = LocalPool::with_timeout(2, 1, Duration::from_millis(20));
        let a = pool.join().unwrap();
        assert!(matches!(a.election_result("1"), Err(SorError::Topology(_))));
    }

    #[test]
    fn clusters_are_contiguous_by_join_order() {
        let pool = LocalPool::new(4, 2);
        let ids: Vec<_> = (0..4).map(|_| pool.join().unwrap()).collect();
        let clusters: Vec<_> = ids.iter().map(|r| r.identifier().cluster.clone()).collect();
        assert_eq!(clusters, ["cluster-0", "cluster-0", "cluster-1", "cluster-1"]);
    }

    #[test]
    fn leave_is_idempotent() {
        let pool = LocalPool::new(2, 1);
        let a = pool.join().unwrap();
        let _b = pool.join().unwrap();
        assert_eq!(pool.members(), 2);
        a.leave().unwrap();
        a.leave().unwrap();
        assert_eq!(pool.members(), 1);
    }
}

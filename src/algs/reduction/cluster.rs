//! Two-tier reduction: inside each cluster, then across cluster leaders.

use super::{Group, REDUCE_TAG, Reducer};
use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::ports::Ports;
use crate::sor_error::SorError;
use crate::topology::rank::Topology;

const LOCAL_TAG: CommTag = REDUCE_TAG.offset(0x10);
const GLOBAL_TAG: CommTag = REDUCE_TAG.offset(0x20);

/// Members report to their cluster leader (lowest rank of the cluster), the
/// leaders run a tree reduction among themselves, and each leader hands the
/// result back to its members. Only leaders exchange cross-cluster messages.
pub struct ClusterReducer<C: Communicator> {
    size: usize,
    local: Group,
    /// Present on cluster leaders only.
    leaders: Option<Group>,
    ports: Ports<C>,
}

impl<C: Communicator> ClusterReducer<C> {
    pub fn new(comm: C, topology: &Topology) -> Result<Self, SorError> {
        let rank = comm.rank();
        let groups = topology.cluster_groups();
        let mine = groups
            .iter()
            .find(|g| g.contains(&rank))
            .cloned()
            .ok_or_else(|| SorError::Topology(format!("rank {rank} belongs to no cluster")))?;
        let local = Group::new(mine, rank)
            .ok_or_else(|| SorError::Topology(format!("rank {rank} missing from its cluster")))?;
        let leaders = Group::new(groups.iter().map(|g| g[0]).collect(), rank);
        log::debug!(
            "rank {rank}: cluster of {} ranks, {} clusters, leader: {}",
            local.len(),
            groups.len(),
            leaders.is_some()
        );

        let mut ports = Ports::new(comm);
        if local.len() > 1 {
            local.open_flat(&mut ports, LOCAL_TAG)?;
        }
        if let Some(l) = leaders.as_ref().filter(|l| l.len() > 1) {
            l.open_tree(&mut ports, GLOBAL_TAG)?;
        }
        Ok(Self {
            size: topology.size(),
            local,
            leaders,
            ports,
        })
    }
}

impl<C: Communicator> Reducer for ClusterReducer<C> {
    fn reduce(&mut self, value: f64) -> Result<f64, SorError> {
        if self.size == 1 {
            return Ok(value);
        }
        let comm = self.ports.comm();
        let mut max = self.local.flat_gather(comm, LOCAL_TAG, value)?;
        if let Some(l) = &self.leaders {
            let partial = l.tree_gather(comm, GLOBAL_TAG, max)?;
            max = l.tree_broadcast(comm, GLOBAL_TAG, partial)?;
        }
        self.local.flat_broadcast(comm, LOCAL_TAG, max)
    }

    fn end(&mut self) -> Result<(), SorError> {
        self.ports.close_all()
    }
}

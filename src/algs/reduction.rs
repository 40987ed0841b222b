//! All-reduce-max over the pool, also used as a barrier.
//!
//! Every strategy returns the maximum of all contributed values to every
//! rank, and no rank leaves `reduce` before every rank has entered it. With a
//! single rank all strategies are local no-ops: no port is opened and no
//! message is sent.
//!
//! - [`LinearReducer`]: rank 0 gathers from and answers every rank, `O(P)`.
//! - [`TreeReducer`]: binary combining tree by rank, `O(log P)` hops.
//! - [`ClusterReducer`]: within each cluster first, then across cluster
//!   leaders, so only leaders cross cluster boundaries.

mod cluster;
mod linear;
mod tree;

pub use cluster::ClusterReducer;
pub use linear::LinearReducer;
pub use tree::TreeReducer;

use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::ports::{Ports, recv_scalar, send_scalar};
use crate::sor_error::SorError;
use crate::topology::rank::Topology;
use serde::{Deserialize, Serialize};

/// Value contributed when a reduction is only used as a barrier.
pub const BARRIER_SENTINEL: f64 = 42.0;

pub(crate) const REDUCE_TAG: CommTag = CommTag(0x5200);
const UP: u16 = 0;
const DOWN: u16 = 1;

/// Global max of per-rank scalars.
pub trait Reducer: Send {
    /// Contribute `value` and return the maximum over all ranks.
    fn reduce(&mut self, value: f64) -> Result<f64, SorError>;

    /// Release the ports this reducer opened. Safe to call more than once.
    fn end(&mut self) -> Result<(), SorError>;

    /// Block until every rank has arrived.
    fn barrier(&mut self) -> Result<(), SorError> {
        self.reduce(BARRIER_SENTINEL).map(|_| ())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReducerStrategy {
    Linear,
    #[default]
    Tree,
    Cluster,
}

impl ReducerStrategy {
    /// Build the reducer for this rank. Ports are opened here, not lazily.
    pub fn build<C: Communicator>(
        self,
        comm: C,
        topology: &Topology,
    ) -> Result<Box<dyn Reducer>, SorError> {
        Ok(match self {
            ReducerStrategy::Linear => Box::new(LinearReducer::new(comm)?),
            ReducerStrategy::Tree => Box::new(TreeReducer::new(comm)?),
            ReducerStrategy::Cluster => Box::new(ClusterReducer::new(comm, topology)?),
        })
    }
}

/// An ordered set of global ranks taking part in one reduction tier.
/// `members[0]` is the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Group {
    members: Vec<usize>,
    pos: usize,
}

impl Group {
    /// `None` if `rank` is not a member.
    pub(crate) fn new(members: Vec<usize>, rank: usize) -> Option<Self> {
        let pos = members.iter().position(|&r| r == rank)?;
        Some(Self { members, pos })
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    fn root(&self) -> usize {
        self.members[0]
    }

    fn is_root(&self) -> bool {
        self.pos == 0
    }

    fn others(&self) -> impl Iterator<Item = usize> + '_ {
        self.members[1..].iter().copied()
    }

    fn tree_parent(&self) -> Option<usize> {
        (self.pos > 0).then(|| self.members[(self.pos - 1) / 2])
    }

    fn tree_children(&self) -> impl Iterator<Item = usize> + '_ {
        [2 * self.pos + 1, 2 * self.pos + 2]
            .into_iter()
            .filter_map(|p| self.members.get(p).copied())
    }

    /// Open up/down ports to the flat root (or, at the root, to everyone).
    pub(crate) fn open_flat<C: Communicator>(
        &self,
        ports: &mut Ports<C>,
        tag: CommTag,
    ) -> Result<(), SorError> {
        let peers: Vec<usize> = if self.is_root() {
            self.others().collect()
        } else {
            vec![self.root()]
        };
        open_both(ports, &peers, tag)
    }

    /// Open up/down ports to the tree parent and children.
    pub(crate) fn open_tree<C: Communicator>(
        &self,
        ports: &mut Ports<C>,
        tag: CommTag,
    ) -> Result<(), SorError> {
        let peers: Vec<usize> = self.tree_parent().into_iter().chain(self.tree_children()).collect();
        open_both(ports, &peers, tag)
    }

    /// Root returns the group max; other members return their own value.
    pub(crate) fn flat_gather<C: Communicator>(
        &self,
        comm: &C,
        tag: CommTag,
        v: f64,
    ) -> Result<f64, SorError> {
        if self.is_root() {
            self.others()
                .try_fold(v, |m, r| Ok(m.max(recv_scalar(comm, r, tag.offset(UP))?)))
        } else {
            send_scalar(comm, self.root(), tag.offset(UP), v)?;
            Ok(v)
        }
    }

    /// Every member returns the root's `v`.
    pub(crate) fn flat_broadcast<C: Communicator>(
        &self,
        comm: &C,
        tag: CommTag,
        v: f64,
    ) -> Result<f64, SorError> {
        if self.is_root() {
            for r in self.others() {
                send_scalar(comm, r, tag.offset(DOWN), v)?;
            }
            Ok(v)
        } else {
            recv_scalar(comm, self.root(), tag.offset(DOWN))
        }
    }

    /// Fold children's partial maxima into `v` and pass the result up.
    /// Only the root's return value is the group max.
    pub(crate) fn tree_gather<C: Communicator>(
        &self,
        comm: &C,
        tag: CommTag,
        v: f64,
    ) -> Result<f64, SorError> {
        let m = self
            .tree_children()
            .try_fold(v, |m, c| Ok::<_, SorError>(m.max(recv_scalar(comm, c, tag.offset(UP))?)))?;
        if let Some(p) = self.tree_parent() {
            send_scalar(comm, p, tag.offset(UP), m)?;
        }
        Ok(m)
    }

    /// Push the root's `v` down the tree; every member returns it.
    pub(crate) fn tree_broadcast<C: Communicator>(
        &self,
        comm: &C,
        tag: CommTag,
        v: f64,
    ) -> Result<f64, SorError> {
        let v = match self.tree_parent() {
            Some(p) => recv_scalar(comm, p, tag.offset(DOWN))?,
            None => v,
        };
        for c in self.tree_children() {
            send_scalar(comm, c, tag.offset(DOWN), v)?;
        }
        Ok(v)
    }
}

fn open_both<C: Communicator>(
    ports: &mut Ports<C>,
    peers: &[usize],
    tag: CommTag,
) -> Result<(), SorError> {
    for &p in peers {
        ports.open(p, tag.offset(UP))?;
        ports.open(p, tag.offset(DOWN))?;
    }
    Ok(())
}

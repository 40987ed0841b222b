//! Rank resolution: bind small integer ranks to peer identities.

use super::registry::{PeerId, Registry};
use crate::sor_error::SorError;
use itertools::Itertools;

/// Ordered peer identities indexed by rank, plus the caller's own rank.
/// Built once at startup and immutable afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    rank: usize,
    peers: Vec<PeerId>,
}

impl Topology {
    /// Elect indices `0, 1, ...` until this member wins one (its rank), then
    /// collect the winners of every higher index.
    ///
    /// # Errors
    /// `SorError::Topology` if this member wins no election or a higher
    /// election never completes.
    pub fn resolve(registry: &dyn Registry) -> Result<Self, SorError> {
        let size = registry.pool_size();
        let me = registry.identifier().clone();
        let mut peers: Vec<Option<PeerId>> = vec![None; size];

        let mut rank = None;
        for (i, slot) in peers.iter_mut().enumerate() {
            let winner = registry.elect(&i.to_string())?;
            let mine = winner == me;
            *slot = Some(winner);
            if mine {
                rank = Some(i);
                break;
            }
        }
        let rank = rank
            .ok_or_else(|| SorError::Topology(format!("{me} won none of {size} elections")))?;

        for (i, slot) in peers.iter_mut().enumerate().skip(rank + 1) {
            *slot = Some(registry.election_result(&i.to_string())?);
        }

        let peers = peers
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| SorError::Topology("unresolved peer below own rank".into()))?;
        log::debug!("{me} resolved as rank {rank} of {size}");
        Ok(Self { rank, peers })
    }

    /// Build directly from a known peer list.
    pub fn from_peers(rank: usize, peers: Vec<PeerId>) -> Result<Self, SorError> {
        if rank >= peers.len() {
            return Err(SorError::Topology(format!(
                "rank {rank} outside pool of {}",
                peers.len()
            )));
        }
        Ok(Self { rank, peers })
    }

    /// Topology of a one-member pool.
    pub fn single(me: PeerId) -> Self {
        Self {
            rank: 0,
            peers: vec![me],
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }
    pub fn size(&self) -> usize {
        self.peers.len()
    }
    pub fn peer(&self, rank: usize) -> Option<&PeerId> {
        self.peers.get(rank)
    }
    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }
    pub fn is_first(&self) -> bool {
        self.rank == 0
    }
    pub fn is_last(&self) -> bool {
        self.rank + 1 == self.size()
    }

    /// Neighbour owning the rows above ours.
    pub fn prev(&self) -> Option<usize> {
        self.rank.checked_sub(1)
    }

    /// Neighbour owning the rows below ours.
    pub fn next(&self) -> Option<usize> {
        (!self.is_last()).then_some(self.rank + 1)
    }

    /// Ranks grouped by cluster; each group sorted, groups ordered by their
    /// lowest rank.
    pub fn cluster_groups(&self) -> Vec<Vec<usize>> {
        let mut groups: Vec<Vec<usize>> = (0..self.size())
            .into_group_map_by(|&r| self.peers[r].cluster.as_str())
            .into_values()
            .collect();
        for g in &mut groups {
            g.sort_unstable();
        }
        groups.sort_unstable_by_key(|g| g[0]);
        groups
    }
}

//! Binary combining tree over ranks.

use super::{Group, REDUCE_TAG, Reducer};
use crate::algs::communicator::Communicator;
use crate::algs::ports::Ports;
use crate::sor_error::SorError;

/// Rank `r` combines the partial maxima of ranks `2r+1` and `2r+2` with its
/// own value and hands the result to rank `(r-1)/2`; rank 0 then sends the
/// final max back down the same edges.
pub struct TreeReducer<C: Communicator> {
    group: Group,
    ports: Ports<C>,
}

impl<C: Communicator> TreeReducer<C> {
    pub fn new(comm: C) -> Result<Self, SorError> {
        let group = Group::new((0..comm.size()).collect(), comm.rank())
            .ok_or_else(|| SorError::Configuration("rank outside communicator".into()))?;
        let mut ports = Ports::new(comm);
        if group.len() > 1 {
            group.open_tree(&mut ports, REDUCE_TAG)?;
        }
        Ok(Self { group, ports })
    }
}

impl<C: Communicator> Reducer for TreeReducer<C> {
    fn reduce(&mut self, value: f64) -> Result<f64, SorError> {
        if self.group.len() == 1 {
            return Ok(value);
        }
        let comm = self.ports.comm();
        let partial = self.group.tree_gather(comm, REDUCE_TAG, value)?;
        self.group.tree_broadcast(comm, REDUCE_TAG, partial)
    }

    fn end(&mut self) -> Result<(), SorError> {
        self.ports.close_all()
    }
}

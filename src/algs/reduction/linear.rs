//! Flat reduction rooted at rank 0.

use super::{Group, REDUCE_TAG, Reducer};
use crate::algs::communicator::Communicator;
use crate::algs::ports::Ports;
use crate::sor_error::SorError;

/// Rank 0 receives a value from every other rank, takes the max and sends
/// it back to each of them.
pub struct LinearReducer<C: Communicator> {
    group: Group,
    ports: Ports<C>,
}

impl<C: Communicator> LinearReducer<C> {
    pub fn new(comm: C) -> Result<Self, SorError> {
        let group = Group::new((0..comm.size()).collect(), comm.rank())
            .ok_or_else(|| SorError::Configuration("rank outside communicator".into()))?;
        let mut ports = Ports::new(comm);
        if group.len() > 1 {
            group.open_flat(&mut ports, REDUCE_TAG)?;
        }
        Ok(Self { group, ports })
    }
}

impl<C: Communicator> Reducer for LinearReducer<C> {
    fn reduce(&mut self, value: f64) -> Result<f64, SorError> {
        if self.group.len() == 1 {
            return Ok(value);
        }
        let comm = self.ports.comm();
        let max = self.group.flat_gather(comm, REDUCE_TAG, value)?;
        self.group.flat_broadcast(comm, REDUCE_TAG, max)
    }

    fn end(&mut self) -> Result<(), SorError> {
        self.ports.close_all()
    }
}

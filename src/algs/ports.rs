//! Bookkeeping for opened ports plus typed scalar send/receive helpers.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire;
use crate::sor_error::{CommError, SorError};

/// The ports one protocol opened; [`Ports::close_all`] releases each exactly once.
pub struct Ports<C: Communicator> {
    comm: C,
    open: Vec<(usize, CommTag)>,
}

impl<C: Communicator> Ports<C> {
    pub fn new(comm: C) -> Self {
        Self {
            comm,
            open: Vec::new(),
        }
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// Open the port to `peer` on `tag`; already-open ports are left alone.
    pub fn open(&mut self, peer: usize, tag: CommTag) -> Result<(), SorError> {
        if self.is_open(peer, tag) {
            return Ok(());
        }
        self.comm
            .open_port(peer, tag)
            .map_err(|e| SorError::comm(peer, e))?;
        self.open.push((peer, tag));
        Ok(())
    }

    pub fn is_open(&self, peer: usize, tag: CommTag) -> bool {
        self.open.contains(&(peer, tag))
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Close every open port. All closes are attempted; the first failure is
    /// returned. A second call finds nothing to close.
    pub fn close_all(&mut self) -> Result<(), SorError> {
        let mut first_err = None;
        for (peer, tag) in self.open.drain(..) {
            if let Err(e) = self.comm.close_port(peer, tag) {
                log::warn!("closing port to rank {peer} (tag {:#06x}): {e}", tag.as_u16());
                first_err.get_or_insert(SorError::comm(peer, e));
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

pub fn send_scalar<C: Communicator>(
    comm: &C,
    peer: usize,
    tag: CommTag,
    v: f64,
) -> Result<(), SorError> {
    comm.isend(peer, tag, wire::scalar(&v))
        .wait()
        .map(|_| ())
        .map_err(|e| SorError::comm(peer, e))
}

pub fn recv_scalar<C: Communicator>(comm: &C, peer: usize, tag: CommTag) -> Result<f64, SorError> {
    let data = comm
        .irecv(peer, tag, wire::SCALAR_BYTES)
        .wait()
        .map_err(|e| SorError::comm(peer, e))?
        .ok_or_else(|| SorError::comm(peer, CommError::Backend("empty receive".into())))?;
    wire::read_scalar(&data).map_err(|e| SorError::comm(peer, e))
}

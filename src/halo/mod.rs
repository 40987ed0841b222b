//! Boundary-row exchange with the two logical neighbours.
//!
//! After [`HaloExchange::send`] + [`HaloExchange::receive`] (or the fused
//! [`HaloExchange::send_receive`]) halo row `lb-1` holds the previous rank's
//! row `lb-1` and halo row `ub` holds the next rank's row `ub`, exactly as
//! those ranks last computed them. The first and last ranks skip the side
//! without a neighbour.

mod syncer;

pub use syncer::Syncer;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::ports::Ports;
use crate::algs::wire;
use crate::data::grid::GridStore;
use crate::data::partition::Partition;
use crate::sor_error::{CommError, SorError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;

pub const HALO_TAG: CommTag = CommTag(0x4800);

/// Ordering of communication relative to computation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeMode {
    /// Exchange, then compute. Even ranks send first, odd ranks receive
    /// first, so a blocking transport cannot deadlock on a cycle of sends.
    #[default]
    Sync,
    /// Send, compute rows that do not read a halo, receive, then compute the
    /// two halo-adjacent rows.
    Async,
}

/// How incoming rows reach the solver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Delivery {
    /// `receive` blocks on the transport.
    #[default]
    Pull,
    /// A delivery thread deposits rows into a [`Syncer`]; `receive` waits on it.
    Upcall,
}

struct Neighbour {
    rank: usize,
    syncer: Option<Arc<Syncer>>,
    deliverer: Option<JoinHandle<()>>,
}

/// Owned by the delivery closure: when the delivery loop ends for any
/// reason, the slot is closed so a blocked `consume` fails instead of
/// waiting for a row that will never come.
struct CloseOnExit(Arc<Syncer>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.close();
    }
}

pub struct HaloExchange<C: Communicator> {
    rank: usize,
    ncol: usize,
    lb: usize,
    ub: usize,
    prev: Option<Neighbour>,
    next: Option<Neighbour>,
    ports: Ports<C>,
    /// Sends posted by [`send`](Self::send), completed after the receives.
    pending: Vec<(usize, C::SendHandle)>,
    closed: bool,
}

impl<C: Communicator> HaloExchange<C> {
    /// Open the neighbour ports for `part`; with [`Delivery::Upcall`] also
    /// start one delivery thread per neighbour. On failure every port opened
    /// so far is closed again.
    pub fn new(comm: C, part: &Partition, delivery: Delivery) -> Result<Self, SorError> {
        let mut halo = Self {
            rank: part.rank,
            ncol: part.n,
            lb: part.lb,
            ub: part.ub,
            prev: None,
            next: None,
            ports: Ports::new(comm),
            pending: Vec::new(),
            closed: false,
        };
        if let Err(e) = halo.link_neighbours(part, delivery) {
            if let Err(close) = halo.close() {
                log::error!("rank {}: closing partial halo: {close}", part.rank);
            }
            return Err(e);
        }
        Ok(halo)
    }

    fn link_neighbours(&mut self, part: &Partition, delivery: Delivery) -> Result<(), SorError> {
        if !part.is_first() {
            self.prev = Some(self.link(part.rank - 1, delivery)?);
        }
        if !part.is_last() {
            self.next = Some(self.link(part.rank + 1, delivery)?);
        }
        Ok(())
    }

    fn link(&mut self, rank: usize, delivery: Delivery) -> Result<Neighbour, SorError> {
        self.ports.open(rank, HALO_TAG)?;
        let mut nb = Neighbour {
            rank,
            syncer: None,
            deliverer: None,
        };
        if delivery == Delivery::Upcall {
            let syncer = Arc::new(Syncer::new(rank, HALO_TAG, self.ncol));
            let sink = CloseOnExit(Arc::clone(&syncer));
            let handle = self
                .ports
                .comm()
                .spawn_delivery(rank, HALO_TAG, wire::row_bytes(self.ncol), move |data| {
                    sink.0.deposit(data)
                })
                .map_err(|e| SorError::comm(rank, e))?;
            nb.syncer = Some(syncer);
            nb.deliverer = Some(handle);
        }
        Ok(nb)
    }

    fn receive_row(&self, nb: &Neighbour, dst: &mut [f64]) -> Result<(), SorError> {
        let res = match &nb.syncer {
            Some(syncer) => syncer.consume(dst),
            None => self
                .ports
                .comm()
                .irecv(nb.rank, HALO_TAG, wire::row_bytes(self.ncol))
                .wait()
                .and_then(|data| {
                    let data = data.ok_or_else(|| CommError::Backend("empty receive".into()))?;
                    wire::read_row(&data, dst)
                }),
        };
        res.map_err(|e| SorError::comm(nb.rank, e))
    }

    /// Post row `lb` to the previous rank and row `ub-1` to the next one.
    /// The sends complete at the next [`receive`](Self::receive).
    pub fn send(&mut self, grid: &GridStore) -> Result<(), SorError> {
        let targets = [
            (self.prev.as_ref().map(|n| n.rank), self.lb),
            (self.next.as_ref().map(|n| n.rank), self.ub - 1),
        ];
        for (peer, row) in targets {
            if let Some(peer) = peer {
                let h = self.ports.comm().isend(peer, HALO_TAG, wire::cast_slice(grid.row(row)));
                self.pending.push((peer, h));
            }
        }
        Ok(())
    }

    /// Fill halo row `ub` from the next rank, then halo row `lb-1` from the
    /// previous one, then complete the outstanding sends.
    pub fn receive(&mut self, grid: &mut GridStore) -> Result<(), SorError> {
        if let Some(nb) = &self.next {
            self.receive_row(nb, grid.row_mut(self.ub))?;
        }
        if let Some(nb) = &self.prev {
            self.receive_row(nb, grid.row_mut(self.lb - 1))?;
        }
        self.complete_sends()
    }

    fn complete_sends(&mut self) -> Result<(), SorError> {
        let mut first_err = None;
        for (peer, h) in self.pending.drain(..) {
            if let Err(e) = h.wait() {
                first_err.get_or_insert(SorError::comm(peer, e));
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Deadlock-free exchange: even ranks send first, odd ranks receive first.
    pub fn send_receive(&mut self, grid: &mut GridStore) -> Result<(), SorError> {
        if self.rank % 2 == 0 {
            self.send(grid)?;
            self.receive(grid)
        } else {
            self.receive(grid)?;
            self.send(grid)?;
            self.complete_sends()
        }
    }

    pub fn neighbours(&self) -> (Option<usize>, Option<usize>) {
        (
            self.prev.as_ref().map(|n| n.rank),
            self.next.as_ref().map(|n| n.rank),
        )
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release both neighbour ports and stop the delivery threads. Later calls
    /// are no-ops.
    pub fn close(&mut self) -> Result<(), SorError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending.clear();
        for nb in [&self.prev, &self.next].into_iter().flatten() {
            if let Some(s) = &nb.syncer {
                s.close();
            }
        }
        let res = self.ports.close_all();
        for nb in [&mut self.prev, &mut self.next].into_iter().flatten() {
            if let Some(h) = nb.deliverer.take() {
                if h.join().is_err() {
                    log::error!("rank {}: delivery thread for rank {} panicked", self.rank, nb.rank);
                }
            }
        }
        res
    }
}

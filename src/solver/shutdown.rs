//! Resource teardown shared by normal completion and external shutdown.

use crate::algs::communicator::Communicator;
use crate::algs::reduction::Reducer;
use crate::halo::HaloExchange;
use crate::sor_error::SorError;
use crate::topology::registry::Registry;
use parking_lot::Mutex;
use std::sync::Arc;

/// Everything a rank must release, guarded by one "already finished" flag.
pub(crate) struct Channels<C: Communicator> {
    pub(crate) halo: HaloExchange<C>,
    pub(crate) reducer: Box<dyn Reducer>,
    pub(crate) membership: Option<Arc<dyn Registry>>,
    finished: bool,
}

impl<C: Communicator> Channels<C> {
    pub(crate) fn new(
        halo: HaloExchange<C>,
        reducer: Box<dyn Reducer>,
        membership: Option<Arc<dyn Registry>>,
    ) -> Self {
        Self {
            halo,
            reducer,
            membership,
            finished: false,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    /// Neighbour ports, then reducer ports, then pool membership. Every step
    /// is attempted even if an earlier one failed; the first error is
    /// returned. Runs at most once.
    pub(crate) fn cleanup(&mut self) -> Result<(), SorError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let mut first_err = None;
        if let Err(e) = self.halo.close() {
            log::error!("closing neighbour ports: {e}");
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.reducer.end() {
            log::error!("closing reducer: {e}");
            first_err.get_or_insert(e);
        }
        if let Some(registry) = self.membership.take() {
            if let Err(e) = registry.leave() {
                log::error!("leaving pool: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Cloneable trigger for an externally requested shutdown (signal handler,
/// supervisor thread). It waits for the solver's current exchange or reduce
/// step to finish, then runs the same guarded cleanup as normal completion.
pub struct ShutdownHandle<C: Communicator> {
    pub(crate) channels: Arc<Mutex<Channels<C>>>,
}

impl<C: Communicator> Clone for ShutdownHandle<C> {
    fn clone(&self) -> Self {
        Self {
            channels: Arc::clone(&self.channels),
        }
    }
}

impl<C: Communicator> ShutdownHandle<C> {
    pub fn shutdown(&self) -> Result<(), SorError> {
        self.channels.lock().cleanup()
    }

    pub fn is_finished(&self) -> bool {
        self.channels.lock().is_finished()
    }
}

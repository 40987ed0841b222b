//! Single-slot rendezvous between a push-delivery thread and the solver.
//!
//! The delivery side blocks while the previous row is still unconsumed; the
//! compute side blocks until a fresh row has arrived. A row is therefore never
//! overwritten before it was read, and at most one row is ever buffered.

use crate::algs::communicator::CommTag;
use crate::algs::wire;
use crate::sor_error::CommError;
use parking_lot::{Condvar, Mutex};

struct Slot {
    row: Vec<f64>,
    arrived: bool,
    closed: bool,
}

pub struct Syncer {
    peer: usize,
    tag: CommTag,
    slot: Mutex<Slot>,
    changed: Condvar,
}

impl Syncer {
    pub fn new(peer: usize, tag: CommTag, ncol: usize) -> Self {
        Self {
            peer,
            tag,
            slot: Mutex::new(Slot {
                row: vec![0.0; ncol],
                arrived: false,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn closed_err(&self) -> CommError {
        CommError::Closed {
            peer: self.peer,
            tag: self.tag.as_u16(),
        }
    }

    /// Delivery side: store an incoming encoded row once the slot is free.
    pub fn deposit(&self, data: &[u8]) -> Result<(), CommError> {
        let mut slot = self.slot.lock();
        while slot.arrived && !slot.closed {
            self.changed.wait(&mut slot);
        }
        if slot.closed {
            return Err(self.closed_err());
        }
        wire::read_row(data, &mut slot.row)?;
        slot.arrived = true;
        drop(slot);
        self.changed.notify_all();
        Ok(())
    }

    /// Compute side: wait for a fresh row and copy it into `dst`.
    pub fn consume(&self, dst: &mut [f64]) -> Result<(), CommError> {
        let mut slot = self.slot.lock();
        while !slot.arrived && !slot.closed {
            self.changed.wait(&mut slot);
        }
        if !slot.arrived {
            return Err(self.closed_err());
        }
        dst.copy_from_slice(&slot.row);
        slot.arrived = false;
        drop(slot);
        self.changed.notify_all();
        Ok(())
    }

    /// Wake both sides; later deposits fail, an unconsumed row stays readable.
    pub fn close(&self) {
        self.slot.lock().closed = true;
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn encoded(v: f64) -> Vec<u8> {
        wire::cast_slice(&[v, v]).to_vec()
    }

    #[test]
    fn second_deposit_waits_for_consumption() {
        let syncer = Arc::new(Syncer::new(1, CommTag(0), 2));
        let deposited = Arc::new(AtomicUsize::new(0));
        let producer = {
            let (syncer, deposited) = (Arc::clone(&syncer), Arc::clone(&deposited));
            thread::spawn(move || {
                for v in [1.0, 2.0, 3.0] {
                    syncer.deposit(&encoded(v)).unwrap();
                    deposited.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(deposited.load(Ordering::SeqCst), 1, "slot holds a single row");

        let mut row = [0.0; 2];
        for want in [1.0, 2.0, 3.0] {
            syncer.consume(&mut row).unwrap();
            assert_eq!(row, [want, want]);
        }
        producer.join().unwrap();
        assert_eq!(deposited.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn close_wakes_both_sides() {
        let syncer = Arc::new(Syncer::new(4, CommTag(9), 2));
        let consumer = {
            let syncer = Arc::clone(&syncer);
            thread::spawn(move || syncer.consume(&mut [0.0; 2]))
        };
        thread::sleep(Duration::from_millis(20));
        syncer.close();
        assert_eq!(
            consumer.join().unwrap(),
            Err(CommError::Closed { peer: 4, tag: 9 })
        );
        assert!(syncer.deposit(&encoded(1.0)).is_err());
    }

    #[test]
    fn row_deposited_before_close_is_still_consumed() {
        let syncer = Syncer::new(0, CommTag(0), 2);
        syncer.deposit(&encoded(7.0)).unwrap();
        syncer.close();
        let mut row = [0.0; 2];
        syncer.consume(&mut row).unwrap();
        assert_eq!(row, [7.0, 7.0]);
    }
}

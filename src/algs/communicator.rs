//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* addressed by `(peer rank, tag)`.
//! Channels are reliable and FIFO per `(src, dst, tag)`. A send copies its
//! payload; the in-process backend completes it at once, MPI only once the
//! handle is waited on. Receive handles block in `.wait()` until a message
//! arrives or the port is closed.
//!
//! A port is opened per `(peer, tag)` by whoever uses it and must be closed
//! exactly once. Closing a port stops further sends in both directions, but
//! messages already queued stay readable so that a peer finishing early never
//! swallows the last reply of a collective.

use crate::sor_error::CommError;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

/// Typed message tag. Each protocol owns a base tag and derives sub-tags with
/// [`CommTag::offset`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        CommTag(tag)
    }
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    pub const fn offset(self, k: u16) -> Self {
        CommTag(self.0.wrapping_add(k))
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Result<Option<Bytes>, CommError>;
}

/// A handle that is already complete.
#[derive(Debug)]
pub struct Ready(Result<Option<Bytes>, CommError>);

impl Ready {
    pub fn done() -> Self {
        Ready(Ok(None))
    }
    pub fn with(data: Bytes) -> Self {
        Ready(Ok(Some(data)))
    }
    pub fn failed(err: CommError) -> Self {
        Ready(Err(err))
    }
}

impl Wait for Ready {
    fn wait(self) -> Result<Option<Bytes>, CommError> {
        self.0
    }
}

/// Point-to-point communication interface used by halo exchange and the reducers.
pub trait Communicator: Clone + Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait + Send;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Open the bidirectional port to `peer` on `tag`.
    fn open_port(&self, peer: usize, tag: CommTag) -> Result<(), CommError>;
    /// Release the port to `peer` on `tag`. Callers guarantee one call per open.
    fn close_port(&self, peer: usize, tag: CommTag) -> Result<(), CommError>;

    /// Post a send of a copy of `buf`. Delivery is only guaranteed once the
    /// handle has been waited on.
    fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive for exactly `len` bytes.
    fn irecv(&self, peer: usize, tag: CommTag, len: usize) -> Self::RecvHandle;

    /// Push delivery: run `sink` on a helper thread for every message arriving
    /// from `peer` on `tag`, until the port is closed or `sink` fails.
    fn spawn_delivery<F>(
        &self,
        peer: usize,
        tag: CommTag,
        len: usize,
        mut sink: F,
    ) -> Result<JoinHandle<()>, CommError>
    where
        F: FnMut(&[u8]) -> Result<(), CommError> + Send + 'static,
    {
        let comm = self.clone();
        std::thread::Builder::new()
            .name(format!("rank{}-deliver-{peer}", self.rank()))
            .spawn(move || {
                loop {
                    match comm.irecv(peer, tag, len).wait() {
                        Ok(Some(data)) => {
                            if let Err(e) = sink(&data) {
                                log::debug!("delivery from rank {peer} stopped: {e}");
                                break;
                            }
                        }
                        Ok(None) | Err(CommError::Closed { .. }) => break,
                        Err(e) => {
                            log::error!("delivery from rank {peer} failed: {e}");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| CommError::Backend(e.to_string()))
    }
}

/// Compile-time no-op comm for pure serial runs and unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = Ready;
    type RecvHandle = Ready;

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn open_port(&self, _peer: usize, _tag: CommTag) -> Result<(), CommError> {
        Ok(())
    }
    fn close_port(&self, _peer: usize, _tag: CommTag) -> Result<(), CommError> {
        Ok(())
    }
    fn isend(&self, _peer: usize, _tag: CommTag, _buf: &[u8]) -> Ready {
        Ready::done()
    }
    fn irecv(&self, _peer: usize, _tag: CommTag, _len: usize) -> Ready {
        Ready::done()
    }
}

// --- LocalComm: intra-process / one thread per rank ---
type Key = (usize, usize, u16); // (src, dst, tag)

#[derive(Default)]
struct Mailbox {
    state: Mutex<MailState>,
    ready: Condvar,
}

#[derive(Default)]
struct MailState {
    queue: VecDeque<Bytes>,
    closed: bool,
}

impl Mailbox {
    fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }
}

#[derive(Default)]
struct FabricStats {
    messages: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Shared in-process message fabric. One instance per simulated pool, so
/// concurrent runs (e.g. tests) never see each other's traffic.
pub struct LocalFabric {
    size: usize,
    mailboxes: DashMap<Key, Arc<Mailbox>>,
    stats: FabricStats,
}

impl LocalFabric {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            mailboxes: DashMap::new(),
            stats: FabricStats::default(),
        })
    }

    /// Endpoint for `rank`; cheap to clone.
    pub fn endpoint(self: &Arc<Self>, rank: usize) -> LocalComm {
        LocalComm {
            rank,
            fabric: Arc::clone(self),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }
    /// Number of messages accepted so far, across all ranks.
    pub fn messages_sent(&self) -> usize {
        self.stats.messages.load(Ordering::Acquire)
    }
    pub fn ports_opened(&self) -> usize {
        self.stats.opened.load(Ordering::Acquire)
    }
    pub fn ports_closed(&self) -> usize {
        self.stats.closed.load(Ordering::Acquire)
    }

    fn mailbox(&self, key: Key) -> Arc<Mailbox> {
        // Clone out of the map so no shard lock is held while blocking.
        self.mailboxes.entry(key).or_default().value().clone()
    }
}

impl fmt::Debug for LocalFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalFabric")
            .field("size", &self.size)
            .field("mailboxes", &self.mailboxes.len())
            .field("messages", &self.messages_sent())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct LocalComm {
    rank: usize,
    fabric: Arc<LocalFabric>,
}

impl LocalComm {
    pub fn fabric(&self) -> &Arc<LocalFabric> {
        &self.fabric
    }

    fn check_peer(&self, peer: usize) -> Result<(), CommError> {
        if peer >= self.fabric.size || peer == self.rank {
            return Err(CommError::Backend(format!(
                "rank {} cannot address peer {peer} in a pool of {}",
                self.rank, self.fabric.size
            )));
        }
        Ok(())
    }
}

/// Pending receive on a [`LocalComm`] mailbox.
pub struct LocalRecv {
    mailbox: Result<Arc<Mailbox>, CommError>,
    peer: usize,
    tag: CommTag,
    len: usize,
}

impl Wait for LocalRecv {
    fn wait(self) -> Result<Option<Bytes>, CommError> {
        let mailbox = self.mailbox?;
        let mut st = mailbox.state.lock();
        loop {
            if let Some(data) = st.queue.pop_front() {
                if data.len() != self.len {
                    return Err(CommError::LengthMismatch {
                        expected: self.len,
                        got: data.len(),
                    });
                }
                return Ok(Some(data));
            }
            if st.closed {
                return Err(CommError::Closed {
                    peer: self.peer,
                    tag: self.tag.as_u16(),
                });
            }
            mailbox.ready.wait(&mut st);
        }
    }
}

impl Communicator for LocalComm {
    type SendHandle = Ready;
    type RecvHandle = LocalRecv;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.fabric.size
    }

    fn open_port(&self, peer: usize, tag: CommTag) -> Result<(), CommError> {
        self.check_peer(peer)?;
        let _ = self.fabric.mailbox((peer, self.rank, tag.as_u16()));
        self.fabric.stats.opened.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn close_port(&self, peer: usize, tag: CommTag) -> Result<(), CommError> {
        self.check_peer(peer)?;
        self.fabric.mailbox((self.rank, peer, tag.as_u16())).close();
        self.fabric.mailbox((peer, self.rank, tag.as_u16())).close();
        self.fabric.stats.closed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> Ready {
        if let Err(e) = self.check_peer(peer) {
            return Ready::failed(e);
        }
        let mailbox = self.fabric.mailbox((self.rank, peer, tag.as_u16()));
        {
            let mut st = mailbox.state.lock();
            if st.closed {
                return Ready::failed(CommError::Closed {
                    peer,
                    tag: tag.as_u16(),
                });
            }
            st.queue.push_back(Bytes::copy_from_slice(buf));
        }
        mailbox.ready.notify_all();
        self.fabric.stats.messages.fetch_add(1, Ordering::AcqRel);
        Ready::done()
    }

    fn irecv(&self, peer: usize, tag: CommTag, len: usize) -> LocalRecv {
        LocalRecv {
            mailbox: self
                .check_peer(peer)
                .map(|_| self.fabric.mailbox((peer, self.rank, tag.as_u16()))),
            peer,
            tag,
            len,
        }
    }
}

static_assertions::assert_impl_all!(LocalComm: Send, Sync, Clone);
static_assertions::assert_impl_all!(LocalRecv: Send);

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::Threading;
    use mpi::environment::Universe;
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    struct MpiInner {
        // Dropping the universe finalizes MPI; keep it alive as long as any clone.
        _universe: Universe,
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    // SAFETY: MPI is initialized with `Threading::Multiple` (checked in
    // `MpiComm::new`), so the communicator handle may be used from any thread.
    unsafe impl Send for MpiInner {}
    unsafe impl Sync for MpiInner {}

    /// MPI transport. Sends are nonblocking, receives block. Ports are implicit
    /// in MPI, so open/close only validate the peer.
    #[derive(Clone)]
    pub struct MpiComm {
        inner: Arc<MpiInner>,
    }

    impl MpiComm {
        pub fn new() -> Result<Self, CommError> {
            let (universe, level) = mpi::initialize_with_threading(Threading::Multiple)
                .ok_or_else(|| CommError::Backend("MPI already initialized".into()))?;
            if level != Threading::Multiple {
                return Err(CommError::Backend(format!(
                    "MPI provides {level:?}, need Multiple"
                )));
            }
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Ok(Self {
                inner: Arc::new(MpiInner {
                    _universe: universe,
                    world,
                    rank,
                    size,
                }),
            })
        }

        fn check_peer(&self, peer: usize) -> Result<(), CommError> {
            if peer >= self.inner.size {
                return Err(CommError::Backend(format!("rank {peer} out of range")));
            }
            Ok(())
        }
    }

    /// A posted `MPI_Isend` and the copy of the payload it reads from.
    struct InFlight {
        request: Option<Request<'static, [u8]>>,
        buf: *mut [u8],
    }

    impl InFlight {
        fn complete(&mut self) {
            if let Some(request) = self.request.take() {
                request.wait();
            }
        }
    }

    impl Drop for InFlight {
        fn drop(&mut self) {
            // An abandoned send still has to finish before its buffer goes.
            self.complete();
            // SAFETY: `buf` came from `Box::into_raw` and the request reading it
            // has completed.
            drop(unsafe { Box::from_raw(self.buf) });
        }
    }

    // SAFETY: same threading argument as `MpiInner`; `buf` is owned.
    unsafe impl Send for InFlight {}

    /// Nonblocking send handle; the send completes in [`Wait::wait`].
    pub struct MpiSend(Result<InFlight, CommError>);

    impl Wait for MpiSend {
        fn wait(self) -> Result<Option<Bytes>, CommError> {
            let mut in_flight = self.0?;
            in_flight.complete();
            Ok(None)
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSend;
        type RecvHandle = Ready;

        fn rank(&self) -> usize {
            self.inner.rank
        }
        fn size(&self) -> usize {
            self.inner.size
        }
        fn open_port(&self, peer: usize, _tag: CommTag) -> Result<(), CommError> {
            self.check_peer(peer)
        }
        fn close_port(&self, peer: usize, _tag: CommTag) -> Result<(), CommError> {
            self.check_peer(peer)
        }

        fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> MpiSend {
            if let Err(e) = self.check_peer(peer) {
                return MpiSend(Err(e));
            }
            let buf = Box::into_raw(buf.to_vec().into_boxed_slice());
            // SAFETY: `buf` is only freed by `InFlight::drop`, after the request
            // has completed.
            let data: &'static [u8] = unsafe { &*buf };
            let request = self.inner.world.process_at_rank(peer as i32).immediate_send_with_tag(
                StaticScope,
                data,
                i32::from(tag.as_u16()),
            );
            MpiSend(Ok(InFlight {
                request: Some(request),
                buf,
            }))
        }

        fn irecv(&self, peer: usize, tag: CommTag, len: usize) -> Ready {
            if let Err(e) = self.check_peer(peer) {
                return Ready::failed(e);
            }
            let mut buf = vec![0u8; len];
            let status = self
                .inner
                .world
                .process_at_rank(peer as i32)
                .receive_into_with_tag(&mut buf[..], i32::from(tag.as_u16()));
            let got = status.count(u8::equivalent_datatype()) as usize;
            if got != len {
                return Ready::failed(CommError::LengthMismatch { expected: len, got });
            }
            Ready::with(Bytes::from(buf))
        }

        fn spawn_delivery<F>(
            &self,
            _peer: usize,
            _tag: CommTag,
            _len: usize,
            _sink: F,
        ) -> Result<JoinHandle<()>, CommError>
        where
            F: FnMut(&[u8]) -> Result<(), CommError> + Send + 'static,
        {
            // A blocked MPI receive cannot be woken by closing a port.
            Err(CommError::Unsupported("push delivery over MPI"))
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    const TAG: CommTag = CommTag(0x1000);

    #[test]
    fn local_roundtrip_two_ranks() {
        let fabric = LocalFabric::new(2);
        let c0 = fabric.endpoint(0);
        let c1 = fabric.endpoint(1);

        let recv = c1.irecv(0, TAG, 4);
        c0.isend(1, TAG, &[1, 2, 3, 4]).wait().unwrap();

        let data = recv.wait().unwrap().expect("Expected data from rank 0");
        assert_eq!(&data[..], &[1, 2, 3, 4]);
        assert_eq!(fabric.messages_sent(), 1);
    }

    #[test]
    fn fifo_order_per_tag() {
        let fabric = LocalFabric::new(2);
        let (c0, c1) = (fabric.endpoint(0), fabric.endpoint(1));
        for i in 0..10u8 {
            c0.isend(1, TAG, &[i]).wait().unwrap();
        }
        let out: Vec<u8> = (0..10)
            .map(|_| c1.irecv(0, TAG, 1).wait().unwrap().unwrap()[0])
            .collect();
        assert_eq!(out, (0u8..10).collect::<Vec<_>>());
    }

    #[test]
    fn tags_are_isolated() {
        let fabric = LocalFabric::new(2);
        let (c0, c1) = (fabric.endpoint(0), fabric.endpoint(1));
        c0.isend(1, TAG.offset(1), &[2]).wait().unwrap();
        c0.isend(1, TAG, &[1]).wait().unwrap();
        assert_eq!(c1.irecv(0, TAG, 1).wait().unwrap().unwrap()[0], 1);
        assert_eq!(c1.irecv(0, TAG.offset(1), 1).wait().unwrap().unwrap()[0], 2);
    }

    #[test]
    fn length_mismatch_is_reported() {
        let fabric = LocalFabric::new(2);
        let (c0, c1) = (fabric.endpoint(0), fabric.endpoint(1));
        c0.isend(1, TAG, &[1, 2, 3]).wait().unwrap();
        let err = c1.irecv(0, TAG, 8).wait().unwrap_err();
        assert_eq!(err, CommError::LengthMismatch { expected: 8, got: 3 });
    }

    #[test]
    fn close_drains_queue_then_fails() {
        let fabric = LocalFabric::new(2);
        let (c0, c1) = (fabric.endpoint(0), fabric.endpoint(1));
        c0.open_port(1, TAG).unwrap();
        c1.open_port(0, TAG).unwrap();
        c0.isend(1, TAG, &[9]).wait().unwrap();
        c0.close_port(1, TAG).unwrap();

        assert_eq!(c1.irecv(0, TAG, 1).wait().unwrap().unwrap()[0], 9);
        assert!(matches!(
            c1.irecv(0, TAG, 1).wait(),
            Err(CommError::Closed { peer: 0, .. })
        ));
        assert!(c0.isend(1, TAG, &[1]).wait().is_err());
        c1.close_port(0, TAG).unwrap();
        assert_eq!(fabric.ports_opened(), 2);
        assert_eq!(fabric.ports_closed(), 2);
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let fabric = LocalFabric::new(2);
        let (c0, c1) = (fabric.endpoint(0), fabric.endpoint(1));
        let waiter = std::thread::spawn(move || c1.irecv(0, TAG, 1).wait());
        std::thread::sleep(std::time::Duration::from_millis(20));
        c0.close_port(1, TAG).unwrap();
        assert!(matches!(waiter.join().unwrap(), Err(CommError::Closed { .. })));
    }

    #[test]
    fn push_delivery_runs_until_close() {
        let fabric = LocalFabric::new(2);
        let (c0, c1) = (fabric.endpoint(0), fabric.endpoint(1));
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = c1
            .spawn_delivery(0, TAG, 2, move |data| {
                tx.send(data.to_vec())
                    .map_err(|e| CommError::Backend(e.to_string()))
            })
            .unwrap();
        c0.isend(1, TAG, &[1, 2]).wait().unwrap();
        c0.isend(1, TAG, &[3, 4]).wait().unwrap();
        assert_eq!(rx.recv().unwrap(), vec![1, 2]);
        assert_eq!(rx.recv().unwrap(), vec![3, 4]);
        c1.close_port(0, TAG).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn self_and_out_of_range_peers_are_rejected() {
        let fabric = LocalFabric::new(2);
        let c0 = fabric.endpoint(0);
        assert!(c0.isend(0, TAG, &[1]).wait().is_err());
        assert!(c0.irecv(5, TAG, 1).wait().is_err());
    }

    #[test]
    fn no_comm_is_nop() {
        let comm = NoComm;
        assert_eq!((comm.rank(), comm.size()), (0, 1));
        assert!(comm.irecv(0, TAG, 8).wait().unwrap().is_none());
        assert!(comm.isend(0, TAG, &[]).wait().unwrap().is_none());
    }
}

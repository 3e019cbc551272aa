//! Cross-thread "mark this connection for flush" / "enqueue this outbound
//! packet" messaging, modeled as mailboxes: the command executor posts
//! messages to a per-I/O-thread handle rather than reaching into another
//! thread's connection list directly.

use std::sync::{Arc, Mutex};

use crate::codec::Codec;
use crate::conn_id::ConnId;
use crate::io_thread::IoThreadInner;
use crate::packet::Packet;

/// The two operations a mailbox needs against a thread's locked state,
/// type-erased over the thread's codec. [`Dispatch`](crate::executor::Dispatch)
/// and [`CommandExecutor`](crate::executor::CommandExecutor) never know
/// which codec a given I/O thread runs, so `IoMailbox` can't carry that
/// type parameter either — this is the seam that keeps it out.
trait ConnSink: Send + Sync {
    fn enqueue_outbound(&self, conn: ConnId, packet: Packet);
    fn mark_for_io(&self, conn: ConnId);
}

impl<C: Codec> ConnSink for Mutex<IoThreadInner<C>> {
    fn enqueue_outbound(&self, conn: ConnId, packet: Packet) {
        self.lock().unwrap().enqueue_outbound_and_mark(conn, packet);
    }

    fn mark_for_io(&self, conn: ConnId) {
        self.lock().unwrap().mark_for_io(conn);
    }
}

/// A cheaply-cloneable handle to one [`IoThread`](crate::io_thread::IoThread)'s
/// shared state, given to the processing thread (or, in single-thread
/// mode, to the one I/O thread's own executor call) so it can enqueue
/// outbound work on any connection that thread owns.
#[derive(Clone)]
pub struct IoMailbox {
    inner: Arc<dyn ConnSink>,
}

impl IoMailbox {
    pub(crate) fn new<C: Codec + Send + 'static>(inner: Arc<Mutex<IoThreadInner<C>>>) -> Self {
        IoMailbox { inner }
    }

    /// Appends `packet` to `conn`'s outbound queue and marks `conn` as
    /// needing I/O attention (enqueues it on the owning thread's
    /// `io_list`, deduplicated). A no-op if `conn` was already released.
    pub fn enqueue_outbound(&self, conn: ConnId, packet: Packet) {
        self.inner.enqueue_outbound(conn, packet);
    }

    /// Marks `conn` as needing I/O attention without enqueueing a packet
    /// (e.g. after releasing a `DEAD` connection's registrations, to move
    /// it into `FREE`).
    pub fn mark_for_io(&self, conn: ConnId) {
        self.inner.mark_for_io(conn);
    }
}

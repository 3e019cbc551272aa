use std::collections::VecDeque;
use std::fmt;

use crate::codec::Codec;
use crate::conn_id::ConnId;
use crate::error::Status;
use crate::packet::Packet;
use crate::transport::Transport;
use mio::Interest;

/// Per-connection status bits: whether the peer is gone, whether the
/// processing thread is done releasing its registrations, and whether a
/// wake-up packet is already queued.
///
/// Modeled on `Interests` from this crate's `mio` lineage: a transparent
/// bitmask with `const` bit values and `insert`/`remove`/`contains`
/// methods, rather than pulling in a bitflags dependency for three bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct ConnFlags(u8);

impl ConnFlags {
    /// Peer closed, or the protocol hit a fatal error. Set by the owning
    /// I/O thread; the processing thread must release this connection's
    /// worker/client registrations before it becomes `FREE`.
    pub const DEAD: ConnFlags = ConnFlags(0b001);
    /// The processing thread is done with this connection; the next
    /// `io_list` drain on the owning thread releases it.
    pub const FREE: ConnFlags = ConnFlags(0b010);
    /// Exactly one NOOP packet is currently sitting in `outbound_queue`.
    pub const NOOP_QUEUED: ConnFlags = ConnFlags(0b100);

    #[inline]
    pub fn empty() -> Self {
        ConnFlags(0)
    }

    #[inline]
    pub fn contains(self, other: ConnFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: ConnFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: ConnFlags) {
        self.0 &= !other.0;
    }
}

impl fmt::Display for ConnFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(ConnFlags::DEAD) {
            parts.push("DEAD");
        }
        if self.contains(ConnFlags::FREE) {
            parts.push("FREE");
        }
        if self.contains(ConnFlags::NOOP_QUEUED) {
            parts.push("NOOP_QUEUED");
        }
        if parts.is_empty() {
            write!(f, "OPEN")
        } else {
            write!(f, "{}", parts.join("|"))
        }
    }
}

/// Broker-side state for one TCP session with a client or worker.
///
/// See spec §3 for the invariants governing who may touch which field;
/// in this implementation every field here lives behind the owning
/// [`IoThread`](crate::io_thread::IoThread)'s single mutex, so those
/// invariants reduce to "don't reorder past what the lock already
/// serializes" rather than needing field-level synchronization of their
/// own.
pub struct Connection<C: Codec> {
    pub(crate) id: ConnId,
    pub(crate) transport: Box<dyn Transport>,
    /// Owns whatever partial-parse state the codec needs between `decode`
    /// calls. One instance per connection — monomorphized per `C`, so this
    /// costs nothing beyond the codec's own state, unlike a boxed
    /// `dyn Codec` per connection.
    pub(crate) codec: C,
    pub(crate) event_mask: Interest,
    /// Raw bytes read but not yet decoded into a complete packet — "at
    /// most one packet under construction from the byte stream" (spec
    /// §3), represented as the codec's not-yet-complete input rather than
    /// a partially-built `Packet`, since the codec (external collaborator)
    /// is what knows how to tell "complete" from "not yet".
    pub(crate) current_inbound: Vec<u8>,
    /// Fully formed packets waiting to be written, in wire order.
    pub(crate) outbound_queue: VecDeque<Packet>,
    /// Fully formed packets waiting for the processing thread, in command
    /// order. Unused in single-thread mode.
    pub(crate) proc_inbound_queue: VecDeque<Packet>,
    /// The last non-success, non-would-block result observed during I/O or
    /// command execution; sticky until surfaced to the embedder.
    pub(crate) last_ret: Option<Status>,
    pub(crate) flags: ConnFlags,
    /// Dedupe bits: is this handle currently linked into the owning
    /// thread's `io_list` / `proc_list`? Stand in for the "single-producer
    /// intrusive list" invariant from spec §3 now that lists are plain
    /// `VecDeque<ConnId>` rather than intrusive pointers.
    pub(crate) on_io_list: bool,
    pub(crate) on_proc_list: bool,
}

impl<C: Codec + Default> Connection<C> {
    pub(crate) fn new(id: ConnId, transport: Box<dyn Transport>) -> Self {
        Connection {
            id,
            transport,
            codec: C::default(),
            event_mask: Interest::READABLE,
            current_inbound: Vec::new(),
            outbound_queue: VecDeque::new(),
            proc_inbound_queue: VecDeque::new(),
            last_ret: None,
            flags: ConnFlags::empty(),
            on_io_list: false,
            on_proc_list: false,
        }
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.flags.contains(ConnFlags::DEAD)
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.flags.contains(ConnFlags::FREE)
    }

    /// Marks the connection `DEAD`. Idempotent: a connection already dead
    /// stays dead. Called by the owning I/O thread on peer close, a
    /// protocol-fatal transport error, or an admin close.
    pub(crate) fn mark_dead(&mut self) {
        self.flags.insert(ConnFlags::DEAD);
    }

    pub(crate) fn mark_free(&mut self) {
        self.flags.insert(ConnFlags::FREE);
    }

    /// Enqueues `packet` for sending, deduplicating NOOPs per spec §4.6 /
    /// the NOOP_QUEUED invariant: a second NOOP while one is already
    /// queued is silently dropped rather than piling up.
    pub(crate) fn enqueue_outbound(&mut self, packet: Packet) {
        if packet.is_noop() && self.flags.contains(ConnFlags::NOOP_QUEUED) {
            return;
        }
        if packet.is_noop() {
            self.flags.insert(ConnFlags::NOOP_QUEUED);
        }
        self.outbound_queue.push_back(packet);
    }
}

impl<C: Codec> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("outbound_queue_len", &self.outbound_queue.len())
            .field("proc_inbound_queue_len", &self.proc_inbound_queue.len())
            .finish()
    }
}

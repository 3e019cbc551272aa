//! The unit of work handed between the codec, the queues, and the executor.

use crate::pool::Pool;

/// A fully-formed packet: either a payload produced by the codec /
/// executor, or the zero-payload wake-up packet ([`Packet::noop`]).
///
/// Packets are pooled (see [`crate::pool::Pool`]); `reset` is what a pool
/// runs on an object before it is handed back out, so acquiring from an
/// empty pool and acquiring a freshly-released one are indistinguishable.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Packet {
    pub payload: Vec<u8>,
    noop: bool,
}

impl Packet {
    pub fn new(payload: Vec<u8>) -> Self {
        Packet {
            payload,
            noop: false,
        }
    }

    /// The zero-payload wake-up packet. At most one may sit in any
    /// connection's outbound queue at a time (see [`crate::connection::ConnFlags::NOOP_QUEUED`]).
    pub fn noop() -> Self {
        Packet {
            payload: Vec::new(),
            noop: true,
        }
    }

    #[inline]
    pub fn is_noop(&self) -> bool {
        self.noop
    }

    pub(crate) fn reset(&mut self) {
        self.payload.clear();
        self.noop = false;
    }
}

/// Per-I/O-thread free list of [`Packet`] objects.
pub type PacketPool = Pool<Packet>;

/// Returns `pkt` to `pool`, clearing it first so the next `acquire` is
/// indistinguishable from a fresh allocation.
pub fn release_packet(pool: &mut PacketPool, mut pkt: Packet) {
    pkt.reset();
    pool.release(pkt);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_packet_is_zeroed_on_reacquire() {
        let mut pool = PacketPool::new(4);
        let mut pkt = pool.acquire();
        pkt.payload.extend_from_slice(b"abc");
        release_packet(&mut pool, pkt);

        let reacquired = pool.acquire();
        assert!(reacquired.payload.is_empty());
        assert!(!reacquired.is_noop());
    }

    #[test]
    fn noop_packet_is_marked() {
        assert!(Packet::noop().is_noop());
        assert!(!Packet::new(vec![1]).is_noop());
    }
}

//! The wire codec is an external collaborator (spec §1, §6): this crate
//! only defines the boundary trait. Framing a byte stream into Gearman-like
//! packets is explicitly a Non-goal of the core.

use crate::packet::Packet;
use std::io;

/// Turns bytes accumulated in [`Connection::current_inbound`](crate::connection::Connection)
/// into complete [`Packet`]s, and packets back into bytes for the wire.
///
/// `decode` takes the partial-packet buffer as `&mut Vec<u8>` and is
/// expected to drain the prefix it consumed (via `buf.drain(..n)` or
/// similar) once a full packet is recognized, leaving only the
/// unconsumed tail for the next call — the same incremental-buffer
/// contract length-prefixed and line-based codecs alike use.
pub trait Codec: Send {
    fn decode(&mut self, buf: &mut Vec<u8>) -> io::Result<Option<Packet>>;

    fn encode(&self, packet: &Packet, out: &mut Vec<u8>);
}

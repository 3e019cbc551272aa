//! The non-blocking byte-stream collaborator this crate consumes but does
//! not own (spec §6). The core only ever sees the [`Transport`] trait; the
//! concrete `mio`-backed implementation behind the `net` feature is one
//! possible embedder binding, not part of the core proper.

use std::io;

/// One connection's non-blocking byte-stream operations, and the interest
/// mask an embedder's poller should watch.
///
/// A `Transport` never blocks: `recv`/`send` return
/// `Err(ErrorKind::WouldBlock)` exactly when the underlying socket would,
/// and the core treats that as [`crate::error::Status::IoWait`], never as
/// a fault (spec §7).
pub trait Transport: Send {
    /// Reads as many bytes as are currently available into `buf`,
    /// appending. Returns the number of bytes read, or
    /// `Err(WouldBlock)`/`Err(UnexpectedEof)` etc. on the boundary
    /// conditions spec §4.3 describes.
    fn recv(&mut self, buf: &mut Vec<u8>) -> io::Result<usize>;

    /// Writes `data`, returning the number of bytes actually accepted.
    /// `flush_hint` is set when `data` is the last packet in the current
    /// flush pass, letting a coalescing transport (e.g. one buffering
    /// writes with `TCP_CORK`/`Nagle`) delay the real syscall until then.
    fn send(&mut self, data: &[u8], flush_hint: bool) -> io::Result<usize>;

    /// Updates which readiness events the embedder's poller should report
    /// for this connection (e.g. drop `WRITABLE` once the outbound queue
    /// drains, per spec §4.2).
    fn set_event_mask(&mut self, mask: mio::Interest) -> io::Result<()>;
}

/// One readiness notification from the embedder's poller for one
/// connection, as described in spec §6 ("Poller: reports per-connection
/// readable/writable masks").
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub id: crate::conn_id::ConnId,
    pub readable: bool,
    pub writable: bool,
}

#[cfg(feature = "net")]
pub use mio_backed::MioTransport;

#[cfg(feature = "net")]
mod mio_backed {
    use super::Transport;
    use std::io::{self, Read, Write};
    use std::net::Shutdown;

    /// A [`Transport`] over a non-blocking `mio::net::TcpStream`.
    ///
    /// This is the crate's reference binding: it demonstrates how an
    /// embedder wires a real socket to the core, in the same spirit as
    /// `mio`'s own `examples/tcp_server.rs` drives a `TcpStream` by hand.
    /// Production embedders may well write their own `Transport` (e.g. one
    /// wrapping TLS) instead of using this one.
    pub struct MioTransport {
        stream: mio::net::TcpStream,
    }

    impl MioTransport {
        pub fn new(stream: mio::net::TcpStream) -> Self {
            MioTransport { stream }
        }

        pub fn inner(&self) -> &mio::net::TcpStream {
            &self.stream
        }

        pub fn inner_mut(&mut self) -> &mut mio::net::TcpStream {
            &mut self.stream
        }
    }

    impl Transport for MioTransport {
        fn recv(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            buf.extend_from_slice(&chunk[..n]);
            Ok(n)
        }

        fn send(&mut self, data: &[u8], flush_hint: bool) -> io::Result<usize> {
            let n = self.stream.write(data)?;
            if flush_hint {
                let _ = self.stream.flush();
            }
            Ok(n)
        }

        fn set_event_mask(&mut self, _mask: mio::Interest) -> io::Result<()> {
            // Re-registration against the embedder's `Poll` happens on the
            // embedder side (it owns the `Registry`); this transport only
            // needs to expose the raw stream for that, via `inner_mut`.
            Ok(())
        }
    }

    impl Drop for MioTransport {
        fn drop(&mut self) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

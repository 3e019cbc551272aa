//! In-memory test doubles for the three external collaborators
//! (transport, codec, command executor), so the integration tests in
//! `scenarios.rs` can drive a `Server` without a real socket or poller.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use brokerd_core::{CommandExecutor, ConnHandle, Dispatch, Packet, Status};

/// A transport backed by in-memory byte queues instead of a socket.
/// `inbound` is what the "peer" has sent but the connection hasn't read
/// yet; `outbound` accumulates whatever the connection sends, so a test
/// can assert on wire bytes directly.
#[derive(Clone)]
pub struct MemTransport {
    pub inbound: Arc<Mutex<VecDeque<u8>>>,
    pub outbound: Arc<Mutex<Vec<u8>>>,
    /// `Some(n)`: the next `n` sends succeed, then every send after that
    /// returns `WouldBlock`. `None`: sends always succeed. Lets a test
    /// play "the peer became unwritable after accepting the first
    /// packet" without needing a real socket.
    allowed_sends: Arc<Mutex<Option<usize>>>,
}

impl MemTransport {
    pub fn new() -> (Self, Arc<Mutex<VecDeque<u8>>>, Arc<Mutex<Vec<u8>>>) {
        let inbound = Arc::new(Mutex::new(VecDeque::new()));
        let outbound = Arc::new(Mutex::new(Vec::new()));
        (
            MemTransport {
                inbound: inbound.clone(),
                outbound: outbound.clone(),
                allowed_sends: Arc::new(Mutex::new(None)),
            },
            inbound,
            outbound,
        )
    }

    /// After this call, exactly `n` more sends succeed before the
    /// transport starts reporting `WouldBlock`.
    pub fn allow_sends(&self, n: usize) {
        *self.allowed_sends.lock().unwrap() = Some(n);
    }

    /// Sends always succeed again, as if the peer became writable.
    pub fn unblock(&self) {
        *self.allowed_sends.lock().unwrap() = None;
    }
}

impl brokerd_core::Transport for MemTransport {
    fn recv(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().unwrap();
        if inbound.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = inbound.len();
        buf.extend(inbound.drain(..));
        Ok(n)
    }

    fn send(&mut self, data: &[u8], _flush_hint: bool) -> io::Result<usize> {
        let mut allowed = self.allowed_sends.lock().unwrap();
        if let Some(remaining) = allowed.as_mut() {
            if *remaining == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            *remaining -= 1;
        }
        self.outbound.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn set_event_mask(&mut self, _mask: mio::Interest) -> io::Result<()> {
        Ok(())
    }
}

/// Line-delimited framing: a packet is everything up to and including a
/// `\n`. Simple enough to keep the scenarios focused on the core's
/// threading and queueing behavior rather than parsing.
#[derive(Default)]
pub struct LineCodec;

impl brokerd_core::Codec for LineCodec {
    fn decode(&mut self, buf: &mut Vec<u8>) -> io::Result<Option<Packet>> {
        match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                Ok(Some(Packet::new(line)))
            }
            None => Ok(None),
        }
    }

    fn encode(&self, packet: &Packet, out: &mut Vec<u8>) {
        out.extend_from_slice(&packet.payload);
    }
}

/// Echoes every packet back to its originating connection, recording each
/// one it was invoked with so tests can assert on executed commands.
pub struct EchoExecutor {
    pub seen: Mutex<Vec<Vec<u8>>>,
}

impl EchoExecutor {
    pub fn new() -> Self {
        EchoExecutor {
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl CommandExecutor for EchoExecutor {
    fn run_command(&self, dispatch: &Dispatch<'_>, conn: ConnHandle, packet: &Packet) -> Status {
        self.seen.lock().unwrap().push(packet.payload.clone());
        dispatch.reply(conn, Packet::new(packet.payload.clone()));
        Status::Ok
    }

    fn on_connection_dead(&self, _dispatch: &Dispatch<'_>, _conn: ConnHandle) {}
}

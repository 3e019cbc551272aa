//! The command executor is an external collaborator: it interprets a
//! decoded packet against the global job/worker/client tables. This crate
//! only defines the boundary trait and the [`Dispatch`] context an
//! executor uses to reach connections — including ones on a different I/O
//! thread than the one the packet arrived on.

use crate::conn_id::ConnId;
use crate::error::Status;
use crate::mailbox::IoMailbox;
use crate::packet::Packet;

/// Identifies a connection across the whole server: which I/O thread owns
/// it, plus its handle within that thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle {
    pub thread: usize,
    pub conn: ConnId,
}

/// Everything a [`CommandExecutor`] needs to address connections other
/// than the one it was invoked for.
///
/// Built fresh for each `run_command`/`on_connection_dead` call from the
/// server's full set of per-thread mailboxes plus the originating
/// connection, so command handlers that reply to their own connection and
/// ones that wake up an unrelated worker connection use the exact same
/// API.
pub struct Dispatch<'a> {
    mailboxes: &'a [IoMailbox],
    origin: ConnHandle,
}

impl<'a> Dispatch<'a> {
    pub(crate) fn new(mailboxes: &'a [IoMailbox], origin: ConnHandle) -> Self {
        Dispatch { mailboxes, origin }
    }

    /// The connection the current command arrived on.
    pub fn origin(&self) -> ConnHandle {
        self.origin
    }

    /// Enqueues `packet` on `target`'s outbound queue and marks it for
    /// flush on its owning I/O thread, wherever that thread is.
    pub fn reply(&self, target: ConnHandle, packet: Packet) {
        if let Some(mailbox) = self.mailboxes.get(target.thread) {
            mailbox.enqueue_outbound(target.conn, packet);
        }
    }

    /// Marks `target` as needing I/O attention without sending it a
    /// packet (used after releasing a `DEAD` connection's registrations).
    pub fn mark_for_io(&self, target: ConnHandle) {
        if let Some(mailbox) = self.mailboxes.get(target.thread) {
            mailbox.mark_for_io(target.conn);
        }
    }
}

/// Executes decoded packets against the broker's shared job/worker/client
/// state. Implemented by the embedder; this crate ships only a test
/// double (`tests/support.rs`).
pub trait CommandExecutor: Send + Sync {
    /// Runs one packet's command. May call [`Dispatch::reply`] any number
    /// of times, on any connection. The returned `Status` becomes the
    /// connection's `last_ret`.
    ///
    /// Takes `packet` by reference, not by value: the calling thread (the
    /// I/O thread in single-thread mode, the processing thread in
    /// multi-thread mode) owns the packet's allocation and returns it to
    /// its pool once this call returns.
    fn run_command(&self, dispatch: &Dispatch<'_>, conn: ConnHandle, packet: &Packet) -> Status;

    /// Called once per connection, when it has been observed `DEAD`, to
    /// release its worker/client registrations before it can move to
    /// `FREE`. In multi-thread mode this runs on the processing thread
    /// during its `proc_list` drain; in single-thread mode there is no
    /// processing thread, so the owning I/O thread calls this inline,
    /// synchronously, from within `kill()` instead. Either way the
    /// embedder sees exactly one call per dead connection — implementors
    /// must not assume this is skipped in single-thread mode.
    fn on_connection_dead(&self, dispatch: &Dispatch<'_>, conn: ConnHandle);
}

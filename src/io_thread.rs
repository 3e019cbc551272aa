//! The I/O thread: owns a slab of connections, drains its own `io_list`,
//! and services whatever the embedder's poller says is ready. Reads and
//! writes follow the usual non-blocking shape — loop until `WouldBlock`,
//! re-register on only the interest still needed — generalized from one
//! hardcoded protocol to the `Codec` / `CommandExecutor` boundary traits,
//! with connections stored in an arena (`Slab`) rather than linked
//! intrusively.

use std::io;
use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};

use crate::codec::Codec;
use crate::conn_id::ConnId;
use crate::connection::{ConnFlags, Connection};
use crate::error::{classify_io_error, IoOutcome, Status};
use crate::executor::{CommandExecutor, ConnHandle, Dispatch};
use crate::mailbox::IoMailbox;
use crate::packet::{release_packet, Packet, PacketPool};
use crate::pool::Slab;
use crate::transport::{ReadyEvent, Transport};

use std::collections::VecDeque;

/// Whether a server runs its processing work inline on the I/O thread or
/// hands it off to a dedicated processing thread. Both modes share the
/// same dispatch code; this only switches the one point where a decoded
/// packet either runs inline or gets queued and signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Single,
    Multi,
}

/// Everything about an I/O thread that needs to be reachable from another
/// thread, behind one mutex rather than several per-field locks — see
/// `DESIGN.md` for why that's the right tradeoff here.
pub(crate) struct IoThreadInner<C: Codec> {
    connections: Slab<Connection<C>>,
    io_list: VecDeque<ConnId>,
    proc_list: VecDeque<ConnId>,
    pub(crate) packet_pool: PacketPool,
    conn_cap: usize,
}

impl<C: Codec + Default> IoThreadInner<C> {
    pub(crate) fn new(conn_cap: usize, packet_cap: usize) -> Self {
        IoThreadInner {
            connections: Slab::with_capacity(conn_cap.min(1024)),
            io_list: VecDeque::new(),
            proc_list: VecDeque::new(),
            packet_pool: PacketPool::new(packet_cap),
            conn_cap,
        }
    }

    /// Links `conn` into `io_list` unless it's already there, using the
    /// `on_io_list` bit to dedupe.
    pub(crate) fn mark_for_io(&mut self, conn: ConnId) {
        if let Some(c) = self.connections.get_mut(conn.slot()) {
            if !c.on_io_list {
                c.on_io_list = true;
                self.io_list.push_back(conn);
            }
        }
    }

    fn mark_for_proc(&mut self, conn: ConnId) {
        if let Some(c) = self.connections.get_mut(conn.slot()) {
            if !c.on_proc_list {
                c.on_proc_list = true;
                self.proc_list.push_back(conn);
            }
        }
    }

    /// Called from another thread via [`IoMailbox`]: queue `packet` and
    /// mark `conn` for flush in one locked step, so a reader never
    /// observes the packet enqueued without the mark (or vice versa).
    pub(crate) fn enqueue_outbound_and_mark(&mut self, conn: ConnId, packet: Packet) {
        if let Some(c) = self.connections.get_mut(conn.slot()) {
            c.enqueue_outbound(packet);
        } else {
            return;
        }
        self.mark_for_io(conn);
    }

    pub(crate) fn mark_for_io_external(&mut self, conn: ConnId) {
        self.mark_for_io(conn);
    }
}

/// One decoded step out of the read loop's inner decode attempt: either a
/// complete packet, "no complete packet yet", a decode error, or "the
/// connection is already gone" (raced with a release from another pass).
enum Decoded {
    Packet(Packet),
    Incomplete,
    Err(io::Error),
    Gone,
}

/// One outcome of a single flush attempt against the head of the outbound
/// queue, reported out of the locked section so the caller can decide
/// whether to keep looping, stop, or call [`IoThread::kill`] — which must
/// run with no lock held (see module docs on reentrancy).
enum FlushStep {
    Gone,
    Wait,
    Empty,
    SentContinue,
    ShortWrite,
    Transport(io::Error),
}

/// One I/O thread's view of the server: its own connection slab plus
/// enough shared state to dispatch to other threads and to notice
/// shutdown.
///
/// Every method below takes the thread's lock for the shortest span that
/// touches `IoThreadInner` and never holds it across a call into
/// [`CommandExecutor`]. That matters because [`Dispatch::reply`] /
/// [`Dispatch::mark_for_io`] always go through this same thread's
/// [`IoMailbox`] — including when a command replies to the very
/// connection it was invoked for, the common case. `std::sync::Mutex` is
/// not reentrant, so holding the lock across an executor call that replies
/// to a connection on this thread would deadlock the thread against
/// itself.
pub struct IoThread<C: Codec + Default + Send + 'static> {
    pub(crate) index: usize,
    pub(crate) inner: Arc<Mutex<IoThreadInner<C>>>,
    mode: Mode,
    executor: Arc<dyn CommandExecutor>,
    mailboxes: Arc<Vec<IoMailbox>>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    shutdown_graceful: Arc<std::sync::atomic::AtomicBool>,
    /// Shared with [`crate::server::JobCounter`]: `run()` reads this
    /// directly every pass so graceful shutdown's `SHUTDOWN_GRACEFUL` →
    /// `SHUTDOWN` promotion happens on the next `run()` call, with no
    /// separate polling method for the embedder to remember to invoke.
    job_count: Arc<std::sync::atomic::AtomicUsize>,
    proc_signal: Option<Arc<crate::proc_thread::ProcSignal>>,
}

impl<C: Codec + Default + Send + 'static> IoThread<C> {
    /// Builds an `IoThread` with a fresh, private connection slab. Used
    /// directly by tests; `Server` instead uses [`Self::from_inner`] so it
    /// can hand every thread the same shared mailbox list up front.
    #[cfg(test)]
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        index: usize,
        mode: Mode,
        conn_cap: usize,
        packet_cap: usize,
        executor: Arc<dyn CommandExecutor>,
        mailboxes: Arc<Vec<IoMailbox>>,
        shutdown: Arc<std::sync::atomic::AtomicBool>,
        shutdown_graceful: Arc<std::sync::atomic::AtomicBool>,
        job_count: Arc<std::sync::atomic::AtomicUsize>,
        proc_signal: Option<Arc<crate::proc_thread::ProcSignal>>,
    ) -> Self {
        Self::from_inner(
            index,
            mode,
            Arc::new(Mutex::new(IoThreadInner::new(conn_cap, packet_cap))),
            executor,
            mailboxes,
            shutdown,
            shutdown_graceful,
            job_count,
            proc_signal,
        )
    }

    /// Builds an `IoThread` around an already-shared connection slab.
    /// `Server::new` uses this: it first builds every thread's
    /// `IoThreadInner` and the mailbox list over all of them, then wraps
    /// each in an `IoThread` pointing at the matching slab — so every
    /// thread's `Dispatch` can reach every other thread from its very
    /// first `run()` call.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_inner(
        index: usize,
        mode: Mode,
        inner: Arc<Mutex<IoThreadInner<C>>>,
        executor: Arc<dyn CommandExecutor>,
        mailboxes: Arc<Vec<IoMailbox>>,
        shutdown: Arc<std::sync::atomic::AtomicBool>,
        shutdown_graceful: Arc<std::sync::atomic::AtomicBool>,
        job_count: Arc<std::sync::atomic::AtomicUsize>,
        proc_signal: Option<Arc<crate::proc_thread::ProcSignal>>,
    ) -> Self {
        IoThread {
            index,
            inner,
            mode,
            executor,
            mailboxes,
            shutdown,
            shutdown_graceful,
            job_count,
            proc_signal,
        }
    }

    /// Locks `self.inner` for exactly the span of `f`. Callers must never
    /// call back into `self.executor` (directly or via `execute`/`kill`/
    /// `drain_for_processing`) while inside `f`.
    fn with_inner<R>(&self, f: impl FnOnce(&mut IoThreadInner<C>) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner)
    }

    /// A cloneable handle other threads use to reach this thread's
    /// connections without touching its slab directly.
    pub(crate) fn mailbox(&self) -> IoMailbox {
        IoMailbox::new(self.inner.clone())
    }

    fn handle(&self, conn: ConnId) -> ConnHandle {
        ConnHandle {
            thread: self.index,
            conn,
        }
    }

    /// Registers a newly-accepted connection. Returns
    /// [`Status::AllocationFailure`] rather than growing the slab past the
    /// configured connection cap, the same bounded-pool discipline
    /// `PacketPool` applies to packets.
    pub fn register(&self, transport: Box<dyn Transport>) -> Result<ConnId, Status> {
        self.with_inner(|inner| {
            if inner.connections.len() >= inner.conn_cap {
                return Err(Status::AllocationFailure);
            }
            let id = ConnId(inner.connections.insert(Connection::new(ConnId(0), transport)));
            if let Some(c) = inner.connections.get_mut(id.slot()) {
                c.id = id;
            }
            Ok(id)
        })
    }

    /// Queues `packet` for `conn` and marks it for flush on this thread's
    /// next `run`, exactly as an [`IoMailbox`] does for a foreign thread —
    /// the local-thread equivalent, for an embedder that wants to push
    /// data to a connection it just accepted without round-tripping
    /// through a `CommandExecutor`. A no-op if `conn` isn't registered.
    pub fn enqueue_outbound(&self, conn: ConnId, packet: Packet) {
        self.with_inner(|inner| inner.enqueue_outbound_and_mark(conn, packet));
    }

    /// Whether `conn` is still a live slot in this thread's connection
    /// arena (`false` once it has been released).
    pub fn is_registered(&self, conn: ConnId) -> bool {
        self.with_inner(|inner| inner.connections.get(conn.slot()).is_some())
    }

    /// Number of packets currently queued for `conn`'s next flush.
    pub fn pending_outbound(&self, conn: ConnId) -> usize {
        self.with_inner(|inner| {
            inner
                .connections
                .get(conn.slot())
                .map(|c| c.outbound_queue.len())
                .unwrap_or(0)
        })
    }

    /// Runs one pass: drains cross-thread work (multi-thread mode only),
    /// services every event the embedder's poller reported ready, drains
    /// cross-thread work again (single-thread mode only, since there is no
    /// separate processing thread to have done it already), then reports
    /// shutdown. The ordering matters: the processing thread relies on it.
    pub fn run(&self, ready: &mut dyn Iterator<Item = ReadyEvent>) -> (Option<ConnId>, Status) {
        let mut blocked = false;

        if self.mode == Mode::Multi {
            if let Some(result) = self.drain_io_list(&mut blocked) {
                return result;
            }
        }

        for ev in ready {
            if let Some(result) = self.service_ready(ev, &mut blocked) {
                return result;
            }
        }

        if self.mode == Mode::Single {
            if let Some(result) = self.drain_io_list(&mut blocked) {
                return result;
            }
        }

        let status = self.shutdown_status();
        if status != Status::Ok {
            return (None, status);
        }
        // A flush left backlog behind (as opposed to a read simply
        // running out of bytes, which is routine and not "blocked" in
        // this sense) — surface it so the driver knows this pass made no
        // write progress.
        (None, if blocked { Status::IoWait } else { Status::Ok })
    }

    /// Spec §4.1 step 4 / §8: checked fresh on every `run()` pass, not
    /// cached or left to a separate polling call — `SHUTDOWN_GRACEFUL`
    /// promotes to `SHUTDOWN` the instant `job_count` reaches zero, on
    /// whichever thread happens to call `run()` next.
    fn shutdown_status(&self) -> Status {
        use std::sync::atomic::Ordering::SeqCst;
        if self.shutdown.load(SeqCst) {
            Status::Shutdown
        } else if self.shutdown_graceful.load(SeqCst) {
            if self.job_count.load(SeqCst) == 0 {
                Status::Shutdown
            } else {
                Status::ShutdownGraceful
            }
        } else {
            Status::Ok
        }
    }

    /// Pops every connection off `io_list`, releasing `FREE` ones and
    /// flushing the rest. A sticky `last_ret` (set by command execution)
    /// short-circuits the flush attempt and is returned immediately.
    fn drain_io_list(&self, blocked: &mut bool) -> Option<(Option<ConnId>, Status)> {
        loop {
            let popped = self.with_inner(|inner| {
                let id = inner.io_list.pop_front()?;
                let is_free = inner.connections.get_mut(id.slot()).map(|c| {
                    c.on_io_list = false;
                    c.is_free()
                });
                Some((id, is_free))
            });
            let (id, is_free) = match popped {
                None => return None,
                Some((id, None)) => {
                    // Already released by a racing path; nothing to do.
                    let _ = id;
                    continue;
                }
                Some((id, Some(is_free))) => (id, is_free),
            };

            if is_free {
                self.release_connection(id);
                continue;
            }

            let sticky =
                self.with_inner(|inner| inner.connections.get_mut(id.slot()).and_then(|c| c.last_ret.take()));
            if let Some(status) = sticky {
                if status.is_terminal_for_connection() {
                    return Some((Some(id), status));
                }
            }

            match self.flush(id, false) {
                Status::Ok => {}
                Status::IoWait => *blocked = true,
                other => return Some((Some(id), other)),
            }
        }
    }

    /// Reacts to one readiness notification. Read first
    /// (new inbound data may unblock a queued reply next time round),
    /// then flush if the poller says the socket is writable now.
    fn service_ready(&self, ev: ReadyEvent, blocked: &mut bool) -> Option<(Option<ConnId>, Status)> {
        if ev.readable {
            match self.read(ev.id) {
                Status::Ok => {}
                Status::IoWait => *blocked = true,
                other => return Some((Some(ev.id), other)),
            }
        }
        if ev.writable {
            match self.flush(ev.id, true) {
                Status::Ok => {}
                Status::IoWait => *blocked = true,
                other => return Some((Some(ev.id), other)),
            }
        }
        None
    }

    /// Reads until `WouldBlock`, decoding as many complete packets as
    /// the codec recognizes out of the accumulated bytes. In single-thread
    /// mode each decoded packet runs inline; in multi-thread mode it's
    /// queued on `proc_inbound_queue` and the connection is marked for the
    /// processing thread instead.
    ///
    /// Locks only for the `recv`/`decode` steps themselves; command
    /// execution (`execute`, single-thread mode) always runs with no lock
    /// held, since it may call back into this very connection via
    /// [`Dispatch::reply`].
    fn read(&self, id: ConnId) -> Status {
        loop {
            let recv_outcome = self.with_inner(|inner| {
                let conn = inner.connections.get_mut(id.slot())?;
                Some(conn.transport.recv(&mut conn.current_inbound))
            });

            match recv_outcome {
                None => return Status::Ok,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return match classify_io_error(&e) {
                        IoOutcome::Wait => Status::IoWait,
                        IoOutcome::Fatal => {
                            trace!(target: "brokerd_core::io_thread", "conn {id} transport fatal: {e}");
                            self.kill(id);
                            Status::Ok
                        }
                        IoOutcome::Other => {
                            warn!(target: "brokerd_core::io_thread", "conn {id} unexpected read error: {e}");
                            Status::TransportError(e.kind())
                        }
                    };
                }
            }

            loop {
                let decoded = self.with_inner(|inner| {
                    let conn = match inner.connections.get_mut(id.slot()) {
                        Some(c) => c,
                        None => return Decoded::Gone,
                    };
                    match conn.codec.decode(&mut conn.current_inbound) {
                        Ok(Some(packet)) => Decoded::Packet(packet),
                        Ok(None) => Decoded::Incomplete,
                        Err(e) => Decoded::Err(e),
                    }
                });

                let packet = match decoded {
                    Decoded::Gone => return Status::Ok,
                    Decoded::Incomplete => break,
                    Decoded::Err(e) => {
                        warn!(target: "brokerd_core::io_thread", "conn {id} decode error: {e}");
                        self.kill(id);
                        return Status::Ok;
                    }
                    Decoded::Packet(p) => p,
                };

                match self.mode {
                    Mode::Single => match self.execute(id, packet) {
                        Status::Ok | Status::IoWait => {}
                        other => return other,
                    },
                    Mode::Multi => {
                        self.with_inner(|inner| {
                            if let Some(c) = inner.connections.get_mut(id.slot()) {
                                c.proc_inbound_queue.push_back(packet);
                            }
                            inner.mark_for_proc(id);
                        });
                        if let Some(signal) = &self.proc_signal {
                            signal.wake();
                        }
                    }
                }
            }
        }
    }

    /// Runs one decoded packet's command inline (single-thread mode only)
    /// and frees the packet back to this thread's pool once the executor
    /// has read it. Calls `self.executor.run_command` with no lock held
    /// (see struct docs); re-locks only to release the packet and record a
    /// terminal `last_ret`.
    fn execute(&self, id: ConnId, packet: Packet) -> Status {
        let dispatch = Dispatch::new(&self.mailboxes, self.handle(id));
        let status = self.executor.run_command(&dispatch, self.handle(id), &packet);

        self.with_inner(|inner| {
            release_packet(&mut inner.packet_pool, packet);
            if status.is_terminal_for_connection() {
                if let Some(c) = inner.connections.get_mut(id.slot()) {
                    c.last_ret = Some(status);
                }
            }
        });
        status
    }

    /// Writes queued outbound packets until the queue empties or a
    /// send would block. `known_writable` distinguishes a real readiness
    /// event from an `io_list` drain pass with no fresh writability
    /// signal — in the latter case, a connection already waiting on
    /// `WRITABLE` skips the syscall rather than retrying blindly.
    ///
    /// Each attempt runs entirely under one short lock (nothing here calls
    /// the executor); only the short-write / fatal-error branches, which
    /// call `self.kill`, run after the lock is released.
    fn flush(&self, id: ConnId, known_writable: bool) -> Status {
        loop {
            let step = self.with_inner(|inner| {
                let conn = match inner.connections.get_mut(id.slot()) {
                    Some(c) => c,
                    None => return FlushStep::Gone,
                };

                if !known_writable && conn.event_mask.is_writable() {
                    return FlushStep::Wait;
                }

                let packet = match conn.outbound_queue.front() {
                    Some(p) => p,
                    None => {
                        if conn.event_mask.is_writable() {
                            conn.event_mask = mio::Interest::READABLE;
                            let _ = conn.transport.set_event_mask(conn.event_mask);
                        }
                        return FlushStep::Empty;
                    }
                };

                let mut wire = Vec::new();
                conn.codec.encode(packet, &mut wire);
                let flush_hint = conn.outbound_queue.len() == 1;

                match conn.transport.send(&wire, flush_hint) {
                    Ok(n) if n == wire.len() => {
                        let sent = conn.outbound_queue.pop_front().unwrap();
                        if sent.is_noop() {
                            conn.flags.remove(ConnFlags::NOOP_QUEUED);
                        }
                        release_packet(&mut inner.packet_pool, sent);
                        FlushStep::SentContinue
                    }
                    Ok(_) => FlushStep::ShortWrite,
                    Err(e) => match classify_io_error(&e) {
                        IoOutcome::Wait => {
                            conn.event_mask = conn.event_mask.add(mio::Interest::WRITABLE);
                            let _ = conn.transport.set_event_mask(conn.event_mask);
                            FlushStep::Transport(e)
                        }
                        _ => FlushStep::Transport(e),
                    },
                }
            });

            match step {
                FlushStep::Gone => return Status::Ok,
                FlushStep::Wait => return Status::IoWait,
                FlushStep::Empty => return Status::Ok,
                FlushStep::SentContinue => continue,
                FlushStep::ShortWrite => {
                    // A transport that can't accept a whole packet
                    // atomically is a protocol violation for this crate's
                    // framing contract, not a condition to buffer around
                    // — the same stance the teacher's own `tcp_server.rs`
                    // example takes toward a `0`-byte write.
                    warn!(target: "brokerd_core::io_thread", "conn {id} short write");
                    self.kill(id);
                    return Status::Ok;
                }
                FlushStep::Transport(e) => {
                    return match classify_io_error(&e) {
                        IoOutcome::Wait => Status::IoWait,
                        IoOutcome::Fatal => {
                            self.kill(id);
                            Status::Ok
                        }
                        IoOutcome::Other => {
                            warn!(target: "brokerd_core::io_thread", "conn {id} unexpected write error: {e}");
                            Status::TransportError(e.kind())
                        }
                    };
                }
            }
        }
    }

    /// Marks `id` `DEAD` and routes it to wherever its registrations get
    /// released: the processing thread in multi-thread mode, or directly
    /// here in single-thread mode, since there is no processing thread to
    /// hand it to. The `on_connection_dead` callback (single-thread mode)
    /// always runs with no lock held.
    fn kill(&self, id: ConnId) {
        let freshly_dead = self.with_inner(|inner| match inner.connections.get_mut(id.slot()) {
            Some(c) => {
                if c.is_dead() {
                    false
                } else {
                    c.mark_dead();
                    true
                }
            }
            None => false,
        });
        if !freshly_dead {
            return;
        }
        debug!(target: "brokerd_core::io_thread", "conn {id} marked dead");

        match self.mode {
            Mode::Multi => {
                self.with_inner(|inner| inner.mark_for_proc(id));
                if let Some(signal) = &self.proc_signal {
                    signal.wake();
                }
            }
            Mode::Single => {
                let dispatch = Dispatch::new(&self.mailboxes, self.handle(id));
                self.executor.on_connection_dead(&dispatch, self.handle(id));
                self.with_inner(|inner| {
                    if let Some(c) = inner.connections.get_mut(id.slot()) {
                        c.mark_free();
                    }
                    inner.mark_for_io(id);
                });
            }
        }
    }

    /// Tears down a `FREE` connection's slab slot. Called only from
    /// `drain_io_list`, which already removed it from `io_list` before
    /// calling in.
    fn release_connection(&self, id: ConnId) {
        self.with_inner(|inner| {
            if let Some(conn) = inner.connections.remove(id.slot()) {
                for packet in conn.outbound_queue {
                    release_packet(&mut inner.packet_pool, packet);
                }
                for packet in conn.proc_inbound_queue {
                    release_packet(&mut inner.packet_pool, packet);
                }
                debug!(target: "brokerd_core::io_thread", "conn {id} released");
            }
        });
    }

    /// Used by the processing thread to drain this I/O thread's `proc_list`
    /// one connection at a time. Pops and inspects state under a short
    /// lock, then — for a `DEAD` connection or for each queued packet —
    /// calls the executor with no lock held, re-locking only to record the
    /// result. Returns `false` once `proc_list` had nothing to do this
    /// pass.
    pub(crate) fn drain_for_processing(&self) -> bool {
        enum Step {
            Empty,
            Gone,
            Dead(ConnId),
            Work(ConnId),
        }

        let step = self.with_inner(|inner| {
            let id = match inner.proc_list.pop_front() {
                Some(id) => id,
                None => return Step::Empty,
            };
            match inner.connections.get_mut(id.slot()) {
                Some(c) => {
                    c.on_proc_list = false;
                    if c.is_dead() {
                        Step::Dead(id)
                    } else {
                        Step::Work(id)
                    }
                }
                None => Step::Gone,
            }
        });

        match step {
            Step::Empty => false,
            Step::Gone => true,
            Step::Dead(id) => {
                let dispatch = Dispatch::new(&self.mailboxes, self.handle(id));
                self.executor.on_connection_dead(&dispatch, self.handle(id));
                self.with_inner(|inner| {
                    if let Some(c) = inner.connections.get_mut(id.slot()) {
                        c.mark_free();
                    }
                    inner.mark_for_io_external(id);
                });
                true
            }
            Step::Work(id) => {
                loop {
                    let packet = self.with_inner(|inner| {
                        inner
                            .connections
                            .get_mut(id.slot())
                            .and_then(|c| c.proc_inbound_queue.pop_front())
                    });
                    let packet = match packet {
                        Some(p) => p,
                        None => break,
                    };

                    let dispatch = Dispatch::new(&self.mailboxes, self.handle(id));
                    let status = self.executor.run_command(&dispatch, self.handle(id), &packet);

                    let terminal = status.is_terminal_for_connection();
                    self.with_inner(|inner| {
                        release_packet(&mut inner.packet_pool, packet);
                        if terminal {
                            if let Some(c) = inner.connections.get_mut(id.slot()) {
                                c.last_ret = Some(status);
                            }
                            inner.mark_for_io_external(id);
                        }
                    });
                    if terminal {
                        break;
                    }
                }
                true
            }
        }
    }
}

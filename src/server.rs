//! Top-level server: owns the I/O threads, the optional processing
//! thread, and the shutdown/job-count state the embedder drives from
//! outside. Grounded in spec §5 and §9's "same code, different routing"
//! note — `Server` is the thing that decides whether a given deployment
//! runs threaded or not; `IoThread`/`proc_thread` don't know the
//! difference beyond the `Mode` they were built with.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::info;

use crate::codec::Codec;
use crate::error::Status;
use crate::executor::CommandExecutor;
use crate::io_thread::{IoThread, IoThreadInner, Mode};
use crate::mailbox::IoMailbox;
use crate::proc_thread::{self, ProcSignal};

/// Construction-time parameters. A plain struct, not something this crate
/// reads from a file or the environment — wiring config sources is the
/// embedder's job (spec's ambient-stack note: this crate takes config as
/// values, never as a parsing concern of its own).
///
/// There is deliberately no independent `mode` field: spec §5 ties mode to
/// thread count strictly (`thread_count == 1` ⇒ single-thread, no
/// processing thread, no cross-thread queues; `thread_count >= 2` ⇒
/// multi-thread, with the processing thread `Server::new` spins up).
/// `Server` derives [`Mode`] from `io_threads` rather than taking it as a
/// second, independently-settable field that could disagree.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of I/O threads. `1` is the degenerate single-thread
    /// deployment (no processing thread, no cross-thread hand-off); `>= 2`
    /// spins up the dedicated processing thread this config implies.
    pub io_threads: usize,
    /// Upper bound on live connections per I/O thread before `register`
    /// starts returning [`Status::AllocationFailure`].
    pub conn_cap: usize,
    /// Upper bound on packets cached in each I/O thread's [`crate::packet::PacketPool`].
    pub packet_cap: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            io_threads: 1,
            conn_cap: 4096,
            packet_cap: 256,
        }
    }
}

/// Derives [`Mode`] from an I/O thread count per spec §5: exactly one
/// thread is single-thread mode, anything else (including a misconfigured
/// `0`, clamped up to `1` elsewhere) is multi-thread mode.
fn mode_for_thread_count(io_threads: usize) -> Mode {
    if io_threads <= 1 {
        Mode::Single
    } else {
        Mode::Multi
    }
}

/// A shared, thread-safe view of how many jobs are outstanding.
///
/// The core has no idea what a "job" is — that's the embedder's executor
/// and its external job queue (spec §1's stated Non-goal). What the core
/// does own is the counter a graceful shutdown waits on: the embedder
/// calls [`JobCounter::increment`]/[`decrement`] as jobs start and finish,
/// and `Server` watches it to decide when `ShutdownGraceful` becomes
/// `Shutdown`.
#[derive(Clone)]
pub struct JobCounter(Arc<AtomicUsize>);

impl JobCounter {
    fn new() -> Self {
        JobCounter(Arc::new(AtomicUsize::new(0)))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// Saturating: a decrement past zero clamps rather than wrapping,
    /// since an embedder double-counting a finished job is a bug we'd
    /// rather not turn into a permanently-stuck graceful shutdown.
    pub fn decrement(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying atomic, shared with every [`IoThread`]'s
    /// `shutdown_status` check so `run()` sees the current count directly
    /// instead of through a separate polling call.
    fn shared(&self) -> Arc<AtomicUsize> {
        self.0.clone()
    }
}

/// The broker's I/O and dispatch core: a set of I/O threads, each running
/// the embedder's own event loop against [`IoThread::run`], plus (in
/// [`Mode::Multi`]) one processing thread this type owns and joins on
/// drop.
pub struct Server<C: Codec + Default + Send + 'static> {
    io_threads: Arc<Vec<IoThread<C>>>,
    mode: Mode,
    shutdown: Arc<AtomicBool>,
    shutdown_graceful: Arc<AtomicBool>,
    job_count: JobCounter,
    proc_signal: Option<Arc<ProcSignal>>,
    proc_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Codec + Default + Send + 'static> Server<C> {
    /// Derives [`Mode`] from `config.io_threads` (spec §5), builds every
    /// I/O thread's shared state up front (spec §9's mailbox redesign
    /// requires each thread's `Dispatch` to be able to reach every other
    /// thread from the start), then, in [`Mode::Multi`], spawns the
    /// processing thread. Returns [`Status::ThreadError`] if the
    /// processing thread fails to spawn.
    pub fn new(config: ServerConfig, executor: Arc<dyn CommandExecutor>) -> Result<Self, Status> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_graceful = Arc::new(AtomicBool::new(false));
        let job_count = JobCounter::new();
        let job_count_shared = job_count.shared();

        let io_thread_count = config.io_threads.max(1);
        let mode = mode_for_thread_count(io_thread_count);

        let inners: Vec<Arc<Mutex<IoThreadInner<C>>>> = (0..io_thread_count)
            .map(|_| Arc::new(Mutex::new(IoThreadInner::new(config.conn_cap, config.packet_cap))))
            .collect();

        let mailboxes: Arc<Vec<IoMailbox>> = Arc::new(
            inners
                .iter()
                .map(|inner| IoMailbox::new(inner.clone()))
                .collect(),
        );

        let proc_signal = match mode {
            Mode::Multi => Some(Arc::new(ProcSignal::new())),
            Mode::Single => None,
        };

        let io_threads: Vec<IoThread<C>> = inners
            .into_iter()
            .enumerate()
            .map(|(index, inner)| {
                IoThread::from_inner(
                    index,
                    mode,
                    inner,
                    executor.clone(),
                    mailboxes.clone(),
                    shutdown.clone(),
                    shutdown_graceful.clone(),
                    job_count_shared.clone(),
                    proc_signal.clone(),
                )
            })
            .collect();
        let io_threads = Arc::new(io_threads);

        let proc_handle = if let (Mode::Multi, Some(signal)) = (mode, proc_signal.clone()) {
            let threads = io_threads.clone();
            let shutdown_flag = shutdown.clone();
            Some(
                std::thread::Builder::new()
                    .name("brokerd-proc".into())
                    .spawn(move || proc_thread::run(threads, signal, shutdown_flag))
                    .map_err(|_| Status::ThreadError)?,
            )
        } else {
            None
        };

        Ok(Server {
            io_threads,
            mode,
            shutdown,
            shutdown_graceful,
            job_count,
            proc_signal,
            proc_handle: Mutex::new(proc_handle),
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn job_count(&self) -> JobCounter {
        self.job_count.clone()
    }

    /// Returns the `index`-th I/O thread's handle. Embedders drive their
    /// own poller per thread and call `IoThread::run` with whatever
    /// readiness events it reports; `Server` never runs a poll loop
    /// itself (spec §6: the poller is an external collaborator).
    pub fn io_thread(&self, index: usize) -> Option<&IoThread<C>> {
        self.io_threads.get(index)
    }

    pub fn io_thread_count(&self) -> usize {
        self.io_threads.len()
    }

    /// Immediate shutdown: every I/O thread's next `run()` call (once its
    /// current pass finishes) reports [`Status::Shutdown`]. Does not wait
    /// for outstanding jobs.
    pub fn shutdown(&self) {
        info!(target: "brokerd_core::server", "shutdown requested");
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake_proc_thread();
    }

    /// Graceful shutdown: every I/O thread's `run()` reports
    /// [`Status::ShutdownGraceful`] until [`JobCounter::get`] reaches
    /// zero, at which point the very next `run()` call on any thread
    /// reports [`Status::Shutdown`] instead — `IoThread::run` reads
    /// `job_count` directly on every pass (spec §4.1 step 4), so there is
    /// no separate call the embedder must remember to make to promote the
    /// shutdown once jobs drain.
    pub fn shutdown_graceful(&self) {
        info!(target: "brokerd_core::server", "graceful shutdown requested");
        self.shutdown_graceful.store(true, Ordering::SeqCst);
    }

    fn wake_proc_thread(&self) {
        if let Some(signal) = &self.proc_signal {
            signal.wake();
        }
    }
}

impl<C: Codec + Default + Send + 'static> Drop for Server<C> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake_proc_thread();
        if let Some(handle) = self.proc_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ConnHandle, Dispatch};
    use crate::packet::Packet;

    #[derive(Default)]
    struct NoopCodec;
    impl Codec for NoopCodec {
        fn decode(&mut self, _buf: &mut Vec<u8>) -> std::io::Result<Option<Packet>> {
            Ok(None)
        }
        fn encode(&self, _packet: &Packet, _out: &mut Vec<u8>) {}
    }

    struct NullExecutor;
    impl CommandExecutor for NullExecutor {
        fn run_command(&self, _d: &Dispatch<'_>, _c: ConnHandle, _p: &Packet) -> Status {
            Status::Ok
        }
        fn on_connection_dead(&self, _d: &Dispatch<'_>, _c: ConnHandle) {}
    }

    #[test]
    fn single_thread_server_builds_without_proc_thread() {
        let server = Server::<NoopCodec>::new(
            ServerConfig {
                io_threads: 1,
                ..Default::default()
            },
            Arc::new(NullExecutor),
        )
        .unwrap();
        assert_eq!(server.mode(), Mode::Single);
        assert_eq!(server.io_thread_count(), 1);
        assert!(server.proc_handle.lock().unwrap().is_none());
    }

    #[test]
    fn multi_thread_server_spawns_and_joins_proc_thread() {
        let server = Server::<NoopCodec>::new(
            ServerConfig {
                io_threads: 2,
                ..Default::default()
            },
            Arc::new(NullExecutor),
        )
        .unwrap();
        assert_eq!(server.mode(), Mode::Multi);
        assert!(server.proc_handle.lock().unwrap().is_some());
        server.shutdown();
        drop(server);
    }

    #[test]
    fn graceful_shutdown_promotes_once_job_count_hits_zero() {
        let server = Server::<NoopCodec>::new(ServerConfig::default(), Arc::new(NullExecutor)).unwrap();
        let jobs = server.job_count();
        let thread = server.io_thread(0).unwrap();

        jobs.increment();
        server.shutdown_graceful();
        let (_, status) = thread.run(&mut std::iter::empty());
        assert_eq!(status, Status::ShutdownGraceful);

        jobs.decrement();
        let (_, status) = thread.run(&mut std::iter::empty());
        assert_eq!(status, Status::Shutdown);
    }
}

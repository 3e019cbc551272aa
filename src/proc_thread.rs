//! The processing thread: in multi-thread mode, the single consumer of
//! every I/O thread's `proc_list`. Waits on a condvar rather than busy
//! polling, per spec §4.4 — grounded in the same `Mutex`+wait/notify shape
//! this crate's own `sys::unix::waker` and the `Worker::run` loop in
//! `rask`'s worker module both use to park a thread until there's real
//! work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::trace;

use crate::codec::Codec;
use crate::io_thread::IoThread;

/// Wakes the processing thread out of its condvar wait. Cloned into every
/// `IoThread` so any of them can signal new `proc_list` work without
/// reaching into the processing thread's internals.
pub(crate) struct ProcSignal {
    woken: Mutex<bool>,
    condvar: Condvar,
}

impl ProcSignal {
    pub(crate) fn new() -> Self {
        ProcSignal {
            woken: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn wake(&self) {
        let mut woken = self.woken.lock().unwrap();
        *woken = true;
        self.condvar.notify_one();
    }

    /// Blocks until woken or `timeout` elapses, clearing the flag either
    /// way. The timeout is a safety net (spec §9 calls out that a missed
    /// wakeup must not hang the server forever), not the primary wakeup
    /// path.
    fn wait(&self, timeout: Duration) {
        let woken = self.woken.lock().unwrap();
        let (mut woken, _) = self
            .condvar
            .wait_timeout_while(woken, timeout, |w| !*w)
            .unwrap();
        *woken = false;
    }
}

/// Runs until `shutdown` is set and every thread's queues have drained.
/// Each pass round-robins every I/O thread's `drain_for_processing`, which
/// itself locks and releases that thread's mutex one connection at a time
/// rather than holding it for the whole pass — so a slow command on
/// thread 0 doesn't stall I/O thread 1's readers.
pub(crate) fn run<C: Codec + Default + Send + 'static>(
    threads: Arc<Vec<IoThread<C>>>,
    signal: Arc<ProcSignal>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        let mut did_work = false;
        for thread in threads.iter() {
            while thread.drain_for_processing() {
                did_work = true;
            }
        }

        if shutdown.load(Ordering::SeqCst) && !did_work {
            trace!(target: "brokerd_core::proc_thread", "processing thread exiting");
            return;
        }

        if !did_work {
            signal.wait(Duration::from_millis(250));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_then_wait_returns_immediately() {
        let signal = ProcSignal::new();
        signal.wake();
        signal.wait(Duration::from_secs(5));
    }
}

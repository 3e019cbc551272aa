use std::fmt;

/// Outcome of a unit of work handed across the I/O/processing boundary.
///
/// `Status` is how this crate reports "not quite a [`Result`]" conditions:
/// [`Status::IoWait`] is expected and silent, shutdown is a status rather
/// than an error, and an executor error is carried as an opaque code
/// because the core does not know what the embedder's command set means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Forward progress was made (or there was nothing to do).
    Ok,
    /// The operation would have blocked; absorbed by callers, never an error.
    IoWait,
    /// Immediate shutdown: every subsequent `run()` call also returns this.
    Shutdown,
    /// Graceful shutdown in progress; becomes `Shutdown` once `job_count`
    /// reaches zero.
    ShutdownGraceful,
    /// A pool or buffer allocation failed. Fatal to the operation that hit
    /// it, not to the server.
    AllocationFailure,
    /// Starting or joining an OS thread failed. Fatal to server construction.
    ThreadError,
    /// The embedder's `CommandExecutor` rejected a packet. The code is
    /// opaque to the core; only the embedder interprets it.
    Executor(i32),
    /// A transport error that isn't would-block and isn't one of the
    /// peer-gone/protocol-fatal kinds `read`/`flush` absorb into a `DEAD`
    /// transition — surfaced as-is so the embedder can decide what an
    /// unexpected I/O error means for it.
    TransportError(std::io::ErrorKind),
}

impl Status {
    /// True for the two statuses that mean "no error happened, just no
    /// progress" or "shutting down" — i.e. everything except a real fault.
    pub fn is_terminal_for_connection(self) -> bool {
        matches!(
            self,
            Status::AllocationFailure
                | Status::ThreadError
                | Status::Executor(_)
                | Status::TransportError(_)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::IoWait => write!(f, "would block"),
            Status::Shutdown => write!(f, "shutdown"),
            Status::ShutdownGraceful => write!(f, "graceful shutdown"),
            Status::AllocationFailure => write!(f, "allocation failure"),
            Status::ThreadError => write!(f, "thread error"),
            Status::Executor(code) => write!(f, "executor error ({code})"),
            Status::TransportError(kind) => write!(f, "transport error ({kind})"),
        }
    }
}

impl std::error::Error for Status {}

/// Classifies an [`std::io::Error`] from the transport as the three kinds
/// spec §7 distinguishes: transient, peer-gone/protocol-fatal, or something
/// else that should propagate unchanged.
pub(crate) fn classify_io_error(err: &std::io::Error) -> IoOutcome {
    use std::io::ErrorKind::*;
    match err.kind() {
        WouldBlock => IoOutcome::Wait,
        ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof | NotConnected => {
            IoOutcome::Fatal
        }
        _ => IoOutcome::Other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoOutcome {
    Wait,
    Fatal,
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn would_block_classifies_as_wait() {
        let err = io::Error::from(io::ErrorKind::WouldBlock);
        assert_eq!(classify_io_error(&err), IoOutcome::Wait);
    }

    #[test]
    fn reset_classifies_as_fatal() {
        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(classify_io_error(&err), IoOutcome::Fatal);
    }

    #[test]
    fn executor_error_is_terminal() {
        assert!(Status::Executor(7).is_terminal_for_connection());
        assert!(!Status::IoWait.is_terminal_for_connection());
    }
}

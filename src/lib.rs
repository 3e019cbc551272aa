//! I/O and dispatch thread core for a distributed job-queue broker.
//!
//! This crate owns the non-blocking I/O loop, the per-connection state
//! machine, and (in multi-thread deployments) the hand-off between I/O
//! threads and a dedicated processing thread. It does not own the wire
//! protocol, the poller, or the command set a broker runs against its
//! workers and clients — those are the [`transport::Transport`],
//! [`codec::Codec`], and [`executor::CommandExecutor`] traits an embedder
//! implements.
//!
//! Start with [`server::Server`]: it builds the I/O threads and, in
//! [`io_thread::Mode::Multi`], the processing thread, from a
//! [`server::ServerConfig`] and an `Arc<dyn CommandExecutor>`. An
//! embedder then runs its own poller per I/O thread and feeds readiness
//! events into [`io_thread::IoThread::run`].

pub mod codec;
pub mod conn_id;
pub mod connection;
pub mod error;
pub mod executor;
pub mod io_thread;
mod mailbox;
pub mod packet;
pub mod pool;
mod proc_thread;
pub mod server;
pub mod transport;

pub use codec::Codec;
pub use conn_id::ConnId;
pub use connection::{ConnFlags, Connection};
pub use error::Status;
pub use executor::{CommandExecutor, ConnHandle, Dispatch};
pub use io_thread::{IoThread, Mode};
pub use packet::Packet;
pub use server::{JobCounter, Server, ServerConfig};
pub use transport::{ReadyEvent, Transport};

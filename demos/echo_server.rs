//! Minimal echo broker wiring [`Server`] to a real TCP listener via `mio`,
//! in the same spirit as `mio`'s own `examples/tcp_server.rs`: an accept
//! loop plus a `Token` bookkeeping map, except reads/writes are dispatched
//! through `IoThread::run` instead of being inlined by hand.
//!
//! Run with `cargo run --bin echo_server --features net` and connect with
//! `nc 127.0.0.1 13265`.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use brokerd_core::transport::MioTransport;
use brokerd_core::{
    Codec, CommandExecutor, ConnHandle, ConnId, Dispatch, Packet, ReadyEvent, Server, ServerConfig,
    Status,
};

const LISTENER: Token = Token(0);
const FIRST_CONN: Token = Token(1);

/// Line-delimited framing: a packet is everything up to and including a
/// `\n`. The same framing `tests/support.rs` uses, since this demo is about
/// wiring a real socket to the core, not about parsing.
#[derive(Default)]
struct LineCodec;

impl Codec for LineCodec {
    fn decode(&mut self, buf: &mut Vec<u8>) -> io::Result<Option<Packet>> {
        match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => Ok(Some(Packet::new(buf.drain(..=pos).collect()))),
            None => Ok(None),
        }
    }

    fn encode(&self, packet: &Packet, out: &mut Vec<u8>) {
        out.extend_from_slice(&packet.payload);
    }
}

/// Echoes every line back to whichever connection sent it.
struct EchoExecutor;

impl CommandExecutor for EchoExecutor {
    fn run_command(&self, dispatch: &Dispatch<'_>, conn: ConnHandle, packet: &Packet) -> Status {
        dispatch.reply(conn, Packet::new(packet.payload.clone()));
        Status::Ok
    }

    fn on_connection_dead(&self, _dispatch: &Dispatch<'_>, _conn: ConnHandle) {}
}

fn main() -> io::Result<()> {
    env_logger::init();

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(128);

    let addr = "127.0.0.1:13265".parse().unwrap();
    let mut listener = TcpListener::bind(addr)?;
    poll.registry()
        .register(&mut listener, LISTENER, Interest::READABLE)?;

    // Single I/O thread, command execution inline: this demo drives one
    // `Poll` on the main thread, so there's no second thread to hand
    // processing off to.
    let server = Server::<LineCodec>::new(
        ServerConfig {
            io_threads: 1,
            ..Default::default()
        },
        Arc::new(EchoExecutor),
    )
    .expect("single io thread never fails to construct");
    let thread = server.io_thread(0).expect("thread 0 exists");

    let mut next_token = FIRST_CONN.0;
    let mut token_to_conn: HashMap<Token, ConnId> = HashMap::new();
    let mut conn_to_token: HashMap<ConnId, Token> = HashMap::new();

    println!("You can connect to the server using `nc`:");
    println!(" $ nc 127.0.0.1 13265");
    println!("Anything you send gets echoed straight back.");

    loop {
        poll.poll(&mut events, None)?;

        for event in events.iter() {
            if event.token() == LISTENER {
                loop {
                    let (mut stream, addr) = match listener.accept() {
                        Ok(pair) => pair,
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e),
                    };
                    log::info!("accepted connection from {addr}");

                    let token = Token(next_token);
                    next_token += 1;
                    poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE.add(Interest::WRITABLE),
                    )?;

                    match thread.register(Box::new(MioTransport::new(stream))) {
                        Ok(id) => {
                            token_to_conn.insert(token, id);
                            conn_to_token.insert(id, token);
                        }
                        Err(status) => {
                            log::warn!("dropping connection from {addr}: {status}");
                        }
                    }
                }
                continue;
            }

            let id = match token_to_conn.get(&event.token()) {
                Some(id) => *id,
                None => continue, // sporadic or already-released event
            };
            let ready = ReadyEvent {
                id,
                readable: event.is_readable(),
                writable: event.is_writable(),
            };
            let (_, status) = thread.run(&mut std::iter::once(ready));
            if !matches!(status, Status::Ok | Status::IoWait) {
                log::warn!("io thread reported {status}");
            }
        }

        // This demo's only cleanup: once `IoThread` has released a
        // connection's slab slot, drop our bookkeeping for it too. The
        // socket itself was already shut down by `MioTransport`'s `Drop`.
        token_to_conn.retain(|_, id| {
            let alive = thread.is_registered(*id);
            if !alive {
                conn_to_token.remove(id);
            }
            alive
        });
    }
}

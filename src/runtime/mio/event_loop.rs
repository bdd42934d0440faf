//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.

use crate::config::Config;
use crate::runtime::protocol::{self, BUFFER_SIZE};
use crate::runtime::{join_workers, ServerError};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Readiness events handled per poll.
const EVENTS_CAPACITY: usize = 32;

/// Upper bound on how long a poll blocks before the shutdown flag is checked.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Connection state for mio backend.
enum ConnState {
    /// Waiting for the request.
    Reading,
    /// Writing the response.
    Writing { response: Vec<u8>, written: usize },
}

struct MioConnection {
    stream: TcpStream,
    state: ConnState,
}

/// Run the mio-based server.
pub fn run(
    config: &Config,
    listener: &std::net::TcpListener,
    shutdown: &'static AtomicBool,
) -> Result<(), ServerError> {
    listener.set_nonblocking(true).map_err(ServerError::Setup)?;

    info!(
        workers = config.workers,
        max_connections = config.max_connections,
        "Starting mio runtime"
    );

    let mut handles = Vec::with_capacity(config.workers);

    for worker_id in 0..config.workers {
        let config = config.clone();
        let listener = listener.try_clone().map_err(ServerError::Setup)?;

        let handle = thread::Builder::new()
            .name(format!("worker-{}", worker_id))
            .spawn(move || {
                let result = worker_loop(worker_id, listener, &config, shutdown);
                if let Err(ref e) = result {
                    error!(worker = worker_id, error = %e, "Worker failed");
                    shutdown.store(true, Ordering::SeqCst);
                }
                result.map_err(ServerError::Io)
            })
            .map_err(ServerError::Setup)?;

        handles.push(handle);
    }

    join_workers(handles)
}

fn worker_loop(
    worker_id: usize,
    listener: std::net::TcpListener,
    config: &Config,
    shutdown: &AtomicBool,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let max_connections = config.max_connections;
    let mut connections: Slab<MioConnection> = Slab::with_capacity(max_connections);
    let mut buf = [0u8; BUFFER_SIZE];

    info!(worker = worker_id, max_connections, "Worker started");

    while !shutdown.load(Ordering::Relaxed) {
        match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => {
                    accept_connections(
                        &listener,
                        &poll,
                        &mut connections,
                        max_connections,
                        worker_id,
                    )?;
                }
                Token(conn_id) => {
                    if let Err(e) =
                        handle_connection_event(conn_id, event, &poll, &mut connections, &mut buf)
                    {
                        debug!(conn_id, error = %e, "Connection error");
                        close_connection(&poll, &mut connections, conn_id);
                    }
                }
            }
        }
    }

    info!(
        worker = worker_id,
        open = connections.len(),
        "Worker stopped"
    );

    Ok(())
}

fn accept_connections(
    listener: &TcpListener,
    poll: &Poll,
    connections: &mut Slab<MioConnection>,
    max_connections: usize,
    worker_id: usize,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if connections.len() >= max_connections {
                    warn!(peer = %peer_addr, "Connection limit reached");
                    continue;
                }

                let conn_id = connections.insert(MioConnection {
                    stream,
                    state: ConnState::Reading,
                });

                // Re-borrow after insert
                let conn = &mut connections[conn_id];
                poll.registry()
                    .register(&mut conn.stream, Token(conn_id), Interest::READABLE)?;

                debug!(
                    worker = worker_id,
                    conn_id,
                    peer = %peer_addr,
                    "Accepted connection"
                );
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!("Accept error: {}", e);
                break;
            }
        }
    }
    Ok(())
}

fn handle_connection_event(
    conn_id: usize,
    event: &mio::event::Event,
    poll: &Poll,
    connections: &mut Slab<MioConnection>,
    buf: &mut [u8],
) -> io::Result<()> {
    let Some(conn) = connections.get_mut(conn_id) else {
        return Ok(());
    };

    if let ConnState::Reading = conn.state {
        if !event.is_readable() {
            if event.is_read_closed() || event.is_error() {
                close_connection(poll, connections, conn_id);
            }
            return Ok(());
        }

        // One read; the request content is never looked at.
        match conn.stream.read(buf) {
            Ok(n) => trace!(conn_id, bytes = n, "Request read"),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        }

        conn.state = ConnState::Writing {
            response: protocol::response(&protocol::system_clock()),
            written: 0,
        };
    }

    if flush(conn)? {
        close_connection(poll, connections, conn_id);
    } else {
        poll.registry()
            .reregister(&mut conn.stream, Token(conn_id), Interest::WRITABLE)?;
    }

    Ok(())
}

/// Write as much of the response as the socket takes.
///
/// Returns `true` once everything has been written.
fn flush(conn: &mut MioConnection) -> io::Result<bool> {
    let ConnState::Writing { response, written } = &mut conn.state else {
        return Ok(false);
    };

    while *written < response.len() {
        match conn.stream.write(&response[*written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => *written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e),
        }
    }

    Ok(true)
}

fn close_connection(poll: &Poll, connections: &mut Slab<MioConnection>, conn_id: usize) {
    if connections.contains(conn_id) {
        let mut conn = connections.remove(conn_id);
        let _ = poll.registry().deregister(&mut conn.stream);
        debug!(conn_id, "Connection closed");
    }
}

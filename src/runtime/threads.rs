//! Blocking thread-per-connection runtime.
//!
//! The accept loop blocks on the listener and hands every connection to its
//! own OS thread, which reads once, optionally sleeps, writes the response
//! and closes. The shutdown flag is only looked at between accepts.

use crate::config::Config;
use crate::runtime::protocol::{self, BUFFER_SIZE};
use crate::runtime::ServerError;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Run the blocking server until the listener fails or shutdown is observed.
pub fn run(
    config: &Config,
    listener: &TcpListener,
    shutdown: &'static AtomicBool,
) -> Result<(), ServerError> {
    let delay = config.response_delay;

    info!(
        response_delay_ms = delay.as_millis() as u64,
        "Starting threads runtime"
    );

    let mut served: u64 = 0;

    for stream in listener.incoming() {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ServerError::Io(e)),
        };

        served += 1;
        thread::Builder::new()
            .name(format!("conn-{}", served))
            .spawn(move || {
                if let Err(e) = handle_connection(stream, delay) {
                    debug!(error = %e, "Connection error");
                }
            })
            .map_err(ServerError::Io)?;
    }

    info!(connections = served, "Threads runtime stopped");
    Ok(())
}

fn handle_connection(mut stream: TcpStream, delay: Duration) -> io::Result<()> {
    let peer = stream.peer_addr()?;
    let mut buf = [0u8; BUFFER_SIZE];

    // One read; the request content is never looked at.
    let n = stream.read(&mut buf)?;
    trace!(peer = %peer, bytes = n, "Request read");

    if !delay.is_zero() {
        thread::sleep(delay);
    }

    stream.write_all(&protocol::response(&protocol::system_clock()))?;
    debug!(peer = %peer, "Response sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::protocol::{RESPONSE_LEN, RESPONSE_PREFIX, RESPONSE_SUFFIX};
    use std::net::Shutdown;
    use std::time::Instant;

    fn exchange(addr: std::net::SocketAddr) -> Vec<u8> {
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        response
    }

    #[test]
    fn test_handle_connection_writes_response() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handle_connection(stream, Duration::ZERO).unwrap();
        });

        let response = exchange(addr);
        server.join().unwrap();

        assert_eq!(response.len(), RESPONSE_LEN);
        assert!(response.starts_with(RESPONSE_PREFIX));
        assert!(response.ends_with(RESPONSE_SUFFIX));
    }

    #[test]
    fn test_empty_request_still_answered() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handle_connection(stream, Duration::ZERO).unwrap();
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        server.join().unwrap();

        assert_eq!(response.len(), RESPONSE_LEN);
    }

    #[test]
    fn test_response_delay() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let delay = Duration::from_millis(200);

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handle_connection(stream, delay).unwrap();
        });

        let started = Instant::now();
        let response = exchange(addr);
        server.join().unwrap();

        assert!(started.elapsed() >= delay);
        assert_eq!(response.len(), RESPONSE_LEN);
    }

    #[test]
    fn test_run_serves_until_shutdown() {
        static SHUTDOWN: AtomicBool = AtomicBool::new(false);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Config::default();

        let server = thread::spawn(move || run(&config, &listener, &SHUTDOWN));

        for _ in 0..3 {
            assert_eq!(exchange(addr).len(), RESPONSE_LEN);
        }

        SHUTDOWN.store(true, Ordering::SeqCst);
        // The accept loop only notices the flag once it wakes up.
        let _ = TcpStream::connect(addr);

        assert!(server.join().unwrap().is_ok());
    }
}

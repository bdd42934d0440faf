//! Listener setup and runtime selection.
//!
//! The server binds one listening socket and hands it to whichever runtime
//! the configuration names. Runtimes with several workers share the socket
//! through cloned descriptors.

use crate::config::{Config, RuntimeType};
use crate::runtime::{self, ServerError};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::AtomicBool;
use tracing::info;

/// Server instance
pub struct Server {
    config: Config,
    listener: TcpListener,
}

impl Server {
    /// Bind the listening socket described by `config`.
    pub fn bind(config: Config) -> Result<Self, ServerError> {
        let addr: SocketAddr = config.listen.parse().map_err(|_| {
            ServerError::Setup(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid listen address '{}'", config.listen),
            ))
        })?;

        let listener = create_listener(addr, config.backlog).map_err(ServerError::Setup)?;

        Ok(Server { config, listener })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` is raised or a runtime fails.
    pub fn run(self, shutdown: &'static AtomicBool) -> Result<(), ServerError> {
        info!(runtime = ?self.config.runtime, "Server running");

        match self.config.runtime {
            RuntimeType::Uring => run_uring(&self.config, &self.listener, shutdown),
            RuntimeType::Mio => runtime::mio::run(&self.config, &self.listener, shutdown),
            RuntimeType::Threads => runtime::threads::run(&self.config, &self.listener, shutdown),
            RuntimeType::Tasks => runtime::tasks::run(&self.config, &self.listener, shutdown),
        }
    }
}

#[cfg(target_os = "linux")]
fn run_uring(
    config: &Config,
    listener: &TcpListener,
    shutdown: &'static AtomicBool,
) -> Result<(), ServerError> {
    runtime::uring::run(config, listener, shutdown)
}

#[cfg(not(target_os = "linux"))]
fn run_uring(
    _config: &Config,
    _listener: &TcpListener,
    _shutdown: &'static AtomicBool,
) -> Result<(), ServerError> {
    Err(ServerError::Setup(io::Error::new(
        io::ErrorKind::Unsupported,
        "the uring runtime requires Linux",
    )))
}

/// Create a blocking TCP listener with address reuse enabled.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FailurePolicy, Population};
    use crate::runtime::protocol::{RESPONSE_LEN, RESPONSE_PREFIX, RESPONSE_SUFFIX};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::Ordering;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    fn test_config(runtime: RuntimeType) -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            runtime,
            ..Config::default()
        }
    }

    fn start(config: Config) -> (SocketAddr, &'static AtomicBool, JoinHandle<Result<(), ServerError>>) {
        let shutdown: &'static AtomicBool = Box::leak(Box::new(AtomicBool::new(false)));
        let server = Server::bind(config).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = thread::spawn(move || server.run(shutdown));
        (addr, shutdown, handle)
    }

    fn exchange(addr: SocketAddr) -> Vec<u8> {
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        response
    }

    fn assert_framed(response: &[u8]) {
        assert_eq!(response.len(), RESPONSE_LEN);
        assert!(response.starts_with(RESPONSE_PREFIX));
        assert!(response.ends_with(RESPONSE_SUFFIX));
    }

    fn stop(addr: SocketAddr, shutdown: &AtomicBool, handle: JoinHandle<Result<(), ServerError>>) {
        shutdown.store(true, Ordering::SeqCst);
        // Wakes a blocking accept loop.
        let _ = TcpStream::connect(addr);
        assert!(handle.join().unwrap().is_ok());
    }

    #[cfg(target_os = "linux")]
    fn uring_available() -> bool {
        match runtime::uring::UringQueue::new(8) {
            Ok(_) => true,
            Err(e) => {
                eprintln!("skipping: io_uring unavailable: {}", e);
                false
            }
        }
    }

    #[test]
    fn test_bind_rejects_bad_address() {
        let config = Config {
            listen: "not an address".to_string(),
            ..Config::default()
        };
        assert!(matches!(Server::bind(config), Err(ServerError::Setup(_))));
    }

    #[test]
    fn test_threads_end_to_end() {
        let (addr, shutdown, handle) = start(test_config(RuntimeType::Threads));
        for _ in 0..5 {
            assert_framed(&exchange(addr));
        }
        stop(addr, shutdown, handle);
    }

    #[test]
    fn test_mio_end_to_end() {
        let config = Config {
            workers: 2,
            ..test_config(RuntimeType::Mio)
        };
        let (addr, shutdown, handle) = start(config);
        for _ in 0..20 {
            assert_framed(&exchange(addr));
        }
        stop(addr, shutdown, handle);
    }

    #[test]
    fn test_tasks_end_to_end() {
        let (addr, shutdown, handle) = start(test_config(RuntimeType::Tasks));
        for _ in 0..5 {
            assert_framed(&exchange(addr));
        }
        stop(addr, shutdown, handle);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_uring_end_to_end() {
        if !uring_available() {
            return;
        }

        for population in [Population::PreArmed, Population::SharedAccept] {
            let config = Config {
                slots: 4,
                population,
                ..test_config(RuntimeType::Uring)
            };
            let (addr, shutdown, handle) = start(config);

            // More cycles than slots: slots are recycled.
            for _ in 0..50 {
                assert_framed(&exchange(addr));
            }

            stop(addr, shutdown, handle);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_uring_concurrent_clients() {
        if !uring_available() {
            return;
        }

        let config = Config {
            slots: 8,
            workers: 2,
            ..test_config(RuntimeType::Uring)
        };
        let (addr, shutdown, handle) = start(config);

        let clients: Vec<_> = (0..16)
            .map(|_| thread::spawn(move || exchange(addr)))
            .collect();
        for client in clients {
            assert_framed(&client.join().unwrap());
        }

        stop(addr, shutdown, handle);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_uring_pool_bounds_concurrency() {
        if !uring_available() {
            return;
        }

        let config = Config {
            slots: 2,
            failure_policy: FailurePolicy::Recycle,
            ..test_config(RuntimeType::Uring)
        };
        let (addr, shutdown, handle) = start(config);

        // Two silent clients occupy both slots.
        let mut first = TcpStream::connect(addr).unwrap();
        let _second = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(200));

        // A third connection waits in the backlog without being served.
        let mut third = TcpStream::connect(addr).unwrap();
        third.write_all(b"hello").unwrap();
        third
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let mut byte = [0u8; 1];
        assert!(third.read(&mut byte).is_err());

        // Finishing the first cycle frees a slot for the third client.
        first.write_all(b"hello").unwrap();
        let mut response = Vec::new();
        first.read_to_end(&mut response).unwrap();
        assert_framed(&response);

        third
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut response = Vec::new();
        third.read_to_end(&mut response).unwrap();
        assert_framed(&response);

        stop(addr, shutdown, handle);
    }
}

//! Async task-per-connection runtime on tokio.
//!
//! Each accepted connection is served by its own task: one read, an
//! optional delay, the response, then the socket is shut down. The accept
//! loop stops on ctrl-c or when the shutdown flag is raised.

use crate::config::Config;
use crate::runtime::protocol::{self, BUFFER_SIZE};
use crate::runtime::ServerError;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace};

/// How often the accept loop checks the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Build a tokio runtime with `config.workers` threads and serve on it.
pub fn run(
    config: &Config,
    listener: &std::net::TcpListener,
    shutdown: &'static AtomicBool,
) -> Result<(), ServerError> {
    let listener = listener.try_clone().map_err(ServerError::Setup)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .enable_all()
        .build()
        .map_err(ServerError::Setup)?;

    info!(
        workers = config.workers,
        max_connections = config.max_connections,
        "Starting tasks runtime"
    );

    runtime.block_on(serve(
        listener,
        config.max_connections,
        config.response_delay,
        shutdown,
    ))
}

/// Accept connections until ctrl-c or the shutdown flag.
pub async fn serve(
    listener: std::net::TcpListener,
    max_connections: usize,
    delay: Duration,
    shutdown: &'static AtomicBool,
) -> Result<(), ServerError> {
    listener.set_nonblocking(true).map_err(ServerError::Setup)?;
    let listener = TcpListener::from_std(listener).map_err(ServerError::Setup)?;

    let connection_limit = Arc::new(Semaphore::new(max_connections));
    let mut tick = tokio::time::interval(SHUTDOWN_POLL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut served: u64 = 0;

    loop {
        // Wait for a connection slot
        let permit = tokio::select! {
            permit = connection_limit.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = &mut ctrl_c => break,
            _ = tick.tick() => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                continue;
            }
        };

        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");
                    served += 1;

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, delay).await {
                            debug!(error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    return Err(ServerError::Io(e));
                }
            },
            _ = &mut ctrl_c => break,
            _ = tick.tick() => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
        }
    }

    shutdown.store(true, Ordering::SeqCst);
    info!(connections = served, "Tasks runtime stopped");
    Ok(())
}

/// Serve a single client connection.
async fn handle_connection(mut stream: TcpStream, delay: Duration) -> std::io::Result<()> {
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    // One read; the request content is never looked at.
    let n = stream.read_buf(&mut buffer).await?;
    trace!(bytes = n, "Request read");

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    stream
        .write_all(&protocol::response(&protocol::system_clock()))
        .await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::protocol::{RESPONSE_LEN, RESPONSE_PREFIX, RESPONSE_SUFFIX};
    use tokio::time::Instant;

    async fn exchange(addr: std::net::SocketAddr) -> Vec<u8> {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_handle_connection_writes_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_connection(stream, Duration::ZERO).await
        });

        let response = exchange(addr).await;
        assert!(server.await.unwrap().is_ok());

        assert_eq!(response.len(), RESPONSE_LEN);
        assert!(response.starts_with(RESPONSE_PREFIX));
        assert!(response.ends_with(RESPONSE_SUFFIX));
    }

    #[tokio::test]
    async fn test_response_delay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let delay = Duration::from_millis(200);

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_connection(stream, delay).await
        });

        let started = Instant::now();
        let response = exchange(addr).await;
        assert!(server.await.unwrap().is_ok());

        assert!(started.elapsed() >= delay);
        assert_eq!(response.len(), RESPONSE_LEN);
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        static SHUTDOWN: AtomicBool = AtomicBool::new(false);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(serve(listener, 4, Duration::ZERO, &SHUTDOWN));

        for _ in 0..3 {
            assert_eq!(exchange(addr).await.len(), RESPONSE_LEN);
        }

        SHUTDOWN.store(true, Ordering::SeqCst);
        let result = tokio::time::timeout(Duration::from_secs(5), server).await;
        tokio_test::assert_ok!(result.unwrap().unwrap());
    }
}

//! io_uring worker threads.
//!
//! Every worker gets its own handle on the shared listening socket, its own
//! ring and its own slot pool, so workers never share mutable state. A
//! worker that fails raises the shutdown flag so the others stop too.

use super::ring::UringQueue;
use crate::config::Config;
use crate::runtime::protocol::BUFFER_SIZE;
use crate::runtime::{join_workers, Dispatcher, ServerError, SlotPool};
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{error, info};

/// Run the io_uring-based server.
pub fn run(
    config: &Config,
    listener: &TcpListener,
    shutdown: &'static AtomicBool,
) -> Result<(), ServerError> {
    info!(
        workers = config.workers,
        slots = config.slots,
        ring_size = config.effective_ring_size(),
        population = ?config.population,
        failure_policy = ?config.failure_policy,
        "Starting io_uring runtime"
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
                result
            })
            .map_err(ServerError::Setup)?;

        handles.push(handle);
    }

    join_workers(handles)
}

/// One single-threaded dispatcher. The listener parameter outlives the
/// dispatcher, so the descriptor handed to it stays open.
fn worker_loop(
    worker_id: usize,
    listener: TcpListener,
    config: &Config,
    shutdown: &AtomicBool,
) -> Result<(), ServerError> {
    let queue = UringQueue::new(config.effective_ring_size()).map_err(ServerError::Setup)?;
    let pool = SlotPool::new(config.slots, BUFFER_SIZE);

    let mut dispatcher = Dispatcher::new(
        queue,
        listener.as_raw_fd(),
        pool,
        config.population,
        config.failure_policy,
    );

    info!(worker = worker_id, "Worker started");

    dispatcher.run(shutdown)
}

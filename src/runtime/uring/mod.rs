//! Linux io_uring runtime.
//!
//! Completion-based model: each worker owns one ring and one slot pool and
//! runs the dispatcher over them on its own thread.

mod event_loop;
mod ring;

#[cfg(test)]
pub(crate) use ring::UringQueue;

use crate::config::Config;
use crate::runtime::ServerError;
use std::net::TcpListener;
use std::sync::atomic::AtomicBool;

/// Run the server using the io_uring backend.
pub fn run(
    config: &Config,
    listener: &TcpListener,
    shutdown: &'static AtomicBool,
) -> Result<(), ServerError> {
    event_loop::run(config, listener, shutdown)
}

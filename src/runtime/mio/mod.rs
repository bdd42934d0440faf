//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! Kept as a baseline to compare against the completion-queue runtime.

mod event_loop;

use crate::config::Config;
use crate::runtime::ServerError;
use std::net::TcpListener;
use std::sync::atomic::AtomicBool;

/// Run the server using mio backend.
pub fn run(
    config: &Config,
    listener: &TcpListener,
    shutdown: &'static AtomicBool,
) -> Result<(), ServerError> {
    event_loop::run(config, listener, shutdown)
}

//! time-server: answers every TCP connection with the current time
//!
//! The same canned response is served by four runtimes:
//! - io_uring completion queue with a fixed connection slot pool
//! - mio readiness polling
//! - blocking thread per connection
//! - tokio task per connection
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod runtime;
mod server;
mod signal;

use config::{Config, RuntimeType};
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        runtime = ?config.runtime,
        workers = config.workers,
        slots = config.slots,
        "Starting time-server"
    );

    // The blocking runtime keeps the default SIGINT behaviour; tokio
    // watches ctrl-c itself but still honours SIGTERM through the flag.
    if config.runtime != RuntimeType::Threads {
        signal::install()?;
    }

    let server = Server::bind(config)?;
    info!(address = %server.local_addr()?, "Server listening");

    if let Err(e) = server.run(signal::shutdown_flag()) {
        error!(error = %e, "Server failed");
        return Err(e.into());
    }

    info!("Server stopped");
    Ok(())
}

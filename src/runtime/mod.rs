//! Runtimes that serve the current-time response.
//!
//! The completion-queue runtime is built from small pieces:
//! - `OperationQueue`: submit accept/read/write/close, wait for completions
//! - `SlotPool`: fixed set of per-connection state records
//! - `StateMachine`: per-slot transitions, no I/O
//! - `Dispatcher`: the event loop tying them together
//!
//! Linux uses io_uring as the queue. The readiness (`mio`), blocking
//! (`threads`) and async task (`tasks`) runtimes are simple baselines that
//! produce the same wire response.

mod connection;
mod dispatcher;
mod error;
pub mod mio;
pub mod protocol;
mod queue;
mod state_machine;
pub mod tasks;
pub mod threads;
mod token;

#[cfg(target_os = "linux")]
pub mod uring;

pub(crate) use connection::SlotPool;
pub(crate) use dispatcher::Dispatcher;
pub use error::ServerError;

// Core pieces, for anything that drives the dispatcher directly
#[allow(unused_imports)]
pub(crate) use connection::{ConnectionSlot, SlotId, SlotState};
#[allow(unused_imports)]
pub(crate) use queue::{Completion, OpKind, Operation, OperationQueue, SubmitError};
#[allow(unused_imports)]
pub(crate) use state_machine::{NextAction, SlotError, StateMachine};
#[allow(unused_imports)]
pub(crate) use token::Token;

use std::thread::JoinHandle;

/// Largest submission queue the kernel will set up for one ring.
pub const MAX_RING_ENTRIES: u32 = 32768;

/// Largest pool a worker may have: every slot plus the shared accept must
/// fit in one ring.
pub const MAX_SLOTS: usize = MAX_RING_ENTRIES as usize - 1;

/// Wait for every worker and report the first failure.
pub(crate) fn join_workers(
    handles: Vec<JoinHandle<Result<(), ServerError>>>,
) -> Result<(), ServerError> {
    let mut first_error = None;

    for (worker_id, handle) in handles.into_iter().enumerate() {
        let result = match handle.join() {
            Ok(result) => result,
            Err(_) => Err(ServerError::WorkerPanicked(worker_id)),
        };
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

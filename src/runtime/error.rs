//! Errors that stop a worker.

use super::connection::SlotId;
use super::queue::SubmitError;
use super::state_machine::SlotError;
use std::fmt;
use std::io;

/// Worker-fatal failure.
#[derive(Debug)]
pub enum ServerError {
    /// Listener, queue or thread setup failed.
    Setup(io::Error),
    /// An operation could not be queued.
    Submit { token: u64, source: SubmitError },
    /// Waiting for completions failed.
    Wait(io::Error),
    /// A completion carried a token that maps to no slot.
    UnknownToken(u64),
    /// A listener accept completed with no idle slot to bind.
    PoolExhausted,
    /// A slot's cycle failed and the failure policy does not recover it.
    Slot { slot: SlotId, source: SlotError },
    /// A baseline runtime hit an I/O error it cannot continue from.
    Io(io::Error),
    /// A worker thread panicked.
    WorkerPanicked(usize),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Setup(e) => write!(f, "setup failed: {}", e),
            ServerError::Submit { token, source } => {
                write!(f, "submit failed for token {:#x}: {}", token, source)
            }
            ServerError::Wait(e) => write!(f, "waiting for completions failed: {}", e),
            ServerError::UnknownToken(token) => {
                write!(f, "completion for unknown token {:#x}", token)
            }
            ServerError::PoolExhausted => write!(f, "accept completed with no idle slot"),
            ServerError::Slot { slot, source } => write!(f, "slot {}: {}", slot, source),
            ServerError::Io(e) => write!(f, "I/O error: {}", e),
            ServerError::WorkerPanicked(id) => write!(f, "worker {} panicked", id),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Setup(e) | ServerError::Wait(e) | ServerError::Io(e) => Some(e),
            ServerError::Submit { source, .. } => Some(source),
            ServerError::Slot { source, .. } => Some(source),
            ServerError::UnknownToken(_)
            | ServerError::PoolExhausted
            | ServerError::WorkerPanicked(_) => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Setup(e)
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

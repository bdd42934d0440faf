//! Operation queue interface.
//!
//! The dispatcher talks to the kernel's submission/completion mechanism
//! through [`OperationQueue`]: it submits one of four operation kinds tagged
//! with a [`Token`], and later receives a [`Completion`] carrying the same
//! token and the operation's result.

use super::token::Token;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

/// Kind of asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Accept,
    Read,
    Write,
    Close,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Accept => "accept",
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::Close => "close",
        };
        f.write_str(name)
    }
}

/// An operation ready to be submitted.
#[derive(Debug)]
pub enum Operation<'a> {
    /// Accept a connection on the listening socket.
    Accept { listener: RawFd },
    /// Read into `buf` from a connection.
    Read { fd: RawFd, buf: &'a mut [u8] },
    /// Write `buf` to a connection.
    Write { fd: RawFd, buf: &'a [u8] },
    /// Close a connection handle.
    Close { fd: RawFd },
}

#[cfg(test)]
impl Operation<'_> {
    pub(crate) fn kind(&self) -> OpKind {
        match self {
            Operation::Accept { .. } => OpKind::Accept,
            Operation::Read { .. } => OpKind::Read,
            Operation::Write { .. } => OpKind::Write,
            Operation::Close { .. } => OpKind::Close,
        }
    }
}

/// A finished operation as reported by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Token the operation was submitted with, undecoded.
    pub token: u64,
    /// Kernel result: a descriptor or byte count, or a negated errno.
    pub result: i32,
}

#[cfg(test)]
impl Completion {
    pub(crate) fn new(token: Token, result: i32) -> Self {
        Self {
            token: token.encode(),
            result,
        }
    }
}

/// Submission failure.
#[derive(Debug)]
pub enum SubmitError {
    /// No submission entry free even after flushing to the kernel.
    QueueFull,
    /// The kernel refused the submission.
    Rejected(io::Error),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::QueueFull => write!(f, "submission queue full"),
            SubmitError::Rejected(e) => write!(f, "submission rejected: {}", e),
        }
    }
}

impl std::error::Error for SubmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SubmitError::QueueFull => None,
            SubmitError::Rejected(e) => Some(e),
        }
    }
}

/// Submission/completion channel driven by the dispatcher.
pub trait OperationQueue {
    /// Queue `op` for asynchronous execution, tagged with `token`.
    ///
    /// # Safety
    ///
    /// A buffer passed in `Operation::Read` or `Operation::Write` is used by
    /// the kernel after this call returns. It must stay allocated, must not
    /// move, and must not be touched by the caller until the completion
    /// carrying `token` has been returned from [`OperationQueue::wait`].
    unsafe fn submit(&mut self, op: Operation<'_>, token: Token) -> Result<(), SubmitError>;

    /// Block until the next completion is available.
    ///
    /// Returns `Ok(None)` when woken without a completion (a signal or the
    /// periodic tick) so the caller can check for shutdown.
    fn wait(&mut self) -> io::Result<Option<Completion>>;
}

//! io_uring backed operation queue.
//!
//! Submissions are pushed to the submission queue and flushed to the kernel
//! in batches when the dispatcher waits. A timeout operation tagged with the
//! tick token keeps `wait` from sleeping longer than [`TICK`] so a raised
//! shutdown flag is noticed even when no client is connecting.

use crate::runtime::queue::{Completion, Operation, OperationQueue, SubmitError};
use crate::runtime::token::Token;
use io_uring::{opcode, squeue, types, IoUring};
use std::io;
use std::time::Duration;
use tracing::debug;

/// Longest time `wait` blocks without returning.
pub const TICK: Duration = Duration::from_millis(100);

/// Operation queue on a private io_uring instance.
///
/// The ring is created once and released exactly once, when the queue is
/// dropped; in-flight operations are cancelled by the kernel at that point.
pub struct UringQueue {
    ring: IoUring,
    /// Boxed so the address handed to the kernel never moves.
    tick: Box<types::Timespec>,
    tick_armed: bool,
}

impl UringQueue {
    /// Create a ring with `entries` submission queue entries.
    pub fn new(entries: u32) -> io::Result<Self> {
        let ring = IoUring::new(entries)?;
        let tick = Box::new(
            types::Timespec::new()
                .sec(TICK.as_secs())
                .nsec(TICK.subsec_nanos()),
        );

        debug!(entries, "io_uring created");

        Ok(Self {
            ring,
            tick,
            tick_armed: false,
        })
    }

    /// Push an entry, flushing the submission queue once if it is full.
    ///
    /// # Safety
    ///
    /// Every pointer in `entry` must stay valid until its completion.
    unsafe fn push(&mut self, entry: &squeue::Entry) -> Result<(), SubmitError> {
        if self.ring.submission().push(entry).is_ok() {
            return Ok(());
        }

        self.ring.submit().map_err(SubmitError::Rejected)?;

        self.ring
            .submission()
            .push(entry)
            .map_err(|_| SubmitError::QueueFull)
    }

    fn arm_tick(&mut self) -> io::Result<()> {
        if self.tick_armed {
            return Ok(());
        }

        let timeout = opcode::Timeout::new(&*self.tick)
            .build()
            .user_data(Token::Tick.encode());

        // SAFETY: the timespec is boxed and owned by self, which outlives the
        // ring's use of it.
        unsafe { self.push(&timeout) }
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.tick_armed = true;
        Ok(())
    }
}

impl OperationQueue for UringQueue {
    unsafe fn submit(&mut self, op: Operation<'_>, token: Token) -> Result<(), SubmitError> {
        let entry = match op {
            Operation::Accept { listener } => opcode::Accept::new(
                types::Fd(listener),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
            .build(),
            Operation::Read { fd, buf } => {
                opcode::Recv::new(types::Fd(fd), buf.as_mut_ptr(), buf.len() as u32).build()
            }
            Operation::Write { fd, buf } => {
                opcode::Send::new(types::Fd(fd), buf.as_ptr(), buf.len() as u32)
                    .flags(libc::MSG_NOSIGNAL)
                    .build()
            }
            Operation::Close { fd } => opcode::Close::new(types::Fd(fd)).build(),
        }
        .user_data(token.encode());

        self.push(&entry)
    }

    fn wait(&mut self) -> io::Result<Option<Completion>> {
        loop {
            if let Some(cqe) = self.ring.completion().next() {
                let token = cqe.user_data();
                if token == Token::Tick.encode() {
                    self.tick_armed = false;
                    return Ok(None);
                }
                return Ok(Some(Completion {
                    token,
                    result: cqe.result(),
                }));
            }

            self.arm_tick()?;

            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for UringQueue {
    fn drop(&mut self) {
        debug!("io_uring released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::time::Instant;

    /// io_uring may be disabled by the kernel or a seccomp profile.
    fn queue() -> Option<UringQueue> {
        match UringQueue::new(8) {
            Ok(q) => Some(q),
            Err(e) => {
                eprintln!("skipping: io_uring unavailable: {}", e);
                None
            }
        }
    }

    fn next_completion(q: &mut UringQueue) -> Completion {
        loop {
            if let Some(c) = q.wait().unwrap() {
                return c;
            }
        }
    }

    #[test]
    fn test_wait_ticks_when_idle() {
        let Some(mut q) = queue() else { return };

        let started = Instant::now();
        assert!(q.wait().unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_accept_read_write_close() {
        let Some(mut q) = queue() else { return };

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client.write_all(b"hello").unwrap();

        unsafe {
            q.submit(
                Operation::Accept {
                    listener: listener.as_raw_fd(),
                },
                Token::Listener,
            )
            .unwrap();
        }
        let accepted = next_completion(&mut q);
        assert_eq!(accepted.token, Token::Listener.encode());
        assert!(accepted.result >= 0);
        let fd = accepted.result;

        let mut buf = [0u8; 64];
        let token = Token::Slot(crate::runtime::connection::SlotId::new(0));
        unsafe {
            q.submit(Operation::Read { fd, buf: &mut buf }, token).unwrap();
        }
        let read = next_completion(&mut q);
        assert_eq!(read.token, token.encode());
        assert_eq!(read.result, 5);
        assert_eq!(&buf[..5], b"hello");

        let reply = b"bye";
        unsafe {
            q.submit(Operation::Write { fd, buf: reply }, token).unwrap();
        }
        assert_eq!(next_completion(&mut q).result, 3);

        unsafe {
            q.submit(Operation::Close { fd }, token).unwrap();
        }
        assert_eq!(next_completion(&mut q).result, 0);

        let mut received = Vec::new();
        std::io::Read::read_to_end(&mut client, &mut received).unwrap();
        assert_eq!(received, b"bye");
    }
}

//! Completion dispatcher.
//!
//! Single-threaded, cooperative event loop: wait for one completion,
//! resolve its token to a slot, run the slot's state machine, submit the
//! operation it asks for, repeat. The only blocking point is
//! [`OperationQueue::wait`]; all slot mutation happens between waits, so the
//! pool needs no synchronization.

use super::connection::{SlotId, SlotPool};
use super::error::{Result, ServerError};
use super::queue::{Completion, OpKind, Operation, OperationQueue};
use super::state_machine::{NextAction, SlotError, StateMachine};
use super::token::Token;
use crate::config::{FailurePolicy, Population};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace, warn};

/// Drives a pool of slots through a completion queue.
///
/// Field order matters: the queue is dropped before the pool, so the
/// kernel is done with every slot buffer before the buffers are freed.
pub struct Dispatcher<Q: OperationQueue> {
    queue: Q,
    pool: SlotPool,
    machine: StateMachine,
    listener: RawFd,
    population: Population,
    policy: FailurePolicy,
    /// Shared-accept population: the listener accept is outstanding.
    accept_armed: bool,
    /// Slot cycles aborted and recycled after a connection failure.
    recovered: u64,
}

impl<Q: OperationQueue> Dispatcher<Q> {
    pub fn new(
        queue: Q,
        listener: RawFd,
        pool: SlotPool,
        population: Population,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            queue,
            pool,
            machine: StateMachine::default(),
            listener,
            population,
            policy,
            accept_armed: false,
            recovered: 0,
        }
    }

    /// Replace the state machine (e.g. to pin the response clock).
    #[cfg(test)]
    pub(crate) fn with_state_machine(mut self, machine: StateMachine) -> Self {
        self.machine = machine;
        self
    }

    /// Arm the initial accept operations.
    pub fn start(&mut self) -> Result<()> {
        self.rearm()
    }

    /// Serve connections until `shutdown` is raised or a fatal error occurs.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        self.start()?;

        info!(
            slots = self.pool.capacity(),
            population = ?self.population,
            policy = ?self.policy,
            "Dispatcher started"
        );

        while !shutdown.load(Ordering::Relaxed) {
            match self.queue.wait() {
                Ok(Some(completion)) => self.dispatch(completion)?,
                Ok(None) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ServerError::Wait(e)),
            }
        }

        info!(
            served = self.pool.total_served(),
            in_flight = self.pool.active_count(),
            recovered = self.recovered,
            "Dispatcher stopped"
        );

        Ok(())
    }

    /// Process exactly one completion.
    pub fn dispatch(&mut self, completion: Completion) -> Result<()> {
        let token =
            Token::decode(completion.token).ok_or(ServerError::UnknownToken(completion.token))?;

        let id = match token {
            Token::Tick => return Ok(()),
            Token::Listener => self.bind_listener_accept()?,
            Token::Slot(id) => id,
        };

        let slot = self
            .pool
            .get(id)
            .ok_or(ServerError::UnknownToken(completion.token))?;

        trace!(
            slot = %id,
            state = ?slot.state,
            op = ?slot.in_flight,
            result = completion.result,
            "Completion"
        );

        let action = match self.machine.advance(slot, completion.result) {
            Ok(action) => action,
            Err(e) if e.is_connection_local() && self.policy == FailurePolicy::Recycle => {
                warn!(slot = %id, error = %e, "Connection failed, recycling slot");
                self.recovered += 1;
                self.machine.abort(slot)
            }
            Err(e) => return Err(ServerError::Slot { slot: id, source: e }),
        };

        match action {
            NextAction::Submit { kind, token } => self.submit(token, kind)?,
            NextAction::Idle => {
                if let Some(slot) = self.pool.get(id) {
                    debug!(slot = %id, served = slot.served, "Connection closed");
                }
                self.pool.release(id);
            }
        }

        self.rearm()
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SlotPool {
        &self.pool
    }

    #[cfg(test)]
    pub(crate) fn recovered(&self) -> u64 {
        self.recovered
    }

    #[cfg(test)]
    pub(crate) fn queue(&self) -> &Q {
        &self.queue
    }

    #[cfg(test)]
    pub(crate) fn queue_mut(&mut self) -> &mut Q {
        &mut self.queue
    }

    /// A listener accept finished: bind it to an idle slot.
    fn bind_listener_accept(&mut self) -> Result<SlotId> {
        self.accept_armed = false;
        let id = self
            .pool
            .acquire_for_accept()
            .ok_or(ServerError::PoolExhausted)?;
        if let Some(slot) = self.pool.get(id) {
            slot.in_flight = Some(OpKind::Accept);
        }
        Ok(id)
    }

    /// Keep accepts armed for idle slots.
    fn rearm(&mut self) -> Result<()> {
        match self.population {
            Population::PreArmed => {
                while let Some(id) = self.pool.acquire_for_accept() {
                    self.submit(Token::Slot(id), OpKind::Accept)?;
                }
            }
            Population::SharedAccept => {
                if !self.accept_armed && self.pool.has_idle() {
                    let op = Operation::Accept {
                        listener: self.listener,
                    };
                    // SAFETY: accept references no buffer.
                    unsafe { self.queue.submit(op, Token::Listener) }.map_err(|source| {
                        ServerError::Submit {
                            token: Token::Listener.encode(),
                            source,
                        }
                    })?;
                    self.accept_armed = true;
                }
            }
        }
        Ok(())
    }

    /// Submit `kind` on behalf of the slot `token` names.
    fn submit(&mut self, token: Token, kind: OpKind) -> Result<()> {
        let Token::Slot(id) = token else {
            return Err(ServerError::UnknownToken(token.encode()));
        };
        let slot = self
            .pool
            .get(id)
            .ok_or(ServerError::UnknownToken(token.encode()))?;

        let fd = match (kind, slot.connection) {
            (OpKind::Accept, _) => self.listener,
            (_, Some(fd)) => fd,
            (_, None) => {
                return Err(ServerError::Slot {
                    slot: id,
                    source: SlotError::Unbound(kind),
                })
            }
        };

        slot.in_flight = Some(kind);
        trace!(slot = %id, op = %kind, fd, "Submit");

        let op = match kind {
            OpKind::Accept => Operation::Accept { listener: fd },
            OpKind::Read => Operation::Read {
                fd,
                buf: slot.buffer_mut(),
            },
            OpKind::Write => Operation::Write {
                fd,
                buf: slot.unwritten(),
            },
            OpKind::Close => Operation::Close { fd },
        };

        // SAFETY: slot buffers are boxed slices owned by the pool, which is
        // never resized and outlives the queue. The slot now has `kind` in
        // flight, and the dispatcher does not touch its buffer again until
        // the completion for `token` has been fed back through `dispatch`.
        unsafe { self.queue.submit(op, token) }.map_err(|source| ServerError::Submit {
            token: token.encode(),
            source,
        })
    }
}

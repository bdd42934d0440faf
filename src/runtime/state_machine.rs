//! Per-connection state machine.
//!
//! Pure transition logic: given a slot and the result of the operation it
//! had in flight, mutate the slot and say which operation to submit next.
//! The machine never waits and never touches the queue itself.
//!
//! ```text
//! AwaitingAccept --accept--> Reading --read--> Writing --write--> Closing
//!       ^                                        |  ^                |
//!       |                                        +--+ short write    |
//!       +------------------------- close ---------------------------+
//! ```

use super::connection::{ConnectionSlot, SlotState};
use super::protocol::{self, Clock};
use super::queue::OpKind;
use super::token::Token;
use std::fmt;

/// What the dispatcher should do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Submit `kind` for the slot, tagged with `token`.
    Submit { kind: OpKind, token: Token },
    /// The slot is back in AWAITING_ACCEPT with nothing in flight and must
    /// be re-armed by the dispatcher.
    Idle,
}

/// Failure of a single slot's cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotError {
    /// The kernel reported a negative result.
    OperationFailed { op: OpKind, errno: i32 },
    /// A completion arrived for a slot with no operation outstanding.
    NothingInFlight,
    /// The completed operation does not belong to the slot's state.
    UnexpectedCompletion { state: SlotState, op: OpKind },
    /// The slot buffer cannot hold the response.
    BufferTooSmall,
    /// `op` needs a connection handle but none is bound.
    Unbound(OpKind),
}

impl SlotError {
    /// Whether aborting just this slot's cycle is enough to recover.
    ///
    /// Accept failures point at the listener, and a completion with nothing
    /// in flight means the token bookkeeping is broken; neither is local to
    /// one connection.
    pub fn is_connection_local(&self) -> bool {
        match self {
            SlotError::OperationFailed { op, .. } => *op != OpKind::Accept,
            SlotError::UnexpectedCompletion { .. } | SlotError::BufferTooSmall => true,
            SlotError::NothingInFlight | SlotError::Unbound(_) => false,
        }
    }
}

impl fmt::Display for SlotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotError::OperationFailed { op, errno } => write!(
                f,
                "{} failed: {}",
                op,
                std::io::Error::from_raw_os_error(*errno)
            ),
            SlotError::NothingInFlight => write!(f, "completion with no operation in flight"),
            SlotError::UnexpectedCompletion { state, op } => {
                write!(f, "{} completion in state {:?}", op, state)
            }
            SlotError::BufferTooSmall => write!(f, "slot buffer too small for response"),
            SlotError::Unbound(op) => write!(f, "{} submitted with no connection bound", op),
        }
    }
}

impl std::error::Error for SlotError {}

/// Transition function shared by every slot of a worker.
#[derive(Debug, Clone, Copy)]
pub struct StateMachine {
    clock: Clock,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(protocol::system_clock)
    }
}

impl StateMachine {
    pub fn new(clock: Clock) -> Self {
        Self { clock }
    }

    /// Feed the result of the slot's in-flight operation into the machine.
    ///
    /// On error the slot is left with nothing in flight; the caller decides
    /// whether to [`abort`](Self::abort) it or stop.
    pub fn advance(
        &self,
        slot: &mut ConnectionSlot,
        result: i32,
    ) -> Result<NextAction, SlotError> {
        let op = slot.in_flight.take().ok_or(SlotError::NothingInFlight)?;

        if result < 0 {
            return Err(SlotError::OperationFailed { op, errno: -result });
        }

        let token = Token::Slot(slot.id());
        let next = |kind| NextAction::Submit { kind, token };

        match (slot.state, op) {
            (SlotState::AwaitingAccept, OpKind::Accept) => {
                slot.bind(result);
                Ok(next(OpKind::Read))
            }
            (SlotState::Reading, OpKind::Read) => {
                // Request content is ignored, whatever its length.
                let now = (self.clock)();
                let len = protocol::write_response(slot.buffer_mut(), &now)
                    .map_err(|_| SlotError::BufferTooSmall)?;
                slot.buffer_mut()[len..].fill(0);
                slot.pending_length = len;
                slot.written = 0;
                slot.state = SlotState::Writing;
                Ok(next(OpKind::Write))
            }
            (SlotState::Writing, OpKind::Write) => {
                slot.written = (slot.written + result as usize).min(slot.pending_length);
                if result > 0 && slot.written < slot.pending_length {
                    return Ok(next(OpKind::Write));
                }
                slot.state = SlotState::Closing;
                Ok(next(OpKind::Close))
            }
            (SlotState::Closing, OpKind::Close) => {
                slot.served += 1;
                slot.reset();
                Ok(NextAction::Idle)
            }
            (state, op) => Err(SlotError::UnexpectedCompletion { state, op }),
        }
    }

    /// Cut a slot's cycle short after a connection-local failure.
    ///
    /// A bound connection is still closed through the queue so the slot
    /// keeps exactly one operation in flight; a slot whose close already
    /// failed, or that never bound a connection, is reset on the spot.
    pub fn abort(&self, slot: &mut ConnectionSlot) -> NextAction {
        slot.in_flight = None;
        match (slot.connection, slot.state) {
            (Some(_), SlotState::Reading | SlotState::Writing) => {
                slot.state = SlotState::Closing;
                NextAction::Submit {
                    kind: OpKind::Close,
                    token: Token::Slot(slot.id()),
                }
            }
            _ => {
                slot.reset();
                NextAction::Idle
            }
        }
    }
}

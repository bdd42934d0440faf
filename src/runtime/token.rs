//! Operation tokens for completion correlation.
//!
//! Every submitted operation carries a `u64` (io_uring `user_data`) that
//! comes back unchanged with its completion. A token is either the index of
//! the slot that owns the operation, or one of a few reserved values at the
//! top of the range that never collide with a slot index.

use super::connection::SlotId;

/// Reserved value for an accept that is not yet bound to a slot.
const LISTENER: u64 = u64::MAX;

/// Reserved value for the queue's internal wake-up timer.
const TICK: u64 = u64::MAX - 1;

/// Decoded operation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    /// Accept on the listener that binds an idle slot when it completes.
    Listener,
    /// Operation owned by a slot.
    Slot(SlotId),
    /// Periodic wake-up used to observe shutdown; never reaches the dispatcher.
    Tick,
}

impl Token {
    /// Encode into the value attached to the submission.
    pub fn encode(self) -> u64 {
        match self {
            Token::Listener => LISTENER,
            Token::Tick => TICK,
            Token::Slot(id) => id.index() as u64,
        }
    }

    /// Decode a value returned with a completion.
    ///
    /// Returns `None` for values that are neither reserved nor a valid slot
    /// index width.
    pub fn decode(raw: u64) -> Option<Token> {
        match raw {
            LISTENER => Some(Token::Listener),
            TICK => Some(Token::Tick),
            n => u32::try_from(n).ok().map(|idx| Token::Slot(SlotId::new(idx))),
        }
    }
}

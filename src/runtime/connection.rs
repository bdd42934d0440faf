//! Connection slots and the fixed-size pool that owns them.
//!
//! Each slot holds the state of one connection for the duration of one
//! accept → read → write → close cycle. Slots are allocated once when the
//! pool is built and recycled for the life of the worker, so the pool size
//! is a hard bound on the number of connections in flight.

use super::queue::OpKind;
use std::fmt;
use std::os::unix::io::RawFd;

/// Index of a slot in its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u32);

impl SlotId {
    pub fn new(index: u32) -> Self {
        SlotId(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a slot is in its connection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No connection bound; an accept is (or will be) outstanding.
    AwaitingAccept,
    /// Connection bound, read of the request outstanding.
    Reading,
    /// Response staged in the buffer, write outstanding.
    Writing,
    /// Close of the connection handle outstanding.
    Closing,
}

/// State record for one connection.
#[derive(Debug)]
pub struct ConnectionSlot {
    id: SlotId,
    /// Current connection state.
    pub state: SlotState,
    /// Accepted socket, present from READING through CLOSING.
    pub connection: Option<RawFd>,
    /// Request scratch space, reused for the response.
    buffer: Box<[u8]>,
    /// Valid bytes staged in `buffer` for the in-flight operation.
    pub pending_length: usize,
    /// Response bytes already written.
    pub written: usize,
    /// The single operation this slot has outstanding, if any.
    pub in_flight: Option<OpKind>,
    /// Connections completed through this slot.
    pub served: u64,
}

impl ConnectionSlot {
    fn new(id: SlotId, buffer_size: usize) -> Self {
        Self {
            id,
            state: SlotState::AwaitingAccept,
            connection: None,
            buffer: vec![0u8; buffer_size].into_boxed_slice(),
            pending_length: 0,
            written: 0,
            in_flight: None,
            served: 0,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Bind an accepted connection and move to reading.
    pub fn bind(&mut self, fd: RawFd) {
        self.connection = Some(fd);
        self.pending_length = self.buffer.len();
        self.written = 0;
        self.state = SlotState::Reading;
    }

    /// Forget the previous connection entirely.
    ///
    /// The buffer is zeroed so nothing a previous client sent or received
    /// is visible to the next one.
    pub fn reset(&mut self) {
        self.state = SlotState::AwaitingAccept;
        self.connection = None;
        self.buffer.fill(0);
        self.pending_length = 0;
        self.written = 0;
        self.in_flight = None;
    }

    /// Whole buffer, used as the read target.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    #[cfg(test)]
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Response bytes not yet written.
    pub fn unwritten(&self) -> &[u8] {
        &self.buffer[self.written..self.pending_length]
    }
}

/// Fixed-capacity pool of connection slots.
///
/// The slot vector is never resized, so buffer addresses stay stable while
/// operations referencing them are in flight.
pub struct SlotPool {
    slots: Vec<ConnectionSlot>,
    /// Slots waiting for an accept to be armed (LIFO).
    idle: Vec<SlotId>,
    /// Mirrors membership in `idle`.
    is_idle: Vec<bool>,
}

impl SlotPool {
    /// Create a pool of `capacity` slots with `buffer_size` byte buffers.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let slots: Vec<ConnectionSlot> = (0..capacity)
            .map(|i| ConnectionSlot::new(SlotId::new(i as u32), buffer_size))
            .collect();
        // Reverse so the lowest index is handed out first
        let idle = (0..capacity).rev().map(|i| SlotId::new(i as u32)).collect();

        Self {
            slots,
            idle,
            is_idle: vec![true; capacity],
        }
    }

    /// Take an idle slot so an accept can be armed for it.
    ///
    /// Returns `None` when every slot already has a connection or an accept
    /// in flight.
    pub fn acquire_for_accept(&mut self) -> Option<SlotId> {
        let id = self.idle.pop()?;
        self.is_idle[id.index()] = false;
        Some(id)
    }

    /// Return a reset slot to the idle set.
    pub fn release(&mut self, id: SlotId) {
        let Some(slot) = self.slots.get(id.index()) else {
            return;
        };
        debug_assert_eq!(slot.state, SlotState::AwaitingAccept);
        debug_assert!(slot.connection.is_none());
        if !self.is_idle[id.index()] {
            self.is_idle[id.index()] = true;
            self.idle.push(id);
        }
    }

    /// Look up a slot by id.
    pub fn get(&mut self, id: SlotId) -> Option<&mut ConnectionSlot> {
        self.slots.get_mut(id.index())
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots with nothing armed.
    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn has_idle(&self) -> bool {
        !self.idle.is_empty()
    }

    /// Slots currently bound to a connection.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.connection.is_some()).count()
    }

    /// Connections served across all slots.
    pub fn total_served(&self) -> u64 {
        self.slots.iter().map(|s| s.served).sum()
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &ConnectionSlot> {
        self.slots.iter()
    }
}

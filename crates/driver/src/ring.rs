//! Fixed-capacity ring of inbound reports
//!
//! The completion path pushes every report it receives; readers pop them in
//! arrival order. The producer never waits: when the ring is full the oldest
//! unread report is overwritten, because a stale wheel delta or button state is
//! worth less than the latest one.
//!
//! ```text
//!            tail (next read)        head (next write)
//!              │                       │
//!   ┌────┬────┬▼───┬────┬────┬────┬────▼───┬────┐
//!   │    │    │ F3 │ F4 │ F5 │ F6 │        │    │
//!   └────┴────┴────┴────┴────┴────┴────────┴────┘
//! ```
//!
//! The ring keeps a length alongside the indices so all `capacity` slots hold
//! data; `head == tail` is therefore either empty or full, told apart by `len`.

use common::{Error, Result};
use protocol::{Frame, coalesce_wheel};

/// Counters for one ring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    /// Reports accepted by `push`
    pub pushed: u64,
    /// Unread reports overwritten because the ring was full
    pub dropped: u64,
    /// Reports handed to readers
    pub popped: u64,
    /// Wheel reports folded into a later one by `pop_coalesced`
    pub coalesced: u64,
}

#[derive(Debug)]
pub struct RingBuffer {
    slots: Vec<Frame>,
    head: usize,
    tail: usize,
    len: usize,
    stats: RingStats,
}

impl RingBuffer {
    /// Allocate a ring holding up to `capacity` frames
    ///
    /// Allocation failure is reported rather than aborting, so a device that
    /// cannot get its ring is simply not attached.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument(
                "ring buffer capacity must be at least 1".to_string(),
            ));
        }

        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).map_err(|e| {
            Error::ResourceExhausted(format!("ring buffer of {} frames: {}", capacity, e))
        })?;
        slots.resize(capacity, Frame::default());

        Ok(Self {
            slots,
            head: 0,
            tail: 0,
            len: 0,
            stats: RingStats::default(),
        })
    }

    /// Store a frame, overwriting the oldest unread one when full
    ///
    /// Returns true if a frame was dropped to make room.
    pub fn push(&mut self, frame: Frame) -> bool {
        let overwrote = self.is_full();
        if overwrote {
            self.tail = self.advance(self.tail);
            self.len -= 1;
            self.stats.dropped += 1;
        }

        self.slots[self.head] = frame;
        self.head = self.advance(self.head);
        self.len += 1;
        self.stats.pushed += 1;
        overwrote
    }

    /// Take the oldest unread frame
    pub fn pop(&mut self) -> Option<Frame> {
        let frame = self.take()?;
        self.stats.popped += 1;
        Some(frame)
    }

    /// Take the oldest unread frame, folding the wheel reports that follow it
    ///
    /// Consecutive wheel reports with the same buttons and direction are summed
    /// into the newest of them, so a reader that falls behind sees one large
    /// movement rather than a backlog of small ones.
    pub fn pop_coalesced(&mut self) -> Option<Frame> {
        let mut frame = self.take()?;
        while let Some(next) = self.peek() {
            match coalesce_wheel(&frame, &next) {
                Some(merged) => {
                    self.take();
                    self.stats.coalesced += 1;
                    frame = merged;
                }
                None => break,
            }
        }
        self.stats.popped += 1;
        Some(frame)
    }

    /// Oldest unread frame without consuming it
    pub fn peek(&self) -> Option<Frame> {
        (self.len > 0).then(|| self.slots[self.tail])
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Discard every unread frame (counters are kept)
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.len = 0;
    }

    pub fn stats(&self) -> RingStats {
        self.stats
    }

    fn take(&mut self) -> Option<Frame> {
        if self.len == 0 {
            return None;
        }
        let frame = self.slots[self.tail];
        self.tail = self.advance(self.tail);
        self.len -= 1;
        Some(frame)
    }

    fn advance(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }
}

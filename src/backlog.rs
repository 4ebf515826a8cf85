//! Per-slot, per-direction holding area for bytes a destination did not take.
//!
//! The region only grows at the back and shrinks from the front. There is no
//! compaction and no wrap-around: once everything pending has been sent the
//! offset snaps back to zero and the whole region is reusable again.

use std::collections::TryReserveError;

use thiserror::Error;

/// Default backlog capacity in bytes, per slot and per direction.
pub const DEFAULT_BACKLOG_SIZE: usize = 65530;

/// Which way bytes travel through a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to remote: read from the inbound socket, written to the outbound one.
    Upstream,
    /// Remote to client: read from the outbound socket, written to the inbound one.
    Downstream,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Upstream, Direction::Downstream];
}

/// Appending would push `offset + length` past capacity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("backlog exceeded {capacity} bytes ({offset} offset, {pending} pending, {incoming} incoming)")]
pub struct BacklogOverflow {
    pub capacity: usize,
    pub offset: usize,
    pub pending: usize,
    pub incoming: usize,
}

#[derive(Debug)]
pub struct Backlog {
    // `region[..offset]` has already been sent, `region[offset..]` is pending.
    region: Vec<u8>,
    offset: usize,
    capacity: usize,
}

impl Backlog {
    /// Reserves the full region up front so appends never reallocate.
    pub fn with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut region = Vec::new();
        region.try_reserve_exact(capacity)?;
        Ok(Self {
            region,
            offset: 0,
            capacity,
        })
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Start of unsent data within the region
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Number of unsent bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.region.len() - self.offset
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The bytes still waiting to be sent, in order.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.region[self.offset..]
    }

    /// Queue `bytes` behind whatever is already pending.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BacklogOverflow> {
        if self.region.len() + bytes.len() > self.capacity {
            return Err(BacklogOverflow {
                capacity: self.capacity,
                offset: self.offset,
                pending: self.len(),
                incoming: bytes.len(),
            });
        }
        self.region.extend_from_slice(bytes);
        Ok(())
    }

    /// Mark the first `sent` pending bytes as delivered.
    pub fn consume(&mut self, sent: usize) {
        debug_assert!(sent <= self.len());
        self.offset += sent.min(self.len());
        if self.offset == self.region.len() {
            self.clear();
        }
    }

    /// Drop everything pending and reclaim the region.
    pub fn clear(&mut self) {
        self.region.clear();
        self.offset = 0;
    }
}

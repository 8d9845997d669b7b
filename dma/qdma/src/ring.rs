// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Context-index ring
//!
//! Bounded FIFO of caller indices between the receive path and the caller's
//! completion dequeue. Enqueue is all-or-nothing so an SG job's indices never
//! split across harvest calls; dequeue returns whatever is available.
//!
//! Part of the capacity is held back as headroom, which keeps the usable size
//! at exactly the channel's descriptor count while the backing store stays a
//! power of two:
//!
//! ```text
//!   free_space + in_ring == capacity - headroom
//! ```

use crate::error::{Error, Resource, Result};

/// Power-of-two ring of 16-bit caller indices
pub struct IndexRing {
    slots: Box<[u16]>,
    mask: usize,
    /// Next slot to read
    head: usize,
    /// Next slot to write
    tail: usize,
    free_space: usize,
    in_ring: usize,
    headroom: usize,
}

impl IndexRing {
    /// Ring with `capacity` slots of which `headroom` are never handed out
    pub fn new(capacity: usize, headroom: usize) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(Error::InvalidArgument("ring capacity must be a power of two"));
        }
        if headroom >= capacity {
            return Err(Error::InvalidArgument("ring headroom leaves no usable slots"));
        }

        Ok(Self {
            slots: vec![0; capacity].into_boxed_slice(),
            mask: capacity - 1,
            head: 0,
            tail: 0,
            free_space: capacity - headroom,
            in_ring: 0,
            headroom,
        })
    }

    /// Ring sized for a channel with `nb_desc` descriptors
    pub fn for_channel(nb_desc: usize) -> Result<Self> {
        let capacity = nb_desc
            .checked_mul(2)
            .map(usize::next_power_of_two)
            .ok_or(Error::InvalidArgument("descriptor count overflows ring size"))?;
        Self::new(capacity, capacity.saturating_sub(nb_desc))
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Entries the ring can hold at once
    pub fn usable(&self) -> usize {
        self.slots.len() - self.headroom
    }

    pub fn len(&self) -> usize {
        self.in_ring
    }

    pub fn is_empty(&self) -> bool {
        self.in_ring == 0
    }

    pub fn free_space(&self) -> usize {
        self.free_space
    }

    /// Append every index or none of them
    pub fn enqueue(&mut self, indices: &[u16]) -> Result<()> {
        let n = indices.len();
        if n > self.free_space {
            return Err(Error::ResourceExhausted(Resource::IndexRing));
        }
        if n == 0 {
            return Ok(());
        }

        let first = n.min(self.slots.len() - self.tail);
        self.slots[self.tail..self.tail + first].copy_from_slice(&indices[..first]);
        self.slots[..n - first].copy_from_slice(&indices[first..]);

        self.tail = (self.tail + n) & self.mask;
        self.free_space -= n;
        self.in_ring += n;
        Ok(())
    }

    /// Move up to `out.len()` indices out of the ring
    pub fn dequeue(&mut self, out: &mut [u16]) -> usize {
        let n = out.len().min(self.in_ring);
        if n == 0 {
            return 0;
        }

        let first = n.min(self.slots.len() - self.head);
        out[..first].copy_from_slice(&self.slots[self.head..self.head + first]);
        out[first..n].copy_from_slice(&self.slots[..n - first]);

        self.head = (self.head + n) & self.mask;
        self.free_space += n;
        self.in_ring -= n;
        n
    }

    /// Drop every queued index
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.in_ring = 0;
        self.free_space = self.usable();
    }
}

impl core::fmt::Debug for IndexRing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IndexRing")
            .field("capacity", &self.slots.len())
            .field("headroom", &self.headroom)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("in_ring", &self.in_ring)
            .field("free_space", &self.free_space)
            .finish()
    }
}

// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Descriptor-context pool
//!
//! Long and SG descriptors point at a context block holding the frame list,
//! routing descriptors and SG tables for one job. Blocks live in an arena
//! allocated once per channel; free slot numbers sit in a bounded lock-free
//! queue. A block's address never changes while the pool is alive, so the
//! hardware may read it for as long as a job is outstanding.

use crossbeam_queue::ArrayQueue;

use crate::error::{Error, Result};
use crate::wire::{FdFormat, FleSdd, SgEntry};

/// Per-job descriptor context
#[repr(C, align(64))]
pub struct ContextBlock {
    pub fle_sdd: FleSdd,
    pub sg_src: Box<[SgEntry]>,
    pub sg_dst: Box<[SgEntry]>,
    /// Caller indices completed by this job
    pub indices: Box<[u16]>,
    /// Number of valid entries in `indices`
    pub job_nb: u16,
    /// Format whose constant fields are already written
    pub(crate) template: Option<FdFormat>,
}

impl ContextBlock {
    fn new(max_sg: usize) -> Self {
        Self {
            fle_sdd: FleSdd::default(),
            sg_src: vec![SgEntry::default(); max_sg].into_boxed_slice(),
            sg_dst: vec![SgEntry::default(); max_sg].into_boxed_slice(),
            indices: vec![0; max_sg.max(1)].into_boxed_slice(),
            job_nb: 0,
            template: None,
        }
    }

    /// Caller indices of the job currently described by this block
    pub fn job_indices(&self) -> &[u16] {
        &self.indices[..usize::from(self.job_nb)]
    }

    pub fn template(&self) -> Option<FdFormat> {
        self.template
    }

    /// Virtual address of the frame list
    pub fn list_addr(&self) -> usize {
        &self.fle_sdd as *const FleSdd as usize
    }

    pub fn sdd_addr(&self) -> usize {
        self.fle_sdd.sdd.as_ptr() as usize
    }

    pub fn sg_src_addr(&self) -> usize {
        self.sg_src.as_ptr() as usize
    }

    pub fn sg_dst_addr(&self) -> usize {
        self.sg_dst.as_ptr() as usize
    }
}

/// Fixed arena of context blocks with a free list
pub struct ContextPool {
    blocks: Box<[ContextBlock]>,
    free: ArrayQueue<u16>,
    max_sg: usize,
}

impl ContextPool {
    /// Arena of `count` blocks, each with SG tables of `max_sg` entries
    pub fn new(count: usize, max_sg: usize) -> Result<Self> {
        if count == 0 || count > usize::from(u16::MAX) + 1 {
            return Err(Error::InvalidArgument("context pool size out of range"));
        }

        let blocks: Box<[ContextBlock]> = (0..count).map(|_| ContextBlock::new(max_sg)).collect();
        let free = ArrayQueue::new(count);
        for slot in 0..count {
            // Queue capacity equals `count`, so this never overflows
            let _ = free.push(slot as u16);
        }

        Ok(Self { blocks, free, max_sg })
    }

    /// Take a free block
    pub fn lease(&self) -> Option<u16> {
        self.free.pop()
    }

    /// Return a block to the free list
    pub fn release(&self, slot: u16) {
        if usize::from(slot) >= self.blocks.len() || self.free.push(slot).is_err() {
            log::error!("qdma: context slot {} released twice or out of range", slot);
        }
    }

    pub fn block(&self, slot: u16) -> Option<&ContextBlock> {
        self.blocks.get(usize::from(slot))
    }

    pub fn block_mut(&mut self, slot: u16) -> Option<&mut ContextBlock> {
        self.blocks.get_mut(usize::from(slot))
    }

    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn max_sg(&self) -> usize {
        self.max_sg
    }
}

impl core::fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ContextPool")
            .field("capacity", &self.blocks.len())
            .field("available", &self.free.len())
            .field("max_sg", &self.max_sg)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_release() {
        let pool = ContextPool::new(4, 8).unwrap();
        assert_eq!(pool.available(), 4);

        let a = pool.lease().unwrap();
        let b = pool.lease().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.available(), 2);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_exhaustion() {
        let pool = ContextPool::new(2, 0).unwrap();
        assert!(pool.lease().is_some());
        assert!(pool.lease().is_some());
        assert!(pool.lease().is_none());
    }

    #[test]
    fn test_double_release_ignored() {
        let pool = ContextPool::new(1, 0).unwrap();
        let slot = pool.lease().unwrap();
        pool.release(slot);
        pool.release(slot);
        pool.release(9);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_block_shape() {
        let mut pool = ContextPool::new(2, 16).unwrap();
        let block = pool.block_mut(1).unwrap();
        assert_eq!(block.sg_src.len(), 16);
        assert_eq!(block.sg_dst.len(), 16);
        assert_eq!(block.indices.len(), 16);
        assert_eq!(block.list_addr() % 64, 0);

        block.indices[..3].copy_from_slice(&[5, 6, 7]);
        block.job_nb = 3;
        assert_eq!(pool.block(1).unwrap().job_indices(), &[5, 6, 7]);

        // Without SG support a block still tracks one index
        let pool = ContextPool::new(1, 0).unwrap();
        assert_eq!(pool.block(0).unwrap().indices.len(), 1);
        assert!(pool.block(1).is_none());
    }

    #[test]
    fn test_addresses_stable() {
        let pool = ContextPool::new(3, 4).unwrap();
        let before: Vec<usize> = (0..3).map(|s| pool.block(s).unwrap().list_addr()).collect();
        let moved = pool;
        let after: Vec<usize> = (0..3).map(|s| moved.block(s).unwrap().list_addr()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_size_limits() {
        assert!(ContextPool::new(0, 1).is_err());
        assert!(ContextPool::new(65537, 0).is_err());
    }
}

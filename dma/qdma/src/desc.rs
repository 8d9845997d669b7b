// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Descriptor construction
//!
//! `copy` and `copy_sg` validate a job, assign its caller indices, build the
//! frame descriptor (and context block for long and SG jobs) and append it
//! to the channel's batch. Nothing is committed until every check passed.

use core::mem::size_of;

use bitflags::bitflags;

use crate::error::{Error, Resource, Result};
use crate::hw::{HwQueue, Portal};
use crate::pool::ContextBlock;
use crate::vq::{Route, VirtualQueue, VqFlags};
use crate::wire::{
    BufferFormat, FdFormat, FlowContext, FrameDesc, Sdd, FLE_DST, FLE_SDD, FLE_SRC, INDEX_SPACE,
    MAX_IOVA, SDD_COUNT, SDD_DST, SDD_SRC,
};

bitflags! {
    /// Per-operation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpFlags: u64 {
        /// Order after all earlier operations; hardware already completes in order
        const FENCE = 1 << 0;
        /// Submit the batch before returning
        const SUBMIT = 1 << 1;
        /// Bits 23:8 carry a caller-chosen index
        const CALLER_INDEX = 1 << 2;

        const _ = !0;
    }
}

const CALLER_INDEX_SHIFT: u32 = 8;
const CALLER_INDEX_FIELD: u64 = 0xFFFF;

impl OpFlags {
    pub fn with_caller_index(self, index: u16) -> Self {
        let bits = (self.bits() & !(CALLER_INDEX_FIELD << CALLER_INDEX_SHIFT))
            | (u64::from(index) << CALLER_INDEX_SHIFT);
        Self::from_bits_retain(bits) | Self::CALLER_INDEX
    }

    pub fn caller_index(self) -> Option<u16> {
        self.contains(Self::CALLER_INDEX)
            .then(|| ((self.bits() >> CALLER_INDEX_SHIFT) & CALLER_INDEX_FIELD) as u16)
    }
}

/// One scatter-gather buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgBuf {
    pub addr: u64,
    pub len: u32,
}

impl SgBuf {
    pub const fn new(addr: u64, len: u32) -> Self {
        Self { addr, len }
    }
}

fn check_addr(addr: u64) -> Result<()> {
    if addr > MAX_IOVA {
        return Err(Error::InvalidArgument("address exceeds 49 bits"));
    }
    Ok(())
}

fn check_index(index: u16) -> Result<u16> {
    if usize::from(index) >= INDEX_SPACE {
        return Err(Error::InvalidArgument("caller index exceeds 8191"));
    }
    Ok(index)
}

/// Write the constant part of a frame list
fn write_frame_list(block: &mut ContextBlock, hw: &dyn HwQueue, route: &Route, format: BufferFormat) {
    let sdd_iova = hw.iova(block.sdd_addr());
    let list = &mut block.fle_sdd;

    list.fle = Default::default();
    list.fle[FLE_SDD].set_addr(sdd_iova);
    list.fle[FLE_SDD].set_len((SDD_COUNT * size_of::<Sdd>()) as u32);
    list.fle[FLE_SRC].set_format(format);
    list.fle[FLE_DST].set_format(format);
    list.fle[FLE_DST].set_final(true);
    list.sdd[SDD_SRC] = route.src_sdd;
    list.sdd[SDD_DST] = route.dst_sdd;
}

/// Bring a block's frame list up to date for `format`
fn prepare_block(
    block: &mut ContextBlock,
    hw: &dyn HwQueue,
    route: &Route,
    format: FdFormat,
    pre_populate: bool,
) {
    if pre_populate && block.template == Some(format) {
        return;
    }

    let buffers = match format {
        FdFormat::Sg => BufferFormat::ScatterGather,
        _ => BufferFormat::Single,
    };
    write_frame_list(block, hw, route, buffers);
    if format == FdFormat::Sg {
        let src = hw.iova(block.sg_src_addr());
        let dst = hw.iova(block.sg_dst_addr());
        block.fle_sdd.fle[FLE_SRC].set_addr(src);
        block.fle_sdd.fle[FLE_DST].set_addr(dst);
    }
    block.template = pre_populate.then_some(format);
}

impl VirtualQueue {
    fn take_block(&mut self) -> Result<u16> {
        if self.is_silent() {
            let slot = self.silent_slots[self.silent_cursor];
            self.silent_cursor = (self.silent_cursor + 1) % self.silent_slots.len();
            Ok(slot)
        } else {
            self.pool
                .lease()
                .ok_or(Error::ResourceExhausted(Resource::ContextPool))
        }
    }

    fn check_capacity(&self, ops: usize) -> Result<()> {
        if !self.is_silent() && self.in_flight() + ops as u64 > self.nb_desc as u64 {
            return Err(Error::ResourceExhausted(Resource::Descriptors));
        }
        Ok(())
    }

    /// Make room in the batch for one more descriptor
    fn reserve_batch(&mut self, portal: &mut Portal, busy_limit: u64) -> Result<()> {
        if self.batch_full() {
            self.submit(portal, busy_limit)?;
        }
        Ok(())
    }

    fn push_fd(&mut self, portal: &mut Portal, fd: FrameDesc, flags: OpFlags, busy_limit: u64) {
        if self.flags.contains(VqFlags::DEBUG_DUMP) {
            log::debug!("qdma: vchan {} {:?}", self.id, fd);
        }
        self.batch[self.batch_len] = fd;
        self.batch_len += 1;

        if flags.contains(OpFlags::SUBMIT) || self.batch_full() {
            // The descriptor stays queued on failure; the next submit retries it
            if let Err(err) = self.submit(portal, busy_limit) {
                log::warn!("qdma: vchan {} deferred submit: {}", self.id, err);
            }
        }
    }

    fn next_index(&self, offset: u64) -> u16 {
        ((self.counters.live.submitted + offset) % INDEX_SPACE as u64) as u16
    }

    /// Queue a single copy, returning its caller index
    pub(crate) fn copy(
        &mut self,
        portal: &mut Portal,
        src: u64,
        dst: u64,
        len: u32,
        flags: OpFlags,
        busy_limit: u64,
    ) -> Result<u16> {
        check_addr(src)?;
        check_addr(dst)?;
        let caller_index = match flags.caller_index() {
            Some(index) if !self.is_silent() => Some(check_index(index)?),
            _ => None,
        };
        self.check_capacity(1)?;
        self.reserve_batch(portal, busy_limit)?;

        let index = caller_index.unwrap_or_else(|| self.next_index(0));
        let status = !self.is_silent();

        let fd = if self.flags.contains(VqFlags::SHORT_FD) && !self.route.rbp {
            FrameDesc::short(src, dst, len, index, status, self.id)
        } else {
            let slot = self.take_block()?;
            let pre_populate = self.flags.contains(VqFlags::PRE_POPULATE);
            let hw = &*self.hw;
            let route = &self.route;
            let block = self
                .pool
                .block_mut(slot)
                .ok_or(Error::ResourceExhausted(Resource::ContextPool))?;

            prepare_block(block, hw, route, FdFormat::Long, pre_populate);
            let fle = &mut block.fle_sdd.fle;
            fle[FLE_SRC].set_addr(src);
            fle[FLE_SRC].set_len(len);
            fle[FLE_DST].set_addr(dst);
            fle[FLE_DST].set_len(len);
            block.indices[0] = index;
            block.job_nb = 1;

            let list = hw.iova(block.list_addr());
            FrameDesc::compound(
                FdFormat::Long,
                list,
                len,
                index,
                status,
                FlowContext::new(self.id, slot),
            )
        };

        self.counters.live.submitted += 1;
        self.push_fd(portal, fd, flags, busy_limit);
        Ok(index)
    }

    /// Queue a scatter-gather copy, returning the caller index of its last entry
    pub(crate) fn copy_sg(
        &mut self,
        portal: &mut Portal,
        src: &[SgBuf],
        dst: &[SgBuf],
        indices: Option<&[u16]>,
        flags: OpFlags,
        busy_limit: u64,
    ) -> Result<u16> {
        if src.len() != dst.len() {
            return Err(Error::NotSupported("source and destination SG counts differ"));
        }
        let n = src.len();
        if n == 0 || n > self.max_sg {
            return Err(Error::InvalidArgument("SG entry count out of range"));
        }
        if !self.is_silent() && n > self.nb_desc {
            return Err(Error::InvalidArgument("SG job larger than the descriptor budget"));
        }
        if src.iter().zip(dst).any(|(s, d)| s.len != d.len) {
            return Err(Error::NotSupported("SG entry lengths differ"));
        }
        for buf in src.iter().chain(dst) {
            check_addr(buf.addr)?;
        }
        let total = src
            .iter()
            .try_fold(0u32, |sum, buf| sum.checked_add(buf.len))
            .ok_or(Error::InvalidArgument("SG total length overflows"))?;

        let indices = match indices {
            Some(_) if self.is_silent() => None,
            Some(indices) if indices.len() != n => {
                return Err(Error::InvalidArgument("one caller index per SG entry required"));
            }
            Some(indices) => {
                for &index in indices {
                    check_index(index)?;
                }
                Some(indices)
            }
            None => None,
        };
        self.check_capacity(n)?;
        self.reserve_batch(portal, busy_limit)?;

        let slot = self.take_block()?;
        let pre_populate = self.flags.contains(VqFlags::PRE_POPULATE);
        let status = !self.is_silent();
        let next = self.counters.live.submitted;
        let hw = &*self.hw;
        let route = &self.route;
        let block = self
            .pool
            .block_mut(slot)
            .ok_or(Error::ResourceExhausted(Resource::ContextPool))?;

        prepare_block(block, hw, route, FdFormat::Sg, pre_populate);
        block.fle_sdd.fle[FLE_SRC].set_len(total);
        block.fle_sdd.fle[FLE_DST].set_len(total);

        for (i, (s, d)) in src.iter().zip(dst).enumerate() {
            let last = i + 1 == n;
            block.sg_src[i].set(s.addr, s.len, last);
            block.sg_dst[i].set(d.addr, d.len, last);
            block.indices[i] = match indices {
                Some(indices) => indices[i],
                None => ((next + i as u64) % INDEX_SPACE as u64) as u16,
            };
        }
        block.job_nb = n as u16;
        let last_index = block.indices[n - 1];

        let list = hw.iova(block.list_addr());
        let fd = FrameDesc::compound(
            FdFormat::Sg,
            list,
            total,
            last_index,
            status,
            FlowContext::new(self.id, slot),
        );

        self.counters.live.submitted += n as u64;
        self.push_fd(portal, fd, flags, busy_limit);
        Ok(last_index)
    }
}

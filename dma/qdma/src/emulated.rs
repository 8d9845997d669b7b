// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Loopback hardware queue
//!
//! Software stand-in for a queue DMA block. Descriptors that request status
//! are queued and handed back by pulls in submission order; silent
//! descriptors vanish once accepted. Knobs make the queue refuse enqueues,
//! accept partial bursts, delay pulls and emit invalid or foreign frames, so
//! the engine's retry and error paths can be driven without hardware.
//!
//! With [`LoopbackQueue::with_memory_copy`] the queue also performs the copy
//! each descriptor describes, reading frame lists and SG tables through
//! identity-mapped addresses.

use std::collections::VecDeque;
use std::ptr;

use spin::Mutex as SpinMutex;

use crate::hw::{HwQueue, Portal, QueueBusy, RxSlot, DEFAULT_MAX_BURST};
use crate::wire::{BufferFormat, FdFormat, Fle, FleSdd, FrameDesc, SgEntry, FLE_DST, FLE_SRC};

/// Pull waiting to be collected by a portal
struct PendingPull {
    portal: u32,
    max: usize,
    polls_left: usize,
}

struct LoopbackState {
    in_flight: VecDeque<FrameDesc>,
    pulls: Vec<PendingPull>,
    /// Enqueue calls still to refuse
    busy_budget: usize,
    /// Largest burst accepted per enqueue call
    accept_limit: Option<usize>,
    /// Polls returning `None` before a pull lands
    poll_delay: usize,
    /// Invalid slots to emit ahead of real frames
    invalid_slots: usize,
    accepted: u64,
    returned: u64,
}

/// Loopback implementation of [`HwQueue`]
pub struct LoopbackQueue {
    id: u32,
    depth: usize,
    max_burst: usize,
    memory_copy: bool,
    state: SpinMutex<LoopbackState>,
}

impl LoopbackQueue {
    pub fn new(id: u32, depth: usize) -> Self {
        Self {
            id,
            depth,
            max_burst: DEFAULT_MAX_BURST,
            memory_copy: false,
            state: SpinMutex::new(LoopbackState {
                in_flight: VecDeque::with_capacity(depth),
                pulls: Vec::new(),
                busy_budget: 0,
                accept_limit: None,
                poll_delay: 0,
                invalid_slots: 0,
                accepted: 0,
                returned: 0,
            }),
        }
    }

    pub fn with_max_burst(mut self, max_burst: usize) -> Self {
        self.max_burst = max_burst.max(1);
        self
    }

    /// Execute every accepted descriptor's copy
    ///
    /// # Safety
    ///
    /// Every address carried by an enqueued descriptor, its frame list and
    /// its SG tables must be a valid virtual address for the stated length
    /// at the time of the enqueue call, and source and destination ranges
    /// must not overlap.
    pub unsafe fn with_memory_copy(mut self) -> Self {
        self.memory_copy = true;
        self
    }

    /// Refuse the next `calls` enqueue attempts
    pub fn set_busy(&self, calls: usize) {
        self.state.lock().busy_budget = calls;
    }

    /// Accept at most `limit` descriptors per enqueue call
    pub fn set_accept_limit(&self, limit: Option<usize>) {
        self.state.lock().accept_limit = limit;
    }

    /// Number of polls that report a pull as still pending
    pub fn set_poll_delay(&self, polls: usize) {
        self.state.lock().poll_delay = polls;
    }

    /// Emit `count` invalid slots at the front of the next pulls
    pub fn inject_invalid(&self, count: usize) {
        self.state.lock().invalid_slots += count;
    }

    /// Queue a frame as if hardware had finished it
    pub fn inject_frame(&self, fd: FrameDesc) {
        self.state.lock().in_flight.push_back(fd);
    }

    /// Frames waiting to be pulled
    pub fn pending(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Descriptors accepted since creation
    pub fn accepted(&self) -> u64 {
        self.state.lock().accepted
    }

    /// Frames handed back by pulls since creation
    pub fn returned(&self) -> u64 {
        self.state.lock().returned
    }

    /// # Safety
    ///
    /// See [`LoopbackQueue::with_memory_copy`].
    unsafe fn execute(fd: &FrameDesc) {
        match fd.format() {
            Some(FdFormat::Short) => {
                // SAFETY: caller upholds the memory-copy contract
                unsafe { copy_bytes(fd.addr(), fd.dst_addr(), fd.len() as usize) };
            }
            Some(FdFormat::Long) | Some(FdFormat::Sg) => {
                // SAFETY: a compound frame points at its engine-owned frame list
                unsafe {
                    let list = ptr::read(fd.addr() as usize as *const FleSdd);
                    Self::execute_list(&list.fle[FLE_SRC], &list.fle[FLE_DST]);
                }
            }
            None => log::warn!("loopback: skipping frame with tag {}", fd.format_tag()),
        }
    }

    /// # Safety
    ///
    /// See [`LoopbackQueue::with_memory_copy`].
    unsafe fn execute_list(src: &Fle, dst: &Fle) {
        match (src.format(), dst.format()) {
            (Some(BufferFormat::Single), Some(BufferFormat::Single)) => {
                // SAFETY: caller upholds the memory-copy contract
                unsafe { copy_bytes(src.addr(), dst.addr(), src.len().min(dst.len()) as usize) };
            }
            (Some(BufferFormat::ScatterGather), Some(BufferFormat::ScatterGather)) => {
                let mut s = src.addr() as usize as *const SgEntry;
                let mut d = dst.addr() as usize as *const SgEntry;
                loop {
                    // SAFETY: SG tables end with a final entry on both sides
                    let (se, de) = unsafe { (ptr::read(s), ptr::read(d)) };
                    // SAFETY: caller upholds the memory-copy contract
                    unsafe { copy_bytes(se.addr(), de.addr(), se.len().min(de.len()) as usize) };
                    if se.is_final() || de.is_final() {
                        break;
                    }
                    // SAFETY: not past the final entry
                    unsafe {
                        s = s.add(1);
                        d = d.add(1);
                    }
                }
            }
            other => log::warn!("loopback: unsupported frame list formats {:?}", other),
        }
    }
}

/// # Safety
///
/// `src` and `dst` must be valid, non-overlapping ranges of `len` bytes.
unsafe fn copy_bytes(src: u64, dst: u64, len: usize) {
    if len > 0 {
        // SAFETY: guaranteed by the caller
        unsafe { ptr::copy_nonoverlapping(src as usize as *const u8, dst as usize as *mut u8, len) };
    }
}

impl HwQueue for LoopbackQueue {
    fn id(&self) -> u32 {
        self.id
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn max_burst(&self) -> usize {
        self.max_burst
    }

    fn enqueue(&self, _portal: &mut Portal, fds: &[FrameDesc]) -> Result<usize, QueueBusy> {
        let mut state = self.state.lock();
        if state.busy_budget > 0 {
            state.busy_budget -= 1;
            return Err(QueueBusy);
        }

        let room = self.depth.saturating_sub(state.in_flight.len());
        let n = fds
            .len()
            .min(self.max_burst)
            .min(state.accept_limit.unwrap_or(usize::MAX))
            .min(room);

        for fd in &fds[..n] {
            if self.memory_copy {
                // SAFETY: guaranteed by the `with_memory_copy` contract
                unsafe { Self::execute(fd) };
            }
            if fd.status_requested() {
                state.in_flight.push_back(*fd);
            }
        }
        state.accepted += n as u64;
        Ok(n)
    }

    fn issue_pull(&self, portal: &mut Portal, max: usize) -> Result<(), QueueBusy> {
        let mut state = self.state.lock();
        if state.pulls.iter().any(|p| p.portal == portal.id()) {
            return Err(QueueBusy);
        }
        let polls_left = state.poll_delay;
        state.pulls.push(PendingPull {
            portal: portal.id(),
            max,
            polls_left,
        });
        Ok(())
    }

    fn poll_pull(&self, portal: &mut Portal, slots: &mut [RxSlot]) -> Option<usize> {
        let mut state = self.state.lock();
        let Some(pos) = state.pulls.iter().position(|p| p.portal == portal.id()) else {
            return Some(0);
        };
        if state.pulls[pos].polls_left > 0 {
            state.pulls[pos].polls_left -= 1;
            return None;
        }

        let pull = state.pulls.swap_remove(pos);
        let max = pull.max.min(slots.len());
        let mut n = 0;
        while n < max && state.invalid_slots > 0 {
            state.invalid_slots -= 1;
            slots[n] = RxSlot::default();
            n += 1;
        }
        while n < max {
            let Some(fd) = state.in_flight.pop_front() else {
                break;
            };
            slots[n] = RxSlot { fd, valid: true };
            n += 1;
        }
        state.returned += slots[..n].iter().filter(|s| s.valid).count() as u64;
        Some(n)
    }
}

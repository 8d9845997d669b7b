// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Hardware queue seam
//!
//! The engine talks to hardware through [`HwQueue`]: enqueue frame
//! descriptors on a transmit queue, and pull finished descriptors back
//! through a per-worker [`Portal`]. A portal may have one pull outstanding
//! at a time; the engine records which channel owns it in a [`PullMarker`].

use core::cell::Cell;
use core::marker::PhantomData;

use thiserror::Error;

use crate::wire::FrameDesc;

/// Default largest descriptor burst a queue accepts per call
pub const DEFAULT_MAX_BURST: usize = 32;

/// Hardware refused the request for now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("hardware queue busy")]
pub struct QueueBusy;

/// Owner of a portal's outstanding pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullMarker {
    pub device: u32,
    pub vchan: u16,
    pub area: u8,
}

/// Per-worker software portal
///
/// Move-only and not shareable between threads. Every hardware operation
/// borrows it mutably, so one worker drives it at a time.
#[derive(Debug)]
pub struct Portal {
    id: u32,
    active_pull: Option<PullMarker>,
    _not_sync: PhantomData<Cell<()>>,
}

impl Portal {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            active_pull: None,
            _not_sync: PhantomData,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Channel whose pull is outstanding on this portal
    pub fn active_pull(&self) -> Option<PullMarker> {
        self.active_pull
    }

    pub(crate) fn set_active_pull(&mut self, marker: PullMarker) {
        self.active_pull = Some(marker);
    }

    pub(crate) fn clear_active_pull(&mut self) {
        self.active_pull = None;
    }
}

/// One receive slot written by a pull
#[derive(Debug, Clone, Copy, Default)]
pub struct RxSlot {
    pub fd: FrameDesc,
    /// Slot carries a frame
    pub valid: bool,
}

/// Hardware frame queue
pub trait HwQueue: Send + Sync {
    fn id(&self) -> u32;

    /// Descriptors the queue can hold
    fn depth(&self) -> usize;

    fn max_burst(&self) -> usize {
        DEFAULT_MAX_BURST
    }

    /// Enqueue descriptors in order, returning how many were accepted
    fn enqueue(&self, portal: &mut Portal, fds: &[FrameDesc]) -> Result<usize, QueueBusy>;

    /// Ask for up to `max` finished descriptors
    fn issue_pull(&self, portal: &mut Portal, max: usize) -> Result<(), QueueBusy>;

    /// Collect a pull issued on `portal`
    ///
    /// `None` while the pull has not landed; `Some(n)` once `slots[..n]`
    /// were written. `Some(0)` means the queue had nothing to return.
    fn poll_pull(&self, portal: &mut Portal, slots: &mut [RxSlot]) -> Option<usize>;

    /// Translate engine-owned memory to a device address
    fn iova(&self, va: usize) -> u64 {
        va as u64
    }
}

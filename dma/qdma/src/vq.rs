// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Virtual queue
//!
//! Software channel multiplexed onto a shared hardware queue. Each channel
//! owns its pending descriptor batch, context pool, index ring and receive
//! storage, so channels never contend with each other.

use std::sync::Arc;

use bitflags::bitflags;

use crate::config::{PortRoute, VchanConf};
use crate::error::{Error, Result};
use crate::hw::{HwQueue, RxSlot};
use crate::pool::ContextPool;
use crate::ring::IndexRing;
use crate::stats::Counters;
use crate::wire::{FrameDesc, Generation, Sdd};

/// Slots per receive storage area
pub const PULL_BURST: usize = 32;
/// Receive storage areas per channel
pub const RX_AREAS: usize = 2;

bitflags! {
    /// Channel mode flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VqFlags: u32 {
        /// No completion tracking
        const SILENT = 1 << 0;
        const SHORT_FD = 1 << 1;
        const PRE_POPULATE = 1 << 2;
        const DEBUG_DUMP = 1 << 3;
        /// At least one endpoint is an external port
        const ROUTE_BY_PORT = 1 << 4;
    }
}

/// Receive storage area state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxState {
    #[default]
    Empty,
    PullIssued,
    Filling,
    Drained,
}

impl RxState {
    /// Area can take a new pull
    pub fn is_free(self) -> bool {
        matches!(self, RxState::Empty | RxState::Drained)
    }
}

/// One receive storage area
#[derive(Debug, Default)]
pub(crate) struct RxStorage {
    pub slots: Box<[RxSlot]>,
    pub state: RxState,
    /// Slots written by the last pull
    pub len: usize,
    /// Next slot to drain
    pub cursor: usize,
}

impl RxStorage {
    fn new() -> Self {
        Self {
            slots: vec![RxSlot::default(); PULL_BURST].into_boxed_slice(),
            ..Default::default()
        }
    }

    /// Record a landed pull of `n` slots
    ///
    /// A count past the area's slots is clamped to them.
    pub fn landed(&mut self, n: usize) {
        let n = n.min(self.slots.len());
        self.len = n;
        self.cursor = 0;
        self.state = if n == 0 {
            RxState::Empty
        } else {
            RxState::Filling
        };
    }
}

/// Routing descriptors written into every frame list of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub src_sdd: Sdd,
    pub dst_sdd: Sdd,
    pub rbp: bool,
}

impl Route {
    pub fn derive(generation: Generation, ports: &PortRoute) -> Self {
        let src_sdd = match ports.src {
            Some(port) => Sdd::port(port),
            None => Sdd::memory_read(generation),
        };
        let dst_sdd = match ports.dst {
            Some(port) => Sdd::port(port),
            None => Sdd::memory_write(generation),
        };
        Self {
            src_sdd,
            dst_sdd,
            rbp: ports.is_rbp(),
        }
    }
}

/// Per-channel engine state
pub struct VirtualQueue {
    pub(crate) id: u16,
    pub(crate) hw: Arc<dyn HwQueue>,
    pub(crate) nb_desc: usize,
    pub(crate) route: Route,
    pub(crate) flags: VqFlags,
    pub(crate) max_sg: usize,

    /// Descriptors built but not yet accepted by hardware
    pub(crate) batch: Box<[FrameDesc]>,
    pub(crate) batch_len: usize,

    pub(crate) counters: Counters,
    pub(crate) pool: ContextPool,
    pub(crate) ring: IndexRing,

    /// Blocks owned for cyclic reuse in silent mode
    pub(crate) silent_slots: Box<[u16]>,
    pub(crate) silent_cursor: usize,

    pub(crate) rx: [RxStorage; RX_AREAS],
    pub(crate) active_rx: usize,
    /// Dequeue scratch for `completed_last`
    pub(crate) scratch: Box<[u16]>,
}

impl VirtualQueue {
    pub(crate) fn new(
        id: u16,
        hw: Arc<dyn HwQueue>,
        conf: &VchanConf,
        ports: &PortRoute,
        generation: Generation,
        silent: bool,
        max_sg: usize,
    ) -> Result<Self> {
        let route = Route::derive(generation, ports);

        let mut flags = VqFlags::empty();
        flags.set(VqFlags::SILENT, silent);
        flags.set(VqFlags::SHORT_FD, conf.options.short_fd);
        flags.set(VqFlags::PRE_POPULATE, conf.options.pre_populate);
        flags.set(VqFlags::DEBUG_DUMP, conf.options.debug_dump);
        flags.set(VqFlags::ROUTE_BY_PORT, route.rbp);

        let pool = ContextPool::new(2 * conf.nb_desc, max_sg)?;
        let ring = IndexRing::for_channel(conf.nb_desc)?;

        // Silent reuse must never overwrite a block still waiting in the batch
        let batch_size = hw.max_burst().max(1).min(pool.capacity());

        let silent_slots: Box<[u16]> = if silent {
            let mut slots = Vec::with_capacity(pool.capacity());
            while let Some(slot) = pool.lease() {
                slots.push(slot);
            }
            slots.into_boxed_slice()
        } else {
            Box::default()
        };

        if silent_slots.is_empty() && silent {
            return Err(Error::InvalidArgument("silent channel has no context blocks"));
        }

        Ok(Self {
            id,
            hw,
            nb_desc: conf.nb_desc,
            route,
            flags,
            max_sg,
            batch: vec![FrameDesc::default(); batch_size].into_boxed_slice(),
            batch_len: 0,
            counters: Counters::default(),
            pool,
            ring,
            silent_slots,
            silent_cursor: 0,
            rx: [RxStorage::new(), RxStorage::new()],
            active_rx: 0,
            scratch: vec![0; conf.nb_desc].into_boxed_slice(),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn flags(&self) -> VqFlags {
        self.flags
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn nb_desc(&self) -> usize {
        self.nb_desc
    }

    pub fn is_silent(&self) -> bool {
        self.flags.contains(VqFlags::SILENT)
    }

    /// Operations submitted and not yet handed back; zero when untracked
    pub fn in_flight(&self) -> u64 {
        if self.is_silent() {
            0
        } else {
            self.counters.live.in_flight()
        }
    }

    /// Descriptors waiting for the next submit
    pub fn pending(&self) -> usize {
        self.batch_len
    }

    pub(crate) fn batch_full(&self) -> bool {
        self.batch_len == self.batch.len()
    }

    /// Operations that can still be enqueued before hitting the descriptor limit
    pub fn burst_capacity(&self) -> usize {
        let in_flight = usize::try_from(self.in_flight()).unwrap_or(usize::MAX);
        self.nb_desc.saturating_sub(in_flight)
    }

    /// No queued, in-flight or pulled work
    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
            && self.batch_len == 0
            && self.ring.is_empty()
            && self.rx.iter().all(|area| area.state.is_free())
    }
}

impl core::fmt::Debug for VirtualQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirtualQueue")
            .field("id", &self.id)
            .field("hw_queue", &self.hw.id())
            .field("nb_desc", &self.nb_desc)
            .field("flags", &self.flags)
            .field("pending", &self.batch_len)
            .field("stats", &self.counters.live)
            .field("pool", &self.pool)
            .field("ring", &self.ring)
            .finish()
    }
}

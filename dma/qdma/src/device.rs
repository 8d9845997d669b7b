// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! DMA device
//!
//! A device owns the virtual channel array and the hardware queues they
//! submit to. Lifecycle:
//!
//! ```text
//!   Unconfigured ─configure─▶ Configured ─start─▶ Started ─stop─▶ Stopped
//!                                 ▲                                 │
//!                                 └────────────configure────────────┤
//!                                                                   ▼
//!                                                                 Closed
//! ```
//!
//! Every operation takes `&mut self`, so a device and its channels are driven
//! by one worker at a time.

use core::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::config::{DevConf, VchanConf, MAX_DESC, MAX_SG, MAX_VCHANS, MIN_DESC};
use crate::desc::{OpFlags, SgBuf};
use crate::error::{DeviceState, Error, Result};
use crate::harvest::{harvest, HarvestCtx};
use crate::hw::{HwQueue, Portal};
use crate::stats::VchanStats;
use crate::vq::VirtualQueue;
use crate::wire::Generation;

bitflags! {
    /// Device capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u64 {
        const MEM_TO_MEM = 1 << 0;
        const MEM_TO_DEV = 1 << 1;
        const DEV_TO_MEM = 1 << 2;
        const DEV_TO_DEV = 1 << 3;
        /// Channels may run without completion tracking
        const SILENT = 1 << 4;
        const OPS_COPY = 1 << 5;
        const OPS_COPY_SG = 1 << 6;
        const FENCE = 1 << 7;
    }
}

/// Static description of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub capabilities: Capabilities,
    pub max_vchans: u16,
    pub max_desc: usize,
    pub min_desc: usize,
    pub max_sges: usize,
    /// Channels in the current configuration
    pub nb_vchans: u16,
}

/// Whether a channel still has outstanding work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VchanStatus {
    Idle,
    Active,
}

/// Queue DMA device
pub struct Device {
    id: u32,
    name: String,
    generation: Generation,
    queues: Vec<Arc<dyn HwQueue>>,
    state: DeviceState,
    conf: DevConf,
    vqs: Vec<Option<VirtualQueue>>,
}

impl Device {
    /// Bind a device to its hardware queues
    pub fn open(
        id: u32,
        name: &str,
        generation: Generation,
        queues: Vec<Arc<dyn HwQueue>>,
    ) -> Result<Self> {
        if queues.is_empty() {
            return Err(Error::InvalidArgument("device needs at least one hardware queue"));
        }

        log::info!(
            "qdma: opened {} ({}) with {} hardware queues",
            name,
            generation.name(),
            queues.len()
        );

        Ok(Self {
            id,
            name: name.to_string(),
            generation,
            queues,
            state: DeviceState::Unconfigured,
            conf: DevConf::default(),
            vqs: Vec::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_silent(&self) -> bool {
        self.conf.enable_silent
    }

    pub fn vchan(&self, vchan: u16) -> Option<&VirtualQueue> {
        self.vqs.get(usize::from(vchan)).and_then(Option::as_ref)
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            capabilities: Capabilities::all(),
            max_vchans: MAX_VCHANS,
            max_desc: MAX_DESC,
            min_desc: MIN_DESC,
            max_sges: match self.state {
                DeviceState::Unconfigured => MAX_SG,
                _ => self.conf.max_sg,
            },
            nb_vchans: self.vqs.len() as u16,
        }
    }

    fn require(&self, allowed: &[DeviceState], expected: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            log::warn!(
                "qdma: {} is {:?}, operation requires {}",
                self.name,
                self.state,
                expected
            );
            Err(Error::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    /// First tracked channel with work in flight
    fn busy_vchan(&self) -> Option<&VirtualQueue> {
        self.vqs.iter().flatten().find(|vq| vq.in_flight() > 0)
    }

    fn check_quiet(&self) -> Result<()> {
        match self.busy_vchan() {
            Some(vq) => Err(Error::InFlight {
                vchan: vq.id(),
                in_flight: vq.in_flight(),
            }),
            None => Ok(()),
        }
    }

    /// Size the channel array, releasing any previous channels
    pub fn configure(&mut self, conf: DevConf) -> Result<()> {
        self.require(
            &[
                DeviceState::Unconfigured,
                DeviceState::Configured,
                DeviceState::Stopped,
            ],
            "unconfigured, configured or stopped",
        )?;
        conf.validate()?;
        self.check_quiet()?;

        self.vqs.clear();
        self.vqs.resize_with(usize::from(conf.nb_vchans), || None);
        self.conf = conf;
        self.state = DeviceState::Configured;

        log::info!(
            "qdma: {} configured {} vchans, silent={}, max_sg={}",
            self.name,
            conf.nb_vchans,
            conf.enable_silent,
            conf.max_sg
        );
        Ok(())
    }

    /// Create or replace one channel
    pub fn vchan_setup(&mut self, vchan: u16, conf: VchanConf) -> Result<()> {
        self.require(
            &[DeviceState::Configured, DeviceState::Stopped],
            "configured or stopped",
        )?;
        let index = usize::from(vchan);
        if index >= self.vqs.len() {
            return Err(Error::NoSuchChannel(vchan));
        }
        let ports = conf.validate()?;
        let hw = self
            .queues
            .get(conf.queue)
            .cloned()
            .ok_or(Error::InvalidArgument("hardware queue index out of range"))?;

        if let Some(old) = &self.vqs[index] {
            if old.in_flight() > 0 {
                return Err(Error::InFlight {
                    vchan,
                    in_flight: old.in_flight(),
                });
            }
        }

        let vq = VirtualQueue::new(
            vchan,
            hw,
            &conf,
            &ports,
            self.generation,
            self.conf.enable_silent,
            self.conf.max_sg,
        )?;
        log::info!(
            "qdma: {} vchan {} on hw queue {}: {:?} nb_desc={} flags={:?}",
            self.name,
            vchan,
            conf.queue,
            conf.direction,
            conf.nb_desc,
            vq.flags()
        );
        self.vqs[index] = Some(vq);
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.require(
            &[DeviceState::Configured, DeviceState::Stopped],
            "configured or stopped",
        )?;
        if let Some(missing) = self.vqs.iter().position(Option::is_none) {
            log::warn!("qdma: {} vchan {} not set up", self.name, missing);
            return Err(Error::InvalidArgument("every vchan must be set up before start"));
        }

        self.state = DeviceState::Started;
        log::info!("qdma: {} started", self.name);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.require(&[DeviceState::Started], "started")?;
        for vq in self.vqs.iter().flatten() {
            if vq.pending() > 0 {
                log::warn!(
                    "qdma: {} vchan {} stopped with {} unsubmitted descriptors",
                    self.name,
                    vq.id(),
                    vq.pending()
                );
            }
        }

        self.state = DeviceState::Stopped;
        log::info!("qdma: {} stopped", self.name);
        Ok(())
    }

    /// Release one channel; closing a closed channel does nothing
    pub fn close_vchan(&mut self, vchan: u16) -> Result<()> {
        let slot = self
            .vqs
            .get_mut(usize::from(vchan))
            .ok_or(Error::NoSuchChannel(vchan))?;
        let Some(vq) = slot.as_ref() else {
            return Ok(());
        };
        if vq.in_flight() > 0 {
            return Err(Error::InFlight {
                vchan,
                in_flight: vq.in_flight(),
            });
        }

        *slot = None;
        log::info!("qdma: {} vchan {} closed", self.name, vchan);
        Ok(())
    }

    /// Release every channel; closing a closed device does nothing
    pub fn close(&mut self) -> Result<()> {
        if self.state == DeviceState::Closed {
            return Ok(());
        }
        self.require(
            &[
                DeviceState::Unconfigured,
                DeviceState::Configured,
                DeviceState::Stopped,
            ],
            "stopped",
        )?;
        self.check_quiet()?;

        self.vqs.clear();
        self.state = DeviceState::Closed;
        log::info!("qdma: {} closed", self.name);
        Ok(())
    }

    fn started_vq(&mut self, vchan: u16) -> Result<&mut VirtualQueue> {
        self.require(&[DeviceState::Started], "started")?;
        self.vqs
            .get_mut(usize::from(vchan))
            .and_then(Option::as_mut)
            .ok_or(Error::NoSuchChannel(vchan))
    }

    /// Queue a copy of `len` bytes, returning its caller index
    pub fn copy(
        &mut self,
        portal: &mut Portal,
        vchan: u16,
        src: u64,
        dst: u64,
        len: u32,
        flags: OpFlags,
    ) -> Result<u16> {
        let limit = self.conf.busy_retry_limit;
        self.started_vq(vchan)?
            .copy(portal, src, dst, len, flags, limit)
    }

    /// Queue a scatter-gather copy, returning the caller index of its last entry
    ///
    /// `indices`, when given, names the caller index of every entry. It is
    /// ignored in silent mode.
    pub fn copy_sg(
        &mut self,
        portal: &mut Portal,
        vchan: u16,
        src: &[SgBuf],
        dst: &[SgBuf],
        indices: Option<&[u16]>,
        flags: OpFlags,
    ) -> Result<u16> {
        let limit = self.conf.busy_retry_limit;
        self.started_vq(vchan)?
            .copy_sg(portal, src, dst, indices, flags, limit)
    }

    /// Push the channel's pending descriptors to hardware
    pub fn submit(&mut self, portal: &mut Portal, vchan: u16) -> Result<()> {
        let limit = self.conf.busy_retry_limit;
        self.started_vq(vchan)?.submit(portal, limit)
    }

    fn harvest_vchan(&mut self, portal: &mut Portal, vchan: u16) -> Result<&mut VirtualQueue> {
        self.require(
            &[DeviceState::Started, DeviceState::Stopped],
            "started or stopped",
        )?;
        if self.conf.enable_silent {
            return Err(Error::NotSupported("completions are not tracked in silent mode"));
        }
        if self.vchan(vchan).is_none() {
            return Err(Error::NoSuchChannel(vchan));
        }

        let ctx = HarvestCtx {
            device: self.id,
            spin_limit: self.conf.busy_retry_limit,
        };
        harvest(&ctx, &mut self.vqs, vchan, portal)?;
        self.vqs
            .get_mut(usize::from(vchan))
            .and_then(Option::as_mut)
            .ok_or(Error::NoSuchChannel(vchan))
    }

    /// Collect finished caller indices in completion order
    ///
    /// Zero is a normal result. On a protocol error the indices already
    /// harvested stay queued for the next call.
    pub fn completed(&mut self, portal: &mut Portal, vchan: u16, out: &mut [u16]) -> Result<usize> {
        let vq = self.harvest_vchan(portal, vchan)?;
        let n = vq.ring.dequeue(out);
        vq.counters.live.completed += n as u64;
        Ok(n)
    }

    /// Collect up to `max` completions, returning the count and the last index
    pub fn completed_last(
        &mut self,
        portal: &mut Portal,
        vchan: u16,
        max: usize,
    ) -> Result<(usize, Option<u16>)> {
        let vq = self.harvest_vchan(portal, vchan)?;
        let max = max.min(vq.scratch.len());
        let n = vq.ring.dequeue(&mut vq.scratch[..max]);
        vq.counters.live.completed += n as u64;
        Ok((n, n.checked_sub(1).map(|last| vq.scratch[last])))
    }

    /// Counters of one channel, or the sum over all channels
    pub fn stats(&self, vchan: Option<u16>) -> Result<VchanStats> {
        match vchan {
            Some(vchan) => self
                .vchan(vchan)
                .map(|vq| vq.counters.report())
                .ok_or(Error::NoSuchChannel(vchan)),
            None => {
                let mut total = VchanStats::default();
                for vq in self.vqs.iter().flatten() {
                    total.accumulate(&vq.counters.report());
                }
                Ok(total)
            }
        }
    }

    pub fn stats_reset(&mut self, vchan: Option<u16>) -> Result<()> {
        match vchan {
            Some(vchan) => {
                let vq = self
                    .vqs
                    .get_mut(usize::from(vchan))
                    .and_then(Option::as_mut)
                    .ok_or(Error::NoSuchChannel(vchan))?;
                vq.counters.reset();
            }
            None => {
                for vq in self.vqs.iter_mut().flatten() {
                    vq.counters.reset();
                }
            }
        }
        Ok(())
    }

    pub fn vchan_status(&self, vchan: u16) -> Result<VchanStatus> {
        let vq = self.vchan(vchan).ok_or(Error::NoSuchChannel(vchan))?;
        Ok(if vq.is_idle() {
            VchanStatus::Idle
        } else {
            VchanStatus::Active
        })
    }

    /// Operations the channel can still take before completions are needed
    pub fn burst_capacity(&self, vchan: u16) -> Result<usize> {
        self.vchan(vchan)
            .map(VirtualQueue::burst_capacity)
            .ok_or(Error::NoSuchChannel(vchan))
    }

    /// Human-readable device state
    pub fn dump(&self, w: &mut impl fmt::Write) -> fmt::Result {
        writeln!(
            w,
            "qdma device {} (id {}, {}): {:?}",
            self.name,
            self.id,
            self.generation.name(),
            self.state
        )?;
        writeln!(
            w,
            "  hw queues: {}, silent: {}, max_sg: {}",
            self.queues.len(),
            self.conf.enable_silent,
            self.conf.max_sg
        )?;
        for (index, vq) in self.vqs.iter().enumerate() {
            match vq {
                Some(vq) => writeln!(
                    w,
                    "  vchan {}: hw queue {} nb_desc {} flags {:?} pending {} pool {}/{} ring {}/{} {}",
                    index,
                    vq.hw.id(),
                    vq.nb_desc(),
                    vq.flags(),
                    vq.pending(),
                    vq.pool.available(),
                    vq.pool.capacity(),
                    vq.ring.len(),
                    vq.ring.usable(),
                    vq.counters.report()
                )?,
                None => writeln!(w, "  vchan {}: closed", index)?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("conf", &self.conf)
            .field("vqs", &self.vqs)
            .finish()
    }
}

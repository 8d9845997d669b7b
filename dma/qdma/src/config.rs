// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Device and channel configuration

use crate::error::{Error, Result};
use crate::wire::{RoutePort, INDEX_SPACE};

/// Most descriptors a channel may keep in flight
pub const MAX_DESC: usize = INDEX_SPACE;
pub const MIN_DESC: usize = 1;
/// Most virtual channels per device
pub const MAX_VCHANS: u16 = 64;
/// Hardware limit on SG entries per job
pub const MAX_SG: usize = 64;
pub const DEFAULT_BUSY_RETRY_LIMIT: u64 = 1_000_000;

const MAX_PORT_ID: u8 = 15;
const MAX_PF_ID: u8 = 1;
const MAX_VF_ID: u8 = 63;

/// Transfer direction of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    MemToMem,
    /// Memory to an external port
    MemToDev,
    /// External port to memory
    DevToMem,
    DevToDev,
}

impl Direction {
    fn src_is_dev(self) -> bool {
        matches!(self, Direction::DevToMem | Direction::DevToDev)
    }

    fn dst_is_dev(self) -> bool {
        matches!(self, Direction::MemToDev | Direction::DevToDev)
    }
}

/// PCIe endpoint addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortParam {
    /// Port core id
    pub port_id: u8,
    /// Physical function
    pub pf_id: u8,
    pub vf_enable: bool,
    /// Virtual function, only used with `vf_enable`
    pub vf_id: u8,
}

impl PortParam {
    /// Check the ranges the routing descriptor can encode
    pub fn validate(&self) -> Result<RoutePort> {
        if self.port_id > MAX_PORT_ID {
            return Err(Error::InvalidArgument("port id exceeds 15"));
        }
        if self.pf_id > MAX_PF_ID {
            return Err(Error::InvalidArgument("pf id exceeds 1"));
        }
        if self.vf_enable && self.vf_id > MAX_VF_ID {
            return Err(Error::InvalidArgument("vf id exceeds 63"));
        }

        Ok(RoutePort {
            port_id: self.port_id,
            pf_id: self.pf_id,
            vf_id: self.vf_enable.then_some(self.vf_id),
        })
    }
}

/// Endpoint of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Port {
    /// Local memory
    #[default]
    None,
    Pcie(PortParam),
}

/// Per-channel driver options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VchanOptions {
    /// Build the frame list once per block, then patch address and length
    pub pre_populate: bool,
    /// Log each descriptor before submission
    pub debug_dump: bool,
    /// Use inline descriptors for plain copies when routing allows
    pub short_fd: bool,
}

impl VchanOptions {
    /// Parse a device-argument string such as `"fle_pre_populate=1,short_fd=1"`
    pub fn parse(args: &str) -> Result<Self> {
        let mut options = Self::default();

        for arg in args.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            let (key, value) = match arg.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (arg, "1"),
            };
            let enabled = match value {
                "1" => true,
                "0" => false,
                _ => return Err(Error::InvalidArgument("channel option value must be 0 or 1")),
            };
            match key {
                "fle_pre_populate" => options.pre_populate = enabled,
                "desc_debug" => options.debug_dump = enabled,
                "short_fd" => options.short_fd = enabled,
                _ => {
                    log::warn!("qdma: unknown channel option {:?}", key);
                    return Err(Error::InvalidArgument("unknown channel option"));
                }
            }
        }

        Ok(options)
    }
}

/// Device-wide configuration
#[derive(Debug, Clone, Copy)]
pub struct DevConf {
    pub nb_vchans: u16,
    /// No completion tracking on any channel
    pub enable_silent: bool,
    /// Largest SG job accepted by `copy_sg`
    pub max_sg: usize,
    /// Consecutive busy results tolerated by `submit`
    pub busy_retry_limit: u64,
}

impl Default for DevConf {
    fn default() -> Self {
        Self {
            nb_vchans: 1,
            enable_silent: false,
            max_sg: MAX_SG,
            busy_retry_limit: DEFAULT_BUSY_RETRY_LIMIT,
        }
    }
}

impl DevConf {
    pub fn validate(&self) -> Result<()> {
        if self.nb_vchans == 0 || self.nb_vchans > MAX_VCHANS {
            return Err(Error::InvalidArgument("vchan count out of range"));
        }
        if self.max_sg > MAX_SG {
            return Err(Error::InvalidArgument("max_sg exceeds hardware limit"));
        }
        if self.busy_retry_limit == 0 {
            return Err(Error::InvalidArgument("busy retry limit must be non-zero"));
        }
        Ok(())
    }
}

/// Channel configuration
#[derive(Debug, Clone, Copy)]
pub struct VchanConf {
    pub direction: Direction,
    /// Most operations in flight at once
    pub nb_desc: usize,
    pub src_port: Port,
    pub dst_port: Port,
    pub options: VchanOptions,
    /// Hardware queue the channel submits to
    pub queue: usize,
}

impl Default for VchanConf {
    fn default() -> Self {
        Self {
            direction: Direction::MemToMem,
            nb_desc: 512,
            src_port: Port::None,
            dst_port: Port::None,
            options: VchanOptions::default(),
            queue: 0,
        }
    }
}

/// Validated route-by-port endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortRoute {
    pub src: Option<RoutePort>,
    pub dst: Option<RoutePort>,
}

impl PortRoute {
    pub fn is_rbp(&self) -> bool {
        self.src.is_some() || self.dst.is_some()
    }
}

impl VchanConf {
    /// Check the channel shape and resolve its port endpoints
    pub fn validate(&self) -> Result<PortRoute> {
        if !(MIN_DESC..=MAX_DESC).contains(&self.nb_desc) {
            return Err(Error::InvalidArgument("nb_desc out of range"));
        }

        let src = resolve_port(self.src_port, self.direction.src_is_dev(), "source")?;
        let dst = resolve_port(self.dst_port, self.direction.dst_is_dev(), "destination")?;
        Ok(PortRoute { src, dst })
    }
}

fn resolve_port(port: Port, is_dev: bool, side: &'static str) -> Result<Option<RoutePort>> {
    match (port, is_dev) {
        (Port::None, false) => Ok(None),
        (Port::Pcie(param), true) => param.validate().map(Some),
        (Port::None, true) => {
            log::warn!("qdma: {} port required for device direction", side);
            Err(Error::InvalidArgument("device endpoint needs a port"))
        }
        (Port::Pcie(_), false) => {
            log::warn!("qdma: {} port given for memory endpoint", side);
            Err(Error::InvalidArgument("memory endpoint cannot take a port"))
        }
    }
}

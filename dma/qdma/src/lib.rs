// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Queue DMA virtual-queue engine
//!
//! Multiplexes many copy and scatter-gather channels onto a few shared
//! hardware frame queues. Jobs are encoded as frame descriptors in one of
//! three wire formats, batched per channel, enqueued in bursts and recovered
//! on the receive path through a per-channel ring of caller indices.
//!
//! ```text
//!            copy / copy_sg                      completed
//!                  │                                 ▲
//!   ┌──────────────▼──────────────┐   ┌──────────────┴──────────────┐
//!   │ vchan: batch ─▶ submit      │   │ rx areas ─▶ route ─▶ ring   │
//!   │        pool (long / SG)     │   │   (2 × 32)   by vchan       │
//!   └──────────────┬──────────────┘   └──────────────▲──────────────┘
//!                  │ enqueue                   pull  │
//!   ┌──────────────▼─────────────────────────────────┴──────────────┐
//!   │                     HwQueue (shared)                          │
//!   └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Hardware access goes through the [`HwQueue`] trait and a per-worker
//! [`Portal`]. [`LoopbackQueue`] implements the trait in software.

pub mod config;
pub mod desc;
pub mod device;
pub mod emulated;
pub mod error;
mod harvest;
pub mod hw;
pub mod pool;
pub mod ring;
pub mod stats;
mod submit;
pub mod vq;
pub mod wire;

pub use config::{DevConf, Direction, Port, PortParam, VchanConf, VchanOptions};
pub use desc::{OpFlags, SgBuf};
pub use device::{Capabilities, Device, DeviceInfo, VchanStatus};
pub use emulated::LoopbackQueue;
pub use error::{DeviceState, Error, ProtocolError, Resource, Result};
pub use hw::{HwQueue, Portal, PullMarker, QueueBusy, RxSlot};
pub use stats::VchanStats;
pub use wire::{FdFormat, FrameDesc, Generation};

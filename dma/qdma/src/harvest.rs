// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Completion harvesting
//!
//! Each channel owns two receive storage areas. A pull fills one area while
//! the other is drained, and every frame is routed by the channel named in
//! its flow context, so channels sharing a hardware queue each see their own
//! completions whichever area a frame landed in.
//!
//! ```text
//!   Empty ──issue──▶ PullIssued ──poll──▶ Filling ──drain──▶ Drained
//!     ▲                  │ (0 frames)                          │
//!     └──────────────────┴─────────────────────────────────────┘
//! ```
//!
//! A portal has one outstanding pull at most. If another channel of the
//! same device holds it, that pull is collected into its owner's area and
//! routed on the spot; a pull held for another device makes this call skip
//! pulling.

use crate::error::{ProtocolError, Result};
use crate::hw::{Portal, PullMarker};
use crate::vq::{RxState, RxStorage, VirtualQueue, PULL_BURST, RX_AREAS};
use crate::wire::{FdFormat, FrameDesc};

/// Device-wide harvest parameters
pub(crate) struct HarvestCtx {
    pub device: u32,
    /// Polls spent waiting on another channel's pull
    pub spin_limit: u64,
}

enum Pull {
    Issued,
    /// An orphaned pull landed in the requested area instead
    Adopted,
    Skipped,
}

fn vq_mut(vqs: &mut [Option<VirtualQueue>], vchan: u16) -> Option<&mut VirtualQueue> {
    vqs.get_mut(usize::from(vchan)).and_then(Option::as_mut)
}

/// Pull and drain completions for `vchan`
///
/// A malformed frame is skipped and counted; the rest of its pull is still
/// routed before the first such error is returned.
pub(crate) fn harvest(
    ctx: &HarvestCtx,
    vqs: &mut [Option<VirtualQueue>],
    vchan: u16,
    portal: &mut Portal,
) -> Result<()> {
    let mut drained = 0;

    while drained < RX_AREAS {
        let Some(vq) = vq_mut(vqs, vchan) else {
            break;
        };
        let area = vq.active_rx;
        let state = vq.rx[area].state;

        match state {
            RxState::Empty | RxState::Drained => match issue_pull(ctx, vqs, vchan, area, portal)? {
                Pull::Issued | Pull::Adopted => {}
                Pull::Skipped => break,
            },
            RxState::PullIssued => {
                let Some(n) = vq.hw.poll_pull(portal, &mut vq.rx[area].slots) else {
                    break;
                };
                portal.clear_active_pull();
                vq.rx[area].landed(n);
                log::trace!("qdma: vchan {} area {} pulled {} frames", vchan, area, n);
                if n == 0 {
                    break;
                }
            }
            RxState::Filling => {
                let other = (area + 1) % RX_AREAS;
                // Look-ahead: the next pull lands while this area drains
                let ahead = if vq.rx[other].state.is_free() {
                    issue_pull(ctx, vqs, vchan, other, portal).map(|_| ())
                } else {
                    Ok(())
                };

                let done = drain_area(vqs, vchan, area)?;
                ahead?;
                if !done {
                    break;
                }
                drained += 1;
            }
        }
    }

    Ok(())
}

fn issue_pull(
    ctx: &HarvestCtx,
    vqs: &mut [Option<VirtualQueue>],
    vchan: u16,
    area: usize,
    portal: &mut Portal,
) -> core::result::Result<Pull, ProtocolError> {
    if let Some(marker) = portal.active_pull() {
        if marker.device != ctx.device {
            log::trace!("qdma: portal {} pull held by device {}", portal.id(), marker.device);
            return Ok(Pull::Skipped);
        }

        let owner_area = usize::from(marker.area);
        let owner_waiting = owner_area < RX_AREAS
            && vq_mut(vqs, marker.vchan)
                .map_or(false, |vq| vq.rx[owner_area].state == RxState::PullIssued);

        if !owner_waiting {
            // Owner was torn down with the pull outstanding
            log::warn!(
                "qdma: vchan {} adopting orphaned pull of vchan {}",
                vchan,
                marker.vchan
            );
            return Ok(if collect(ctx, vqs, vchan, area, portal) {
                Pull::Adopted
            } else {
                Pull::Skipped
            });
        }
        if marker.vchan == vchan {
            return Ok(Pull::Skipped);
        }
        if !collect(ctx, vqs, marker.vchan, owner_area, portal) {
            return Ok(Pull::Skipped);
        }
        // The owner may never poll again; its frames go out now
        flush(vqs, marker.vchan)?;
    }

    let Some(vq) = vq_mut(vqs, vchan) else {
        return Ok(Pull::Skipped);
    };
    match vq.hw.issue_pull(portal, PULL_BURST) {
        Ok(()) => {
            vq.rx[area].state = RxState::PullIssued;
            portal.set_active_pull(PullMarker {
                device: ctx.device,
                vchan,
                area: area as u8,
            });
            Ok(Pull::Issued)
        }
        Err(busy) => {
            log::trace!("qdma: vchan {} pull refused: {}", vchan, busy);
            Ok(Pull::Skipped)
        }
    }
}

/// Wait for the portal's outstanding pull to land in `vchan`'s `area`
fn collect(
    ctx: &HarvestCtx,
    vqs: &mut [Option<VirtualQueue>],
    vchan: u16,
    area: usize,
    portal: &mut Portal,
) -> bool {
    let Some(vq) = vq_mut(vqs, vchan) else {
        return false;
    };
    for _ in 0..ctx.spin_limit {
        if let Some(n) = vq.hw.poll_pull(portal, &mut vq.rx[area].slots) {
            vq.rx[area].landed(n);
            portal.clear_active_pull();
            return true;
        }
        core::hint::spin_loop();
    }
    false
}

/// Drain `vchan`'s landed areas in pull order without pulling again
fn flush(vqs: &mut [Option<VirtualQueue>], vchan: u16) -> core::result::Result<(), ProtocolError> {
    for _ in 0..RX_AREAS {
        let Some(vq) = vq_mut(vqs, vchan) else {
            break;
        };
        let area = vq.active_rx;
        if vq.rx[area].state != RxState::Filling || !drain_area(vqs, vchan, area)? {
            break;
        }
    }
    Ok(())
}

/// Frames routed out of one area
#[derive(Default)]
struct Drain {
    /// Every slot was consumed
    done: bool,
    /// Malformed frames skipped
    errors: u64,
    first_error: Option<ProtocolError>,
}

/// Route the frames of `vchan`'s active area
///
/// `Ok(false)` when a target ring is full; the area keeps its cursor. A
/// fully consumed area is marked drained and the next area becomes active.
fn drain_area(
    vqs: &mut [Option<VirtualQueue>],
    vchan: u16,
    area: usize,
) -> core::result::Result<bool, ProtocolError> {
    let Some(vq) = vq_mut(vqs, vchan) else {
        return Ok(true);
    };
    let mut rx = core::mem::take(&mut vq.rx[area]);

    let drain = drain_slots(vqs, &mut rx);
    if drain.done {
        rx.state = RxState::Drained;
    }

    if let Some(vq) = vq_mut(vqs, vchan) {
        vq.rx[area] = rx;
        if drain.done {
            vq.active_rx = (area + 1) % RX_AREAS;
        }
        vq.counters.live.errors += drain.errors;
    }

    match drain.first_error {
        Some(err) => {
            log::error!(
                "qdma: vchan {} skipped {} malformed frames: {}",
                vchan,
                drain.errors,
                err
            );
            Err(err)
        }
        None => Ok(drain.done),
    }
}

fn drain_slots(vqs: &mut [Option<VirtualQueue>], rx: &mut RxStorage) -> Drain {
    let mut drain = Drain::default();
    while rx.cursor < rx.len {
        let slot = rx.slots[rx.cursor];
        if slot.valid {
            match route_frame(vqs, &slot.fd) {
                Ok(true) => {}
                Ok(false) => return drain,
                Err(err) => {
                    drain.errors += 1;
                    drain.first_error.get_or_insert(err);
                }
            }
        }
        rx.cursor += 1;
    }
    drain.done = true;
    drain
}

fn route_frame(
    vqs: &mut [Option<VirtualQueue>],
    fd: &FrameDesc,
) -> core::result::Result<bool, ProtocolError> {
    let target = fd.flow_context().vchan;
    let vq = vq_mut(vqs, target).ok_or(ProtocolError::UnknownChannel(target))?;
    complete_frame(vq, fd)
}

/// Push a frame's caller indices; `Ok(false)` leaves it for a later call
fn complete_frame(vq: &mut VirtualQueue, fd: &FrameDesc) -> core::result::Result<bool, ProtocolError> {
    let format = fd
        .format()
        .ok_or(ProtocolError::UnknownFormat(fd.format_tag()))?;
    if vq.is_silent() {
        return Ok(true);
    }

    if format == FdFormat::Short {
        return Ok(vq.ring.enqueue(&[fd.caller_index()]).is_ok());
    }

    let slot = fd.flow_context().slot;
    let bad = ProtocolError::BadContext { vchan: vq.id, slot };
    let block = vq.pool.block(slot).ok_or(bad)?;
    let expected = match format {
        FdFormat::Long => block.job_nb == 1,
        _ => block.job_nb >= 1,
    };
    if !expected {
        return Err(bad);
    }

    if vq.ring.enqueue(block.job_indices()).is_err() {
        return Ok(false);
    }
    if let Some(block) = vq.pool.block_mut(slot) {
        block.job_nb = 0;
    }
    vq.pool.release(slot);
    Ok(true)
}

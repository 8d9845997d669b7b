// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Batch submission

use crate::error::{Error, Result};
use crate::hw::Portal;
use crate::vq::VirtualQueue;

impl VirtualQueue {
    /// Hand the pending batch to hardware in bursts
    ///
    /// Busy and zero-acceptance results are retried up to `busy_limit`
    /// consecutive times. On give-up the unaccepted tail is moved to the
    /// front of the batch, in order, for the next call.
    pub(crate) fn submit(&mut self, portal: &mut Portal, busy_limit: u64) -> Result<()> {
        if self.batch_len == 0 {
            return Ok(());
        }

        let burst = self.hw.max_burst().max(1);
        let mut sent = 0;
        let mut retries = 0u64;

        while sent < self.batch_len {
            let end = (sent + burst).min(self.batch_len);
            match self.hw.enqueue(portal, &self.batch[sent..end]) {
                Ok(accepted) if accepted > 0 => {
                    let accepted = accepted.min(end - sent);
                    sent += accepted;
                    self.counters.live.enqueued += accepted as u64;
                    retries = 0;
                }
                _ => {
                    retries += 1;
                    if retries >= busy_limit {
                        break;
                    }
                    core::hint::spin_loop();
                }
            }
        }

        let pending = self.batch_len - sent;
        if pending > 0 {
            self.batch.copy_within(sent..self.batch_len, 0);
        }
        self.batch_len = pending;

        if pending > 0 {
            log::warn!(
                "qdma: vchan {} hw queue {} busy, {} descriptors pending",
                self.id,
                self.hw.id(),
                pending
            );
            return Err(Error::HardwareBusy { pending });
        }

        log::trace!("qdma: vchan {} submitted {} descriptors", self.id, sent);
        Ok(())
    }
}

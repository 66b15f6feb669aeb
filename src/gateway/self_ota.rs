//! Gateway self-update: `POST /update` streams a new gateway image into the
//! gateway's own next partition. No CRC here; the bootloader validates the
//! image before it boots, and `set_boot` is the single switching point, so
//! a failed upload never becomes bootable.

use anyhow::{Context, Result};
use log::{info, warn};

use crate::boot::{BootManager, Partition};

/// What the HTTP layer should do after feeding a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfOtaStep {
    /// Keep streaming.
    Continue,
    /// The image is staged and selected; reset the device now.
    RebootRequired,
}

#[derive(Debug)]
struct ActiveUpdate {
    part: Partition,
    written: u32,
}

/// Streaming self-update state. Owned by the gateway, driven by the HTTP
/// upload handler one chunk at a time.
#[derive(Debug, Default)]
pub struct SelfOta {
    active: Option<ActiveUpdate>,
}

impl SelfOta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.active.is_some()
    }

    /// Feed one chunk of the streamed image. On the last chunk the staging
    /// is finalized and the next boot switches partitions; any error aborts
    /// the staging entirely.
    pub fn update(
        &mut self,
        boot: &mut dyn BootManager,
        chunk: &[u8],
        is_first: bool,
        is_last: bool,
    ) -> Result<SelfOtaStep> {
        if is_first {
            if let Some(stale) = self.active.take() {
                warn!("restarting self-OTA; discarding {} staged bytes", stale.written);
                let _ = boot.abort();
            }
            let part = boot
                .next_staging_partition()
                .context("no staging partition for self-update")?;
            boot.begin(part, part.size)?;
            info!("self-OTA started into partition {}", part.index);
            self.active = Some(ActiveUpdate { part, written: 0 });
        }

        let result = self.write_step(boot, chunk, is_last);
        if result.is_err() {
            self.active = None;
            let _ = boot.abort();
        }
        result
    }

    fn write_step(
        &mut self,
        boot: &mut dyn BootManager,
        chunk: &[u8],
        is_last: bool,
    ) -> Result<SelfOtaStep> {
        let active = self.active.as_mut().context("self-OTA chunk without begin")?;
        boot.write(active.written, chunk)?;
        active.written += chunk.len() as u32;

        if !is_last {
            return Ok(SelfOtaStep::Continue);
        }

        let active = self.active.take().context("self-OTA state lost")?;
        boot.end()?;
        boot.set_boot(active.part)?;
        info!(
            "self-OTA staged {} bytes; partition {} selected for next boot",
            active.written, active.part.index
        );
        Ok(SelfOtaStep::RebootRequired)
    }
}

//! Flash-mode staging of a node firmware upload.
//!
//! The HTTP upload streams into the gateway's inactive boot partition while
//! the connection is live. Sectors are erased on demand, immediately before
//! the first write that crosses into them, never up front: a bulk erase
//! stalls the upload long enough to trip the HTTP client's timeout. The
//! last-erased-sector cursor guarantees each sector is erased exactly once
//! per upload.

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::boot::{BootManager, Partition};
use crate::config::FLASH_SECTOR_SIZE;
use crate::gateway::ota::CRC32;

/// Streaming write cursor over the inactive partition. Runs the image CRC
/// incrementally so the push session can announce it without re-reading.
pub struct FlashStager {
    part: Partition,
    expected_size: Option<u32>,
    written: u32,
    last_erased_sector: Option<u32>,
    digest: crc::Digest<'static, u32>,
}

impl FlashStager {
    /// Open the inactive partition for staging. `expected_size` is the
    /// upload's declared length when the uploader knows it (chunked
    /// transfer encoding does not).
    pub fn begin(boot: &mut dyn BootManager, expected_size: Option<u32>) -> Result<Self> {
        let part = boot
            .next_staging_partition()
            .context("no staging partition available")?;
        if let Some(size) = expected_size {
            if size == 0 {
                anyhow::bail!("empty upload");
            }
            if size > part.size {
                anyhow::bail!("image of {size} bytes exceeds partition size {}", part.size);
            }
        }
        boot.begin(part, expected_size.unwrap_or(part.size))?;
        info!(
            "staging upload into partition {} ({} bytes declared)",
            part.index,
            expected_size.map_or_else(|| String::from("?"), |s| s.to_string())
        );
        Ok(Self {
            part,
            expected_size,
            written: 0,
            last_erased_sector: None,
            digest: CRC32.digest(),
        })
    }

    /// Append one upload chunk, erasing any sector this write is the first
    /// to touch.
    pub fn write(&mut self, boot: &mut dyn BootManager, chunk: &[u8]) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let end = self.written + chunk.len() as u32;
        if end > self.part.size {
            anyhow::bail!("upload overflows partition ({} > {})", end, self.part.size);
        }
        if let Some(expected) = self.expected_size {
            if end > expected {
                anyhow::bail!("upload exceeds declared size of {expected} bytes");
            }
        }

        let first_sector = self.written / FLASH_SECTOR_SIZE;
        let last_sector = (end - 1) / FLASH_SECTOR_SIZE;
        for sector in first_sector..=last_sector {
            if self.last_erased_sector.is_some_and(|done| sector <= done) {
                continue;
            }
            debug!("erasing sector {sector} of partition {}", self.part.index);
            boot.erase(self.part, sector * FLASH_SECTOR_SIZE, FLASH_SECTOR_SIZE)?;
            self.last_erased_sector = Some(sector);
        }

        boot.write(self.written, chunk)?;
        self.digest.update(chunk);
        self.written = end;
        Ok(())
    }

    pub fn written(&self) -> u32 {
        self.written
    }

    pub fn partition(&self) -> Partition {
        self.part
    }

    /// Close the staging write. Returns the partition, the staged image
    /// size, and its CRC-32 for the push session to announce.
    pub fn finish(self, boot: &mut dyn BootManager) -> Result<(Partition, u32, u32)> {
        if self.written == 0 {
            boot.abort()?;
            anyhow::bail!("upload finished without any data");
        }
        if let Some(expected) = self.expected_size {
            if self.written != expected {
                warn!(
                    "upload declared {expected} bytes but delivered {}; using delivered size",
                    self.written
                );
            }
        }
        boot.end()?;
        let crc = self.digest.finalize();
        info!(
            "staging complete: {} bytes in partition {}, crc 0x{crc:08X}",
            self.written, self.part.index
        );
        Ok((self.part, self.written, crc))
    }

    /// Discard the staged data (cancelled or failed upload).
    pub fn cancel(self, boot: &mut dyn BootManager) {
        if let Err(err) = boot.abort() {
            warn!("staging abort failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::MemoryBoot;

    #[test]
    fn test_sectors_erased_on_demand_exactly_once() {
        let mut boot = MemoryBoot::new(4 * FLASH_SECTOR_SIZE);
        let mut stager = FlashStager::begin(&mut boot, Some(10_000)).unwrap();

        // First write touches sector 0 only.
        stager.write(&mut boot, &[0xAB; 1000]).unwrap();
        assert_eq!(boot.erase_log, vec![(1, 0)]);

        // Still inside sector 0: no new erase.
        stager.write(&mut boot, &[0xCD; 1000]).unwrap();
        assert_eq!(boot.erase_log.len(), 1);

        // Crossing into sector 1 erases it immediately before the write.
        stager.write(&mut boot, &[0xEF; 3000]).unwrap();
        assert_eq!(boot.erase_log, vec![(1, 0), (1, FLASH_SECTOR_SIZE)]);

        // A single large write spanning two new sectors erases both.
        stager.write(&mut boot, &[0x11; 5000]).unwrap();
        assert_eq!(
            boot.erase_log,
            vec![
                (1, 0),
                (1, FLASH_SECTOR_SIZE),
                (1, 2 * FLASH_SECTOR_SIZE),
                (1, 3 * FLASH_SECTOR_SIZE),
            ]
        );
    }

    #[test]
    fn test_finish_returns_size_and_crc() {
        let mut boot = MemoryBoot::new(4 * FLASH_SECTOR_SIZE);
        let image: Vec<u8> = (0u32..360).map(|i| i as u8).collect();
        let mut stager = FlashStager::begin(&mut boot, Some(360)).unwrap();
        stager.write(&mut boot, &image[..180]).unwrap();
        stager.write(&mut boot, &image[180..]).unwrap();

        let (part, size, crc) = stager.finish(&mut boot).unwrap();
        assert_eq!(size, 360);
        assert_eq!(crc, CRC32.checksum(&image));
        assert_eq!(&boot.bank(part.index)[..360], &image[..]);
    }

    #[test]
    fn test_declared_size_enforced() {
        let mut boot = MemoryBoot::new(4 * FLASH_SECTOR_SIZE);
        let mut stager = FlashStager::begin(&mut boot, Some(100)).unwrap();
        assert!(stager.write(&mut boot, &[0u8; 101]).is_err());
    }

    #[test]
    fn test_oversized_upload_rejected_at_begin() {
        let mut boot = MemoryBoot::new(FLASH_SECTOR_SIZE);
        assert!(FlashStager::begin(&mut boot, Some(FLASH_SECTOR_SIZE + 1)).is_err());
        assert!(FlashStager::begin(&mut boot, Some(0)).is_err());
    }

    #[test]
    fn test_empty_finish_rejected() {
        let mut boot = MemoryBoot::new(FLASH_SECTOR_SIZE);
        let stager = FlashStager::begin(&mut boot, None).unwrap();
        assert!(stager.finish(&mut boot).is_err());
        // The staging cursor was released; a new upload may begin.
        assert!(FlashStager::begin(&mut boot, None).is_ok());
    }
}

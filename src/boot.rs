//! Dual-bank boot manager seam.
//!
//! The bootloader owns two application partitions; an OTA image is staged
//! into the inactive one and promoted with a single `set_boot` call. The
//! real implementation wraps the platform OTA API; [`MemoryBoot`] is the
//! in-memory simulation backend used on the host and by the test suite.

use anyhow::{Context, Result};

/// One application partition of the dual-bank layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub index: u8,
    pub offset: u32,
    pub size: u32,
}

/// Boot/partition control surface consumed by the OTA pipeline.
///
/// At most one staging write is open at a time (`begin` .. `end`/`abort`);
/// that matches the one-OTA-session-at-a-time rule upstream. All offsets
/// are relative to the start of the partition in question.
pub trait BootManager: Send {
    /// The inactive bank new firmware should be staged into, if any.
    fn next_staging_partition(&self) -> Option<Partition>;

    /// Open a staging write cursor on `part` for an image of `total_size`.
    fn begin(&mut self, part: Partition, total_size: u32) -> Result<()>;

    /// Write `data` at `offset` within the open staging partition.
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<()>;

    /// Close and finalize the staging write.
    fn end(&mut self) -> Result<()>;

    /// Discard an open staging write (failure/abort path).
    fn abort(&mut self) -> Result<()>;

    /// Erase `len` bytes starting at `offset` within `part`. Offsets and
    /// lengths are sector-aligned by the caller.
    fn erase(&mut self, part: Partition, offset: u32, len: u32) -> Result<()>;

    /// Read back staged bytes (the gateway re-reads its staged image while
    /// pushing it to a node).
    fn read(&self, part: Partition, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Select the partition the bootloader loads on next reset. This is the
    /// single switching point; nothing before it affects the running image.
    fn set_boot(&mut self, part: Partition) -> Result<()>;

    /// The partition the current image is executing from.
    fn running_partition(&self) -> Partition;

    /// The partition the bootloader will load on next reset.
    fn boot_partition(&self) -> Partition;
}

/// In-memory dual-bank simulation. Erase fills `0xFF`; every erase is
/// logged so tests can assert the on-demand erase policy.
pub struct MemoryBoot {
    banks: [Vec<u8>; 2],
    bank_size: u32,
    running: u8,
    boot: u8,
    staging: Option<u8>,
    /// `(partition index, offset)` of every erase call, in order.
    pub erase_log: Vec<(u8, u32)>,
}

impl MemoryBoot {
    pub fn new(bank_size: u32) -> Self {
        Self {
            banks: [vec![0xFF; bank_size as usize], vec![0xFF; bank_size as usize]],
            bank_size,
            running: 0,
            boot: 0,
            staging: None,
            erase_log: Vec::new(),
        }
    }

    fn partition(&self, index: u8) -> Partition {
        Partition {
            index,
            offset: u32::from(index) * self.bank_size,
            size: self.bank_size,
        }
    }

    /// Contents of a bank, for test assertions.
    pub fn bank(&self, index: u8) -> &[u8] {
        &self.banks[index as usize]
    }

    /// Simulate a clean reset: the bootloader loads the boot partition.
    pub fn simulate_reboot(&mut self) {
        self.running = self.boot;
        self.staging = None;
    }
}

impl BootManager for MemoryBoot {
    fn next_staging_partition(&self) -> Option<Partition> {
        Some(self.partition(1 - self.running))
    }

    fn begin(&mut self, part: Partition, total_size: u32) -> Result<()> {
        if self.staging.is_some() {
            anyhow::bail!("staging write already open");
        }
        if part.index == self.running {
            anyhow::bail!("refusing to stage over the running partition");
        }
        if total_size > part.size {
            anyhow::bail!("image of {} bytes exceeds partition size {}", total_size, part.size);
        }
        self.staging = Some(part.index);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let index = self.staging.context("no staging write open")?;
        let bank = &mut self.banks[index as usize];
        let start = offset as usize;
        let end = start + data.len();
        if end > bank.len() {
            anyhow::bail!("write past partition end");
        }
        bank[start..end].copy_from_slice(data);
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        self.staging.take().context("no staging write open")?;
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.staging = None;
        Ok(())
    }

    fn erase(&mut self, part: Partition, offset: u32, len: u32) -> Result<()> {
        let bank = &mut self.banks[part.index as usize];
        let start = offset as usize;
        let end = start + len as usize;
        if end > bank.len() {
            anyhow::bail!("erase past partition end");
        }
        bank[start..end].fill(0xFF);
        self.erase_log.push((part.index, offset));
        Ok(())
    }

    fn read(&self, part: Partition, offset: u32, buf: &mut [u8]) -> Result<()> {
        let bank = &self.banks[part.index as usize];
        let start = offset as usize;
        let end = start + buf.len();
        if end > bank.len() {
            anyhow::bail!("read past partition end");
        }
        buf.copy_from_slice(&bank[start..end]);
        Ok(())
    }

    fn set_boot(&mut self, part: Partition) -> Result<()> {
        self.boot = part.index;
        Ok(())
    }

    fn running_partition(&self) -> Partition {
        self.partition(self.running)
    }

    fn boot_partition(&self) -> Partition {
        self.partition(self.boot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_and_promote() {
        let mut boot = MemoryBoot::new(4096);
        let next = boot.next_staging_partition().unwrap();
        assert_ne!(next.index, boot.running_partition().index);

        boot.begin(next, 4).unwrap();
        boot.write(0, &[1, 2, 3, 4]).unwrap();
        boot.end().unwrap();
        boot.set_boot(next).unwrap();
        assert_ne!(boot.boot_partition(), boot.running_partition());

        boot.simulate_reboot();
        assert_eq!(boot.boot_partition(), boot.running_partition());
        assert_eq!(&boot.bank(next.index)[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_double_begin_rejected() {
        let mut boot = MemoryBoot::new(4096);
        let next = boot.next_staging_partition().unwrap();
        boot.begin(next, 16).unwrap();
        assert!(boot.begin(next, 16).is_err());
        boot.abort().unwrap();
        assert!(boot.begin(next, 16).is_ok());
    }

    #[test]
    fn test_oversized_image_rejected() {
        let mut boot = MemoryBoot::new(1024);
        let next = boot.next_staging_partition().unwrap();
        assert!(boot.begin(next, 2048).is_err());
    }

    #[test]
    fn test_erase_fills_and_logs() {
        let mut boot = MemoryBoot::new(8192);
        let next = boot.next_staging_partition().unwrap();
        boot.begin(next, 8).unwrap();
        boot.write(0, &[0u8; 8]).unwrap();
        boot.erase(next, 0, 4096).unwrap();
        assert_eq!(&boot.bank(next.index)[..8], &[0xFF; 8]);
        assert_eq!(boot.erase_log, vec![(next.index, 0)]);
    }
}

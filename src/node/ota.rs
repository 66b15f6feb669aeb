//! Node-side OTA receiver.
//!
//! Push mode is the primary path: the gateway streams `OtaData` chunks and
//! the receiver writes them straight into the inactive partition, running
//! CRC-32 as it goes. Pull mode survives as the legacy path: the node
//! solicits chunks by offset and verifies an SHA-256 digest instead.
//!
//! Activation is two-phase: `set_boot` plus a persisted `pending` marker,
//! then a reboot. Whether the bootloader kept the new image or rolled
//! back is decided at the next startup by [`boot_verdict`].

use anyhow::Result;
use log::{info, warn};
use sha2::{Digest as ShaDigest, Sha256};

use crate::boot::{BootManager, Partition};
use crate::gateway::ota::CRC32;
use crate::protocol::payloads::{
    AckStatus, OtaAck, OtaBegin, OtaComplete, OtaData, OtaErrorCode, OtaFailed, OtaRequest,
};
use crate::protocol::Payload;
use crate::storage::{self, KvStore};
use crate::Mac;

/// Firmware image descriptor, at offset 0 of every OmniaPi image:
/// magic `"OPFW"` then the packed version, both little-endian.
pub const IMAGE_MAGIC: u32 = 0x4F504657;

/// Parse the packed version out of an image's leading bytes. Returns zero
/// for images without a descriptor (the version is then simply unknown).
pub fn image_version(head: &[u8]) -> u32 {
    if head.len() < 8 {
        return 0;
    }
    let magic = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    if magic != IMAGE_MAGIC {
        return 0;
    }
    u32::from_le_bytes([head[4], head[5], head[6], head[7]])
}

/// Build the ≤32-byte wire error message.
fn err_msg(text: &str) -> heapless::String<32> {
    let mut out = heapless::String::new();
    let take = text.len().min(32);
    // The catalog messages are plain ASCII, the cut is always on a char
    // boundary.
    let _ = out.push_str(&text[..take]);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverMode {
    Push,
    Pull,
}

/// Outcome of feeding one `OtaData` frame in push mode.
pub enum DataOutcome {
    /// Send this ack (OK / duplicate-OK / gap NAK).
    Ack(OtaAck),
    /// Unrecoverable; the session was torn down. Send the ack, the
    /// gateway fails its side.
    Fatal(OtaAck),
}

/// An in-flight receive session on the node.
pub struct OtaReceiver {
    mode: ReceiverMode,
    mac: Mac,
    update_partition: Partition,
    total_size: u32,
    chunk_size: u16,
    total_chunks: u16,
    expected_crc: u32,
    expected_sha: Option<[u8; 32]>,
    received_size: u32,
    expected_next_chunk: u16,
    new_version: u32,
    crc: crc::Digest<'static, u32>,
    sha: Sha256,
    logged_decile: u8,
}

impl std::fmt::Debug for OtaReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtaReceiver")
            .field("mode", &self.mode)
            .field("mac", &self.mac)
            .field("update_partition", &self.update_partition)
            .field("total_size", &self.total_size)
            .field("chunk_size", &self.chunk_size)
            .field("total_chunks", &self.total_chunks)
            .field("expected_crc", &self.expected_crc)
            .field("expected_sha", &self.expected_sha)
            .field("received_size", &self.received_size)
            .field("expected_next_chunk", &self.expected_next_chunk)
            .field("new_version", &self.new_version)
            .field("logged_decile", &self.logged_decile)
            .finish()
    }
}

impl OtaReceiver {
    /// Accept a push session. On any refusal the caller answers
    /// `OtaAck{status: ABORT}` with the returned reason logged.
    pub fn begin_push(
        mac: Mac,
        boot: &mut dyn BootManager,
        begin: &OtaBegin,
    ) -> Result<OtaReceiver, (OtaErrorCode, &'static str)> {
        let Some(part) = boot.next_staging_partition() else {
            return Err((OtaErrorCode::PartitionError, "no staging partition"));
        };
        if begin.total_size == 0 || begin.total_size > part.size {
            return Err((OtaErrorCode::PartitionError, "image does not fit partition"));
        }
        if begin.chunk_size == 0 {
            return Err((OtaErrorCode::DownloadFailed, "zero chunk size"));
        }
        if let Err(err) = boot.begin(part, begin.total_size) {
            warn!("ota begin failed: {err}");
            return Err((OtaErrorCode::WriteFailed, "partition open failed"));
        }
        info!(
            "push OTA accepted: {} bytes in {} chunks into partition {}",
            begin.total_size, begin.total_chunks, part.index
        );
        Ok(OtaReceiver {
            mode: ReceiverMode::Push,
            mac,
            update_partition: part,
            total_size: begin.total_size,
            chunk_size: begin.chunk_size,
            total_chunks: begin.total_chunks,
            expected_crc: begin.crc32,
            expected_sha: None,
            received_size: 0,
            expected_next_chunk: 0,
            new_version: 0,
            crc: CRC32.digest(),
            sha: Sha256::new(),
            logged_decile: 0,
        })
    }

    /// The READY ack for an accepted push session.
    pub fn ready_ack(&self) -> OtaAck {
        OtaAck { mac: self.mac, chunk_index: 0, status: AckStatus::Ready }
    }

    pub fn mode(&self) -> ReceiverMode {
        self.mode
    }

    pub fn received_size(&self) -> u32 {
        self.received_size
    }

    /// Feed one push chunk.
    pub fn handle_data(&mut self, boot: &mut dyn BootManager, data: &OtaData) -> DataOutcome {
        let chunk_index = (data.offset / u32::from(self.chunk_size)) as u16;

        if data.offset < self.received_size {
            // Retransmit of a chunk we already wrote (its ack was lost).
            // Re-ack so the gateway makes progress; write nothing.
            return DataOutcome::Ack(OtaAck {
                mac: self.mac,
                chunk_index,
                status: AckStatus::Ok,
            });
        }
        if data.offset > self.received_size {
            // Gap: a chunk went missing. NAK so the gateway resends it.
            warn!(
                "ota gap: got chunk {chunk_index}, expected {} (offset {}, {} received)",
                self.expected_next_chunk, data.offset, self.received_size
            );
            return DataOutcome::Ack(OtaAck {
                mac: self.mac,
                chunk_index,
                status: AckStatus::CrcError,
            });
        }

        if data.offset == 0 {
            self.new_version = image_version(&data.data);
        }
        if let Err(err) = boot.write(data.offset, &data.data) {
            warn!("ota write failed at {}: {err}", data.offset);
            let _ = boot.abort();
            return DataOutcome::Fatal(OtaAck {
                mac: self.mac,
                chunk_index,
                status: AckStatus::WriteError,
            });
        }
        self.crc.update(&data.data);
        self.received_size += data.data.len() as u32;
        self.expected_next_chunk = chunk_index + 1;

        let progress = (self.received_size as u64 * 100 / u64::from(self.total_size)) as u8;
        if progress / 10 > self.logged_decile {
            self.logged_decile = progress / 10;
            info!(
                "ota receive: {progress}% (chunk {}/{}, {} bytes)",
                self.expected_next_chunk, self.total_chunks, self.received_size
            );
        }

        DataOutcome::Ack(OtaAck { mac: self.mac, chunk_index, status: AckStatus::Ok })
    }

    /// Finish a push session: verify size and CRC, promote the partition,
    /// persist the pending marker. Returns the staged image's version for
    /// the `OtaComplete` reply; the caller then drains the frame and
    /// reboots.
    pub fn handle_end(
        self,
        boot: &mut dyn BootManager,
        kv: &mut dyn KvStore,
        announced_crc: u32,
    ) -> Result<u32, OtaFailed> {
        let OtaReceiver {
            mac,
            update_partition,
            total_size,
            expected_crc,
            received_size,
            new_version,
            crc,
            ..
        } = self;
        let failure = |code, message| OtaFailed { mac, code, message: err_msg(message) };

        if received_size != total_size {
            let _ = boot.abort();
            return Err(failure(OtaErrorCode::DownloadFailed, "incomplete"));
        }
        let computed = crc.finalize();
        if computed != announced_crc || computed != expected_crc {
            warn!(
                "ota CRC mismatch: computed 0x{computed:08X}, announced 0x{announced_crc:08X}"
            );
            let _ = boot.abort();
            return Err(failure(OtaErrorCode::Checksum, "CRC mismatch"));
        }
        if let Err(err) = boot.end() {
            warn!("ota finalize failed: {err}");
            return Err(failure(OtaErrorCode::WriteFailed, "finalize failed"));
        }
        if let Err(err) = boot.set_boot(update_partition) {
            warn!("set_boot failed: {err}");
            return Err(failure(OtaErrorCode::BootFailed, "set_boot failed"));
        }
        if let Err(err) = storage::set_ota_pending(kv, new_version) {
            warn!("persisting ota marker failed: {err}");
        }
        info!(
            "ota staged and selected: partition {}, version {}",
            update_partition.index,
            crate::Version::unpack(new_version)
        );
        Ok(new_version)
    }

    /// Tear down an unfinished session (abort frame, superseding OtaBegin,
    /// or local failure).
    pub fn teardown(self, boot: &mut dyn BootManager) {
        let _ = boot.abort();
    }

    // ── Legacy pull mode ──────────────────────────────────────────

    /// Start a node-initiated pull session. The node got `total_size`,
    /// the image digest, and the target version from the legacy update
    /// announcement.
    pub fn begin_pull(
        mac: Mac,
        boot: &mut dyn BootManager,
        total_size: u32,
        sha256: [u8; 32],
        new_version: u32,
        chunk_size: u16,
    ) -> Result<OtaReceiver, (OtaErrorCode, &'static str)> {
        let Some(part) = boot.next_staging_partition() else {
            return Err((OtaErrorCode::PartitionError, "no staging partition"));
        };
        if total_size == 0 || total_size > part.size {
            return Err((OtaErrorCode::PartitionError, "image does not fit partition"));
        }
        if boot.begin(part, total_size).is_err() {
            return Err((OtaErrorCode::WriteFailed, "partition open failed"));
        }
        Ok(OtaReceiver {
            mode: ReceiverMode::Pull,
            mac,
            update_partition: part,
            total_size,
            chunk_size,
            total_chunks: total_size.div_ceil(u32::from(chunk_size)) as u16,
            expected_crc: 0,
            expected_sha: Some(sha256),
            received_size: 0,
            expected_next_chunk: 0,
            new_version,
            crc: CRC32.digest(),
            sha: Sha256::new(),
            logged_decile: 0,
        })
    }

    /// The next chunk solicitation, or `None` once everything arrived.
    pub fn next_request(&self) -> Option<OtaRequest> {
        if self.received_size >= self.total_size {
            return None;
        }
        let remaining = self.total_size - self.received_size;
        Some(OtaRequest {
            offset: self.received_size,
            length: u32::from(self.chunk_size).min(remaining) as u16,
        })
    }

    /// Feed one solicited chunk. Out-of-order data is dropped; the node
    /// simply re-requests.
    pub fn handle_pull_data(&mut self, boot: &mut dyn BootManager, data: &OtaData) -> Result<()> {
        if data.offset != self.received_size {
            anyhow::bail!("unsolicited offset {} (expected {})", data.offset, self.received_size);
        }
        boot.write(data.offset, &data.data)?;
        self.sha.update(&data.data);
        self.received_size += data.data.len() as u32;
        self.expected_next_chunk += 1;
        Ok(())
    }

    /// Verify the SHA-256 digest and promote the partition (pull mode).
    pub fn finish_pull(
        self,
        boot: &mut dyn BootManager,
        kv: &mut dyn KvStore,
    ) -> Result<u32, OtaFailed> {
        let OtaReceiver {
            mac,
            update_partition,
            total_size,
            expected_sha,
            received_size,
            new_version,
            sha,
            ..
        } = self;
        let failure = |code, message| OtaFailed { mac, code, message: err_msg(message) };

        if received_size != total_size {
            let _ = boot.abort();
            return Err(failure(OtaErrorCode::DownloadFailed, "incomplete"));
        }
        let digest: [u8; 32] = sha.finalize().into();
        if Some(digest) != expected_sha {
            let _ = boot.abort();
            return Err(failure(OtaErrorCode::Checksum, "SHA-256 mismatch"));
        }
        if boot.end().is_err() {
            return Err(failure(OtaErrorCode::WriteFailed, "finalize failed"));
        }
        if boot.set_boot(update_partition).is_err() {
            return Err(failure(OtaErrorCode::BootFailed, "set_boot failed"));
        }
        if let Err(err) = storage::set_ota_pending(kv, new_version) {
            warn!("persisting ota marker failed: {err}");
        }
        Ok(new_version)
    }
}

/// Startup check: if an update was pending, decide whether the bootloader
/// kept it or rolled back, clear the marker, and return the frame to send
/// once the mesh is up.
pub fn boot_verdict(kv: &mut dyn KvStore, boot: &dyn BootManager, mac: Mac) -> Result<Option<Payload>> {
    let Some(new_version) = storage::ota_pending(kv)? else {
        return Ok(None);
    };
    storage::clear_ota_pending(kv)?;

    if boot.running_partition() == boot.boot_partition() {
        info!(
            "boot verdict: new image live (version {})",
            crate::Version::unpack(new_version)
        );
        Ok(Some(Payload::OtaComplete(OtaComplete { mac, new_version })))
    } else {
        warn!("boot verdict: bootloader rolled back the update");
        Ok(Some(Payload::OtaFailed(OtaFailed {
            mac,
            code: OtaErrorCode::BootFailed,
            message: err_msg("rolled back"),
        })))
    }
}

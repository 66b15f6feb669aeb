//! Leaf-node runtime.
//!
//! A [`Node`] owns its collaborators (transport, KV store, boot manager,
//! attached device) and runs a single message loop: decode a frame, run
//! the per-type handler, reply toward the mesh root. Reboots are modelled
//! as a pending action the embedding firmware executes after the reply
//! frame has had time to drain.

pub mod commissioning;
pub mod ota;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::boot::BootManager;
use crate::config::NodeConfig;
use crate::device::{Device, DeviceError};
use crate::protocol::payloads::{
    AckStatus, CommissionAck, DecommissionAck, HeartbeatAck, LedAck, OtaAck, OtaComplete,
    RelayAck, ScanResponse,
};
use crate::protocol::{Message, Payload};
use crate::storage::KvStore;
use crate::transport::{ensure_mtu, Transport, TransportError};
use crate::Mac;

use commissioning::{Commissioning, MeshMembership};
use ota::{DataOutcome, OtaReceiver, ReceiverMode};

/// Why the node wants to reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootReason {
    /// Join the production mesh with freshly persisted credentials.
    Commissioned,
    /// Return to the discovery mesh after a credential wipe.
    Decommissioned,
    /// Boot the newly staged firmware image.
    OtaActivate,
}

pub struct Node {
    cfg: NodeConfig,
    mac: Mac,
    transport: Arc<dyn Transport>,
    kv: Box<dyn KvStore>,
    boot: Box<dyn BootManager>,
    device: Box<dyn Device>,
    commissioning: Commissioning,
    ota: Option<OtaReceiver>,
    /// Post-reboot OTA verdict, flushed on the first poll after the mesh
    /// is up.
    boot_report: Option<Payload>,
    pending_reboot: Option<(Instant, RebootReason)>,
    discovered_channel: Option<u8>,
    link_rssi: i8,
    seq: u8,
}

impl Node {
    pub fn new(
        cfg: NodeConfig,
        mac: Mac,
        transport: Arc<dyn Transport>,
        mut kv: Box<dyn KvStore>,
        boot: Box<dyn BootManager>,
        device: Box<dyn Device>,
    ) -> Result<Self> {
        let commissioning = Commissioning::from_storage(kv.as_ref())?;
        let boot_report = ota::boot_verdict(kv.as_mut(), boot.as_ref(), mac)?;
        info!(
            "node {mac} up: version {}, {}",
            cfg.firmware_version,
            if commissioning.is_commissioned() { "production mesh" } else { "discovery mesh" }
        );
        Ok(Self {
            cfg,
            mac,
            transport,
            kv,
            boot,
            device,
            commissioning,
            ota: None,
            boot_report,
            pending_reboot: None,
            discovered_channel: None,
            link_rssi: 0,
            seq: 0,
        })
    }

    pub fn mac(&self) -> Mac {
        self.mac
    }

    pub fn is_commissioned(&self) -> bool {
        self.commissioning.is_commissioned()
    }

    /// Which mesh the radio should (re)join.
    pub fn membership(&self) -> MeshMembership {
        self.commissioning.membership()
    }

    /// Signal strength to the current parent, as reported by the radio.
    pub fn set_link_rssi(&mut self, rssi: i8) {
        self.link_rssi = rssi;
    }

    /// Channel learned from a `DiscoveryAck`, for radio re-sync.
    pub fn discovered_channel(&self) -> Option<u8> {
        self.discovered_channel
    }

    /// Reboot that is due now, if any. The embedding firmware resets the
    /// chip; tests rebuild the [`Node`] from its parts instead.
    pub fn due_reboot(&self) -> Option<RebootReason> {
        self.pending_reboot
            .filter(|(at, _)| Instant::now() >= *at)
            .map(|(_, reason)| reason)
    }

    /// The reboot scheduled, due or not (drain may still be running).
    pub fn scheduled_reboot(&self) -> Option<RebootReason> {
        self.pending_reboot.map(|(_, reason)| reason)
    }

    /// Hand the persistent collaborators back, e.g. to rebuild the node
    /// after a simulated reboot.
    pub fn into_parts(self) -> (Box<dyn KvStore>, Box<dyn BootManager>, Box<dyn Device>) {
        (self.kv, self.boot, self.device)
    }

    /// Drain and handle every pending frame. Returns how many were handled.
    pub fn poll(&mut self) -> Result<usize> {
        if let Some(report) = self.boot_report.take() {
            if let Err(err) = self.send(&report) {
                warn!("boot report send failed, will retry: {err}");
                self.boot_report = Some(report);
            }
        }

        let mut handled = 0;
        loop {
            match self.transport.recv() {
                Ok((src, bytes)) => {
                    self.handle_frame(src, &bytes);
                    handled += 1;
                }
                Err(TransportError::WouldBlock) => return Ok(handled),
                Err(err) => {
                    warn!("transport recv failed: {err}");
                    return Ok(handled);
                }
            }
        }
    }

    fn handle_frame(&mut self, src: Mac, bytes: &[u8]) {
        let msg = match Message::decode(bytes) {
            Ok(msg) => msg,
            Err(err) => {
                debug!("dropping malformed frame from {src}: {err}");
                return;
            }
        };
        let payload = match Payload::decode(&msg) {
            Ok(payload) => payload,
            Err(err) => {
                debug!("dropping {:?} from {src}: {err}", msg.msg_type);
                return;
            }
        };
        self.handle_payload(payload);
    }

    fn handle_payload(&mut self, payload: Payload) {
        match payload {
            Payload::Heartbeat => self.reply_heartbeat(),
            Payload::ScanRequest => self.reply_scan(),
            Payload::DiscoveryAck(ack) => {
                debug!("gateway reports channel {}", ack.channel);
                self.discovered_channel = Some(ack.channel);
            }
            Payload::Commission(cmd) => {
                if cmd.target != self.mac {
                    return;
                }
                self.apply_commission(&cmd);
            }
            Payload::Decommission(cmd) => {
                if cmd.target != self.mac {
                    return;
                }
                self.apply_decommission();
            }
            Payload::RelayCommand(cmd) => match self.device.apply_relay(cmd.channel, cmd.action) {
                Ok(state) => {
                    let ack = Payload::RelayAck(RelayAck { channel: cmd.channel, state });
                    self.send_logged(&ack);
                }
                Err(DeviceError::BadChannel(ch)) => warn!("relay command for bad channel {ch}"),
                Err(err) => warn!("relay command failed: {err}"),
            },
            Payload::LedCommand(cmd) => match self.device.apply_led(cmd.action, &cmd.params) {
                Ok(state) => self.send_logged(&Payload::LedAck(LedAck { state })),
                Err(err) => warn!("led command failed: {err}"),
            },
            Payload::OtaBegin(begin) => {
                if begin.target != self.mac {
                    return;
                }
                self.start_ota_session(&begin);
            }
            Payload::OtaData(data) => self.handle_ota_data(&data),
            Payload::OtaEnd(end) => {
                if end.target != self.mac {
                    return;
                }
                self.finish_ota_session(end.crc32);
            }
            Payload::OtaAbort(_) => {
                if let Some(session) = self.ota.take() {
                    warn!("ota session aborted by gateway");
                    session.teardown(self.boot.as_mut());
                }
            }
            other => debug!("ignoring {:?} (not addressed to leaf nodes)", other.msg_type()),
        }
    }

    fn reply_heartbeat(&mut self) {
        let mut version = heapless::String::new();
        // "255.255.255" fits the 16-byte field.
        let _ = version.push_str(&self.cfg.firmware_version.to_string());
        let ack = Payload::HeartbeatAck(HeartbeatAck {
            device_type: self.device.device_type(),
            version,
        });
        self.send_logged(&ack);
    }

    fn reply_scan(&mut self) {
        let response = Payload::ScanResponse(ScanResponse {
            mac: self.mac,
            device_type: self.device.device_type(),
            fw_version: self.cfg.firmware_version.pack(),
            commissioned: self.commissioning.is_commissioned(),
            rssi: self.link_rssi,
        });
        self.send_logged(&response);
    }

    fn apply_commission(&mut self, cmd: &crate::protocol::payloads::Commission) {
        // Persist first, ack second: if we crash in between, the gateway's
        // retry finds an already-commissioned node and gets a fresh ack.
        let status = match self.commissioning.apply_commission(self.kv.as_mut(), cmd) {
            Ok(()) => 0,
            Err(err) => {
                warn!("commissioning failed: {err}");
                1
            }
        };
        self.send_logged(&Payload::CommissionAck(CommissionAck { mac: self.mac, status }));
        if status == 0 {
            self.schedule_reboot(RebootReason::Commissioned);
        }
    }

    fn apply_decommission(&mut self) {
        self.send_logged(&Payload::DecommissionAck(DecommissionAck {
            mac: self.mac,
            status: 0,
        }));
        if let Err(err) = self.commissioning.decommission(self.kv.as_mut()) {
            warn!("credential wipe failed: {err}");
            return;
        }
        self.schedule_reboot(RebootReason::Decommissioned);
    }

    /// Long-press of the physical button: same wipe as a Decommission
    /// frame, minus the ack (there is no requester).
    pub fn factory_reset(&mut self) -> Result<()> {
        self.commissioning.decommission(self.kv.as_mut())?;
        self.schedule_reboot(RebootReason::Decommissioned);
        Ok(())
    }

    fn start_ota_session(&mut self, begin: &crate::protocol::payloads::OtaBegin) {
        // Idempotent restart: a new OtaBegin supersedes whatever was
        // in flight.
        if let Some(stale) = self.ota.take() {
            warn!("ota restart: discarding in-flight session");
            stale.teardown(self.boot.as_mut());
        }
        match OtaReceiver::begin_push(self.mac, self.boot.as_mut(), begin) {
            Ok(session) => {
                let ready = Payload::OtaAck(session.ready_ack());
                self.ota = Some(session);
                self.send_logged(&ready);
            }
            Err((code, reason)) => {
                warn!("refusing ota session: {reason} ({code:?})");
                self.send_logged(&Payload::OtaAck(OtaAck {
                    mac: self.mac,
                    chunk_index: 0,
                    status: AckStatus::Abort,
                }));
            }
        }
    }

    fn handle_ota_data(&mut self, data: &crate::protocol::payloads::OtaData) {
        let Some(session) = self.ota.as_mut() else {
            debug!("ota data without a session, ignoring");
            return;
        };
        match session.mode() {
            ReceiverMode::Push => match session.handle_data(self.boot.as_mut(), data) {
                DataOutcome::Ack(ack) => self.send_logged(&Payload::OtaAck(ack)),
                DataOutcome::Fatal(ack) => {
                    self.ota = None;
                    self.send_logged(&Payload::OtaAck(ack));
                }
            },
            ReceiverMode::Pull => {
                if let Err(err) = session.handle_pull_data(self.boot.as_mut(), data) {
                    debug!("pull chunk rejected: {err}");
                }
                match session.next_request() {
                    Some(request) => self.send_logged(&Payload::OtaRequest(request)),
                    None => self.finish_pull_session(),
                }
            }
        }
    }

    fn finish_ota_session(&mut self, announced_crc: u32) {
        let Some(session) = self.ota.take() else {
            debug!("ota end without a session, ignoring");
            return;
        };
        match session.handle_end(self.boot.as_mut(), self.kv.as_mut(), announced_crc) {
            Ok(new_version) => {
                self.send_logged(&Payload::OtaComplete(OtaComplete {
                    mac: self.mac,
                    new_version,
                }));
                self.schedule_reboot(RebootReason::OtaActivate);
            }
            Err(failed) => self.send_logged(&Payload::OtaFailed(failed)),
        }
    }

    fn finish_pull_session(&mut self) {
        let Some(session) = self.ota.take() else {
            return;
        };
        match session.finish_pull(self.boot.as_mut(), self.kv.as_mut()) {
            Ok(new_version) => {
                self.send_logged(&Payload::OtaComplete(OtaComplete {
                    mac: self.mac,
                    new_version,
                }));
                self.schedule_reboot(RebootReason::OtaActivate);
            }
            Err(failed) => self.send_logged(&Payload::OtaFailed(failed)),
        }
    }

    /// Kick off a legacy pull update from an out-of-band announcement.
    pub fn start_pull_update(
        &mut self,
        total_size: u32,
        sha256: [u8; 32],
        new_version: u32,
        chunk_size: u16,
    ) -> Result<()> {
        if let Some(stale) = self.ota.take() {
            stale.teardown(self.boot.as_mut());
        }
        let session = OtaReceiver::begin_pull(
            self.mac,
            self.boot.as_mut(),
            total_size,
            sha256,
            new_version,
            chunk_size,
        )
        .map_err(|(code, reason)| anyhow::anyhow!("{reason} ({code:?})"))?;
        let first = session.next_request().context("nothing to request")?;
        self.ota = Some(session);
        self.send(&Payload::OtaRequest(first))
    }

    /// Re-sync probe: ask the gateway which channel the mesh is on.
    pub fn probe_channel(&mut self) -> Result<()> {
        self.send(&Payload::Discovery)
    }

    fn schedule_reboot(&mut self, reason: RebootReason) {
        info!("reboot scheduled ({reason:?}) after reply drain");
        self.pending_reboot = Some((Instant::now() + self.cfg.reboot_drain, reason));
    }

    fn send(&mut self, payload: &Payload) -> Result<()> {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        let bytes = payload.encode(seq)?.encode();
        ensure_mtu(&bytes)?;
        self.transport.send_to_root(&bytes)?;
        Ok(())
    }

    fn send_logged(&mut self, payload: &Payload) {
        if let Err(err) = self.send(payload) {
            warn!("send of {:?} failed: {err}", payload.msg_type());
        }
    }
}

//! Gateway runtime: the mesh root.
//!
//! A single [`Gateway`] owns every shared subsystem (registry, OTA
//! orchestrator, MQTT publisher, boot manager) and hands references into a
//! small fixed set of long-lived tasks:
//!
//! * the radio poller, which only decodes and enqueues frames,
//! * the dispatcher, which drains the queue and runs per-type handlers,
//! * the heartbeat/sweeper, which broadcasts liveness probes and expires
//!   silent peers,
//! * an OTA worker, spawned per session.
//!
//! The HTTP server and MQTT client are collaborators that call into the
//! public API from their own loops.

pub mod mqtt;
pub mod ota;
pub mod self_ota;
pub mod staging;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::boot::BootManager;
use crate::config::GatewayConfig;
use crate::protocol::payloads::{
    Commission, Decommission, DiscoveryAck, LedCommand, RelayCommand,
};
use crate::protocol::{FramingError, Message, Payload};
use crate::registry::NodeRegistry;
use crate::storage::NetworkCredentials;
use crate::transport::{ensure_mtu, Transport, TransportError};
use crate::version::Version;
use crate::Mac;

use mqtt::{topics, CommandRequest, Publisher};
use ota::{OtaOrchestrator, OtaStatus, OtaWorkerCtx};
use self_ota::{SelfOta, SelfOtaStep};
use staging::FlashStager;

/// Frame counters shared by every task. Atomics, no locking.
#[derive(Debug, Default)]
pub struct Counters {
    pub rx_count: AtomicU64,
    pub tx_count: AtomicU64,
    pub malformed_count: AtomicU64,
}

/// Encode and transmit one payload, bumping the tx counter.
pub(crate) fn send_frame(
    transport: &dyn Transport,
    dest: Mac,
    payload: &Payload,
    seq: u8,
    counters: &Counters,
) -> Result<()> {
    let msg = payload.encode(seq)?;
    let bytes = msg.encode();
    ensure_mtu(&bytes)?;
    transport.send_to(dest, &bytes)?;
    counters.tx_count.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

struct GatewayInner {
    cfg: GatewayConfig,
    transport: Arc<dyn Transport>,
    publisher: Arc<dyn Publisher>,
    boot: Arc<Mutex<Box<dyn BootManager>>>,
    registry: NodeRegistry,
    ota: OtaOrchestrator,
    self_ota: Mutex<SelfOta>,
    staging: Mutex<Option<FlashStager>>,
    counters: Arc<Counters>,
    seq: Arc<AtomicU8>,
    started_at: Instant,
    running: AtomicBool,
}

/// The mesh root. Construct once, `start` the tasks, then drive it from
/// the HTTP/MQTT collaborators via the public API.
pub struct Gateway {
    inner: Arc<GatewayInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(
        cfg: GatewayConfig,
        transport: Arc<dyn Transport>,
        publisher: Arc<dyn Publisher>,
        boot: Box<dyn BootManager>,
    ) -> Self {
        let registry = NodeRegistry::new(cfg.registry_capacity, cfg.offline_after);
        let ota = OtaOrchestrator::new(cfg.ota.clone());
        Self {
            inner: Arc::new(GatewayInner {
                cfg,
                transport,
                publisher,
                boot: Arc::new(Mutex::new(boot)),
                registry,
                ota,
                self_ota: Mutex::new(SelfOta::new()),
                staging: Mutex::new(None),
                counters: Arc::new(Counters::default()),
                seq: Arc::new(AtomicU8::new(0)),
                started_at: Instant::now(),
                running: AtomicBool::new(false),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the long-lived tasks: radio poller, dispatcher, heartbeat.
    pub fn start(&self) {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "gateway {} starting (version {})",
            inner.cfg.mac, inner.cfg.firmware_version
        );

        let (frame_tx, frame_rx) = mpsc::channel::<(Mac, Message)>();
        let mut handles = self.handles.lock().unwrap();

        let rx_inner = Arc::clone(inner);
        handles.push(thread::spawn(move || radio_task(rx_inner, frame_tx)));

        let dispatch_inner = Arc::clone(inner);
        handles.push(thread::spawn(move || dispatch_task(dispatch_inner, frame_rx)));

        let hb_inner = Arc::clone(inner);
        handles.push(thread::spawn(move || heartbeat_task(hb_inner)));
    }

    /// Signal the tasks to exit and join them.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    pub fn counters(&self) -> &Counters {
        &self.inner.counters
    }

    /// Milliseconds since gateway start; the registry's time base.
    pub fn now_ms(&self) -> u64 {
        self.inner.now_ms()
    }

    /// Synchronously drain and dispatch every pending transport frame.
    /// The threaded tasks do this continuously; tests drive it directly.
    pub fn process_pending(&self) -> usize {
        let mut handled = 0;
        loop {
            match self.inner.transport.recv() {
                Ok((src, bytes)) => {
                    if let Some(msg) = self.inner.ingest(&bytes) {
                        self.inner.dispatch(src, &msg);
                    }
                    handled += 1;
                }
                Err(TransportError::WouldBlock) => return handled,
                Err(err) => {
                    warn!("transport recv failed: {err}");
                    return handled;
                }
            }
        }
    }

    /// One heartbeat/sweep cycle: broadcast, expire silent peers, publish
    /// status. The heartbeat task calls this every interval.
    pub fn heartbeat_tick(&self) {
        self.inner.heartbeat_tick();
    }

    // ── Command API (called from the MQTT/HTTP loops) ─────────────

    /// Handle a `{node_mac, channel, action}` JSON command.
    pub fn handle_command_json(&self, json: &str) -> Result<()> {
        let request: CommandRequest =
            serde_json::from_str(json).context("malformed command JSON")?;
        self.send_relay_command(request.node_mac, request.channel, request.action.into())
    }

    pub fn send_relay_command(
        &self,
        target: Mac,
        channel: u8,
        action: crate::device::RelayAction,
    ) -> Result<()> {
        let payload = Payload::RelayCommand(RelayCommand { channel, action });
        self.inner.send(target, &payload)
    }

    pub fn send_led_command(&self, target: Mac, action: u8, params: &[u8]) -> Result<()> {
        let params = heapless::Vec::from_slice(params)
            .map_err(|_| anyhow::anyhow!("LED params exceed {} bytes", params.len()))?;
        let payload = Payload::LedCommand(LedCommand { action, params });
        self.inner.send(target, &payload)
    }

    /// Broadcast a `ScanRequest` on the discovery mesh (`POST /api/discover`).
    pub fn start_discovery(&self) -> Result<()> {
        info!("broadcasting scan request");
        self.inner.send(Mac::BROADCAST, &Payload::ScanRequest)
    }

    /// Deliver production credentials to an uncommissioned node.
    pub fn commission_node(&self, target: Mac, credentials: &NetworkCredentials) -> Result<()> {
        let payload = Payload::Commission(Commission {
            target,
            network_id: credentials.network_id,
            network_key: credentials.network_key.clone(),
            plant_id: credentials.plant_id.clone(),
            node_name: credentials.node_name.clone(),
        });
        info!("commissioning {target} as '{}'", credentials.node_name);
        self.inner.send(target, &payload)
    }

    pub fn decommission_node(&self, target: Mac) -> Result<()> {
        info!("decommissioning {target}");
        self.inner.send(target, &Payload::Decommission(Decommission { target }))
    }

    // ── Node OTA API ──────────────────────────────────────────────

    /// RAM-mode OTA: the whole image is already in memory.
    pub fn node_ota_start(&self, target: Mac, image: Vec<u8>) -> Result<()> {
        self.check_ota_target(target)?;
        self.inner.ota.begin_ram(target, image)?;
        self.spawn_ota_worker();
        Ok(())
    }

    /// Flash-mode OTA, step 1: reserve the session and open the staging
    /// partition for the incoming upload.
    pub fn node_ota_flash_begin(&self, target: Mac, expected_size: Option<u32>) -> Result<()> {
        self.check_ota_target(target)?;
        self.inner.ota.reserve_staging(target)?;
        let mut boot = self.inner.boot.lock().unwrap();
        match FlashStager::begin(boot.as_mut(), expected_size) {
            Ok(stager) => {
                *self.inner.staging.lock().unwrap() = Some(stager);
                Ok(())
            }
            Err(err) => {
                drop(boot);
                self.inner.ota.release_staging();
                Err(err)
            }
        }
    }

    /// Flash-mode OTA, step 2: append one upload chunk.
    pub fn node_ota_flash_write(&self, chunk: &[u8]) -> Result<()> {
        let mut staging = self.inner.staging.lock().unwrap();
        let stager = staging.as_mut().context("no node-OTA upload in progress")?;
        let mut boot = self.inner.boot.lock().unwrap();
        if let Err(err) = stager.write(boot.as_mut(), chunk) {
            if let Some(stager) = staging.take() {
                stager.cancel(boot.as_mut());
            }
            drop(boot);
            drop(staging);
            self.inner.ota.release_staging();
            return Err(err);
        }
        Ok(())
    }

    /// Flash-mode OTA, step 3: close the upload and launch the push.
    pub fn node_ota_flash_finish(&self) -> Result<()> {
        let stager = self
            .inner
            .staging
            .lock()
            .unwrap()
            .take()
            .context("no node-OTA upload in progress")?;
        let target = {
            // The reservation recorded the target.
            let status = self.inner.ota.state();
            debug!("finishing staged upload in state {status:?}");
            self.inner.ota.staging_target().context("staging reservation lost")?
        };
        let finish = {
            let mut boot = self.inner.boot.lock().unwrap();
            stager.finish(boot.as_mut())
        };
        match finish {
            Ok((part, size, crc)) => {
                self.inner.ota.begin_partition(target, part, size, crc)?;
                self.spawn_ota_worker();
                Ok(())
            }
            Err(err) => {
                self.inner.ota.release_staging();
                Err(err)
            }
        }
    }

    /// Cancel an in-flight upload without starting a push.
    pub fn node_ota_flash_cancel(&self) {
        if let Some(stager) = self.inner.staging.lock().unwrap().take() {
            let mut boot = self.inner.boot.lock().unwrap();
            stager.cancel(boot.as_mut());
        }
        self.inner.ota.release_staging();
    }

    /// Abort whatever OTA session is active.
    pub fn ota_abort(&self) {
        let seq = self.inner.next_seq();
        self.inner.ota.abort(
            self.inner.transport.as_ref(),
            &self.inner.counters,
            seq,
        );
        let status = self.inner.ota.status().mqtt_json().to_string();
        let _ = self
            .inner
            .publisher
            .publish(topics::NODE_OTA_STATUS, status.as_bytes(), 0, false);
    }

    pub fn ota_status(&self) -> OtaStatus {
        self.inner.ota.status()
    }

    /// `GET /api/node-ota-status` body.
    pub fn ota_status_json(&self) -> serde_json::Value {
        self.inner.ota.status().to_json()
    }

    // ── Self OTA ──────────────────────────────────────────────────

    /// `POST /update` streaming handler; returns `RebootRequired` after the
    /// final chunk.
    pub fn self_ota_update(&self, chunk: &[u8], is_first: bool, is_last: bool) -> Result<SelfOtaStep> {
        let mut self_ota = self.inner.self_ota.lock().unwrap();
        let mut boot = self.inner.boot.lock().unwrap();
        self_ota.update(boot.as_mut(), chunk, is_first, is_last)
    }

    // ── Status views ──────────────────────────────────────────────

    /// `GET /api/status` / `omniapi/gateway/status` body.
    pub fn status_json(&self) -> serde_json::Value {
        let inner = &self.inner;
        mqtt::gateway_status_json(
            &inner.cfg,
            inner.started_at.elapsed().as_secs(),
            inner.registry.len(),
            0,
        )
    }

    /// `GET /api/nodes` / `omniapi/gateway/nodes` body.
    pub fn nodes_json(&self) -> serde_json::Value {
        self.inner.registry.render_json()
    }

    /// Topic and payload the MQTT client registers as its Last Will.
    pub fn lwt(&self) -> (&'static str, serde_json::Value) {
        (topics::LWT, mqtt::lwt_json(self.inner.cfg.mac))
    }

    fn check_ota_target(&self, target: Mac) -> Result<()> {
        let record = self
            .inner
            .registry
            .get(target)
            .with_context(|| format!("unknown node {target}"))?;
        if !record.ota_eligible() {
            anyhow::bail!(
                "node {target} not OTA-eligible (commissioned={}, type={:?}, version={})",
                record.commissioned,
                record.device_type,
                Version::unpack(record.firmware_version)
            );
        }
        if !self.inner.transport.is_reachable(target) {
            warn!("node {target} not currently reachable; starting OTA anyway");
        }
        Ok(())
    }

    fn spawn_ota_worker(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = thread::spawn(move || {
            let ctx = OtaWorkerCtx {
                transport: Arc::clone(&inner.transport),
                publisher: Arc::clone(&inner.publisher),
                boot: Arc::clone(&inner.boot),
                counters: Arc::clone(&inner.counters),
                seq: Arc::clone(&inner.seq),
            };
            inner.ota.run_worker(&ctx);
        });
        self.handles.lock().unwrap().push(handle);
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }
}

impl GatewayInner {
    fn now_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    fn next_seq(&self) -> u8 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, dest: Mac, payload: &Payload) -> Result<()> {
        send_frame(
            self.transport.as_ref(),
            dest,
            payload,
            self.next_seq(),
            &self.counters,
        )
    }

    /// Radio-callback work: validate and decode, nothing else. Malformed
    /// frames are dropped and counted without touching any state.
    fn ingest(&self, bytes: &[u8]) -> Option<Message> {
        match Message::decode(bytes) {
            Ok(msg) => {
                self.counters.rx_count.fetch_add(1, Ordering::Relaxed);
                Some(msg)
            }
            Err(err) => {
                self.counters.malformed_count.fetch_add(1, Ordering::Relaxed);
                debug!("dropping malformed frame: {err}");
                None
            }
        }
    }

    /// Per-type message handling. Runs on the dispatcher task; may publish
    /// and send short replies but never does disk I/O.
    fn dispatch(&self, src: Mac, msg: &Message) {
        let payload = match Payload::decode(msg) {
            Ok(payload) => payload,
            Err(FramingError::BadPayload(what)) => {
                self.counters.malformed_count.fetch_add(1, Ordering::Relaxed);
                debug!("dropping {:?} from {src}: {what}", msg.msg_type);
                return;
            }
            Err(err) => {
                self.counters.malformed_count.fetch_add(1, Ordering::Relaxed);
                debug!("dropping frame from {src}: {err}");
                return;
            }
        };

        // Any valid frame proves liveness. ScanResponse carries a fresh
        // signal reading; everything else keeps the last one.
        let rssi = match &payload {
            Payload::ScanResponse(resp) => Some(resp.rssi),
            _ => None,
        };
        match self.registry.find_or_add(src, rssi, self.now_ms()) {
            Some(true) => self.transport.add_peer(src),
            Some(false) => {}
            None => return, // registry full, arrival dropped
        }

        match payload {
            Payload::HeartbeatAck(ack) => {
                let packed = Version::parse(&ack.version).map(|v| v.pack()).unwrap_or(0);
                if packed == 0 {
                    warn!("{src} reported unparseable version '{}'", ack.version);
                }
                self.registry.set_device_info(src, ack.device_type, packed);
            }
            Payload::Discovery => {
                let reply = Payload::DiscoveryAck(DiscoveryAck { channel: self.cfg.wifi_channel });
                if let Err(err) = self.send(src, &reply) {
                    warn!("discovery ack to {src} failed: {err}");
                }
            }
            Payload::ScanResponse(resp) => {
                self.registry.set_device_info(src, resp.device_type, resp.fw_version);
                self.registry.set_commissioned(src, resp.commissioned);
            }
            Payload::OtaAck(ack) => self.ota.handle_ack(src, ack),
            Payload::OtaComplete(complete) => {
                self.registry.update_version(src, complete.new_version);
                self.ota.handle_complete(src, complete);
            }
            Payload::OtaFailed(failed) => self.ota.handle_failed(src, &failed),
            Payload::OtaRequest(req) => {
                if let Some(data) = self.ota.handle_chunk_request(src, req, &self.boot) {
                    if let Err(err) = self.send(src, &Payload::OtaData(data)) {
                        warn!("pull chunk to {src} failed: {err}");
                    }
                }
            }
            Payload::RelayAck(ack) => {
                self.registry.update_relay(src, ack.channel, ack.state);
                self.publish_node_state(src);
            }
            Payload::RelayStatus(status) => {
                self.registry.update_relay(src, status.channel, status.state);
                self.publish_node_state(src);
            }
            Payload::LedAck(ack) => {
                self.registry.update_led(src, ack.state);
                self.publish_node_state(src);
            }
            Payload::CommissionAck(ack) => {
                if ack.status == 0 {
                    info!("{src} accepted commissioning");
                    self.registry.set_commissioned(src, true);
                } else {
                    warn!("{src} rejected commissioning (status {})", ack.status);
                }
            }
            Payload::DecommissionAck(_) => {
                info!("{src} confirmed decommission");
                self.registry.set_commissioned(src, false);
            }
            Payload::Heartbeat
            | Payload::ScanRequest
            | Payload::OtaBegin(_)
            | Payload::OtaData(_)
            | Payload::OtaEnd(_)
            | Payload::OtaAbort(_)
            | Payload::RelayCommand(_)
            | Payload::LedCommand(_)
            | Payload::Commission(_)
            | Payload::Decommission(_)
            | Payload::DiscoveryAck(_) => {
                debug!("unexpected {:?} from {src} (gateway is the root)", msg.msg_type);
            }
        }
    }

    fn publish_node_state(&self, mac: Mac) {
        let Some(record) = self.registry.get(mac) else {
            return;
        };
        let topic = topics::node_state(mac);
        let body = mqtt::node_state_json(&record).to_string();
        if let Err(err) = self.publisher.publish(&topic, body.as_bytes(), 0, false) {
            debug!("node state publish failed: {err}");
        }
    }

    fn heartbeat_tick(&self) {
        let heartbeat = Payload::Heartbeat;
        if let Err(err) = self.send(Mac::BROADCAST, &heartbeat) {
            warn!("heartbeat broadcast failed: {err}");
        }

        for mac in self.registry.mark_sweep(self.now_ms()) {
            info!("node {mac} went offline");
            self.publish_node_state(mac);
        }

        if self.ota.check_session_timeout() {
            warn!("OTA session timed out with no activity");
        }

        let status = mqtt::gateway_status_json(
            &self.cfg,
            self.started_at.elapsed().as_secs(),
            self.registry.len(),
            0,
        );
        let _ = self
            .publisher
            .publish(topics::STATUS, status.to_string().as_bytes(), 0, false);
        let _ = self.publisher.publish(
            topics::NODES,
            self.registry.render_json().to_string().as_bytes(),
            0,
            false,
        );

        debug!(
            "counters: rx={} tx={} malformed={}",
            self.counters.rx_count.load(Ordering::Relaxed),
            self.counters.tx_count.load(Ordering::Relaxed),
            self.counters.malformed_count.load(Ordering::Relaxed),
        );
    }
}

/// Radio poller: decode + enqueue only; must never block on handlers.
fn radio_task(inner: Arc<GatewayInner>, frames: Sender<(Mac, Message)>) {
    while inner.running.load(Ordering::SeqCst) {
        match inner.transport.recv() {
            Ok((src, bytes)) => {
                if let Some(msg) = inner.ingest(&bytes) {
                    if frames.send((src, msg)).is_err() {
                        return; // dispatcher gone
                    }
                }
            }
            Err(TransportError::WouldBlock) => {
                thread::sleep(std::time::Duration::from_millis(5));
            }
            Err(err) => {
                warn!("transport recv failed: {err}");
                thread::sleep(std::time::Duration::from_millis(50));
            }
        }
    }
}

/// Dispatcher: drain the channel and run the per-type handlers.
fn dispatch_task(inner: Arc<GatewayInner>, frames: Receiver<(Mac, Message)>) {
    while inner.running.load(Ordering::SeqCst) {
        match frames.recv_timeout(std::time::Duration::from_millis(100)) {
            Ok((src, msg)) => inner.dispatch(src, &msg),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Heartbeat/sweeper: fixed cadence broadcast + liveness sweep.
fn heartbeat_task(inner: Arc<GatewayInner>) {
    while inner.running.load(Ordering::SeqCst) {
        inner.heartbeat_tick();
        thread::sleep(inner.cfg.heartbeat_interval);
    }
}

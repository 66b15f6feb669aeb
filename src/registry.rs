//! Gateway-side registry of known mesh peers.
//!
//! Capacity-bounded, in-memory. The radio dispatcher and the periodic
//! sweeper both mutate it; MQTT and HTTP readers copy snapshots out. All
//! access goes through one mutex held only for the duration of the call.

use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};
use serde_json::json;

use crate::device::{DeviceType, LedState, RELAY_CHANNELS};
use crate::version::Version;
use crate::Mac;

/// Device-specific state mirrored from the node's acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    None,
    Relay([bool; RELAY_CHANNELS]),
    Led(LedState),
}

/// One known peer.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub mac: Mac,
    pub device_type: DeviceType,
    pub mesh_layer: u8,
    pub rssi: i8,
    /// Packed major.minor.patch; zero until a heartbeat ack arrives.
    pub firmware_version: u32,
    pub commissioned: bool,
    pub online: bool,
    pub last_seen_ms: u64,
    pub messages_received: u64,
    pub state: DeviceState,
}

impl NodeRecord {
    fn new(mac: Mac, rssi: i8, now_ms: u64) -> Self {
        Self {
            mac,
            device_type: DeviceType::Unknown,
            mesh_layer: 0,
            rssi,
            firmware_version: 0,
            commissioned: false,
            online: true,
            last_seen_ms: now_ms,
            messages_received: 1,
            state: DeviceState::None,
        }
    }

    /// Whether this node may be targeted by an OTA session.
    pub fn ota_eligible(&self) -> bool {
        self.commissioned && self.device_type != DeviceType::Unknown && self.firmware_version != 0
    }

    fn to_json(&self) -> serde_json::Value {
        let mut obj = json!({
            "mac": self.mac,
            "rssi": self.rssi,
            "messages": self.messages_received,
            "online": self.online,
            "version": Version::unpack(self.firmware_version).to_string(),
            "device_type": self.device_type,
            "commissioned": self.commissioned,
            "lastSeen": self.last_seen_ms,
        });
        match self.state {
            DeviceState::None => {}
            DeviceState::Relay(states) => {
                obj["relays"] = json!({
                    "relay1": if states[0] { "on" } else { "off" },
                    "relay2": if states[1] { "on" } else { "off" },
                });
            }
            DeviceState::Led(led) => {
                obj["led"] = json!(led);
            }
        }
        obj
    }
}

/// Bounded `Mac -> NodeRecord` map.
pub struct NodeRegistry {
    offline_after: Duration,
    records: Mutex<Vec<NodeRecord>>,
    capacity: usize,
}

impl NodeRegistry {
    pub fn new(capacity: usize, offline_after: Duration) -> Self {
        Self {
            offline_after,
            records: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Track an inbound frame from `mac`: bump liveness and counters,
    /// creating the record if the registry has room. `rssi` is `None` for
    /// frames whose payload carries no signal reading. Returns `Some(true)`
    /// for a newly created record, `Some(false)` for an update, and `None`
    /// when the registry is full and the arrival was dropped.
    pub fn find_or_add(&self, mac: Mac, rssi: Option<i8>, now_ms: u64) -> Option<bool> {
        let mut records = self.records.lock().unwrap();
        if let Some(rec) = records.iter_mut().find(|r| r.mac == mac) {
            if let Some(rssi) = rssi {
                rec.rssi = rssi;
            }
            rec.last_seen_ms = now_ms;
            rec.messages_received += 1;
            rec.online = true;
            return Some(false);
        }
        if records.len() >= self.capacity {
            warn!("registry full ({} nodes), dropping new peer {}", self.capacity, mac);
            return None;
        }
        debug!("registry: new peer {mac}");
        records.push(NodeRecord::new(mac, rssi.unwrap_or(0), now_ms));
        Some(true)
    }

    /// Flip nodes that have been silent past the online window to offline.
    /// Returns the MACs whose state changed; sweeping again inside the same
    /// window returns nothing.
    pub fn mark_sweep(&self, now_ms: u64) -> Vec<Mac> {
        let window = self.offline_after.as_millis() as u64;
        let mut went_offline = Vec::new();
        let mut records = self.records.lock().unwrap();
        for rec in records.iter_mut() {
            if rec.online && now_ms.saturating_sub(rec.last_seen_ms) > window {
                rec.online = false;
                went_offline.push(rec.mac);
            }
        }
        went_offline
    }

    pub fn set_device_info(&self, mac: Mac, device_type: DeviceType, firmware_version: u32) {
        self.with_record(mac, |rec| {
            rec.device_type = device_type;
            rec.firmware_version = firmware_version;
            if rec.state == DeviceState::None {
                rec.state = match device_type {
                    DeviceType::Relay => DeviceState::Relay([false; RELAY_CHANNELS]),
                    DeviceType::LedStrip => DeviceState::Led(LedState::default()),
                    _ => DeviceState::None,
                };
            }
        });
    }

    pub fn set_commissioned(&self, mac: Mac, commissioned: bool) {
        self.with_record(mac, |rec| rec.commissioned = commissioned);
    }

    pub fn set_mesh_layer(&self, mac: Mac, layer: u8) {
        self.with_record(mac, |rec| rec.mesh_layer = layer);
    }

    pub fn update_version(&self, mac: Mac, firmware_version: u32) {
        self.with_record(mac, |rec| rec.firmware_version = firmware_version);
    }

    /// Mirror a relay ack. `channel` is the 1-based wire channel.
    pub fn update_relay(&self, mac: Mac, channel: u8, state: bool) {
        let Some(index) = (channel as usize).checked_sub(1) else {
            return;
        };
        self.with_record(mac, |rec| {
            if rec.state == DeviceState::None {
                rec.state = DeviceState::Relay([false; RELAY_CHANNELS]);
            }
            if let DeviceState::Relay(ref mut states) = rec.state {
                if let Some(slot) = states.get_mut(index) {
                    *slot = state;
                }
            }
        });
    }

    pub fn update_led(&self, mac: Mac, led: LedState) {
        self.with_record(mac, |rec| rec.state = DeviceState::Led(led));
    }

    pub fn get(&self, mac: Mac) -> Option<NodeRecord> {
        self.records.lock().unwrap().iter().find(|r| r.mac == mac).cloned()
    }

    /// Stable snapshot copy for readers outside the lock.
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    /// Full node list as the JSON shape served by `/api/nodes` and the
    /// `nodes` MQTT topic.
    pub fn render_json(&self) -> serde_json::Value {
        let records = self.records.lock().unwrap();
        json!({
            "count": records.len(),
            "nodes": records.iter().map(NodeRecord::to_json).collect::<Vec<_>>(),
        })
    }

    fn with_record(&self, mac: Mac, update: impl FnOnce(&mut NodeRecord)) {
        let mut records = self.records.lock().unwrap();
        match records.iter_mut().find(|r| r.mac == mac) {
            Some(rec) => update(rec),
            None => debug!("registry: update for unknown peer {mac} ignored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> Mac {
        Mac([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last])
    }

    fn registry() -> NodeRegistry {
        NodeRegistry::new(50, Duration::from_secs(10))
    }

    #[test]
    fn test_capacity_bound() {
        let reg = registry();
        for i in 0..50 {
            assert_eq!(reg.find_or_add(Mac([0, 0, 0, 0, 0, i]), Some(-50), 0), Some(true));
        }
        assert_eq!(reg.len(), 50);
        // 51st distinct MAC is dropped...
        assert_eq!(reg.find_or_add(Mac([0, 0, 0, 1, 0, 0]), Some(-50), 0), None);
        assert_eq!(reg.len(), 50);
        // ...but known peers keep updating.
        assert_eq!(reg.find_or_add(Mac([0, 0, 0, 0, 0, 7]), Some(-40), 100), Some(false));
    }

    #[test]
    fn test_find_or_add_updates_liveness() {
        let reg = registry();
        reg.find_or_add(mac(1), Some(-60), 1_000);
        reg.find_or_add(mac(1), Some(-55), 2_500);
        let rec = reg.get(mac(1)).unwrap();
        assert_eq!(rec.messages_received, 2);
        assert_eq!(rec.rssi, -55);
        assert_eq!(rec.last_seen_ms, 2_500);
        assert!(rec.online);
        assert_eq!(reg.len(), 1);

        // A frame with no signal reading keeps the last RSSI.
        reg.find_or_add(mac(1), None, 3_000);
        assert_eq!(reg.get(mac(1)).unwrap().rssi, -55);
    }

    #[test]
    fn test_sweep_is_idempotent_within_window() {
        let reg = registry();
        reg.find_or_add(mac(1), Some(-60), 0);
        reg.find_or_add(mac(2), Some(-60), 8_000);

        let offline = reg.mark_sweep(11_000);
        assert_eq!(offline, vec![mac(1)]);
        // Second sweep in the same window: no further transitions.
        assert!(reg.mark_sweep(11_500).is_empty());
        assert!(!reg.get(mac(1)).unwrap().online);
        assert!(reg.get(mac(2)).unwrap().online);
    }

    #[test]
    fn test_node_comes_back_online() {
        let reg = registry();
        reg.find_or_add(mac(1), Some(-60), 0);
        reg.mark_sweep(20_000);
        assert!(!reg.get(mac(1)).unwrap().online);
        reg.find_or_add(mac(1), Some(-60), 21_000);
        assert!(reg.get(mac(1)).unwrap().online);
        // The comeback makes it sweepable again later.
        assert_eq!(reg.mark_sweep(40_000), vec![mac(1)]);
    }

    #[test]
    fn test_ota_eligibility_invariant() {
        let reg = registry();
        reg.find_or_add(mac(1), Some(-60), 0);
        assert!(!reg.get(mac(1)).unwrap().ota_eligible());

        reg.set_commissioned(mac(1), true);
        assert!(!reg.get(mac(1)).unwrap().ota_eligible());

        reg.set_device_info(mac(1), DeviceType::Relay, 0x010102);
        assert!(reg.get(mac(1)).unwrap().ota_eligible());
    }

    #[test]
    fn test_render_json_shape() {
        let reg = registry();
        reg.find_or_add(mac(1), Some(-61), 42);
        reg.set_device_info(mac(1), DeviceType::Relay, 0x010102);
        reg.update_relay(mac(1), 1, true);

        let value = reg.render_json();
        assert_eq!(value["count"], 1);
        let node = &value["nodes"][0];
        assert_eq!(node["mac"], "AA:BB:CC:DD:EE:01");
        assert_eq!(node["version"], "1.1.2");
        assert_eq!(node["online"], true);
        assert_eq!(node["relays"]["relay1"], "on");
        assert_eq!(node["relays"]["relay2"], "off");
        assert_eq!(node["lastSeen"], 42);
    }
}

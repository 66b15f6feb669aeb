//! Shared test fixtures: an in-memory mesh with scripted loss, a capturing
//! MQTT publisher, and simple device doubles. The boot manager and KV
//! store doubles come from the crate's simulation backends.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use omniapi::config::{GatewayConfig, NodeConfig, OtaTimings};
use omniapi::device::{Device, DeviceError, DeviceType, LedState, RelayAction, RelayBank};
use omniapi::gateway::mqtt::Publisher;
use omniapi::protocol::{Message, MsgType};
use omniapi::transport::{Transport, TransportError};
use omniapi::{Mac, Version};

pub const GATEWAY_MAC: Mac = Mac([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
pub const NODE_MAC: Mac = Mac([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);

// ── In-memory mesh ───────────────────────────────────────────────

/// One frame as observed on the simulated air, decoded for assertions.
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub src: Mac,
    pub dest: Mac,
    pub msg: Message,
}

type DropPredicate = Box<dyn Fn(Mac, &Message) -> bool + Send>;

struct DropRule {
    remaining: usize,
    pred: DropPredicate,
}

struct HubState {
    root: Mac,
    inboxes: HashMap<Mac, VecDeque<(Mac, Vec<u8>)>>,
    log: Vec<SentFrame>,
    drop_rules: Vec<DropRule>,
    corrupt_ota_data: bool,
}

/// Broadcast medium connecting every endpoint. Best-effort and ordered
/// per sender, like the real radio under light load; loss and corruption
/// are scripted per test.
pub struct MeshHub {
    state: Mutex<HubState>,
}

impl MeshHub {
    pub fn new(root: Mac) -> Arc<MeshHub> {
        Arc::new(MeshHub {
            state: Mutex::new(HubState {
                root,
                inboxes: HashMap::new(),
                log: Vec::new(),
                drop_rules: Vec::new(),
                corrupt_ota_data: false,
            }),
        })
    }

    /// Register an endpoint with its own inbox.
    pub fn endpoint(self: &Arc<Self>, mac: Mac) -> Arc<MeshEndpoint> {
        self.state.lock().unwrap().inboxes.insert(mac, VecDeque::new());
        Arc::new(MeshEndpoint { hub: Arc::clone(self), mac })
    }

    /// Drop the next `count` frames matching `pred` instead of delivering.
    pub fn drop_matching(
        &self,
        count: usize,
        pred: impl Fn(Mac, &Message) -> bool + Send + 'static,
    ) {
        self.state.lock().unwrap().drop_rules.push(DropRule {
            remaining: count,
            pred: Box::new(pred),
        });
    }

    /// Flip one data byte of every OtaData frame in transit.
    pub fn corrupt_ota_data(&self, enable: bool) {
        self.state.lock().unwrap().corrupt_ota_data = enable;
    }

    /// Everything delivered so far, in send order.
    pub fn log(&self) -> Vec<SentFrame> {
        self.state.lock().unwrap().log.clone()
    }

    /// Push raw bytes into `dest`'s inbox, bypassing logging and rules
    /// (for malformed-frame injection).
    pub fn inject_raw(&self, dest: Mac, src: Mac, bytes: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        if let Some(inbox) = state.inboxes.get_mut(&dest) {
            inbox.push_back((src, bytes));
        }
    }

    fn deliver(&self, src: Mac, dest: Mac, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();

        let decoded = Message::decode(frame).ok();
        if let Some(msg) = &decoded {
            for rule in state.drop_rules.iter_mut() {
                if rule.remaining > 0 && (rule.pred)(src, msg) {
                    rule.remaining -= 1;
                    return Ok(()); // swallowed by the air
                }
            }
        }

        let mut bytes = frame.to_vec();
        if state.corrupt_ota_data
            && decoded.as_ref().is_some_and(|m| m.msg_type == MsgType::OtaData)
        {
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;
        }

        if let Some(msg) = decoded {
            state.log.push(SentFrame { src, dest, msg });
        }

        if dest.is_broadcast() {
            let targets: Vec<Mac> =
                state.inboxes.keys().copied().filter(|mac| *mac != src).collect();
            for target in targets {
                if let Some(inbox) = state.inboxes.get_mut(&target) {
                    inbox.push_back((src, bytes.clone()));
                }
            }
            return Ok(());
        }

        match state.inboxes.get_mut(&dest) {
            Some(inbox) => {
                inbox.push_back((src, bytes));
                Ok(())
            }
            None => Err(TransportError::SendFailed),
        }
    }
}

/// One endpoint of the in-memory mesh.
pub struct MeshEndpoint {
    hub: Arc<MeshHub>,
    mac: Mac,
}

impl MeshEndpoint {
    pub fn mac(&self) -> Mac {
        self.mac
    }
}

impl Transport for MeshEndpoint {
    fn send_to_root(&self, frame: &[u8]) -> Result<(), TransportError> {
        let root = self.hub.state.lock().unwrap().root;
        self.hub.deliver(self.mac, root, frame)
    }

    fn send_to(&self, dest: Mac, frame: &[u8]) -> Result<(), TransportError> {
        self.hub.deliver(self.mac, dest, frame)
    }

    fn recv(&self) -> Result<(Mac, Vec<u8>), TransportError> {
        let mut state = self.hub.state.lock().unwrap();
        state
            .inboxes
            .get_mut(&self.mac)
            .and_then(|inbox| inbox.pop_front())
            .ok_or(TransportError::WouldBlock)
    }

    fn is_reachable(&self, mac: Mac) -> bool {
        self.hub.state.lock().unwrap().inboxes.contains_key(&mac)
    }
}

// ── MQTT capture ─────────────────────────────────────────────────

/// Publisher double that records every publish.
#[derive(Default)]
pub struct MockPublisher {
    pub messages: Mutex<Vec<(String, String)>>,
}

impl MockPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Most recent payload published to `topic`.
    pub fn last_on(&self, topic: &str) -> Option<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(t, _)| t == topic)
            .map(|(_, body)| body.clone())
    }

    pub fn all_on(&self, topic: &str) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

impl Publisher for MockPublisher {
    fn publish(&self, topic: &str, payload: &[u8], _qos: u8, _retain: bool) -> anyhow::Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((topic.to_string(), String::from_utf8_lossy(payload).into_owned()));
        Ok(())
    }
}

// ── Device doubles ───────────────────────────────────────────────

/// Two-channel relay board double.
#[derive(Default)]
pub struct MockRelayDevice {
    bank: RelayBank,
}

impl Device for MockRelayDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Relay
    }

    fn apply_relay(&mut self, channel: u8, action: RelayAction) -> Result<bool, DeviceError> {
        self.bank.apply(channel, action)
    }

    fn relay_state(&self, channel: u8) -> Result<bool, DeviceError> {
        self.bank.state(channel)
    }
}

/// Addressable strip double: action 0 = power, 1 = color, 2 = brightness,
/// 3 = effect.
#[derive(Default)]
pub struct MockLedDevice {
    state: LedState,
}

impl Device for MockLedDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::LedStrip
    }

    fn apply_led(&mut self, action: u8, params: &[u8]) -> Result<LedState, DeviceError> {
        match (action, params) {
            (0, [power, ..]) => self.state.power = *power != 0,
            (1, [r, g, b, ..]) => {
                self.state.r = *r;
                self.state.g = *g;
                self.state.b = *b;
            }
            (2, [brightness, ..]) => self.state.brightness = *brightness,
            (3, [effect, ..]) => self.state.effect = *effect,
            _ => return Err(DeviceError::Unsupported),
        }
        Ok(self.state)
    }

    fn led_state(&self) -> Result<LedState, DeviceError> {
        Ok(self.state)
    }
}

// ── Configs with compressed timers ───────────────────────────────

pub fn test_gateway_config() -> GatewayConfig {
    GatewayConfig {
        mac: GATEWAY_MAC,
        ip: String::from("192.168.1.10"),
        firmware_version: Version { major: 1, minor: 0, patch: 0 },
        heartbeat_interval: Duration::from_millis(50),
        offline_after: Duration::from_millis(300),
        registry_capacity: 50,
        wifi_channel: 6,
        ota: OtaTimings {
            chunk_ack_timeout: Duration::from_millis(150),
            begin_ack_timeout: Duration::from_millis(200),
            complete_timeout: Duration::from_millis(1500),
            session_timeout: Duration::from_secs(5),
            max_retries: 3,
        },
    }
}

pub fn test_node_config() -> NodeConfig {
    NodeConfig {
        firmware_version: Version { major: 1, minor: 1, patch: 2 },
        reboot_drain: Duration::from_millis(30),
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

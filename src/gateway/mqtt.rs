//! MQTT bridge: publisher seam, topic catalog, and the JSON views the
//! gateway publishes. The broker connection itself is a collaborator; the
//! bridge only builds payloads and hands them to [`Publisher`].

use anyhow::Result;
use serde::Deserialize;

use crate::config::GatewayConfig;
use crate::device::RelayAction;
use crate::registry::{DeviceState, NodeRecord};
use crate::Mac;

/// Outbound MQTT seam. QoS is the broker client's 0..=2 scale.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> Result<()>;
}

pub mod topics {
    use crate::Mac;

    pub const STATUS: &str = "omniapi/gateway/status";
    pub const NODES: &str = "omniapi/gateway/nodes";
    pub const COMMAND: &str = "omniapi/gateway/command";
    pub const NODE_OTA_STATUS: &str = "omniapi/gateway/node_ota/status";
    pub const LWT: &str = "omniapi/gateway/lwt";

    pub fn node_state(mac: Mac) -> String {
        format!("omniapi/gateway/node/{mac}/state")
    }
}

/// Inbound command published to `omniapi/gateway/command` (and posted to
/// `/api/command`).
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    #[serde(alias = "nodeId")]
    pub node_mac: Mac,
    pub channel: u8,
    pub action: CommandAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandAction {
    On,
    Off,
    Toggle,
}

impl From<CommandAction> for RelayAction {
    fn from(action: CommandAction) -> RelayAction {
        match action {
            CommandAction::On => RelayAction::On,
            CommandAction::Off => RelayAction::Off,
            CommandAction::Toggle => RelayAction::Toggle,
        }
    }
}

/// `omniapi/gateway/status` payload.
pub fn gateway_status_json(
    cfg: &GatewayConfig,
    uptime_secs: u64,
    nodes_count: usize,
    rssi: i8,
) -> serde_json::Value {
    serde_json::json!({
        "online": true,
        "ip": cfg.ip,
        "version": cfg.firmware_version.to_string(),
        "uptime": uptime_secs,
        "nodes_count": nodes_count,
        "wifi_channel": cfg.wifi_channel,
        "rssi": rssi,
    })
}

/// `omniapi/gateway/node/{MAC}/state` payload.
pub fn node_state_json(record: &NodeRecord) -> serde_json::Value {
    let mut obj = serde_json::json!({
        "mac": record.mac,
        "online": record.online,
    });
    match record.state {
        DeviceState::None => {}
        DeviceState::Relay(states) => {
            obj["relay1"] = serde_json::json!(if states[0] { "on" } else { "off" });
            obj["relay2"] = serde_json::json!(if states[1] { "on" } else { "off" });
        }
        DeviceState::Led(led) => {
            obj["led"] = serde_json::json!(led);
        }
    }
    obj
}

/// `omniapi/gateway/lwt` payload, registered with the broker as Last Will.
pub fn lwt_json(mac: Mac) -> serde_json::Value {
    serde_json::json!({ "mac": mac, "offline": true })
}

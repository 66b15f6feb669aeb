//! Protocol constants and runtime tuning knobs.
//!
//! Protocol-fixed values live here as `pub const`s; everything that is a
//! timeout or interval is carried in a config struct whose `Default` matches
//! the production values, so tests can compress time without faking clocks.

use std::time::Duration;

use crate::version::Version;
use crate::Mac;

/// Fixed OTA chunk payload size in bytes. 180 + the 7-byte OtaData header
/// stays inside the 200-byte frame payload cap.
pub const OTA_CHUNK_SIZE: u16 = 180;

/// Maximum number of tracked peers in the gateway registry.
pub const REGISTRY_CAPACITY: usize = 50;

/// A node with no inbound frame for this long is swept offline.
pub const NODE_OFFLINE_TIMEOUT: Duration = Duration::from_secs(10);

/// Gateway heartbeat broadcast cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Flash sector granularity for on-demand erase while staging an upload.
pub const FLASH_SECTOR_SIZE: u32 = 4096;

/// Well-known discovery mesh credentials. Every uncommissioned node joins
/// this network on first boot so the gateway can find and commission it.
pub const DISCOVERY_NETWORK_ID: [u8; 6] = [0x4F, 0x6D, 0x50, 0x69, 0x00, 0x01];
pub const DISCOVERY_NETWORK_KEY: &str = "omniapi-discovery";

/// Transport MTU; the framing layer never comes close, but senders check.
pub const TRANSPORT_MTU: usize = 1460;

/// Timer and retry policy for a node-OTA push session.
#[derive(Debug, Clone)]
pub struct OtaTimings {
    /// Per-chunk ACK wait before a resend.
    pub chunk_ack_timeout: Duration,
    /// OtaBegin ACK wait (the node may be mid-reboot or mid-mesh-join).
    pub begin_ack_timeout: Duration,
    /// Wait for the node's OtaComplete after OtaEnd.
    pub complete_timeout: Duration,
    /// No-activity cap for the whole session.
    pub session_timeout: Duration,
    /// Resends per chunk (and per OtaBegin) before the session fails.
    pub max_retries: u8,
}

impl Default for OtaTimings {
    fn default() -> Self {
        Self {
            chunk_ack_timeout: Duration::from_secs(5),
            begin_ack_timeout: Duration::from_secs(30),
            complete_timeout: Duration::from_secs(60),
            session_timeout: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

/// Gateway runtime configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub mac: Mac,
    pub ip: String,
    pub firmware_version: Version,
    pub heartbeat_interval: Duration,
    pub offline_after: Duration,
    pub registry_capacity: usize,
    pub wifi_channel: u8,
    pub ota: OtaTimings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mac: Mac([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            ip: String::from("0.0.0.0"),
            firmware_version: Version { major: 0, minor: 1, patch: 0 },
            heartbeat_interval: HEARTBEAT_INTERVAL,
            offline_after: NODE_OFFLINE_TIMEOUT,
            registry_capacity: REGISTRY_CAPACITY,
            wifi_channel: 6,
            ota: OtaTimings::default(),
        }
    }
}

/// Node runtime configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub firmware_version: Version,
    /// Delay between sending OtaComplete and rebooting, so the frame drains.
    pub reboot_drain: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            firmware_version: Version { major: 0, minor: 1, patch: 0 },
            reboot_drain: Duration::from_secs(2),
        }
    }
}

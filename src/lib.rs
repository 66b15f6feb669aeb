//! OmniaPi mesh core.
//!
//! A two-tier IoT mesh: one gateway device bridges an external MQTT broker
//! to a self-organizing radio mesh of leaf nodes (relays, LED strips,
//! sensors). This crate is the hardware-independent core: the binary
//! link-layer protocol, peer discovery and liveness, node commissioning,
//! and the end-to-end OTA firmware distribution pipeline.
//!
//! The radio stack, MQTT client, HTTP server, key-value store, and
//! dual-bank bootloader are collaborators behind traits ([`transport::Transport`],
//! [`gateway::mqtt::Publisher`], [`storage::KvStore`], [`boot::BootManager`]),
//! so the core builds and tests on any host.

pub mod boot;
pub mod config;
pub mod device;
pub mod gateway;
pub mod mac;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod storage;
pub mod transport;
pub mod version;

pub use mac::Mac;
pub use version::Version;

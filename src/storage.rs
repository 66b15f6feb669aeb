//! Persistent key-value storage seam and the typed records stored in it.
//!
//! The device's NVS (or any other small KV backend) sits behind [`KvStore`].
//! Two namespaces are used: `omniapi_node` for commissioning state and
//! `ota_state` for the post-reboot OTA verdict.

use anyhow::{Context, Result};

use crate::protocol::payloads::CRED_FIELD;

/// Commissioning namespace.
pub const NS_NODE: &str = "omniapi_node";
/// OTA pending-verdict namespace.
pub const NS_OTA: &str = "ota_state";

pub mod keys {
    pub const COMMISSIONED: &str = "commissioned";
    pub const NETWORK_ID: &str = "network_id";
    pub const NETWORK_KEY: &str = "network_key";
    pub const PLANT_ID: &str = "plant_id";
    pub const NODE_NAME: &str = "node_name";
    pub const RELAY_MODE: &str = "relay_mode";
    pub const OTA_PENDING: &str = "pending";
    pub const OTA_NEW_VERSION: &str = "new_ver";
}

/// Short-string-keyed persistent store with namespaces.
pub trait KvStore: Send {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<()>;
    fn erase(&mut self, namespace: &str, key: &str) -> Result<()>;
}

/// Production-mesh join parameters, delivered once via commissioning and
/// persisted for every later boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkCredentials {
    pub network_id: [u8; 6],
    pub network_key: heapless::String<CRED_FIELD>,
    pub plant_id: heapless::String<CRED_FIELD>,
    pub node_name: heapless::String<CRED_FIELD>,
}

fn get_string(kv: &dyn KvStore, key: &str) -> Result<Option<heapless::String<CRED_FIELD>>> {
    let Some(raw) = kv.get(NS_NODE, key)? else {
        return Ok(None);
    };
    let text = String::from_utf8(raw).with_context(|| format!("corrupt {key} in storage"))?;
    let mut out = heapless::String::new();
    out.push_str(&text)
        .ok()
        .with_context(|| format!("{key} exceeds field width"))?;
    Ok(Some(out))
}

/// Load commissioning credentials; `None` means the node is uncommissioned
/// and must join the discovery mesh.
pub fn load_credentials(kv: &dyn KvStore) -> Result<Option<NetworkCredentials>> {
    match kv.get(NS_NODE, keys::COMMISSIONED)? {
        Some(flag) if flag.first() == Some(&1) => {}
        _ => return Ok(None),
    }
    let id_raw = kv
        .get(NS_NODE, keys::NETWORK_ID)?
        .context("commissioned flag set but network_id missing")?;
    if id_raw.len() != 6 {
        anyhow::bail!("corrupt network_id in storage");
    }
    let mut network_id = [0u8; 6];
    network_id.copy_from_slice(&id_raw);

    Ok(Some(NetworkCredentials {
        network_id,
        network_key: get_string(kv, keys::NETWORK_KEY)?.unwrap_or_default(),
        plant_id: get_string(kv, keys::PLANT_ID)?.unwrap_or_default(),
        node_name: get_string(kv, keys::NODE_NAME)?.unwrap_or_default(),
    }))
}

/// Persist credentials. The commissioned flag is written last so a crash
/// mid-write never leaves a half-commissioned node claiming to be joined.
pub fn store_credentials(kv: &mut dyn KvStore, creds: &NetworkCredentials) -> Result<()> {
    kv.set(NS_NODE, keys::NETWORK_ID, &creds.network_id)?;
    kv.set(NS_NODE, keys::NETWORK_KEY, creds.network_key.as_bytes())?;
    kv.set(NS_NODE, keys::PLANT_ID, creds.plant_id.as_bytes())?;
    kv.set(NS_NODE, keys::NODE_NAME, creds.node_name.as_bytes())?;
    kv.set(NS_NODE, keys::COMMISSIONED, &[1])?;
    Ok(())
}

/// Wipe credentials; the node reverts to the discovery mesh on next boot.
pub fn clear_credentials(kv: &mut dyn KvStore) -> Result<()> {
    kv.erase(NS_NODE, keys::COMMISSIONED)?;
    kv.erase(NS_NODE, keys::NETWORK_ID)?;
    kv.erase(NS_NODE, keys::NETWORK_KEY)?;
    kv.erase(NS_NODE, keys::PLANT_ID)?;
    kv.erase(NS_NODE, keys::NODE_NAME)?;
    Ok(())
}

pub fn relay_mode(kv: &dyn KvStore) -> Result<Option<u8>> {
    Ok(kv.get(NS_NODE, keys::RELAY_MODE)?.and_then(|v| v.first().copied()))
}

pub fn set_relay_mode(kv: &mut dyn KvStore, mode: u8) -> Result<()> {
    kv.set(NS_NODE, keys::RELAY_MODE, &[mode])
}

/// Read the pending-OTA marker: `Some(new_version)` when an update was
/// staged and the verdict awaits the next boot.
pub fn ota_pending(kv: &dyn KvStore) -> Result<Option<u32>> {
    match kv.get(NS_OTA, keys::OTA_PENDING)? {
        Some(flag) if flag.first() == Some(&1) => {}
        _ => return Ok(None),
    }
    let raw = kv.get(NS_OTA, keys::OTA_NEW_VERSION)?.unwrap_or_default();
    if raw.len() != 4 {
        anyhow::bail!("corrupt new_ver in storage");
    }
    Ok(Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])))
}

pub fn set_ota_pending(kv: &mut dyn KvStore, new_version: u32) -> Result<()> {
    kv.set(NS_OTA, keys::OTA_NEW_VERSION, &new_version.to_le_bytes())?;
    kv.set(NS_OTA, keys::OTA_PENDING, &[1])?;
    Ok(())
}

pub fn clear_ota_pending(kv: &mut dyn KvStore) -> Result<()> {
    kv.erase(NS_OTA, keys::OTA_PENDING)?;
    kv.erase(NS_OTA, keys::OTA_NEW_VERSION)?;
    Ok(())
}

/// In-memory [`KvStore`] used by the simulation backend and the test suite.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: std::collections::HashMap<(String, String), Vec<u8>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn set(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .insert((namespace.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }

    fn erase(&mut self, namespace: &str, key: &str) -> Result<()> {
        self.entries.remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}

//! Node commissioning: discovery mesh vs production mesh.
//!
//! A node boots into exactly one network. With no persisted credentials it
//! joins the well-known discovery mesh and waits to be found; a
//! `Commission` frame delivers production credentials, which are persisted
//! *before* the ack goes out. If the node crashes mid-handshake the
//! gateway's retry just gets a fresh ack from an already-commissioned node.

use anyhow::Result;
use log::info;

use crate::config::{DISCOVERY_NETWORK_ID, DISCOVERY_NETWORK_KEY};
use crate::protocol::payloads::Commission;
use crate::storage::{self, KvStore, NetworkCredentials};

/// Which mesh the radio should join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshMembership {
    /// Well-known network every uncommissioned node sits on.
    Discovery,
    /// Site network from persisted credentials.
    Production(NetworkCredentials),
}

impl MeshMembership {
    /// `(network_id, network_key)` for the radio driver.
    pub fn join_params(&self) -> ([u8; 6], &str) {
        match self {
            MeshMembership::Discovery => (DISCOVERY_NETWORK_ID, DISCOVERY_NETWORK_KEY),
            MeshMembership::Production(creds) => (creds.network_id, &creds.network_key),
        }
    }
}

/// Commissioning lifecycle:
/// `Discovery -> (Commission) -> Persisting -> reboot -> Production`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommissioningState {
    Discovery,
    /// Credentials written; waiting for the post-ack reboot.
    Persisting,
    Production,
}

#[derive(Debug)]
pub struct Commissioning {
    state: CommissioningState,
    credentials: Option<NetworkCredentials>,
}

impl Commissioning {
    /// Resume from persisted state at boot.
    pub fn from_storage(kv: &dyn KvStore) -> Result<Self> {
        let credentials = storage::load_credentials(kv)?;
        let state = if credentials.is_some() {
            CommissioningState::Production
        } else {
            CommissioningState::Discovery
        };
        Ok(Self { state, credentials })
    }

    pub fn state(&self) -> CommissioningState {
        self.state
    }

    pub fn is_commissioned(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn membership(&self) -> MeshMembership {
        match &self.credentials {
            Some(creds) => MeshMembership::Production(creds.clone()),
            None => MeshMembership::Discovery,
        }
    }

    pub fn node_name(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.node_name.as_str())
    }

    /// Persist the delivered credentials. Idempotent: re-delivery to an
    /// already-commissioned node rewrites the same state.
    pub fn apply_commission(&mut self, kv: &mut dyn KvStore, cmd: &Commission) -> Result<()> {
        let credentials = NetworkCredentials {
            network_id: cmd.network_id,
            network_key: cmd.network_key.clone(),
            plant_id: cmd.plant_id.clone(),
            node_name: cmd.node_name.clone(),
        };
        storage::store_credentials(kv, &credentials)?;
        info!(
            "commissioned as '{}' in plant '{}'",
            credentials.node_name, credentials.plant_id
        );
        self.credentials = Some(credentials);
        self.state = CommissioningState::Persisting;
        Ok(())
    }

    /// Wipe credentials; the node returns to the discovery mesh on reboot.
    pub fn decommission(&mut self, kv: &mut dyn KvStore) -> Result<()> {
        storage::clear_credentials(kv)?;
        info!("decommissioned; reverting to discovery mesh");
        self.credentials = None;
        self.state = CommissioningState::Discovery;
        Ok(())
    }
}

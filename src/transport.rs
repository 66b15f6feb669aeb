//! Radio transport seam.
//!
//! The mesh radio stack is a collaborator: it moves best-effort, unordered,
//! framed datagrams between endpoints. Nodes send toward the root; the
//! gateway unicasts to peers it has learned. Implementations wrap the real
//! radio driver; tests wire two endpoints of an in-memory mesh together.

use std::fmt;

use crate::config::TRANSPORT_MTU;
use crate::Mac;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No frame pending (recv is non-blocking).
    WouldBlock,
    /// Frame exceeds the transport MTU; never sent.
    FrameTooLarge(usize),
    /// The radio refused or dropped the send.
    SendFailed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "no frame pending"),
            Self::FrameTooLarge(n) => write!(f, "frame of {n} bytes exceeds MTU {TRANSPORT_MTU}"),
            Self::SendFailed => write!(f, "transport send failed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Best-effort framed-datagram transport between mesh endpoints.
///
/// Delivery is unordered and lossy; all reliability lives above this seam.
/// Implementations are shared across tasks, so every operation takes
/// `&self` and synchronizes internally.
pub trait Transport: Send + Sync {
    /// Send a frame toward the mesh root (node side).
    fn send_to_root(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Send a frame to a specific peer (gateway side).
    fn send_to(&self, dest: Mac, frame: &[u8]) -> Result<(), TransportError>;

    /// Fetch the next pending frame, or `WouldBlock` when empty.
    fn recv(&self) -> Result<(Mac, Vec<u8>), TransportError>;

    /// Best-effort route-table probe.
    fn is_reachable(&self, mac: Mac) -> bool {
        let _ = mac;
        true
    }

    /// Register a peer for unicast (first sighting of a new MAC).
    fn add_peer(&self, mac: Mac) {
        let _ = mac;
    }
}

/// Caller-side MTU guard. Our frames stay far below the MTU; this exists so
/// a future oversized payload fails loudly instead of silently truncating.
pub fn ensure_mtu(frame: &[u8]) -> Result<(), TransportError> {
    if frame.len() > TRANSPORT_MTU {
        return Err(TransportError::FrameTooLarge(frame.len()));
    }
    Ok(())
}

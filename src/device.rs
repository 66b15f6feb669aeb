//! Device command sinks.
//!
//! Relay boards, LED strips, and sensors sit behind the [`Device`] trait;
//! the node runtime applies decoded commands to it and echoes the resulting
//! state back over the mesh. The GPIO/UART/RMT drivers themselves live
//! outside the core.

use std::fmt;

use serde::Serialize;

/// Relay channels per relay board.
pub const RELAY_CHANNELS: usize = 2;

/// Peer device class, as carried in heartbeat acks and scan responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceType {
    Unknown,
    Relay,
    LedStrip,
    Sensor,
}

impl DeviceType {
    pub fn from_u8(raw: u8) -> DeviceType {
        match raw {
            0x01 => DeviceType::Relay,
            0x10 => DeviceType::LedStrip,
            0x20 => DeviceType::Sensor,
            _ => DeviceType::Unknown,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            DeviceType::Unknown => 0x00,
            DeviceType::Relay => 0x01,
            DeviceType::LedStrip => 0x10,
            DeviceType::Sensor => 0x20,
        }
    }
}

/// Relay switching action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    Off,
    On,
    Toggle,
}

impl RelayAction {
    pub fn from_u8(raw: u8) -> Option<RelayAction> {
        match raw {
            0 => Some(RelayAction::Off),
            1 => Some(RelayAction::On),
            2 => Some(RelayAction::Toggle),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            RelayAction::Off => 0,
            RelayAction::On => 1,
            RelayAction::Toggle => 2,
        }
    }
}

/// Addressable LED strip state, as echoed in `LedAck`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LedState {
    pub power: bool,
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub brightness: u8,
    pub effect: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// Channel index outside the device's relay bank.
    BadChannel(u8),
    /// The device class does not implement this command.
    Unsupported,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadChannel(ch) => write!(f, "no such relay channel {ch}"),
            Self::Unsupported => write!(f, "command not supported by this device"),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Uniform command sink implemented by the node's attached hardware.
pub trait Device: Send {
    fn device_type(&self) -> DeviceType;

    /// Switch one relay channel; returns the channel's new state.
    fn apply_relay(&mut self, channel: u8, action: RelayAction) -> Result<bool, DeviceError> {
        let _ = (channel, action);
        Err(DeviceError::Unsupported)
    }

    fn relay_state(&self, channel: u8) -> Result<bool, DeviceError> {
        let _ = channel;
        Err(DeviceError::Unsupported)
    }

    /// Apply an LED command (`action` selects the operation, `params` its
    /// arguments); returns the strip's resulting state.
    fn apply_led(&mut self, action: u8, params: &[u8]) -> Result<LedState, DeviceError> {
        let _ = (action, params);
        Err(DeviceError::Unsupported)
    }

    fn led_state(&self) -> Result<LedState, DeviceError> {
        Err(DeviceError::Unsupported)
    }
}

/// In-memory relay bank with explicit channel capacity. Hardware adapters
/// wrap this for state tracking and add the GPIO writes.
///
/// Channels are 1-based on the wire and in operator JSON (`relay1` is
/// channel 1); zero and out-of-range channels are `BadChannel`.
#[derive(Debug, Default)]
pub struct RelayBank {
    states: [bool; RELAY_CHANNELS],
}

impl RelayBank {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_index(channel: u8) -> Result<usize, DeviceError> {
        let index = (channel as usize)
            .checked_sub(1)
            .ok_or(DeviceError::BadChannel(channel))?;
        if index >= RELAY_CHANNELS {
            return Err(DeviceError::BadChannel(channel));
        }
        Ok(index)
    }

    pub fn apply(&mut self, channel: u8, action: RelayAction) -> Result<bool, DeviceError> {
        let slot = &mut self.states[Self::slot_index(channel)?];
        *slot = match action {
            RelayAction::Off => false,
            RelayAction::On => true,
            RelayAction::Toggle => !*slot,
        };
        Ok(*slot)
    }

    pub fn state(&self, channel: u8) -> Result<bool, DeviceError> {
        Ok(self.states[Self::slot_index(channel)?])
    }
}

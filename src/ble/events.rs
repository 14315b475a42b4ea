//! Inbound events delivered by the native radio binding.
//!
//! The exact encoding is owned by the binding; these are the shapes the
//! core consumes once a callback has been marshalled onto the event loop.

use serde::{Deserialize, Serialize};

use super::types::{CharacteristicId, ConnectionHandle, DescriptorId, DiscoveredDevice, GattService};

/// Link state as reported by the native stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NativeConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl NativeConnectionState {
    /// Map the platform profile state integer (0..=3)
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Disconnected),
            1 => Some(Self::Connecting),
            2 => Some(Self::Connected),
            3 => Some(Self::Disconnecting),
            _ => None,
        }
    }
}

/// Reason codes carried by adapter-level error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorReason {
    NoBle,
    NoAdapter,
    NotEnabled,
    DiscoverError,
    NoScanner,
    Other(i32),
}

impl ErrorReason {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Self::NoBle,
            2 => Self::NoAdapter,
            3 => Self::NotEnabled,
            4 => Self::DiscoverError,
            5 => Self::NoScanner,
            other => Self::Other(other),
        }
    }
}

/// Per-connection callback from the native stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattCallback {
    ConnectionStateChanged {
        status: i32,
        new_state: NativeConnectionState,
    },
    ServicesDiscovered {
        status: i32,
        services: Vec<GattService>,
    },
    CharacteristicRead {
        id: CharacteristicId,
        status: i32,
        value: Vec<u8>,
    },
    CharacteristicWrite {
        id: CharacteristicId,
        status: i32,
    },
    DescriptorRead {
        id: DescriptorId,
        status: i32,
        value: Vec<u8>,
    },
    DescriptorWrite {
        id: DescriptorId,
        status: i32,
    },
    MtuChanged {
        mtu: u16,
        status: i32,
    },
    /// Unsolicited notification or indication value from the peer
    CharacteristicChanged {
        id: CharacteristicId,
        value: Vec<u8>,
    },
}

impl GattCallback {
    /// Short name for log lines
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionStateChanged { .. } => "connection-state-changed",
            Self::ServicesDiscovered { .. } => "services-discovered",
            Self::CharacteristicRead { .. } => "characteristic-read",
            Self::CharacteristicWrite { .. } => "characteristic-write",
            Self::DescriptorRead { .. } => "descriptor-read",
            Self::DescriptorWrite { .. } => "descriptor-write",
            Self::MtuChanged { .. } => "mtu-changed",
            Self::CharacteristicChanged { .. } => "characteristic-changed",
        }
    }
}

/// Everything the radio binding can report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeEvent {
    /// Callback tagged with the connection it belongs to
    Gatt(ConnectionHandle, GattCallback),
    ScanStarted { success: bool },
    DeviceFound(DiscoveredDevice),
    ScanCompleted,
    BluetoothDisabled { success: bool },
    Error { reason: ErrorReason, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_state_mapping() {
        assert_eq!(NativeConnectionState::from_raw(0), Some(NativeConnectionState::Disconnected));
        assert_eq!(NativeConnectionState::from_raw(2), Some(NativeConnectionState::Connected));
        assert_eq!(NativeConnectionState::from_raw(9), None);
    }

    #[test]
    fn test_error_reason_mapping() {
        assert_eq!(ErrorReason::from_raw(4), ErrorReason::DiscoverError);
        assert_eq!(ErrorReason::from_raw(42), ErrorReason::Other(42));
    }
}

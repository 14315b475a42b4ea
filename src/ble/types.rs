//! Shared data structures for the BLE layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one physical link to a remote device.
///
/// The session token is generated fresh for every connect request, so a
/// reconnect to the same address never yields an equal handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionHandle {
    /// Device address as reported by the scanner (MAC or platform id)
    pub address: String,
    /// Per-connect session token
    pub session: Uuid,
}

impl ConnectionHandle {
    /// Create a handle with a new session token
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            session: Uuid::new_v4(),
        }
    }

    /// Short token suffix used in log lines
    pub fn short_token(&self) -> String {
        self.session.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.short_token())
    }
}

/// Addressable characteristic on a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacteristicId {
    /// Owning service UUID
    pub service: Uuid,
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Instance number, distinguishes repeated UUIDs within one service
    pub instance: u16,
}

impl CharacteristicId {
    pub fn new(service: Uuid, uuid: Uuid) -> Self {
        Self {
            service,
            uuid,
            instance: 0,
        }
    }

    /// The descriptor with the given UUID on this characteristic
    pub fn descriptor(&self, uuid: Uuid) -> DescriptorId {
        DescriptorId {
            characteristic: *self,
            uuid,
        }
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.instance == 0 {
            write!(f, "{}/{}", self.service, self.uuid)
        } else {
            write!(f, "{}/{}[{}]", self.service, self.uuid, self.instance)
        }
    }
}

/// Addressable descriptor on a remote characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DescriptorId {
    pub characteristic: CharacteristicId,
    pub uuid: Uuid,
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.characteristic, self.uuid)
    }
}

/// How a characteristic write is acknowledged by the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteType {
    /// Write request, the peer answers with a write response
    WithResponse,
    /// Write command, no response from the peer
    WithoutResponse,
}

impl Default for WriteType {
    fn default() -> Self {
        WriteType::WithResponse
    }
}

/// A service found during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattService {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<GattCharacteristic>,
}

/// A characteristic found during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattCharacteristic {
    pub id: CharacteristicId,
    /// Raw property bits (read, write, notify, indicate, ...)
    pub properties: u8,
    pub descriptors: Vec<Uuid>,
}

impl GattService {
    /// Find a characteristic of this service by UUID
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.id.uuid == uuid)
    }
}

/// A device reported by the (external) scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    /// First manufacturer-specific data record, empty when absent
    pub manufacturer_data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_never_reused() {
        let a = ConnectionHandle::new("AA:BB:CC:DD:EE:FF");
        let b = ConnectionHandle::new("AA:BB:CC:DD:EE:FF");
        assert_eq!(a.address, b.address);
        assert_ne!(a, b);
    }

    #[test]
    fn test_handle_display() {
        let handle = ConnectionHandle::new("dev-1");
        let shown = handle.to_string();
        assert!(shown.starts_with("dev-1#"));
        assert_eq!(shown.len(), "dev-1#".len() + 8);
    }

    #[test]
    fn test_descriptor_of_characteristic() {
        let service = Uuid::from_u128(0x180d);
        let ch = CharacteristicId::new(service, Uuid::from_u128(0x2a37));
        let cccd = ch.descriptor(Uuid::from_u128(0x2902));
        assert_eq!(cccd.characteristic, ch);
        assert_eq!(cccd.uuid, Uuid::from_u128(0x2902));
    }
}

//! Native radio capability
//!
//! The radio binding is injected into the event loop. Every call only
//! *issues* the operation and returns at once; the result comes back later
//! as a `NativeEvent` through the `NativeEventSink` the binding was built
//! with. A returned `Err` means nothing was issued and no callback follows.

use thiserror::Error;

use super::types::{CharacteristicId, ConnectionHandle, DescriptorId, WriteType};

/// Platform radio operations, one outstanding GATT call at a time
pub trait NativeRadio: Send + 'static {
    /// Open a link to `handle.address`
    fn connect(&mut self, handle: &ConnectionHandle) -> Result<(), RadioError>;

    fn discover_services(&mut self, handle: &ConnectionHandle) -> Result<(), RadioError>;

    fn read_characteristic(
        &mut self,
        handle: &ConnectionHandle,
        id: &CharacteristicId,
    ) -> Result<(), RadioError>;

    fn write_characteristic(
        &mut self,
        handle: &ConnectionHandle,
        id: &CharacteristicId,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), RadioError>;

    fn read_descriptor(
        &mut self,
        handle: &ConnectionHandle,
        id: &DescriptorId,
    ) -> Result<(), RadioError>;

    fn write_descriptor(
        &mut self,
        handle: &ConnectionHandle,
        id: &DescriptorId,
        value: &[u8],
    ) -> Result<(), RadioError>;

    fn request_mtu(&mut self, handle: &ConnectionHandle, mtu: u16) -> Result<(), RadioError>;

    /// Local notification routing switch. Synchronous, no callback follows.
    fn set_characteristic_notification(
        &mut self,
        handle: &ConnectionHandle,
        id: &CharacteristicId,
        enable: bool,
    ) -> Result<(), RadioError>;

    fn disconnect(&mut self, handle: &ConnectionHandle) -> Result<(), RadioError>;

    /// Release every native resource held for `handle`. No callback follows.
    fn close(&mut self, handle: &ConnectionHandle) -> Result<(), RadioError>;
}

/// Failure to issue a native call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Radio is busy with another operation")]
    Busy,

    #[error("Device is not connected")]
    NotConnected,

    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Platform error: {0}")]
    Platform(String),
}

#[cfg(feature = "ble")]
impl From<btleplug::Error> for RadioError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::NotConnected => RadioError::NotConnected,
            btleplug::Error::NotSupported(what) => RadioError::Unsupported(what),
            btleplug::Error::DeviceNotFound => RadioError::AttributeNotFound("device".to_string()),
            other => RadioError::Platform(other.to_string()),
        }
    }
}

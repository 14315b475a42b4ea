//! Bluetooth Low Energy layer
//!
//! Connection state machine, native event shapes and the radio bindings the
//! event loop drives.

pub mod events;
pub mod mock;
pub mod radio;
pub mod state;
pub mod types;

#[cfg(feature = "ble")]
pub mod btleplug_radio;

pub use events::{ErrorReason, GattCallback, NativeConnectionState, NativeEvent};
pub use mock::{MockRadio, RadioCall};
pub use radio::{NativeRadio, RadioError};
pub use state::{ConnectionState, ConnectionStateMachine, RequestError, SideEffect, StateEvent, Transition};
pub use types::{
    CharacteristicId, ConnectionHandle, DescriptorId, DiscoveredDevice, GattCharacteristic,
    GattService, WriteType,
};

#[cfg(feature = "ble")]
pub use btleplug_radio::BtleplugRadio;

use uuid::Uuid;

/// GATT status reported for a successful operation
pub const GATT_SUCCESS: i32 = 0;

/// GATT status for a request the stack does not support
pub const GATT_REQUEST_NOT_SUPPORTED: i32 = 6;

/// Generic failure, used when a native call cannot be issued at all
pub const GATT_FAILURE: i32 = 257;

/// Client Characteristic Configuration Descriptor (0x2902)
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value enabling indications
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// CCCD value disabling both
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Expand a 16-bit SIG-assigned UUID to its 128-bit form
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

/// CCCD payload for a notification toggle
pub fn cccd_value(enable: bool, indication: bool) -> [u8; 2] {
    match (enable, indication) {
        (false, _) => DISABLE_NOTIFICATION_VALUE,
        (true, true) => ENABLE_INDICATION_VALUE,
        (true, false) => ENABLE_NOTIFICATION_VALUE,
    }
}

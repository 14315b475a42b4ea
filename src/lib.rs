//! gattq - serialized GATT operation queue for single-slot BLE radio stacks
//!
//! Mobile and desktop BLE stacks accept one outstanding GATT operation per
//! connection and report results through asynchronous callbacks. This crate
//! puts a per-connection queue, a connection state machine and a timeout
//! guard in front of such a stack, so applications can fire requests freely
//! and receive exactly one outcome event for each.

pub mod ble;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod queue;
pub mod router;
pub mod session;
pub mod util;

use thiserror::Error;

pub use ble::{
    CharacteristicId, ConnectionHandle, ConnectionState, DescriptorId, GattService, MockRadio,
    NativeEvent, NativeRadio, RadioError, RequestError, WriteType,
};
pub use client::{event_channel, GattClient, LoopInbox, NativeEventSink};
pub use config::{ConfigError, GattConfig};
pub use dispatcher::{EventDispatcher, EventListener, GattEvent, ListenerId};
pub use queue::{OperationId, OperationKind, OperationStatus, Outcome, OutcomeData, Request};

/// Crate-level error
#[derive(Error, Debug)]
pub enum GattqError {
    #[error("Request rejected: {0}")]
    Request(#[from] RequestError),

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

//! GATT operation requests
//!
//! An `Operation` is one unit of work for the native stack. Each one gets a
//! session-unique `OperationId` when it is queued; that id is what the
//! queue uses to guarantee a single resolution.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::ble::types::{CharacteristicId, DescriptorId, WriteType};

/// Session-unique, monotonically increasing operation identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// The kind of native call an operation maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Connect,
    DiscoverServices,
    ReadCharacteristic,
    WriteCharacteristic,
    ReadDescriptor,
    WriteDescriptor,
    RequestMtu,
    Disconnect,
    Close,
}

impl OperationKind {
    /// Teardown operations jump ahead of pending reads and writes
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationKind::Disconnect | OperationKind::Close)
    }
}

/// What an operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationTarget {
    None,
    Characteristic(CharacteristicId),
    Descriptor(DescriptorId),
    /// Requested MTU size
    Mtu(u16),
}

impl fmt::Display for OperationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationTarget::None => f.write_str("-"),
            OperationTarget::Characteristic(id) => write!(f, "{}", id),
            OperationTarget::Descriptor(id) => write!(f, "{}", id),
            OperationTarget::Mtu(size) => write!(f, "mtu={}", size),
        }
    }
}

/// Application-side request, before it is turned into a queued operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Connect,
    DiscoverServices,
    ReadCharacteristic(CharacteristicId),
    WriteCharacteristic {
        id: CharacteristicId,
        value: Vec<u8>,
        write_type: WriteType,
    },
    ReadDescriptor(DescriptorId),
    WriteDescriptor {
        id: DescriptorId,
        value: Vec<u8>,
    },
    RequestMtu(u16),
    /// Toggle notifications locally, then write the CCCD once
    EnableNotifications {
        characteristic: CharacteristicId,
        enable: bool,
        indication: bool,
    },
    Disconnect,
    Close,
}

impl Request {
    /// Kind of the operation this request is queued as
    pub fn kind(&self) -> OperationKind {
        match self {
            Request::Connect => OperationKind::Connect,
            Request::DiscoverServices => OperationKind::DiscoverServices,
            Request::ReadCharacteristic(_) => OperationKind::ReadCharacteristic,
            Request::WriteCharacteristic { .. } => OperationKind::WriteCharacteristic,
            Request::ReadDescriptor(_) => OperationKind::ReadDescriptor,
            Request::WriteDescriptor { .. } | Request::EnableNotifications { .. } => {
                OperationKind::WriteDescriptor
            }
            Request::RequestMtu(_) => OperationKind::RequestMtu,
            Request::Disconnect => OperationKind::Disconnect,
            Request::Close => OperationKind::Close,
        }
    }
}

/// A queued unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub target: OperationTarget,
    pub payload: Option<Vec<u8>>,
    /// Overrides the queue's default timeout when set
    pub deadline: Option<Duration>,
    pub write_type: WriteType,
    /// Local notification toggle issued right before a CCCD write
    pub notification: Option<bool>,
}

impl Operation {
    pub fn new(id: OperationId, kind: OperationKind, target: OperationTarget) -> Self {
        Self {
            id,
            kind,
            target,
            payload: None,
            deadline: None,
            write_type: WriteType::default(),
            notification: None,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_write_type(mut self, write_type: WriteType) -> Self {
        self.write_type = write_type;
        self
    }

    pub fn with_notification(mut self, enable: bool) -> Self {
        self.notification = Some(enable);
        self
    }

    /// `(kind, target)` pair used to match native answers
    pub fn signature(&self) -> (OperationKind, OperationTarget) {
        (self.kind, self.target)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} {}", self.id, self.kind, self.target)
    }
}

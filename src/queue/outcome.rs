//! Resolution of a queued operation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::operation::{Operation, OperationId, OperationKind, OperationTarget};
use crate::ble::types::{ConnectionHandle, GattService};
use crate::ble::GATT_SUCCESS;

/// How an operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Success,
    /// Non-zero status code from the native stack
    GattError(i32),
    /// No native answer before the deadline
    Timeout,
    /// The link went away (or was torn down) before an answer arrived
    Disconnected,
}

impl OperationStatus {
    /// Map a native status code
    pub fn from_gatt(status: i32) -> Self {
        if status == GATT_SUCCESS {
            OperationStatus::Success
        } else {
            OperationStatus::GattError(status)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OperationStatus::Success)
    }
}

/// Payload carried by a successful outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeData {
    None,
    Bytes(Vec<u8>),
    Services(Vec<GattService>),
    Mtu(u16),
}

/// The single resolution of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    operation_id: OperationId,
    handle: ConnectionHandle,
    kind: OperationKind,
    target: OperationTarget,
    status: OperationStatus,
    data: OutcomeData,
    resolved_at: DateTime<Utc>,
}

impl Outcome {
    pub fn new(
        handle: ConnectionHandle,
        operation: &Operation,
        status: OperationStatus,
        data: OutcomeData,
    ) -> Self {
        Self {
            operation_id: operation.id,
            handle,
            kind: operation.kind,
            target: operation.target,
            status,
            data,
            resolved_at: Utc::now(),
        }
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn target(&self) -> OperationTarget {
        self.target
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn data(&self) -> &OutcomeData {
        &self.data
    }

    pub fn resolved_at(&self) -> DateTime<Utc> {
        self.resolved_at
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Bytes of a read, if any
    pub fn value(&self) -> Option<&[u8]> {
        match &self.data {
            OutcomeData::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_data(self) -> OutcomeData {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_gatt() {
        assert_eq!(OperationStatus::from_gatt(0), OperationStatus::Success);
        assert_eq!(OperationStatus::from_gatt(133), OperationStatus::GattError(133));
        assert!(!OperationStatus::Timeout.is_success());
    }

    #[test]
    fn test_outcome_accessors() {
        let handle = ConnectionHandle::new("dev");
        let op = Operation::new(OperationId(3), OperationKind::RequestMtu, OperationTarget::Mtu(247));
        let outcome = Outcome::new(handle.clone(), &op, OperationStatus::Success, OutcomeData::Mtu(185));

        assert_eq!(outcome.operation_id(), OperationId(3));
        assert_eq!(outcome.handle(), &handle);
        assert_eq!(outcome.kind(), OperationKind::RequestMtu);
        assert_eq!(outcome.target(), OperationTarget::Mtu(247));
        assert!(outcome.is_success());
        assert_eq!(outcome.value(), None);
        assert_eq!(outcome.into_data(), OutcomeData::Mtu(185));
    }
}

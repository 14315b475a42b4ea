//! Single entry point for everything the native stack reports
//!
//! Connection-state reports go to the owning session's state machine
//! whatever the slot holds. Operation results are matched against the slot
//! by handle, kind and target. Adapter-level reports are forwarded to
//! listeners unchanged. Nothing here panics or reports back to the stack.

use std::collections::HashMap;

use crate::ble::events::{GattCallback, NativeEvent};
use crate::ble::radio::NativeRadio;
use crate::ble::types::ConnectionHandle;
use crate::dispatcher::{EventDispatcher, GattEvent};
use crate::queue::{OperationKind, OperationTarget, OutcomeData};
use crate::session::GattSession;

/// What became of one native event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteResult {
    /// Applied to a session or its pending operation
    Delivered,
    /// Late answer for an operation that already timed out
    Orphaned,
    /// Did not match the pending slot
    Unmatched,
    /// Handle belongs to no live session
    UnknownConnection,
    /// Adapter-level event handed to listeners
    Forwarded,
    /// Transitional state report with no effect
    Ignored,
}

/// An operation result translated out of a native callback
#[derive(Debug, Clone, PartialEq)]
pub struct NativeResult {
    pub kind: OperationKind,
    pub target: OperationTarget,
    pub status: i32,
    pub data: OutcomeData,
}

impl NativeResult {
    /// Translate a result callback; `None` for state reports and pushes
    pub fn from_callback(callback: GattCallback) -> Option<Self> {
        let (kind, target, status, data) = match callback {
            GattCallback::ServicesDiscovered { status, services } => (
                OperationKind::DiscoverServices,
                OperationTarget::None,
                status,
                OutcomeData::Services(services),
            ),
            GattCallback::CharacteristicRead { id, status, value } => (
                OperationKind::ReadCharacteristic,
                OperationTarget::Characteristic(id),
                status,
                OutcomeData::Bytes(value),
            ),
            GattCallback::CharacteristicWrite { id, status } => (
                OperationKind::WriteCharacteristic,
                OperationTarget::Characteristic(id),
                status,
                OutcomeData::None,
            ),
            GattCallback::DescriptorRead { id, status, value } => (
                OperationKind::ReadDescriptor,
                OperationTarget::Descriptor(id),
                status,
                OutcomeData::Bytes(value),
            ),
            GattCallback::DescriptorWrite { id, status } => (
                OperationKind::WriteDescriptor,
                OperationTarget::Descriptor(id),
                status,
                OutcomeData::None,
            ),
            GattCallback::MtuChanged { mtu, status } => (
                OperationKind::RequestMtu,
                OperationTarget::Mtu(mtu),
                status,
                OutcomeData::Mtu(mtu),
            ),
            GattCallback::ConnectionStateChanged { .. } | GattCallback::CharacteristicChanged { .. } => {
                return None
            }
        };
        Some(Self {
            kind,
            target,
            status,
            data,
        })
    }
}

/// Demultiplexes native events onto sessions and listeners
#[derive(Debug, Default)]
pub struct NativeCallbackRouter {
    routed: u64,
    dropped: u64,
}

impl NativeCallbackRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events applied or forwarded
    pub fn routed(&self) -> u64 {
        self.routed
    }

    /// Events discarded (orphaned, unmatched or for unknown handles)
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn route(
        &mut self,
        event: NativeEvent,
        sessions: &mut HashMap<ConnectionHandle, GattSession>,
        radio: &mut dyn NativeRadio,
        events: &EventDispatcher,
    ) -> RouteResult {
        let result = match event {
            NativeEvent::Gatt(handle, callback) => match sessions.get_mut(&handle) {
                Some(session) => Self::route_gatt(session, callback, radio, events),
                None => {
                    tracing::warn!(
                        "⚠️ Dropping {} for unknown connection {}",
                        callback.name(),
                        handle
                    );
                    RouteResult::UnknownConnection
                }
            },
            NativeEvent::ScanStarted { success } => {
                events.publish(GattEvent::ScanStarted { success });
                RouteResult::Forwarded
            }
            NativeEvent::DeviceFound(device) => {
                events.publish(GattEvent::DeviceFound { device });
                RouteResult::Forwarded
            }
            NativeEvent::ScanCompleted => {
                events.publish(GattEvent::ScanCompleted);
                RouteResult::Forwarded
            }
            NativeEvent::BluetoothDisabled { success } => {
                events.publish(GattEvent::BluetoothDisabled { success });
                RouteResult::Forwarded
            }
            NativeEvent::Error { reason, message } => {
                tracing::warn!("⚠️ Radio error {:?}: {}", reason, message);
                events.publish(GattEvent::Error { reason, message });
                RouteResult::Forwarded
            }
        };

        match result {
            RouteResult::Orphaned | RouteResult::Unmatched | RouteResult::UnknownConnection => {
                self.dropped += 1
            }
            _ => self.routed += 1,
        }
        result
    }

    fn route_gatt(
        session: &mut GattSession,
        callback: GattCallback,
        radio: &mut dyn NativeRadio,
        events: &EventDispatcher,
    ) -> RouteResult {
        match callback {
            GattCallback::ConnectionStateChanged { status, new_state } => {
                session.on_connection_state_changed(status, new_state, radio, events)
            }
            GattCallback::CharacteristicChanged { id, value } => {
                session.on_characteristic_changed(id, value, events)
            }
            other => match NativeResult::from_callback(other) {
                Some(result) => session.on_result(result, radio, events),
                None => RouteResult::Ignored,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::events::{ErrorReason, NativeConnectionState};
    use crate::ble::mock::MockRadio;
    use crate::ble::types::CharacteristicId;
    use crate::config::GattConfig;
    use uuid::Uuid;

    #[test]
    fn test_translation() {
        let id = CharacteristicId::new(Uuid::from_u128(1), Uuid::from_u128(2));
        let result = NativeResult::from_callback(GattCallback::CharacteristicRead {
            id,
            status: 0,
            value: vec![7],
        })
        .unwrap();
        assert_eq!(result.kind, OperationKind::ReadCharacteristic);
        assert_eq!(result.target, OperationTarget::Characteristic(id));
        assert_eq!(result.data, OutcomeData::Bytes(vec![7]));

        assert!(NativeResult::from_callback(GattCallback::CharacteristicChanged { id, value: vec![] }).is_none());
    }

    #[test]
    fn test_unknown_handle_is_dropped() {
        let mut router = NativeCallbackRouter::new();
        let mut sessions = HashMap::new();
        let mut radio = MockRadio::new();
        let events = EventDispatcher::new();

        let stale = ConnectionHandle::new("dev");
        let result = router.route(
            NativeEvent::Gatt(
                stale,
                GattCallback::ConnectionStateChanged {
                    status: 0,
                    new_state: NativeConnectionState::Connected,
                },
            ),
            &mut sessions,
            &mut radio,
            &events,
        );
        assert_eq!(result, RouteResult::UnknownConnection);
        assert_eq!(router.dropped(), 1);
        assert_eq!(router.routed(), 0);
    }

    #[test]
    fn test_adapter_events_forwarded_unchanged() {
        let mut router = NativeCallbackRouter::new();
        let mut sessions = HashMap::new();
        let mut radio = MockRadio::new();
        let events = EventDispatcher::new();
        let (_, mut rx) = events.subscribe_channel();

        router.route(
            NativeEvent::Error {
                reason: ErrorReason::NoScanner,
                message: "scanner unavailable".to_string(),
            },
            &mut sessions,
            &mut radio,
            &events,
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            GattEvent::Error {
                reason: ErrorReason::NoScanner,
                message: "scanner unavailable".to_string()
            }
        );
        assert_eq!(router.routed(), 1);
    }

    #[test]
    fn test_notification_reaches_listeners_while_op_pending() {
        let mut router = NativeCallbackRouter::new();
        let mut radio = MockRadio::new();
        let events = EventDispatcher::new();
        let handle = ConnectionHandle::new("dev");

        let mut session = GattSession::new(handle.clone(), &GattConfig::default());
        session.connect(None, &mut radio, &events).unwrap();
        let mut sessions = HashMap::from([(handle.clone(), session)]);
        let (_, mut rx) = events.subscribe_channel();

        let id = CharacteristicId::new(Uuid::from_u128(1), Uuid::from_u128(2));
        let result = router.route(
            NativeEvent::Gatt(handle.clone(), GattCallback::CharacteristicChanged { id, value: vec![42] }),
            &mut sessions,
            &mut radio,
            &events,
        );
        assert_eq!(result, RouteResult::Delivered);
        assert!(matches!(
            rx.try_recv().unwrap(),
            GattEvent::CharacteristicChanged { value, .. } if value == vec![42]
        ));
        // The connect op is still waiting
        assert!(sessions[&handle].in_flight().is_some());
    }
}

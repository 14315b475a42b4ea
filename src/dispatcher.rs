//! Typed event fan-out to application listeners
//!
//! Every operation outcome becomes exactly one `GattEvent`. Listeners may
//! register from any thread; they are invoked on the event loop task after
//! the registry lock has been released.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::ble::events::ErrorReason;
use crate::ble::state::ConnectionState;
use crate::ble::types::{CharacteristicId, ConnectionHandle, DescriptorId, DiscoveredDevice, GattService};
use crate::queue::{OperationId, OperationKind, OperationStatus, OperationTarget, Outcome, OutcomeData};

/// Event delivered to application listeners
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GattEvent {
    ConnectionStateChanged {
        handle: ConnectionHandle,
        from: ConnectionState,
        to: ConnectionState,
    },
    ServicesDiscovered {
        operation_id: OperationId,
        handle: ConnectionHandle,
        status: OperationStatus,
        services: Vec<GattService>,
    },
    CharacteristicRead {
        operation_id: OperationId,
        handle: ConnectionHandle,
        characteristic: CharacteristicId,
        status: OperationStatus,
        value: Vec<u8>,
    },
    CharacteristicWrite {
        operation_id: OperationId,
        handle: ConnectionHandle,
        characteristic: CharacteristicId,
        status: OperationStatus,
    },
    DescriptorRead {
        operation_id: OperationId,
        handle: ConnectionHandle,
        descriptor: DescriptorId,
        status: OperationStatus,
        value: Vec<u8>,
    },
    DescriptorWrite {
        operation_id: OperationId,
        handle: ConnectionHandle,
        descriptor: DescriptorId,
        status: OperationStatus,
    },
    MtuChanged {
        operation_id: OperationId,
        handle: ConnectionHandle,
        status: OperationStatus,
        /// Negotiated MTU, absent unless the request succeeded
        mtu: Option<u16>,
    },
    /// Outcome of a connect, disconnect or close operation
    ConnectionOperation {
        operation_id: OperationId,
        handle: ConnectionHandle,
        kind: OperationKind,
        status: OperationStatus,
    },
    CharacteristicChanged {
        handle: ConnectionHandle,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    ScanStarted {
        success: bool,
    },
    DeviceFound {
        device: DiscoveredDevice,
    },
    ScanCompleted,
    BluetoothDisabled {
        success: bool,
    },
    Error {
        reason: ErrorReason,
        message: String,
    },
}

impl GattEvent {
    /// Build the single event for an outcome
    pub fn from_outcome(outcome: &Outcome) -> Self {
        let operation_id = outcome.operation_id();
        let handle = outcome.handle().clone();
        let status = outcome.status();
        let bytes = || outcome.value().map(<[u8]>::to_vec).unwrap_or_default();

        match (outcome.kind(), outcome.target()) {
            (OperationKind::DiscoverServices, _) => GattEvent::ServicesDiscovered {
                operation_id,
                handle,
                status,
                services: match outcome.data() {
                    OutcomeData::Services(services) => services.clone(),
                    _ => Vec::new(),
                },
            },
            (OperationKind::ReadCharacteristic, OperationTarget::Characteristic(characteristic)) => {
                GattEvent::CharacteristicRead {
                    operation_id,
                    handle,
                    characteristic,
                    status,
                    value: bytes(),
                }
            }
            (OperationKind::WriteCharacteristic, OperationTarget::Characteristic(characteristic)) => {
                GattEvent::CharacteristicWrite {
                    operation_id,
                    handle,
                    characteristic,
                    status,
                }
            }
            (OperationKind::ReadDescriptor, OperationTarget::Descriptor(descriptor)) => {
                GattEvent::DescriptorRead {
                    operation_id,
                    handle,
                    descriptor,
                    status,
                    value: bytes(),
                }
            }
            (OperationKind::WriteDescriptor, OperationTarget::Descriptor(descriptor)) => {
                GattEvent::DescriptorWrite {
                    operation_id,
                    handle,
                    descriptor,
                    status,
                }
            }
            (OperationKind::RequestMtu, _) => GattEvent::MtuChanged {
                operation_id,
                handle,
                status,
                mtu: match outcome.data() {
                    OutcomeData::Mtu(mtu) => Some(*mtu),
                    _ => None,
                },
            },
            (kind, _) => GattEvent::ConnectionOperation {
                operation_id,
                handle,
                kind,
                status,
            },
        }
    }

    /// Operation this event resolves, if it is an outcome
    pub fn operation_id(&self) -> Option<OperationId> {
        match self {
            GattEvent::ServicesDiscovered { operation_id, .. }
            | GattEvent::CharacteristicRead { operation_id, .. }
            | GattEvent::CharacteristicWrite { operation_id, .. }
            | GattEvent::DescriptorRead { operation_id, .. }
            | GattEvent::DescriptorWrite { operation_id, .. }
            | GattEvent::MtuChanged { operation_id, .. }
            | GattEvent::ConnectionOperation { operation_id, .. } => Some(*operation_id),
            _ => None,
        }
    }

    /// Status of the resolved operation, if this is an outcome
    pub fn status(&self) -> Option<OperationStatus> {
        match self {
            GattEvent::ServicesDiscovered { status, .. }
            | GattEvent::CharacteristicRead { status, .. }
            | GattEvent::CharacteristicWrite { status, .. }
            | GattEvent::DescriptorRead { status, .. }
            | GattEvent::DescriptorWrite { status, .. }
            | GattEvent::MtuChanged { status, .. }
            | GattEvent::ConnectionOperation { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn handle(&self) -> Option<&ConnectionHandle> {
        match self {
            GattEvent::ConnectionStateChanged { handle, .. }
            | GattEvent::ServicesDiscovered { handle, .. }
            | GattEvent::CharacteristicRead { handle, .. }
            | GattEvent::CharacteristicWrite { handle, .. }
            | GattEvent::DescriptorRead { handle, .. }
            | GattEvent::DescriptorWrite { handle, .. }
            | GattEvent::MtuChanged { handle, .. }
            | GattEvent::ConnectionOperation { handle, .. }
            | GattEvent::CharacteristicChanged { handle, .. } => Some(handle),
            _ => None,
        }
    }

    /// JSON encoding for hosts that ship events across a language boundary
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Receives published events
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &GattEvent);
}

impl<F> EventListener for F
where
    F: Fn(&GattEvent) + Send + Sync,
{
    fn on_event(&self, event: &GattEvent) {
        self(event)
    }
}

/// Registration token returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(ListenerId, Arc<dyn EventListener>)>,
}

/// Listener registry; clones share it
#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<RwLock<Registry>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl EventListener + 'static) -> ListenerId {
        let mut registry = self.registry.write();
        registry.next_id += 1;
        let id = ListenerId(registry.next_id);
        registry.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Subscribe with an unbounded channel instead of a callback
    pub fn subscribe_channel(&self) -> (ListenerId, mpsc::UnboundedReceiver<GattEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event: &GattEvent| {
            // Receiver dropped: nothing left to notify
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Returns false if `id` was not registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut registry = self.registry.write();
        let before = registry.listeners.len();
        registry.listeners.retain(|(lid, _)| *lid != id);
        registry.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.registry.read().listeners.len()
    }

    pub fn publish(&self, event: GattEvent) {
        let listeners: Vec<_> = self
            .registry
            .read()
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for listener in listeners {
            listener.on_event(&event);
        }
    }

    pub fn publish_outcome(&self, outcome: &Outcome) {
        tracing::debug!(
            "Resolved {} {:?} on {}: {:?}",
            outcome.operation_id(),
            outcome.kind(),
            outcome.handle(),
            outcome.status()
        );
        self.publish(GattEvent::from_outcome(outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Operation;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn read_outcome(status: OperationStatus, data: OutcomeData) -> Outcome {
        let ch = CharacteristicId::new(Uuid::from_u128(0x180f), Uuid::from_u128(0x2a19));
        let op = Operation::new(
            OperationId(1),
            OperationKind::ReadCharacteristic,
            OperationTarget::Characteristic(ch),
        );
        Outcome::new(ConnectionHandle::new("dev"), &op, status, data)
    }

    #[test]
    fn test_outcome_maps_to_typed_event() {
        let outcome = read_outcome(OperationStatus::Success, OutcomeData::Bytes(vec![0x64]));
        match GattEvent::from_outcome(&outcome) {
            GattEvent::CharacteristicRead { operation_id, status, value, .. } => {
                assert_eq!(operation_id, OperationId(1));
                assert_eq!(status, OperationStatus::Success);
                assert_eq!(value, vec![0x64]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_terminal_outcomes_are_connection_operations() {
        let op = Operation::new(OperationId(9), OperationKind::Close, OperationTarget::None);
        let outcome = Outcome::new(ConnectionHandle::new("dev"), &op, OperationStatus::Success, OutcomeData::None);
        let event = GattEvent::from_outcome(&outcome);
        assert!(matches!(
            event,
            GattEvent::ConnectionOperation { kind: OperationKind::Close, .. }
        ));
        assert_eq!(event.operation_id(), Some(OperationId(9)));
    }

    #[test]
    fn test_listeners_and_unsubscribe() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = dispatcher.subscribe(move |_: &GattEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.publish(GattEvent::ScanCompleted);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        dispatcher.publish(GattEvent::ScanCompleted);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_may_subscribe_during_publish() {
        let dispatcher = EventDispatcher::new();
        let inner = dispatcher.clone();
        dispatcher.subscribe(move |_: &GattEvent| {
            inner.subscribe(|_: &GattEvent| {});
        });

        dispatcher.publish(GattEvent::ScanCompleted);
        assert_eq!(dispatcher.listener_count(), 2);
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let dispatcher = EventDispatcher::new();
        let (_, mut rx) = dispatcher.subscribe_channel();
        dispatcher.publish_outcome(&read_outcome(OperationStatus::Timeout, OutcomeData::None));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.status(), Some(OperationStatus::Timeout));
    }

    #[test]
    fn test_json_is_tagged() {
        let json = GattEvent::BluetoothDisabled { success: true }.to_json().unwrap();
        assert_eq!(json, r#"{"type":"bluetooth_disabled","success":true}"#);
    }
}

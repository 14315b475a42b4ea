//! In-process radio for tests and the demo binary
//!
//! Records every call. In auto-respond mode it answers each issued call
//! through the event sink the way a healthy peripheral would; in manual mode
//! (no sink, or muted) tests inject the callbacks themselves.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::events::{GattCallback, NativeConnectionState, NativeEvent};
use super::radio::{NativeRadio, RadioError};
use super::types::{CharacteristicId, ConnectionHandle, DescriptorId, GattService, WriteType};
use super::GATT_SUCCESS;
use crate::client::NativeEventSink;

/// Largest MTU the mock peripheral agrees to
pub const MOCK_MAX_MTU: u16 = 247;

/// One recorded radio call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    Connect(ConnectionHandle),
    DiscoverServices(ConnectionHandle),
    ReadCharacteristic(ConnectionHandle, CharacteristicId),
    WriteCharacteristic(ConnectionHandle, CharacteristicId, Vec<u8>, WriteType),
    ReadDescriptor(ConnectionHandle, DescriptorId),
    WriteDescriptor(ConnectionHandle, DescriptorId, Vec<u8>),
    RequestMtu(ConnectionHandle, u16),
    SetNotification(ConnectionHandle, CharacteristicId, bool),
    Disconnect(ConnectionHandle),
    Close(ConnectionHandle),
}

#[derive(Default)]
struct MockState {
    calls: Vec<RadioCall>,
    responder: Option<NativeEventSink>,
    muted: bool,
    fail_next: Option<RadioError>,
    refuse_notifications: bool,
    services: Vec<GattService>,
    values: HashMap<CharacteristicId, Vec<u8>>,
    descriptor_values: HashMap<DescriptorId, Vec<u8>>,
}

/// Cloneable mock radio; clones share state
#[derive(Clone, Default)]
pub struct MockRadio {
    state: Arc<Mutex<MockState>>,
}

impl MockRadio {
    /// Manual mode: calls are recorded, nothing is answered
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every issued call through `sink`
    pub fn auto_respond(sink: NativeEventSink) -> Self {
        let radio = Self::new();
        radio.state.lock().responder = Some(sink);
        radio
    }

    /// Services reported by discovery
    pub fn with_services(self, services: Vec<GattService>) -> Self {
        self.state.lock().services = services;
        self
    }

    /// Value returned by reads of `id`
    pub fn set_value(&self, id: CharacteristicId, value: Vec<u8>) {
        self.state.lock().values.insert(id, value);
    }

    pub fn value(&self, id: &CharacteristicId) -> Option<Vec<u8>> {
        self.state.lock().values.get(id).cloned()
    }

    pub fn descriptor_value(&self, id: &DescriptorId) -> Option<Vec<u8>> {
        self.state.lock().descriptor_values.get(id).cloned()
    }

    /// Stop answering (simulates a hung stack) without forgetting the sink
    pub fn set_muted(&self, muted: bool) {
        self.state.lock().muted = muted;
    }

    /// Make the next call fail to issue
    pub fn fail_next(&self, err: RadioError) {
        self.state.lock().fail_next = Some(err);
    }

    /// Make the local notification switch fail
    pub fn refuse_notifications(&self, refuse: bool) {
        self.state.lock().refuse_notifications = refuse;
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Record `call`, then answer it if auto-responding
    fn issue(
        &self,
        call: RadioCall,
        answer: impl FnOnce(&mut MockState) -> Option<(ConnectionHandle, GattCallback)>,
    ) -> Result<(), RadioError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        let reply = answer(&mut *state);
        let sink = if state.muted { None } else { state.responder.clone() };
        drop(state);

        if let (Some(sink), Some((handle, callback))) = (sink, reply) {
            tracing::trace!("Mock radio answering {} for {}", callback.name(), handle);
            sink.deliver(NativeEvent::Gatt(handle, callback));
        }
        Ok(())
    }
}

impl NativeRadio for MockRadio {
    fn connect(&mut self, handle: &ConnectionHandle) -> Result<(), RadioError> {
        self.issue(RadioCall::Connect(handle.clone()), |_| {
            Some((
                handle.clone(),
                GattCallback::ConnectionStateChanged {
                    status: GATT_SUCCESS,
                    new_state: NativeConnectionState::Connected,
                },
            ))
        })
    }

    fn discover_services(&mut self, handle: &ConnectionHandle) -> Result<(), RadioError> {
        self.issue(RadioCall::DiscoverServices(handle.clone()), |state| {
            Some((
                handle.clone(),
                GattCallback::ServicesDiscovered {
                    status: GATT_SUCCESS,
                    services: state.services.clone(),
                },
            ))
        })
    }

    fn read_characteristic(
        &mut self,
        handle: &ConnectionHandle,
        id: &CharacteristicId,
    ) -> Result<(), RadioError> {
        self.issue(RadioCall::ReadCharacteristic(handle.clone(), *id), |state| {
            Some((
                handle.clone(),
                GattCallback::CharacteristicRead {
                    id: *id,
                    status: GATT_SUCCESS,
                    value: state.values.get(id).cloned().unwrap_or_default(),
                },
            ))
        })
    }

    fn write_characteristic(
        &mut self,
        handle: &ConnectionHandle,
        id: &CharacteristicId,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), RadioError> {
        let call = RadioCall::WriteCharacteristic(handle.clone(), *id, value.to_vec(), write_type);
        self.issue(call, |state| {
            state.values.insert(*id, value.to_vec());
            Some((
                handle.clone(),
                GattCallback::CharacteristicWrite {
                    id: *id,
                    status: GATT_SUCCESS,
                },
            ))
        })
    }

    fn read_descriptor(
        &mut self,
        handle: &ConnectionHandle,
        id: &DescriptorId,
    ) -> Result<(), RadioError> {
        self.issue(RadioCall::ReadDescriptor(handle.clone(), *id), |state| {
            Some((
                handle.clone(),
                GattCallback::DescriptorRead {
                    id: *id,
                    status: GATT_SUCCESS,
                    value: state.descriptor_values.get(id).cloned().unwrap_or_default(),
                },
            ))
        })
    }

    fn write_descriptor(
        &mut self,
        handle: &ConnectionHandle,
        id: &DescriptorId,
        value: &[u8],
    ) -> Result<(), RadioError> {
        self.issue(RadioCall::WriteDescriptor(handle.clone(), *id, value.to_vec()), |state| {
            state.descriptor_values.insert(*id, value.to_vec());
            Some((
                handle.clone(),
                GattCallback::DescriptorWrite {
                    id: *id,
                    status: GATT_SUCCESS,
                },
            ))
        })
    }

    fn request_mtu(&mut self, handle: &ConnectionHandle, mtu: u16) -> Result<(), RadioError> {
        self.issue(RadioCall::RequestMtu(handle.clone(), mtu), |_| {
            Some((
                handle.clone(),
                GattCallback::MtuChanged {
                    mtu: mtu.min(MOCK_MAX_MTU),
                    status: GATT_SUCCESS,
                },
            ))
        })
    }

    fn set_characteristic_notification(
        &mut self,
        handle: &ConnectionHandle,
        id: &CharacteristicId,
        enable: bool,
    ) -> Result<(), RadioError> {
        let refused = self.state.lock().refuse_notifications;
        self.issue(RadioCall::SetNotification(handle.clone(), *id, enable), |_| None)?;
        if refused {
            return Err(RadioError::Unsupported("notifications".to_string()));
        }
        Ok(())
    }

    fn disconnect(&mut self, handle: &ConnectionHandle) -> Result<(), RadioError> {
        self.issue(RadioCall::Disconnect(handle.clone()), |_| {
            Some((
                handle.clone(),
                GattCallback::ConnectionStateChanged {
                    status: GATT_SUCCESS,
                    new_state: NativeConnectionState::Disconnected,
                },
            ))
        })
    }

    fn close(&mut self, handle: &ConnectionHandle) -> Result<(), RadioError> {
        self.issue(RadioCall::Close(handle.clone()), |_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::event_channel;
    use uuid::Uuid;

    #[test]
    fn test_manual_mode_records_calls() {
        let mut radio = MockRadio::new();
        let handle = ConnectionHandle::new("dev");
        radio.connect(&handle).unwrap();
        radio.request_mtu(&handle, 512).unwrap();

        assert_eq!(
            radio.calls(),
            vec![RadioCall::Connect(handle.clone()), RadioCall::RequestMtu(handle, 512)]
        );
        radio.clear_calls();
        assert!(radio.calls().is_empty());
    }

    #[test]
    fn test_fail_next_applies_once() {
        let mut radio = MockRadio::new();
        let handle = ConnectionHandle::new("dev");
        radio.fail_next(RadioError::Busy);

        assert_eq!(radio.discover_services(&handle), Err(RadioError::Busy));
        assert!(radio.discover_services(&handle).is_ok());
    }

    #[test]
    fn test_writes_update_stored_values() {
        let mut radio = MockRadio::new();
        let handle = ConnectionHandle::new("dev");
        let id = CharacteristicId::new(Uuid::from_u128(1), Uuid::from_u128(2));

        radio
            .write_characteristic(&handle, &id, &[9, 9], WriteType::WithResponse)
            .unwrap();
        assert_eq!(radio.value(&id), Some(vec![9, 9]));
    }

    #[tokio::test]
    async fn test_auto_respond_delivers_callbacks() {
        let (sink, mut inbox) = event_channel();
        let mut radio = MockRadio::auto_respond(sink);
        let handle = ConnectionHandle::new("dev");

        radio.request_mtu(&handle, 517).unwrap();
        let event = inbox.try_next_native().expect("mtu answer");
        assert_eq!(
            event,
            NativeEvent::Gatt(
                handle.clone(),
                GattCallback::MtuChanged {
                    mtu: MOCK_MAX_MTU,
                    status: GATT_SUCCESS
                }
            )
        );

        radio.set_muted(true);
        radio.disconnect(&handle).unwrap();
        assert!(inbox.try_next_native().is_none());
    }
}

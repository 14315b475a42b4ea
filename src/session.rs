//! One connection: state machine, operation queue, pending slot and timeout
//!
//! All methods run on the event loop task. Each takes the radio and the
//! dispatcher by reference so the session never outlives a turn of the loop
//! holding either.

use std::time::Duration;
use tokio::time::Instant;

use crate::ble::events::NativeConnectionState;
use crate::ble::radio::{NativeRadio, RadioError};
use crate::ble::state::{ConnectionState, ConnectionStateMachine, RequestError, StateEvent, Transition};
use crate::ble::types::{CharacteristicId, ConnectionHandle};
use crate::ble::{cccd_value, CCCD_UUID, GATT_FAILURE, GATT_SUCCESS};
use crate::config::GattConfig;
use crate::dispatcher::{EventDispatcher, GattEvent};
use crate::queue::{
    deadline_after, Operation, OperationId, OperationKind, OperationQueue, OperationStatus,
    OperationTarget, Outcome, OutcomeData, QueueStats, Request, TimeoutGuard,
};
use crate::router::{NativeResult, RouteResult};
use crate::util::common::hex_preview;

/// State of a single connection
pub struct GattSession {
    handle: ConnectionHandle,
    machine: ConnectionStateMachine,
    queue: OperationQueue,
    timeout: TimeoutGuard,
    supports_indication: bool,
    /// Handles are single-use: set once the connect op has been queued
    connect_requested: bool,
}

impl GattSession {
    pub fn new(handle: ConnectionHandle, config: &GattConfig) -> Self {
        Self {
            handle,
            machine: ConnectionStateMachine::new(),
            queue: OperationQueue::new(),
            timeout: TimeoutGuard::new(config.queue_timeout()),
            supports_indication: config.supports_indication,
            connect_requested: false,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn is_closed(&self) -> bool {
        self.machine.is_closed()
    }

    /// Nothing left to resolve and the handle can never be reused: closed,
    /// or disconnected after its one connect attempt
    pub fn is_finished(&self) -> bool {
        let ended = match self.machine.state() {
            ConnectionState::Closed => true,
            ConnectionState::Disconnected => self.connect_requested,
            _ => false,
        };
        ended && self.queue.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn in_flight(&self) -> Option<&Operation> {
        self.queue.in_flight()
    }

    /// Deadline of the in-flight operation, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timeout.deadline()
    }

    /// Queue the connect operation and start the attempt
    pub fn connect(
        &mut self,
        deadline: Option<Duration>,
        radio: &mut dyn NativeRadio,
        events: &EventDispatcher,
    ) -> Result<OperationId, RequestError> {
        if self.connect_requested {
            return Err(RequestError::InvalidState {
                state: self.machine.state(),
                action: "Connect on a used handle".to_string(),
            });
        }
        let transition = self.machine.request(StateEvent::ConnectRequested)?;
        self.connect_requested = true;

        let id = self.queue.next_id();
        self.queue
            .enqueue(Operation::new(id, OperationKind::Connect, OperationTarget::None).with_deadline(deadline));
        tracing::info!("Connecting {}", self.handle);
        self.publish_transition(transition, events);
        self.dispatch(radio, events);
        Ok(id)
    }

    /// Validate and queue an application request
    pub fn enqueue(
        &mut self,
        request: Request,
        deadline: Option<Duration>,
        radio: &mut dyn NativeRadio,
        events: &EventDispatcher,
    ) -> Result<OperationId, RequestError> {
        if let Request::Connect = request {
            return self.connect(deadline, radio, events);
        }
        self.machine.ensure_accepts(request.kind())?;

        let id = self.queue.next_id();
        let op = self.build(id, request).with_deadline(deadline);
        self.queue.enqueue(op);
        self.dispatch(radio, events);
        Ok(id)
    }

    /// Queue a notification toggle followed by one CCCD write
    pub fn enable_notifications(
        &mut self,
        characteristic: CharacteristicId,
        enable: bool,
        indication: bool,
        deadline: Option<Duration>,
        radio: &mut dyn NativeRadio,
        events: &EventDispatcher,
    ) -> Result<OperationId, RequestError> {
        let request = Request::EnableNotifications {
            characteristic,
            enable,
            indication,
        };
        self.enqueue(request, deadline, radio, events)
    }

    fn build(&self, id: OperationId, request: Request) -> Operation {
        match request {
            Request::Connect => Operation::new(id, OperationKind::Connect, OperationTarget::None),
            Request::DiscoverServices => {
                Operation::new(id, OperationKind::DiscoverServices, OperationTarget::None)
            }
            Request::ReadCharacteristic(ch) => Operation::new(
                id,
                OperationKind::ReadCharacteristic,
                OperationTarget::Characteristic(ch),
            ),
            Request::WriteCharacteristic {
                id: ch,
                value,
                write_type,
            } => Operation::new(
                id,
                OperationKind::WriteCharacteristic,
                OperationTarget::Characteristic(ch),
            )
            .with_payload(value)
            .with_write_type(write_type),
            Request::ReadDescriptor(desc) => {
                Operation::new(id, OperationKind::ReadDescriptor, OperationTarget::Descriptor(desc))
            }
            Request::WriteDescriptor { id: desc, value } => {
                Operation::new(id, OperationKind::WriteDescriptor, OperationTarget::Descriptor(desc))
                    .with_payload(value)
            }
            Request::RequestMtu(size) => {
                Operation::new(id, OperationKind::RequestMtu, OperationTarget::Mtu(size))
            }
            Request::EnableNotifications {
                characteristic,
                enable,
                indication,
            } => {
                let indication = if enable && indication && !self.supports_indication {
                    tracing::warn!(
                        "⚠️ Indications not supported on {}, enabling notifications instead",
                        self.handle
                    );
                    false
                } else {
                    indication
                };
                let cccd = characteristic.descriptor(CCCD_UUID);
                Operation::new(id, OperationKind::WriteDescriptor, OperationTarget::Descriptor(cccd))
                    .with_payload(cccd_value(enable, indication).to_vec())
                    .with_notification(enable)
            }
            Request::Disconnect => Operation::new(id, OperationKind::Disconnect, OperationTarget::None),
            Request::Close => Operation::new(id, OperationKind::Close, OperationTarget::None),
        }
    }

    /// Move queued operations into the slot until one is left waiting on the radio
    pub fn dispatch(&mut self, radio: &mut dyn NativeRadio, events: &EventDispatcher) {
        while let Some(op) = self.queue.next_dispatchable(self.machine.state()) {
            if op.is_terminal() {
                for dropped in self.queue.drain_non_terminal() {
                    self.resolve(dropped, OperationStatus::Disconnected, OutcomeData::None, events);
                }
            }

            if let Some(op) = self.issue(op, radio, events) {
                let deadline = self.timeout.arm(op.id, op.deadline, Instant::now());
                tracing::debug!(
                    "In flight on {}: {} (deadline in {:?})",
                    self.handle,
                    op,
                    deadline.saturating_duration_since(Instant::now())
                );
                if let Err(e) = self.queue.occupy(op) {
                    tracing::error!("❌ {}", e);
                }
            }
        }
    }

    /// Issue the native call. Returns the operation if it now awaits a callback.
    fn issue(
        &mut self,
        op: Operation,
        radio: &mut dyn NativeRadio,
        events: &EventDispatcher,
    ) -> Option<Operation> {
        let handle = &self.handle;
        let issued = match (op.kind, op.target) {
            (OperationKind::Connect, _) => radio.connect(handle),
            (OperationKind::DiscoverServices, _) => radio.discover_services(handle),
            (OperationKind::ReadCharacteristic, OperationTarget::Characteristic(id)) => {
                radio.read_characteristic(handle, &id)
            }
            (OperationKind::WriteCharacteristic, OperationTarget::Characteristic(id)) => {
                let value = op.payload.as_deref().unwrap_or_default();
                tracing::debug!("Writing {} to {}", hex_preview(value, 16), id);
                radio.write_characteristic(handle, &id, value, op.write_type)
            }
            (OperationKind::ReadDescriptor, OperationTarget::Descriptor(id)) => {
                radio.read_descriptor(handle, &id)
            }
            (OperationKind::WriteDescriptor, OperationTarget::Descriptor(id)) => {
                let value = op.payload.as_deref().unwrap_or_default();
                match op.notification {
                    Some(enable) => radio
                        .set_characteristic_notification(handle, &id.characteristic, enable)
                        .and_then(|_| radio.write_descriptor(handle, &id, value)),
                    None => radio.write_descriptor(handle, &id, value),
                }
            }
            (OperationKind::RequestMtu, OperationTarget::Mtu(size)) => radio.request_mtu(handle, size),
            (OperationKind::Disconnect, _) => return self.issue_disconnect(op, radio, events),
            (OperationKind::Close, _) => {
                self.close_now(op, radio, events);
                return None;
            }
            (kind, target) => Err(RadioError::AttributeNotFound(format!("{:?} target {}", kind, target))),
        };

        match issued {
            Ok(()) => Some(op),
            Err(e) => {
                tracing::error!("❌ Failed to issue {} on {}: {}", op, self.handle, e);
                let status = OperationStatus::GattError(GATT_FAILURE);
                if op.kind == OperationKind::Connect {
                    self.connect_failed(Some(op), status, events);
                } else {
                    self.resolve(op, status, OutcomeData::None, events);
                }
                None
            }
        }
    }

    fn issue_disconnect(
        &mut self,
        op: Operation,
        radio: &mut dyn NativeRadio,
        events: &EventDispatcher,
    ) -> Option<Operation> {
        let transition = match self.machine.request(StateEvent::DisconnectRequested) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("⚠️ {} on {}: {}", op, self.handle, e);
                self.resolve(op, OperationStatus::Disconnected, OutcomeData::None, events);
                return None;
            }
        };
        self.publish_transition(transition, events);

        if transition.to == ConnectionState::Disconnected {
            // Nothing to tear down
            self.resolve(op, OperationStatus::Success, OutcomeData::None, events);
            return None;
        }

        match radio.disconnect(&self.handle) {
            Ok(()) => Some(op),
            Err(e) => {
                tracing::error!("❌ Failed to issue disconnect on {}: {}", self.handle, e);
                self.resolve(op, OperationStatus::GattError(GATT_FAILURE), OutcomeData::None, events);
                None
            }
        }
    }

    fn close_now(&mut self, op: Operation, radio: &mut dyn NativeRadio, events: &EventDispatcher) {
        let transition = match self.machine.request(StateEvent::CloseRequested) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("⚠️ {} on {}: {}", op, self.handle, e);
                self.resolve(op, OperationStatus::Disconnected, OutcomeData::None, events);
                return;
            }
        };
        self.timeout.clear();
        self.queue.clear_orphans();
        self.publish_transition(transition, events);

        for dropped in self.queue.drain_all() {
            self.resolve(dropped, OperationStatus::Disconnected, OutcomeData::None, events);
        }
        if let Err(e) = radio.close(&self.handle) {
            tracing::warn!("⚠️ Radio close failed for {}: {}", self.handle, e);
        }
        tracing::info!("Closed {}", self.handle);
        self.resolve(op, OperationStatus::Success, OutcomeData::None, events);
    }

    /// Publish the outcome of `op`. Each operation reaches here exactly once.
    pub fn resolve(
        &mut self,
        op: Operation,
        status: OperationStatus,
        data: OutcomeData,
        events: &EventDispatcher,
    ) {
        self.timeout.disarm(op.id);
        let outcome = Outcome::new(self.handle.clone(), &op, status, data);
        events.publish_outcome(&outcome);
    }

    /// Result callback for the operation in the slot
    pub fn on_result(
        &mut self,
        result: NativeResult,
        radio: &mut dyn NativeRadio,
        events: &EventDispatcher,
    ) -> RouteResult {
        let signature = (result.kind, result.target);
        if self.queue.claim_orphan(signature, Instant::now()) {
            tracing::debug!(
                "Discarding late {:?} answer on {} for a timed-out operation",
                result.kind,
                self.handle
            );
            return RouteResult::Orphaned;
        }

        let Some(op) = self.queue.take_matching(signature) else {
            tracing::warn!(
                "⚠️ Dropping unmatched {:?} {} answer on {} (in flight: {:?})",
                result.kind,
                result.target,
                self.handle,
                self.queue.in_flight().map(|op| op.id)
            );
            return RouteResult::Unmatched;
        };
        self.queue.clear_orphans();

        let status = OperationStatus::from_gatt(result.status);
        let data = if status.is_success() {
            result.data
        } else {
            OutcomeData::None
        };
        self.resolve(op, status, data, events);
        self.dispatch(radio, events);
        RouteResult::Delivered
    }

    /// Link state report from the native stack, applied whatever the slot holds
    pub fn on_connection_state_changed(
        &mut self,
        status: i32,
        new_state: NativeConnectionState,
        radio: &mut dyn NativeRadio,
        events: &EventDispatcher,
    ) -> RouteResult {
        match new_state {
            NativeConnectionState::Connected if status == GATT_SUCCESS => self.on_link_up(radio, events),
            NativeConnectionState::Connected | NativeConnectionState::Disconnected => {
                self.on_link_down(status, radio, events)
            }
            NativeConnectionState::Connecting | NativeConnectionState::Disconnecting => {
                tracing::trace!("{} reports {:?}", self.handle, new_state);
                RouteResult::Ignored
            }
        }
    }

    fn on_link_up(&mut self, radio: &mut dyn NativeRadio, events: &EventDispatcher) -> RouteResult {
        if self
            .queue
            .claim_orphan((OperationKind::Connect, OperationTarget::None), Instant::now())
        {
            tracing::warn!("⚠️ Late connect on {} after timeout, dropping the link", self.handle);
            if let Err(e) = radio.disconnect(&self.handle) {
                tracing::debug!("Disconnect of late link {} failed: {}", self.handle, e);
            }
            return RouteResult::Orphaned;
        }

        let transition = match self.machine.request(StateEvent::NativeConnected) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("⚠️ Ignoring connected report on {}: {}", self.handle, e);
                return RouteResult::Unmatched;
            }
        };
        tracing::info!("✅ Connected {}", self.handle);
        self.publish_transition(transition, events);

        if let Some(op) = self
            .queue
            .take_matching((OperationKind::Connect, OperationTarget::None))
        {
            self.resolve(op, OperationStatus::Success, OutcomeData::None, events);
        }
        self.dispatch(radio, events);
        RouteResult::Delivered
    }

    fn on_link_down(
        &mut self,
        status: i32,
        radio: &mut dyn NativeRadio,
        events: &EventDispatcher,
    ) -> RouteResult {
        self.queue.clear_orphans();
        let in_flight = self.queue.take_in_flight();

        if self.machine.state() == ConnectionState::Connecting {
            let connect_status = if status == GATT_SUCCESS {
                OperationStatus::Disconnected
            } else {
                OperationStatus::GattError(status)
            };
            tracing::warn!("⚠️ Connect to {} failed (status {})", self.handle, status);
            self.connect_failed(in_flight, connect_status, events);
        } else {
            match self.machine.request(StateEvent::NativeDisconnected) {
                Ok(transition) => {
                    if transition.changed() {
                        tracing::info!("Disconnected {} (status {})", self.handle, status);
                    }
                    self.publish_transition(transition, events);
                }
                Err(e) => tracing::debug!("Disconnect report on {}: {}", self.handle, e),
            }

            if let Some(op) = in_flight {
                let status = if op.kind == OperationKind::Disconnect {
                    OperationStatus::Success
                } else {
                    OperationStatus::Disconnected
                };
                self.resolve(op, status, OutcomeData::None, events);
            }
            for dropped in self.queue.drain_non_terminal() {
                self.resolve(dropped, OperationStatus::Disconnected, OutcomeData::None, events);
            }
        }

        // Queued disconnect/close ops still run
        self.dispatch(radio, events);
        RouteResult::Delivered
    }

    fn connect_failed(
        &mut self,
        op: Option<Operation>,
        status: OperationStatus,
        events: &EventDispatcher,
    ) {
        match self.machine.request(StateEvent::ConnectFailed) {
            Ok(transition) => self.publish_transition(transition, events),
            Err(e) => tracing::debug!("Connect failure on {}: {}", self.handle, e),
        }
        if let Some(op) = op {
            self.resolve(op, status, OutcomeData::None, events);
        }
        for dropped in self.queue.drain_non_terminal() {
            self.resolve(dropped, OperationStatus::Disconnected, OutcomeData::None, events);
        }
    }

    /// Resolve the in-flight operation with `Timeout` if its deadline passed
    pub fn poll_timeouts(
        &mut self,
        now: Instant,
        radio: &mut dyn NativeRadio,
        events: &EventDispatcher,
    ) -> bool {
        let Some(id) = self.timeout.expired(now) else {
            return false;
        };
        self.timeout.clear();
        let Some(op) = self.queue.take_if(id) else {
            return false;
        };

        tracing::warn!("⏱️ {} on {} timed out", op, self.handle);
        if self.queue.orphan_claimed_in_flight() {
            // Its answer was already consumed in place of an earlier orphan's
            tracing::debug!("Not remembering {} as an orphan", op);
        } else {
            let expires = deadline_after(now, self.timeout.effective(op.deadline));
            self.queue.remember_orphan(op.signature(), expires);
        }

        if op.kind == OperationKind::Connect {
            // Abandon the attempt; the stack may still be trying
            if let Err(e) = radio.disconnect(&self.handle) {
                tracing::debug!("Disconnect after connect timeout on {}: {}", self.handle, e);
            }
            self.connect_failed(Some(op), OperationStatus::Timeout, events);
        } else {
            self.resolve(op, OperationStatus::Timeout, OutcomeData::None, events);
        }
        self.dispatch(radio, events);
        true
    }

    /// Unsolicited value push, forwarded regardless of the slot while the link is up
    pub fn on_characteristic_changed(
        &self,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        events: &EventDispatcher,
    ) -> RouteResult {
        if !matches!(
            self.machine.state(),
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            tracing::debug!("Dropping {} push on {} in {:?}", characteristic, self.handle, self.machine.state());
            return RouteResult::Unmatched;
        }
        tracing::trace!("{} changed on {}: {}", characteristic, self.handle, hex_preview(&value, 16));
        events.publish(GattEvent::CharacteristicChanged {
            handle: self.handle.clone(),
            characteristic,
            value,
        });
        RouteResult::Delivered
    }

    /// Close immediately, resolving everything still queued with `Disconnected`
    pub fn teardown(&mut self, radio: &mut dyn NativeRadio, events: &EventDispatcher) {
        let transition = match self.machine.request(StateEvent::CloseRequested) {
            Ok(t) => t,
            Err(_) => return,
        };
        self.timeout.clear();
        self.queue.clear_orphans();
        self.publish_transition(transition, events);

        for dropped in self.queue.drain_all() {
            self.resolve(dropped, OperationStatus::Disconnected, OutcomeData::None, events);
        }
        if let Err(e) = radio.close(&self.handle) {
            tracing::warn!("⚠️ Radio close failed for {}: {}", self.handle, e);
        }
    }

    fn publish_transition(&self, transition: Transition, events: &EventDispatcher) {
        if transition.changed() {
            events.publish(GattEvent::ConnectionStateChanged {
                handle: self.handle.clone(),
                from: transition.from,
                to: transition.to,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::{MockRadio, RadioCall};
    use crate::ble::{ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE};
    use tokio::sync::mpsc::UnboundedReceiver;
    use uuid::Uuid;

    struct Harness {
        session: GattSession,
        radio: MockRadio,
        events: EventDispatcher,
        rx: UnboundedReceiver<GattEvent>,
    }

    impl Harness {
        fn new(config: GattConfig) -> Self {
            let events = EventDispatcher::new();
            let (_, rx) = events.subscribe_channel();
            Self {
                session: GattSession::new(ConnectionHandle::new("AA:BB"), &config),
                radio: MockRadio::new(),
                events,
                rx,
            }
        }

        fn connected() -> Self {
            let mut h = Self::new(GattConfig::default());
            h.session.connect(None, &mut h.radio, &h.events).unwrap();
            h.link(NativeConnectionState::Connected, GATT_SUCCESS);
            h.drain();
            h.radio.clear_calls();
            h
        }

        fn submit(&mut self, request: Request) -> OperationId {
            self.session
                .enqueue(request, None, &mut self.radio, &self.events)
                .unwrap()
        }

        fn link(&mut self, state: NativeConnectionState, status: i32) -> RouteResult {
            self.session
                .on_connection_state_changed(status, state, &mut self.radio, &self.events)
        }

        fn answer(&mut self, kind: OperationKind, target: OperationTarget, data: OutcomeData) -> RouteResult {
            let result = NativeResult {
                kind,
                target,
                status: GATT_SUCCESS,
                data,
            };
            self.session.on_result(result, &mut self.radio, &self.events)
        }

        fn drain(&mut self) -> Vec<GattEvent> {
            std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
        }
    }

    fn ch(n: u128) -> CharacteristicId {
        CharacteristicId::new(Uuid::from_u128(0x180d), Uuid::from_u128(n))
    }

    #[test]
    fn test_connect_publishes_transitions_and_outcome() {
        let mut h = Harness::new(GattConfig::default());
        let id = h.session.connect(None, &mut h.radio, &h.events).unwrap();
        assert_eq!(h.session.state(), ConnectionState::Connecting);
        assert_eq!(h.radio.calls(), vec![RadioCall::Connect(h.session.handle().clone())]);

        h.link(NativeConnectionState::Connected, GATT_SUCCESS);
        let events = h.drain();
        assert!(matches!(
            events[0],
            GattEvent::ConnectionStateChanged { to: ConnectionState::Connecting, .. }
        ));
        assert!(matches!(
            events[1],
            GattEvent::ConnectionStateChanged { to: ConnectionState::Connected, .. }
        ));
        assert_eq!(events[2].operation_id(), Some(id));
        assert_eq!(events[2].status(), Some(OperationStatus::Success));
    }

    #[test]
    fn test_handle_is_single_use() {
        let mut h = Harness::connected();
        assert!(matches!(
            h.session.connect(None, &mut h.radio, &h.events),
            Err(RequestError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_one_in_flight_and_fifo() {
        let mut h = Harness::connected();
        let a = h.submit(Request::ReadCharacteristic(ch(1)));
        let b = h.submit(Request::ReadCharacteristic(ch(2)));

        assert_eq!(h.radio.calls().len(), 1);
        assert_eq!(h.session.in_flight().map(|op| op.id), Some(a));

        h.answer(
            OperationKind::ReadCharacteristic,
            OperationTarget::Characteristic(ch(1)),
            OutcomeData::Bytes(vec![1]),
        );
        assert_eq!(h.session.in_flight().map(|op| op.id), Some(b));
        assert_eq!(h.radio.calls().len(), 2);
    }

    #[test]
    fn test_duplicate_answer_is_dropped() {
        let mut h = Harness::connected();
        h.submit(Request::ReadCharacteristic(ch(1)));
        let target = OperationTarget::Characteristic(ch(1));

        assert_eq!(
            h.answer(OperationKind::ReadCharacteristic, target, OutcomeData::Bytes(vec![1])),
            RouteResult::Delivered
        );
        assert_eq!(
            h.answer(OperationKind::ReadCharacteristic, target, OutcomeData::Bytes(vec![1])),
            RouteResult::Unmatched
        );
        assert_eq!(h.drain().len(), 1);
    }

    #[test]
    fn test_ops_held_while_connecting() {
        let mut h = Harness::new(GattConfig::default());
        h.session.connect(None, &mut h.radio, &h.events).unwrap();
        h.submit(Request::DiscoverServices);
        h.submit(Request::RequestMtu(185));
        assert_eq!(h.radio.calls().len(), 1);

        h.link(NativeConnectionState::Connected, GATT_SUCCESS);
        let handle = h.session.handle().clone();
        assert_eq!(h.radio.calls()[1], RadioCall::DiscoverServices(handle));
    }

    #[test]
    fn test_connect_failure_fails_queued_ops() {
        let mut h = Harness::new(GattConfig::default());
        let connect = h.session.connect(None, &mut h.radio, &h.events).unwrap();
        let read = h.submit(Request::ReadCharacteristic(ch(1)));
        h.drain();

        h.link(NativeConnectionState::Disconnected, 133);
        assert_eq!(h.session.state(), ConnectionState::Disconnected);

        let events = h.drain();
        assert!(matches!(
            events[0],
            GattEvent::ConnectionStateChanged { to: ConnectionState::Disconnected, .. }
        ));
        assert_eq!(events[1].operation_id(), Some(connect));
        assert_eq!(events[1].status(), Some(OperationStatus::GattError(133)));
        assert_eq!(events[2].operation_id(), Some(read));
        assert_eq!(events[2].status(), Some(OperationStatus::Disconnected));
    }

    #[test]
    fn test_issue_failure_resolves_gatt_failure() {
        let mut h = Harness::connected();
        h.radio.fail_next(RadioError::Busy);
        h.submit(Request::DiscoverServices);

        let events = h.drain();
        assert_eq!(events[0].status(), Some(OperationStatus::GattError(GATT_FAILURE)));
        assert!(h.session.in_flight().is_none());
    }

    #[test]
    fn test_enable_notifications_toggles_then_writes_cccd() {
        let mut h = Harness::connected();
        let handle = h.session.handle().clone();
        h.session
            .enable_notifications(ch(0x2a37), true, false, None, &mut h.radio, &h.events)
            .unwrap();

        assert_eq!(
            h.radio.calls(),
            vec![
                RadioCall::SetNotification(handle.clone(), ch(0x2a37), true),
                RadioCall::WriteDescriptor(
                    handle,
                    ch(0x2a37).descriptor(CCCD_UUID),
                    ENABLE_NOTIFICATION_VALUE.to_vec()
                ),
            ]
        );
    }

    #[test]
    fn test_indication_falls_back_without_support() {
        let config = GattConfig {
            supports_indication: false,
            ..GattConfig::default()
        };
        let mut h = Harness::new(config);
        h.session.connect(None, &mut h.radio, &h.events).unwrap();
        h.link(NativeConnectionState::Connected, GATT_SUCCESS);
        h.radio.clear_calls();

        h.session
            .enable_notifications(ch(1), true, true, None, &mut h.radio, &h.events)
            .unwrap();
        match &h.radio.calls()[1] {
            RadioCall::WriteDescriptor(_, _, value) => {
                assert_eq!(value.as_slice(), ENABLE_NOTIFICATION_VALUE);
                assert_ne!(value.as_slice(), ENABLE_INDICATION_VALUE);
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[test]
    fn test_refused_toggle_skips_cccd_write() {
        let mut h = Harness::connected();
        h.radio.refuse_notifications(true);
        h.session
            .enable_notifications(ch(1), true, false, None, &mut h.radio, &h.events)
            .unwrap();

        assert_eq!(h.radio.calls().len(), 1);
        let events = h.drain();
        assert_eq!(events[0].status(), Some(OperationStatus::GattError(GATT_FAILURE)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_and_late_answer() {
        let mut h = Harness::connected();
        let target = OperationTarget::Characteristic(ch(1));
        let first = h.submit(Request::ReadCharacteristic(ch(1)));
        let second = h.submit(Request::ReadCharacteristic(ch(1)));

        let deadline = h.session.next_deadline().unwrap();
        assert!(!h.session.poll_timeouts(Instant::now(), &mut h.radio, &h.events));
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(h.session.poll_timeouts(deadline, &mut h.radio, &h.events));

        let events = h.drain();
        assert_eq!(events[0].operation_id(), Some(first));
        assert_eq!(events[0].status(), Some(OperationStatus::Timeout));
        assert_eq!(h.session.in_flight().map(|op| op.id), Some(second));

        // Late answer for the first read must not resolve the second
        assert_eq!(
            h.answer(OperationKind::ReadCharacteristic, target, OutcomeData::Bytes(vec![1])),
            RouteResult::Orphaned
        );
        assert_eq!(h.session.in_flight().map(|op| op.id), Some(second));
        assert_eq!(
            h.answer(OperationKind::ReadCharacteristic, target, OutcomeData::Bytes(vec![2])),
            RouteResult::Delivered
        );
        let events = h.drain();
        assert_eq!(events[0].operation_id(), Some(second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_answer_does_not_starve_identical_reads() {
        let mut h = Harness::connected();
        let target = OperationTarget::Characteristic(ch(1));

        // Stack swallows the first answer entirely
        let first = h.submit(Request::ReadCharacteristic(ch(1)));
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(h.session.poll_timeouts(Instant::now(), &mut h.radio, &h.events));
        assert_eq!(h.drain()[0].operation_id(), Some(first));

        // The next identical read loses its answer to the orphan
        let second = h.submit(Request::ReadCharacteristic(ch(1)));
        assert_eq!(
            h.answer(OperationKind::ReadCharacteristic, target, OutcomeData::Bytes(vec![1])),
            RouteResult::Orphaned
        );
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(h.session.poll_timeouts(Instant::now(), &mut h.radio, &h.events));
        assert_eq!(h.drain()[0].operation_id(), Some(second));
        assert_eq!(h.session.stats().orphans, 0);

        // ...but it leaves no orphan, so the one after that succeeds
        let third = h.submit(Request::ReadCharacteristic(ch(1)));
        assert_eq!(
            h.answer(OperationKind::ReadCharacteristic, target, OutcomeData::Bytes(vec![3])),
            RouteResult::Delivered
        );
        let events = h.drain();
        assert_eq!(events[0].operation_id(), Some(third));
        assert_eq!(events[0].status(), Some(OperationStatus::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphan_forgotten_after_one_window() {
        let mut h = Harness::connected();
        let target = OperationTarget::Characteristic(ch(1));
        h.submit(Request::ReadCharacteristic(ch(1)));
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(h.session.poll_timeouts(Instant::now(), &mut h.radio, &h.events));
        assert_eq!(h.session.stats().orphans, 1);
        h.drain();

        tokio::time::advance(Duration::from_millis(500)).await;
        let read = h.submit(Request::ReadCharacteristic(ch(1)));
        assert_eq!(
            h.answer(OperationKind::ReadCharacteristic, target, OutcomeData::Bytes(vec![7])),
            RouteResult::Delivered
        );
        let events = h.drain();
        assert_eq!(events[0].operation_id(), Some(read));
        assert_eq!(events[0].status(), Some(OperationStatus::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_override_is_clamped() {
        let mut h = Harness::connected();
        h.session
            .enqueue(
                Request::ReadCharacteristic(ch(1)),
                Some(Duration::MAX),
                &mut h.radio,
                &h.events,
            )
            .unwrap();
        let deadline = h.session.next_deadline().unwrap();
        assert!(deadline <= Instant::now() + crate::queue::MAX_OPERATION_TIMEOUT);
    }

    #[test]
    fn test_push_dropped_once_link_is_down() {
        let mut h = Harness::connected();
        assert_eq!(
            h.session.on_characteristic_changed(ch(1), vec![1], &h.events),
            RouteResult::Delivered
        );
        h.link(NativeConnectionState::Disconnected, GATT_SUCCESS);
        h.drain();

        assert_eq!(
            h.session.on_characteristic_changed(ch(1), vec![2], &h.events),
            RouteResult::Unmatched
        );
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_disconnected_session_is_finished() {
        let mut h = Harness::new(GattConfig::default());
        // A fresh handle can still connect
        assert!(!h.session.is_finished());

        h.session.connect(None, &mut h.radio, &h.events).unwrap();
        h.link(NativeConnectionState::Connected, GATT_SUCCESS);
        assert!(!h.session.is_finished());

        h.link(NativeConnectionState::Disconnected, GATT_SUCCESS);
        assert_eq!(h.session.state(), ConnectionState::Disconnected);
        assert!(h.session.is_finished());
    }

    #[test]
    fn test_disconnect_jumps_queue_and_drains() {
        let mut h = Harness::connected();
        let a = h.submit(Request::ReadCharacteristic(ch(1)));
        let b = h.submit(Request::ReadCharacteristic(ch(2)));
        let d = h.submit(Request::Disconnect);

        h.answer(
            OperationKind::ReadCharacteristic,
            OperationTarget::Characteristic(ch(1)),
            OutcomeData::Bytes(vec![]),
        );
        let events = h.drain();
        assert_eq!(events[0].operation_id(), Some(a));
        assert_eq!(events[1].operation_id(), Some(b));
        assert_eq!(events[1].status(), Some(OperationStatus::Disconnected));
        assert!(matches!(
            events[2],
            GattEvent::ConnectionStateChanged { to: ConnectionState::Disconnecting, .. }
        ));
        assert_eq!(h.session.in_flight().map(|op| op.id), Some(d));

        h.link(NativeConnectionState::Disconnected, GATT_SUCCESS);
        let events = h.drain();
        assert_eq!(events[1].operation_id(), Some(d));
        assert_eq!(events[1].status(), Some(OperationStatus::Success));
    }

    #[test]
    fn test_unsolicited_disconnect_fails_in_flight() {
        let mut h = Harness::connected();
        let a = h.submit(Request::ReadCharacteristic(ch(1)));
        let b = h.submit(Request::WriteCharacteristic {
            id: ch(2),
            value: vec![1],
            write_type: Default::default(),
        });

        h.link(NativeConnectionState::Disconnected, 8);
        let events = h.drain();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].operation_id(), Some(a));
        assert_eq!(events[2].operation_id(), Some(b));
        assert!(events[1..].iter().all(|e| e.status() == Some(OperationStatus::Disconnected)));
        assert!(h.session.in_flight().is_none());
    }

    #[test]
    fn test_close_releases_and_rejects_further_requests() {
        let mut h = Harness::connected();
        let close = h.submit(Request::Close);
        assert!(h.session.is_finished());
        assert!(h.radio.calls().contains(&RadioCall::Close(h.session.handle().clone())));

        let events = h.drain();
        assert_eq!(events.last().and_then(GattEvent::operation_id), Some(close));
        assert!(matches!(
            h.session.enqueue(Request::DiscoverServices, None, &mut h.radio, &h.events),
            Err(RequestError::InvalidState { state: ConnectionState::Closed, .. })
        ));
    }

    #[test]
    fn test_connection_state_applied_while_read_pending() {
        let mut h = Harness::connected();
        h.submit(Request::ReadCharacteristic(ch(1)));
        assert_eq!(h.link(NativeConnectionState::Disconnected, 0), RouteResult::Delivered);
        assert_eq!(h.session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_teardown_drains_everything() {
        let mut h = Harness::connected();
        h.submit(Request::ReadCharacteristic(ch(1)));
        h.submit(Request::ReadCharacteristic(ch(2)));
        h.session.teardown(&mut h.radio, &h.events);

        let events = h.drain();
        let outcomes: Vec<_> = events.iter().filter_map(GattEvent::status).collect();
        assert_eq!(outcomes, vec![OperationStatus::Disconnected; 2]);
        assert!(h.session.is_finished());
    }
}

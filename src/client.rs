//! Application-facing client and the serialized event loop behind it
//!
//! One tokio task owns the radio and every session. Application requests
//! and native callbacks arrive on the same unbounded inbox, so no two
//! mutations of queue or state machine ever overlap. Timeouts are served
//! from the same `select!` by sleeping until the earliest armed deadline,
//! and deadlines are also checked before every message so a busy inbox
//! cannot hold them off.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::ble::events::NativeEvent;
use crate::ble::mock::MockRadio;
use crate::ble::radio::NativeRadio;
use crate::ble::state::{ConnectionState, RequestError};
use crate::ble::types::{CharacteristicId, ConnectionHandle, DescriptorId, WriteType};
use crate::config::GattConfig;
use crate::dispatcher::{EventDispatcher, EventListener, GattEvent, ListenerId};
use crate::queue::{OperationId, QueueStats, Request};
use crate::router::NativeCallbackRouter;
use crate::session::GattSession;
use crate::GattqError;

/// Released handles remembered so late requests get `InvalidState` instead of `UnknownConnection`
const RETIRED_HANDLES: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, RequestError>>;

/// Messages processed by the event loop, in arrival order
pub enum LoopMessage {
    Connect {
        address: String,
        deadline: Option<Duration>,
        reply: Reply<(ConnectionHandle, OperationId)>,
    },
    Submit {
        handle: ConnectionHandle,
        request: Request,
        deadline: Option<Duration>,
        reply: Reply<OperationId>,
    },
    State {
        handle: ConnectionHandle,
        reply: Reply<ConnectionState>,
    },
    Stats {
        handle: ConnectionHandle,
        reply: Reply<QueueStats>,
    },
    Native(NativeEvent),
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Thread-safe callback sink handed to radio bindings
#[derive(Clone)]
pub struct NativeEventSink {
    tx: mpsc::UnboundedSender<LoopMessage>,
}

impl NativeEventSink {
    /// Queue a native event for the loop; false once the loop is gone
    pub fn deliver(&self, event: NativeEvent) -> bool {
        match self.tx.send(LoopMessage::Native(event)) {
            Ok(()) => true,
            Err(_) => {
                tracing::trace!("Event loop stopped, dropping native event");
                false
            }
        }
    }
}

/// Receiving end of the loop inbox, consumed by `GattClient::spawn`
pub struct LoopInbox {
    tx: mpsc::UnboundedSender<LoopMessage>,
    rx: mpsc::UnboundedReceiver<LoopMessage>,
}

impl LoopInbox {
    /// Take the next queued native event without running the loop
    pub fn try_next_native(&mut self) -> Option<NativeEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(LoopMessage::Native(event)) => return Some(event),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Create the inbox and the sink a radio binding reports through
pub fn event_channel() -> (NativeEventSink, LoopInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (NativeEventSink { tx: tx.clone() }, LoopInbox { tx, rx })
}

/// Handle to a running GATT event loop
pub struct GattClient {
    tx: mpsc::UnboundedSender<LoopMessage>,
    events: EventDispatcher,
    task: Option<JoinHandle<()>>,
}

impl GattClient {
    /// Start the event loop on the current tokio runtime
    pub fn spawn(
        config: GattConfig,
        radio: impl NativeRadio,
        inbox: LoopInbox,
    ) -> Result<Self, GattqError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| GattqError::Runtime(e.to_string()))?;

        let events = EventDispatcher::new();
        let LoopInbox { tx, rx } = inbox;
        let event_loop = EventLoop::new(config, Box::new(radio), events.clone(), rx);
        let task = runtime.spawn(event_loop.run());
        tracing::info!("✅ GATT event loop started");

        Ok(Self {
            tx,
            events,
            task: Some(task),
        })
    }

    /// Client over an auto-responding `MockRadio`; the radio clone inspects calls
    pub fn with_mock(config: GattConfig) -> Result<(Self, MockRadio), GattqError> {
        let (sink, inbox) = event_channel();
        let radio = MockRadio::auto_respond(sink);
        let client = Self::spawn(config, radio.clone(), inbox)?;
        Ok((client, radio))
    }

    /// Sink for radio bindings created after the loop
    pub fn sink(&self) -> NativeEventSink {
        NativeEventSink {
            tx: self.tx.clone(),
        }
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub fn subscribe(&self, listener: impl EventListener + 'static) -> ListenerId {
        self.events.subscribe(listener)
    }

    pub fn subscribe_channel(&self) -> (ListenerId, mpsc::UnboundedReceiver<GattEvent>) {
        self.events.subscribe_channel()
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.events.unsubscribe(id)
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> LoopMessage) -> Result<T, RequestError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| RequestError::LoopStopped)?;
        rx.await.map_err(|_| RequestError::LoopStopped)?
    }

    /// Open a new connection; the outcome arrives as a `ConnectionOperation` event
    pub async fn connect(&self, address: impl Into<String>) -> Result<ConnectionHandle, RequestError> {
        self.connect_with_deadline(address, None)
            .await
            .map(|(handle, _)| handle)
    }

    pub async fn connect_with_deadline(
        &self,
        address: impl Into<String>,
        deadline: Option<Duration>,
    ) -> Result<(ConnectionHandle, OperationId), RequestError> {
        let address = address.into();
        self.call(|reply| LoopMessage::Connect {
            address,
            deadline,
            reply,
        })
        .await
    }

    /// Queue any request, optionally overriding the default timeout
    pub async fn submit(
        &self,
        handle: &ConnectionHandle,
        request: Request,
        deadline: Option<Duration>,
    ) -> Result<OperationId, RequestError> {
        let handle = handle.clone();
        self.call(|reply| LoopMessage::Submit {
            handle,
            request,
            deadline,
            reply,
        })
        .await
    }

    pub async fn discover_services(&self, handle: &ConnectionHandle) -> Result<OperationId, RequestError> {
        self.submit(handle, Request::DiscoverServices, None).await
    }

    pub async fn read_characteristic(
        &self,
        handle: &ConnectionHandle,
        id: CharacteristicId,
    ) -> Result<OperationId, RequestError> {
        self.submit(handle, Request::ReadCharacteristic(id), None).await
    }

    pub async fn write_characteristic(
        &self,
        handle: &ConnectionHandle,
        id: CharacteristicId,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> Result<OperationId, RequestError> {
        let request = Request::WriteCharacteristic {
            id,
            value,
            write_type,
        };
        self.submit(handle, request, None).await
    }

    pub async fn read_descriptor(
        &self,
        handle: &ConnectionHandle,
        id: DescriptorId,
    ) -> Result<OperationId, RequestError> {
        self.submit(handle, Request::ReadDescriptor(id), None).await
    }

    pub async fn write_descriptor(
        &self,
        handle: &ConnectionHandle,
        id: DescriptorId,
        value: Vec<u8>,
    ) -> Result<OperationId, RequestError> {
        self.submit(handle, Request::WriteDescriptor { id, value }, None)
            .await
    }

    pub async fn request_mtu(&self, handle: &ConnectionHandle, mtu: u16) -> Result<OperationId, RequestError> {
        self.submit(handle, Request::RequestMtu(mtu), None).await
    }

    /// Toggle local notification routing and write the CCCD
    pub async fn enable_notifications(
        &self,
        handle: &ConnectionHandle,
        characteristic: CharacteristicId,
        enable: bool,
        indication: bool,
    ) -> Result<OperationId, RequestError> {
        let request = Request::EnableNotifications {
            characteristic,
            enable,
            indication,
        };
        self.submit(handle, request, None).await
    }

    pub async fn disconnect(&self, handle: &ConnectionHandle) -> Result<OperationId, RequestError> {
        self.submit(handle, Request::Disconnect, None).await
    }

    pub async fn close(&self, handle: &ConnectionHandle) -> Result<OperationId, RequestError> {
        self.submit(handle, Request::Close, None).await
    }

    pub async fn state(&self, handle: &ConnectionHandle) -> Result<ConnectionState, RequestError> {
        let handle = handle.clone();
        self.call(|reply| LoopMessage::State { handle, reply }).await
    }

    pub async fn stats(&self, handle: &ConnectionHandle) -> Result<QueueStats, RequestError> {
        let handle = handle.clone();
        self.call(|reply| LoopMessage::Stats { handle, reply }).await
    }

    /// Close every session and stop the loop
    pub async fn shutdown(mut self) -> Result<(), RequestError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LoopMessage::Shutdown { reply: Some(reply) })
            .map_err(|_| RequestError::LoopStopped)?;
        rx.await.map_err(|_| RequestError::LoopStopped)?;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}

impl Drop for GattClient {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.tx.send(LoopMessage::Shutdown { reply: None });
        }
    }
}

struct EventLoop {
    config: GattConfig,
    radio: Box<dyn NativeRadio>,
    sessions: HashMap<ConnectionHandle, GattSession>,
    retired: VecDeque<ConnectionHandle>,
    router: NativeCallbackRouter,
    events: EventDispatcher,
    rx: mpsc::UnboundedReceiver<LoopMessage>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl EventLoop {
    fn new(
        config: GattConfig,
        radio: Box<dyn NativeRadio>,
        events: EventDispatcher,
        rx: mpsc::UnboundedReceiver<LoopMessage>,
    ) -> Self {
        Self {
            config,
            radio,
            sessions: HashMap::new(),
            retired: VecDeque::new(),
            router: NativeCallbackRouter::new(),
            events,
            rx,
        }
    }

    async fn run(mut self) {
        loop {
            let deadline = self.next_deadline();
            let message = tokio::select! {
                biased;
                message = self.rx.recv() => message,
                _ = sleep_until(deadline) => {
                    self.poll_timeouts(Instant::now());
                    self.reap();
                    continue;
                }
            };

            match message {
                Some(LoopMessage::Shutdown { reply }) => {
                    self.shutdown();
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
                Some(message) => self.on_message(message, Instant::now()),
                None => {
                    self.shutdown();
                    break;
                }
            }
        }
        tracing::info!(
            "GATT event loop stopped ({} routed, {} dropped)",
            self.router.routed(),
            self.router.dropped()
        );
    }

    /// Expire overdue operations, then apply `message`
    fn on_message(&mut self, message: LoopMessage, now: Instant) {
        self.poll_timeouts(now);
        self.handle(message);
        self.reap();
    }

    fn handle(&mut self, message: LoopMessage) {
        match message {
            LoopMessage::Connect {
                address,
                deadline,
                reply,
            } => {
                let _ = reply.send(self.connect(address, deadline));
            }
            LoopMessage::Submit {
                handle,
                request,
                deadline,
                reply,
            } => {
                let result = match self.sessions.get_mut(&handle) {
                    Some(session) => session.enqueue(request, deadline, self.radio.as_mut(), &self.events),
                    None if self.retired.contains(&handle) => Err(RequestError::InvalidState {
                        state: ConnectionState::Closed,
                        action: format!("{:?}", request.kind()),
                    }),
                    None => Err(RequestError::UnknownConnection(handle.to_string())),
                };
                if let Err(e) = &result {
                    tracing::debug!("Rejected request on {}: {}", handle, e);
                }
                let _ = reply.send(result);
            }
            LoopMessage::State { handle, reply } => {
                let _ = reply.send(self.state(&handle));
            }
            LoopMessage::Stats { handle, reply } => {
                let result = self
                    .sessions
                    .get(&handle)
                    .map(GattSession::stats)
                    .ok_or_else(|| RequestError::UnknownConnection(handle.to_string()));
                let _ = reply.send(result);
            }
            LoopMessage::Native(event) => {
                self.router
                    .route(event, &mut self.sessions, self.radio.as_mut(), &self.events);
            }
            LoopMessage::Shutdown { .. } => {}
        }
    }

    fn connect(
        &mut self,
        address: String,
        deadline: Option<Duration>,
    ) -> Result<(ConnectionHandle, OperationId), RequestError> {
        let live = self.sessions.values().find(|s| {
            s.handle().address == address
                && !matches!(s.state(), ConnectionState::Disconnected | ConnectionState::Closed)
        });
        if let Some(session) = live {
            return Err(RequestError::InvalidState {
                state: session.state(),
                action: format!("Connect to {}", address),
            });
        }

        let handle = ConnectionHandle::new(address);
        let mut session = GattSession::new(handle.clone(), &self.config);
        let id = session.connect(deadline, self.radio.as_mut(), &self.events)?;
        self.sessions.insert(handle.clone(), session);
        Ok((handle, id))
    }

    fn state(&self, handle: &ConnectionHandle) -> Result<ConnectionState, RequestError> {
        match self.sessions.get(handle) {
            Some(session) => Ok(session.state()),
            None if self.retired.contains(handle) => Ok(ConnectionState::Closed),
            None => Err(RequestError::UnknownConnection(handle.to_string())),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(GattSession::next_deadline)
            .min()
    }

    fn poll_timeouts(&mut self, now: Instant) {
        for session in self.sessions.values_mut() {
            session.poll_timeouts(now, self.radio.as_mut(), &self.events);
        }
    }

    /// Close and drop sessions that can do nothing more
    fn reap(&mut self) {
        let finished: Vec<_> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_finished())
            .map(|(h, _)| h.clone())
            .collect();

        for handle in finished {
            let Some(mut session) = self.sessions.remove(&handle) else {
                continue;
            };
            // Releases the native client of a disconnected session; no-op once closed
            session.teardown(self.radio.as_mut(), &self.events);
            if self.retired.len() == RETIRED_HANDLES {
                self.retired.pop_front();
            }
            tracing::debug!("Released session {}", handle);
            self.retired.push_back(handle);
        }
    }

    fn shutdown(&mut self) {
        for session in self.sessions.values_mut() {
            session.teardown(self.radio.as_mut(), &self.events);
        }
        self.sessions.clear();
    }
}

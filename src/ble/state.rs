//! Connection lifecycle state machine
//!
//! Tracks one link through `Disconnected → Connecting → Connected →
//! Disconnecting → Disconnected` (plus the terminal `Closed`) and decides
//! which operations may be queued in each state. Side effects are returned
//! to the caller rather than performed here, so the table can be tested on
//! its own.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::queue::OperationKind;

/// Lifecycle state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Terminal: resources released, every further request is rejected
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Inputs that drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEvent {
    ConnectRequested,
    NativeConnected,
    NativeDisconnected,
    DisconnectRequested,
    CloseRequested,
    ConnectFailed,
}

/// Work the session must carry out after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    None,
    /// Issue the native connect call
    IssueConnect,
    /// Release operations that were held while connecting
    FlushQueue,
    /// Fail queued operations with `Disconnected`
    FailQueued,
    /// Issue the native disconnect call; the queue is frozen
    IssueDisconnect,
    /// Fail the in-flight and every queued operation with `Disconnected`
    FailAll,
    /// Release native resources
    ReleaseResources,
}

/// A successful state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub effect: SideEffect,
}

impl Transition {
    /// True when the state actually moved
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Synchronous rejection of an application request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("{action} not allowed while {state}")]
    InvalidState {
        state: ConnectionState,
        action: String,
    },

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("GATT event loop is not running")]
    LoopStopped,
}

/// State machine for one connection
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl ConnectionStateMachine {
    /// Start in `Disconnected`
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Apply an event, returning the transition or an `InvalidState` rejection
    pub fn request(&mut self, event: StateEvent) -> Result<Transition, RequestError> {
        use ConnectionState::*;
        use StateEvent::*;

        let from = self.state;
        let (to, effect) = match (from, event) {
            (Closed, _) => return Err(self.reject(event)),

            (_, CloseRequested) => (Closed, SideEffect::ReleaseResources),

            (Disconnected, ConnectRequested) => (Connecting, SideEffect::IssueConnect),
            (Connecting, NativeConnected) => (Connected, SideEffect::FlushQueue),
            (Connecting, ConnectFailed) => (Disconnected, SideEffect::FailQueued),

            (Connecting | Connected, DisconnectRequested) => {
                (Disconnecting, SideEffect::IssueDisconnect)
            }
            (Disconnecting, DisconnectRequested) => (Disconnecting, SideEffect::None),
            (Disconnected, DisconnectRequested) => (Disconnected, SideEffect::None),

            // The stack may drop the link at any time, asked or not
            (Connecting | Connected | Disconnecting, NativeDisconnected) => {
                (Disconnected, SideEffect::FailAll)
            }
            (Disconnected, NativeDisconnected) => (Disconnected, SideEffect::None),

            _ => return Err(self.reject(event)),
        };

        self.state = to;
        if from != to {
            tracing::debug!("Connection state {} -> {} on {:?}", from, to, event);
        }
        Ok(Transition { from, to, effect })
    }

    /// Whether an operation of this kind may be queued right now
    pub fn accepts(&self, kind: OperationKind) -> bool {
        use ConnectionState::*;

        match (self.state, kind) {
            (Closed, _) => false,
            (_, OperationKind::Disconnect | OperationKind::Close) => true,
            (Disconnected, OperationKind::Connect) => true,
            (_, OperationKind::Connect) => false,
            // Held behind the connect op until the link comes up
            (Connecting | Connected, _) => true,
            (Disconnected | Disconnecting, _) => false,
        }
    }

    /// `accepts` as a `Result`
    pub fn ensure_accepts(&self, kind: OperationKind) -> Result<(), RequestError> {
        if self.accepts(kind) {
            Ok(())
        } else {
            Err(RequestError::InvalidState {
                state: self.state,
                action: format!("{:?}", kind),
            })
        }
    }

    fn reject(&self, event: StateEvent) -> RequestError {
        RequestError::InvalidState {
            state: self.state,
            action: format!("{:?}", event),
        }
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

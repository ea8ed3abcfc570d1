//! Typed event fan-out for state, error and connection-state channels.
//!
//! Built on [`tokio::sync::broadcast`]: a subscription is a receiver,
//! dropping it unsubscribes, and every receiver gets its own queue so a slow
//! or panicking consumer can never disturb the others. Emission order on a
//! channel matches the order events were published.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::error;

use crate::{
    error::WalkPadError,
    types::{ConnectionState, TreadmillState},
};

/// A connection-state transition, in the order it actually happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// State the machine left
    pub from: ConnectionState,
    /// State the machine entered
    pub to: ConnectionState,
}

/// Receiver for one event channel
pub type EventReceiver<T> = broadcast::Receiver<T>;

/// Errors published on the error channel, shared so they stay cloneable
pub type SharedError = Arc<WalkPadError>;

const CHANNEL_CAPACITY: usize = 64;

/// Fan-out hub for the three event channels.
///
/// Cloning the bus is cheap and every clone publishes into the same
/// channels.
#[derive(Debug, Clone)]
pub struct EventBus {
    state_tx: broadcast::Sender<TreadmillState>,
    error_tx: broadcast::Sender<SharedError>,
    connection_tx: broadcast::Sender<StateChange>,
}

impl EventBus {
    /// Create a bus with the default per-channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            error_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            connection_tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to treadmill state snapshots.
    #[must_use]
    pub fn subscribe_state(&self) -> EventReceiver<TreadmillState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to emitted errors.
    #[must_use]
    pub fn subscribe_errors(&self) -> EventReceiver<SharedError> {
        self.error_tx.subscribe()
    }

    /// Subscribe to connection-state transitions.
    #[must_use]
    pub fn subscribe_connection_changes(&self) -> EventReceiver<StateChange> {
        self.connection_tx.subscribe()
    }

    /// Publish a state snapshot.
    pub fn emit_state(&self, state: TreadmillState) {
        let _ = self.state_tx.send(state);
    }

    /// Publish an error.
    ///
    /// When nobody is subscribed the error is routed to the log error sink
    /// instead, so it is never silently lost.
    pub fn emit_error(&self, err: WalkPadError) {
        if self.error_tx.receiver_count() == 0 {
            error!("unobserved error: {err}");
        } else {
            let _ = self.error_tx.send(Arc::new(err));
        }
    }

    /// Publish a connection-state transition.
    pub fn emit_connection_change(&self, from: ConnectionState, to: ConnectionState) {
        let _ = self.connection_tx.send(StateChange { from, to });
    }

    /// Wait for the next state snapshot; `None` if the bus is dropped first.
    ///
    /// One-shot convenience over [`EventBus::subscribe_state`]: the implicit
    /// subscription is removed after the first event.
    pub async fn next_state(&self) -> Option<TreadmillState> {
        self.state_tx.subscribe().recv().await.ok()
    }

    /// Wait for the next emitted error; `None` if the bus is dropped first.
    pub async fn next_error(&self) -> Option<SharedError> {
        self.error_tx.subscribe().recv().await.ok()
    }

    /// Wait for the next connection-state transition.
    pub async fn next_connection_change(&self) -> Option<StateChange> {
        self.connection_tx.subscribe().recv().await.ok()
    }

    /// Number of live state subscribers
    #[must_use]
    pub fn state_subscriber_count(&self) -> usize {
        self.state_tx.receiver_count()
    }

    /// Number of live error subscribers
    #[must_use]
    pub fn error_subscriber_count(&self) -> usize {
        self.error_tx.receiver_count()
    }

    /// Number of live connection-change subscribers
    #[must_use]
    pub fn connection_subscriber_count(&self) -> usize {
        self.connection_tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

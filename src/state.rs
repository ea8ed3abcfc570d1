//! Connection lifecycle state machine.
//!
//! Transitions are restricted to the table below; anything else is a
//! programmer error and is rejected. Every accepted transition invokes the
//! registered observers with `(from, to)`; observer panics are caught and
//! logged so they can never poison the machine.
//!
//! | from         | allowed targets                     |
//! |--------------|-------------------------------------|
//! | disconnected | connecting                          |
//! | connecting   | connected, error, disconnected      |
//! | connected    | disconnected                        |
//! | error        | disconnected, connecting            |

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};

use tracing::{debug, error};

use crate::{
    error::{Result, WalkPadError},
    types::ConnectionState,
};

/// Callback fired on every accepted transition with `(from, to)`
pub type StateObserver = Box<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

/// Handle identifying a registered observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

/// The connection lifecycle state machine
pub struct StateMachine {
    current: StdMutex<ConnectionState>,
    observers: StdMutex<Vec<(ObserverId, StateObserver)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.state())
            .finish()
    }
}

fn allowed(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::{Connected, Connecting, Disconnected, Error};
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Connected | Error | Disconnected)
            | (Connected, Disconnected)
            | (Error, Disconnected | Connecting)
    )
}

impl StateMachine {
    /// Create a machine in the `disconnected` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: StdMutex::new(ConnectionState::Disconnected),
            observers: StdMutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attempt a transition.
    ///
    /// # Errors
    ///
    /// Returns [`WalkPadError::InvalidTransition`] when the transition is not
    /// in the table; the state is left unchanged.
    pub fn transition(&self, to: ConnectionState) -> Result<()> {
        let from = {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            let from = *current;
            if !allowed(from, to) {
                return Err(WalkPadError::InvalidTransition { from, to });
            }
            *current = to;
            from
        };
        debug!("connection state: {from} -> {to}");

        let observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        for (id, observer) in observers.iter() {
            if catch_unwind(AssertUnwindSafe(|| observer(from, to))).is_err() {
                error!("state observer {id:?} panicked on {from} -> {to}");
            }
        }
        Ok(())
    }

    /// Register an observer; it fires on every subsequent transition.
    pub fn observe(&self, observer: StateObserver) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    /// Remove a previously registered observer.
    pub fn remove_observer(&self, id: ObserverId) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

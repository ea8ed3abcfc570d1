//! Periodic status polling for the legacy protocol.
//!
//! The poll task holds only a weak reference to the write characteristic so
//! it can never extend a session's lifetime, and every scheduled tick
//! compares its captured session token against the live token so firings
//! that race a stop are no-ops. FTMS opts out by returning an empty
//! ask-stats payload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    ble::BleCharacteristic,
    events::EventBus,
    protocol::Codec,
    transport,
};

/// Default cadence of status requests
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Consecutive write failures tolerated before the loop stops itself
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Owner of the polling timer.
///
/// `start` implicitly stops any previous run; `stop` is idempotent.
pub struct PollManager {
    token: Arc<AtomicU64>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PollManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollManager")
            .field("token", &self.token.load(Ordering::SeqCst))
            .field("active", &self.is_active())
            .finish()
    }
}

impl PollManager {
    /// Create an idle poll manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: Arc::new(AtomicU64::new(0)),
            task: StdMutex::new(None),
        }
    }

    /// Whether a poll task is currently live
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Start polling; any previous run is stopped first.
    pub fn start(
        &self,
        write: Weak<dyn BleCharacteristic>,
        codec: &'static dyn Codec,
        interval: Duration,
        write_timeout: Duration,
        events: EventBus,
        max_consecutive_errors: u32,
    ) {
        self.stop();
        let my_token = self.token.load(Ordering::SeqCst);
        let live_token = Arc::clone(&self.token);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut consecutive_errors = 0u32;
            loop {
                ticker.tick().await;
                if live_token.load(Ordering::SeqCst) != my_token {
                    // superseded by a later start or stop
                    return;
                }
                let Some(write) = write.upgrade() else {
                    debug!("poll target gone, stopping");
                    return;
                };
                let payload = codec.build_ask_stats();
                if payload.is_empty() {
                    continue;
                }
                match transport::write_bounded(write.as_ref(), &payload, write_timeout, "poll")
                    .await
                {
                    Ok(()) => consecutive_errors = 0,
                    Err(e) => {
                        consecutive_errors += 1;
                        events.emit_error(e);
                        if consecutive_errors >= max_consecutive_errors {
                            warn!("stopping poll after {consecutive_errors} consecutive errors");
                            return;
                        }
                    }
                }
            }
        });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stop polling and fence out any late timer firings.
    pub fn stop(&self) {
        // wraps on overflow, which is as good as a modulus for fencing
        self.token.fetch_add(1, Ordering::SeqCst);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Default for PollManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PollManager {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Bounded writes and notification subscriptions.
//!
//! Every BLE operation here carries a deadline. A timeout rejects the call
//! but does not cancel the underlying I/O; callers must re-check connection
//! state before trusting any follow-up effect.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    ble::{BleCharacteristic, NotificationHandler},
    error::{Result, WalkPadError},
    gatt::GattRoles,
};

/// Default deadline for a characteristic write
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for enabling notifications
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(15);

/// Write a payload with response under a deadline.
///
/// # Errors
///
/// Returns [`WalkPadError::EmptyPayload`] for empty payloads and
/// [`WalkPadError::Timeout`] when the deadline elapses first; the underlying
/// write may still complete after the timeout.
pub async fn write_bounded(
    characteristic: &dyn BleCharacteristic,
    payload: &[u8],
    deadline: Duration,
    operation: &'static str,
) -> Result<()> {
    if payload.is_empty() {
        return Err(WalkPadError::EmptyPayload);
    }
    debug!("{operation}: writing {:02X?}", payload);
    timeout(deadline, characteristic.write_with_response(payload))
        .await
        .map_err(|_| WalkPadError::Timeout {
            operation,
            limit_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
        })?
}

/// Write a payload to the control point when one exists, else to the write
/// characteristic. Used for every FTMS command.
///
/// # Errors
///
/// Propagates the errors of [`write_bounded`].
pub async fn write_routed(
    roles: &GattRoles,
    payload: &[u8],
    deadline: Duration,
    operation: &'static str,
) -> Result<()> {
    let target = roles.control_point.as_deref().unwrap_or(roles.write.as_ref());
    write_bounded(target, payload, deadline, operation).await
}

/// A live notification subscription.
///
/// Tearing down removes the listener and disables notifications; errors from
/// the stop are logged, never propagated, so teardown is safe on every
/// cleanup path.
pub struct Subscription {
    characteristic: Arc<dyn BleCharacteristic>,
}

impl Subscription {
    /// Disable notifications and drop the listener.
    pub async fn teardown(self) {
        if let Err(e) = self.characteristic.stop_notifications().await {
            warn!(
                "failed to stop notifications on {}: {e}",
                self.characteristic.uuid()
            );
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("characteristic", &self.characteristic.uuid())
            .finish()
    }
}

/// Enable notifications on a characteristic under a deadline.
///
/// The handler receives a freshly owned buffer per event, in delivery order.
///
/// # Errors
///
/// Returns [`WalkPadError::Timeout`] when enabling notifications exceeds the
/// deadline, or any stack error from the subscribe itself.
pub async fn subscribe(
    characteristic: Arc<dyn BleCharacteristic>,
    handler: NotificationHandler,
    deadline: Duration,
    operation: &'static str,
) -> Result<Subscription> {
    timeout(deadline, characteristic.start_notifications(handler))
        .await
        .map_err(|_| WalkPadError::Timeout {
            operation,
            limit_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
        })??;
    Ok(Subscription { characteristic })
}

//! Mock BLE stack for testing without hardware.
//!
//! Implements the [`crate::ble`] provider contract with scriptable failure
//! injection, write recording and notification injection, so orchestrator
//! and transport behaviour can be exercised deterministically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    ble::{
        BleCharacteristic, BleConnector, BleService, BleSession, CharProps, DisconnectListener,
        NotificationHandler, ScanSelector, Teardown,
    },
    error::{Result, WalkPadError},
    uuid_util::{to_full_uuid, uuid_match},
};

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A scriptable GATT characteristic
pub struct MockCharacteristic {
    uuid: String,
    props: CharProps,
    writes: StdMutex<Vec<Vec<u8>>>,
    handler: StdMutex<Option<NotificationHandler>>,
    write_delay: StdMutex<Duration>,
    subscribe_delay: StdMutex<Duration>,
    fail_next_writes: AtomicU32,
    fail_next_subscribe: AtomicBool,
    fail_next_stop: AtomicBool,
}

impl std::fmt::Debug for MockCharacteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCharacteristic")
            .field("uuid", &self.uuid)
            .field("props", &self.props)
            .finish()
    }
}

impl MockCharacteristic {
    fn new(uuid: &str, props: CharProps) -> Arc<Self> {
        Arc::new(Self {
            uuid: uuid.to_string(),
            props,
            writes: StdMutex::new(Vec::new()),
            handler: StdMutex::new(None),
            write_delay: StdMutex::new(Duration::ZERO),
            subscribe_delay: StdMutex::new(Duration::ZERO),
            fail_next_writes: AtomicU32::new(0),
            fail_next_subscribe: AtomicBool::new(false),
            fail_next_stop: AtomicBool::new(false),
        })
    }

    /// A control-point style characteristic: writable and indicating.
    #[must_use]
    pub fn control_point(uuid: &str) -> Arc<Self> {
        Self::new(
            uuid,
            CharProps {
                notify: false,
                indicate: true,
                write: true,
                write_without_response: true,
            },
        )
    }

    /// A notify-only characteristic.
    #[must_use]
    pub fn notify(uuid: &str) -> Arc<Self> {
        Self::new(
            uuid,
            CharProps {
                notify: true,
                ..CharProps::default()
            },
        )
    }

    /// A write-only characteristic in the legacy style.
    #[must_use]
    pub fn legacy_write(uuid: &str) -> Arc<Self> {
        Self::new(
            uuid,
            CharProps {
                write: true,
                write_without_response: true,
                ..CharProps::default()
            },
        )
    }

    /// A characteristic with no usable properties.
    #[must_use]
    pub fn read_only(uuid: &str) -> Arc<Self> {
        Self::new(uuid, CharProps::default())
    }

    /// Every payload written so far, in submission order.
    #[must_use]
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.writes).clone()
    }

    /// Delay each write by `delay` before it completes.
    pub fn set_write_delay(&self, delay: Duration) {
        *lock(&self.write_delay) = delay;
    }

    /// Delay notification enabling by `delay`.
    pub fn set_subscribe_delay(&self, delay: Duration) {
        *lock(&self.subscribe_delay) = delay;
    }

    /// Fail the next `n` writes with a simulated stack error.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_next_writes.store(n, Ordering::SeqCst);
    }

    /// Fail the next notification enable.
    pub fn fail_next_subscribe(&self) {
        self.fail_next_subscribe.store(true, Ordering::SeqCst);
    }

    /// Fail the next stop-notifications.
    pub fn fail_next_stop(&self) {
        self.fail_next_stop.store(true, Ordering::SeqCst);
    }

    /// Whether a notification handler is currently installed
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        lock(&self.handler).is_some()
    }

    /// Inject a notification. Empty payloads are dropped, mirroring the
    /// defensive-copy rule of the real adapter.
    pub fn emit(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(handler) = lock(&self.handler).as_ref() {
            handler(data.to_vec());
        }
    }
}

#[async_trait]
impl BleCharacteristic for MockCharacteristic {
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    fn properties(&self) -> CharProps {
        self.props
    }

    async fn write_with_response(&self, payload: &[u8]) -> Result<()> {
        let delay = *lock(&self.write_delay);
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.fail_next_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(WalkPadError::Other("simulated write failure".to_string()));
        }
        lock(&self.writes).push(payload.to_vec());
        Ok(())
    }

    async fn start_notifications(&self, handler: NotificationHandler) -> Result<()> {
        let delay = *lock(&self.subscribe_delay);
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next_subscribe.swap(false, Ordering::SeqCst) {
            return Err(WalkPadError::Other(
                "simulated subscribe failure".to_string(),
            ));
        }
        *lock(&self.handler) = Some(handler);
        Ok(())
    }

    async fn stop_notifications(&self) -> Result<()> {
        *lock(&self.handler) = None;
        if self.fail_next_stop.swap(false, Ordering::SeqCst) {
            return Err(WalkPadError::Other("simulated stop failure".to_string()));
        }
        Ok(())
    }
}

/// A scriptable GATT service
#[derive(Debug)]
pub struct MockService {
    uuid: String,
    characteristics: Vec<Arc<MockCharacteristic>>,
}

impl MockService {
    /// Create a service exposing the given characteristics.
    #[must_use]
    pub fn new(uuid: &str, characteristics: Vec<Arc<MockCharacteristic>>) -> Self {
        Self {
            uuid: uuid.to_string(),
            characteristics,
        }
    }
}

#[async_trait]
impl BleService for MockService {
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    async fn characteristics(&self) -> Result<Vec<Arc<dyn BleCharacteristic>>> {
        Ok(self
            .characteristics
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn BleCharacteristic>)
            .collect())
    }
}

/// A scriptable GATT session
pub struct MockSession {
    device_id: String,
    services: Vec<Arc<MockService>>,
    disconnected: AtomicBool,
    fail_next_disconnect: AtomicBool,
    supports_disconnect_events: AtomicBool,
    listener: Arc<StdMutex<Option<DisconnectListener>>>,
}

impl std::fmt::Debug for MockSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSession")
            .field("device_id", &self.device_id)
            .field("disconnected", &self.disconnected.load(Ordering::SeqCst))
            .finish()
    }
}

impl MockSession {
    /// Create a session exposing the given services.
    #[must_use]
    pub fn with_services(services: Vec<MockService>) -> Arc<Self> {
        Arc::new(Self {
            device_id: "AA:BB:CC:DD:EE:FF".to_string(),
            services: services.into_iter().map(Arc::new).collect(),
            disconnected: AtomicBool::new(false),
            fail_next_disconnect: AtomicBool::new(false),
            supports_disconnect_events: AtomicBool::new(true),
            listener: Arc::new(StdMutex::new(None)),
        })
    }

    /// A session shaped like an FTMS treadmill.
    #[must_use]
    pub fn ftms() -> Arc<Self> {
        Self::with_services(vec![MockService::new(
            &to_full_uuid("1826"),
            vec![
                MockCharacteristic::notify(&to_full_uuid("2acd")),
                MockCharacteristic::control_point(&to_full_uuid("2ad9")),
            ],
        )])
    }

    /// A session shaped like a legacy `fe00` treadmill.
    #[must_use]
    pub fn standard() -> Arc<Self> {
        Self::legacy("fe00", "fe01", "fe02")
    }

    /// A session shaped like a legacy treadmill with the given short ids.
    #[must_use]
    pub fn legacy(service: &str, write_char: &str, notify_char: &str) -> Arc<Self> {
        Self::with_services(vec![MockService::new(
            &to_full_uuid(service),
            vec![
                MockCharacteristic::legacy_write(&to_full_uuid(write_char)),
                MockCharacteristic::notify(&to_full_uuid(notify_char)),
            ],
        )])
    }

    /// Find a characteristic across all services by short or long UUID.
    #[must_use]
    pub fn characteristic(&self, uuid: &str) -> Option<Arc<MockCharacteristic>> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| uuid_match(&c.uuid, uuid))
            .map(Arc::clone)
    }

    /// Whether `disconnect` has been called
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Fail the next disconnect with a simulated stack error.
    pub fn fail_next_disconnect(&self) {
        self.fail_next_disconnect.store(true, Ordering::SeqCst);
    }

    /// Pretend the stack cannot observe peer disconnects.
    pub fn without_disconnect_events(&self) {
        self.supports_disconnect_events
            .store(false, Ordering::SeqCst);
    }

    /// Whether a peer-disconnect listener is currently registered
    #[must_use]
    pub fn has_disconnect_listener(&self) -> bool {
        lock(&self.listener).is_some()
    }

    /// Simulate an unsolicited peer disconnect.
    pub fn trigger_peer_disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        if let Some(listener) = lock(&self.listener).as_ref() {
            listener();
        }
    }
}

#[async_trait]
impl BleSession for MockSession {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    async fn primary_services(&self) -> Result<Vec<Arc<dyn BleService>>> {
        Ok(self
            .services
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn BleService>)
            .collect())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        if self.fail_next_disconnect.swap(false, Ordering::SeqCst) {
            return Err(WalkPadError::Other(
                "simulated disconnect failure".to_string(),
            ));
        }
        Ok(())
    }

    async fn on_disconnect(&self, listener: DisconnectListener) -> Result<Option<Teardown>> {
        if !self.supports_disconnect_events.load(Ordering::SeqCst) {
            return Ok(None);
        }
        *lock(&self.listener) = Some(listener);
        let slot = Arc::clone(&self.listener);
        Ok(Some(Box::new(move || {
            *lock(&slot) = None;
        })))
    }
}

/// A scriptable connector handing out queued sessions
pub struct MockConnector {
    sessions: StdMutex<VecDeque<Arc<MockSession>>>,
    reconnect_sessions: StdMutex<VecDeque<Option<Arc<MockSession>>>>,
    connect_delay: StdMutex<Duration>,
    fail_next_connect: AtomicBool,
    supports_reconnect: AtomicBool,
    cancel_on_connect: StdMutex<Option<CancellationToken>>,
    last_selector: StdMutex<Option<ScanSelector>>,
    last_reconnect_id: StdMutex<Option<String>>,
}

impl std::fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnector").finish()
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Create a connector with no scripted sessions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: StdMutex::new(VecDeque::new()),
            reconnect_sessions: StdMutex::new(VecDeque::new()),
            connect_delay: StdMutex::new(Duration::ZERO),
            fail_next_connect: AtomicBool::new(false),
            supports_reconnect: AtomicBool::new(true),
            cancel_on_connect: StdMutex::new(None),
            last_selector: StdMutex::new(None),
            last_reconnect_id: StdMutex::new(None),
        }
    }

    /// Queue a session for the next connect.
    pub fn push_session(&self, session: Arc<MockSession>) {
        lock(&self.sessions).push_back(session);
    }

    /// Queue a reconnect result; `None` simulates a device that cannot be found.
    pub fn push_reconnect(&self, session: Option<Arc<MockSession>>) {
        lock(&self.reconnect_sessions).push_back(session);
    }

    /// Delay each connect by `delay` before it completes.
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.connect_delay) = delay;
    }

    /// Fail the next connect with a simulated stack error.
    pub fn fail_next_connect(&self) {
        self.fail_next_connect.store(true, Ordering::SeqCst);
    }

    /// Pretend the stack does not support reconnecting.
    pub fn without_reconnect(&self) {
        self.supports_reconnect.store(false, Ordering::SeqCst);
    }

    /// Cancel `token` at the exact moment the next connect resolves,
    /// racing the post-connect abort checkpoint.
    pub fn cancel_on_connect(&self, token: CancellationToken) {
        *lock(&self.cancel_on_connect) = Some(token);
    }

    /// The selector used by the most recent connect
    #[must_use]
    pub fn last_selector(&self) -> Option<ScanSelector> {
        lock(&self.last_selector).clone()
    }

    /// The device id asked for by the most recent reconnect
    #[must_use]
    pub fn last_reconnect_id(&self) -> Option<String> {
        lock(&self.last_reconnect_id).clone()
    }
}

#[async_trait]
impl BleConnector for MockConnector {
    async fn connect(&self, selector: &ScanSelector) -> Result<Arc<dyn BleSession>> {
        *lock(&self.last_selector) = Some(selector.clone());
        let delay = *lock(&self.connect_delay);
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err(WalkPadError::Other(
                "simulated connect failure".to_string(),
            ));
        }
        let session = lock(&self.sessions)
            .pop_front()
            .ok_or_else(|| WalkPadError::Discovery("no matching device found".to_string()))?;
        if let Some(token) = lock(&self.cancel_on_connect).take() {
            token.cancel();
        }
        Ok(session)
    }

    fn supports_reconnect(&self) -> bool {
        self.supports_reconnect.load(Ordering::SeqCst)
    }

    async fn reconnect(&self, device_id: &str) -> Result<Option<Arc<dyn BleSession>>> {
        *lock(&self.last_reconnect_id) = Some(device_id.to_string());
        let delay = *lock(&self.connect_delay);
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        Ok(lock(&self.reconnect_sessions)
            .pop_front()
            .flatten()
            .map(|s| s as Arc<dyn BleSession>))
    }
}

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::{
    ble::{BleConnector, BleSession, BtleplugConnector, ScanSelector, Teardown},
    error::{Result, WalkPadError},
    events::EventBus,
    gatt::{self, GattRoles},
    poll::{PollManager, DEFAULT_MAX_CONSECUTIVE_ERRORS},
    protocol::{codec_for, detect_protocol, Codec},
    state::StateMachine,
    storage::{DeviceIdStore, MemoryStore},
    transport,
    types::{ConnectOptions, ConnectionState, ProtocolKind, SessionInfo, TreadmillState},
};

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything owned by one live connection.
///
/// Created after GATT discovery, destroyed by [`Inner::cleanup`] on every
/// exit path: explicit disconnect, connect failure, replacement by a new
/// connect, and unsolicited peer disconnect.
struct ActiveSession {
    session: Arc<dyn BleSession>,
    roles: GattRoles,
    codec: &'static dyn Codec,
    subscriptions: StdMutex<Vec<transport::Subscription>>,
    disconnect_teardown: StdMutex<Option<Teardown>>,
    write_timeout: Duration,
}

struct Inner {
    connector: Arc<dyn BleConnector>,
    storage: Arc<dyn DeviceIdStore>,
    machine: StateMachine,
    events: EventBus,
    /// Serialises connect, reconnect, disconnect and peer-disconnect cleanup
    connection_lock: Mutex<()>,
    /// Serialises commands against each other and their state checks
    command_lock: Mutex<()>,
    active: StdMutex<Option<Arc<ActiveSession>>>,
    poll: PollManager,
    latest: StdMutex<TreadmillState>,
}

impl Inner {
    /// Tear down every resource of the live session.
    ///
    /// Subscriptions are torn down unconditionally; errors from the peer's
    /// disconnect are emitted, never propagated. The session handle is
    /// cleared exactly when its disconnect has been attempted.
    async fn cleanup(&self) {
        self.poll.stop();
        let active = lock(&self.active).take();
        if let Some(active) = active {
            let subscriptions: Vec<_> = {
                let mut held = lock(&active.subscriptions);
                held.drain(..).collect()
            };
            for subscription in subscriptions {
                subscription.teardown().await;
            }
            if let Some(teardown) = lock(&active.disconnect_teardown).take() {
                teardown();
            }
            if let Err(e) = active.session.disconnect().await {
                self.events.emit_error(e);
            }
        }
    }
}

/// Main interface for controlling a WalkingPad-family treadmill
///
/// `WalkPad` owns the connection lifecycle and translates the imperative
/// surface (connect, start, stop, set-speed) into whichever wire dialect
/// the connected device speaks. State flows back out through the
/// [`EventBus`]: status snapshots, errors, and connection-state changes.
///
/// Lifecycle operations and commands are serialised by two independent
/// mutexes, so a command issued during a slow connect fails fast with
/// [`WalkPadError::NotConnected`] instead of queueing behind it.
///
/// # Examples
///
/// ```no_run
/// use walkpad::{ConnectOptions, WalkPad};
///
/// #[tokio::main]
/// async fn main() -> walkpad::Result<()> {
///     let pad = WalkPad::new().await?;
///     pad.connect(ConnectOptions::default()).await?;
///
///     pad.start().await?;
///     pad.set_speed(2.5).await?;
///
///     let mut states = pad.events().subscribe_state();
///     while let Ok(state) = states.recv().await {
///         println!("{:.1} km/h, {} steps", state.speed_kmh, state.steps);
///     }
///
///     pad.stop().await?;
///     pad.disconnect().await;
///     Ok(())
/// }
/// ```
pub struct WalkPad {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WalkPad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalkPad")
            .field("state", &self.connection_state())
            .finish()
    }
}

fn validate_poll_interval(value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(WalkPadError::InvalidPollInterval { value })
    }
}

fn aborted(opts: &ConnectOptions) -> bool {
    opts.signal.as_ref().is_some_and(|s| s.is_cancelled())
}

fn check_abort(opts: &ConnectOptions) -> Result<()> {
    if aborted(opts) {
        Err(WalkPadError::ConnectionAborted)
    } else {
        Ok(())
    }
}

impl WalkPad {
    /// Create a device over the system Bluetooth stack with in-memory
    /// device-id persistence.
    ///
    /// # Errors
    ///
    /// Returns [`WalkPadError::Ble`] if the Bluetooth stack cannot be
    /// initialized.
    pub async fn new() -> Result<Self> {
        let connector = Arc::new(BtleplugConnector::new().await?);
        Ok(Self::with_transport(connector, Arc::new(MemoryStore::new())))
    }

    /// Create a device over a custom BLE stack and device-id store.
    ///
    /// This is the seam used by the [`crate::mock`] stack in tests, and by
    /// applications that want file-backed persistence.
    #[must_use]
    pub fn with_transport(
        connector: Arc<dyn BleConnector>,
        storage: Arc<dyn DeviceIdStore>,
    ) -> Self {
        let events = EventBus::new();
        let machine = StateMachine::new();
        let bus = events.clone();
        machine.observe(Box::new(move |from, to| bus.emit_connection_change(from, to)));

        Self {
            inner: Arc::new(Inner {
                connector,
                storage,
                machine,
                events,
                connection_lock: Mutex::new(()),
                command_lock: Mutex::new(()),
                active: StdMutex::new(None),
                poll: PollManager::new(),
                latest: StdMutex::new(TreadmillState::default()),
            }),
        }
    }

    /// Current connection state
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.machine.state()
    }

    /// The event fan-out carrying state, error and connection-change channels
    #[must_use]
    pub fn events(&self) -> EventBus {
        self.inner.events.clone()
    }

    /// Latest parsed state snapshot; default until the first notification
    #[must_use]
    pub fn latest_state(&self) -> TreadmillState {
        lock(&self.inner.latest).clone()
    }

    /// Protocol and service UUIDs of the live session, when connected
    #[must_use]
    pub fn session_info(&self) -> Option<SessionInfo> {
        if self.inner.machine.state() != ConnectionState::Connected {
            return None;
        }
        lock(&self.inner.active).as_ref().map(|active| SessionInfo {
            protocol: active.codec.kind(),
            service_uuids: active.roles.service_uuids.clone(),
        })
    }

    /// Forget the remembered device id.
    pub fn forget_device(&self) {
        self.inner.storage.remove();
    }

    /// Scan for, connect to and configure a treadmill.
    ///
    /// Honours the abort signal at every checkpoint: before and after taking
    /// the connection mutex, as a race against the stack's connect, and
    /// immediately after the connect resolves. On any failure after the
    /// `connecting` transition, resources are cleaned up and the machine
    /// lands in `error` (or `disconnected` for aborts).
    ///
    /// # Errors
    ///
    /// [`WalkPadError::InvalidPollInterval`] for a non-finite or non-positive
    /// poll interval, [`WalkPadError::ConnectionAborted`] when the signal
    /// fires, [`WalkPadError::Timeout`] when the stack's connect exceeds its
    /// deadline, [`WalkPadError::Discovery`] when roles cannot be assigned,
    /// or any stack error.
    pub async fn connect(&self, opts: ConnectOptions) -> Result<()> {
        validate_poll_interval(opts.poll_interval_ms)?;
        check_abort(&opts)?;
        let _guard = self.inner.connection_lock.lock().await;
        check_abort(&opts)?;

        if matches!(
            self.inner.machine.state(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            self.inner.cleanup().await;
            if let Err(e) = self.inner.machine.transition(ConnectionState::Disconnected) {
                warn!("pre-connect cleanup transition rejected: {e}");
            }
        }
        self.inner.machine.transition(ConnectionState::Connecting)?;

        let session = match self.race_connect(&opts).await {
            Ok(session) => session,
            Err(e) => return Err(self.connect_failed(e).await),
        };

        // the signal may have fired at the exact moment connect resolved
        if aborted(&opts) {
            if let Err(e) = session.disconnect().await {
                self.inner.events.emit_error(e);
            }
            return Err(self.connect_failed(WalkPadError::ConnectionAborted).await);
        }

        match self.setup_session(session, &opts).await {
            Ok(()) => {
                self.inner.machine.transition(ConnectionState::Connected)?;
                Ok(())
            }
            Err(e) => Err(self.connect_failed(e).await),
        }
    }

    /// Reconnect to the remembered device.
    ///
    /// Returns `Ok(true)` when connected (or already connected or
    /// connecting), `Ok(false)` when the stack does not support reconnection,
    /// no device id is remembered, or the device cannot be found.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`WalkPad::connect`]; setup failures leave the
    /// machine in `error` and emit the error.
    pub async fn reconnect(&self, opts: ConnectOptions) -> Result<bool> {
        validate_poll_interval(opts.poll_interval_ms)?;
        check_abort(&opts)?;
        if matches!(
            self.inner.machine.state(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return Ok(true);
        }
        let _guard = self.inner.connection_lock.lock().await;
        check_abort(&opts)?;
        if self.inner.machine.state() == ConnectionState::Connected {
            return Ok(true);
        }
        if !self.inner.connector.supports_reconnect() {
            return Ok(false);
        }
        let Some(device_id) = self.inner.storage.get() else {
            return Ok(false);
        };

        self.inner.machine.transition(ConnectionState::Connecting)?;

        let result = self.race_reconnect(&device_id, &opts).await;
        let session = match result {
            Ok(Some(session)) => session,
            Ok(None) => {
                if let Err(e) = self.inner.machine.transition(ConnectionState::Disconnected) {
                    warn!("reconnect-miss transition rejected: {e}");
                }
                return Ok(false);
            }
            Err(e) => return Err(self.connect_failed(e).await),
        };

        if aborted(&opts) {
            if let Err(e) = session.disconnect().await {
                self.inner.events.emit_error(e);
            }
            return Err(self.connect_failed(WalkPadError::ConnectionAborted).await);
        }

        match self.setup_session(session, &opts).await {
            Ok(()) => {
                self.inner.machine.transition(ConnectionState::Connected)?;
                Ok(true)
            }
            Err(e) => Err(self.connect_failed(e).await),
        }
    }

    /// Disconnect and release every session resource.
    ///
    /// Never fails: internal errors are emitted on the error channel.
    /// Calling this while already disconnected is a no-op.
    pub async fn disconnect(&self) {
        let _guard = self.inner.connection_lock.lock().await;
        if self.inner.machine.state() == ConnectionState::Disconnected {
            return;
        }
        self.inner.cleanup().await;
        if let Err(e) = self.inner.machine.transition(ConnectionState::Disconnected) {
            warn!("disconnect transition rejected: {e}");
        }
    }

    /// Start the belt.
    ///
    /// # Errors
    ///
    /// [`WalkPadError::NotConnected`] when no device is connected, or when
    /// the connection was lost while the command was in flight.
    pub async fn start(&self) -> Result<()> {
        info!("starting belt");
        self.command(|codec| Ok(codec.build_start()), "start").await
    }

    /// Stop the belt.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`WalkPad::start`].
    pub async fn stop(&self) -> Result<()> {
        info!("stopping belt");
        self.command(|codec| Ok(codec.build_stop()), "stop").await
    }

    /// Set the target belt speed in km/h.
    ///
    /// # Errors
    ///
    /// [`WalkPadError::SpeedOutOfRange`] for speeds outside `0.5..=6.0` km/h,
    /// plus the failure modes of [`WalkPad::start`].
    pub async fn set_speed(&self, kmh: f64) -> Result<()> {
        info!("setting speed to {kmh:.1} km/h");
        self.command(move |codec| codec.build_set_speed(kmh), "set-speed")
            .await
    }

    async fn command<F>(&self, build: F, operation: &'static str) -> Result<()>
    where
        F: FnOnce(&'static dyn Codec) -> Result<Vec<u8>>,
    {
        let _guard = self.inner.command_lock.lock().await;
        if self.inner.machine.state() != ConnectionState::Connected {
            return Err(WalkPadError::NotConnected);
        }
        let active = lock(&self.inner.active)
            .clone()
            .ok_or(WalkPadError::NotConnected)?;

        let payload = build(active.codec)?;
        if payload.is_empty() {
            return Ok(());
        }
        match active.codec.kind() {
            ProtocolKind::Ftms => {
                transport::write_routed(&active.roles, &payload, active.write_timeout, operation)
                    .await?;
            }
            ProtocolKind::Standard => {
                transport::write_bounded(
                    active.roles.write.as_ref(),
                    &payload,
                    active.write_timeout,
                    operation,
                )
                .await?;
            }
        }
        // the connection may have died while the write was in flight
        if self.inner.machine.state() != ConnectionState::Connected {
            return Err(WalkPadError::NotConnected);
        }
        Ok(())
    }

    async fn race_connect(&self, opts: &ConnectOptions) -> Result<Arc<dyn BleSession>> {
        let selector = ScanSelector {
            name_prefixes: opts.name_prefixes.clone(),
            optional_services: opts.optional_services.clone(),
            remembered_id: self.inner.storage.get(),
        };
        let deadline = Duration::from_millis(opts.connection_timeout_ms);
        let connect = timeout(deadline, self.inner.connector.connect(&selector));
        let result = match &opts.signal {
            Some(signal) => {
                tokio::select! {
                    biased;
                    result = connect => result,
                    () = signal.cancelled() => return Err(WalkPadError::ConnectionAborted),
                }
            }
            None => connect.await,
        };
        result.map_err(|_| WalkPadError::Timeout {
            operation: "connect",
            limit_ms: opts.connection_timeout_ms,
        })?
    }

    async fn race_reconnect(
        &self,
        device_id: &str,
        opts: &ConnectOptions,
    ) -> Result<Option<Arc<dyn BleSession>>> {
        let deadline = Duration::from_millis(opts.connection_timeout_ms);
        let reconnect = timeout(deadline, self.inner.connector.reconnect(device_id));
        let result = match &opts.signal {
            Some(signal) => {
                tokio::select! {
                    biased;
                    result = reconnect => result,
                    () = signal.cancelled() => return Err(WalkPadError::ConnectionAborted),
                }
            }
            None => reconnect.await,
        };
        result.map_err(|_| WalkPadError::Timeout {
            operation: "reconnect",
            limit_ms: opts.connection_timeout_ms,
        })?
    }

    /// Discover roles, wire up notifications and polling, and store the
    /// session. The session is stored before any fallible step so every
    /// failure funnels through the one cleanup path.
    async fn setup_session(
        &self,
        session: Arc<dyn BleSession>,
        opts: &ConnectOptions,
    ) -> Result<()> {
        let roles = gatt::discover_roles(session.as_ref()).await?;
        let kind = detect_protocol(&roles.service_uuids);
        let codec = codec_for(kind);
        info!("speaking {kind} to {}", session.device_id());

        let write_timeout = Duration::from_millis(opts.write_timeout_ms);
        let notify_timeout = Duration::from_millis(opts.notification_timeout_ms);

        let active = Arc::new(ActiveSession {
            session: Arc::clone(&session),
            roles,
            codec,
            subscriptions: StdMutex::new(Vec::new()),
            disconnect_teardown: StdMutex::new(None),
            write_timeout,
        });
        *lock(&self.inner.active) = Some(Arc::clone(&active));

        // inbound status notifications become state events, in delivery order
        let parser_inner = Arc::clone(&self.inner);
        let subscription = transport::subscribe(
            Arc::clone(&active.roles.notify),
            Box::new(move |data| {
                let state = codec.parse_status(&data);
                *lock(&parser_inner.latest) = state.clone();
                parser_inner.events.emit_state(state);
            }),
            notify_timeout,
            "notify-enable",
        )
        .await?;
        lock(&active.subscriptions).push(subscription);

        // control-point handshake: indications first, then request control
        let request_control = codec.build_request_control();
        if !request_control.is_empty() {
            if let Some(control_point) = active.roles.control_point.clone() {
                let subscription = transport::subscribe(
                    control_point,
                    Box::new(|_| {}),
                    notify_timeout,
                    "control-point-enable",
                )
                .await?;
                lock(&active.subscriptions).push(subscription);
                match kind {
                    ProtocolKind::Ftms => {
                        transport::write_routed(
                            &active.roles,
                            &request_control,
                            write_timeout,
                            "request-control",
                        )
                        .await?;
                    }
                    ProtocolKind::Standard => {
                        transport::write_bounded(
                            active.roles.write.as_ref(),
                            &request_control,
                            write_timeout,
                            "request-control",
                        )
                        .await?;
                    }
                }
            }
        }

        if kind == ProtocolKind::Standard {
            self.inner.poll.start(
                Arc::downgrade(&active.roles.write),
                codec,
                Duration::from_secs_f64(opts.poll_interval_ms / 1_000.0),
                write_timeout,
                self.inner.events.clone(),
                DEFAULT_MAX_CONSECUTIVE_ERRORS,
            );
        }

        // the only path out of `connected` without an explicit caller
        let disconnect_inner = Arc::clone(&self.inner);
        let teardown = session
            .on_disconnect(Box::new(move || {
                if disconnect_inner.machine.state() != ConnectionState::Connected {
                    return;
                }
                let inner = Arc::clone(&disconnect_inner);
                tokio::spawn(async move {
                    let _guard = inner.connection_lock.lock().await;
                    if inner.machine.state() != ConnectionState::Connected {
                        return;
                    }
                    warn!("peer disconnected, cleaning up");
                    inner.cleanup().await;
                    if let Err(e) = inner.machine.transition(ConnectionState::Disconnected) {
                        warn!("peer-disconnect transition rejected: {e}");
                    }
                });
            }))
            .await?;
        *lock(&active.disconnect_teardown) = teardown;

        if opts.remember_device {
            self.inner.storage.set(&session.device_id());
        }
        Ok(())
    }

    /// Clean up after a failed connect or reconnect, land the machine in the
    /// right state, emit the error, and hand it back for the caller.
    async fn connect_failed(&self, err: WalkPadError) -> WalkPadError {
        self.inner.cleanup().await;
        let target = if matches!(err, WalkPadError::ConnectionAborted) {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Error
        };
        if let Err(e) = self.inner.machine.transition(target) {
            warn!("failure transition rejected: {e}");
        }
        self.inner.events.emit_error(err.event_clone());
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, MockService, MockSession};
    use crate::uuid_util::to_full_uuid;
    use tokio_util::sync::CancellationToken;
    use ConnectionState::{Connected, Connecting, Disconnected, Error};

    /// state=running, speed=3.5, time=120, distance=0.5 km, steps=100
    const STATUS_PACKET: [u8; 16] = [
        0xF7, 0xA2, 0x01, 0x23, 0x00, 0x00, 0x00, 0x78, 0x00, 0x00, 0x32, 0x00, 0x00, 0x64, 0x00,
        0xFD,
    ];

    fn pad_with(connector: &Arc<MockConnector>) -> WalkPad {
        WalkPad::with_transport(
            Arc::clone(connector) as Arc<dyn BleConnector>,
            Arc::new(MemoryStore::new()),
        )
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_standard_happy_path() {
        let connector = Arc::new(MockConnector::new());
        let session = MockSession::standard();
        connector.push_session(Arc::clone(&session));
        let pad = pad_with(&connector);
        let mut changes = pad.events().subscribe_connection_changes();

        pad.connect(ConnectOptions::default()).await.unwrap();
        assert_eq!(pad.connection_state(), Connected);

        let info = pad.session_info().unwrap();
        assert_eq!(info.protocol, ProtocolKind::Standard);
        assert!(info.service_uuids.iter().any(|u| u.contains("fe00")));

        assert!(session.characteristic("fe02").unwrap().is_subscribed());
        assert!(session.has_disconnect_listener());

        // the legacy protocol polls for status
        settle().await;
        let polled = session.characteristic("fe01").unwrap().writes();
        assert!(polled.contains(&codec_for(ProtocolKind::Standard).build_ask_stats()));

        let first = changes.recv().await.unwrap();
        assert_eq!((first.from, first.to), (Disconnected, Connecting));
        let second = changes.recv().await.unwrap();
        assert_eq!((second.from, second.to), (Connecting, Connected));

        pad.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_ftms_requests_control() {
        let connector = Arc::new(MockConnector::new());
        let session = MockSession::ftms();
        connector.push_session(Arc::clone(&session));
        let pad = pad_with(&connector);

        pad.connect(ConnectOptions::default()).await.unwrap();
        assert_eq!(pad.session_info().unwrap().protocol, ProtocolKind::Ftms);

        let control_point = session.characteristic("2ad9").unwrap();
        assert!(control_point.is_subscribed(), "indications enabled");
        assert_eq!(control_point.writes(), vec![vec![0x00]]);
        assert!(session.characteristic("2acd").unwrap().is_subscribed());

        // FTMS never polls
        settle().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(control_point.writes(), vec![vec![0x00]]);

        pad.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_become_state_events() {
        let connector = Arc::new(MockConnector::new());
        let session = MockSession::standard();
        connector.push_session(Arc::clone(&session));
        let pad = pad_with(&connector);
        let mut states = pad.events().subscribe_state();

        pad.connect(ConnectOptions::default()).await.unwrap();
        session.characteristic("fe02").unwrap().emit(&STATUS_PACKET);

        let state = states.recv().await.unwrap();
        assert_eq!(state.speed_kmh, 3.5);
        assert_eq!(state.elapsed_secs, 120);
        assert_eq!(state.steps, 100);
        assert!(state.is_running);
        assert_eq!(pad.latest_state(), state);

        pad.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_fail_without_connection() {
        let connector = Arc::new(MockConnector::new());
        let pad = pad_with(&connector);

        assert!(matches!(
            pad.start().await,
            Err(WalkPadError::NotConnected)
        ));
        assert!(matches!(pad.stop().await, Err(WalkPadError::NotConnected)));
        assert!(matches!(
            pad.set_speed(2.0).await,
            Err(WalkPadError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_standard_commands_write_framed_packets() {
        let connector = Arc::new(MockConnector::new());
        let session = MockSession::standard();
        connector.push_session(Arc::clone(&session));
        let pad = pad_with(&connector);
        pad.connect(ConnectOptions::default()).await.unwrap();

        pad.start().await.unwrap();
        pad.set_speed(2.0).await.unwrap();
        pad.stop().await.unwrap();

        let codec = codec_for(ProtocolKind::Standard);
        let writes = session.characteristic("fe01").unwrap().writes();
        assert!(writes.contains(&codec.build_start()));
        assert!(writes.contains(&codec.build_set_speed(2.0).unwrap()));
        assert!(writes.contains(&codec.build_stop()));

        pad.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ftms_commands_route_to_control_point() {
        let connector = Arc::new(MockConnector::new());
        let session = MockSession::ftms();
        connector.push_session(Arc::clone(&session));
        let pad = pad_with(&connector);
        pad.connect(ConnectOptions::default()).await.unwrap();

        pad.start().await.unwrap();
        pad.set_speed(3.5).await.unwrap();

        let writes = session.characteristic("2ad9").unwrap().writes();
        assert!(writes.contains(&vec![0x07]));
        assert!(writes.contains(&vec![0x02, 0x5E, 0x01]));

        pad.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_preserve_submission_order() {
        let connector = Arc::new(MockConnector::new());
        let session = MockSession::ftms();
        connector.push_session(Arc::clone(&session));
        let pad = Arc::new(pad_with(&connector));
        pad.connect(ConnectOptions::default()).await.unwrap();

        let mut handles = Vec::new();
        for kmh in [1.0, 2.0, 3.0] {
            let runner = Arc::clone(&pad);
            handles.push(tokio::spawn(async move { runner.set_speed(kmh).await }));
            settle().await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let writes = session.characteristic("2ad9").unwrap().writes();
        let speeds: Vec<&Vec<u8>> = writes.iter().filter(|w| w[0] == 0x02).collect();
        assert_eq!(
            speeds,
            vec![
                &vec![0x02, 0x64, 0x00],
                &vec![0x02, 0xC8, 0x00],
                &vec![0x02, 0x2C, 0x01]
            ]
        );

        pad.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_speed_out_of_range_sends_nothing() {
        let connector = Arc::new(MockConnector::new());
        let session = MockSession::ftms();
        connector.push_session(Arc::clone(&session));
        let pad = pad_with(&connector);
        pad.connect(ConnectOptions::default()).await.unwrap();

        let before = session.characteristic("2ad9").unwrap().writes().len();
        let err = pad.set_speed(9.0).await.unwrap_err();
        assert!(matches!(err, WalkPadError::SpeedOutOfRange { .. }));
        assert_eq!(session.characteristic("2ad9").unwrap().writes().len(), before);

        pad.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_post_write_state_check() {
        let connector = Arc::new(MockConnector::new());
        let session = MockSession::standard();
        connector.push_session(Arc::clone(&session));
        let pad = Arc::new(pad_with(&connector));
        pad.connect(ConnectOptions::default()).await.unwrap();
        settle().await;

        let write_char = session.characteristic("fe01").unwrap();
        write_char.set_write_delay(Duration::from_secs(5));

        let runner = Arc::clone(&pad);
        let command = tokio::spawn(async move { runner.start().await });
        settle().await;

        // the peer drops the connection while the write is in flight
        session.trigger_peer_disconnect();
        settle().await;
        assert_eq!(pad.connection_state(), Disconnected);

        tokio::time::advance(Duration::from_secs(5)).await;
        let result = command.await.unwrap();
        assert!(matches!(result, Err(WalkPadError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let connector = Arc::new(MockConnector::new());
        let session = MockSession::standard();
        connector.push_session(Arc::clone(&session));
        let pad = pad_with(&connector);

        // disconnecting while already disconnected is a no-op
        pad.disconnect().await;
        assert_eq!(pad.connection_state(), Disconnected);

        pad.connect(ConnectOptions::default()).await.unwrap();
        pad.disconnect().await;
        assert_eq!(pad.connection_state(), Disconnected);
        assert!(session.is_disconnected());
        assert!(!session.characteristic("fe02").unwrap().is_subscribed());
        assert!(pad.session_info().is_none());

        pad.disconnect().await;
        assert_eq!(pad.connection_state(), Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_emits_stack_errors_without_failing() {
        let connector = Arc::new(MockConnector::new());
        let session = MockSession::standard();
        connector.push_session(Arc::clone(&session));
        let pad = pad_with(&connector);
        pad.connect(ConnectOptions::default()).await.unwrap();

        let mut errors = pad.events().subscribe_errors();
        session.fail_next_disconnect();
        pad.disconnect().await;
        assert_eq!(pad.connection_state(), Disconnected);

        let err = errors.recv().await.unwrap();
        assert!(err.to_string().contains("simulated disconnect failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_disconnect_cleans_up() {
        let connector = Arc::new(MockConnector::new());
        let session = MockSession::standard();
        connector.push_session(Arc::clone(&session));
        let pad = pad_with(&connector);
        let mut changes = pad.events().subscribe_connection_changes();

        pad.connect(ConnectOptions::default()).await.unwrap();
        session.trigger_peer_disconnect();
        settle().await;

        assert_eq!(pad.connection_state(), Disconnected);
        assert!(!session.characteristic("fe02").unwrap().is_subscribed());

        let mut last = None;
        while let Ok(change) = changes.try_recv() {
            last = Some(change);
        }
        let last = last.unwrap();
        assert_eq!((last.from, last.to), (Connected, Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_replaces_live_session() {
        let connector = Arc::new(MockConnector::new());
        let first = MockSession::standard();
        let second = MockSession::ftms();
        connector.push_session(Arc::clone(&first));
        connector.push_session(Arc::clone(&second));
        let pad = pad_with(&connector);

        pad.connect(ConnectOptions::default()).await.unwrap();
        pad.connect(ConnectOptions::default()).await.unwrap();

        assert!(first.is_disconnected());
        assert!(!first.characteristic("fe02").unwrap().is_subscribed());
        assert_eq!(pad.connection_state(), Connected);
        assert_eq!(pad.session_info().unwrap().protocol, ProtocolKind::Ftms);

        pad.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_before_anything_happens() {
        let connector = Arc::new(MockConnector::new());
        connector.push_session(MockSession::standard());
        let pad = pad_with(&connector);

        let token = CancellationToken::new();
        token.cancel();
        let opts = ConnectOptions {
            signal: Some(token),
            ..ConnectOptions::default()
        };
        let err = pad.connect(opts).await.unwrap_err();
        assert!(matches!(err, WalkPadError::ConnectionAborted));
        assert_eq!(pad.connection_state(), Disconnected);
        assert!(connector.last_selector().is_none(), "stack never consulted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_stack_connect() {
        let connector = Arc::new(MockConnector::new());
        connector.push_session(MockSession::standard());
        connector.set_connect_delay(Duration::from_secs(60));
        let pad = Arc::new(pad_with(&connector));

        let token = CancellationToken::new();
        let opts = ConnectOptions {
            signal: Some(token.clone()),
            ..ConnectOptions::default()
        };
        let runner = Arc::clone(&pad);
        let attempt = tokio::spawn(async move { runner.connect(opts).await });
        settle().await;

        token.cancel();
        let err = attempt.await.unwrap().unwrap_err();
        assert!(matches!(err, WalkPadError::ConnectionAborted));
        assert_eq!(pad.connection_state(), Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_at_connect_resolution() {
        let connector = Arc::new(MockConnector::new());
        let session = MockSession::standard();
        connector.push_session(Arc::clone(&session));
        let pad = pad_with(&connector);

        let token = CancellationToken::new();
        connector.cancel_on_connect(token.clone());
        let opts = ConnectOptions {
            signal: Some(token),
            ..ConnectOptions::default()
        };
        let err = pad.connect(opts).await.unwrap_err();
        assert!(matches!(err, WalkPadError::ConnectionAborted));
        assert_eq!(pad.connection_state(), Disconnected);
        assert!(session.is_disconnected(), "unused session released");
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_while_waiting_for_the_lock() {
        let connector = Arc::new(MockConnector::new());
        connector.push_session(MockSession::standard());
        connector.set_connect_delay(Duration::from_secs(60));
        let pad = Arc::new(pad_with(&connector));

        let token_a = CancellationToken::new();
        let token_b = CancellationToken::new();
        let runner = Arc::clone(&pad);
        let opts_a = ConnectOptions {
            signal: Some(token_a.clone()),
            ..ConnectOptions::default()
        };
        let first = tokio::spawn(async move { runner.connect(opts_a).await });
        settle().await;

        let runner = Arc::clone(&pad);
        let opts_b = ConnectOptions {
            signal: Some(token_b.clone()),
            ..ConnectOptions::default()
        };
        let second = tokio::spawn(async move { runner.connect(opts_b).await });
        settle().await;

        // b's signal fires while it queues on the connection mutex
        token_b.cancel();
        token_a.cancel();

        let first = first.await.unwrap().unwrap_err();
        let second = second.await.unwrap().unwrap_err();
        assert!(matches!(first, WalkPadError::ConnectionAborted));
        assert!(matches!(second, WalkPadError::ConnectionAborted));
        assert_eq!(pad.connection_state(), Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_lands_in_error_state() {
        let connector = Arc::new(MockConnector::new());
        connector.fail_next_connect();
        connector.push_session(MockSession::standard());
        let pad = pad_with(&connector);
        let mut errors = pad.events().subscribe_errors();

        let err = pad.connect(ConnectOptions::default()).await.unwrap_err();
        assert!(err.to_string().contains("simulated connect failure"));
        assert_eq!(pad.connection_state(), Error);
        assert!(errors.recv().await.is_ok(), "failure emitted as event");

        // the machine recovers through error -> connecting
        pad.connect(ConnectOptions::default()).await.unwrap();
        assert_eq!(pad.connection_state(), Connected);
        pad.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_disconnects_and_errors() {
        let connector = Arc::new(MockConnector::new());
        let bare = MockSession::with_services(vec![MockService::new(
            &to_full_uuid("180a"),
            vec![],
        )]);
        connector.push_session(Arc::clone(&bare));
        let pad = pad_with(&connector);

        let err = pad.connect(ConnectOptions::default()).await.unwrap_err();
        assert!(matches!(err, WalkPadError::Discovery(_)));
        assert_eq!(pad.connection_state(), Error);
        assert!(bare.is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_enable_failure_fails_the_connect() {
        let connector = Arc::new(MockConnector::new());
        let session = MockSession::standard();
        session.characteristic("fe02").unwrap().fail_next_subscribe();
        connector.push_session(Arc::clone(&session));
        let pad = pad_with(&connector);

        let err = pad.connect(ConnectOptions::default()).await.unwrap_err();
        assert!(err.to_string().contains("simulated subscribe failure"));
        assert_eq!(pad.connection_state(), Error);
        assert!(session.is_disconnected(), "cleanup released the session");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_deadline() {
        let connector = Arc::new(MockConnector::new());
        connector.push_session(MockSession::standard());
        connector.set_connect_delay(Duration::from_secs(60));
        let pad = pad_with(&connector);

        let opts = ConnectOptions {
            connection_timeout_ms: 1_000,
            ..ConnectOptions::default()
        };
        let err = pad.connect(opts).await.unwrap_err();
        assert!(matches!(
            err,
            WalkPadError::Timeout {
                operation: "connect",
                limit_ms: 1_000
            }
        ));
        assert_eq!(pad.connection_state(), Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_poll_interval_is_rejected_up_front() {
        let connector = Arc::new(MockConnector::new());
        connector.push_session(MockSession::standard());
        let pad = pad_with(&connector);

        for bad in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let opts = ConnectOptions {
                poll_interval_ms: bad,
                ..ConnectOptions::default()
            };
            let err = pad.connect(opts).await.unwrap_err();
            assert!(matches!(err, WalkPadError::InvalidPollInterval { .. }));
        }
        assert_eq!(pad.connection_state(), Disconnected);
        assert!(connector.last_selector().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remember_device_persists_and_feeds_reconnect() {
        let connector = Arc::new(MockConnector::new());
        let storage = Arc::new(MemoryStore::new());
        connector.push_session(MockSession::standard());
        let pad = WalkPad::with_transport(
            Arc::clone(&connector) as Arc<dyn BleConnector>,
            Arc::clone(&storage) as Arc<dyn DeviceIdStore>,
        );

        let opts = ConnectOptions {
            remember_device: true,
            ..ConnectOptions::default()
        };
        pad.connect(opts).await.unwrap();
        assert_eq!(storage.get(), Some("AA:BB:CC:DD:EE:FF".to_string()));
        pad.disconnect().await;

        connector.push_reconnect(Some(MockSession::standard()));
        assert!(pad.reconnect(ConnectOptions::default()).await.unwrap());
        assert_eq!(pad.connection_state(), Connected);
        assert_eq!(
            connector.last_reconnect_id(),
            Some("AA:BB:CC:DD:EE:FF".to_string())
        );
        pad.disconnect().await;

        pad.forget_device();
        assert_eq!(storage.get(), None);
        assert!(!pad.reconnect(ConnectOptions::default()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_without_stack_support() {
        let connector = Arc::new(MockConnector::new());
        connector.without_reconnect();
        let storage = Arc::new(MemoryStore::new());
        storage.set("AA:BB:CC:DD:EE:FF");
        let pad = WalkPad::with_transport(
            Arc::clone(&connector) as Arc<dyn BleConnector>,
            storage,
        );

        assert!(!pad.reconnect(ConnectOptions::default()).await.unwrap());
        assert_eq!(pad.connection_state(), Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_miss_returns_false_and_disconnected() {
        let connector = Arc::new(MockConnector::new());
        let storage = Arc::new(MemoryStore::new());
        storage.set("AA:BB:CC:DD:EE:FF");
        connector.push_reconnect(None);
        let pad = WalkPad::with_transport(
            Arc::clone(&connector) as Arc<dyn BleConnector>,
            storage,
        );
        let mut changes = pad.events().subscribe_connection_changes();

        assert!(!pad.reconnect(ConnectOptions::default()).await.unwrap());
        assert_eq!(pad.connection_state(), Disconnected);

        let first = changes.recv().await.unwrap();
        assert_eq!((first.from, first.to), (Disconnected, Connecting));
        let second = changes.recv().await.unwrap();
        assert_eq!((second.from, second.to), (Connecting, Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_while_connected_is_a_no_op() {
        let connector = Arc::new(MockConnector::new());
        connector.push_session(MockSession::standard());
        let storage = Arc::new(MemoryStore::new());
        let pad = WalkPad::with_transport(
            Arc::clone(&connector) as Arc<dyn BleConnector>,
            storage,
        );

        pad.connect(ConnectOptions::default()).await.unwrap();
        assert!(pad.reconnect(ConnectOptions::default()).await.unwrap());
        assert_eq!(pad.connection_state(), Connected);
        assert!(connector.last_reconnect_id().is_none(), "stack not consulted");
        pad.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_info_only_when_connected() {
        let connector = Arc::new(MockConnector::new());
        connector.push_session(MockSession::standard());
        let pad = pad_with(&connector);

        assert!(pad.session_info().is_none());
        pad.connect(ConnectOptions::default()).await.unwrap();
        assert!(pad.session_info().is_some());
        pad.disconnect().await;
        assert!(pad.session_info().is_none());
    }
}

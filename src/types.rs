use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum plausible belt speed in km/h reported by any supported model
pub const MAX_SPEED_KMH: f64 = 25.0;

/// Maximum elapsed session time in seconds (24 hours)
pub const MAX_ELAPSED_SECS: u32 = 86_400;

/// Maximum plausible session distance in kilometers
pub const MAX_DISTANCE_KM: f64 = 100.0;

/// Maximum plausible session step count
pub const MAX_STEPS: u32 = 200_000;

/// Belt state as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Belt stopped, device awake
    Idle = 0,
    /// Belt running
    Running = 1,
    /// Belt spinning up
    Starting = 2,
    /// Session paused
    Paused = 3,
}

impl DeviceState {
    /// Clamp an arbitrary wire value into the state domain.
    ///
    /// Non-finite values map to [`DeviceState::Idle`]; fractional values are
    /// floored; values outside `0..=3` snap to the nearest boundary.
    #[must_use]
    pub fn from_clamped(value: f64) -> Self {
        match clamp_enum(value, 3) {
            1 => Self::Running,
            2 => Self::Starting,
            3 => Self::Paused,
            _ => Self::Idle,
        }
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Starting => write!(f, "Starting"),
            Self::Paused => write!(f, "Paused"),
        }
    }
}

/// Control mode as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMode {
    /// Device in standby, belt will not move
    Standby = 0,
    /// Speed controlled by commands or the console
    Manual = 1,
    /// Speed controlled by the belt's own sensors
    Auto = 2,
}

impl ControlMode {
    /// Clamp an arbitrary wire value into the mode domain (see
    /// [`DeviceState::from_clamped`] for the clamping rules).
    #[must_use]
    pub fn from_clamped(value: f64) -> Self {
        match clamp_enum(value, 2) {
            1 => Self::Manual,
            2 => Self::Auto,
            _ => Self::Standby,
        }
    }
}

impl Default for ControlMode {
    fn default() -> Self {
        Self::Standby
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standby => write!(f, "Standby"),
            Self::Manual => write!(f, "Manual"),
            Self::Auto => write!(f, "Auto"),
        }
    }
}

fn clamp_enum(value: f64, max: u8) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    let floored = value.floor();
    if floored <= 0.0 {
        0
    } else if floored >= f64::from(max) {
        max
    } else {
        // floored is in (0, max) and integral, the cast is exact
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            floored as u8
        }
    }
}

/// Clamp a parsed speed into `[0, MAX_SPEED_KMH]` km/h; non-finite input maps to 0.
#[must_use]
pub fn clamp_speed(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, MAX_SPEED_KMH)
    } else {
        0.0
    }
}

/// Clamp a parsed elapsed time into `[0, MAX_ELAPSED_SECS]` whole seconds.
#[must_use]
pub fn clamp_time(value: f64) -> u32 {
    clamp_integer(value, MAX_ELAPSED_SECS)
}

/// Clamp a parsed distance into `[0, MAX_DISTANCE_KM]` km; non-finite input maps to 0.
#[must_use]
pub fn clamp_distance(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, MAX_DISTANCE_KM)
    } else {
        0.0
    }
}

/// Clamp a parsed step count into `[0, MAX_STEPS]` whole steps.
#[must_use]
pub fn clamp_steps(value: f64) -> u32 {
    clamp_integer(value, MAX_STEPS)
}

fn clamp_integer(value: f64, max: u32) -> u32 {
    if !value.is_finite() {
        return 0;
    }
    let floored = value.floor();
    if floored <= 0.0 {
        0
    } else if floored >= f64::from(max) {
        max
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            floored as u32
        }
    }
}

/// Observable treadmill state snapshot
///
/// A fresh default snapshot is produced for every parse; parsers never hand
/// out a shared instance. Every numeric field is clamped into its documented
/// range before the snapshot is published.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TreadmillState {
    /// Belt state
    pub device_state: DeviceState,
    /// Control mode
    pub mode: ControlMode,
    /// Current belt speed in km/h
    pub speed_kmh: f64,
    /// Elapsed session time in seconds
    pub elapsed_secs: u32,
    /// Session distance in kilometers
    pub distance_km: f64,
    /// Session step count
    pub steps: u32,
    /// Whether the belt is considered to be moving
    pub is_running: bool,
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No device connected
    Disconnected,
    /// A connect or reconnect is in flight
    Connecting,
    /// Connected and ready for commands
    Connected,
    /// The last connect attempt failed
    Error,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Wire protocol spoken by a connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolKind {
    /// Proprietary framed protocol used by legacy models
    Standard,
    /// Bluetooth Fitness Machine Service
    Ftms,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Ftms => write!(f, "ftms"),
        }
    }
}

/// Information about the live connected session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Protocol the session speaks
    pub protocol: ProtocolKind,
    /// Service UUIDs discovered on the peer
    pub service_uuids: Vec<String>,
}

/// Options accepted by connect and reconnect
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Persist the chosen device id after a successful connect
    pub remember_device: bool,
    /// Legacy-protocol poll cadence in milliseconds; ignored for FTMS.
    /// Must be finite and greater than zero.
    pub poll_interval_ms: f64,
    /// Abort signal for the in-flight connect or reconnect
    pub signal: Option<tokio_util::sync::CancellationToken>,
    /// Device name prefixes used to select a peer during scanning
    pub name_prefixes: Vec<String>,
    /// Service UUIDs the scanner is allowed to see
    pub optional_services: Vec<String>,
    /// Deadline for the GATT connect itself, in milliseconds
    pub connection_timeout_ms: u64,
    /// Deadline for each characteristic write, in milliseconds
    pub write_timeout_ms: u64,
    /// Deadline for enabling notifications, in milliseconds
    pub notification_timeout_ms: u64,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            remember_device: false,
            poll_interval_ms: 3_000.0,
            signal: None,
            name_prefixes: crate::DEFAULT_NAME_PREFIXES
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
            optional_services: crate::DEFAULT_OPTIONAL_SERVICES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            connection_timeout_ms: 20_000,
            write_timeout_ms: 10_000,
            notification_timeout_ms: 15_000,
        }
    }
}

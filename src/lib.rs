#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # walkpad
//!
//! A Rust library for controlling WalkingPad-family treadmills via
//! Bluetooth Low Energy.
//!
//! The library exposes a small imperative surface (connect, start, stop,
//! set-speed, observe state) and takes care of everything underneath:
//!
//! - **Two wire protocols**: the proprietary framed protocol spoken by
//!   legacy models (header / body / checksum / suffix packets, polled
//!   status) and the standard Bluetooth *Fitness Machine Service* with its
//!   flag-gated treadmill-data packets and a vendor step-count extension.
//!   The protocol is detected automatically from the discovered services.
//! - **Connection lifecycle**: a strict
//!   `disconnected / connecting / connected / error` state machine,
//!   mutually exclusive connect / reconnect / disconnect, cancellation at
//!   every checkpoint, and deterministic resource cleanup on every failure
//!   path including unsolicited peer disconnects.
//! - **Telemetry**: typed event channels for state snapshots, errors and
//!   connection-state changes.
//!
//! ## Quick Start
//!
//! ```no_run
//! use walkpad::{ConnectOptions, WalkPad};
//!
//! #[tokio::main]
//! async fn main() -> walkpad::Result<()> {
//!     // Scan for a treadmill and connect
//!     let pad = WalkPad::new().await?;
//!     pad.connect(ConnectOptions::default()).await?;
//!
//!     // Start walking at 2.5 km/h
//!     pad.start().await?;
//!     pad.set_speed(2.5).await?;
//!
//!     // Watch live status
//!     let mut states = pad.events().subscribe_state();
//!     let state = states.recv().await.expect("state event");
//!     println!("{:.1} km/h, {} steps", state.speed_kmh, state.steps);
//!
//!     pad.stop().await?;
//!     pad.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Testing without hardware
//!
//! The BLE stack sits behind the traits in [`ble`]; the [`mock`] module
//! implements them with scriptable failure injection so application code
//! can be exercised end-to-end in plain `#[tokio::test]` functions.

/// BLE provider contract and the btleplug-backed implementation
pub mod ble;
/// Main device control interface
pub mod device;
/// Error types and handling
pub mod error;
/// Typed event fan-out
pub mod events;
/// GATT discovery and characteristic role assignment
pub mod gatt;
/// Mock BLE stack for testing
pub mod mock;
/// Legacy-protocol status polling
pub mod poll;
/// Wire protocol codecs and detection
pub mod protocol;
/// Connection lifecycle state machine
pub mod state;
/// Device-id persistence providers
pub mod storage;
/// Trailing-edge throttle for slider-style inputs
pub mod throttle;
/// Bounded writes and notification subscriptions
pub mod transport;
/// Type definitions and data structures
pub mod types;
/// Short/long Bluetooth UUID comparison helpers
pub mod uuid_util;

// Re-export the main types for convenient usage
pub use device::WalkPad;
pub use error::{Result, WalkPadError};
pub use events::{EventBus, EventReceiver, SharedError, StateChange};
pub use throttle::Throttle;
pub use types::{
    ConnectOptions, ConnectionState, ControlMode, DeviceState, ProtocolKind, SessionInfo,
    TreadmillState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short id of the Bluetooth Fitness Machine Service
pub const FTMS_SERVICE_SHORT: &str = "1826";

/// Short id of the FTMS treadmill-data characteristic
pub const FTMS_TREADMILL_DATA_SHORT: &str = "2acd";

/// Short id of the FTMS control-point characteristic
pub const FTMS_CONTROL_POINT_SHORT: &str = "2ad9";

/// Primary legacy service UUID used by WalkingPad models
pub const LEGACY_SERVICE_UUID: &str = "0000fe00-0000-1000-8000-00805f9b34fb";

/// Fallback legacy service UUID seen on some revisions
pub const LEGACY_SERVICE_UUID_ALT: &str = "0000fff0-0000-1000-8000-00805f9b34fb";

/// Full UUID of the Fitness Machine Service
pub const FTMS_SERVICE_UUID: &str = "00001826-0000-1000-8000-00805f9b34fb";

/// Device name prefixes advertised by supported treadmills
pub const DEFAULT_NAME_PREFIXES: [&str; 2] = ["Walking", "KS"];

/// Service UUIDs the scanner advertises interest in by default
pub const DEFAULT_OPTIONAL_SERVICES: [&str; 3] = [
    FTMS_SERVICE_UUID,
    LEGACY_SERVICE_UUID,
    LEGACY_SERVICE_UUID_ALT,
];

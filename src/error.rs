use thiserror::Error;

use crate::types::ConnectionState;

/// Errors that can occur when working with WalkingPad-family treadmills
#[derive(Error, Debug)]
pub enum WalkPadError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Requested belt speed is outside the device's accepted range
    #[error("speed {value} km/h out of range ({min} - {max} km/h)")]
    SpeedOutOfRange {
        /// Requested speed in km/h
        value: f64,
        /// Minimum accepted speed in km/h
        min: f64,
        /// Maximum accepted speed in km/h
        max: f64,
    },

    /// A command was issued while no device is connected
    #[error("not connected")]
    NotConnected,

    /// A bounded BLE operation exceeded its deadline
    #[error("{operation} timed out after {limit_ms}ms")]
    Timeout {
        /// Label of the operation that timed out
        operation: &'static str,
        /// The deadline that elapsed, in milliseconds
        limit_ms: u64,
    },

    /// An in-flight connect or reconnect was cancelled by its abort signal
    #[error("connection aborted")]
    ConnectionAborted,

    /// GATT discovery could not assign the required characteristic roles
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// The connection state machine rejected a transition
    #[error("invalid connection state transition: {from} -> {to}")]
    InvalidTransition {
        /// State the machine was in
        from: ConnectionState,
        /// State the caller asked for
        to: ConnectionState,
    },

    /// The configured poll interval is not a finite positive number
    #[error("poll interval must be finite and > 0, got {value}")]
    InvalidPollInterval {
        /// The rejected interval in milliseconds
        value: f64,
    },

    /// A write was attempted with an empty payload
    #[error("refusing to write empty payload")]
    EmptyPayload,

    /// A throttled call was replaced by a newer one before it could fire
    #[error("superseded by a newer call")]
    Superseded,

    /// Other errors
    #[error("{0}")]
    Other(String),
}

/// Result type for WalkingPad operations
pub type Result<T> = std::result::Result<T, WalkPadError>;

impl WalkPadError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::NotConnected | Self::ConnectionAborted | Self::Discovery(_)
        )
    }

    /// Check if this error is recoverable by retrying
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Superseded)
    }

    /// Copy of this error suitable for publishing on an event channel while
    /// the original is returned to the caller.
    ///
    /// Stack errors are not cloneable and flatten to their message; every
    /// other variant copies losslessly.
    #[must_use]
    pub fn event_clone(&self) -> Self {
        match self {
            Self::Ble(inner) => Self::Other(format!("BLE error: {inner}")),
            Self::SpeedOutOfRange { value, min, max } => Self::SpeedOutOfRange {
                value: *value,
                min: *min,
                max: *max,
            },
            Self::NotConnected => Self::NotConnected,
            Self::Timeout {
                operation,
                limit_ms,
            } => Self::Timeout {
                operation,
                limit_ms: *limit_ms,
            },
            Self::ConnectionAborted => Self::ConnectionAborted,
            Self::Discovery(message) => Self::Discovery(message.clone()),
            Self::InvalidTransition { from, to } => Self::InvalidTransition {
                from: *from,
                to: *to,
            },
            Self::InvalidPollInterval { value } => Self::InvalidPollInterval { value: *value },
            Self::EmptyPayload => Self::EmptyPayload,
            Self::Superseded => Self::Superseded,
            Self::Other(message) => Self::Other(message.clone()),
        }
    }
}

//! Wire protocol codecs and protocol detection.
//!
//! Two incompatible dialects are supported: the proprietary framed protocol
//! spoken by legacy models ([`standard`]) and the Bluetooth Fitness Machine
//! Service ([`ftms`]). Both are driven through the [`Codec`] trait so the
//! orchestrator never needs to know which dialect it is speaking.

use crate::{
    error::{Result, WalkPadError},
    types::{ProtocolKind, TreadmillState},
    uuid_util::uuid_match,
    FTMS_SERVICE_SHORT,
};

pub mod ftms;
pub mod standard;

pub use ftms::FtmsCodec;
pub use standard::StandardCodec;

/// Minimum belt speed accepted by the set-speed builders, in km/h
pub const MIN_TARGET_SPEED_KMH: f64 = 0.5;

/// Maximum belt speed accepted by the set-speed builders, in km/h
pub const MAX_TARGET_SPEED_KMH: f64 = 6.0;

/// Read a single byte; out-of-bounds offsets return 0.
#[must_use]
pub fn read_u8(data: &[u8], offset: usize) -> u8 {
    data.get(offset).copied().unwrap_or(0)
}

/// Read a 16-bit little-endian value; out-of-bounds offsets return 0.
#[must_use]
pub fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    match data.get(offset..offset.saturating_add(2)) {
        Some(b) => u16::from_le_bytes([b[0], b[1]]),
        None => 0,
    }
}

/// Read a 24-bit little-endian value; out-of-bounds offsets return 0.
#[must_use]
pub fn read_u24_le(data: &[u8], offset: usize) -> u32 {
    match data.get(offset..offset.saturating_add(3)) {
        Some(b) => u32::from_le_bytes([b[0], b[1], b[2], 0]),
        None => 0,
    }
}

/// Read a 24-bit big-endian value; out-of-bounds offsets return 0.
#[must_use]
pub fn read_u24_be(data: &[u8], offset: usize) -> u32 {
    match data.get(offset..offset.saturating_add(3)) {
        Some(b) => u32::from_be_bytes([0, b[0], b[1], b[2]]),
        None => 0,
    }
}

/// Validate a requested target speed against the accepted command range.
pub(crate) fn validate_target_speed(kmh: f64) -> Result<()> {
    if kmh.is_finite() && (MIN_TARGET_SPEED_KMH..=MAX_TARGET_SPEED_KMH).contains(&kmh) {
        Ok(())
    } else {
        Err(WalkPadError::SpeedOutOfRange {
            value: kmh,
            min: MIN_TARGET_SPEED_KMH,
            max: MAX_TARGET_SPEED_KMH,
        })
    }
}

/// A wire protocol dialect.
///
/// Codecs are stateless process-lifetime singletons obtained through
/// [`codec_for`]. Builders return complete write payloads; an empty payload
/// means the dialect has no such command and no I/O should be performed.
/// `parse_status` is total: any byte sequence yields a clamped
/// [`TreadmillState`], never an error.
pub trait Codec: Send + Sync {
    /// Which dialect this codec speaks
    fn kind(&self) -> ProtocolKind;

    /// Payload requesting a status report; empty for notification-driven dialects
    fn build_ask_stats(&self) -> Vec<u8>;

    /// Payload starting the belt
    fn build_start(&self) -> Vec<u8>;

    /// Payload stopping the belt
    fn build_stop(&self) -> Vec<u8>;

    /// Payload setting the target belt speed in km/h
    ///
    /// # Errors
    ///
    /// Returns [`WalkPadError::SpeedOutOfRange`] for non-finite speeds or
    /// speeds outside `0.5..=6.0` km/h.
    fn build_set_speed(&self, kmh: f64) -> Result<Vec<u8>>;

    /// Payload requesting control of the machine; empty when the dialect
    /// needs no request-control handshake
    fn build_request_control(&self) -> Vec<u8>;

    /// Parse an inbound status packet into a fresh state snapshot
    fn parse_status(&self, data: &[u8]) -> TreadmillState;
}

/// Choose the dialect to speak from the discovered service UUID list.
///
/// FTMS wins if any service carries the FTMS short id at the correct
/// position; everything else falls back to the legacy protocol.
#[must_use]
pub fn detect_protocol(service_uuids: &[String]) -> ProtocolKind {
    if service_uuids
        .iter()
        .any(|u| uuid_match(u, FTMS_SERVICE_SHORT))
    {
        ProtocolKind::Ftms
    } else {
        ProtocolKind::Standard
    }
}

/// Hand out the memoized codec singleton for a dialect.
#[must_use]
pub fn codec_for(kind: ProtocolKind) -> &'static dyn Codec {
    static STANDARD: StandardCodec = StandardCodec;
    static FTMS: FtmsCodec = FtmsCodec;
    match kind {
        ProtocolKind::Standard => &STANDARD,
        ProtocolKind::Ftms => &FTMS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_u8_bounds() {
        let data = [0xAA, 0xBB];
        assert_eq!(read_u8(&data, 0), 0xAA);
        assert_eq!(read_u8(&data, 1), 0xBB);
        assert_eq!(read_u8(&data, 2), 0);
        assert_eq!(read_u8(&[], 0), 0);
    }

    #[test]
    fn test_read_u16_le() {
        let data = [0x5E, 0x01];
        assert_eq!(read_u16_le(&data, 0), 350);
        assert_eq!(read_u16_le(&data, 1), 0);
        assert_eq!(read_u16_le(&data, usize::MAX), 0);
    }

    #[test]
    fn test_read_u24_le() {
        let data = [0xE8, 0x03, 0x00];
        assert_eq!(read_u24_le(&data, 0), 1000);
        assert_eq!(read_u24_le(&data, 1), 0);
    }

    #[test]
    fn test_read_u24_be() {
        let data = [0x00, 0x00, 0x78];
        assert_eq!(read_u24_be(&data, 0), 120);
        assert_eq!(read_u24_be(&[0x01, 0x00, 0x00], 0), 65536);
        assert_eq!(read_u24_be(&data, 2), 0);
    }

    #[test]
    fn test_detect_ftms() {
        let uuids = vec!["00001826-0000-1000-8000-00805f9b34fb".to_string()];
        assert_eq!(detect_protocol(&uuids), ProtocolKind::Ftms);
    }

    #[test]
    fn test_detect_standard() {
        let uuids = vec!["0000fe00-0000-1000-8000-00805f9b34fb".to_string()];
        assert_eq!(detect_protocol(&uuids), ProtocolKind::Standard);

        // the FTMS digits at the wrong position must not count
        let tricky = vec!["ab1826cd".to_string()];
        assert_eq!(detect_protocol(&tricky), ProtocolKind::Standard);

        assert_eq!(detect_protocol(&[]), ProtocolKind::Standard);
    }

    #[test]
    fn test_codec_registry_memoizes() {
        let a = (codec_for(ProtocolKind::Ftms) as *const dyn Codec).cast::<()>();
        let b = (codec_for(ProtocolKind::Ftms) as *const dyn Codec).cast::<()>();
        assert_eq!(a, b);
        assert_eq!(codec_for(ProtocolKind::Ftms).kind(), ProtocolKind::Ftms);
        assert_eq!(codec_for(ProtocolKind::Standard).kind(), ProtocolKind::Standard);
    }

    #[test]
    fn test_validate_target_speed_bounds() {
        assert!(validate_target_speed(0.5).is_ok());
        assert!(validate_target_speed(6.0).is_ok());
        assert!(validate_target_speed(0.4999).is_err());
        assert!(validate_target_speed(6.0001).is_err());
        assert!(validate_target_speed(f64::NAN).is_err());
    }
}

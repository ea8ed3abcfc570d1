//! Bluetooth Fitness Machine Service codec.
//!
//! Commands are single-opcode control-point writes with little-endian
//! payloads. Status arrives as treadmill-data notifications: a 16-bit flags
//! word, a mandatory instantaneous speed, then optional fields in a fixed
//! order gated by their flag bits. Parsing halts at the first field that
//! would overrun the buffer so a short packet can never misalign the fields
//! after it.

use bytes::{BufMut, BytesMut};

use crate::{
    error::Result,
    types::{
        clamp_distance, clamp_speed, clamp_steps, clamp_time, ControlMode, DeviceState,
        ProtocolKind, TreadmillState,
    },
};

use super::{read_u16_le, read_u24_le, validate_target_speed, Codec};

/// Control-point opcode: request control
pub const OP_REQUEST_CONTROL: u8 = 0x00;
/// Control-point opcode: set target speed
pub const OP_SET_TARGET_SPEED: u8 = 0x02;
/// Control-point opcode: start or resume
pub const OP_START_RESUME: u8 = 0x07;
/// Control-point opcode: stop or pause
pub const OP_STOP_PAUSE: u8 = 0x08;

/// Treadmill-data flag bit: average speed present
const FLAG_AVERAGE_SPEED: u16 = 1 << 1;
/// Treadmill-data flag bit: total distance present
const FLAG_TOTAL_DISTANCE: u16 = 1 << 2;
/// Treadmill-data flag bit: inclination and ramp angle present
const FLAG_INCLINATION: u16 = 1 << 3;
/// Treadmill-data flag bit: elevation gain present
const FLAG_ELEVATION_GAIN: u16 = 1 << 4;
/// Treadmill-data flag bit: instantaneous pace present
const FLAG_INSTANT_PACE: u16 = 1 << 5;
/// Treadmill-data flag bit: average pace present
const FLAG_AVERAGE_PACE: u16 = 1 << 6;
/// Treadmill-data flag bit: expended energy present
const FLAG_EXPENDED_ENERGY: u16 = 1 << 7;
/// Treadmill-data flag bit: heart rate present
const FLAG_HEART_RATE: u16 = 1 << 8;
/// Treadmill-data flag bit: metabolic equivalent present
const FLAG_METABOLIC_EQUIVALENT: u16 = 1 << 9;
/// Treadmill-data flag bit: elapsed time present
const FLAG_ELAPSED_TIME: u16 = 1 << 10;

/// Codec for the Fitness Machine Service dialect
#[derive(Debug, Default, Clone, Copy)]
pub struct FtmsCodec;

impl Codec for FtmsCodec {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Ftms
    }

    fn build_ask_stats(&self) -> Vec<u8> {
        // FTMS is notification driven, nothing to poll
        Vec::new()
    }

    fn build_start(&self) -> Vec<u8> {
        vec![OP_START_RESUME]
    }

    fn build_stop(&self) -> Vec<u8> {
        vec![OP_STOP_PAUSE, 0x01]
    }

    fn build_set_speed(&self, kmh: f64) -> Result<Vec<u8>> {
        validate_target_speed(kmh)?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let raw = (kmh * 100.0).round() as u16;
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u8(OP_SET_TARGET_SPEED);
        buf.put_u16_le(raw);
        Ok(buf.to_vec())
    }

    fn build_request_control(&self) -> Vec<u8> {
        vec![OP_REQUEST_CONTROL]
    }

    fn parse_status(&self, data: &[u8]) -> TreadmillState {
        let mut state = TreadmillState::default();
        if data.len() < 2 {
            return state;
        }
        let flags = read_u16_le(data, 0);

        // instantaneous speed always follows the flags word
        if data.len() < 4 {
            return state;
        }
        state.speed_kmh = clamp_speed(f64::from(read_u16_le(data, 2)) / 100.0);
        state.is_running = state.speed_kmh > 0.0;
        state.device_state = DeviceState::from_clamped(f64::from(u8::from(state.is_running)));
        state.mode = ControlMode::from_clamped(f64::from(u8::from(state.is_running)));

        let mut offset = 4usize;

        // optional fields in flag order; halt on the first one that would
        // overrun the buffer so later fields cannot misalign
        if flags & FLAG_AVERAGE_SPEED != 0 {
            if offset + 2 > data.len() {
                return state;
            }
            offset += 2;
        }
        if flags & FLAG_TOTAL_DISTANCE != 0 {
            if offset + 3 > data.len() {
                return state;
            }
            state.distance_km = clamp_distance(f64::from(read_u24_le(data, offset)) / 1000.0);
            offset += 3;
        }
        if flags & FLAG_INCLINATION != 0 {
            if offset + 4 > data.len() {
                return state;
            }
            offset += 4;
        }
        if flags & FLAG_ELEVATION_GAIN != 0 {
            if offset + 2 > data.len() {
                return state;
            }
            offset += 2;
        }
        if flags & FLAG_INSTANT_PACE != 0 {
            if offset + 1 > data.len() {
                return state;
            }
            offset += 1;
        }
        if flags & FLAG_AVERAGE_PACE != 0 {
            if offset + 1 > data.len() {
                return state;
            }
            offset += 1;
        }
        if flags & FLAG_EXPENDED_ENERGY != 0 {
            if offset + 5 > data.len() {
                return state;
            }
            offset += 5;
        }
        if flags & FLAG_HEART_RATE != 0 {
            if offset + 1 > data.len() {
                return state;
            }
            offset += 1;
        }
        if flags & FLAG_METABOLIC_EQUIVALENT != 0 {
            if offset + 1 > data.len() {
                return state;
            }
            offset += 1;
        }
        if flags & FLAG_ELAPSED_TIME != 0 {
            if offset + 2 > data.len() {
                return state;
            }
            state.elapsed_secs = clamp_time(f64::from(read_u16_le(data, offset)));
            offset += 2;
        }

        // trailing u16: vendor step-count extension, not in the FTMS spec
        if data.len() >= offset + 2 {
            state.steps = clamp_steps(f64::from(read_u16_le(data, offset)));
        }

        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_control() {
        assert_eq!(FtmsCodec.build_request_control(), vec![0x00]);
    }

    #[test]
    fn test_start_stop_opcodes() {
        assert_eq!(FtmsCodec.build_start(), vec![0x07]);
        assert_eq!(FtmsCodec.build_stop(), vec![0x08, 0x01]);
    }

    #[test]
    fn test_ask_stats_is_empty() {
        assert!(FtmsCodec.build_ask_stats().is_empty());
    }

    #[test]
    fn test_set_target_speed_framing() {
        assert_eq!(FtmsCodec.build_set_speed(3.5).unwrap(), vec![0x02, 0x5E, 0x01]);
        assert_eq!(FtmsCodec.build_set_speed(6.0).unwrap(), vec![0x02, 0x58, 0x02]);
    }

    #[test]
    fn test_set_target_speed_encodes_centi_kmh() {
        for kmh in [0.5, 1.0, 2.5, 4.2, 6.0] {
            let payload = FtmsCodec.build_set_speed(kmh).unwrap();
            let raw = u16::from_le_bytes([payload[1], payload[2]]);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let expected = (kmh * 100.0).round() as u16;
            assert_eq!(raw, expected);
        }
    }

    #[test]
    fn test_set_target_speed_validation() {
        assert!(FtmsCodec.build_set_speed(0.4999).is_err());
        assert!(FtmsCodec.build_set_speed(6.0001).is_err());
        assert!(FtmsCodec.build_set_speed(f64::NAN).is_err());
    }

    #[test]
    fn test_parse_minimal_packet() {
        let state = FtmsCodec.parse_status(&[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(state.speed_kmh, 0.0);
        assert!(!state.is_running);
        assert_eq!(state.device_state, crate::types::DeviceState::Idle);
        assert_eq!(state.mode, crate::types::ControlMode::Standby);
        assert_eq!(state.steps, 0);
    }

    #[test]
    fn test_parse_speed_distance_time() {
        // flags 0x0404: total distance + elapsed time
        let data = [0x04, 0x04, 0x64, 0x00, 0xE8, 0x03, 0x00, 0x3C, 0x00];
        let state = FtmsCodec.parse_status(&data);
        assert_eq!(state.speed_kmh, 1.0);
        assert_eq!(state.distance_km, 1.0);
        assert_eq!(state.elapsed_secs, 60);
        assert!(state.is_running);
        assert_eq!(state.device_state, crate::types::DeviceState::Running);
        assert_eq!(state.mode, crate::types::ControlMode::Manual);
    }

    #[test]
    fn test_parse_flags_only_yields_default() {
        let state = FtmsCodec.parse_status(&[0x04, 0x04]);
        assert_eq!(state, crate::types::TreadmillState::default());
        assert_eq!(FtmsCodec.parse_status(&[0x04]), crate::types::TreadmillState::default());
        assert_eq!(FtmsCodec.parse_status(&[]), crate::types::TreadmillState::default());
    }

    #[test]
    fn test_parse_halts_on_truncated_distance() {
        // distance flagged but only two of its three bytes present
        let data = [0x04, 0x00, 0x64, 0x00, 0xE8, 0x03];
        let state = FtmsCodec.parse_status(&data);
        assert_eq!(state.speed_kmh, 1.0);
        assert_eq!(state.distance_km, 0.0);
        assert_eq!(state.elapsed_secs, 0);
        assert_eq!(state.steps, 0);
    }

    #[test]
    fn test_parse_skipped_fields_keep_alignment() {
        // flags: average speed + total distance + heart rate + elapsed time
        let flags: u16 = (1 << 1) | (1 << 2) | (1 << 8) | (1 << 10);
        let mut data = flags.to_le_bytes().to_vec();
        data.extend_from_slice(&[0x2C, 0x01]); // speed 3.00 km/h
        data.extend_from_slice(&[0x64, 0x00]); // average speed, skipped
        data.extend_from_slice(&[0xF4, 0x01, 0x00]); // 500 m
        data.push(0x78); // heart rate, skipped
        data.extend_from_slice(&[0x2C, 0x01]); // 300 s
        let state = FtmsCodec.parse_status(&data);
        assert_eq!(state.speed_kmh, 3.0);
        assert_eq!(state.distance_km, 0.5);
        assert_eq!(state.elapsed_secs, 300);
    }

    #[test]
    fn test_parse_trailing_steps_extension() {
        // flags zero, speed, then the vendor step counter
        let data = [0x00, 0x00, 0x64, 0x00, 0x64, 0x00];
        let state = FtmsCodec.parse_status(&data);
        assert_eq!(state.speed_kmh, 1.0);
        assert_eq!(state.steps, 100);

        // a single trailing byte is not enough for the extension
        let data = [0x00, 0x00, 0x64, 0x00, 0x64];
        assert_eq!(FtmsCodec.parse_status(&data).steps, 0);
    }

    #[test]
    fn test_parse_never_exceeds_clamp_ranges() {
        // exhaustive-ish fuzz over short random-ish buffers
        let mut byte = 0u8;
        for len in 0..24usize {
            let mut data = vec![0u8; len];
            for b in &mut data {
                byte = byte.wrapping_mul(31).wrapping_add(17);
                *b = byte;
            }
            let state = FtmsCodec.parse_status(&data);
            assert!(state.speed_kmh >= 0.0 && state.speed_kmh <= crate::types::MAX_SPEED_KMH);
            assert!(state.distance_km >= 0.0 && state.distance_km <= crate::types::MAX_DISTANCE_KM);
            assert!(state.elapsed_secs <= crate::types::MAX_ELAPSED_SECS);
            assert!(state.steps <= crate::types::MAX_STEPS);
        }
    }
}

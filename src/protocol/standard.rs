//! Proprietary framed protocol spoken by legacy models.
//!
//! Command packets are `[0xF7, 0xA2, <body>, checksum, 0xFD]` where the
//! checksum is the byte sum from the second header byte through the last
//! body byte, modulo 256. Responses use `0xF8 0xA2` headers and a fixed
//! status layout parsed at hard offsets.

use bytes::{BufMut, BytesMut};

use crate::{
    error::Result,
    types::{
        clamp_distance, clamp_speed, clamp_steps, clamp_time, ControlMode, DeviceState,
        ProtocolKind, TreadmillState,
    },
};

use super::{read_u8, read_u24_be, validate_target_speed, Codec};

/// First header byte of a command packet
pub const COMMAND_HEADER: [u8; 2] = [0xF7, 0xA2];

/// First header byte of a response packet
pub const RESPONSE_HEADER: [u8; 2] = [0xF8, 0xA2];

/// Packet suffix byte
pub const PACKET_SUFFIX: u8 = 0xFD;

/// Minimum status packet length; shorter inputs parse to the default state
pub const MIN_STATUS_LEN: usize = 16;

const OP_ASK_STATS: u8 = 0x00;
const OP_SET_SPEED: u8 = 0x03;
const OP_BELT: u8 = 0x04;

/// Codec for the legacy framed protocol
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardCodec;

/// Frame a command body into a complete packet with checksum and suffix.
#[must_use]
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(body.len() + 4);
    buf.put_slice(&COMMAND_HEADER);
    buf.put_slice(body);
    buf.put_u8(checksum(&buf));
    buf.put_u8(PACKET_SUFFIX);
    buf.to_vec()
}

/// Checksum over the second header byte through the last body byte.
fn checksum(frame_so_far: &[u8]) -> u8 {
    frame_so_far[1..]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
}

impl Codec for StandardCodec {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Standard
    }

    fn build_ask_stats(&self) -> Vec<u8> {
        frame(&[OP_ASK_STATS])
    }

    fn build_start(&self) -> Vec<u8> {
        frame(&[OP_BELT, 0x01])
    }

    fn build_stop(&self) -> Vec<u8> {
        frame(&[OP_BELT, 0x00])
    }

    fn build_set_speed(&self, kmh: f64) -> Result<Vec<u8>> {
        validate_target_speed(kmh)?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let raw = (kmh * 10.0).round() as u8;
        Ok(frame(&[OP_SET_SPEED, raw]))
    }

    fn build_request_control(&self) -> Vec<u8> {
        // the legacy protocol needs no control handshake
        Vec::new()
    }

    fn parse_status(&self, data: &[u8]) -> TreadmillState {
        let mut state = TreadmillState::default();
        if data.len() < MIN_STATUS_LEN {
            return state;
        }

        state.device_state = DeviceState::from_clamped(f64::from(read_u8(data, 2)));
        state.speed_kmh = clamp_speed(f64::from(read_u8(data, 3)) / 10.0);
        state.mode = ControlMode::from_clamped(f64::from(read_u8(data, 4)));
        state.elapsed_secs = clamp_time(f64::from(read_u24_be(data, 5)));
        // distance is reported in units of 10 m
        state.distance_km = clamp_distance(f64::from(read_u24_be(data, 8)) / 100.0);
        state.steps = clamp_steps(f64::from(read_u24_be(data, 11)));
        state.is_running = state.speed_kmh > 0.0 || state.device_state == DeviceState::Running;
        state
    }
}

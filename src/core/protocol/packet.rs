//! Gateway packet decoding
//!
//! A frame body starts with a two-byte header (`sequence_id`, `sensor_id`).
//! The heartbeat sensor id marks a free-text status body; every other sensor
//! id carries a fixed batch of little-endian `i16` temperature pairs in units
//! of 0.1 degree.

use super::framing::{encode_frame, nested_body, MARKER_OVERHEAD};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sensor id reserved for heartbeat packets
pub const HEARTBEAT_SENSOR_ID: u8 = 0xFF;

/// Readings per batch sent by the gateway firmware
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Upper bound on heartbeat text
pub const DEFAULT_MAX_HEARTBEAT_LEN: usize = 200;

/// Header length (`sequence_id` + `sensor_id`)
pub const HEADER_LEN: usize = 2;

/// Encoded size of one (meat, fire) pair
pub const READING_LEN: usize = 4;

/// Fixed-point scale of the wire temperatures
const FIXED_POINT_SCALE: f32 = 10.0;

/// Rounding applied to decoded temperatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// Keep the full 0.1 degree resolution
    Tenth,
    /// Round to the nearest half degree
    #[default]
    HalfDegree,
}

impl Precision {
    /// Apply the rounding policy
    pub fn apply(self, degrees: f32) -> f32 {
        match self {
            Self::Tenth => (degrees * FIXED_POINT_SCALE).round() / FIXED_POINT_SCALE,
            Self::HalfDegree => (degrees * 2.0).round() / 2.0,
        }
    }
}

/// Temperature offsets added after scaling
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    /// Offset for the meat probe, in degrees
    pub meat_offset: f32,
    /// Offset for the fire probe, in degrees
    pub fire_offset: f32,
}

/// One temperature pair from a batch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Meat probe temperature, degrees
    pub meat_temp: f32,
    /// Fire probe temperature, degrees
    pub fire_temp: f32,
}

/// Packet payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// Free-text gateway status
    Heartbeat(String),
    /// Batch of readings, oldest first
    Readings(Vec<Reading>),
}

/// A decoded packet
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Packet {
    /// Wrapping 8-bit sequence number
    pub sequence_id: u8,
    /// Originating sensor
    pub sensor_id: u8,
    /// Decoded body
    pub payload: Payload,
}

impl Packet {
    /// Is this a heartbeat?
    pub fn is_heartbeat(&self) -> bool {
        matches!(self.payload, Payload::Heartbeat(_))
    }

    /// Readings carried by the packet (empty for heartbeats)
    pub fn readings(&self) -> &[Reading] {
        match &self.payload {
            Payload::Readings(readings) => readings,
            Payload::Heartbeat(_) => &[],
        }
    }
}

/// Packet decode errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Body shorter than the header
    #[error("Body too short: {0} bytes")]
    TooShort(usize),

    /// Readings body of the wrong size
    #[error("Bad readings length: expected {expected} bytes, got {actual}")]
    BadLength {
        /// Expected payload bytes
        expected: usize,
        /// Actual payload bytes
        actual: usize,
    },

    /// Heartbeat text over the configured bound
    #[error("Heartbeat text too long: {len} bytes (max {max})")]
    HeartbeatTooLong {
        /// Text length up to the terminator
        len: usize,
        /// Configured bound
        max: usize,
    },
}

/// Decoder settings
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    /// Readings per batch
    pub batch_size: usize,
    /// Sensor id marking heartbeats
    pub heartbeat_sensor_id: u8,
    /// Upper bound on heartbeat text
    pub max_heartbeat_len: usize,
    /// Rounding policy
    pub precision: Precision,
    /// Temperature offsets
    pub calibration: Calibration,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            heartbeat_sensor_id: HEARTBEAT_SENSOR_ID,
            max_heartbeat_len: DEFAULT_MAX_HEARTBEAT_LEN,
            precision: Precision::default(),
            calibration: Calibration::default(),
        }
    }
}

impl DecoderConfig {
    /// Body length of a readings packet
    pub fn readings_body_len(&self) -> usize {
        HEADER_LEN + self.batch_size * READING_LEN
    }

    /// Wire length of a readings packet, markers included
    pub fn readings_frame_len(&self) -> usize {
        self.readings_body_len() + MARKER_OVERHEAD
    }
}

/// A packet together with where in the body it was found
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// The decoded packet
    pub packet: Packet,
    /// Body bytes skipped before a nested frame; 0 for an intact frame
    pub skipped: usize,
}

/// Stateless body decoder
#[derive(Debug, Clone, Default)]
pub struct PacketDecoder {
    config: DecoderConfig,
}

impl PacketDecoder {
    /// Create a decoder
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    /// Decoder settings
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Expected body length of a readings packet
    pub fn readings_body_len(&self) -> usize {
        self.config.readings_body_len()
    }

    /// Decode one frame body
    pub fn decode(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let [sequence_id, sensor_id, rest @ ..] = body else {
            return Err(DecodeError::TooShort(body.len()));
        };

        let payload = if *sensor_id == self.config.heartbeat_sensor_id {
            Payload::Heartbeat(self.decode_heartbeat(rest)?)
        } else {
            Payload::Readings(self.decode_readings(rest)?)
        };

        Ok(Packet {
            sequence_id: *sequence_id,
            sensor_id: *sensor_id,
            payload,
        })
    }

    /// Decode an extracted body, retrying on a nested frame
    ///
    /// The whole body is tried first, so a start marker that is part of the
    /// payload does not split an intact frame. Only when that fails is the
    /// frame after the last nested start marker decoded. If neither decodes,
    /// the error for the whole body is returned.
    pub fn decode_frame(&self, body: &[u8]) -> Result<Decoded, DecodeError> {
        let err = match self.decode(body) {
            Ok(packet) => return Ok(Decoded { packet, skipped: 0 }),
            Err(e) => e,
        };
        let nested = nested_body(body).ok_or_else(|| err.clone())?;
        let packet = self.decode(nested).map_err(|_| err)?;
        Ok(Decoded {
            packet,
            skipped: body.len() - nested.len(),
        })
    }

    fn decode_heartbeat(&self, rest: &[u8]) -> Result<String, DecodeError> {
        let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        if len > self.config.max_heartbeat_len {
            return Err(DecodeError::HeartbeatTooLong {
                len,
                max: self.config.max_heartbeat_len,
            });
        }
        Ok(String::from_utf8_lossy(&rest[..len]).into_owned())
    }

    fn decode_readings(&self, rest: &[u8]) -> Result<Vec<Reading>, DecodeError> {
        let expected = self.config.batch_size * READING_LEN;
        if rest.len() != expected {
            return Err(DecodeError::BadLength {
                expected,
                actual: rest.len(),
            });
        }

        let cal = self.config.calibration;
        Ok(rest
            .chunks_exact(READING_LEN)
            .map(|pair| Reading {
                meat_temp: self.scale(i16::from_le_bytes([pair[0], pair[1]]), cal.meat_offset),
                fire_temp: self.scale(i16::from_le_bytes([pair[2], pair[3]]), cal.fire_offset),
            })
            .collect())
    }

    fn scale(&self, raw: i16, offset: f32) -> f32 {
        self.config
            .precision
            .apply(f32::from(raw) / FIXED_POINT_SCALE + offset)
    }
}

// ============ Encoding ============

/// Convert degrees to the wire's fixed-point representation
pub fn to_fixed_point(degrees: f32) -> i16 {
    let raw = (degrees * FIXED_POINT_SCALE).round();
    // Saturating float-to-int cast
    raw as i16
}

/// Encode a readings packet as a complete frame
pub fn encode_readings(sequence_id: u8, sensor_id: u8, pairs: &[(i16, i16)]) -> Vec<u8> {
    let mut body = Vec::with_capacity(HEADER_LEN + pairs.len() * READING_LEN);
    body.push(sequence_id);
    body.push(sensor_id);
    for (meat, fire) in pairs {
        body.extend_from_slice(&meat.to_le_bytes());
        body.extend_from_slice(&fire.to_le_bytes());
    }
    encode_frame(&body)
}

/// Encode a zero-terminated heartbeat packet as a complete frame
pub fn encode_heartbeat(sequence_id: u8, text: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(HEADER_LEN + text.len() + 1);
    body.push(sequence_id);
    body.push(HEARTBEAT_SENSOR_ID);
    body.extend_from_slice(text.as_bytes());
    body.push(0);
    encode_frame(&body)
}

//! Gateway wire protocol
//!
//! Provides:
//! - Marker framing of the serial byte stream
//! - Decoding of frame bodies into readings and heartbeats
//! - Encoders for building frames (tests, simulators, replay captures)

pub mod framing;
pub mod packet;

pub use framing::{
    encode_frame, nested_body, AssemblerState, AssemblerStats, StreamAssembler, DEFAULT_MAX_FRAME_LEN,
    END_MARKER, START_MARKER,
};
pub use packet::{
    encode_heartbeat, encode_readings, to_fixed_point, Calibration, DecodeError, Decoded, DecoderConfig,
    Packet, PacketDecoder, Payload, Precision, Reading, DEFAULT_BATCH_SIZE,
    DEFAULT_MAX_HEARTBEAT_LEN, HEARTBEAT_SENSOR_ID,
};

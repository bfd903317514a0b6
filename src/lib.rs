//! # Sensorgate Core Library
//!
//! Ingestion pipeline for a wireless temperature-sensor gateway attached
//! over a serial link:
//! - Marker framing with resynchronization on a noisy byte stream
//! - Packet decoding (reading batches and heartbeats)
//! - Per-sensor loss accounting over wrapping 8-bit sequence ids
//! - Timestamp reconstruction for batched readings
//! - Fan-out channel with explicit backpressure to any number of consumers
//!
//! ## Example
//!
//! ```rust,no_run
//! use sensorgate_core::{GatewayReader, ReaderOptions, SampleChannel, SerialConfig,
//!     SerialTransport, StopSignal};
//!
//! fn main() -> anyhow::Result<()> {
//!     let transport = SerialTransport::open(SerialConfig::new("/dev/serial0", 115_200))?;
//!     let channel = SampleChannel::default();
//!     let samples = channel.subscribe("display");
//!
//!     let reader = GatewayReader::new(transport, ReaderOptions::default(), channel, StopSignal::new())
//!         .spawn()?;
//!
//!     for sample in samples.samples() {
//!         println!("{} sensor {}: {:.1}", sample.timestamp, sample.sensor_id, sample.meat_temp);
//!     }
//!     reader.join()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::{ConfigError, GatewayConfig};
pub use crate::core::channel::{
    BackpressurePolicy, ChannelConfig, Heartbeat, Record, SampleChannel, SampleStream,
};
pub use crate::core::loss::{LossMonitor, LossSnapshot, LossTracker, SensorLossState};
pub use crate::core::protocol::{
    DecodeError, DecoderConfig, Packet, PacketDecoder, Payload, Precision, Reading,
    StreamAssembler,
};
pub use crate::core::reader::{GatewayError, GatewayReader, ReaderHandle, ReaderOptions, ReaderStats};
pub use crate::core::sink::{FileSink, RecordFormat, SampleSink, SinkError};
pub use crate::core::stop::StopSignal;
pub use crate::core::timeline::{Sample, TimeReconstructor};
pub use crate::core::transport::{
    ReplayTransport, RetryPolicy, SerialConfig, SerialTransport, Transport, TransportError,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

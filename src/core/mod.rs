//! Core gateway pipeline
//!
//! This module provides:
//! - Transports delivering raw gateway bytes (serial port, capture replay)
//! - Wire protocol: frame assembly and packet decoding
//! - Per-sensor loss accounting
//! - Timestamp reconstruction for batched readings
//! - Fan-out channel between the reader and its consumers
//! - The reader loop, persistence sinks and periodic reports

pub mod channel;
pub mod loss;
pub mod protocol;
pub mod reader;
pub mod report;
pub mod sink;
pub mod stop;
pub mod timeline;
pub mod transport;

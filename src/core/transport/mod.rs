//! Byte transports feeding the gateway reader
//!
//! Supports:
//! - Serial ports (the gateway's UART link)
//! - Replay of captured byte streams

mod replay;
mod serial;

pub use replay::ReplayTransport;
pub use serial::{list_ports, SerialConfig, SerialTransport};

use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Disconnected
    #[error("Disconnected")]
    Disconnected,

    /// Source exhausted; no more bytes will ever arrive
    #[error("End of stream")]
    EndOfStream,
}

impl TransportError {
    /// Is this a clean end rather than a failure?
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}

/// Ordered byte source
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send {
    /// Read up to `max_bytes`, waiting at most `timeout`.
    ///
    /// An empty result means the timeout elapsed without data.
    fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Bytes, TransportError>;

    /// Release the underlying handle
    fn close(&mut self) -> Result<(), TransportError>;

    /// Re-establish the link after a read failure
    fn reconnect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Bounded retry with exponential backoff for transport failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before giving up
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on the delay
    pub max_delay: Duration,
    /// Delay multiplier (exponential backoff)
    pub backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a given attempt number (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let multiplier = self.backoff_multiplier.max(1.0).powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f32() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f32());

        Duration::from_secs_f32(capped)
    }

    /// Should another retry follow `failures` consecutive failures?
    pub fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_attempts
    }
}

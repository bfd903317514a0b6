//! Serial port transport implementation

use super::{Transport, TransportError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use std::io::Read;
use std::time::Duration;
use tracing::{debug, info};

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name (e.g., /dev/serial0, COM3)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Largest single read, in bytes
    pub read_chunk: usize,
}

impl SerialConfig {
    /// Create a new serial configuration with default settings
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            read_timeout_ms: 100,
            read_chunk: 4096,
        }
    }

    /// Set read timeout
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Read timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("/dev/serial0", 115_200)
    }
}

/// Serial port transport (8N1, no flow control)
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<Box<dyn SerialPort>>,
    timeout: Duration,
}

impl SerialTransport {
    /// Open the configured port
    pub fn open(config: SerialConfig) -> Result<Self, TransportError> {
        let port = Self::open_port(&config)?;
        info!(port = %config.port, baud = config.baud_rate, "Serial port opened");
        Ok(Self {
            timeout: config.timeout(),
            config,
            port: Some(port),
        })
    }

    fn open_port(config: &SerialConfig) -> Result<Box<dyn SerialPort>, TransportError> {
        serialport::new(&config.port, config.baud_rate)
            .timeout(config.timeout())
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::PortNotFound(config.port.clone()),
                serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                    TransportError::PortNotFound(config.port.clone())
                }
                serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    TransportError::PermissionDenied(config.port.clone())
                }
                _ => TransportError::ConnectionFailed(e.to_string()),
            })
    }

    /// Port configuration
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Bytes, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;

        if timeout != self.timeout {
            port.set_timeout(timeout)
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            self.timeout = timeout;
        }

        let mut buffer = vec![0u8; max_bytes.max(1)];
        match port.read(&mut buffer) {
            Ok(0) => Err(TransportError::Disconnected),
            Ok(n) => {
                buffer.truncate(n);
                Ok(Bytes::from(buffer))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // No data available, return empty
                Ok(Bytes::new())
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(Bytes::new()),
            Err(e) => Err(TransportError::IoError(e)),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            info!(port = %self.config.port, "Serial port closed");
        }
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        self.port = None;
        debug!(port = %self.config.port, "Reopening serial port");
        let port = Self::open_port(&self.config)?;
        self.timeout = self.config.timeout();
        self.port = Some(port);
        info!(port = %self.config.port, "Serial port reopened");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud (8N1)", self.config.port, self.config.baud_rate)
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, TransportError> {
    serialport::available_ports().map_err(|e| TransportError::IoError(e.into()))
}

//! Replay of captured gateway byte streams
//!
//! Feeds the reader from a file (or any reader) holding raw bytes as they
//! came off the serial link. Running out of input ends the stream cleanly.

use super::{Transport, TransportError};
use bytes::Bytes;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Transport reading from a captured byte stream
pub struct ReplayTransport<R> {
    source: Option<R>,
    name: String,
    pace: Option<Duration>,
    bytes_read: u64,
}

impl ReplayTransport<BufReader<File>> {
    /// Replay a capture file
    pub fn open(path: &Path) -> Result<Self, TransportError> {
        let file = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => TransportError::PortNotFound(path.display().to_string()),
            ErrorKind::PermissionDenied => {
                TransportError::PermissionDenied(path.display().to_string())
            }
            _ => TransportError::IoError(e),
        })?;
        info!(path = %path.display(), "Replaying capture");
        Ok(Self::from_reader(BufReader::new(file), &path.display().to_string()))
    }
}

impl<R: Read + Send> ReplayTransport<R> {
    /// Replay from an arbitrary reader
    pub fn from_reader(reader: R, name: &str) -> Self {
        Self {
            source: Some(reader),
            name: name.to_string(),
            pace: None,
            bytes_read: 0,
        }
    }

    /// Sleep between reads to mimic a live link
    #[must_use]
    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// Bytes delivered so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

impl<R: Read + Send> Transport for ReplayTransport<R> {
    fn read(&mut self, max_bytes: usize, _timeout: Duration) -> Result<Bytes, TransportError> {
        let source = self.source.as_mut().ok_or(TransportError::NotConnected)?;

        if let Some(pace) = self.pace {
            std::thread::sleep(pace);
        }

        let mut buffer = vec![0u8; max_bytes.max(1)];
        match source.read(&mut buffer) {
            Ok(0) => Err(TransportError::EndOfStream),
            Ok(n) => {
                buffer.truncate(n);
                self.bytes_read += n as u64;
                Ok(Bytes::from(buffer))
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => Ok(Bytes::new()),
            Err(e) => Err(TransportError::IoError(e)),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.source = None;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("replay of {}", self.name)
    }
}

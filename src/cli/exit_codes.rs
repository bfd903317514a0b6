//! CLI Exit Codes
//!
//! Stable exit codes so supervisors and scripts can tell failures apart.

use crate::config::ConfigError;
use crate::core::protocol::DecodeError;
use crate::core::reader::GatewayError;
use crate::core::sink::SinkError;
use crate::core::transport::TransportError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// File not found
    pub const FILE_NOT_FOUND: u8 = 6;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Protocol error
    pub const PROTOCOL_ERROR: u8 = 9;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Transport retries exhausted
    pub const TRANSPORT_EXHAUSTED: u8 = 18;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;

    /// Every code, in table order
    pub const ALL: [u8; 12] = [0, 1, 2, 3, 6, 7, 8, 9, 11, 14, 18, 127];
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Failure with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

fn transport_code(err: &TransportError) -> u8 {
    match err {
        TransportError::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
        TransportError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
        TransportError::IoError(e) => io_code(e),
        _ => ExitCodes::CONNECTION_FAILED,
    }
}

fn io_code(err: &std::io::Error) -> u8 {
    match err.kind() {
        std::io::ErrorKind::NotFound => ExitCodes::FILE_NOT_FOUND,
        std::io::ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
        _ => ExitCodes::ERROR,
    }
}

impl From<&anyhow::Error> for CliResult {
    fn from(err: &anyhow::Error) -> Self {
        let code = err
            .chain()
            .find_map(|cause| {
                if let Some(e) = cause.downcast_ref::<GatewayError>() {
                    Some(match e {
                        GatewayError::TransportExhausted { .. } => ExitCodes::TRANSPORT_EXHAUSTED,
                        GatewayError::Spawn(_) | GatewayError::Panicked => {
                            ExitCodes::INTERNAL_ERROR
                        }
                    })
                } else if let Some(e) = cause.downcast_ref::<TransportError>() {
                    Some(transport_code(e))
                } else if cause.downcast_ref::<ConfigError>().is_some() {
                    Some(ExitCodes::CONFIG_ERROR)
                } else if cause.downcast_ref::<DecodeError>().is_some() {
                    Some(ExitCodes::PROTOCOL_ERROR)
                } else if cause.downcast_ref::<hex::FromHexError>().is_some() {
                    Some(ExitCodes::INVALID_ARGS)
                } else if let Some(e) = cause.downcast_ref::<SinkError>() {
                    Some(match e {
                        SinkError::Io(io) => io_code(io),
                        SinkError::Json(_) => ExitCodes::ERROR,
                    })
                } else {
                    cause.downcast_ref::<std::io::Error>().map(io_code)
                }
            })
            .unwrap_or(ExitCodes::ERROR);

        Self::Error(code, format!("{err:#}"))
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        6 => "File not found",
        7 => "Permission denied",
        8 => "Configuration error",
        9 => "Protocol error",
        11 => "Operation cancelled",
        14 => "Port not found",
        18 => "Transport retries exhausted",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in ExitCodes::ALL {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}

//! Error types for the serial session engine

use thiserror::Error;

/// Failure reported by a `SerialChannel` implementation.
///
/// Carries the OS or driver cause as text; the engine wraps it into the
/// matching `SessionError` variant together with what it was doing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ChannelError(pub String);

impl ChannelError {
    pub fn new(cause: impl Into<String>) -> Self {
        Self(cause.into())
    }
}

impl From<serialport::Error> for ChannelError {
    fn from(e: serialport::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

/// Errors surfaced to the operator by `SessionEngine` actions.
///
/// Every variant is terminal for the attempted action only. The `Display`
/// text is the message shown to the operator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Unsupported baud rate {baud} (expected one of 9600, 19200, 38400, 57600, 115200)")]
    InvalidConfig { baud: u32 },

    #[error("No serial port selected.")]
    NoDeviceSelected,

    #[error("Failed to open port {device}: {cause}")]
    Open { device: String, cause: String },

    #[error("Failed to write data to port: {cause}")]
    Write { cause: String },

    #[error("Distance {distance} mm cannot be converted to a motor step count")]
    InvalidDistance { distance: String },

    #[error("Nothing to send. Please enter text.")]
    EmptyPayload,

    #[error("Not connected to a serial port")]
    NotConnected,

    #[error("Already connected to {device}; disconnect first")]
    AlreadyConnected { device: String },
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

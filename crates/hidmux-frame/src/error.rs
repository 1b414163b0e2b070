use std::time::Duration;

/// Errors that can occur in the wire codec and the link layer.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Not enough bytes left to decode the next field.
    #[error("truncated input ({needed} bytes needed, {available} available)")]
    Truncated { needed: usize, available: usize },

    /// A NUL-terminated string ran to the end of the input.
    #[error("string is missing its NUL terminator")]
    MissingTerminator,

    /// A record advertised a payload length above the record capacity.
    #[error("invalid record payload length {0} (max 62)")]
    InvalidLength(u8),

    /// An I/O error occurred while reading or writing records.
    #[error("record I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Device-level error.
    #[error("device error: {0}")]
    Device(#[from] hidmux_device::DeviceError),

    /// The device was closed before a complete record was exchanged.
    #[error("device closed (incomplete record)")]
    ConnectionClosed,

    /// The handshake did not complete before its deadline.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The link was started before a handshake completed.
    #[error("link is not connected")]
    NotConnected,

    /// The link has been stopped.
    #[error("link stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, FrameError>;

use std::time::Duration;

/// Errors that can occur in the channel, transport and engine layers.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Device-level error.
    #[error("device error: {0}")]
    Device(#[from] hidmux_device::DeviceError),

    /// Frame or link-level error.
    #[error("frame error: {0}")]
    Frame(#[from] hidmux_frame::FrameError),

    /// Local I/O error (files, processes, streams).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON configuration error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// No channel with this ID is registered.
    #[error("channel {0} not known")]
    UnknownChannel(u32),

    /// A file channel was requested with an access mode outside the table.
    #[error("unknown file access mode: '{0}'")]
    FileMode(String),

    /// Operation timed out.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer or the local stack has gone away.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// The peer sent something the protocol does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A remote method call returned an error response.
    #[error("remote method failed: {0}")]
    Remote(String),
}

pub type Result<T> = std::result::Result<T, PeerError>;

use std::path::PathBuf;

/// Errors that can occur while opening or using a record device.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Failed to open the device node.
    #[error("failed to open device {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to bind a simulated device socket.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to a simulated device socket.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming simulated device connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the device handle.
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The operation is not supported by this kind of device handle.
    #[error("operation not supported on {0} devices")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::error::{DeviceError, Result};

/// A connected record device handle implementing `Read` and `Write`.
///
/// This is the fundamental I/O type handed to the link layer.
/// Device nodes are plain files opened for reading and writing; simulated
/// devices wrap one end of a Unix domain socket.
pub struct DeviceStream {
    inner: DeviceStreamInner,
}

enum DeviceStreamInner {
    Node(File),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Read for DeviceStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            DeviceStreamInner::Node(file) => file.read(buf),
            #[cfg(unix)]
            DeviceStreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for DeviceStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            DeviceStreamInner::Node(file) => file.write(buf),
            #[cfg(unix)]
            DeviceStreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            DeviceStreamInner::Node(file) => file.flush(),
            #[cfg(unix)]
            DeviceStreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl DeviceStream {
    /// Open a device node for reading and writing.
    ///
    /// The caller is responsible for finding the right node; the path is used as is.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| DeviceError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(?path, "opened device node");
        Ok(Self {
            inner: DeviceStreamInner::Node(file),
        })
    }

    /// Create a DeviceStream from a Unix domain socket stream.
    #[cfg(unix)]
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: DeviceStreamInner::Unix(stream),
        }
    }

    /// Create two connected simulated device ends.
    ///
    /// Records written to one end are read from the other, in order.
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    /// Set read timeout on the underlying handle.
    ///
    /// Device nodes do not support timeouts; `None` is accepted for them and
    /// anything else returns [`DeviceError::Unsupported`].
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            DeviceStreamInner::Node(_) if timeout.is_none() => Ok(()),
            DeviceStreamInner::Node(_) => Err(DeviceError::Unsupported("node")),
            #[cfg(unix)]
            DeviceStreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Try to clone this handle (creates a new file descriptor).
    ///
    /// The link layer reads and writes from different threads, so every
    /// device is split this way before starting.
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            DeviceStreamInner::Node(file) => {
                let cloned = file.try_clone()?;
                Ok(Self {
                    inner: DeviceStreamInner::Node(cloned),
                })
            }
            #[cfg(unix)]
            DeviceStreamInner::Unix(stream) => {
                let cloned = stream.try_clone()?;
                Ok(Self::from_unix(cloned))
            }
        }
    }

    /// Shut down both directions of a simulated device.
    ///
    /// Unblocks a reader parked on the other clone. Device nodes have no
    /// equivalent and return [`DeviceError::Unsupported`].
    pub fn shutdown(&self) -> Result<()> {
        match &self.inner {
            DeviceStreamInner::Node(_) => Err(DeviceError::Unsupported("node")),
            #[cfg(unix)]
            DeviceStreamInner::Unix(stream) => stream
                .shutdown(std::net::Shutdown::Both)
                .map_err(Into::into),
        }
    }

    /// Kind of handle, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match &self.inner {
            DeviceStreamInner::Node(_) => "node",
            #[cfg(unix)]
            DeviceStreamInner::Unix(_) => "unix",
        }
    }
}

impl std::fmt::Debug for DeviceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStream")
            .field("type", &self.kind())
            .finish()
    }
}

use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{DeviceError, Result};
use crate::traits::DeviceStream;

/// A simulated record device exposed on a Unix domain socket.
///
/// The controller side binds the socket and plays the role of the device;
/// the agent side connects to it as it would open a device node. Only one
/// peer is expected per socket, so there is no accept loop.
pub struct SimulatedDevice {
    listener: UnixListener,
    path: PathBuf,
    created_inode: (u64, u64),
}

impl SimulatedDevice {
    /// Permission mode for created socket paths.
    pub const SOCKET_MODE: u32 = 0o600;

    /// Unix `sockaddr_un.sun_path` is 108 bytes on Linux, 104 elsewhere.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind a simulated device at `path`.
    ///
    /// A stale socket at `path` is replaced; any other kind of file is left
    /// alone and reported as a bind error.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let len = path.as_os_str().len();
        if len >= Self::MAX_PATH_LEN {
            return Err(DeviceError::PathTooLong {
                path,
                len,
                max: Self::MAX_PATH_LEN,
            });
        }

        let bind_err = |source: std::io::Error| DeviceError::Bind {
            path: path.clone(),
            source,
        };

        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale device socket");
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(Self::SOCKET_MODE))
            .map_err(bind_err)?;
        let created = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "simulated device waiting for agent");
        Ok(Self {
            listener,
            created_inode: (created.dev(), created.ino()),
            path,
        })
    }

    /// Wait for the agent to attach (blocking).
    pub fn accept(&self) -> Result<DeviceStream> {
        let (stream, _addr) = self.listener.accept().map_err(DeviceError::Accept)?;
        debug!(path = ?self.path, "agent attached to simulated device");
        Ok(DeviceStream::from_unix(stream))
    }

    /// Attach to a simulated device (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<DeviceStream> {
        let path = path.as_ref();
        let stream =
            std::os::unix::net::UnixStream::connect(path).map_err(|source| DeviceError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(?path, "attached to simulated device");
        Ok(DeviceStream::from_unix(stream))
    }

    /// The path this device is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        let Ok(metadata) = std::fs::symlink_metadata(&self.path) else {
            return;
        };
        // Only remove the socket we created; the path may have been replaced.
        if metadata.file_type().is_socket()
            && (metadata.dev(), metadata.ino()) == self.created_inode
        {
            debug!(path = ?self.path, "removing device socket");
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

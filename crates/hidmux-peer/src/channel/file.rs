use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use hidmux_frame::lock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Channel, ChannelContext, ChannelCore, Direction, Encoding};
use crate::error::{PeerError, Result};

/// File channel tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileChannelConfig {
    /// Bytes read per outbound chunk.
    pub chunk_size: usize,
    /// Refuse to clobber existing files (`wb`) or create missing ones
    /// (`r+b`) unless the request forces it.
    pub protect_existing: bool,
}

impl Default for FileChannelConfig {
    fn default() -> Self {
        Self {
            chunk_size: 3096,
            protect_existing: true,
        }
    }
}

/// Access modes accepted for remote file access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccessMode {
    /// `rb`
    Read,
    /// `wb`
    Write,
    /// `r+b`
    ReadWrite,
    /// `ab`
    Append,
}

impl FileAccessMode {
    pub fn parse(mode: &str) -> Result<Self> {
        match mode {
            "rb" => Ok(Self::Read),
            "wb" => Ok(Self::Write),
            "r+b" => Ok(Self::ReadWrite),
            "ab" => Ok(Self::Append),
            other => Err(PeerError::FileMode(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "rb",
            Self::Write => "wb",
            Self::ReadWrite => "r+b",
            Self::Append => "ab",
        }
    }

    pub fn readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn writable(self) -> bool {
        self != Self::Read
    }

    /// Open options for this mode.
    ///
    /// With `protect`, `wb` only creates new files and `r+b` only opens
    /// existing ones.
    pub fn options(self, protect: bool) -> OpenOptions {
        let mut options = OpenOptions::new();
        match (self, protect) {
            (Self::Read, _) => {
                options.read(true);
            }
            (Self::Write, true) => {
                options.write(true).create_new(true);
            }
            (Self::Write, false) => {
                options.write(true).create(true).truncate(true);
            }
            (Self::ReadWrite, true) => {
                options.read(true).write(true);
            }
            (Self::ReadWrite, false) => {
                options.read(true).write(true).create(true);
            }
            (Self::Append, _) => {
                options.append(true).create(true);
            }
        }
        options
    }

    pub fn open(self, path: &Path, protect: bool) -> Result<File> {
        Ok(self.options(protect).open(path)?)
    }
}

/// A channel transferring a local file.
///
/// Inbound bytes are written to the file. For readable modes the file is
/// read lazily, one chunk per dequeue, so nothing is buffered ahead of the
/// link. Reaching EOF requests close for `rb` only.
pub struct FileChannel {
    core: ChannelCore,
    path: PathBuf,
    mode: FileAccessMode,
    chunk_size: usize,
    file: Mutex<Option<File>>,
    exhausted: AtomicBool,
}

impl FileChannel {
    /// Open `path` under `mode`. `force` lifts the protect-existing policy.
    pub fn open(
        context: &ChannelContext,
        path: impl Into<PathBuf>,
        mode: &str,
        force: bool,
        config: &FileChannelConfig,
    ) -> Result<Self> {
        let path = path.into();
        let mode = FileAccessMode::parse(mode)?;
        let file = mode.open(&path, config.protect_existing && !force)?;
        let channel = Self {
            core: ChannelCore::new(context, Direction::Bidirectional, Encoding::ByteArray),
            path,
            mode,
            chunk_size: config.chunk_size.max(1),
            file: Mutex::new(Some(file)),
            exhausted: AtomicBool::new(!mode.readable()),
        };
        info!(
            channel = channel.core.id(),
            path = %channel.path.display(),
            mode = mode.as_str(),
            "opened file channel"
        );
        Ok(channel)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> FileAccessMode {
        self.mode
    }

    fn read_chunk(&self) -> Option<Bytes> {
        if self.exhausted.load(Ordering::SeqCst) {
            return None;
        }
        let mut guard = lock(&self.file);
        let file = guard.as_mut()?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(channel = self.core.id(), error = %err, "file read failed");
                    break;
                }
            }
        }

        if filled < buf.len() {
            self.exhausted.store(true, Ordering::SeqCst);
            debug!(channel = self.core.id(), "file fully read");
            // A read-write file stays open for inbound writes.
            if self.mode == FileAccessMode::Read {
                self.core.request_close();
            }
        }
        if filled == 0 {
            return None;
        }
        buf.truncate(filled);
        Some(Bytes::from(buf))
    }
}

impl Channel for FileChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn enqueue_input(&self, data: Bytes) {
        if !self.mode.writable() {
            warn!(channel = self.core.id(), "dropping data for read-only file");
            return;
        }
        if let Some(file) = lock(&self.file).as_mut() {
            if let Err(err) = file.write_all(&data) {
                warn!(channel = self.core.id(), error = %err, "file write failed");
            }
        }
    }

    fn dequeue_output(&self) -> Option<Bytes> {
        self.core.pop_output().or_else(|| self.read_chunk())
    }

    fn has_pending_out_data(&self) -> bool {
        self.core.output_len() > 0 || !self.exhausted.load(Ordering::SeqCst)
    }

    fn on_close(&self) {
        if let Some(mut file) = lock(&self.file).take() {
            let _ = file.flush();
        }
        debug!(channel = self.core.id(), path = %self.path.display(), "file channel closed");
    }
}

//! Stream channels: a local byte stream exposed to the peer.
//!
//! Every message on a stream channel starts with a marker byte: `0` for
//! raw data, `1` for a control request or response. Requests are
//! `[u32 sub_type][fields]`; each one is answered with
//! `[1][u32 code][fields]`, where the code is `100 + sub_type` on success
//! and `200 + sub_type` (followed by a NUL-terminated message) on failure.

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use hidmux_frame::{lock, Signal, WireRead, WireWrite};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::file::FileAccessMode;
use super::{Channel, ChannelContext, ChannelCore, Direction, Encoding};
use crate::error::Result;

pub const DATA_MARKER: u8 = 0;
pub const CONTROL_MARKER: u8 = 1;

pub const REQUEST_STATE: u32 = 1;
pub const REQUEST_READ: u32 = 2;
pub const REQUEST_FLUSH: u32 = 3;
pub const REQUEST_CLOSE: u32 = 4;
pub const REQUEST_POSITION: u32 = 5;
pub const REQUEST_LENGTH: u32 = 6;
pub const REQUEST_READ_TIMEOUT: u32 = 7;
pub const REQUEST_WRITE_TIMEOUT: u32 = 8;
pub const REQUEST_SEEK: u32 = 9;
pub const REQUEST_WRITE: u32 = 10;

pub const SUCCESS_BASE: u32 = 100;
pub const FAILURE_BASE: u32 = 200;
pub const UNKNOWN_REQUEST: u32 = 299;

const GATE_POLL: Duration = Duration::from_millis(100);

/// Stream channel tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Bytes pulled from the source per read in passthrough mode.
    pub read_size: usize,
    /// Passthrough reading pauses while this much output is buffered.
    pub buffer_limit: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_size: 1024,
            buffer_limit: 32 * 1024,
        }
    }
}

/// What the underlying stream supports, reported by STATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCaps {
    pub can_read: bool,
    pub can_write: bool,
    pub can_seek: bool,
    pub can_timeout: bool,
}

impl StreamCaps {
    /// Capabilities of a local file opened with `mode`.
    pub fn for_file(mode: FileAccessMode) -> Self {
        Self {
            can_read: mode.readable(),
            can_write: mode.writable(),
            can_seek: mode != FileAccessMode::Append,
            can_timeout: false,
        }
    }
}

/// A seekable byte stream served on demand.
pub trait RawStream: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> RawStream for T {}

enum Mode {
    OnDemand {
        stream: Mutex<Option<Box<dyn RawStream>>>,
    },
    Passthrough {
        sink: Mutex<Option<Box<dyn Write + Send>>>,
        gate: Arc<Signal>,
        stop: Arc<AtomicBool>,
        reader: Mutex<Option<JoinHandle<()>>>,
    },
}

enum Reply {
    Done(Bytes),
    Failed(String),
    Unknown,
}

/// A bidirectional channel over a local byte stream.
pub struct StreamChannel {
    core: Arc<ChannelCore>,
    caps: StreamCaps,
    config: StreamConfig,
    mode: Mode,
    timeouts: Mutex<(i32, i32)>,
}

impl StreamChannel {
    /// Serve `stream` only in response to peer requests.
    pub fn on_demand(
        context: &ChannelContext,
        stream: Box<dyn RawStream>,
        caps: StreamCaps,
        config: StreamConfig,
    ) -> Self {
        Self {
            core: Arc::new(ChannelCore::new(
                context,
                Direction::Bidirectional,
                Encoding::ByteArray,
            )),
            caps,
            config,
            mode: Mode::OnDemand {
                stream: Mutex::new(Some(stream)),
            },
            timeouts: Mutex::new((0, 0)),
        }
    }

    /// Forward everything read from `source` to the peer and write inbound
    /// data to `sink`.
    pub fn passthrough(
        context: &ChannelContext,
        source: Box<dyn Read + Send>,
        sink: Box<dyn Write + Send>,
        caps: StreamCaps,
        config: StreamConfig,
    ) -> Result<Self> {
        let core = Arc::new(ChannelCore::new(
            context,
            Direction::Bidirectional,
            Encoding::ByteArray,
        ));
        let gate = Arc::new(Signal::manual(true));
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let core = Arc::clone(&core);
            let gate = Arc::clone(&gate);
            let stop = Arc::clone(&stop);
            let config = config.clone();
            thread::Builder::new()
                .name(format!("hidmux-stream-{}", core.id()))
                .spawn(move || pump(core, source, gate, stop, config))?
        };

        Ok(Self {
            core,
            caps,
            config,
            mode: Mode::Passthrough {
                sink: Mutex::new(Some(sink)),
                gate,
                stop,
                reader: Mutex::new(Some(reader)),
            },
            timeouts: Mutex::new((0, 0)),
        })
    }

    /// Open a local file as a stream channel.
    pub fn open_file(
        context: &ChannelContext,
        path: &Path,
        mode: FileAccessMode,
        protect_existing: bool,
        passthrough: bool,
        config: StreamConfig,
    ) -> Result<Self> {
        let file = mode.open(path, protect_existing)?;
        let caps = StreamCaps::for_file(mode);
        info!(path = %path.display(), ?mode, passthrough, "opened stream channel file");
        if passthrough {
            let source = file.try_clone()?;
            Self::passthrough(context, Box::new(source), Box::new(file), caps, config)
        } else {
            Ok(Self::on_demand(context, Box::new(file), caps, config))
        }
    }

    pub fn caps(&self) -> StreamCaps {
        self.caps
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self.mode, Mode::Passthrough { .. })
    }

    fn write_data(&self, data: &[u8]) {
        if !self.caps.can_write {
            warn!(channel = self.core.id(), "dropping data for read-only stream");
            return;
        }
        let result = match &self.mode {
            Mode::OnDemand { stream } => match lock(stream).as_mut() {
                Some(stream) => stream.write_all(data),
                None => Ok(()),
            },
            Mode::Passthrough { sink, .. } => match lock(sink).as_mut() {
                Some(sink) => sink.write_all(data).and_then(|()| sink.flush()),
                None => Ok(()),
            },
        };
        if let Err(err) = result {
            warn!(channel = self.core.id(), error = %err, "stream write failed");
        }
    }

    fn handle_request(&self, mut request: Bytes) {
        let sub_type = match request.take_u32() {
            Ok(sub_type) => sub_type,
            Err(err) => {
                warn!(channel = self.core.id(), error = %err, "malformed stream request");
                return;
            }
        };
        debug!(channel = self.core.id(), sub_type, "stream request");

        let mut response = BytesMut::new();
        response.put_u8(CONTROL_MARKER);
        match self.answer(sub_type, request) {
            Reply::Done(fields) => {
                response.put_u32(SUCCESS_BASE + sub_type);
                response.put_slice(&fields);
            }
            Reply::Failed(message) => {
                response.put_u32(FAILURE_BASE + sub_type);
                response.put_cstring(&message);
            }
            Reply::Unknown => {
                warn!(channel = self.core.id(), sub_type, "unknown stream request");
                response.put_u32(UNKNOWN_REQUEST);
                response.put_u32(sub_type);
            }
        }
        self.core.push_output(response.freeze());
    }

    fn answer(&self, sub_type: u32, mut args: Bytes) -> Reply {
        match sub_type {
            REQUEST_STATE => {
                let caps = self.caps;
                Reply::Done(Bytes::copy_from_slice(&[
                    u8::from(caps.can_read),
                    u8::from(caps.can_write),
                    u8::from(caps.can_seek),
                    u8::from(caps.can_timeout),
                ]))
            }
            REQUEST_READ => {
                let (count, timeout_ms) = match (args.take_i32(), args.take_i32()) {
                    (Ok(count), Ok(timeout)) => (count, timeout),
                    _ => return Reply::Failed("malformed READ request".into()),
                };
                let Ok(count) = u64::try_from(count) else {
                    return Reply::Failed(format!("invalid read count {count}"));
                };
                if !self.caps.can_read {
                    return Reply::Failed("stream is not readable".into());
                }
                // One response never holds more than the buffer limit.
                let count = count.min(self.config.buffer_limit.max(1) as u64);
                debug!(channel = self.core.id(), count, timeout_ms, "on-demand read");
                self.with_stream(|stream| {
                    let mut data = Vec::new();
                    Read::take(stream, count).read_to_end(&mut data)?;
                    let mut fields = BytesMut::with_capacity(4 + data.len());
                    fields.put_u32(data.len() as u32);
                    fields.put_slice(&data);
                    Ok(fields.freeze())
                })
            }
            REQUEST_FLUSH => match &self.mode {
                Mode::OnDemand { .. } => self.with_stream(|stream| {
                    stream.flush()?;
                    Ok(Bytes::new())
                }),
                Mode::Passthrough { sink, .. } => {
                    let result = lock(sink).as_mut().map_or(Ok(()), |sink| sink.flush());
                    match result {
                        Ok(()) => Reply::Done(Bytes::new()),
                        Err(err) => Reply::Failed(err.to_string()),
                    }
                }
            },
            REQUEST_CLOSE => {
                self.core.request_close();
                Reply::Done(Bytes::new())
            }
            REQUEST_POSITION => self.with_seekable(|stream| {
                let position = stream.stream_position()?;
                Ok(Bytes::copy_from_slice(&position.to_be_bytes()))
            }),
            REQUEST_LENGTH => self.with_seekable(|stream| {
                let position = stream.stream_position()?;
                let length = stream.seek(SeekFrom::End(0))?;
                stream.seek(SeekFrom::Start(position))?;
                Ok(Bytes::copy_from_slice(&length.to_be_bytes()))
            }),
            REQUEST_READ_TIMEOUT | REQUEST_WRITE_TIMEOUT => {
                let Ok(ms) = args.take_i32() else {
                    return Reply::Failed("malformed timeout request".into());
                };
                if !self.caps.can_timeout {
                    return Reply::Failed("stream does not support timeouts".into());
                }
                let mut timeouts = lock(&self.timeouts);
                if sub_type == REQUEST_READ_TIMEOUT {
                    timeouts.0 = ms;
                } else {
                    timeouts.1 = ms;
                }
                Reply::Done(Bytes::copy_from_slice(&ms.to_be_bytes()))
            }
            REQUEST_SEEK => {
                let (offset, origin) = match (args.take_i32(), args.take_i32()) {
                    (Ok(offset), Ok(origin)) => (offset, origin),
                    _ => return Reply::Failed("malformed SEEK request".into()),
                };
                let target = match origin {
                    0 => match u64::try_from(offset) {
                        Ok(offset) => SeekFrom::Start(offset),
                        Err(_) => return Reply::Failed(format!("invalid offset {offset}")),
                    },
                    1 => SeekFrom::Current(i64::from(offset)),
                    2 => SeekFrom::End(i64::from(offset)),
                    other => return Reply::Failed(format!("invalid seek origin {other}")),
                };
                self.with_seekable(|stream| {
                    let position = stream.seek(target)?;
                    Ok(Bytes::copy_from_slice(&position.to_be_bytes()))
                })
            }
            REQUEST_WRITE => {
                if !self.caps.can_write {
                    return Reply::Failed("stream is not writable".into());
                }
                let data = args.take_rest();
                self.with_stream(|stream| {
                    stream.write_all(&data)?;
                    Ok(Bytes::copy_from_slice(&(data.len() as u32).to_be_bytes()))
                })
            }
            _ => Reply::Unknown,
        }
    }

    fn with_stream<F>(&self, op: F) -> Reply
    where
        F: FnOnce(&mut dyn RawStream) -> std::io::Result<Bytes>,
    {
        let Mode::OnDemand { stream } = &self.mode else {
            return Reply::Failed("not available on a passthrough stream".into());
        };
        let mut guard = lock(stream);
        let Some(stream) = guard.as_mut() else {
            return Reply::Failed("stream is closed".into());
        };
        match op(stream.as_mut()) {
            Ok(fields) => Reply::Done(fields),
            Err(err) => Reply::Failed(err.to_string()),
        }
    }

    fn with_seekable<F>(&self, op: F) -> Reply
    where
        F: FnOnce(&mut dyn RawStream) -> std::io::Result<Bytes>,
    {
        if !self.caps.can_seek {
            return Reply::Failed("stream is not seekable".into());
        }
        self.with_stream(op)
    }
}

impl Channel for StreamChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn enqueue_input(&self, mut data: Bytes) {
        let marker = match data.take_u8() {
            Ok(marker) => marker,
            Err(_) => {
                warn!(channel = self.core.id(), "empty stream channel message");
                return;
            }
        };
        match marker {
            DATA_MARKER => self.write_data(&data),
            CONTROL_MARKER => self.handle_request(data),
            other => warn!(channel = self.core.id(), marker = other, "unknown stream marker"),
        }
    }

    fn dequeue_output(&self) -> Option<Bytes> {
        let chunk = self.core.pop_output();
        if let Mode::Passthrough { gate, .. } = &self.mode {
            if self.core.output_bytes() < self.config.buffer_limit {
                gate.set();
            }
        }
        chunk
    }

    fn on_close(&self) {
        match &self.mode {
            Mode::OnDemand { stream } => {
                if let Some(mut stream) = lock(stream).take() {
                    let _ = stream.flush();
                }
            }
            Mode::Passthrough {
                sink,
                gate,
                stop,
                reader,
            } => {
                stop.store(true, Ordering::SeqCst);
                gate.set();
                if let Some(mut sink) = lock(sink).take() {
                    let _ = sink.flush();
                }
                if let Some(handle) = lock(reader).take() {
                    if handle.is_finished() {
                        let _ = handle.join();
                    }
                }
            }
        }
        debug!(channel = self.core.id(), "stream channel closed");
    }
}

fn pump(
    core: Arc<ChannelCore>,
    mut source: Box<dyn Read + Send>,
    gate: Arc<Signal>,
    stop: Arc<AtomicBool>,
    config: StreamConfig,
) {
    let mut buf = vec![0u8; config.read_size.max(1)];
    loop {
        while !gate.wait_timeout(GATE_POLL) {
            if stop.load(Ordering::SeqCst) {
                return;
            }
        }
        if stop.load(Ordering::SeqCst) {
            return;
        }

        match source.read(&mut buf) {
            Ok(0) => {
                debug!(channel = core.id(), "stream source reached EOF");
                core.request_close();
                return;
            }
            Ok(n) => {
                let mut chunk = BytesMut::with_capacity(n + 1);
                chunk.put_u8(DATA_MARKER);
                chunk.put_slice(&buf[..n]);
                core.push_output(chunk.freeze());
                close_gate_if_full(&core, &gate, config.buffer_limit);
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(channel = core.id(), error = %err, "stream source read failed");
                core.request_close();
                return;
            }
        }
    }
}

/// Close `gate` while at least `limit` bytes are queued. A dequeue racing
/// with the reset is caught by the second check.
fn close_gate_if_full(core: &ChannelCore, gate: &Signal, limit: usize) {
    if core.output_bytes() >= limit {
        gate.reset();
        if core.output_bytes() < limit {
            gate.set();
        }
    }
}

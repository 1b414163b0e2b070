//! Reliable, ordered stream transport over fixed-size device records.
//!
//! Both endpoints run three loops once connected: a reader that validates
//! and reassembles incoming records, a writer that fragments queued streams
//! into records (or emits idle keepalives), and a watcher that reports
//! liveness loss to registered callbacks.
//!
//! The two roles are asymmetric. The initiator only acknowledges: each of
//! its records carries the last sequence number it accepted, or a RESEND
//! request for the one after it. The responder sequences its records and
//! keeps them in a 32-slot ring until they are acknowledged, replaying
//! from the requested sequence on RESEND.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FrameError, Result};
use crate::handshake::{handshake_initiator, handshake_responder, HandshakeConfig, HandshakeResult};
use crate::reader::{is_timeout, ReportReader};
use crate::report::{next_seq, seq_distance, Record, PAYLOAD_MAX, SEQ_MODULO};
use crate::sync::{lock, Signal};
use crate::writer::ReportWriter;

/// Default liveness timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default ceiling for queued-but-unsent output.
pub const DEFAULT_MAX_OUT_QUEUE_BYTES: usize = 30_000;

/// Largest usable responder window; one slot of the ring stays free so a
/// full window is distinguishable from an empty one.
pub const MAX_WINDOW: u8 = SEQ_MODULO - 2;

const STOP_POLL: Duration = Duration::from_millis(100);
const RESEND_HOLDOFF: Duration = Duration::from_millis(100);

/// Sequence state before the handshake completes.
const UNCONNECTED_SEQ: u8 = 12;

/// Which side of the handshake this endpoint plays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkRole {
    /// Agent side: acknowledges, never sequences.
    #[default]
    Initiator,
    /// Controller side: sequences and retransmits.
    Responder,
}

/// Link layer tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub role: LinkRole,
    /// Liveness timeout; the watcher ticks at half this interval.
    #[serde(with = "crate::millis")]
    pub timeout: Duration,
    /// Blocking pushes wait while queued output is at or above this size.
    pub max_out_queue_bytes: usize,
    /// Pause after writing an idle keepalive.
    #[serde(with = "crate::millis")]
    pub idle_interval: Duration,
    /// Responder only: maximum unacknowledged records (1..=30).
    pub window: u8,
    pub handshake: HandshakeConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            role: LinkRole::Initiator,
            timeout: DEFAULT_TIMEOUT,
            max_out_queue_bytes: DEFAULT_MAX_OUT_QUEUE_BYTES,
            idle_interval: Duration::from_millis(1),
            window: 16,
            handshake: HandshakeConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Default configuration for the responding side.
    pub fn responder() -> Self {
        Self {
            role: LinkRole::Responder,
            ..Self::default()
        }
    }
}

/// Callback invoked with the time since the last received record.
pub type TimeoutCallback = Box<dyn Fn(Duration) + Send + Sync + 'static>;

struct RxState {
    last_valid: u8,
    invalid: bool,
    partial: BytesMut,
}

struct TxState {
    /// Remainder of the stream being fragmented.
    current: Bytes,
    next_seq: u8,
    acked: u8,
    ring: Vec<Option<Record>>,
    replay: Option<u8>,
    rewound: Option<(u8, Instant)>,
}

impl TxState {
    fn new() -> Self {
        let mut state = Self {
            current: Bytes::new(),
            next_seq: 0,
            acked: 0,
            ring: vec![None; usize::from(SEQ_MODULO)],
            replay: None,
            rewound: None,
        };
        state.reset_sequence(UNCONNECTED_SEQ);
        state
    }

    fn reset_sequence(&mut self, initial: u8) {
        self.acked = initial;
        self.next_seq = next_seq(initial);
        self.ring.iter_mut().for_each(|slot| *slot = None);
        self.replay = None;
        self.rewound = None;
    }

    fn unacked(&self) -> u8 {
        seq_distance(self.acked, self.next_seq).saturating_sub(1)
    }

    fn in_flight(&self, seq: u8) -> bool {
        let distance = seq_distance(self.acked, seq);
        distance >= 1 && distance <= self.unacked()
    }

    fn acknowledge(&mut self, ack: u8, resend: bool, now: Instant) {
        if resend {
            // Everything before `ack` arrived; `ack` itself must be sent again.
            if self.in_flight(ack) {
                self.acked = (ack + SEQ_MODULO - 1) % SEQ_MODULO;
                let repeated = matches!(
                    self.rewound,
                    Some((seq, at)) if seq == ack && now.duration_since(at) < RESEND_HOLDOFF
                );
                if !repeated {
                    debug!(from = ack, "replaying records on resend request");
                    self.replay = Some(ack);
                    self.rewound = Some((ack, now));
                }
            }
        } else if self.in_flight(ack) {
            self.acked = ack;
            self.rewound = None;
        }

        if let Some(replay) = self.replay {
            if !self.in_flight(replay) {
                let resume = next_seq(self.acked);
                self.replay = self.in_flight(resume).then_some(resume);
            }
        }
    }

    fn take_replay(&mut self) -> Option<Record> {
        let seq = self.replay?;
        let following = next_seq(seq);
        self.replay = (following != self.next_seq).then_some(following);
        self.ring[usize::from(seq)].clone()
    }

    fn record_sent(&mut self, record: &Record) {
        self.ring[usize::from(record.seq)] = Some(record.clone());
        self.next_seq = next_seq(record.seq);
    }
}

/// The link layer for one endpoint.
///
/// Shared between the worker threads and its owner through `Arc`.
pub struct LinkLayer {
    config: LinkConfig,
    rx: Mutex<RxState>,
    tx: Mutex<TxState>,
    input: Mutex<VecDeque<Bytes>>,
    stream_received: Signal,
    output: Mutex<VecDeque<Bytes>>,
    /// Queued output bytes; own lock so producers never contend on the queue.
    out_bytes: Mutex<usize>,
    out_limit_open: Signal,
    last_record: Mutex<Instant>,
    callbacks: Mutex<Vec<TimeoutCallback>>,
    connected: AtomicBool,
    shutdown: AtomicBool,
    shutdown_signal: Signal,
    workers: Mutex<Vec<JoinHandle<()>>>,
    reader_worker: Mutex<Option<JoinHandle<()>>>,
}

impl LinkLayer {
    pub fn new(mut config: LinkConfig) -> Self {
        config.window = config.window.clamp(1, MAX_WINDOW);
        Self {
            config,
            rx: Mutex::new(RxState {
                last_valid: UNCONNECTED_SEQ,
                invalid: true,
                partial: BytesMut::new(),
            }),
            tx: Mutex::new(TxState::new()),
            input: Mutex::new(VecDeque::new()),
            stream_received: Signal::auto(),
            output: Mutex::new(VecDeque::new()),
            out_bytes: Mutex::new(0),
            out_limit_open: Signal::manual(true),
            last_record: Mutex::new(Instant::now()),
            callbacks: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            shutdown_signal: Signal::manual(false),
            workers: Mutex::new(Vec::new()),
            reader_worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn role(&self) -> LinkRole {
        self.config.role
    }

    /// Perform the initiator handshake on a device that is not yet started.
    pub fn connect<R: Read, W: Write>(
        &self,
        reader: &mut ReportReader<R>,
        writer: &mut ReportWriter<W>,
    ) -> Result<HandshakeResult> {
        let result = handshake_initiator(reader, writer, &self.config.handshake)?;
        self.set_connected(result.peer_seq);
        Ok(result)
    }

    /// Perform the responder handshake on a device that is not yet started.
    pub fn accept<R: Read, W: Write>(
        &self,
        reader: &mut ReportReader<R>,
        writer: &mut ReportWriter<W>,
    ) -> Result<HandshakeResult> {
        let result = handshake_responder(reader, writer, &self.config.handshake)?;
        self.set_connected(result.peer_seq);
        Ok(result)
    }

    /// Adopt `seq` as the handshake outcome.
    ///
    /// For the initiator it is the last valid sequence received; for the
    /// responder, the sequence before its first data record.
    pub fn set_connected(&self, seq: u8) {
        let seq = seq % SEQ_MODULO;
        {
            let mut rx = lock(&self.rx);
            rx.last_valid = seq;
            rx.invalid = false;
            rx.partial.clear();
        }
        lock(&self.tx).reset_sequence(seq);
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Spawn the reader, writer and timeout watcher.
    pub fn start<R, W>(self: &Arc<Self>, reader: ReportReader<R>, writer: ReportWriter<W>) -> Result<()>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        if !self.is_connected() {
            return Err(FrameError::NotConnected);
        }
        if self.is_stopped() {
            return Err(FrameError::Stopped);
        }
        self.touch();

        let link = Arc::clone(self);
        let reader_handle = thread::Builder::new()
            .name("hidmux-link-reader".into())
            .spawn(move || link.reader_loop(reader))?;
        *lock(&self.reader_worker) = Some(reader_handle);

        let link = Arc::clone(self);
        let writer_handle = thread::Builder::new()
            .name("hidmux-link-writer".into())
            .spawn(move || link.writer_loop(writer))?;

        let link = Arc::clone(self);
        let watcher_handle = thread::Builder::new()
            .name("hidmux-link-watcher".into())
            .spawn(move || link.watcher_loop())?;

        lock(&self.workers).extend([writer_handle, watcher_handle]);
        info!(role = ?self.config.role, "link started");
        Ok(())
    }

    /// Stop the worker loops.
    ///
    /// Joins the writer and the watcher. The reader is joined only if it has
    /// already returned; one parked in a device read is left detached and
    /// exits on its next record or EOF.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_signal.set();
        self.stream_received.set();
        self.out_limit_open.set();

        let current = thread::current().id();
        let workers = std::mem::take(&mut *lock(&self.workers));
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("link worker panicked");
            }
        }

        if let Some(handle) = lock(&self.reader_worker).take() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                debug!("link reader still blocked on the device, detaching");
            }
        }
        info!("link stopped");
    }

    /// Register a liveness-loss callback.
    ///
    /// Callbacks run on the watcher thread and must not call back into
    /// [`LinkLayer::register_timeout_callback`].
    pub fn register_timeout_callback<F>(&self, callback: F)
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        lock(&self.callbacks).push(Box::new(callback));
    }

    /// Queue a stream for sending.
    ///
    /// With `blocking`, waits while queued output is at or above
    /// `max_out_queue_bytes`. Fails once the link is stopped.
    pub fn push_output_stream(&self, stream: Bytes, blocking: bool) -> Result<()> {
        if blocking {
            loop {
                if self.is_stopped() {
                    return Err(FrameError::Stopped);
                }
                if self.out_limit_open.wait_timeout(STOP_POLL) && !self.is_stopped() {
                    break;
                }
            }
        } else if self.is_stopped() {
            return Err(FrameError::Stopped);
        }

        if stream.is_empty() {
            debug!("dropping empty output stream");
            return Ok(());
        }

        {
            let mut queued = lock(&self.out_bytes);
            *queued += stream.len();
            if *queued >= self.config.max_out_queue_bytes {
                self.out_limit_open.reset();
            }
        }
        lock(&self.output).push_back(stream);
        Ok(())
    }

    pub fn push_output_stream_no_block(&self, stream: Bytes) -> Result<()> {
        self.push_output_stream(stream, false)
    }

    /// Dequeue the next stream waiting to be fragmented.
    pub fn pop_output_stream(&self) -> Option<Bytes> {
        let stream = lock(&self.output).pop_front()?;
        let mut queued = lock(&self.out_bytes);
        *queued = queued.saturating_sub(stream.len());
        if *queued < self.config.max_out_queue_bytes {
            self.out_limit_open.set();
        }
        Some(stream)
    }

    pub fn pop_pending_input_stream(&self) -> Option<Bytes> {
        lock(&self.input).pop_front()
    }

    /// Wait until at least one reassembled stream is pending.
    ///
    /// `None` waits until input arrives or the link stops. Returns true if
    /// input is pending.
    pub fn wait_for_input_stream(&self, timeout: Option<Duration>) -> bool {
        let started = Instant::now();
        loop {
            if self.pending_input_stream_count() > 0 {
                return true;
            }
            if self.is_stopped() {
                return false;
            }
            let slice = match timeout {
                Some(timeout) => {
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        return false;
                    }
                    (timeout - elapsed).min(STOP_POLL)
                }
                None => STOP_POLL,
            };
            self.stream_received.wait_timeout(slice);
        }
    }

    pub fn pending_input_stream_count(&self) -> usize {
        lock(&self.input).len()
    }

    pub fn pending_output_stream_count(&self) -> usize {
        lock(&self.output).len()
    }

    pub fn output_queue_byte_size(&self) -> usize {
        *lock(&self.out_bytes)
    }

    /// Wait until all queued output has been handed to the device.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn flush(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            let drained =
                self.pending_output_stream_count() == 0 && lock(&self.tx).current.is_empty();
            if drained {
                return true;
            }
            if self.is_stopped() || started.elapsed() >= timeout {
                return false;
            }
            thread::sleep(self.config.idle_interval.max(Duration::from_millis(1)));
        }
    }

    /// Process one received record (one reader-loop step).
    pub fn receive_record(&self, record: &Record) {
        if record.connect {
            debug!(seq = record.seq, "ignoring handshake record on connected link");
            return;
        }

        match self.config.role {
            LinkRole::Initiator => self.accept_sequenced(record),
            LinkRole::Responder => {
                lock(&self.tx).acknowledge(record.seq, record.resend, Instant::now());
                self.append_payload(&mut lock(&self.rx), record);
            }
        }
    }

    /// Produce the next record to write (one writer-loop step).
    ///
    /// The responder returns `None` while its window is full.
    pub fn next_record(&self) -> Option<Record> {
        match self.config.role {
            LinkRole::Initiator => Some(self.next_acknowledging_record()),
            LinkRole::Responder => self.next_sequenced_record(),
        }
    }

    fn accept_sequenced(&self, record: &Record) {
        let mut rx = lock(&self.rx);
        let expected = next_seq(rx.last_valid);
        if record.seq != expected {
            if !rx.invalid {
                debug!(expected, received = record.seq, "out-of-order record");
            }
            rx.invalid = true;
            return;
        }

        self.append_payload(&mut rx, record);
        rx.last_valid = expected;
        rx.invalid = false;
    }

    fn append_payload(&self, rx: &mut RxState, record: &Record) {
        if record.payload.is_empty() {
            return;
        }
        rx.partial.extend_from_slice(&record.payload);
        if record.fin {
            let stream = rx.partial.split().freeze();
            lock(&self.input).push_back(stream);
            self.stream_received.set();
        }
    }

    fn next_fragment(&self, tx: &mut TxState) -> (Bytes, bool) {
        if tx.current.is_empty() {
            if let Some(stream) = self.pop_output_stream() {
                tx.current = stream;
            }
        }
        let take = tx.current.len().min(PAYLOAD_MAX);
        let payload = tx.current.split_to(take);
        (payload, tx.current.is_empty())
    }

    fn next_acknowledging_record(&self) -> Record {
        let (payload, fin) = self.next_fragment(&mut lock(&self.tx));
        let rx = lock(&self.rx);
        let (ack, resend) = if rx.invalid {
            (next_seq(rx.last_valid), true)
        } else {
            (rx.last_valid, false)
        };
        Record {
            seq: ack,
            fin,
            resend,
            connect: false,
            payload,
        }
    }

    fn next_sequenced_record(&self) -> Option<Record> {
        let mut tx = lock(&self.tx);
        if let Some(record) = tx.take_replay() {
            return Some(record);
        }
        if tx.unacked() >= self.config.window {
            return None;
        }
        let (payload, fin) = self.next_fragment(&mut tx);
        let record = Record::data(tx.next_seq, payload, fin);
        tx.record_sent(&record);
        Some(record)
    }

    fn touch(&self) {
        *lock(&self.last_record) = Instant::now();
    }

    fn reader_loop<R: Read>(self: Arc<Self>, mut reader: ReportReader<R>) {
        while !self.is_stopped() {
            match reader.read_record() {
                Ok(record) => {
                    self.touch();
                    self.receive_record(&record);
                }
                Err(err) if is_timeout(&err) => continue,
                Err(FrameError::InvalidLength(len)) => {
                    self.touch();
                    warn!(len, "dropping malformed record");
                    lock(&self.rx).invalid = true;
                }
                Err(FrameError::ConnectionClosed) => {
                    info!("device closed, link reader exiting");
                    break;
                }
                Err(err) => {
                    if !self.is_stopped() {
                        warn!(error = %err, "device read failed, link reader exiting");
                    }
                    break;
                }
            }
        }
    }

    fn writer_loop<W: Write>(self: Arc<Self>, mut writer: ReportWriter<W>) {
        while !self.is_stopped() {
            let Some(record) = self.next_record() else {
                thread::sleep(self.config.idle_interval);
                continue;
            };
            if let Err(err) = writer.write_record(&record) {
                if !self.is_stopped() {
                    warn!(error = %err, "device write failed, link writer exiting");
                }
                break;
            }
            if record.payload.is_empty() {
                thread::sleep(self.config.idle_interval);
            }
        }
    }

    fn watcher_loop(self: Arc<Self>) {
        let tick = self.config.timeout / 2;
        loop {
            if self.shutdown_signal.wait_timeout(tick) || self.is_stopped() {
                break;
            }
            let elapsed = lock(&self.last_record).elapsed();
            if elapsed > self.config.timeout {
                warn!(?elapsed, "link timeout");
                for callback in lock(&self.callbacks).iter() {
                    callback(elapsed);
                }
            }
        }
    }
}

impl std::fmt::Debug for LinkLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkLayer")
            .field("role", &self.config.role)
            .field("connected", &self.is_connected())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

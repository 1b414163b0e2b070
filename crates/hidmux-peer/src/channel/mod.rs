//! Logical channels multiplexed over one link.
//!
//! Every channel shares the bookkeeping in [`ChannelCore`]: an ID, a
//! direction, an encoding hint, the linked/close flags and up to two FIFO
//! queues. Variants override the queue operations where they move bytes
//! to or from a local resource instead.

pub mod file;
pub mod process;
pub mod stream;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use hidmux_frame::{lock, Signal};
use serde::{Deserialize, Serialize};

pub use file::{FileAccessMode, FileChannel, FileChannelConfig};
pub use process::{ExitNotifier, ProcessChannel, ProcessChannelConfig};
pub use stream::{StreamCaps, StreamChannel, StreamConfig};

/// Which way data flows on a channel, seen from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Peer to local only.
    In,
    /// Local to peer only.
    Out,
    Bidirectional,
}

impl Direction {
    pub fn accepts_input(self) -> bool {
        self != Direction::Out
    }

    pub fn produces_output(self) -> bool {
        self != Direction::In
    }

    /// The same channel as seen from the other end.
    pub fn reversed(self) -> Self {
        match self {
            Direction::In => Direction::Out,
            Direction::Out => Direction::In,
            Direction::Bidirectional => Direction::Bidirectional,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Direction::In => 0,
            Direction::Out => 1,
            Direction::Bidirectional => 2,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Direction::In),
            1 => Some(Direction::Out),
            2 => Some(Direction::Bidirectional),
            _ => None,
        }
    }
}

/// How the peer should interpret channel payloads. Opaque to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Utf8,
    ByteArray,
}

impl Encoding {
    pub fn to_wire(self) -> u8 {
        match self {
            Encoding::Utf8 => 0,
            Encoding::ByteArray => 1,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Encoding::Utf8),
            1 => Some(Encoding::ByteArray),
            _ => None,
        }
    }
}

/// Channel ID allocator and output-dirty signal shared by one stack.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    next_id: Arc<AtomicU32>,
    dirty: Arc<Signal>,
}

impl ChannelContext {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU32::new(0)),
            dirty: Arc::new(Signal::auto()),
        }
    }

    /// Next unused channel ID. IDs are never handed out twice.
    pub fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Raised whenever some channel may have output to send.
    pub fn dirty_signal(&self) -> &Arc<Signal> {
        &self.dirty
    }

    pub fn mark_dirty(&self) {
        self.dirty.set();
    }
}

impl Default for ChannelContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct OutputQueue {
    chunks: VecDeque<Bytes>,
    bytes: usize,
}

/// State shared by all channel variants.
#[derive(Debug)]
pub struct ChannelCore {
    id: u32,
    direction: Direction,
    encoding: Encoding,
    linked: AtomicBool,
    should_close: AtomicBool,
    input: Mutex<VecDeque<Bytes>>,
    output: Mutex<OutputQueue>,
    dirty: Arc<Signal>,
}

impl ChannelCore {
    /// Allocate an ID from `context` and create empty queues.
    pub fn new(context: &ChannelContext, direction: Direction, encoding: Encoding) -> Self {
        Self::with_id(context, context.allocate_id(), direction, encoding)
    }

    /// Create a core for an ID assigned by the peer.
    ///
    /// Used for the local side of channels the peer announced; the ID
    /// does not come from `context`.
    pub fn with_id(
        context: &ChannelContext,
        id: u32,
        direction: Direction,
        encoding: Encoding,
    ) -> Self {
        Self {
            id,
            direction,
            encoding,
            linked: AtomicBool::new(false),
            should_close: AtomicBool::new(false),
            input: Mutex::new(VecDeque::new()),
            output: Mutex::new(OutputQueue::default()),
            dirty: Arc::clone(context.dirty_signal()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn push_input(&self, data: Bytes) {
        lock(&self.input).push_back(data);
    }

    pub fn pop_input(&self) -> Option<Bytes> {
        lock(&self.input).pop_front()
    }

    pub fn input_len(&self) -> usize {
        lock(&self.input).len()
    }

    /// Queue one output chunk and raise the dirty signal.
    pub fn push_output(&self, data: Bytes) {
        {
            let mut output = lock(&self.output);
            output.bytes += data.len();
            output.chunks.push_back(data);
        }
        self.mark_dirty();
    }

    /// Append `data` so that every queued chunk but the last is exactly
    /// `chunk_size` bytes long.
    pub fn push_output_rechunked(&self, data: &[u8], chunk_size: usize) {
        if data.is_empty() {
            return;
        }
        let chunk_size = chunk_size.max(1);
        {
            let mut output = lock(&self.output);
            let mut pending = BytesMut::new();
            let short_tail = output
                .chunks
                .back()
                .is_some_and(|last| last.len() < chunk_size);
            if short_tail {
                if let Some(last) = output.chunks.pop_back() {
                    output.bytes -= last.len();
                    pending.extend_from_slice(&last);
                }
            }
            pending.extend_from_slice(data);

            while !pending.is_empty() {
                let take = pending.len().min(chunk_size);
                let chunk = pending.split_to(take).freeze();
                output.bytes += chunk.len();
                output.chunks.push_back(chunk);
            }
        }
        self.mark_dirty();
    }

    pub fn pop_output(&self) -> Option<Bytes> {
        let mut output = lock(&self.output);
        let chunk = output.chunks.pop_front()?;
        output.bytes -= chunk.len();
        Some(chunk)
    }

    pub fn output_len(&self) -> usize {
        lock(&self.output).chunks.len()
    }

    /// Bytes queued for output.
    pub fn output_bytes(&self) -> usize {
        lock(&self.output).bytes
    }

    pub fn set_linked(&self, linked: bool) {
        self.linked.store(linked, Ordering::SeqCst);
        if self.direction.produces_output() {
            self.mark_dirty();
        }
    }

    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::SeqCst)
    }

    pub fn request_close(&self) {
        self.should_close.store(true, Ordering::SeqCst);
        self.mark_dirty();
    }

    pub fn should_close(&self) -> bool {
        self.should_close.load(Ordering::SeqCst)
    }

    pub fn mark_dirty(&self) {
        self.dirty.set();
    }
}

/// A logical channel as seen by the transport and the engine.
///
/// Writing to an `In` channel or reading from an `Out` channel does
/// nothing.
pub trait Channel: Send + Sync {
    fn core(&self) -> &ChannelCore;

    fn id(&self) -> u32 {
        self.core().id()
    }

    fn direction(&self) -> Direction {
        self.core().direction()
    }

    fn encoding(&self) -> Encoding {
        self.core().encoding()
    }

    /// Take the next inbound chunk (application side).
    fn read(&self) -> Option<Bytes> {
        if !self.direction().accepts_input() {
            return None;
        }
        self.core().pop_input()
    }

    /// Queue outbound data (application side).
    fn write(&self, data: Bytes) {
        if !self.direction().produces_output() {
            return;
        }
        self.core().push_output(data);
    }

    /// Deliver a chunk received from the peer (transport side).
    fn enqueue_input(&self, data: Bytes) {
        if !self.direction().accepts_input() {
            return;
        }
        self.core().push_input(data);
    }

    /// Take the next chunk to send (transport side).
    fn dequeue_output(&self) -> Option<Bytes> {
        if !self.direction().produces_output() {
            return None;
        }
        self.core().pop_output()
    }

    fn has_pending_in_data(&self) -> bool {
        self.direction().accepts_input() && self.core().input_len() > 0
    }

    fn has_pending_out_data(&self) -> bool {
        self.direction().produces_output() && self.core().output_len() > 0
    }

    fn set_linked(&self, linked: bool) {
        self.core().set_linked(linked);
    }

    fn is_linked(&self) -> bool {
        self.core().is_linked()
    }

    fn request_close(&self) {
        self.core().request_close();
    }

    fn should_close(&self) -> bool {
        self.core().should_close()
    }

    /// Release local resources. Runs exactly once, after the channel has
    /// been removed from the transport.
    fn on_close(&self) {}
}

/// A channel backed only by its queues (control channel, generic channels).
#[derive(Debug)]
pub struct QueueChannel {
    core: ChannelCore,
}

impl QueueChannel {
    pub fn new(context: &ChannelContext, direction: Direction, encoding: Encoding) -> Self {
        Self {
            core: ChannelCore::new(context, direction, encoding),
        }
    }

    /// The local side of a channel announced by the peer.
    ///
    /// Direction is mirrored and the channel starts linked.
    pub fn mirror(
        context: &ChannelContext,
        id: u32,
        peer_direction: Direction,
        encoding: Encoding,
    ) -> Self {
        let core = ChannelCore::with_id(context, id, peer_direction.reversed(), encoding);
        core.set_linked(true);
        Self { core }
    }
}

impl Channel for QueueChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_takes_peer_id_and_reverses_direction() {
        let context = ChannelContext::new();
        let mirror = QueueChannel::mirror(&context, 7, Direction::Out, Encoding::Utf8);
        assert_eq!(mirror.id(), 7);
        assert_eq!(mirror.direction(), Direction::In);
        assert!(mirror.is_linked());
        assert_eq!(context.allocate_id(), 0);
        assert_eq!(Direction::Bidirectional.reversed(), Direction::Bidirectional);
    }

    #[test]
    fn ids_are_monotonic_per_context() {
        let context = ChannelContext::new();
        let a = QueueChannel::new(&context, Direction::Bidirectional, Encoding::ByteArray);
        let b = QueueChannel::new(&context, Direction::In, Encoding::Utf8);
        assert_eq!((a.id(), b.id()), (0, 1));

        let other = ChannelContext::new();
        assert_eq!(other.allocate_id(), 0);
        assert_eq!(context.allocate_id(), 2);
    }

    #[test]
    fn in_channel_ignores_writes_and_out_channel_ignores_reads() {
        let context = ChannelContext::new();
        let inbound = QueueChannel::new(&context, Direction::In, Encoding::ByteArray);
        inbound.write(Bytes::from_static(b"dropped"));
        assert!(!inbound.has_pending_out_data());
        assert!(inbound.dequeue_output().is_none());
        inbound.enqueue_input(Bytes::from_static(b"kept"));
        assert_eq!(inbound.read().unwrap().as_ref(), b"kept");

        let outbound = QueueChannel::new(&context, Direction::Out, Encoding::ByteArray);
        outbound.enqueue_input(Bytes::from_static(b"dropped"));
        assert!(!outbound.has_pending_in_data());
        assert!(outbound.read().is_none());
        outbound.write(Bytes::from_static(b"sent"));
        assert_eq!(outbound.dequeue_output().unwrap().as_ref(), b"sent");
    }

    #[test]
    fn write_link_and_close_raise_dirty() {
        let context = ChannelContext::new();
        let channel = QueueChannel::new(&context, Direction::Out, Encoding::Utf8);
        let dirty = context.dirty_signal();

        dirty.reset();
        channel.write(Bytes::from_static(b"x"));
        assert!(dirty.is_set());

        dirty.reset();
        channel.set_linked(true);
        assert!(dirty.is_set());
        assert!(channel.is_linked());

        dirty.reset();
        channel.request_close();
        assert!(dirty.is_set());
        assert!(channel.should_close());
    }

    #[test]
    fn rechunking_fills_the_tail_first() {
        let context = ChannelContext::new();
        let core = ChannelCore::new(&context, Direction::Out, Encoding::ByteArray);
        core.push_output_rechunked(&[1; 6], 4);
        core.push_output_rechunked(&[2; 5], 4);
        assert_eq!(core.output_bytes(), 11);

        let sizes: Vec<usize> = std::iter::from_fn(|| core.pop_output())
            .map(|chunk| chunk.len())
            .collect();
        assert_eq!(sizes, vec![4, 4, 3]);
        assert_eq!(core.output_bytes(), 0);
    }

    #[test]
    fn wire_values_round_trip() {
        for direction in [Direction::In, Direction::Out, Direction::Bidirectional] {
            assert_eq!(Direction::from_wire(direction.to_wire()), Some(direction));
        }
        assert_eq!(Encoding::from_wire(1), Some(Encoding::ByteArray));
        assert_eq!(Direction::from_wire(9), None);
    }
}

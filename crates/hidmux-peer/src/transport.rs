use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use hidmux_frame::{decode_frame, is_control, lock, Frame, LinkLayer, Signal, CONTROL};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelContext, Direction, Encoding, QueueChannel};
use crate::error::Result;

/// Transport worker tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Longest the output worker sleeps without a dirty signal.
    #[serde(with = "hidmux_frame::millis")]
    pub poll_interval: Duration,
    /// Longest one blocking input wait lasts.
    #[serde(with = "hidmux_frame::millis")]
    pub input_wait: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            input_wait: Duration::from_millis(100),
        }
    }
}

#[derive(Default)]
struct Registry {
    /// Channels that accept data from the peer.
    inbound: BTreeMap<u32, Arc<dyn Channel>>,
    /// Channels that produce data for the peer.
    outbound: BTreeMap<u32, Arc<dyn Channel>>,
}

/// Multiplexes channels over one link.
///
/// The registry is the only lock held while looking channels up; channel
/// operations themselves run after it has been released.
pub struct Transport {
    link: Arc<LinkLayer>,
    config: TransportConfig,
    context: ChannelContext,
    registry: Mutex<Registry>,
    control: Arc<dyn Channel>,
    work: Arc<Signal>,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
    /// Create a transport over `link` and register the control channel.
    pub fn new(link: Arc<LinkLayer>, config: TransportConfig) -> Self {
        let context = ChannelContext::new();
        let control: Arc<dyn Channel> = Arc::new(QueueChannel::new(
            &context,
            Direction::Bidirectional,
            Encoding::ByteArray,
        ));
        debug_assert_eq!(control.id(), CONTROL);

        let transport = Self {
            link,
            config,
            context,
            registry: Mutex::new(Registry::default()),
            control: Arc::clone(&control),
            work: Arc::new(Signal::auto()),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        };
        transport.add_channel(control);
        transport
    }

    pub fn link(&self) -> &Arc<LinkLayer> {
        &self.link
    }

    /// ID allocator and dirty signal for channels created outside the
    /// transport.
    pub fn channel_context(&self) -> &ChannelContext {
        &self.context
    }

    pub fn control_channel(&self) -> &Arc<dyn Channel> {
        &self.control
    }

    /// Raised whenever inbound data was routed.
    pub fn work_signal(&self) -> &Arc<Signal> {
        &self.work
    }

    pub fn add_channel(&self, channel: Arc<dyn Channel>) {
        let id = channel.id();
        let direction = channel.direction();
        {
            let mut registry = lock(&self.registry);
            if direction.accepts_input() {
                registry.inbound.insert(id, Arc::clone(&channel));
            }
            if direction.produces_output() {
                registry.outbound.insert(id, channel);
            }
        }
        info!(channel = id, ?direction, "channel registered");
    }

    /// Create and register a queue-backed channel.
    pub fn create_channel(&self, direction: Direction, encoding: Encoding) -> Arc<dyn Channel> {
        let channel: Arc<dyn Channel> =
            Arc::new(QueueChannel::new(&self.context, direction, encoding));
        self.add_channel(Arc::clone(&channel));
        channel
    }

    pub fn get_channel(&self, id: u32) -> Option<Arc<dyn Channel>> {
        let registry = lock(&self.registry);
        registry
            .inbound
            .get(&id)
            .or_else(|| registry.outbound.get(&id))
            .cloned()
    }

    pub fn channel_count(&self) -> usize {
        let registry = lock(&self.registry);
        registry
            .outbound
            .keys()
            .filter(|id| !registry.inbound.contains_key(id))
            .count()
            + registry.inbound.len()
    }

    /// Queue a control message.
    pub fn write_control(&self, data: Bytes) {
        self.control.write(data);
    }

    /// One fair output pass: at most one chunk per eligible channel.
    ///
    /// A channel is eligible if it is the control channel or linked.
    /// Control chunks never block; data chunks wait for link capacity.
    /// Returns the number of chunks handed to the link.
    pub fn process_out_single(&self) -> Result<usize> {
        let channels: Vec<Arc<dyn Channel>> =
            lock(&self.registry).outbound.values().cloned().collect();

        let mut sent = 0;
        let mut more = false;
        for channel in channels {
            let id = channel.id();
            let control = is_control(id);
            if !(control || channel.is_linked()) || !channel.has_pending_out_data() {
                continue;
            }
            if let Some(chunk) = channel.dequeue_output() {
                let stream = Frame::new(id, chunk).encode();
                self.link.push_output_stream(stream, !control)?;
                sent += 1;
            }
            more |= channel.has_pending_out_data();
        }

        if more {
            self.context.mark_dirty();
        }
        Ok(sent)
    }

    /// Route every completed inbound stream to its channel.
    ///
    /// With `block`, first waits up to `input_wait` for input. Returns the
    /// number of frames delivered.
    pub fn process_in_single(&self, block: bool) -> usize {
        if block {
            self.link.wait_for_input_stream(Some(self.config.input_wait));
        }

        let mut routed = 0;
        while let Some(stream) = self.link.pop_pending_input_stream() {
            let frame = match decode_frame(stream) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "dropping malformed transport frame");
                    continue;
                }
            };
            let channel = lock(&self.registry).inbound.get(&frame.channel).cloned();
            match channel {
                Some(channel) => {
                    channel.enqueue_input(frame.payload);
                    routed += 1;
                }
                None => warn!(channel = frame.channel, "dropping frame for unknown channel"),
            }
        }

        if routed > 0 {
            self.work.set();
        }
        routed
    }

    /// Remove channels that asked to close and have nothing left to send,
    /// run their cleanup, and return their IDs.
    pub fn sweep_closed(&self) -> Vec<u32> {
        let closed: Vec<Arc<dyn Channel>> = {
            let mut registry = lock(&self.registry);
            let mut candidates: BTreeMap<u32, Arc<dyn Channel>> = BTreeMap::new();
            for (id, channel) in registry.inbound.iter().chain(registry.outbound.iter()) {
                if !is_control(*id) && channel.should_close() && !channel.has_pending_out_data() {
                    candidates.insert(*id, Arc::clone(channel));
                }
            }
            for id in candidates.keys() {
                registry.inbound.remove(id);
                registry.outbound.remove(id);
            }
            candidates.into_values().collect()
        };

        closed
            .into_iter()
            .map(|channel| {
                channel.on_close();
                info!(channel = channel.id(), "channel closed");
                channel.id()
            })
            .collect()
    }

    /// Remove every channel except control and run its cleanup.
    pub fn close_all(&self) -> Vec<u32> {
        let all: BTreeMap<u32, Arc<dyn Channel>> = {
            let mut registry = lock(&self.registry);
            let mut all = std::mem::take(&mut registry.inbound);
            all.append(&mut registry.outbound);
            all.remove(&CONTROL);
            registry.inbound.insert(CONTROL, Arc::clone(&self.control));
            registry.outbound.insert(CONTROL, Arc::clone(&self.control));
            all
        };
        all.into_values()
            .map(|channel| {
                channel.on_close();
                channel.id()
            })
            .collect()
    }

    /// Spawn the input and output workers.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let transport = Arc::clone(self);
        let input = thread::Builder::new()
            .name("hidmux-transport-in".into())
            .spawn(move || transport.input_loop())?;

        let transport = Arc::clone(self);
        let output = thread::Builder::new()
            .name("hidmux-transport-out".into())
            .spawn(move || transport.output_loop())?;

        lock(&self.workers).extend([input, output]);
        debug!("transport workers started");
        Ok(())
    }

    /// Stop and join the workers.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.context.mark_dirty();
        let workers = std::mem::take(&mut *lock(&self.workers));
        for handle in workers {
            if handle.join().is_err() {
                warn!("transport worker panicked");
            }
        }
        debug!("transport workers stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn input_loop(self: Arc<Self>) {
        while !self.is_stopped() {
            if self.link.is_stopped() {
                thread::sleep(self.config.poll_interval);
                continue;
            }
            self.process_in_single(true);
        }
    }

    fn output_loop(self: Arc<Self>) {
        let dirty = Arc::clone(self.context.dirty_signal());
        while !self.is_stopped() {
            dirty.wait_timeout(self.config.poll_interval);
            if self.is_stopped() {
                break;
            }
            if let Err(err) = self.process_out_single() {
                if self.link.is_stopped() {
                    thread::sleep(self.config.poll_interval);
                } else {
                    warn!(error = %err, "output pass failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use hidmux_frame::{LinkConfig, WireRead};

    use super::*;

    fn transport() -> Transport {
        let link = Arc::new(LinkLayer::new(LinkConfig::default()));
        link.set_connected(0);
        Transport::new(link, TransportConfig::default())
    }

    fn sent_frames(transport: &Transport) -> Vec<(u32, Bytes)> {
        std::iter::from_fn(|| transport.link().pop_output_stream())
            .map(|stream| {
                let frame = decode_frame(stream).unwrap();
                (frame.channel, frame.payload)
            })
            .collect()
    }

    #[test]
    fn control_channel_is_first_and_always_eligible() {
        let transport = transport();
        assert_eq!(transport.control_channel().id(), CONTROL);
        assert!(!transport.control_channel().is_linked());

        transport.write_control(Bytes::from_static(b"hello"));
        assert_eq!(transport.process_out_single().unwrap(), 1);
        assert_eq!(
            sent_frames(&transport),
            vec![(CONTROL, Bytes::from_static(b"hello"))]
        );
    }

    #[test]
    fn unlinked_channels_hold_their_output() {
        let transport = transport();
        let channel = transport.create_channel(Direction::Out, Encoding::Utf8);
        channel.write(Bytes::from_static(b"later"));
        assert_eq!(transport.process_out_single().unwrap(), 0);

        channel.set_linked(true);
        assert_eq!(transport.process_out_single().unwrap(), 1);
        assert_eq!(
            sent_frames(&transport),
            vec![(channel.id(), Bytes::from_static(b"later"))]
        );
    }

    #[test]
    fn one_chunk_per_channel_per_pass() {
        let transport = transport();
        let a = transport.create_channel(Direction::Out, Encoding::ByteArray);
        let b = transport.create_channel(Direction::Bidirectional, Encoding::ByteArray);
        for channel in [&a, &b] {
            channel.set_linked(true);
            for i in 0..3u8 {
                channel.write(Bytes::copy_from_slice(&[i]));
            }
        }

        let dirty = transport.channel_context().dirty_signal();
        dirty.reset();
        assert_eq!(transport.process_out_single().unwrap(), 2);
        assert!(dirty.is_set(), "remaining output re-arms the dirty signal");

        let frames = sent_frames(&transport);
        assert_eq!(
            frames,
            vec![
                (a.id(), Bytes::from_static(&[0])),
                (b.id(), Bytes::from_static(&[0])),
            ]
        );

        transport.process_out_single().unwrap();
        transport.process_out_single().unwrap();
        dirty.reset();
        assert_eq!(transport.process_out_single().unwrap(), 0);
        assert!(!dirty.is_set());
    }

    #[test]
    fn inbound_frames_are_routed_by_id() {
        let transport = transport();
        let channel = transport.create_channel(Direction::In, Encoding::ByteArray);
        let link = Arc::clone(transport.link());

        // Feed streams as the link reader would.
        let mut seq = 0;
        for frame in [
            Frame::new(channel.id(), Bytes::from_static(b"data")),
            Frame::new(99, Bytes::from_static(b"lost")),
            Frame::new(CONTROL, Bytes::from_static(b"ctl")),
        ] {
            seq = hidmux_frame::next_seq(seq);
            link.receive_record(&hidmux_frame::Record::data(seq, frame.encode(), true));
        }
        seq = hidmux_frame::next_seq(seq);
        link.receive_record(&hidmux_frame::Record::data(seq, Bytes::from_static(&[0, 0]), true));

        assert_eq!(transport.process_in_single(false), 2);
        assert!(transport.work_signal().is_set());
        assert_eq!(channel.read().unwrap().as_ref(), b"data");
        let mut control = transport.control_channel().read().unwrap();
        assert_eq!(control.take_rest().as_ref(), b"ctl");
    }

    #[test]
    fn sweep_waits_for_pending_output_and_closes_once() {
        let transport = transport();
        let channel = transport.create_channel(Direction::Out, Encoding::ByteArray);
        channel.set_linked(true);
        channel.write(Bytes::from_static(b"last words"));
        channel.request_close();

        assert!(transport.sweep_closed().is_empty());
        transport.process_out_single().unwrap();
        assert_eq!(transport.sweep_closed(), vec![channel.id()]);
        assert!(transport.get_channel(channel.id()).is_none());
        assert!(transport.sweep_closed().is_empty());
    }

    #[test]
    fn close_all_keeps_control() {
        let transport = transport();
        let a = transport.create_channel(Direction::In, Encoding::Utf8);
        let b = transport.create_channel(Direction::Out, Encoding::Utf8);
        assert_eq!(transport.channel_count(), 3);
        assert_eq!(transport.close_all(), vec![a.id(), b.id()]);
        assert_eq!(transport.channel_count(), 1);
        assert!(transport.get_channel(CONTROL).is_some());
    }
}

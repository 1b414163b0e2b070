use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use hidmux_frame::lock;
use tracing::{debug, info, warn};

use crate::channel::{Channel, QueueChannel};
use crate::control::ControlMessage;
use crate::error::{PeerError, Result};
use crate::transport::Transport;

/// Longest single wait between inbox checks.
const WAIT_SLICE: Duration = Duration::from_millis(20);

#[derive(Default)]
struct Inbox {
    responses: HashMap<u32, std::result::Result<Bytes, String>>,
    events: VecDeque<ControlMessage>,
}

/// The commanding end of a link: issues method calls to an agent.
///
/// Channels the agent announces are mirrored locally with the same ID, so
/// their data can be read and written through [`Controller::channel`].
pub struct Controller {
    transport: Arc<Transport>,
    next_method_id: AtomicU32,
    inbox: Mutex<Inbox>,
}

impl Controller {
    /// Wrap a started transport over a responder link.
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport,
            next_method_id: AtomicU32::new(1),
            inbox: Mutex::new(Inbox::default()),
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Invoke `name` on the agent and wait for its response.
    ///
    /// An error response becomes [`PeerError::Remote`].
    pub fn call(&self, name: &str, args: Bytes, timeout: Duration) -> Result<Bytes> {
        let method_id = self.next_method_id.fetch_add(1, Ordering::SeqCst);
        debug!(method_id, name, args = args.len(), "calling remote method");
        self.send(ControlMessage::RunMethod {
            method_id,
            name: name.to_string(),
            args,
        });

        self.wait_for(timeout, |inbox| inbox.responses.remove(&method_id))?
            .map_err(PeerError::Remote)
    }

    /// Tell the agent that an announced channel may start sending.
    pub fn link_channel(&self, id: u32) {
        self.send(ControlMessage::ChannelLinked { id });
    }

    /// Ask the agent to close one of its channels.
    pub fn close_channel(&self, id: u32) {
        self.send(ControlMessage::CloseChannel { id });
    }

    /// The local mirror of an announced channel.
    pub fn channel(&self, id: u32) -> Option<Arc<dyn Channel>> {
        self.pump();
        self.transport.get_channel(id)
    }

    /// Ask the agent to shut down and wait for its answer, then stop the
    /// local stack.
    pub fn destroy(&self, timeout: Duration) -> Result<()> {
        self.send(ControlMessage::Destroy);
        let answered = self.wait_for(timeout, |inbox| {
            let position = inbox.events.iter().position(|event| {
                matches!(
                    event,
                    ControlMessage::DestroyResponse | ControlMessage::DestroyNotice
                )
            })?;
            inbox.events.remove(position)
        });
        self.stop();
        answered.map(|_| ())
    }

    /// The next agent notice that is not a method response.
    pub fn next_event(&self, timeout: Duration) -> Option<ControlMessage> {
        self.wait_for(timeout, |inbox| inbox.events.pop_front()).ok()
    }

    /// Stop the transport and link workers.
    pub fn stop(&self) {
        self.transport.stop();
        self.transport.link().stop();
        self.transport.close_all();
        info!("controller stopped");
    }

    fn send(&self, message: ControlMessage) {
        self.transport.write_control(message.encode());
    }

    fn wait_for<T>(
        &self,
        timeout: Duration,
        mut take: impl FnMut(&mut Inbox) -> Option<T>,
    ) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let wake = Arc::clone(self.transport.work_signal());
        loop {
            self.pump();
            if let Some(value) = take(&mut lock(&self.inbox)) {
                return Ok(value);
            }
            if self.transport.link().is_stopped() {
                return Err(PeerError::Disconnected("link stopped".into()));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PeerError::Timeout(timeout));
            }
            wake.wait_timeout(remaining.min(WAIT_SLICE));
        }
    }

    /// Sort inbound control messages into the inbox and keep channel
    /// mirrors in step with announcements.
    fn pump(&self) {
        let control = Arc::clone(self.transport.control_channel());
        while let Some(raw) = control.read() {
            let message = match ControlMessage::decode(raw) {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, "dropping malformed control message");
                    continue;
                }
            };
            match message {
                ControlMessage::MethodResponse { method_id, result } => {
                    lock(&self.inbox).responses.insert(method_id, result);
                    continue;
                }
                ControlMessage::ChannelAnnounce {
                    id,
                    direction,
                    encoding,
                } => {
                    let mirror = QueueChannel::mirror(
                        self.transport.channel_context(),
                        id,
                        direction,
                        encoding,
                    );
                    self.transport.add_channel(Arc::new(mirror));
                }
                ControlMessage::ChannelClosed { id } => {
                    if let Some(channel) = self.transport.get_channel(id) {
                        channel.request_close();
                    }
                }
                ControlMessage::StageReady => info!("agent ready"),
                _ => {}
            }
            lock(&self.inbox).events.push_back(message);
        }
        self.transport.sweep_closed();
    }
}

#[cfg(test)]
mod tests {
    use hidmux_frame::{LinkConfig, LinkLayer};

    use super::*;
    use crate::channel::{Direction, Encoding};
    use crate::transport::TransportConfig;

    fn controller() -> Controller {
        let link = Arc::new(LinkLayer::new(LinkConfig::responder()));
        link.set_connected(0);
        Controller::new(Arc::new(Transport::new(link, TransportConfig::default())))
    }

    fn receive(controller: &Controller, message: ControlMessage) {
        controller
            .transport()
            .control_channel()
            .enqueue_input(message.encode());
    }

    #[test]
    fn announcements_create_linked_mirrors() {
        let controller = controller();
        receive(
            &controller,
            ControlMessage::ChannelAnnounce {
                id: 4,
                direction: Direction::In,
                encoding: Encoding::Utf8,
            },
        );
        let mirror = controller.channel(4).unwrap();
        assert_eq!(mirror.direction(), Direction::Out);
        assert!(mirror.is_linked());
        assert!(matches!(
            controller.next_event(Duration::ZERO),
            Some(ControlMessage::ChannelAnnounce { id: 4, .. })
        ));

        receive(&controller, ControlMessage::ChannelClosed { id: 4 });
        assert!(controller.channel(4).is_none());
    }

    #[test]
    fn call_times_out_without_answer() {
        let controller = controller();
        let err = controller
            .call("echo", Bytes::new(), Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, PeerError::Timeout(_)));
    }

    #[test]
    fn responses_are_matched_by_method_id() {
        let controller = controller();
        // Answer for the first call the controller will make, plus a stray.
        receive(
            &controller,
            ControlMessage::MethodResponse {
                method_id: 77,
                result: Ok(Bytes::from_static(b"stray")),
            },
        );
        receive(
            &controller,
            ControlMessage::MethodResponse {
                method_id: 1,
                result: Err("Method 'x' not found!".into()),
            },
        );
        let err = controller
            .call("x", Bytes::new(), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, PeerError::Remote(message) if message.contains("'x'")));
        assert!(controller.next_event(Duration::ZERO).is_none());
    }
}

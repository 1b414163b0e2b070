//! The agent-side command engine.
//!
//! Reads control messages, runs remote methods, reports process exits and
//! closed channels, and tears the stack down on DESTROY or link loss.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hidmux_frame::{lock, Signal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::{FileChannelConfig, ProcessChannelConfig, StreamConfig};
use crate::control::ControlMessage;
use crate::handlers::builtin_methods;
use crate::method::{MethodContext, MethodTable, PendingCall};
use crate::process::ProcessTable;
use crate::transport::Transport;

/// Engine tuning, including the configuration of channels it creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Longest the main loop sleeps without a wake-up.
    #[serde(with = "hidmux_frame::millis")]
    pub poll_interval: Duration,
    /// Upper bound for delivering the final control messages.
    #[serde(with = "hidmux_frame::millis")]
    pub shutdown_flush_timeout: Duration,
    pub stream: StreamConfig,
    pub process: ProcessChannelConfig,
    pub file: FileChannelConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            shutdown_flush_timeout: Duration::from_secs(1),
            stream: StreamConfig::default(),
            process: ProcessChannelConfig::default(),
            file: FileChannelConfig::default(),
        }
    }
}

/// Why the engine stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The controller sent DESTROY.
    Destroyed,
    /// The link timed out.
    LinkLost,
    /// Stopped locally through an [`EngineHandle`].
    Local,
}

/// Shared shutdown request state.
///
/// Held by the link timeout callback and by handles, so neither keeps the
/// engine alive.
#[derive(Debug)]
struct Shutdown {
    reason: Mutex<Option<ShutdownReason>>,
    wake: Arc<Signal>,
}

impl Shutdown {
    /// The first request wins.
    fn request(&self, reason: ShutdownReason) {
        let mut current = lock(&self.reason);
        if current.is_none() {
            info!(?reason, "engine shutdown requested");
            *current = Some(reason);
        }
        drop(current);
        self.wake.set();
    }

    fn reason(&self) -> Option<ShutdownReason> {
        *lock(&self.reason)
    }
}

/// Stops a running engine from another thread.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    shutdown: Arc<Shutdown>,
}

impl EngineHandle {
    pub fn shutdown(&self) {
        self.shutdown.request(ShutdownReason::Local);
    }
}

/// Dispatches control messages for one transport.
pub struct Engine {
    transport: Arc<Transport>,
    methods: MethodTable,
    config: EngineConfig,
    /// Calls received but not yet answered, in arrival order.
    pending: Mutex<Vec<PendingCall>>,
    processes: ProcessTable,
    shutdown: Arc<Shutdown>,
}

impl Engine {
    /// An engine serving the built-in methods.
    pub fn new(transport: Arc<Transport>, config: EngineConfig) -> Self {
        Self::with_methods(transport, builtin_methods(), config)
    }

    /// An engine serving `methods`.
    ///
    /// Registers a link timeout callback that shuts the engine down.
    pub fn with_methods(
        transport: Arc<Transport>,
        methods: MethodTable,
        config: EngineConfig,
    ) -> Self {
        let wake = Arc::clone(transport.work_signal());
        let shutdown = Arc::new(Shutdown {
            reason: Mutex::new(None),
            wake: Arc::clone(&wake),
        });
        {
            let shutdown = Arc::clone(&shutdown);
            transport.link().register_timeout_callback(move |elapsed| {
                warn!(?elapsed, "link timed out");
                shutdown.request(ShutdownReason::LinkLost);
            });
        }
        Self {
            processes: ProcessTable::new(wake),
            transport,
            methods,
            config,
            pending: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.shutdown.reason()
    }

    /// Announce readiness and serve until shutdown, then tear down.
    pub fn run(&self) -> ShutdownReason {
        self.announce_ready();
        info!("engine running");

        let wake = Arc::clone(self.transport.work_signal());
        let reason = loop {
            self.poll_once();
            if let Some(reason) = self.shutdown.reason() {
                break reason;
            }
            wake.wait_timeout(self.config.poll_interval);
        };

        self.teardown(reason);
        reason
    }

    /// Queue STAGE2_RUNNING.
    pub fn announce_ready(&self) {
        self.transport
            .write_control(ControlMessage::StageReady.encode());
    }

    /// One main loop iteration.
    pub fn poll_once(&self) {
        self.drain_control();
        self.run_pending();
        self.write_responses();
        for (pid, code) in self.processes.reap() {
            self.send(ControlMessage::ProcessExited { pid, code });
        }
        for id in self.transport.sweep_closed() {
            self.send(ControlMessage::ChannelClosed { id });
        }
    }

    fn send(&self, message: ControlMessage) {
        self.transport.write_control(message.encode());
    }

    fn drain_control(&self) {
        let control = Arc::clone(self.transport.control_channel());
        while let Some(raw) = control.read() {
            match ControlMessage::decode(raw) {
                Ok(message) => self.dispatch(message),
                Err(err) => warn!(error = %err, "dropping malformed control message"),
            }
        }
    }

    fn dispatch(&self, message: ControlMessage) {
        match message {
            ControlMessage::RunMethod {
                method_id,
                name,
                args,
            } => {
                debug!(method_id, %name, "method call queued");
                lock(&self.pending).push(PendingCall::new(method_id, name, args));
            }
            ControlMessage::ChannelLinked { id } => match self.transport.get_channel(id) {
                Some(channel) => {
                    channel.set_linked(true);
                    debug!(channel = id, "channel linked");
                }
                None => warn!(channel = id, "link request for unknown channel"),
            },
            ControlMessage::CloseChannel { id } => match self.transport.get_channel(id) {
                Some(channel) => channel.request_close(),
                None => warn!(channel = id, "close request for unknown channel"),
            },
            ControlMessage::Destroy => self.shutdown.request(ShutdownReason::Destroyed),
            ControlMessage::Reserved(code) => {
                warn!(code, "unsupported control message");
            }
            ControlMessage::Unknown(code) => {
                warn!(code, "unknown control message");
            }
            other => warn!(code = other.code(), "unexpected control message for the agent"),
        }
    }

    fn run_pending(&self) {
        let calls: Vec<(u32, String, Bytes)> = lock(&self.pending)
            .iter_mut()
            .filter(|call| !call.started)
            .map(|call| {
                call.started = true;
                (call.id, call.name.clone(), call.args.clone())
            })
            .collect();
        if calls.is_empty() {
            return;
        }

        let context = MethodContext {
            transport: &self.transport,
            processes: &self.processes,
            config: &self.config,
        };
        for (id, name, args) in calls {
            let result = self.methods.invoke(&context, &name, args);
            if let Err(message) = &result {
                warn!(method_id = id, %name, %message, "method call failed");
            }
            if let Some(call) = lock(&self.pending).iter_mut().find(|call| call.id == id) {
                call.set_result(result);
            }
        }
    }

    fn write_responses(&self) {
        let mut responses = Vec::new();
        lock(&self.pending).retain(|call| match call.response() {
            Some(response) => {
                responses.push(response);
                false
            }
            None => true,
        });
        for response in responses {
            self.send(response);
        }
    }

    fn teardown(&self, reason: ShutdownReason) {
        let notice = match reason {
            ShutdownReason::Destroyed => ControlMessage::DestroyResponse,
            ShutdownReason::LinkLost | ShutdownReason::Local => ControlMessage::DestroyNotice,
        };
        self.send(notice);
        self.flush_control();

        self.transport.stop();
        self.transport.link().stop();
        self.processes.kill_all();
        let closed = self.transport.close_all();
        info!(?reason, channels = closed.len(), "engine stopped");
    }

    /// Wait, bounded, until the control output has left the link.
    fn flush_control(&self) {
        let deadline = Instant::now() + self.config.shutdown_flush_timeout;
        let link = self.transport.link();
        let control = self.transport.control_channel();
        while control.has_pending_out_data() {
            if link.is_stopped() || self.transport.is_stopped() || Instant::now() >= deadline {
                debug!("control output not drained before shutdown");
                return;
            }
            self.transport.channel_context().mark_dirty();
            thread::sleep(Duration::from_millis(5));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !link.flush(remaining) {
            debug!("link output not flushed before shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use hidmux_frame::{decode_frame, LinkConfig, LinkLayer, CONTROL};

    use super::*;
    use crate::channel::{Direction, Encoding};
    use crate::transport::TransportConfig;

    fn engine() -> Engine {
        let link = Arc::new(LinkLayer::new(LinkConfig::default()));
        link.set_connected(0);
        let transport = Arc::new(Transport::new(link, TransportConfig::default()));
        Engine::new(
            transport,
            EngineConfig {
                shutdown_flush_timeout: Duration::from_millis(50),
                ..EngineConfig::default()
            },
        )
    }

    fn receive(engine: &Engine, message: ControlMessage) {
        engine
            .transport()
            .control_channel()
            .enqueue_input(message.encode());
    }

    fn sent(engine: &Engine) -> Vec<ControlMessage> {
        std::iter::from_fn(|| engine.transport().control_channel().dequeue_output())
            .map(|raw| ControlMessage::decode(raw).unwrap())
            .collect()
    }

    #[test]
    fn run_method_round_trip() {
        let engine = engine();
        receive(
            &engine,
            ControlMessage::RunMethod {
                method_id: 1,
                name: "echo".into(),
                args: Bytes::from_static(&[1, 2, 3]),
            },
        );
        receive(
            &engine,
            ControlMessage::RunMethod {
                method_id: 2,
                name: "nope".into(),
                args: Bytes::new(),
            },
        );
        engine.poll_once();

        assert_eq!(
            sent(&engine),
            vec![
                ControlMessage::MethodResponse {
                    method_id: 1,
                    result: Ok(Bytes::from_static(&[1, 2, 3])),
                },
                ControlMessage::MethodResponse {
                    method_id: 2,
                    result: Err("Method 'nope' not found!".into()),
                },
            ]
        );
        assert!(lock(&engine.pending).is_empty());
    }

    #[test]
    fn link_and_close_requests() {
        let engine = engine();
        let channel = engine
            .transport()
            .create_channel(Direction::Out, Encoding::Utf8);
        receive(&engine, ControlMessage::ChannelLinked { id: channel.id() });
        engine.poll_once();
        assert!(channel.is_linked());

        receive(&engine, ControlMessage::CloseChannel { id: channel.id() });
        receive(&engine, ControlMessage::CloseChannel { id: 999 });
        engine.poll_once();
        assert_eq!(
            sent(&engine),
            vec![ControlMessage::ChannelClosed { id: channel.id() }]
        );
        assert!(engine.transport().get_channel(channel.id()).is_none());
    }

    #[test]
    fn reserved_and_unknown_codes_are_ignored() {
        let engine = engine();
        receive(&engine, ControlMessage::Reserved(1001));
        receive(&engine, ControlMessage::Unknown(4242));
        receive(&engine, ControlMessage::StageReady);
        engine.poll_once();
        assert!(sent(&engine).is_empty());
        assert!(engine.shutdown_reason().is_none());
    }

    #[test]
    fn destroy_answers_and_stops() {
        let engine = engine();
        receive(&engine, ControlMessage::Destroy);
        assert_eq!(engine.run(), ShutdownReason::Destroyed);

        let link = engine.transport().link();
        assert!(link.is_stopped());
        assert!(engine.transport().is_stopped());

        // Nothing drains the unstarted transport, so both messages are
        // still queued on the control channel.
        assert_eq!(
            sent(&engine),
            vec![ControlMessage::StageReady, ControlMessage::DestroyResponse]
        );
    }

    #[test]
    fn local_handle_stops_run() {
        let engine = engine();
        let handle = engine.handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            handle.shutdown();
        });
        assert_eq!(engine.run(), ShutdownReason::Local);
        stopper.join().unwrap();
        assert_eq!(
            sent(&engine).last(),
            Some(&ControlMessage::DestroyNotice)
        );
    }

    #[test]
    fn first_shutdown_reason_wins() {
        let engine = engine();
        engine.handle().shutdown();
        engine.shutdown.request(ShutdownReason::LinkLost);
        assert_eq!(engine.shutdown_reason(), Some(ShutdownReason::Local));
    }

    #[test]
    fn stage_ready_goes_out_on_control() {
        let engine = engine();
        engine.announce_ready();
        engine.transport().process_out_single().unwrap();
        let stream = engine.transport().link().pop_output_stream().unwrap();
        let frame = decode_frame(stream).unwrap();
        assert_eq!(frame.channel, CONTROL);
        assert_eq!(
            ControlMessage::decode(frame.payload).unwrap(),
            ControlMessage::StageReady
        );
    }
}

//! Remote method registration and pending-call bookkeeping.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use hidmux_frame::FrameError;

use crate::channel::Channel;
use crate::control::ControlMessage;
use crate::engine::EngineConfig;
use crate::error::PeerError;
use crate::process::ProcessTable;
use crate::transport::Transport;

/// Failure reported by a method handler.
#[derive(Debug, thiserror::Error)]
pub enum MethodError {
    /// Domain failure with a message for the caller.
    #[error("{0}")]
    Failed(String),

    /// The argument bytes did not decode.
    #[error("malformed arguments: {0}")]
    Arguments(#[from] FrameError),

    /// Local I/O failure.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Peer(#[from] PeerError),
}

impl MethodError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

pub type MethodResult = std::result::Result<Bytes, MethodError>;

/// What a handler may touch while it runs.
pub struct MethodContext<'a> {
    pub transport: &'a Arc<Transport>,
    pub processes: &'a ProcessTable,
    pub config: &'a EngineConfig,
}

impl MethodContext<'_> {
    /// Register a channel and announce it to the peer.
    pub fn open_channel(&self, channel: Arc<dyn Channel>) -> u32 {
        let announce = ControlMessage::ChannelAnnounce {
            id: channel.id(),
            direction: channel.direction(),
            encoding: channel.encoding(),
        };
        let id = channel.id();
        self.transport.add_channel(channel);
        self.transport.write_control(announce.encode());
        id
    }
}

type Handler = Box<dyn Fn(&MethodContext<'_>, Bytes) -> MethodResult + Send + Sync>;

/// Name to handler table, built once at startup.
#[derive(Default)]
pub struct MethodTable {
    handlers: HashMap<String, Handler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&MethodContext<'_>, Bytes) -> MethodResult + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run `name` and turn every outcome into a response result.
    ///
    /// Handler panics are caught and reported like errors.
    pub fn invoke(
        &self,
        context: &MethodContext<'_>,
        name: &str,
        args: Bytes,
    ) -> std::result::Result<Bytes, String> {
        let Some(handler) = self.handlers.get(name) else {
            return Err(format!("Method '{name}' not found!"));
        };
        match panic::catch_unwind(AssertUnwindSafe(|| handler(context, args))) {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(format!("Method '{name}' failed:\n{err}")),
            Err(payload) => Err(format!(
                "Method '{name}' found, but calling it panicked:\n{}",
                panic_message(payload.as_ref())
            )),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// A RUN_METHOD request waiting for, or holding, its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    pub id: u32,
    pub name: String,
    pub args: Bytes,
    pub started: bool,
    pub finished: bool,
    result: Option<std::result::Result<Bytes, String>>,
}

impl PendingCall {
    pub fn new(id: u32, name: impl Into<String>, args: Bytes) -> Self {
        Self {
            id,
            name: name.into(),
            args,
            started: false,
            finished: false,
            result: None,
        }
    }

    pub fn set_result(&mut self, result: std::result::Result<Bytes, String>) {
        self.result = Some(result);
        self.finished = true;
    }

    pub fn result(&self) -> Option<&std::result::Result<Bytes, String>> {
        self.result.as_ref()
    }

    /// The RUN_METHOD_RESPONSE for a finished call.
    pub fn response(&self) -> Option<ControlMessage> {
        let result = self.result.clone()?;
        Some(ControlMessage::MethodResponse {
            method_id: self.id,
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use hidmux_frame::{LinkConfig, LinkLayer, WireRead};

    use super::*;
    use crate::transport::TransportConfig;

    fn with_context(test: impl FnOnce(&MethodContext<'_>)) {
        let transport = Arc::new(Transport::new(
            Arc::new(LinkLayer::new(LinkConfig::default())),
            TransportConfig::default(),
        ));
        let processes = ProcessTable::new(Arc::new(hidmux_frame::Signal::auto()));
        let config = EngineConfig::default();
        test(&MethodContext {
            transport: &transport,
            processes: &processes,
            config: &config,
        });
    }

    fn table() -> MethodTable {
        let mut table = MethodTable::new();
        table
            .register("echo", |_, args| Ok(args))
            .register("fail", |_, _| Err(MethodError::failed("no luck")))
            .register("short", |_, mut args| Ok(Bytes::from(args.take_u32()?.to_string())))
            .register("boom", |_, _| panic!("exploded"));
        table
    }

    #[test]
    fn outcomes_map_to_messages() {
        let table = table();
        with_context(|ctx| {
            assert_eq!(
                table.invoke(ctx, "echo", Bytes::from_static(&[1, 2, 3])),
                Ok(Bytes::from_static(&[1, 2, 3]))
            );
            assert_eq!(
                table.invoke(ctx, "missing", Bytes::new()),
                Err("Method 'missing' not found!".to_string())
            );
            assert_eq!(
                table.invoke(ctx, "fail", Bytes::new()),
                Err("Method 'fail' failed:\nno luck".to_string())
            );
            let err = table.invoke(ctx, "short", Bytes::new()).unwrap_err();
            assert!(err.starts_with("Method 'short' failed:\nmalformed arguments"));
        });
    }

    #[test]
    fn panics_are_caught() {
        let table = table();
        with_context(|ctx| {
            let err = table.invoke(ctx, "boom", Bytes::new()).unwrap_err();
            assert_eq!(
                err,
                "Method 'boom' found, but calling it panicked:\nexploded"
            );
            // The table is still usable afterwards.
            assert!(table.invoke(ctx, "echo", Bytes::new()).is_ok());
        });
    }

    #[test]
    fn names_are_sorted() {
        assert_eq!(table().names(), vec!["boom", "echo", "fail", "short"]);
    }

    #[test]
    fn pending_call_response() {
        let mut call = PendingCall::new(5, "echo", Bytes::from_static(b"x"));
        assert!(call.response().is_none());
        call.set_result(Ok(Bytes::from_static(b"x")));
        assert!(call.finished);
        assert_eq!(
            call.response(),
            Some(ControlMessage::MethodResponse {
                method_id: 5,
                result: Ok(Bytes::from_static(b"x")),
            })
        );
    }

    #[test]
    fn open_channel_announces() {
        with_context(|ctx| {
            let channel = Arc::new(crate::channel::QueueChannel::new(
                ctx.transport.channel_context(),
                crate::channel::Direction::Out,
                crate::channel::Encoding::Utf8,
            ));
            let id = ctx.open_channel(channel);
            assert!(ctx.transport.get_channel(id).is_some());
            let announce = ctx.transport.control_channel().dequeue_output().unwrap();
            assert_eq!(
                ControlMessage::decode(announce).unwrap(),
                ControlMessage::ChannelAnnounce {
                    id,
                    direction: crate::channel::Direction::Out,
                    encoding: crate::channel::Encoding::Utf8,
                }
            );
        });
    }
}

//! Channels, multiplexing and remote control over a hidmux link.
//!
//! The agent end runs an [`Engine`] that executes methods requested by the
//! controller end ([`Controller`]). Both sit on a [`Transport`] that
//! multiplexes channels over one [`hidmux_frame::LinkLayer`]:
//! - [`channel`] holds the channel variants (queue, stream, process, file)
//! - [`control`] is the control message table carried on channel 0
//! - [`handlers`] are the built-in methods

pub mod channel;
pub mod config;
pub mod connector;
pub mod control;
pub mod controller;
pub mod engine;
pub mod error;
pub mod fs;
pub mod handlers;
#[cfg(unix)]
pub mod listener;
pub mod method;
pub mod process;
pub mod transport;

pub use channel::{
    Channel, ChannelContext, ChannelCore, Direction, Encoding, FileAccessMode, FileChannel,
    FileChannelConfig, ProcessChannel, ProcessChannelConfig, QueueChannel, StreamCaps,
    StreamChannel, StreamConfig,
};
pub use config::AgentConfig;
#[cfg(unix)]
pub use connector::connect_agent_socket;
pub use connector::{connect_agent, open_agent};
pub use control::ControlMessage;
pub use controller::Controller;
pub use engine::{Engine, EngineConfig, EngineHandle, ShutdownReason};
pub use error::{PeerError, Result};
pub use handlers::builtin_methods;
#[cfg(unix)]
pub use listener::{accept_controller, ControllerListener};
pub use method::{MethodContext, MethodError, MethodResult, MethodTable, PendingCall};
pub use process::{ProcessTable, StdioChannels};
pub use transport::{Transport, TransportConfig};

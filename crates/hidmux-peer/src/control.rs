//! Control channel messages.
//!
//! Every message on channel 0 is `[u32 msg_type][payload]`. Codes below
//! 1000 travel from the agent to the controller, codes from 1000 on the
//! other way.

use bytes::{BufMut, Bytes, BytesMut};
use hidmux_frame::{WireRead, WireWrite};

use crate::channel::{Direction, Encoding};
use crate::error::{PeerError, Result};

/// Agent: stage ready, first message of every run.
pub const STAGE2_RUNNING: u32 = 3;
/// Agent: result of a RUN_METHOD.
pub const RUN_METHOD_RESPONSE: u32 = 4;
/// Agent: a new channel exists.
pub const ADD_CHANNEL: u32 = 5;
/// Agent: a tracked process exited.
pub const PROCESS_EXITED: u32 = 6;
/// Agent: a channel was closed and removed.
pub const CHANNEL_CLOSED: u32 = 7;
/// Agent: shutting down after losing the link.
pub const DESTROY_NOTICE: u32 = 8;
/// Agent: shutting down on request.
pub const DESTROY_RESPONSE: u32 = 9;

/// Controller: invoke a method.
pub const RUN_METHOD: u32 = 1003;
/// Controller: a channel announced with ADD_CHANNEL is linked.
pub const CHANNEL_LINKED: u32 = 1004;
/// Controller: shut down.
pub const DESTROY: u32 = 1005;
/// Controller: close a channel.
pub const CLOSE_CHANNEL: u32 = 1006;

/// Retired codes; recognised but never acted on.
pub fn is_reserved(code: u32) -> bool {
    matches!(code, 0..=2 | 1000..=1002)
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    StageReady,
    MethodResponse {
        method_id: u32,
        result: std::result::Result<Bytes, String>,
    },
    ChannelAnnounce {
        id: u32,
        direction: Direction,
        encoding: Encoding,
    },
    ProcessExited {
        pid: u32,
        /// `-1` when the exit status carried no code.
        code: i32,
    },
    ChannelClosed {
        id: u32,
    },
    DestroyNotice,
    DestroyResponse,
    RunMethod {
        method_id: u32,
        name: String,
        args: Bytes,
    },
    ChannelLinked {
        id: u32,
    },
    Destroy,
    CloseChannel {
        id: u32,
    },
    /// A reserved code, kept for logging.
    Reserved(u32),
    /// Anything else, kept for logging.
    Unknown(u32),
}

impl ControlMessage {
    pub fn code(&self) -> u32 {
        match self {
            Self::StageReady => STAGE2_RUNNING,
            Self::MethodResponse { .. } => RUN_METHOD_RESPONSE,
            Self::ChannelAnnounce { .. } => ADD_CHANNEL,
            Self::ProcessExited { .. } => PROCESS_EXITED,
            Self::ChannelClosed { .. } => CHANNEL_CLOSED,
            Self::DestroyNotice => DESTROY_NOTICE,
            Self::DestroyResponse => DESTROY_RESPONSE,
            Self::RunMethod { .. } => RUN_METHOD,
            Self::ChannelLinked { .. } => CHANNEL_LINKED,
            Self::Destroy => DESTROY,
            Self::CloseChannel { .. } => CLOSE_CHANNEL,
            Self::Reserved(code) | Self::Unknown(code) => *code,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut msg = BytesMut::with_capacity(16);
        msg.put_u32(self.code());
        match self {
            Self::MethodResponse { method_id, result } => {
                msg.put_u32(*method_id);
                match result {
                    Ok(data) => {
                        msg.put_u8(0);
                        msg.put_slice(data);
                    }
                    Err(message) => {
                        msg.put_u8(1);
                        msg.put_cstring(message);
                    }
                }
            }
            Self::ChannelAnnounce {
                id,
                direction,
                encoding,
            } => {
                msg.put_u32(*id);
                msg.put_u8(direction.to_wire());
                msg.put_u8(encoding.to_wire());
            }
            Self::ProcessExited { pid, code } => {
                msg.put_u32(*pid);
                msg.put_i32(*code);
            }
            Self::RunMethod {
                method_id,
                name,
                args,
            } => {
                msg.put_u32(*method_id);
                msg.put_cstring(name);
                msg.put_slice(args);
            }
            Self::ChannelClosed { id } | Self::ChannelLinked { id } | Self::CloseChannel { id } => {
                msg.put_u32(*id);
            }
            Self::StageReady
            | Self::DestroyNotice
            | Self::DestroyResponse
            | Self::Destroy
            | Self::Reserved(_)
            | Self::Unknown(_) => {}
        }
        msg.freeze()
    }

    pub fn decode(mut msg: Bytes) -> Result<Self> {
        let code = msg.take_u32()?;
        let message = match code {
            STAGE2_RUNNING => Self::StageReady,
            RUN_METHOD_RESPONSE => {
                let method_id = msg.take_u32()?;
                let result = match msg.take_u8()? {
                    0 => Ok(msg.take_rest()),
                    _ => Err(msg.take_cstring()?),
                };
                Self::MethodResponse { method_id, result }
            }
            ADD_CHANNEL => {
                let id = msg.take_u32()?;
                let direction = msg.take_u8()?;
                let encoding = msg.take_u8()?;
                Self::ChannelAnnounce {
                    id,
                    direction: Direction::from_wire(direction).ok_or_else(|| {
                        PeerError::Protocol(format!("invalid channel direction {direction}"))
                    })?,
                    encoding: Encoding::from_wire(encoding).ok_or_else(|| {
                        PeerError::Protocol(format!("invalid channel encoding {encoding}"))
                    })?,
                }
            }
            PROCESS_EXITED => Self::ProcessExited {
                pid: msg.take_u32()?,
                code: msg.take_i32()?,
            },
            CHANNEL_CLOSED => Self::ChannelClosed { id: msg.take_u32()? },
            DESTROY_NOTICE => Self::DestroyNotice,
            DESTROY_RESPONSE => Self::DestroyResponse,
            RUN_METHOD => Self::RunMethod {
                method_id: msg.take_u32()?,
                name: msg.take_cstring()?,
                args: msg.take_rest(),
            },
            CHANNEL_LINKED => Self::ChannelLinked { id: msg.take_u32()? },
            DESTROY => Self::Destroy,
            CLOSE_CHANNEL => Self::CloseChannel { id: msg.take_u32()? },
            code if is_reserved(code) => Self::Reserved(code),
            code => Self::Unknown(code),
        };
        Ok(message)
    }
}

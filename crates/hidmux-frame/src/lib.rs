//! Record framing and the reliable link layer for hidmux.
//!
//! The device exchanges fixed 65-byte records. This crate turns that into
//! an ordered stream of variable-length messages:
//! - [`report`] encodes and decodes single records (length, FIN, RESEND,
//!   CONNECT, sequence/acknowledge number)
//! - [`handshake`] synchronises sequence numbers with the CONNECT exchange
//! - [`link`] reassembles streams, requests resends and paces output
//! - [`codec`] prefixes each stream with its channel ID and provides the
//!   big-endian field helpers used by the control protocol

pub mod channel;
pub mod codec;
pub mod error;
pub mod handshake;
pub mod link;
pub mod millis;
pub mod reader;
pub mod report;
pub mod sync;
pub mod writer;

pub use channel::{is_control, CONTROL};
pub use codec::{decode_frame, encode_frame, Frame, WireRead, WireWrite, CHANNEL_ID_SIZE};
pub use error::{FrameError, Result};
pub use handshake::{handshake_initiator, handshake_responder, HandshakeConfig, HandshakeResult};
pub use link::{LinkConfig, LinkLayer, LinkRole, TimeoutCallback};
pub use reader::ReportReader;
pub use report::{next_seq, Record, PAYLOAD_MAX, REPORT_SIZE, SEQ_MODULO};
pub use sync::{lock, Signal};
pub use writer::ReportWriter;

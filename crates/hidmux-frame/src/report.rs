use bytes::Bytes;

use crate::error::{FrameError, Result};

/// Size of one device record on the wire.
pub const REPORT_SIZE: usize = 65;

/// Payload capacity of one record.
pub const PAYLOAD_MAX: usize = REPORT_SIZE - 3;

/// Sequence numbers wrap modulo this value.
pub const SEQ_MODULO: u8 = 32;

const LEN_MASK: u8 = 0x3f;
const SEQ_MASK: u8 = 0x1f;
const FIN_BIT: u8 = 1 << 7;
const RESEND_BIT: u8 = 1 << 6;
const CONNECT_BIT: u8 = 1 << 7;

/// One decoded device record.
///
/// Record layout:
/// ```text
/// byte 0      reserved (report ID), always 0
/// byte 1      bit7 FIN, bit6 RESEND, bits0-5 payload length
/// byte 2      bit7 CONNECT, bits0-4 sequence or acknowledge number
/// bytes 3..65 payload, zero padded
/// ```
///
/// Which of sequence or acknowledge byte 2 carries depends on direction:
/// records sent by the initiating side acknowledge, records it receives
/// are sequenced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub seq: u8,
    pub fin: bool,
    pub resend: bool,
    pub connect: bool,
    pub payload: Bytes,
}

impl Record {
    /// A data record. `payload` must fit in [`PAYLOAD_MAX`] bytes.
    pub fn data(seq: u8, payload: Bytes, fin: bool) -> Self {
        debug_assert!(payload.len() <= PAYLOAD_MAX);
        Self {
            seq,
            fin,
            payload,
            ..Self::default()
        }
    }

    /// An empty FIN record used to keep the link clocked.
    pub fn idle(seq: u8) -> Self {
        Self::data(seq, Bytes::new(), true)
    }

    /// A handshake record.
    pub fn connect(seq: u8) -> Self {
        Self {
            seq,
            connect: true,
            ..Self::default()
        }
    }

    /// Encode into a fixed-size device record.
    pub fn encode(&self) -> [u8; REPORT_SIZE] {
        let mut raw = [0u8; REPORT_SIZE];
        let len = self.payload.len().min(PAYLOAD_MAX);

        raw[1] = len as u8;
        if self.fin {
            raw[1] |= FIN_BIT;
        }
        if self.resend {
            raw[1] |= RESEND_BIT;
        }
        raw[2] = self.seq & SEQ_MASK;
        if self.connect {
            raw[2] |= CONNECT_BIT;
        }
        raw[3..3 + len].copy_from_slice(&self.payload[..len]);
        raw
    }

    /// Decode a fixed-size device record.
    ///
    /// Fails if the advertised payload length exceeds [`PAYLOAD_MAX`].
    pub fn decode(raw: &[u8; REPORT_SIZE]) -> Result<Self> {
        let len = raw[1] & LEN_MASK;
        if usize::from(len) > PAYLOAD_MAX {
            return Err(FrameError::InvalidLength(len));
        }
        Ok(Self {
            seq: raw[2] & SEQ_MASK,
            fin: raw[1] & FIN_BIT != 0,
            resend: raw[1] & RESEND_BIT != 0,
            connect: raw[2] & CONNECT_BIT != 0,
            payload: Bytes::copy_from_slice(&raw[3..3 + usize::from(len)]),
        })
    }
}

/// The sequence number following `seq`.
pub fn next_seq(seq: u8) -> u8 {
    (seq + 1) % SEQ_MODULO
}

/// Forward distance from `from` to `to` on the sequence ring.
pub fn seq_distance(from: u8, to: u8) -> u8 {
    (to + SEQ_MODULO - from) % SEQ_MODULO
}

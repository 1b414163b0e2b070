use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FrameError, Result};
use crate::reader::{is_timeout, ReportReader};
use crate::report::{Record, SEQ_MODULO};
use crate::writer::ReportWriter;

/// Configuration for the CONNECT handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Overall deadline. `None` retries forever.
    #[serde(with = "crate::millis::option")]
    pub timeout: Option<Duration>,
    /// Sequence number the responder advertises.
    ///
    /// Must be non-zero: an initiator's CONNECT request always carries
    /// ACK 0, so 0 would make a repeated request look like a confirmation.
    pub initial_seq: u8,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            initial_seq: 1,
        }
    }
}

/// Outcome of a completed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeResult {
    /// The responder's initial sequence number.
    pub peer_seq: u8,
    /// CONNECT records written before completion.
    pub attempts: u32,
}

struct Deadline {
    limit: Option<(Instant, Duration)>,
}

impl Deadline {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            limit: timeout.map(|t| (Instant::now() + t, t)),
        }
    }

    fn check(&self) -> Result<()> {
        match self.limit {
            Some((at, timeout)) if Instant::now() >= at => Err(FrameError::HandshakeTimeout(timeout)),
            _ => Ok(()),
        }
    }
}

/// Read one record, mapping device timeouts and malformed records to `None`.
fn poll_record<R: Read>(reader: &mut ReportReader<R>) -> Result<Option<Record>> {
    match reader.read_record() {
        Ok(record) => Ok(Some(record)),
        Err(err) if is_timeout(&err) => Ok(None),
        Err(FrameError::InvalidLength(len)) => {
            debug!(len, "malformed record during handshake");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Run the initiating (agent) side of the handshake.
///
/// Repeats an empty CONNECT record until the peer answers with CONNECT,
/// then confirms by acknowledging the advertised sequence number.
pub fn handshake_initiator<R: Read, W: Write>(
    reader: &mut ReportReader<R>,
    writer: &mut ReportWriter<W>,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    let deadline = Deadline::new(config.timeout);
    let mut attempts = 0u32;

    loop {
        deadline.check()?;
        writer.write_record(&Record::connect(0))?;
        attempts += 1;

        let Some(record) = poll_record(reader)? else {
            debug!(attempts, "no handshake response yet");
            continue;
        };
        if !record.connect {
            debug!(seq = record.seq, "record without CONNECT during handshake");
            continue;
        }

        writer.write_record(&Record::connect(record.seq))?;
        info!(peer_seq = record.seq, attempts, "link connected");
        return Ok(HandshakeResult {
            peer_seq: record.seq,
            attempts,
        });
    }
}

/// Run the responding (controller) side of the handshake.
pub fn handshake_responder<R: Read, W: Write>(
    reader: &mut ReportReader<R>,
    writer: &mut ReportWriter<W>,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    // Never zero.
    let initial = match config.initial_seq % SEQ_MODULO {
        0 => 1,
        seq => seq,
    };
    let deadline = Deadline::new(config.timeout);
    let mut attempts = 0u32;

    loop {
        deadline.check()?;
        let Some(record) = poll_record(reader)? else {
            continue;
        };
        if !record.connect {
            debug!(seq = record.seq, "ignoring record before handshake");
            continue;
        }

        if attempts > 0 && record.seq == initial {
            info!(initial_seq = initial, attempts, "link accepted");
            return Ok(HandshakeResult {
                peer_seq: initial,
                attempts,
            });
        }

        writer.write_record(&Record::connect(initial))?;
        attempts += 1;
        debug!(attempts, "answered CONNECT request");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::thread;

    use hidmux_device::DeviceStream;

    use super::*;

    #[test]
    fn handshake_over_device_pair() {
        let (agent, controller) = DeviceStream::pair().unwrap();

        let responder = thread::spawn(move || {
            let mut reader = ReportReader::new(controller.try_clone().unwrap());
            let mut writer = ReportWriter::new(controller);
            let config = HandshakeConfig {
                initial_seq: 12,
                ..HandshakeConfig::default()
            };
            handshake_responder(&mut reader, &mut writer, &config).unwrap()
        });

        let mut reader = ReportReader::new(agent.try_clone().unwrap());
        let mut writer = ReportWriter::new(agent);
        let result =
            handshake_initiator(&mut reader, &mut writer, &HandshakeConfig::default()).unwrap();

        assert_eq!(result.peer_seq, 12);
        assert_eq!(responder.join().unwrap().peer_seq, 12);
    }

    #[test]
    fn initiator_skips_records_without_connect() {
        let mut inbound = Vec::new();
        inbound.extend_from_slice(&Record::idle(3).encode());
        inbound.extend_from_slice(&Record::connect(7).encode());

        let mut reader = ReportReader::new(Cursor::new(inbound));
        let mut writer = ReportWriter::new(Cursor::new(Vec::new()));
        let result =
            handshake_initiator(&mut reader, &mut writer, &HandshakeConfig::default()).unwrap();
        assert_eq!(result.peer_seq, 7);
        assert_eq!(result.attempts, 2);

        let written = writer.into_inner().into_inner();
        let last: [u8; 65] = written[written.len() - 65..].try_into().unwrap();
        let confirm = Record::decode(&last).unwrap();
        assert!(confirm.connect);
        assert_eq!(confirm.seq, 7);
    }

    #[test]
    fn initiator_times_out() {
        let (agent, _controller) = DeviceStream::pair().unwrap();
        let mut reader =
            ReportReader::with_read_timeout(agent.try_clone().unwrap(), Some(Duration::from_millis(10)))
                .unwrap();
        let mut writer = ReportWriter::new(agent);
        let config = HandshakeConfig {
            timeout: Some(Duration::from_millis(50)),
            ..HandshakeConfig::default()
        };
        assert!(matches!(
            handshake_initiator(&mut reader, &mut writer, &config),
            Err(FrameError::HandshakeTimeout(_))
        ));
    }

    #[test]
    fn responder_never_offers_zero() {
        let mut inbound = Vec::new();
        inbound.extend_from_slice(&Record::connect(0).encode());
        inbound.extend_from_slice(&Record::connect(1).encode());

        let mut reader = ReportReader::new(Cursor::new(inbound));
        let mut writer = ReportWriter::new(Cursor::new(Vec::new()));
        let config = HandshakeConfig {
            initial_seq: 0,
            ..HandshakeConfig::default()
        };
        let result = handshake_responder(&mut reader, &mut writer, &config).unwrap();
        assert_eq!(result.peer_seq, 1);

        let written = writer.into_inner().into_inner();
        let offer: [u8; 65] = written[..65].try_into().unwrap();
        assert_eq!(Record::decode(&offer).unwrap().seq, 1);
    }

    #[test]
    fn closed_device_aborts_handshake() {
        let mut reader = ReportReader::new(Cursor::new(Vec::<u8>::new()));
        let mut writer = ReportWriter::new(Cursor::new(Vec::new()));
        assert!(matches!(
            handshake_responder(&mut reader, &mut writer, &HandshakeConfig::default()),
            Err(FrameError::ConnectionClosed)
        ));
    }
}

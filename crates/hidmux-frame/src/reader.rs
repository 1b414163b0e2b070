use std::io::{ErrorKind, Read};
use std::time::Duration;

use hidmux_device::DeviceStream;
use tracing::trace;

use crate::error::{FrameError, Result};
use crate::report::{Record, REPORT_SIZE};

/// Reads fixed-size device records from any `Read` stream.
///
/// Handles partial reads internally. A read that times out mid-record
/// keeps the bytes received so far and resumes on the next call.
pub struct ReportReader<T> {
    inner: T,
    buf: [u8; REPORT_SIZE],
    filled: usize,
}

impl<T: Read> ReportReader<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: [0u8; REPORT_SIZE],
            filled: 0,
        }
    }

    /// Read the next complete record (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached and
    /// `Err(FrameError::InvalidLength)` for a record whose header is
    /// malformed (the record is consumed either way).
    pub fn read_record(&mut self) -> Result<Record> {
        while self.filled < REPORT_SIZE {
            let read = match self.inner.read(&mut self.buf[self.filled..]) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }
            self.filled += read;
        }

        self.filled = 0;
        let record = Record::decode(&self.buf)?;
        trace!(
            seq = record.seq,
            len = record.payload.len(),
            fin = record.fin,
            resend = record.resend,
            connect = record.connect,
            "record in"
        );
        Ok(record)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl ReportReader<DeviceStream> {
    /// Create a record reader for a device and apply a read timeout.
    pub fn with_read_timeout(inner: DeviceStream, timeout: Option<Duration>) -> Result<Self> {
        inner.set_read_timeout(timeout)?;
        Ok(Self::new(inner))
    }
}

/// True for read errors that only mean "nothing arrived yet".
pub(crate) fn is_timeout(err: &FrameError) -> bool {
    matches!(
        err,
        FrameError::Io(io) if matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
    )
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::Bytes;

    use super::*;

    /// Reader that yields one byte at a time.
    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    /// Reader that times out once after `split` bytes.
    struct StallingReader {
        bytes: Vec<u8>,
        pos: usize,
        split: usize,
        stalled: bool,
    }

    impl Read for StallingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos == self.split && !self.stalled {
                self.stalled = true;
                return Err(std::io::Error::new(ErrorKind::WouldBlock, "stall"));
            }
            let end = if self.pos < self.split {
                self.split
            } else {
                self.bytes.len()
            };
            let n = (end - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn wire(records: &[Record]) -> Vec<u8> {
        records.iter().flat_map(|r| r.encode()).collect()
    }

    #[test]
    fn read_consecutive_records() {
        let first = Record::data(1, Bytes::from_static(b"one"), false);
        let second = Record::data(2, Bytes::from_static(b"two"), true);
        let mut reader = ReportReader::new(Cursor::new(wire(&[first.clone(), second.clone()])));

        assert_eq!(reader.read_record().unwrap(), first);
        assert_eq!(reader.read_record().unwrap(), second);
        assert!(matches!(
            reader.read_record(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn partial_read_handling() {
        let record = Record::data(4, Bytes::from_static(b"slow"), true);
        let mut reader = ReportReader::new(ByteByByteReader {
            bytes: wire(&[record.clone()]),
            pos: 0,
        });
        assert_eq!(reader.read_record().unwrap(), record);
    }

    #[test]
    fn timeout_mid_record_resumes() {
        let record = Record::data(9, Bytes::from_static(b"resume"), true);
        let mut reader = ReportReader::new(StallingReader {
            bytes: wire(&[record.clone()]),
            pos: 0,
            split: 20,
            stalled: false,
        });

        let err = reader.read_record().unwrap_err();
        assert!(is_timeout(&err));
        assert_eq!(reader.read_record().unwrap(), record);
    }

    #[test]
    fn connection_closed_mid_record() {
        let raw = Record::idle(0).encode();
        let mut reader = ReportReader::new(Cursor::new(raw[..30].to_vec()));
        assert!(matches!(
            reader.read_record(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn malformed_record_is_consumed() {
        let mut bytes = vec![0u8; REPORT_SIZE];
        bytes[1] = 0x3f;
        bytes.extend_from_slice(&Record::idle(3).encode());

        let mut reader = ReportReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_record(),
            Err(FrameError::InvalidLength(63))
        ));
        assert_eq!(reader.read_record().unwrap(), Record::idle(3));
    }
}

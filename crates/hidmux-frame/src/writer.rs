use std::io::{ErrorKind, Write};

use tracing::trace;

use crate::error::{FrameError, Result};
use crate::report::Record;

/// Writes fixed-size device records to any `Write` stream.
pub struct ReportWriter<T> {
    inner: T,
}

impl<T: Write> ReportWriter<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    /// Encode and write one record, then flush (blocking).
    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        trace!(
            seq = record.seq,
            len = record.payload.len(),
            fin = record.fin,
            resend = record.resend,
            connect = record.connect,
            "record out"
        );
        let raw = record.encode();

        let mut offset = 0usize;
        while offset < raw.len() {
            match self.inner.write(&raw[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

//! Newline-delimited JSON framing over byte streams.
//!
//! Used for the link between a worker process and its queue broker, and
//! available to applications that need to reach a shared resource from
//! worker processes (one JSON document per line, no embedded newlines).
//!
//! [`LineReader`] tolerates read timeouts: bytes of a partial line are kept
//! and the next call continues where the previous one stopped.

use std::io::{self, BufRead, BufReader, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

const BUFFER_SIZE: usize = 16 * 1024;

/// Reads one JSON message per line.
#[derive(Debug)]
pub struct LineReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(BUFFER_SIZE, inner),
            pending: Vec::with_capacity(1024),
        }
    }

    pub fn get_ref(&self) -> &R {
        self.reader.get_ref()
    }

    /// Read the next message. `Ok(None)` means the peer closed the stream.
    ///
    /// A `WouldBlock` or `TimedOut` error means no complete line arrived
    /// before the stream's read timeout; the partial line is kept.
    pub fn read_message<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        self.reader.read_until(b'\n', &mut self.pending)?;
        if self.pending.is_empty() {
            return Ok(None);
        }
        if self.pending.last() != Some(&b'\n') {
            self.pending.clear();
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed mid-message"));
        }

        let parsed = serde_json::from_slice(&self.pending);
        self.pending.clear();
        parsed
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Serialize `message` as one line and flush it.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> io::Result<()> {
    let mut line = serde_json::to_vec(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()
}

/// Whether `err` is a read timeout rather than a broken stream.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

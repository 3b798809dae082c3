//! Length-prefixed frame transport over any byte stream.
//!
//! Wire format:
//! ```text
//! [fin:1|rsv:3|opcode:4][payload_len:4][payload:N]
//! ```
//! Header size: 5 bytes.  The length is big-endian.
//!
//! Both halves are non-blocking friendly: `WouldBlock` from the underlying
//! stream is never an error, it just means "nothing more right now".

use std::io::{self, Read, Write};

use tracing::trace;

use super::frame::{
    Frame, FrameError, FrameParser, FrameWriter, Opcode, WriteStatus, MAX_PAYLOAD_LEN, RSV_MASK,
};

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 5;

const READ_CHUNK: usize = 8 * 1024;

// ── Header codec ──────────────────────────────────────────────────────────────

/// Encodes `frame` (header + payload) into a fresh buffer.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + frame.payload.len());
    let mut first = (frame.opcode as u8) & 0x0F;
    first |= (frame.rsv & RSV_MASK) << 4;
    if frame.fin {
        first |= 0x80;
    }
    buf.push(first);
    buf.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    buf
}

/// Decodes one frame from the front of `bytes`.
///
/// Returns `Ok(None)` if `bytes` does not yet hold a complete frame, otherwise
/// the frame and the number of bytes it occupied.
///
/// # Errors
///
/// Returns [`FrameError::UnknownOpcode`] or [`FrameError::Oversized`] for a
/// malformed header.
pub fn decode_frame(bytes: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    if bytes.len() < HEADER_SIZE {
        return Ok(None);
    }

    let first = bytes[0];
    let opcode = Opcode::try_from(first & 0x0F)?;
    let payload_len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(FrameError::Oversized {
            declared: payload_len,
            max: MAX_PAYLOAD_LEN,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if bytes.len() < total {
        return Ok(None);
    }

    let frame = Frame {
        fin: first & 0x80 != 0,
        rsv: (first >> 4) & RSV_MASK,
        opcode,
        payload: bytes[HEADER_SIZE..total].to_vec(),
    };
    Ok(Some((frame, total)))
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Buffers bytes from `R` and yields complete frames.
#[derive(Debug)]
pub struct FramedReader<R> {
    inner: R,
    buf: Vec<u8>,
    eof: bool,
}

impl<R: Read> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            eof: false,
        }
    }

    /// Returns the wrapped stream.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Reads whatever is available without blocking into the buffer.
    fn fill(&mut self) -> Result<(), FrameError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl<R: Read> FrameParser for FramedReader<R> {
    fn parse(&mut self) -> Result<Option<Frame>, FrameError> {
        if let Some((frame, used)) = decode_frame(&self.buf)? {
            self.buf.drain(..used);
            return Ok(Some(frame));
        }

        if !self.eof {
            self.fill()?;
            if let Some((frame, used)) = decode_frame(&self.buf)? {
                self.buf.drain(..used);
                trace!(len = frame.payload.len(), fin = frame.fin, "frame parsed");
                return Ok(Some(frame));
            }
        }

        if self.eof {
            return Err(FrameError::Closed {
                mid_frame: !self.buf.is_empty(),
            });
        }
        Ok(None)
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Queues encoded frames and writes them to `W` as it accepts bytes.
#[derive(Debug)]
pub struct FramedWriter<W> {
    inner: W,
    pending: Vec<u8>,
}

impl<W: Write> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    /// Returns the wrapped stream.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Number of bytes still waiting to be written.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn drain(&mut self) -> Result<WriteStatus, FrameError> {
        while !self.pending.is_empty() {
            match self.inner.write(&self.pending) {
                Ok(0) => {
                    return Err(FrameError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "frame stream accepted zero bytes",
                    )))
                }
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!(remaining = self.pending.len(), "frame write would block");
                    return Ok(WriteStatus::Pending);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        match self.inner.flush() {
            Ok(()) => Ok(WriteStatus::Complete),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(WriteStatus::Pending),
            Err(e) => Err(e.into()),
        }
    }
}

impl<W: Write> FrameWriter for FramedWriter<W> {
    fn write(&mut self, frame: &Frame) -> Result<WriteStatus, FrameError> {
        self.pending.extend_from_slice(&encode_frame(frame));
        self.drain()
    }

    fn flush(&mut self) -> Result<WriteStatus, FrameError> {
        self.drain()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

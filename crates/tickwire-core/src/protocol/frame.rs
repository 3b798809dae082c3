//! Frame type and the channel traits the worker protocol is built on.
//!
//! A frame is the unit a lower framing layer hands to the worker service:
//!
//! ```text
//! ┌─────┬──────────┬────────────┬─────────────┐
//! │ fin │ rsv (3b) │ opcode (4b)│ payload ... │
//! └─────┴──────────┴────────────┴─────────────┘
//! ```
//!
//! Only two opcodes mean anything at this layer: `Data` and `Error`.  A logical
//! call may span several frames; only the frame with `fin` set terminates it.

use thiserror::Error;

/// Largest payload accepted in a single frame (16 MiB).
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Mask for the three reserved bits.
pub const RSV_MASK: u8 = 0b0111;

/// Errors produced by frame parsing and writing.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The opcode nibble is not one this protocol understands.
    #[error("unknown frame opcode: 0x{0:X}")]
    UnknownOpcode(u8),

    /// A frame header declared a payload larger than [`MAX_PAYLOAD_LEN`].
    #[error("frame payload of {declared} bytes exceeds the {max} byte limit")]
    Oversized { declared: usize, max: usize },

    /// The peer closed the channel (cleanly or in the middle of a frame).
    #[error("frame channel closed{}", closed_suffix(.mid_frame))]
    Closed { mid_frame: bool },

    /// The underlying stream failed.
    #[error("frame channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn closed_suffix(mid_frame: &bool) -> &'static str {
    if *mid_frame {
        " mid-frame"
    } else {
        ""
    }
}

// ── Opcode ────────────────────────────────────────────────────────────────────

/// Frame opcodes meaningful to the worker protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Request fragments and successful responses.
    Data = 0x1,
    /// Failed-procedure responses.
    Error = 0x2,
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0x1 => Ok(Opcode::Data),
            0x2 => Ok(Opcode::Error),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One decoded wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Terminal flag: `true` on the last frame of a logical message.
    pub fin: bool,
    /// Reserved bits (only the low three bits are meaningful).
    pub rsv: u8,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds a frame, masking `rsv` to its three meaningful bits.
    pub fn new(fin: bool, rsv: u8, opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin,
            rsv: rsv & RSV_MASK,
            opcode,
            payload: payload.into(),
        }
    }

    /// A terminal `Data` frame.
    pub fn data(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(true, 0, Opcode::Data, payload)
    }

    /// A terminal `Error` frame.
    pub fn error(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(true, 0, Opcode::Error, payload)
    }

    /// A non-terminal `Data` fragment.
    pub fn partial(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(false, 0, Opcode::Data, payload)
    }
}

// ── Channel traits ────────────────────────────────────────────────────────────

/// Outcome of handing a frame (or the remainder of one) to a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Every byte was accepted by the underlying stream.
    Complete,
    /// Bytes remain queued; call [`FrameWriter::flush`] once the stream is
    /// writable again.
    Pending,
}

/// Source of incoming frames.
pub trait FrameParser {
    /// Returns the next complete frame, or `Ok(None)` when no complete frame
    /// is available without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Closed`] once the peer has gone away.
    fn parse(&mut self) -> Result<Option<Frame>, FrameError>;
}

/// Sink for outgoing frames.
pub trait FrameWriter {
    /// Queues `frame` and writes as much of it as the stream accepts.
    fn write(&mut self, frame: &Frame) -> Result<WriteStatus, FrameError>;

    /// Continues writing previously queued bytes.
    fn flush(&mut self) -> Result<WriteStatus, FrameError>;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_try_from_known_values() {
        assert_eq!(Opcode::try_from(0x1).unwrap(), Opcode::Data);
        assert_eq!(Opcode::try_from(0x2).unwrap(), Opcode::Error);
    }

    #[test]
    fn test_opcode_try_from_unknown_value_is_error() {
        let err = Opcode::try_from(0x9).unwrap_err();
        assert!(matches!(err, FrameError::UnknownOpcode(0x9)));
        assert_eq!(err.to_string(), "unknown frame opcode: 0x9");
    }

    #[test]
    fn test_frame_new_masks_reserved_bits() {
        let frame = Frame::new(true, 0xFF, Opcode::Data, "x");
        assert_eq!(frame.rsv, 0b0111);
    }

    #[test]
    fn test_frame_constructors_set_fin_and_opcode() {
        assert!(Frame::data("a").fin);
        assert_eq!(Frame::error("b").opcode, Opcode::Error);
        assert!(!Frame::partial("c").fin);
    }

    #[test]
    fn test_closed_error_mentions_mid_frame() {
        assert_eq!(
            FrameError::Closed { mid_frame: true }.to_string(),
            "frame channel closed mid-frame"
        );
        assert_eq!(
            FrameError::Closed { mid_frame: false }.to_string(),
            "frame channel closed"
        );
    }
}

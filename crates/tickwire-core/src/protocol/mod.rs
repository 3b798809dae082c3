//! Worker protocol: frames, the frame transport, and call payload parsing.

pub mod frame;
pub mod request;
pub mod transport;

pub use frame::{Frame, FrameError, FrameParser, FrameWriter, Opcode, WriteStatus};
pub use request::{RequestError, WorkerRequest, PROCEDURE_DELIMITER};
pub use transport::{decode_frame, encode_frame, FramedReader, FramedWriter};

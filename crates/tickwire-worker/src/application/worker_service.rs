//! WorkerRpcService: turns incoming frames into procedure calls and writes
//! exactly one response frame per call.
//!
//! # Lifecycle of one call (for beginners)
//!
//! ```text
//! frame(fin=0, "echo,")      ──► buffer = "echo,"
//! frame(fin=1, "[\"hi\"]")   ──► buffer = "echo,[\"hi\"]"
//!                                 ├─ split at first ','  → "echo" / "[\"hi\"]"
//!                                 ├─ decode arguments     → ["hi"]
//!                                 ├─ invoke "echo"        → "hi"
//!                                 ├─ buffer reset to empty
//!                                 └─ write Data frame "\"hi\""
//! ```
//!
//! Any failure along the way (no comma, bad arguments, unknown procedure, the
//! procedure's own error) becomes a single `Error` frame instead of a `Data`
//! frame.  The service keeps running either way.
//!
//! # Backpressure
//!
//! If the writer cannot take the whole response at once, the service moves to
//! [`ServiceState::AwaitingWritable`] and stops decoding input until
//! [`WorkerRpcService::on_writable`] has flushed the remainder.  [`serve`]
//! maps that state onto reactor subscriptions so the loop sleeps instead of
//! spinning.

use std::cell::{OnceCell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use thiserror::Error;
use tickwire_core::protocol::{Frame, FrameError, FrameParser, FrameWriter, WorkerRequest, WriteStatus};
use tickwire_core::{Reactor, Subscription};
use tracing::{debug, info, trace, warn};

use super::capture::OutputCapture;
use super::codec::{Codec, CodecError};
use super::registry::{DispatchError, ProcedureError, ProcedureRegistry};

/// Errors that stop the service.  Procedure failures are not among them.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("frame channel failed: {0}")]
    Frame(#[from] FrameError),

    /// The failure report itself could not be encoded.
    #[error("could not encode failure report: {0}")]
    Report(#[from] CodecError),
}

/// Where the service is in its read/write cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Ready to decode incoming frames.
    Reading,
    /// A response is partially written; input is not decoded until it drains.
    AwaitingWritable,
    /// The input channel closed.
    Closed,
}

/// Decodes calls from `P`, dispatches them through a registry and writes
/// responses to `W`.
pub struct WorkerRpcService<C: Codec, P, W> {
    codec: C,
    registry: ProcedureRegistry<C>,
    parser: P,
    writer: W,
    buffer: Vec<u8>,
    state: ServiceState,
    calls: u64,
}

impl<C, P, W> WorkerRpcService<C, P, W>
where
    C: Codec,
    P: FrameParser,
    W: FrameWriter,
{
    pub fn new(codec: C, registry: ProcedureRegistry<C>, parser: P, writer: W) -> Self {
        Self {
            codec,
            registry,
            parser,
            writer,
            buffer: Vec::new(),
            state: ServiceState::Reading,
            calls: 0,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Bytes of a call accumulated so far (0 between calls).
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Number of calls answered so far.
    pub fn calls_served(&self) -> u64 {
        self.calls
    }

    /// Decodes and answers every complete frame available from the parser.
    ///
    /// Returns early, without touching the parser, while a response write is
    /// still pending.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkerError`] if the frame channel fails.  A peer that
    /// closes the channel is not an error: the state becomes
    /// [`ServiceState::Closed`].
    pub fn on_readable(&mut self) -> Result<ServiceState, WorkerError> {
        while self.state == ServiceState::Reading {
            let frame = match self.parser.parse() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(FrameError::Closed { mid_frame }) => {
                    if mid_frame || !self.buffer.is_empty() {
                        warn!(
                            buffered = self.buffer.len(),
                            "input closed in the middle of a call"
                        );
                    }
                    info!(calls = self.calls, "worker input closed");
                    self.buffer.clear();
                    self.state = ServiceState::Closed;
                    break;
                }
                Err(err) => return Err(err.into()),
            };
            self.handle_frame(frame)?;
        }
        Ok(self.state)
    }

    /// Continues a pending response write, then resumes decoding any frames
    /// the parser already holds.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkerError`] if the frame channel fails.
    pub fn on_writable(&mut self) -> Result<ServiceState, WorkerError> {
        if self.state != ServiceState::AwaitingWritable {
            return Ok(self.state);
        }
        if self.writer.flush()? == WriteStatus::Complete {
            trace!("pending response flushed");
            self.state = ServiceState::Reading;
            return self.on_readable();
        }
        Ok(self.state)
    }

    /// Appends one frame to the call buffer and answers the call if the frame
    /// is terminal.
    fn handle_frame(&mut self, frame: Frame) -> Result<(), WorkerError> {
        trace!(
            fin = frame.fin,
            len = frame.payload.len(),
            opcode = ?frame.opcode,
            "frame received"
        );
        self.buffer.extend_from_slice(&frame.payload);
        if !frame.fin {
            return Ok(());
        }

        let payload = std::mem::take(&mut self.buffer);
        let response = match self.invoke(&payload) {
            Ok(bytes) => Frame::data(bytes),
            Err(err) => {
                warn!(procedure = err.procedure(), cause = %err.cause(), "procedure failed");
                Frame::error(self.codec.encode_failure(&err.report())?)
            }
        };
        self.calls += 1;

        if self.writer.write(&response)? == WriteStatus::Pending {
            debug!("response write pending, pausing input");
            self.state = ServiceState::AwaitingWritable;
        }
        Ok(())
    }

    /// Runs one accumulated call payload and returns the encoded result.
    ///
    /// # Errors
    ///
    /// A [`ProcedureError`] naming the procedure (or, for a payload without a
    /// delimiter, the whole payload) with the original failure as its cause.
    pub fn invoke(&mut self, payload: &[u8]) -> Result<Vec<u8>, ProcedureError> {
        let request = WorkerRequest::parse(payload).map_err(|err| {
            ProcedureError::new(
                String::from_utf8_lossy(payload),
                DispatchError::Malformed(err),
            )
        })?;
        let procedure = request.procedure.as_str();

        let args = self
            .codec
            .decode_args(&request.arguments)
            .map_err(|err| ProcedureError::new(procedure, DispatchError::Decode(err)))?;

        debug!(procedure, codec = self.codec.name(), "invoking procedure");
        let mut capture = OutputCapture::begin(procedure);
        let output = self.registry.invoke(procedure, args, capture.console())?;
        drop(capture);

        self.codec
            .encode_output(&output)
            .map_err(|err| ProcedureError::new(procedure, DispatchError::Encode(err)))
    }
}

// ── Reactor wiring ────────────────────────────────────────────────────────────

/// The two subscriptions driving a served [`WorkerRpcService`].
#[derive(Debug, Clone)]
pub struct ServeHandle {
    pub read: Subscription,
    pub write: Subscription,
}

impl ServeHandle {
    /// Stops serving.
    pub fn cancel(&self) {
        self.read.cancel();
        self.write.cancel();
    }

    fn apply(&self, state: ServiceState) {
        match state {
            ServiceState::Reading => {
                self.write.disable();
                self.read.enable();
            }
            ServiceState::AwaitingWritable => {
                self.read.disable();
                self.write.enable();
            }
            ServiceState::Closed => self.cancel(),
        }
    }
}

/// Drives `service` from `reactor`: decodes input when `read_fd` is readable
/// and flushes pending responses when `write_fd` is writable.
///
/// Exactly one of the two subscriptions is enabled at any time.  Both are
/// cancelled once the input closes, so [`Reactor::run`] returns when nothing
/// else is registered.  A [`WorkerError`] is returned from the callback and
/// therefore terminates the reactor pass.
pub fn serve<C, P, W>(
    reactor: &Reactor,
    service: Rc<RefCell<WorkerRpcService<C, P, W>>>,
    read_fd: RawFd,
    write_fd: RawFd,
) -> ServeHandle
where
    C: Codec + 'static,
    P: FrameParser + 'static,
    W: FrameWriter + 'static,
{
    let handle: Rc<OnceCell<ServeHandle>> = Rc::new(OnceCell::new());

    let (svc, slot) = (Rc::clone(&service), Rc::clone(&handle));
    let write = reactor.on_writable(write_fd, None, move |_, _| {
        let state = svc.borrow_mut().on_writable()?;
        if let Some(handle) = slot.get() {
            handle.apply(state);
        }
        Ok(())
    });
    write.disable();

    let (svc, slot) = (service, Rc::clone(&handle));
    let read = reactor.on_readable(read_fd, None, move |_, _| {
        let state = svc.borrow_mut().on_readable()?;
        if let Some(handle) = slot.get() {
            handle.apply(state);
        }
        Ok(())
    });

    let serve_handle = ServeHandle { read, write };
    // The cell is fresh, so this cannot fail.
    let _ = handle.set(serve_handle.clone());
    info!(read_fd, write_fd, "worker service registered");
    serve_handle
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Application layer of the worker: decoding calls, dispatching them to
//! registered procedures, and encoding the responses.
//!
//! Nothing in this layer touches a file descriptor directly.  The frame
//! channel arrives as [`FrameParser`](tickwire_core::FrameParser) /
//! [`FrameWriter`](tickwire_core::FrameWriter) implementations, which keeps
//! the service testable with in-memory or mock channels.
//!
//! # Sub-modules
//!
//! - **`worker_service`** – the per-frame state machine and its reactor
//!   wiring ([`serve`](worker_service::serve)).
//! - **`registry`** – name → procedure table, plus the failure types.
//! - **`codec`** – JSON and raw-bytes argument codecs.
//! - **`capture`** – per-invocation console capture.

pub mod capture;
pub mod codec;
pub mod registry;
pub mod worker_service;

pub use codec::{Codec, CodecError, JsonCodec, RawCodec};
pub use registry::{ProcedureError, ProcedureFailure, ProcedureRegistry, RegistryError};
pub use worker_service::{serve, ServeHandle, ServiceState, WorkerError, WorkerRpcService};

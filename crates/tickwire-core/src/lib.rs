//! # tickwire-core
//!
//! Shared foundation of tickwire: a single-threaded reactor and the frame
//! protocol spoken between the application server and its worker processes.
//!
//! # Architecture overview (for beginners)
//!
//! Everything in tickwire runs on one thread driven by a [`Reactor`].  Code
//! never blocks waiting for a socket or a timer; instead it registers a
//! callback and returns.  The reactor calls it back when the timer fires or
//! the descriptor becomes ready.
//!
//! - **`reactor`** – the event loop itself: timers (`once`, `schedule`),
//!   next-pass callbacks (`immediately`), and descriptor readiness with an
//!   optional timeout (`on_readable`, `on_writable`).  Every registration
//!   returns a [`Subscription`] that can be enabled, disabled or cancelled.
//!
//! - **`protocol`** – the unit of exchange with worker processes: a
//!   [`Frame`] carrying a terminal flag, an opcode (`Data` or `Error`) and a
//!   payload, plus a small length-prefixed transport and the
//!   `<procedure>,<arguments>` call payload format.
//!
//! This crate has no dependency on TLS, serialization formats or process
//! management; those live in `tickwire-server` and `tickwire-worker`.

pub mod protocol;
pub mod reactor;

pub use protocol::{Frame, FrameError, FrameParser, FrameWriter, Opcode, WorkerRequest, WriteStatus};
pub use reactor::{Reactor, ReactorError, Subscription, SubscriptionId, Trigger};

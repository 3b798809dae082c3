//! tickwire-worker library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does the worker do? (for beginners)
//!
//! A worker is a long-running child process that executes named procedures
//! on behalf of the application server.  The server sends a call as one or
//! more frames on the worker's stdin; the worker answers each call with
//! exactly one frame on its stdout:
//!
//! 1. Frames are accumulated until one has its terminal flag set.
//! 2. The accumulated payload `<procedure>,<arguments>` is split at the first
//!    comma and the arguments are decoded (JSON by default).
//! 3. The procedure is looked up in the registry built at startup and run.
//! 4. The result goes back as a `Data` frame, or any failure as an `Error`
//!    frame that names the procedure and the cause.

/// Application layer: call decoding, dispatch and response encoding.
pub mod application;

/// Infrastructure layer: the stdio frame channel.
pub mod infrastructure;

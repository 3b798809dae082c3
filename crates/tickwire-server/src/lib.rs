//! tickwire-server library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does the server do? (for beginners)
//!
//! The server listens on a TCP port and upgrades every incoming connection
//! to TLS before anything else happens:
//!
//! 1. The listening socket is watched by the reactor for readability.
//! 2. Each accepted socket is negotiated without blocking, one handshake
//!    attempt per readiness event, bounded by a handshake timeout.
//! 3. Only connections whose handshake completed reach the application
//!    handler; failed or silent peers are closed quietly.

/// Application layer: handlers for secured connections.
pub mod application;

/// Infrastructure layer: acceptor, TLS context and configuration files.
pub mod infrastructure;

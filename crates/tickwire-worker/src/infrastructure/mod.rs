//! Infrastructure layer of the worker: OS-facing adapters.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `tickwire_core`, but MUST NOT be imported by the `application` layer.

pub mod stdio;

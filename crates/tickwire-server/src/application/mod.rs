//! Application layer: what the server does with secured connections.

pub mod echo;

pub use echo::{EchoService, EchoStats};

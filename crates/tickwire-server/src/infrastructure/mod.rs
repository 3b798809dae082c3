//! Infrastructure layer: sockets, TLS material and configuration files.
//!
//! - [`network`]: the TLS-upgrading TCP acceptor and its connection types.
//! - [`tls`]: named crypto options and the rustls context built from them.
//! - [`storage`]: TOML configuration persistence.

pub mod network;
pub mod storage;
pub mod tls;

//! TLS material: named crypto options and the server context built from them.

pub mod context;
pub mod options;

pub use context::{build_server_config, TlsError, ALPN_PROTOCOLS_KEY};
pub use options::{CryptoOptions, CryptoRole, OptionError, OptionValue, DEFAULT_HANDSHAKE_TIMEOUT};

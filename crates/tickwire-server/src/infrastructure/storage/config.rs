//! TOML configuration of the tickwire server.
//!
//! # File layout (for beginners)
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0"
//! port = 8443
//! log_level = "info"
//!
//! [crypto]
//! pemCertFile = "/etc/tickwire/server.pem"
//! pemCertPassphrase = "secret"
//! handshakeTimeout = 2.5
//!
//! [crypto.context]
//! alpn_protocols = "h2,http/1.1"
//! ```
//!
//! Keys under `[crypto]` are the acceptor's named crypto options, passed
//! through verbatim; `[crypto.context]` holds free-form TLS context options.
//! A missing file yields [`AppConfig::default`], and every absent field takes
//! its default through `#[serde(default = ...)]`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::infrastructure::tls::OptionValue;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration stored on disk.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub crypto: CryptoSection,
}

/// Listening socket and logging settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Fallback `tracing` filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Named crypto options plus free-form TLS context options.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CryptoSection {
    #[serde(default)]
    pub context: BTreeMap<String, OptionValue>,
    #[serde(flatten)]
    pub options: BTreeMap<String, OptionValue>,
}

impl CryptoSection {
    /// Every crypto option in application order: named options first, then
    /// the context table.  Null values are dropped.
    pub fn entries(&self) -> impl Iterator<Item = (&str, OptionValue)> + '_ {
        self.options
            .iter()
            .chain(self.context.iter())
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| (name.as_str(), value.clone()))
    }

    /// Sets a named option, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<OptionValue>) {
        self.options.insert(name.into(), value.into());
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8443
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

// ── Load ──────────────────────────────────────────────────────────────────────

/// Loads the configuration at `path`, or the defaults if it does not exist.
///
/// # Errors
///
/// [`ConfigError::Io`] for read failures other than "not found", and
/// [`ConfigError::Parse`] for malformed TOML.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let cfg: AppConfig = toml::from_str(&content)?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Named crypto options of the TLS acceptor.
//!
//! Options are set by name so they can come from a config file, a CLI flag or
//! code alike:
//!
//! | Name                 | Alias(es)                          | Default  |
//! |----------------------|------------------------------------|----------|
//! | `pemCertFile`        | `pem_cert_file`, `local_cert`      | none     |
//! | `pemCertPassphrase`  | `pem_cert_passphrase`, `passphrase`| none     |
//! | `allowSelfSigned`    | `allow_self_signed`                | `true`   |
//! | `certAuthorityFile`  | `cert_authority_file`, `cafile`    | none     |
//! | `certAuthorityDir`   | `cert_authority_dir`, `capath`     | none     |
//! | `verifyPeer`         | `verify_peer`                      | `false`  |
//! | `ciphers`            |                                    | provider defaults |
//! | `disableCompression` | `disable_compression`              | `true`   |
//! | `handshakeTimeout`   | `handshake_timeout`                | 1 second |
//! | `cryptoType`         | `crypto_type`                      | `server` |
//!
//! Any other name is stored verbatim in [`CryptoOptions::extensions`] and
//! handed to the TLS context builder.
//!
//! `allowSelfSigned` and `disableCompression` are accepted and stored but do
//! not change the TLS context: rustls never negotiates compression, and with
//! `verifyPeer` a client certificate must always chain to the configured
//! authorities (a self-signed one passes only when it is listed there itself).
//! [`build_server_config`](super::build_server_config) logs both at `debug!`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::trace;

/// Default time a connection gets to complete its handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors raised when an option value has the wrong shape.
#[derive(Debug, Error, PartialEq)]
pub enum OptionError {
    #[error("option `{option}` expects {expected}, got {found}")]
    InvalidValue {
        option: &'static str,
        expected: &'static str,
        found: String,
    },

    #[error("unsupported crypto type {0:?}; only `server` is supported")]
    UnsupportedRole(String),
}

// ── Values ────────────────────────────────────────────────────────────────────

/// Loosely typed option value, as it arrives from a config map.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl OptionValue {
    pub fn is_null(&self) -> bool {
        matches!(self, OptionValue::Null)
    }

    fn as_bool(&self, option: &'static str) -> Result<bool, OptionError> {
        match self {
            OptionValue::Bool(b) => Ok(*b),
            OptionValue::Number(n) => Ok(*n != 0.0),
            OptionValue::Text(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(self.invalid(option, "a boolean")),
            },
            OptionValue::Null => Err(self.invalid(option, "a boolean")),
        }
    }

    fn as_text(&self, option: &'static str) -> Result<String, OptionError> {
        match self {
            OptionValue::Text(s) => Ok(s.clone()),
            _ => Err(self.invalid(option, "a string")),
        }
    }

    fn as_seconds(&self, option: &'static str) -> Result<f64, OptionError> {
        let secs = match self {
            OptionValue::Number(n) => Some(*n),
            OptionValue::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match secs {
            Some(s) if s.is_finite() && s >= 0.0 => Ok(s),
            _ => Err(self.invalid(option, "a non-negative number of seconds")),
        }
    }

    fn as_duration(&self, option: &'static str) -> Result<Duration, OptionError> {
        let secs = self.as_seconds(option)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|_| self.invalid(option, "a number of seconds that fits a duration"))
    }

    fn invalid(&self, option: &'static str, expected: &'static str) -> OptionError {
        OptionError::InvalidValue {
            option,
            expected,
            found: self.to_string(),
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Null => f.write_str("null"),
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Number(n) => write!(f, "{n}"),
            OptionValue::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        OptionValue::Number(value)
    }
}

impl From<u64> for OptionValue {
    fn from(value: u64) -> Self {
        OptionValue::Number(value as f64)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Text(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Text(value)
    }
}

impl From<&std::path::Path> for OptionValue {
    fn from(value: &std::path::Path) -> Self {
        OptionValue::Text(value.to_string_lossy().into_owned())
    }
}

impl<T: Into<OptionValue>> From<Option<T>> for OptionValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(OptionValue::Null, Into::into)
    }
}

// ── Role ──────────────────────────────────────────────────────────────────────

/// Which side of the handshake the acceptor plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum CryptoRole {
    #[default]
    Server,
}

impl std::str::FromStr for CryptoRole {
    type Err = OptionError;

    fn from_str(s: &str) -> Result<Self, OptionError> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "server" | "tls_server" => Ok(CryptoRole::Server),
            _ => Err(OptionError::UnsupportedRole(s.to_string())),
        }
    }
}

// ── Options ───────────────────────────────────────────────────────────────────

/// Crypto configuration of a [`TcpCryptoAcceptor`](crate::infrastructure::network::TcpCryptoAcceptor).
#[derive(Debug, Clone, PartialEq)]
pub struct CryptoOptions {
    /// PEM file holding the certificate chain and the private key.
    pub pem_cert_file: Option<PathBuf>,
    /// Passphrase of the private key.
    pub pem_cert_passphrase: Option<String>,
    pub allow_self_signed: bool,
    pub cert_authority_file: Option<PathBuf>,
    pub cert_authority_dir: Option<PathBuf>,
    /// Require and verify client certificates.
    pub verify_peer: bool,
    /// Colon-separated cipher suite names; `!NAME` removes a suite.
    pub ciphers: Option<String>,
    pub disable_compression: bool,
    pub handshake_timeout: Duration,
    pub crypto_role: CryptoRole,
    /// Options outside the fixed vocabulary, keyed by their verbatim name.
    pub extensions: BTreeMap<String, OptionValue>,
}

impl Default for CryptoOptions {
    fn default() -> Self {
        Self {
            pem_cert_file: None,
            pem_cert_passphrase: None,
            allow_self_signed: true,
            cert_authority_file: None,
            cert_authority_dir: None,
            verify_peer: false,
            ciphers: None,
            disable_compression: true,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            crypto_role: CryptoRole::Server,
            extensions: BTreeMap::new(),
        }
    }
}

impl CryptoOptions {
    /// Sets one option by name.
    ///
    /// Null values clear optional settings and reset the others to their
    /// default.  Unknown names go to [`extensions`](Self::extensions).
    ///
    /// # Errors
    ///
    /// Returns an [`OptionError`] if the value has the wrong shape.
    pub fn set_option(&mut self, name: &str, value: OptionValue) -> Result<&mut Self, OptionError> {
        trace!(option = name, %value, "setting crypto option");
        let defaults = CryptoOptions::default();
        let null = value.is_null();

        match name {
            "pemCertFile" | "pem_cert_file" | "local_cert" => {
                self.pem_cert_file = (!null)
                    .then(|| value.as_text("pemCertFile").map(PathBuf::from))
                    .transpose()?;
            }
            "pemCertPassphrase" | "pem_cert_passphrase" | "passphrase" => {
                self.pem_cert_passphrase = (!null)
                    .then(|| value.as_text("pemCertPassphrase"))
                    .transpose()?;
            }
            "allowSelfSigned" | "allow_self_signed" => {
                self.allow_self_signed = if null {
                    defaults.allow_self_signed
                } else {
                    value.as_bool("allowSelfSigned")?
                };
            }
            "certAuthorityFile" | "cert_authority_file" | "cafile" => {
                self.cert_authority_file = (!null)
                    .then(|| value.as_text("certAuthorityFile").map(PathBuf::from))
                    .transpose()?;
            }
            "certAuthorityDir" | "cert_authority_dir" | "capath" => {
                self.cert_authority_dir = (!null)
                    .then(|| value.as_text("certAuthorityDir").map(PathBuf::from))
                    .transpose()?;
            }
            "verifyPeer" | "verify_peer" => {
                self.verify_peer = if null {
                    defaults.verify_peer
                } else {
                    value.as_bool("verifyPeer")?
                };
            }
            "ciphers" => {
                self.ciphers = (!null).then(|| value.as_text("ciphers")).transpose()?;
            }
            "disableCompression" | "disable_compression" => {
                self.disable_compression = if null {
                    defaults.disable_compression
                } else {
                    value.as_bool("disableCompression")?
                };
            }
            "handshakeTimeout" | "handshake_timeout" => {
                self.handshake_timeout = if null {
                    defaults.handshake_timeout
                } else {
                    value.as_duration("handshakeTimeout")?
                };
            }
            "cryptoType" | "crypto_type" => {
                self.crypto_role = if null {
                    defaults.crypto_role
                } else {
                    value.as_text("cryptoType")?.parse()?
                };
            }
            other => {
                if null {
                    self.extensions.remove(other);
                } else {
                    self.extensions.insert(other.to_string(), value);
                }
            }
        }
        Ok(self)
    }

    /// Applies every non-null entry of `options` in iteration order.
    ///
    /// # Errors
    ///
    /// Stops at, and returns, the first [`OptionError`].
    pub fn set_all_options<I, K>(&mut self, options: I) -> Result<&mut Self, OptionError>
    where
        I: IntoIterator<Item = (K, OptionValue)>,
        K: AsRef<str>,
    {
        for (name, value) in options {
            if !value.is_null() {
                self.set_option(name.as_ref(), value)?;
            }
        }
        Ok(self)
    }

    /// Handshake timeout rounded up to a whole multiple of `resolution`.
    pub fn handshake_timeout_at(&self, resolution: Duration) -> Duration {
        let res = resolution.as_nanos();
        if res == 0 {
            return self.handshake_timeout;
        }
        let ticks = self.handshake_timeout.as_nanos().div_ceil(res);
        let nanos = ticks.saturating_mul(res).min(u64::MAX as u128) as u64;
        Duration::from_nanos(nanos)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

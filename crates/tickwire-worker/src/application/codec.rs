//! Argument codecs: how the `<encoded-argument-list>` half of a call payload
//! becomes procedure arguments, and how results and failures become response
//! payloads.
//!
//! # Choosing a codec (for beginners)
//!
//! - [`JsonCodec`] (the default) treats the argument list as a JSON array.
//!   Procedures registered with
//!   [`ProcedureRegistry::register_typed`](super::registry::ProcedureRegistry::register_typed)
//!   declare a Rust tuple of argument types and any `Serialize` result type;
//!   `serde` does the conversion.
//! - [`RawCodec`] passes bytes straight through.  Useful when the calling side
//!   already has its own serialization and only wants named dispatch.
//!
//! Both codecs report failures as a JSON object (see
//! [`ProcedureFailure`](super::registry::ProcedureFailure)); raw bytes have no
//! structure to carry a message, a procedure name and a cause chain.

use serde_json::Value;
use thiserror::Error;

use super::registry::ProcedureFailure;

/// Errors raised while decoding arguments or encoding results.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// The argument list decoded to something other than an array.
    #[error("argument list must be a JSON array, found {found}")]
    NotAnArray { found: &'static str },
}

/// Converts between wire payloads and the values procedures work with.
pub trait Codec {
    /// What a procedure receives.
    type Args;
    /// What a procedure returns.
    type Output;

    /// Short name for logs (`"json"`, `"raw"`).
    fn name(&self) -> &'static str;

    /// Decodes the argument half of a call payload.
    fn decode_args(&self, bytes: &[u8]) -> Result<Self::Args, CodecError>;

    /// Encodes a procedure's return value as a response payload.
    fn encode_output(&self, output: &Self::Output) -> Result<Vec<u8>, CodecError>;

    /// Encodes a failure report as an error-frame payload.
    fn encode_failure(&self, failure: &ProcedureFailure) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(failure)?)
    }
}

// ── JSON ──────────────────────────────────────────────────────────────────────

/// Full structural serialization through `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Args = Vec<Value>;
    type Output = Value;

    fn name(&self) -> &'static str {
        "json"
    }

    /// An empty (or all-whitespace) argument list decodes as `[]`.
    fn decode_args(&self, bytes: &[u8]) -> Result<Vec<Value>, CodecError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        match serde_json::from_slice(bytes)? {
            Value::Array(items) => Ok(items),
            other => Err(CodecError::NotAnArray {
                found: json_kind(&other),
            }),
        }
    }

    fn encode_output(&self, output: &Value) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(output)?)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Raw ───────────────────────────────────────────────────────────────────────

/// Pass-through codec: procedures see and return raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Args = Vec<u8>;
    type Output = Vec<u8>;

    fn name(&self) -> &'static str {
        "raw"
    }

    fn decode_args(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }

    fn encode_output(&self, output: &Vec<u8>) -> Result<Vec<u8>, CodecError> {
        Ok(output.clone())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

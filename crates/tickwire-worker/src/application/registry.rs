//! Named-procedure dispatch table and the error types of a failed invocation.
//!
//! The registry is built once at startup: every callable procedure is
//! registered under a name, and a call payload can only reach what was
//! registered.  There is no lookup by reflection.
//!
//! # Registering procedures (for beginners)
//!
//! ```rust
//! use tickwire_worker::application::registry::ProcedureRegistry;
//! use tickwire_worker::application::codec::JsonCodec;
//!
//! let mut registry = ProcedureRegistry::<JsonCodec>::new();
//! registry
//!     .register_typed("add", |(a, b): (i64, i64), _console| Ok(a + b))
//!     .unwrap();
//! assert!(registry.contains("add"));
//! ```
//!
//! The argument tuple is decoded from the call's JSON array, so the call
//! payload `add,[2,3]` invokes the closure with `(2, 3)`.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tickwire_core::protocol::{RequestError, PROCEDURE_DELIMITER};
use tracing::{trace, warn};

use super::capture::Console;
use super::codec::{Codec, CodecError, JsonCodec};

/// Boxed error carried as the cause of a [`ProcedureError`].
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A registered procedure, already adapted to its codec's argument type.
pub type Procedure<C> =
    Box<dyn FnMut(<C as Codec>::Args, &mut Console) -> anyhow::Result<<C as Codec>::Output>>;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Rejected registrations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("procedure name {0:?} is invalid: names must be non-empty and contain no comma")]
    InvalidName(String),

    #[error("procedure `{0}` is already registered")]
    Duplicate(String),
}

/// Failures that happen around a procedure rather than inside it.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no procedure named `{0}` is registered")]
    UnknownProcedure(String),

    #[error("malformed call payload: {0}")]
    Malformed(RequestError),

    #[error("could not decode arguments: {0}")]
    Decode(CodecError),

    #[error("could not encode result: {0}")]
    Encode(CodecError),
}

/// A call that did not produce a result.
///
/// The display message is the one reported to the caller; the original error
/// is kept as [`source`](std::error::Error::source).
#[derive(Debug, Error)]
#[error("uncaught error encountered while invoking {procedure}")]
pub struct ProcedureError {
    procedure: String,
    #[source]
    cause: BoxError,
}

impl ProcedureError {
    pub fn new(procedure: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self {
            procedure: procedure.into(),
            cause: cause.into(),
        }
    }

    /// Name of the procedure that was being invoked.
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// The original error.
    pub fn cause(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.cause.as_ref()
    }

    /// Builds the caller-facing report of this failure.
    pub fn report(&self) -> ProcedureFailure {
        let mut causes = Vec::new();
        let mut next: Option<&(dyn StdError + 'static)> = Some(self.cause.as_ref());
        while let Some(err) = next {
            causes.push(err.to_string());
            next = err.source();
        }
        ProcedureFailure {
            message: self.to_string(),
            procedure: self.procedure.clone(),
            cause: self.cause.to_string(),
            causes,
        }
    }
}

/// Serialized payload of an error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureFailure {
    /// `"uncaught error encountered while invoking {procedure}"`.
    pub message: String,
    pub procedure: String,
    /// Display of the original error.
    pub cause: String,
    /// The original error followed by each of its sources.
    pub causes: Vec<String>,
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Name → procedure table for one codec.
pub struct ProcedureRegistry<C: Codec> {
    procedures: HashMap<String, Procedure<C>>,
}

impl<C: Codec> Default for ProcedureRegistry<C> {
    fn default() -> Self {
        Self {
            procedures: HashMap::new(),
        }
    }
}

impl<C: Codec> ProcedureRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a procedure operating directly on the codec's argument and
    /// output types.
    ///
    /// # Errors
    ///
    /// [`RegistryError::InvalidName`] for an empty name or one containing the
    /// procedure delimiter, [`RegistryError::Duplicate`] if the name is taken.
    pub fn register<F>(&mut self, name: &str, procedure: F) -> Result<&mut Self, RegistryError>
    where
        F: FnMut(C::Args, &mut Console) -> anyhow::Result<C::Output> + 'static,
    {
        if name.is_empty() || name.as_bytes().contains(&PROCEDURE_DELIMITER) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        if self.procedures.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.procedures.insert(name.to_string(), Box::new(procedure));
        trace!(procedure = name, "procedure registered");
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.procedures.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.procedures.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Runs the procedure registered as `name`.
    ///
    /// # Errors
    ///
    /// A [`ProcedureError`] whose cause is [`DispatchError::UnknownProcedure`]
    /// or the error the procedure returned.
    pub fn invoke(
        &mut self,
        name: &str,
        args: C::Args,
        console: &mut Console,
    ) -> Result<C::Output, ProcedureError> {
        let procedure = self.procedures.get_mut(name).ok_or_else(|| {
            warn!(procedure = name, "call to unregistered procedure");
            ProcedureError::new(name, DispatchError::UnknownProcedure(name.to_string()))
        })?;
        procedure(args, console).map_err(|err| ProcedureError::new(name, err))
    }
}

impl ProcedureRegistry<JsonCodec> {
    /// Registers a procedure with typed arguments and result.
    ///
    /// `A` is decoded from the call's JSON argument array (use a tuple such as
    /// `(String,)` or `(i64, i64)`), and the returned `R` is serialized back to
    /// JSON.  A mismatched argument list fails the call with a cause naming the
    /// procedure.
    pub fn register_typed<A, R, F>(
        &mut self,
        name: &str,
        mut procedure: F,
    ) -> Result<&mut Self, RegistryError>
    where
        A: DeserializeOwned,
        R: Serialize,
        F: FnMut(A, &mut Console) -> anyhow::Result<R> + 'static,
    {
        let label = name.to_string();
        self.register(name, move |args: Vec<Value>, console: &mut Console| {
            let typed: A = serde_json::from_value(Value::Array(args))
                .map_err(CodecError::from)
                .with_context(|| format!("invalid arguments for `{label}`"))?;
            let output = procedure(typed, console)?;
            let value = serde_json::to_value(output)
                .map_err(CodecError::from)
                .with_context(|| format!("could not encode result of `{label}`"))?;
            Ok(value)
        })
    }
}

impl<C: Codec> fmt::Debug for ProcedureRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureRegistry")
            .field("procedures", &self.names())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::codec::RawCodec;
    use serde_json::json;
    use std::io::Write;

    fn json_registry() -> ProcedureRegistry<JsonCodec> {
        let mut registry = ProcedureRegistry::new();
        registry
            .register_typed("echo", |(text,): (String,), _| Ok(text))
            .unwrap()
            .register_typed("div", |(a, b): (i64, i64), _| {
                if b == 0 {
                    anyhow::bail!("division by zero");
                }
                Ok(a / b)
            })
            .unwrap();
        registry
    }

    // ── Registration ──────────────────────────────────────────────────────────

    #[test]
    fn test_register_rejects_name_with_delimiter() {
        let mut registry = ProcedureRegistry::<RawCodec>::new();
        let err = registry.register("a,b", |args, _| Ok(args)).unwrap_err();
        assert_eq!(err, RegistryError::InvalidName("a,b".to_string()));
    }

    #[test]
    fn test_register_rejects_empty_name() {
        let mut registry = ProcedureRegistry::<RawCodec>::new();
        assert!(matches!(
            registry.register("", |args, _| Ok(args)),
            Err(RegistryError::InvalidName(_))
        ));
    }

    #[test]
    fn test_register_rejects_duplicate_name() {
        let mut registry = json_registry();
        let err = registry
            .register_typed("echo", |(text,): (String,), _| Ok(text))
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("echo".to_string()));
    }

    #[test]
    fn test_names_are_sorted() {
        assert_eq!(json_registry().names(), vec!["div", "echo"]);
    }

    // ── Invocation ────────────────────────────────────────────────────────────

    #[test]
    fn test_invoke_typed_procedure_returns_json_value() {
        // Arrange
        let mut registry = json_registry();
        let mut console = Console::default();

        // Act
        let out = registry
            .invoke("div", vec![json!(9), json!(3)], &mut console)
            .unwrap();

        // Assert
        assert_eq!(out, json!(3));
    }

    #[test]
    fn test_invoke_unknown_procedure_names_it() {
        let mut registry = json_registry();
        let err = registry
            .invoke("missing", Vec::new(), &mut Console::default())
            .unwrap_err();

        assert_eq!(err.procedure(), "missing");
        assert_eq!(
            err.to_string(),
            "uncaught error encountered while invoking missing"
        );
        assert_eq!(
            err.cause().to_string(),
            "no procedure named `missing` is registered"
        );
    }

    #[test]
    fn test_procedure_error_keeps_original_cause() {
        // Arrange
        let mut registry = json_registry();

        // Act
        let err = registry
            .invoke("div", vec![json!(1), json!(0)], &mut Console::default())
            .unwrap_err();
        let report = err.report();

        // Assert
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("division by zero"));
        assert_eq!(report.procedure, "div");
        assert_eq!(report.cause, "division by zero");
        assert_eq!(report.message, "uncaught error encountered while invoking div");
    }

    #[test]
    fn test_typed_argument_mismatch_reports_full_chain() {
        let mut registry = json_registry();
        let err = registry
            .invoke("div", vec![json!("x")], &mut Console::default())
            .unwrap_err();
        let report = err.report();

        assert_eq!(report.cause, "invalid arguments for `div`");
        assert!(report.causes.len() >= 2, "chain: {:?}", report.causes);
        assert!(report.causes[1].starts_with("JSON codec error"));
    }

    #[test]
    fn test_procedure_can_write_to_console() {
        let mut registry = ProcedureRegistry::<RawCodec>::new();
        registry
            .register("shout", |args, console| {
                console.write_all(b"log line")?;
                Ok(args.to_ascii_uppercase())
            })
            .unwrap();
        let mut console = Console::default();

        let out = registry.invoke("shout", b"hey".to_vec(), &mut console).unwrap();

        assert_eq!(out, b"HEY");
        assert_eq!(console.contents(), b"log line");
    }
}

//! tickwire worker process entry point.
//!
//! Reads framed procedure calls from stdin, answers each with one frame on
//! stdout, and exits when stdin closes.
//!
//! # Usage
//!
//! ```text
//! tickwire-worker [OPTIONS]
//!
//! Options:
//!   --codec <CODEC>   Argument codec: json | raw [default: json]
//! ```
//!
//! Logs go to stderr because stdout carries frames.  The level is controlled
//! by `RUST_LOG` (default `info`).
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ StdioChannel::open()       -- non-blocking stdin/stdout frame channel,
//!                                   process stdout diverted to /dev/null
//!  └─ ProcedureRegistry          -- built-in procedures for the chosen codec
//!  └─ serve(reactor, service)    -- read/write subscriptions
//!  └─ reactor.run()              -- until stdin closes
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tickwire_core::Reactor;
use tickwire_worker::application::{
    serve, Codec, JsonCodec, ProcedureRegistry, RawCodec, RegistryError, WorkerRpcService,
};
use tickwire_worker::infrastructure::stdio::StdioChannel;

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CodecKind {
    /// Arguments are a JSON array, results are JSON values.
    Json,
    /// Arguments and results are passed through as raw bytes.
    Raw,
}

/// Framed remote-procedure worker.
#[derive(Debug, Parser)]
#[command(
    name = "tickwire-worker",
    about = "Framed remote-procedure worker reading calls from stdin",
    version
)]
struct Cli {
    /// How call arguments and results are encoded.
    #[arg(long, value_enum, default_value_t = CodecKind::Json, env = "TICKWIRE_WORKER_CODEC")]
    codec: CodecKind,
}

// ── Built-in procedures ───────────────────────────────────────────────────────

fn json_procedures() -> Result<ProcedureRegistry<JsonCodec>, RegistryError> {
    let mut registry = ProcedureRegistry::new();
    registry
        .register_typed("echo", |(value,): (serde_json::Value,), _| Ok(value))?
        .register_typed("sum", |(values,): (Vec<i64>,), _| {
            values
                .iter()
                .try_fold(0i64, |acc, v| acc.checked_add(*v))
                .context("sum overflowed")
        })?
        .register_typed("upper", |(text,): (String,), _| Ok(text.to_uppercase()))?
        .register_typed("divide", |(a, b): (f64, f64), _| {
            if b == 0.0 {
                anyhow::bail!("division by zero");
            }
            Ok(a / b)
        })?;
    Ok(registry)
}

fn raw_procedures() -> Result<ProcedureRegistry<RawCodec>, RegistryError> {
    let mut registry = ProcedureRegistry::new();
    registry
        .register("echo", |bytes: Vec<u8>, _| Ok(bytes))?
        .register("reverse", |mut bytes: Vec<u8>, _| {
            bytes.reverse();
            Ok(bytes)
        })?;
    Ok(registry)
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    info!(codec = ?cli.codec, "tickwire worker starting");

    let channel = StdioChannel::open().context("failed to open the stdio frame channel")?;

    match cli.codec {
        CodecKind::Json => run(JsonCodec, json_procedures()?, channel),
        CodecKind::Raw => run(RawCodec, raw_procedures()?, channel),
    }
}

fn run<C: Codec + 'static>(
    codec: C,
    registry: ProcedureRegistry<C>,
    channel: StdioChannel,
) -> anyhow::Result<()> {
    info!(procedures = ?registry.names(), "procedures registered");

    let (read_fd, write_fd) = (channel.read_fd(), channel.write_fd());
    let (reader, writer) = channel.into_parts();
    let service = Rc::new(RefCell::new(WorkerRpcService::new(
        codec, registry, reader, writer,
    )));

    let reactor = Reactor::new();
    serve(&reactor, Rc::clone(&service), read_fd, write_fd);
    reactor.run().context("worker event loop failed")?;

    info!(calls = service.borrow().calls_served(), "tickwire worker stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tickwire_worker::application::capture::Console;

    #[test]
    fn test_cli_defaults_to_json_codec() {
        let cli = Cli::parse_from(["tickwire-worker"]);
        assert_eq!(cli.codec, CodecKind::Json);
    }

    #[test]
    fn test_cli_accepts_raw_codec() {
        let cli = Cli::parse_from(["tickwire-worker", "--codec", "raw"]);
        assert_eq!(cli.codec, CodecKind::Raw);
    }

    #[test]
    fn test_json_builtins_are_registered() {
        let registry = json_procedures().unwrap();
        assert_eq!(registry.names(), vec!["divide", "echo", "sum", "upper"]);
    }

    #[test]
    fn test_sum_builtin_adds_integers() {
        let mut registry = json_procedures().unwrap();
        let out = registry
            .invoke("sum", vec![json!([1, 2, 3])], &mut Console::default())
            .unwrap();
        assert_eq!(out, json!(6));
    }

    #[test]
    fn test_raw_reverse_builtin() {
        let mut registry = raw_procedures().unwrap();
        let out = registry
            .invoke("reverse", b"abc".to_vec(), &mut Console::default())
            .unwrap();
        assert_eq!(out, b"cba");
    }
}

//! tickwire server entry point.
//!
//! Accepts TLS connections and echoes whatever each secured client sends.
//!
//! # Usage
//!
//! ```text
//! tickwire-server [OPTIONS]
//!
//! Options:
//!   --config <PATH>          TOML configuration file [default: tickwire.toml]
//!   --bind <ADDR>            Address to listen on (overrides [server].bind_address)
//!   --port <PORT>            Port to listen on (overrides [server].port)
//!   --cert <PATH>            PEM certificate and key (overrides [crypto].pemCertFile)
//!   --passphrase <SECRET>    Private key passphrase (overrides [crypto].pemCertPassphrase)
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                    | Flag           |
//! |-----------------------------|----------------|
//! | `TICKWIRE_CONFIG`           | `--config`     |
//! | `TICKWIRE_BIND`             | `--bind`       |
//! | `TICKWIRE_PORT`             | `--port`       |
//! | `TICKWIRE_CERT`             | `--cert`       |
//! | `TICKWIRE_CERT_PASSPHRASE`  | `--passphrase` |
//!
//! `RUST_LOG` wins over `[server].log_level`.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tickwire_core::Reactor;
use tickwire_server::application::EchoService;
use tickwire_server::infrastructure::network::TcpCryptoAcceptor;
use tickwire_server::infrastructure::storage::config::{load_config, AppConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// TLS echo server driven by the tickwire reactor.
#[derive(Debug, Parser)]
#[command(
    name = "tickwire-server",
    about = "TLS-upgrading TCP server driven by the tickwire reactor",
    version
)]
struct Cli {
    /// TOML configuration file.  A missing file means built-in defaults.
    #[arg(long, default_value = "tickwire.toml", env = "TICKWIRE_CONFIG")]
    config: PathBuf,

    /// Address to listen on.
    #[arg(long, env = "TICKWIRE_BIND")]
    bind: Option<String>,

    /// Port to listen on.
    #[arg(long, env = "TICKWIRE_PORT")]
    port: Option<u16>,

    /// PEM file holding the certificate chain and private key.
    #[arg(long, env = "TICKWIRE_CERT")]
    cert: Option<PathBuf>,

    /// Passphrase of the private key.
    #[arg(long, env = "TICKWIRE_CERT_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,
}

impl Cli {
    /// Applies command-line overrides on top of the file configuration.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(cert) = &self.cert {
            config.crypto.set("pemCertFile", cert.as_path());
        }
        if let Some(passphrase) = &self.passphrase {
            config.crypto.set("pemCertPassphrase", passphrase.as_str());
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    cli.apply(&mut config);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    info!(config = %cli.config.display(), "tickwire server starting");

    let reactor = Reactor::new();
    let echo = EchoService::new(&reactor);

    let mut acceptor = TcpCryptoAcceptor::new(
        &reactor,
        config.server.bind_address.as_str(),
        config.server.port,
    );
    acceptor
        .set_all_options(config.crypto.entries())
        .context("invalid [crypto] configuration")?;
    let addr = acceptor
        .listen(echo.handler())
        .context("failed to start the TLS acceptor")?;
    info!(%addr, "accepting TLS connections");

    reactor.run().context("server event loop failed")?;

    let stats = echo.stats();
    info!(
        sessions = stats.accepted,
        bytes_echoed = stats.bytes_echoed,
        "tickwire server stopped"
    );
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

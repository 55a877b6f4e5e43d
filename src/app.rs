use std::io;
use std::sync::Arc;

use anyhow::Result;
use bon::Builder;
use tracing::instrument;

use crate::cli::{Command, LogLevel, OutputFormat};
use crate::config::PrinterConfig;
use crate::error::DiscoveryError;
use crate::hw::{BleAdapter, BtleplugAdapter, FakeBackendConfig, FakeBleAdapter};
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};

/// Which BLE stack a command talks to.
#[derive(Debug, Clone)]
pub enum Backend {
    /// The host's Bluetooth adapters.
    Real,
    /// A simulated printer.
    Fake(FakeBackendConfig),
}

impl Backend {
    #[must_use]
    pub fn is_fake(&self) -> bool {
        matches!(self, Self::Fake(_))
    }

    /// Opens the adapter. Real adapters are only touched here.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::AdapterUnavailable`] when no Bluetooth
    /// adapter can be used.
    pub async fn adapter(&self) -> Result<Arc<dyn BleAdapter>, DiscoveryError> {
        match self {
            Self::Real => Ok(Arc::new(BtleplugAdapter::new().await?)),
            Self::Fake(config) => Ok(Arc::new(FakeBleAdapter::new(config.clone()))),
        }
    }
}

/// A fully resolved CLI run.
#[derive(Debug, Clone, Builder)]
pub struct Invocation {
    command: Command,
    #[builder(default)]
    config: PrinterConfig,
    #[builder(default = Backend::Real)]
    backend: Backend,
    output_format: Option<OutputFormat>,
    log_level: Option<LogLevel>,
}

impl Invocation {
    #[must_use]
    pub fn command(&self) -> &Command {
        &self.command
    }

    #[must_use]
    pub fn config(&self) -> &PrinterConfig {
        &self.config
    }

    #[must_use]
    pub fn backend(&self) -> &Backend {
        &self.backend
    }
}

/// Runs the CLI command against the process terminal.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = peripage::Args::try_parse_from([
///     "peripage",
///     "--output",
///     "json",
///     "--fake",
///     "--fake-scan",
///     "AA:BB:CC:DD:EE:FF|Peripage|-40",
///     "print",
///     "Hello",
/// ])?;
/// let mut out = Vec::new();
/// peripage::run(args.into_invocation(), &mut out).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the printer fails, or
/// output writing fails.
pub async fn run<W>(invocation: Invocation, out: &mut W) -> Result<()>
where
    W: io::Write + Send,
{
    run_with_clients(invocation, out, &SystemTerminalClient).await
}

/// Runs the CLI command with an injected terminal client.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the printer fails, or
/// output writing fails.
#[instrument(
    skip(invocation, out, terminal_client),
    level = "info",
    fields(command = %command_name(&invocation.command), fake = invocation.backend.is_fake())
)]
pub async fn run_with_clients<W>(
    invocation: Invocation,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
) -> Result<()>
where
    W: io::Write + Send,
{
    let Invocation {
        command,
        config,
        backend,
        output_format,
        log_level,
    } = invocation;

    telemetry::initialise_tracing(
        "peripage",
        terminal_client.stderr_is_terminal(),
        log_level.map(LogLevel::as_level_filter),
    )?;
    let output_format = output_format.unwrap_or(if terminal_client.stdout_is_terminal() {
        OutputFormat::Pretty
    } else {
        OutputFormat::Json
    });

    match command {
        Command::Scan => {
            crate::cli::scan::run(&backend, &config, out, terminal_client, output_format).await
        }
        Command::Print(args) => {
            crate::cli::print::run(&args, &backend, config, out, terminal_client, output_format)
                .await
        }
        Command::Preview(args) => crate::cli::preview::run(&args, &config, out, output_format),
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Scan => "scan",
        Command::Print(_args) => "print",
        Command::Preview(_args) => "preview",
    }
}

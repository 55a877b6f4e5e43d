use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::app::{Backend, Invocation};
use crate::config::{DEFAULT_DEVICE_NAME, PrinterConfig};
use crate::hw::{AckBehaviour, FakeBackendConfig, HexPayload, ScanFixture};

/// Command-line options for the PeriPage printer tool.
#[derive(Debug, Parser)]
#[command(name = "peripage", about = "Print text on PeriPage BLE thermal printers.")]
pub struct Args {
    /// Log verbosity; overrides `RUST_LOG`.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Output format; defaults to `pretty` on a terminal and `json` otherwise.
    #[arg(long, global = true, value_enum)]
    output: Option<OutputFormat>,
    #[command(flatten)]
    printer: PrinterArgs,
    /// Uses the fake BLE backend with fixture-driven discovery.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake scan fixtures in the form `address|name|rssi;...`.
    #[arg(long, global = true, requires = "fake", required_if_eq("fake", "true"))]
    fake_scan: Option<ScanFixture>,
    /// Fake ready notification as hexadecimal bytes; empty for silence.
    #[arg(long, global = true, requires = "fake")]
    fake_ready: Option<HexPayload>,
    /// Artificial fake discovery delay (e.g. `250ms`, `2s`).
    #[arg(long, global = true, requires = "fake", value_parser = parse_duration)]
    fake_discovery_delay: Option<Duration>,
    /// Makes the fake printer ignore every frame.
    #[arg(long, global = true, requires = "fake")]
    fake_silent: bool,
    #[command(subcommand)]
    command: Command,
}

/// Printer connection settings shared by every command.
#[derive(Debug, Clone, clap::Args)]
pub struct PrinterArgs {
    /// Advertised name or `AA:BB:CC:DD:EE:FF` address of the printer.
    #[arg(long, global = true, env = "PRINTER_DEVICE_NAME", default_value = DEFAULT_DEVICE_NAME)]
    device: String,
    /// How long to scan for the printer.
    #[arg(long, global = true, env = "BLE_SCAN_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    scan_timeout: Duration,
    /// Bound on each connect attempt.
    #[arg(long, global = true, env = "PRINTER_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    timeout: Duration,
    /// Bound on the initialisation exchange.
    #[arg(long, global = true, default_value = "10s", value_parser = parse_duration)]
    handshake_timeout: Duration,
    /// Extra connect attempts after the first failure.
    #[arg(long, global = true, default_value_t = 3)]
    connect_retries: u32,
    /// Extra writes of a frame the printer did not accept.
    #[arg(long, global = true, default_value_t = 3)]
    frame_retries: u32,
    /// Largest single BLE write in bytes.
    #[arg(long, global = true, default_value_t = 512)]
    max_packet_size: usize,
    /// Printable width in pixels.
    #[arg(long, global = true, default_value_t = 384)]
    width: u32,
}

impl PrinterArgs {
    fn printer_config(&self) -> PrinterConfig {
        PrinterConfig::builder()
            .device_filter(self.device.as_str())
            .scan_timeout(self.scan_timeout)
            .connect_timeout(self.timeout)
            .handshake_timeout(self.handshake_timeout)
            .connect_retries(self.connect_retries)
            .frame_retries(self.frame_retries)
            .max_packet_size(self.max_packet_size)
            .print_width_px(self.width)
            .build()
    }
}

impl Args {
    /// Returns the requested log level, if any.
    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    /// Returns the explicitly requested output format, if any.
    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output
    }

    /// Resolves parsed arguments into a runnable invocation.
    ///
    /// ```
    /// use clap::Parser;
    ///
    /// let args = peripage::Args::try_parse_from([
    ///     "peripage",
    ///     "--fake",
    ///     "--fake-scan",
    ///     "AA:BB:CC:DD:EE:FF|Peripage|-40",
    ///     "preview",
    ///     "Hello",
    /// ])?;
    /// let invocation = args.into_invocation();
    /// assert!(invocation.backend().is_fake());
    /// # Ok::<(), clap::Error>(())
    /// ```
    #[must_use]
    pub fn into_invocation(self) -> Invocation {
        let config = self.printer.printer_config();
        let backend = match self.fake_scan.filter(|_| self.fake) {
            Some(scan_fixture) => {
                let fake = FakeArgs {
                    scan_fixture,
                    ready_response: self.fake_ready,
                    discovery_delay: self.fake_discovery_delay.unwrap_or(Duration::ZERO),
                    silent: self.fake_silent,
                };
                Backend::Fake(fake.into_backend_config())
            }
            None => Backend::Real,
        };

        Invocation::builder()
            .command(self.command)
            .config(config)
            .backend(backend)
            .maybe_output_format(self.output)
            .maybe_log_level(self.log_level)
            .build()
    }
}

/// Fake backend arguments for programmatic runs.
#[derive(Debug, Builder)]
pub struct FakeArgs {
    scan_fixture: ScanFixture,
    ready_response: Option<HexPayload>,
    #[builder(default)]
    discovery_delay: Duration,
    #[builder(default)]
    silent: bool,
}

impl FakeArgs {
    /// Converts the arguments into a fake adapter configuration.
    #[must_use]
    pub fn into_backend_config(self) -> FakeBackendConfig {
        let Self {
            scan_fixture,
            ready_response,
            discovery_delay,
            silent,
        } = self;

        let ack_behaviour = if silent {
            AckBehaviour::Silent
        } else {
            AckBehaviour::Always
        };
        FakeBackendConfig::builder()
            .scan_fixture(scan_fixture)
            .maybe_ready_response(ready_response)
            .discovery_delay(discovery_delay)
            .ack_behaviour(ack_behaviour)
            .build()
    }
}

/// Supported CLI commands.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// List advertising BLE devices, marking those matching `--device`.
    Scan,
    /// Print text on the printer.
    Print(PrintArgs),
    /// Render text and show the raster without printing.
    Preview(PreviewArgs),
}

/// Arguments for `print`.
#[derive(Debug, Clone, clap::Args)]
pub struct PrintArgs {
    /// Text to print.
    text: String,
    /// Write the text to stdout instead of a printer.
    #[arg(long)]
    stdout: bool,
    /// Parse the text as JSON and print it pretty-formatted.
    #[arg(long)]
    json: bool,
}

impl PrintArgs {
    /// Creates print arguments for `text`.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            stdout: false,
            json: false,
        }
    }

    /// Routes output to the stand-in printer.
    #[must_use]
    pub fn with_stdout(mut self) -> Self {
        self.stdout = true;
        self
    }

    /// Treats the text as a JSON document.
    #[must_use]
    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub(crate) fn text(&self) -> &str {
        &self.text
    }

    pub(crate) fn stdout(&self) -> bool {
        self.stdout
    }

    pub(crate) fn json(&self) -> bool {
        self.json
    }
}

/// Arguments for `preview`.
#[derive(Debug, Clone, clap::Args)]
pub struct PreviewArgs {
    /// Text to render.
    text: String,
}

impl PreviewArgs {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub(crate) fn text(&self) -> &str {
        &self.text
    }
}

/// Output formats for command results.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables and colours.
    Pretty,
    /// Pretty-printed JSON.
    Json,
}

/// Log verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    #[must_use]
    pub fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::error::ErrorKind;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::hw::DeviceFilter;

    #[test]
    fn fake_mode_requires_scan_fixture() {
        let result = Args::try_parse_from(["peripage", "--fake", "scan"]);

        let error = result.expect_err("missing --fake-scan should fail argument parsing");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn fake_scan_requires_fake_mode() {
        let result = Args::try_parse_from([
            "peripage",
            "--fake-scan",
            "AA:BB:CC:DD:EE:FF|Peripage|-40",
            "scan",
        ]);

        let error = result.expect_err("--fake-scan should require --fake");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn print_parses_text_and_flags() {
        let args = Args::try_parse_from(["peripage", "print", "--stdout", "Hello there"])
            .expect("print arguments should parse");

        let invocation = args.into_invocation();
        assert_matches!(
            invocation.command(),
            Command::Print(print) if print.text() == "Hello there" && print.stdout()
        );
        assert!(!invocation.backend().is_fake());
    }

    #[rstest]
    #[case("5s", Duration::from_secs(5))]
    #[case("1500ms", Duration::from_millis(1_500))]
    fn durations_use_humantime(#[case] raw: &str, #[case] expected: Duration) {
        let args = Args::try_parse_from(["peripage", "--scan-timeout", raw, "scan"])
            .expect("scan arguments should parse");

        assert_eq!(expected, args.into_invocation().config().scan_timeout());
    }

    #[test]
    fn device_flag_sets_filter() {
        let args = Args::try_parse_from(["peripage", "--device", "aa:bb:cc:dd:ee:ff", "scan"])
            .expect("scan arguments should parse");

        assert_eq!(
            &DeviceFilter::Address("aa:bb:cc:dd:ee:ff".to_string()),
            args.into_invocation().config().device_filter()
        );
    }

    #[test]
    fn invalid_duration_is_rejected() {
        let result = Args::try_parse_from(["peripage", "--scan-timeout", "soon", "scan"]);

        let error = result.expect_err("invalid duration should fail");
        assert_eq!(ErrorKind::ValueValidation, error.kind());
    }
}

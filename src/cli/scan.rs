use std::collections::HashMap;
use std::io;

use anyhow::Result;
use serde::Serialize;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::app::Backend;
use crate::cli::OutputFormat;
use crate::config::PrinterConfig;
use crate::hw::{DeviceHandle, ScanStopReason, scan_all};
use crate::protocol::ProtocolProfile;
use crate::terminal::TerminalClient;

use super::ui::{Painter, ScanView, Spinner};

#[derive(Debug, Serialize)]
struct ScanReport<'a> {
    filter: String,
    profile: &'a ProtocolProfile,
    devices: Vec<ScannedDevice<'a>>,
}

#[derive(Debug, Serialize)]
struct ScannedDevice<'a> {
    #[serde(flatten)]
    device: &'a DeviceHandle,
    matches_filter: bool,
}

/// Executes the `scan` command.
#[instrument(skip(backend, config, out, terminal_client), level = "info", fields(?output_format))]
pub(crate) async fn run<W>(
    backend: &Backend,
    config: &PrinterConfig,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let adapter = backend.adapter().await?;
    let spinner = Spinner::new(
        output_format == OutputFormat::Pretty && terminal_client.stderr_is_terminal(),
    );
    let devices = spinner
        .with_spinner("Scanning for BLE devices", || async move {
            let mut stream = scan_all(adapter, config.scan_timeout(), CancellationToken::new());
            let mut seen: HashMap<String, DeviceHandle> = HashMap::new();
            while let Some(device) = stream.next().await {
                seen.insert(device.device_id().to_string(), device);
            }
            match stream.stop_reason() {
                Some(ScanStopReason::Failed(error)) => Err(error.clone()),
                reason => {
                    debug!(?reason, devices = seen.len(), "scan finished");
                    Ok(seen.into_values().collect::<Vec<_>>())
                }
            }
        })
        .await?;
    let devices = sorted_by_signal(devices);

    match output_format {
        OutputFormat::Pretty => {
            let painter = Painter::new(terminal_client.stdout_is_terminal());
            writeln!(
                out,
                "{}",
                ScanView::new(&devices, config.device_filter(), &painter)
            )?;
        }
        OutputFormat::Json => {
            let report = ScanReport {
                filter: config.device_filter().to_string(),
                profile: config.protocol_profile(),
                devices: devices
                    .iter()
                    .map(|device| ScannedDevice {
                        device,
                        matches_filter: config.device_filter().matches(device),
                    })
                    .collect(),
            };
            serde_json::to_writer_pretty(&mut *out, &report)?;
            writeln!(out)?;
        }
    }

    Ok(())
}

fn sorted_by_signal(mut devices: Vec<DeviceHandle>) -> Vec<DeviceHandle> {
    devices.sort_by(|left, right| {
        right
            .rssi()
            .cmp(&left.rssi())
            .then_with(|| left.address().cmp(right.address()))
    });
    devices
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn strongest_signal_sorts_first() {
        let device = |address: &str, rssi: Option<i16>| {
            DeviceHandle::new(format!("fake:{address}"), address.to_string(), None, rssi)
        };
        let devices = vec![device("A", Some(-80)), device("B", None), device("C", Some(-40))];

        let addresses: Vec<String> = sorted_by_signal(devices)
            .iter()
            .map(|device| device.address().to_string())
            .collect();

        assert_eq!(vec!["C", "A", "B"], addresses);
    }
}

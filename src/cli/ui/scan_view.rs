use std::fmt::{self, Display, Formatter};

use crate::hw::{DeviceFilter, DeviceHandle};
use crate::utils::format_rssi;

use super::painter::Painter;
use super::table::Table;

/// Renders discovered devices, flagging those the printer filter selects.
pub(crate) struct ScanView<'a> {
    devices: &'a [DeviceHandle],
    filter: &'a DeviceFilter,
    painter: &'a Painter,
}

impl<'a> ScanView<'a> {
    pub(crate) fn new(
        devices: &'a [DeviceHandle],
        filter: &'a DeviceFilter,
        painter: &'a Painter,
    ) -> Self {
        Self {
            devices,
            filter,
            painter,
        }
    }
}

impl Display for ScanView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.devices.is_empty() {
            return write!(f, "{}", self.painter.warning("No BLE devices found"));
        }

        let rows = self
            .devices
            .iter()
            .map(|device| {
                let matched = if self.filter.matches(device) {
                    self.painter.success("yes")
                } else {
                    self.painter.muted("no")
                };
                vec![
                    device.name().unwrap_or("<unknown>").to_string(),
                    device.address().to_string(),
                    format_rssi(device.rssi()),
                    matched,
                ]
            })
            .collect();
        writeln!(
            f,
            "{}",
            self.painter.heading(format!("Devices ({})", self.filter))
        )?;
        write!(
            f,
            "{}",
            Table::grid(["name", "address", "rssi", "printer"], rows)
        )
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;

    #[test]
    fn scan_view_marks_matching_devices() {
        let devices = vec![
            DeviceHandle::new(
                "fake:AA".to_string(),
                "AA:BB:CC:DD:EE:FF".to_string(),
                Some("Peripage".to_string()),
                Some(-40),
            ),
            DeviceHandle::new(
                "fake:11".to_string(),
                "11:22:33:44:55:66".to_string(),
                None,
                None,
            ),
        ];
        let filter = DeviceFilter::from("Peripage");
        let painter = Painter::new(false);

        assert_snapshot!(ScanView::new(&devices, &filter, &painter).to_string(), @r"
        Devices (name=Peripage)
        ╭───────────┬───────────────────┬─────────┬─────────╮
        │ name      │ address           │ rssi    │ printer │
        ├───────────┼───────────────────┼─────────┼─────────┤
        │ Peripage  │ AA:BB:CC:DD:EE:FF │ -40 dBm │ yes     │
        │ <unknown> │ 11:22:33:44:55:66 │ -       │ no      │
        ╰───────────┴───────────────────┴─────────┴─────────╯
        ");
    }

    #[test]
    fn empty_scan_says_so() {
        let filter = DeviceFilter::from("Peripage");
        let painter = Painter::new(false);

        assert_snapshot!(ScanView::new(&[], &filter, &painter).to_string(), @"No BLE devices found");
    }
}

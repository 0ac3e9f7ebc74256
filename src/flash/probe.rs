//! ST-Link probe discovery.
//!
//! Scans serial ports for targets reachable through an ST-Link probe and
//! produces the [`DeviceHandle`] a flash session operates on.

use serde::{Deserialize, Serialize};
use serialport::{available_ports, SerialPortType};

use super::config::{STLINK_PIDS, STLINK_VID};

/// One physical ST-Link-connected target.
///
/// A handle is owned by at most one active flash session at a time; the
/// orchestrator serializes requests per handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Serial port path of the control UART (e.g. "/dev/ttyACM0" or "COM3").
    pub port: String,
    /// Probe serial number, when the port enumeration exposes one.
    pub probe_serial: Option<String>,
}

impl DeviceHandle {
    pub fn new(port: &str) -> Self {
        Self {
            port: port.to_string(),
            probe_serial: None,
        }
    }
}

/// Information about a detected ST-Link probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StLinkProbe {
    /// Serial port path.
    pub port: String,
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
    /// Probe serial number (if available).
    pub serial_number: Option<String>,
    /// Product name (if available).
    pub product_name: Option<String>,
}

impl StLinkProbe {
    /// Display label for device pickers.
    pub fn display_label(&self) -> String {
        if let Some(ref name) = self.product_name {
            format!("{} ({})", name, self.port)
        } else {
            format!("ST-Link {:04X}:{:04X} ({})", self.vid, self.pid, self.port)
        }
    }

    /// Handle for flashing the target behind this probe.
    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            port: self.port.clone(),
            probe_serial: self.serial_number.clone(),
        }
    }
}

/// Check whether a VID/PID pair is an ST-Link probe.
pub fn is_stlink(vid: u16, pid: u16) -> bool {
    vid == STLINK_VID && STLINK_PIDS.contains(&pid)
}

/// Find all connected ST-Link probes.
///
/// On macOS, `tty.*` ports are skipped; each USB device appears as both
/// `cu.*` and `tty.*` and the `cu.*` variant does not block on DCD.
pub fn find_stlink_probes() -> Vec<StLinkProbe> {
    let mut probes = Vec::new();

    let ports = match available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            log::warn!("serial port enumeration failed: {}", e);
            return probes;
        }
    };

    for port in ports {
        #[cfg(target_os = "macos")]
        if port.port_name.contains("/dev/tty.") {
            continue;
        }

        if let SerialPortType::UsbPort(usb_info) = &port.port_type {
            if is_stlink(usb_info.vid, usb_info.pid) {
                log::debug!(
                    "found ST-Link {:04X}:{:04X} on {}",
                    usb_info.vid,
                    usb_info.pid,
                    port.port_name
                );
                probes.push(StLinkProbe {
                    port: port.port_name.clone(),
                    vid: usb_info.vid,
                    pid: usb_info.pid,
                    serial_number: usb_info.serial_number.clone(),
                    product_name: usb_info.product.clone(),
                });
            }
        }
    }

    probes
}

/// Probe connected to a specific port, if any.
pub fn get_probe_by_port(port_name: &str) -> Option<StLinkProbe> {
    find_stlink_probes()
        .into_iter()
        .find(|p| p.port == port_name)
}

//! Serial transport for the UART control channel.
//!
//! A trait-based abstraction over the physical link, so the mode controller
//! and post-flash tester can run against mock links in tests.

use std::io::Read;
use std::time::Duration;

use serialport::SerialPort;

#[cfg(test)]
use mockall::automock;

use super::config::{CONTROL_BAUD_RATE, MAX_OPEN_RETRIES, OPEN_RETRY_DELAY_MS};
use super::error::{FlashError, Result};

/// Byte-level operations on the control UART.
#[cfg_attr(test, automock)]
pub trait SerialLink: Send {
    /// Write bytes to the link.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read into `buffer`, waiting at most `timeout_ms`.
    ///
    /// Returns the number of bytes read; 0 means the timeout expired with
    /// nothing received.
    fn read(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize>;

    /// Flush buffered output.
    fn flush(&mut self) -> Result<()>;

    /// Discard pending input.
    fn clear_input(&mut self) -> Result<()>;
}

/// Serial port implementation of [`SerialLink`].
///
/// The port is closed when the transport is dropped, on every exit path.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open the control UART at the default baud rate.
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baud(port_name, CONTROL_BAUD_RATE)
    }

    /// Open the control UART with a specific baud rate.
    ///
    /// 8N1, no flow control, DTR and RTS deasserted so the adapter does not
    /// hold the target in reset. Open is retried a few times: after a target
    /// reset the USB-serial adapter may re-enumerate and appear in the port
    /// list before the driver accepts an open.
    pub fn open_with_baud(port_name: &str, baud_rate: u32) -> Result<Self> {
        let normalized = normalize_port_name(port_name);

        let mut attempt = 0;
        loop {
            match serialport::new(&normalized, baud_rate)
                .timeout(Duration::from_millis(100))
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .open()
            {
                Ok(mut port) => {
                    port.write_data_terminal_ready(false).ok();
                    port.write_request_to_send(false).ok();
                    // Let the line settle, then drop whatever the device
                    // emitted while the port was closed.
                    std::thread::sleep(Duration::from_millis(100));
                    port.clear(serialport::ClearBuffer::All).ok();

                    log::info!("opened control UART {} at {} baud", port_name, baud_rate);
                    return Ok(Self { port });
                }
                Err(e) => {
                    attempt += 1;
                    let err_str = e.to_string().to_lowercase();
                    let is_transient = err_str.contains("temporarily unavailable")
                        || err_str.contains("not functioning")
                        || err_str.contains("interrupted");

                    if is_transient && attempt < MAX_OPEN_RETRIES {
                        log::debug!(
                            "open of {} failed ({}), retry {}/{}",
                            port_name,
                            e,
                            attempt,
                            MAX_OPEN_RETRIES
                        );
                        std::thread::sleep(Duration::from_millis(OPEN_RETRY_DELAY_MS));
                        continue;
                    }

                    return Err(FlashError::PortUnavailable {
                        port: port_name.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

impl SerialLink for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        use std::io::Write;
        self.port.write_all(data).map_err(FlashError::Io)
    }

    fn read(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize> {
        self.port
            .set_timeout(Duration::from_millis(timeout_ms))
            .map_err(FlashError::Serial)?;

        match self.port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(FlashError::Io(e)),
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.port.flush().map_err(FlashError::Io)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(FlashError::Serial)
    }
}

/// Normalize a port name for cross-platform compatibility.
pub fn normalize_port_name(name: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        // Prefer cu. over tty. for better compatibility
        if name.starts_with("/dev/tty.") {
            return name.replace("/dev/tty.", "/dev/cu.");
        }
    }

    #[cfg(target_os = "windows")]
    {
        // COM ports > 9 need \\.\\ prefix
        if name.starts_with("COM") {
            if let Ok(n) = name[3..].parse::<u32>() {
                if n > 9 {
                    return format!("\\\\.\\{}", name);
                }
            }
        }
    }

    name.to_string()
}

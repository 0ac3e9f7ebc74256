//! STM32 flashing engine for ST-Link-connected targets.
//!
//! This module orchestrates the full firmware update flow for STM32 devices
//! programmed through an ST-Link probe, with boot-mode control over a UART
//! side channel.
//!
//! # Flow Overview
//!
//! A flash request moves through:
//! 1. **Checksum Gate** - SHA-256 validation before any device interaction
//! 2. **Bootloader Entry** - UART mode command, confirmed by an ack
//! 3. **Erase / Write / Verify** - via the selected programmer backend
//! 4. **Run Mode** - UART mode command returning to application code
//! 5. **Post-Flash Test** - stimulus/response check that the firmware runs
//!
//! Transient failures (a missed ack, a port mid re-enumeration) are retried
//! by the orchestrator; deterministic failures surface immediately with the
//! stage that was being attempted.
//!
//! # Example
//!
//! ```ignore
//! use stm32_flasher::flash::{
//!     BackendChoice, CancelToken, FirmwareImage, FlashOptions, FlashRequest,
//!     DeviceHandle, Orchestrator,
//! };
//!
//! let request = FlashRequest {
//!     device: DeviceHandle::new("/dev/ttyACM0"),
//!     backend: BackendChoice::OpenOcd,
//!     image: FirmwareImage::from_bin_file("firmware.bin", None)?,
//!     options: FlashOptions::default(),
//! };
//! let report = Orchestrator::new().flash(&request, &CancelToken::new(), &|stage| {
//!     println!("{}: {}%", stage.message(), stage.percent());
//! });
//! println!("success: {}", report.flash.success);
//! ```

mod backend;
mod backends;
mod config;
mod error;
mod image;
mod mode;
mod orchestrator;
mod probe;
mod serial;
mod session;
mod tester;

// Configuration
pub use config::{ModeCommand, ModeProtocol, DEFAULT_FLASH_ADDRESS, DEFAULT_RETRY_LIMIT};

// Errors
pub use error::{FlashError, Result};

// Firmware images
pub use image::{sha256_hex, FirmwareImage};

// Probe discovery
pub use probe::{find_stlink_probes, get_probe_by_port, DeviceHandle, StLinkProbe};

// Serial transport and mode control
pub use mode::{ModeControl, ModeState, SerialModeController};
pub use serial::{normalize_port_name, SerialLink, SerialTransport};

// Backends
pub use backend::{create_backend, BackendChoice, ProcessRunner, ProgrammerBackend, ToolRunner};
pub use backends::{CubeProgrammerBackend, OpenOcdBackend, PyStLinkBackend};

// Session and testing
pub use session::{CancelToken, FlashResult, FlashSession, FlashStage};
pub use tester::{
    MatchPolicy, PostFlashTester, StepOutcome, StepResult, TestProfile, TestStep, TestVerdict,
};

// Orchestration
pub use orchestrator::{FlashOptions, FlashRequest, Orchestrator, Report};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify key types are accessible
        let _ = std::any::type_name::<FlashRequest>();
        let _ = std::any::type_name::<FlashStage>();
        let _ = std::any::type_name::<BackendChoice>();
    }
}

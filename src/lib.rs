//! Firmware flashing engine for STM32 targets behind ST-Link probes.
//!
//! The [`flash`] module holds the blocking engine: programmer backends,
//! UART boot-mode control, the flash session state machine, post-flash
//! testing, and the retrying orchestrator. The [`api`] module wraps it for
//! async callers.

pub mod api;
pub mod flash;

#[cfg(test)]
mod test_helpers;

pub use api::{detect_probes, flash_firmware, FlashProgressEvent};
pub use flash::{
    BackendChoice, CancelToken, DeviceHandle, FirmwareImage, FlashError, FlashOptions,
    FlashRequest, FlashResult, FlashStage, Orchestrator, Report, Result, TestProfile, TestVerdict,
};

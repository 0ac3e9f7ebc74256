//! Error types shared by every flashing component.
//!
//! Backend- and platform-specific failures are normalized into this taxonomy
//! before they cross a component boundary; callers only ever see these kinds.

use thiserror::Error;

/// Result type alias for flashing operations.
pub type Result<T> = std::result::Result<T, FlashError>;

/// Errors that can occur while driving a flash session.
#[derive(Debug, Error)]
pub enum FlashError {
    /// Serial port error from the serialport crate.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port could not be opened or went away.
    #[error("Port '{port}' unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },

    /// Mode-switch command was not acknowledged within the timeout.
    /// The target mode is reported as `Unknown` after this error.
    #[error("No acknowledgement for '{command}' within {timeout_ms}ms")]
    NoAck { command: String, timeout_ms: u64 },

    /// The device answered a mode-switch command with something other than
    /// the expected acknowledgement.
    #[error("Unexpected response to '{command}': {response:?}")]
    UnexpectedResponse { command: String, response: String },

    /// Firmware image failed checksum validation before flashing.
    #[error("Firmware checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    /// Firmware image could not be parsed.
    #[error("Invalid firmware image: {reason}")]
    InvalidImage { reason: String },

    /// Flash erase failed.
    #[error("Erase failed: {detail}")]
    EraseFailed { detail: String },

    /// Flash write failed at the given offset into the image.
    #[error("Write failed during {stage} at offset 0x{offset:X}: {detail}")]
    WriteFailed {
        stage: String,
        offset: u32,
        detail: String,
    },

    /// Read-back verification found a byte that differs from the image.
    #[error("Verify mismatch at offset 0x{offset:X}")]
    VerifyMismatch { offset: u32 },

    /// Target reset failed.
    #[error("Target reset failed: {detail}")]
    ResetFailed { detail: String },

    /// The backend's underlying tool is not installed or not on PATH.
    #[error("Programmer tool '{tool}' not found")]
    ToolUnavailable { tool: String },

    /// The backend's underlying tool did not finish within its deadline.
    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    /// Operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,
}

impl FlashError {
    /// Check whether this failure is transient.
    ///
    /// Transient failures (a missed handshake, a port that briefly
    /// disappeared during re-enumeration) are eligible for automatic retry.
    /// Everything else indicates a deterministic problem and is surfaced
    /// immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FlashError::PortUnavailable { .. } | FlashError::NoAck { .. }
        )
    }

    /// Stable error code for reports and support logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            FlashError::Serial(_) => "FLASH-001",
            FlashError::Io(_) => "FLASH-002",
            FlashError::PortUnavailable { .. } => "FLASH-010",
            FlashError::NoAck { .. } => "FLASH-011",
            FlashError::UnexpectedResponse { .. } => "FLASH-012",
            FlashError::ChecksumMismatch { .. } => "FLASH-020",
            FlashError::InvalidImage { .. } => "FLASH-021",
            FlashError::EraseFailed { .. } => "FLASH-030",
            FlashError::WriteFailed { .. } => "FLASH-031",
            FlashError::VerifyMismatch { .. } => "FLASH-032",
            FlashError::ResetFailed { .. } => "FLASH-033",
            FlashError::ToolUnavailable { .. } => "FLASH-040",
            FlashError::ToolTimeout { .. } => "FLASH-041",
            FlashError::Cancelled => "FLASH-099",
        }
    }
}

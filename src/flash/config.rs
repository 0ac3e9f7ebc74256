//! Configuration constants and the pluggable UART mode protocol.

// Allow unused items - timeouts and candidate paths are part of the
// configuration surface even when a given platform build does not use all
// of them.
#![allow(dead_code)]

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::{FlashError, Result};
use super::mode::ModeState;

// ============================================================================
// ST-Link USB Identifiers
// ============================================================================

/// STMicroelectronics USB Vendor ID.
pub const STLINK_VID: u16 = 0x0483;

/// Product IDs for the ST-Link probe generations (V2 through V3).
pub const STLINK_PIDS: &[u16] = &[
    0x3748, // ST-Link V2
    0x374B, // ST-Link V2.1
    0x374D, // ST-Link V2.1 (newer revision)
    0x374E, // ST-Link V3
    0x374F, // ST-Link V3 (alternate)
];

// ============================================================================
// Flash Layout
// ============================================================================

/// Default flash base address for STM32 parts.
pub const DEFAULT_FLASH_ADDRESS: u32 = 0x0800_0000;

// ============================================================================
// Serial Communication
// ============================================================================

/// Baud rate for the UART control channel.
pub const CONTROL_BAUD_RATE: u32 = 115_200;

/// Default timeout waiting for a mode-switch acknowledgement.
pub const ACK_TIMEOUT_MS: u64 = 300;

/// Default timeout waiting for a post-flash test response.
pub const TEST_RESPONSE_TIMEOUT_MS: u64 = 2000;

/// Retries when opening a port that is mid re-enumeration.
pub const MAX_OPEN_RETRIES: u32 = 5;

/// Delay between port open retries.
pub const OPEN_RETRY_DELAY_MS: u64 = 200;

// ============================================================================
// Retry Policy
// ============================================================================

/// Default bound on flash attempts for transient failures.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Pause between flash attempts, giving the device time to settle after a
/// reset.
pub const RETRY_BACKOFF_MS: u64 = 500;

// ============================================================================
// Tool Invocation Deadlines
// ============================================================================

/// Deadline for a tool `--version` probe during discovery.
pub const TOOL_PROBE_TIMEOUT_MS: u64 = 5_000;

/// Deadline for a mass erase.
pub const ERASE_TIMEOUT_MS: u64 = 30_000;

/// Deadline for writing an image.
pub const WRITE_TIMEOUT_MS: u64 = 60_000;

/// Deadline for reading back an image for verification.
pub const READ_TIMEOUT_MS: u64 = 30_000;

/// Deadline for a target reset.
pub const RESET_TIMEOUT_MS: u64 = 30_000;

// ============================================================================
// Tool Discovery Candidates
// ============================================================================

/// Candidate invocations for STM32CubeProgrammer's CLI.
pub fn cube_candidates() -> Vec<String> {
    let mut candidates = vec!["STM32_Programmer_CLI".to_string()];

    #[cfg(target_os = "windows")]
    {
        candidates.push(
            r"C:\Program Files\STMicroelectronics\STM32Cube\STM32CubeProgrammer\bin\STM32_Programmer_CLI.exe"
                .to_string(),
        );
        candidates.push(
            r"C:\Program Files (x86)\STMicroelectronics\STM32Cube\STM32CubeProgrammer\bin\STM32_Programmer_CLI.exe"
                .to_string(),
        );
    }

    #[cfg(target_os = "macos")]
    {
        candidates.push(
            "/Applications/STMicroelectronics/STM32Cube/STM32CubeProgrammer/STM32CubeProgrammer.app/Contents/MacOS/bin/STM32_Programmer_CLI"
                .to_string(),
        );
    }

    candidates.push("/usr/local/bin/STM32_Programmer_CLI".to_string());
    candidates.push("/opt/STM32CubeProgrammer/bin/STM32_Programmer_CLI".to_string());
    candidates
}

/// Candidate invocations for OpenOCD.
pub fn openocd_candidates() -> Vec<String> {
    vec![
        "openocd".to_string(),
        "/usr/bin/openocd".to_string(),
        "/usr/local/bin/openocd".to_string(),
        "/opt/homebrew/bin/openocd".to_string(),
    ]
}

/// Candidate invocations for the pystlink CLI.
pub fn pystlink_candidates() -> Vec<String> {
    vec!["pystlink".to_string(), "pystlink.py".to_string()]
}

// ============================================================================
// Mode Protocol
// ============================================================================

/// One mode-switch command and the acknowledgement that confirms it.
///
/// The command is sent verbatim over the control UART; the transition is
/// confirmed only when the device's reply contains `ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeCommand {
    /// Bytes to send, as text (a trailing newline is the device convention).
    pub command: String,
    /// Substring the acknowledgement must contain.
    pub ack: String,
}

impl ModeCommand {
    pub fn new(command: &str, ack: &str) -> Self {
        Self {
            command: command.to_string(),
            ack: ack.to_string(),
        }
    }
}

/// The UART command vocabulary for boot-mode transitions.
///
/// The exact byte protocol is device-firmware-specific, so it is data rather
/// than code: load a device's definition from JSON with
/// [`ModeProtocol::from_json_file`], or use the default `SET`-with-echo
/// convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeProtocol {
    /// Command entering flash-programming mode.
    pub bootloader: ModeCommand,
    /// Command entering normal application-execution mode.
    pub run: ModeCommand,
    /// Optional command driving a board-level reset.
    #[serde(default)]
    pub reset: Option<ModeCommand>,
    /// Acknowledgement timeout in milliseconds.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
}

fn default_ack_timeout() -> u64 {
    ACK_TIMEOUT_MS
}

impl Default for ModeProtocol {
    fn default() -> Self {
        Self {
            bootloader: ModeCommand::new("SET MODE=BOOT\n", "MODE=BOOT"),
            run: ModeCommand::new("SET MODE=RUN\n", "MODE=RUN"),
            reset: Some(ModeCommand::new("SET MODE=RESET\n", "MODE=RESET")),
            ack_timeout_ms: ACK_TIMEOUT_MS,
        }
    }
}

impl ModeProtocol {
    /// Load a device-specific protocol definition from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| FlashError::InvalidImage {
            reason: format!("invalid mode protocol definition: {}", e),
        })
    }

    /// Look up the command for a target mode.
    ///
    /// Returns `None` for modes that cannot be commanded (`Unknown`, or
    /// `Reset` when the device defines no reset command).
    pub fn command_for(&self, target: ModeState) -> Option<&ModeCommand> {
        match target {
            ModeState::Bootloader => Some(&self.bootloader),
            ModeState::Run => Some(&self.run),
            ModeState::Reset => self.reset.as_ref(),
            ModeState::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_protocol_commands() {
        let protocol = ModeProtocol::default();
        assert_eq!(
            protocol.command_for(ModeState::Bootloader).unwrap().command,
            "SET MODE=BOOT\n"
        );
        assert_eq!(
            protocol.command_for(ModeState::Run).unwrap().ack,
            "MODE=RUN"
        );
        assert!(protocol.command_for(ModeState::Unknown).is_none());
    }

    #[test]
    fn test_protocol_from_json() {
        let json = r#"{
            "bootloader": { "command": "SET SWICH_SWD1__2=LV\n", "ack": "SWICH_SWD1__2=LV" },
            "run": { "command": "SET SWICH_SWD1__2=HV\n", "ack": "SWICH_SWD1__2=HV" },
            "ack_timeout_ms": 500
        }"#;

        let protocol: ModeProtocol = serde_json::from_str(json).unwrap();
        assert_eq!(protocol.ack_timeout_ms, 500);
        assert!(protocol.command_for(ModeState::Reset).is_none());
        assert_eq!(
            protocol.command_for(ModeState::Bootloader).unwrap().ack,
            "SWICH_SWD1__2=LV"
        );
    }

    #[test]
    fn test_stlink_id_table() {
        assert_eq!(STLINK_VID, 0x0483);
        assert!(STLINK_PIDS.contains(&0x3748));
        assert!(STLINK_PIDS.contains(&0x374E));
    }
}

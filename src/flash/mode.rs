//! Boot-mode control over the UART channel.
//!
//! Mode switching is a two-step protocol: send the configured command bytes,
//! then poll for the device's acknowledgement within a bounded timeout. On
//! timeout the believed mode becomes `Unknown` rather than a guess; callers
//! never assume a transition succeeded without an explicit ack.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use super::config::ModeProtocol;
use super::error::{FlashError, Result};
use super::serial::{SerialLink, SerialTransport};

/// The target's believed boot mode.
///
/// Mutated only by the mode controller, and only after a confirmed ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModeState {
    /// Mode cannot be trusted (initial state, or a transition went
    /// unacknowledged).
    Unknown,
    /// Accepting flash-programming commands.
    Bootloader,
    /// Running application code.
    Run,
    /// Held in reset.
    Reset,
}

impl fmt::Display for ModeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModeState::Unknown => "Unknown",
            ModeState::Bootloader => "Bootloader",
            ModeState::Run => "Run",
            ModeState::Reset => "Reset",
        };
        write!(f, "{}", name)
    }
}

/// Mode-transition and stimulus operations the session and tester depend on.
#[cfg_attr(test, automock)]
pub trait ModeControl: Send {
    /// Drive the device into `target` mode and confirm the transition.
    ///
    /// Returns the confirmed state on success. On failure the believed mode
    /// is `Unknown`.
    fn switch_to(&mut self, target: ModeState) -> Result<ModeState>;

    /// The device's believed mode.
    fn mode(&self) -> ModeState;

    /// Send stimulus bytes and collect whatever the device answers within
    /// `timeout_ms`. An empty response is not an error.
    fn exchange(&mut self, stimulus: &[u8], timeout_ms: u64) -> Result<Vec<u8>>;
}

/// UART-backed mode controller.
///
/// Owns the serial link for the lifetime of a session; the port is released
/// on drop on every exit path, including failure and cancellation.
pub struct SerialModeController<L: SerialLink> {
    link: L,
    protocol: ModeProtocol,
    state: ModeState,
}

impl SerialModeController<SerialTransport> {
    /// Open the control UART for a device.
    ///
    /// Fails with `PortUnavailable` when the port cannot be opened.
    pub fn open(port_name: &str, protocol: ModeProtocol) -> Result<Self> {
        let link = SerialTransport::open(port_name)?;
        Ok(Self::new(link, protocol))
    }
}

impl<L: SerialLink> SerialModeController<L> {
    pub fn new(link: L, protocol: ModeProtocol) -> Self {
        Self {
            link,
            protocol,
            state: ModeState::Unknown,
        }
    }

    /// Poll the link until `ack` appears in the response, the device answers
    /// with something else entirely, or the timeout expires.
    fn await_ack(&mut self, command: &str, ack: &[u8], timeout_ms: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut response: Vec<u8> = Vec::new();
        let mut buffer = [0u8; 256];

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = (deadline - now).as_millis() as u64;

            let n = self.link.read(&mut buffer, remaining.max(1))?;
            if n == 0 {
                continue;
            }
            response.extend_from_slice(&buffer[..n]);

            if contains_subslice(&response, ack) {
                return Ok(());
            }
        }

        if response.is_empty() {
            Err(FlashError::NoAck {
                command: command.trim_end().to_string(),
                timeout_ms,
            })
        } else {
            Err(FlashError::UnexpectedResponse {
                command: command.trim_end().to_string(),
                response: String::from_utf8_lossy(&response).into_owned(),
            })
        }
    }
}

impl<L: SerialLink> ModeControl for SerialModeController<L> {
    fn switch_to(&mut self, target: ModeState) -> Result<ModeState> {
        let cmd = self
            .protocol
            .command_for(target)
            .ok_or_else(|| FlashError::UnexpectedResponse {
                command: format!("switch to {}", target),
                response: "no command configured for this mode".to_string(),
            })?
            .clone();

        log::debug!("switching target to {} mode", target);

        // Anything buffered before the command would confuse ack matching.
        // A failure while sending leaves the device's actual mode unknown,
        // same as a missed ack.
        let sent = self
            .link
            .clear_input()
            .and_then(|_| self.link.write(cmd.command.as_bytes()))
            .and_then(|_| self.link.flush());
        if let Err(e) = sent {
            self.state = ModeState::Unknown;
            log::warn!("mode switch to {} failed while sending: {}", target, e);
            return Err(e);
        }

        let timeout_ms = self.protocol.ack_timeout_ms;
        match self.await_ack(&cmd.command, cmd.ack.as_bytes(), timeout_ms) {
            Ok(()) => {
                self.state = target;
                log::info!("target confirmed in {} mode", target);
                Ok(target)
            }
            Err(e) => {
                self.state = ModeState::Unknown;
                log::warn!("mode switch to {} failed: {}", target, e);
                Err(e)
            }
        }
    }

    fn mode(&self) -> ModeState {
        self.state
    }

    fn exchange(&mut self, stimulus: &[u8], timeout_ms: u64) -> Result<Vec<u8>> {
        self.link.clear_input()?;
        self.link.write(stimulus)?;
        self.link.flush()?;

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut response: Vec<u8> = Vec::new();
        let mut buffer = [0u8; 256];

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = (deadline - now).as_millis() as u64;

            let n = self.link.read(&mut buffer, remaining.max(1))?;
            if n > 0 {
                response.extend_from_slice(&buffer[..n]);
            } else if !response.is_empty() {
                // Quiet after a reply: the device is done talking.
                break;
            }
        }

        Ok(response)
    }
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

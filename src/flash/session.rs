//! The single-attempt flash state machine.
//!
//! A session drives one device through the fixed stage sequence: checksum
//! gate, bootloader entry, erase, write, verify, return to run mode. The
//! first failure short-circuits, and the result names the stage that was
//! being attempted. Partial progress is never resumed; a retry starts a
//! fresh session.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use super::backend::ProgrammerBackend;
use super::error::{FlashError, Result};
use super::image::FirmwareImage;
use super::mode::{ModeControl, ModeState};
use super::probe::DeviceHandle;

/// Stages of a flash session, in the order they are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlashStage {
    /// Nothing attempted yet.
    Idle,
    /// Validating the image checksum before touching the device.
    ChecksumValidation,
    /// Switching the target into bootloader mode.
    Bootloader,
    /// Mass-erasing the target's flash.
    Erased,
    /// Writing the image.
    Written,
    /// Reading the image back and comparing.
    Verified,
    /// Switching the target back into run mode.
    RunMode,
    /// All stages completed.
    Done,
}

impl FlashStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlashStage::Idle => "Idle",
            FlashStage::ChecksumValidation => "ChecksumValidation",
            FlashStage::Bootloader => "Bootloader",
            FlashStage::Erased => "Erased",
            FlashStage::Written => "Written",
            FlashStage::Verified => "Verified",
            FlashStage::RunMode => "RunMode",
            FlashStage::Done => "Done",
        }
    }

    /// Approximate overall progress when this stage begins.
    pub fn percent(&self) -> u8 {
        match self {
            FlashStage::Idle => 0,
            FlashStage::ChecksumValidation => 5,
            FlashStage::Bootloader => 15,
            FlashStage::Erased => 30,
            FlashStage::Written => 55,
            FlashStage::Verified => 80,
            FlashStage::RunMode => 95,
            FlashStage::Done => 100,
        }
    }

    /// Human-readable progress message.
    pub fn message(&self) -> &'static str {
        match self {
            FlashStage::Idle => "Waiting to start",
            FlashStage::ChecksumValidation => "Validating firmware checksum",
            FlashStage::Bootloader => "Entering bootloader mode",
            FlashStage::Erased => "Erasing flash",
            FlashStage::Written => "Writing firmware",
            FlashStage::Verified => "Verifying firmware",
            FlashStage::RunMode => "Restarting into application",
            FlashStage::Done => "Flash complete",
        }
    }
}

impl fmt::Display for FlashStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shared cancellation flag.
///
/// Honored at stage boundaries only; an in-progress erase or write is never
/// interrupted, since a half-programmed device is worse than a slow cancel.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Immutable outcome of one flash attempt.
#[derive(Debug)]
pub struct FlashResult {
    /// Whether the session reached `Done`.
    pub success: bool,
    /// On success, `Done`; on failure, the stage that was being attempted.
    pub stage: FlashStage,
    /// The failure, when there is one.
    pub error: Option<FlashError>,
    /// Wall-clock duration of the attempt.
    pub elapsed_ms: u64,
}

impl Serialize for FlashResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct ErrorRepr<'a> {
            code: &'static str,
            message: &'a str,
        }

        let message = self.error.as_ref().map(|e| e.to_string());

        let mut state = serializer.serialize_struct("FlashResult", 4)?;
        state.serialize_field("success", &self.success)?;
        state.serialize_field("stage", &self.stage)?;
        state.serialize_field(
            "error",
            &self.error.as_ref().map(|e| ErrorRepr {
                code: e.error_code(),
                message: message.as_deref().unwrap_or(""),
            }),
        )?;
        state.serialize_field("elapsed_ms", &self.elapsed_ms)?;
        state.end()
    }
}

/// One flash attempt over injected controller and backend seams.
///
/// The session holds no state between runs.
pub struct FlashSession;

impl FlashSession {
    /// Drive the full stage sequence for one attempt.
    ///
    /// `on_progress` fires as each stage begins, and once more with `Done`
    /// on success.
    pub fn run(
        controller: &mut dyn ModeControl,
        backend: &dyn ProgrammerBackend,
        target: &DeviceHandle,
        image: &FirmwareImage,
        cancel: &CancelToken,
        on_progress: &dyn Fn(FlashStage),
    ) -> FlashResult {
        let started = Instant::now();

        let fail = |stage: FlashStage, error: FlashError| {
            log::warn!("flash failed at stage {}: {}", stage, error);
            FlashResult {
                success: false,
                stage,
                error: Some(error),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }
        };

        // The checksum gate runs before any device interaction. A corrupt
        // image must not trigger a single backend or controller call.
        on_progress(FlashStage::ChecksumValidation);
        if let Err(e) = image.validate_checksum() {
            return fail(FlashStage::ChecksumValidation, e);
        }

        // Cancellation is honored when a stage begins, never mid-operation.
        let enter = |stage: FlashStage| -> Result<()> {
            if cancel.is_cancelled() {
                return Err(FlashError::Cancelled);
            }
            on_progress(stage);
            log::debug!("flash stage {} for {}", stage, target.port);
            Ok(())
        };

        if let Err(e) = enter(FlashStage::Bootloader)
            .and_then(|_| controller.switch_to(ModeState::Bootloader).map(|_| ()))
        {
            return fail(FlashStage::Bootloader, e);
        }

        if let Err(e) = enter(FlashStage::Erased).and_then(|_| backend.erase(target)) {
            return fail(FlashStage::Erased, e);
        }

        if let Err(e) = enter(FlashStage::Written).and_then(|_| backend.write_image(target, image))
        {
            return fail(FlashStage::Written, e);
        }

        if let Err(e) =
            enter(FlashStage::Verified).and_then(|_| backend.verify_image(target, image))
        {
            return fail(FlashStage::Verified, e);
        }

        if let Err(e) =
            enter(FlashStage::RunMode).and_then(|_| controller.switch_to(ModeState::Run).map(|_| ()))
        {
            return fail(FlashStage::RunMode, e);
        }

        on_progress(FlashStage::Done);
        log::info!(
            "flash of {} complete in {}ms",
            target.port,
            started.elapsed().as_millis()
        );
        FlashResult {
            success: true,
            stage: FlashStage::Done,
            error: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

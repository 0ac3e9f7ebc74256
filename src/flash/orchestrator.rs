//! Top-level coordination: retries, per-device locking, reporting.
//!
//! The orchestrator owns the policy around a flash session: bounded retry of
//! transient failures, exactly-once post-flash testing, and serialization of
//! concurrent requests that target the same device. Sessions themselves stay
//! policy-free.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::Serialize;

use super::backend::{create_backend, BackendChoice, ProgrammerBackend};
use super::config::{ModeProtocol, DEFAULT_RETRY_LIMIT, RETRY_BACKOFF_MS};
use super::error::Result;
use super::image::FirmwareImage;
use super::mode::{ModeControl, SerialModeController};
use super::probe::DeviceHandle;
use super::session::{CancelToken, FlashResult, FlashSession, FlashStage};
use super::tester::{PostFlashTester, TestProfile, TestVerdict};

/// Tunable policy for one flash request.
#[derive(Debug, Clone)]
pub struct FlashOptions {
    /// Maximum number of flash attempts for transient failures.
    pub retry_limit: u32,
    /// Post-flash test profile; `None` skips testing entirely.
    pub test_profile: Option<TestProfile>,
    /// UART command vocabulary for mode transitions.
    pub protocol: ModeProtocol,
    /// Override for the protocol's acknowledgement timeout.
    pub ack_timeout_ms: Option<u64>,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_LIMIT,
            test_profile: Some(TestProfile::default()),
            protocol: ModeProtocol::default(),
            ack_timeout_ms: None,
        }
    }
}

/// Everything needed to flash one device.
#[derive(Debug, Clone)]
pub struct FlashRequest {
    pub device: DeviceHandle,
    pub backend: BackendChoice,
    pub image: FirmwareImage,
    pub options: FlashOptions,
}

/// Serializable record of a completed flash request.
#[derive(Debug, Serialize)]
pub struct Report {
    pub flash: FlashResult,
    /// Present only when the flash reached `Done` and testing was requested.
    pub test: Option<TestVerdict>,
    /// Number of flash attempts made. Zero when the checksum gate rejected
    /// the image before any device interaction.
    pub attempts: u32,
    pub backend: BackendChoice,
    /// RFC 3339 completion timestamp.
    pub finished_at: String,
}

type BackendFactory =
    Box<dyn Fn(BackendChoice) -> Result<Box<dyn ProgrammerBackend>> + Send + Sync>;
type ControllerFactory =
    Box<dyn Fn(&DeviceHandle, &ModeProtocol) -> Result<Box<dyn ModeControl>> + Send + Sync>;

/// Coordinates flash requests across devices.
pub struct Orchestrator {
    backend_factory: BackendFactory,
    controller_factory: ControllerFactory,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    /// An orchestrator backed by real tools and real serial ports.
    pub fn new() -> Self {
        Self::with_factories(
            Box::new(create_backend),
            Box::new(|device, protocol| {
                let controller = SerialModeController::open(&device.port, protocol.clone())?;
                Ok(Box::new(controller) as Box<dyn ModeControl>)
            }),
        )
    }

    /// Inject backend and controller construction. Test seam.
    pub fn with_factories(
        backend_factory: BackendFactory,
        controller_factory: ControllerFactory,
    ) -> Self {
        Self {
            backend_factory,
            controller_factory,
        }
    }

    /// Flash one device and report the outcome.
    ///
    /// Requests for the same port serialize on a process-wide lock;
    /// distinct ports proceed in parallel. Transient failures are retried
    /// up to `retry_limit` attempts with a target reset in between; all
    /// other failures surface immediately. The post-flash test runs at most
    /// once, and its failures are never retried.
    pub fn flash(
        &self,
        request: &FlashRequest,
        cancel: &CancelToken,
        on_progress: &dyn Fn(FlashStage),
    ) -> Report {
        let lock = device_lock(&request.device.port);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        log::info!(
            "flashing {} via {} ({} bytes at 0x{:08X})",
            request.device.port,
            request.backend,
            request.image.len(),
            request.image.address()
        );

        // Reject a corrupt image before creating the backend or touching
        // the port.
        if let Err(e) = request.image.validate_checksum() {
            return self.finish(request, failed(FlashStage::ChecksumValidation, e), None, 0);
        }

        let mut protocol = request.options.protocol.clone();
        if let Some(timeout) = request.options.ack_timeout_ms {
            protocol.ack_timeout_ms = timeout;
        }

        let backend = match (self.backend_factory)(request.backend) {
            Ok(backend) => backend,
            Err(e) => {
                return self.finish(request, failed(FlashStage::Bootloader, e), None, 0);
            }
        };

        let retry_limit = request.options.retry_limit.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;

            // A fresh controller per attempt; the port is released between
            // attempts so a re-enumerating adapter can recover.
            let mut controller = match (self.controller_factory)(&request.device, &protocol) {
                Ok(controller) => controller,
                Err(e) => {
                    if e.is_transient() && attempt < retry_limit {
                        log::warn!(
                            "attempt {}/{} could not open {}: {}",
                            attempt,
                            retry_limit,
                            request.device.port,
                            e
                        );
                        std::thread::sleep(Duration::from_millis(RETRY_BACKOFF_MS));
                        continue;
                    }
                    return self.finish(request, failed(FlashStage::Bootloader, e), None, attempt);
                }
            };

            let result = FlashSession::run(
                controller.as_mut(),
                backend.as_ref(),
                &request.device,
                &request.image,
                cancel,
                on_progress,
            );

            if result.success {
                let verdict = request
                    .options
                    .test_profile
                    .as_ref()
                    .map(|profile| PostFlashTester::run(controller.as_mut(), profile));
                return self.finish(request, result, verdict, attempt);
            }

            let transient = result
                .error
                .as_ref()
                .map(|e| e.is_transient())
                .unwrap_or(false);
            if transient && attempt < retry_limit {
                log::warn!(
                    "attempt {}/{} failed at {} ({}), retrying",
                    attempt,
                    retry_limit,
                    result.stage,
                    result.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
                );
                drop(controller);
                // Give the device a clean slate before the next attempt.
                backend.reset_target(&request.device).ok();
                std::thread::sleep(Duration::from_millis(RETRY_BACKOFF_MS));
                continue;
            }

            return self.finish(request, result, None, attempt);
        }
    }

    fn finish(
        &self,
        request: &FlashRequest,
        flash: FlashResult,
        test: Option<TestVerdict>,
        attempts: u32,
    ) -> Report {
        if flash.success {
            log::info!(
                "{} flashed successfully after {} attempt(s), test {}",
                request.device.port,
                attempts,
                match &test {
                    Some(v) if v.passed => "passed",
                    Some(_) => "FAILED",
                    None => "skipped",
                }
            );
        } else {
            log::error!(
                "{} flash failed at {} after {} attempt(s)",
                request.device.port,
                flash.stage,
                attempts
            );
        }

        Report {
            flash,
            test,
            attempts,
            backend: request.backend,
            finished_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

fn failed(stage: FlashStage, error: super::error::FlashError) -> FlashResult {
    FlashResult {
        success: false,
        stage,
        error: Some(error),
        elapsed_ms: 0,
    }
}

/// Process-wide per-port locks.
///
/// Entries no longer held by any request are evicted on the next lookup, so
/// the registry stays bounded by the number of ports in active use.
fn device_lock(port: &str) -> Arc<Mutex<()>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    map.retain(|_, lock| Arc::strong_count(lock) > 1);
    map.entry(port.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

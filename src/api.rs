//! Async caller boundary for flashing operations.
//!
//! GUI and CLI front ends live on async runtimes; the flashing engine is
//! deliberately blocking. These wrappers bridge the two with
//! `spawn_blocking` plus a progress-forwarding thread, so progress callbacks
//! run outside the blocking task.

use std::sync::mpsc;
use std::thread;

use serde::Serialize;

use crate::flash::{
    find_stlink_probes, CancelToken, FlashError, FlashRequest, FlashStage, Orchestrator, Report,
    Result, StLinkProbe,
};

/// Progress event emitted as each flash stage begins.
#[derive(Debug, Clone, Serialize)]
pub struct FlashProgressEvent {
    /// Current stage name.
    pub stage: String,
    /// Progress percentage (0-100).
    pub percent: u8,
    /// Human-readable message.
    pub message: String,
}

impl From<FlashStage> for FlashProgressEvent {
    fn from(stage: FlashStage) -> Self {
        Self {
            stage: stage.as_str().to_string(),
            percent: stage.percent(),
            message: stage.message().to_string(),
        }
    }
}

/// Detect connected ST-Link probes.
pub async fn detect_probes() -> Result<Vec<StLinkProbe>> {
    tokio::task::spawn_blocking(find_stlink_probes)
        .await
        .map_err(join_error)
}

/// Flash firmware to a device, reporting progress as stages begin.
///
/// The request runs on a blocking task; `on_progress` is invoked from a
/// dedicated forwarding thread. Cancellation through the token takes effect
/// at the next stage boundary.
pub async fn flash_firmware<F>(
    request: FlashRequest,
    cancel: CancelToken,
    on_progress: F,
) -> Result<Report>
where
    F: FnMut(FlashProgressEvent) + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<FlashStage>();

    let mut on_progress = on_progress;
    let progress_task = thread::spawn(move || {
        while let Ok(stage) = rx.recv() {
            on_progress(FlashProgressEvent::from(stage));
        }
    });

    let report = tokio::task::spawn_blocking(move || {
        let orchestrator = Orchestrator::new();
        orchestrator.flash(&request, &cancel, &|stage| {
            let _ = tx.send(stage);
        })
    })
    .await
    .map_err(join_error)?;

    // The sender dropped with the blocking task; the forwarder drains and
    // exits.
    let _ = progress_task.join();

    Ok(report)
}

fn join_error(e: tokio::task::JoinError) -> FlashError {
    FlashError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("flash task panicked: {}", e),
    ))
}

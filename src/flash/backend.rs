//! The programmer backend contract and tool invocation plumbing.
//!
//! Each backend maps the shared capability set {erase, write, verify, reset}
//! onto one concrete toolchain, and normalizes that tool's exit/status
//! signals into the shared error taxonomy. No backend-specific error type
//! crosses this boundary. Backends are stateless between calls.

use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use super::backends::{CubeProgrammerBackend, OpenOcdBackend, PyStLinkBackend};
use super::config::TOOL_PROBE_TIMEOUT_MS;
use super::error::{FlashError, Result};
use super::image::FirmwareImage;
use super::probe::DeviceHandle;

/// Which programmer toolchain a session uses. Fixed for the session's
/// lifetime; selection is plain data, not runtime introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendChoice {
    PyStLink,
    OpenOcd,
    CubeProgrammer,
}

impl fmt::Display for BackendChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendChoice::PyStLink => "pystlink",
            BackendChoice::OpenOcd => "openocd",
            BackendChoice::CubeProgrammer => "cubeprogrammer",
        };
        write!(f, "{}", name)
    }
}

/// The common programmer contract, identical across toolchains.
#[cfg_attr(test, automock)]
pub trait ProgrammerBackend: Send {
    /// Backend name for logs and reports.
    fn name(&self) -> &'static str;

    /// Mass-erase the target's flash.
    fn erase(&self, target: &DeviceHandle) -> Result<()>;

    /// Write the image to the target.
    fn write_image(&self, target: &DeviceHandle, image: &FirmwareImage) -> Result<()>;

    /// Read the flashed region back and compare it to the image.
    fn verify_image(&self, target: &DeviceHandle, image: &FirmwareImage) -> Result<()>;

    /// Reset the target so it reboots.
    fn reset_target(&self, target: &DeviceHandle) -> Result<()>;
}

/// Create the backend for a choice, locating its underlying tool.
///
/// Fails with `ToolUnavailable` when the toolchain is not installed. There
/// is deliberately no fallback to another backend here; the choice is the
/// caller's.
pub fn create_backend(choice: BackendChoice) -> Result<Box<dyn ProgrammerBackend>> {
    let runner = ProcessRunner;
    let backend: Box<dyn ProgrammerBackend> = match choice {
        BackendChoice::PyStLink => Box::new(PyStLinkBackend::locate(runner)?),
        BackendChoice::OpenOcd => Box::new(OpenOcdBackend::locate(runner)?),
        BackendChoice::CubeProgrammer => Box::new(CubeProgrammerBackend::locate(runner)?),
    };
    log::debug!("programmer backend {} ready", backend.name());
    Ok(backend)
}

// ============================================================================
// Tool invocation
// ============================================================================

/// Captured output of a finished tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// A one-line failure summary, preferring stderr.
    pub fn failure_detail(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let line = text
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("tool reported failure");
        line.trim().to_string()
    }
}

/// Abstraction over external tool execution, mockable in tests.
#[cfg_attr(test, automock)]
pub trait ToolRunner: Send + Sync {
    /// Run `program` with `args`, killing it if it exceeds `timeout_ms`.
    fn run(&self, program: &str, args: &[String], timeout_ms: u64) -> Result<ToolOutput>;
}

/// Real implementation that delegates to std::process::Command.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String], timeout_ms: u64) -> Result<ToolOutput> {
        log::debug!("running {} {:?} (deadline {}ms)", program, args, timeout_ms);

        let mut child = std::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            match child.try_wait()? {
                Some(_) => break,
                None => {
                    if Instant::now() >= deadline {
                        child.kill().ok();
                        child.wait().ok();
                        return Err(FlashError::ToolTimeout {
                            tool: program.to_string(),
                            timeout_ms,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }

        let output = child.wait_with_output()?;
        Ok(ToolOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Find the first candidate invocation that answers a `--version` probe.
pub(crate) fn locate_tool<R: ToolRunner>(runner: &R, candidates: &[String]) -> Option<String> {
    for candidate in candidates {
        let args = vec!["--version".to_string()];
        match runner.run(candidate, &args, TOOL_PROBE_TIMEOUT_MS) {
            Ok(output) if output.success => {
                log::info!("using programmer tool {}", candidate);
                return Some(candidate.clone());
            }
            _ => continue,
        }
    }
    None
}

/// Offset of the first byte where `actual` diverges from `expected`.
///
/// A short read-back counts as a mismatch at the truncation point.
pub(crate) fn first_mismatch(expected: &[u8], actual: &[u8]) -> Option<u32> {
    for (offset, byte) in expected.iter().enumerate() {
        match actual.get(offset) {
            Some(read) if read == byte => continue,
            _ => return Some(offset as u32),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_mismatch() {
        assert_eq!(first_mismatch(b"abcd", b"abcd"), None);
        assert_eq!(first_mismatch(b"abcd", b"abXd"), Some(2));
        assert_eq!(first_mismatch(b"abcd", b"ab"), Some(2));
        assert_eq!(first_mismatch(b"", b""), None);
        // Extra trailing bytes in the read-back are fine; flash reads are
        // usually rounded up.
        assert_eq!(first_mismatch(b"ab", b"abcd"), None);
    }

    #[test]
    fn test_failure_detail_prefers_stderr() {
        let output = ToolOutput {
            success: false,
            stdout: "lots of\nprogress output\n".to_string(),
            stderr: "Error: no target detected\n".to_string(),
        };
        assert_eq!(output.failure_detail(), "Error: no target detected");
    }

    #[test]
    fn test_failure_detail_falls_back_to_stdout() {
        let output = ToolOutput {
            success: false,
            stdout: "step 1 ok\nError: write protected\n\n".to_string(),
            stderr: "  ".to_string(),
        };
        assert_eq!(output.failure_detail(), "Error: write protected");
    }

    #[test]
    fn test_locate_tool_takes_first_responding_candidate() {
        let mut runner = MockToolRunner::new();
        runner
            .expect_run()
            .withf(|program, args, _| {
                program == "missing-tool" && args.len() == 1 && args[0] == "--version"
            })
            .returning(|program, _, _| {
                Err(FlashError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    program.to_string(),
                )))
            });
        runner
            .expect_run()
            .withf(|program, _, _| program == "present-tool")
            .returning(|_, _, _| {
                Ok(ToolOutput {
                    success: true,
                    stdout: "v1.0".to_string(),
                    stderr: String::new(),
                })
            });

        let found = locate_tool(
            &runner,
            &["missing-tool".to_string(), "present-tool".to_string()],
        );
        assert_eq!(found.as_deref(), Some("present-tool"));
    }

    #[test]
    fn test_locate_tool_none_found() {
        let mut runner = MockToolRunner::new();
        runner.expect_run().returning(|_, _, _| {
            Ok(ToolOutput {
                success: false,
                stdout: String::new(),
                stderr: "not found".to_string(),
            })
        });

        assert!(locate_tool(&runner, &["a".to_string(), "b".to_string()]).is_none());
    }

    #[test]
    fn test_backend_choice_display() {
        assert_eq!(BackendChoice::PyStLink.to_string(), "pystlink");
        assert_eq!(BackendChoice::OpenOcd.to_string(), "openocd");
        assert_eq!(BackendChoice::CubeProgrammer.to_string(), "cubeprogrammer");
    }

    #[test]
    fn test_backend_names_match_choice_display() {
        let runner = || MockToolRunner::new();
        let pystlink = PyStLinkBackend::with_tool(runner(), "pystlink");
        let openocd = OpenOcdBackend::with_tool(runner(), "openocd");
        let cube = CubeProgrammerBackend::with_tool(runner(), "cube-cli");

        assert_eq!(pystlink.name(), BackendChoice::PyStLink.to_string());
        assert_eq!(openocd.name(), BackendChoice::OpenOcd.to_string());
        assert_eq!(cube.name(), BackendChoice::CubeProgrammer.to_string());
    }
}

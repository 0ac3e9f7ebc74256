//! pystlink backend.
//!
//! Drives the `pystlink` command-line tool with its colon-separated action
//! syntax. Verification reads the flashed region back to a temp file and
//! compares it byte-for-byte.

use crate::flash::backend::{
    first_mismatch, locate_tool, ProgrammerBackend, ToolOutput, ToolRunner,
};
use crate::flash::config::{
    pystlink_candidates, ERASE_TIMEOUT_MS, READ_TIMEOUT_MS, RESET_TIMEOUT_MS, WRITE_TIMEOUT_MS,
};
use crate::flash::error::{FlashError, Result};
use crate::flash::image::FirmwareImage;
use crate::flash::probe::DeviceHandle;

pub struct PyStLinkBackend<R: ToolRunner> {
    runner: R,
    tool: String,
}

impl<R: ToolRunner> PyStLinkBackend<R> {
    /// Locate `pystlink` among the known install paths.
    pub fn locate(runner: R) -> Result<Self> {
        let tool = locate_tool(&runner, &pystlink_candidates()).ok_or_else(|| {
            FlashError::ToolUnavailable {
                tool: "pystlink".to_string(),
            }
        })?;
        Ok(Self { runner, tool })
    }

    /// Use an explicit tool path, skipping discovery.
    pub fn with_tool(runner: R, tool: &str) -> Self {
        Self {
            runner,
            tool: tool.to_string(),
        }
    }

    fn run_action(&self, action: &str, timeout_ms: u64) -> Result<ToolOutput> {
        let args = vec![action.to_string()];
        self.runner.run(&self.tool, &args, timeout_ms)
    }
}

impl<R: ToolRunner> ProgrammerBackend for PyStLinkBackend<R> {
    fn name(&self) -> &'static str {
        "pystlink"
    }

    fn erase(&self, _target: &DeviceHandle) -> Result<()> {
        let output = self.run_action("flash:erase", ERASE_TIMEOUT_MS)?;
        if output.success {
            Ok(())
        } else {
            Err(FlashError::EraseFailed {
                detail: output.failure_detail(),
            })
        }
    }

    fn write_image(&self, _target: &DeviceHandle, image: &FirmwareImage) -> Result<()> {
        let dir = tempfile::tempdir()?;
        let data_file = dir.path().join("image.bin");
        std::fs::write(&data_file, image.data())?;

        let action = format!(
            "flash:write:0x{:08X}:{}",
            image.address(),
            data_file.to_string_lossy()
        );
        let output = self.run_action(&action, WRITE_TIMEOUT_MS)?;

        if output.success {
            Ok(())
        } else {
            Err(FlashError::WriteFailed {
                stage: "program".to_string(),
                offset: 0,
                detail: output.failure_detail(),
            })
        }
    }

    fn verify_image(&self, _target: &DeviceHandle, image: &FirmwareImage) -> Result<()> {
        let dir = tempfile::tempdir()?;
        let read_file = dir.path().join("readback.bin");

        let action = format!(
            "read:0x{:08X}:{}:{}",
            image.address(),
            image.len(),
            read_file.to_string_lossy()
        );
        let output = self.run_action(&action, READ_TIMEOUT_MS)?;
        if !output.success {
            return Err(FlashError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("verify read-back failed: {}", output.failure_detail()),
            )));
        }

        let actual = std::fs::read(&read_file)?;
        match first_mismatch(image.data(), &actual) {
            None => Ok(()),
            Some(offset) => Err(FlashError::VerifyMismatch { offset }),
        }
    }

    fn reset_target(&self, _target: &DeviceHandle) -> Result<()> {
        let output = self.run_action("reset", RESET_TIMEOUT_MS)?;
        if output.success {
            Ok(())
        } else {
            Err(FlashError::ResetFailed {
                detail: output.failure_detail(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::backend::MockToolRunner;

    fn ok_output() -> ToolOutput {
        ToolOutput {
            success: true,
            stdout: "DONE".to_string(),
            stderr: String::new(),
        }
    }

    fn target() -> DeviceHandle {
        DeviceHandle::new("/dev/ttyACM0")
    }

    #[test]
    fn test_erase_action() {
        let mut runner = MockToolRunner::new();
        runner
            .expect_run()
            .withf(|program, args, _| {
                program == "pystlink" && args.len() == 1 && args[0] == "flash:erase"
            })
            .times(1)
            .returning(|_, _, _| Ok(ok_output()));

        let backend = PyStLinkBackend::with_tool(runner, "pystlink");
        backend.erase(&target()).unwrap();
    }

    #[test]
    fn test_write_action_carries_address_and_file() {
        let image = FirmwareImage::from_bytes(vec![0xDE, 0xAD], 0x0800_4000);

        let mut runner = MockToolRunner::new();
        runner
            .expect_run()
            .withf(|_, args, _| {
                args.len() == 1
                    && args[0].starts_with("flash:write:0x08004000:")
                    && args[0].ends_with("image.bin")
            })
            .times(1)
            .returning(|_, args, _| {
                let path = args[0].splitn(4, ':').nth(3).unwrap();
                let staged = std::fs::read(path).unwrap();
                assert_eq!(staged, vec![0xDE, 0xAD]);
                Ok(ok_output())
            });

        let backend = PyStLinkBackend::with_tool(runner, "pystlink");
        backend.write_image(&target(), &image).unwrap();
    }

    #[test]
    fn test_verify_short_readback_is_mismatch_at_truncation() {
        let image = FirmwareImage::from_bytes(vec![0x33; 16], 0x0800_0000);

        let mut runner = MockToolRunner::new();
        runner
            .expect_run()
            .withf(|_, args, _| args[0].starts_with("read:0x08000000:16:"))
            .returning(|_, args, _| {
                let path = args[0].splitn(4, ':').nth(3).unwrap();
                std::fs::write(path, vec![0x33_u8; 12]).unwrap();
                Ok(ok_output())
            });

        let backend = PyStLinkBackend::with_tool(runner, "pystlink");
        let err = backend.verify_image(&target(), &image).unwrap_err();
        assert!(matches!(err, FlashError::VerifyMismatch { offset: 12 }));
    }

    #[test]
    fn test_reset_failure_normalized() {
        let mut runner = MockToolRunner::new();
        runner
            .expect_run()
            .withf(|_, args, _| args[0] == "reset")
            .returning(|_, _, _| {
                Ok(ToolOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: "ERROR: COM st-link is not connected\n".to_string(),
                })
            });

        let backend = PyStLinkBackend::with_tool(runner, "pystlink");
        let err = backend.reset_target(&target()).unwrap_err();
        assert!(matches!(err, FlashError::ResetFailed { .. }));
    }
}

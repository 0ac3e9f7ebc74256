//! STM32CubeProgrammer backend.
//!
//! Drives `STM32_Programmer_CLI` over SWD. Verification reads the flashed
//! region back into a temp file and compares it byte-for-byte.

use crate::flash::backend::{
    first_mismatch, locate_tool, ProgrammerBackend, ToolOutput, ToolRunner,
};
use crate::flash::config::{
    cube_candidates, ERASE_TIMEOUT_MS, READ_TIMEOUT_MS, RESET_TIMEOUT_MS, WRITE_TIMEOUT_MS,
};
use crate::flash::error::{FlashError, Result};
use crate::flash::image::FirmwareImage;
use crate::flash::probe::DeviceHandle;

pub struct CubeProgrammerBackend<R: ToolRunner> {
    runner: R,
    tool: String,
}

impl<R: ToolRunner> CubeProgrammerBackend<R> {
    /// Locate `STM32_Programmer_CLI` among the known install paths.
    pub fn locate(runner: R) -> Result<Self> {
        let tool = locate_tool(&runner, &cube_candidates()).ok_or_else(|| {
            FlashError::ToolUnavailable {
                tool: "STM32_Programmer_CLI".to_string(),
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

    fn run_swd(&self, extra: &[String], timeout_ms: u64) -> Result<ToolOutput> {
        let mut args = vec!["-c".to_string(), "port=SWD".to_string()];
        args.extend_from_slice(extra);
        self.runner.run(&self.tool, &args, timeout_ms)
    }
}

impl<R: ToolRunner> ProgrammerBackend for CubeProgrammerBackend<R> {
    fn name(&self) -> &'static str {
        "cubeprogrammer"
    }

    fn erase(&self, _target: &DeviceHandle) -> Result<()> {
        let output = self.run_swd(
            &["-e".to_string(), "all".to_string()],
            ERASE_TIMEOUT_MS,
        )?;
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

        let output = self.run_swd(
            &[
                "-w".to_string(),
                data_file.to_string_lossy().into_owned(),
                format!("0x{:08X}", image.address()),
            ],
            WRITE_TIMEOUT_MS,
        )?;

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

        let output = self.run_swd(
            &[
                "-r".to_string(),
                read_file.to_string_lossy().into_owned(),
                format!("0x{:08X}", image.address()),
                image.len().to_string(),
            ],
            READ_TIMEOUT_MS,
        )?;
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
        let output = self.run_swd(&["-rst".to_string()], RESET_TIMEOUT_MS)?;
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
    use crate::flash::backend::{MockToolRunner, ToolOutput};

    fn ok_output() -> ToolOutput {
        ToolOutput {
            success: true,
            stdout: "File download complete".to_string(),
            stderr: String::new(),
        }
    }

    fn failed_output(detail: &str) -> ToolOutput {
        ToolOutput {
            success: false,
            stdout: String::new(),
            stderr: detail.to_string(),
        }
    }

    fn target() -> DeviceHandle {
        DeviceHandle::new("/dev/ttyACM0")
    }

    #[test]
    fn test_erase_invocation() {
        let mut runner = MockToolRunner::new();
        runner
            .expect_run()
            .withf(|program, args, _| {
                program == "cube-cli"
                    && args.len() == 4
                    && args[0] == "-c"
                    && args[1] == "port=SWD"
                    && args[2] == "-e"
                    && args[3] == "all"
            })
            .times(1)
            .returning(|_, _, _| Ok(ok_output()));

        let backend = CubeProgrammerBackend::with_tool(runner, "cube-cli");
        backend.erase(&target()).unwrap();
    }

    #[test]
    fn test_erase_failure_normalized() {
        let mut runner = MockToolRunner::new();
        runner
            .expect_run()
            .returning(|_, _, _| Ok(failed_output("Error: mass erase failed")));

        let backend = CubeProgrammerBackend::with_tool(runner, "cube-cli");
        let err = backend.erase(&target()).unwrap_err();
        assert!(matches!(
            err,
            FlashError::EraseFailed { ref detail } if detail.contains("mass erase")
        ));
    }

    #[test]
    fn test_write_stages_image_and_passes_address() {
        let image = FirmwareImage::from_bytes(vec![0x11, 0x22, 0x33], 0x0800_0000);

        let mut runner = MockToolRunner::new();
        runner
            .expect_run()
            .withf(|_, args, _| {
                args.len() == 5
                    && args[2] == "-w"
                    && args[3].ends_with("image.bin")
                    && args[4] == "0x08000000"
            })
            .times(1)
            .returning(move |_, args, _| {
                // The staged file must hold the image payload.
                let staged = std::fs::read(&args[3]).unwrap();
                assert_eq!(staged, vec![0x11, 0x22, 0x33]);
                Ok(ok_output())
            });

        let backend = CubeProgrammerBackend::with_tool(runner, "cube-cli");
        backend.write_image(&target(), &image).unwrap();
    }

    #[test]
    fn test_verify_reports_first_mismatch_offset() {
        let image = FirmwareImage::from_bytes(vec![0xAA; 0x400], 0x0800_0000);

        let mut runner = MockToolRunner::new();
        runner
            .expect_run()
            .withf(|_, args, _| args.len() == 6 && args[2] == "-r" && args[5] == "1024")
            .returning(|_, args, _| {
                // Simulate the tool writing the read-back file with one
                // corrupted byte at 0x200.
                let mut data = vec![0xAA_u8; 0x400];
                data[0x200] = 0x00;
                std::fs::write(&args[3], data).unwrap();
                Ok(ok_output())
            });

        let backend = CubeProgrammerBackend::with_tool(runner, "cube-cli");
        let err = backend.verify_image(&target(), &image).unwrap_err();
        assert!(matches!(err, FlashError::VerifyMismatch { offset: 0x200 }));
    }

    #[test]
    fn test_verify_passes_on_identical_readback() {
        let image = FirmwareImage::from_bytes(vec![0x5A; 64], 0x0800_0000);

        let mut runner = MockToolRunner::new();
        runner.expect_run().returning(|_, args, _| {
            std::fs::write(&args[3], vec![0x5A_u8; 64]).unwrap();
            Ok(ok_output())
        });

        let backend = CubeProgrammerBackend::with_tool(runner, "cube-cli");
        backend.verify_image(&target(), &image).unwrap();
    }

    #[test]
    fn test_reset_failure_normalized() {
        let mut runner = MockToolRunner::new();
        runner
            .expect_run()
            .withf(|_, args, _| args.len() == 3 && args[2] == "-rst")
            .returning(|_, _, _| Ok(failed_output("Error: reset failed")));

        let backend = CubeProgrammerBackend::with_tool(runner, "cube-cli");
        let err = backend.reset_target(&target()).unwrap_err();
        assert!(matches!(err, FlashError::ResetFailed { .. }));
    }
}

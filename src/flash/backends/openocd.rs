//! OpenOCD backend.
//!
//! Each operation spawns a short-lived `openocd` process with a generated
//! config file and a `-c` command batch ending in `shutdown`. Verification
//! dumps the flashed region to a temp file and compares it byte-for-byte.

use std::path::Path;

use crate::flash::backend::{
    first_mismatch, locate_tool, ProgrammerBackend, ToolOutput, ToolRunner,
};
use crate::flash::config::{
    openocd_candidates, ERASE_TIMEOUT_MS, READ_TIMEOUT_MS, RESET_TIMEOUT_MS, WRITE_TIMEOUT_MS,
};
use crate::flash::error::{FlashError, Result};
use crate::flash::image::FirmwareImage;
use crate::flash::probe::DeviceHandle;

const OPENOCD_CONFIG: &str = "\
source [find interface/stlink.cfg]
transport select hla_swd
source [find target/stm32g4x.cfg]
";

pub struct OpenOcdBackend<R: ToolRunner> {
    runner: R,
    tool: String,
}

impl<R: ToolRunner> OpenOcdBackend<R> {
    /// Locate `openocd` among the known install paths.
    pub fn locate(runner: R) -> Result<Self> {
        let tool = locate_tool(&runner, &openocd_candidates()).ok_or_else(|| {
            FlashError::ToolUnavailable {
                tool: "openocd".to_string(),
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

    /// Run one `-f <config> -c init … -c shutdown` batch.
    fn run_batch(&self, config: &Path, commands: &[String], timeout_ms: u64) -> Result<ToolOutput> {
        let mut args = vec![
            "-f".to_string(),
            config.to_string_lossy().into_owned(),
            "-c".to_string(),
            "init".to_string(),
        ];
        for command in commands {
            args.push("-c".to_string());
            args.push(command.clone());
        }
        args.push("-c".to_string());
        args.push("shutdown".to_string());

        self.runner.run(&self.tool, &args, timeout_ms)
    }

    fn write_config(&self, dir: &Path) -> Result<std::path::PathBuf> {
        let config = dir.join("target.cfg");
        std::fs::write(&config, OPENOCD_CONFIG)?;
        Ok(config)
    }
}

impl<R: ToolRunner> ProgrammerBackend for OpenOcdBackend<R> {
    fn name(&self) -> &'static str {
        "openocd"
    }

    fn erase(&self, _target: &DeviceHandle) -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = self.write_config(dir.path())?;

        let output = self.run_batch(
            &config,
            &[
                "reset halt".to_string(),
                "flash erase_sector 0 0 last".to_string(),
            ],
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
        let config = self.write_config(dir.path())?;
        let data_file = dir.path().join("image.bin");
        std::fs::write(&data_file, image.data())?;

        let output = self.run_batch(
            &config,
            &[
                "reset halt".to_string(),
                format!(
                    "flash write_image {} 0x{:08X} bin",
                    data_file.to_string_lossy(),
                    image.address()
                ),
            ],
            WRITE_TIMEOUT_MS,
        )?;

        if output.success {
            Ok(())
        } else {
            let offset = parse_failure_offset(&output, image.address()).unwrap_or(0);
            Err(FlashError::WriteFailed {
                stage: "program".to_string(),
                offset,
                detail: output.failure_detail(),
            })
        }
    }

    fn verify_image(&self, _target: &DeviceHandle, image: &FirmwareImage) -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = self.write_config(dir.path())?;
        let read_file = dir.path().join("readback.bin");

        let output = self.run_batch(
            &config,
            &[
                "reset halt".to_string(),
                format!(
                    "dump_image {} 0x{:08X} {}",
                    read_file.to_string_lossy(),
                    image.address(),
                    image.len()
                ),
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
        let dir = tempfile::tempdir()?;
        let config = self.write_config(dir.path())?;

        let output = self.run_batch(&config, &["reset run".to_string()], RESET_TIMEOUT_MS)?;
        if output.success {
            Ok(())
        } else {
            Err(FlashError::ResetFailed {
                detail: output.failure_detail(),
            })
        }
    }
}

/// Extract a flash offset from OpenOCD failure output.
///
/// OpenOCD reports programming errors with an absolute address such as
/// `error writing to flash at address 0x08000400`; subtract the image base
/// to get an offset into the image.
fn parse_failure_offset(output: &ToolOutput, base: u32) -> Option<u32> {
    let text = format!("{}\n{}", output.stdout, output.stderr);
    for line in text.lines() {
        let lower = line.to_lowercase();
        if let Some(pos) = lower.find("address 0x") {
            let hex = &line[pos + "address 0x".len()..];
            let digits: String = hex.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
            if let Ok(address) = u32::from_str_radix(&digits, 16) {
                return Some(address.saturating_sub(base));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::backend::MockToolRunner;

    fn ok_output() -> ToolOutput {
        ToolOutput {
            success: true,
            stdout: String::new(),
            stderr: "Info : shutdown command invoked\n".to_string(),
        }
    }

    fn target() -> DeviceHandle {
        DeviceHandle::new("/dev/ttyACM0")
    }

    #[test]
    fn test_erase_batch_shape() {
        let mut runner = MockToolRunner::new();
        runner
            .expect_run()
            .withf(|program, args, _| {
                program == "openocd"
                    && args[0] == "-f"
                    && args[1].ends_with("target.cfg")
                    && args[2..4] == ["-c".to_string(), "init".to_string()]
                    && args[5] == "reset halt"
                    && args[7] == "flash erase_sector 0 0 last"
                    && args[args.len() - 1] == "shutdown"
            })
            .times(1)
            .returning(|_, args, _| {
                // The generated config must select the ST-Link transport.
                let config = std::fs::read_to_string(&args[1]).unwrap();
                assert!(config.contains("hla_swd"));
                Ok(ok_output())
            });

        let backend = OpenOcdBackend::with_tool(runner, "openocd");
        backend.erase(&target()).unwrap();
    }

    #[test]
    fn test_write_failure_carries_offset() {
        let image = FirmwareImage::from_bytes(vec![0xAA; 0x800], 0x0800_0000);

        let mut runner = MockToolRunner::new();
        runner.expect_run().returning(|_, _, _| {
            Ok(ToolOutput {
                success: false,
                stdout: String::new(),
                stderr: "error writing to flash at address 0x08000400\n".to_string(),
            })
        });

        let backend = OpenOcdBackend::with_tool(runner, "openocd");
        let err = backend.write_image(&target(), &image).unwrap_err();
        assert!(matches!(
            err,
            FlashError::WriteFailed { offset: 0x400, .. }
        ));
    }

    #[test]
    fn test_verify_mismatch_from_dump() {
        let image = FirmwareImage::from_bytes(vec![0x42; 32], 0x0800_0000);

        let mut runner = MockToolRunner::new();
        runner
            .expect_run()
            .withf(|_, args, _| args.iter().any(|a| a.starts_with("dump_image ")))
            .returning(|_, args, _| {
                let dump = args.iter().find(|a| a.starts_with("dump_image ")).unwrap();
                let path = dump.split_whitespace().nth(1).unwrap();
                let mut data = vec![0x42_u8; 32];
                data[7] = 0x00;
                std::fs::write(path, data).unwrap();
                Ok(ok_output())
            });

        let backend = OpenOcdBackend::with_tool(runner, "openocd");
        let err = backend.verify_image(&target(), &image).unwrap_err();
        assert!(matches!(err, FlashError::VerifyMismatch { offset: 7 }));
    }

    #[test]
    fn test_reset_runs_reset_run() {
        let mut runner = MockToolRunner::new();
        runner
            .expect_run()
            .withf(|_, args, _| args.contains(&"reset run".to_string()))
            .times(1)
            .returning(|_, _, _| Ok(ok_output()));

        let backend = OpenOcdBackend::with_tool(runner, "openocd");
        backend.reset_target(&target()).unwrap();
    }

    #[test]
    fn test_parse_failure_offset() {
        let output = ToolOutput {
            success: false,
            stdout: "flash write error at address 0x08001000 (sector 2)\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(parse_failure_offset(&output, 0x0800_0000), Some(0x1000));

        let quiet = ToolOutput {
            success: false,
            stdout: "generic failure\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(parse_failure_offset(&quiet, 0x0800_0000), None);
    }
}

//! Shared test utilities: fixture builders and temp-file management.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::flash::{
    BackendChoice, DeviceHandle, FirmwareImage, FlashOptions, FlashRequest, TestProfile,
};

/// Builder for creating test FlashRequest instances
pub struct FlashRequestBuilder {
    port: String,
    backend: BackendChoice,
    image: FirmwareImage,
    options: FlashOptions,
}

impl FlashRequestBuilder {
    pub fn new() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            backend: BackendChoice::OpenOcd,
            image: FirmwareImage::from_bytes(vec![0xAA; 128], 0x0800_0000),
            options: FlashOptions::default(),
        }
    }

    pub fn port(mut self, port: &str) -> Self {
        self.port = port.to_string();
        self
    }

    pub fn backend(mut self, backend: BackendChoice) -> Self {
        self.backend = backend;
        self
    }

    pub fn image(mut self, image: FirmwareImage) -> Self {
        self.image = image;
        self
    }

    /// An image whose recorded checksum does not match its payload.
    pub fn corrupt_image(mut self) -> Self {
        self.image = FirmwareImage::with_checksum(
            vec![0xAA; 128],
            0x0800_0000,
            "0000000000000000000000000000000000000000000000000000000000000000",
        );
        self
    }

    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.options.retry_limit = limit;
        self
    }

    pub fn test_profile(mut self, profile: Option<TestProfile>) -> Self {
        self.options.test_profile = profile;
        self
    }

    pub fn build(self) -> FlashRequest {
        FlashRequest {
            device: DeviceHandle::new(&self.port),
            backend: self.backend,
            image: self.image,
            options: self.options,
        }
    }
}

impl Default for FlashRequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Test context with temporary directory management.
/// Automatically cleans up when dropped.
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Create a file with text content at the given relative path
    pub fn create_file(&self, relative_path: &str, content: &str) -> PathBuf {
        self.create_file_bytes(relative_path, content.as_bytes())
    }

    /// Create a file with binary content at the given relative path
    pub fn create_file_bytes(&self, relative_path: &str, content: &[u8]) -> PathBuf {
        let path = self.root().join(relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dirs");
        }
        fs::write(&path, content).expect("Failed to write file");
        path
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder_defaults() {
        let request = FlashRequestBuilder::new().build();
        assert_eq!(request.device.port, "/dev/ttyACM0");
        assert_eq!(request.backend, BackendChoice::OpenOcd);
        assert!(request.image.validate_checksum().is_ok());
        assert!(request.options.test_profile.is_some());
    }

    #[test]
    fn test_request_builder_overrides() {
        let image = FirmwareImage::from_bytes(vec![0x01], 0x0800_4000);
        let request = FlashRequestBuilder::new()
            .port("COM7")
            .backend(BackendChoice::PyStLink)
            .image(image)
            .retry_limit(1)
            .build();
        assert_eq!(request.device.port, "COM7");
        assert_eq!(request.backend, BackendChoice::PyStLink);
        assert_eq!(request.image.address(), 0x0800_4000);
        assert_eq!(request.options.retry_limit, 1);
    }

    #[test]
    fn test_corrupt_image_fails_validation() {
        let request = FlashRequestBuilder::new().corrupt_image().build();
        assert!(request.image.validate_checksum().is_err());
    }

    #[test]
    fn test_context_creates_nested_files() {
        let ctx = TestContext::new();
        let path = ctx.create_file_bytes("firmware/app.bin", &[1, 2, 3]);
        assert!(path.exists());
        assert_eq!(fs::read(path).unwrap(), vec![1, 2, 3]);
    }
}

//! Firmware image loading and checksum validation.
//!
//! An image is an immutable payload plus the target flash address and a
//! SHA-256 digest recorded at load time. The digest gate runs before any
//! erase or write is attempted.

use std::collections::BTreeMap;
use std::path::Path;

use sha2::{Digest, Sha256};

use super::config::DEFAULT_FLASH_ADDRESS;
use super::error::{FlashError, Result};

/// An immutable firmware image bound for a target's flash.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
    address: u32,
    /// Hex-encoded SHA-256 the payload is expected to match.
    checksum: String,
}

impl FirmwareImage {
    /// Build an image from raw bytes; the checksum is computed from the
    /// payload itself.
    pub fn from_bytes(data: Vec<u8>, address: u32) -> Self {
        let checksum = sha256_hex(&data);
        Self {
            data,
            address,
            checksum,
        }
    }

    /// Build an image with a caller-supplied digest (e.g. from a release
    /// manifest). [`FirmwareImage::validate_checksum`] fails if the payload
    /// does not match it.
    pub fn with_checksum(data: Vec<u8>, address: u32, checksum_hex: &str) -> Self {
        Self {
            data,
            address,
            checksum: checksum_hex.to_lowercase(),
        }
    }

    /// Load a raw binary image. The address defaults to the STM32 flash base
    /// (0x08000000).
    pub fn from_bin_file<P: AsRef<Path>>(path: P, address: Option<u32>) -> Result<Self> {
        let data = std::fs::read(path)?;
        if data.is_empty() {
            return Err(FlashError::InvalidImage {
                reason: "firmware file contains no data".to_string(),
            });
        }
        Ok(Self::from_bytes(
            data,
            address.unwrap_or(DEFAULT_FLASH_ADDRESS),
        ))
    }

    /// Load an Intel HEX image. The start address comes from the records;
    /// gaps between records are filled with 0xFF (erased-flash value).
    pub fn from_hex_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let (address, data) = parse_intel_hex(&contents)?;
        Ok(Self::from_bytes(data, address))
    }

    /// The image payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Target memory address of the first payload byte.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Hex-encoded SHA-256 the payload is expected to match.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Validate the payload against the recorded digest.
    ///
    /// Must pass before any write attempt; a session that sees an error here
    /// makes no backend calls at all.
    pub fn validate_checksum(&self) -> Result<()> {
        let computed = sha256_hex(&self.data);
        if computed == self.checksum {
            Ok(())
        } else {
            Err(FlashError::ChecksumMismatch {
                expected: self.checksum.clone(),
                computed,
            })
        }
    }
}

/// Hex-encoded SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Parse an Intel HEX file into a contiguous image.
///
/// Returns the lowest record address and the payload, with 0xFF filling any
/// address gaps between records.
fn parse_intel_hex(contents: &str) -> Result<(u32, Vec<u8>)> {
    let mut bytes: BTreeMap<u32, u8> = BTreeMap::new();
    let mut upper_linear: u32 = 0;
    let mut segment_base: u32 = 0;
    let mut linear_addressing = false;

    let reader = ihex::Reader::new(contents);
    for record in reader {
        let record = record.map_err(|e| FlashError::InvalidImage {
            reason: format!("Intel HEX parse error: {}", e),
        })?;

        match record {
            ihex::Record::Data { offset, value } => {
                let base = if linear_addressing {
                    (upper_linear << 16) | offset as u32
                } else {
                    segment_base + offset as u32
                };
                for (i, byte) in value.into_iter().enumerate() {
                    bytes.insert(base + i as u32, byte);
                }
            }
            ihex::Record::ExtendedSegmentAddress(segment) => {
                segment_base = (segment as u32) << 4;
                linear_addressing = false;
            }
            ihex::Record::ExtendedLinearAddress(upper) => {
                upper_linear = upper as u32;
                linear_addressing = true;
            }
            ihex::Record::EndOfFile => break,
            // Start-address records set the entry point, not flash contents.
            _ => continue,
        }
    }

    let (&first, _) = bytes.iter().next().ok_or_else(|| FlashError::InvalidImage {
        reason: "firmware file contains no data records".to_string(),
    })?;
    let (&last, _) = bytes.iter().next_back().expect("non-empty map");

    let mut image = vec![0xFF_u8; (last - first + 1) as usize];
    for (address, byte) in bytes {
        image[(address - first) as usize] = byte;
    }

    Ok((first, image))
}

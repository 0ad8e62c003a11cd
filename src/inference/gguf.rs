//! GGUF header probing
//!
//! Cheap checks on a model file before it is handed to the native loader.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: usize = 24;

/// Errors that can occur while probing a model file
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to read model file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a GGUF file: magic 0x{0:08X}")]
    BadMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to hold a GGUF header")]
    Truncated,
}

/// Fixed-size header at the start of every GGUF file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Reads and checks the GGUF header of `path`. Versions 2 and 3 are accepted.
pub fn probe_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, ModelError> {
    let mut header = [0u8; HEADER_LEN];
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < HEADER_LEN {
        match file.read(&mut header[filled..])? {
            0 => return Err(ModelError::Truncated),
            n => filled += n,
        }
    }

    let u32_at = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    let u64_at = |at: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&header[at..at + 8]);
        u64::from_le_bytes(bytes)
    };

    let magic = u32_at(0);
    if magic != GGUF_MAGIC {
        return Err(ModelError::BadMagic(magic));
    }

    let version = u32_at(4);
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    Ok(GgufHeader {
        version,
        tensor_count: u64_at(8),
        metadata_kv_count: u64_at(16),
    })
}

//! Persistence frames for segment files
//!
//! Every store, index and manifest file is a single frame:
//!
//! ```text
//! [1-byte codec tag][4-byte length][payload][4-byte checksum]
//! ```
//!
//! The payload is JSON, optionally zstd-compressed. Frames are written to a
//! temporary file and renamed into place so readers never see a torn file.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

const HEADER_LEN: usize = 5;
const TRAILER_LEN: usize = 4;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Compression algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    #[default]
    Zstd,
}

impl CompressionAlgorithm {
    fn tag(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Zstd => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Zstd),
            other => Err(Error::Corrupt(format!("Unknown codec tag {}", other))),
        }
    }
}

/// Compress data using specified algorithm
pub fn compress(data: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zstd => {
            let mut encoder = zstd::Encoder::new(Vec::new(), 3)
                .map_err(|e| Error::Storage(format!("Failed to create zstd encoder: {}", e)))?;
            encoder
                .write_all(data)
                .map_err(|e| Error::Storage(format!("Failed to compress: {}", e)))?;
            encoder
                .finish()
                .map_err(|e| Error::Storage(format!("Failed to finish compression: {}", e)))
        }
    }
}

/// Decompress data using specified algorithm
pub fn decompress(data: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zstd => zstd::decode_all(data)
            .map_err(|e| Error::Corrupt(format!("Failed to decompress: {}", e))),
    }
}

fn checksum(payload: &[u8]) -> u32 {
    payload.iter().fold(0u32, |acc, &b| acc.rotate_left(5) ^ (b as u32))
}

/// Encode a value into a frame
pub fn encode_frame<T: Serialize>(value: &T, algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)
        .map_err(|e| Error::Serialization(format!("Failed to serialize frame: {}", e)))?;
    let payload = compress(&json, algorithm)?;

    let mut frame = Vec::with_capacity(payload.len() + HEADER_LEN + TRAILER_LEN);
    frame.push(algorithm.tag());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&checksum(&payload).to_le_bytes());
    Ok(frame)
}

/// Decode a frame produced by [`encode_frame`]
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() < HEADER_LEN + TRAILER_LEN {
        return Err(Error::Corrupt("Frame too short".to_string()));
    }

    let algorithm = CompressionAlgorithm::from_tag(bytes[0])?;
    let len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    if bytes.len() != len + HEADER_LEN + TRAILER_LEN {
        return Err(Error::Corrupt(format!(
            "Frame length mismatch: expected {} bytes, got {}",
            len + HEADER_LEN + TRAILER_LEN,
            bytes.len()
        )));
    }

    let payload = &bytes[HEADER_LEN..HEADER_LEN + len];
    let t = HEADER_LEN + len;
    let stored = u32::from_le_bytes([bytes[t], bytes[t + 1], bytes[t + 2], bytes[t + 3]]);
    if stored != checksum(payload) {
        return Err(Error::Corrupt("Checksum mismatch".to_string()));
    }

    let json = decompress(payload, algorithm)?;
    serde_json::from_slice(&json)
        .map_err(|e| Error::Corrupt(format!("Failed to deserialize frame: {}", e)))
}

/// Write a frame file via temp file + rename
pub fn write_frame_file<T: Serialize>(
    path: &Path,
    value: &T,
    algorithm: CompressionAlgorithm,
) -> Result<()> {
    let bytes = encode_frame(value, algorithm)?;
    write_file_atomic(path, &bytes)?;
    debug!(path = ?path, bytes = bytes.len(), "Wrote frame file");
    Ok(())
}

/// Replace `path` with `bytes` via temp file + rename
///
/// Each call writes its own temp file, so concurrent writers never share one.
pub fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut temp_name = path.as_os_str().to_os_string();
    temp_name.push(format!(".{}.{}.tmp", std::process::id(), seq));
    let temp_path = PathBuf::from(temp_name);
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Read a frame file; a missing file is an I/O error, a damaged one is `Corrupt`
pub fn read_frame_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path)?;
    decode_frame(&bytes)
}

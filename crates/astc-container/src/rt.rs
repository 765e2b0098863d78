//! RTME runtime blob format
//!
//! The `.rt` format predates the `.native` container: a 16-byte header
//! followed by already-assembled machine code. No export table, no data
//! section, no checksum. Kept as a second sink for compilation output.

use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::exec::ExecMemory;

/// Magic number for runtime blob files: "RTME"
pub const RT_MAGIC: [u8; 4] = *b"RTME";

/// Current runtime blob version
pub const RT_VERSION: u32 = 1;

/// Size of the fixed header in bytes
pub const RT_HEADER_SIZE: usize = 16;

/// Runtime blob errors
#[derive(Debug, Error)]
pub enum RtError {
    /// Invalid magic number
    #[error("Invalid magic number: expected RTME, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported blob version
    #[error("Unsupported runtime blob version: {0}")]
    UnsupportedVersion(u32),

    /// Header is malformed or inconsistent with the file size
    #[error("Corrupt header: {0}")]
    CorruptHeader(String),

    /// File I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Loading into executable memory failed
    #[error("Executable mapping failed: {0}")]
    MapFailed(String),
}

/// A runtime blob: header metadata plus raw machine code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtBlob {
    /// Machine code bytes
    pub code: Vec<u8>,
    /// Entry point offset within the code
    pub entry_offset: u32,
}

impl RtBlob {
    /// Create a blob from machine code and an entry offset
    pub fn new(code: Vec<u8>, entry_offset: u32) -> Self {
        Self { code, entry_offset }
    }

    /// Serialize: header `{magic, version, code_size, entry_offset}` + code
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RT_HEADER_SIZE + self.code.len());
        buf.extend_from_slice(&RT_MAGIC);
        buf.extend_from_slice(&RT_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.code.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.entry_offset.to_le_bytes());
        buf.extend_from_slice(&self.code);
        buf
    }

    /// Parse a serialized blob
    pub fn decode(data: &[u8]) -> Result<Self, RtError> {
        if data.len() < 4 {
            return Err(RtError::CorruptHeader(format!(
                "file too short for magic: {} bytes",
                data.len()
            )));
        }
        let magic: [u8; 4] = data[..4].try_into().unwrap();
        if magic != RT_MAGIC {
            return Err(RtError::InvalidMagic(magic));
        }
        if data.len() < RT_HEADER_SIZE {
            return Err(RtError::CorruptHeader(format!(
                "file too short for header: {} bytes",
                data.len()
            )));
        }
        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if version != RT_VERSION {
            return Err(RtError::UnsupportedVersion(version));
        }
        let code_size = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
        let entry_offset = u32::from_le_bytes(data[12..16].try_into().unwrap());
        if RT_HEADER_SIZE + code_size != data.len() {
            return Err(RtError::CorruptHeader(format!(
                "declared code size {} does not match file size {}",
                code_size,
                data.len()
            )));
        }
        if entry_offset as usize > code_size {
            return Err(RtError::CorruptHeader(format!(
                "entry offset {} outside {}-byte code",
                entry_offset, code_size
            )));
        }
        Ok(Self {
            code: data[RT_HEADER_SIZE..].to_vec(),
            entry_offset,
        })
    }

    /// Serialize and write to a file
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), RtError> {
        fs::write(path, self.encode())?;
        Ok(())
    }

    /// Read and parse a blob file
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, RtError> {
        let data = fs::read(path)?;
        Self::decode(&data)
    }

    /// Copy the code into executable memory and return it with the entry
    /// pointer resolvable via `ExecMemory::fn_ptr(entry_offset)`
    pub fn into_exec(self) -> Result<ExecMemory, RtError> {
        let mut mem =
            ExecMemory::allocate_rw(self.code.len()).map_err(|e| RtError::MapFailed(e.to_string()))?;
        mem.write(0, &self.code)
            .map_err(|e| RtError::MapFailed(e.to_string()))?;
        mem.finalize_rx().map_err(|e| RtError::MapFailed(e.to_string()))?;
        Ok(mem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let blob = RtBlob::new(vec![0x55, 0x48, 0x89, 0xE5, 0xC9, 0xC3], 0);
        let decoded = RtBlob::decode(&blob.encode()).unwrap();
        assert_eq!(decoded, blob);
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = RtBlob::new(vec![0xC3], 0).encode();
        bytes[0] = b'X';
        assert!(matches!(RtBlob::decode(&bytes), Err(RtError::InvalidMagic(_))));
    }

    #[test]
    fn test_size_mismatch() {
        let mut bytes = RtBlob::new(vec![0xC3; 8], 0).encode();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(RtBlob::decode(&bytes), Err(RtError::CorruptHeader(_))));
    }

    #[test]
    fn test_entry_offset_bounds() {
        let mut bytes = RtBlob::new(vec![0xC3; 4], 0).encode();
        bytes[12..16].copy_from_slice(&64u32.to_le_bytes());
        assert!(matches!(RtBlob::decode(&bytes), Err(RtError::CorruptHeader(_))));
    }

    #[test]
    fn test_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("program.rt");
        let blob = RtBlob::new(vec![0x90; 32], 16);
        blob.write(&path).unwrap();
        assert_eq!(RtBlob::read(&path).unwrap(), blob);
    }
}

//! NATV container format
//!
//! A `.native` file carries machine code for one architecture plus metadata:
//! a fixed 64-byte little-endian header, a code section, a data section, and
//! an export table. Sections are 16-byte aligned. The header stores a CRC64
//! of the whole file computed with the checksum field zeroed.

use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Magic number for native module files: "NATV"
pub const MAGIC: [u8; 4] = *b"NATV";

/// Current container format version
pub const VERSION: u32 = 1;

/// Size of the fixed header in bytes
pub const HEADER_SIZE: usize = 64;

/// Maximum number of exports per module
pub const MAX_EXPORTS: usize = 1024;

/// Maximum export name length in bytes, including the NUL cap carried over
/// from the on-the-wire fixed-array representation
pub const MAX_EXPORT_NAME: usize = 256;

const CRC64: crc::Crc<u64> = crc::Crc::<u64>::new(&crc::CRC_64_XZ);

/// Container encoding/decoding errors
#[derive(Debug, Error)]
pub enum ContainerError {
    /// Invalid magic number
    #[error("Invalid magic number: expected NATV, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported container version
    #[error("Unsupported container version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// Header is malformed
    #[error("Corrupt header: {0}")]
    CorruptHeader(String),

    /// Stored CRC64 does not match the recomputed one
    #[error("Checksum mismatch: expected {expected:#018x}, got {actual:#018x}")]
    ChecksumFailed {
        /// Checksum stored in the header
        expected: u64,
        /// Checksum recomputed over the file
        actual: u64,
    },

    /// Module was built for a different architecture than the host
    #[error("Architecture mismatch: module is {module}, host is {host}")]
    ArchitectureMismatch {
        /// Architecture declared by the module
        module: ArchTag,
        /// Architecture of the host
        host: ArchTag,
    },

    /// A section or export reaches outside its allowed bounds
    #[error("Bounds violation: {0}")]
    BoundsViolation(String),

    /// Two exports share a name
    #[error("Duplicate export: {0}")]
    DuplicateExport(String),

    /// Export table exceeds the per-module cap
    #[error("Too many exports: {0} (max {MAX_EXPORTS})")]
    TooManyExports(usize),

    /// Export lookup failed
    #[error("Export not found: {0}")]
    ExportNotFound(String),

    /// Committing the code section to executable memory failed
    #[error("Executable mapping failed: {0}")]
    ExecutableMapFailed(String),

    /// File I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Target architecture tag stored in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ArchTag {
    /// 32-bit x86
    X86 = 1,
    /// x86-64
    X64 = 2,
    /// 32-bit ARM
    Arm32 = 3,
    /// AArch64
    Arm64 = 4,
}

impl ArchTag {
    /// Decode from the wire representation
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(ArchTag::X86),
            2 => Some(ArchTag::X64),
            3 => Some(ArchTag::Arm32),
            4 => Some(ArchTag::Arm64),
            _ => None,
        }
    }

    /// Short name used in module filenames (`vm_x64_64.native`)
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchTag::X86 => "x86",
            ArchTag::X64 => "x64",
            ArchTag::Arm32 => "arm32",
            ArchTag::Arm64 => "arm64",
        }
    }

    /// Pointer width in bits for this architecture
    pub fn bits(&self) -> u32 {
        match self {
            ArchTag::X86 | ArchTag::Arm32 => 32,
            ArchTag::X64 | ArchTag::Arm64 => 64,
        }
    }

    /// The architecture this binary was compiled for, if it is one the
    /// container format knows about
    pub fn native() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(ArchTag::X64)
        } else if cfg!(target_arch = "aarch64") {
            Some(ArchTag::Arm64)
        } else if cfg!(target_arch = "x86") {
            Some(ArchTag::X86)
        } else if cfg!(target_arch = "arm") {
            Some(ArchTag::Arm32)
        } else {
            None
        }
    }
}

impl fmt::Display for ArchTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Module role tag stored in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ModuleType {
    /// A VM module: its code is a JIT/interpreter for ASTC programs
    Vm = 1,
    /// A libc module: re-exports the host C standard library
    Libc = 2,
    /// A user module: ordinary compiled code
    User = 3,
}

impl ModuleType {
    /// Decode from the wire representation
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(ModuleType::Vm),
            2 => Some(ModuleType::Libc),
            3 => Some(ModuleType::User),
            _ => None,
        }
    }
}

/// Kind of symbol an export points at, which also selects the section the
/// export offset is relative to (functions live in code, the rest in data)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExportKind {
    /// Function entry point in the code section
    Function = 0,
    /// Mutable variable in the data section
    Variable = 1,
    /// Read-only constant in the data section
    Constant = 2,
}

impl ExportKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ExportKind::Function),
            1 => Some(ExportKind::Variable),
            2 => Some(ExportKind::Constant),
            _ => None,
        }
    }
}

/// A named, offset-addressable symbol inside a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    /// Symbol name (≤ 256 bytes)
    pub name: String,
    /// Symbol kind; selects code vs data section
    pub kind: ExportKind,
    /// Reserved flag bits
    pub flags: u8,
    /// Offset within the section implied by `kind`
    pub offset: u32,
    /// Size of the exported object in bytes
    pub size: u32,
}

/// A native module: the in-memory form of a `.native` file
///
/// Built incrementally (`set_code`, `set_data`, `add_export`), then
/// serialized with `encode`/`write`. `decode`/`read` reverse the process and
/// perform full validation before returning.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeModule {
    /// Target architecture of the code section
    pub arch: ArchTag,
    /// Role of this module
    pub module_type: ModuleType,
    /// Machine code for `arch`
    pub code: Vec<u8>,
    /// Read-write data
    pub data: Vec<u8>,
    /// Entry point offset within the code section
    pub entry_offset: u32,
    /// Export table
    pub exports: Vec<Export>,
}

fn align16(offset: usize) -> usize {
    (offset + 15) & !15
}

/// CRC64 of a serialized module with the header checksum field zeroed
pub fn file_checksum(bytes: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&bytes[..40]);
    digest.update(&[0u8; 8]);
    digest.update(&bytes[48..]);
    digest.finalize()
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

impl NativeModule {
    /// Create a new empty module for the given architecture and role
    pub fn new(arch: ArchTag, module_type: ModuleType) -> Self {
        Self {
            arch,
            module_type,
            code: Vec::new(),
            data: Vec::new(),
            entry_offset: 0,
            exports: Vec::new(),
        }
    }

    /// Set the code section and the entry point offset within it
    pub fn set_code(&mut self, code: Vec<u8>, entry_offset: u32) {
        self.code = code;
        self.entry_offset = entry_offset;
    }

    /// Set the data section
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    /// Add an export to the table
    ///
    /// Rejects over-long names, duplicate names, and table overflow. Offsets
    /// are checked against the current sections by `validate`, not here, so
    /// exports may be declared before `set_code`/`set_data`.
    pub fn add_export(
        &mut self,
        name: &str,
        kind: ExportKind,
        offset: u32,
        size: u32,
    ) -> Result<(), ContainerError> {
        if name.len() + 1 > MAX_EXPORT_NAME {
            return Err(ContainerError::BoundsViolation(format!(
                "export name '{}…' exceeds {} bytes",
                &name[..32.min(name.len())],
                MAX_EXPORT_NAME
            )));
        }
        if self.exports.len() >= MAX_EXPORTS {
            return Err(ContainerError::TooManyExports(self.exports.len() + 1));
        }
        if self.exports.iter().any(|e| e.name == name) {
            return Err(ContainerError::DuplicateExport(name.to_string()));
        }
        self.exports.push(Export {
            name: name.to_string(),
            kind,
            flags: 0,
            offset,
            size,
        });
        Ok(())
    }

    /// Validate structural invariants: entry point and every export must lie
    /// inside the section implied by its kind
    pub fn validate(&self) -> Result<(), ContainerError> {
        if self.entry_offset as usize > self.code.len() {
            return Err(ContainerError::BoundsViolation(format!(
                "entry offset {} outside code section ({} bytes)",
                self.entry_offset,
                self.code.len()
            )));
        }
        if self.exports.len() > MAX_EXPORTS {
            return Err(ContainerError::TooManyExports(self.exports.len()));
        }
        let mut seen = std::collections::HashSet::new();
        for export in &self.exports {
            if !seen.insert(export.name.as_str()) {
                return Err(ContainerError::DuplicateExport(export.name.clone()));
            }
            let section_len = match export.kind {
                ExportKind::Function => self.code.len(),
                ExportKind::Variable | ExportKind::Constant => self.data.len(),
            };
            let end = export.offset as u64 + export.size as u64;
            if end > section_len as u64 {
                return Err(ContainerError::BoundsViolation(format!(
                    "export '{}' spans {}..{} outside its {}-byte section",
                    export.name, export.offset, end, section_len
                )));
            }
        }
        Ok(())
    }

    /// Checksum this module would carry on disk
    pub fn compute_checksum(&self) -> u64 {
        file_checksum(&self.encode())
    }

    /// Serialize to the on-disk format
    ///
    /// Layout: header, code, data, export table, each section 16-byte
    /// aligned. The checksum field is written as zero, the CRC64 of the full
    /// buffer is computed, then the field is patched.
    pub fn encode(&self) -> Vec<u8> {
        let code_offset = align16(HEADER_SIZE);
        let data_offset = align16(code_offset + self.code.len());
        let export_offset = align16(data_offset + self.data.len());

        let mut buf = Vec::with_capacity(export_offset + self.exports.len() * 16);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.arch as u16).to_le_bytes());
        buf.extend_from_slice(&(self.module_type as u16).to_le_bytes());
        buf.extend_from_slice(&(code_offset as u32).to_le_bytes());
        buf.extend_from_slice(&(self.code.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(data_offset as u32).to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(export_offset as u32).to_le_bytes());
        buf.extend_from_slice(&(self.exports.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.entry_offset.to_le_bytes());
        buf.extend_from_slice(&[0u8; 8]); // checksum, patched below
        buf.extend_from_slice(&[0u8; 16]); // reserved

        buf.resize(code_offset, 0);
        buf.extend_from_slice(&self.code);
        buf.resize(data_offset, 0);
        buf.extend_from_slice(&self.data);
        buf.resize(export_offset, 0);

        for export in &self.exports {
            buf.extend_from_slice(&(export.name.len() as u16).to_le_bytes());
            buf.extend_from_slice(export.name.as_bytes());
            buf.push(export.kind as u8);
            buf.push(export.flags);
            buf.extend_from_slice(&export.offset.to_le_bytes());
            buf.extend_from_slice(&export.size.to_le_bytes());
        }

        let checksum = file_checksum(&buf);
        buf[40..48].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Serialize and write to a file
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), ContainerError> {
        self.validate()?;
        fs::write(path, self.encode())?;
        Ok(())
    }

    /// Parse a serialized module without a host-architecture check
    ///
    /// Structural validation only; loaders that are about to map the code
    /// section should use `decode_for_host`.
    pub fn decode(data: &[u8]) -> Result<Self, ContainerError> {
        Self::decode_inner(data, None)
    }

    /// Parse a serialized module, additionally refusing code built for a
    /// different architecture than `host`
    pub fn decode_for_host(data: &[u8], host: ArchTag) -> Result<Self, ContainerError> {
        Self::decode_inner(data, Some(host))
    }

    /// Read and parse a module file without a host-architecture check
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ContainerError> {
        let data = fs::read(path)?;
        Self::decode(&data)
    }

    fn decode_inner(data: &[u8], host: Option<ArchTag>) -> Result<Self, ContainerError> {
        // Header errors come before any allocation or checksum work.
        if data.len() < 4 {
            return Err(ContainerError::CorruptHeader(format!(
                "file too short for magic: {} bytes",
                data.len()
            )));
        }
        let magic: [u8; 4] = data[..4].try_into().unwrap();
        if magic != MAGIC {
            return Err(ContainerError::InvalidMagic(magic));
        }
        if data.len() < HEADER_SIZE {
            return Err(ContainerError::CorruptHeader(format!(
                "file too short for header: {} bytes",
                data.len()
            )));
        }
        let version = read_u32(data, 4);
        if version != VERSION {
            return Err(ContainerError::UnsupportedVersion(version));
        }
        let arch = ArchTag::from_u16(read_u16(data, 8))
            .ok_or_else(|| ContainerError::CorruptHeader("unknown architecture tag".into()))?;
        let module_type = ModuleType::from_u16(read_u16(data, 10))
            .ok_or_else(|| ContainerError::CorruptHeader("unknown module type tag".into()))?;

        let code_offset = read_u32(data, 12) as usize;
        let code_size = read_u32(data, 16) as usize;
        let data_offset = read_u32(data, 20) as usize;
        let data_size = read_u32(data, 24) as usize;
        let export_offset = read_u32(data, 28) as usize;
        let export_count = read_u32(data, 32) as usize;
        let entry_offset = read_u32(data, 36);
        let stored_checksum = read_u64(data, 40);

        // Whole-file CRC with the checksum field masked.
        let actual = file_checksum(data);
        if actual != stored_checksum {
            return Err(ContainerError::ChecksumFailed {
                expected: stored_checksum,
                actual,
            });
        }

        if let Some(host) = host {
            if arch != host {
                return Err(ContainerError::ArchitectureMismatch { module: arch, host });
            }
        }

        let section = |name: &str, offset: usize, size: usize| {
            let end = offset as u64 + size as u64;
            if end > data.len() as u64 {
                Err(ContainerError::BoundsViolation(format!(
                    "{} section {}..{} outside {}-byte file",
                    name,
                    offset,
                    end,
                    data.len()
                )))
            } else {
                Ok(data[offset..offset + size].to_vec())
            }
        };
        let code = section("code", code_offset, code_size)?;
        let data_section = section("data", data_offset, data_size)?;

        if export_count > MAX_EXPORTS {
            return Err(ContainerError::TooManyExports(export_count));
        }
        if export_offset > data.len() {
            return Err(ContainerError::BoundsViolation(format!(
                "export table offset {} outside {}-byte file",
                export_offset,
                data.len()
            )));
        }

        let mut exports = Vec::with_capacity(export_count);
        let mut cursor = export_offset;
        for index in 0..export_count {
            let truncated = || {
                ContainerError::BoundsViolation(format!(
                    "export table truncated at entry {}",
                    index
                ))
            };
            if cursor + 2 > data.len() {
                return Err(truncated());
            }
            let name_len = read_u16(data, cursor) as usize;
            cursor += 2;
            if name_len + 1 > MAX_EXPORT_NAME {
                return Err(ContainerError::BoundsViolation(format!(
                    "export {} name length {} exceeds {} bytes",
                    index, name_len, MAX_EXPORT_NAME
                )));
            }
            if cursor + name_len + 10 > data.len() {
                return Err(truncated());
            }
            let name = String::from_utf8(data[cursor..cursor + name_len].to_vec())
                .map_err(|_| {
                    ContainerError::BoundsViolation(format!("export {} name is not UTF-8", index))
                })?;
            cursor += name_len;
            let kind = ExportKind::from_u8(data[cursor]).ok_or_else(|| {
                ContainerError::BoundsViolation(format!("export '{}' has unknown kind", name))
            })?;
            let flags = data[cursor + 1];
            let offset = read_u32(data, cursor + 2);
            let size = read_u32(data, cursor + 6);
            cursor += 10;
            exports.push(Export {
                name,
                kind,
                flags,
                offset,
                size,
            });
        }

        let module = Self {
            arch,
            module_type,
            code,
            data: data_section,
            entry_offset,
            exports,
        };
        // Per-export section bounds and duplicate detection.
        module.validate()?;
        Ok(module)
    }

    /// Look up an export by name
    pub fn find_export(&self, name: &str) -> Result<&Export, ContainerError> {
        self.exports
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| ContainerError::ExportNotFound(name.to_string()))
    }
}

//! ASTC native module container
//!
//! This crate provides the `.native` binary container format and the
//! machinery to bring its code section into executable memory:
//! - **native**: the NATV container codec (builder, encode/decode, validation)
//! - **exec**: W^X executable memory (allocate RW, copy, flip to RX)
//! - **mapped**: a loaded container with resolvable exports
//! - **rt**: the older RTME runtime-blob format (header + raw machine code)

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod exec;
pub mod mapped;
pub mod native;
pub mod rt;

pub use exec::{ExecMemory, ExecError};
pub use mapped::MappedModule;
pub use native::{
    ArchTag, ContainerError, Export, ExportKind, ModuleType, NativeModule, HEADER_SIZE, MAGIC,
    MAX_EXPORTS, MAX_EXPORT_NAME, VERSION,
};
pub use rt::{RtBlob, RtError, RT_MAGIC};

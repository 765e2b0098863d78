//! In-process form of a native module
//!
//! A `MappedModule` owns a freshly allocated executable mapping of the code
//! section, a read-write copy of the data section, and a name → export index.
//! The file is validated in full before any memory is mapped, so a malformed
//! module is rejected without side effects.

use std::collections::HashMap;
use std::path::Path;

use crate::exec::ExecMemory;
use crate::native::{ArchTag, ContainerError, Export, ExportKind, NativeModule};

/// A native module whose code section lives in executable memory
#[derive(Debug)]
pub struct MappedModule {
    module: NativeModule,
    code: ExecMemory,
    data: Vec<u8>,
    index: HashMap<String, usize>,
}

impl MappedModule {
    /// Map a validated module into the process
    ///
    /// The code section is copied into a fresh RW mapping and flipped to RX;
    /// the data section is copied into an ordinary read-write allocation.
    pub fn map(module: NativeModule) -> Result<Self, ContainerError> {
        module.validate()?;

        let mut code = ExecMemory::allocate_rw(module.code.len()).map_err(map_exec_err)?;
        code.write(0, &module.code).map_err(map_exec_err)?;
        code.finalize_rx().map_err(map_exec_err)?;

        let data = module.data.clone();
        let index = module
            .exports
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();

        Ok(Self {
            module,
            code,
            data,
            index,
        })
    }

    /// Decode a serialized module for this host and map it
    pub fn load_bytes(bytes: &[u8], host: ArchTag) -> Result<Self, ContainerError> {
        let module = NativeModule::decode_for_host(bytes, host)?;
        Self::map(module)
    }

    /// Read, decode, and map a `.native` file
    pub fn load<P: AsRef<Path>>(path: P, host: ArchTag) -> Result<Self, ContainerError> {
        let bytes = std::fs::read(path)?;
        Self::load_bytes(&bytes, host)
    }

    /// Resolve an export to an address inside the mapped sections
    ///
    /// Function exports resolve into the executable region, variable and
    /// constant exports into the data allocation. The returned pointer is
    /// valid until this module is dropped.
    pub fn find_export(&self, name: &str) -> Result<*const u8, ContainerError> {
        let export = self.export(name)?;
        match export.kind {
            ExportKind::Function => self
                .code
                .fn_ptr(export.offset as usize)
                .map_err(map_exec_err),
            ExportKind::Variable | ExportKind::Constant => {
                Ok(unsafe { self.data.as_ptr().add(export.offset as usize) })
            }
        }
    }

    /// Export metadata by name
    pub fn export(&self, name: &str) -> Result<&Export, ContainerError> {
        let &i = self
            .index
            .get(name)
            .ok_or_else(|| ContainerError::ExportNotFound(name.to_string()))?;
        Ok(&self.module.exports[i])
    }

    /// Pointer to the module entry point within the code section
    pub fn entry_ptr(&self) -> Result<*const u8, ContainerError> {
        self.code
            .fn_ptr(self.module.entry_offset as usize)
            .map_err(map_exec_err)
    }

    /// The decoded module this mapping was created from
    pub fn module(&self) -> &NativeModule {
        &self.module
    }

    /// Names of all exports, in table order
    pub fn export_names(&self) -> impl Iterator<Item = &str> {
        self.module.exports.iter().map(|e| e.name.as_str())
    }
}

fn map_exec_err(e: crate::exec::ExecError) -> ContainerError {
    match e {
        crate::exec::ExecError::OutOfBounds { offset, len, size } => {
            ContainerError::BoundsViolation(format!(
                "exec region access {}+{} outside {} bytes",
                offset, len, size
            ))
        }
        other => ContainerError::ExecutableMapFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::ModuleType;

    fn host_arch() -> ArchTag {
        ArchTag::native().unwrap_or(ArchTag::X64)
    }

    #[cfg(unix)]
    #[test]
    fn test_map_and_resolve() {
        let mut module = NativeModule::new(host_arch(), ModuleType::User);
        module.set_code(vec![0xC3; 16], 0);
        module.set_data(vec![7; 32]);
        module.add_export("f", ExportKind::Function, 4, 1).unwrap();
        module.add_export("blob", ExportKind::Constant, 8, 4).unwrap();

        let mapped = MappedModule::map(module).unwrap();
        let f = mapped.find_export("f").unwrap();
        let blob = mapped.find_export("blob").unwrap();
        assert_eq!(f as usize, mapped.find_export("f").unwrap() as usize);
        assert_eq!(unsafe { *blob }, 7);
        assert!(matches!(
            mapped.find_export("missing"),
            Err(ContainerError::ExportNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_malformed_module_is_rejected_before_mapping() {
        let mut module = NativeModule::new(host_arch(), ModuleType::User);
        module.set_code(vec![0xC3; 4], 0);
        module.add_export("oob", ExportKind::Function, 0, 32).unwrap();
        assert!(MappedModule::map(module).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_load_bytes_checks_host_arch() {
        let mut module = NativeModule::new(ArchTag::X86, ModuleType::User);
        module.set_code(vec![0xC3; 4], 0);
        let bytes = module.encode();
        let err = MappedModule::load_bytes(&bytes, ArchTag::Arm64).unwrap_err();
        assert!(matches!(err, ContainerError::ArchitectureMismatch { .. }));
    }
}

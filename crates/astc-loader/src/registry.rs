//! Name-keyed module registry
//!
//! Loaded modules are kept under their logical name with a refcount: a
//! second `load` of the same name returns the existing handle. Global
//! symbol resolution walks modules most-recently-loaded first, which makes
//! libc overrides deterministic. The registry mutex is uncontended in the
//! single-threaded launcher but guards embedders that spawn threads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;

use astc_container::{ContainerError, MappedModule, ModuleType, NativeModule};

use crate::dynlib::{DynLibrary, DynlibError};
use crate::platform::{module_file_name, Platform};

/// Module loader errors
#[derive(Debug, Error)]
pub enum LoaderError {
    /// No file for the logical name on the search path
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    /// The file exists but could not be loaded
    #[error("Load failed for {name}: {reason}")]
    LoadFailed {
        /// Logical module name
        name: String,
        /// Failure detail
        reason: String,
    },

    /// Symbol lookup failed in a specific module
    #[error("Symbol not found: {symbol} in {module}")]
    SymbolNotFound {
        /// Module searched
        module: String,
        /// Missing symbol
        symbol: String,
    },

    /// The registry is at capacity
    #[error("Maximum module count reached: {0}")]
    MaxModulesReached(usize),

    /// The handle does not refer to a loaded module
    #[error("Invalid module handle")]
    InvalidHandle,

    /// Container-level failure
    #[error(transparent)]
    Container(#[from] ContainerError),
}

/// Loader configuration: search paths and limits
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Directories searched for `{name}_{arch}_{bits}.native`
    pub search_paths: Vec<PathBuf>,
    /// Maximum number of simultaneously loaded modules
    pub max_modules: usize,
    /// Host platform used for filename construction and arch checks
    pub platform: Platform,
}

impl LoaderConfig {
    /// Default configuration: `./modules/`, `./lib/`, the executable's
    /// directory, and `bin/layer2/`
    pub fn new(platform: Platform) -> Self {
        let mut search_paths = vec![
            PathBuf::from("./modules"),
            PathBuf::from("./lib"),
        ];
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
        {
            search_paths.push(exe_dir);
        }
        search_paths.push(PathBuf::from("bin/layer2"));
        Self {
            search_paths,
            max_modules: 64,
            platform,
        }
    }

    /// Prepend a search directory (takes priority over the defaults)
    pub fn add_search_path<P: Into<PathBuf>>(&mut self, path: P) {
        self.search_paths.insert(0, path.into());
    }
}

/// Opaque handle to a loaded module
///
/// Valid from `load` until the matching `unload` drops the refcount to
/// zero; symbol pointers resolved through it must not outlive the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(u64);

/// Snapshot of a loaded module's metadata
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// Logical name
    pub name: String,
    /// File the module was loaded from
    pub path: PathBuf,
    /// `.native` module type, None for host libraries
    pub module_type: Option<ModuleType>,
    /// Export count for `.native` modules, 0 for host libraries
    pub export_count: usize,
    /// Current reference count
    pub refcount: usize,
}

enum Backing {
    Native(MappedModule),
    Host(DynLibrary),
    // Exports of an in-process module, stored as addresses so the registry
    // stays Send.
    Builtin(HashMap<String, usize>),
}

impl Backing {
    fn resolve(&self, symbol: &str) -> Option<*const u8> {
        match self {
            Backing::Native(mapped) => mapped.find_export(symbol).ok(),
            Backing::Host(lib) => lib.symbol(symbol).ok(),
            Backing::Builtin(exports) => exports.get(symbol).map(|&addr| addr as *const u8),
        }
    }
}

struct Slot {
    name: String,
    path: PathBuf,
    backing: Backing,
    refcount: usize,
    load_seq: u64,
}

struct Inner {
    modules: FxHashMap<u64, Slot>,
    by_name: HashMap<String, u64>,
    next_id: u64,
    next_seq: u64,
}

/// The process-wide module registry
pub struct ModuleRegistry {
    config: LoaderConfig,
    inner: Mutex<Inner>,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                modules: FxHashMap::default(),
                by_name: HashMap::new(),
                next_id: 1,
                next_seq: 0,
            }),
        }
    }

    /// The configuration this registry was built with
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Search the configured directories for the logical name's module file
    pub fn discover(&self, logical_name: &str) -> Option<PathBuf> {
        let file_name = module_file_name(logical_name, &self.config.platform);
        for dir in &self.config.search_paths {
            let candidate = dir.join(&file_name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    /// Load a module by logical name
    ///
    /// If the name is already loaded, its refcount is bumped and the
    /// existing handle returned. Otherwise the file is taken from `path` or
    /// discovered on the search path, parsed as `.native` first, and on
    /// magic mismatch handed to the host dynamic linker.
    pub fn load(
        &self,
        logical_name: &str,
        path: Option<&Path>,
    ) -> Result<ModuleHandle, LoaderError> {
        {
            let mut inner = self.inner.lock();
            if let Some(&id) = inner.by_name.get(logical_name) {
                let slot = inner.modules.get_mut(&id).expect("by_name points at slot");
                slot.refcount += 1;
                return Ok(ModuleHandle(id));
            }
            if inner.modules.len() >= self.config.max_modules {
                return Err(LoaderError::MaxModulesReached(self.config.max_modules));
            }
        }

        let path = match path {
            Some(p) => p.to_path_buf(),
            None => self
                .discover(logical_name)
                .ok_or_else(|| LoaderError::ModuleNotFound(logical_name.to_string()))?,
        };
        let backing = self.open_backing(logical_name, &path)?;

        let mut inner = self.inner.lock();
        // Capacity may have changed while the file was being read.
        if inner.modules.len() >= self.config.max_modules {
            return Err(LoaderError::MaxModulesReached(self.config.max_modules));
        }
        if let Some(&id) = inner.by_name.get(logical_name) {
            let slot = inner.modules.get_mut(&id).expect("by_name points at slot");
            slot.refcount += 1;
            return Ok(ModuleHandle(id));
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.modules.insert(
            id,
            Slot {
                name: logical_name.to_string(),
                path,
                backing,
                refcount: 1,
                load_seq: seq,
            },
        );
        inner.by_name.insert(logical_name.to_string(), id);
        Ok(ModuleHandle(id))
    }

    fn open_backing(&self, name: &str, path: &Path) -> Result<Backing, LoaderError> {
        let host_arch = self.config.platform.arch.ok_or_else(|| LoaderError::LoadFailed {
            name: name.to_string(),
            reason: "host architecture is unknown".to_string(),
        })?;
        let bytes = std::fs::read(path).map_err(|e| LoaderError::LoadFailed {
            name: name.to_string(),
            reason: format!("{}: {}", path.display(), e),
        })?;

        match NativeModule::decode_for_host(&bytes, host_arch) {
            Ok(module) => Ok(Backing::Native(MappedModule::map(module)?)),
            // Not a container at all: hand it to the OS linker.
            Err(ContainerError::InvalidMagic(_)) => {
                let lib = DynLibrary::open(path).map_err(|e: DynlibError| {
                    LoaderError::LoadFailed {
                        name: name.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(Backing::Host(lib))
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Register an in-process module whose exports are addresses inside
    /// this binary
    ///
    /// The libc forwarding module registers itself this way: its functions
    /// live in the process image, so there is no file to map, but global
    /// symbol resolution and `resolve` work like any other module.
    pub fn register_builtin(
        &self,
        logical_name: &str,
        exports: Vec<(String, *const u8)>,
    ) -> Result<ModuleHandle, LoaderError> {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.by_name.get(logical_name) {
            let slot = inner.modules.get_mut(&id).expect("by_name points at slot");
            slot.refcount += 1;
            return Ok(ModuleHandle(id));
        }
        if inner.modules.len() >= self.config.max_modules {
            return Err(LoaderError::MaxModulesReached(self.config.max_modules));
        }
        let map: HashMap<String, usize> = exports
            .into_iter()
            .map(|(name, ptr)| (name, ptr as usize))
            .collect();
        let id = inner.next_id;
        inner.next_id += 1;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.modules.insert(
            id,
            Slot {
                name: logical_name.to_string(),
                path: PathBuf::from("<builtin>"),
                backing: Backing::Builtin(map),
                refcount: 1,
                load_seq: seq,
            },
        );
        inner.by_name.insert(logical_name.to_string(), id);
        Ok(ModuleHandle(id))
    }

    /// Drop one reference; the module is unmapped when the count hits zero
    pub fn unload(&self, handle: ModuleHandle) -> Result<(), LoaderError> {
        let mut inner = self.inner.lock();
        let slot = inner
            .modules
            .get_mut(&handle.0)
            .ok_or(LoaderError::InvalidHandle)?;
        slot.refcount -= 1;
        if slot.refcount == 0 {
            let name = slot.name.clone();
            inner.modules.remove(&handle.0);
            inner.by_name.remove(&name);
        }
        Ok(())
    }

    /// Resolve a symbol inside a specific module
    pub fn resolve(&self, handle: ModuleHandle, symbol: &str) -> Result<*const u8, LoaderError> {
        let inner = self.inner.lock();
        let slot = inner
            .modules
            .get(&handle.0)
            .ok_or(LoaderError::InvalidHandle)?;
        slot.backing
            .resolve(symbol)
            .ok_or_else(|| LoaderError::SymbolNotFound {
                module: slot.name.clone(),
                symbol: symbol.to_string(),
            })
    }

    /// Resolve a symbol across all loaded modules, most recently loaded
    /// first; returns the owning module's name alongside the address
    pub fn resolve_global(&self, symbol: &str) -> Option<(String, *const u8)> {
        let inner = self.inner.lock();
        let mut slots: Vec<&Slot> = inner.modules.values().collect();
        slots.sort_by(|a, b| b.load_seq.cmp(&a.load_seq));
        for slot in slots {
            if let Some(ptr) = slot.backing.resolve(symbol) {
                return Some((slot.name.clone(), ptr));
            }
        }
        None
    }

    /// Handle for an already-loaded logical name
    pub fn handle_of(&self, logical_name: &str) -> Option<ModuleHandle> {
        self.inner.lock().by_name.get(logical_name).map(|&id| ModuleHandle(id))
    }

    /// Metadata snapshot for one module
    pub fn info(&self, handle: ModuleHandle) -> Result<ModuleInfo, LoaderError> {
        let inner = self.inner.lock();
        let slot = inner
            .modules
            .get(&handle.0)
            .ok_or(LoaderError::InvalidHandle)?;
        Ok(slot_info(slot))
    }

    /// Metadata snapshots for all loaded modules, in load order
    pub fn list(&self) -> Vec<ModuleInfo> {
        let inner = self.inner.lock();
        let mut slots: Vec<&Slot> = inner.modules.values().collect();
        slots.sort_by_key(|s| s.load_seq);
        slots.into_iter().map(slot_info).collect()
    }

    /// Number of loaded modules
    pub fn len(&self) -> usize {
        self.inner.lock().modules.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().modules.is_empty()
    }
}

fn slot_info(slot: &Slot) -> ModuleInfo {
    let (module_type, export_count) = match &slot.backing {
        Backing::Native(mapped) => (
            Some(mapped.module().module_type),
            mapped.module().exports.len(),
        ),
        Backing::Host(_) => (None, 0),
        Backing::Builtin(exports) => (Some(ModuleType::Libc), exports.len()),
    };
    ModuleInfo {
        name: slot.name.clone(),
        path: slot.path.clone(),
        module_type,
        export_count,
        refcount: slot.refcount,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::platform::detect;
    use astc_container::{ArchTag, ExportKind};

    fn host_platform() -> Platform {
        detect()
    }

    fn write_module(dir: &Path, file: &str, exports: &[&str]) -> PathBuf {
        let arch = host_platform().arch.unwrap_or(ArchTag::X64);
        let mut module = NativeModule::new(arch, ModuleType::User);
        module.set_code(vec![0xC3; 64], 0);
        for (i, name) in exports.iter().enumerate() {
            module
                .add_export(name, ExportKind::Function, i as u32, 1)
                .unwrap();
        }
        let path = dir.join(file);
        module.write(&path).unwrap();
        path
    }

    fn test_registry(dir: &Path) -> ModuleRegistry {
        let mut config = LoaderConfig::new(host_platform());
        config.search_paths = vec![dir.to_path_buf()];
        ModuleRegistry::new(config)
    }

    #[test]
    fn test_load_resolve_unload() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), "m.native", &["hello"]);
        let registry = test_registry(dir.path());

        let handle = registry.load("m", Some(&path)).unwrap();
        assert!(!registry.resolve(handle, "hello").unwrap().is_null());
        assert!(matches!(
            registry.resolve(handle, "absent"),
            Err(LoaderError::SymbolNotFound { .. })
        ));

        registry.unload(handle).unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.resolve(handle, "hello"),
            Err(LoaderError::InvalidHandle)
        ));
    }

    #[test]
    fn test_second_load_shares_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), "m.native", &["f"]);
        let registry = test_registry(dir.path());

        let first = registry.load("m", Some(&path)).unwrap();
        let second = registry.load("m", None).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.info(first).unwrap().refcount, 2);

        registry.unload(first).unwrap();
        // Still loaded: the second reference holds it.
        assert_eq!(registry.len(), 1);
        registry.unload(second).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_discovery_by_convention() {
        let dir = tempfile::tempdir().unwrap();
        let platform = host_platform();
        let file = module_file_name("vm", &platform);
        write_module(dir.path(), &file, &["vm_native_main"]);

        let registry = test_registry(dir.path());
        assert!(registry.discover("vm").is_some());
        let handle = registry.load("vm", None).unwrap();
        assert!(!registry.resolve(handle, "vm_native_main").unwrap().is_null());
    }

    #[test]
    fn test_module_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());
        assert!(matches!(
            registry.load("ghost", None),
            Err(LoaderError::ModuleNotFound(_))
        ));
    }

    #[test]
    fn test_global_resolution_prefers_recent() {
        let dir = tempfile::tempdir().unwrap();
        let old = write_module(dir.path(), "old.native", &["shared", "only_old"]);
        let new = write_module(dir.path(), "new.native", &["shared"]);
        let registry = test_registry(dir.path());

        registry.load("old", Some(&old)).unwrap();
        registry.load("new", Some(&new)).unwrap();

        let (owner, _) = registry.resolve_global("shared").unwrap();
        assert_eq!(owner, "new");
        let (owner, _) = registry.resolve_global("only_old").unwrap();
        assert_eq!(owner, "old");
        assert!(registry.resolve_global("nowhere").is_none());
    }

    #[test]
    fn test_max_modules() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LoaderConfig::new(host_platform());
        config.search_paths = vec![dir.path().to_path_buf()];
        config.max_modules = 2;
        let registry = ModuleRegistry::new(config);

        for i in 0..2 {
            let name = format!("m{}", i);
            let path = write_module(dir.path(), &format!("{}.native", name), &["f"]);
            registry.load(&name, Some(&path)).unwrap();
        }
        let path = write_module(dir.path(), "m2.native", &["f"]);
        assert!(matches!(
            registry.load("m2", Some(&path)),
            Err(LoaderError::MaxModulesReached(2))
        ));
    }

    #[test]
    fn test_corrupt_container_is_not_dlopened() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), "m.native", &["f"]);
        let mut bytes = std::fs::read(&path).unwrap();
        // Valid magic, corrupted body: must surface the container error
        // rather than falling back to the host linker.
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let registry = test_registry(dir.path());
        assert!(matches!(
            registry.load("m", Some(&path)),
            Err(LoaderError::Container(ContainerError::ChecksumFailed { .. }))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_in_load_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_module(dir.path(), "a.native", &["f"]);
        let b = write_module(dir.path(), "b.native", &["f"]);
        let registry = test_registry(dir.path());
        registry.load("a", Some(&a)).unwrap();
        registry.load("b", Some(&b)).unwrap();
        let names: Vec<String> = registry.list().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}

//! Host dynamic-library fallback
//!
//! When a module file is not a `.native` container, the loader falls back to
//! the operating system's dynamic linker: `dlopen` on unix, `LoadLibraryW`
//! on Windows. Symbols come back as raw addresses; lifetime is tied to the
//! handle.

use std::path::Path;
use thiserror::Error;

/// Errors from the host dynamic linker
#[derive(Debug, Error)]
pub enum DynlibError {
    /// The library could not be opened
    #[error("Cannot open library {path}: {reason}")]
    OpenFailed {
        /// Path that was attempted
        path: String,
        /// Linker-reported reason
        reason: String,
    },

    /// A symbol was not found in the library
    #[error("Symbol not found: {symbol} in {library}")]
    SymbolNotFound {
        /// Symbol name
        symbol: String,
        /// Library path
        library: String,
    },

    /// A path or symbol name could not cross the FFI boundary
    #[error("Invalid name: {0}")]
    InvalidName(String),
}

/// An open host dynamic library
pub struct DynLibrary {
    handle: platform::Handle,
    path: String,
}

// Safety: the underlying OS handle is reference-counted by the dynamic
// linker and symbol lookup is thread-safe on supported hosts.
unsafe impl Send for DynLibrary {}
unsafe impl Sync for DynLibrary {}

impl DynLibrary {
    /// Open a dynamic library
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DynlibError> {
        let path_ref = path.as_ref();
        let path_str = path_ref
            .to_str()
            .ok_or_else(|| DynlibError::InvalidName(format!("{:?}", path_ref)))?;
        let handle = platform::open(path_str)?;
        Ok(Self {
            handle,
            path: path_str.to_string(),
        })
    }

    /// Resolve a symbol to its address
    ///
    /// The returned pointer is valid while this library stays open. Callers
    /// are responsible for transmuting it to the correct function type.
    pub fn symbol(&self, name: &str) -> Result<*const u8, DynlibError> {
        platform::symbol(self.handle, name, &self.path)
    }

    /// Path this library was opened from
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for DynLibrary {
    fn drop(&mut self) {
        platform::close(self.handle);
    }
}

#[cfg(unix)]
mod platform {
    use super::DynlibError;
    use std::ffi::{CStr, CString};

    pub type Handle = *mut libc::c_void;

    fn last_dl_error() -> String {
        unsafe {
            let err = libc::dlerror();
            if err.is_null() {
                "unknown error".to_string()
            } else {
                CStr::from_ptr(err).to_string_lossy().into_owned()
            }
        }
    }

    pub fn open(path: &str) -> Result<Handle, DynlibError> {
        let c_path = CString::new(path)
            .map_err(|_| DynlibError::InvalidName(path.to_string()))?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(DynlibError::OpenFailed {
                path: path.to_string(),
                reason: last_dl_error(),
            });
        }
        Ok(handle)
    }

    pub fn symbol(handle: Handle, name: &str, path: &str) -> Result<*const u8, DynlibError> {
        let c_name = CString::new(name)
            .map_err(|_| DynlibError::InvalidName(name.to_string()))?;
        unsafe {
            // Clear any stale error so a null return can be told apart from
            // a symbol whose value really is null.
            libc::dlerror();
            let sym = libc::dlsym(handle, c_name.as_ptr());
            let err = libc::dlerror();
            if !err.is_null() || sym.is_null() {
                return Err(DynlibError::SymbolNotFound {
                    symbol: name.to_string(),
                    library: path.to_string(),
                });
            }
            Ok(sym as *const u8)
        }
    }

    pub fn close(handle: Handle) {
        unsafe {
            libc::dlclose(handle);
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::DynlibError;
    use std::ffi::{CString, OsStr};
    use std::os::windows::ffi::OsStrExt;

    pub type Handle = *mut std::ffi::c_void;

    extern "system" {
        fn LoadLibraryW(filename: *const u16) -> Handle;
        fn GetProcAddress(module: Handle, name: *const i8) -> *mut std::ffi::c_void;
        fn FreeLibrary(module: Handle) -> i32;
        fn GetLastError() -> u32;
    }

    pub fn open(path: &str) -> Result<Handle, DynlibError> {
        let wide: Vec<u16> = OsStr::new(path)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let handle = unsafe { LoadLibraryW(wide.as_ptr()) };
        if handle.is_null() {
            return Err(DynlibError::OpenFailed {
                path: path.to_string(),
                reason: format!("error code {}", unsafe { GetLastError() }),
            });
        }
        Ok(handle)
    }

    pub fn symbol(handle: Handle, name: &str, path: &str) -> Result<*const u8, DynlibError> {
        let c_name = CString::new(name)
            .map_err(|_| DynlibError::InvalidName(name.to_string()))?;
        let sym = unsafe { GetProcAddress(handle, c_name.as_ptr()) };
        if sym.is_null() {
            return Err(DynlibError::SymbolNotFound {
                symbol: name.to_string(),
                library: path.to_string(),
            });
        }
        Ok(sym as *const u8)
    }

    pub fn close(handle: Handle) {
        unsafe {
            FreeLibrary(handle);
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use super::DynlibError;

    pub type Handle = usize;

    pub fn open(path: &str) -> Result<Handle, DynlibError> {
        Err(DynlibError::OpenFailed {
            path: path.to_string(),
            reason: "dynamic loading is not supported on this platform".into(),
        })
    }

    pub fn symbol(_handle: Handle, name: &str, path: &str) -> Result<*const u8, DynlibError> {
        Err(DynlibError::SymbolNotFound {
            symbol: name.to_string(),
            library: path.to_string(),
        })
    }

    pub fn close(_handle: Handle) {}
}

//! Executable memory with a W^X lifecycle
//!
//! Code is staged into a read-write anonymous mapping, then the region is
//! flipped to read-execute. No page is ever writable and executable at the
//! same time, and function pointers are only handed out after the flip.

use thiserror::Error;

/// Errors from the executable-memory layer
#[derive(Debug, Error)]
pub enum ExecError {
    /// Mapping or protection syscall failed
    #[error("Executable mapping failed: {0}")]
    MapFailed(String),

    /// Write attempted outside the region
    #[error("Write of {len} bytes at offset {offset} outside {size}-byte region")]
    OutOfBounds {
        /// Write offset
        offset: usize,
        /// Write length
        len: usize,
        /// Region size
        size: usize,
    },

    /// Region was already flipped to read-execute
    #[error("Region is already executable")]
    AlreadyExecutable,

    /// Function pointer requested before the region was finalized
    #[error("Region has not been finalized to read-execute")]
    NotExecutable,
}

/// An anonymous memory region that transitions RW → RX exactly once
///
/// Dropping the region unmaps it; any function pointers obtained from it are
/// invalid afterwards.
#[derive(Debug)]
pub struct ExecMemory {
    ptr: *mut u8,
    size: usize,
    executable: bool,
}

// Safety: after finalize_rx the region is immutable executable memory; before
// that it is exclusively owned through &mut self.
unsafe impl Send for ExecMemory {}
unsafe impl Sync for ExecMemory {}

impl ExecMemory {
    /// Allocate a page-aligned read-write region of at least `size` bytes
    pub fn allocate_rw(size: usize) -> Result<Self, ExecError> {
        if size == 0 {
            return Ok(Self {
                ptr: std::ptr::null_mut(),
                size: 0,
                executable: false,
            });
        }
        let ptr = platform::map_rw(size)?;
        Ok(Self {
            ptr,
            size,
            executable: false,
        })
    }

    /// Copy `bytes` into the region at `offset`; only valid while RW
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), ExecError> {
        if self.executable {
            return Err(ExecError::AlreadyExecutable);
        }
        if offset + bytes.len() > self.size {
            return Err(ExecError::OutOfBounds {
                offset,
                len: bytes.len(),
                size: self.size,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
        Ok(())
    }

    /// Flip the region from read-write to read-execute
    pub fn finalize_rx(&mut self) -> Result<(), ExecError> {
        if self.executable {
            return Err(ExecError::AlreadyExecutable);
        }
        if self.size > 0 {
            platform::protect_rx(self.ptr, self.size)?;
        }
        self.executable = true;
        Ok(())
    }

    /// Pointer to executable code at `offset`; only valid after `finalize_rx`
    pub fn fn_ptr(&self, offset: usize) -> Result<*const u8, ExecError> {
        if !self.executable {
            return Err(ExecError::NotExecutable);
        }
        if offset >= self.size {
            return Err(ExecError::OutOfBounds {
                offset,
                len: 0,
                size: self.size,
            });
        }
        Ok(unsafe { self.ptr.add(offset) } as *const u8)
    }

    /// Base address of the region (null for empty regions)
    pub fn base(&self) -> *const u8 {
        self.ptr as *const u8
    }

    /// Size of the region in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the region has been flipped to read-execute
    pub fn is_executable(&self) -> bool {
        self.executable
    }
}

impl Drop for ExecMemory {
    fn drop(&mut self) {
        if !self.ptr.is_null() && self.size > 0 {
            platform::unmap(self.ptr, self.size);
        }
    }
}

#[cfg(unix)]
mod platform {
    use super::ExecError;

    pub fn map_rw(size: usize) -> Result<*mut u8, ExecError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ExecError::MapFailed(format!(
                "mmap of {} bytes failed: {}",
                size,
                std::io::Error::last_os_error()
            )));
        }
        Ok(ptr as *mut u8)
    }

    pub fn protect_rx(ptr: *mut u8, size: usize) -> Result<(), ExecError> {
        let result = unsafe {
            libc::mprotect(
                ptr as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(ExecError::MapFailed(format!(
                "mprotect to RX failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn unmap(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut libc::c_void, size);
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::ExecError;

    const MEM_COMMIT: u32 = 0x1000;
    const MEM_RESERVE: u32 = 0x2000;
    const MEM_RELEASE: u32 = 0x8000;
    const PAGE_READWRITE: u32 = 0x04;
    const PAGE_EXECUTE_READ: u32 = 0x20;

    extern "system" {
        fn VirtualAlloc(
            address: *mut std::ffi::c_void,
            size: usize,
            alloc_type: u32,
            protect: u32,
        ) -> *mut std::ffi::c_void;
        fn VirtualProtect(
            address: *mut std::ffi::c_void,
            size: usize,
            new_protect: u32,
            old_protect: *mut u32,
        ) -> i32;
        fn VirtualFree(address: *mut std::ffi::c_void, size: usize, free_type: u32) -> i32;
    }

    pub fn map_rw(size: usize) -> Result<*mut u8, ExecError> {
        let ptr = unsafe {
            VirtualAlloc(
                std::ptr::null_mut(),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            return Err(ExecError::MapFailed(format!(
                "VirtualAlloc of {} bytes failed",
                size
            )));
        }
        Ok(ptr as *mut u8)
    }

    pub fn protect_rx(ptr: *mut u8, size: usize) -> Result<(), ExecError> {
        let mut old = 0u32;
        let ok = unsafe {
            VirtualProtect(ptr as *mut std::ffi::c_void, size, PAGE_EXECUTE_READ, &mut old)
        };
        if ok == 0 {
            return Err(ExecError::MapFailed("VirtualProtect to RX failed".into()));
        }
        Ok(())
    }

    pub fn unmap(ptr: *mut u8, size: usize) {
        unsafe {
            VirtualFree(ptr as *mut std::ffi::c_void, 0, MEM_RELEASE);
        }
        let _ = size;
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use super::ExecError;

    pub fn map_rw(_size: usize) -> Result<*mut u8, ExecError> {
        Err(ExecError::MapFailed(
            "executable memory is not supported on this platform".into(),
        ))
    }

    pub fn protect_rx(_ptr: *mut u8, _size: usize) -> Result<(), ExecError> {
        Err(ExecError::MapFailed(
            "executable memory is not supported on this platform".into(),
        ))
    }

    pub fn unmap(_ptr: *mut u8, _size: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_rw_then_rx_lifecycle() {
        let mut mem = ExecMemory::allocate_rw(64).unwrap();
        assert!(!mem.is_executable());
        mem.write(0, &[0xC3; 64]).unwrap();

        // No pointers before the flip.
        assert!(matches!(mem.fn_ptr(0), Err(ExecError::NotExecutable)));

        mem.finalize_rx().unwrap();
        assert!(mem.is_executable());
        assert!(!mem.fn_ptr(0).unwrap().is_null());

        // No writes after the flip.
        assert!(matches!(mem.write(0, &[0]), Err(ExecError::AlreadyExecutable)));
        // No double flip.
        assert!(matches!(mem.finalize_rx(), Err(ExecError::AlreadyExecutable)));
    }

    #[cfg(unix)]
    #[test]
    fn test_out_of_bounds_write() {
        let mut mem = ExecMemory::allocate_rw(16).unwrap();
        assert!(matches!(
            mem.write(8, &[0u8; 16]),
            Err(ExecError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_empty_region() {
        let mut mem = ExecMemory::allocate_rw(0).unwrap();
        assert_eq!(mem.size(), 0);
        mem.finalize_rx().unwrap();
        assert!(mem.is_executable());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_region_is_never_writable_and_executable() {
        // Probe /proc/self/maps in both states: RW before the flip, RX
        // after, never both.
        let mut mem = ExecMemory::allocate_rw(4096).unwrap();
        let base = mem.base() as usize;

        let perms = perms_of(base).expect("region in maps");
        assert!(perms.contains('w') && !perms.contains('x'), "pre-flip: {}", perms);

        mem.write(0, &[0xC3; 16]).unwrap();
        mem.finalize_rx().unwrap();

        let perms = perms_of(base).expect("region in maps");
        assert!(perms.contains('x') && !perms.contains('w'), "post-flip: {}", perms);
    }

    #[cfg(target_os = "linux")]
    fn perms_of(addr: usize) -> Option<String> {
        let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
        for line in maps.lines() {
            let mut parts = line.split_whitespace();
            let range = parts.next()?;
            let perms = parts.next()?;
            let (start, end) = range.split_once('-')?;
            let start = usize::from_str_radix(start, 16).ok()?;
            let end = usize::from_str_radix(end, 16).ok()?;
            if addr >= start && addr < end {
                return Some(perms.to_string());
            }
        }
        None
    }
}

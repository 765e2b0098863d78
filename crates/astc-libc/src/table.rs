//! The libc export table
//!
//! Maps stable names and `LIBC_CALL` ids to the forwarding wrappers. The
//! launcher registers the table's exports with the module registry under
//! the logical name `libc`, and attaches it to the VM as the `LIBC_CALL`
//! resolver.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use astc_engine::LibcResolver;

use crate::ids;
use crate::stats::StatsSnapshot;
use crate::wrappers::{self, STATS};

/// One forwarded function
#[derive(Debug, Clone, Copy)]
pub struct LibcEntry {
    /// Stable `LIBC_CALL` id
    pub func_id: u16,
    /// Stable export name (the C name)
    pub name: &'static str,
    /// Address of the forwarding wrapper
    pub ptr: *const u8,
}

// Safety: the pointers are addresses of `extern "C"` functions in this
// binary; they are valid for the process lifetime and freely shareable.
unsafe impl Send for LibcEntry {}
unsafe impl Sync for LibcEntry {}

/// Name→function table of the forwarded C standard library
pub struct LibcTable {
    entries: Vec<LibcEntry>,
    by_id: HashMap<u16, usize>,
    by_name: HashMap<&'static str, usize>,
}

impl LibcTable {
    /// Build the table with every forward this host supports
    pub fn with_default_exports() -> Self {
        let mut table = Self {
            entries: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        };
        for entry in default_entries() {
            table.insert(entry);
        }
        table
    }

    fn insert(&mut self, entry: LibcEntry) {
        let index = self.entries.len();
        self.by_id.insert(entry.func_id, index);
        self.by_name.insert(entry.name, index);
        self.entries.push(entry);
    }

    /// Entry by stable id
    pub fn by_id(&self, func_id: u16) -> Option<&LibcEntry> {
        self.by_id.get(&func_id).map(|&i| &self.entries[i])
    }

    /// Entry by stable name
    pub fn by_name(&self, name: &str) -> Option<&LibcEntry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    /// Number of forwarded functions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty (non-unix hosts forward only libm)
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All exports for in-process module registration: every forwarded
    /// function under its stable name, plus the `get_stats` entry point
    pub fn exports(&self) -> Vec<(String, *const u8)> {
        let mut exports: Vec<(String, *const u8)> = self
            .entries
            .iter()
            .map(|e| (e.name.to_string(), e.ptr))
            .collect();
        exports.push(("get_stats".to_string(), astc_libc_get_stats as *const u8));
        exports
    }

    /// Snapshot of the forwarding statistics
    pub fn stats(&self) -> StatsSnapshot {
        STATS.snapshot()
    }
}

impl LibcResolver for LibcTable {
    fn resolve(&self, func_id: u16) -> Option<*const u8> {
        self.by_id(func_id).map(|e| e.ptr)
    }

    fn name(&self, func_id: u16) -> Option<&str> {
        self.by_id(func_id).map(|e| e.name)
    }
}

/// The process-wide default table
pub fn default_table() -> &'static LibcTable {
    static TABLE: Lazy<LibcTable> = Lazy::new(LibcTable::with_default_exports);
    &TABLE
}

/// C-layout statistics record for the `get_stats` export
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawStats {
    /// Call counts indexed by category
    pub calls: [u64; ids::Category::COUNT],
    /// Total bytes handed out
    pub bytes_allocated: u64,
    /// Total bytes returned
    pub bytes_freed: u64,
    /// High-water mark of live bytes
    pub peak_bytes: u64,
}

/// The `get_stats` export: copy the counters into `out`; -1 on null
pub extern "C" fn astc_libc_get_stats(out: *mut RawStats) -> i32 {
    if out.is_null() {
        return -1;
    }
    let snap = STATS.snapshot();
    let raw = RawStats {
        calls: snap.calls,
        bytes_allocated: snap.bytes_allocated,
        bytes_freed: snap.bytes_freed,
        peak_bytes: snap.peak_bytes,
    };
    unsafe {
        out.write(raw);
    }
    0
}

fn entry(func_id: u16, name: &'static str, ptr: *const u8) -> LibcEntry {
    LibcEntry { func_id, name, ptr }
}

#[cfg(unix)]
fn default_entries() -> Vec<LibcEntry> {
    use wrappers::*;
    let mut entries = vec![
        entry(ids::MALLOC, "malloc", astc_malloc as *const u8),
        entry(ids::CALLOC, "calloc", astc_calloc as *const u8),
        entry(ids::REALLOC, "realloc", astc_realloc as *const u8),
        entry(ids::FREE, "free", astc_free as *const u8),
        entry(ids::STRLEN, "strlen", astc_strlen as *const u8),
        entry(ids::STRCPY, "strcpy", astc_strcpy as *const u8),
        entry(ids::STRNCPY, "strncpy", astc_strncpy as *const u8),
        entry(ids::STRCAT, "strcat", astc_strcat as *const u8),
        entry(ids::STRNCAT, "strncat", astc_strncat as *const u8),
        entry(ids::STRCMP, "strcmp", astc_strcmp as *const u8),
        entry(ids::STRNCMP, "strncmp", astc_strncmp as *const u8),
        entry(ids::STRCHR, "strchr", astc_strchr as *const u8),
        entry(ids::STRRCHR, "strrchr", astc_strrchr as *const u8),
        entry(ids::STRSTR, "strstr", astc_strstr as *const u8),
        entry(ids::STRDUP, "strdup", astc_strdup as *const u8),
        entry(ids::MEMCPY, "memcpy", astc_memcpy as *const u8),
        entry(ids::MEMMOVE, "memmove", astc_memmove as *const u8),
        entry(ids::MEMSET, "memset", astc_memset as *const u8),
        entry(ids::MEMCMP, "memcmp", astc_memcmp as *const u8),
        entry(ids::PRINTF, "printf", astc_printf as *const u8),
        entry(ids::SPRINTF, "sprintf", astc_sprintf as *const u8),
        entry(ids::SNPRINTF, "snprintf", astc_snprintf as *const u8),
        entry(ids::PUTS, "puts", astc_puts as *const u8),
        entry(ids::PUTCHAR, "putchar", astc_putchar as *const u8),
        entry(ids::FPRINTF, "fprintf", astc_fprintf as *const u8),
        entry(ids::FSCANF, "fscanf", astc_fscanf as *const u8),
        entry(ids::ISALPHA, "isalpha", astc_isalpha as *const u8),
        entry(ids::ISDIGIT, "isdigit", astc_isdigit as *const u8),
        entry(ids::ISALNUM, "isalnum", astc_isalnum as *const u8),
        entry(ids::ISSPACE, "isspace", astc_isspace as *const u8),
        entry(ids::ISUPPER, "isupper", astc_isupper as *const u8),
        entry(ids::TOUPPER, "toupper", astc_toupper as *const u8),
        entry(ids::TOLOWER, "tolower", astc_tolower as *const u8),
        entry(ids::ATOI, "atoi", astc_atoi as *const u8),
        entry(ids::ATOL, "atol", astc_atol as *const u8),
        entry(ids::ATOF, "atof", astc_atof as *const u8),
        entry(ids::STRTOL, "strtol", astc_strtol as *const u8),
        entry(ids::STRTOD, "strtod", astc_strtod as *const u8),
        entry(ids::TIME, "time", astc_time as *const u8),
        entry(ids::LOCALTIME, "localtime", astc_localtime as *const u8),
        entry(ids::GMTIME, "gmtime", astc_gmtime as *const u8),
        entry(ids::MKTIME, "mktime", astc_mktime as *const u8),
        entry(ids::STRFTIME, "strftime", astc_strftime as *const u8),
        entry(ids::CLOCK, "clock", astc_clock as *const u8),
        entry(ids::GETENV, "getenv", astc_getenv as *const u8),
        entry(ids::SETENV, "setenv", astc_setenv as *const u8),
        entry(ids::UNSETENV, "unsetenv", astc_unsetenv as *const u8),
    ];
    entries.extend(math_entries());
    entries
}

#[cfg(not(unix))]
fn default_entries() -> Vec<LibcEntry> {
    math_entries()
}

fn math_entries() -> Vec<LibcEntry> {
    use wrappers::*;
    vec![
        entry(ids::SIN, "sin", astc_sin as *const u8),
        entry(ids::COS, "cos", astc_cos as *const u8),
        entry(ids::TAN, "tan", astc_tan as *const u8),
        entry(ids::ASIN, "asin", astc_asin as *const u8),
        entry(ids::ACOS, "acos", astc_acos as *const u8),
        entry(ids::ATAN, "atan", astc_atan as *const u8),
        entry(ids::ATAN2, "atan2", astc_atan2 as *const u8),
        entry(ids::EXP, "exp", astc_exp as *const u8),
        entry(ids::LOG, "log", astc_log as *const u8),
        entry(ids::LOG10, "log10", astc_log10 as *const u8),
        entry(ids::POW, "pow", astc_pow as *const u8),
        entry(ids::SQRT, "sqrt", astc_sqrt as *const u8),
        entry(ids::FLOOR, "floor", astc_floor as *const u8),
        entry(ids::CEIL, "ceil", astc_ceil as *const u8),
        entry(ids::ROUND, "round", astc_round as *const u8),
        entry(ids::TRUNC, "trunc", astc_trunc as *const u8),
        entry(ids::FABS, "fabs", astc_fabs as *const u8),
        entry(ids::FMOD, "fmod", astc_fmod as *const u8),
        entry(ids::SINH, "sinh", astc_sinh as *const u8),
        entry(ids::COSH, "cosh", astc_cosh as *const u8),
        entry(ids::TANH, "tanh", astc_tanh as *const u8),
    ]
}

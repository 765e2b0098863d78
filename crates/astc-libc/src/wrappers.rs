//! Forwarding wrappers over the host C standard library
//!
//! Every wrapper validates pointer arguments (returning the library's
//! canonical "invalid" result on null instead of faulting) and bumps its
//! category counter. Allocation wrappers carry a 16-byte size header so the
//! free side can account bytes without a table.
//!
//! Math forwards go through Rust's f64 intrinsics, which lower to the same
//! host libm; everything else goes through the `libc` crate on unix.

use crate::ids::Category;
use crate::stats::LibcStats;

/// Process-wide statistics for the forwarding module
pub static STATS: LibcStats = LibcStats::new();

/// Size header prepended to every tracked allocation
pub const ALLOC_HEADER: usize = 16;

// ============================================================================
// Memory (tracked allocations)
// ============================================================================

#[cfg(unix)]
mod memory {
    use super::{ALLOC_HEADER, STATS};
    use crate::ids::Category;
    use std::ffi::c_void;

    unsafe fn track_alloc(size: usize) -> *mut c_void {
        let raw = libc::malloc(size + ALLOC_HEADER);
        if raw.is_null() {
            return std::ptr::null_mut();
        }
        (raw as *mut usize).write(size);
        STATS.add_allocated(size as u64);
        (raw as *mut u8).add(ALLOC_HEADER) as *mut c_void
    }

    unsafe fn track_free(ptr: *mut c_void) -> usize {
        let raw = (ptr as *mut u8).sub(ALLOC_HEADER);
        let size = (raw as *const usize).read();
        STATS.add_freed(size as u64);
        libc::free(raw as *mut c_void);
        size
    }

    /// Forwarded malloc with byte accounting
    pub unsafe extern "C" fn astc_malloc(size: usize) -> *mut c_void {
        STATS.count(Category::Memory);
        track_alloc(size)
    }

    /// Forwarded calloc; overflowing requests return null
    pub unsafe extern "C" fn astc_calloc(count: usize, size: usize) -> *mut c_void {
        STATS.count(Category::Memory);
        let Some(total) = count.checked_mul(size) else {
            return std::ptr::null_mut();
        };
        let ptr = track_alloc(total);
        if !ptr.is_null() {
            std::ptr::write_bytes(ptr as *mut u8, 0, total);
        }
        ptr
    }

    /// Forwarded realloc; null grows from nothing, zero size frees
    pub unsafe extern "C" fn astc_realloc(ptr: *mut c_void, new_size: usize) -> *mut c_void {
        STATS.count(Category::Memory);
        if ptr.is_null() {
            return track_alloc(new_size);
        }
        if new_size == 0 {
            track_free(ptr);
            return std::ptr::null_mut();
        }
        let fresh = track_alloc(new_size);
        if fresh.is_null() {
            return std::ptr::null_mut();
        }
        let old_size = ((ptr as *const u8).sub(ALLOC_HEADER) as *const usize).read();
        std::ptr::copy_nonoverlapping(
            ptr as *const u8,
            fresh as *mut u8,
            old_size.min(new_size),
        );
        track_free(ptr);
        fresh
    }

    /// Forwarded free; null is a counted no-op
    pub unsafe extern "C" fn astc_free(ptr: *mut c_void) {
        STATS.count(Category::Memory);
        if ptr.is_null() {
            return;
        }
        track_free(ptr);
    }
}

#[cfg(unix)]
pub use memory::{astc_calloc, astc_free, astc_malloc, astc_realloc};

// ============================================================================
// Strings
// ============================================================================

#[cfg(unix)]
mod strings {
    use super::STATS;
    use crate::ids::Category;
    use std::ffi::{c_char, c_int, c_void};

    /// Forwarded strlen; null yields 0
    pub unsafe extern "C" fn astc_strlen(s: *const c_char) -> usize {
        STATS.count(Category::String);
        if s.is_null() {
            return 0;
        }
        libc::strlen(s)
    }

    /// Forwarded strcpy; null in either position yields null
    pub unsafe extern "C" fn astc_strcpy(dst: *mut c_char, src: *const c_char) -> *mut c_char {
        STATS.count(Category::String);
        if dst.is_null() || src.is_null() {
            return std::ptr::null_mut();
        }
        libc::strcpy(dst, src)
    }

    /// Forwarded strncpy
    pub unsafe extern "C" fn astc_strncpy(
        dst: *mut c_char,
        src: *const c_char,
        n: usize,
    ) -> *mut c_char {
        STATS.count(Category::String);
        if dst.is_null() || src.is_null() {
            return std::ptr::null_mut();
        }
        libc::strncpy(dst, src, n)
    }

    /// Forwarded strcat
    pub unsafe extern "C" fn astc_strcat(dst: *mut c_char, src: *const c_char) -> *mut c_char {
        STATS.count(Category::String);
        if dst.is_null() || src.is_null() {
            return std::ptr::null_mut();
        }
        libc::strcat(dst, src)
    }

    /// Forwarded strncat
    pub unsafe extern "C" fn astc_strncat(
        dst: *mut c_char,
        src: *const c_char,
        n: usize,
    ) -> *mut c_char {
        STATS.count(Category::String);
        if dst.is_null() || src.is_null() {
            return std::ptr::null_mut();
        }
        libc::strncat(dst, src, n)
    }

    /// Forwarded strcmp; a null side compares below any string
    pub unsafe extern "C" fn astc_strcmp(a: *const c_char, b: *const c_char) -> c_int {
        STATS.count(Category::String);
        match (a.is_null(), b.is_null()) {
            (true, true) => 0,
            (true, false) => -1,
            (false, true) => 1,
            (false, false) => libc::strcmp(a, b),
        }
    }

    /// Forwarded strncmp
    pub unsafe extern "C" fn astc_strncmp(a: *const c_char, b: *const c_char, n: usize) -> c_int {
        STATS.count(Category::String);
        match (a.is_null(), b.is_null()) {
            (true, true) => 0,
            (true, false) => -1,
            (false, true) => 1,
            (false, false) => libc::strncmp(a, b, n),
        }
    }

    /// Forwarded strchr; null yields null
    pub unsafe extern "C" fn astc_strchr(s: *const c_char, ch: c_int) -> *mut c_char {
        STATS.count(Category::String);
        if s.is_null() {
            return std::ptr::null_mut();
        }
        libc::strchr(s, ch)
    }

    /// Forwarded strrchr; null yields null
    pub unsafe extern "C" fn astc_strrchr(s: *const c_char, ch: c_int) -> *mut c_char {
        STATS.count(Category::String);
        if s.is_null() {
            return std::ptr::null_mut();
        }
        libc::strrchr(s, ch)
    }

    /// Forwarded strstr; null in either position yields null
    pub unsafe extern "C" fn astc_strstr(
        haystack: *const c_char,
        needle: *const c_char,
    ) -> *mut c_char {
        STATS.count(Category::String);
        if haystack.is_null() || needle.is_null() {
            return std::ptr::null_mut();
        }
        libc::strstr(haystack, needle)
    }

    /// Forwarded strdup through the tracked allocator
    pub unsafe extern "C" fn astc_strdup(s: *const c_char) -> *mut c_char {
        STATS.count(Category::String);
        if s.is_null() {
            return std::ptr::null_mut();
        }
        let len = libc::strlen(s) + 1;
        let copy = super::memory::astc_malloc(len);
        if copy.is_null() {
            return std::ptr::null_mut();
        }
        std::ptr::copy_nonoverlapping(s as *const u8, copy as *mut u8, len);
        copy as *mut c_char
    }

    /// Forwarded memcpy; null yields null
    pub unsafe extern "C" fn astc_memcpy(
        dst: *mut c_void,
        src: *const c_void,
        n: usize,
    ) -> *mut c_void {
        STATS.count(Category::MemOps);
        if dst.is_null() || src.is_null() {
            return std::ptr::null_mut();
        }
        libc::memcpy(dst, src, n)
    }

    /// Forwarded memmove; null yields null
    pub unsafe extern "C" fn astc_memmove(
        dst: *mut c_void,
        src: *const c_void,
        n: usize,
    ) -> *mut c_void {
        STATS.count(Category::MemOps);
        if dst.is_null() || src.is_null() {
            return std::ptr::null_mut();
        }
        libc::memmove(dst, src, n)
    }

    /// Forwarded memset; null yields null
    pub unsafe extern "C" fn astc_memset(dst: *mut c_void, byte: c_int, n: usize) -> *mut c_void {
        STATS.count(Category::MemOps);
        if dst.is_null() {
            return std::ptr::null_mut();
        }
        libc::memset(dst, byte, n)
    }

    /// Forwarded memcmp; a null side compares below
    pub unsafe extern "C" fn astc_memcmp(a: *const c_void, b: *const c_void, n: usize) -> c_int {
        STATS.count(Category::MemOps);
        match (a.is_null(), b.is_null()) {
            (true, true) => 0,
            (true, false) => -1,
            (false, true) => 1,
            (false, false) => libc::memcmp(a, b, n),
        }
    }
}

#[cfg(unix)]
pub use strings::{
    astc_memcmp, astc_memcpy, astc_memmove, astc_memset, astc_strcat, astc_strchr, astc_strcmp,
    astc_strcpy, astc_strdup, astc_strlen, astc_strncat, astc_strncmp, astc_strncpy, astc_strrchr,
    astc_strstr,
};

// ============================================================================
// Formatted I/O
// ============================================================================

#[cfg(unix)]
mod io {
    use super::STATS;
    use crate::ids::Category;
    use std::ffi::{c_char, c_int, c_void};

    /// Forwarded printf, up to three varargs; null format yields -1
    pub unsafe extern "C" fn astc_printf(
        fmt: *const c_char,
        a: usize,
        b: usize,
        c: usize,
    ) -> c_int {
        STATS.count(Category::Io);
        if fmt.is_null() {
            return -1;
        }
        libc::printf(fmt, a, b, c)
    }

    /// Forwarded sprintf, up to two varargs
    pub unsafe extern "C" fn astc_sprintf(
        buf: *mut c_char,
        fmt: *const c_char,
        a: usize,
        b: usize,
    ) -> c_int {
        STATS.count(Category::Io);
        if buf.is_null() || fmt.is_null() {
            return -1;
        }
        libc::sprintf(buf, fmt, a, b)
    }

    /// Forwarded snprintf, one vararg
    pub unsafe extern "C" fn astc_snprintf(
        buf: *mut c_char,
        size: usize,
        fmt: *const c_char,
        a: usize,
    ) -> c_int {
        STATS.count(Category::Io);
        if buf.is_null() || fmt.is_null() {
            return -1;
        }
        libc::snprintf(buf, size, fmt, a)
    }

    /// Forwarded puts; null yields EOF
    pub unsafe extern "C" fn astc_puts(s: *const c_char) -> c_int {
        STATS.count(Category::Io);
        if s.is_null() {
            return libc::EOF;
        }
        libc::puts(s)
    }

    /// Forwarded putchar
    pub unsafe extern "C" fn astc_putchar(ch: c_int) -> c_int {
        STATS.count(Category::Io);
        libc::putchar(ch)
    }

    /// Forwarded fprintf, one vararg; null stream or format yields -1
    pub unsafe extern "C" fn astc_fprintf(
        stream: *mut c_void,
        fmt: *const c_char,
        a: usize,
    ) -> c_int {
        STATS.count(Category::Io);
        if stream.is_null() || fmt.is_null() {
            return -1;
        }
        libc::fprintf(stream as *mut libc::FILE, fmt, a)
    }

    /// Forwarded fscanf, one output slot; null stream or format yields EOF
    pub unsafe extern "C" fn astc_fscanf(
        stream: *mut c_void,
        fmt: *const c_char,
        out: *mut c_void,
    ) -> c_int {
        STATS.count(Category::Io);
        if stream.is_null() || fmt.is_null() || out.is_null() {
            return libc::EOF;
        }
        libc::fscanf(stream as *mut libc::FILE, fmt, out)
    }
}

#[cfg(unix)]
pub use io::{
    astc_fprintf, astc_fscanf, astc_printf, astc_putchar, astc_puts, astc_snprintf, astc_sprintf,
};

// ============================================================================
// Math (host libm through the f64 intrinsics; portable)
// ============================================================================

macro_rules! forward_math1 {
    ($($wrapper:ident => $method:ident),* $(,)?) => {$(
        #[doc = concat!("Forwarded ", stringify!($method))]
        pub extern "C" fn $wrapper(x: f64) -> f64 {
            STATS.count(Category::Math);
            f64::$method(x)
        }
    )*};
}

forward_math1! {
    astc_sin => sin,
    astc_cos => cos,
    astc_tan => tan,
    astc_asin => asin,
    astc_acos => acos,
    astc_atan => atan,
    astc_exp => exp,
    astc_log => ln,
    astc_log10 => log10,
    astc_sqrt => sqrt,
    astc_floor => floor,
    astc_ceil => ceil,
    astc_round => round,
    astc_trunc => trunc,
    astc_fabs => abs,
    astc_sinh => sinh,
    astc_cosh => cosh,
    astc_tanh => tanh,
}

/// Forwarded atan2
pub extern "C" fn astc_atan2(y: f64, x: f64) -> f64 {
    STATS.count(Category::Math);
    y.atan2(x)
}

/// Forwarded pow
pub extern "C" fn astc_pow(base: f64, exp: f64) -> f64 {
    STATS.count(Category::Math);
    base.powf(exp)
}

/// Forwarded fmod
pub extern "C" fn astc_fmod(a: f64, b: f64) -> f64 {
    STATS.count(Category::Math);
    a % b
}

// ============================================================================
// Ctype, conversion, time, env
// ============================================================================

#[cfg(unix)]
mod host {
    use super::STATS;
    use crate::ids::Category;
    use std::ffi::{c_char, c_int, c_long};

    macro_rules! forward_ctype {
        ($($wrapper:ident => $target:ident),* $(,)?) => {$(
            #[doc = concat!("Forwarded ", stringify!($target))]
            pub unsafe extern "C" fn $wrapper(ch: c_int) -> c_int {
                STATS.count(Category::Ctype);
                libc::$target(ch)
            }
        )*};
    }

    forward_ctype! {
        astc_isalpha => isalpha,
        astc_isdigit => isdigit,
        astc_isalnum => isalnum,
        astc_isspace => isspace,
        astc_isupper => isupper,
        astc_toupper => toupper,
        astc_tolower => tolower,
    }

    /// Forwarded atoi; null yields 0
    pub unsafe extern "C" fn astc_atoi(s: *const c_char) -> c_int {
        STATS.count(Category::Conversion);
        if s.is_null() {
            return 0;
        }
        libc::atoi(s)
    }

    /// Forwarded atol; null yields 0
    pub unsafe extern "C" fn astc_atol(s: *const c_char) -> c_long {
        STATS.count(Category::Conversion);
        if s.is_null() {
            return 0;
        }
        libc::atol(s)
    }

    /// Forwarded atof; null yields 0.0
    pub unsafe extern "C" fn astc_atof(s: *const c_char) -> f64 {
        STATS.count(Category::Conversion);
        if s.is_null() {
            return 0.0;
        }
        libc::atof(s)
    }

    /// Forwarded strtol; null yields 0
    pub unsafe extern "C" fn astc_strtol(
        s: *const c_char,
        end: *mut *mut c_char,
        base: c_int,
    ) -> c_long {
        STATS.count(Category::Conversion);
        if s.is_null() {
            return 0;
        }
        libc::strtol(s, end, base)
    }

    /// Forwarded strtod; null yields 0.0
    pub unsafe extern "C" fn astc_strtod(s: *const c_char, end: *mut *mut c_char) -> f64 {
        STATS.count(Category::Conversion);
        if s.is_null() {
            return 0.0;
        }
        libc::strtod(s, end)
    }

    /// Forwarded time
    pub unsafe extern "C" fn astc_time(out: *mut libc::time_t) -> libc::time_t {
        STATS.count(Category::Time);
        libc::time(out)
    }

    /// Forwarded localtime; null yields null
    pub unsafe extern "C" fn astc_localtime(t: *const libc::time_t) -> *mut libc::tm {
        STATS.count(Category::Time);
        if t.is_null() {
            return std::ptr::null_mut();
        }
        libc::localtime(t)
    }

    /// Forwarded gmtime; null yields null
    pub unsafe extern "C" fn astc_gmtime(t: *const libc::time_t) -> *mut libc::tm {
        STATS.count(Category::Time);
        if t.is_null() {
            return std::ptr::null_mut();
        }
        libc::gmtime(t)
    }

    /// Forwarded mktime; null yields -1
    pub unsafe extern "C" fn astc_mktime(tm: *mut libc::tm) -> libc::time_t {
        STATS.count(Category::Time);
        if tm.is_null() {
            return -1;
        }
        libc::mktime(tm)
    }

    /// Forwarded strftime; null arguments yield 0
    pub unsafe extern "C" fn astc_strftime(
        buf: *mut c_char,
        max: usize,
        fmt: *const c_char,
        tm: *const libc::tm,
    ) -> usize {
        STATS.count(Category::Time);
        if buf.is_null() || fmt.is_null() || tm.is_null() {
            return 0;
        }
        libc::strftime(buf, max, fmt, tm)
    }

    extern "C" {
        fn clock() -> libc::clock_t;
    }

    /// Forwarded clock
    pub unsafe extern "C" fn astc_clock() -> libc::clock_t {
        STATS.count(Category::Time);
        clock()
    }

    /// Forwarded getenv; null yields null
    pub unsafe extern "C" fn astc_getenv(name: *const c_char) -> *mut c_char {
        STATS.count(Category::Env);
        if name.is_null() {
            return std::ptr::null_mut();
        }
        libc::getenv(name)
    }

    /// Forwarded setenv; null name yields -1
    pub unsafe extern "C" fn astc_setenv(
        name: *const c_char,
        value: *const c_char,
        overwrite: c_int,
    ) -> c_int {
        STATS.count(Category::Env);
        if name.is_null() || value.is_null() {
            return -1;
        }
        libc::setenv(name, value, overwrite)
    }

    /// Forwarded unsetenv; null yields -1
    pub unsafe extern "C" fn astc_unsetenv(name: *const c_char) -> c_int {
        STATS.count(Category::Env);
        if name.is_null() {
            return -1;
        }
        libc::unsetenv(name)
    }
}

#[cfg(unix)]
pub use host::{
    astc_atof, astc_atoi, astc_atol, astc_clock, astc_getenv, astc_gmtime, astc_isalnum,
    astc_isalpha, astc_isdigit, astc_isspace, astc_isupper, astc_localtime, astc_mktime,
    astc_setenv, astc_strftime, astc_strtod, astc_strtol, astc_time, astc_tolower, astc_toupper,
    astc_unsetenv,
};

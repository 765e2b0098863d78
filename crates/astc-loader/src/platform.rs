//! Host architecture and platform detection
//!
//! Architecture is read from OS facilities at runtime: `uname(2)` (with a
//! `/proc/cpuinfo` fallback) on unix, the `PROCESSOR_ARCHITECTURE`
//! environment strings on Windows. Pointer width comes from the host
//! address size, never from the architecture name.

use std::fmt;

use astc_container::ArchTag;

/// Host operating system family, used for dependency platform gates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    /// Linux and other unix besides macOS
    Linux,
    /// macOS
    MacOs,
    /// Windows
    Windows,
    /// Anything else
    Unknown,
}

impl Os {
    /// The OS family this binary is running on
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" | "freebsd" | "openbsd" | "netbsd" => Os::Linux,
            "macos" => Os::MacOs,
            "windows" => Os::Windows,
            _ => Os::Unknown,
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Os::Linux => "linux",
            Os::MacOs => "macos",
            Os::Windows => "windows",
            Os::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Detected host platform: ISA, pointer width, OS family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    /// Host instruction-set architecture, if recognized
    pub arch: Option<ArchTag>,
    /// Pointer width in bits, derived from the host address size
    pub bits: u32,
    /// OS family
    pub os: Os,
}

impl Platform {
    /// Architecture tag, or an error-friendly placeholder name
    pub fn arch_str(&self) -> &'static str {
        self.arch.map(|a| a.as_str()).unwrap_or("unknown")
    }
}

/// Detect the host platform
pub fn detect() -> Platform {
    let machine = machine_string();
    let arch = machine.as_deref().and_then(arch_from_machine).or_else(ArchTag::native);
    Platform {
        arch,
        bits: (std::mem::size_of::<usize>() * 8) as u32,
        os: Os::current(),
    }
}

/// Module filename for a logical name on the given platform:
/// `{name}_{arch}_{bits}.native`
pub fn module_file_name(logical_name: &str, platform: &Platform) -> String {
    format!("{}_{}_{}.native", logical_name, platform.arch_str(), platform.bits)
}

fn arch_from_machine(machine: &str) -> Option<ArchTag> {
    let machine = machine.trim().to_ascii_lowercase();
    match machine.as_str() {
        "x86_64" | "amd64" | "x64" => Some(ArchTag::X64),
        "aarch64" | "arm64" => Some(ArchTag::Arm64),
        "i386" | "i486" | "i586" | "i686" | "x86" => Some(ArchTag::X86),
        other if other.starts_with("armv") || other == "arm" => Some(ArchTag::Arm32),
        _ => None,
    }
}

#[cfg(unix)]
fn machine_string() -> Option<String> {
    use std::ffi::CStr;

    unsafe {
        let mut info: libc::utsname = std::mem::zeroed();
        if libc::uname(&mut info) == 0 {
            let machine = CStr::from_ptr(info.machine.as_ptr());
            return Some(machine.to_string_lossy().into_owned());
        }
    }
    // uname failed; on Linux /proc/cpuinfo still names the model.
    cpuinfo_machine()
}

#[cfg(unix)]
fn cpuinfo_machine() -> Option<String> {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    for line in cpuinfo.lines() {
        if let Some(rest) = line.strip_prefix("model name").or_else(|| line.strip_prefix("Processor"))
        {
            let value = rest.trim_start_matches([' ', '\t', ':']);
            if value.contains("ARM") || value.contains("aarch64") {
                return Some("aarch64".to_string());
            }
            if value.contains("Intel") || value.contains("AMD") {
                return Some("x86_64".to_string());
            }
        }
    }
    None
}

#[cfg(windows)]
fn machine_string() -> Option<String> {
    // PROCESSOR_ARCHITEW6432 is set when a 32-bit process runs on a 64-bit
    // host and names the real architecture.
    std::env::var("PROCESSOR_ARCHITEW6432")
        .or_else(|_| std::env::var("PROCESSOR_ARCHITECTURE"))
        .ok()
}

#[cfg(not(any(unix, windows)))]
fn machine_string() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_matches_compile_target() {
        let platform = detect();
        assert_eq!(platform.arch, ArchTag::native());
        assert_eq!(platform.bits as usize, std::mem::size_of::<usize>() * 8);
    }

    #[test]
    fn test_arch_from_machine() {
        assert_eq!(arch_from_machine("x86_64"), Some(ArchTag::X64));
        assert_eq!(arch_from_machine("AMD64"), Some(ArchTag::X64));
        assert_eq!(arch_from_machine("aarch64"), Some(ArchTag::Arm64));
        assert_eq!(arch_from_machine("armv7l"), Some(ArchTag::Arm32));
        assert_eq!(arch_from_machine("i686"), Some(ArchTag::X86));
        assert_eq!(arch_from_machine("riscv64"), None);
    }

    #[test]
    fn test_module_file_name() {
        let platform = Platform {
            arch: Some(ArchTag::X64),
            bits: 64,
            os: Os::Linux,
        };
        assert_eq!(module_file_name("vm", &platform), "vm_x64_64.native");
        assert_eq!(module_file_name("libc", &platform), "libc_x64_64.native");
    }
}

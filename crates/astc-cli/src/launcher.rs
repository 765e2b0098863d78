//! Launcher flow
//!
//! Detect the host architecture, construct the `vm_{arch}_{bits}.native`
//! module name, load it through the registry, and invoke its
//! `vm_native_main` export with the program path. A source checkout has no
//! packaged VM module, so when discovery finds nothing the launcher runs
//! the in-process engine, which is the same code a packaged module wraps.

use std::ffi::CString;
use std::path::PathBuf;

use astc_engine::{EngineError, Vm, VmOptions};
use astc_libc::default_table;
use astc_loader::{detect, module_file_name, LoaderConfig, ModuleRegistry};

use crate::output::Output;

/// Exit code: usage error
pub const EXIT_USAGE: i32 = 1;
/// Exit code: module load failure
pub const EXIT_MODULE: i32 = 2;
/// Exit code: ASTC parse failure
pub const EXIT_PARSE: i32 = 3;
/// Exit code: compilation failure
pub const EXIT_COMPILE: i32 = 4;
/// Exit code: trap in compiled code
pub const EXIT_TRAP: i32 = 5;

/// Everything the launcher needs from the CLI surface
pub struct LaunchOptions {
    /// ASTC program path
    pub program: PathBuf,
    /// Explicit VM module path (`--vm-module`)
    pub vm_module: Option<PathBuf>,
    /// Extra module search directories (`--module-path`), highest priority
    /// first
    pub module_paths: Vec<PathBuf>,
    /// Force the reference interpreter
    pub interpret: bool,
    /// Apply optimization passes
    pub optimize: bool,
}

/// `vm_native_main` ABI: the ASTC path in, the process exit code out
type VmNativeMain = unsafe extern "C" fn(*const std::ffi::c_char) -> i32;

/// Run the launcher flow and return the process exit code
pub fn launch(options: &LaunchOptions, out: &mut Output) -> i32 {
    let platform = detect();
    out.verbose(&format!(
        "host: {}/{} ({}-bit)",
        platform.os,
        platform.arch_str(),
        platform.bits
    ));

    let mut config = LoaderConfig::new(platform);
    for dir in options.module_paths.iter().rev() {
        config.add_search_path(dir.clone());
    }
    let registry = ModuleRegistry::new(config);

    // The libc module is always present: compiled programs forward their
    // C-library calls through it and its exports win symbol resolution.
    if let Err(e) = registry.register_builtin("libc", default_table().exports()) {
        out.error("module", &e.to_string());
        return EXIT_MODULE;
    }

    let vm_name = module_file_name("vm", &platform);
    out.verbose(&format!("vm module name: {}", vm_name));

    let vm_path = match &options.vm_module {
        Some(path) => Some(path.clone()),
        None => registry.discover("vm"),
    };

    match vm_path {
        Some(path) => {
            out.verbose(&format!("loading vm module from {}", path.display()));
            run_external(&registry, &path, options, out)
        }
        None => {
            out.verbose("no vm module on the search path, using the in-process engine");
            run_in_process(options, out)
        }
    }
}

fn run_external(
    registry: &ModuleRegistry,
    path: &std::path::Path,
    options: &LaunchOptions,
    out: &mut Output,
) -> i32 {
    let handle = match registry.load("vm", Some(path)) {
        Ok(handle) => handle,
        Err(e) => {
            out.error("module", &e.to_string());
            return EXIT_MODULE;
        }
    };
    let entry = match registry.resolve(handle, "vm_native_main") {
        Ok(ptr) => ptr,
        Err(e) => {
            out.error("module", &e.to_string());
            return EXIT_MODULE;
        }
    };
    let Some(program) = options.program.to_str().and_then(|s| CString::new(s).ok()) else {
        out.error("usage", "program path is not valid UTF-8");
        return EXIT_USAGE;
    };
    // Safety: the export contract for VM modules is
    // `vm_native_main(path) -> exit code`; the registry keeps the module
    // mapped for the duration of the call.
    let code = unsafe {
        let main: VmNativeMain = std::mem::transmute(entry);
        main(program.as_ptr())
    };
    out.verbose(&format!("vm module returned {}", code));
    code
}

fn run_in_process(options: &LaunchOptions, out: &mut Output) -> i32 {
    let vm = Vm::new(VmOptions {
        optimize: options.optimize,
        permissive_decode: false,
        force_interpreter: options.interpret,
    })
    .with_libc(default_table());

    match vm.run_file(&options.program) {
        Ok(value) => {
            out.verbose(&format!("program returned {}", value));
            value & 0xFF
        }
        Err(e) => {
            let (category, code) = categorize(&e);
            out.error(category, &e.to_string());
            code
        }
    }
}

/// Map an engine failure to its report category and exit code
pub fn categorize(error: &EngineError) -> (&'static str, i32) {
    if error.is_trap() {
        return ("trap", EXIT_TRAP);
    }
    match error {
        EngineError::Parse(_) => ("parse", EXIT_PARSE),
        EngineError::Compile(_) => ("compile", EXIT_COMPILE),
        EngineError::Runtime(_) => ("compile", EXIT_COMPILE),
        EngineError::Interp(_) => ("compile", EXIT_COMPILE),
        EngineError::Io(_) => ("usage", EXIT_USAGE),
    }
}

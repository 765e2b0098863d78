//! VM facade
//!
//! One entry point over the whole engine: parse an ASTC program, pick the
//! execution strategy (JIT on a supported host, interpreter otherwise or on
//! request), and run it to its HALT value. This is the behavior a packaged
//! VM module exposes as `vm_native_main`.

use std::path::Path;

use thiserror::Error;

use astc_container::ArchTag;

use crate::bytecode::{AstcError, AstcProgram};
use crate::codegen::arm64::Arm64Backend;
use crate::codegen::x64::X64Backend;
use crate::codegen::{ArchBackend, CodegenError};
use crate::forwarding::LibcResolver;
use crate::interp::{self, InterpError};
use crate::jit::{self, CompileOptions, RuntimeError};

/// Engine-level error: every stage's failure in one place
#[derive(Debug, Error)]
pub enum EngineError {
    /// ASTC parsing failed
    #[error(transparent)]
    Parse(#[from] AstcError),

    /// Compilation failed
    #[error(transparent)]
    Compile(#[from] CodegenError),

    /// Placement or compiled-code execution failed
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Interpreted execution failed
    #[error(transparent)]
    Interp(#[from] InterpError),

    /// Program file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this is an execution trap (as opposed to a parse/compile
    /// failure); the launcher maps traps to their own exit code
    pub fn is_trap(&self) -> bool {
        matches!(
            self,
            EngineError::Runtime(RuntimeError::TrapDuringExecution(_))
                | EngineError::Interp(InterpError::Trap(_))
        )
    }
}

/// Execution options
#[derive(Debug, Clone, Copy)]
pub struct VmOptions {
    /// Apply optimization passes during compilation
    pub optimize: bool,
    /// Decode unknown opcodes as NOPs instead of failing
    pub permissive_decode: bool,
    /// Use the reference interpreter even when a JIT backend exists
    pub force_interpreter: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            optimize: true,
            permissive_decode: false,
            force_interpreter: false,
        }
    }
}

/// Backend for an architecture, when the engine has an emitter for it
pub fn backend_for(arch: ArchTag) -> Option<Box<dyn ArchBackend>> {
    match arch {
        ArchTag::X64 => Some(Box::new(X64Backend::new())),
        ArchTag::Arm64 => Some(Box::new(Arm64Backend::new())),
        ArchTag::X86 | ArchTag::Arm32 => None,
    }
}

/// Backend matching the host, when the host is a supported JIT target
pub fn host_backend() -> Option<Box<dyn ArchBackend>> {
    ArchTag::native().and_then(backend_for)
}

/// The engine facade
pub struct Vm<'a> {
    options: VmOptions,
    libc: Option<&'a dyn LibcResolver>,
}

impl<'a> Vm<'a> {
    /// Create a VM with the given options and no libc forwarding
    pub fn new(options: VmOptions) -> Self {
        Self {
            options,
            libc: None,
        }
    }

    /// Attach a libc resolver for `LIBC_CALL` programs
    pub fn with_libc(mut self, libc: &'a dyn LibcResolver) -> Self {
        self.libc = Some(libc);
        self
    }

    /// Parse and run a program from raw ASTC bytes
    pub fn run_bytes(&self, bytes: &[u8]) -> Result<i32, EngineError> {
        let program = AstcProgram::parse(bytes, self.options.permissive_decode)?;
        self.run_program(&program)
    }

    /// Read, parse, and run a program file
    pub fn run_file<P: AsRef<Path>>(&self, path: P) -> Result<i32, EngineError> {
        let bytes = std::fs::read(path)?;
        self.run_bytes(&bytes)
    }

    /// Run an already-parsed program
    pub fn run_program(&self, program: &AstcProgram) -> Result<i32, EngineError> {
        if self.options.force_interpreter {
            return Ok(interp::run(program, self.libc)?);
        }
        match host_backend() {
            Some(backend) => {
                let compiled = jit::compile(
                    program,
                    backend.as_ref(),
                    CompileOptions {
                        enable_optimizations: self.options.optimize,
                    },
                )?;
                let resolver = self.libc.unwrap_or(&NO_LIBC);
                let executable = jit::finalize(compiled, backend.as_ref(), resolver)?;
                Ok(executable.run()?)
            }
            // Hosts without an emitter still execute, just not natively.
            None => Ok(interp::run(program, self.libc)?),
        }
    }
}

/// Resolver used when no libc module is attached: every id is unresolved
struct NoLibc;

static NO_LIBC: NoLibc = NoLibc;

impl LibcResolver for NoLibc {
    fn resolve(&self, _func_id: u16) -> Option<*const u8> {
        None
    }

    fn name(&self, _func_id: u16) -> Option<&str> {
        None
    }
}

//! ASTC execution engine
//!
//! This crate implements the VM layer of the ASTC stack:
//! - **bytecode**: wire-format opcodes, the program reader (flat bytecode
//!   and AST payloads), and the payload builder
//! - **codegen**: the per-architecture emit-hook vtable, compilation
//!   context, register bookkeeping, and the x86-64/AArch64 emitters
//! - **jit**: the driver that turns a parsed program into executable
//!   memory, with symbolic stack checking and peephole passes
//! - **interp**: the reference interpreter the optimizer is checked
//!   against
//! - **vm**: the facade a launcher (or a packaged VM module) drives
//!
//! # Example
//!
//! ```rust,ignore
//! use astc_engine::{Vm, VmOptions};
//!
//! let vm = Vm::new(VmOptions::default());
//! let exit = vm.run_file("program.astc")?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bytecode;
pub mod codegen;
pub mod forwarding;
pub mod interp;
pub mod jit;
pub mod vm;

pub use bytecode::{AstcError, AstcProgram, Instr, Opcode, ProgramBuilder};
pub use codegen::{ArchBackend, CodegenError};
pub use forwarding::LibcResolver;
pub use interp::InterpError;
pub use jit::{CompileOptions, CompiledProgram, ExecutableProgram, RuntimeError};
pub use vm::{backend_for, host_backend, EngineError, Vm, VmOptions};

//! JIT compilation pipeline
//!
//! - **check**: symbolic stack verification over the instruction graph
//! - **opt**: peephole passes (constant folding, NOP collapse, dead code)
//! - **driver**: emission in program order, jump patching, relocation
//!   resolution, and placement into executable memory

pub mod check;
pub mod driver;
pub mod opt;

pub use check::stack_check;
pub use driver::{
    compile, finalize, CompileOptions, CompiledProgram, ExecutableProgram, RuntimeError,
    StringPool,
};

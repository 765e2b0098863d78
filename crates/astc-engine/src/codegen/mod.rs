//! Code-generation core
//!
//! The per-architecture emit hooks live behind the `ArchBackend` trait; the
//! shared `CodeGenContext` carries the code buffer, register state, fixups,
//! relocations, and statistics for one compilation.

pub mod arm64;
pub mod context;
pub mod regalloc;
pub mod x64;

use thiserror::Error;

use astc_container::ArchTag;

use context::CodeGenContext;

/// Code-generation and JIT errors
#[derive(Debug, Error)]
pub enum CodegenError {
    /// The code buffer hit its growth limit
    #[error("Emit buffer exhausted at {0} bytes")]
    EmitBufferExhausted(usize),

    /// A host allocation failed
    #[error("Allocation failed: {0}")]
    AllocError(String),

    /// The instruction stream is not well formed (stack underflow,
    /// inconsistent depths at a merge point, bad local offsets)
    #[error("Invalid instruction sequence: {0}")]
    InvalidInstructionSequence(String),

    /// A branch target never materialized during emission
    #[error("Unpatchable jump to payload offset {0}")]
    UnpatchableJump(u32),

    /// Any other condition that aborts compilation
    #[error("Compilation failed: {0}")]
    CompilationFailed(String),
}

/// How a recorded branch site is encoded, for patching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchEncoding {
    /// x86-64 rel32 immediately at the site
    Rel32,
    /// AArch64 `b` with a 26-bit word offset; site is the instruction start
    Imm26,
    /// AArch64 `cbz`/`b.cond` with a 19-bit word offset in bits 5..24
    Imm19,
}

/// A branch whose target is patched after emission
#[derive(Debug, Clone, Copy)]
pub struct JumpFixup {
    /// Byte offset of the patch site in the code buffer
    pub code_offset: usize,
    /// Bytecode payload offset this branch targets
    pub target_pc: u32,
    /// Site encoding
    pub encoding: BranchEncoding,
}

/// A fixup whose target is a code offset known only after the epilogue is
/// emitted (HALT exits and trap entries)
#[derive(Debug, Clone, Copy)]
pub struct ExitFixup {
    /// Byte offset of the patch site in the code buffer
    pub code_offset: usize,
    /// Site encoding
    pub encoding: BranchEncoding,
}

/// What an absolute-address relocation refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// Address of string blob `index` in the program's string pool
    StringPool(u32),
    /// Address of the forwarded libc function with this id
    LibcFn(u16),
}

/// An absolute 64-bit address patched into the code before the RX flip
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    /// Byte offset of the patch site in the code buffer
    pub code_offset: usize,
    /// What to patch in
    pub kind: RelocKind,
}

/// Patch a branch site to land on `target` (a code-buffer offset)
pub fn patch_branch(
    code: &mut [u8],
    site: usize,
    encoding: BranchEncoding,
    target: usize,
) -> Result<(), CodegenError> {
    match encoding {
        BranchEncoding::Rel32 => {
            let rel = target as i64 - (site as i64 + 4);
            let rel: i32 = rel.try_into().map_err(|_| {
                CodegenError::CompilationFailed(format!("branch displacement {} overflows", rel))
            })?;
            code[site..site + 4].copy_from_slice(&rel.to_le_bytes());
        }
        BranchEncoding::Imm26 => {
            let delta = (target as i64 - site as i64) / 4;
            if !(-(1i64 << 25)..(1i64 << 25)).contains(&delta) {
                return Err(CodegenError::CompilationFailed(format!(
                    "branch displacement {} overflows",
                    delta
                )));
            }
            let mut word = u32::from_le_bytes(code[site..site + 4].try_into().unwrap());
            word |= (delta as u32) & 0x03FF_FFFF;
            code[site..site + 4].copy_from_slice(&word.to_le_bytes());
        }
        BranchEncoding::Imm19 => {
            let delta = (target as i64 - site as i64) / 4;
            if !(-(1i64 << 18)..(1i64 << 18)).contains(&delta) {
                return Err(CodegenError::CompilationFailed(format!(
                    "branch displacement {} overflows",
                    delta
                )));
            }
            let mut word = u32::from_le_bytes(code[site..site + 4].try_into().unwrap());
            word |= ((delta as u32) & 0x0007_FFFF) << 5;
            code[site..site + 4].copy_from_slice(&word.to_le_bytes());
        }
    }
    Ok(())
}

/// The per-architecture emit-hook vtable
///
/// Each hook appends machine code to the context's buffer and keeps the
/// register and fixup state coherent. The driver calls hooks strictly in
/// program order, with `ctx.stack_depth` set to the operand-stack depth at
/// the instruction's entry.
pub trait ArchBackend {
    /// Backend name for diagnostics
    fn name(&self) -> &'static str;

    /// Architecture this backend emits for
    fn arch(&self) -> ArchTag;

    /// Emit a no-op
    fn emit_nop(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError>;

    /// Pop the program's return value and jump to the epilogue
    fn emit_halt_with_return(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError>;

    /// Push a 32-bit constant
    fn emit_const_i32(&self, ctx: &mut CodeGenContext, value: i32) -> Result<(), CodegenError>;

    /// Push the absolute address of a string-pool blob
    fn emit_const_string(&self, ctx: &mut CodeGenContext, index: u32) -> Result<(), CodegenError>;

    /// Pop two, push their sum
    fn emit_add(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError>;

    /// Pop two, push their difference
    fn emit_sub(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError>;

    /// Pop two, push their product
    fn emit_mul(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError>;

    /// Pop two, push their quotient; branches to the trap exit on a zero
    /// divisor or an overflowing division
    fn emit_div(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError>;

    /// Pop two, push 1 when equal else 0
    fn emit_cmp_eq(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError>;

    /// Pop two, push 1 when the first is less else 0
    fn emit_cmp_lt(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError>;

    /// Unconditional branch to a bytecode offset
    fn emit_branch(&self, ctx: &mut CodeGenContext, target_pc: u32) -> Result<(), CodegenError>;

    /// Pop; branch to a bytecode offset when the value is zero
    fn emit_branch_if_false(
        &self,
        ctx: &mut CodeGenContext,
        target_pc: u32,
    ) -> Result<(), CodegenError>;

    /// Call the forwarded libc function `func_id` with `argc` stack
    /// arguments; pushes the return value
    fn emit_libc_call(
        &self,
        ctx: &mut CodeGenContext,
        func_id: u16,
        argc: u16,
    ) -> Result<(), CodegenError>;

    /// Transfer control to the function at a bytecode offset
    fn emit_user_call(&self, ctx: &mut CodeGenContext, target_pc: u32)
        -> Result<(), CodegenError>;

    /// Pop into the 32-bit local slot at the byte offset
    fn emit_store_local(&self, ctx: &mut CodeGenContext, offset: u32) -> Result<(), CodegenError>;

    /// Push the 32-bit local slot at the byte offset
    fn emit_load_local(&self, ctx: &mut CodeGenContext, offset: u32) -> Result<(), CodegenError>;

    /// Establish the frame: save the frame pointer, reserve
    /// `ctx.frame_size` bytes (16-byte aligned, at least 48)
    fn emit_function_prologue(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError>;

    /// Emit the trap block and the epilogue (exact reverse of the
    /// prologue), recording their offsets in the context
    fn emit_function_epilogue(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError>;

    /// Write an absolute 64-bit address into a relocation site
    fn patch_absolute(&self, code: &mut [u8], site: usize, value: u64);
}

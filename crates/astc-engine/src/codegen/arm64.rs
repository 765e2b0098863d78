//! AArch64 emitter
//!
//! Mirrors the x86-64 discipline with AArch64 conventions: paired
//! `stp`/`ldp` saves of fp/lr, `movz`/`movk` constant materialization, and
//! 16-byte operand-stack slots so sp stays architecturally aligned. Locals
//! are 32-bit slots addressed down from x29. The tagged-i64 return contract
//! is identical to the x86-64 backend's.

use astc_container::ArchTag;

use super::context::CodeGenContext;
use super::{ArchBackend, BranchEncoding, CodegenError, ExitFixup, JumpFixup, RelocKind, Relocation};

const X0: u8 = 0;
const X1: u8 = 1;

/// Largest frame (and local offset) reachable with a single `sub` immediate
const MAX_FRAME: u32 = 4095;

/// Code generator for AArch64
pub struct Arm64Backend;

impl Arm64Backend {
    /// Create the backend
    pub fn new() -> Self {
        Arm64Backend
    }

    /// str x0, [sp, #-16]!
    fn push_x0(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.code.push_word(0xF81F_0FE0)
    }

    /// ldr x0, [sp], #16
    fn pop_x0(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.code.push_word(0xF841_07E0)
    }

    /// ldr x1, [sp], #16
    fn pop_x1(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.code.push_word(0xF841_07E1)
    }

    fn begin_binop(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        let rhs = ctx.fresh_vreg();
        ctx.regs.claim(X1, rhs);
        self.pop_x1(ctx)?;
        let lhs = ctx.fresh_vreg();
        ctx.regs.claim(X0, lhs);
        self.pop_x0(ctx)
    }

    fn end_binop(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        self.push_x0(ctx)?;
        ctx.regs.free(X0);
        ctx.regs.free(X1);
        Ok(())
    }

    /// sub x9, x29, #imm — the address of a local slot
    fn local_addr(&self, ctx: &mut CodeGenContext, offset: u32) -> Result<(), CodegenError> {
        let imm = offset + 4;
        if imm > MAX_FRAME {
            return Err(CodegenError::InvalidInstructionSequence(format!(
                "local offset {} exceeds the frame limit",
                offset
            )));
        }
        ctx.code.push_word(0xD100_03A9 | (imm << 10))
    }

    /// movz/movk sequence loading a 64-bit absolute into the register
    fn emit_abs64_placeholder(
        &self,
        ctx: &mut CodeGenContext,
        reg: u8,
        kind: RelocKind,
    ) -> Result<(), CodegenError> {
        ctx.relocations.push(Relocation {
            code_offset: ctx.code.len(),
            kind,
        });
        let rd = reg as u32;
        ctx.code.push_word(0xD280_0000 | rd)?; // movz xN, #0
        ctx.code.push_word(0xF2A0_0000 | rd)?; // movk xN, #0, lsl #16
        ctx.code.push_word(0xF2C0_0000 | rd)?; // movk xN, #0, lsl #32
        ctx.code.push_word(0xF2E0_0000 | rd) // movk xN, #0, lsl #48
    }
}

impl Default for Arm64Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchBackend for Arm64Backend {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn arch(&self) -> ArchTag {
        ArchTag::Arm64
    }

    fn emit_nop(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        ctx.code.push_word(0xD503_201F)
    }

    fn emit_halt_with_return(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.pop_x0(ctx)?;
        // mov w0, w0 zero-extends: the tag half must be clear.
        ctx.code.push_word(0x2A00_03E0)?;
        ctx.halt_fixups.push(ExitFixup {
            code_offset: ctx.code.len(),
            encoding: BranchEncoding::Imm26,
        });
        ctx.code.push_word(0x1400_0000) // b epilogue
    }

    fn emit_const_i32(&self, ctx: &mut CodeGenContext, value: i32) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        let bits = value as u32;
        let lo = bits & 0xFFFF;
        let hi = bits >> 16;
        ctx.code.push_word(0x5280_0000 | (lo << 5))?; // movz w0, #lo
        if hi != 0 || !ctx.enable_optimizations {
            ctx.code.push_word(0x72A0_0000 | (hi << 5))?; // movk w0, #hi, lsl #16
        } else {
            ctx.stats.optimizations_applied += 1;
        }
        self.push_x0(ctx)
    }

    fn emit_const_string(&self, ctx: &mut CodeGenContext, index: u32) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.emit_abs64_placeholder(ctx, X0, RelocKind::StringPool(index))?;
        self.push_x0(ctx)
    }

    fn emit_add(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.begin_binop(ctx)?;
        ctx.code.push_word(0x0B01_0000)?; // add w0, w0, w1
        self.end_binop(ctx)
    }

    fn emit_sub(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.begin_binop(ctx)?;
        ctx.code.push_word(0x4B01_0000)?; // sub w0, w0, w1
        self.end_binop(ctx)
    }

    fn emit_mul(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.begin_binop(ctx)?;
        ctx.code.push_word(0x1B01_7C00)?; // mul w0, w0, w1
        self.end_binop(ctx)
    }

    fn emit_div(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.begin_binop(ctx)?;
        // cbz w1, trap
        ctx.trap_fixups.push(ExitFixup {
            code_offset: ctx.code.len(),
            encoding: BranchEncoding::Imm19,
        });
        ctx.code.push_word(0x3400_0001)?;
        // INT_MIN / -1 takes the trap exit like the x86-64 backend.
        ctx.code.push_word(0x3100_043F)?; // cmn w1, #1
        ctx.code.push_word(0x5400_0081)?; // b.ne +4 instructions
        ctx.code.push_word(0x52B0_0009)?; // movz w9, #0x8000, lsl #16
        ctx.code.push_word(0x6B09_001F)?; // cmp w0, w9
        ctx.trap_fixups.push(ExitFixup {
            code_offset: ctx.code.len(),
            encoding: BranchEncoding::Imm19,
        });
        ctx.code.push_word(0x5400_0000)?; // b.eq trap
        ctx.code.push_word(0x1AC1_0C00)?; // sdiv w0, w0, w1
        self.end_binop(ctx)
    }

    fn emit_cmp_eq(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.begin_binop(ctx)?;
        ctx.code.push_word(0x6B01_001F)?; // cmp w0, w1
        ctx.code.push_word(0x1A9F_17E0)?; // cset w0, eq
        self.end_binop(ctx)
    }

    fn emit_cmp_lt(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.begin_binop(ctx)?;
        ctx.code.push_word(0x6B01_001F)?; // cmp w0, w1
        ctx.code.push_word(0x1A9F_A7E0)?; // cset w0, lt
        self.end_binop(ctx)
    }

    fn emit_branch(&self, ctx: &mut CodeGenContext, target_pc: u32) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        ctx.jump_fixups.push(JumpFixup {
            code_offset: ctx.code.len(),
            target_pc,
            encoding: BranchEncoding::Imm26,
        });
        ctx.code.push_word(0x1400_0000) // b target
    }

    fn emit_branch_if_false(
        &self,
        ctx: &mut CodeGenContext,
        target_pc: u32,
    ) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.pop_x0(ctx)?;
        ctx.jump_fixups.push(JumpFixup {
            code_offset: ctx.code.len(),
            target_pc,
            encoding: BranchEncoding::Imm19,
        });
        ctx.code.push_word(0x3400_0000) // cbz w0, target
    }

    fn emit_libc_call(
        &self,
        ctx: &mut CodeGenContext,
        func_id: u16,
        argc: u16,
    ) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        if argc > 4 {
            return Err(CodegenError::CompilationFailed(format!(
                "libc call with {} arguments exceeds the four-register convention",
                argc
            )));
        }
        // Operand slots are 16 bytes; argument i is at [sp, #16*(argc-1-i)].
        for i in 0..argc as u32 {
            let byte_off = 16 * (argc as u32 - 1 - i);
            ctx.code
                .push_word(0xF940_03E0 | ((byte_off / 8) << 10) | i)?; // ldr xi, [sp, #off]
        }
        self.emit_abs64_placeholder(ctx, 16, RelocKind::LibcFn(func_id))?;
        ctx.code.push_word(0xD63F_0200)?; // blr x16
        if argc > 0 {
            let drop = 16 * argc as u32;
            ctx.code.push_word(0x9100_03FF | (drop << 10))?; // add sp, sp, #drop
        }
        self.push_x0(ctx)
    }

    fn emit_user_call(
        &self,
        ctx: &mut CodeGenContext,
        target_pc: u32,
    ) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.emit_branch(ctx, target_pc)
    }

    fn emit_store_local(&self, ctx: &mut CodeGenContext, offset: u32) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.pop_x0(ctx)?;
        self.local_addr(ctx, offset)?;
        ctx.code.push_word(0xB900_0120) // str w0, [x9]
    }

    fn emit_load_local(&self, ctx: &mut CodeGenContext, offset: u32) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.local_addr(ctx, offset)?;
        ctx.code.push_word(0xB940_0120)?; // ldr w0, [x9]
        self.push_x0(ctx)
    }

    fn emit_function_prologue(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        if ctx.frame_size > MAX_FRAME {
            return Err(CodegenError::CompilationFailed(format!(
                "frame of {} bytes exceeds the immediate limit",
                ctx.frame_size
            )));
        }
        // The tracked window is x0–x15: sp, x29, and x30 are outside it and
        // therefore never allocatable. x9 is the local-address scratch.
        ctx.regs.reserve(9);
        ctx.code.push_word(0xA9BF_7BFD)?; // stp x29, x30, [sp, #-16]!
        ctx.code.push_word(0x9100_03FD)?; // mov x29, sp
        ctx.code.push_word(0xD100_03FF | (ctx.frame_size << 10)) // sub sp, sp, #frame
    }

    fn emit_function_epilogue(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        // Trap block: x0 = 1 << 32, then fall through into the epilogue.
        ctx.trap_offset = Some(ctx.code.len());
        ctx.code.push_word(0xD280_0000)?; // movz x0, #0
        ctx.code.push_word(0xF2C0_0020)?; // movk x0, #1, lsl #32
        // Epilogue: exact reverse of the prologue.
        ctx.epilogue_offset = Some(ctx.code.len());
        ctx.code.push_word(0x9100_03BF)?; // mov sp, x29
        ctx.code.push_word(0xA8C1_7BFD)?; // ldp x29, x30, [sp], #16
        ctx.code.push_word(0xD65F_03C0) // ret
    }

    fn patch_absolute(&self, code: &mut [u8], site: usize, value: u64) {
        // Four consecutive movz/movk words, 16 bits of the address each.
        for k in 0..4 {
            let at = site + 4 * k;
            let mut word = u32::from_le_bytes(code[at..at + 4].try_into().unwrap());
            let imm16 = ((value >> (16 * k)) & 0xFFFF) as u32;
            word = (word & !(0xFFFF << 5)) | (imm16 << 5);
            code[at..at + 4].copy_from_slice(&word.to_le_bytes());
        }
    }
}

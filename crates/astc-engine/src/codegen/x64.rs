//! x86-64 emitter
//!
//! The operand stack is the hardware stack: every slot is a 64-bit push,
//! values are 32-bit in the low half. Locals are 32-bit slots at
//! `[rbp - offset - 4]`. Compiled code returns a tagged i64 in rax: low 32
//! bits the value, high 32 bits zero on a clean HALT and one on a trap.

use astc_container::ArchTag;

use super::context::CodeGenContext;
use super::{ArchBackend, BranchEncoding, CodegenError, ExitFixup, JumpFixup, RelocKind, Relocation};

const RAX: u8 = 0;
const RCX: u8 = 1;
const RSP: u8 = 4;
const RBP: u8 = 5;

/// Code generator for x86-64
pub struct X64Backend;

impl X64Backend {
    /// Create the backend
    pub fn new() -> Self {
        X64Backend
    }

    /// pop rax
    fn pop_rax(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.code.push_u8(0x58)
    }

    /// pop rcx
    fn pop_rcx(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.code.push_u8(0x59)
    }

    /// push rax
    fn push_rax(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.code.push_u8(0x50)
    }

    /// Binary-op register discipline: rhs in rcx, lhs/result in rax
    fn begin_binop(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        let rhs = ctx.fresh_vreg();
        ctx.regs.claim(RCX, rhs);
        self.pop_rcx(ctx)?;
        let lhs = ctx.fresh_vreg();
        ctx.regs.claim(RAX, lhs);
        self.pop_rax(ctx)
    }

    fn end_binop(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        self.push_rax(ctx)?;
        ctx.regs.free(RAX);
        ctx.regs.free(RCX);
        Ok(())
    }
}

impl Default for X64Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchBackend for X64Backend {
    fn name(&self) -> &'static str {
        "x86-64"
    }

    fn arch(&self) -> ArchTag {
        ArchTag::X64
    }

    fn emit_nop(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        ctx.code.push_u8(0x90)
    }

    fn emit_halt_with_return(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        // Pop the actual return value; the tag half of rax must be zero, so
        // re-extend the low 32 bits.
        self.pop_rax(ctx)?;
        ctx.code.extend(&[0x89, 0xC0])?; // mov eax, eax
        ctx.code.push_u8(0xE9)?; // jmp rel32 -> epilogue
        ctx.halt_fixups.push(ExitFixup {
            code_offset: ctx.code.len(),
            encoding: BranchEncoding::Rel32,
        });
        ctx.code.extend(&[0, 0, 0, 0])
    }

    fn emit_const_i32(&self, ctx: &mut CodeGenContext, value: i32) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        if ctx.enable_optimizations && value == 0 {
            // xor eax, eax; push rax
            ctx.code.extend(&[0x31, 0xC0])?;
            ctx.stats.optimizations_applied += 1;
            return self.push_rax(ctx);
        }
        if ctx.enable_optimizations && (-128..=127).contains(&value) {
            // push imm8 (sign-extended)
            ctx.code.push_u8(0x6A)?;
            ctx.stats.optimizations_applied += 1;
            return ctx.code.push_u8(value as u8);
        }
        // mov eax, imm32; push rax
        ctx.code.push_u8(0xB8)?;
        ctx.code.extend(&(value as u32).to_le_bytes())?;
        self.push_rax(ctx)
    }

    fn emit_const_string(&self, ctx: &mut CodeGenContext, index: u32) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        // movabs rax, imm64 (patched to the pool address); push rax
        ctx.code.extend(&[0x48, 0xB8])?;
        ctx.relocations.push(Relocation {
            code_offset: ctx.code.len(),
            kind: RelocKind::StringPool(index),
        });
        ctx.code.extend(&[0u8; 8])?;
        self.push_rax(ctx)
    }

    fn emit_add(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.begin_binop(ctx)?;
        ctx.code.extend(&[0x01, 0xC8])?; // add eax, ecx
        self.end_binop(ctx)
    }

    fn emit_sub(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.begin_binop(ctx)?;
        ctx.code.extend(&[0x29, 0xC8])?; // sub eax, ecx
        self.end_binop(ctx)
    }

    fn emit_mul(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.begin_binop(ctx)?;
        ctx.code.extend(&[0x0F, 0xAF, 0xC1])?; // imul eax, ecx
        self.end_binop(ctx)
    }

    fn emit_div(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.begin_binop(ctx)?;
        // Divisor checks route to the trap exit: zero, and the
        // INT_MIN / -1 overflow the hardware would fault on.
        ctx.code.extend(&[0x85, 0xC9])?; // test ecx, ecx
        ctx.code.extend(&[0x0F, 0x84])?; // jz trap
        ctx.trap_fixups.push(ExitFixup {
            code_offset: ctx.code.len(),
            encoding: BranchEncoding::Rel32,
        });
        ctx.code.extend(&[0, 0, 0, 0])?;
        ctx.code.extend(&[0x83, 0xF9, 0xFF])?; // cmp ecx, -1
        // jne past the overflow check: cmp eax,imm32 (5) + je rel32 (6)
        ctx.code.extend(&[0x0F, 0x85])?;
        ctx.code.extend(&11i32.to_le_bytes())?;
        ctx.code.push_u8(0x3D)?; // cmp eax, 0x80000000
        ctx.code.extend(&0x8000_0000u32.to_le_bytes())?;
        ctx.code.extend(&[0x0F, 0x84])?; // je trap
        ctx.trap_fixups.push(ExitFixup {
            code_offset: ctx.code.len(),
            encoding: BranchEncoding::Rel32,
        });
        ctx.code.extend(&[0, 0, 0, 0])?;
        ctx.code.push_u8(0x99)?; // cdq
        ctx.code.extend(&[0xF7, 0xF9])?; // idiv ecx
        self.end_binop(ctx)
    }

    fn emit_cmp_eq(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.begin_binop(ctx)?;
        ctx.code.extend(&[0x39, 0xC8])?; // cmp eax, ecx
        ctx.code.extend(&[0x0F, 0x94, 0xC0])?; // sete al
        ctx.code.extend(&[0x0F, 0xB6, 0xC0])?; // movzx eax, al
        self.end_binop(ctx)
    }

    fn emit_cmp_lt(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.begin_binop(ctx)?;
        ctx.code.extend(&[0x39, 0xC8])?; // cmp eax, ecx
        ctx.code.extend(&[0x0F, 0x9C, 0xC0])?; // setl al
        ctx.code.extend(&[0x0F, 0xB6, 0xC0])?; // movzx eax, al
        self.end_binop(ctx)
    }

    fn emit_branch(&self, ctx: &mut CodeGenContext, target_pc: u32) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        ctx.code.push_u8(0xE9)?; // jmp rel32
        ctx.jump_fixups.push(JumpFixup {
            code_offset: ctx.code.len(),
            target_pc,
            encoding: BranchEncoding::Rel32,
        });
        ctx.code.extend(&[0, 0, 0, 0])
    }

    fn emit_branch_if_false(
        &self,
        ctx: &mut CodeGenContext,
        target_pc: u32,
    ) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.pop_rax(ctx)?;
        ctx.code.extend(&[0x85, 0xC0])?; // test eax, eax
        ctx.code.extend(&[0x0F, 0x84])?; // jz rel32
        ctx.jump_fixups.push(JumpFixup {
            code_offset: ctx.code.len(),
            target_pc,
            encoding: BranchEncoding::Rel32,
        });
        ctx.code.extend(&[0, 0, 0, 0])
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
        // Argument i sits at [rsp + 8*(argc-1-i)]: the first-pushed argument
        // is the deepest. Load into the ABI registers rdi, rsi, rdx, rcx.
        const ARG_MODRM: [u8; 4] = [0xBC, 0xB4, 0x94, 0x8C]; // rdi, rsi, rdx, rcx
        for i in 0..argc {
            let disp = 8 * (argc - 1 - i) as u32;
            ctx.code.extend(&[0x48, 0x8B, ARG_MODRM[i as usize], 0x24])?;
            ctx.code.extend(&disp.to_le_bytes())?;
        }
        // The frame keeps rsp 16-aligned at depth 0; each slot shifts it by
        // 8, so pad when the static depth is odd.
        let pad = if ctx.stack_depth % 2 == 1 { 8u32 } else { 0 };
        if pad != 0 {
            ctx.code.extend(&[0x48, 0x83, 0xEC, 0x08])?; // sub rsp, 8
        }
        // movabs r10, imm64 (patched to the forwarded function)
        ctx.code.extend(&[0x49, 0xBA])?;
        ctx.relocations.push(Relocation {
            code_offset: ctx.code.len(),
            kind: RelocKind::LibcFn(func_id),
        });
        ctx.code.extend(&[0u8; 8])?;
        ctx.code.extend(&[0x31, 0xC0])?; // xor eax, eax (variadic: no SSE args)
        ctx.code.extend(&[0x41, 0xFF, 0xD2])?; // call r10
        // Drop the pad and the consumed operand slots, then push the result.
        let cleanup = pad + 8 * argc as u32;
        if cleanup != 0 {
            ctx.code.extend(&[0x48, 0x81, 0xC4])?; // add rsp, imm32
            ctx.code.extend(&cleanup.to_le_bytes())?;
        }
        self.push_rax(ctx)
    }

    fn emit_user_call(
        &self,
        ctx: &mut CodeGenContext,
        target_pc: u32,
    ) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        // Control transfer into the target function; arguments stay on the
        // operand stack. See the calling-convention note in the driver.
        self.emit_branch(ctx, target_pc)
    }

    fn emit_store_local(&self, ctx: &mut CodeGenContext, offset: u32) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        self.pop_rax(ctx)?;
        // mov [rbp + disp32], eax — locals are 32-bit slots below rbp.
        let disp = -((offset + 4) as i32);
        ctx.code.extend(&[0x89, 0x85])?;
        ctx.code.extend(&disp.to_le_bytes())
    }

    fn emit_load_local(&self, ctx: &mut CodeGenContext, offset: u32) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        // mov eax, [rbp + disp32]; push rax
        let disp = -((offset + 4) as i32);
        ctx.code.extend(&[0x8B, 0x85])?;
        ctx.code.extend(&disp.to_le_bytes())?;
        self.push_rax(ctx)
    }

    fn emit_function_prologue(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        ctx.regs.reserve(RSP);
        ctx.regs.reserve(RBP);
        ctx.code.push_u8(0x55)?; // push rbp
        ctx.code.extend(&[0x48, 0x89, 0xE5])?; // mov rbp, rsp
        ctx.code.extend(&[0x48, 0x81, 0xEC])?; // sub rsp, imm32
        ctx.code.extend(&ctx.frame_size.to_le_bytes())
    }

    fn emit_function_epilogue(&self, ctx: &mut CodeGenContext) -> Result<(), CodegenError> {
        ctx.check_emitting()?;
        // Trap block: tag 1 in the high half of rax, then fall through.
        ctx.trap_offset = Some(ctx.code.len());
        ctx.code.extend(&[0x48, 0xB8])?; // movabs rax, 1<<32
        ctx.code.extend(&(1u64 << 32).to_le_bytes())?;
        // Epilogue: exact reverse of the prologue.
        ctx.epilogue_offset = Some(ctx.code.len());
        ctx.code.push_u8(0xC9)?; // leave
        ctx.code.push_u8(0xC3) // ret
    }

    fn patch_absolute(&self, code: &mut [u8], site: usize, value: u64) {
        code[site..site + 8].copy_from_slice(&value.to_le_bytes());
    }
}

//! JIT driver
//!
//! Drives reader output through the code-generator core: prologue, every
//! instruction exactly once in program order, forward-jump patching,
//! epilogue, and the peephole passes. The result is a `CompiledProgram`
//! (position-independent except for recorded relocations), which
//! `finalize` turns into executable memory with string-pool and libc
//! addresses patched before the RX flip.

use std::time::Instant;

use rustc_hash::FxHashMap;
use thiserror::Error;

use astc_container::{ArchTag, ExecMemory, RtBlob};

use crate::bytecode::{AstcProgram, Instr};
use crate::codegen::context::{CodeGenContext, CompileState, CompileStats};
use crate::codegen::{patch_branch, ArchBackend, CodegenError, RelocKind, Relocation};
use crate::forwarding::{LibcResolver, MAX_LIBC_ARGS};
use crate::jit::check::stack_check;
use crate::jit::opt::optimize;

/// Runtime-side errors: mapping, resolution, and execution traps
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Committing code to executable memory failed
    #[error("Executable mapping failed: {0}")]
    ExecutableMapFailed(String),

    /// Compiled code hit a trap (division by zero or overflow, or control
    /// fell off the end of the program)
    #[error("Trap during execution: {0}")]
    TrapDuringExecution(String),

    /// A `LIBC_CALL` id has no registered forwarding function
    #[error("Unresolved libc function id {0:#06x}")]
    UnresolvedLibcFunction(u16),
}

/// Compilation options
#[derive(Debug, Clone, Copy)]
pub struct CompileOptions {
    /// Apply the peephole passes and short instruction forms
    pub enable_optimizations: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            enable_optimizations: true,
        }
    }
}

/// Output of a compilation: machine code plus everything needed to place it
#[derive(Debug)]
pub struct CompiledProgram {
    /// Emitted machine code
    pub code: Vec<u8>,
    /// Entry offset within the code (the prologue)
    pub entry_offset: usize,
    /// Architecture the code was emitted for
    pub arch: ArchTag,
    /// Absolute-address sites to patch at placement time
    pub relocations: Vec<Relocation>,
    /// String blobs referenced by the code, without terminators
    pub strings: Vec<Vec<u8>>,
    /// Compilation statistics
    pub stats: CompileStats,
}

impl CompiledProgram {
    /// Write the code as an RTME runtime blob
    ///
    /// Only possible when the program carries no relocations: string and
    /// libc addresses are process-specific and cannot be persisted.
    pub fn to_rt_blob(&self) -> Result<RtBlob, CodegenError> {
        if !self.relocations.is_empty() {
            return Err(CodegenError::CompilationFailed(
                "program with address relocations cannot become a runtime blob".into(),
            ));
        }
        Ok(RtBlob::new(self.code.clone(), self.entry_offset as u32))
    }
}

/// String blobs concatenated into one allocation with stable addresses
///
/// Every blob gets a NUL terminator so pointers handed to the forwarded C
/// library are usable as C strings.
#[derive(Debug)]
pub struct StringPool {
    bytes: Box<[u8]>,
    offsets: Vec<usize>,
}

impl StringPool {
    /// Build a pool from the program's blobs
    pub fn build(strings: &[Vec<u8>]) -> Self {
        let mut bytes = Vec::new();
        let mut offsets = Vec::with_capacity(strings.len());
        for blob in strings {
            offsets.push(bytes.len());
            bytes.extend_from_slice(blob);
            bytes.push(0);
        }
        Self {
            bytes: bytes.into_boxed_slice(),
            offsets,
        }
    }

    /// Address of blob `index`; stable for the pool's lifetime
    pub fn address_of(&self, index: u32) -> Option<*const u8> {
        self.offsets
            .get(index as usize)
            .map(|&off| unsafe { self.bytes.as_ptr().add(off) })
    }
}

/// A compiled program placed in executable memory, ready to run
pub struct ExecutableProgram {
    mem: ExecMemory,
    entry_offset: usize,
    // Compiled code holds absolute pointers into the pool.
    _pool: StringPool,
    /// Statistics carried over from compilation
    pub stats: CompileStats,
}

/// Tagged return convention of compiled code: low 32 bits are the value,
/// a non-zero high half is a trap.
type CompiledEntry = unsafe extern "C" fn() -> i64;

impl ExecutableProgram {
    /// Invoke the compiled program and decode the tagged result
    pub fn run(&self) -> Result<i32, RuntimeError> {
        let entry = self
            .mem
            .fn_ptr(self.entry_offset)
            .map_err(|e| RuntimeError::ExecutableMapFailed(e.to_string()))?;
        // Safety: the memory is RX, the entry offset was produced by the
        // driver, and finalize verified the code targets this host.
        let raw = unsafe {
            let f: CompiledEntry = std::mem::transmute(entry);
            f()
        };
        let tag = (raw >> 32) as u32;
        if tag != 0 {
            return Err(RuntimeError::TrapDuringExecution(
                "trap in compiled code (division or fall-off-end)".into(),
            ));
        }
        Ok(raw as i32)
    }
}

fn align16(value: u32) -> u32 {
    (value + 15) & !15
}

/// Compile a parsed program with the given backend
pub fn compile(
    program: &AstcProgram,
    backend: &dyn ArchBackend,
    options: CompileOptions,
) -> Result<CompiledProgram, CodegenError> {
    let mut ctx = CodeGenContext::new(options.enable_optimizations);
    let started = Instant::now();
    let result = compile_inner(program, backend, &mut ctx);
    match result {
        Ok(()) => {
            ctx.stats.compile_us = started.elapsed().as_micros() as u64;
            ctx.transition(CompileState::Finalized);
            Ok(CompiledProgram {
                code: ctx.code.into_bytes(),
                entry_offset: 0,
                arch: backend.arch(),
                relocations: ctx.relocations,
                strings: program.strings.clone(),
                stats: ctx.stats,
            })
        }
        Err(e) => {
            ctx.fail();
            Err(e)
        }
    }
}

fn compile_inner(
    program: &AstcProgram,
    backend: &dyn ArchBackend,
    ctx: &mut CodeGenContext,
) -> Result<(), CodegenError> {
    // The reader already did these stages; the state machine records them
    // so a failure is attributable to its pipeline position.
    ctx.transition(CompileState::ParsingHeader);
    ctx.transition(CompileState::DecodingInstructions);

    let depths = stack_check(program)?;

    // Frame requirement from the local slots the program touches.
    let mut max_local_end = 0u32;
    for (_, instr) in &program.instrs {
        if let Instr::StoreLocal(off) | Instr::LoadLocal(off) = instr {
            if *off > 1 << 20 {
                return Err(CodegenError::InvalidInstructionSequence(format!(
                    "local offset {} is out of range",
                    off
                )));
            }
            max_local_end = max_local_end.max(off + 4);
        }
        if let Instr::LibcCall { argc, .. } = instr {
            if *argc as usize > MAX_LIBC_ARGS {
                return Err(CodegenError::CompilationFailed(format!(
                    "libc call with {} arguments exceeds the four-register convention",
                    argc
                )));
            }
        }
    }
    ctx.frame_size = align16(max_local_end.max(48));

    ctx.transition(CompileState::Optimizing);
    let items: Vec<(u32, Option<Instr>)> = if ctx.enable_optimizations {
        let outcome = optimize(&program.instrs);
        ctx.stats.optimizations_applied += outcome.applied;
        outcome.instrs
    } else {
        program
            .instrs
            .iter()
            .map(|(pc, i)| (*pc, Some(i.clone())))
            .collect()
    };

    ctx.transition(CompileState::Emitting);
    backend.emit_function_prologue(ctx)?;
    if program.entry_offset != 0 {
        backend.emit_branch(ctx, program.entry_offset)?;
    }

    let mut offset_map: FxHashMap<u32, usize> = FxHashMap::default();
    for (pc, item) in &items {
        offset_map.insert(*pc, ctx.code.len());
        let Some(instr) = item else { continue };
        ctx.stack_depth = depths.get(pc).copied().unwrap_or(0);
        match instr {
            Instr::Nop => backend.emit_nop(ctx)?,
            Instr::Halt => backend.emit_halt_with_return(ctx)?,
            Instr::ConstI32(v) => backend.emit_const_i32(ctx, *v)?,
            Instr::ConstString(i) => backend.emit_const_string(ctx, *i)?,
            Instr::Add => backend.emit_add(ctx)?,
            Instr::Sub => backend.emit_sub(ctx)?,
            Instr::Mul => backend.emit_mul(ctx)?,
            Instr::Div => backend.emit_div(ctx)?,
            Instr::StoreLocal(off) => backend.emit_store_local(ctx, *off)?,
            Instr::LoadLocal(off) => backend.emit_load_local(ctx, *off)?,
            Instr::Jump(t) => backend.emit_branch(ctx, *t)?,
            Instr::JumpIfFalse(t) => backend.emit_branch_if_false(ctx, *t)?,
            Instr::CallUser(t) => backend.emit_user_call(ctx, *t)?,
            Instr::LibcCall { func_id, argc } => backend.emit_libc_call(ctx, *func_id, *argc)?,
        }
        ctx.stats.instructions_compiled += 1;
    }
    // The end of the payload lands on the trap block: control that runs off
    // the end traps instead of executing arbitrary bytes.
    offset_map.insert(program.end_offset(), ctx.code.len());

    backend.emit_function_epilogue(ctx)?;
    let epilogue = ctx
        .epilogue_offset
        .ok_or_else(|| CodegenError::CompilationFailed("backend recorded no epilogue".into()))?;
    let trap = ctx
        .trap_offset
        .ok_or_else(|| CodegenError::CompilationFailed("backend recorded no trap block".into()))?;

    // Patch exits first, then bytecode-target branches.
    let code = ctx.code.as_mut_slice();
    for fixup in &ctx.halt_fixups {
        patch_branch(code, fixup.code_offset, fixup.encoding, epilogue)?;
    }
    for fixup in &ctx.trap_fixups {
        patch_branch(code, fixup.code_offset, fixup.encoding, trap)?;
    }
    for fixup in &ctx.jump_fixups {
        let target = offset_map
            .get(&fixup.target_pc)
            .copied()
            .ok_or(CodegenError::UnpatchableJump(fixup.target_pc))?;
        patch_branch(code, fixup.code_offset, fixup.encoding, target)?;
    }
    Ok(())
}

/// Place a compiled program into executable memory
///
/// String-pool and libc addresses are patched while the region is still
/// writable; the flip to RX happens before the entry pointer exists.
pub fn finalize(
    mut compiled: CompiledProgram,
    backend: &dyn ArchBackend,
    libc: &dyn LibcResolver,
) -> Result<ExecutableProgram, RuntimeError> {
    if ArchTag::native() != Some(compiled.arch) {
        return Err(RuntimeError::ExecutableMapFailed(format!(
            "code for {} cannot execute on this host",
            compiled.arch
        )));
    }

    let pool = StringPool::build(&compiled.strings);
    for reloc in &compiled.relocations {
        let value = match reloc.kind {
            RelocKind::StringPool(index) => pool.address_of(index).ok_or_else(|| {
                RuntimeError::ExecutableMapFailed(format!(
                    "relocation names string {} outside the pool",
                    index
                ))
            })? as u64,
            RelocKind::LibcFn(id) => libc
                .resolve(id)
                .ok_or(RuntimeError::UnresolvedLibcFunction(id))?
                as u64,
        };
        backend.patch_absolute(&mut compiled.code, reloc.code_offset, value);
    }

    let mut mem = ExecMemory::allocate_rw(compiled.code.len())
        .map_err(|e| RuntimeError::ExecutableMapFailed(e.to_string()))?;
    mem.write(0, &compiled.code)
        .map_err(|e| RuntimeError::ExecutableMapFailed(e.to_string()))?;
    mem.finalize_rx()
        .map_err(|e| RuntimeError::ExecutableMapFailed(e.to_string()))?;

    Ok(ExecutableProgram {
        mem,
        entry_offset: compiled.entry_offset,
        _pool: pool,
        stats: compiled.stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ProgramBuilder;
    use crate::codegen::x64::X64Backend;

    fn parse(bytes: Vec<u8>) -> AstcProgram {
        AstcProgram::parse(&bytes, false).unwrap()
    }

    #[test]
    fn test_compile_s1_counts_instructions() {
        let mut builder = ProgramBuilder::new();
        builder.const_i32(5).const_i32(7).add().halt();
        let program = parse(builder.finish(0));
        let compiled = compile(
            &program,
            &X64Backend::new(),
            CompileOptions {
                enable_optimizations: false,
            },
        )
        .unwrap();
        assert_eq!(compiled.stats.instructions_compiled, 4);
        assert!(compiled.code.len() > 8);
        // Naive emission performs no peephole rewrites.
        assert_eq!(compiled.stats.optimizations_applied, 0);
    }

    #[test]
    fn test_compile_folds_when_enabled() {
        let mut builder = ProgramBuilder::new();
        builder.const_i32(5).const_i32(7).add().halt();
        let program = parse(builder.finish(0));
        let compiled = compile(&program, &X64Backend::new(), CompileOptions::default()).unwrap();
        // Only the folded constant and the halt are emitted.
        assert_eq!(compiled.stats.instructions_compiled, 2);
        assert!(compiled.stats.optimizations_applied >= 1);
    }

    #[test]
    fn test_compile_rejects_underflow() {
        let mut builder = ProgramBuilder::new();
        builder.add();
        let program = parse(builder.halt_value(0).finish(0));
        assert!(matches!(
            compile(&program, &X64Backend::new(), CompileOptions::default()),
            Err(CodegenError::InvalidInstructionSequence(_))
        ));
    }

    #[test]
    fn test_forward_jumps_are_patched() {
        let mut builder = ProgramBuilder::new();
        builder.const_i32(1);
        let site = builder.jump_if_false_placeholder();
        builder.const_i32(10).halt();
        builder.patch_target(site, builder.pos());
        builder.const_i32(20).halt();
        let program = parse(builder.finish(0));
        let compiled = compile(
            &program,
            &X64Backend::new(),
            CompileOptions {
                enable_optimizations: false,
            },
        )
        .unwrap();
        // No unpatched rel32 placeholder remains (0 displacement would jump
        // into the next instruction; just assert compile succeeded and the
        // code ends with the epilogue).
        assert_eq!(&compiled.code[compiled.code.len() - 2..], &[0xC9, 0xC3]);
    }

    #[test]
    fn test_string_relocations_surface() {
        let mut builder = ProgramBuilder::new();
        builder.const_string(b"hi\n").libc_call(0x30, 1).halt();
        let program = parse(builder.finish(0));
        let compiled = compile(&program, &X64Backend::new(), CompileOptions::default()).unwrap();
        assert_eq!(compiled.relocations.len(), 2);
        assert!(compiled
            .relocations
            .iter()
            .any(|r| matches!(r.kind, RelocKind::StringPool(0))));
        assert!(compiled
            .relocations
            .iter()
            .any(|r| matches!(r.kind, RelocKind::LibcFn(0x30))));
        // And such a program cannot become a persistable runtime blob.
        assert!(compiled.to_rt_blob().is_err());
    }

    #[test]
    fn test_rt_blob_for_pure_code() {
        let mut builder = ProgramBuilder::new();
        builder.const_i32(5).const_i32(7).add().halt();
        let program = parse(builder.finish(0));
        let compiled = compile(&program, &X64Backend::new(), CompileOptions::default()).unwrap();
        let blob = compiled.to_rt_blob().unwrap();
        assert_eq!(blob.entry_offset, 0);
        assert!(!blob.code.is_empty());
    }

    #[test]
    fn test_string_pool_addresses_are_nul_terminated() {
        let pool = StringPool::build(&[b"hi".to_vec(), b"there".to_vec()]);
        let first = pool.address_of(0).unwrap();
        let second = pool.address_of(1).unwrap();
        unsafe {
            assert_eq!(*first, b'h');
            assert_eq!(*first.add(2), 0);
            assert_eq!(*second, b't');
            assert_eq!(*second.add(5), 0);
        }
        assert!(pool.address_of(2).is_none());
    }
}

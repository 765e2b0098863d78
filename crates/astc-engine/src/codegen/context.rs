//! Compilation context
//!
//! One `CodeGenContext` per compilation: the growable code buffer, the
//! active state-machine position, register state, fixup lists, relocations,
//! and statistics. Never shared; exactly one thread emits into it.

use super::regalloc::RegisterAllocator;
use super::{CodegenError, ExitFixup, JumpFixup, Relocation};

/// Hard cap on the code buffer; hitting it is `EmitBufferExhausted`
pub const CODE_BUFFER_LIMIT: usize = 16 * 1024 * 1024;

/// Initial code buffer capacity (the buffer doubles as it grows)
pub const CODE_BUFFER_INITIAL: usize = 256;

/// Compilation state machine
///
/// `Failed` poisons the context: no further emission is accepted and the
/// caller must discard it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileState {
    /// Fresh context
    Idle,
    /// Reading the ASTC header
    ParsingHeader,
    /// Decoding the instruction stream
    DecodingInstructions,
    /// Emitting machine code
    Emitting,
    /// Running peephole passes
    Optimizing,
    /// Compilation completed
    Finalized,
    /// Compilation aborted
    Failed,
}

/// Compilation statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileStats {
    /// Instructions compiled
    pub instructions_compiled: u32,
    /// Peephole optimizations applied
    pub optimizations_applied: u32,
    /// Registers spilled
    pub spill_count: u32,
    /// Wall-clock compile time in microseconds
    pub compile_us: u64,
}

/// Growable code buffer with doubling growth and a hard limit
#[derive(Debug)]
pub struct CodeBuf {
    bytes: Vec<u8>,
}

impl CodeBuf {
    fn new() -> Self {
        Self {
            bytes: Vec::with_capacity(CODE_BUFFER_INITIAL),
        }
    }

    /// Current length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing has been emitted yet
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn ensure(&mut self, extra: usize) -> Result<(), CodegenError> {
        let needed = self.bytes.len() + extra;
        if needed > CODE_BUFFER_LIMIT {
            return Err(CodegenError::EmitBufferExhausted(needed));
        }
        if needed > self.bytes.capacity() {
            let mut target = self.bytes.capacity().max(CODE_BUFFER_INITIAL);
            while target < needed {
                target *= 2;
            }
            self.bytes
                .try_reserve(target - self.bytes.len())
                .map_err(|e| CodegenError::AllocError(e.to_string()))?;
        }
        Ok(())
    }

    /// Append one byte
    pub fn push_u8(&mut self, byte: u8) -> Result<(), CodegenError> {
        self.ensure(1)?;
        self.bytes.push(byte);
        Ok(())
    }

    /// Append raw bytes
    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), CodegenError> {
        self.ensure(bytes.len())?;
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }

    /// Append one little-endian 32-bit word (AArch64 instruction)
    pub fn push_word(&mut self, word: u32) -> Result<(), CodegenError> {
        self.extend(&word.to_le_bytes())
    }

    /// The emitted bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable access for patching
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Take the buffer out of the context
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Mutable scratchpad for one compilation
pub struct CodeGenContext {
    /// Machine-code output buffer
    pub code: CodeBuf,
    /// State-machine position
    pub state: CompileState,
    /// Whether peephole optimizations are applied
    pub enable_optimizations: bool,
    /// Stack-frame byte size (16-byte aligned, at least 48); set by the
    /// driver before the prologue is emitted
    pub frame_size: u32,
    /// Operand-stack depth at the entry of the instruction currently being
    /// emitted; the driver maintains this from the symbolic stack check
    pub stack_depth: u32,
    /// Register bookkeeping
    pub regs: RegisterAllocator,
    /// Virtual register counter
    pub next_vreg: u32,
    /// Branches to bytecode offsets, patched after emission
    pub jump_fixups: Vec<JumpFixup>,
    /// Branches to the epilogue (HALT sites)
    pub halt_fixups: Vec<ExitFixup>,
    /// Branches to the trap block (division guards)
    pub trap_fixups: Vec<ExitFixup>,
    /// Absolute-address sites patched before the RX flip
    pub relocations: Vec<Relocation>,
    /// Code offset of the trap block, set by the epilogue hook
    pub trap_offset: Option<usize>,
    /// Code offset of the epilogue, set by the epilogue hook
    pub epilogue_offset: Option<usize>,
    /// Statistics for this compilation
    pub stats: CompileStats,
}

impl CodeGenContext {
    /// Create a context; `enable_optimizations` gates every peephole pass
    pub fn new(enable_optimizations: bool) -> Self {
        Self {
            code: CodeBuf::new(),
            state: CompileState::Idle,
            enable_optimizations,
            frame_size: 48,
            stack_depth: 0,
            regs: RegisterAllocator::new(),
            next_vreg: 0,
            jump_fixups: Vec::new(),
            halt_fixups: Vec::new(),
            trap_fixups: Vec::new(),
            relocations: Vec::new(),
            trap_offset: None,
            epilogue_offset: None,
            stats: CompileStats::default(),
        }
    }

    /// Allocate a fresh virtual register id
    pub fn fresh_vreg(&mut self) -> u32 {
        let id = self.next_vreg;
        self.next_vreg += 1;
        id
    }

    /// Move the state machine forward; entering `Failed` is one-way
    pub fn transition(&mut self, next: CompileState) {
        if self.state != CompileState::Failed {
            self.state = next;
        }
    }

    /// Abort: poison the context
    pub fn fail(&mut self) {
        self.state = CompileState::Failed;
    }

    /// Guard used by emit hooks: refuse to emit into a poisoned context
    pub fn check_emitting(&self) -> Result<(), CodegenError> {
        if self.state == CompileState::Failed {
            return Err(CodegenError::CompilationFailed(
                "context is poisoned after an earlier failure".into(),
            ));
        }
        Ok(())
    }
}

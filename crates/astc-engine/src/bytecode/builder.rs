//! Flat bytecode emission
//!
//! `ProgramBuilder` assembles an ASTC payload instruction by instruction and
//! wraps it in a header. The AST lowering pass and the test suites both
//! build programs through it; jump targets are patched by payload offset.

use super::opcode::Opcode;
use super::program::{ASTC_MAGIC, PAYLOAD_AST, PAYLOAD_BYTECODE};

/// Incremental ASTC payload builder
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    payload: Vec<u8>,
}

impl ProgramBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Current payload offset: the pc of the next emitted instruction
    pub fn pos(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Append a raw byte (for malformed-input tests)
    pub fn raw_byte(&mut self, byte: u8) -> &mut Self {
        self.payload.push(byte);
        self
    }

    /// Emit NOP
    pub fn nop(&mut self) -> &mut Self {
        self.payload.push(Opcode::Nop as u8);
        self
    }

    /// Emit HALT
    pub fn halt(&mut self) -> &mut Self {
        self.payload.push(Opcode::Halt as u8);
        self
    }

    /// Emit CONST_I32
    pub fn const_i32(&mut self, value: i32) -> &mut Self {
        self.payload.push(Opcode::ConstI32 as u8);
        self.payload.extend_from_slice(&(value as u32).to_le_bytes());
        self
    }

    /// Emit CONST_STRING with an inline blob
    pub fn const_string(&mut self, bytes: &[u8]) -> &mut Self {
        self.payload.push(Opcode::ConstString as u8);
        self.payload.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.payload.extend_from_slice(bytes);
        self
    }

    /// Emit ADD
    pub fn add(&mut self) -> &mut Self {
        self.payload.push(Opcode::Add as u8);
        self
    }

    /// Emit SUB
    pub fn sub(&mut self) -> &mut Self {
        self.payload.push(Opcode::Sub as u8);
        self
    }

    /// Emit MUL
    pub fn mul(&mut self) -> &mut Self {
        self.payload.push(Opcode::Mul as u8);
        self
    }

    /// Emit DIV
    pub fn div(&mut self) -> &mut Self {
        self.payload.push(Opcode::Div as u8);
        self
    }

    /// Emit STORE_LOCAL
    pub fn store_local(&mut self, offset: u32) -> &mut Self {
        self.payload.push(Opcode::StoreLocal as u8);
        self.payload.extend_from_slice(&offset.to_le_bytes());
        self
    }

    /// Emit LOAD_LOCAL
    pub fn load_local(&mut self, offset: u32) -> &mut Self {
        self.payload.push(Opcode::LoadLocal as u8);
        self.payload.extend_from_slice(&offset.to_le_bytes());
        self
    }

    /// Emit JUMP to a known payload offset
    pub fn jump(&mut self, target: u32) -> &mut Self {
        self.payload.push(Opcode::Jump as u8);
        self.payload.extend_from_slice(&target.to_le_bytes());
        self
    }

    /// Emit JUMP with a placeholder target; returns the operand position for
    /// `patch_target`
    pub fn jump_placeholder(&mut self) -> u32 {
        self.payload.push(Opcode::Jump as u8);
        let at = self.pos();
        self.payload.extend_from_slice(&0u32.to_le_bytes());
        at
    }

    /// Emit JUMP_IF_FALSE to a known payload offset
    pub fn jump_if_false(&mut self, target: u32) -> &mut Self {
        self.payload.push(Opcode::JumpIfFalse as u8);
        self.payload.extend_from_slice(&target.to_le_bytes());
        self
    }

    /// Emit JUMP_IF_FALSE with a placeholder target
    pub fn jump_if_false_placeholder(&mut self) -> u32 {
        self.payload.push(Opcode::JumpIfFalse as u8);
        let at = self.pos();
        self.payload.extend_from_slice(&0u32.to_le_bytes());
        at
    }

    /// Patch a placeholder emitted earlier to point at `target`
    pub fn patch_target(&mut self, operand_pos: u32, target: u32) {
        let at = operand_pos as usize;
        self.payload[at..at + 4].copy_from_slice(&target.to_le_bytes());
    }

    /// Emit CALL_USER
    pub fn call_user(&mut self, target: u32) -> &mut Self {
        self.payload.push(Opcode::CallUser as u8);
        self.payload.extend_from_slice(&target.to_le_bytes());
        self
    }

    /// Emit LIBC_CALL
    pub fn libc_call(&mut self, func_id: u16, argc: u16) -> &mut Self {
        self.payload.push(Opcode::LibcCall as u8);
        self.payload.extend_from_slice(&func_id.to_le_bytes());
        self.payload.extend_from_slice(&argc.to_le_bytes());
        self
    }

    /// Convenience: push `value` and HALT
    pub fn halt_value(mut self, value: i32) -> Self {
        self.const_i32(value);
        self.halt();
        self
    }

    /// The raw payload without a header
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Wrap the payload in a bytecode-kind header
    pub fn finish(self, entry_offset: u32) -> Vec<u8> {
        wrap_payload(&self.payload, entry_offset, PAYLOAD_BYTECODE)
    }
}

/// Prepend a 16-byte ASTC header to a payload
pub fn wrap_payload(payload: &[u8], entry_offset: u32, payload_kind: u16) -> Vec<u8> {
    debug_assert!(payload_kind == PAYLOAD_BYTECODE || payload_kind == PAYLOAD_AST);
    let version = 1u32 | ((payload_kind as u32) << 16);
    let mut bytes = Vec::with_capacity(16 + payload.len());
    bytes.extend_from_slice(&ASTC_MAGIC);
    bytes.extend_from_slice(&version.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&entry_offset.to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode::Instr;
    use crate::bytecode::program::AstcProgram;

    #[test]
    fn test_builder_emits_wire_bytes() {
        let mut builder = ProgramBuilder::new();
        builder.const_i32(5).const_i32(7).add().halt();
        assert_eq!(
            builder.into_payload(),
            vec![0x10, 5, 0, 0, 0, 0x10, 7, 0, 0, 0, 0x20, 0x01]
        );
    }

    #[test]
    fn test_builder_roundtrips_through_parser() {
        let mut builder = ProgramBuilder::new();
        builder.const_i32(3).store_local(4).load_local(4);
        let bytes = builder.halt_value(0).finish(0);
        let program = AstcProgram::parse(&bytes, false).unwrap();
        assert_eq!(program.instrs[0].1, Instr::ConstI32(3));
        assert_eq!(program.instrs[1].1, Instr::StoreLocal(4));
        assert_eq!(program.instrs[2].1, Instr::LoadLocal(4));
    }

    #[test]
    fn test_jump_patching() {
        let mut builder = ProgramBuilder::new();
        let site = builder.jump_placeholder();
        builder.const_i32(1).halt();
        let target = builder.pos();
        builder.const_i32(2).halt();
        builder.patch_target(site, target);
        let bytes = builder.finish(0);

        let program = AstcProgram::parse(&bytes, false).unwrap();
        assert_eq!(program.instrs[0].1, Instr::Jump(target));
    }
}

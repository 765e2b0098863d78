//! ASTC bytecode definitions
//!
//! Wire-format opcodes, the program reader (flat bytecode and AST payloads),
//! the payload builder, and the AST node model.

pub mod ast;
pub mod builder;
pub mod opcode;
pub mod program;

pub use ast::{AstKind, AstNode, BinOp};
pub use builder::{wrap_payload, ProgramBuilder};
pub use opcode::{stack_effect, Instr, Opcode};
pub use program::{
    decode_instructions, AstcError, AstcProgram, ASTC_HEADER_SIZE, ASTC_MAGIC, MAX_FORMAT_VERSION,
    PAYLOAD_AST, PAYLOAD_BYTECODE,
};

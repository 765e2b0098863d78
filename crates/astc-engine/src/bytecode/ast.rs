//! Serialized AST payloads
//!
//! The second form an ASTC payload can take: a tree of nodes, each carrying
//! a type tag and its source line/column. The tree is lowered to the same
//! flat instruction stream the bytecode form decodes to, so everything past
//! the reader is payload-kind agnostic.
//!
//! Node wire format: `tag u8, line u32, col u32`, then tag-specific data.
//! Child counts are explicit u32s; nesting is capped to keep decoding
//! non-recursive input safe.

use super::builder::ProgramBuilder;
use super::program::AstcError;

/// Maximum AST nesting depth accepted by the decoder
pub const MAX_AST_DEPTH: usize = 64;

mod tag {
    pub const INT_LITERAL: u8 = 1;
    pub const STR_LITERAL: u8 = 2;
    pub const BINARY: u8 = 3;
    pub const LOAD_LOCAL: u8 = 4;
    pub const STORE_LOCAL: u8 = 5;
    pub const SEQ: u8 = 6;
    pub const IF: u8 = 7;
    pub const WHILE: u8 = 8;
    pub const LIBC_CALL: u8 = 9;
    pub const RETURN: u8 = 10;
}

/// Binary operator in an AST `Binary` node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BinOp {
    /// Addition
    Add = 0,
    /// Subtraction
    Sub = 1,
    /// Multiplication
    Mul = 2,
    /// Division
    Div = 3,
}

impl BinOp {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BinOp::Add),
            1 => Some(BinOp::Sub),
            2 => Some(BinOp::Mul),
            3 => Some(BinOp::Div),
            _ => None,
        }
    }
}

/// Type-specific content of an AST node
#[derive(Debug, Clone, PartialEq)]
pub enum AstKind {
    /// Integer literal
    IntLiteral(i32),
    /// String literal blob
    StrLiteral(Vec<u8>),
    /// Binary arithmetic over two sub-expressions
    Binary {
        /// Operator
        op: BinOp,
        /// Left operand
        lhs: Box<AstNode>,
        /// Right operand
        rhs: Box<AstNode>,
    },
    /// Read a local slot
    LoadLocal(u32),
    /// Evaluate `value` and store it into a local slot
    StoreLocal {
        /// Local byte offset
        offset: u32,
        /// Value expression
        value: Box<AstNode>,
    },
    /// Statements in order
    Seq(Vec<AstNode>),
    /// Two-way branch
    If {
        /// Condition expression
        cond: Box<AstNode>,
        /// Taken when the condition is non-zero
        then: Box<AstNode>,
        /// Taken when the condition is zero
        otherwise: Option<Box<AstNode>>,
    },
    /// Pre-tested loop
    While {
        /// Condition expression
        cond: Box<AstNode>,
        /// Loop body
        body: Box<AstNode>,
    },
    /// Call a forwarded C-library function
    LibcCall {
        /// Stable libc function id
        func_id: u16,
        /// Argument expressions, evaluated left to right
        args: Vec<AstNode>,
    },
    /// Evaluate the expression and halt with its value
    Return(Box<AstNode>),
}

/// One AST node with its source position
#[derive(Debug, Clone, PartialEq)]
pub struct AstNode {
    /// Node content
    pub kind: AstKind,
    /// Source line (1-indexed, 0 when unknown)
    pub line: u32,
    /// Source column (1-indexed, 0 when unknown)
    pub col: u32,
}

impl AstNode {
    /// Create a node without source position
    pub fn new(kind: AstKind) -> Self {
        Self { kind, line: 0, col: 0 }
    }

    /// Create a node at a source position
    pub fn at(kind: AstKind, line: u32, col: u32) -> Self {
        Self { kind, line, col }
    }

    /// Decode a serialized AST payload; the root must consume it exactly
    pub fn decode(payload: &[u8]) -> Result<Self, AstcError> {
        let mut cursor = Cursor { data: payload, pos: 0 };
        let root = decode_node(&mut cursor, 0)?;
        if cursor.pos != payload.len() {
            return Err(AstcError::InvalidAstcFormat(format!(
                "{} trailing bytes after AST root",
                payload.len() - cursor.pos
            )));
        }
        Ok(root)
    }

    /// Serialize this tree into an AST payload
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_node(self, &mut out);
        out
    }

    /// Lower the tree to a flat bytecode payload
    pub fn lower(&self) -> Vec<u8> {
        let mut builder = ProgramBuilder::new();
        lower_node(self, &mut builder);
        builder.into_payload()
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn u8(&mut self) -> Result<u8, AstcError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| AstcError::InvalidAstcFormat("AST truncated".into()))?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> Result<u16, AstcError> {
        if self.pos + 2 > self.data.len() {
            return Err(AstcError::InvalidAstcFormat("AST truncated".into()));
        }
        let value = u16::from_le_bytes(self.data[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Ok(value)
    }

    fn u32(&mut self) -> Result<u32, AstcError> {
        if self.pos + 4 > self.data.len() {
            return Err(AstcError::InvalidAstcFormat("AST truncated".into()));
        }
        let value = u32::from_le_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(value)
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>, AstcError> {
        if self.pos + len > self.data.len() {
            return Err(AstcError::InvalidAstcFormat("AST blob truncated".into()));
        }
        let blob = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(blob)
    }
}

fn decode_node(cursor: &mut Cursor<'_>, depth: usize) -> Result<AstNode, AstcError> {
    if depth > MAX_AST_DEPTH {
        return Err(AstcError::InvalidAstcFormat(format!(
            "AST nesting deeper than {}",
            MAX_AST_DEPTH
        )));
    }
    let tag_byte = cursor.u8()?;
    let line = cursor.u32()?;
    let col = cursor.u32()?;
    let child = |cursor: &mut Cursor<'_>| decode_node(cursor, depth + 1).map(Box::new);

    let kind = match tag_byte {
        tag::INT_LITERAL => AstKind::IntLiteral(cursor.u32()? as i32),
        tag::STR_LITERAL => {
            let len = cursor.u32()? as usize;
            AstKind::StrLiteral(cursor.bytes(len)?)
        }
        tag::BINARY => {
            let op = BinOp::from_u8(cursor.u8()?).ok_or_else(|| {
                AstcError::InvalidAstcFormat("unknown binary operator".into())
            })?;
            let lhs = child(cursor)?;
            let rhs = child(cursor)?;
            AstKind::Binary { op, lhs, rhs }
        }
        tag::LOAD_LOCAL => AstKind::LoadLocal(cursor.u32()?),
        tag::STORE_LOCAL => {
            let offset = cursor.u32()?;
            let value = child(cursor)?;
            AstKind::StoreLocal { offset, value }
        }
        tag::SEQ => {
            let count = cursor.u32()? as usize;
            let mut nodes = Vec::with_capacity(count.min(256));
            for _ in 0..count {
                nodes.push(decode_node(cursor, depth + 1)?);
            }
            AstKind::Seq(nodes)
        }
        tag::IF => {
            let cond = child(cursor)?;
            let then = child(cursor)?;
            let otherwise = if cursor.u8()? != 0 {
                Some(child(cursor)?)
            } else {
                None
            };
            AstKind::If { cond, then, otherwise }
        }
        tag::WHILE => {
            let cond = child(cursor)?;
            let body = child(cursor)?;
            AstKind::While { cond, body }
        }
        tag::LIBC_CALL => {
            let func_id = cursor.u16()?;
            let count = cursor.u32()? as usize;
            let mut args = Vec::with_capacity(count.min(16));
            for _ in 0..count {
                args.push(decode_node(cursor, depth + 1)?);
            }
            AstKind::LibcCall { func_id, args }
        }
        tag::RETURN => AstKind::Return(child(cursor)?),
        other => {
            return Err(AstcError::InvalidAstcFormat(format!(
                "unknown AST tag {}",
                other
            )))
        }
    };
    Ok(AstNode { kind, line, col })
}

fn encode_node(node: &AstNode, out: &mut Vec<u8>) {
    let tag_byte = match &node.kind {
        AstKind::IntLiteral(_) => tag::INT_LITERAL,
        AstKind::StrLiteral(_) => tag::STR_LITERAL,
        AstKind::Binary { .. } => tag::BINARY,
        AstKind::LoadLocal(_) => tag::LOAD_LOCAL,
        AstKind::StoreLocal { .. } => tag::STORE_LOCAL,
        AstKind::Seq(_) => tag::SEQ,
        AstKind::If { .. } => tag::IF,
        AstKind::While { .. } => tag::WHILE,
        AstKind::LibcCall { .. } => tag::LIBC_CALL,
        AstKind::Return(_) => tag::RETURN,
    };
    out.push(tag_byte);
    out.extend_from_slice(&node.line.to_le_bytes());
    out.extend_from_slice(&node.col.to_le_bytes());

    match &node.kind {
        AstKind::IntLiteral(value) => out.extend_from_slice(&(*value as u32).to_le_bytes()),
        AstKind::StrLiteral(bytes) => {
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        AstKind::Binary { op, lhs, rhs } => {
            out.push(*op as u8);
            encode_node(lhs, out);
            encode_node(rhs, out);
        }
        AstKind::LoadLocal(offset) => out.extend_from_slice(&offset.to_le_bytes()),
        AstKind::StoreLocal { offset, value } => {
            out.extend_from_slice(&offset.to_le_bytes());
            encode_node(value, out);
        }
        AstKind::Seq(nodes) => {
            out.extend_from_slice(&(nodes.len() as u32).to_le_bytes());
            for node in nodes {
                encode_node(node, out);
            }
        }
        AstKind::If { cond, then, otherwise } => {
            encode_node(cond, out);
            encode_node(then, out);
            match otherwise {
                Some(node) => {
                    out.push(1);
                    encode_node(node, out);
                }
                None => out.push(0),
            }
        }
        AstKind::While { cond, body } => {
            encode_node(cond, out);
            encode_node(body, out);
        }
        AstKind::LibcCall { func_id, args } => {
            out.extend_from_slice(&func_id.to_le_bytes());
            out.extend_from_slice(&(args.len() as u32).to_le_bytes());
            for arg in args {
                encode_node(arg, out);
            }
        }
        AstKind::Return(value) => encode_node(value, out),
    }
}

fn lower_node(node: &AstNode, builder: &mut ProgramBuilder) {
    match &node.kind {
        AstKind::IntLiteral(value) => {
            builder.const_i32(*value);
        }
        AstKind::StrLiteral(bytes) => {
            builder.const_string(bytes);
        }
        AstKind::Binary { op, lhs, rhs } => {
            lower_node(lhs, builder);
            lower_node(rhs, builder);
            match op {
                BinOp::Add => builder.add(),
                BinOp::Sub => builder.sub(),
                BinOp::Mul => builder.mul(),
                BinOp::Div => builder.div(),
            };
        }
        AstKind::LoadLocal(offset) => {
            builder.load_local(*offset);
        }
        AstKind::StoreLocal { offset, value } => {
            lower_node(value, builder);
            builder.store_local(*offset);
        }
        AstKind::Seq(nodes) => {
            for node in nodes {
                lower_node(node, builder);
            }
        }
        AstKind::If { cond, then, otherwise } => {
            lower_node(cond, builder);
            let to_else = builder.jump_if_false_placeholder();
            lower_node(then, builder);
            match otherwise {
                Some(node) => {
                    let to_end = builder.jump_placeholder();
                    builder.patch_target(to_else, builder.pos());
                    lower_node(node, builder);
                    builder.patch_target(to_end, builder.pos());
                }
                None => {
                    builder.patch_target(to_else, builder.pos());
                }
            }
        }
        AstKind::While { cond, body } => {
            let start = builder.pos();
            lower_node(cond, builder);
            let to_end = builder.jump_if_false_placeholder();
            lower_node(body, builder);
            builder.jump(start);
            builder.patch_target(to_end, builder.pos());
        }
        AstKind::LibcCall { func_id, args } => {
            for arg in args {
                lower_node(arg, builder);
            }
            builder.libc_call(*func_id, args.len() as u16);
        }
        AstKind::Return(value) => {
            lower_node(value, builder);
            builder.halt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode::Instr;
    use crate::bytecode::program::decode_instructions;

    fn int(v: i32) -> AstNode {
        AstNode::new(AstKind::IntLiteral(v))
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let tree = AstNode::new(AstKind::Return(Box::new(AstNode::at(
            AstKind::Binary {
                op: BinOp::Mul,
                lhs: Box::new(AstNode::at(AstKind::IntLiteral(6), 3, 12)),
                rhs: Box::new(int(7)),
            },
            3,
            5,
        ))));
        let decoded = AstNode::decode(&tree.encode()).unwrap();
        assert_eq!(decoded, tree);
        assert_eq!(decoded.line, 0);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = int(1).encode();
        bytes.push(0xAA);
        assert!(matches!(
            AstNode::decode(&bytes),
            Err(AstcError::InvalidAstcFormat(_))
        ));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut bytes = int(1).encode();
        bytes[0] = 0xEE;
        assert!(matches!(
            AstNode::decode(&bytes),
            Err(AstcError::InvalidAstcFormat(_))
        ));
    }

    #[test]
    fn test_depth_limit() {
        // return (((…1…))) nested beyond the cap via Return chains.
        let mut node = int(1);
        for _ in 0..(MAX_AST_DEPTH + 2) {
            node = AstNode::new(AstKind::Return(Box::new(node)));
        }
        assert!(matches!(
            AstNode::decode(&node.encode()),
            Err(AstcError::InvalidAstcFormat(_))
        ));
    }

    #[test]
    fn test_lower_arithmetic() {
        let tree = AstNode::new(AstKind::Return(Box::new(AstNode::new(AstKind::Binary {
            op: BinOp::Add,
            lhs: Box::new(int(5)),
            rhs: Box::new(int(7)),
        }))));
        let payload = tree.lower();
        let (instrs, _) = decode_instructions(&payload, false).unwrap();
        let ops: Vec<&Instr> = instrs.iter().map(|(_, i)| i).collect();
        assert_eq!(
            ops,
            vec![
                &Instr::ConstI32(5),
                &Instr::ConstI32(7),
                &Instr::Add,
                &Instr::Halt
            ]
        );
    }

    #[test]
    fn test_lower_if_else_shape() {
        let tree = AstNode::new(AstKind::Seq(vec![
            AstNode::new(AstKind::If {
                cond: Box::new(int(0)),
                then: Box::new(AstNode::new(AstKind::Return(Box::new(int(1))))),
                otherwise: Some(Box::new(AstNode::new(AstKind::Return(Box::new(int(2)))))),
            }),
        ]));
        let payload = tree.lower();
        let (instrs, _) = decode_instructions(&payload, false).unwrap();
        // cond, branch, then-return, jump, else-return
        assert!(matches!(instrs[1].1, Instr::JumpIfFalse(_)));
        let Instr::JumpIfFalse(else_target) = instrs[1].1 else { unreachable!() };
        // The else target is a real instruction boundary.
        assert!(instrs.iter().any(|(pc, _)| *pc == else_target));
    }

    #[test]
    fn test_lower_while_shape() {
        let tree = AstNode::new(AstKind::Seq(vec![
            AstNode::new(AstKind::While {
                cond: Box::new(AstNode::new(AstKind::LoadLocal(0))),
                body: Box::new(AstNode::new(AstKind::StoreLocal {
                    offset: 0,
                    value: Box::new(int(0)),
                })),
            }),
            AstNode::new(AstKind::Return(Box::new(int(9)))),
        ]));
        let payload = tree.lower();
        let (instrs, _) = decode_instructions(&payload, false).unwrap();
        // Loop closes with a backward jump to offset 0.
        assert!(instrs.iter().any(|(_, i)| matches!(i, Instr::Jump(0))));
    }
}

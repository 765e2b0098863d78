//! End-to-end scenarios over the engine: the wire-format examples from the
//! format documentation, interpreter/JIT agreement, and the optimizer
//! equivalence properties.

use std::ffi::{c_char, c_int, CStr};
use std::sync::Mutex;

use astc_engine::bytecode::{wrap_payload, AstKind, AstNode, BinOp, PAYLOAD_AST};
use astc_engine::{
    AstcError, AstcProgram, EngineError, LibcResolver, ProgramBuilder, Vm, VmOptions,
};

fn interp_vm() -> Vm<'static> {
    Vm::new(VmOptions {
        force_interpreter: true,
        ..Default::default()
    })
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn jit_vm(optimize: bool) -> Vm<'static> {
    Vm::new(VmOptions {
        optimize,
        ..Default::default()
    })
}

/// Run a program on every available execution path and demand agreement.
fn run_everywhere(bytes: &[u8]) -> i32 {
    let reference = interp_vm().run_bytes(bytes).expect("interpreter run");
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    {
        let optimized = jit_vm(true).run_bytes(bytes).expect("optimized JIT run");
        let naive = jit_vm(false).run_bytes(bytes).expect("naive JIT run");
        assert_eq!(optimized, reference, "optimized JIT diverges");
        assert_eq!(naive, reference, "naive JIT diverges");
    }
    reference
}

#[test]
fn constant_arithmetic_wire_bytes() {
    // push 5, push 7, add, halt
    let payload = [
        0x10, 5, 0, 0, 0, 0x10, 7, 0, 0, 0, 0x20, 0x01,
    ];
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"ASTC");
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&payload);

    assert_eq!(run_everywhere(&bytes), 12);
}

#[test]
fn local_variable_slots() {
    let mut builder = ProgramBuilder::new();
    builder
        .const_i32(3)
        .store_local(4)
        .const_i32(4)
        .store_local(8)
        .load_local(4)
        .load_local(8)
        .mul()
        .halt();
    assert_eq!(run_everywhere(&builder.finish(0)), 12);
}

// CONST_STRING "hi\n"; LIBC_CALL printf argc=1; HALT. The forwarding
// shim records what a printf would have written and returns the byte count.
static PRINTED: Mutex<Vec<u8>> = Mutex::new(Vec::new());

unsafe extern "C" fn recording_printf(fmt: *const c_char) -> c_int {
    if fmt.is_null() {
        return -1;
    }
    let text = CStr::from_ptr(fmt).to_bytes();
    PRINTED.lock().unwrap().extend_from_slice(text);
    text.len() as c_int
}

struct PrintfShim;

impl LibcResolver for PrintfShim {
    fn resolve(&self, func_id: u16) -> Option<*const u8> {
        (func_id == 0x0301).then_some(recording_printf as *const u8)
    }

    fn name(&self, func_id: u16) -> Option<&str> {
        (func_id == 0x0301).then_some("printf")
    }
}

#[test]
fn libc_printf_forwarding() {
    let mut builder = ProgramBuilder::new();
    builder.const_string(b"hi\n").libc_call(0x0301, 1).halt();
    let bytes = builder.finish(0);

    let shim = PrintfShim;
    PRINTED.lock().unwrap().clear();
    let vm = Vm::new(VmOptions {
        force_interpreter: true,
        ..Default::default()
    })
    .with_libc(&shim);
    assert_eq!(vm.run_bytes(&bytes).unwrap(), 3);
    assert_eq!(PRINTED.lock().unwrap().as_slice(), b"hi\n");

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    {
        PRINTED.lock().unwrap().clear();
        let vm = Vm::new(VmOptions::default()).with_libc(&shim);
        assert_eq!(vm.run_bytes(&bytes).unwrap(), 3);
        assert_eq!(PRINTED.lock().unwrap().as_slice(), b"hi\n");
    }
}

#[test]
fn malformed_header_is_a_parse_error() {
    // Declared payload size 0xFFFFFFFF on a short file.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"ASTC");
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&[0x01]);

    let err = interp_vm().run_bytes(&bytes).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Parse(AstcError::InvalidAstcFormat(_))
    ));
}

#[test]
fn arithmetic_matches_twos_complement_i32() {
    let pairs = [
        (0, 0),
        (5, 7),
        (-5, 7),
        (5, -7),
        (-5, -7),
        (i32::MAX, 1),
        (i32::MIN, 1),
        (i32::MAX, i32::MAX),
        (i32::MIN, -1),
        (123_456_789, -987),
    ];
    for &(a, b) in &pairs {
        for (op, expected) in [
            (0u8, a.wrapping_add(b)),
            (1, a.wrapping_sub(b)),
            (2, a.wrapping_mul(b)),
        ] {
            let mut builder = ProgramBuilder::new();
            builder.const_i32(a).const_i32(b);
            match op {
                0 => builder.add(),
                1 => builder.sub(),
                _ => builder.mul(),
            };
            builder.halt();
            assert_eq!(
                run_everywhere(&builder.finish(0)),
                expected,
                "a={} b={} op={}",
                a,
                b,
                op
            );
        }
    }
}

#[test]
fn division_by_zero_traps_on_every_path() {
    let mut builder = ProgramBuilder::new();
    builder.const_i32(6).const_i32(0).div().halt();
    let bytes = builder.finish(0);

    let err = interp_vm().run_bytes(&bytes).unwrap_err();
    assert!(err.is_trap());

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    {
        for optimize in [true, false] {
            let err = jit_vm(optimize).run_bytes(&bytes).unwrap_err();
            assert!(err.is_trap(), "optimize={}", optimize);
        }
    }
}

#[test]
fn division_results_agree() {
    for (a, b) in [(12, 4), (-12, 4), (12, -4), (7, 2), (-7, 2), (i32::MIN, 2)] {
        let mut builder = ProgramBuilder::new();
        builder.const_i32(a).const_i32(b).div().halt();
        assert_eq!(run_everywhere(&builder.finish(0)), a / b, "{}/{}", a, b);
    }
}

#[test]
fn optimization_equivalence_over_program_shapes() {
    // Shapes exercising every peephole: foldable chains, NOP runs, dead
    // code after HALT, branches, and locals.
    let programs: Vec<Vec<u8>> = vec![
        {
            let mut b = ProgramBuilder::new();
            b.const_i32(2).const_i32(3).mul().const_i32(1).sub().halt();
            b.finish(0)
        },
        {
            let mut b = ProgramBuilder::new();
            b.nop().nop().nop().const_i32(0).const_i32(9).add().halt();
            b.finish(0)
        },
        {
            let mut b = ProgramBuilder::new();
            b.const_i32(1).halt();
            b.const_i32(2).halt(); // dead
            b.finish(0)
        },
        {
            // if (0) 10 else 20
            let mut b = ProgramBuilder::new();
            b.const_i32(0);
            let to_else = b.jump_if_false_placeholder();
            b.const_i32(10).halt();
            b.patch_target(to_else, b.pos());
            b.const_i32(20).halt();
            b.finish(0)
        },
        {
            // countdown loop summing 1..=5
            let mut b = ProgramBuilder::new();
            b.const_i32(5).store_local(0).const_i32(0).store_local(4);
            let top = b.pos();
            b.load_local(0);
            let exit = b.jump_if_false_placeholder();
            b.load_local(4).load_local(0).add().store_local(4);
            b.load_local(0).const_i32(1).sub().store_local(0);
            b.jump(top);
            b.patch_target(exit, b.pos());
            b.load_local(4).halt();
            b.finish(0)
        },
    ];
    let expected = [5, 9, 1, 20, 15];
    for (bytes, expected) in programs.iter().zip(expected) {
        assert_eq!(run_everywhere(bytes), expected);
    }
}

#[test]
fn permissive_mode_skips_unknown_opcodes() {
    let mut builder = ProgramBuilder::new();
    builder.raw_byte(0x77);
    let bytes = builder.halt_value(4).finish(0);

    // Strict decode refuses.
    let err = interp_vm().run_bytes(&bytes).unwrap_err();
    assert!(matches!(err, EngineError::Parse(AstcError::UnknownOpcode { .. })));

    // Permissive decode treats the byte as NOP.
    let vm = Vm::new(VmOptions {
        force_interpreter: true,
        permissive_decode: true,
        ..Default::default()
    });
    assert_eq!(vm.run_bytes(&bytes).unwrap(), 4);
}

#[test]
fn ast_payload_runs_like_bytecode() {
    // return (6 * 7) - 2, as a serialized AST payload.
    let tree = AstNode::new(AstKind::Return(Box::new(AstNode::new(AstKind::Binary {
        op: BinOp::Sub,
        lhs: Box::new(AstNode::new(AstKind::Binary {
            op: BinOp::Mul,
            lhs: Box::new(AstNode::new(AstKind::IntLiteral(6))),
            rhs: Box::new(AstNode::new(AstKind::IntLiteral(7))),
        })),
        rhs: Box::new(AstNode::new(AstKind::IntLiteral(2))),
    }))));
    let bytes = wrap_payload(&tree.encode(), 0, PAYLOAD_AST);
    assert_eq!(run_everywhere(&bytes), 40);

    let program = AstcProgram::parse(&bytes, false).unwrap();
    assert_eq!(program.payload_kind, PAYLOAD_AST);
}

#[test]
fn ast_control_flow_lowers_and_runs() {
    // local0 = 3; while (local0) { local4 = local4 + 2; local0 = local0 - 1 }; return local4
    let tree = AstNode::new(AstKind::Seq(vec![
        AstNode::new(AstKind::StoreLocal {
            offset: 0,
            value: Box::new(AstNode::new(AstKind::IntLiteral(3))),
        }),
        AstNode::new(AstKind::While {
            cond: Box::new(AstNode::new(AstKind::LoadLocal(0))),
            body: Box::new(AstNode::new(AstKind::Seq(vec![
                AstNode::new(AstKind::StoreLocal {
                    offset: 4,
                    value: Box::new(AstNode::new(AstKind::Binary {
                        op: BinOp::Add,
                        lhs: Box::new(AstNode::new(AstKind::LoadLocal(4))),
                        rhs: Box::new(AstNode::new(AstKind::IntLiteral(2))),
                    })),
                }),
                AstNode::new(AstKind::StoreLocal {
                    offset: 0,
                    value: Box::new(AstNode::new(AstKind::Binary {
                        op: BinOp::Sub,
                        lhs: Box::new(AstNode::new(AstKind::LoadLocal(0))),
                        rhs: Box::new(AstNode::new(AstKind::IntLiteral(1))),
                    })),
                }),
            ]))),
        }),
        AstNode::new(AstKind::Return(Box::new(AstNode::new(AstKind::LoadLocal(4))))),
    ]));
    let bytes = wrap_payload(&tree.encode(), 0, PAYLOAD_AST);
    assert_eq!(run_everywhere(&bytes), 6);
}

#[test]
fn entry_offset_is_honored() {
    let mut builder = ProgramBuilder::new();
    builder.const_i32(111).halt();
    let entry = builder.pos();
    builder.const_i32(222).halt();
    assert_eq!(run_everywhere(&builder.finish(entry)), 222);
}

#[test]
fn call_user_transfers_into_the_callee() {
    let mut builder = ProgramBuilder::new();
    builder.const_i32(20);
    let call_at = builder.pos();
    builder.call_user(0);
    let callee = builder.pos();
    builder.const_i32(2).mul().halt();
    builder.patch_target(call_at + 1, callee);
    assert_eq!(run_everywhere(&builder.finish(0)), 40);
}

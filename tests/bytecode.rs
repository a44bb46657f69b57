mod common;

use common::*;
use delver::bytecode::{decode, relocate, BytecodeError, ExitHandler, Patch};
use delver::classfile::{
    Attribute, ClassFile, CodeAttribute, ExceptionTableEntry, LineNumberEntry, StackMapFrame, VerificationTypeInfo,
};

fn first_method_code(bytes: &[u8]) -> (ClassFile, CodeAttribute) {
    let class = ClassFile::parse(bytes).unwrap();
    let code = class.methods[0].code().unwrap().clone();
    (class, code)
}

fn frames(code: &CodeAttribute) -> &[StackMapFrame] {
    code.attributes
        .iter()
        .find_map(|a| match &a.body {
            Attribute::StackMapTable(frames) => Some(frames.as_slice()),
            _ => None,
        })
        .expect("StackMapTable")
}

fn i32_at(code: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]])
}

fn nops(n: usize) -> Vec<u8> {
    vec![0x00; n]
}

#[test]
fn decodes_variable_length_instructions() {
    // wide iinc 300, 1; wide lload 300; lookupswitch at 10 with one pair; return
    let mut code = vec![0xc4, 0x84, 0x01, 0x2c, 0x00, 0x01, 0xc4, 0x16, 0x01, 0x2c, 0xab, 0x00];
    code.extend_from_slice(&14i32.to_be_bytes());
    code.extend_from_slice(&1i32.to_be_bytes());
    code.extend_from_slice(&7i32.to_be_bytes());
    code.extend_from_slice(&14i32.to_be_bytes());
    code.push(0xb1);

    let insns = decode(&code).unwrap();
    let starts: Vec<(usize, usize)> = insns.iter().map(|i| (i.pc, i.length)).collect();
    assert_eq!(starts, [(0, 6), (6, 4), (10, 18), (28, 1)]);
    assert_eq!(insns[2].targets(), [24, 24]);
}

#[test]
fn rejects_unknown_opcodes_and_truncation() {
    assert_eq!(decode(&[0x00, 0xcb]), Err(BytecodeError::UnknownOpcode { opcode: 0xcb, pc: 1 }));
    assert_eq!(decode(&[0x10]), Err(BytecodeError::Truncated(0)));
    assert_eq!(decode(&[0xc4, 0x00, 0x00, 0x00]), Err(BytecodeError::UnknownOpcode { opcode: 0x00, pc: 1 }));
}

#[test]
fn rejects_branch_into_an_instruction() {
    let bytes = single_method_class("com/example/Bad", "bad", "()V", |_| {
        // goto 1 lands inside the goto itself.
        code_attr(0, 0, &[0xa7, 0x00, 0x01, 0xb1], &[], &[])
    });
    let (class, mut code) = first_method_code(&bytes);
    let err = relocate(&mut code, &class.constant_pool, &[], &Patch::default()).unwrap_err();
    assert_eq!(err, BytecodeError::BadTarget(1));
}

#[test]
fn prologue_shifts_branches_frames_and_debug_ranges() {
    let (class, mut code) = first_method_code(&loop_class());
    let patch = Patch { prologue: nops(3), ..Patch::default() };
    relocate(&mut code, &class.constant_pool, &[], &patch).unwrap();

    // Prologue padded to four bytes, the body follows unchanged.
    assert_eq!(&code.code[..4], &[0, 0, 0, 0]);
    assert_eq!(&code.code[4..], &[0x03, 0x3b, 0x1a, 0x10, 0x0a, 0xa2, 0x00, 0x09, 0x84, 0x00, 0x01, 0xa7, 0xff, 0xf7, 0xb1]);
    assert_eq!((code.max_stack, code.max_locals), (2, 1));

    assert_eq!(
        frames(&code),
        [
            StackMapFrame::Full { offset_delta: 6, locals: vec![VerificationTypeInfo::Integer], stack: vec![] },
            StackMapFrame::Full { offset_delta: 11, locals: vec![VerificationTypeInfo::Integer], stack: vec![] },
        ]
    );

    let lines = code
        .attributes
        .iter()
        .find_map(|a| match &a.body {
            Attribute::LineNumberTable(lines) => Some(lines.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        lines,
        [
            LineNumberEntry { start_pc: 0, line_number: 5 },
            LineNumberEntry { start_pc: 6, line_number: 6 },
            LineNumberEntry { start_pc: 18, line_number: 7 },
        ]
    );

    let locals = code
        .attributes
        .iter()
        .find_map(|a| match &a.body {
            Attribute::LocalVariableTable(locals) => Some(locals.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!((locals[0].start_pc, locals[0].length), (6, 12));
}

#[test]
fn epilogue_precedes_every_return_and_handlers_follow() {
    let (class, mut code) = first_method_code(&guarded_class());
    let throwable = match frames(&code)[0] {
        StackMapFrame::SameLocals1StackItem { stack, .. } => stack,
        ref other => panic!("unexpected {other:?}"),
    };
    let patch = Patch { epilogue: Some(nops(2)), extra_stack: 2, ..Patch::default() };
    relocate(&mut code, &class.constant_pool, &[], &patch).unwrap();

    assert_eq!(code.code, [0x00, 0x00, 0x00, 0xb1, 0x4b, 0x00, 0x00, 0xb1]);
    assert_eq!(code.max_stack, 3);
    assert_eq!(
        code.exception_table,
        [ExceptionTableEntry { start_pc: 0, end_pc: 4, handler_pc: 4, catch_type: 0 }]
    );
    assert_eq!(
        frames(&code),
        [StackMapFrame::Full { offset_delta: 4, locals: vec![], stack: vec![throwable] }]
    );
}

#[test]
fn timer_local_is_declared_in_every_frame() {
    let (class, mut code) = first_method_code(&guarded_class());
    let patch = Patch {
        prologue: nops(8),
        epilogue: Some(nops(1)),
        timer_local: Some(1),
        extra_stack: 5,
        exit_handler: None,
    };
    relocate(&mut code, &class.constant_pool, &[], &patch).unwrap();

    assert_eq!(code.max_locals, 3);
    // prologue 0..8, nop 8, epilogue 9, return 10, handler 11
    assert_eq!(code.exception_table[0].start_pc, 8);
    assert_eq!(code.exception_table[0].handler_pc, 11);
    match &frames(&code)[0] {
        StackMapFrame::Full { offset_delta, locals, .. } => {
            assert_eq!(*offset_delta, 11);
            assert_eq!(locals, &[VerificationTypeInfo::Top, VerificationTypeInfo::Long]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn exit_handler_is_appended_after_the_body() {
    let (class, mut code) = first_method_code(&guarded_class());
    let throwable = match frames(&code)[0] {
        StackMapFrame::SameLocals1StackItem { stack: VerificationTypeInfo::Object(index), .. } => index,
        ref other => panic!("unexpected {other:?}"),
    };
    let patch = Patch {
        epilogue: Some(nops(1)),
        exit_handler: Some(ExitHandler { code: vec![0xbf], max_stack: 1, throwable_class: throwable, stack_map_name: 0 }),
        ..Patch::default()
    };
    relocate(&mut code, &class.constant_pool, &[], &patch).unwrap();

    // nop 0, epilogue 1, return 2, astore_0 3, epilogue 4, return 5, exit handler 6
    assert_eq!(code.code, [0x00, 0x00, 0xb1, 0x4b, 0x00, 0xb1, 0xbf]);
    // The method's own handler still matches first.
    assert_eq!(
        code.exception_table,
        [
            ExceptionTableEntry { start_pc: 0, end_pc: 3, handler_pc: 3, catch_type: 0 },
            ExceptionTableEntry { start_pc: 0, end_pc: 6, handler_pc: 6, catch_type: 0 },
        ]
    );
    let stack = vec![VerificationTypeInfo::Object(throwable)];
    assert_eq!(
        frames(&code),
        [
            StackMapFrame::Full { offset_delta: 3, locals: vec![], stack: stack.clone() },
            StackMapFrame::Full { offset_delta: 2, locals: vec![], stack },
        ]
    );
}

#[test]
fn exit_handler_creates_a_frame_table_when_missing() {
    let bytes = single_method_class("com/example/Thrower", "fail", "()V", |_| code_attr(1, 0, &[0x01, 0xbf], &[], &[]));
    let (class, mut code) = first_method_code(&bytes);
    let mut cp = class.constant_pool.clone();
    let throwable = cp.intern_class("java/lang/Throwable").unwrap();
    let stack_map_name = cp.intern_utf8("StackMapTable").unwrap();
    let patch = Patch {
        exit_handler: Some(ExitHandler { code: vec![0xbf], max_stack: 1, throwable_class: throwable, stack_map_name }),
        ..Patch::default()
    };
    relocate(&mut code, &cp, &[], &patch).unwrap();

    assert_eq!(code.code, [0x01, 0xbf, 0xbf]);
    assert_eq!(code.exception_table, [ExceptionTableEntry { start_pc: 0, end_pc: 2, handler_pc: 2, catch_type: 0 }]);
    let table = code.attributes.last().unwrap();
    assert_eq!(cp.get_utf8(table.name_index).unwrap(), "StackMapTable");
    assert_eq!(
        frames(&code),
        [StackMapFrame::Full { offset_delta: 2, locals: vec![], stack: vec![VerificationTypeInfo::Object(throwable)] }]
    );
    assert_eq!(code.max_stack, 1);
}

#[test]
fn switch_padding_is_recomputed() {
    let (class, mut code) = first_method_code(&switch_class());
    let patch = Patch { epilogue: Some(nops(1)), ..Patch::default() };
    relocate(&mut code, &class.constant_pool, &[VerificationTypeInfo::Integer], &patch).unwrap();

    // iload_0 0, ifne 1, epilogue 4, return 5, iload_0 6, tableswitch 7
    let c = &code.code;
    assert_eq!(c.len(), 28);
    assert_eq!(&c[1..4], &[0x9a, 0x00, 0x05]);
    assert_eq!(c[7], 0xaa);
    // No padding at pc 7: operands start at 8.
    assert_eq!(i32_at(c, 8), 19);
    assert_eq!((i32_at(c, 12), i32_at(c, 16)), (0, 0));
    assert_eq!(i32_at(c, 20), 17);
    assert_eq!(&c[24..], &[0x00, 0xb1, 0x00, 0xb1]);

    let deltas: Vec<u16> = frames(&code).iter().map(StackMapFrame::offset_delta).collect();
    assert_eq!(deltas, [6, 17, 1]);
}

#[test]
fn code_type_annotations_are_dropped() {
    let bytes = single_method_class("com/example/Annotated", "run", "()V", |p| {
        let rvta = p.cp.utf8("RuntimeVisibleTypeAnnotations");
        let other = p.cp.utf8("Custom");
        code_attr(0, 0, &[0xb1], &[], &[(rvta, vec![0, 0]), (other, vec![9])])
    });
    let (class, mut code) = first_method_code(&bytes);
    relocate(&mut code, &class.constant_pool, &[], &Patch { prologue: nops(4), ..Patch::default() }).unwrap();

    let names: Vec<&str> = code.attributes.iter().map(|a| class.attribute_name(a).unwrap()).collect();
    assert_eq!(names, ["Custom"]);
}

fn many_returns_class(returns: usize) -> Vec<u8> {
    single_method_class("com/example/Big", "big", "(I)V", |_| {
        // iload_0; ifeq <last return>; return x N; return
        let offset = (3 + returns) as u16;
        let [hi, lo] = offset.to_be_bytes();
        let mut code = vec![0x1a, 0x99, hi, lo];
        code.extend(std::iter::repeat(0xb1).take(returns + 1));
        code_attr(1, 1, &code, &[], &[])
    })
}

#[test]
fn branch_that_no_longer_fits_is_an_error() {
    let (class, mut code) = first_method_code(&many_returns_class(2000));
    let original = code.clone();
    let patch = Patch { epilogue: Some(nops(20)), ..Patch::default() };
    let err = relocate(&mut code, &class.constant_pool, &[], &patch).unwrap_err();
    assert_eq!(err, BytecodeError::BranchOverflow(1));
    assert_eq!(code, original);
}

#[test]
fn oversized_code_is_an_error() {
    let (class, mut code) = first_method_code(&many_returns_class(2000));
    let patch = Patch { epilogue: Some(nops(40)), ..Patch::default() };
    let err = relocate(&mut code, &class.constant_pool, &[], &patch).unwrap_err();
    assert!(matches!(err, BytecodeError::CodeTooLarge(_)));
}

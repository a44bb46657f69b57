#![allow(dead_code)]

//! Hand-assembled class files for the integration tests.

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_INTERFACE: u16 = 0x0200;

pub struct CpBuilder {
    entries: Vec<Vec<u8>>,
    next: u16,
}

impl CpBuilder {
    pub fn new() -> Self {
        Self { entries: Vec::new(), next: 1 }
    }

    fn push(&mut self, entry: Vec<u8>, slots: u16) -> u16 {
        let index = self.next;
        self.entries.push(entry);
        self.next += slots;
        index
    }

    pub fn utf8(&mut self, s: &str) -> u16 {
        let encoded = delver::classfile::encode_modified_utf8(s);
        let mut entry = vec![1];
        entry.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
        entry.extend_from_slice(&encoded);
        self.push(entry, 1)
    }

    pub fn class(&mut self, name_index: u16) -> u16 {
        let mut entry = vec![7];
        entry.extend_from_slice(&name_index.to_be_bytes());
        self.push(entry, 1)
    }

    pub fn string(&mut self, utf8_index: u16) -> u16 {
        let mut entry = vec![8];
        entry.extend_from_slice(&utf8_index.to_be_bytes());
        self.push(entry, 1)
    }

    pub fn name_and_type(&mut self, name_index: u16, descriptor_index: u16) -> u16 {
        let mut entry = vec![12];
        entry.extend_from_slice(&name_index.to_be_bytes());
        entry.extend_from_slice(&descriptor_index.to_be_bytes());
        self.push(entry, 1)
    }

    pub fn methodref(&mut self, class_index: u16, name_and_type_index: u16) -> u16 {
        let mut entry = vec![10];
        entry.extend_from_slice(&class_index.to_be_bytes());
        entry.extend_from_slice(&name_and_type_index.to_be_bytes());
        self.push(entry, 1)
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        let mut entry = vec![3];
        entry.extend_from_slice(&value.to_be_bytes());
        self.push(entry, 1)
    }

    pub fn float_bits(&mut self, bits: u32) -> u16 {
        let mut entry = vec![4];
        entry.extend_from_slice(&bits.to_be_bytes());
        self.push(entry, 1)
    }

    pub fn long(&mut self, value: i64) -> u16 {
        let mut entry = vec![5];
        entry.extend_from_slice(&value.to_be_bytes());
        self.push(entry, 2)
    }

    pub fn double_bits(&mut self, bits: u64) -> u16 {
        let mut entry = vec![6];
        entry.extend_from_slice(&bits.to_be_bytes());
        self.push(entry, 2)
    }

    fn write(&self, out: &mut Vec<u8>) {
        u2(out, self.next);
        for entry in &self.entries {
            out.extend_from_slice(entry);
        }
    }
}

pub fn u1(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn u2(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn u4(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn push_attr(out: &mut Vec<u8>, name_index: u16, info: &[u8]) {
    u2(out, name_index);
    u4(out, info.len() as u32);
    out.extend_from_slice(info);
}

/// Body of a `Code` attribute.
pub fn code_attr(
    max_stack: u16,
    max_locals: u16,
    code: &[u8],
    exceptions: &[(u16, u16, u16, u16)],
    attributes: &[(u16, Vec<u8>)],
) -> Vec<u8> {
    let mut out = Vec::new();
    u2(&mut out, max_stack);
    u2(&mut out, max_locals);
    u4(&mut out, code.len() as u32);
    out.extend_from_slice(code);
    u2(&mut out, exceptions.len() as u16);
    for (start, end, handler, catch_type) in exceptions {
        u2(&mut out, *start);
        u2(&mut out, *end);
        u2(&mut out, *handler);
        u2(&mut out, *catch_type);
    }
    u2(&mut out, attributes.len() as u16);
    for (name, info) in attributes {
        push_attr(&mut out, *name, info);
    }
    out
}

pub struct Member {
    pub access: u16,
    pub name: u16,
    pub descriptor: u16,
    pub attributes: Vec<(u16, Vec<u8>)>,
}

pub struct ClassSpec {
    pub major: u16,
    pub access: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub fields: Vec<Member>,
    pub methods: Vec<Member>,
    pub attributes: Vec<(u16, Vec<u8>)>,
}

fn write_members(out: &mut Vec<u8>, members: &[Member]) {
    u2(out, members.len() as u16);
    for m in members {
        u2(out, m.access);
        u2(out, m.name);
        u2(out, m.descriptor);
        u2(out, m.attributes.len() as u16);
        for (name, info) in &m.attributes {
            push_attr(out, *name, info);
        }
    }
}

pub fn assemble(cp: &CpBuilder, spec: &ClassSpec) -> Vec<u8> {
    let mut out = Vec::new();
    u4(&mut out, 0xCAFE_BABE);
    u2(&mut out, 0);
    u2(&mut out, spec.major);
    cp.write(&mut out);
    u2(&mut out, spec.access);
    u2(&mut out, spec.this_class);
    u2(&mut out, spec.super_class);
    u2(&mut out, 0);
    write_members(&mut out, &spec.fields);
    write_members(&mut out, &spec.methods);
    u2(&mut out, spec.attributes.len() as u16);
    for (name, info) in &spec.attributes {
        push_attr(&mut out, *name, info);
    }
    out
}

/// `StackMapTable` body from already-encoded frames.
pub fn stack_map(frames: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    u2(&mut out, frames.len() as u16);
    for frame in frames {
        out.extend_from_slice(frame);
    }
    out
}

/// Constant pool indexes shared by the fixtures below.
pub struct Pool {
    pub cp: CpBuilder,
    pub this_class: u16,
    pub object_class: u16,
    pub code: u16,
    pub stack_map: u16,
    pub line_numbers: u16,
    pub local_variables: u16,
}

pub fn pool(class_name: &str) -> Pool {
    let mut cp = CpBuilder::new();
    let this_name = cp.utf8(class_name);
    let this_class = cp.class(this_name);
    let object_name = cp.utf8("java/lang/Object");
    let object_class = cp.class(object_name);
    let code = cp.utf8("Code");
    let stack_map = cp.utf8("StackMapTable");
    let line_numbers = cp.utf8("LineNumberTable");
    let local_variables = cp.utf8("LocalVariableTable");
    Pool { cp, this_class, object_class, code, stack_map, line_numbers, local_variables }
}

/// `public abstract class com.example.Foo` with a constructor, a concrete
/// `public void bar()` and an abstract `public abstract void baz()`.
pub fn foo_class() -> Vec<u8> {
    let mut p = pool("com/example/Foo");
    let init = p.cp.utf8("<init>");
    let void = p.cp.utf8("()V");
    let init_nat = p.cp.name_and_type(init, void);
    let object_init = p.cp.methodref(p.object_class, init_nat);
    let bar = p.cp.utf8("bar");
    let baz = p.cp.utf8("baz");

    let [hi, lo] = object_init.to_be_bytes();
    let init_code = code_attr(1, 1, &[0x2a, 0xb7, hi, lo, 0xb1], &[], &[]);
    let bar_code = code_attr(0, 1, &[0xb1], &[], &[(p.line_numbers, line_numbers(&[(0, 10)]))]);

    let spec = ClassSpec {
        major: 52,
        access: ACC_PUBLIC | ACC_SUPER | ACC_ABSTRACT,
        this_class: p.this_class,
        super_class: p.object_class,
        fields: vec![],
        methods: vec![
            Member { access: ACC_PUBLIC, name: init, descriptor: void, attributes: vec![(p.code, init_code)] },
            Member { access: ACC_PUBLIC, name: bar, descriptor: void, attributes: vec![(p.code, bar_code)] },
            Member { access: ACC_PUBLIC | ACC_ABSTRACT, name: baz, descriptor: void, attributes: vec![] },
        ],
        attributes: vec![],
    };
    assemble(&p.cp, &spec)
}

pub fn line_numbers(entries: &[(u16, u16)]) -> Vec<u8> {
    let mut out = Vec::new();
    u2(&mut out, entries.len() as u16);
    for (pc, line) in entries {
        u2(&mut out, *pc);
        u2(&mut out, *line);
    }
    out
}

/// A class with one static method `name descriptor` and the given body.
pub fn single_method_class(
    class_name: &str,
    name: &str,
    descriptor: &str,
    code: impl FnOnce(&mut Pool) -> Vec<u8>,
) -> Vec<u8> {
    let mut p = pool(class_name);
    let name = p.cp.utf8(name);
    let descriptor = p.cp.utf8(descriptor);
    let body = code(&mut p);
    let spec = ClassSpec {
        major: 52,
        access: ACC_PUBLIC | ACC_SUPER,
        this_class: p.this_class,
        super_class: p.object_class,
        fields: vec![],
        methods: vec![Member {
            access: ACC_PUBLIC | ACC_STATIC,
            name,
            descriptor,
            attributes: vec![(p.code, body)],
        }],
        attributes: vec![],
    };
    assemble(&p.cp, &spec)
}

/// `static void count()`: counts slot 0 from 0 to 10.
///
/// ```text
///  0: iconst_0
///  1: istore_0
///  2: iload_0          <- frame: append [int]
///  3: bipush 10
///  5: if_icmpge 14
///  8: iinc 0, 1
/// 11: goto 2
/// 14: return           <- frame: same
/// ```
pub fn loop_class() -> Vec<u8> {
    single_method_class("com/example/Loop", "count", "()V", |p| {
        let i_name = p.cp.utf8("i");
        let i_desc = p.cp.utf8("I");
        let code = [
            0x03, 0x3b, 0x1a, 0x10, 0x0a, 0xa2, 0x00, 0x09, 0x84, 0x00, 0x01, 0xa7, 0xff, 0xf7, 0xb1,
        ];
        let frames = stack_map(&[&[252, 0x00, 0x02, 1], &[11]]);
        let mut lvt = Vec::new();
        u2(&mut lvt, 1);
        for v in [2u16, 12, i_name, i_desc, 0] {
            u2(&mut lvt, v);
        }
        code_attr(
            2,
            1,
            &code,
            &[],
            &[
                (p.stack_map, frames),
                (p.line_numbers, line_numbers(&[(0, 5), (2, 6), (14, 7)])),
                (p.local_variables, lvt),
            ],
        )
    })
}

/// `static void guarded()`: a `nop` protected by a catch-all handler.
///
/// ```text
/// 0: nop
/// 1: return
/// 2: astore_0          <- handler, frame: [] / [Throwable]
/// 3: return
/// ```
pub fn guarded_class() -> Vec<u8> {
    single_method_class("com/example/Guarded", "guarded", "()V", |p| {
        let throwable_name = p.cp.utf8("java/lang/Throwable");
        let throwable = p.cp.class(throwable_name);
        let [hi, lo] = throwable.to_be_bytes();
        let frames = stack_map(&[&[64 + 2, 7, hi, lo]]);
        code_attr(1, 1, &[0x00, 0xb1, 0x4b, 0xb1], &[(0, 2, 2, 0)], &[(p.stack_map, frames)])
    })
}

/// `static void pick(int)`: a return before a `tableswitch`, so inserting
/// code at the return moves the switch.
///
/// ```text
///  0: iload_0
///  1: ifne 5
///  4: return
///  5: iload_0          <- frame: same
///  6: tableswitch [0: 24] default 25   (1 byte of padding)
/// 24: return           <- frame: same
/// 25: return           <- frame: same
/// ```
pub fn switch_class() -> Vec<u8> {
    single_method_class("com/example/Switch", "pick", "(I)V", |p| {
        let mut code = vec![0x1a, 0x9a, 0x00, 0x04, 0xb1, 0x1a, 0xaa, 0x00];
        code.extend_from_slice(&19i32.to_be_bytes());
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&18i32.to_be_bytes());
        code.extend_from_slice(&[0xb1, 0xb1]);
        assert_eq!(code.len(), 26);
        let frames = stack_map(&[&[5], &[18], &[0]]);
        code_attr(1, 1, &code, &[], &[(p.stack_map, frames)])
    })
}

//! Code body relocation.
//!
//! [`relocate`] splices a prologue at method entry and, optionally, an
//! epilogue before every normal return, then lays the body out again:
//! branch offsets and switch padding are recomputed, and every table that
//! holds a pc (exception table, line numbers, local variable ranges, stack
//! map frames) is remapped to the new positions.
//!
//! Branches that targeted pc 0 land after the prologue, so a loop back to
//! the top of a method does not run it twice. Branches that targeted a
//! return land on the epilogue in front of it.
//!
//! Stack map frames are re-encoded as full frames. When the patch keeps a
//! timer in a local slot, every frame declares that slot as `long`, padded
//! with `top` up to it.
//!
//! An optional exit handler is appended after the body and registered last
//! in the exception table, catching anything thrown past the prologue that
//! the method's own handlers let through.

use crate::classfile::{
    Attribute, AttributeInfo, CodeAttribute, ConstantPool, ExceptionTableEntry, StackMapFrame,
    VerificationTypeInfo,
};
use thiserror::Error;

pub mod opcodes {
    pub const NOP: u8 = 0x00;
    pub const LDC_W: u8 = 0x13;
    pub const LLOAD: u8 = 0x16;
    pub const LSTORE: u8 = 0x37;
    pub const IINC: u8 = 0x84;
    pub const GOTO: u8 = 0xa7;
    pub const TABLESWITCH: u8 = 0xaa;
    pub const LOOKUPSWITCH: u8 = 0xab;
    pub const IRETURN: u8 = 0xac;
    pub const RETURN: u8 = 0xb1;
    pub const ATHROW: u8 = 0xbf;
    pub const INVOKESTATIC: u8 = 0xb8;
    pub const WIDE: u8 = 0xc4;
    pub const GOTO_W: u8 = 0xc8;
    pub const JSR_W: u8 = 0xc9;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BytecodeError {
    #[error("truncated instruction at pc {0}")]
    Truncated(usize),
    #[error("unknown opcode {opcode:#04x} at pc {pc}")]
    UnknownOpcode { opcode: u8, pc: usize },
    #[error("malformed switch at pc {0}")]
    MalformedSwitch(usize),
    #[error("pc {0} is not an instruction boundary")]
    BadTarget(i64),
    #[error("branch at pc {0} no longer fits in 16 bits")]
    BranchOverflow(usize),
    #[error("code grew to {0} bytes")]
    CodeTooLarge(usize),
    #[error("stack map: {0}")]
    InvalidFrame(String),
    #[error("{0} overflows u16")]
    Overflow(&'static str),
}

pub type Result<T> = std::result::Result<T, BytecodeError>;

pub fn is_return(opcode: u8) -> bool {
    (opcodes::IRETURN..=opcodes::RETURN).contains(&opcode)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    /// No pc-relative operands; copied verbatim.
    Plain,
    Branch { target: usize },
    BranchWide { target: usize },
    TableSwitch { default: usize, low: i32, high: i32, targets: Vec<usize> },
    LookupSwitch { default: usize, pairs: Vec<(i32, usize)> },
}

/// One decoded instruction. Branch targets are absolute pcs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub pc: usize,
    pub opcode: u8,
    pub length: usize,
    op: Op,
}

impl Instruction {
    pub fn targets(&self) -> Vec<usize> {
        match &self.op {
            Op::Plain => Vec::new(),
            Op::Branch { target } | Op::BranchWide { target } => vec![*target],
            Op::TableSwitch { default, targets, .. } => {
                std::iter::once(*default).chain(targets.iter().copied()).collect()
            }
            Op::LookupSwitch { default, pairs } => {
                std::iter::once(*default).chain(pairs.iter().map(|(_, t)| *t)).collect()
            }
        }
    }
}

fn fixed_length(opcode: u8) -> Option<usize> {
    Some(match opcode {
        0x00..=0x0f => 1,
        0x10 => 2,
        0x11 => 3,
        0x12 => 2,
        0x13 | 0x14 => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        0x84 => 3,
        0x85..=0x98 => 1,
        0xa9 => 2,
        0xac..=0xb1 => 1,
        0xb2..=0xb8 => 3,
        0xb9 | 0xba => 5,
        0xbb => 3,
        0xbc => 2,
        0xbd => 3,
        0xbe | 0xbf => 1,
        0xc0 | 0xc1 => 3,
        0xc2 | 0xc3 => 1,
        0xc5 => 4,
        _ => return None,
    })
}

/// Padding after a switch opcode at `pc` so its operands start 4-aligned.
fn switch_padding(pc: usize) -> usize {
    (4 - (pc + 1) % 4) % 4
}

fn read_i16(code: &[u8], at: usize, pc: usize) -> Result<i16> {
    let b = code.get(at..at + 2).ok_or(BytecodeError::Truncated(pc))?;
    Ok(i16::from_be_bytes([b[0], b[1]]))
}

fn read_i32(code: &[u8], at: usize, pc: usize) -> Result<i32> {
    let b = code.get(at..at + 4).ok_or(BytecodeError::Truncated(pc))?;
    Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn resolve(pc: usize, offset: i64) -> Result<usize> {
    let target = pc as i64 + offset;
    usize::try_from(target).map_err(|_| BytecodeError::BadTarget(target))
}

/// Decodes a code array into instructions.
pub fn decode(code: &[u8]) -> Result<Vec<Instruction>> {
    let mut out = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let opcode = code[pc];
        let (length, op) = match opcode {
            0x99..=0xa8 | 0xc6 | 0xc7 => {
                let offset = read_i16(code, pc + 1, pc)?;
                (3, Op::Branch { target: resolve(pc, offset as i64)? })
            }
            opcodes::GOTO_W | opcodes::JSR_W => {
                let offset = read_i32(code, pc + 1, pc)?;
                (5, Op::BranchWide { target: resolve(pc, offset as i64)? })
            }
            opcodes::TABLESWITCH => {
                let base = pc + 1 + switch_padding(pc);
                let default = resolve(pc, read_i32(code, base, pc)? as i64)?;
                let low = read_i32(code, base + 4, pc)?;
                let high = read_i32(code, base + 8, pc)?;
                if high < low {
                    return Err(BytecodeError::MalformedSwitch(pc));
                }
                let count = (high as i64 - low as i64 + 1) as usize;
                if base + 12 + count.saturating_mul(4) > code.len() {
                    return Err(BytecodeError::Truncated(pc));
                }
                let mut targets = Vec::with_capacity(count);
                for i in 0..count {
                    targets.push(resolve(pc, read_i32(code, base + 12 + i * 4, pc)? as i64)?);
                }
                (base + 12 + count * 4 - pc, Op::TableSwitch { default, low, high, targets })
            }
            opcodes::LOOKUPSWITCH => {
                let base = pc + 1 + switch_padding(pc);
                let default = resolve(pc, read_i32(code, base, pc)? as i64)?;
                let npairs = read_i32(code, base + 4, pc)?;
                let count = usize::try_from(npairs).map_err(|_| BytecodeError::MalformedSwitch(pc))?;
                if base + 8 + count.saturating_mul(8) > code.len() {
                    return Err(BytecodeError::Truncated(pc));
                }
                let mut pairs = Vec::with_capacity(count);
                for i in 0..count {
                    let key = read_i32(code, base + 8 + i * 8, pc)?;
                    let target = resolve(pc, read_i32(code, base + 12 + i * 8, pc)? as i64)?;
                    pairs.push((key, target));
                }
                (base + 8 + count * 8 - pc, Op::LookupSwitch { default, pairs })
            }
            opcodes::WIDE => {
                let modified = *code.get(pc + 1).ok_or(BytecodeError::Truncated(pc))?;
                let length = match modified {
                    opcodes::IINC => 6,
                    0x15..=0x19 | 0x36..=0x3a | 0xa9 => 4,
                    _ => return Err(BytecodeError::UnknownOpcode { opcode: modified, pc: pc + 1 }),
                };
                (length, Op::Plain)
            }
            _ => {
                let length = fixed_length(opcode).ok_or(BytecodeError::UnknownOpcode { opcode, pc })?;
                (length, Op::Plain)
            }
        };
        if pc + length > code.len() {
            return Err(BytecodeError::Truncated(pc));
        }
        out.push(Instruction { pc, opcode, length, op });
        pc += length;
    }
    Ok(out)
}

/// What to splice into one method body.
#[derive(Debug, Clone, Default)]
pub struct Patch {
    /// Runs once at entry. Padded with `nop` to a multiple of four bytes.
    pub prologue: Vec<u8>,
    /// Runs before every `*return`. Must not branch.
    pub epilogue: Option<Vec<u8>>,
    /// Local slot holding a `long` from the prologue to every return.
    pub timer_local: Option<u16>,
    /// Operand stack growth caused by the inserted code.
    pub extra_stack: u16,
    pub exit_handler: Option<ExitHandler>,
}

/// Catch-all handler covering the body after the prologue.
#[derive(Debug, Clone)]
pub struct ExitHandler {
    /// Entered with the exception on the stack. Must end by throwing.
    pub code: Vec<u8>,
    /// Operand stack the handler needs, the exception included.
    pub max_stack: u16,
    /// `java/lang/Throwable` class constant, for the handler's frame.
    pub throwable_class: u16,
    /// `StackMapTable` name constant, used when the method has no table.
    pub stack_map_name: u16,
}

/// Old pc to new pc mapping produced by one layout pass.
struct Layout {
    old_len: usize,
    /// End of the relocated body; an exit handler starts here.
    body_len: usize,
    prologue_len: usize,
    /// Index into `insns` for every old pc that starts an instruction.
    index: Vec<Option<usize>>,
    /// New pc of each instruction.
    insn_pc: Vec<usize>,
    /// New pc where control enters an instruction: the epilogue in front of
    /// a return, otherwise the instruction itself.
    entry_pc: Vec<usize>,
}

impl Layout {
    fn slot(&self, old: usize) -> Result<usize> {
        self.index
            .get(old)
            .copied()
            .flatten()
            .ok_or(BytecodeError::BadTarget(old as i64))
    }

    /// Where a jump to `old` goes.
    fn target(&self, old: usize) -> Result<usize> {
        Ok(self.entry_pc[self.slot(old)?])
    }

    /// Position of the instruction that was at `old`.
    fn instruction(&self, old: usize) -> Result<usize> {
        Ok(self.insn_pc[self.slot(old)?])
    }

    /// Exclusive end of a range.
    fn end(&self, old: usize) -> Result<usize> {
        if old == self.old_len {
            Ok(self.body_len)
        } else {
            self.target(old)
        }
    }

    /// Start of a debug range. Ranges from pc 0 keep covering the prologue.
    fn debug_start(&self, old: usize) -> Result<usize> {
        if old == 0 {
            Ok(0)
        } else {
            self.target(old)
        }
    }
}

fn to_u16(value: usize, what: &'static str) -> Result<u16> {
    u16::try_from(value).map_err(|_| BytecodeError::Overflow(what))
}

/// Applies `patch` to `code`.
///
/// `initial_locals` is the implicit frame at method entry (see
/// [`crate::descriptor::initial_locals`]); it seeds the stack map decoder.
/// On error `code` is left untouched.
pub fn relocate(
    code: &mut CodeAttribute,
    cp: &ConstantPool,
    initial_locals: &[VerificationTypeInfo],
    patch: &Patch,
) -> Result<()> {
    let insns = decode(&code.code)?;

    let mut index = vec![None; code.code.len() + 1];
    for (i, insn) in insns.iter().enumerate() {
        index[insn.pc] = Some(i);
    }
    for insn in &insns {
        for target in insn.targets() {
            if index.get(target).copied().flatten().is_none() {
                return Err(BytecodeError::BadTarget(target as i64));
            }
        }
    }

    let mut prologue = patch.prologue.clone();
    while prologue.len() % 4 != 0 {
        prologue.push(opcodes::NOP);
    }
    let epilogue = patch.epilogue.as_deref().unwrap_or(&[]);

    // Layout pass. Only switch sizes depend on position.
    let mut insn_pc = Vec::with_capacity(insns.len());
    let mut entry_pc = Vec::with_capacity(insns.len());
    let mut pc = prologue.len();
    for insn in &insns {
        entry_pc.push(pc);
        if is_return(insn.opcode) {
            pc += epilogue.len();
        }
        insn_pc.push(pc);
        pc += match &insn.op {
            Op::TableSwitch { targets, .. } => 1 + switch_padding(pc) + 12 + targets.len() * 4,
            Op::LookupSwitch { pairs, .. } => 1 + switch_padding(pc) + 8 + pairs.len() * 8,
            _ => insn.length,
        };
    }
    let body_len = pc;
    let total_len = body_len + patch.exit_handler.as_ref().map_or(0, |h| h.code.len());
    if total_len > u16::MAX as usize {
        return Err(BytecodeError::CodeTooLarge(total_len));
    }
    let layout = Layout {
        old_len: code.code.len(),
        body_len,
        prologue_len: prologue.len(),
        index,
        insn_pc,
        entry_pc,
    };

    let mut new_code = emit(&code.code, &insns, &layout, &prologue, epilogue)?;
    let mut exception_table = remap_exception_table(&code.exception_table, &layout)?;

    // The handler's frame: nothing known about the locals but the timer.
    let handler_frame = match &patch.exit_handler {
        Some(handler) => {
            new_code.extend_from_slice(&handler.code);
            exception_table.push(ExceptionTableEntry {
                start_pc: to_u16(layout.prologue_len, "exit handler start")?,
                end_pc: to_u16(body_len, "exit handler end")?,
                handler_pc: to_u16(body_len, "exit handler")?,
                catch_type: 0,
            });
            let locals = match patch.timer_local {
                Some(slot) => with_timer(Vec::new(), slot)?,
                None => Vec::new(),
            };
            Some((body_len, locals, vec![VerificationTypeInfo::Object(handler.throwable_class)]))
        }
        None => None,
    };

    let mut has_frames = false;
    let mut attributes = Vec::with_capacity(code.attributes.len() + 1);
    for attr in &code.attributes {
        let body = match &attr.body {
            Attribute::StackMapTable(frames) => {
                has_frames = true;
                Attribute::StackMapTable(remap_frames(
                    frames,
                    initial_locals,
                    &layout,
                    patch.timer_local,
                    handler_frame.clone(),
                )?)
            }
            Attribute::LineNumberTable(entries) => {
                let mut out = entries.clone();
                for e in &mut out {
                    e.start_pc = to_u16(layout.debug_start(e.start_pc as usize)?, "line number pc")?;
                }
                Attribute::LineNumberTable(out)
            }
            Attribute::LocalVariableTable(entries) | Attribute::LocalVariableTypeTable(entries) => {
                let mut out = entries.clone();
                for e in &mut out {
                    let start = layout.debug_start(e.start_pc as usize)?;
                    let end = layout.end(e.start_pc as usize + e.length as usize)?;
                    e.start_pc = to_u16(start, "local variable pc")?;
                    e.length = to_u16(end - start, "local variable length")?;
                }
                if matches!(attr.body, Attribute::LocalVariableTable(_)) {
                    Attribute::LocalVariableTable(out)
                } else {
                    Attribute::LocalVariableTypeTable(out)
                }
            }
            Attribute::Raw(_) => {
                // Type annotations on code carry offsets this pass does not track.
                let name = cp.get_utf8(attr.name_index).unwrap_or("");
                if name == "RuntimeVisibleTypeAnnotations" || name == "RuntimeInvisibleTypeAnnotations" {
                    continue;
                }
                attr.body.clone()
            }
            Attribute::Code(_) => attr.body.clone(),
        };
        attributes.push(AttributeInfo { name_index: attr.name_index, body });
    }
    if let (Some(frame), Some(handler), false) = (handler_frame, &patch.exit_handler, has_frames) {
        attributes.push(AttributeInfo {
            name_index: handler.stack_map_name,
            body: Attribute::StackMapTable(encode_full(vec![frame])?),
        });
    }

    let max_locals = match patch.timer_local {
        Some(slot) => code.max_locals.max(to_u16(slot as usize + 2, "max_locals")?),
        None => code.max_locals,
    };
    let mut max_stack = code
        .max_stack
        .checked_add(patch.extra_stack)
        .ok_or(BytecodeError::Overflow("max_stack"))?;
    if let Some(handler) = &patch.exit_handler {
        max_stack = max_stack.max(handler.max_stack);
    }

    code.code = new_code;
    code.exception_table = exception_table;
    code.attributes = attributes;
    code.max_locals = max_locals;
    code.max_stack = max_stack;
    Ok(())
}

fn emit(old: &[u8], insns: &[Instruction], layout: &Layout, prologue: &[u8], epilogue: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(layout.body_len);
    out.extend_from_slice(prologue);

    for (i, insn) in insns.iter().enumerate() {
        if is_return(insn.opcode) {
            out.extend_from_slice(epilogue);
        }
        let here = layout.insn_pc[i];
        debug_assert_eq!(out.len(), here);
        let rel = |target: usize| -> Result<i64> { Ok(layout.target(target)? as i64 - here as i64) };

        match &insn.op {
            Op::Plain => out.extend_from_slice(&old[insn.pc..insn.pc + insn.length]),
            Op::Branch { target } => {
                let offset = i16::try_from(rel(*target)?).map_err(|_| BytecodeError::BranchOverflow(insn.pc))?;
                out.push(insn.opcode);
                out.extend_from_slice(&offset.to_be_bytes());
            }
            Op::BranchWide { target } => {
                out.push(insn.opcode);
                out.extend_from_slice(&(rel(*target)? as i32).to_be_bytes());
            }
            Op::TableSwitch { default, low, high, targets } => {
                out.push(insn.opcode);
                out.extend(std::iter::repeat(0).take(switch_padding(here)));
                out.extend_from_slice(&(rel(*default)? as i32).to_be_bytes());
                out.extend_from_slice(&low.to_be_bytes());
                out.extend_from_slice(&high.to_be_bytes());
                for target in targets {
                    out.extend_from_slice(&(rel(*target)? as i32).to_be_bytes());
                }
            }
            Op::LookupSwitch { default, pairs } => {
                out.push(insn.opcode);
                out.extend(std::iter::repeat(0).take(switch_padding(here)));
                out.extend_from_slice(&(rel(*default)? as i32).to_be_bytes());
                out.extend_from_slice(&(pairs.len() as i32).to_be_bytes());
                for (key, target) in pairs {
                    out.extend_from_slice(&key.to_be_bytes());
                    out.extend_from_slice(&(rel(*target)? as i32).to_be_bytes());
                }
            }
        }
    }
    Ok(out)
}

fn remap_exception_table(table: &[ExceptionTableEntry], layout: &Layout) -> Result<Vec<ExceptionTableEntry>> {
    table
        .iter()
        .map(|e| {
            Ok(ExceptionTableEntry {
                start_pc: to_u16(layout.target(e.start_pc as usize)?, "exception start")?,
                end_pc: to_u16(layout.end(e.end_pc as usize)?, "exception end")?,
                handler_pc: to_u16(layout.target(e.handler_pc as usize)?, "exception handler")?,
                catch_type: e.catch_type,
            })
        })
        .collect()
}

/// A decoded frame: absolute pc, locals, stack.
type AbsoluteFrame = (usize, Vec<VerificationTypeInfo>, Vec<VerificationTypeInfo>);

fn absolute_frames(frames: &[StackMapFrame], initial_locals: &[VerificationTypeInfo]) -> Result<Vec<AbsoluteFrame>> {
    let mut locals = initial_locals.to_vec();
    let mut out = Vec::with_capacity(frames.len());
    let mut pc: i64 = -1;
    for frame in frames {
        pc += frame.offset_delta() as i64 + 1;
        let stack = match frame {
            StackMapFrame::Same { .. } | StackMapFrame::SameExtended { .. } => Vec::new(),
            StackMapFrame::SameLocals1StackItem { stack, .. }
            | StackMapFrame::SameLocals1StackItemExtended { stack, .. } => vec![*stack],
            StackMapFrame::Chop { k, .. } => {
                let k = *k as usize;
                if k > locals.len() {
                    return Err(BytecodeError::InvalidFrame(format!("chop {k} at pc {pc}")));
                }
                locals.truncate(locals.len() - k);
                Vec::new()
            }
            StackMapFrame::Append { locals: extra, .. } => {
                locals.extend_from_slice(extra);
                Vec::new()
            }
            StackMapFrame::Full { locals: full, stack, .. } => {
                locals = full.clone();
                stack.clone()
            }
        };
        out.push((pc as usize, locals.clone(), stack));
    }
    Ok(out)
}

fn remap_verification(info: VerificationTypeInfo, layout: &Layout) -> Result<VerificationTypeInfo> {
    Ok(match info {
        VerificationTypeInfo::Uninitialized(offset) => {
            VerificationTypeInfo::Uninitialized(to_u16(layout.instruction(offset as usize)?, "uninitialized offset")?)
        }
        other => other,
    })
}

fn with_timer(mut locals: Vec<VerificationTypeInfo>, slot: u16) -> Result<Vec<VerificationTypeInfo>> {
    let mut width: usize = locals.iter().map(|l| if l.is_wide() { 2 } else { 1 }).sum();
    if width > slot as usize {
        return Err(BytecodeError::InvalidFrame(format!("locals reach past slot {slot}")));
    }
    while width < slot as usize {
        locals.push(VerificationTypeInfo::Top);
        width += 1;
    }
    locals.push(VerificationTypeInfo::Long);
    Ok(locals)
}

fn remap_frames(
    frames: &[StackMapFrame],
    initial_locals: &[VerificationTypeInfo],
    layout: &Layout,
    timer_local: Option<u16>,
    trailing: Option<AbsoluteFrame>,
) -> Result<Vec<StackMapFrame>> {
    let mut remapped = Vec::with_capacity(frames.len() + 1);
    for (old_pc, locals, stack) in absolute_frames(frames, initial_locals)? {
        let pc = layout.target(old_pc).map_err(|_| {
            BytecodeError::InvalidFrame(format!("frame at pc {old_pc} is not on an instruction"))
        })?;
        debug_assert!(pc >= layout.prologue_len);

        let mut locals = locals
            .into_iter()
            .map(|l| remap_verification(l, layout))
            .collect::<Result<Vec<_>>>()?;
        if let Some(slot) = timer_local {
            locals = with_timer(locals, slot)?;
        }
        let stack = stack
            .into_iter()
            .map(|s| remap_verification(s, layout))
            .collect::<Result<Vec<_>>>()?;
        remapped.push((pc, locals, stack));
    }
    remapped.extend(trailing);
    encode_full(remapped)
}

/// Encodes frames at ascending absolute pcs as full frames.
fn encode_full(frames: Vec<AbsoluteFrame>) -> Result<Vec<StackMapFrame>> {
    let mut out = Vec::with_capacity(frames.len());
    let mut previous: Option<usize> = None;
    for (pc, locals, stack) in frames {
        let offset_delta = match previous {
            None => pc,
            Some(prev) if pc > prev => pc - prev - 1,
            Some(_) => return Err(BytecodeError::InvalidFrame(format!("frames out of order at pc {pc}"))),
        };
        previous = Some(pc);
        out.push(StackMapFrame::Full {
            offset_delta: to_u16(offset_delta, "frame offset")?,
            locals,
            stack,
        });
    }
    Ok(out)
}

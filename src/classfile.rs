//! Class file model: parse, mutate and re-serialize `.class` files
//! (Java 1.1 through 27).
//!
//! Only what the instrumenter touches is decoded. The `Code` attribute of
//! each method is parsed together with its pc-bearing sub-attributes
//! (`StackMapTable`, `LineNumberTable`, `LocalVariableTable`,
//! `LocalVariableTypeTable`); every other attribute is carried as raw bytes
//! under its original name index. A class parsed and written back without
//! changes is byte-identical to its input.
//!
//! Constant pool strings are stored decoded; the JVM's modified UTF-8 is
//! handled by [`decode_modified_utf8`] and [`encode_modified_utf8`].

use thiserror::Error;

pub const MAGIC: u32 = 0xCAFE_BABE;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_PROTECTED: u16 = 0x0004;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SYNCHRONIZED: u16 = 0x0020;
/// Class flag sharing the bit of `ACC_SYNCHRONIZED`.
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_BRIDGE: u16 = 0x0040;
pub const ACC_VARARGS: u16 = 0x0080;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_STRICT: u16 = 0x0800;
pub const ACC_SYNTHETIC: u16 = 0x1000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassFileError {
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("invalid magic: {0:#x}")]
    InvalidMagic(u32),
    #[error("invalid constant pool index: {0}")]
    InvalidConstantPoolIndex(u16),
    #[error("invalid constant pool tag: {0}")]
    InvalidConstantPoolTag(u8),
    #[error("invalid modified UTF-8")]
    InvalidUtf8,
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),
    #[error("trailing bytes after class file: {0}")]
    TrailingBytes(usize),
    #[error("constant pool is full")]
    ConstantPoolOverflow,
    #[error("{0} exceeds the class file format limit")]
    TooLarge(&'static str),
}

pub type Result<T> = std::result::Result<T, ClassFileError>;

#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

impl MethodInfo {
    pub fn code(&self) -> Option<&CodeAttribute> {
        self.attributes.iter().find_map(|a| match &a.body {
            Attribute::Code(code) => Some(code),
            _ => None,
        })
    }

    pub fn code_mut(&mut self) -> Option<&mut CodeAttribute> {
        self.attributes.iter_mut().find_map(|a| match &mut a.body {
            Attribute::Code(code) => Some(code),
            _ => None,
        })
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags & ACC_ABSTRACT != 0
    }

    pub fn is_native(&self) -> bool {
        self.access_flags & ACC_NATIVE != 0
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }
}

/// One attribute, keyed by the constant pool index of its name.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeInfo {
    pub name_index: u16,
    pub body: Attribute,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Code(CodeAttribute),
    StackMapTable(Vec<StackMapFrame>),
    LineNumberTable(Vec<LineNumberEntry>),
    LocalVariableTable(Vec<LocalVariableEntry>),
    /// Same layout as `LocalVariableTable`; `descriptor_index` holds the
    /// generic signature.
    LocalVariableTypeTable(Vec<LocalVariableEntry>),
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackMapFrame {
    Same { offset_delta: u16 },
    SameLocals1StackItem { offset_delta: u16, stack: VerificationTypeInfo },
    SameLocals1StackItemExtended { offset_delta: u16, stack: VerificationTypeInfo },
    Chop { offset_delta: u16, k: u8 },
    SameExtended { offset_delta: u16 },
    Append { offset_delta: u16, locals: Vec<VerificationTypeInfo> },
    Full { offset_delta: u16, locals: Vec<VerificationTypeInfo>, stack: Vec<VerificationTypeInfo> },
}

impl StackMapFrame {
    pub fn offset_delta(&self) -> u16 {
        match self {
            StackMapFrame::Same { offset_delta }
            | StackMapFrame::SameLocals1StackItem { offset_delta, .. }
            | StackMapFrame::SameLocals1StackItemExtended { offset_delta, .. }
            | StackMapFrame::Chop { offset_delta, .. }
            | StackMapFrame::SameExtended { offset_delta }
            | StackMapFrame::Append { offset_delta, .. }
            | StackMapFrame::Full { offset_delta, .. } => *offset_delta,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationTypeInfo {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    Uninitialized(u16),
}

impl VerificationTypeInfo {
    /// Long and Double occupy two local slots.
    pub fn is_wide(&self) -> bool {
        matches!(self, VerificationTypeInfo::Long | VerificationTypeInfo::Double)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumberEntry {
    pub start_pc: u16,
    pub line_number: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVariableEntry {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub index: u16,
}

// =============================================================================
// Constant pool
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum CpInfo {
    Utf8(String),
    Integer(i32),
    /// Raw IEEE-754 bits, so NaN payloads survive a round trip.
    Float(u32),
    Long(i64),
    /// Raw IEEE-754 bits.
    Double(u64),
    Class { name_index: u16 },
    String { string_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

impl CpInfo {
    fn is_wide(&self) -> bool {
        matches!(self, CpInfo::Long(_) | CpInfo::Double(_))
    }
}

/// Constant pool with 1-based indexing. Slot 0 and the slot after each
/// Long/Double are `None`.
#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<Option<CpInfo>>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self { entries: vec![None] }
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `constant_pool_count` value: highest index plus one.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: u16) -> Result<&CpInfo> {
        if index == 0 {
            return Err(ClassFileError::InvalidConstantPoolIndex(index));
        }
        self.entries
            .get(index as usize)
            .and_then(|e| e.as_ref())
            .ok_or(ClassFileError::InvalidConstantPoolIndex(index))
    }

    pub fn get_utf8(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            CpInfo::Utf8(s) => Ok(s.as_str()),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    /// Internal name (`java/lang/String`) of a `CONSTANT_Class` entry.
    pub fn get_class_name(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            CpInfo::Class { name_index } => self.get_utf8(*name_index),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    /// Appends an entry and returns its index.
    pub fn push(&mut self, entry: CpInfo) -> Result<u16> {
        let index = self.entries.len();
        let needed = if entry.is_wide() { 2 } else { 1 };
        if index + needed > u16::MAX as usize {
            return Err(ClassFileError::ConstantPoolOverflow);
        }
        let wide = entry.is_wide();
        self.entries.push(Some(entry));
        if wide {
            self.entries.push(None);
        }
        Ok(index as u16)
    }

    fn find(&self, wanted: &CpInfo) -> Option<u16> {
        self.entries
            .iter()
            .position(|e| e.as_ref() == Some(wanted))
            .map(|i| i as u16)
    }

    fn intern(&mut self, entry: CpInfo) -> Result<u16> {
        match self.find(&entry) {
            Some(index) => Ok(index),
            None => self.push(entry),
        }
    }

    pub fn intern_utf8(&mut self, value: &str) -> Result<u16> {
        self.intern(CpInfo::Utf8(value.to_string()))
    }

    pub fn intern_class(&mut self, internal_name: &str) -> Result<u16> {
        let name_index = self.intern_utf8(internal_name)?;
        self.intern(CpInfo::Class { name_index })
    }

    pub fn intern_string(&mut self, value: &str) -> Result<u16> {
        let string_index = self.intern_utf8(value)?;
        self.intern(CpInfo::String { string_index })
    }

    pub fn intern_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name_index = self.intern_utf8(name)?;
        let descriptor_index = self.intern_utf8(descriptor)?;
        self.intern(CpInfo::NameAndType { name_index, descriptor_index })
    }

    pub fn intern_methodref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16> {
        let class_index = self.intern_class(owner)?;
        let name_and_type_index = self.intern_name_and_type(name, descriptor)?;
        self.intern(CpInfo::Methodref { class_index, name_and_type_index })
    }
}

// =============================================================================
// Modified UTF-8
// =============================================================================

/// Decodes the JVM's modified UTF-8: NUL is `C0 80`, supplementary
/// characters are surrogate pairs of three-byte sequences.
///
/// Only canonical encodings are accepted, so `encode(decode(b)) == b`.
pub fn decode_modified_utf8(bytes: &[u8]) -> Result<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b0 = bytes[i];
        match b0 {
            0x01..=0x7F => {
                units.push(b0 as u16);
                i += 1;
            }
            0xC0..=0xDF => {
                let b1 = *bytes.get(i + 1).ok_or(ClassFileError::InvalidUtf8)?;
                if b1 & 0xC0 != 0x80 {
                    return Err(ClassFileError::InvalidUtf8);
                }
                let unit = ((b0 as u16 & 0x1F) << 6) | (b1 as u16 & 0x3F);
                if unit != 0 && unit < 0x80 {
                    return Err(ClassFileError::InvalidUtf8);
                }
                units.push(unit);
                i += 2;
            }
            0xE0..=0xEF => {
                let b1 = *bytes.get(i + 1).ok_or(ClassFileError::InvalidUtf8)?;
                let b2 = *bytes.get(i + 2).ok_or(ClassFileError::InvalidUtf8)?;
                if b1 & 0xC0 != 0x80 || b2 & 0xC0 != 0x80 {
                    return Err(ClassFileError::InvalidUtf8);
                }
                let unit = ((b0 as u16 & 0x0F) << 12) | ((b1 as u16 & 0x3F) << 6) | (b2 as u16 & 0x3F);
                if unit < 0x800 {
                    return Err(ClassFileError::InvalidUtf8);
                }
                units.push(unit);
                i += 3;
            }
            _ => return Err(ClassFileError::InvalidUtf8),
        }
    }
    String::from_utf16(&units).map_err(|_| ClassFileError::InvalidUtf8)
}

pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x01..=0x7F => out.push(unit as u8),
            0x00 | 0x80..=0x7FF => {
                out.push(0xC0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

// =============================================================================
// Parsing
// =============================================================================

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u1(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u2(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u4(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ClassFileError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

/// Where an attribute table sits; decides which attributes get decoded.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Scope {
    Class,
    Member,
    Code,
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let magic = r.read_u4()?;
        if magic != MAGIC {
            return Err(ClassFileError::InvalidMagic(magic));
        }

        let minor_version = r.read_u2()?;
        let major_version = r.read_u2()?;

        let constant_pool = parse_constant_pool(&mut r)?;

        let access_flags = r.read_u2()?;
        let this_class = r.read_u2()?;
        let super_class = r.read_u2()?;

        let interfaces_count = r.read_u2()?;
        let mut interfaces = Vec::with_capacity(interfaces_count as usize);
        for _ in 0..interfaces_count {
            interfaces.push(r.read_u2()?);
        }

        let fields_count = r.read_u2()?;
        let mut fields = Vec::with_capacity(fields_count as usize);
        for _ in 0..fields_count {
            let (access_flags, name_index, descriptor_index, attributes) = parse_member(&mut r, &constant_pool)?;
            fields.push(FieldInfo { access_flags, name_index, descriptor_index, attributes });
        }

        let methods_count = r.read_u2()?;
        let mut methods = Vec::with_capacity(methods_count as usize);
        for _ in 0..methods_count {
            let (access_flags, name_index, descriptor_index, attributes) = parse_member(&mut r, &constant_pool)?;
            methods.push(MethodInfo { access_flags, name_index, descriptor_index, attributes });
        }

        let attributes = parse_attributes(&mut r, &constant_pool, Scope::Class)?;

        if r.remaining() != 0 {
            return Err(ClassFileError::TrailingBytes(r.remaining()));
        }

        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    /// Internal name of this class, e.g. `com/example/Foo`.
    pub fn this_class_name(&self) -> Result<&str> {
        self.constant_pool.get_class_name(self.this_class)
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    pub fn attribute_name(&self, attribute: &AttributeInfo) -> Result<&str> {
        self.constant_pool.get_utf8(attribute.name_index)
    }
}

fn parse_constant_pool(r: &mut Reader) -> Result<ConstantPool> {
    let count = r.read_u2()? as usize;
    let mut entries: Vec<Option<CpInfo>> = Vec::with_capacity(count);
    entries.push(None); // index 0 is unused

    let mut i = 1;
    while i < count {
        let tag = r.read_u1()?;
        let entry = match tag {
            1 => {
                let len = r.read_u2()? as usize;
                CpInfo::Utf8(decode_modified_utf8(r.read_bytes(len)?)?)
            }
            3 => CpInfo::Integer(r.read_u4()? as i32),
            4 => CpInfo::Float(r.read_u4()?),
            5 | 6 => {
                let high = r.read_u4()? as u64;
                let low = r.read_u4()? as u64;
                let bits = (high << 32) | low;
                let entry = if tag == 5 { CpInfo::Long(bits as i64) } else { CpInfo::Double(bits) };
                entries.push(Some(entry));
                entries.push(None);
                i += 2;
                continue;
            }
            7 => CpInfo::Class { name_index: r.read_u2()? },
            8 => CpInfo::String { string_index: r.read_u2()? },
            9 => CpInfo::Fieldref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            10 => CpInfo::Methodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            11 => CpInfo::InterfaceMethodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            12 => CpInfo::NameAndType { name_index: r.read_u2()?, descriptor_index: r.read_u2()? },
            15 => CpInfo::MethodHandle { reference_kind: r.read_u1()?, reference_index: r.read_u2()? },
            16 => CpInfo::MethodType { descriptor_index: r.read_u2()? },
            17 => CpInfo::Dynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            18 => CpInfo::InvokeDynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            19 => CpInfo::Module { name_index: r.read_u2()? },
            20 => CpInfo::Package { name_index: r.read_u2()? },
            _ => return Err(ClassFileError::InvalidConstantPoolTag(tag)),
        };

        entries.push(Some(entry));
        i += 1;
    }

    // A Long/Double in the last slot overruns the declared count.
    if entries.len() != count.max(1) {
        return Err(ClassFileError::InvalidConstantPoolIndex(count as u16));
    }

    Ok(ConstantPool { entries })
}

fn parse_member(r: &mut Reader, cp: &ConstantPool) -> Result<(u16, u16, u16, Vec<AttributeInfo>)> {
    let access_flags = r.read_u2()?;
    let name_index = r.read_u2()?;
    let descriptor_index = r.read_u2()?;
    let attributes = parse_attributes(r, cp, Scope::Member)?;
    Ok((access_flags, name_index, descriptor_index, attributes))
}

fn parse_attributes(r: &mut Reader, cp: &ConstantPool, scope: Scope) -> Result<Vec<AttributeInfo>> {
    let count = r.read_u2()? as usize;
    let mut attrs = Vec::with_capacity(count);
    for _ in 0..count {
        let name_index = r.read_u2()?;
        let length = r.read_u4()? as usize;
        let name = cp.get_utf8(name_index)?;
        let info_bytes = r.read_bytes(length)?;
        let mut sub = Reader::new(info_bytes);

        let body = match (scope, name) {
            (Scope::Member, "Code") => Attribute::Code(parse_code_attribute(&mut sub, cp)?),
            (Scope::Code, "StackMapTable") => Attribute::StackMapTable(parse_stack_map_table(&mut sub)?),
            (Scope::Code, "LineNumberTable") => {
                let num = sub.read_u2()? as usize;
                let mut entries = Vec::with_capacity(num);
                for _ in 0..num {
                    entries.push(LineNumberEntry { start_pc: sub.read_u2()?, line_number: sub.read_u2()? });
                }
                Attribute::LineNumberTable(entries)
            }
            (Scope::Code, "LocalVariableTable") => Attribute::LocalVariableTable(parse_local_variables(&mut sub)?),
            (Scope::Code, "LocalVariableTypeTable") => Attribute::LocalVariableTypeTable(parse_local_variables(&mut sub)?),
            _ => {
                sub.read_bytes(sub.remaining())?;
                Attribute::Raw(info_bytes.to_vec())
            }
        };

        if sub.remaining() != 0 {
            return Err(ClassFileError::InvalidAttribute(name.to_string()));
        }

        attrs.push(AttributeInfo { name_index, body });
    }
    Ok(attrs)
}

fn parse_local_variables(r: &mut Reader) -> Result<Vec<LocalVariableEntry>> {
    let num = r.read_u2()? as usize;
    let mut entries = Vec::with_capacity(num);
    for _ in 0..num {
        entries.push(LocalVariableEntry {
            start_pc: r.read_u2()?,
            length: r.read_u2()?,
            name_index: r.read_u2()?,
            descriptor_index: r.read_u2()?,
            index: r.read_u2()?,
        });
    }
    Ok(entries)
}

fn parse_code_attribute(r: &mut Reader, cp: &ConstantPool) -> Result<CodeAttribute> {
    let max_stack = r.read_u2()?;
    let max_locals = r.read_u2()?;
    let code_length = r.read_u4()? as usize;
    let code = r.read_bytes(code_length)?.to_vec();
    let exception_table_length = r.read_u2()? as usize;
    let mut exception_table = Vec::with_capacity(exception_table_length);
    for _ in 0..exception_table_length {
        exception_table.push(ExceptionTableEntry {
            start_pc: r.read_u2()?,
            end_pc: r.read_u2()?,
            handler_pc: r.read_u2()?,
            catch_type: r.read_u2()?,
        });
    }
    let attributes = parse_attributes(r, cp, Scope::Code)?;
    Ok(CodeAttribute { max_stack, max_locals, code, exception_table, attributes })
}

fn parse_stack_map_table(r: &mut Reader) -> Result<Vec<StackMapFrame>> {
    let num = r.read_u2()? as usize;
    let mut entries = Vec::with_capacity(num);
    for _ in 0..num {
        let frame_type = r.read_u1()?;
        let frame = match frame_type {
            0..=63 => StackMapFrame::Same { offset_delta: frame_type as u16 },
            64..=127 => {
                let stack = parse_verification_type_info(r)?;
                StackMapFrame::SameLocals1StackItem { offset_delta: (frame_type - 64) as u16, stack }
            }
            247 => {
                let offset_delta = r.read_u2()?;
                let stack = parse_verification_type_info(r)?;
                StackMapFrame::SameLocals1StackItemExtended { offset_delta, stack }
            }
            248..=250 => {
                let offset_delta = r.read_u2()?;
                StackMapFrame::Chop { offset_delta, k: 251u8 - frame_type }
            }
            251 => {
                let offset_delta = r.read_u2()?;
                StackMapFrame::SameExtended { offset_delta }
            }
            252..=254 => {
                let offset_delta = r.read_u2()?;
                let count = (frame_type - 251) as usize;
                let mut locals = Vec::with_capacity(count);
                for _ in 0..count { locals.push(parse_verification_type_info(r)?); }
                StackMapFrame::Append { offset_delta, locals }
            }
            255 => {
                let offset_delta = r.read_u2()?;
                let num_locals = r.read_u2()? as usize;
                let mut locals = Vec::with_capacity(num_locals);
                for _ in 0..num_locals { locals.push(parse_verification_type_info(r)?); }
                let num_stack = r.read_u2()? as usize;
                let mut stack = Vec::with_capacity(num_stack);
                for _ in 0..num_stack { stack.push(parse_verification_type_info(r)?); }
                StackMapFrame::Full { offset_delta, locals, stack }
            }
            _ => return Err(ClassFileError::InvalidAttribute("StackMapTable".to_string())),
        };
        entries.push(frame);
    }
    Ok(entries)
}

fn parse_verification_type_info(r: &mut Reader) -> Result<VerificationTypeInfo> {
    let tag = r.read_u1()?;
    let info = match tag {
        0 => VerificationTypeInfo::Top,
        1 => VerificationTypeInfo::Integer,
        2 => VerificationTypeInfo::Float,
        3 => VerificationTypeInfo::Double,
        4 => VerificationTypeInfo::Long,
        5 => VerificationTypeInfo::Null,
        6 => VerificationTypeInfo::UninitializedThis,
        7 => VerificationTypeInfo::Object(r.read_u2()?),
        8 => VerificationTypeInfo::Uninitialized(r.read_u2()?),
        _ => return Err(ClassFileError::InvalidAttribute("StackMapTable".to_string())),
    };
    Ok(info)
}

// =============================================================================
// Writing
// =============================================================================

#[derive(Default)]
struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn u1(&mut self, v: u8) {
        self.out.push(v);
    }

    fn u2(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn u4(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.out.extend_from_slice(v);
    }

    fn count(&mut self, n: usize, what: &'static str) -> Result<()> {
        let n = u16::try_from(n).map_err(|_| ClassFileError::TooLarge(what))?;
        self.u2(n);
        Ok(())
    }
}

impl ClassFile {
    /// Serializes the class back to its binary form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = Writer::default();
        w.u4(MAGIC);
        w.u2(self.minor_version);
        w.u2(self.major_version);
        write_constant_pool(&mut w, &self.constant_pool)?;
        w.u2(self.access_flags);
        w.u2(self.this_class);
        w.u2(self.super_class);

        w.count(self.interfaces.len(), "interfaces")?;
        for interface in &self.interfaces {
            w.u2(*interface);
        }

        w.count(self.fields.len(), "fields")?;
        for field in &self.fields {
            w.u2(field.access_flags);
            w.u2(field.name_index);
            w.u2(field.descriptor_index);
            write_attributes(&mut w, &field.attributes)?;
        }

        w.count(self.methods.len(), "methods")?;
        for method in &self.methods {
            w.u2(method.access_flags);
            w.u2(method.name_index);
            w.u2(method.descriptor_index);
            write_attributes(&mut w, &method.attributes)?;
        }

        write_attributes(&mut w, &self.attributes)?;
        Ok(w.out)
    }
}

fn write_constant_pool(w: &mut Writer, cp: &ConstantPool) -> Result<()> {
    w.count(cp.entries.len(), "constant pool")?;
    for entry in cp.entries.iter().flatten() {
        match entry {
            CpInfo::Utf8(s) => {
                let bytes = encode_modified_utf8(s);
                w.u1(1);
                w.count(bytes.len(), "Utf8 constant")?;
                w.bytes(&bytes);
            }
            CpInfo::Integer(v) => { w.u1(3); w.u4(*v as u32); }
            CpInfo::Float(bits) => { w.u1(4); w.u4(*bits); }
            CpInfo::Long(v) => { w.u1(5); w.bytes(&v.to_be_bytes()); }
            CpInfo::Double(bits) => { w.u1(6); w.bytes(&bits.to_be_bytes()); }
            CpInfo::Class { name_index } => { w.u1(7); w.u2(*name_index); }
            CpInfo::String { string_index } => { w.u1(8); w.u2(*string_index); }
            CpInfo::Fieldref { class_index, name_and_type_index } => { w.u1(9); w.u2(*class_index); w.u2(*name_and_type_index); }
            CpInfo::Methodref { class_index, name_and_type_index } => { w.u1(10); w.u2(*class_index); w.u2(*name_and_type_index); }
            CpInfo::InterfaceMethodref { class_index, name_and_type_index } => { w.u1(11); w.u2(*class_index); w.u2(*name_and_type_index); }
            CpInfo::NameAndType { name_index, descriptor_index } => { w.u1(12); w.u2(*name_index); w.u2(*descriptor_index); }
            CpInfo::MethodHandle { reference_kind, reference_index } => { w.u1(15); w.u1(*reference_kind); w.u2(*reference_index); }
            CpInfo::MethodType { descriptor_index } => { w.u1(16); w.u2(*descriptor_index); }
            CpInfo::Dynamic { bootstrap_method_attr_index, name_and_type_index } => { w.u1(17); w.u2(*bootstrap_method_attr_index); w.u2(*name_and_type_index); }
            CpInfo::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => { w.u1(18); w.u2(*bootstrap_method_attr_index); w.u2(*name_and_type_index); }
            CpInfo::Module { name_index } => { w.u1(19); w.u2(*name_index); }
            CpInfo::Package { name_index } => { w.u1(20); w.u2(*name_index); }
        }
    }
    Ok(())
}

fn write_attributes(w: &mut Writer, attrs: &[AttributeInfo]) -> Result<()> {
    w.count(attrs.len(), "attributes")?;
    for attr in attrs {
        let mut body = Writer::default();
        match &attr.body {
            Attribute::Code(code) => write_code(&mut body, code)?,
            Attribute::StackMapTable(frames) => {
                body.count(frames.len(), "StackMapTable")?;
                for frame in frames {
                    write_frame(&mut body, frame)?;
                }
            }
            Attribute::LineNumberTable(entries) => {
                body.count(entries.len(), "LineNumberTable")?;
                for e in entries {
                    body.u2(e.start_pc);
                    body.u2(e.line_number);
                }
            }
            Attribute::LocalVariableTable(entries) | Attribute::LocalVariableTypeTable(entries) => {
                body.count(entries.len(), "LocalVariableTable")?;
                for e in entries {
                    body.u2(e.start_pc);
                    body.u2(e.length);
                    body.u2(e.name_index);
                    body.u2(e.descriptor_index);
                    body.u2(e.index);
                }
            }
            Attribute::Raw(info) => body.bytes(info),
        }
        w.u2(attr.name_index);
        let len = u32::try_from(body.out.len()).map_err(|_| ClassFileError::TooLarge("attribute"))?;
        w.u4(len);
        w.bytes(&body.out);
    }
    Ok(())
}

fn write_code(w: &mut Writer, code: &CodeAttribute) -> Result<()> {
    w.u2(code.max_stack);
    w.u2(code.max_locals);
    if code.code.is_empty() || code.code.len() > u16::MAX as usize {
        return Err(ClassFileError::TooLarge("code"));
    }
    w.u4(code.code.len() as u32);
    w.bytes(&code.code);
    w.count(code.exception_table.len(), "exception table")?;
    for e in &code.exception_table {
        w.u2(e.start_pc);
        w.u2(e.end_pc);
        w.u2(e.handler_pc);
        w.u2(e.catch_type);
    }
    write_attributes(w, &code.attributes)
}

fn write_frame(w: &mut Writer, frame: &StackMapFrame) -> Result<()> {
    match frame {
        StackMapFrame::Same { offset_delta } if *offset_delta <= 63 => w.u1(*offset_delta as u8),
        StackMapFrame::Same { offset_delta } | StackMapFrame::SameExtended { offset_delta } => {
            w.u1(251);
            w.u2(*offset_delta);
        }
        StackMapFrame::SameLocals1StackItem { offset_delta, stack } if *offset_delta <= 63 => {
            w.u1(64 + *offset_delta as u8);
            write_verification_type_info(w, stack);
        }
        StackMapFrame::SameLocals1StackItem { offset_delta, stack }
        | StackMapFrame::SameLocals1StackItemExtended { offset_delta, stack } => {
            w.u1(247);
            w.u2(*offset_delta);
            write_verification_type_info(w, stack);
        }
        StackMapFrame::Chop { offset_delta, k } => {
            if !(1..=3).contains(k) {
                return Err(ClassFileError::InvalidAttribute("StackMapTable".to_string()));
            }
            w.u1(251 - k);
            w.u2(*offset_delta);
        }
        StackMapFrame::Append { offset_delta, locals } => {
            if !(1..=3).contains(&locals.len()) {
                return Err(ClassFileError::InvalidAttribute("StackMapTable".to_string()));
            }
            w.u1(251 + locals.len() as u8);
            w.u2(*offset_delta);
            for local in locals {
                write_verification_type_info(w, local);
            }
        }
        StackMapFrame::Full { offset_delta, locals, stack } => {
            w.u1(255);
            w.u2(*offset_delta);
            w.count(locals.len(), "stack map locals")?;
            for local in locals {
                write_verification_type_info(w, local);
            }
            w.count(stack.len(), "stack map stack")?;
            for item in stack {
                write_verification_type_info(w, item);
            }
        }
    }
    Ok(())
}

fn write_verification_type_info(w: &mut Writer, info: &VerificationTypeInfo) {
    match info {
        VerificationTypeInfo::Top => w.u1(0),
        VerificationTypeInfo::Integer => w.u1(1),
        VerificationTypeInfo::Float => w.u1(2),
        VerificationTypeInfo::Double => w.u1(3),
        VerificationTypeInfo::Long => w.u1(4),
        VerificationTypeInfo::Null => w.u1(5),
        VerificationTypeInfo::UninitializedThis => w.u1(6),
        VerificationTypeInfo::Object(index) => { w.u1(7); w.u2(*index); }
        VerificationTypeInfo::Uninitialized(offset) => { w.u1(8); w.u2(*offset); }
    }
}

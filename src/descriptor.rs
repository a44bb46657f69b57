//! JVM type descriptors.
//!
//! Turns `(I[Ljava/lang/String;)V` into the Java source spellings used in
//! signatures (`int`, `java.lang.String[]`, `void`), renders access flags as
//! modifier text, and derives the implicit verification frame a method
//! starts with.

use crate::classfile::{self, ConstantPool, VerificationTypeInfo};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("malformed descriptor: {0}")]
    Malformed(String),
    #[error(transparent)]
    ClassFile(#[from] classfile::ClassFileError),
}

pub type Result<T> = std::result::Result<T, DescriptorError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
    /// Internal name, e.g. `java/lang/String`.
    Object(String),
    Array(Box<FieldType>),
}

impl FieldType {
    /// Java source spelling: `int`, `java.lang.String`, `byte[][]`.
    pub fn java_name(&self) -> String {
        match self {
            FieldType::Byte => "byte".to_string(),
            FieldType::Char => "char".to_string(),
            FieldType::Double => "double".to_string(),
            FieldType::Float => "float".to_string(),
            FieldType::Int => "int".to_string(),
            FieldType::Long => "long".to_string(),
            FieldType::Short => "short".to_string(),
            FieldType::Boolean => "boolean".to_string(),
            FieldType::Object(name) => name.replace('/', "."),
            FieldType::Array(component) => format!("{}[]", component.java_name()),
        }
    }

    pub fn descriptor(&self) -> String {
        match self {
            FieldType::Byte => "B".to_string(),
            FieldType::Char => "C".to_string(),
            FieldType::Double => "D".to_string(),
            FieldType::Float => "F".to_string(),
            FieldType::Int => "I".to_string(),
            FieldType::Long => "J".to_string(),
            FieldType::Short => "S".to_string(),
            FieldType::Boolean => "Z".to_string(),
            FieldType::Object(name) => format!("L{name};"),
            FieldType::Array(component) => format!("[{}", component.descriptor()),
        }
    }

    /// Number of local variable slots a value of this type occupies.
    pub fn slots(&self) -> u16 {
        match self {
            FieldType::Long | FieldType::Double => 2,
            _ => 1,
        }
    }

    /// The verifier's view of a local holding this type.
    pub fn verification_type(&self, cp: &mut ConstantPool) -> Result<VerificationTypeInfo> {
        Ok(match self {
            FieldType::Byte | FieldType::Char | FieldType::Int | FieldType::Short | FieldType::Boolean => {
                VerificationTypeInfo::Integer
            }
            FieldType::Float => VerificationTypeInfo::Float,
            FieldType::Long => VerificationTypeInfo::Long,
            FieldType::Double => VerificationTypeInfo::Double,
            FieldType::Object(name) => VerificationTypeInfo::Object(cp.intern_class(name)?),
            // Array classes are named by their descriptor.
            FieldType::Array(_) => VerificationTypeInfo::Object(cp.intern_class(&self.descriptor())?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub params: Vec<FieldType>,
    /// `None` for `void`.
    pub ret: Option<FieldType>,
}

impl MethodDescriptor {
    pub fn parse(descriptor: &str) -> Result<Self> {
        let malformed = || DescriptorError::Malformed(descriptor.to_string());
        let rest = descriptor.strip_prefix('(').ok_or_else(malformed)?;
        let close = rest.find(')').ok_or_else(malformed)?;
        let (mut params_src, ret_src) = (&rest[..close], &rest[close + 1..]);

        let mut params = Vec::new();
        while !params_src.is_empty() {
            let (ty, tail) = parse_field_type(params_src).ok_or_else(malformed)?;
            params.push(ty);
            params_src = tail;
        }

        let ret = if ret_src == "V" {
            None
        } else {
            match parse_field_type(ret_src) {
                Some((ty, "")) => Some(ty),
                _ => return Err(malformed()),
            }
        };

        Ok(Self { params, ret })
    }

    /// `(int,java.lang.String[])`
    pub fn java_params(&self) -> String {
        let names: Vec<String> = self.params.iter().map(FieldType::java_name).collect();
        format!("({})", names.join(","))
    }

    pub fn java_return(&self) -> String {
        self.ret.as_ref().map_or_else(|| "void".to_string(), FieldType::java_name)
    }

    /// Slots taken by the parameters, not counting `this`.
    pub fn param_slots(&self) -> u16 {
        self.params.iter().map(FieldType::slots).sum()
    }
}

/// Parses one field type off the front of `src`, returning the remainder.
pub fn parse_field_type(src: &str) -> Option<(FieldType, &str)> {
    let first = *src.as_bytes().first()?;
    let rest = src.get(1..)?;
    let ty = match first {
        b'B' => FieldType::Byte,
        b'C' => FieldType::Char,
        b'D' => FieldType::Double,
        b'F' => FieldType::Float,
        b'I' => FieldType::Int,
        b'J' => FieldType::Long,
        b'S' => FieldType::Short,
        b'Z' => FieldType::Boolean,
        b'L' => {
            let end = rest.find(';')?;
            if end == 0 {
                return None;
            }
            return Some((FieldType::Object(rest[..end].to_string()), &rest[end + 1..]));
        }
        b'[' => {
            let (component, tail) = parse_field_type(rest)?;
            return Some((FieldType::Array(Box::new(component)), tail));
        }
        _ => return None,
    };
    Some((ty, rest))
}

/// Method modifiers in `java.lang.reflect.Modifier.toString` order.
/// Bridge, varargs and synthetic bits are not modifiers and are dropped.
pub fn method_modifiers(access_flags: u16) -> String {
    const ORDER: [(u16, &str); 9] = [
        (classfile::ACC_PUBLIC, "public"),
        (classfile::ACC_PROTECTED, "protected"),
        (classfile::ACC_PRIVATE, "private"),
        (classfile::ACC_ABSTRACT, "abstract"),
        (classfile::ACC_STATIC, "static"),
        (classfile::ACC_FINAL, "final"),
        (classfile::ACC_SYNCHRONIZED, "synchronized"),
        (classfile::ACC_NATIVE, "native"),
        (classfile::ACC_STRICT, "strictfp"),
    ];
    ORDER
        .iter()
        .filter(|(flag, _)| access_flags & flag != 0)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join(" ")
}

/// The implicit frame at pc 0: `this` (unless static) followed by the
/// parameters. Long and Double take one entry each, as in StackMapTable.
pub fn initial_locals(
    cp: &mut ConstantPool,
    this_class: u16,
    method_name: &str,
    is_static: bool,
    descriptor: &MethodDescriptor,
) -> Result<Vec<VerificationTypeInfo>> {
    let mut locals = Vec::with_capacity(descriptor.params.len() + 1);
    if !is_static {
        if method_name == "<init>" {
            locals.push(VerificationTypeInfo::UninitializedThis);
        } else {
            locals.push(VerificationTypeInfo::Object(this_class));
        }
    }
    for param in &descriptor.params {
        locals.push(param.verification_type(cp)?);
    }
    Ok(locals)
}

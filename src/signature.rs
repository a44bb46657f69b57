//! Method identity.
//!
//! A [`Signature`] is the aggregation key of the metrics store. It renders
//! as `modifiers;returnType;declaringType;methodName;descriptor`, the same
//! string the probe passes back from instrumented code, and can be looked
//! up by that string directly.

use crate::descriptor::{self, MethodDescriptor};
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed signature {0:?}: expected five `;`-separated fields")]
pub struct SignatureParseError(pub String);

#[derive(Debug, Clone)]
pub struct Signature {
    modifiers: String,
    return_type: String,
    declaring_type: String,
    method_name: String,
    descriptor: String,
    rendered: String,
}

impl Signature {
    pub fn new(
        modifiers: impl Into<String>,
        return_type: impl Into<String>,
        declaring_type: impl Into<String>,
        method_name: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Self {
        let modifiers = modifiers.into();
        let return_type = return_type.into();
        let declaring_type = declaring_type.into();
        let method_name = method_name.into();
        let descriptor = descriptor.into();
        let rendered = format!("{modifiers};{return_type};{declaring_type};{method_name};{descriptor}");
        Self { modifiers, return_type, declaring_type, method_name, descriptor, rendered }
    }

    /// Builds the signature of a declared method from its class file form.
    ///
    /// `class_name` may be internal (`com/example/Foo`) or dotted.
    pub fn from_declaration(
        access_flags: u16,
        class_name: &str,
        method_name: &str,
        method_descriptor: &str,
    ) -> descriptor::Result<Self> {
        let parsed = MethodDescriptor::parse(method_descriptor)?;
        Ok(Self::new(
            descriptor::method_modifiers(access_flags),
            parsed.java_return(),
            class_name.replace('/', "."),
            method_name,
            parsed.java_params(),
        ))
    }

    /// Reverses [`Signature::rendered`].
    pub fn parse(rendered: &str) -> Result<Self, SignatureParseError> {
        let mut parts = rendered.splitn(5, ';');
        let mut next = || parts.next().ok_or_else(|| SignatureParseError(rendered.to_string()));
        let (modifiers, return_type, declaring_type, method_name, descriptor) =
            (next()?, next()?, next()?, next()?, next()?);
        Ok(Self::new(modifiers, return_type, declaring_type, method_name, descriptor))
    }

    pub fn modifiers(&self) -> &str {
        &self.modifiers
    }

    pub fn return_type(&self) -> &str {
        &self.return_type
    }

    pub fn declaring_type(&self) -> &str {
        &self.declaring_type
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// Parameter list in source form, e.g. `(int,java.lang.String[])`.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn rendered(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

// Equality and hashing go through the rendered form so that `&str` lookups
// agree with `Signature` keys.
impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.rendered == other.rendered
    }
}

impl Eq for Signature {}

impl Hash for Signature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rendered.hash(state);
    }
}

impl Borrow<str> for Signature {
    fn borrow(&self) -> &str {
        &self.rendered
    }
}

impl Ord for Signature {
    fn cmp(&self, other: &Self) -> Ordering {
        self.declaring_type
            .cmp(&other.declaring_type)
            .then_with(|| self.method_name.cmp(&other.method_name))
            .then_with(|| self.descriptor.cmp(&other.descriptor))
            .then_with(|| self.return_type.cmp(&other.return_type))
            .then_with(|| self.modifiers.cmp(&other.modifiers))
    }
}

impl PartialOrd for Signature {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

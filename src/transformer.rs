//! Per-class rewrite.
//!
//! [`ClassTransformer::transform`] is called once for every class the JVM
//! loads. Classes the policy does not explicitly include come back as-is.
//! Included classes get a probe in every declared method with a body, and
//! every declared method (constructors aside) is registered in the store
//! with a zero count. Any failure along the way is logged and the original
//! bytes are returned, so one class the rewriter cannot handle never stops
//! the application from loading it.

use crate::bytecode::{self, opcodes, ExitHandler, Patch};
use crate::classfile::{Attribute, ClassFile, ClassFileError, ConstantPool, MethodInfo};
use crate::descriptor::{self, MethodDescriptor};
use crate::metrics::{MetricsStore, ProbeMode};
use crate::policy::InclusionPolicy;
use crate::probe::{HIT_DESCRIPTOR, HIT_NAME, PROBE_CLASS, RECORD_DESCRIPTOR, RECORD_NAME};
use crate::signature::Signature;
use crate::sys::jni;
use std::borrow::Cow;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("cannot parse class file: {0}")]
    Parse(ClassFileError),
    #[error("cannot resolve {0}")]
    NotFound(String),
    #[error("cannot insert probe into {method}: {reason}")]
    CannotCompile { method: String, reason: String },
    #[error("cannot serialize class file: {0}")]
    Serialize(ClassFileError),
    #[error("rewrite panicked: {0}")]
    Panicked(String),
}

pub type Result<T> = std::result::Result<T, TransformError>;

/// The class loader a class is being loaded by. Null is the bootstrap
/// loader. Used for diagnostics only.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ClassLoaderRef(pub jni::jobject);

impl ClassLoaderRef {
    pub fn bootstrap() -> Self {
        ClassLoaderRef(std::ptr::null_mut())
    }
}

impl fmt::Debug for ClassLoaderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ClassLoaderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_null() {
            f.write_str("bootstrap")
        } else {
            write!(f, "{:p}", self.0)
        }
    }
}

pub struct ClassTransformer {
    policy: Option<Arc<dyn InclusionPolicy>>,
    store: Arc<MetricsStore>,
    mode: ProbeMode,
    /// Cleared until `delver/Probe` exists; classes loaded earlier could not
    /// link against it.
    live: AtomicBool,
}

impl ClassTransformer {
    pub fn new(policy: Option<Arc<dyn InclusionPolicy>>, store: Arc<MetricsStore>, mode: ProbeMode) -> Self {
        Self { policy, store, mode, live: AtomicBool::new(true) }
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> ProbeMode {
        self.mode
    }

    pub fn store(&self) -> &Arc<MetricsStore> {
        &self.store
    }

    /// Returns the instrumented class, or `bytes` untouched when the class
    /// is not included or cannot be rewritten. `class_name` is the internal
    /// name the JVM reports (`com/example/Foo`).
    pub fn transform<'a>(&self, loader: ClassLoaderRef, class_name: &str, bytes: &'a [u8]) -> Cow<'a, [u8]> {
        let Some(policy) = &self.policy else {
            return Cow::Borrowed(bytes);
        };
        if !self.is_live() || class_name == PROBE_CLASS {
            return Cow::Borrowed(bytes);
        }

        let dotted = class_name.replace('/', ".");
        if policy.is_excluded(&dotted) {
            debug!(class = %dotted, "excluded");
            return Cow::Borrowed(bytes);
        }
        if !policy.is_included(&dotted) {
            return Cow::Borrowed(bytes);
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.rewrite(class_name, bytes)))
            .unwrap_or_else(|payload| Err(TransformError::Panicked(panic_message(payload.as_ref()))));
        match outcome {
            Ok(rewritten) => {
                debug!(class = %dotted, %loader, "instrumented");
                Cow::Owned(rewritten)
            }
            Err(e) => {
                warn!(class = %dotted, %loader, error = %e, "leaving class uninstrumented");
                Cow::Borrowed(bytes)
            }
        }
    }

    /// Instruments every eligible method of one class.
    pub fn rewrite(&self, class_name: &str, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut class = ClassFile::parse(bytes).map_err(TransformError::Parse)?;

        let declared = class.this_class_name().map_err(TransformError::Parse)?;
        if declared != class_name.replace('.', "/") {
            return Err(TransformError::NotFound(format!("{class_name}: class file declares {declared}")));
        }
        let declaring_type = declared.replace('/', ".");
        let this_class = class.this_class;
        let interface = class.is_interface();

        for method in class.methods.iter_mut() {
            self.instrument_method(&mut class.constant_pool, this_class, &declaring_type, interface, method)?;
        }

        class.to_bytes().map_err(TransformError::Serialize)
    }

    fn instrument_method(
        &self,
        cp: &mut ConstantPool,
        this_class: u16,
        declaring_type: &str,
        interface: bool,
        method: &mut MethodInfo,
    ) -> Result<()> {
        let name = cp.get_utf8(method.name_index).map_err(TransformError::Parse)?.to_string();
        if name == "<init>" || name == "<clinit>" {
            return Ok(());
        }
        let raw_descriptor = cp.get_utf8(method.descriptor_index).map_err(TransformError::Parse)?.to_string();
        let parsed = MethodDescriptor::parse(&raw_descriptor)
            .map_err(|e| TransformError::NotFound(format!("{declaring_type}.{name}: {e}")))?;
        let signature = Signature::new(
            descriptor::method_modifiers(method.access_flags),
            parsed.java_return(),
            declaring_type,
            name.as_str(),
            parsed.java_params(),
        );

        self.store.register_known_zero(&signature);
        if method.is_abstract() || method.is_native() || interface {
            return Ok(());
        }

        let compile_error = |reason: String| TransformError::CannotCompile {
            method: format!("{declaring_type}.{name}{raw_descriptor}"),
            reason,
        };
        let is_static = method.is_static();
        let code = method
            .code_mut()
            .ok_or_else(|| compile_error("no Code attribute".to_string()))?;

        let has_frames = code
            .attributes
            .iter()
            .any(|a| matches!(a.body, Attribute::StackMapTable(_)));
        let initial_locals = if has_frames {
            descriptor::initial_locals(cp, this_class, &name, is_static, &parsed)
                .map_err(|e| compile_error(e.to_string()))?
        } else {
            Vec::new()
        };

        let patch = self
            .build_patch(cp, signature.rendered(), code.max_locals)
            .map_err(|e| compile_error(e.to_string()))?;
        bytecode::relocate(code, cp, &initial_locals, &patch).map_err(|e| compile_error(e.to_string()))
    }

    fn build_patch(&self, cp: &mut ConstantPool, rendered: &str, max_locals: u16) -> std::result::Result<Patch, ClassFileError> {
        let label = cp.intern_string(rendered)?;
        match self.mode {
            ProbeMode::Count => {
                let hit = cp.intern_methodref(PROBE_CLASS, HIT_NAME, HIT_DESCRIPTOR)?;
                let mut prologue = Vec::with_capacity(8);
                push_indexed(&mut prologue, opcodes::LDC_W, label);
                push_indexed(&mut prologue, opcodes::INVOKESTATIC, hit);
                Ok(Patch { prologue, epilogue: None, timer_local: None, extra_stack: 1, exit_handler: None })
            }
            ProbeMode::Timing => {
                let nano_time = cp.intern_methodref("java/lang/System", "nanoTime", "()J")?;
                let record = cp.intern_methodref(PROBE_CLASS, RECORD_NAME, RECORD_DESCRIPTOR)?;
                let timer = max_locals;

                let mut prologue = Vec::with_capacity(8);
                push_indexed(&mut prologue, opcodes::INVOKESTATIC, nano_time);
                push_local(&mut prologue, opcodes::LSTORE, timer);

                // Stack on entry: the return value, if any. On top of it:
                // String, long, long.
                let mut epilogue = Vec::with_capacity(13);
                push_indexed(&mut epilogue, opcodes::LDC_W, label);
                push_local(&mut epilogue, opcodes::LLOAD, timer);
                push_indexed(&mut epilogue, opcodes::INVOKESTATIC, nano_time);
                push_indexed(&mut epilogue, opcodes::INVOKESTATIC, record);

                // Thrown exits record too. The exception stays under the
                // epilogue's operands and is rethrown.
                let mut handler = epilogue.clone();
                handler.push(opcodes::ATHROW);
                let exit_handler = ExitHandler {
                    code: handler,
                    max_stack: 6,
                    throwable_class: cp.intern_class("java/lang/Throwable")?,
                    stack_map_name: cp.intern_utf8("StackMapTable")?,
                };

                Ok(Patch {
                    prologue,
                    epilogue: Some(epilogue),
                    timer_local: Some(timer),
                    extra_stack: 5,
                    exit_handler: Some(exit_handler),
                })
            }
        }
    }
}

fn push_indexed(out: &mut Vec<u8>, opcode: u8, index: u16) {
    out.push(opcode);
    out.extend_from_slice(&index.to_be_bytes());
}

fn push_local(out: &mut Vec<u8>, opcode: u8, slot: u16) {
    match u8::try_from(slot) {
        Ok(slot) => out.extend_from_slice(&[opcode, slot]),
        Err(_) => {
            out.extend_from_slice(&[opcodes::WIDE, opcode]);
            out.extend_from_slice(&slot.to_be_bytes());
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

//! The `delver/Probe` class instrumented code calls into.
//!
//! The class is generated here rather than shipped as a `.class` file: two
//! `public static native` methods and nothing else. It is defined in the
//! bootstrap loader so instrumented classes see it from any loader, and its
//! natives are bound to the metrics store with `RegisterNatives`.
//!
//! ```text
//! public final class delver.Probe {
//!     public static native void hit(String signature);
//!     public static native void record(String signature, long startNanos, long endNanos);
//! }
//! ```

use crate::classfile::{
    ClassFile, ClassFileError, ConstantPool, MethodInfo, ACC_FINAL, ACC_NATIVE, ACC_PUBLIC, ACC_STATIC,
    ACC_SUPER,
};
use crate::env::{JniEnv, LocalRef};
use crate::metrics::{MetricsStore, Observation};
use crate::sys::jni;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

pub const PROBE_CLASS: &str = "delver/Probe";
pub const HIT_NAME: &str = "hit";
pub const HIT_DESCRIPTOR: &str = "(Ljava/lang/String;)V";
pub const RECORD_NAME: &str = "record";
pub const RECORD_DESCRIPTOR: &str = "(Ljava/lang/String;JJ)V";

/// Java 8; the probe needs no newer features.
const PROBE_MAJOR_VERSION: u16 = 52;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("cannot build probe class: {0}")]
    ClassFile(#[from] ClassFileError),
    #[error("DefineClass rejected {PROBE_CLASS}")]
    DefineClass,
    #[error("RegisterNatives failed with {0}")]
    RegisterNatives(jni::jint),
    #[error("probe already installed")]
    AlreadyInstalled,
}

static SINK: OnceLock<Arc<MetricsStore>> = OnceLock::new();

/// Class file bytes of `delver/Probe`.
pub fn probe_class_bytes() -> Result<Vec<u8>, ClassFileError> {
    let mut cp = ConstantPool::new();
    let this_class = cp.intern_class(PROBE_CLASS)?;
    let super_class = cp.intern_class("java/lang/Object")?;

    let mut methods = Vec::with_capacity(2);
    for (name, descriptor) in [(HIT_NAME, HIT_DESCRIPTOR), (RECORD_NAME, RECORD_DESCRIPTOR)] {
        methods.push(MethodInfo {
            access_flags: ACC_PUBLIC | ACC_STATIC | ACC_NATIVE,
            name_index: cp.intern_utf8(name)?,
            descriptor_index: cp.intern_utf8(descriptor)?,
            attributes: Vec::new(),
        });
    }

    ClassFile {
        minor_version: 0,
        major_version: PROBE_MAJOR_VERSION,
        constant_pool: cp,
        access_flags: ACC_PUBLIC | ACC_FINAL | ACC_SUPER,
        this_class,
        super_class,
        interfaces: Vec::new(),
        fields: Vec::new(),
        methods,
        attributes: Vec::new(),
    }
    .to_bytes()
}

/// Defines `delver/Probe` in the bootstrap loader and routes its natives
/// into `store`. Can succeed once per process.
pub fn install(jni: &JniEnv, store: Arc<MetricsStore>) -> Result<(), ProbeError> {
    let bytes = probe_class_bytes()?;
    SINK.set(store).map_err(|_| ProbeError::AlreadyInstalled)?;

    let class = match jni.define_class(PROBE_CLASS, ptr::null_mut(), &bytes) {
        Some(class) => LocalRef::new(jni, class),
        None => {
            jni.clear_pending();
            return Err(ProbeError::DefineClass);
        }
    };

    let natives = [
        jni::JNINativeMethod {
            name: c"hit".as_ptr(),
            signature: c"(Ljava/lang/String;)V".as_ptr(),
            fnPtr: native_hit as *mut c_void,
        },
        jni::JNINativeMethod {
            name: c"record".as_ptr(),
            signature: c"(Ljava/lang/String;JJ)V".as_ptr(),
            fnPtr: native_record as *mut c_void,
        },
    ];
    jni.register_natives(class.get(), &natives).map_err(|code| {
        jni.clear_pending();
        ProbeError::RegisterNatives(code)
    })
}

/// Whole milliseconds between two `System.nanoTime()` readings.
pub fn elapsed_millis(start_nanos: jni::jlong, end_nanos: jni::jlong) -> u64 {
    (end_nanos.saturating_sub(start_nanos).max(0) as u64) / 1_000_000
}

fn report(env: *mut jni::JNIEnv, signature: jni::jstring, observation: Observation) {
    let Some(store) = SINK.get() else {
        return;
    };
    let jni = unsafe { JniEnv::from_raw(env) };
    let rendered = jni
        .get_string_utf_bytes(signature)
        .and_then(|bytes| crate::classfile::decode_modified_utf8(&bytes).ok());
    match rendered {
        Some(rendered) => store.record_rendered(&rendered, observation),
        None => {
            jni.clear_pending();
        }
    }
}

unsafe extern "system" fn native_hit(env: *mut jni::JNIEnv, _class: jni::jclass, signature: jni::jstring) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| report(env, signature, Observation::Hit)));
}

unsafe extern "system" fn native_record(
    env: *mut jni::JNIEnv,
    _class: jni::jclass,
    signature: jni::jstring,
    start_nanos: jni::jlong,
    end_nanos: jni::jlong,
) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
        report(env, signature, Observation::Elapsed(elapsed_millis(start_nanos, end_nanos)))
    }));
}

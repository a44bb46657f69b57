//! Raw JNI and JVMTI FFI tables.

pub mod jni;
pub mod jvmti;

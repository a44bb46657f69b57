//! Safe wrapper around the JNI environment.
//!
//! Covers what the probe bridge needs: defining a class from bytes,
//! binding natives, reading `String` arguments and keeping the exception
//! state clean.
//!
//! # Example
//!
//! ```rust,ignore
//! use delver::jni_wrapper::JniEnv;
//!
//! fn vm_init(jni: *mut jni::JNIEnv, thread: jni::jthread) {
//!     let env = unsafe { JniEnv::from_raw(jni) };
//!     let cls = env.define_class("delver/Probe", std::ptr::null_mut(), &bytes);
//!     if env.exception_check() {
//!         env.exception_describe();
//!         env.exception_clear();
//!     }
//! }
//! ```

use crate::sys::jni;
use std::ffi::{CStr, CString};
use std::ptr;

/// Safe wrapper around a JNI environment pointer.
///
/// # Thread Safety
///
/// A `JniEnv` is tied to a specific thread and cannot be sent across threads.
/// Each JVM thread has its own JNI environment.
pub struct JniEnv {
    env: *mut jni::JNIEnv,
}

impl JniEnv {
    /// Creates a JniEnv wrapper from a raw pointer.
    ///
    /// # Safety
    ///
    /// The caller must ensure the pointer is valid and comes from the current thread.
    pub unsafe fn from_raw(env: *mut jni::JNIEnv) -> Self {
        JniEnv { env }
    }

    // =========================================================================
    // Class Operations
    // =========================================================================

    /// Defines a class from raw class file bytes.
    ///
    /// A null `loader` defines the class in the bootstrap loader.
    pub fn define_class(&self, name: &str, loader: jni::jobject, bytes: &[u8]) -> Option<jni::jclass> {
        let c_name = CString::new(name).ok()?;
        unsafe {
            let vtable = *self.env;
            let cls = ((*vtable).DefineClass)(
                self.env,
                c_name.as_ptr(),
                loader,
                bytes.as_ptr() as *const jni::jbyte,
                bytes.len() as jni::jsize,
            );
            if cls.is_null() { None } else { Some(cls) }
        }
    }

    // =========================================================================
    // Exception Handling
    // =========================================================================

    /// Checks if an exception is pending.
    pub fn exception_check(&self) -> bool {
        unsafe {
            let vtable = *self.env;
            ((*vtable).ExceptionCheck)(self.env) != 0
        }
    }

    /// Clears any pending exception.
    pub fn exception_clear(&self) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).ExceptionClear)(self.env);
        }
    }

    /// Prints the pending exception and stack trace to stderr.
    pub fn exception_describe(&self) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).ExceptionDescribe)(self.env);
        }
    }

    /// Describes and clears a pending exception. Returns whether one was pending.
    pub fn clear_pending(&self) -> bool {
        if self.exception_check() {
            self.exception_describe();
            self.exception_clear();
            true
        } else {
            false
        }
    }

    // =========================================================================
    // String Operations
    // =========================================================================

    /// Copies the modified UTF-8 bytes of a Java string.
    ///
    /// Returns `None` for a null string or when the VM cannot pin the chars.
    pub fn get_string_utf_bytes(&self, s: jni::jstring) -> Option<Vec<u8>> {
        if s.is_null() {
            return None;
        }
        unsafe {
            let vtable = *self.env;
            let chars = ((*vtable).GetStringUTFChars)(self.env, s, ptr::null_mut());
            if chars.is_null() {
                return None;
            }
            // Modified UTF-8 never contains a raw NUL, so the C string ends
            // exactly at the string's end.
            let bytes = CStr::from_ptr(chars).to_bytes().to_vec();
            ((*vtable).ReleaseStringUTFChars)(self.env, s, chars);
            Some(bytes)
        }
    }

    // =========================================================================
    // References
    // =========================================================================

    pub fn delete_local_ref(&self, obj: jni::jobject) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).DeleteLocalRef)(self.env, obj);
        }
    }

    // =========================================================================
    // Native Method Registration
    // =========================================================================

    /// Registers native methods for a class.
    pub fn register_natives(&self, cls: jni::jclass, methods: &[jni::JNINativeMethod]) -> Result<(), jni::jint> {
        unsafe {
            let vtable = *self.env;
            let result = ((*vtable).RegisterNatives)(self.env, cls, methods.as_ptr(), methods.len() as jni::jint);
            if result == 0 { Ok(()) } else { Err(result) }
        }
    }
}

// =========================================================================
// Reference Guards (RAII wrappers)
// =========================================================================

/// A guard that automatically deletes a local reference when dropped.
pub struct LocalRef<'a> {
    env: &'a JniEnv,
    obj: jni::jobject,
}

impl<'a> LocalRef<'a> {
    pub fn new(env: &'a JniEnv, obj: jni::jobject) -> Self {
        LocalRef { env, obj }
    }

    /// Returns the underlying jobject.
    pub fn get(&self) -> jni::jobject {
        self.obj
    }
}

impl<'a> Drop for LocalRef<'a> {
    fn drop(&mut self) {
        if !self.obj.is_null() {
            self.env.delete_local_ref(self.obj);
        }
    }
}

// delver/src/sys/jvmti.rs
//
// JVMTI (JVM Tool Interface) bindings used by the agent.
//
// Slot numbering follows jvmti.h (1-based, 156 slots as of JDK 27). The
// agent needs six functions and three events; every other slot is kept as
// an opaque pointer so the struct offsets match the VM's table exactly.
// Newer JDKs only append to the table.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use crate::sys::jni::{jclass, jint, jlong, jobject, jthread, JNIEnv};
use std::os::raw::{c_char, c_uchar, c_void};

// --- Constants ---
pub const JVMTI_VERSION_1_2: jint = 0x30010200;

pub const JVMTI_EVENT_VM_INIT: u32 = 50;
pub const JVMTI_EVENT_VM_DEATH: u32 = 51;
pub const JVMTI_EVENT_CLASS_FILE_LOAD_HOOK: u32 = 54;

pub const JVMTI_ENABLE: jint = 1;
pub const JVMTI_DISABLE: jint = 0;

// --- Error Codes ---
/// Raw JVMTI error code. Kept as a transparent integer so codes the agent
/// never names still round-trip through `Result<_, jvmtiError>`.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct jvmtiError(pub u32);

impl jvmtiError {
    pub const NONE: jvmtiError = jvmtiError(0);
    pub const INVALID_CLASS: jvmtiError = jvmtiError(21);
    pub const NOT_AVAILABLE: jvmtiError = jvmtiError(98);
    pub const MUST_POSSESS_CAPABILITY: jvmtiError = jvmtiError(99);
    pub const NULL_POINTER: jvmtiError = jvmtiError(100);
    pub const INVALID_EVENT_TYPE: jvmtiError = jvmtiError(102);
    pub const ILLEGAL_ARGUMENT: jvmtiError = jvmtiError(103);
    pub const OUT_OF_MEMORY: jvmtiError = jvmtiError(110);
    pub const WRONG_PHASE: jvmtiError = jvmtiError(112);
    pub const UNATTACHED_THREAD: jvmtiError = jvmtiError(115);
    pub const INVALID_ENVIRONMENT: jvmtiError = jvmtiError(116);
}

impl std::fmt::Display for jvmtiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JVMTI error {}", self.0)
    }
}

impl std::error::Error for jvmtiError {}

// --- Capabilities ---
#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct jvmtiCapabilities {
    bits: [u32; 4],
}

impl jvmtiCapabilities {
    fn set_bit(&mut self, bit_offset: usize, value: bool) {
        let word_index = bit_offset / 32;
        let bit_index = bit_offset % 32;
        if value {
            self.bits[word_index] |= 1 << bit_index;
        } else {
            self.bits[word_index] &= !(1 << bit_index);
        }
    }

    fn get_bit(&self, bit_offset: usize) -> bool {
        (self.bits[bit_offset / 32] & (1 << (bit_offset % 32))) != 0
    }

    // [26]
    pub fn set_can_generate_all_class_hook_events(&mut self, v: bool) { self.set_bit(26, v); }
    pub fn can_generate_all_class_hook_events(&self) -> bool { self.get_bit(26) }
}

// --- Function pointer types (only the slots the agent calls) ---
pub type JvmtiSetEventNotificationModeFn = unsafe extern "system" fn(env: *mut jvmtiEnv, mode: jint, event_type: u32, event_thread: jthread) -> jvmtiError;
pub type JvmtiAllocateFn = unsafe extern "system" fn(env: *mut jvmtiEnv, size: jlong, mem_ptr: *mut *mut c_uchar) -> jvmtiError;
pub type JvmtiDeallocateFn = unsafe extern "system" fn(env: *mut jvmtiEnv, mem: *mut c_uchar) -> jvmtiError;
pub type JvmtiSetEventCallbacksFn = unsafe extern "system" fn(env: *mut jvmtiEnv, callbacks: *const jvmtiEventCallbacks, size_of_callbacks: jint) -> jvmtiError;
pub type JvmtiAddCapabilitiesFn = unsafe extern "system" fn(env: *mut jvmtiEnv, capabilities_ptr: *const jvmtiCapabilities) -> jvmtiError;

// --- Event callback types ---
pub type JvmtiVMInitFn = unsafe extern "system" fn(
    jvmti_env: *mut jvmtiEnv,
    jni_env: *mut JNIEnv,
    thread: jthread,
);

pub type JvmtiVMDeathFn = unsafe extern "system" fn(jvmti_env: *mut jvmtiEnv, jni_env: *mut JNIEnv);

pub type JvmtiClassFileLoadHookFn = unsafe extern "system" fn(
    jvmti_env: *mut jvmtiEnv,
    jni_env: *mut JNIEnv,
    class_being_redefined: jclass,
    loader: jobject,
    name: *const c_char,
    protection_domain: jobject,
    class_data_len: jint,
    class_data: *const c_uchar,
    new_class_data_len: *mut jint,
    new_class_data: *mut *mut c_uchar,
);

// --- Function table ---
#[repr(C)]
pub struct jvmtiInterface_1_ {
    /*   1: RESERVED */
    pub reserved1: *mut c_void,
    /*   2: Set Event Notification Mode */
    pub SetEventNotificationMode: Option<JvmtiSetEventNotificationModeFn>,
    /*   3-45 */
    pub _slots_3_45: [*mut c_void; 43],
    /*  46: Allocate */
    pub Allocate: Option<JvmtiAllocateFn>,
    /*  47: Deallocate */
    pub Deallocate: Option<JvmtiDeallocateFn>,
    /*  48-121 */
    pub _slots_48_121: [*mut c_void; 74],
    /* 122: Set Event Callbacks */
    pub SetEventCallbacks: Option<JvmtiSetEventCallbacksFn>,
    /* 123-141 */
    pub _slots_123_141: [*mut c_void; 19],
    /* 142: Add Capabilities */
    pub AddCapabilities: Option<JvmtiAddCapabilitiesFn>,
    /* 143-156 */
    pub _slots_143_156: [*mut c_void; 14],
}

#[repr(C)]
pub struct jvmtiEnv {
    pub functions: *const jvmtiInterface_1_,
}

// --- Event callback table ---
//
// The first eight entries follow jvmti.h (events 50-57); the agent only
// fills VMInit, VMDeath and ClassFileLoadHook. The trailing slots cover
// events 58-88 and must stay null.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct jvmtiEventCallbacks {
    pub VMInit: Option<JvmtiVMInitFn>,
    pub VMDeath: Option<JvmtiVMDeathFn>,
    pub ThreadStart: *mut c_void,
    pub ThreadEnd: *mut c_void,
    pub ClassFileLoadHook: Option<JvmtiClassFileLoadHookFn>,
    pub ClassLoad: *mut c_void,
    pub ClassPrepare: *mut c_void,
    pub VMStart: *mut c_void,
    pub _events_58_88: [*mut c_void; 31],
}

impl Default for jvmtiEventCallbacks {
    fn default() -> Self {
        let null = std::ptr::null_mut();
        Self {
            VMInit: None,
            VMDeath: None,
            ThreadStart: null,
            ThreadEnd: null,
            ClassFileLoadHook: None,
            ClassLoad: null,
            ClassPrepare: null,
            VMStart: null,
            _events_58_88: [null; 31],
        }
    }
}

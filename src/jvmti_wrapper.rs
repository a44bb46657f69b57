// delver/src/jvmti_wrapper.rs
use crate::sys::jni;
use crate::sys::jvmti;
use std::ptr;

/// A safe wrapper around the raw JVMTI Environment pointer.
///
/// Only the calls the agent makes are exposed. A null slot in the VM's
/// function table surfaces as `NOT_AVAILABLE` instead of a panic.
pub struct Jvmti {
    env: *mut jvmti::jvmtiEnv,
}

// The JVMTI environment is valid on every thread for the lifetime of the VM.
unsafe impl Send for Jvmti {}
unsafe impl Sync for Jvmti {}

impl Jvmti {
    /// Connects to the JVM and retrieves the JVMTI environment.
    pub fn new(vm: *mut jni::JavaVM) -> Result<Self, jni::jint> {
        if vm.is_null() {
            return Err(jni::JNI_ERR);
        }
        let mut env_ptr: *mut std::ffi::c_void = ptr::null_mut();

        unsafe {
            // vm: *mut JavaVM = *mut *const JNIInvokeInterface_
            let get_env_fn = (**vm).GetEnv;
            let res = get_env_fn(vm, &mut env_ptr, jvmti::JVMTI_VERSION_1_2);
            if res != jni::JNI_OK {
                return Err(res);
            }
        }

        if env_ptr.is_null() {
            return Err(jni::JNI_ERR);
        }
        Ok(Jvmti {
            env: env_ptr as *mut jvmti::jvmtiEnv,
        })
    }

    fn functions(&self) -> &jvmti::jvmtiInterface_1_ {
        unsafe { &*(*self.env).functions }
    }

    pub fn add_capabilities(&self, new_caps: &jvmti::jvmtiCapabilities) -> Result<(), jvmti::jvmtiError> {
        let add_caps_fn = self.functions().AddCapabilities.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        let err = unsafe { add_caps_fn(self.env, new_caps) };
        if err != jvmti::jvmtiError::NONE {
            return Err(err);
        }
        Ok(())
    }

    pub fn set_event_callbacks(&self, callbacks: jvmti::jvmtiEventCallbacks) -> Result<(), jvmti::jvmtiError> {
        let set_callbacks_fn = self.functions().SetEventCallbacks.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        let size = std::mem::size_of::<jvmti::jvmtiEventCallbacks>() as jni::jint;

        let err = unsafe { set_callbacks_fn(self.env, &callbacks, size) };
        if err != jvmti::jvmtiError::NONE {
            return Err(err);
        }
        Ok(())
    }

    /// Enables or disables one event. A null `thread` means all threads.
    pub fn set_event_notification_mode(&self, enable: bool, event_type: u32, thread: jni::jthread) -> Result<(), jvmti::jvmtiError> {
        let set_mode_fn = self.functions().SetEventNotificationMode.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        let mode = if enable { jvmti::JVMTI_ENABLE } else { jvmti::JVMTI_DISABLE };

        let err = unsafe { set_mode_fn(self.env, mode, event_type, thread) };
        if err != jvmti::jvmtiError::NONE {
            return Err(err);
        }
        Ok(())
    }

    pub fn allocate(&self, size: jni::jlong) -> Result<*mut u8, jvmti::jvmtiError> {
        let allocate_fn = self.functions().Allocate.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        let mut mem_ptr: *mut u8 = ptr::null_mut();

        let err = unsafe { allocate_fn(self.env, size, &mut mem_ptr) };
        if err != jvmti::jvmtiError::NONE {
            return Err(err);
        }
        Ok(mem_ptr)
    }

    /// Copies `bytes` into JVMTI-managed memory, as ClassFileLoadHook
    /// requires for replacement class data. The VM takes ownership.
    pub fn copy_to_jvm(&self, bytes: &[u8]) -> Result<*mut u8, jvmti::jvmtiError> {
        let mem = self.allocate(bytes.len() as jni::jlong)?;
        if mem.is_null() {
            return Err(jvmti::jvmtiError::OUT_OF_MEMORY);
        }
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), mem, bytes.len()) };
        Ok(mem)
    }
}

//! High-level environment wrappers for JVMTI and JNI.
//!
//! [`Jvmti`] covers the agent's setup calls (capabilities, event callbacks,
//! notification modes) and the JVMTI allocator that replacement class data
//! must live in. [`JniEnv`] covers the probe bridge: defining a class from
//! bytes, binding its natives and reading `String` arguments.
//!
//! ```rust,ignore
//! use delver::prelude::*;
//!
//! fn on_load(vm: *mut jni::JavaVM) -> jni::jint {
//!     let jvmti = match Jvmti::new(vm) {
//!         Ok(env) => env,
//!         Err(_) => return jni::JNI_ERR,
//!     };
//!     let mut caps = jvmti::jvmtiCapabilities::default();
//!     caps.set_can_generate_all_class_hook_events(true);
//!     let _ = jvmti.add_capabilities(&caps);
//!     let _ = jvmti.set_event_callbacks(get_default_callbacks());
//!     jni::JNI_OK
//! }
//! ```

pub use crate::jni_wrapper::{JniEnv, LocalRef};
pub use crate::jvmti_wrapper::Jvmti;

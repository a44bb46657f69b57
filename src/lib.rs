//! # delver
//!
//! A JVMTI agent that records, per declared method, how often and how
//! expensively each method of the host application runs.
//!
//! Load it with:
//!
//! ```bash
//! java -agentpath:./target/release/libdelver.so=include=com\.example\..*,mode=timing MyApp
//! ```
//!
//! ## How it works
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  ClassFileLoadHook ──► ClassTransformer ──► policy       │
//! │        │                     │                            │
//! │        │          classfile + bytecode relocator          │
//! │        ▼                     ▼                            │
//! │  rewritten class     MetricsStore::register_known_zero    │
//! ├─────────────────────────────────────────────────────────┤
//! │  delver/Probe.hit / record  (natives, bootstrap loader)   │
//! │        │                                                  │
//! │        ▼                                                  │
//! │  MetricsStore (sharded map, per-key atomic update)        │
//! │        │                                                  │
//! │        ▼                                                  │
//! │  SnapshotScheduler ──► ~/.rattler/delver/delver-<date>.json│
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`sys::jni`], [`sys::jvmti`] | Raw FFI tables |
//! | [`env`] | `Jvmti` / `JniEnv` wrappers |
//! | [`classfile`] | Class file parser, writer, constant pool builder |
//! | [`descriptor`] | Type descriptors, access flags, initial frames |
//! | [`bytecode`] | Code body decoding and relocation |
//! | [`signature`] | Method identity |
//! | [`metrics`] | Concurrent metrics store and report writer |
//! | [`snapshot`] | Periodic JSON snapshot export |
//! | [`policy`] | Include/exclude decisions |
//! | [`config`] | Agent options and TOML configuration |
//! | [`transformer`] | Per-class rewrite with fail-open fallback |
//! | [`probe`] | The `delver/Probe` class and its native methods |
//! | [`agent`] | `DelverAgent`, wired into the JVM lifecycle |
//!
//! ## Agent options
//!
//! Comma-separated `key=value` pairs: `config=<file.toml>`, `include=<regex>`,
//! `exclude=<regex>`, `mode=count|timing`, `snapshot=on|off`,
//! `report=<path>`, `log=<level>`. Without any include or exclude pattern the
//! agent loads but leaves every class untouched.

pub mod sys;
pub mod env;

// Implementation modules (use `env` module for the public API)
#[doc(hidden)]
pub mod jvmti_wrapper;
#[doc(hidden)]
pub mod jni_wrapper;

pub mod prelude;

pub mod agent;
pub mod bytecode;
pub mod classfile;
pub mod config;
pub mod descriptor;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod probe;
pub mod signature;
pub mod snapshot;
pub mod transformer;

use std::os::raw::{c_char, c_uchar};
use std::sync::OnceLock;
pub use crate::sys::jni as jni;
use crate::sys::jvmti as jvmti;

/// The core trait for a JVMTI agent.
///
/// Event methods default to no-ops. The agent must be `Sync + Send`
/// because JVMTI events fire on arbitrary threads.
pub trait Agent: Sync + Send {
    /// Called when the agent is loaded into the JVM.
    ///
    /// Return `JNI_OK` (0) on success, or `JNI_ERR` (-1) to abort VM startup.
    fn on_load(&self, vm: *mut jni::JavaVM, options: &str) -> jni::jint;

    /// Called when the agent is unloaded (JVM shutdown).
    fn on_unload(&self) {}

    /// Called once the VM is fully initialized. JNI calls are safe from here on.
    fn vm_init(&self, _jni: *mut jni::JNIEnv, _thread: jni::jthread) {}

    /// Called right before the VM terminates.
    fn vm_death(&self, _jni: *mut jni::JNIEnv) {}

    /// Hook for bytecode instrumentation. To replace the class:
    /// 1. Allocate memory with `Jvmti::allocate()`
    /// 2. Write the modified class file to it
    /// 3. Set `new_class_data_len` and `new_class_data`
    ///
    /// Requires `can_generate_all_class_hook_events`.
    #[allow(clippy::too_many_arguments)]
    fn class_file_load_hook(&self, _jni: *mut jni::JNIEnv, _class_being_redefined: jni::jclass,
                            _loader: jni::jobject, _name: *const c_char,
                            _protection_domain: jni::jobject, _class_data_len: jni::jint,
                            _class_data: *const c_uchar,
                            _new_class_data_len: *mut jni::jint,
                            _new_class_data: *mut *mut c_uchar) {}
}

// This holds the Agent instance so static C functions can find it.
pub static GLOBAL_AGENT: OnceLock<Box<dyn Agent>> = OnceLock::new();

/// Helper to initialize the global agent (called by the macro)
pub fn set_global_agent(agent: Box<dyn Agent>) -> Result<(), ()> {
    GLOBAL_AGENT.set(agent).map_err(|_| ())
}

unsafe extern "system" fn trampoline_vm_init(_env: *mut jvmti::jvmtiEnv, jni: *mut jni::JNIEnv, thread: jni::jthread) {
    if let Some(agent) = GLOBAL_AGENT.get() { agent.vm_init(jni, thread); }
}
unsafe extern "system" fn trampoline_vm_death(_env: *mut jvmti::jvmtiEnv, jni: *mut jni::JNIEnv) {
    if let Some(agent) = GLOBAL_AGENT.get() { agent.vm_death(jni); }
}
unsafe extern "system" fn trampoline_class_file_load_hook(
    _env: *mut jvmti::jvmtiEnv, jni: *mut jni::JNIEnv,
    class_being_redefined: jni::jclass, loader: jni::jobject, name: *const c_char,
    protection_domain: jni::jobject, class_data_len: jni::jint, class_data: *const c_uchar,
    new_class_data_len: *mut jni::jint, new_class_data: *mut *mut c_uchar
) {
    if let Some(agent) = GLOBAL_AGENT.get() {
        agent.class_file_load_hook(jni, class_being_redefined, loader, name, protection_domain, class_data_len, class_data, new_class_data_len, new_class_data);
    }
}

/// Returns a `jvmtiEventCallbacks` struct routing VMInit, VMDeath and
/// ClassFileLoadHook to the global [`Agent`].
///
/// Events still have to be enabled with
/// [`env::Jvmti::set_event_notification_mode`].
pub fn get_default_callbacks() -> jvmti::jvmtiEventCallbacks {
    let mut callbacks = jvmti::jvmtiEventCallbacks::default();

    callbacks.VMInit = Some(trampoline_vm_init);
    callbacks.VMDeath = Some(trampoline_vm_death);
    callbacks.ClassFileLoadHook = Some(trampoline_class_file_load_hook);

    callbacks
}

/// Exports an agent type as a loadable JVMTI agent library.
///
/// Generates the `Agent_OnLoad` and `Agent_OnUnload` entry points the JVM
/// looks up for `-agentpath`. The type must implement [`Agent`] and
/// [`Default`]; exactly one instance is created per VM.
///
/// The options string (everything after `=` in `-agentpath`) is passed to
/// [`Agent::on_load`].
#[macro_export]
macro_rules! export_agent {
    ($agent_type:ty) => {
        #[no_mangle]
        pub unsafe extern "system" fn Agent_OnLoad(
            vm: *mut $crate::sys::jni::JavaVM,
            options: *mut std::ffi::c_char,
            _reserved: *mut std::ffi::c_void,
        ) -> $crate::sys::jni::jint {

            let agent = Box::new(<$agent_type>::default());
            if $crate::set_global_agent(agent).is_err() {
                return $crate::sys::jni::JNI_ERR;
            }

            let options_str = if options.is_null() {
                ""
            } else {
                std::ffi::CStr::from_ptr(options).to_str().unwrap_or("")
            };

            if let Some(global_agent) = $crate::GLOBAL_AGENT.get() {
                return global_agent.on_load(vm, options_str);
            }

            $crate::sys::jni::JNI_ERR
        }

        #[no_mangle]
        pub unsafe extern "system" fn Agent_OnUnload(_vm: *mut $crate::sys::jni::JavaVM) {
            if let Some(agent) = $crate::GLOBAL_AGENT.get() {
                agent.on_unload();
            }
        }
    };
}

export_agent!(agent::DelverAgent);

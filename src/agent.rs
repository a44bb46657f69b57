//! `DelverAgent`: the exported JVMTI agent.
//!
//! | Event | Action |
//! |-------|--------|
//! | `Agent_OnLoad` | logging, configuration, JVMTI capabilities and events |
//! | `VMInit` | define `delver/Probe`, start instrumenting, start snapshots |
//! | `ClassFileLoadHook` | hand each new class to the [`ClassTransformer`] |
//! | `VMDeath` | stop snapshots, write a last snapshot and the full report |

use crate::classfile::decode_modified_utf8;
use crate::config::AgentConfig;
use crate::env::{JniEnv, Jvmti};
use crate::metrics::MetricsStore;
use crate::probe;
use crate::snapshot::{SnapshotHandle, SnapshotScheduler};
use crate::sys::{jni, jvmti};
use crate::transformer::{ClassLoaderRef, ClassTransformer};
use crate::{get_default_callbacks, logging, Agent};
use chrono::Local;
use std::borrow::Cow;
use std::ffi::CStr;
use std::fs::File;
use std::io::BufWriter;
use std::os::raw::{c_char, c_uchar};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, error, info, warn};

#[derive(Default)]
pub struct DelverAgent {
    jvmti: OnceLock<Jvmti>,
    config: OnceLock<AgentConfig>,
    transformer: OnceLock<ClassTransformer>,
    snapshots: Mutex<Option<SnapshotHandle>>,
}

impl DelverAgent {
    fn write_report(&self, config: &AgentConfig, store: &MetricsStore) {
        let Some(path) = &config.report else {
            return;
        };
        let written = File::create(path).and_then(|file| store.write_report(&mut BufWriter::new(file), true));
        match written {
            Ok(()) => info!(path = %path.display(), entries = store.len(), "report written"),
            Err(e) => error!(path = %path.display(), error = %e, "cannot write report"),
        }
    }
}

impl Agent for DelverAgent {
    fn on_load(&self, vm: *mut jni::JavaVM, options: &str) -> jni::jint {
        let parsed = AgentConfig::parse_options(options);
        let mut config = match parsed {
            Ok(config) => {
                logging::init(&config.log_level);
                config
            }
            Err(e) => {
                logging::init("info");
                error!(error = %e, "invalid agent options; classes will not be instrumented");
                AgentConfig::default()
            }
        };

        let policy = match config.resolve_policy() {
            Ok(Some(policy)) => Some(policy),
            Ok(None) => {
                warn!("no include or exclude pattern configured; classes will not be instrumented");
                None
            }
            Err(e) => {
                error!(error = %e, "invalid class pattern; classes will not be instrumented");
                None
            }
        };

        let store = Arc::new(MetricsStore::new());
        let store = match MetricsStore::install(store.clone()) {
            Ok(()) => store,
            Err(_) => {
                debug!("metrics store already installed");
                MetricsStore::global()
            }
        };
        let transformer = ClassTransformer::new(policy, store, config.mode);
        transformer.set_live(false);

        let env = match Jvmti::new(vm) {
            Ok(env) => env,
            Err(code) => {
                error!(code, "cannot obtain a JVMTI environment");
                return jni::JNI_ERR;
            }
        };

        let mut caps = jvmti::jvmtiCapabilities::default();
        caps.set_can_generate_all_class_hook_events(true);
        if let Err(e) = env.add_capabilities(&caps) {
            warn!(error = %e, "can_generate_all_class_hook_events unavailable");
        }

        info!(mode = ?config.mode, snapshot = config.snapshot_enabled, "delver loaded");
        let _ = self.config.set(config);
        let _ = self.transformer.set(transformer);

        if let Err(e) = env.set_event_callbacks(get_default_callbacks()) {
            error!(error = %e, "cannot register event callbacks");
            let _ = self.jvmti.set(env);
            return jni::JNI_OK;
        }
        for event in [
            jvmti::JVMTI_EVENT_VM_INIT,
            jvmti::JVMTI_EVENT_VM_DEATH,
            jvmti::JVMTI_EVENT_CLASS_FILE_LOAD_HOOK,
        ] {
            if let Err(e) = env.set_event_notification_mode(true, event, ptr::null_mut()) {
                warn!(event, error = %e, "cannot enable event");
            }
        }
        let _ = self.jvmti.set(env);
        jni::JNI_OK
    }

    fn vm_init(&self, jni: *mut jni::JNIEnv, _thread: jni::jthread) {
        let (Some(transformer), Some(config)) = (self.transformer.get(), self.config.get()) else {
            return;
        };
        let env = unsafe { JniEnv::from_raw(jni) };

        match probe::install(&env, transformer.store().clone()) {
            Ok(()) => {
                transformer.set_live(true);
                debug!("probe installed");
            }
            Err(e) => error!(error = %e, "cannot install probe; classes will not be instrumented"),
        }

        if config.snapshot_enabled {
            match SnapshotScheduler::start(transformer.store().clone(), config.snapshot.clone()) {
                Ok(handle) => {
                    if let Ok(mut slot) = self.snapshots.lock() {
                        *slot = Some(handle);
                    }
                }
                Err(e) => error!(error = %e, "cannot start snapshot thread"),
            }
        }
    }

    fn vm_death(&self, _jni: *mut jni::JNIEnv) {
        let (Some(transformer), Some(config)) = (self.transformer.get(), self.config.get()) else {
            return;
        };
        transformer.set_live(false);

        let handle = self.snapshots.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.shutdown();
            let last = config
                .snapshot
                .resolve_directory()
                .and_then(|dir| SnapshotScheduler::tick(transformer.store(), &dir, Local::now()));
            if let Err(e) = last {
                error!(error = %e, "final snapshot failed");
            }
        }

        self.write_report(config, transformer.store());
    }

    #[allow(clippy::too_many_arguments)]
    fn class_file_load_hook(
        &self,
        _jni: *mut jni::JNIEnv,
        class_being_redefined: jni::jclass,
        loader: jni::jobject,
        name: *const c_char,
        _protection_domain: jni::jobject,
        class_data_len: jni::jint,
        class_data: *const c_uchar,
        new_class_data_len: *mut jni::jint,
        new_class_data: *mut *mut c_uchar,
    ) {
        if !class_being_redefined.is_null() || name.is_null() || class_data.is_null() || class_data_len <= 0 {
            return;
        }
        let (Some(transformer), Some(jvmti)) = (self.transformer.get(), self.jvmti.get()) else {
            return;
        };

        let _ = panic::catch_unwind(AssertUnwindSafe(|| {
            let raw_name = unsafe { CStr::from_ptr(name) };
            let Ok(class_name) = decode_modified_utf8(raw_name.to_bytes()) else {
                return;
            };
            let bytes = unsafe { std::slice::from_raw_parts(class_data, class_data_len as usize) };

            if let Cow::Owned(rewritten) = transformer.transform(ClassLoaderRef(loader), &class_name, bytes) {
                let Ok(len) = jni::jint::try_from(rewritten.len()) else {
                    return;
                };
                match jvmti.copy_to_jvm(&rewritten) {
                    Ok(mem) => unsafe {
                        *new_class_data_len = len;
                        *new_class_data = mem;
                    },
                    Err(e) => warn!(class = %class_name, error = %e, "cannot hand rewritten class to the JVM"),
                }
            }
        }));
    }
}

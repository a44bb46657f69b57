//! Common imports for embedding the instrumentation pipeline.
//!
//! Small on purpose: the store, the transformer and what they need to be
//! constructed, plus the FFI pieces an agent entry point touches.

pub use crate::env::{JniEnv, Jvmti, LocalRef};
pub use crate::get_default_callbacks;
pub use crate::metrics::{MetricsStore, ProbeMode};
pub use crate::policy::{InclusionPolicy, PatternPolicy};
pub use crate::signature::Signature;
pub use crate::sys::{jni, jvmti};
pub use crate::transformer::ClassTransformer;
pub use crate::Agent;

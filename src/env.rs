//! Safe wrappers around the JVMTI and JNI environments.
//!
//! Only the calls the engine needs are wrapped: capabilities, event
//! setup, JVMTI memory, loaded classes and retransformation on the JVMTI
//! side; class loader introspection on the JNI side.
//!
//! ```rust,ignore
//! use apm_bci::env::Jvmti;
//! use apm_bci::sys::jvmti;
//!
//! let env = Jvmti::new(vm)?;
//! let mut caps = jvmti::jvmtiCapabilities::default();
//! caps.set_can_retransform_classes(true);
//! env.add_capabilities(&caps)?;
//! let classes = env.get_loaded_classes()?;
//! env.retransform_classes(&classes)?;
//! ```
//!
//! # Reference Guards
//!
//! [`LocalRef`] deletes a JNI local reference when dropped. Loader walks
//! inside `ClassFileLoadHook` create many of them, and the hook's local
//! frame is small.

pub use crate::jni_wrapper::{JniEnv, LocalRef};
pub use crate::jvmti_wrapper::Jvmti;

//! Raw JNI and JVMTI ABI declarations.
//!
//! Only the functions the engine calls are named; everything else in the
//! function tables is padding. Use the wrappers in [`crate::env`] instead
//! of calling through these tables directly.

pub mod jni;
pub mod jvmti;

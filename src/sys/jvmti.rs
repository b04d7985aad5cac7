// apm-bci/src/sys/jvmti.rs
//
// The slice of the JVMTI ABI the instrumentation engine touches: class
// file load hooks, retransformation, loaded-class enumeration and the
// bookkeeping around them (capabilities, callbacks, memory).
//
// The function table is declared up to RetransformClasses (position 152).
// Unused positions are opaque padding. Position numbers below are 1-based,
// matching the comments in jvmti.h.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use std::os::raw::{c_char, c_uchar};
use crate::sys::jni::{jboolean, jclass, jint, jlong, jobject, jthread, JNIEnv, Slot};

// --- Constants ---
pub const JVMTI_VERSION_1_2: jint = 0x30010200;

pub const JVMTI_EVENT_VM_INIT: u32 = 50;
pub const JVMTI_EVENT_VM_DEATH: u32 = 51;
pub const JVMTI_EVENT_CLASS_FILE_LOAD_HOOK: u32 = 54;

pub const JVMTI_ENABLE: jint = 1;
pub const JVMTI_DISABLE: jint = 0;

// --- Error Codes ---

/// A JVMTI error code. Kept open (not an enum) because a JVM may hand back
/// codes newer than the ones named here.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct jvmtiError(pub u32);

impl jvmtiError {
    pub const NONE: Self = Self(0);
    pub const INVALID_CLASS: Self = Self(21);
    pub const INVALID_CLASS_FORMAT: Self = Self(60);
    pub const CIRCULAR_CLASS_DEFINITION: Self = Self(61);
    pub const FAILS_VERIFICATION: Self = Self(62);
    pub const UNSUPPORTED_REDEFINITION_METHOD_ADDED: Self = Self(63);
    pub const UNSUPPORTED_REDEFINITION_SCHEMA_CHANGED: Self = Self(64);
    pub const UNSUPPORTED_VERSION: Self = Self(68);
    pub const UNMODIFIABLE_CLASS: Self = Self(79);
    pub const NOT_AVAILABLE: Self = Self(98);
    pub const MUST_POSSESS_CAPABILITY: Self = Self(99);
    pub const NULL_POINTER: Self = Self(100);
    pub const ILLEGAL_ARGUMENT: Self = Self(103);
    pub const OUT_OF_MEMORY: Self = Self(110);
    pub const WRONG_PHASE: Self = Self(112);
    pub const INTERNAL: Self = Self(113);
}

// --- Capabilities ---
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct jvmtiCapabilities {
    bits: [u32; 4],
}

impl Default for jvmtiCapabilities {
    fn default() -> Self { Self { bits: [0; 4] } }
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
    // [37]
    pub fn set_can_retransform_classes(&mut self, v: bool) { self.set_bit(37, v); }
    pub fn can_retransform_classes(&self) -> bool { self.get_bit(37) }
    // [38]
    pub fn set_can_retransform_any_class(&mut self, v: bool) { self.set_bit(38, v); }
    pub fn can_retransform_any_class(&self) -> bool { self.get_bit(38) }
}

// --- Event callbacks ---
pub type JvmtiVMInitFn = unsafe extern "system" fn(jvmti_env: *mut jvmtiEnv, jni_env: *mut JNIEnv, thread: jthread);
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

/// One slot per event, 50 (VMInit) through 86 (SampledObjectAlloc).
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct jvmtiEventCallbacks {
    pub VMInit: Option<JvmtiVMInitFn>,
    pub VMDeath: Option<JvmtiVMDeathFn>,
    pub ThreadStart: Slot,
    pub ThreadEnd: Slot,
    pub ClassFileLoadHook: Option<JvmtiClassFileLoadHookFn>,
    _rest55_86: [Slot; 32],
}

// --- Functions ---
pub type JvmtiSetEventNotificationModeFn =
    unsafe extern "system" fn(env: *mut jvmtiEnv, mode: jint, event_type: u32, event_thread: jthread) -> jvmtiError;
pub type JvmtiIsModifiableClassFn =
    unsafe extern "system" fn(env: *mut jvmtiEnv, klass: jclass, is_modifiable_class_ptr: *mut jboolean) -> jvmtiError;
pub type JvmtiAllocateFn = unsafe extern "system" fn(env: *mut jvmtiEnv, size: jlong, mem_ptr: *mut *mut c_uchar) -> jvmtiError;
pub type JvmtiDeallocateFn = unsafe extern "system" fn(env: *mut jvmtiEnv, mem: *mut c_uchar) -> jvmtiError;
pub type JvmtiGetClassSignatureFn = unsafe extern "system" fn(
    env: *mut jvmtiEnv,
    klass: jclass,
    signature_ptr: *mut *mut c_char,
    generic_ptr: *mut *mut c_char,
) -> jvmtiError;
pub type JvmtiGetClassLoaderFn = unsafe extern "system" fn(env: *mut jvmtiEnv, klass: jclass, classloader_ptr: *mut jobject) -> jvmtiError;
pub type JvmtiGetLoadedClassesFn =
    unsafe extern "system" fn(env: *mut jvmtiEnv, class_count_ptr: *mut jint, classes_ptr: *mut *mut jclass) -> jvmtiError;
pub type JvmtiSetEventCallbacksFn =
    unsafe extern "system" fn(env: *mut jvmtiEnv, callbacks: *const jvmtiEventCallbacks, size_of_callbacks: jint) -> jvmtiError;
pub type JvmtiGetErrorNameFn = unsafe extern "system" fn(env: *mut jvmtiEnv, error: jvmtiError, name_ptr: *mut *mut c_char) -> jvmtiError;
pub type JvmtiAddCapabilitiesFn = unsafe extern "system" fn(env: *mut jvmtiEnv, capabilities_ptr: *const jvmtiCapabilities) -> jvmtiError;
pub type JvmtiAddToBootstrapClassLoaderSearchFn = unsafe extern "system" fn(env: *mut jvmtiEnv, segment: *const c_char) -> jvmtiError;
pub type JvmtiRetransformClassesFn = unsafe extern "system" fn(env: *mut jvmtiEnv, class_count: jint, classes: *const jclass) -> jvmtiError;

#[repr(C)]
pub struct jvmtiInterface_1_ {
    /*   1:  RESERVED */
    _reserved1: Slot,
    /*   2: Set Event Notification Mode */
    pub SetEventNotificationMode: Option<JvmtiSetEventNotificationModeFn>,
    /*   3-44: threads, frames, heap, locals, breakpoints, watches */
    _skip3_44: [Slot; 42],
    /*   45: Is Modifiable Class */
    pub IsModifiableClass: Option<JvmtiIsModifiableClassFn>,
    /*   46: Allocate */
    pub Allocate: Option<JvmtiAllocateFn>,
    /*   47: Deallocate */
    pub Deallocate: Option<JvmtiDeallocateFn>,
    /*   48: Get Class Signature */
    pub GetClassSignature: Option<JvmtiGetClassSignatureFn>,
    /*   49-56: class status, source file, modifiers, methods, fields, interfaces */
    _skip49_56: [Slot; 8],
    /*   57: Get Class Loader */
    pub GetClassLoader: Option<JvmtiGetClassLoaderFn>,
    /*   58-77: object, field and method introspection */
    _skip58_77: [Slot; 20],
    /*   78: Get Loaded Classes */
    pub GetLoadedClasses: Option<JvmtiGetLoadedClassesFn>,
    /*   79-121: class loader classes, frames, redefinition, monitors, modules */
    _skip79_121: [Slot; 43],
    /*   122: Set Event Callbacks */
    pub SetEventCallbacks: Option<JvmtiSetEventCallbacksFn>,
    /*   123-127: extension events, timers */
    _skip123_127: [Slot; 5],
    /*   128: Get Error Name */
    pub GetErrorName: Option<JvmtiGetErrorNameFn>,
    /*   129-141: JLocation format, properties, phase, environment storage */
    _skip129_141: [Slot; 13],
    /*   142: Add Capabilities */
    pub AddCapabilities: Option<JvmtiAddCapabilitiesFn>,
    /*   143-148: capability queries, timers, processors */
    _skip143_148: [Slot; 6],
    /*   149: Add To Bootstrap Class Loader Search */
    pub AddToBootstrapClassLoaderSearch: Option<JvmtiAddToBootstrapClassLoaderSearchFn>,
    /*   150-151: verbose flag, system class loader search */
    _skip150_151: [Slot; 2],
    /*   152: Retransform Classes */
    pub RetransformClasses: Option<JvmtiRetransformClassesFn>,
}

#[repr(C)]
pub struct jvmtiEnv {
    pub functions: *const jvmtiInterface_1_,
}

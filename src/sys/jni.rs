// apm-bci/src/sys/jni.rs
//
// The slice of the JNI ABI the instrumentation engine touches.
//
// The JNIEnv function table is declared up to ExceptionCheck (index 228).
// Slots the engine never calls are kept as opaque padding so every named
// slot still sits at the offset jni.h gives it. The table has only grown
// at the end since JDK 1.6, so the layout holds for JDK 8+.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(dead_code)]

use std::ffi::c_void;
use std::os::raw::c_char;

// =============================================================================
// Primitive Types
// =============================================================================

pub type jint = i32;
pub type jlong = i64;
pub type jbyte = i8;
pub type jboolean = u8;
pub type jsize = jint;

// =============================================================================
// Reference Types (opaque pointers)
// =============================================================================

pub type jobject = *mut c_void;
pub type jclass = jobject;
pub type jstring = jobject;
pub type jarray = jobject;
pub type jthread = jobject;
pub type jbyteArray = jarray;

#[repr(C)]
pub struct _jmethodID {
    _private: [u8; 0],
}
pub type jmethodID = *mut _jmethodID;

/// Argument slot for the `Call*MethodA` family.
#[repr(C)]
#[derive(Copy, Clone)]
pub union jvalue {
    pub z: jboolean,
    pub i: jint,
    pub j: jlong,
    pub l: jobject,
}

// =============================================================================
// Constants
// =============================================================================

pub const JNI_FALSE: jboolean = 0;
pub const JNI_TRUE: jboolean = 1;

pub const JNI_OK: jint = 0;
pub const JNI_ERR: jint = -1;
pub const JNI_EDETACHED: jint = -2;
pub const JNI_EVERSION: jint = -3;

pub const JNI_VERSION_1_6: jint = 0x00010006;
pub const JNI_VERSION_1_8: jint = 0x00010008;

/// A function-table slot the engine never calls.
pub type Slot = Option<unsafe extern "system" fn()>;

// =============================================================================
// JNINativeInterface_ - The JNIEnv function table
// =============================================================================

#[repr(C)]
pub struct JNINativeInterface_ {
    /*   0-3: reserved, 4: GetVersion, 5: DefineClass */
    _reserved0_5: [Slot; 6],
    /*   6 */
    pub FindClass: unsafe extern "system" fn(env: *mut JNIEnv, name: *const c_char) -> jclass,
    /*   7-16: reflection, superclass, Throw* */
    _skip7_16: [Slot; 10],
    /*  17 */
    pub ExceptionClear: unsafe extern "system" fn(env: *mut JNIEnv),
    /*  18-20: FatalError, Push/PopLocalFrame */
    _skip18_20: [Slot; 3],
    /*  21 */
    pub NewGlobalRef: unsafe extern "system" fn(env: *mut JNIEnv, obj: jobject) -> jobject,
    /*  22 */
    pub DeleteGlobalRef: unsafe extern "system" fn(env: *mut JNIEnv, gref: jobject),
    /*  23 */
    pub DeleteLocalRef: unsafe extern "system" fn(env: *mut JNIEnv, obj: jobject),
    /*  24-30: IsSameObject .. NewObjectA */
    _skip24_30: [Slot; 7],
    /*  31 */
    pub GetObjectClass: unsafe extern "system" fn(env: *mut JNIEnv, obj: jobject) -> jclass,
    /*  32: IsInstanceOf */
    _skip32: [Slot; 1],
    /*  33 */
    pub GetMethodID: unsafe extern "system" fn(
        env: *mut JNIEnv,
        clazz: jclass,
        name: *const c_char,
        sig: *const c_char,
    ) -> jmethodID,
    /*  34-35: CallObjectMethod, CallObjectMethodV */
    _skip34_35: [Slot; 2],
    /*  36 */
    pub CallObjectMethodA: unsafe extern "system" fn(
        env: *mut JNIEnv,
        obj: jobject,
        method_id: jmethodID,
        args: *const jvalue,
    ) -> jobject,
    /*  37-62: Call<Boolean..Double>Method* */
    _skip37_62: [Slot; 26],
    /*  63 */
    pub CallVoidMethodA: unsafe extern "system" fn(env: *mut JNIEnv, obj: jobject, method_id: jmethodID, args: *const jvalue),
    /*  64-166: nonvirtual calls, field access, statics, strings */
    _skip64_166: [Slot; 103],
    /* 167 */
    pub NewStringUTF: unsafe extern "system" fn(env: *mut JNIEnv, utf: *const c_char) -> jstring,
    /* 168: GetStringUTFLength */
    _skip168: [Slot; 1],
    /* 169 */
    pub GetStringUTFChars:
        unsafe extern "system" fn(env: *mut JNIEnv, string: jstring, is_copy: *mut jboolean) -> *const c_char,
    /* 170 */
    pub ReleaseStringUTFChars: unsafe extern "system" fn(env: *mut JNIEnv, string: jstring, utf: *const c_char),
    /* 171 */
    pub GetArrayLength: unsafe extern "system" fn(env: *mut JNIEnv, array: jarray) -> jsize,
    /* 172-199: object arrays, New/Get/Release<Prim>Array* */
    _skip172_199: [Slot; 28],
    /* 200 */
    pub GetByteArrayRegion: unsafe extern "system" fn(
        env: *mut JNIEnv,
        array: jbyteArray,
        start: jsize,
        len: jsize,
        buf: *mut jbyte,
    ),
    /* 201-227: remaining regions, natives, monitors, critical sections, weak refs */
    _skip201_227: [Slot; 27],
    /* 228 */
    pub ExceptionCheck: unsafe extern "system" fn(env: *mut JNIEnv) -> jboolean,
}

/// JNIEnv is directly the vtable pointer (C ABI definition).
pub type JNIEnv = *const JNINativeInterface_;

// =============================================================================
// JNIInvokeInterface_ - The JavaVM function table
// =============================================================================

#[repr(C)]
pub struct JNIInvokeInterface_ {
    pub reserved0: *mut c_void,
    pub reserved1: *mut c_void,
    pub reserved2: *mut c_void,

    pub DestroyJavaVM: Slot,
    pub AttachCurrentThread: Slot,
    pub DetachCurrentThread: Slot,
    pub GetEnv: unsafe extern "system" fn(vm: *mut JavaVM, penv: *mut *mut c_void, version: jint) -> jint,
}

/// JavaVM is directly the vtable pointer (C ABI definition).
pub type JavaVM = *const JNIInvokeInterface_;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_slots_sit_at_jni_h_offsets() {
        let slot = std::mem::size_of::<Slot>();
        assert_eq!(std::mem::offset_of!(JNINativeInterface_, FindClass), 6 * slot);
        assert_eq!(std::mem::offset_of!(JNINativeInterface_, DeleteLocalRef), 23 * slot);
        assert_eq!(std::mem::offset_of!(JNINativeInterface_, CallObjectMethodA), 36 * slot);
        assert_eq!(std::mem::offset_of!(JNINativeInterface_, CallVoidMethodA), 63 * slot);
        assert_eq!(std::mem::offset_of!(JNINativeInterface_, NewStringUTF), 167 * slot);
        assert_eq!(std::mem::offset_of!(JNINativeInterface_, GetByteArrayRegion), 200 * slot);
        assert_eq!(std::mem::offset_of!(JNINativeInterface_, ExceptionCheck), 228 * slot);
        assert_eq!(std::mem::offset_of!(JNIInvokeInterface_, GetEnv), 6 * slot);
    }
}

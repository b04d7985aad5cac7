//! Safe wrapper around the JNI environment.
//!
//! The engine only talks to Java for class-loader introspection: a loader's
//! runtime type, its parent, whether it can load the hook class, and the
//! raw bytes of a class file it can see. Every call that can throw leaves
//! the exception pending; [`JniEnv::take_exception`] clears it.
//!
//! # Example
//!
//! ```rust,ignore
//! use apm_bci::env::{JniEnv, LocalRef};
//!
//! fn loader_type(env: &JniEnv, loader: jni::jobject) -> Option<String> {
//!     let class = LocalRef::new(env, env.get_object_class(loader));
//!     let get_name = env.get_method_id(env.find_class("java/lang/Class")?, "getName", "()Ljava/lang/String;")?;
//!     let name = LocalRef::new(env, env.call_object_method(class.get(), get_name, &[]));
//!     if env.take_exception() {
//!         return None;
//!     }
//!     env.get_string_utf(name.get())
//! }
//! ```

use crate::sys::jni;
use std::ffi::{CStr, CString};
use std::ptr;

/// Safe wrapper around a JNI environment pointer.
///
/// # Thread Safety
///
/// A `JniEnv` is tied to a specific thread and cannot be sent across threads.
/// Each JVM thread has its own JNI environment.
pub struct JniEnv {
    env: *mut jni::JNIEnv,
}

impl JniEnv {
    /// Creates a JniEnv wrapper from a raw pointer.
    ///
    /// # Safety
    ///
    /// The caller must ensure the pointer is valid and comes from the current thread.
    pub unsafe fn from_raw(env: *mut jni::JNIEnv) -> Self {
        JniEnv { env }
    }

    /// Attaches to the JNI environment of the calling thread, if it is
    /// already attached to `vm`.
    ///
    /// # Safety
    ///
    /// `vm` must be a live JavaVM pointer.
    pub unsafe fn for_current_thread(vm: *mut jni::JavaVM) -> Option<Self> {
        let mut env_ptr: *mut std::ffi::c_void = ptr::null_mut();
        let get_env_fn = (**vm).GetEnv;
        if get_env_fn(vm, &mut env_ptr, jni::JNI_VERSION_1_6) != jni::JNI_OK || env_ptr.is_null() {
            return None;
        }
        Some(JniEnv { env: env_ptr as *mut jni::JNIEnv })
    }

    /// Returns the raw JNI environment pointer.
    pub fn raw(&self) -> *mut jni::JNIEnv {
        self.env
    }

    // =========================================================================
    // Classes and methods
    // =========================================================================

    /// Finds a class by its internal name (e.g. "java/lang/ClassLoader").
    pub fn find_class(&self, name: &str) -> Option<jni::jclass> {
        let c_name = CString::new(name).ok()?;
        unsafe {
            let vtable = *self.env;
            let cls = ((*vtable).FindClass)(self.env, c_name.as_ptr());
            if cls.is_null() {
                self.take_exception();
                None
            } else {
                Some(cls)
            }
        }
    }

    /// Gets the class of an object.
    pub fn get_object_class(&self, obj: jni::jobject) -> jni::jclass {
        unsafe {
            let vtable = *self.env;
            ((*vtable).GetObjectClass)(self.env, obj)
        }
    }

    /// Gets the method ID for an instance method.
    pub fn get_method_id(&self, cls: jni::jclass, name: &str, sig: &str) -> Option<jni::jmethodID> {
        let c_name = CString::new(name).ok()?;
        let c_sig = CString::new(sig).ok()?;
        unsafe {
            let vtable = *self.env;
            let mid = ((*vtable).GetMethodID)(self.env, cls, c_name.as_ptr(), c_sig.as_ptr());
            if mid.is_null() {
                self.take_exception();
                None
            } else {
                Some(mid)
            }
        }
    }

    /// Calls an instance method returning an object.
    pub fn call_object_method(&self, obj: jni::jobject, method_id: jni::jmethodID, args: &[jni::jvalue]) -> jni::jobject {
        unsafe {
            let vtable = *self.env;
            ((*vtable).CallObjectMethodA)(self.env, obj, method_id, args.as_ptr())
        }
    }

    /// Calls an instance method returning nothing.
    pub fn call_void_method(&self, obj: jni::jobject, method_id: jni::jmethodID, args: &[jni::jvalue]) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).CallVoidMethodA)(self.env, obj, method_id, args.as_ptr())
        }
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    /// Checks if an exception is pending.
    pub fn exception_check(&self) -> bool {
        unsafe {
            let vtable = *self.env;
            ((*vtable).ExceptionCheck)(self.env) != 0
        }
    }

    /// Clears any pending exception.
    pub fn exception_clear(&self) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).ExceptionClear)(self.env);
        }
    }

    /// Clears a pending exception, returning whether there was one.
    pub fn take_exception(&self) -> bool {
        if self.exception_check() {
            self.exception_clear();
            true
        } else {
            false
        }
    }

    // =========================================================================
    // Strings and arrays
    // =========================================================================

    /// Creates a new Java string from a Rust string.
    pub fn new_string_utf(&self, s: &str) -> Option<jni::jstring> {
        let c_str = CString::new(s).ok()?;
        unsafe {
            let vtable = *self.env;
            let jstr = ((*vtable).NewStringUTF)(self.env, c_str.as_ptr());
            if jstr.is_null() {
                self.take_exception();
                None
            } else {
                Some(jstr)
            }
        }
    }

    /// Gets a Rust string from a Java string.
    ///
    /// Returns `None` if the string is null.
    pub fn get_string_utf(&self, s: jni::jstring) -> Option<String> {
        if s.is_null() {
            return None;
        }
        unsafe {
            let vtable = *self.env;
            let chars = ((*vtable).GetStringUTFChars)(self.env, s, ptr::null_mut());
            if chars.is_null() {
                return None;
            }
            let result = CStr::from_ptr(chars).to_string_lossy().into_owned();
            ((*vtable).ReleaseStringUTFChars)(self.env, s, chars);
            Some(result)
        }
    }

    /// Copies a Java `byte[]` into a Rust vector.
    pub fn byte_array_to_vec(&self, array: jni::jbyteArray) -> Option<Vec<u8>> {
        if array.is_null() {
            return None;
        }
        unsafe {
            let vtable = *self.env;
            let len = ((*vtable).GetArrayLength)(self.env, array);
            let mut buf = vec![0u8; len.max(0) as usize];
            ((*vtable).GetByteArrayRegion)(self.env, array, 0, len, buf.as_mut_ptr() as *mut jni::jbyte);
            if self.take_exception() {
                return None;
            }
            Some(buf)
        }
    }

    // =========================================================================
    // References
    // =========================================================================

    /// Deletes a local reference.
    pub fn delete_local_ref(&self, obj: jni::jobject) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).DeleteLocalRef)(self.env, obj);
        }
    }
}

// =============================================================================
// RAII Guards
// =============================================================================

/// A guard that automatically deletes a local reference when dropped.
///
/// Class-loader walks can create many local references inside a single
/// `ClassFileLoadHook`; releasing them eagerly keeps the local frame small.
pub struct LocalRef<'a> {
    env: &'a JniEnv,
    obj: jni::jobject,
}

impl<'a> LocalRef<'a> {
    /// Creates a new LocalRef guard.
    pub fn new(env: &'a JniEnv, obj: jni::jobject) -> Self {
        LocalRef { env, obj }
    }

    /// Returns the underlying jobject.
    pub fn get(&self) -> jni::jobject {
        self.obj
    }

    pub fn is_null(&self) -> bool {
        self.obj.is_null()
    }
}

impl<'a> Drop for LocalRef<'a> {
    fn drop(&mut self) {
        if !self.obj.is_null() {
            self.env.delete_local_ref(self.obj);
        }
    }
}

// apm-bci/src/jvmti_wrapper.rs
use crate::sys::jni;
use crate::sys::jvmti;
use std::ffi::{CStr, CString};
use std::ptr;

/// Looks up a JVMTI function in the environment's table.
///
/// A JVM that leaves a slot empty yields `NOT_AVAILABLE` instead of a
/// null call.
macro_rules! jvmti_fn {
    ($self:ident, $name:ident) => {
        (*(*$self.env).functions).$name.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?
    };
}

fn check(err: jvmti::jvmtiError) -> Result<(), jvmti::jvmtiError> {
    if err == jvmti::jvmtiError::NONE {
        Ok(())
    } else {
        Err(err)
    }
}

/// A safe wrapper around the raw JVMTI Environment pointer.
///
/// Unlike a `JNIEnv`, a `jvmtiEnv` is not bound to the thread it was
/// obtained on, so the wrapper may be shared between threads.
pub struct Jvmti {
    env: *mut jvmti::jvmtiEnv,
}

unsafe impl Send for Jvmti {}
unsafe impl Sync for Jvmti {}

impl Jvmti {
    /// Connects to the JVM and retrieves a JVMTI 1.2 environment.
    pub fn new(vm: *mut jni::JavaVM) -> Result<Self, jni::jint> {
        let mut env_ptr: *mut std::ffi::c_void = ptr::null_mut();

        unsafe {
            let get_env_fn = (**vm).GetEnv;
            let res = get_env_fn(vm, &mut env_ptr, jvmti::JVMTI_VERSION_1_2);
            if res != jni::JNI_OK {
                return Err(res);
            }
        }

        Ok(Jvmti {
            env: env_ptr as *mut jvmti::jvmtiEnv,
        })
    }

    /// Create a Jvmti wrapper from a raw jvmtiEnv pointer
    ///
    /// # Safety
    /// The caller must ensure the pointer is valid for the duration of use.
    pub unsafe fn from_raw(env: *mut jvmti::jvmtiEnv) -> Self {
        Jvmti { env }
    }

    /// Get the raw jvmtiEnv pointer
    pub fn raw(&self) -> *mut jvmti::jvmtiEnv {
        self.env
    }

    pub fn add_capabilities(&self, caps: &jvmti::jvmtiCapabilities) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let add_caps_fn = jvmti_fn!(self, AddCapabilities);
            check(add_caps_fn(self.env, caps))
        }
    }

    pub fn set_event_callbacks(&self, callbacks: jvmti::jvmtiEventCallbacks) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let set_callbacks_fn = jvmti_fn!(self, SetEventCallbacks);
            let size = std::mem::size_of::<jvmti::jvmtiEventCallbacks>() as jni::jint;
            check(set_callbacks_fn(self.env, &callbacks, size))
        }
    }

    pub fn set_event_notification_mode(&self, enable: bool, event_type: u32) -> Result<(), jvmti::jvmtiError> {
        let mode = if enable { jvmti::JVMTI_ENABLE } else { jvmti::JVMTI_DISABLE };
        unsafe {
            let set_mode_fn = jvmti_fn!(self, SetEventNotificationMode);
            check(set_mode_fn(self.env, mode, event_type, ptr::null_mut()))
        }
    }

    pub fn allocate(&self, size: jni::jlong) -> Result<*mut u8, jvmti::jvmtiError> {
        let mut mem_ptr: *mut u8 = ptr::null_mut();
        unsafe {
            let allocate_fn = jvmti_fn!(self, Allocate);
            check(allocate_fn(self.env, size, &mut mem_ptr))?;
        }
        Ok(mem_ptr)
    }

    /// Copies `bytes` into JVMTI-managed memory, as required for data handed
    /// back from a `ClassFileLoadHook`.
    pub fn allocate_copy(&self, bytes: &[u8]) -> Result<*mut u8, jvmti::jvmtiError> {
        let mem = self.allocate(bytes.len() as jni::jlong)?;
        if mem.is_null() {
            return Err(jvmti::jvmtiError::OUT_OF_MEMORY);
        }
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), mem, bytes.len()) };
        Ok(mem)
    }

    pub fn deallocate(&self, mem: *mut u8) -> Result<(), jvmti::jvmtiError> {
        if mem.is_null() {
            return Ok(());
        }
        unsafe {
            let deallocate_fn = jvmti_fn!(self, Deallocate);
            check(deallocate_fn(self.env, mem))
        }
    }

    /// Returns the JVM type signature of `klass`, e.g. `Ljava/lang/String;`.
    pub fn get_class_signature(&self, klass: jni::jclass) -> Result<String, jvmti::jvmtiError> {
        let mut sig_ptr: *mut std::os::raw::c_char = ptr::null_mut();

        unsafe {
            let get_class_sig_fn = jvmti_fn!(self, GetClassSignature);
            check(get_class_sig_fn(self.env, klass, &mut sig_ptr, ptr::null_mut()))?;

            let signature = CStr::from_ptr(sig_ptr).to_string_lossy().into_owned();
            self.deallocate(sig_ptr as *mut u8)?;
            Ok(signature)
        }
    }

    /// The defining loader of `klass`; null for the bootstrap loader.
    pub fn get_class_loader(&self, klass: jni::jclass) -> Result<jni::jobject, jvmti::jvmtiError> {
        let mut loader: jni::jobject = ptr::null_mut();
        unsafe {
            let get_loader_fn = jvmti_fn!(self, GetClassLoader);
            check(get_loader_fn(self.env, klass, &mut loader))?;
        }
        Ok(loader)
    }

    pub fn get_loaded_classes(&self) -> Result<Vec<jni::jclass>, jvmti::jvmtiError> {
        let mut class_count: jni::jint = 0;
        let mut classes_ptr: *mut jni::jclass = ptr::null_mut();

        unsafe {
            let get_loaded_classes_fn = jvmti_fn!(self, GetLoadedClasses);
            check(get_loaded_classes_fn(self.env, &mut class_count, &mut classes_ptr))?;
            if classes_ptr.is_null() {
                return Ok(Vec::new());
            }

            let classes = std::slice::from_raw_parts(classes_ptr, class_count as usize).to_vec();
            self.deallocate(classes_ptr as *mut u8)?;
            Ok(classes)
        }
    }

    pub fn is_modifiable_class(&self, klass: jni::jclass) -> Result<bool, jvmti::jvmtiError> {
        let mut modifiable: jni::jboolean = jni::JNI_FALSE;
        unsafe {
            let is_modifiable_fn = jvmti_fn!(self, IsModifiableClass);
            check(is_modifiable_fn(self.env, klass, &mut modifiable))?;
        }
        Ok(modifiable != jni::JNI_FALSE)
    }

    pub fn retransform_classes(&self, classes: &[jni::jclass]) -> Result<(), jvmti::jvmtiError> {
        if classes.is_empty() {
            return Ok(());
        }
        unsafe {
            let retransform_fn = jvmti_fn!(self, RetransformClasses);
            check(retransform_fn(self.env, classes.len() as jni::jint, classes.as_ptr()))
        }
    }

    pub fn add_to_bootstrap_class_loader_search(&self, segment: &str) -> Result<(), jvmti::jvmtiError> {
        let segment = CString::new(segment).map_err(|_| jvmti::jvmtiError::ILLEGAL_ARGUMENT)?;
        unsafe {
            let add_fn = jvmti_fn!(self, AddToBootstrapClassLoaderSearch);
            check(add_fn(self.env, segment.as_ptr()))
        }
    }

    pub fn get_error_name(&self, error: jvmti::jvmtiError) -> Result<String, jvmti::jvmtiError> {
        let mut name_ptr: *mut std::os::raw::c_char = ptr::null_mut();
        unsafe {
            let get_error_name_fn = jvmti_fn!(self, GetErrorName);
            check(get_error_name_fn(self.env, error, &mut name_ptr))?;

            let name = CStr::from_ptr(name_ptr).to_string_lossy().into_owned();
            self.deallocate(name_ptr as *mut u8)?;
            Ok(name)
        }
    }

    /// Like [`get_error_name`](Self::get_error_name), but never fails:
    /// unknown codes render as `JVMTI_ERROR_<code>`.
    pub fn describe_error(&self, error: jvmti::jvmtiError) -> String {
        self.get_error_name(error)
            .unwrap_or_else(|_| format!("JVMTI_ERROR_{}", error.0))
    }
}

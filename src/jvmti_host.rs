//! [`InstrumentationHost`] over JVMTI.
//!
//! JVMTI delivers class loads through a single `ClassFileLoadHook`
//! callback, so the host is a process-wide singleton. The callback chains
//! every registered transformer, each one seeing the previous one's
//! output, and hands the result back in JVMTI-allocated memory.

use std::cell::{Cell, OnceCell};
use std::ffi::CStr;
use std::os::raw::{c_char, c_uchar};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::description::{binary_name, ClassLoaderDescription};
use crate::host::{
    same_transformer, ClassFileTransformer, ClassHandle, ClassLoader, HostError, InstrumentationHost, LoadedClass,
    LoaderError, TransformRequest,
};
use crate::jni_wrapper::{JniEnv, LocalRef};
use crate::jvmti_wrapper::Jvmti;
use crate::sys::{jni, jvmti};

static HOST: OnceLock<Arc<JvmtiHost>> = OnceLock::new();

/// `VMInit` and `VMDeath` handlers installed next to the class file hook.
#[derive(Clone, Copy, Default)]
pub struct VmLifecycle {
    pub vm_init: Option<jvmti::JvmtiVMInitFn>,
    pub vm_death: Option<jvmti::JvmtiVMDeathFn>,
}

fn event_callbacks(lifecycle: VmLifecycle) -> jvmti::jvmtiEventCallbacks {
    let mut callbacks = jvmti::jvmtiEventCallbacks::default();
    callbacks.VMInit = lifecycle.vm_init;
    callbacks.VMDeath = lifecycle.vm_death;
    callbacks.ClassFileLoadHook = Some(class_file_load_hook);
    callbacks
}

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

pub struct JvmtiHost {
    jvmti: Jvmti,
    vm: usize,
    retransform_supported: bool,
    transformers: RwLock<Vec<Arc<dyn ClassFileTransformer>>>,
}

impl JvmtiHost {
    /// Acquires a JVMTI environment, requests the capabilities
    /// retransformation needs and enables `ClassFileLoadHook`.
    ///
    /// The VM lifecycle callbacks are registered alongside, since JVMTI
    /// keeps one callback table per environment. Enabling their events is
    /// up to the caller. Later calls return the first host.
    pub fn install(vm: *mut jni::JavaVM, lifecycle: VmLifecycle) -> Result<Arc<JvmtiHost>, HostError> {
        if let Some(host) = HOST.get() {
            return Ok(Arc::clone(host));
        }

        let jvmti = Jvmti::new(vm).map_err(|code| HostError::Jvmti(format!("GetEnv failed with {code}")))?;

        let mut caps = jvmti::jvmtiCapabilities::default();
        caps.set_can_generate_all_class_hook_events(true);
        caps.set_can_retransform_classes(true);
        caps.set_can_retransform_any_class(true);
        let retransform_supported = match jvmti.add_capabilities(&caps) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %jvmti.describe_error(e), "retransformation capabilities unavailable");
                let mut caps = jvmti::jvmtiCapabilities::default();
                caps.set_can_generate_all_class_hook_events(true);
                jvmti.add_capabilities(&caps).map_err(|e| HostError::Jvmti(jvmti.describe_error(e)))?;
                false
            }
        };

        jvmti.set_event_callbacks(event_callbacks(lifecycle)).map_err(|e| HostError::Jvmti(jvmti.describe_error(e)))?;
        jvmti
            .set_event_notification_mode(true, jvmti::JVMTI_EVENT_CLASS_FILE_LOAD_HOOK)
            .map_err(|e| HostError::Jvmti(jvmti.describe_error(e)))?;

        let host = Arc::new(JvmtiHost {
            jvmti,
            vm: vm as usize,
            retransform_supported,
            transformers: RwLock::new(Vec::new()),
        });
        Ok(Arc::clone(HOST.get_or_init(|| host)))
    }

    pub fn get() -> Option<Arc<JvmtiHost>> {
        HOST.get().cloned()
    }

    pub fn jvmti(&self) -> &Jvmti {
        &self.jvmti
    }

    /// Makes classes in `jar` visible to every loader.
    pub fn add_to_bootstrap_search(&self, jar: &Path) -> Result<(), HostError> {
        let segment = jar.to_str().ok_or_else(|| HostError::Jvmti(format!("{} is not valid UTF-8", jar.display())))?;
        self.jvmti.add_to_bootstrap_class_loader_search(segment).map_err(|e| HostError::Jvmti(self.jvmti.describe_error(e)))
    }

    fn jvmti_error(&self, e: jvmti::jvmtiError) -> HostError {
        HostError::Jvmti(self.jvmti.describe_error(e))
    }

    fn current_env(&self) -> Result<JniEnv, HostError> {
        // SAFETY: `vm` came from the JVM and lives as long as the process.
        unsafe { JniEnv::for_current_thread(self.vm as *mut jni::JavaVM) }
            .ok_or_else(|| HostError::Jvmti("current thread is not attached to the JVM".to_string()))
    }

    /// Runs all transformers over one class.
    ///
    /// # Safety
    ///
    /// The pointers are the ones JVMTI passed to `ClassFileLoadHook`.
    unsafe fn on_class_file_load(
        &self,
        jni_env: *mut jni::JNIEnv,
        class_being_redefined: jni::jclass,
        loader: jni::jobject,
        name: *const c_char,
        class_data_len: jni::jint,
        class_data: *const c_uchar,
    ) -> Option<Vec<u8>> {
        let transformers = self.transformers.read().clone();
        if transformers.is_empty() || class_data.is_null() {
            return None;
        }

        let original = std::slice::from_raw_parts(class_data, class_data_len.max(0) as usize);
        let class_name = if name.is_null() { None } else { CStr::from_ptr(name).to_str().ok() };
        let loader: Option<Arc<dyn ClassLoader>> = if loader.is_null() {
            None
        } else {
            Some(Arc::new(JniClassLoader::borrowed(jni_env, loader)))
        };

        let mut current: Option<Vec<u8>> = None;
        for transformer in &transformers {
            let output = {
                let request = TransformRequest {
                    class_name,
                    loader: loader.clone(),
                    redefining: !class_being_redefined.is_null(),
                    class_bytes: current.as_deref().unwrap_or(original),
                };
                transformer.transform(&request)
            };
            if output.is_some() {
                current = output;
            }
        }
        current
    }
}

impl InstrumentationHost for JvmtiHost {
    fn add_transformer(&self, transformer: Arc<dyn ClassFileTransformer>) {
        self.transformers.write().push(transformer);
    }

    fn remove_transformer(&self, transformer: &Arc<dyn ClassFileTransformer>) -> bool {
        let mut transformers = self.transformers.write();
        let before = transformers.len();
        transformers.retain(|t| !same_transformer(t, transformer));
        transformers.len() != before
    }

    fn is_retransform_classes_supported(&self) -> bool {
        self.retransform_supported
    }

    fn loaded_classes(&self) -> Result<Vec<LoadedClass>, HostError> {
        let env = self.current_env()?;
        let classes = self.jvmti.get_loaded_classes().map_err(|e| self.jvmti_error(e))?;
        let mut loaded = Vec::with_capacity(classes.len());
        for klass in classes {
            // arrays and primitives have no class file
            let name = match self.jvmti.get_class_signature(klass) {
                Ok(sig) if sig.starts_with('L') && sig.ends_with(';') => binary_name(&sig[1..sig.len() - 1]),
                _ => {
                    env.delete_local_ref(klass);
                    continue;
                }
            };
            let modifiable = self.jvmti.is_modifiable_class(klass).unwrap_or(false);
            let loader = match self.jvmti.get_class_loader(klass) {
                Ok(loader) if loader.is_null() => ClassLoaderDescription::bootstrap(),
                Ok(loader) => {
                    let loader = LocalRef::new(&env, loader);
                    describe_loader(&env, loader.get())
                }
                Err(e) => {
                    debug!(type_name = %name, error = %self.jvmti.describe_error(e), "cannot get class loader");
                    ClassLoaderDescription::bootstrap()
                }
            };
            loaded.push(LoadedClass { name, loader, modifiable, handle: ClassHandle(klass as usize) });
        }
        Ok(loaded)
    }

    fn retransform_classes(&self, classes: &[LoadedClass]) -> Result<(), HostError> {
        let handles: Vec<jni::jclass> = classes.iter().map(|c| c.handle.0 as jni::jclass).collect();
        self.jvmti.retransform_classes(&handles).map_err(|e| HostError::Retransform {
            class: match classes {
                [single] => single.name.clone(),
                _ => format!("{} classes", classes.len()),
            },
            reason: self.jvmti.describe_error(e),
        })
    }
}

struct HookGuard;

impl HookGuard {
    /// `None` if this thread is already inside the hook.
    fn enter() -> Option<HookGuard> {
        if IN_HOOK.with(|flag| flag.replace(true)) {
            None
        } else {
            Some(HookGuard)
        }
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        IN_HOOK.with(|flag| flag.set(false));
    }
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn class_file_load_hook(
    _jvmti_env: *mut jvmti::jvmtiEnv,
    jni_env: *mut jni::JNIEnv,
    class_being_redefined: jni::jclass,
    loader: jni::jobject,
    name: *const c_char,
    _protection_domain: jni::jobject,
    class_data_len: jni::jint,
    class_data: *const c_uchar,
    new_class_data_len: *mut jni::jint,
    new_class_data: *mut *mut c_uchar,
) {
    let Some(host) = HOST.get() else {
        return;
    };
    // Loads triggered while transforming (type pool lookups, loader
    // probes) pass through untouched.
    let Some(_guard) = HookGuard::enter() else {
        return;
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        host.on_class_file_load(jni_env, class_being_redefined, loader, name, class_data_len, class_data)
    }));
    match result {
        Ok(Some(bytes)) => match host.jvmti.allocate_copy(&bytes) {
            Ok(mem) => {
                *new_class_data_len = bytes.len() as jni::jint;
                *new_class_data = mem;
            }
            Err(e) => warn!(error = %host.jvmti.describe_error(e), "cannot hand transformed class back to the JVM"),
        },
        Ok(None) => {}
        Err(_) => warn!("class file transformer panicked, class left untouched"),
    }
}

/// Method IDs of `java.lang.Class`, `java.lang.ClassLoader` and
/// `java.io.InputStream`, stored as addresses. 0 means the method does
/// not exist on this JVM.
struct MethodIds {
    class_get_name: usize,
    loader_get_parent: usize,
    loader_load_class: usize,
    loader_get_resource_as_stream: usize,
    stream_read_all_bytes: usize,
    stream_close: usize,
}

static METHOD_IDS: OnceLock<MethodIds> = OnceLock::new();

fn method_ids(env: &JniEnv) -> Option<&'static MethodIds> {
    if let Some(ids) = METHOD_IDS.get() {
        return Some(ids);
    }
    let class_class = LocalRef::new(env, env.find_class("java/lang/Class")?);
    let loader_class = LocalRef::new(env, env.find_class("java/lang/ClassLoader")?);
    let stream_class = LocalRef::new(env, env.find_class("java/io/InputStream")?);
    let id = |class: &LocalRef<'_>, name: &str, sig: &str| env.get_method_id(class.get(), name, sig).map_or(0, |m| m as usize);

    let ids = MethodIds {
        class_get_name: id(&class_class, "getName", "()Ljava/lang/String;"),
        loader_get_parent: id(&loader_class, "getParent", "()Ljava/lang/ClassLoader;"),
        loader_load_class: id(&loader_class, "loadClass", "(Ljava/lang/String;)Ljava/lang/Class;"),
        loader_get_resource_as_stream: id(&loader_class, "getResourceAsStream", "(Ljava/lang/String;)Ljava/io/InputStream;"),
        // Java 9+
        stream_read_all_bytes: id(&stream_class, "readAllBytes", "()[B"),
        stream_close: id(&stream_class, "close", "()V"),
    };
    Some(METHOD_IDS.get_or_init(|| ids))
}

fn method(id: usize) -> Option<jni::jmethodID> {
    (id != 0).then_some(id as jni::jmethodID)
}

fn describe_loader(env: &JniEnv, loader: jni::jobject) -> ClassLoaderDescription {
    let unknown = || ClassLoaderDescription::of("java.lang.ClassLoader").with_display("unknown class loader");
    let Some(get_name) = method_ids(env).and_then(|ids| method(ids.class_get_name)) else {
        return unknown();
    };
    let class = LocalRef::new(env, env.get_object_class(loader));
    let name = LocalRef::new(env, env.call_object_method(class.get(), get_name, &[]));
    if env.take_exception() {
        return unknown();
    }
    env.get_string_utf(name.get()).map_or_else(unknown, ClassLoaderDescription::of)
}

/// A `java.lang.ClassLoader` reached through JNI on the current thread.
pub struct JniClassLoader {
    env: *mut jni::JNIEnv,
    loader: jni::jobject,
    owned: bool,
    description: OnceCell<ClassLoaderDescription>,
}

impl JniClassLoader {
    /// Wraps a reference owned by someone else, such as the loader passed
    /// to `ClassFileLoadHook`.
    ///
    /// # Safety
    ///
    /// `env` belongs to the current thread and `loader` stays valid while
    /// the wrapper lives.
    pub unsafe fn borrowed(env: *mut jni::JNIEnv, loader: jni::jobject) -> Self {
        JniClassLoader { env, loader, owned: false, description: OnceCell::new() }
    }

    fn env(&self) -> JniEnv {
        // SAFETY: upheld by the constructor's contract.
        unsafe { JniEnv::from_raw(self.env) }
    }

    fn ids(&self, env: &JniEnv) -> Result<&'static MethodIds, LoaderError> {
        method_ids(env).ok_or_else(|| LoaderError::Other("java.lang.ClassLoader methods not found".to_string()))
    }

    fn call_object(&self, env: &JniEnv, obj: jni::jobject, id: usize, method_name: &'static str, args: &[jni::jvalue]) -> Result<jni::jobject, LoaderError> {
        let id = method(id).ok_or_else(|| LoaderError::Other(format!("{method_name} is not available")))?;
        let result = env.call_object_method(obj, id, args);
        if env.take_exception() {
            return Err(LoaderError::Exception { method: method_name });
        }
        Ok(result)
    }
}

impl ClassLoader for JniClassLoader {
    fn description(&self) -> ClassLoaderDescription {
        self.description.get_or_init(|| describe_loader(&self.env(), self.loader)).clone()
    }

    fn parent(&self) -> Result<Option<Arc<dyn ClassLoader>>, LoaderError> {
        let env = self.env();
        let ids = self.ids(&env)?;
        let parent = self.call_object(&env, self.loader, ids.loader_get_parent, "getParent", &[])?;
        if parent.is_null() {
            return Ok(None);
        }
        Ok(Some(Arc::new(JniClassLoader { env: self.env, loader: parent, owned: true, description: OnceCell::new() })))
    }

    fn can_load(&self, binary_name: &str) -> Result<bool, LoaderError> {
        let env = self.env();
        let ids = self.ids(&env)?;
        let name = env
            .new_string_utf(binary_name)
            .ok_or_else(|| LoaderError::Other(format!("cannot create string {binary_name}")))?;
        let name = LocalRef::new(&env, name);
        match self.call_object(&env, self.loader, ids.loader_load_class, "loadClass", &[jni::jvalue { l: name.get() }]) {
            Ok(class) => Ok(!LocalRef::new(&env, class).is_null()),
            Err(LoaderError::Exception { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn class_file(&self, internal_name: &str) -> Result<Option<Vec<u8>>, LoaderError> {
        let env = self.env();
        let ids = self.ids(&env)?;
        let resource = env
            .new_string_utf(&format!("{internal_name}.class"))
            .ok_or_else(|| LoaderError::Other(format!("cannot create string {internal_name}")))?;
        let resource = LocalRef::new(&env, resource);
        let stream = self.call_object(
            &env,
            self.loader,
            ids.loader_get_resource_as_stream,
            "getResourceAsStream",
            &[jni::jvalue { l: resource.get() }],
        )?;
        let stream = LocalRef::new(&env, stream);
        if stream.is_null() {
            return Ok(None);
        }

        let bytes = self
            .call_object(&env, stream.get(), ids.stream_read_all_bytes, "readAllBytes", &[])
            .map(|array| {
                let array = LocalRef::new(&env, array);
                env.byte_array_to_vec(array.get())
            });
        if let Some(close) = method(ids.stream_close) {
            env.call_void_method(stream.get(), close, &[]);
            env.take_exception();
        }
        bytes
    }
}

impl Drop for JniClassLoader {
    fn drop(&mut self) {
        if self.owned && !self.loader.is_null() {
            self.env().delete_local_ref(self.loader);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_guard_blocks_reentry_on_the_same_thread() {
        let outer = HookGuard::enter();
        assert!(outer.is_some());
        assert!(HookGuard::enter().is_none());
        drop(outer);
        assert!(HookGuard::enter().is_some());
    }

    #[test]
    fn missing_method_ids_read_as_absent() {
        assert!(method(0).is_none());
        assert!(method(0x1000).is_some());
    }

    unsafe extern "system" fn on_death(_jvmti_env: *mut jvmti::jvmtiEnv, _jni_env: *mut jni::JNIEnv) {}

    #[test]
    fn callback_table_carries_the_class_file_hook() {
        let callbacks = event_callbacks(VmLifecycle { vm_init: None, vm_death: Some(on_death) });
        assert!(callbacks.VMInit.is_none());
        assert!(callbacks.VMDeath.is_some());
        assert!(callbacks.ClassFileLoadHook.is_some());
    }

    #[test]
    fn no_host_before_install() {
        assert!(JvmtiHost::get().is_none());
    }
}

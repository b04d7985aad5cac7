//! The live-rewrite facility of the process being instrumented.
//!
//! [`JvmtiHost`](crate::jvmti_host::JvmtiHost) implements these traits
//! over JVMTI; tests implement them in memory.

use std::fmt;
use std::sync::Arc;

use crate::description::ClassLoaderDescription;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("the host does not support retransformation")]
    RetransformUnsupported,
    #[error("cannot retransform {class}: {reason}")]
    Retransform { class: String, reason: String },
    #[error("{0}")]
    Jvmti(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LoaderError {
    #[error("{method} threw")]
    Exception { method: &'static str },
    #[error("{0}")]
    Other(String),
}

/// A live class loader. Only used on the thread that handed it out.
pub trait ClassLoader {
    fn description(&self) -> ClassLoaderDescription;

    /// `Ok(None)` for a loader whose parent is bootstrap.
    fn parent(&self) -> Result<Option<Arc<dyn ClassLoader>>, LoaderError>;

    /// Whether the loader can resolve a class by binary name.
    fn can_load(&self, binary_name: &str) -> Result<bool, LoaderError>;

    /// The class file bytes this loader would define for an internal name.
    fn class_file(&self, internal_name: &str) -> Result<Option<Vec<u8>>, LoaderError>;
}

/// One class passing through the host's load or retransform path.
pub struct TransformRequest<'a> {
    /// Internal name; absent for anonymous classes.
    pub class_name: Option<&'a str>,
    /// `None` for the bootstrap loader.
    pub loader: Option<Arc<dyn ClassLoader>>,
    /// Set when an already loaded class is retransformed.
    pub redefining: bool,
    pub class_bytes: &'a [u8],
}

impl TransformRequest<'_> {
    pub fn loader_description(&self) -> ClassLoaderDescription {
        self.loader.as_ref().map_or_else(ClassLoaderDescription::bootstrap, |l| l.description())
    }
}

impl fmt::Debug for TransformRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformRequest")
            .field("class_name", &self.class_name)
            .field("loader", &self.loader_description())
            .field("redefining", &self.redefining)
            .field("len", &self.class_bytes.len())
            .finish()
    }
}

/// Called by the host for every class it defines or retransforms.
pub trait ClassFileTransformer: Send + Sync {
    /// New bytes, or `None` to leave the class as it is.
    fn transform(&self, request: &TransformRequest<'_>) -> Option<Vec<u8>>;
}

/// Opaque host handle of a loaded class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassHandle(pub usize);

#[derive(Debug, Clone)]
pub struct LoadedClass {
    /// Binary name.
    pub name: String,
    pub loader: ClassLoaderDescription,
    pub modifiable: bool,
    pub handle: ClassHandle,
}

pub trait InstrumentationHost: Send + Sync {
    fn add_transformer(&self, transformer: Arc<dyn ClassFileTransformer>);

    /// Returns whether the transformer was registered.
    fn remove_transformer(&self, transformer: &Arc<dyn ClassFileTransformer>) -> bool;

    fn is_retransform_classes_supported(&self) -> bool;

    fn loaded_classes(&self) -> Result<Vec<LoadedClass>, HostError>;

    /// Runs all registered transformers over the original bytes of each
    /// class again. An empty slice is a no-op.
    fn retransform_classes(&self, classes: &[LoadedClass]) -> Result<(), HostError>;
}

/// Identity of a registered transformer, ignoring vtable pointers.
pub fn same_transformer(a: &Arc<dyn ClassFileTransformer>, b: &Arc<dyn ClassFileTransformer>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

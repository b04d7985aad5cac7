//! The contract every instrumentation module implements.

use std::fmt;
use std::sync::Arc;

use crate::description::{internal_name, ClassLoaderDescription, MethodDescription, TypeDescription};
use crate::locator::ClassFileLocator;
use crate::matcher::{any, Junction};
use crate::tracer::Tracer;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The code woven into matched methods, and where its class file lives.
///
/// The hook class declares `public static void onMethodEnter()` and/or
/// `public static void onMethodExit()`. Its bytes are always read through
/// `locator`, never through the loader of the class being transformed,
/// which usually cannot see it.
#[derive(Clone)]
pub struct HookReference {
    class_name: String,
    locator: Arc<dyn ClassFileLocator>,
}

impl HookReference {
    /// `class_name` is a binary name, e.g. `co.elastic.apm.agent.FooAdvice`.
    pub fn new(class_name: impl Into<String>, locator: Arc<dyn ClassFileLocator>) -> Self {
        HookReference { class_name: class_name.into(), locator }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn internal_name(&self) -> String {
        internal_name(&self.class_name)
    }

    pub fn locator(&self) -> &Arc<dyn ClassFileLocator> {
        &self.locator
    }
}

impl fmt::Debug for HookReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookReference")
            .field("class_name", &self.class_name)
            .field("locator", &self.locator.describe())
            .finish()
    }
}

/// An instrumentation module: which classes and methods it wants, under
/// which groups it can be switched off, and what to call from them.
///
/// Everything except [`init`](Instrumentation::init) must be free of side
/// effects and return the same answer every time.
pub trait Instrumentation: Send + Sync {
    fn type_matcher(&self) -> Junction<TypeDescription>;

    fn method_matcher(&self) -> Junction<MethodDescription>;

    fn class_loader_matcher(&self) -> Junction<ClassLoaderDescription> {
        any()
    }

    /// Names used to switch this module off via `disabled_instrumentations`.
    fn group_names(&self) -> Vec<String>;

    fn hook(&self) -> HookReference;

    /// Whether the module stays active with `instrument=false`.
    fn include_when_instrumentation_is_disabled(&self) -> bool {
        false
    }

    /// Called once per activation, before any matching.
    fn init(&self, _tracer: &Tracer) -> Result<(), BoxError> {
        Ok(())
    }

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Yields the available instrumentation modules, once, at startup.
pub trait DescriptorSource {
    fn descriptors(&self) -> Vec<Arc<dyn Instrumentation>>;
}

impl<F> DescriptorSource for F
where
    F: Fn() -> Vec<Arc<dyn Instrumentation>>,
{
    fn descriptors(&self) -> Vec<Arc<dyn Instrumentation>> {
        self()
    }
}

impl DescriptorSource for Vec<Arc<dyn Instrumentation>> {
    fn descriptors(&self) -> Vec<Arc<dyn Instrumentation>> {
        self.clone()
    }
}

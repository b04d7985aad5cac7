//! Turning instrumentation modules into one class file transformer.
//!
//! [`AgentBuilder`] folds each active module into a [`TransformRule`]. A
//! module that fails to initialize or to compile is logged and skipped.
//! [`AgentBuilder::build`] yields the [`Pipeline`]: ignore rules first,
//! then every rule's matchers, then the weaver.

use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashSet;
use tracing::{debug, info, trace, warn, Level};

use crate::classfile::{ClassFile, ClassFileError, ACC_ABSTRACT, ACC_NATIVE, ACC_STATIC};
use crate::description::{
    binary_name, ClassFileTypePool, ClassLoaderDescription, MethodDescription, TypeDescription, TypePool,
};
use crate::host::{ClassFileTransformer, ClassLoader, HostError, InstrumentationHost, LoadedClass, TransformRequest};
use crate::ignore::IgnoreRules;
use crate::instrumentation::{HookReference, Instrumentation};
use crate::locator::LocatorError;
use crate::matcher::{Junction, MatchError};
use crate::tracer::Tracer;
use crate::weave::{weave, HookCall, WeavePlan, HOOK_DESCRIPTOR, ON_METHOD_ENTER, ON_METHOD_EXIT};

/// Loader chains deeper than this are cut short in diagnostics.
const MAX_LOADER_DEPTH: usize = 32;

/// Classes handed to a single retransform call.
const RETRANSFORM_BATCH: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("init failed: {0}")]
    Init(String),
    #[error("init panicked")]
    InitPanicked,
    #[error("cannot read hook class {class}: {source}")]
    Locator {
        class: String,
        #[source]
        source: LocatorError,
    },
    #[error("hook class {class} not found in {locator}")]
    HookNotFound { class: String, locator: String },
    #[error("hook class {class} is malformed: {source}")]
    HookClass {
        class: String,
        #[source]
        source: ClassFileError,
    },
    #[error("hook class {0} declares neither static onMethodEnter()V nor static onMethodExit()V")]
    NoHookMethods(String),
}

/// One active instrumentation module, ready to match and weave.
pub struct TransformRule {
    advice: String,
    type_matcher: Junction<TypeDescription>,
    method_matcher: Junction<MethodDescription>,
    loader_matcher: Junction<ClassLoaderDescription>,
    hook: HookReference,
    enter: bool,
    exit: bool,
}

impl TransformRule {
    /// Reads the hook class through its own locator and checks which hook
    /// methods it declares.
    pub fn compile(instrumentation: &dyn Instrumentation) -> Result<Self, CompileError> {
        let hook = instrumentation.hook();
        let class = hook.class_name().to_string();
        let bytes = hook
            .locator()
            .locate(&hook.internal_name())
            .map_err(|source| CompileError::Locator { class: class.clone(), source })?
            .ok_or_else(|| CompileError::HookNotFound { class: class.clone(), locator: hook.locator().describe() })?;
        let parsed = ClassFile::parse(&bytes).map_err(|source| CompileError::HookClass { class: class.clone(), source })?;

        let enter = declares_hook(&parsed, ON_METHOD_ENTER).map_err(|source| CompileError::HookClass { class: class.clone(), source })?;
        let exit = declares_hook(&parsed, ON_METHOD_EXIT).map_err(|source| CompileError::HookClass { class: class.clone(), source })?;
        if !enter && !exit {
            return Err(CompileError::NoHookMethods(class));
        }

        Ok(TransformRule {
            advice: instrumentation.name().to_string(),
            type_matcher: instrumentation.type_matcher(),
            method_matcher: instrumentation.method_matcher(),
            loader_matcher: instrumentation.class_loader_matcher(),
            hook,
            enter,
            exit,
        })
    }

    pub fn advice(&self) -> &str {
        &self.advice
    }

    pub fn hook(&self) -> &HookReference {
        &self.hook
    }

    pub fn has_enter(&self) -> bool {
        self.enter
    }

    pub fn has_exit(&self) -> bool {
        self.exit
    }

    /// Loader and type matchers together. A matcher that fails or panics
    /// does not match.
    pub fn matches_type(&self, ty: &TypeDescription, loader: &ClassLoaderDescription) -> bool {
        let hit = guarded(&self.advice, &self.loader_matcher, loader, loader)
            && guarded(&self.advice, &self.type_matcher, ty, ty);
        if hit {
            debug!(advice = %self.advice, type_name = %ty, "Type match for advice {}: {} matches {}", self.advice, self.type_matcher, ty);
        }
        hit
    }

    pub fn matches_loader(&self, loader: &ClassLoaderDescription) -> bool {
        guarded(&self.advice, &self.loader_matcher, loader, loader)
    }

    pub fn matches_method(&self, method: &MethodDescription) -> bool {
        let hit = guarded(&self.advice, &self.method_matcher, method, method);
        if hit {
            debug!(advice = %self.advice, method = %method, "Method match for advice {}: {} matches {}", self.advice, self.method_matcher, method);
        }
        hit
    }

    fn hook_call(&self) -> HookCall {
        HookCall { hook_class: self.hook.internal_name(), enter: self.enter, exit: self.exit }
    }
}

impl fmt::Debug for TransformRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformRule")
            .field("advice", &self.advice)
            .field("type_matcher", &self.type_matcher.to_string())
            .field("method_matcher", &self.method_matcher.to_string())
            .field("hook", &self.hook)
            .field("enter", &self.enter)
            .field("exit", &self.exit)
            .finish()
    }
}

fn declares_hook(class: &ClassFile, name: &str) -> Result<bool, ClassFileError> {
    let cp = &class.constant_pool;
    for method in &class.methods {
        if method.access_flags & ACC_STATIC != 0 && method.name(cp)? == name && method.descriptor(cp)? == HOOK_DESCRIPTOR {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Evaluates a matcher at the candidate boundary. Errors and panics become
/// a non-match, logged so they can be monitored.
fn guarded<T: ?Sized + 'static>(advice: &str, matcher: &Junction<T>, target: &T, shown: &dyn fmt::Display) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| matcher.matches(target))) {
        Ok(Ok(hit)) => hit,
        Ok(Err(e)) => {
            debug!(advice, target = %shown, matcher = %matcher, error = %e, "matcher failed, treating as no match");
            false
        }
        Err(_) => {
            debug!(advice, target = %shown, matcher = %matcher, "matcher panicked, treating as no match");
            false
        }
    }
}

/// Walks from the candidate's loader up to bootstrap, reporting whether
/// each loader can see the hook class. Lookup failures read as "cannot
/// load".
fn log_loader_hierarchy(rule: &TransformRule, loader: Option<&Arc<dyn ClassLoader>>) {
    let hook = rule.hook().class_name();
    trace!(advice = %rule.advice, "Advice {} is loaded by {}", hook, rule.hook().locator().describe());

    let mut current = loader.cloned();
    let mut depth = 0;
    while let Some(l) = current {
        if depth == MAX_LOADER_DEPTH {
            trace!(advice = %rule.advice, "class loader hierarchy deeper than {}, stopping", MAX_LOADER_DEPTH);
            return;
        }
        let can_load = l.can_load(hook).unwrap_or(false);
        trace!(advice = %rule.advice, loader = %l.description(), "{} can load advice ({}): {}", l.description(), hook, can_load);
        current = match l.parent() {
            Ok(parent) => parent,
            Err(e) => {
                trace!(advice = %rule.advice, error = %e, "cannot get parent of {}", l.description());
                return;
            }
        };
        depth += 1;
    }
    trace!(advice = %rule.advice, "reached the bootstrap classloader");
}

/// Folds instrumentation modules into a [`Pipeline`].
pub struct AgentBuilder {
    ignore: IgnoreRules,
    rules: Vec<TransformRule>,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        AgentBuilder { ignore: IgnoreRules::default_rules(), rules: Vec::new() }
    }

    pub fn with_ignore_rules(mut self, ignore: IgnoreRules) -> Self {
        self.ignore = ignore;
        self
    }

    /// Initializes and compiles one module. Failures are logged and leave
    /// the builder as it was.
    pub fn apply(mut self, instrumentation: &dyn Instrumentation, tracer: &Tracer) -> Self {
        let advice = instrumentation.name();
        debug!(advice, "Applying advice {}", advice);
        match init(instrumentation, tracer).and_then(|()| TransformRule::compile(instrumentation)) {
            Ok(rule) => {
                self.ignore = self.ignore.ignore_hook_class(rule.hook().class_name());
                self.rules.push(rule);
            }
            Err(e) => warn!(advice, error = %e, "not applying advice {}", advice),
        }
        self
    }

    /// Number of modules applied so far.
    pub fn applied(&self) -> usize {
        self.rules.len()
    }

    pub fn build(self) -> Arc<Pipeline> {
        info!("Applied {} advices", self.rules.len());
        Arc::new(Pipeline { ignore: self.ignore, rules: self.rules, transformed: DashSet::new() })
    }
}

fn init(instrumentation: &dyn Instrumentation, tracer: &Tracer) -> Result<(), CompileError> {
    match panic::catch_unwind(AssertUnwindSafe(|| instrumentation.init(tracer))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(CompileError::Init(e.to_string())),
        Err(_) => Err(CompileError::InitPanicked),
    }
}

/// Ignore rules plus transform rules, installed as one transformer.
pub struct Pipeline {
    ignore: IgnoreRules,
    rules: Vec<TransformRule>,
    transformed: DashSet<String>,
}

impl Pipeline {
    pub fn rules(&self) -> &[TransformRule] {
        &self.rules
    }

    pub fn ignore_rules(&self) -> &IgnoreRules {
        &self.ignore
    }

    /// Binary names of the classes this pipeline rewrote.
    pub fn transformed_classes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.transformed.iter().map(|n| n.key().clone()).collect();
        names.sort();
        names
    }

    pub fn is_transformed(&self, binary_name: &str) -> bool {
        self.transformed.contains(binary_name)
    }

    /// Registers the pipeline and retransforms the already loaded classes
    /// it may apply to. On error nothing stays registered.
    pub fn install_on(self: &Arc<Self>, host: &dyn InstrumentationHost) -> Result<Arc<dyn ClassFileTransformer>, HostError> {
        let transformer: Arc<dyn ClassFileTransformer> = self.clone();
        host.add_transformer(Arc::clone(&transformer));
        if !host.is_retransform_classes_supported() {
            host.remove_transformer(&transformer);
            return Err(HostError::RetransformUnsupported);
        }

        let loaded = match host.loaded_classes() {
            Ok(loaded) => loaded,
            Err(e) => {
                host.remove_transformer(&transformer);
                return Err(e);
            }
        };
        let candidates: Vec<LoadedClass> = loaded
            .into_iter()
            .filter(|c| c.modifiable && !self.ignore.ignores(&c.name, &c.loader))
            .filter(|c| self.rules.iter().any(|r| r.matches_loader(&c.loader)))
            .collect();
        debug!("retransforming {} loaded classes", candidates.len());
        retransform_in_batches(host, &candidates);
        Ok(transformer)
    }

    /// Unregisters `transformer` and retransforms every class the pipeline
    /// rewrote, so the host re-derives their original bytes. Returns the
    /// number of classes restored.
    pub fn reset_on(&self, host: &dyn InstrumentationHost, transformer: &Arc<dyn ClassFileTransformer>) -> Result<usize, HostError> {
        if !host.remove_transformer(transformer) {
            warn!("transformer was not registered");
        }
        let names: HashSet<String> = self.transformed.iter().map(|n| n.key().clone()).collect();
        let restore: Vec<LoadedClass> = host.loaded_classes()?.into_iter().filter(|c| names.contains(&c.name)).collect();
        retransform_in_batches(host, &restore);
        self.transformed.clear();
        Ok(restore.len())
    }

    fn transform_class(&self, request: &TransformRequest<'_>) -> Option<Vec<u8>> {
        let loader = request.loader_description();
        if let Some(name) = request.class_name {
            if self.ignore.ignores(&binary_name(name), &loader) {
                return None;
            }
        }

        let class = match ClassFile::parse(request.class_bytes) {
            Ok(class) => class,
            Err(e) => {
                debug!(type_name = ?request.class_name, error = %e, "cannot parse class file");
                return None;
            }
        };
        let ty = match TypeDescription::from_class_file(&class) {
            Ok(ty) => ty.with_type_pool(type_pool_for(request.loader.clone())),
            Err(e) => {
                debug!(type_name = ?request.class_name, error = %e, "cannot describe class");
                return None;
            }
        };
        if request.class_name.is_none() && self.ignore.matches(&ty, &loader) {
            return None;
        }

        let mut plan = WeavePlan::new();
        for rule in &self.rules {
            if !rule.matches_type(&ty, &loader) {
                continue;
            }
            if tracing::enabled!(Level::TRACE) {
                log_loader_hierarchy(rule, request.loader.as_ref());
            }
            for (index, method) in ty.declared_methods().iter().enumerate() {
                if method.modifiers() & (ACC_ABSTRACT | ACC_NATIVE) != 0 {
                    continue;
                }
                if rule.matches_method(method) {
                    plan.add(index, rule.hook_call());
                }
            }
        }
        if plan.is_empty() {
            return None;
        }

        match weave(request.class_bytes, &class, &plan) {
            Ok(Some(bytes)) => {
                debug!(type_name = %ty, methods = plan.len(), "transformed {}", ty);
                self.transformed.insert(ty.name().to_string());
                Some(bytes)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(type_name = %ty, error = %e, "cannot weave {}, leaving it untouched", ty);
                None
            }
        }
    }
}

impl ClassFileTransformer for Pipeline {
    fn transform(&self, request: &TransformRequest<'_>) -> Option<Vec<u8>> {
        self.transform_class(request)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("rules", &self.rules)
            .field("transformed", &self.transformed.len())
            .finish()
    }
}

/// Super types resolve through the defining loader. The bootstrap loader
/// is not searchable from here.
fn type_pool_for(loader: Option<Arc<dyn ClassLoader>>) -> Arc<dyn TypePool> {
    match loader {
        Some(loader) => ClassFileTypePool::new(move |internal: &str| {
            loader.class_file(internal).map_err(|e| MatchError::Loader(e.to_string()))
        }),
        None => ClassFileTypePool::new(|internal: &str| {
            Err(MatchError::Unresolvable {
                name: binary_name(internal),
                reason: "bootstrap class loader is not searchable".to_string(),
            })
        }),
    }
}

fn retransform_in_batches(host: &dyn InstrumentationHost, classes: &[LoadedClass]) {
    for batch in classes.chunks(RETRANSFORM_BATCH) {
        if let Err(e) = host.retransform_classes(batch) {
            debug!(error = %e, "batch retransformation failed, retrying one class at a time");
            for class in batch {
                if let Err(e) = host.retransform_classes(std::slice::from_ref(class)) {
                    warn!(type_name = %class.name, loader = %class.loader, error = %e, "cannot retransform {}", class.name);
                }
            }
        }
    }
}

//! Classes the engine never touches, whatever the rules say.

use std::fmt;

use tracing::debug;

use crate::description::{ClassLoaderDescription, TypeDescription};
use crate::matcher::{class_loader_with_name, is_reflection_class_loader, name_contains, name_starts_with, named, none, Junction};

const IGNORED_PREFIXES: &[&str] = &["java.", "com.sun.", "sun", "org.aspectj.", "org.groovy.", "com.p6spy.", "net.bytebuddy."];

const IGNORED_INFIXES: &[&str] = &["javassist", ".asm."];

const GROOVY_CALL_SITE_LOADER: &str = "org.codehaus.groovy.runtime.callsite.CallSiteClassLoader";

/// A class is ignored when its name or its defining loader matches.
#[derive(Clone)]
pub struct IgnoreRules {
    types: Junction<TypeDescription>,
    loaders: Junction<ClassLoaderDescription>,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self::default_rules()
    }
}

impl IgnoreRules {
    /// Nothing ignored.
    pub fn empty() -> Self {
        IgnoreRules { types: none(), loaders: none() }
    }

    /// Runtime internals, reflection accessors, Groovy call sites and
    /// bytecode libraries.
    pub fn default_rules() -> Self {
        let mut rules = IgnoreRules::empty()
            .ignore_loader(is_reflection_class_loader())
            .ignore_loader(class_loader_with_name(GROOVY_CALL_SITE_LOADER));
        for prefix in IGNORED_PREFIXES {
            rules = rules.ignore_type(name_starts_with(prefix));
        }
        for infix in IGNORED_INFIXES {
            rules = rules.ignore_type(name_contains(infix));
        }
        rules
    }

    pub fn ignore_type(self, matcher: Junction<TypeDescription>) -> Self {
        IgnoreRules { types: self.types.or(matcher), ..self }
    }

    pub fn ignore_loader(self, matcher: Junction<ClassLoaderDescription>) -> Self {
        IgnoreRules { loaders: self.loaders.or(matcher), ..self }
    }

    /// Keeps a hook from being woven into itself.
    pub fn ignore_hook_class(self, binary_name: &str) -> Self {
        self.ignore_type(named(binary_name))
    }

    /// A rule that fails to evaluate counts as a hit.
    pub fn matches(&self, ty: &TypeDescription, loader: &ClassLoaderDescription) -> bool {
        let loader_hit = self.loaders.matches(loader).unwrap_or_else(|e| {
            debug!(loader = %loader, error = %e, "ignore rule failed on class loader");
            true
        });
        loader_hit
            || self.types.matches(ty).unwrap_or_else(|e| {
                debug!(type_name = %ty, error = %e, "ignore rule failed on type");
                true
            })
    }

    /// Same as [`matches`](Self::matches) for a class known only by name,
    /// such as an already-loaded class considered for retransformation.
    pub fn ignores(&self, binary_name: &str, loader: &ClassLoaderDescription) -> bool {
        self.matches(&TypeDescription::new(binary_name), loader)
    }
}

impl fmt::Display for IgnoreRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ignore(types: {}, loaders: {})", self.types, self.loaders)
    }
}

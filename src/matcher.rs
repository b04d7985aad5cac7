//! Composable predicates over types, methods and class loaders.
//!
//! Matchers are pure. They may fail (a super type cannot be resolved, a
//! class loader misbehaves), so they return `Result`; deciding what a
//! failure means is left to the caller. Every matcher renders itself
//! through `Display`, which is what shows up in match diagnostics.
//!
//! ```rust,ignore
//! use apm_bci::matcher::*;
//!
//! let types = named("co.elastic.logging.jul.EcsFormatter")
//!     .or(has_super_type(named("java.util.logging.Formatter")));
//! let methods = named("getMdcEntries").and(takes_arguments(0));
//! ```

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::classfile::{
    ClassFileError, ACC_ABSTRACT, ACC_FINAL, ACC_INTERFACE, ACC_NATIVE, ACC_PUBLIC, ACC_STATIC, ACC_SYNTHETIC,
};
use crate::description::{
    AnnotatedElement, ClassLoaderDescription, MethodDescription, ModifierReviewable, NamedElement,
    TypeDescription,
};

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("cannot resolve {name}: {reason}")]
    Unresolvable { name: String, reason: String },
    #[error("class loader lookup failed: {0}")]
    Loader(String),
    #[error(transparent)]
    ClassFile(#[from] ClassFileError),
    #[error("{0}")]
    Failed(String),
}

pub trait ElementMatcher<T: ?Sized>: fmt::Display + Send + Sync {
    fn matches(&self, target: &T) -> Result<bool, MatchError>;
}

/// A shareable matcher that composes with `and`, `or` and [`not`].
pub struct Junction<T: ?Sized>(Arc<dyn ElementMatcher<T>>);

impl<T: ?Sized> Clone for Junction<T> {
    fn clone(&self) -> Self {
        Junction(Arc::clone(&self.0))
    }
}

impl<T: ?Sized> fmt::Display for Junction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<T: ?Sized> fmt::Debug for Junction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Junction({})", self.0)
    }
}

impl<T: ?Sized> ElementMatcher<T> for Junction<T> {
    fn matches(&self, target: &T) -> Result<bool, MatchError> {
        self.0.matches(target)
    }
}

impl<T: ?Sized + 'static> Junction<T> {
    pub fn new<M: ElementMatcher<T> + 'static>(matcher: M) -> Self {
        Junction(Arc::new(matcher))
    }

    pub fn matches(&self, target: &T) -> Result<bool, MatchError> {
        self.0.matches(target)
    }

    pub fn and(self, other: Junction<T>) -> Junction<T> {
        Junction::new(Conjunction(self, other))
    }

    pub fn or(self, other: Junction<T>) -> Junction<T> {
        Junction::new(Disjunction(self, other))
    }
}

struct Conjunction<T: ?Sized>(Junction<T>, Junction<T>);

impl<T: ?Sized> fmt::Display for Conjunction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} and {})", self.0, self.1)
    }
}

impl<T: ?Sized + 'static> ElementMatcher<T> for Conjunction<T> {
    fn matches(&self, target: &T) -> Result<bool, MatchError> {
        Ok(self.0.matches(target)? && self.1.matches(target)?)
    }
}

struct Disjunction<T: ?Sized>(Junction<T>, Junction<T>);

impl<T: ?Sized> fmt::Display for Disjunction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} or {})", self.0, self.1)
    }
}

impl<T: ?Sized + 'static> ElementMatcher<T> for Disjunction<T> {
    fn matches(&self, target: &T) -> Result<bool, MatchError> {
        Ok(self.0.matches(target)? || self.1.matches(target)?)
    }
}

struct Negation<T: ?Sized>(Junction<T>);

impl<T: ?Sized> fmt::Display for Negation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not({})", self.0)
    }
}

impl<T: ?Sized + 'static> ElementMatcher<T> for Negation<T> {
    fn matches(&self, target: &T) -> Result<bool, MatchError> {
        Ok(!self.0.matches(target)?)
    }
}

pub fn not<T: ?Sized + 'static>(matcher: Junction<T>) -> Junction<T> {
    Junction::new(Negation(matcher))
}

struct Constant<T: ?Sized> {
    value: bool,
    _target: PhantomData<fn(&T)>,
}

impl<T: ?Sized> fmt::Display for Constant<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.value { "any()" } else { "none()" })
    }
}

impl<T: ?Sized> ElementMatcher<T> for Constant<T> {
    fn matches(&self, _target: &T) -> Result<bool, MatchError> {
        Ok(self.value)
    }
}

pub fn any<T: ?Sized + 'static>() -> Junction<T> {
    Junction::new(Constant { value: true, _target: PhantomData })
}

pub fn none<T: ?Sized + 'static>() -> Junction<T> {
    Junction::new(Constant { value: false, _target: PhantomData })
}

// =============================================================================
// Names
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum NameMode {
    Equals,
    StartsWith,
    EndsWith,
    Contains,
}

struct NameMatcher<T: ?Sized> {
    mode: NameMode,
    value: String,
    _target: PhantomData<fn(&T)>,
}

impl<T: ?Sized> fmt::Display for NameMatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.mode {
            NameMode::Equals => "named",
            NameMode::StartsWith => "name_starts_with",
            NameMode::EndsWith => "name_ends_with",
            NameMode::Contains => "name_contains",
        };
        write!(f, "{label}({:?})", self.value)
    }
}

impl<T: ?Sized + NamedElement> ElementMatcher<T> for NameMatcher<T> {
    fn matches(&self, target: &T) -> Result<bool, MatchError> {
        let name = target.name();
        Ok(match self.mode {
            NameMode::Equals => name == self.value,
            NameMode::StartsWith => name.starts_with(&self.value),
            NameMode::EndsWith => name.ends_with(&self.value),
            NameMode::Contains => name.contains(&self.value),
        })
    }
}

fn name_matcher<T: ?Sized + NamedElement + 'static>(mode: NameMode, value: &str) -> Junction<T> {
    Junction::new(NameMatcher { mode, value: value.to_string(), _target: PhantomData })
}

/// Exact name: binary name for types and loaders, plain name for methods.
pub fn named<T: ?Sized + NamedElement + 'static>(name: &str) -> Junction<T> {
    name_matcher(NameMode::Equals, name)
}

pub fn name_starts_with<T: ?Sized + NamedElement + 'static>(prefix: &str) -> Junction<T> {
    name_matcher(NameMode::StartsWith, prefix)
}

pub fn name_ends_with<T: ?Sized + NamedElement + 'static>(suffix: &str) -> Junction<T> {
    name_matcher(NameMode::EndsWith, suffix)
}

pub fn name_contains<T: ?Sized + NamedElement + 'static>(infix: &str) -> Junction<T> {
    name_matcher(NameMode::Contains, infix)
}

// =============================================================================
// Modifiers and annotations
// =============================================================================

struct ModifierMatcher<T: ?Sized> {
    mask: u16,
    label: &'static str,
    _target: PhantomData<fn(&T)>,
}

impl<T: ?Sized> fmt::Display for ModifierMatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}()", self.label)
    }
}

impl<T: ?Sized + ModifierReviewable> ElementMatcher<T> for ModifierMatcher<T> {
    fn matches(&self, target: &T) -> Result<bool, MatchError> {
        Ok(target.modifiers() & self.mask != 0)
    }
}

fn modifier<T: ?Sized + ModifierReviewable + 'static>(mask: u16, label: &'static str) -> Junction<T> {
    Junction::new(ModifierMatcher { mask, label, _target: PhantomData })
}

pub fn is_public<T: ?Sized + ModifierReviewable + 'static>() -> Junction<T> {
    modifier(ACC_PUBLIC, "is_public")
}

pub fn is_static<T: ?Sized + ModifierReviewable + 'static>() -> Junction<T> {
    modifier(ACC_STATIC, "is_static")
}

pub fn is_final<T: ?Sized + ModifierReviewable + 'static>() -> Junction<T> {
    modifier(ACC_FINAL, "is_final")
}

pub fn is_abstract<T: ?Sized + ModifierReviewable + 'static>() -> Junction<T> {
    modifier(ACC_ABSTRACT, "is_abstract")
}

pub fn is_native<T: ?Sized + ModifierReviewable + 'static>() -> Junction<T> {
    modifier(ACC_NATIVE, "is_native")
}

pub fn is_synthetic<T: ?Sized + ModifierReviewable + 'static>() -> Junction<T> {
    modifier(ACC_SYNTHETIC, "is_synthetic")
}

pub fn is_interface() -> Junction<TypeDescription> {
    modifier(ACC_INTERFACE, "is_interface")
}

struct AnnotationMatcher<T: ?Sized> {
    annotation: String,
    _target: PhantomData<fn(&T)>,
}

impl<T: ?Sized> fmt::Display for AnnotationMatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "is_annotated_with({:?})", self.annotation)
    }
}

impl<T: ?Sized + AnnotatedElement> ElementMatcher<T> for AnnotationMatcher<T> {
    fn matches(&self, target: &T) -> Result<bool, MatchError> {
        Ok(target.annotations().iter().any(|a| *a == self.annotation))
    }
}

/// Carries an annotation of the given binary type name.
pub fn is_annotated_with<T: ?Sized + AnnotatedElement + 'static>(annotation: &str) -> Junction<T> {
    Junction::new(AnnotationMatcher { annotation: annotation.to_string(), _target: PhantomData })
}

// =============================================================================
// Closures
// =============================================================================

struct FnMatcher<T: ?Sized, F> {
    label: String,
    f: F,
    _target: PhantomData<fn(&T)>,
}

impl<T: ?Sized, F> fmt::Display for FnMatcher<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl<T: ?Sized, F> ElementMatcher<T> for FnMatcher<T, F>
where
    F: Fn(&T) -> Result<bool, MatchError> + Send + Sync,
{
    fn matches(&self, target: &T) -> Result<bool, MatchError> {
        (self.f)(target)
    }
}

/// Lifts a closure into a matcher; `label` is its diagnostic rendering.
pub fn matcher_fn<T, F>(label: impl Into<String>, f: F) -> Junction<T>
where
    T: ?Sized + 'static,
    F: Fn(&T) -> Result<bool, MatchError> + Send + Sync + 'static,
{
    Junction::new(FnMatcher { label: label.into(), f, _target: PhantomData })
}

// =============================================================================
// Methods
// =============================================================================

/// Excludes constructors and type initializers.
pub fn is_method() -> Junction<MethodDescription> {
    matcher_fn("is_method()", |m: &MethodDescription| Ok(m.is_method()))
}

pub fn is_constructor() -> Junction<MethodDescription> {
    matcher_fn("is_constructor()", |m: &MethodDescription| Ok(m.is_constructor()))
}

pub fn takes_arguments(count: usize) -> Junction<MethodDescription> {
    matcher_fn(format!("takes_arguments({count})"), move |m: &MethodDescription| {
        Ok(m.parameter_types().len() == count)
    })
}

/// The parameter at `index` has the given source-level type name.
pub fn takes_argument(index: usize, type_name: &str) -> Junction<MethodDescription> {
    let type_name = type_name.to_string();
    matcher_fn(format!("takes_argument({index}, {type_name:?})"), move |m: &MethodDescription| {
        Ok(m.parameter_types().get(index).is_some_and(|t| *t == type_name))
    })
}

pub fn returns(type_name: &str) -> Junction<MethodDescription> {
    let type_name = type_name.to_string();
    matcher_fn(format!("returns({type_name:?})"), move |m: &MethodDescription| {
        Ok(m.return_type() == type_name)
    })
}

pub fn has_descriptor(descriptor: &str) -> Junction<MethodDescription> {
    let descriptor = descriptor.to_string();
    matcher_fn(format!("has_descriptor({descriptor:?})"), move |m: &MethodDescription| {
        Ok(m.descriptor() == descriptor)
    })
}

// =============================================================================
// Type hierarchy
// =============================================================================

struct HasSuperType(Junction<TypeDescription>);

impl fmt::Display for HasSuperType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "has_super_type({})", self.0)
    }
}

impl ElementMatcher<TypeDescription> for HasSuperType {
    fn matches(&self, target: &TypeDescription) -> Result<bool, MatchError> {
        if self.0.matches(target)? {
            return Ok(true);
        }
        // Resolve lazily and stop at the first hit, so an unresolvable type
        // further up only matters when nothing nearer matched.
        fn enqueue(t: &TypeDescription, seen: &mut HashSet<String>, queue: &mut VecDeque<String>) {
            for name in t.super_class_name().into_iter().chain(t.interface_names().iter().map(String::as_str)) {
                if seen.insert(name.to_string()) {
                    queue.push_back(name.to_string());
                }
            }
        }

        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        enqueue(target, &mut seen, &mut queue);
        while let Some(name) = queue.pop_front() {
            let super_type = target.resolve(&name)?;
            if self.0.matches(&super_type)? {
                return Ok(true);
            }
            enqueue(&super_type, &mut seen, &mut queue);
        }
        Ok(false)
    }
}

/// The type itself or any of its transitive super classes and interfaces
/// matches.
pub fn has_super_type(matcher: Junction<TypeDescription>) -> Junction<TypeDescription> {
    Junction::new(HasSuperType(matcher))
}

/// Shorthand for `has_super_type(named(name))`.
pub fn is_sub_type_of(name: &str) -> Junction<TypeDescription> {
    has_super_type(named(name))
}

/// Some method declared by the type matches.
pub fn declares_method(matcher: Junction<MethodDescription>) -> Junction<TypeDescription> {
    let label = format!("declares_method({matcher})");
    matcher_fn(label, move |t: &TypeDescription| {
        for method in t.declared_methods() {
            if matcher.matches(method)? {
                return Ok(true);
            }
        }
        Ok(false)
    })
}

/// Lives in the given package or one of its sub packages.
pub fn in_package(package: &str) -> Junction<TypeDescription> {
    let prefix = format!("{}.", package.trim_end_matches('.'));
    matcher_fn(format!("in_package({package:?})"), move |t: &TypeDescription| Ok(t.name().starts_with(&prefix)))
}

// =============================================================================
// Class loaders
// =============================================================================

pub fn is_bootstrap_class_loader() -> Junction<ClassLoaderDescription> {
    matcher_fn("is_bootstrap_class_loader()", |l: &ClassLoaderDescription| Ok(l.is_bootstrap()))
}

/// The loader's runtime class has exactly this binary name.
pub fn class_loader_with_name(name: &str) -> Junction<ClassLoaderDescription> {
    let name = name.to_string();
    matcher_fn(format!("class_loader_with_name({name:?})"), move |l: &ClassLoaderDescription| {
        Ok(l.type_name() == Some(name.as_str()))
    })
}

/// The JDK's delegating loaders backing generated reflection accessors.
pub fn is_reflection_class_loader() -> Junction<ClassLoaderDescription> {
    class_loader_with_name("sun.reflect.DelegatingClassLoader")
        .or(class_loader_with_name("jdk.internal.reflect.DelegatingClassLoader"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formatter() -> TypeDescription {
        TypeDescription::new("co.elastic.logging.jul.EcsFormatter")
            .with_method("getMdcEntries", "()Ljava/util/Map;", ACC_PUBLIC)
            .with_method("<init>", "()V", ACC_PUBLIC)
    }

    #[test]
    fn names_compose() {
        let t = formatter();
        assert!(named("co.elastic.logging.jul.EcsFormatter").matches(&t).unwrap());
        assert!(name_starts_with("co.elastic.").and(name_ends_with("Formatter")).matches(&t).unwrap());
        assert!(!not(name_contains(".jul.")).matches(&t).unwrap());
        assert!(none().or(named("co.elastic.logging.jul.EcsFormatter")).matches(&t).unwrap());
    }

    #[test]
    fn nested_junctions_evaluate_through_the_trait() {
        let t = formatter();
        let nested = not(named("a.B").or(name_starts_with("co.").and(name_ends_with("Parser"))));
        let erased: &dyn ElementMatcher<TypeDescription> = &nested;
        assert!(erased.matches(&t).unwrap());
        assert!(!erased.matches(&TypeDescription::new("co.elastic.JsonParser")).unwrap());
    }

    #[test]
    fn method_predicates_read_the_descriptor() {
        let t = formatter();
        let m = &t.declared_methods()[0];
        assert!(is_method().and(takes_arguments(0)).and(returns("java.util.Map")).matches(m).unwrap());
        assert!(is_constructor().matches(&t.declared_methods()[1]).unwrap());
        assert!(!is_static().matches(m).unwrap());
        assert!(is_public().matches(m).unwrap());
        assert!(declares_method(named("getMdcEntries")).matches(&t).unwrap());
    }

    #[test]
    fn errors_propagate_through_junctions() {
        let failing = matcher_fn("failing()", |_: &TypeDescription| Err(MatchError::Failed("boom".into())));
        let t = formatter();
        assert!(failing.clone().and(any()).matches(&t).is_err());
        // short-circuiting keeps the failing side from running
        assert!(!none().and(failing.clone()).matches(&t).unwrap());
        assert!(any().or(failing).matches(&t).unwrap());
    }

    #[test]
    fn has_super_type_matches_self_before_resolving() {
        let t = TypeDescription::new("a.Leaf").with_super_class("a.Unknown");
        assert!(has_super_type(named("a.Leaf")).matches(&t).unwrap());
        assert!(has_super_type(named("a.Other")).matches(&t).is_err());
    }

    #[test]
    fn reflection_loaders_are_recognized() {
        let jdk8 = ClassLoaderDescription::of("sun.reflect.DelegatingClassLoader");
        let jdk11 = ClassLoaderDescription::of("jdk.internal.reflect.DelegatingClassLoader");
        let app = ClassLoaderDescription::of("jdk.internal.loader.ClassLoaders$AppClassLoader");
        let m = is_reflection_class_loader();
        assert!(m.matches(&jdk8).unwrap());
        assert!(m.matches(&jdk11).unwrap());
        assert!(!m.matches(&app).unwrap());
        assert!(!m.matches(&ClassLoaderDescription::bootstrap()).unwrap());
        assert!(is_bootstrap_class_loader().matches(&ClassLoaderDescription::bootstrap()).unwrap());
    }

    #[test]
    fn matchers_render_for_diagnostics() {
        let m: Junction<TypeDescription> = named("a.B").or(not(name_starts_with("java.")));
        assert_eq!(m.to_string(), "(named(\"a.B\") or not(name_starts_with(\"java.\")))");
        assert_eq!(is_reflection_class_loader().to_string(),
            "(class_loader_with_name(\"sun.reflect.DelegatingClassLoader\") or class_loader_with_name(\"jdk.internal.reflect.DelegatingClassLoader\"))");
    }

    #[test]
    fn packages_include_sub_packages() {
        let m = in_package("co.elastic.logging");
        assert!(m.matches(&formatter()).unwrap());
        assert!(!m.matches(&TypeDescription::new("co.elastic.loggingx.A")).unwrap());
    }
}

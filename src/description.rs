//! What matchers look at.
//!
//! A [`TypeDescription`] is built from the bytes handed to a transformer,
//! before the class exists in the JVM, so everything here is derived from
//! the class file rather than from reflection. Super types are resolved
//! lazily through a [`TypePool`] bound to the defining class loader.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::classfile::{ClassFile, ClassFileError, ACC_ABSTRACT, ACC_ANNOTATION, ACC_INTERFACE, ACC_PUBLIC};
use crate::matcher::MatchError;

pub const OBJECT: &str = "java.lang.Object";

/// Converts an internal name (`java/lang/String`) to a binary name
/// (`java.lang.String`).
pub fn binary_name(internal: &str) -> String {
    internal.replace('/', ".")
}

/// Converts a binary name (`java.lang.String`) to an internal name
/// (`java/lang/String`).
pub fn internal_name(binary: &str) -> String {
    binary.replace('.', "/")
}

/// Elements that have a name matchers can test.
pub trait NamedElement {
    fn name(&self) -> &str;
}

/// Elements with JVM access flags.
pub trait ModifierReviewable {
    fn modifiers(&self) -> u16;
}

/// Elements that carry annotations, by binary name of the annotation type.
pub trait AnnotatedElement {
    fn annotations(&self) -> &[String];
}

/// Resolves types by binary name, typically through a class loader.
pub trait TypePool {
    fn describe(&self, name: &str) -> Result<TypeDescription, MatchError>;
}

#[derive(Clone)]
pub struct TypeDescription {
    name: String,
    super_class: Option<String>,
    interfaces: Vec<String>,
    modifiers: u16,
    annotations: Vec<String>,
    methods: Vec<MethodDescription>,
    pool: Option<Arc<dyn TypePool>>,
}

impl fmt::Debug for TypeDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescription")
            .field("name", &self.name)
            .field("super_class", &self.super_class)
            .field("interfaces", &self.interfaces)
            .field("modifiers", &self.modifiers)
            .field("methods", &self.methods.len())
            .finish()
    }
}

impl fmt::Display for TypeDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl TypeDescription {
    /// A public class extending `java.lang.Object` with no members.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let super_class = (name != OBJECT).then(|| OBJECT.to_string());
        TypeDescription {
            name,
            super_class,
            interfaces: Vec::new(),
            modifiers: ACC_PUBLIC,
            annotations: Vec::new(),
            methods: Vec::new(),
            pool: None,
        }
    }

    pub fn with_super_class(mut self, name: impl Into<String>) -> Self {
        self.super_class = Some(name.into());
        self
    }

    pub fn with_interface(mut self, name: impl Into<String>) -> Self {
        self.interfaces.push(name.into());
        self
    }

    pub fn with_modifiers(mut self, modifiers: u16) -> Self {
        self.modifiers = modifiers;
        self
    }

    pub fn with_annotation(mut self, name: impl Into<String>) -> Self {
        self.annotations.push(name.into());
        self
    }

    /// Declares a method on this type.
    pub fn with_method(mut self, name: &str, descriptor: &str, modifiers: u16) -> Self {
        let method = MethodDescription::new(&self.name, name, descriptor, modifiers);
        self.methods.push(method);
        self
    }

    pub fn with_type_pool(mut self, pool: Arc<dyn TypePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn from_class_file(class: &ClassFile) -> Result<Self, ClassFileError> {
        let name = binary_name(class.class_name()?);
        let cp = &class.constant_pool;

        let mut methods = Vec::with_capacity(class.methods.len());
        for method in &class.methods {
            let annotations = class
                .annotation_types(&method.attributes)?
                .into_iter()
                .map(binary_name)
                .collect();
            methods.push(MethodDescription {
                declaring_type: name.clone(),
                name: method.name(cp)?.to_string(),
                descriptor: method.descriptor(cp)?.to_string(),
                modifiers: method.access_flags,
                annotations,
            });
        }

        Ok(TypeDescription {
            super_class: class.super_class_name()?.map(binary_name),
            interfaces: class.interface_names()?.into_iter().map(binary_name).collect(),
            modifiers: class.access_flags,
            annotations: class
                .annotation_types(&class.attributes)?
                .into_iter()
                .map(binary_name)
                .collect(),
            methods,
            pool: None,
            name,
        })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFileError> {
        Self::from_class_file(&ClassFile::parse(bytes)?)
    }

    /// Binary name, e.g. `java.util.HashMap$Node`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn internal_name(&self) -> String {
        internal_name(&self.name)
    }

    /// Name without the package, e.g. `HashMap$Node`.
    pub fn simple_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    /// Package name; empty for the default package.
    pub fn package_name(&self) -> &str {
        self.name.rsplit_once('.').map(|(package, _)| package).unwrap_or("")
    }

    pub fn super_class_name(&self) -> Option<&str> {
        self.super_class.as_deref()
    }

    pub fn interface_names(&self) -> &[String] {
        &self.interfaces
    }

    pub fn modifiers(&self) -> u16 {
        self.modifiers
    }

    pub fn annotations(&self) -> &[String] {
        &self.annotations
    }

    pub fn declared_methods(&self) -> &[MethodDescription] {
        &self.methods
    }

    pub fn is_interface(&self) -> bool {
        self.modifiers & ACC_INTERFACE != 0
    }

    pub fn is_annotation(&self) -> bool {
        self.modifiers & ACC_ANNOTATION != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.modifiers & ACC_ABSTRACT != 0
    }

    pub fn type_pool(&self) -> Option<&Arc<dyn TypePool>> {
        self.pool.as_ref()
    }

    /// Resolves a type visible from this one.
    ///
    /// `java.lang.Object` always resolves, even without a pool.
    pub fn resolve(&self, name: &str) -> Result<TypeDescription, MatchError> {
        if name == OBJECT {
            return Ok(TypeDescription::new(OBJECT));
        }
        match &self.pool {
            Some(pool) => pool.describe(name),
            None => Err(MatchError::Unresolvable {
                name: name.to_string(),
                reason: "no type pool".to_string(),
            }),
        }
    }

    /// Every transitive super class and interface, nearest first, each once.
    pub fn super_types(&self) -> Result<Vec<TypeDescription>, MatchError> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut out = Vec::new();

        fn enqueue(t: &TypeDescription, seen: &mut HashSet<String>, queue: &mut VecDeque<String>) {
            for name in t.super_class.iter().chain(t.interfaces.iter()) {
                if seen.insert(name.clone()) {
                    queue.push_back(name.clone());
                }
            }
        }

        enqueue(self, &mut seen, &mut queue);
        while let Some(name) = queue.pop_front() {
            let resolved = self.resolve(&name)?;
            enqueue(&resolved, &mut seen, &mut queue);
            out.push(resolved);
        }
        Ok(out)
    }
}

impl NamedElement for TypeDescription {
    fn name(&self) -> &str {
        &self.name
    }
}

impl ModifierReviewable for TypeDescription {
    fn modifiers(&self) -> u16 {
        self.modifiers
    }
}

impl AnnotatedElement for TypeDescription {
    fn annotations(&self) -> &[String] {
        &self.annotations
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescription {
    declaring_type: String,
    name: String,
    descriptor: String,
    modifiers: u16,
    annotations: Vec<String>,
}

impl MethodDescription {
    pub fn new(declaring_type: &str, name: &str, descriptor: &str, modifiers: u16) -> Self {
        MethodDescription {
            declaring_type: declaring_type.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            modifiers,
            annotations: Vec::new(),
        }
    }

    pub fn with_annotation(mut self, name: impl Into<String>) -> Self {
        self.annotations.push(name.into());
        self
    }

    pub fn declaring_type(&self) -> &str {
        &self.declaring_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// JVM descriptor, e.g. `(Ljava/lang/String;I)V`.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn modifiers(&self) -> u16 {
        self.modifiers
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    pub fn is_type_initializer(&self) -> bool {
        self.name == "<clinit>"
    }

    /// A regular method: neither constructor nor type initializer.
    pub fn is_method(&self) -> bool {
        !self.is_constructor() && !self.is_type_initializer()
    }

    /// Parameter types as source-level names, e.g. `["java.lang.String", "int[]"]`.
    pub fn parameter_types(&self) -> Vec<String> {
        let mut types = Vec::new();
        let Some(mut rest) = self.descriptor.strip_prefix('(') else {
            return types;
        };
        while !rest.starts_with(')') {
            match next_type(rest) {
                Some((ty, tail)) => {
                    types.push(ty);
                    rest = tail;
                }
                None => break,
            }
        }
        types
    }

    /// Return type as a source-level name, `void` included.
    pub fn return_type(&self) -> String {
        self.descriptor
            .rsplit_once(')')
            .and_then(|(_, ret)| next_type(ret))
            .map(|(ty, _)| ty)
            .unwrap_or_default()
    }
}

impl fmt::Display for MethodDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}{}", self.declaring_type, self.name, self.descriptor)
    }
}

impl NamedElement for MethodDescription {
    fn name(&self) -> &str {
        &self.name
    }
}

impl ModifierReviewable for MethodDescription {
    fn modifiers(&self) -> u16 {
        self.modifiers
    }
}

impl AnnotatedElement for MethodDescription {
    fn annotations(&self) -> &[String] {
        &self.annotations
    }
}

/// Decodes one field type off the front of `s`.
fn next_type(s: &str) -> Option<(String, &str)> {
    let dims = s.bytes().take_while(|&b| b == b'[').count();
    let rest = &s[dims..];
    let (base, tail) = match rest.as_bytes().first()? {
        b'L' => {
            let end = rest.find(';')?;
            (binary_name(&rest[1..end]), &rest[end + 1..])
        }
        b'B' => ("byte".to_string(), &rest[1..]),
        b'C' => ("char".to_string(), &rest[1..]),
        b'D' => ("double".to_string(), &rest[1..]),
        b'F' => ("float".to_string(), &rest[1..]),
        b'I' => ("int".to_string(), &rest[1..]),
        b'J' => ("long".to_string(), &rest[1..]),
        b'S' => ("short".to_string(), &rest[1..]),
        b'Z' => ("boolean".to_string(), &rest[1..]),
        b'V' => ("void".to_string(), &rest[1..]),
        _ => return None,
    };
    Some((format!("{base}{}", "[]".repeat(dims)), tail))
}

/// A class loader as seen by matchers: its runtime type, or bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassLoaderDescription {
    type_name: Option<String>,
    display: Option<String>,
}

impl ClassLoaderDescription {
    pub fn bootstrap() -> Self {
        ClassLoaderDescription { type_name: None, display: None }
    }

    /// A loader whose runtime class has binary name `type_name`.
    pub fn of(type_name: impl Into<String>) -> Self {
        ClassLoaderDescription { type_name: Some(type_name.into()), display: None }
    }

    /// Attaches the loader's own string form (its `toString()`), used in logs.
    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    pub fn is_bootstrap(&self) -> bool {
        self.type_name.is_none()
    }

    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }
}

impl fmt::Display for ClassLoaderDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.display, &self.type_name) {
            (Some(display), _) => f.write_str(display),
            (None, Some(type_name)) => f.write_str(type_name),
            (None, None) => f.write_str("bootstrap"),
        }
    }
}

impl NamedElement for ClassLoaderDescription {
    fn name(&self) -> &str {
        self.type_name.as_deref().unwrap_or("")
    }
}

/// A [`TypePool`] over any source of class file bytes, keyed by internal
/// name. Resolved descriptions are cached and handed out bound to this
/// pool, so their own super types resolve through it as well.
pub struct ClassFileTypePool<F> {
    source: F,
    cache: DashMap<String, TypeDescription>,
    this: Weak<ClassFileTypePool<F>>,
}

impl<F> ClassFileTypePool<F>
where
    F: Fn(&str) -> Result<Option<Vec<u8>>, MatchError> + 'static,
{
    pub fn new(source: F) -> Arc<Self> {
        Arc::new_cyclic(|this| ClassFileTypePool {
            source,
            cache: DashMap::new(),
            this: this.clone(),
        })
    }

    fn bind(&self, description: TypeDescription) -> TypeDescription {
        match self.this.upgrade() {
            Some(pool) => description.with_type_pool(pool),
            None => description,
        }
    }
}

impl<F> TypePool for ClassFileTypePool<F>
where
    F: Fn(&str) -> Result<Option<Vec<u8>>, MatchError> + 'static,
{
    fn describe(&self, name: &str) -> Result<TypeDescription, MatchError> {
        if let Some(cached) = self.cache.get(name) {
            return Ok(self.bind(cached.clone()));
        }
        let bytes = (self.source)(&internal_name(name))?.ok_or_else(|| MatchError::Unresolvable {
            name: name.to_string(),
            reason: "class file not found".to_string(),
        })?;
        // Cached without a pool: the pool owns the cache.
        let description = TypeDescription::parse(&bytes)?;
        self.cache.insert(name.to_string(), description.clone());
        Ok(self.bind(description))
    }
}

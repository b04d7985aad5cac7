#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use apm_bci::classfile::{ClassFile, CpInfo};
use apm_bci::description::{ClassLoaderDescription, MethodDescription, TypeDescription};
use apm_bci::host::{
    same_transformer, ClassFileTransformer, ClassHandle, ClassLoader, HostError, InstrumentationHost, LoadedClass,
    LoaderError, TransformRequest,
};
use apm_bci::instrumentation::{BoxError, HookReference, Instrumentation};
use apm_bci::locator::InMemoryLocator;
use apm_bci::matcher::{any, Junction};
use apm_bci::tracer::Tracer;
use parking_lot::{Mutex, RwLock};

pub const RETURN: u8 = 0xb1;
pub const IRETURN: u8 = 0xac;
pub const INVOKESTATIC: u8 = 0xb8;
pub const NOP: u8 = 0x00;

/// Constant pool index of the built class itself.
pub const THIS_CLASS: u16 = 2;

pub fn u1(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn u2(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn u4(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn push_attr(out: &mut Vec<u8>, name_index: u16, info: &[u8]) {
    u2(out, name_index);
    u4(out, info.len() as u32);
    out.extend_from_slice(info);
}

pub struct CpBuilder {
    entries: Vec<Vec<u8>>,
    utf8: HashMap<String, u16>,
}

impl CpBuilder {
    pub fn new() -> Self {
        Self { entries: Vec::new(), utf8: HashMap::new() }
    }

    pub fn push(&mut self, entry: Vec<u8>) -> u16 {
        self.entries.push(entry);
        self.entries.len() as u16
    }

    pub fn utf8(&mut self, s: &str) -> u16 {
        if let Some(&index) = self.utf8.get(s) {
            return index;
        }
        let mut entry = vec![1];
        entry.extend_from_slice(&(s.len() as u16).to_be_bytes());
        entry.extend_from_slice(s.as_bytes());
        let index = self.push(entry);
        self.utf8.insert(s.to_string(), index);
        index
    }

    pub fn class(&mut self, internal_name: &str) -> u16 {
        let name_index = self.utf8(internal_name);
        let mut entry = vec![7];
        entry.extend_from_slice(&name_index.to_be_bytes());
        self.push(entry)
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        let mut entry = vec![3];
        entry.extend_from_slice(&value.to_be_bytes());
        self.push(entry)
    }

    pub fn long(&mut self, value: i64) -> u16 {
        let mut entry = vec![5];
        entry.extend_from_slice(&value.to_be_bytes());
        let index = self.push(entry);
        // Longs take two slots.
        self.entries.push(Vec::new());
        index
    }

    pub fn count(&self) -> u16 {
        (self.entries.len() + 1) as u16
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        u2(out, self.count());
        for entry in &self.entries {
            out.extend_from_slice(entry);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CodeSpec {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    /// start, end, handler, catch type (0 for any).
    pub exceptions: Vec<(u16, u16, u16, u16)>,
    /// start pc, line.
    pub line_numbers: Vec<(u16, u16)>,
    /// start pc, length, name, descriptor, slot.
    pub locals: Vec<(u16, u16, &'static str, &'static str, u16)>,
    /// Encoded frames, without the leading count.
    pub stack_map: Option<(u16, Vec<u8>)>,
}

impl CodeSpec {
    pub fn new(max_stack: u16, max_locals: u16, code: Vec<u8>) -> Self {
        CodeSpec { max_stack, max_locals, code, ..Default::default() }
    }

    pub fn exception(mut self, start: u16, end: u16, handler: u16) -> Self {
        self.exceptions.push((start, end, handler, 0));
        self
    }

    pub fn line(mut self, pc: u16, line: u16) -> Self {
        self.line_numbers.push((pc, line));
        self
    }

    pub fn local(mut self, start: u16, length: u16, name: &'static str, descriptor: &'static str, slot: u16) -> Self {
        self.locals.push((start, length, name, descriptor, slot));
        self
    }

    pub fn frames(mut self, count: u16, encoded: Vec<u8>) -> Self {
        self.stack_map = Some((count, encoded));
        self
    }
}

/// `return`
pub fn returning_void() -> CodeSpec {
    CodeSpec::new(0, 1, vec![RETURN])
}

struct MethodSpec {
    access: u16,
    name: String,
    descriptor: String,
    code: Option<CodeSpec>,
    annotations: Vec<String>,
}

/// Builds class files with just enough structure for the engine: constant
/// pool, hierarchy, annotations and method bodies.
pub struct ClassBuilder {
    name: String,
    super_name: Option<String>,
    interfaces: Vec<String>,
    access: u16,
    annotations: Vec<String>,
    methods: Vec<MethodSpec>,
    source_file: Option<String>,
    raw_attributes: Vec<(String, Vec<u8>)>,
}

impl ClassBuilder {
    /// A public class `internal_name` extending `java/lang/Object`.
    pub fn new(internal_name: &str) -> Self {
        ClassBuilder {
            name: internal_name.to_string(),
            super_name: Some("java/lang/Object".to_string()),
            interfaces: Vec::new(),
            access: 0x0021,
            annotations: Vec::new(),
            methods: Vec::new(),
            source_file: None,
            raw_attributes: Vec::new(),
        }
    }

    pub fn extends(mut self, internal_name: &str) -> Self {
        self.super_name = Some(internal_name.to_string());
        self
    }

    pub fn implements(mut self, internal_name: &str) -> Self {
        self.interfaces.push(internal_name.to_string());
        self
    }

    pub fn access(mut self, flags: u16) -> Self {
        self.access = flags;
        self
    }

    /// Adds a runtime visible annotation by internal name.
    pub fn annotated(mut self, internal_name: &str) -> Self {
        self.annotations.push(internal_name.to_string());
        self
    }

    pub fn source_file(mut self, name: &str) -> Self {
        self.source_file = Some(name.to_string());
        self
    }

    /// A class attribute with the given name and body, copied verbatim.
    pub fn attribute(mut self, name: &str, info: Vec<u8>) -> Self {
        self.raw_attributes.push((name.to_string(), info));
        self
    }

    pub fn method(mut self, access: u16, name: &str, descriptor: &str, code: Option<CodeSpec>) -> Self {
        self.methods.push(MethodSpec {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code,
            annotations: Vec::new(),
        });
        self
    }

    /// Annotates the last added method.
    pub fn method_annotated(mut self, internal_name: &str) -> Self {
        if let Some(method) = self.methods.last_mut() {
            method.annotations.push(internal_name.to_string());
        }
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut cp = CpBuilder::new();
        let this_class = cp.class(&self.name);
        assert_eq!(this_class, THIS_CLASS);
        let super_class = self.super_name.as_deref().map_or(0, |s| cp.class(s));
        let interfaces: Vec<u16> = self.interfaces.iter().map(|i| cp.class(i)).collect();

        let mut methods = Vec::new();
        u2(&mut methods, self.methods.len() as u16);
        for method in &self.methods {
            u2(&mut methods, method.access);
            u2(&mut methods, cp.utf8(&method.name));
            u2(&mut methods, cp.utf8(&method.descriptor));

            let mut attrs = Vec::new();
            let mut count = 0;
            if let Some(code) = &method.code {
                push_attr(&mut attrs, cp.utf8("Code"), &code_info(&mut cp, code));
                count += 1;
            }
            if !method.annotations.is_empty() {
                push_attr(&mut attrs, cp.utf8("RuntimeVisibleAnnotations"), &annotations_info(&mut cp, &method.annotations));
                count += 1;
            }
            u2(&mut methods, count);
            methods.extend_from_slice(&attrs);
        }

        let mut class_attrs = Vec::new();
        let mut class_attr_count = 0;
        if !self.annotations.is_empty() {
            push_attr(&mut class_attrs, cp.utf8("RuntimeVisibleAnnotations"), &annotations_info(&mut cp, &self.annotations));
            class_attr_count += 1;
        }
        if let Some(source) = &self.source_file {
            let mut info = Vec::new();
            u2(&mut info, cp.utf8(source));
            push_attr(&mut class_attrs, cp.utf8("SourceFile"), &info);
            class_attr_count += 1;
        }
        for (name, info) in &self.raw_attributes {
            push_attr(&mut class_attrs, cp.utf8(name), info);
            class_attr_count += 1;
        }

        let mut bytes = Vec::new();
        u4(&mut bytes, 0xCAFEBABE);
        u2(&mut bytes, 0);
        u2(&mut bytes, 52);
        cp.write(&mut bytes);
        u2(&mut bytes, self.access);
        u2(&mut bytes, this_class);
        u2(&mut bytes, super_class);
        u2(&mut bytes, interfaces.len() as u16);
        for i in interfaces {
            u2(&mut bytes, i);
        }
        // no fields
        u2(&mut bytes, 0);
        bytes.extend_from_slice(&methods);
        u2(&mut bytes, class_attr_count);
        bytes.extend_from_slice(&class_attrs);
        bytes
    }
}

fn code_info(cp: &mut CpBuilder, code: &CodeSpec) -> Vec<u8> {
    let mut info = Vec::new();
    u2(&mut info, code.max_stack);
    u2(&mut info, code.max_locals);
    u4(&mut info, code.code.len() as u32);
    info.extend_from_slice(&code.code);
    u2(&mut info, code.exceptions.len() as u16);
    for &(start, end, handler, catch_type) in &code.exceptions {
        u2(&mut info, start);
        u2(&mut info, end);
        u2(&mut info, handler);
        u2(&mut info, catch_type);
    }

    let mut sub = Vec::new();
    let mut count = 0;
    if !code.line_numbers.is_empty() {
        let mut lnt = Vec::new();
        u2(&mut lnt, code.line_numbers.len() as u16);
        for &(pc, line) in &code.line_numbers {
            u2(&mut lnt, pc);
            u2(&mut lnt, line);
        }
        push_attr(&mut sub, cp.utf8("LineNumberTable"), &lnt);
        count += 1;
    }
    if !code.locals.is_empty() {
        let mut lvt = Vec::new();
        u2(&mut lvt, code.locals.len() as u16);
        for &(start, length, name, descriptor, slot) in &code.locals {
            u2(&mut lvt, start);
            u2(&mut lvt, length);
            u2(&mut lvt, cp.utf8(name));
            u2(&mut lvt, cp.utf8(descriptor));
            u2(&mut lvt, slot);
        }
        push_attr(&mut sub, cp.utf8("LocalVariableTable"), &lvt);
        count += 1;
    }
    if let Some((frames, encoded)) = &code.stack_map {
        let mut smt = Vec::new();
        u2(&mut smt, *frames);
        smt.extend_from_slice(encoded);
        push_attr(&mut sub, cp.utf8("StackMapTable"), &smt);
        count += 1;
    }
    u2(&mut info, count);
    info.extend_from_slice(&sub);
    info
}

fn annotations_info(cp: &mut CpBuilder, annotations: &[String]) -> Vec<u8> {
    let mut info = Vec::new();
    u2(&mut info, annotations.len() as u16);
    for annotation in annotations {
        u2(&mut info, cp.utf8(&format!("L{annotation};")));
        u2(&mut info, 0);
    }
    info
}

/// A hook class with static `()V` hook methods.
pub fn hook_class(internal_name: &str, enter: bool, exit: bool) -> Vec<u8> {
    let mut builder = ClassBuilder::new(internal_name);
    if enter {
        builder = builder.method(0x0009, "onMethodEnter", "()V", Some(returning_void()));
    }
    if exit {
        builder = builder.method(0x0009, "onMethodExit", "()V", Some(returning_void()));
    }
    builder.build()
}

/// A hook whose class file sits in its own in-memory locator.
pub fn hook(binary_name: &str, enter: bool, exit: bool) -> HookReference {
    let internal = binary_name.replace('.', "/");
    let locator = InMemoryLocator::new().with_class(internal.clone(), hook_class(&internal, enter, exit));
    HookReference::new(binary_name, Arc::new(locator))
}

/// `(class, name, descriptor)` of the `Methodref` at `index`.
pub fn method_ref(class: &ClassFile, index: u16) -> (String, String, String) {
    let cp = &class.constant_pool;
    let CpInfo::Methodref { class_index, name_and_type_index } = cp.get(index).unwrap() else {
        panic!("#{index} is not a Methodref");
    };
    let CpInfo::NameAndType { name_index, descriptor_index } = cp.get(*name_and_type_index).unwrap() else {
        panic!("#{name_and_type_index} is not a NameAndType");
    };
    (
        cp.class_name(*class_index).unwrap().to_string(),
        cp.get_utf8(*name_index).unwrap().to_string(),
        cp.get_utf8(*descriptor_index).unwrap().to_string(),
    )
}

/// Classes called with `invokestatic` in the code of method `name`.
pub fn static_calls(bytes: &[u8], name: &str) -> Vec<(String, String)> {
    let class = ClassFile::parse(bytes).unwrap();
    let method = class
        .methods
        .iter()
        .find(|m| m.name(&class.constant_pool).unwrap() == name)
        .unwrap_or_else(|| panic!("no method {name}"));
    let (_, code) = method.code().expect("method has code");
    let offsets = apm_bci::code::instruction_offsets(&code.code).unwrap();
    offsets
        .into_iter()
        .filter(|&pc| code.code[pc] == INVOKESTATIC)
        .map(|pc| {
            let (owner, method, _) = method_ref(&class, u16::from_be_bytes([code.code[pc + 1], code.code[pc + 2]]));
            (owner, method)
        })
        .collect()
}

// =============================================================================
// In-memory host
// =============================================================================

/// A class loader backed by a map of class files.
#[derive(Clone)]
pub struct FakeLoader {
    description: ClassLoaderDescription,
    parent: Option<Arc<FakeLoader>>,
    classes: Arc<HashMap<String, Vec<u8>>>,
    failing_lookups: bool,
}

impl FakeLoader {
    pub fn new(type_name: &str) -> Self {
        FakeLoader {
            description: ClassLoaderDescription::of(type_name),
            parent: None,
            classes: Arc::new(HashMap::new()),
            failing_lookups: false,
        }
    }

    pub fn app() -> Self {
        Self::new("jdk.internal.loader.ClassLoaders$AppClassLoader")
    }

    pub fn with_parent(mut self, parent: FakeLoader) -> Self {
        self.parent = Some(Arc::new(parent));
        self
    }

    pub fn with_class(mut self, internal_name: &str, bytes: Vec<u8>) -> Self {
        Arc::make_mut(&mut self.classes).insert(internal_name.to_string(), bytes);
        self
    }

    /// `can_load` throws, like loaders that reject foreign lookups.
    pub fn failing_lookups(mut self) -> Self {
        self.failing_lookups = true;
        self
    }
}

impl ClassLoader for FakeLoader {
    fn description(&self) -> ClassLoaderDescription {
        self.description.clone()
    }

    fn parent(&self) -> Result<Option<Arc<dyn ClassLoader>>, LoaderError> {
        Ok(self.parent.clone().map(|p| p as Arc<dyn ClassLoader>))
    }

    fn can_load(&self, binary_name: &str) -> Result<bool, LoaderError> {
        if self.failing_lookups {
            return Err(LoaderError::Exception { method: "loadClass" });
        }
        if self.classes.contains_key(&binary_name.replace('.', "/")) {
            return Ok(true);
        }
        match &self.parent {
            Some(parent) => parent.can_load(binary_name),
            None => Ok(false),
        }
    }

    fn class_file(&self, internal_name: &str) -> Result<Option<Vec<u8>>, LoaderError> {
        if let Some(bytes) = self.classes.get(internal_name) {
            return Ok(Some(bytes.clone()));
        }
        match &self.parent {
            Some(parent) => parent.class_file(internal_name),
            None => Ok(None),
        }
    }
}

struct FakeClass {
    internal_name: String,
    loader: Option<Arc<FakeLoader>>,
    original: Vec<u8>,
    current: Vec<u8>,
    modifiable: bool,
}

/// Plays the JVM: defines classes through the registered transformers and
/// retransforms them from their original bytes.
pub struct FakeHost {
    retransform_supported: bool,
    fail_batches: bool,
    transformers: RwLock<Vec<Arc<dyn ClassFileTransformer>>>,
    classes: Mutex<Vec<FakeClass>>,
    retransform_calls: Mutex<Vec<usize>>,
    redefinitions: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Self {
        FakeHost {
            retransform_supported: true,
            fail_batches: false,
            transformers: RwLock::new(Vec::new()),
            classes: Mutex::new(Vec::new()),
            retransform_calls: Mutex::new(Vec::new()),
            redefinitions: AtomicUsize::new(0),
        }
    }

    pub fn without_retransform() -> Self {
        FakeHost { retransform_supported: false, ..Self::new() }
    }

    /// Every retransform call with more than one class fails.
    pub fn failing_batches() -> Self {
        FakeHost { fail_batches: true, ..Self::new() }
    }

    /// Loads a class: runs the transformers and keeps the result.
    pub fn define(&self, internal_name: &str, bytes: Vec<u8>, loader: Option<FakeLoader>) -> Vec<u8> {
        let loader = loader.map(Arc::new);
        let current = self.run_transformers(internal_name, &bytes, loader.as_ref(), false);
        self.classes.lock().push(FakeClass {
            internal_name: internal_name.to_string(),
            loader,
            original: bytes,
            current: current.clone(),
            modifiable: true,
        });
        current
    }

    /// A loaded class the host refuses to modify, like a primitive or array.
    pub fn define_unmodifiable(&self, internal_name: &str, bytes: Vec<u8>) {
        self.classes.lock().push(FakeClass {
            internal_name: internal_name.to_string(),
            loader: None,
            original: bytes.clone(),
            current: bytes,
            modifiable: false,
        });
    }

    /// Current bytes of a loaded class.
    pub fn current(&self, internal_name: &str) -> Vec<u8> {
        self.classes
            .lock()
            .iter()
            .find(|c| c.internal_name == internal_name)
            .map(|c| c.current.clone())
            .unwrap_or_else(|| panic!("{internal_name} is not loaded"))
    }

    pub fn is_original(&self, internal_name: &str) -> bool {
        let classes = self.classes.lock();
        let class = classes.iter().find(|c| c.internal_name == internal_name).expect("loaded");
        class.current == class.original
    }

    pub fn transformer_count(&self) -> usize {
        self.transformers.read().len()
    }

    /// Sizes of the class lists passed to each retransform call.
    pub fn retransform_calls(&self) -> Vec<usize> {
        self.retransform_calls.lock().clone()
    }

    pub fn redefinitions(&self) -> usize {
        self.redefinitions.load(Ordering::SeqCst)
    }

    fn run_transformers(&self, internal_name: &str, bytes: &[u8], loader: Option<&Arc<FakeLoader>>, redefining: bool) -> Vec<u8> {
        let transformers = self.transformers.read().clone();
        let mut current = bytes.to_vec();
        for transformer in transformers {
            let result = {
                let request = TransformRequest {
                    class_name: Some(internal_name),
                    loader: loader.cloned().map(|l| l as Arc<dyn ClassLoader>),
                    redefining,
                    class_bytes: &current,
                };
                transformer.transform(&request)
            };
            if let Some(next) = result {
                current = next;
            }
        }
        current
    }
}

impl InstrumentationHost for FakeHost {
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
        Ok(self
            .classes
            .lock()
            .iter()
            .enumerate()
            .map(|(i, c)| LoadedClass {
                name: c.internal_name.replace('/', "."),
                loader: c.loader.as_ref().map_or_else(ClassLoaderDescription::bootstrap, |l| l.description()),
                modifiable: c.modifiable,
                handle: ClassHandle(i),
            })
            .collect())
    }

    fn retransform_classes(&self, classes: &[LoadedClass]) -> Result<(), HostError> {
        self.retransform_calls.lock().push(classes.len());
        if self.fail_batches && classes.len() > 1 {
            return Err(HostError::Jvmti("JVMTI_ERROR_INVALID_CLASS".to_string()));
        }
        for loaded in classes {
            let (internal_name, original, loader) = {
                let all = self.classes.lock();
                let class = &all[loaded.handle.0];
                if !class.modifiable {
                    return Err(HostError::Retransform {
                        class: loaded.name.clone(),
                        reason: "unmodifiable class".to_string(),
                    });
                }
                (class.internal_name.clone(), class.original.clone(), class.loader.clone())
            };
            let current = self.run_transformers(&internal_name, &original, loader.as_ref(), true);
            self.classes.lock()[loaded.handle.0].current = current;
            self.redefinitions.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// =============================================================================
// Instrumentation fixture
// =============================================================================

pub struct Fixture {
    pub name: String,
    pub types: Junction<TypeDescription>,
    pub methods: Junction<MethodDescription>,
    pub loaders: Junction<ClassLoaderDescription>,
    pub groups: Vec<String>,
    pub hook: HookReference,
    pub always_on: bool,
    pub init_error: Option<&'static str>,
    pub init_calls: AtomicUsize,
}

impl Fixture {
    pub fn new(name: &str, types: Junction<TypeDescription>, methods: Junction<MethodDescription>, hook: HookReference) -> Self {
        Fixture {
            name: name.to_string(),
            types,
            methods,
            loaders: any(),
            groups: Vec::new(),
            hook,
            always_on: false,
            init_error: None,
            init_calls: AtomicUsize::new(0),
        }
    }

    pub fn groups(mut self, groups: &[&str]) -> Self {
        self.groups = groups.iter().map(|g| g.to_string()).collect();
        self
    }

    pub fn loaders(mut self, loaders: Junction<ClassLoaderDescription>) -> Self {
        self.loaders = loaders;
        self
    }

    pub fn always_on(mut self) -> Self {
        self.always_on = true;
        self
    }

    pub fn failing_init(mut self, message: &'static str) -> Self {
        self.init_error = Some(message);
        self
    }

    pub fn into_arc(self) -> Arc<dyn Instrumentation> {
        Arc::new(self)
    }
}

impl Instrumentation for Fixture {
    fn type_matcher(&self) -> Junction<TypeDescription> {
        self.types.clone()
    }

    fn method_matcher(&self) -> Junction<MethodDescription> {
        self.methods.clone()
    }

    fn class_loader_matcher(&self) -> Junction<ClassLoaderDescription> {
        self.loaders.clone()
    }

    fn group_names(&self) -> Vec<String> {
        self.groups.clone()
    }

    fn hook(&self) -> HookReference {
        self.hook.clone()
    }

    fn include_when_instrumentation_is_disabled(&self) -> bool {
        self.always_on
    }

    fn init(&self, _tracer: &Tracer) -> Result<(), BoxError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        match self.init_error {
            Some(message) => Err(message.into()),
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

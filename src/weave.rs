//! Class-level weaving.
//!
//! Given a parsed class and a plan naming which methods receive which
//! hooks, appends the constant pool entries the hook calls need and
//! splices relocated `Code` attributes into a copy of the original bytes.
//! Field, method and attribute tables keep their shape, so the result is
//! always a legal retransformation of the input.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use crate::classfile::{ClassFile, ClassFileError};
use crate::code::{rewrite_code, CodePatch};

/// Name of the static hook method invoked before a matched method body.
pub const ON_METHOD_ENTER: &str = "onMethodEnter";
/// Name of the static hook method invoked before each normal return.
pub const ON_METHOD_EXIT: &str = "onMethodExit";
/// Descriptor both hook methods must have.
pub const HOOK_DESCRIPTOR: &str = "()V";

#[derive(Debug, thiserror::Error)]
pub enum WeaveError {
    #[error(transparent)]
    ClassFile(#[from] ClassFileError),
    #[error("unknown opcode {opcode:#04x} at offset {pc}")]
    UnknownOpcode { opcode: u8, pc: usize },
    #[error("instruction at offset {0} runs past the end of the code")]
    Truncated(usize),
    #[error("malformed switch at offset {0}")]
    MalformedSwitch(usize),
    #[error("offset {target} referenced at {pc} is not an instruction boundary")]
    InvalidBranchTarget { pc: usize, target: i64 },
    #[error("branch at offset {pc} no longer fits in 16 bits")]
    BranchOverflow { pc: usize },
    #[error("method body would grow to {0} bytes")]
    CodeTooLarge(usize),
    #[error("constant pool is full")]
    ConstantPoolOverflow,
    #[error("{0:?} cannot be stored as a constant pool Utf8 entry")]
    UnencodableConstant(String),
    #[error("class has no method #{0}")]
    NoSuchMethod(usize),
}

/// Hooks of one advice class to call from a single method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookCall {
    /// Internal name of the hook class, e.g. `co/elastic/apm/FooAdvice`.
    pub hook_class: String,
    pub enter: bool,
    pub exit: bool,
}

/// Which methods of a class receive which hooks, by method index.
#[derive(Debug, Default, Clone)]
pub struct WeavePlan {
    methods: BTreeMap<usize, Vec<HookCall>>,
}

impl WeavePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `hook` to the method at `method_index`. Hooks added to the same
    /// method nest: enter hooks run in insertion order, exit hooks in reverse.
    pub fn add(&mut self, method_index: usize, hook: HookCall) {
        self.methods.entry(method_index).or_default().push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Number of methods with at least one hook.
    pub fn len(&self) -> usize {
        self.methods.len()
    }
}

/// Constant pool entries appended after the existing ones.
struct PoolAppender {
    next: u32,
    bytes: Vec<u8>,
    utf8: HashMap<String, u16>,
    classes: HashMap<String, u16>,
    name_and_types: HashMap<(String, String), u16>,
    method_refs: HashMap<(String, String, String), u16>,
}

impl PoolAppender {
    fn new(count: u16) -> Self {
        PoolAppender {
            next: count as u32,
            bytes: Vec::new(),
            utf8: HashMap::new(),
            classes: HashMap::new(),
            name_and_types: HashMap::new(),
            method_refs: HashMap::new(),
        }
    }

    fn count(&self) -> u16 {
        self.next as u16
    }

    fn allocate(&mut self) -> Result<u16, WeaveError> {
        if self.next >= u16::MAX as u32 {
            return Err(WeaveError::ConstantPoolOverflow);
        }
        let index = self.next as u16;
        self.next += 1;
        Ok(index)
    }

    fn utf8(&mut self, value: &str) -> Result<u16, WeaveError> {
        if let Some(&index) = self.utf8.get(value) {
            return Ok(index);
        }
        // Standard and modified UTF-8 agree as long as there is no NUL and
        // nothing outside the BMP.
        if value.len() > u16::MAX as usize || value.chars().any(|c| c == '\0' || c > '\u{FFFF}') {
            return Err(WeaveError::UnencodableConstant(value.to_string()));
        }
        let index = self.allocate()?;
        self.bytes.push(1);
        self.bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.bytes.extend_from_slice(value.as_bytes());
        self.utf8.insert(value.to_string(), index);
        Ok(index)
    }

    fn class(&mut self, internal_name: &str) -> Result<u16, WeaveError> {
        if let Some(&index) = self.classes.get(internal_name) {
            return Ok(index);
        }
        let name_index = self.utf8(internal_name)?;
        let index = self.allocate()?;
        self.bytes.push(7);
        self.bytes.extend_from_slice(&name_index.to_be_bytes());
        self.classes.insert(internal_name.to_string(), index);
        Ok(index)
    }

    fn name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, WeaveError> {
        let key = (name.to_string(), descriptor.to_string());
        if let Some(&index) = self.name_and_types.get(&key) {
            return Ok(index);
        }
        let name_index = self.utf8(name)?;
        let descriptor_index = self.utf8(descriptor)?;
        let index = self.allocate()?;
        self.bytes.push(12);
        self.bytes.extend_from_slice(&name_index.to_be_bytes());
        self.bytes.extend_from_slice(&descriptor_index.to_be_bytes());
        self.name_and_types.insert(key, index);
        Ok(index)
    }

    fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> Result<u16, WeaveError> {
        let key = (class.to_string(), name.to_string(), descriptor.to_string());
        if let Some(&index) = self.method_refs.get(&key) {
            return Ok(index);
        }
        let class_index = self.class(class)?;
        let nat_index = self.name_and_type(name, descriptor)?;
        let index = self.allocate()?;
        self.bytes.push(10);
        self.bytes.extend_from_slice(&class_index.to_be_bytes());
        self.bytes.extend_from_slice(&nat_index.to_be_bytes());
        self.method_refs.insert(key, index);
        Ok(index)
    }
}

struct Splice {
    span: Range<usize>,
    name_index: u16,
    info: Vec<u8>,
}

/// Applies `plan` to `class_bytes`.
///
/// Returns `Ok(None)` when nothing had to change, e.g. every planned method
/// is abstract or native.
pub fn weave(class_bytes: &[u8], class: &ClassFile, plan: &WeavePlan) -> Result<Option<Vec<u8>>, WeaveError> {
    let mut pool = PoolAppender::new(class.constant_pool.count());
    let mut splices = Vec::with_capacity(plan.len());

    for (&method_index, hooks) in &plan.methods {
        let method = class.methods.get(method_index).ok_or(WeaveError::NoSuchMethod(method_index))?;
        let Some((attr, code)) = method.code() else {
            continue;
        };

        let mut patch = CodePatch::default();
        for hook in hooks.iter().filter(|h| h.enter) {
            patch.on_enter.push(pool.method_ref(&hook.hook_class, ON_METHOD_ENTER, HOOK_DESCRIPTOR)?);
        }
        for hook in hooks.iter().rev().filter(|h| h.exit) {
            patch.on_exit.push(pool.method_ref(&hook.hook_class, ON_METHOD_EXIT, HOOK_DESCRIPTOR)?);
        }
        if patch.is_empty() {
            continue;
        }

        splices.push(Splice {
            span: attr.span.clone(),
            name_index: attr.name_index,
            info: rewrite_code(code, class_bytes, &patch)?,
        });
    }

    if splices.is_empty() {
        return Ok(None);
    }

    let cp_end = class.constant_pool_end();
    let growth: usize = splices.iter().map(|s| s.info.len() + 6).sum();
    let mut out = Vec::with_capacity(class_bytes.len() + pool.bytes.len() + growth);

    // magic, minor and major version
    out.extend_from_slice(&class_bytes[..8]);
    out.extend_from_slice(&pool.count().to_be_bytes());
    out.extend_from_slice(&class_bytes[10..cp_end]);
    out.extend_from_slice(&pool.bytes);

    let mut cursor = cp_end;
    for splice in &splices {
        out.extend_from_slice(&class_bytes[cursor..splice.span.start]);
        out.extend_from_slice(&splice.name_index.to_be_bytes());
        out.extend_from_slice(&(splice.info.len() as u32).to_be_bytes());
        out.extend_from_slice(&splice.info);
        cursor = splice.span.end;
    }
    out.extend_from_slice(&class_bytes[cursor..]);

    Ok(Some(out))
}

//! Class file reader for instrumentation.
//!
//! Parses just enough of a `.class` file to describe it to matchers and to
//! splice rewritten method bodies back into the original bytes. Every
//! attribute remembers the byte span it occupies in the input, and the end
//! of the constant pool is recorded so new entries can be appended without
//! re-serializing the whole file. Everything outside those spans is copied
//! through untouched by the weaver.

use std::ops::Range;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_PROTECTED: u16 = 0x0004;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SYNCHRONIZED: u16 = 0x0020;
pub const ACC_BRIDGE: u16 = 0x0040;
pub const ACC_VARARGS: u16 = 0x0080;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_SYNTHETIC: u16 = 0x1000;
pub const ACC_ANNOTATION: u16 = 0x2000;
pub const ACC_ENUM: u16 = 0x4000;

#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<Attribute>,
    constant_pool_end: usize,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

/// An attribute together with the bytes it occupies in the class file,
/// header included.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name_index: u16,
    pub span: Range<usize>,
    pub info: AttributeInfo,
}

#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<Option<CpInfo>>,
}

impl ConstantPool {
    /// The `constant_pool_count` of the class file: one more than the
    /// highest valid index.
    pub fn count(&self) -> u16 {
        self.entries.len() as u16
    }

    pub fn get(&self, index: u16) -> Result<&CpInfo, ClassFileError> {
        if index == 0 {
            return Err(ClassFileError::InvalidConstantPoolIndex(index));
        }
        self.entries
            .get(index as usize)
            .and_then(|e| e.as_ref())
            .ok_or(ClassFileError::InvalidConstantPoolIndex(index))
    }

    pub fn get_utf8(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            CpInfo::Utf8(s) => Ok(s.as_str()),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    /// Resolves a `CONSTANT_Class` entry to its internal name.
    pub fn class_name(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            CpInfo::Class { name_index } => self.get_utf8(*name_index),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CpInfo {
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    String { string_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

/// The attributes the engine reads or rewrites. Everything else is kept
/// as `Unknown` and copied verbatim via its span.
#[derive(Debug, Clone)]
pub enum AttributeInfo {
    Code(CodeAttribute),
    StackMapTable(StackMapTableAttribute),
    LineNumberTable { entries: Vec<LineNumberEntry> },
    LocalVariableTable { entries: Vec<LocalVariableEntry> },
    LocalVariableTypeTable { entries: Vec<LocalVariableEntry> },
    RuntimeVisibleAnnotations { annotations: Vec<Annotation> },
    RuntimeInvisibleAnnotations { annotations: Vec<Annotation> },
    /// Type annotations carry bytecode offsets when they sit inside `Code`.
    RuntimeVisibleTypeAnnotations,
    RuntimeInvisibleTypeAnnotations,
    Signature { signature_index: u16 },
    SourceFile { sourcefile_index: u16 },
    Unknown { name: String },
}

#[derive(Debug, Clone)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

#[derive(Debug, Clone)]
pub struct StackMapTableAttribute {
    pub entries: Vec<StackMapFrame>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackMapFrame {
    Same { offset_delta: u16 },
    SameLocals1StackItem { offset_delta: u16, stack: VerificationTypeInfo },
    SameLocals1StackItemExtended { offset_delta: u16, stack: VerificationTypeInfo },
    Chop { offset_delta: u16, k: u8 },
    SameExtended { offset_delta: u16 },
    Append { offset_delta: u16, locals: Vec<VerificationTypeInfo> },
    Full { offset_delta: u16, locals: Vec<VerificationTypeInfo>, stack: Vec<VerificationTypeInfo> },
}

impl StackMapFrame {
    pub fn offset_delta(&self) -> u16 {
        match self {
            StackMapFrame::Same { offset_delta }
            | StackMapFrame::SameLocals1StackItem { offset_delta, .. }
            | StackMapFrame::SameLocals1StackItemExtended { offset_delta, .. }
            | StackMapFrame::Chop { offset_delta, .. }
            | StackMapFrame::SameExtended { offset_delta }
            | StackMapFrame::Append { offset_delta, .. }
            | StackMapFrame::Full { offset_delta, .. } => *offset_delta,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationTypeInfo {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    /// Bytecode offset of the `new` instruction that created the value.
    Uninitialized(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumberEntry {
    pub start_pc: u16,
    pub line_number: u16,
}

/// Shared layout of `LocalVariableTable` and `LocalVariableTypeTable`
/// entries; `descriptor_index` holds the signature for the latter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVariableEntry {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub index: u16,
}

#[derive(Debug, Clone)]
pub struct Annotation {
    pub type_index: u16,
    pub element_value_pairs: Vec<ElementValuePair>,
}

#[derive(Debug, Clone)]
pub struct ElementValuePair {
    pub element_name_index: u16,
    pub value: ElementValue,
}

#[derive(Debug, Clone)]
pub enum ElementValue {
    Const { tag: u8, const_value_index: u16 },
    EnumConst { type_name_index: u16, const_name_index: u16 },
    ClassInfo { class_info_index: u16 },
    AnnotationValue(Annotation),
    ArrayValue(Vec<ElementValue>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassFileError {
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("invalid magic: {0:#x}")]
    InvalidMagic(u32),
    #[error("invalid constant pool index: {0}")]
    InvalidConstantPoolIndex(u16),
    #[error("invalid constant pool tag: {0}")]
    InvalidConstantPoolTag(u8),
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    /// Offset of `data[0]` within the whole class file.
    base: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, base: 0 }
    }

    fn nested(data: &'a [u8], base: usize) -> Self {
        Self { data, pos: 0, base }
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u1(&mut self) -> Result<u8, ClassFileError> {
        let v = *self.data.get(self.pos).ok_or(ClassFileError::UnexpectedEof)?;
        self.pos += 1;
        Ok(v)
    }

    fn read_u2(&mut self) -> Result<u16, ClassFileError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u4(&mut self) -> Result<u32, ClassFileError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ClassFileError> {
        if self.remaining() < len {
            return Err(ClassFileError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = Reader::new(bytes);

        let magic = r.read_u4()?;
        if magic != 0xCAFEBABE {
            return Err(ClassFileError::InvalidMagic(magic));
        }

        let minor_version = r.read_u2()?;
        let major_version = r.read_u2()?;
        let constant_pool = parse_constant_pool(&mut r)?;
        let constant_pool_end = r.offset();

        let access_flags = r.read_u2()?;
        let this_class = r.read_u2()?;
        let super_class = r.read_u2()?;

        let interfaces_count = r.read_u2()?;
        let mut interfaces = Vec::with_capacity(interfaces_count as usize);
        for _ in 0..interfaces_count {
            interfaces.push(r.read_u2()?);
        }

        // Fields are walked over but not kept: weaving never touches them.
        let fields_count = r.read_u2()?;
        for _ in 0..fields_count {
            r.read_bytes(6)?;
            parse_attributes(&mut r, &constant_pool)?;
        }

        let methods_count = r.read_u2()?;
        let mut methods = Vec::with_capacity(methods_count as usize);
        for _ in 0..methods_count {
            methods.push(MethodInfo {
                access_flags: r.read_u2()?,
                name_index: r.read_u2()?,
                descriptor_index: r.read_u2()?,
                attributes: parse_attributes(&mut r, &constant_pool)?,
            });
        }

        let attributes = parse_attributes(&mut r, &constant_pool)?;

        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            methods,
            attributes,
            constant_pool_end,
        })
    }

    /// Byte offset just past the last constant pool entry.
    pub fn constant_pool_end(&self) -> usize {
        self.constant_pool_end
    }

    /// Internal name of this class, e.g. `java/util/HashMap`.
    pub fn class_name(&self) -> Result<&str, ClassFileError> {
        self.constant_pool.class_name(self.this_class)
    }

    /// Internal name of the super class; `None` only for `java/lang/Object`.
    pub fn super_class_name(&self) -> Result<Option<&str>, ClassFileError> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.constant_pool.class_name(self.super_class).map(Some)
    }

    pub fn interface_names(&self) -> Result<Vec<&str>, ClassFileError> {
        self.interfaces
            .iter()
            .map(|&i| self.constant_pool.class_name(i))
            .collect()
    }

    /// Internal names of the annotation types in `attributes`, visible and
    /// invisible alike.
    pub fn annotation_types<'a>(&'a self, attributes: &'a [Attribute]) -> Result<Vec<&'a str>, ClassFileError> {
        let mut types = Vec::new();
        for attr in attributes {
            match &attr.info {
                AttributeInfo::RuntimeVisibleAnnotations { annotations }
                | AttributeInfo::RuntimeInvisibleAnnotations { annotations } => {
                    for annotation in annotations {
                        let descriptor = self.constant_pool.get_utf8(annotation.type_index)?;
                        let internal = descriptor
                            .strip_prefix('L')
                            .and_then(|d| d.strip_suffix(';'))
                            .unwrap_or(descriptor);
                        types.push(internal);
                    }
                }
                _ => {}
            }
        }
        Ok(types)
    }
}

impl MethodInfo {
    pub fn name<'a>(&self, cp: &'a ConstantPool) -> Result<&'a str, ClassFileError> {
        cp.get_utf8(self.name_index)
    }

    pub fn descriptor<'a>(&self, cp: &'a ConstantPool) -> Result<&'a str, ClassFileError> {
        cp.get_utf8(self.descriptor_index)
    }

    /// The `Code` attribute, absent for abstract and native methods.
    pub fn code(&self) -> Option<(&Attribute, &CodeAttribute)> {
        self.attributes.iter().find_map(|attr| match &attr.info {
            AttributeInfo::Code(code) => Some((attr, code)),
            _ => None,
        })
    }
}

fn parse_constant_pool(r: &mut Reader) -> Result<ConstantPool, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut entries: Vec<Option<CpInfo>> = Vec::with_capacity(count);
    entries.push(None); // index 0 is unused

    while entries.len() < count {
        let tag = r.read_u1()?;
        let entry = match tag {
            1 => {
                let len = r.read_u2()? as usize;
                CpInfo::Utf8(String::from_utf8_lossy(r.read_bytes(len)?).into_owned())
            }
            3 => CpInfo::Integer(r.read_u4()? as i32),
            4 => CpInfo::Float(f32::from_bits(r.read_u4()?)),
            // Longs and doubles take two slots; the second is unusable.
            5 | 6 => {
                let high = r.read_u4()? as u64;
                let low = r.read_u4()? as u64;
                let bits = (high << 32) | low;
                entries.push(Some(if tag == 5 {
                    CpInfo::Long(bits as i64)
                } else {
                    CpInfo::Double(f64::from_bits(bits))
                }));
                entries.push(None);
                continue;
            }
            7 => CpInfo::Class { name_index: r.read_u2()? },
            8 => CpInfo::String { string_index: r.read_u2()? },
            9 => CpInfo::Fieldref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            10 => CpInfo::Methodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            11 => CpInfo::InterfaceMethodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            12 => CpInfo::NameAndType { name_index: r.read_u2()?, descriptor_index: r.read_u2()? },
            15 => CpInfo::MethodHandle { reference_kind: r.read_u1()?, reference_index: r.read_u2()? },
            16 => CpInfo::MethodType { descriptor_index: r.read_u2()? },
            17 => CpInfo::Dynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            18 => CpInfo::InvokeDynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            19 => CpInfo::Module { name_index: r.read_u2()? },
            20 => CpInfo::Package { name_index: r.read_u2()? },
            _ => return Err(ClassFileError::InvalidConstantPoolTag(tag)),
        };
        entries.push(Some(entry));
    }

    Ok(ConstantPool { entries })
}

fn parse_attributes(r: &mut Reader, cp: &ConstantPool) -> Result<Vec<Attribute>, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut attrs = Vec::with_capacity(count);

    for _ in 0..count {
        let start = r.offset();
        let name_index = r.read_u2()?;
        let length = r.read_u4()? as usize;
        let name = cp.get_utf8(name_index)?;
        let info_base = r.offset();
        let info_bytes = r.read_bytes(length)?;
        let mut sub = Reader::nested(info_bytes, info_base);

        let info = match name {
            "Code" => AttributeInfo::Code(parse_code_attribute(&mut sub, cp)?),
            "StackMapTable" => AttributeInfo::StackMapTable(parse_stack_map_table(&mut sub)?),
            "LineNumberTable" => {
                let num = sub.read_u2()? as usize;
                let mut entries = Vec::with_capacity(num);
                for _ in 0..num {
                    entries.push(LineNumberEntry { start_pc: sub.read_u2()?, line_number: sub.read_u2()? });
                }
                AttributeInfo::LineNumberTable { entries }
            }
            "LocalVariableTable" => AttributeInfo::LocalVariableTable { entries: parse_local_variables(&mut sub)? },
            "LocalVariableTypeTable" => AttributeInfo::LocalVariableTypeTable { entries: parse_local_variables(&mut sub)? },
            "RuntimeVisibleAnnotations" => AttributeInfo::RuntimeVisibleAnnotations { annotations: parse_annotations(&mut sub)? },
            "RuntimeInvisibleAnnotations" => AttributeInfo::RuntimeInvisibleAnnotations { annotations: parse_annotations(&mut sub)? },
            "RuntimeVisibleTypeAnnotations" => AttributeInfo::RuntimeVisibleTypeAnnotations,
            "RuntimeInvisibleTypeAnnotations" => AttributeInfo::RuntimeInvisibleTypeAnnotations,
            "Signature" => AttributeInfo::Signature { signature_index: sub.read_u2()? },
            "SourceFile" => AttributeInfo::SourceFile { sourcefile_index: sub.read_u2()? },
            other => AttributeInfo::Unknown { name: other.to_string() },
        };

        attrs.push(Attribute { name_index, span: start..r.offset(), info });
    }

    Ok(attrs)
}

fn parse_code_attribute(r: &mut Reader, cp: &ConstantPool) -> Result<CodeAttribute, ClassFileError> {
    let max_stack = r.read_u2()?;
    let max_locals = r.read_u2()?;
    let code_length = r.read_u4()? as usize;
    if code_length == 0 || code_length > u16::MAX as usize {
        return Err(ClassFileError::InvalidAttribute("Code".to_string()));
    }
    let code = r.read_bytes(code_length)?.to_vec();

    let exception_table_length = r.read_u2()? as usize;
    let mut exception_table = Vec::with_capacity(exception_table_length);
    for _ in 0..exception_table_length {
        exception_table.push(ExceptionTableEntry {
            start_pc: r.read_u2()?,
            end_pc: r.read_u2()?,
            handler_pc: r.read_u2()?,
            catch_type: r.read_u2()?,
        });
    }

    let attributes = parse_attributes(r, cp)?;
    Ok(CodeAttribute { max_stack, max_locals, code, exception_table, attributes })
}

fn parse_local_variables(r: &mut Reader) -> Result<Vec<LocalVariableEntry>, ClassFileError> {
    let num = r.read_u2()? as usize;
    let mut entries = Vec::with_capacity(num);
    for _ in 0..num {
        entries.push(LocalVariableEntry {
            start_pc: r.read_u2()?,
            length: r.read_u2()?,
            name_index: r.read_u2()?,
            descriptor_index: r.read_u2()?,
            index: r.read_u2()?,
        });
    }
    Ok(entries)
}

fn parse_stack_map_table(r: &mut Reader) -> Result<StackMapTableAttribute, ClassFileError> {
    let num = r.read_u2()? as usize;
    let mut entries = Vec::with_capacity(num);

    for _ in 0..num {
        let frame_type = r.read_u1()?;
        let frame = match frame_type {
            0..=63 => StackMapFrame::Same { offset_delta: frame_type as u16 },
            64..=127 => {
                let stack = parse_verification_type_info(r)?;
                StackMapFrame::SameLocals1StackItem { offset_delta: (frame_type - 64) as u16, stack }
            }
            247 => {
                let offset_delta = r.read_u2()?;
                let stack = parse_verification_type_info(r)?;
                StackMapFrame::SameLocals1StackItemExtended { offset_delta, stack }
            }
            248..=250 => StackMapFrame::Chop { offset_delta: r.read_u2()?, k: 251 - frame_type },
            251 => StackMapFrame::SameExtended { offset_delta: r.read_u2()? },
            252..=254 => {
                let offset_delta = r.read_u2()?;
                let count = (frame_type - 251) as usize;
                let mut locals = Vec::with_capacity(count);
                for _ in 0..count {
                    locals.push(parse_verification_type_info(r)?);
                }
                StackMapFrame::Append { offset_delta, locals }
            }
            255 => {
                let offset_delta = r.read_u2()?;
                let num_locals = r.read_u2()? as usize;
                let mut locals = Vec::with_capacity(num_locals);
                for _ in 0..num_locals {
                    locals.push(parse_verification_type_info(r)?);
                }
                let num_stack = r.read_u2()? as usize;
                let mut stack = Vec::with_capacity(num_stack);
                for _ in 0..num_stack {
                    stack.push(parse_verification_type_info(r)?);
                }
                StackMapFrame::Full { offset_delta, locals, stack }
            }
            _ => return Err(ClassFileError::InvalidAttribute("StackMapTable".to_string())),
        };
        entries.push(frame);
    }

    Ok(StackMapTableAttribute { entries })
}

fn parse_verification_type_info(r: &mut Reader) -> Result<VerificationTypeInfo, ClassFileError> {
    let tag = r.read_u1()?;
    let info = match tag {
        0 => VerificationTypeInfo::Top,
        1 => VerificationTypeInfo::Integer,
        2 => VerificationTypeInfo::Float,
        3 => VerificationTypeInfo::Double,
        4 => VerificationTypeInfo::Long,
        5 => VerificationTypeInfo::Null,
        6 => VerificationTypeInfo::UninitializedThis,
        7 => VerificationTypeInfo::Object(r.read_u2()?),
        8 => VerificationTypeInfo::Uninitialized(r.read_u2()?),
        _ => return Err(ClassFileError::InvalidAttribute("StackMapTable".to_string())),
    };
    Ok(info)
}

fn parse_annotations(r: &mut Reader) -> Result<Vec<Annotation>, ClassFileError> {
    let num = r.read_u2()? as usize;
    let mut annotations = Vec::with_capacity(num);
    for _ in 0..num {
        annotations.push(parse_annotation(r)?);
    }
    Ok(annotations)
}

fn parse_annotation(r: &mut Reader) -> Result<Annotation, ClassFileError> {
    let type_index = r.read_u2()?;
    let num_pairs = r.read_u2()? as usize;
    let mut element_value_pairs = Vec::with_capacity(num_pairs);
    for _ in 0..num_pairs {
        let element_name_index = r.read_u2()?;
        let value = parse_element_value(r)?;
        element_value_pairs.push(ElementValuePair { element_name_index, value });
    }
    Ok(Annotation { type_index, element_value_pairs })
}

fn parse_element_value(r: &mut Reader) -> Result<ElementValue, ClassFileError> {
    let tag = r.read_u1()?;
    let value = match tag {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' => {
            ElementValue::Const { tag, const_value_index: r.read_u2()? }
        }
        b'e' => ElementValue::EnumConst { type_name_index: r.read_u2()?, const_name_index: r.read_u2()? },
        b'c' => ElementValue::ClassInfo { class_info_index: r.read_u2()? },
        b'@' => ElementValue::AnnotationValue(parse_annotation(r)?),
        b'[' => {
            let num_values = r.read_u2()? as usize;
            let mut values = Vec::with_capacity(num_values);
            for _ in 0..num_values {
                values.push(parse_element_value(r)?);
            }
            ElementValue::ArrayValue(values)
        }
        _ => return Err(ClassFileError::InvalidAttribute("annotation".to_string())),
    };
    Ok(value)
}

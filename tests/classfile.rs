mod common;

use apm_bci::classfile::{
    AttributeInfo, ClassFile, ClassFileError, CpInfo, ExceptionTableEntry, LineNumberEntry, StackMapFrame,
    VerificationTypeInfo, ACC_ABSTRACT, ACC_PUBLIC, ACC_STATIC,
};
use apm_bci::description::TypeDescription;

use common::{u2, u4, ClassBuilder, CodeSpec, CpBuilder, NOP, RETURN, THIS_CLASS};

fn build_test_class() -> Vec<u8> {
    let body = CodeSpec::new(1, 2, vec![0x2a, 0x57, NOP, RETURN])
        .exception(0, 2, 2)
        .line(0, 10)
        .line(2, 11)
        .local(0, 4, "this", "Lshop/Cart;", 0)
        .frames(1, vec![66, 7, 0, THIS_CLASS as u8]);

    ClassBuilder::new("shop/Cart")
        .extends("shop/AbstractCart")
        .implements("java/io/Serializable")
        .annotated("shop/Tracked")
        .source_file("Cart.java")
        .method(ACC_PUBLIC, "checkout", "(Ljava/lang/String;I)Z", Some(body))
        .method_annotated("shop/Timed")
        .method(ACC_PUBLIC | ACC_ABSTRACT, "total", "()J", None)
        .build()
}

#[test]
fn parses_hierarchy_and_methods() {
    let bytes = build_test_class();
    let classfile = ClassFile::parse(&bytes).expect("parse class file");

    assert_eq!(classfile.major_version, 52);
    assert_eq!(classfile.class_name().unwrap(), "shop/Cart");
    assert_eq!(classfile.super_class_name().unwrap(), Some("shop/AbstractCart"));
    assert_eq!(classfile.interface_names().unwrap(), vec!["java/io/Serializable"]);
    assert_eq!(classfile.annotation_types(&classfile.attributes).unwrap(), vec!["shop/Tracked"]);

    let cp = &classfile.constant_pool;
    let names: Vec<&str> = classfile.methods.iter().map(|m| m.name(cp).unwrap()).collect();
    assert_eq!(names, vec!["checkout", "total"]);
    assert_eq!(classfile.methods[0].descriptor(cp).unwrap(), "(Ljava/lang/String;I)Z");
    assert_eq!(classfile.annotation_types(&classfile.methods[0].attributes).unwrap(), vec!["shop/Timed"]);
    assert!(classfile.methods[1].code().is_none());
    assert!(classfile.attributes.iter().any(|a| matches!(a.info, AttributeInfo::SourceFile { .. })));
}

#[test]
fn parses_code_attribute_tables() {
    let bytes = build_test_class();
    let classfile = ClassFile::parse(&bytes).expect("parse class file");
    let (attr, code) = classfile.methods[0].code().expect("code attr");

    assert_eq!((code.max_stack, code.max_locals), (1, 2));
    assert_eq!(code.code, vec![0x2a, 0x57, 0x00, RETURN]);
    assert_eq!(
        code.exception_table,
        vec![ExceptionTableEntry { start_pc: 0, end_pc: 2, handler_pc: 2, catch_type: 0 }]
    );

    let lines = code.attributes.iter().find_map(|a| match &a.info {
        AttributeInfo::LineNumberTable { entries } => Some(entries.clone()),
        _ => None,
    });
    assert_eq!(
        lines,
        Some(vec![
            LineNumberEntry { start_pc: 0, line_number: 10 },
            LineNumberEntry { start_pc: 2, line_number: 11 },
        ])
    );

    let locals = code.attributes.iter().find_map(|a| match &a.info {
        AttributeInfo::LocalVariableTable { entries } => Some(entries.clone()),
        _ => None,
    });
    let locals = locals.expect("local variable table");
    assert_eq!(classfile.constant_pool.get_utf8(locals[0].name_index).unwrap(), "this");
    assert_eq!((locals[0].start_pc, locals[0].length), (0, 4));

    let frames = code.attributes.iter().find_map(|a| match &a.info {
        AttributeInfo::StackMapTable(table) => Some(table.entries.clone()),
        _ => None,
    });
    assert_eq!(
        frames,
        Some(vec![StackMapFrame::SameLocals1StackItem {
            offset_delta: 2,
            stack: VerificationTypeInfo::Object(THIS_CLASS),
        }])
    );

    // Spans cover the attribute header, so the weaver can copy them.
    assert_eq!(&bytes[attr.span.start..attr.span.start + 2], &attr.name_index.to_be_bytes());
    for nested in &code.attributes {
        assert!(nested.span.start > attr.span.start && nested.span.end <= attr.span.end);
    }
}

#[test]
fn keeps_unknown_attributes_by_name() {
    let bytes = ClassBuilder::new("shop/Cart").attribute("NestMembers", vec![0, 0]).build();
    let classfile = ClassFile::parse(&bytes).unwrap();
    assert!(classfile
        .attributes
        .iter()
        .any(|a| matches!(&a.info, AttributeInfo::Unknown { name } if name == "NestMembers")));
}

#[test]
fn long_constants_take_two_slots() {
    let mut cp = CpBuilder::new();
    let this = cp.class("Consts");
    let object = cp.class("java/lang/Object");
    let long = cp.long(1 << 40);
    let after = cp.integer(7);

    let mut bytes = Vec::new();
    u4(&mut bytes, 0xCAFEBABE);
    u2(&mut bytes, 0);
    u2(&mut bytes, 52);
    cp.write(&mut bytes);
    u2(&mut bytes, 0x0021);
    u2(&mut bytes, this);
    u2(&mut bytes, object);
    for _ in 0..4 {
        // interfaces, fields, methods, attributes
        u2(&mut bytes, 0);
    }

    let classfile = ClassFile::parse(&bytes).unwrap();
    assert!(matches!(classfile.constant_pool.get(long), Ok(CpInfo::Long(v)) if *v == 1 << 40));
    assert!(classfile.constant_pool.get(long + 1).is_err());
    assert!(matches!(classfile.constant_pool.get(after), Ok(CpInfo::Integer(7))));
    assert_eq!(classfile.constant_pool.count(), cp.count());
    assert_eq!(classfile.constant_pool_end(), bytes.len() - 14);
}

#[test]
fn rejects_malformed_input() {
    assert!(matches!(ClassFile::parse(&[0xCA, 0xFE, 0xBA, 0xBF, 0, 0]), Err(ClassFileError::InvalidMagic(0xCAFEBABF))));

    let bytes = build_test_class();
    assert!(matches!(ClassFile::parse(&bytes[..bytes.len() - 3]), Err(ClassFileError::UnexpectedEof)));

    let mut bad_tag = Vec::new();
    u4(&mut bad_tag, 0xCAFEBABE);
    u2(&mut bad_tag, 0);
    u2(&mut bad_tag, 52);
    u2(&mut bad_tag, 2);
    bad_tag.push(2);
    assert!(matches!(ClassFile::parse(&bad_tag), Err(ClassFileError::InvalidConstantPoolTag(2))));
}

#[test]
fn describes_parsed_types() {
    let ty = TypeDescription::parse(&build_test_class()).unwrap();

    assert_eq!(ty.name(), "shop.Cart");
    assert_eq!(ty.super_class_name(), Some("shop.AbstractCart"));
    assert_eq!(ty.interface_names(), &["java.io.Serializable".to_string()]);
    assert_eq!(ty.annotations(), &["shop.Tracked".to_string()]);

    let methods = ty.declared_methods();
    assert_eq!(methods.len(), 2);
    assert_eq!(methods[0].declaring_type(), "shop.Cart");
    assert_eq!(methods[0].parameter_types(), vec!["java.lang.String", "int"]);
    assert_eq!(methods[0].return_type(), "boolean");
    assert_eq!(methods[1].modifiers() & ACC_ABSTRACT, ACC_ABSTRACT);
    assert_eq!(methods[0].modifiers() & ACC_STATIC, 0);
}

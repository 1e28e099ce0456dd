//! AST structure and dump format tests

use skarn::ast::{dump, dump_analyzed, AstBuilder, Slot, Span, Tag};
use skarn::parser::parse_source;
use skarn::test_support::{analyze_program, parse_program};

#[test]
fn hello_world_dump_starts_with_block() {
    let (_, root) = parse_program("print \"hello world\"").expect("parse");
    let text = dump(&root);
    assert!(text.starts_with("Block {"), "dump was:\n{}", text);

    // Call { {String{"hello world", nil}}, Id{"print"} }
    let call_pos = text.find("Call {").expect("Call node");
    let string_pos = text.find("String {").expect("String node");
    let id_pos = text.find("Id {").expect("Id node");
    assert!(call_pos < string_pos && string_pos < id_pos);
    assert!(text.contains("\"hello world\""));
    assert!(text.contains("nil"));
    assert!(text.contains("\"print\""));
}

#[test]
fn analyzed_dump_adds_stringview_type() {
    let (_, root) = analyze_program("print \"hello world\"").expect("analyze");
    let text = dump_analyzed(&root);
    assert!(text.contains("type = \"stringview\""), "dump was:\n{}", text);
}

#[test]
fn plain_dump_never_shows_attributes() {
    let (_, root) = parse_program("local a = 1").expect("parse");
    let text = dump(&root);
    assert!(!text.contains("type ="));
}

#[test]
fn registry_assigns_consecutive_indices() {
    let builder = AstBuilder::new();
    parse_source("local a = 1\nlocal b = 2", &builder).expect("parse");
    assert!(builder.len() > 4);
    for i in 0..builder.len() {
        let node = builder.get(i).expect("registered node");
        assert_eq!(node.borrow().id, i);
    }
}

#[test]
fn clone_tree_is_deep_and_reregistered() {
    let builder = AstBuilder::new();
    let root = parse_source("local a = 1 + 2", &builder).expect("parse");
    let before = builder.len();
    let copy = builder.clone_tree(&root);
    // Every node in the subtree got a fresh registry slot
    assert!(builder.len() > before);
    assert_ne!(copy.borrow().id, root.borrow().id);

    // Mutating the copy leaves the original untouched
    copy.borrow_mut().slots[0] = Slot::List(vec![]);
    assert_eq!(root.borrow().slot_list(0).len(), 1);
}

#[test]
fn spans_track_source_offsets() {
    let builder = AstBuilder::new();
    let root = parse_source("local a = 1", &builder).expect("parse");
    let stmts = root.borrow().slot_list(0);
    let decl = stmts[0].borrow();
    assert_eq!(decl.span.start, 0);
    assert!(decl.span.end >= 10);
}

#[test]
fn attribute_bag_flags_round_trip() {
    let builder = AstBuilder::new();
    let node = builder.build(Tag::Id, Span::default(), vec![Slot::Str("x".into())]);
    node.borrow_mut()
        .attrs
        .set_flag("custom", skarn::types::Value::Int(7));
    assert_eq!(
        node.borrow().attrs.get_flag("custom"),
        Some(&skarn::types::Value::Int(7))
    );
    node.borrow_mut()
        .attrs
        .set_flag("custom", skarn::types::Value::Int(8));
    assert_eq!(
        node.borrow().attrs.get_flag("custom"),
        Some(&skarn::types::Value::Int(8))
    );
}

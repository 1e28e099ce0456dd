//! Analyzer integration tests: symbol resolution, inference, diagnostics

use skarn::test_support::{analyze_program, diagnostics_of};
use skarn::types::Value;

fn node_type_of_decl(source: &str, stmt_index: usize) -> String {
    let (_, root) = analyze_program(source).expect("analyze");
    let stmts = root.borrow().slot_list(0);
    let decl = stmts[stmt_index].borrow();
    let value = decl.slot_node(1).expect("initializer");
    let ty = value.borrow().attrs.ty.clone().expect("resolved type");
    ty.name()
}

#[test]
fn every_expression_gets_a_type() {
    let (_, root) = analyze_program(
        "local a = 1\n\
         local b = a + 2\n\
         local c = b * a - 1\n\
         local s = 'text'\n\
         local t = s",
    )
    .expect("analyze");
    let stmts = root.borrow().slot_list(0);
    for stmt in &stmts {
        let value = stmt.borrow().slot_node(1).expect("initializer");
        assert!(
            value.borrow().attrs.ty.is_some(),
            "missing type on statement {:?}",
            stmt.borrow().tag
        );
    }
}

#[test]
fn integer_literals_default_to_int64() {
    assert_eq!(node_type_of_decl("local a = 1", 0), "int64");
    assert_eq!(node_type_of_decl("local a = 3.5", 0), "float64");
}

#[test]
fn literal_suffixes_select_types() {
    assert_eq!(node_type_of_decl("local a = 1_u8", 0), "uint8");
    assert_eq!(node_type_of_decl("local a = 1_i16", 0), "int16");
    assert_eq!(node_type_of_decl("local a = 1_usize", 0), "usize");
    assert_eq!(node_type_of_decl("local a = 1.0_f32", 0), "float32");
}

#[test]
fn unknown_literal_suffix_is_reported() {
    let diags = diagnostics_of("local a = 1_x");
    assert_eq!(diags, vec!["literal suffix '_x' is undefined".to_string()]);
}

#[test]
fn undefined_identifier_suggests_similar_names() {
    let (ctx, root) = skarn::test_support::parse_program("local printable = 1\nlocal x = printible").unwrap();
    let mut analyzer = skarn::Analyzer::new(ctx);
    analyzer.analyze(&root).expect("analyze");
    let diag = analyzer.ctx.diagnostics.first().expect("diagnostic");
    assert!(diag.message.contains("undefined identifier 'printible'"));
    assert!(diag.suggestions.contains(&"printable".to_string()));
}

#[test]
fn duplicate_declaration_with_incompatible_type() {
    let diags = diagnostics_of("local a = 1\nlocal a = 'text'");
    assert!(diags[0].contains("already declared with an incompatible type"));
}

#[test]
fn arithmetic_promotion_follows_width_and_sign() {
    assert_eq!(node_type_of_decl("local a = 1_i32 + 1_i64", 0), "int64");
    assert_eq!(node_type_of_decl("local a = 1_u8 + 1_u16", 0), "uint16");
    // Mixed signedness promotes to the signed type of the max width
    assert_eq!(node_type_of_decl("local a = 1_u32 + 1_i8", 0), "int32");
    // `/` always produces a float
    assert_eq!(node_type_of_decl("local a = 1_i64 / 2_i64", 0), "float64");
}

#[test]
fn value_aware_narrowing_accepts_in_range_constants() {
    analyze_program("local a: int8 = 100").expect("in range");
    analyze_program("local b: uint8 = 255").expect("in range");
    let diags = diagnostics_of("local a: int8 = 200");
    assert!(diags[0].contains("no viable conversion"));
    let diags = diagnostics_of("local b: uint8 = -1");
    assert!(diags[0].contains("no viable conversion"));
}

#[test]
fn widening_assignment_needs_no_conversion_error() {
    analyze_program("local small: int8 = 1\nlocal wide: int64 = small").expect("widening ok");
    let diags = diagnostics_of("local wide: int64 = 1\nlocal small: int8 = wide");
    assert!(diags[0].contains("no viable conversion"));
}

#[test]
fn comptime_constants_fold() {
    let (_, root) = analyze_program("local a = (2 + 3) * 4 - 1").expect("analyze");
    let stmts = root.borrow().slot_list(0);
    let value = stmts[0].borrow().slot_node(1).unwrap();
    assert_eq!(value.borrow().attrs.value, Some(Value::Int(19)));
    assert!(value.borrow().attrs.comptime);
}

#[test]
fn equality_folds_for_nil_and_type_values() {
    let cases = [
        ("local a = nil == nil", true),
        ("local a = nil ~= nil", false),
        ("local a = @int8 == @int8", true),
        ("local a = @int8 ~= @int8", false),
        ("local a = @int8 == @int16", false),
        ("local a = @int8 ~= @int16", true),
        ("local a = nil == true", false),
    ];
    for (src, expected) in cases {
        let (_, root) = analyze_program(src).expect("analyze");
        let stmts = root.borrow().slot_list(0);
        let value = stmts[0].borrow().slot_node(1).unwrap();
        assert_eq!(
            value.borrow().attrs.value,
            Some(Value::Bool(expected)),
            "case {}",
            src
        );
    }
}

#[test]
fn floor_division_and_modulo_fold_like_the_runtime() {
    let cases = [
        ("local a = 7 // 2", 3),
        ("local a = -7 // 2", -4),
        ("local a = 7 // -2", -4),
        ("local a = 7 % -2", -1),
        ("local a = -7 % 2", 1),
    ];
    for (src, expected) in cases {
        let (_, root) = analyze_program(src).expect("analyze");
        let stmts = root.borrow().slot_list(0);
        let value = stmts[0].borrow().slot_node(1).unwrap();
        assert_eq!(
            value.borrow().attrs.value,
            Some(Value::Int(expected)),
            "case {}",
            src
        );
    }
}

#[test]
fn comptime_division_by_zero_is_reported() {
    let diags = diagnostics_of("local a = 1 // 0");
    assert!(diags[0].contains("division by zero"));
}

#[test]
fn shifts_are_total_at_compile_time() {
    let cases = [
        ("local a = 1 << 3", 8),
        ("local a = 1 << 200", 0),
        ("local a = 8 >> 2", 2),
        ("local a = 8 >> -2", 32),
        ("local a = -8_i8 >>> 1", -4),
        ("local a = -1_i8 >>> 100", -1),
    ];
    for (src, expected) in cases {
        let (_, root) = analyze_program(src).expect("analyze");
        let stmts = root.borrow().slot_list(0);
        let value = stmts[0].borrow().slot_node(1).unwrap();
        assert_eq!(
            value.borrow().attrs.value,
            Some(Value::Int(expected)),
            "case {}",
            src
        );
    }
}

#[test]
fn record_types_declare_and_index() {
    let (_, root) = analyze_program(
        "local Point = @record{x: int64, y: int64}\n\
         local p: Point = {x = 1, y = 2}\n\
         local sum = p.x + p.y",
    )
    .expect("analyze");
    let stmts = root.borrow().slot_list(0);
    let sum = stmts[2].borrow().slot_node(1).unwrap();
    assert_eq!(sum.borrow().attrs.ty.clone().unwrap().name(), "int64");
}

#[test]
fn unknown_record_field_is_reported() {
    let diags = diagnostics_of(
        "local Point = @record{x: int64}\n\
         local p: Point = {z = 1}",
    );
    assert!(diags[0].contains("no field named 'z'"));
}

#[test]
fn enums_carry_field_constants() {
    let (_, root) = analyze_program(
        "local Color = @enum{Red, Green = 5, Blue}\n\
         local c = Color.Blue",
    )
    .expect("analyze");
    let stmts = root.borrow().slot_list(0);
    let c = stmts[1].borrow().slot_node(1).unwrap();
    assert_eq!(c.borrow().attrs.value, Some(Value::Int(6)));
}

#[test]
fn arrays_check_constant_bounds() {
    analyze_program("local a: [4]int64\nlocal x = a[3]").expect("in bounds");
    let diags = diagnostics_of("local a: [4]int64\nlocal x = a[4]");
    assert!(diags[0].contains("out of bounds"));
}

#[test]
fn function_types_check_arguments() {
    let diags = diagnostics_of(
        "local function f(a: int64) end\n\
         f('text')",
    );
    assert!(diags[0].contains("no viable conversion"));
}

#[test]
fn polymorphic_functions_instantiate_per_type_tuple() {
    let (analyzer, _) = analyze_program(
        "local function id(x: auto) return x end\n\
         local a = id(1)\n\
         local b = id('s')\n\
         local c = id(2)",
    )
    .expect("analyze");
    assert_eq!(analyzer.ctx.poly_instances.len(), 2);
}

#[test]
fn polymorphic_static_error_mentions_instantiation() {
    let diags = diagnostics_of(
        "local function f(x: auto) ## static_error('fail') end\n\
         f(1)",
    );
    assert!(
        diags[0].contains("polymorphic function instantiation"),
        "got: {:?}",
        diags
    );
    assert!(diags[0].contains("fail"));
}

#[test]
fn scopes_stay_balanced_across_failed_analysis() {
    let (ctx, root) = skarn::test_support::parse_program(
        "do local a = missing end\n\
         while true do local b = also_missing end\n\
         if true then local c = gone end",
    )
    .unwrap();
    let mut analyzer = skarn::Analyzer::new(ctx);
    let _ = analyzer.analyze(&root);
    assert!(analyzer.ctx.scopes.is_root());
    assert_eq!(analyzer.ctx.scopes.depth(), 0);
}

#[test]
fn return_type_inference_converges() {
    let (_, root) = analyze_program(
        "local function f(a: int64) return a + 1 end\n\
         local r = f(1)",
    )
    .expect("analyze");
    let stmts = root.borrow().slot_list(0);
    let r = stmts[1].borrow().slot_node(1).unwrap();
    assert_eq!(r.borrow().attrs.ty.clone().unwrap().name(), "int64");
}

#[test]
fn return_type_mismatch_is_reported() {
    let diags = diagnostics_of("local function f(): int64 return 'text' end");
    assert!(diags[0].contains("invalid return type"));
}

#[test]
fn print_accepts_primitives_and_rejects_plain_records() {
    analyze_program("print(1, 'two', true, 3.5)").expect("primitives print");
    // A record without a `__tostring` field cannot print
    let diags = diagnostics_of(
        "local R = @record{x: int64}\n\
         local r: R\n\
         print(r)",
    );
    assert!(diags[0].contains("cannot handle type"));
}

#[test]
fn print_routes_records_through_tostring() {
    analyze_program(
        "local Point = @record{x: int64, __tostring: function(): stringview}\n\
         local function render(): stringview return 'point' end\n\
         local p: Point = {x = 1, __tostring = render}\n\
         print(p)",
    )
    .expect("record with __tostring prints");
    // A `__tostring` field with the wrong shape does not qualify
    let diags = diagnostics_of(
        "local R = @record{__tostring: int64}\n\
         local r: R\n\
         print(r)",
    );
    assert!(diags[0].contains("cannot handle type"));
}

#[test]
fn polymorphic_functions_can_be_redeclared() {
    analyze_program(
        "local function id(x: auto) return x end\n\
         local function id(x: auto) return x end\n\
         local a = id(1)",
    )
    .expect("redeclaring a polymorphic function is compatible");
}

#[test]
fn casts_fold_constants_and_mark_narrowing() {
    let (_, root) = analyze_program("local a = (@int8)(100)").expect("analyze");
    let stmts = root.borrow().slot_list(0);
    let cast = stmts[0].borrow().slot_node(1).unwrap();
    assert_eq!(cast.borrow().attrs.value, Some(Value::Int(100)));

    let (_, root) = analyze_program("local big = 1000\nlocal a = (@int8)(big)").expect("analyze");
    let stmts = root.borrow().slot_list(0);
    let cast = stmts[1].borrow().slot_node(1).unwrap();
    assert_eq!(cast.borrow().attrs.builtin.as_deref(), Some("narrow_cast"));
}

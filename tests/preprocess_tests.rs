//! Preprocessor engine integration tests

use skarn::analyzer::Analyzer;
use skarn::ast::Tag;
use skarn::test_support::{
    analyze_error, analyze_program, analyze_program_with, define, parse_program,
};
use skarn::types::Value;

#[test]
fn defines_reach_preprocess_code() {
    // -D DEF1 -DDEF2 -D DEF3=1 -DDEF4='asd'
    analyze_program_with(
        "## staticassert(DEF1==true and DEF2==true and DEF3==1 and DEF4=='asd')",
        |ctx| {
            define(ctx, "DEF1", Value::Bool(true));
            define(ctx, "DEF2", Value::Bool(true));
            define(ctx, "DEF3", Value::Int(1));
            define(ctx, "DEF4", Value::Str("asd".into()));
        },
    )
    .expect("staticassert over defines");
}

#[test]
fn staticassert_failure_aborts_the_block() {
    let err = analyze_error("## staticassert(false, 'boom')");
    assert!(err.contains("boom"));
    let err = analyze_error("## staticassert(1 == 2)");
    assert!(err.contains("static assertion failed!"));
}

#[test]
fn static_error_always_aborts() {
    let err = analyze_error("## static_error('no thanks')");
    assert!(err.contains("no thanks"));
}

#[test]
fn marker_pass_reaches_outer_blocks() {
    let (ctx, root) = parse_program(
        "do\n\
         \x20 do\n\
         \x20   ## x = 1\n\
         \x20 end\n\
         end",
    )
    .unwrap();
    skarn::analyzer::mark_preprocess(&root);
    // The directive's block, every intervening block, and the root
    assert!(root.borrow().attrs.needprocess);
    let outer_do = root.borrow().slot_list(0)[0].borrow().slot_node(0).unwrap();
    assert!(outer_do.borrow().attrs.needprocess);
    let inner_do = outer_do.borrow().slot_list(0)[0].borrow().slot_node(0).unwrap();
    assert!(inner_do.borrow().attrs.needprocess);
    drop(ctx);
}

#[test]
fn blocks_without_directives_stay_unmarked() {
    let (_, root) = parse_program("do local a = 1 end").unwrap();
    skarn::analyzer::mark_preprocess(&root);
    assert!(!root.borrow().attrs.needprocess);
}

#[test]
fn injected_nodes_interleave_in_order() {
    let (_, root) = analyze_program(
        "local a = 1\n\
         ## injectnode(aster.LocalDecl(aster.IdDecl('b', nil), aster.Number(2)))\n\
         local c = b + a",
    )
    .expect("analyze");
    let stmts = root.borrow().slot_list(0);
    let names: Vec<String> = stmts
        .iter()
        .filter(|s| s.borrow().tag == Tag::LocalDecl)
        .map(|s| {
            let decl = s.borrow();
            let iddecl = decl.slot_node(0).unwrap();
            let name = iddecl.borrow().slot_str(0).unwrap();
            name
        })
        .collect();
    assert_eq!(names, ["a", "b", "c"]);
}

#[test]
fn fragments_observe_types_of_earlier_siblings() {
    // `Point` is a symbol with a comptime type value by the time the
    // fragment runs, so its name resolves through the scope fallback
    analyze_program(
        "local Point = @record{x: int64}\n\
         ## staticassert(Point ~= nil)",
    )
    .expect("fragment sees earlier symbol");
}

#[test]
fn preprocess_expression_splice_folds() {
    let (_, root) = analyze_program("local a = #[6 * 7]#").expect("analyze");
    let stmts = root.borrow().slot_list(0);
    let value = stmts[0].borrow().slot_node(1).unwrap();
    assert_eq!(value.borrow().attrs.value, Some(Value::Int(42)));
}

#[test]
fn preprocess_name_splice_interns_names() {
    analyze_program(
        "local #|'gen' .. 'erated'|# = 1\n\
         local use = generated",
    )
    .expect("name splice declares a usable symbol");
}

#[test]
fn pp_loops_generate_statements() {
    let (_, root) = analyze_program(
        "##[[\n\
         for i = 1, 4 do\n\
         \x20 injectnode(aster.LocalDecl(aster.IdDecl('v' .. i, nil), aster.Number(i * 10)))\n\
         end\n\
         ]]\n\
         local total = v1 + v2 + v3 + v4",
    )
    .expect("analyze");
    let stmts = root.borrow().slot_list(0);
    assert_eq!(stmts.len(), 5);
}

#[test]
fn pp_conditionals_select_code() {
    // Bare if fragments are separate statements and do not parse
    let err = analyze_error("## if FAST then\nlocal mode = 1\n## end");
    assert!(err.contains("parse error") || err.contains("unexpected"));

    // The supported form wraps alternatives in a single fragment
    analyze_program_with(
        "##[[\n\
         if FAST then\n\
         \x20 injectnode(aster.LocalDecl(aster.IdDecl('mode', nil), aster.Number(1)))\n\
         else\n\
         \x20 injectnode(aster.LocalDecl(aster.IdDecl('mode', nil), aster.Number(2)))\n\
         end\n\
         ]]\n\
         local check = mode",
        |ctx| define(ctx, "FAST", Value::Bool(true)),
    )
    .expect("conditional injection");
}

#[test]
fn pragma_assignment_validates_and_takes_effect() {
    let (analyzer, _) =
        analyze_program("## nochecks = true\n## cflags = '-O3'").expect("pragmas set");
    assert!(analyzer.ctx.pragmas.nochecks());
    assert_eq!(analyzer.ctx.pragmas.cflags(), ["-O3"]);

    let err = analyze_error("## noabort = 1");
    assert!(err.contains("invalid value for pragma"));
}

#[test]
fn unknown_assignment_becomes_pp_variable() {
    let (analyzer, _) = analyze_program("## my_setting = 42").expect("pp var");
    assert!(analyzer.ctx.pp_vars.contains_key("my_setting"));
}

#[test]
fn symbol_declared_before_staticassert_is_retained() {
    // The injection lands before the assertion executes, so the symbol
    // stays in scope even though the block fails afterwards
    let (ctx, root) = parse_program(
        "##[[\n\
         injectnode(aster.LocalDecl(aster.IdDecl('kept', nil), aster.Number(1)))\n\
         staticassert(false, 'after injection')\n\
         ]]",
    )
    .unwrap();
    let mut analyzer = Analyzer::new(ctx);
    let err = analyzer.analyze(&root).unwrap_err();
    assert!(err.to_string().contains("after injection"));
    assert!(analyzer.ctx.scopes.lookup("kept").is_some());
}

#[test]
fn afterinfer_defers_until_block_is_typed() {
    let (analyzer, root) = analyze_program(
        "##[[\n\
         local function late()\n\
         \x20 injectnode(aster.LocalDecl(aster.IdDecl('appended', nil), aster.Number(9)))\n\
         end\n\
         afterinfer(late)\n\
         ]]\n\
         local first = 1",
    )
    .expect("analyze");
    // The deferred injection appended after the block's own statements
    let stmts = root.borrow().slot_list(0);
    let last = stmts.last().unwrap().borrow();
    assert_eq!(last.tag, Tag::LocalDecl);
    let name = last.slot_node(0).unwrap().borrow().slot_str(0).unwrap();
    assert_eq!(name, "appended");
    assert!(analyzer.ctx.scopes.lookup("appended").is_some());
}

#[test]
fn afterinfer_callbacks_fire_in_registration_order() {
    let (_, root) = analyze_program(
        "##[[\n\
         local function one()\n\
         \x20 injectnode(aster.LocalDecl(aster.IdDecl('first_cb', nil), aster.Number(1)))\n\
         end\n\
         local function two()\n\
         \x20 injectnode(aster.LocalDecl(aster.IdDecl('second_cb', nil), aster.Number(2)))\n\
         end\n\
         afterinfer(one)\n\
         afterinfer(two)\n\
         ]]",
    )
    .expect("analyze");
    let stmts = root.borrow().slot_list(0);
    let decls: Vec<String> = stmts
        .iter()
        .filter(|s| s.borrow().tag == Tag::LocalDecl)
        .map(|s| {
            let d = s.borrow();
            let id = d.slot_node(0).unwrap();
            let name = id.borrow().slot_str(0).unwrap();
            name
        })
        .collect();
    assert_eq!(decls, ["first_cb", "second_cb"]);
}

#[test]
fn hygienize_restores_the_captured_scope() {
    let (analyzer, _) = analyze_program(
        "##[[\n\
         local function leaky()\n\
         \x20 injectnode(aster.LocalDecl(aster.IdDecl('inside', nil), aster.Number(1)))\n\
         end\n\
         sealed = hygienize(leaky)\n\
         afterinfer(sealed)\n\
         ]]\n\
         local outside = 1",
    )
    .expect("analyze");
    // The hygienized call ran under its captured checkpoint; the symbol it
    // declared was discarded on restore while `outside` survives
    assert!(analyzer.ctx.scopes.lookup("outside").is_some());
    assert!(analyzer.ctx.scopes.lookup("inside").is_none());
}

#[test]
fn hygienized_injection_lands_at_the_capture_site() {
    let (_, root) = analyze_program(
        "##[[\n\
         local function gen()\n\
         \x20 injectnode(aster.LocalDecl(aster.IdDecl('spliced', nil), aster.Number(1)))\n\
         end\n\
         sealed = hygienize(gen)\n\
         afterinfer(sealed)\n\
         ]]\n\
         local tail = 1",
    )
    .expect("analyze");
    let stmts = root.borrow().slot_list(0);
    // The capture site was before `tail`, so the spliced node precedes it
    let names: Vec<String> = stmts
        .iter()
        .filter(|s| s.borrow().tag == Tag::LocalDecl)
        .map(|s| {
            let d = s.borrow();
            let id = d.slot_node(0).unwrap();
            let name = id.borrow().slot_str(0).unwrap();
            name
        })
        .collect();
    assert_eq!(names, ["spliced", "tail"]);
}

#[test]
fn primtypes_and_type_properties_are_introspectable() {
    analyze_program(
        "## staticassert(primtypes.int32.bitsize == 32)\n\
         ## staticassert(primtypes.uint16.max == 65535)\n\
         ## staticassert(primtypes.int8.min == -128)\n\
         ## staticassert(primtypes.stringview == string)",
    )
    .expect("type introspection");
}

#[test]
fn registry_is_addressable_from_pp_code() {
    // Node 0 is the first node the parser registered; `ast[0]` resolves it
    analyze_program("## staticassert(ast[0] ~= nil)").expect("registry indexing");
}

#[test]
fn config_exposes_generator_and_defines() {
    analyze_program_with(
        "## staticassert(config.generator == 'c')\n\
         ## staticassert(config.myflag == 3)",
        |ctx| define(ctx, "myflag", Value::Int(3)),
    )
    .expect("config introspection");
}

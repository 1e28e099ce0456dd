//! C backend integration tests
//!
//! These assert on the emitted translation unit text; running the C
//! compiler over it is the external toolchain's job.

use skarn::codegen::c_emit::CEmitter;
use skarn::test_support::{analyze_program, generate_c, generate_c_with};
use skarn::types::Value;

#[test]
fn codegen_is_deterministic() {
    let src = "local Point = @record{x: int64, y: int64}\n\
               local p: Point = {x = 1, y = 2}\n\
               local function mix(a: int64, b: int64): int64 return a // b + a % b end\n\
               print(mix(p.x, p.y), 'done')";
    let first = generate_c(src).expect("emit");
    let second = generate_c(src).expect("emit");
    assert_eq!(first, second);
}

#[test]
fn hello_world_unit_shape() {
    let c = generate_c("print \"hello world\"").expect("emit");
    // Regions in order: directives, declarations, definitions, main
    let include = c.find("#include").expect("directives");
    let decl = c.find("typedef struct sk_stringview").expect("declarations");
    let def = c.find("static void sk_print_stringview").expect("definitions");
    let main = c.find("int main(").expect("main stub");
    assert!(include < decl && decl < def && def < main);
    assert!(c.contains("hello world"));
}

#[test]
fn builtins_are_emitted_once() {
    let c = generate_c(
        "local a = 10\nlocal b = 3\n\
         local q1 = a // b\n\
         local q2 = b // a\n\
         local q3 = a // a",
    )
    .expect("emit");
    let defs = c.matches("static int64_t sk_idiv_int64(int64_t a, int64_t b) {").count();
    assert_eq!(defs, 1, "helper duplicated in:\n{}", c);
}

#[test]
fn ensure_builtin_is_idempotent() {
    let (analyzer, _) = analyze_program("local a = 1").expect("analyze");
    let mut em = CEmitter::new(&analyzer.ctx, false);
    let t1 = em.ensure_builtin("abort", &[]);
    let t2 = em.ensure_builtin("abort", &[]);
    let t3 = em.ensure_builtin("abort", &[]);
    assert_eq!(t1, "sk_abort");
    assert_eq!(t1, t2);
    assert_eq!(t2, t3);
}

#[test]
fn ensure_include_is_idempotent() {
    let (analyzer, _) = analyze_program("local a = 1").expect("analyze");
    let mut em = CEmitter::new(&analyzer.ctx, false);
    em.ensure_include("<stdio.h>");
    em.ensure_include("<stdio.h>");
    let root = {
        let builder = &analyzer.ctx.builder;
        skarn::parser::parse_source("", builder).expect("empty")
    };
    let out = em.generate(&root).expect("emit");
    assert_eq!(out.matches("#include <stdio.h>").count(), 1);
}

#[test]
fn idiv_helper_handles_int_min_and_zero() {
    let c = generate_c("local a = 10\nlocal b = 3\nlocal q = a // b").expect("emit");
    // INT_MIN / -1 avoided through the unsigned negation path
    assert!(c.contains("if(sk_unlikely(b == -1)) return (int64_t)(0U - (uint64_t)a);"));
    assert!(c.contains("sk_panic_cstring(\"division by zero\")"));
    // Floor correction toward negative infinity
    assert!(c.contains("if((a % b != 0) && ((a < 0) != (b < 0))) q -= 1;"));
}

#[test]
fn imod_corrects_sign_toward_divisor() {
    let c = generate_c("local a = 10\nlocal b = 3\nlocal r = a % b").expect("emit");
    assert!(c.contains("sk_imod_int64"));
    assert!(c.contains("if((r != 0) && ((r < 0) != (b < 0))) r += b;"));
}

#[test]
fn fmod_matches_divisor_sign() {
    let c = generate_c("local a = 1.5\nlocal b = 2.5\nlocal r = a % b").expect("emit");
    assert!(c.contains("sk_fmod_float64"));
    assert!(c.contains("if(r != 0 && (r < 0) != (b < 0)) r += b;"));
    assert!(c.contains("#include <math.h>"));
}

#[test]
fn shift_helpers_cover_out_of_range_counts() {
    let c = generate_c(
        "local a = 1\nlocal b = 70\n\
         local s1 = a << b\n\
         local s2 = a >> b\n\
         local s3 = a >>> b",
    )
    .expect("emit");
    assert!(c.contains("sk_shl_int64"));
    assert!(c.contains("sk_shr_int64"));
    assert!(c.contains("sk_asr_int64"));
    // Sign fill for large arithmetic shifts
    assert!(c.contains("return a < 0 ? (int64_t)-1 : 0;"));
}

#[test]
fn constant_in_range_shift_elides_the_helper() {
    let c = generate_c("local a = 1\nlocal s = a << 3").expect("emit");
    assert!(!c.contains("sk_shl_int64"), "helper not elided:\n{}", c);
    assert!(c.contains("(uint64_t)"));
    assert!(c.contains("<< 3"));
}

#[test]
fn cross_sign_comparison_uses_helper() {
    let c = generate_c(
        "local a: int64 = 1\nlocal b: uint64 = 2\nlocal lt = a < b",
    )
    .expect("emit");
    assert!(c.contains("sk_lt_int64_uint64"));
    assert!(c.contains("return a < 0 || (uint64_t)a < (uint64_t)b;"));
}

#[test]
fn cross_sign_equality_checks_nonnegative() {
    let c = generate_c(
        "local a: int64 = 1\nlocal b: uint64 = 2\nlocal e = a == b",
    )
    .expect("emit");
    assert!(c.contains("sk_eq_int64_uint64"));
    assert!(c.contains("(uint64_t)a == (uint64_t)b && a >= 0"));
}

#[test]
fn string_equality_short_circuits_same_pointer() {
    let c = generate_c("local a = 'x'\nlocal b: stringview = a\nlocal e = a == b").expect("emit");
    assert!(c.contains("sk_stringview_eq"));
    assert!(c.contains(
        "a.size == b.size && (a.data == b.data || a.size == 0 || memcmp(a.data, b.data, a.size) == 0)"
    ));
}

#[test]
fn record_equality_recurses_fieldwise() {
    let c = generate_c(
        "local Inner = @record{s: stringview}\n\
         local Outer = @record{i: Inner, n: int64, arr: [2]int64}\n\
         local a: Outer\nlocal b: Outer\n\
         local e = a == b",
    )
    .expect("emit");
    assert!(c.contains("sk_eq_Outer"));
    assert!(c.contains("sk_eq_Inner"));
    assert!(c.contains("sk_stringview_eq(a.s, b.s)"));
    assert!(c.contains("memcmp(&a.arr, &b.arr, sizeof(a.arr)) == 0"));
}

#[test]
fn narrowing_cast_panics_with_fixed_message() {
    let c = generate_c("local wide = 1000\nlocal narrow = (@int8)(wide)").expect("emit");
    assert!(c.contains("sk_assert_narrow_int8_int64"));
    assert!(c.contains("narrow casting from int64 to int8 failed"));
}

#[test]
fn float_narrowing_checks_round_trip() {
    let c = generate_c("local f = 1.5\nlocal i = (@int64)(f)").expect("emit");
    assert!(c.contains("sk_assert_narrow_int64_float64"));
    assert!(c.contains("if(sk_unlikely((double)r != v))"));
}

#[test]
fn array_indexing_checks_bounds() {
    let c = generate_c("local a: [4]int64\nlocal i = 2\nlocal x = a[i]").expect("emit");
    assert!(c.contains("sk_assert_bounds_int64"));
    assert!(c.contains("array index: position out of bounds"));
}

#[test]
fn pointer_deref_checks_null() {
    let c = generate_c("local v = 1\nlocal p = &v\nlocal d = $p").expect("emit");
    assert!(c.contains("sk_assert_deref"));
    assert!(c.contains("attempt to dereference a null pointer"));
}

#[test]
fn nochecks_elides_runtime_safety_helpers() {
    let src = "local a: [4]int64\nlocal i = 2\nlocal x = a[i]\n\
               local v = 1\nlocal p = &v\nlocal d = $p\n\
               check(true)";
    let checked = generate_c(src).expect("emit");
    assert!(checked.contains("sk_assert_bounds"));
    assert!(checked.contains("sk_assert_deref"));
    assert!(checked.contains("sk_assert("));

    let unchecked = generate_c_with(src, |ctx| {
        ctx.pragmas
            .set_field("nochecks", Value::Bool(true))
            .expect("pragma");
    })
    .expect("emit");
    assert!(!unchecked.contains("sk_assert_bounds"));
    assert!(!unchecked.contains("sk_assert_deref"));
    // check() is elided entirely under nochecks
    assert!(!unchecked.contains("sk_assert("));
}

#[test]
fn assert_survives_nochecks() {
    let c = generate_c_with("assert(true, 'must hold')", |ctx| {
        ctx.pragmas
            .set_field("nochecks", Value::Bool(true))
            .expect("pragma");
    })
    .expect("emit");
    assert!(c.contains("sk_assert_msg"));
    assert!(c.contains("assertion failed"));
}

#[test]
fn assert_forms_carry_source_location() {
    let c = generate_c("assert(true)").expect("emit");
    assert!(c.contains("test.skn:1:1: "));
    let c = generate_c("local a = 1\nassert()").expect("emit");
    assert!(c.contains("sk_assert_fail"));
    assert!(c.contains("test.skn:2:1: "));
}

#[test]
fn noabort_pragma_switches_to_exit() {
    let aborting = generate_c("panic('bad')").expect("emit");
    assert!(aborting.contains("abort();"));
    let exiting = generate_c_with("panic('bad')", |ctx| {
        ctx.pragmas
            .set_field("noabort", Value::Bool(true))
            .expect("pragma");
    })
    .expect("emit");
    assert!(exiting.contains("exit(-1);"));
    assert!(!exiting.contains("\n  abort();"));
}

#[test]
fn panic_and_warn_write_to_stderr_and_flush() {
    let c = generate_c("warn('careful')\npanic('bad')").expect("emit");
    assert!(c.contains("fputs(\"warning: \", stderr);"));
    assert!(c.contains("sk_panic_string"));
    assert!(c.contains("fflush(stderr);"));
    assert!(c.contains("sk_noreturn"));
}

#[test]
fn print_formats_per_type() {
    let c = generate_c("local p: *int64\nprint(1, 'two', true, 3.5, p, nil)").expect("emit");
    assert!(c.contains("PRIi64"));
    assert!(c.contains("fwrite("));
    assert!(c.contains("\"true\" : \"false\""));
    assert!(c.contains("%.14g"));
    assert!(c.contains("%.1f"));
    assert!(c.contains("PRIxPTR"));
    assert!(c.contains("fputs(\"nil\", stdout);"));
    assert!(c.contains("fputc('\\t', stdout);"));
    assert!(c.contains("fputc('\\n', stdout);"));
}

#[test]
fn print_record_calls_its_tostring_hook() {
    let c = generate_c(
        "local Point = @record{x: int64, __tostring: function(): stringview}\n\
         local function render(): stringview return 'point' end\n\
         local p: Point = {x = 1, __tostring = render}\n\
         print(p)",
    )
    .expect("emit");
    assert!(c.contains("sk_print_Point"), "got:\n{}", c);
    assert!(c.contains(".__tostring()"));
    assert!(c.contains("fwrite(s.data, 1, s.size, stdout)"));
    assert!(c.contains(".__tostring = render"));
}

#[test]
fn print_is_memoized_per_argument_tuple() {
    let c = generate_c("print(1)\nprint(2)\nprint('a')\nprint('b')").expect("emit");
    // One forward declaration and one definition per tuple
    assert_eq!(c.matches("static void sk_print_int64(int64_t a1) {").count(), 1);
    assert_eq!(c.matches("static void sk_print_int64(").count(), 2);
    assert_eq!(c.matches("static void sk_print_stringview(").count(), 2);
}

#[test]
fn likely_unlikely_expand_to_expect_hints() {
    let c = generate_c("local a = true\nlocal b = likely(a)").expect("emit");
    assert!(c.contains("__builtin_expect(!!(x), 1)"));
    assert!(c.contains("sk_likely(a)"));
}

#[test]
fn string_conversions_are_emitted_on_demand() {
    let c = generate_c(
        "local cs: cstring = 'hello'\n\
         local sv: stringview = cs\n\
         local back: cstring = sv",
    )
    .expect("emit");
    assert!(c.contains("sk_cstring2string"));
    assert!(c.contains("strlen(s)"));
    // Checked zero-copy conversion back out
    assert!(c.contains("sk_assert_string2cstring"));
    assert!(c.contains("string is not null terminated"));
    // null in gives an empty view back
    assert!(c.contains("if(s == NULL) return r;"));
}

#[test]
fn requires_inline_once_with_comment() {
    let dir = std::env::temp_dir().join("skarn_require_test");
    std::fs::create_dir_all(&dir).expect("tmp dir");
    let module = dir.join("mymod.skn");
    std::fs::write(&module, "local exported = 42\n").expect("write module");

    let src = "require 'mymod'\nrequire 'mymod'\nlocal x = exported";
    let pattern = format!("{}/?.skn", dir.display());
    let c = generate_c_with(src, move |ctx| {
        ctx.search_paths = vec![pattern];
    })
    .expect("emit");
    assert_eq!(c.matches("/* require 'mymod' */").count(), 1);
    assert!(c.contains("exported = INT64_C(42)"));
}

#[test]
fn empty_require_rolls_back_emit_position() {
    let dir = std::env::temp_dir().join("skarn_require_empty_test");
    std::fs::create_dir_all(&dir).expect("tmp dir");
    let module = dir.join("emptymod.skn");
    std::fs::write(&module, "local T = @record{x: int64}\n").expect("write module");

    let pattern = format!("{}/?.skn", dir.display());
    let c = generate_c_with("require 'emptymod'\nlocal a = 1", move |ctx| {
        ctx.search_paths = vec![pattern];
    })
    .expect("emit");
    // The module declared only a type, so nothing was emitted at the site
    assert!(!c.contains("/* require 'emptymod' */"));
}

#[test]
fn attribute_macros_detect_features() {
    let (analyzer, root) = analyze_program("local a = 1").expect("analyze");
    let mut em = CEmitter::new(&analyzer.ctx, false);
    for name in [
        "extern", "cexport", "cimport", "noinline", "inline", "register", "atomic",
        "threadlocal", "packed", "aligned", "alignas", "static_assert", "alignof",
    ] {
        let token = em.ensure_builtin(name, &[]);
        assert_eq!(token, format!("sk_{}", name));
    }
    let out = em.generate(&root).expect("emit");
    assert!(out.contains("#define sk_cexport __declspec(dllexport)"));
    assert!(out.contains("#define sk_atomic(T) _Atomic(T)"));
    assert!(out.contains("#define sk_threadlocal _Thread_local"));
    assert!(out.contains("#define sk_static_assert(c, m) _Static_assert(c, m)"));
    assert!(out.contains("#define sk_alignof(T) _Alignof(T)"));
    // Each detection block degrades to a fallback
    assert!(out.contains("#define sk_packed\n"));
}

#[test]
fn library_builds_suppress_main() {
    let (analyzer, root) = analyze_program("local function api(): int64 return 1 end").expect("analyze");
    let lib = skarn::codegen::generate(&analyzer.ctx, &root, "c", true).expect("emit");
    assert!(!lib.contains("int main("));
    let (analyzer, root) = analyze_program("local function api(): int64 return 1 end").expect("analyze");
    let bin = skarn::codegen::generate(&analyzer.ctx, &root, "c", false).expect("emit");
    assert!(bin.contains("int main("));
}

#[test]
fn poly_instances_emit_one_function_each() {
    let c = generate_c(
        "local function id(x: auto) return x end\n\
         local a = id(1)\n\
         local b = id(2)\n\
         local c = id('s')",
    )
    .expect("emit");
    // Two distinct instances, each defined once
    assert_eq!(c.matches("static int64_t id_").count() % 2, 0);
    assert!(c.matches("static int64_t id_").count() >= 1);
    assert!(c.contains("static sk_stringview id_"));
}

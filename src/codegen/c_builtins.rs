//! Per-type C helper generators
//!
//! Every operation whose correct semantics cannot be expressed by a single
//! C operator gets a specialized helper keyed by its operand types. Each
//! helper is generated on first `ensure_builtin` and reused afterwards;
//! helpers a body depends on are ensured before the body is emitted, so the
//! output orders dependencies first.

use std::fmt::Write;

use crate::types::{Type, TypeRef};

use super::c_emit::{CEmitter, Region};

/// Dispatch a builtin generator by name. Returns the emitted token.
pub fn generate(em: &mut CEmitter, name: &str, args: &[TypeRef]) -> String {
    match name {
        "likely" => macro_likely(em),
        "unlikely" => macro_unlikely(em),
        "noreturn" => macro_noreturn(em),
        "extern" => macro_simple(em, "sk_extern", "#define sk_extern extern\n"),
        "cexport" => macro_cexport(em),
        "cimport" => macro_cimport(em),
        "noinline" => macro_noinline(em),
        "inline" => macro_inline(em),
        "register" => macro_register(em),
        "atomic" => macro_atomic(em),
        "threadlocal" => macro_threadlocal(em),
        "packed" => macro_packed(em),
        "aligned" => macro_aligned(em),
        "alignas" => macro_alignas(em),
        "static_assert" => macro_static_assert(em),
        "alignof" => macro_alignof(em),
        "stringview_type" => stringview_type(em),
        "abort" => builtin_abort(em),
        "panic_cstring" => builtin_panic_cstring(em),
        "panic_string" => builtin_panic_string(em),
        "warn" => builtin_warn(em),
        "assert_fail" => builtin_assert_fail(em),
        "assert" => builtin_assert(em),
        "assert_msg" => builtin_assert_msg(em),
        "assert_narrow" => builtin_assert_narrow(em, &args[0], &args[1]),
        "assert_bounds" => builtin_assert_bounds(em, &args[0]),
        "assert_deref" => builtin_assert_deref(em),
        "string2cstring" => builtin_string2cstring(em),
        "assert_string2cstring" => builtin_assert_string2cstring(em),
        "cstring2string" => builtin_cstring2string(em),
        "stringview_eq" => builtin_stringview_eq(em),
        "eq" => builtin_eq_composite(em, &args[0]),
        "eq_cross" => builtin_eq_cross(em, &args[0], &args[1]),
        "lt_cross" => builtin_lt_cross(em, &args[0], &args[1]),
        "idiv" => builtin_idiv(em, &args[0]),
        "imod" => builtin_imod(em, &args[0]),
        "fmod" => builtin_fmod(em, &args[0]),
        "shl" | "shr" | "asr" => builtin_shift(em, name, &args[0]),
        "print" => builtin_print(em, args),
        other => format!("sk_{}", other),
    }
}

// ============================================================================
// Branch prediction and platform attribute macros
// ============================================================================

fn macro_simple(em: &mut CEmitter, token: &str, body: &str) -> String {
    em.define_builtin_macro(token, body, Region::Directives);
    token.to_string()
}

fn macro_likely(em: &mut CEmitter) -> String {
    macro_simple(
        em,
        "sk_likely",
        "#if defined(__GNUC__)\n\
         #define sk_likely(x) __builtin_expect(!!(x), 1)\n\
         #else\n\
         #define sk_likely(x) (x)\n\
         #endif\n",
    )
}

fn macro_unlikely(em: &mut CEmitter) -> String {
    macro_simple(
        em,
        "sk_unlikely",
        "#if defined(__GNUC__)\n\
         #define sk_unlikely(x) __builtin_expect(!!(x), 0)\n\
         #else\n\
         #define sk_unlikely(x) (x)\n\
         #endif\n",
    )
}

fn macro_noreturn(em: &mut CEmitter) -> String {
    macro_simple(
        em,
        "sk_noreturn",
        "#if defined(__STDC_VERSION__) && __STDC_VERSION__ >= 201112L\n\
         #define sk_noreturn _Noreturn\n\
         #elif defined(__GNUC__)\n\
         #define sk_noreturn __attribute__((noreturn))\n\
         #else\n\
         #define sk_noreturn\n\
         #endif\n",
    )
}

fn macro_cexport(em: &mut CEmitter) -> String {
    macro_simple(
        em,
        "sk_cexport",
        "#if defined(_WIN32)\n\
         #define sk_cexport __declspec(dllexport)\n\
         #elif defined(__GNUC__)\n\
         #define sk_cexport __attribute__((visibility(\"default\")))\n\
         #else\n\
         #define sk_cexport\n\
         #endif\n",
    )
}

fn macro_cimport(em: &mut CEmitter) -> String {
    macro_simple(
        em,
        "sk_cimport",
        "#if defined(_WIN32)\n\
         #define sk_cimport __declspec(dllimport)\n\
         #else\n\
         #define sk_cimport\n\
         #endif\n",
    )
}

fn macro_noinline(em: &mut CEmitter) -> String {
    macro_simple(
        em,
        "sk_noinline",
        "#if defined(__GNUC__)\n\
         #define sk_noinline __attribute__((noinline))\n\
         #elif defined(_MSC_VER)\n\
         #define sk_noinline __declspec(noinline)\n\
         #else\n\
         #define sk_noinline\n\
         #endif\n",
    )
}

fn macro_inline(em: &mut CEmitter) -> String {
    macro_simple(
        em,
        "sk_inline",
        "#if defined(__STDC_VERSION__) && __STDC_VERSION__ >= 199901L\n\
         #define sk_inline inline\n\
         #elif defined(__GNUC__)\n\
         #define sk_inline __inline__\n\
         #else\n\
         #define sk_inline\n\
         #endif\n",
    )
}

fn macro_register(em: &mut CEmitter) -> String {
    macro_simple(
        em,
        "sk_register",
        "#if defined(__STDC_VERSION__) && __STDC_VERSION__ >= 201710L\n\
         #define sk_register\n\
         #else\n\
         #define sk_register register\n\
         #endif\n",
    )
}

fn macro_atomic(em: &mut CEmitter) -> String {
    macro_simple(
        em,
        "sk_atomic",
        "#if defined(__STDC_VERSION__) && __STDC_VERSION__ >= 201112L && !defined(__STDC_NO_ATOMICS__)\n\
         #define sk_atomic(T) _Atomic(T)\n\
         #else\n\
         #define sk_atomic(T) T\n\
         #endif\n",
    )
}

fn macro_threadlocal(em: &mut CEmitter) -> String {
    macro_simple(
        em,
        "sk_threadlocal",
        "#if defined(__STDC_VERSION__) && __STDC_VERSION__ >= 201112L && !defined(__STDC_NO_THREADS__)\n\
         #define sk_threadlocal _Thread_local\n\
         #elif defined(__GNUC__)\n\
         #define sk_threadlocal __thread\n\
         #else\n\
         #define sk_threadlocal\n\
         #endif\n",
    )
}

fn macro_packed(em: &mut CEmitter) -> String {
    macro_simple(
        em,
        "sk_packed",
        "#if defined(__GNUC__)\n\
         #define sk_packed __attribute__((packed))\n\
         #else\n\
         #define sk_packed\n\
         #endif\n",
    )
}

fn macro_aligned(em: &mut CEmitter) -> String {
    macro_simple(
        em,
        "sk_aligned",
        "#if defined(__GNUC__)\n\
         #define sk_aligned(N) __attribute__((aligned(N)))\n\
         #elif defined(_MSC_VER)\n\
         #define sk_aligned(N) __declspec(align(N))\n\
         #else\n\
         #define sk_aligned(N)\n\
         #endif\n",
    )
}

fn macro_alignas(em: &mut CEmitter) -> String {
    macro_simple(
        em,
        "sk_alignas",
        "#if defined(__STDC_VERSION__) && __STDC_VERSION__ >= 201112L\n\
         #define sk_alignas(N) _Alignas(N)\n\
         #elif defined(__GNUC__)\n\
         #define sk_alignas(N) __attribute__((aligned(N)))\n\
         #else\n\
         #define sk_alignas(N)\n\
         #endif\n",
    )
}

fn macro_static_assert(em: &mut CEmitter) -> String {
    macro_simple(
        em,
        "sk_static_assert",
        "#if defined(__STDC_VERSION__) && __STDC_VERSION__ >= 201112L\n\
         #define sk_static_assert(c, m) _Static_assert(c, m)\n\
         #else\n\
         #define sk_static_assert(c, m)\n\
         #endif\n",
    )
}

fn macro_alignof(em: &mut CEmitter) -> String {
    macro_simple(
        em,
        "sk_alignof",
        "#if defined(__STDC_VERSION__) && __STDC_VERSION__ >= 201112L\n\
         #define sk_alignof(T) _Alignof(T)\n\
         #elif defined(__GNUC__)\n\
         #define sk_alignof(T) __alignof__(T)\n\
         #else\n\
         #define sk_alignof(T) sizeof(T)\n\
         #endif\n",
    )
}

// ============================================================================
// Strings, abort, panic
// ============================================================================

fn stringview_type(em: &mut CEmitter) -> String {
    em.ensure_include("<stdint.h>");
    em.define_builtin_decl(
        "sk_stringview",
        "typedef struct sk_stringview {\n\
         \x20 uint8_t* data;\n\
         \x20 uintptr_t size;\n\
         } sk_stringview;\n",
    );
    "sk_stringview".to_string()
}

fn builtin_abort(em: &mut CEmitter) -> String {
    em.ensure_include("<stdio.h>");
    em.ensure_include("<stdlib.h>");
    em.ensure_builtin("noreturn", &[]);
    let body = if em.noabort() {
        "{\n  fflush(stderr);\n  exit(-1);\n}"
    } else {
        "{\n  fflush(stderr);\n  abort();\n}"
    };
    em.define_function_builtin("sk_abort", "sk_noreturn static", "void", "(void)", body);
    "sk_abort".to_string()
}

fn builtin_panic_cstring(em: &mut CEmitter) -> String {
    em.ensure_include("<stdio.h>");
    em.ensure_builtin("abort", &[]);
    em.ensure_builtin("noreturn", &[]);
    em.define_function_builtin(
        "sk_panic_cstring",
        "sk_noreturn static",
        "void",
        "(const char* s)",
        "{\n\
         \x20 fputs(s, stderr);\n\
         \x20 fputc('\\n', stderr);\n\
         \x20 fflush(stderr);\n\
         \x20 sk_abort();\n\
         }",
    );
    "sk_panic_cstring".to_string()
}

fn builtin_panic_string(em: &mut CEmitter) -> String {
    em.ensure_include("<stdio.h>");
    let sv = em.ensure_builtin("stringview_type", &[]);
    em.ensure_builtin("abort", &[]);
    em.ensure_builtin("noreturn", &[]);
    em.define_function_builtin(
        "sk_panic_string",
        "sk_noreturn static",
        "void",
        &format!("({} s)", sv),
        "{\n\
         \x20 if(s.size > 0) fwrite(s.data, 1, s.size, stderr);\n\
         \x20 fputc('\\n', stderr);\n\
         \x20 fflush(stderr);\n\
         \x20 sk_abort();\n\
         }",
    );
    "sk_panic_string".to_string()
}

fn builtin_warn(em: &mut CEmitter) -> String {
    em.ensure_include("<stdio.h>");
    let sv = em.ensure_builtin("stringview_type", &[]);
    em.define_function_builtin(
        "sk_warn",
        "static",
        "void",
        &format!("({} s)", sv),
        "{\n\
         \x20 fputs(\"warning: \", stderr);\n\
         \x20 if(s.size > 0) fwrite(s.data, 1, s.size, stderr);\n\
         \x20 fputc('\\n', stderr);\n\
         \x20 fflush(stderr);\n\
         }",
    );
    "sk_warn".to_string()
}

// ============================================================================
// Assertions
// ============================================================================

fn builtin_assert_fail(em: &mut CEmitter) -> String {
    em.ensure_include("<stdio.h>");
    em.ensure_builtin("panic_cstring", &[]);
    em.ensure_builtin("noreturn", &[]);
    em.define_function_builtin(
        "sk_assert_fail",
        "sk_noreturn static",
        "void",
        "(const char* loc)",
        "{\n\
         \x20 fputs(loc, stderr);\n\
         \x20 sk_panic_cstring(\"assertion failed!\");\n\
         }",
    );
    "sk_assert_fail".to_string()
}

fn builtin_assert(em: &mut CEmitter) -> String {
    em.ensure_include("<stdbool.h>");
    em.ensure_builtin("unlikely", &[]);
    em.ensure_builtin("assert_fail", &[]);
    em.define_function_builtin(
        "sk_assert",
        "static",
        "void",
        "(bool cond, const char* loc)",
        "{\n\
         \x20 if(sk_unlikely(!cond)) sk_assert_fail(loc);\n\
         }",
    );
    "sk_assert".to_string()
}

fn builtin_assert_msg(em: &mut CEmitter) -> String {
    em.ensure_include("<stdio.h>");
    em.ensure_include("<stdbool.h>");
    let sv = em.ensure_builtin("stringview_type", &[]);
    em.ensure_builtin("unlikely", &[]);
    em.ensure_builtin("abort", &[]);
    em.define_function_builtin(
        "sk_assert_msg",
        "static",
        "void",
        &format!("(bool cond, const char* loc, {} msg)", sv),
        "{\n\
         \x20 if(sk_unlikely(!cond)) {\n\
         \x20   fputs(loc, stderr);\n\
         \x20   fputs(\"assertion failed: \", stderr);\n\
         \x20   if(msg.size > 0) fwrite(msg.data, 1, msg.size, stderr);\n\
         \x20   fputs(\"!\\n\", stderr);\n\
         \x20   fflush(stderr);\n\
         \x20   sk_abort();\n\
         \x20 }\n\
         }",
    );
    "sk_assert_msg".to_string()
}

// ============================================================================
// Checked conversions and accesses
// ============================================================================

fn builtin_assert_narrow(em: &mut CEmitter, dst: &TypeRef, src: &TypeRef) -> String {
    let token = format!("sk_assert_narrow_{}_{}", dst.codename(), src.codename());
    let dst_c = em.ctype(dst);
    let src_c = em.ctype(src);
    em.ensure_builtin("unlikely", &[]);
    em.ensure_builtin("panic_cstring", &[]);
    let message = format!(
        "narrow casting from {} to {} failed",
        src.name(),
        dst.name()
    );

    let body = if src.is_float() {
        // Float to integer narrows check round-trip equality
        format!(
            "{{\n\
             \x20 {dst} r = ({dst})v;\n\
             \x20 if(sk_unlikely(({src})r != v)) sk_panic_cstring(\"{msg}\");\n\
             \x20 return r;\n\
             }}",
            dst = dst_c,
            src = src_c,
            msg = message
        )
    } else {
        let mut conds = Vec::new();
        let dst_min = dst.min_int().unwrap_or(0);
        let dst_max = dst.max_int().unwrap_or(0);
        let src_min = src.min_int().unwrap_or(0);
        let src_max = src.max_int().unwrap_or(0);
        if src_min < dst_min {
            conds.push(format!("v < ({}){}", src_c, dst_min));
        }
        if src_max > dst_max {
            if src.is_signed() && !dst.is_signed() {
                // Compare magnitudes through the source's unsigned shape
                conds.push(format!("v > ({}){}", src_c, dst_max.min(src_max)));
            } else {
                conds.push(format!("v > ({}){}", src_c, dst_max));
            }
        }
        let cond = if conds.is_empty() {
            "0".to_string()
        } else {
            conds.join(" || ")
        };
        format!(
            "{{\n\
             \x20 if(sk_unlikely({cond})) sk_panic_cstring(\"{msg}\");\n\
             \x20 return ({dst})v;\n\
             }}",
            cond = cond,
            msg = message,
            dst = dst_c
        )
    };

    em.define_function_builtin(&token, "static", &dst_c, &format!("({} v)", src_c), &body);
    token
}

fn builtin_assert_bounds(em: &mut CEmitter, itype: &TypeRef) -> String {
    let token = format!("sk_assert_bounds_{}", itype.codename());
    em.ensure_include("<stdint.h>");
    em.ensure_builtin("unlikely", &[]);
    em.ensure_builtin("panic_cstring", &[]);
    let ity = em.ctype(itype);
    let negative = if itype.is_signed() { " || i < 0" } else { "" };
    let body = format!(
        "{{\n\
         \x20 if(sk_unlikely((uintptr_t)i >= len{neg})) sk_panic_cstring(\"array index: position out of bounds\");\n\
         \x20 return (uintptr_t)i;\n\
         }}",
        neg = negative
    );
    em.define_function_builtin(
        &token,
        "static",
        "uintptr_t",
        &format!("({} i, uintptr_t len)", ity),
        &body,
    );
    token
}

fn builtin_assert_deref(em: &mut CEmitter) -> String {
    em.ensure_include("<stddef.h>");
    em.ensure_builtin("unlikely", &[]);
    em.ensure_builtin("panic_cstring", &[]);
    em.define_function_builtin(
        "sk_assert_deref",
        "static",
        "void*",
        "(void* p)",
        "{\n\
         \x20 if(sk_unlikely(p == NULL)) sk_panic_cstring(\"attempt to dereference a null pointer\");\n\
         \x20 return p;\n\
         }",
    );
    "sk_assert_deref".to_string()
}

fn builtin_string2cstring(em: &mut CEmitter) -> String {
    let sv = em.ensure_builtin("stringview_type", &[]);
    em.define_function_builtin(
        "sk_string2cstring",
        "static",
        "char*",
        &format!("({} s)", sv),
        "{\n\
         \x20 if(s.size == 0) return (char*)\"\";\n\
         \x20 return (char*)s.data;\n\
         }",
    );
    "sk_string2cstring".to_string()
}

fn builtin_assert_string2cstring(em: &mut CEmitter) -> String {
    let sv = em.ensure_builtin("stringview_type", &[]);
    em.ensure_builtin("unlikely", &[]);
    em.ensure_builtin("panic_cstring", &[]);
    em.define_function_builtin(
        "sk_assert_string2cstring",
        "static",
        "char*",
        &format!("({} s)", sv),
        "{\n\
         \x20 if(s.size == 0) return (char*)\"\";\n\
         \x20 if(sk_unlikely(s.data[s.size] != 0)) sk_panic_cstring(\"string is not null terminated\");\n\
         \x20 return (char*)s.data;\n\
         }",
    );
    "sk_assert_string2cstring".to_string()
}

fn builtin_cstring2string(em: &mut CEmitter) -> String {
    em.ensure_include("<string.h>");
    em.ensure_include("<stddef.h>");
    let sv = em.ensure_builtin("stringview_type", &[]);
    let body = format!(
        "{{\n\
         \x20 {sv} r = {{0}};\n\
         \x20 if(s == NULL) return r;\n\
         \x20 r.data = (uint8_t*)s;\n\
         \x20 r.size = strlen(s);\n\
         \x20 return r;\n\
         }}",
        sv = sv
    );
    em.define_function_builtin(
        "sk_cstring2string",
        "static",
        &sv,
        "(const char* s)",
        &body,
    );
    "sk_cstring2string".to_string()
}

// ============================================================================
// Equality and ordering
// ============================================================================

fn builtin_stringview_eq(em: &mut CEmitter) -> String {
    em.ensure_include("<string.h>");
    em.ensure_include("<stdbool.h>");
    let sv = em.ensure_builtin("stringview_type", &[]);
    em.define_function_builtin(
        "sk_stringview_eq",
        "static",
        "bool",
        &format!("({sv} a, {sv} b)", sv = sv),
        "{\n\
         \x20 return a.size == b.size && (a.data == b.data || a.size == 0 || memcmp(a.data, b.data, a.size) == 0);\n\
         }",
    );
    "sk_stringview_eq".to_string()
}

fn builtin_eq_composite(em: &mut CEmitter, ty: &TypeRef) -> String {
    let token = format!("sk_eq_{}", ty.codename());
    em.ensure_include("<stdbool.h>");
    let cty = em.ctype(ty);

    // Unions compare by raw bytes
    let fields = match &**ty {
        Type::Record(c) => c.fields.clone(),
        _ => {
            em.ensure_include("<string.h>");
            em.define_function_builtin(
                &token,
                "static",
                "bool",
                &format!("({c} a, {c} b)", c = cty),
                "{\n\
                 \x20 return memcmp(&a, &b, sizeof(a)) == 0;\n\
                 }",
            );
            return token;
        }
    };

    let mut parts = Vec::new();
    for field in &fields {
        let fname = super::c_emit::c_name(&field.name);
        let expr = match &*field.ty {
            Type::Record(_) => {
                let sub = em.ensure_builtin("eq", &[field.ty.clone()]);
                format!("{}(a.{f}, b.{f})", sub, f = fname)
            }
            Type::StringView => {
                let sub = em.ensure_builtin("stringview_eq", &[]);
                format!("{}(a.{f}, b.{f})", sub, f = fname)
            }
            Type::Array { .. } | Type::Union(_) => {
                em.ensure_include("<string.h>");
                format!("memcmp(&a.{f}, &b.{f}, sizeof(a.{f})) == 0", f = fname)
            }
            _ => format!("a.{f} == b.{f}", f = fname),
        };
        parts.push(expr);
    }
    let body = if parts.is_empty() {
        "{\n  return true;\n}".to_string()
    } else {
        format!("{{\n  return {};\n}}", parts.join(" && "))
    };
    em.define_function_builtin(
        &token,
        "static",
        "bool",
        &format!("({c} a, {c} b)", c = cty),
        &body,
    );
    token
}

fn builtin_eq_cross(em: &mut CEmitter, a: &TypeRef, b: &TypeRef) -> String {
    let token = format!("sk_eq_{}_{}", a.codename(), b.codename());
    em.ensure_include("<stdbool.h>");
    em.ensure_include("<stdint.h>");
    let a_c = em.ctype(a);
    let b_c = em.ctype(b);
    // The signed operand carries the non-negativity check
    let guard = if a.is_signed() { "a >= 0" } else { "b >= 0" };
    let body = format!(
        "{{\n\
         \x20 return (uint64_t)a == (uint64_t)b && {};\n\
         }}",
        guard
    );
    em.define_function_builtin(
        &token,
        "static",
        "bool",
        &format!("({} a, {} b)", a_c, b_c),
        &body,
    );
    token
}

fn builtin_lt_cross(em: &mut CEmitter, a: &TypeRef, b: &TypeRef) -> String {
    let token = format!("sk_lt_{}_{}", a.codename(), b.codename());
    em.ensure_include("<stdbool.h>");
    em.ensure_include("<stdint.h>");
    let a_c = em.ctype(a);
    let b_c = em.ctype(b);
    // A negative signed side decides immediately; otherwise both compare as
    // the wider unsigned type
    let body = if a.is_signed() {
        "{\n\
         \x20 return a < 0 || (uint64_t)a < (uint64_t)b;\n\
         }"
    } else {
        "{\n\
         \x20 return b > 0 && (uint64_t)a < (uint64_t)b;\n\
         }"
    };
    em.define_function_builtin(
        &token,
        "static",
        "bool",
        &format!("({} a, {} b)", a_c, b_c),
        body,
    );
    token
}

// ============================================================================
// Integer and float arithmetic
// ============================================================================

fn builtin_idiv(em: &mut CEmitter, ty: &TypeRef) -> String {
    let token = format!("sk_idiv_{}", ty.codename());
    let cty = em.ctype(ty);
    em.ensure_builtin("unlikely", &[]);
    let zerocheck = if em.nochecks() {
        String::new()
    } else {
        em.ensure_builtin("panic_cstring", &[]);
        "  if(sk_unlikely(b == 0)) sk_panic_cstring(\"division by zero\");\n".to_string()
    };
    let body = if ty.is_signed() {
        let uty = em
            .ctx
            .types
            .unsigned_type(ty)
            .map(|u| em.ctype(&u))
            .unwrap_or_else(|| "uint64_t".into());
        // b == -1 avoids the INT_MIN / -1 overflow
        format!(
            "{{\n\
             \x20 if(sk_unlikely(b == -1)) return ({c})(0U - ({u})a);\n\
             {z}\
             \x20 {c} q = a / b;\n\
             \x20 if((a % b != 0) && ((a < 0) != (b < 0))) q -= 1;\n\
             \x20 return q;\n\
             }}",
            c = cty,
            u = uty,
            z = zerocheck
        )
    } else {
        format!(
            "{{\n\
             {z}\
             \x20 return a / b;\n\
             }}",
            z = zerocheck
        )
    };
    em.define_function_builtin(
        &token,
        "static",
        &cty,
        &format!("({c} a, {c} b)", c = cty),
        &body,
    );
    token
}

fn builtin_imod(em: &mut CEmitter, ty: &TypeRef) -> String {
    let token = format!("sk_imod_{}", ty.codename());
    let cty = em.ctype(ty);
    em.ensure_builtin("unlikely", &[]);
    let zerocheck = if em.nochecks() {
        String::new()
    } else {
        em.ensure_builtin("panic_cstring", &[]);
        "  if(sk_unlikely(b == 0)) sk_panic_cstring(\"division by zero\");\n".to_string()
    };
    let body = if ty.is_signed() {
        format!(
            "{{\n\
             \x20 if(sk_unlikely(b == -1)) return 0;\n\
             {z}\
             \x20 {c} r = a % b;\n\
             \x20 if((r != 0) && ((r < 0) != (b < 0))) r += b;\n\
             \x20 return r;\n\
             }}",
            c = cty,
            z = zerocheck
        )
    } else {
        format!(
            "{{\n\
             {z}\
             \x20 return a % b;\n\
             }}",
            z = zerocheck
        )
    };
    em.define_function_builtin(
        &token,
        "static",
        &cty,
        &format!("({c} a, {c} b)", c = cty),
        &body,
    );
    token
}

fn builtin_fmod(em: &mut CEmitter, ty: &TypeRef) -> String {
    let token = format!("sk_fmod_{}", ty.codename());
    em.ensure_include("<math.h>");
    let cty = em.ctype(ty);
    let cfmod = match &**ty {
        Type::Float { bits: 32 } => "fmodf",
        Type::Float { bits: 64 } => "fmod",
        _ => "fmodl",
    };
    // The result takes the sign of the divisor (floor modulo)
    let body = format!(
        "{{\n\
         \x20 {c} r = {f}(a, b);\n\
         \x20 if(r != 0 && (r < 0) != (b < 0)) r += b;\n\
         \x20 return r;\n\
         }}",
        c = cty,
        f = cfmod
    );
    em.define_function_builtin(
        &token,
        "static",
        &cty,
        &format!("({c} a, {c} b)", c = cty),
        &body,
    );
    token
}

fn builtin_shift(em: &mut CEmitter, op: &str, ty: &TypeRef) -> String {
    let token = format!("sk_{}_{}", op, ty.codename());
    let cty = em.ctype(ty);
    let bits = ty.bitsize().unwrap_or(64);
    em.ensure_builtin("likely", &[]);
    em.ensure_include("<stdint.h>");
    let uty = em
        .ctx
        .types
        .unsigned_type(ty)
        .map(|u| em.ctype(&u))
        .unwrap_or_else(|| cty.clone());

    let body = match op {
        "shl" => format!(
            "{{\n\
             \x20 if(sk_likely(b >= 0 && b < {n})) return ({c})(({u})a << b);\n\
             \x20 else if(b < 0 && b > -{n}) return ({c})(({u})a >> (-b));\n\
             \x20 else return 0;\n\
             }}",
            n = bits,
            c = cty,
            u = uty
        ),
        "shr" => format!(
            "{{\n\
             \x20 if(sk_likely(b >= 0 && b < {n})) return ({c})(({u})a >> b);\n\
             \x20 else if(b < 0 && b > -{n}) return ({c})(({u})a << (-b));\n\
             \x20 else return 0;\n\
             }}",
            n = bits,
            c = cty,
            u = uty
        ),
        // asr sign-fills for large counts on signed operands
        _ if ty.is_signed() => format!(
            "{{\n\
             \x20 if(sk_likely(b >= 0 && b < {n})) return ({c})(a >> b);\n\
             \x20 else if(b >= {n}) return a < 0 ? ({c})-1 : 0;\n\
             \x20 else if(b > -{n}) return ({c})(({u})a << (-b));\n\
             \x20 else return 0;\n\
             }}",
            n = bits,
            c = cty,
            u = uty
        ),
        _ => format!(
            "{{\n\
             \x20 if(sk_likely(b >= 0 && b < {n})) return ({c})(a >> b);\n\
             \x20 else if(b < 0 && b > -{n}) return ({c})(a << (-b));\n\
             \x20 else return 0;\n\
             }}",
            n = bits,
            c = cty
        ),
    };
    em.define_function_builtin(
        &token,
        "static",
        &cty,
        &format!("({} a, int64_t b)", cty),
        &body,
    );
    token
}

// ============================================================================
// Polymorphic print
// ============================================================================

fn builtin_print(em: &mut CEmitter, types: &[TypeRef]) -> String {
    let token = if types.is_empty() {
        "sk_print".to_string()
    } else {
        let tail: Vec<String> = types.iter().map(|t| t.codename()).collect();
        format!("sk_print_{}", tail.join("_"))
    };
    em.ensure_include("<stdio.h>");

    let mut params = Vec::new();
    let mut body = String::new();
    for (i, ty) in types.iter().enumerate() {
        if i > 0 {
            body.push_str("  fputc('\\t', stdout);\n");
        }
        let arg = format!("a{}", i + 1);
        match &**ty {
            Type::Niltype | Type::TypeType | Type::Auto => {
                body.push_str("  fputs(\"nil\", stdout);\n");
                continue;
            }
            Type::Nilptr => {
                body.push_str("  fputs(\"(null)\", stdout);\n");
                continue;
            }
            _ => {}
        }
        let cty = em.ctype(ty);
        params.push(format!("{} {}", cty, arg));
        match &**ty {
            Type::StringView => {
                let _ = writeln!(
                    body,
                    "  if({a}.size > 0) fwrite({a}.data, 1, {a}.size, stdout);",
                    a = arg
                );
            }
            Type::CString => {
                let _ = writeln!(
                    body,
                    "  if({a} != NULL) fputs({a}, stdout); else fputs(\"(null)\", stdout);",
                    a = arg
                );
            }
            Type::Boolean => {
                let _ = writeln!(body, "  fputs({a} ? \"true\" : \"false\", stdout);", a = arg);
            }
            Type::Pointer(_) => {
                em.ensure_include("<inttypes.h>");
                let _ = writeln!(
                    body,
                    "  if({a} != NULL) fprintf(stdout, \"0x%\" PRIxPTR, (uintptr_t){a}); else fputs(\"(null)\", stdout);",
                    a = arg
                );
            }
            Type::Function { .. } => {
                em.ensure_include("<inttypes.h>");
                let _ = writeln!(
                    body,
                    "  fputs(\"function: \", stdout);\n  fprintf(stdout, \"0x%\" PRIxPTR, (uintptr_t){a});",
                    a = arg
                );
            }
            Type::Float { bits } => {
                em.ensure_include("<string.h>");
                let cast = if *bits > 64 { "(double)" } else { "" };
                let _ = writeln!(
                    body,
                    "  {{\n\
                     \x20   char buf[48];\n\
                     \x20   int len = snprintf(buf, 48, \"%.14g\", {cast}(double){a});\n\
                     \x20   if(len > 0 && memchr(buf, '.', (size_t)len) == NULL && memchr(buf, 'e', (size_t)len) == NULL\n\
                     \x20      && memchr(buf, 'n', (size_t)len) == NULL && memchr(buf, 'i', (size_t)len) == NULL) {{\n\
                     \x20     len = snprintf(buf, 48, \"%.1f\", {cast}(double){a});\n\
                     \x20   }}\n\
                     \x20   if(len > 0) fwrite(buf, 1, (size_t)len, stdout);\n\
                     \x20 }}",
                    cast = cast,
                    a = arg
                );
            }
            Type::Int(k) => {
                em.ensure_include("<inttypes.h>");
                let pri = if k.ptr_sized {
                    if k.signed { "PRIiPTR".to_string() } else { "PRIuPTR".to_string() }
                } else if k.signed {
                    format!("PRIi{}", k.bits)
                } else {
                    format!("PRIu{}", k.bits)
                };
                let _ = writeln!(body, "  fprintf(stdout, \"%\" {}, {});", pri, arg);
            }
            Type::Enum { subtype, .. } => {
                em.ensure_include("<inttypes.h>");
                let sub_c = em.ctype(subtype);
                let pri = if subtype.is_signed() {
                    format!("PRIi{}", subtype.bitsize().unwrap_or(64))
                } else {
                    format!("PRIu{}", subtype.bitsize().unwrap_or(64))
                };
                let _ = writeln!(
                    body,
                    "  fprintf(stdout, \"%\" {}, ({}){});",
                    pri, sub_c, arg
                );
            }
            // Records reach here only with a `__tostring` hook; the
            // analyzer rejects the rest
            Type::Record(c) => match c.tostring_field() {
                Some(hook) => {
                    let sv = em.ensure_builtin("stringview_type", &[]);
                    let takes_self =
                        matches!(&*hook.ty, Type::Function { args, .. } if args.len() == 1);
                    let call = if takes_self {
                        format!("{a}.__tostring({a})", a = arg)
                    } else {
                        format!("{}.__tostring()", arg)
                    };
                    let _ = writeln!(
                        body,
                        "  {{\n\
                         \x20   {sv} s = {call};\n\
                         \x20   if(s.size > 0) fwrite(s.data, 1, s.size, stdout);\n\
                         \x20 }}",
                        sv = sv,
                        call = call
                    );
                }
                None => {
                    let _ = writeln!(body, "  (void){};", arg);
                }
            },
            _ => {
                let _ = writeln!(body, "  (void){};", arg);
            }
        }
    }
    body.push_str("  fputc('\\n', stdout);\n");

    let params = if params.is_empty() {
        "(void)".to_string()
    } else {
        format!("({})", params.join(", "))
    };
    em.define_function_builtin(&token, "static", "void", &params, &format!("{{\n{}}}", body));
    token
}

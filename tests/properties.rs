//! Property-based tests over the type system, scopes, and folding

use proptest::prelude::*;

use skarn::scope::{ScopeStack, Symbol};
use skarn::test_support::{analyze_program, generate_c};
use skarn::types::{TypeContext, Value};

/// Reference model for the deterministic shift semantics: out-of-range
/// counts collapse to zero (or sign fill), negative counts mirror direction
fn model_shift(op: &str, a: i128, b: i128, bits: u32, signed: bool) -> i128 {
    let truncate = |v: i128| -> i128 {
        let mask = (1i128 << bits) - 1;
        let w = v & mask;
        if signed && w >= (1i128 << (bits - 1)) {
            w - (1i128 << bits)
        } else {
            w
        }
    };
    let (op, b) = if b < 0 {
        (if op == "shl" { "shr" } else { "shl" }, -b)
    } else {
        (op, b)
    };
    if b >= bits as i128 {
        return if op == "asr" && a < 0 { truncate(-1) } else { 0 };
    }
    let ua = a & ((1i128 << bits) - 1);
    truncate(match op {
        "shl" => ua << b,
        "shr" => ua >> b,
        _ => a >> b,
    })
}

fn folded_value(source: &str) -> Option<i128> {
    let (_, root) = analyze_program(source).ok()?;
    let stmts = root.borrow().slot_list(0);
    let value = stmts[0].borrow().slot_node(1)?;
    let v = value.borrow().attrs.value.clone()?;
    v.as_int()
}

proptest! {
    #[test]
    fn narrowest_int_always_fits(v in any::<i64>()) {
        let ctx = TypeContext::new();
        let ty = ctx.narrowest_int(v as i128);
        prop_assert!(ty.fits_int(v as i128));
    }

    #[test]
    fn literal_type_inference_round_trips(v in any::<i64>()) {
        let ctx = TypeContext::new();
        let ty = ctx.int_literal_type(v as i128).expect("in range");
        prop_assert!(ty.fits_int(v as i128));
    }

    #[test]
    fn value_aware_narrowing_matches_range(v in any::<i64>()) {
        let ctx = TypeContext::new();
        for ty in [&ctx.int8, &ctx.int16, &ctx.int32, &ctx.uint8, &ctx.uint16, &ctx.uint32] {
            let allowed = ctx.assignable(ty, &ctx.int64, Some(&Value::Int(v as i128)));
            prop_assert_eq!(allowed, ty.fits_int(v as i128));
        }
    }

    #[test]
    fn promotion_is_commutative(a in 0usize..8, b in 0usize..8) {
        let ctx = TypeContext::new();
        let types = [
            ctx.int8.clone(), ctx.int16.clone(), ctx.int32.clone(), ctx.int64.clone(),
            ctx.uint8.clone(), ctx.uint16.clone(), ctx.uint32.clone(), ctx.uint64.clone(),
        ];
        let ab = ctx.promote(&types[a], &types[b]).expect("promotes");
        let ba = ctx.promote(&types[b], &types[a]).expect("promotes");
        prop_assert_eq!(ab.name(), ba.name());
    }

    #[test]
    fn promotion_never_loses_width(a in 0usize..8, b in 0usize..8) {
        let ctx = TypeContext::new();
        let types = [
            ctx.int8.clone(), ctx.int16.clone(), ctx.int32.clone(), ctx.int64.clone(),
            ctx.uint8.clone(), ctx.uint16.clone(), ctx.uint32.clone(), ctx.uint64.clone(),
        ];
        let result = ctx.promote(&types[a], &types[b]).expect("promotes");
        prop_assert!(result.bitsize() >= types[a].bitsize().max(types[b].bitsize()));
    }

    #[test]
    fn shift_folding_is_total_and_matches_model(
        a in -2147483647i32..=2147483647i32,
        b in -200i64..200,
        op in prop::sample::select(vec!["<<", ">>", ">>>"]),
    ) {
        let src = format!("local a = ({}_i32) {} ({})", a, op, b);
        let folded = folded_value(&src).expect("shift folds");
        let name = match op { "<<" => "shl", ">>" => "shr", _ => "asr" };
        prop_assert_eq!(folded, model_shift(name, a as i128, b as i128, 32, true));
    }

    #[test]
    fn floor_division_identity(a in -2147483647i32..=2147483647i32, b in any::<i32>()) {
        prop_assume!(b != 0);
        let src_div = format!("local a = ({}_i64) // ({})", a, b);
        let src_mod = format!("local a = ({}_i64) % ({})", a, b);
        let q = folded_value(&src_div).expect("div folds");
        let r = folded_value(&src_mod).expect("mod folds");
        // a == q*b + r with 0 <= |r| < |b| and r matching b's sign
        prop_assert_eq!(q * (b as i128) + r, a as i128);
        prop_assert!(r == 0 || (r < 0) == ((b as i128) < 0));
        prop_assert!(r.abs() < (b as i128).abs());
    }

    #[test]
    fn scope_checkpoints_discard_later_symbols(extra in 1usize..8) {
        let ctx = TypeContext::new();
        let mut scopes = ScopeStack::new();
        let mut before = Symbol::new("before", 0);
        before.ty = Some(ctx.int64.clone());
        scopes.declare(before).expect("declare");
        let cp = scopes.make_checkpoint();
        for i in 0..extra {
            let mut sym = Symbol::new(&format!("after{}", i), i);
            sym.ty = Some(ctx.int64.clone());
            scopes.declare(sym).expect("declare");
        }
        scopes.push_checkpoint(&cp);
        prop_assert!(scopes.lookup("before").is_some());
        for i in 0..extra {
            let name = format!("after{}", i);
            let found = scopes.lookup(&name).is_none();
            prop_assert!(found);
        }
        scopes.pop_checkpoint(&cp);
        for i in 0..extra {
            let name = format!("after{}", i);
            let found = scopes.lookup(&name).is_some();
            prop_assert!(found);
        }
    }

    #[test]
    fn generated_c_is_deterministic(v in any::<i32>(), w in any::<i32>()) {
        let src = format!(
            "local a = {}\nlocal b = {}\nlocal c = a + b\nprint(c)",
            v, w
        );
        let first = generate_c(&src).expect("emit");
        let second = generate_c(&src).expect("emit");
        prop_assert_eq!(first, second);
    }
}

//! Lua backend integration tests

use skarn::test_support::generate_lua;

#[test]
fn hello_world_prints_in_lua() {
    let lua = generate_lua("print \"hello world\"").expect("emit");
    assert!(lua.contains("print(\"hello world\")"), "got:\n{}", lua);
}

#[test]
fn type_declarations_vanish() {
    let lua = generate_lua(
        "local Point = @record{x: int64, y: int64}\n\
         local p: Point = {x = 1, y = 2}\n\
         print(p.x)",
    )
    .expect("emit");
    assert!(!lua.contains("Point ="), "type decl leaked:\n{}", lua);
    assert!(lua.contains("local p = {x = 1, y = 2}"));
    assert!(lua.contains("print(p.x)"));
}

#[test]
fn control_flow_round_trips() {
    let lua = generate_lua(
        "local n = 3\n\
         while n > 0 do\n\
         \x20 if n % 2 == 0 then print('even') else print('odd') end\n\
         \x20 n = n - 1\n\
         end\n\
         for i = 1, 10, 2 do print(i) end",
    )
    .expect("emit");
    assert!(lua.contains("while n > 0 do"));
    assert!(lua.contains("elseif") || lua.contains("else"));
    assert!(lua.contains("for i = 1, 10, 2 do"));
    assert!(lua.contains("n = n - 1"));
}

#[test]
fn functions_lose_annotations() {
    let lua = generate_lua(
        "local function add(a: int64, b: int64): int64 return a + b end\n\
         print(add(1, 2))",
    )
    .expect("emit");
    assert!(lua.contains("local function add(a, b)"));
    assert!(!lua.contains("int64"));
}

#[test]
fn casts_and_hints_vanish() {
    let lua = generate_lua(
        "local wide = 260\n\
         local narrow = (@int64)(wide)\n\
         local hinted = likely(wide == 260)",
    )
    .expect("emit");
    assert!(!lua.contains("@"));
    assert!(lua.contains("local narrow = wide"));
    assert!(lua.contains("local hinted = wide == 260"));
}

#[test]
fn indexing_shifts_to_one_based() {
    let lua = generate_lua("local a: [4]int64\nlocal i = 1\nlocal x = a[i]").expect("emit");
    assert!(lua.contains("a[i + 1]"));
}

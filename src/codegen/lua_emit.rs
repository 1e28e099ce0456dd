//! Lua code generation
//!
//! A thin secondary backend printing the typed AST back as Lua source.
//! Type-level constructs vanish; runtime semantics map onto the closest
//! Lua operators.

use std::fmt::Write;

use crate::analyzer::Context;
use crate::ast::{NodeRef, Slot, Tag};
use crate::types::Value;

use super::GenerateError;

pub fn emit_unit(ctx: &Context, root: &NodeRef) -> Result<String, GenerateError> {
    let mut em = LuaEmitter { ctx };
    let mut out = String::new();
    em.emit_block(root, 0, &mut out)?;
    Ok(out)
}

struct LuaEmitter<'a> {
    #[allow(dead_code)]
    ctx: &'a Context,
}

fn pad(indent: usize) -> String {
    "  ".repeat(indent)
}

impl<'a> LuaEmitter<'a> {
    fn emit_block(
        &mut self,
        block: &NodeRef,
        indent: usize,
        out: &mut String,
    ) -> Result<(), GenerateError> {
        let stmts = block.borrow().slot_list(0);
        for stmt in &stmts {
            self.emit_stmt(stmt, indent, out)?;
        }
        Ok(())
    }

    fn emit_stmt(
        &mut self,
        node: &NodeRef,
        indent: usize,
        out: &mut String,
    ) -> Result<(), GenerateError> {
        let tag = node.borrow().tag;
        let p = pad(indent);
        match tag {
            Tag::LocalDecl => {
                let (iddecl, value) = {
                    let n = node.borrow();
                    (n.slot_node(0), n.slot_node(1))
                };
                let iddecl = match iddecl {
                    Some(i) => i,
                    None => return Ok(()),
                };
                // Comptime-only declarations (types) have no Lua form
                let is_type = matches!(
                    iddecl.borrow().attrs.ty.as_deref(),
                    Some(crate::types::Type::TypeType)
                );
                if is_type {
                    return Ok(());
                }
                let name = iddecl.borrow().slot_str(0).unwrap_or_default();
                match value {
                    Some(v) => {
                        let text = self.emit_expr(&v)?;
                        let _ = writeln!(out, "{}local {} = {}", p, name, text);
                    }
                    None => {
                        let _ = writeln!(out, "{}local {}", p, name);
                    }
                }
                Ok(())
            }
            Tag::Assign => {
                let (target, value) = {
                    let n = node.borrow();
                    (n.slot_node(0), n.slot_node(1))
                };
                if let (Some(t), Some(v)) = (target, value) {
                    let lhs = self.emit_expr(&t)?;
                    let rhs = self.emit_expr(&v)?;
                    let _ = writeln!(out, "{}{} = {}", p, lhs, rhs);
                }
                Ok(())
            }
            Tag::FuncDef => {
                let (name, params, block) = {
                    let n = node.borrow();
                    (n.slot_str(1).unwrap_or_default(), n.slot_list(2), n.slot_node(4))
                };
                let params: Vec<String> = params
                    .iter()
                    .map(|param| param.borrow().slot_str(0).unwrap_or_default())
                    .collect();
                let _ = writeln!(out, "{}local function {}({})", p, name, params.join(", "));
                if let Some(block) = block {
                    self.emit_block(&block, indent + 1, out)?;
                }
                let _ = writeln!(out, "{}end", p);
                Ok(())
            }
            Tag::Call => {
                let requirename = node.borrow().attrs.requirename.clone();
                if let Some(module) = requirename {
                    let _ = writeln!(out, "{}require(\"{}\")", p, module);
                    return Ok(());
                }
                let text = self.emit_expr(node)?;
                let _ = writeln!(out, "{}{}", p, text);
                Ok(())
            }
            Tag::If => {
                let (clauses, else_block) = {
                    let n = node.borrow();
                    (n.slot_list(0), n.slot_node(1))
                };
                for (i, clause) in clauses.iter().enumerate() {
                    let (cond, block) = {
                        let c = clause.borrow();
                        (c.slot_node(0), c.slot_node(1))
                    };
                    let cond = match cond {
                        Some(c) => self.emit_expr(&c)?,
                        None => "false".into(),
                    };
                    let kw = if i == 0 { "if" } else { "elseif" };
                    let _ = writeln!(out, "{}{} {} then", p, kw, cond);
                    if let Some(block) = block {
                        self.emit_block(&block, indent + 1, out)?;
                    }
                }
                if let Some(block) = else_block {
                    let _ = writeln!(out, "{}else", p);
                    self.emit_block(&block, indent + 1, out)?;
                }
                let _ = writeln!(out, "{}end", p);
                Ok(())
            }
            Tag::While => {
                let (cond, block) = {
                    let n = node.borrow();
                    (n.slot_node(0), n.slot_node(1))
                };
                let cond = match cond {
                    Some(c) => self.emit_expr(&c)?,
                    None => "false".into(),
                };
                let _ = writeln!(out, "{}while {} do", p, cond);
                if let Some(block) = block {
                    self.emit_block(&block, indent + 1, out)?;
                }
                let _ = writeln!(out, "{}end", p);
                Ok(())
            }
            Tag::ForNum => {
                let (iddecl, start, limit, step, block) = {
                    let n = node.borrow();
                    (
                        n.slot_node(0),
                        n.slot_node(1),
                        n.slot_node(2),
                        n.slot_node(3),
                        n.slot_node(4),
                    )
                };
                let name = iddecl
                    .and_then(|i| i.borrow().slot_str(0))
                    .unwrap_or_default();
                let start = match start {
                    Some(s) => self.emit_expr(&s)?,
                    None => "1".into(),
                };
                let limit = match limit {
                    Some(l) => self.emit_expr(&l)?,
                    None => "0".into(),
                };
                let step = match step {
                    Some(s) => format!(", {}", self.emit_expr(&s)?),
                    None => String::new(),
                };
                let _ = writeln!(out, "{}for {} = {}, {}{} do", p, name, start, limit, step);
                if let Some(block) = block {
                    self.emit_block(&block, indent + 1, out)?;
                }
                let _ = writeln!(out, "{}end", p);
                Ok(())
            }
            Tag::Do => {
                let block = node.borrow().slot_node(0);
                if let Some(block) = block {
                    let _ = writeln!(out, "{}do", p);
                    self.emit_block(&block, indent + 1, out)?;
                    let _ = writeln!(out, "{}end", p);
                }
                Ok(())
            }
            Tag::Return => {
                let value = node.borrow().slot_node(0);
                match value {
                    Some(v) => {
                        let text = self.emit_expr(&v)?;
                        let _ = writeln!(out, "{}return {}", p, text);
                    }
                    None => {
                        let _ = writeln!(out, "{}return", p);
                    }
                }
                Ok(())
            }
            Tag::Break => {
                let _ = writeln!(out, "{}break", p);
                Ok(())
            }
            Tag::PragmaCall | Tag::Preprocess => Ok(()),
            _ => Ok(()),
        }
    }

    fn emit_expr(&mut self, node: &NodeRef) -> Result<String, GenerateError> {
        let tag = node.borrow().tag;
        let text = match tag {
            Tag::Number => {
                let n = node.borrow();
                match n.attrs.value.clone().or(match n.slots.first() {
                    Some(Slot::Int(v)) => Some(Value::Int(*v)),
                    Some(Slot::Float(v)) => Some(Value::Float(*v)),
                    _ => None,
                }) {
                    Some(Value::Int(v)) => v.to_string(),
                    Some(Value::Float(v)) => format!("{:?}", v),
                    _ => "0".into(),
                }
            }
            Tag::String => lua_string(&node.borrow().slot_str(0).unwrap_or_default()),
            Tag::Boolean => {
                if matches!(node.borrow().slots.first(), Some(Slot::Bool(true))) {
                    "true".into()
                } else {
                    "false".into()
                }
            }
            Tag::Nil | Tag::Nilptr => "nil".into(),
            Tag::Id => node.borrow().slot_str(0).unwrap_or_default(),
            Tag::Paren => {
                let inner = node.borrow().slot_node(0);
                match inner {
                    Some(inner) => format!("({})", self.emit_expr(&inner)?),
                    None => "nil".into(),
                }
            }
            Tag::UnaryOp => {
                let (op, operand) = {
                    let n = node.borrow();
                    (n.slot_str(0).unwrap_or_default(), n.slot_node(1))
                };
                let operand = match operand {
                    Some(o) => self.emit_expr(&o)?,
                    None => "nil".into(),
                };
                match op.as_str() {
                    "not" => format!("not {}", operand),
                    "unm" => format!("-{}", operand),
                    "len" => format!("#{}", operand),
                    "bnot" => format!("~{}", operand),
                    // Pointers have no Lua rendition; pass the value through
                    _ => operand,
                }
            }
            Tag::BinaryOp => {
                let (op, lhs, rhs) = {
                    let n = node.borrow();
                    (n.slot_str(0).unwrap_or_default(), n.slot_node(1), n.slot_node(2))
                };
                let lhs = match lhs {
                    Some(l) => self.emit_expr(&l)?,
                    None => "nil".into(),
                };
                let rhs = match rhs {
                    Some(r) => self.emit_expr(&r)?,
                    None => "nil".into(),
                };
                let lua_op = match op.as_str() {
                    "add" => "+",
                    "sub" => "-",
                    "mul" => "*",
                    "div" => "/",
                    "idiv" => "//",
                    "mod" => "%",
                    "eq" => "==",
                    "ne" => "~=",
                    "lt" => "<",
                    "le" => "<=",
                    "gt" => ">",
                    "ge" => ">=",
                    "and" => "and",
                    "or" => "or",
                    "band" => "&",
                    "bor" => "|",
                    "bxor" => "~",
                    "shl" => "<<",
                    // Lua has no arithmetic shift; logical is the closest
                    "shr" | "asr" => ">>",
                    "concat" => "..",
                    _ => "+",
                };
                format!("{} {} {}", lhs, lua_op, rhs)
            }
            Tag::Call => {
                let (args, callee, builtin) = {
                    let n = node.borrow();
                    (n.slot_list(0), n.slot_node(1), n.attrs.builtin.clone())
                };
                let mut parts = Vec::new();
                for arg in &args {
                    parts.push(self.emit_expr(arg)?);
                }
                match builtin.as_deref() {
                    // Casts vanish in Lua
                    Some("narrow_cast") | Some("cast") => {
                        parts.into_iter().next().unwrap_or_default()
                    }
                    Some("check") | Some("assert") => format!("assert({})", parts.join(", ")),
                    Some("panic") | Some("error") => format!("error({})", parts.join(", ")),
                    Some("likely") | Some("unlikely") => {
                        parts.into_iter().next().unwrap_or_default()
                    }
                    _ => {
                        let callee = match callee {
                            Some(c) => self.emit_expr(&c)?,
                            None => return Err(GenerateError::Internal("missing callee".into())),
                        };
                        format!("{}({})", callee, parts.join(", "))
                    }
                }
            }
            Tag::DotIndex => {
                let (name, obj) = {
                    let n = node.borrow();
                    (n.slot_str(0).unwrap_or_default(), n.slot_node(1))
                };
                let obj = match obj {
                    Some(o) => self.emit_expr(&o)?,
                    None => "nil".into(),
                };
                format!("{}.{}", obj, name)
            }
            Tag::KeyIndex => {
                let (index, obj) = {
                    let n = node.borrow();
                    (n.slot_node(0), n.slot_node(1))
                };
                let index = match index {
                    Some(i) => self.emit_expr(&i)?,
                    None => "nil".into(),
                };
                let obj = match obj {
                    Some(o) => self.emit_expr(&o)?,
                    None => "nil".into(),
                };
                // Lua tables are 1-based
                format!("{}[{} + 1]", obj, index)
            }
            Tag::InitList => {
                let items = node.borrow().slot_list(0);
                let mut parts = Vec::new();
                for item in &items {
                    let is_pair = item.borrow().tag == Tag::Pair;
                    if is_pair {
                        let (name, value) = {
                            let pr = item.borrow();
                            (pr.slot_str(0).unwrap_or_default(), pr.slot_node(1))
                        };
                        let value = match value {
                            Some(v) => self.emit_expr(&v)?,
                            None => "nil".into(),
                        };
                        parts.push(format!("{} = {}", name, value));
                    } else {
                        parts.push(self.emit_expr(item)?);
                    }
                }
                format!("{{{}}}", parts.join(", "))
            }
            Tag::Type => "nil".into(),
            _ => "nil".into(),
        };
        Ok(text)
    }
}

fn lua_string(s: &str) -> String {
    let mut out = String::from("\"");
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{Analyzer, Context};
    use crate::parser::parse_source;

    fn emit(src: &str) -> String {
        let ctx = Context::new("test.skn", src);
        let root = parse_source(src, &ctx.builder).expect("parse failure");
        let mut analyzer = Analyzer::new(ctx);
        analyzer.analyze(&root).expect("analysis failure");
        emit_unit(&analyzer.ctx, &root).expect("emit failure")
    }

    #[test]
    fn test_hello_world() {
        let lua = emit("print \"hello world\"");
        assert!(lua.contains("print(\"hello world\")"));
    }

    #[test]
    fn test_locals_and_arithmetic() {
        let lua = emit("local a = 1\nlocal b = a");
        assert!(lua.contains("local a = 1"));
        assert!(lua.contains("local b = a"));
    }

    #[test]
    fn test_control_flow() {
        let lua = emit("local a = 1\nif a == 1 then print('one') else print('other') end");
        assert!(lua.contains("if a == 1 then"));
        assert!(lua.contains("else"));
        assert!(lua.contains("end"));
    }

    #[test]
    fn test_function_definition() {
        let lua = emit("local function add(a: int64, b: int64): int64 return a + b end\nlocal r = add(1, 2)");
        assert!(lua.contains("local function add(a, b)"));
        assert!(lua.contains("return a + b"));
        assert!(lua.contains("add(1, 2)"));
    }
}

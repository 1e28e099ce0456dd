//! C code generation
//!
//! The emitter maintains three output regions per translation unit:
//! directives (includes and feature macros), declarations (typedefs and
//! forward declarations), and definitions (helper and function bodies).
//! Includes and builtins are deduplicated; a helper is emitted at most once
//! per unit, and helpers referenced by other helpers are emitted first by
//! the `ensure_builtin` call chain.
//!
//! Emission order: directives, declarations, definitions, then the `main`
//! stub (suppressed for library builds).

use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use crate::analyzer::Context;
use crate::ast::{NodeRef, Tag};
use crate::types::{Type, TypeRef, Value};

use super::c_builtins;
use super::GenerateError;

/// Which region a builtin macro lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Directives,
    Declarations,
}

pub struct CEmitter<'a> {
    pub ctx: &'a Context,
    is_lib: bool,
    directives: String,
    declarations: String,
    definitions: String,
    includes: HashSet<String>,
    /// Builtin identifier -> emitted token
    usedbuiltins: HashMap<String, String>,
    emitted_keys: HashSet<String>,
    /// FuncDef registry id -> emitted C name
    func_names: HashMap<usize, String>,
    used_names: HashSet<String>,
    emitted_polys: HashSet<usize>,
}

impl<'a> CEmitter<'a> {
    pub fn new(ctx: &'a Context, is_lib: bool) -> Self {
        Self {
            ctx,
            is_lib,
            directives: String::new(),
            declarations: String::new(),
            definitions: String::new(),
            includes: HashSet::new(),
            usedbuiltins: HashMap::new(),
            emitted_keys: HashSet::new(),
            func_names: HashMap::new(),
            used_names: HashSet::new(),
            emitted_polys: HashSet::new(),
        }
    }

    // ========================================================================
    // Region primitives
    // ========================================================================

    /// Idempotent `#include` insertion into the directives region
    pub fn ensure_include(&mut self, header: &str) {
        if self.includes.insert(header.to_string()) {
            let _ = writeln!(self.directives, "#include {}", header);
        }
    }

    /// Emit a declaration once, keyed for deduplication
    pub fn add_declaration(&mut self, text: &str, key: &str) {
        if self.emitted_keys.insert(format!("decl:{}", key)) {
            self.declarations.push_str(text);
        }
    }

    /// Emit a definition once, keyed for deduplication
    pub fn add_definition(&mut self, text: &str, key: &str) {
        if self.emitted_keys.insert(format!("def:{}", key)) {
            self.definitions.push_str(text);
        }
    }

    /// Look up a generator by name, invoke it on first use, and record the
    /// emitted token
    pub fn ensure_builtin(&mut self, name: &str, args: &[TypeRef]) -> String {
        let key = if args.is_empty() {
            name.to_string()
        } else {
            let tail: Vec<String> = args.iter().map(|t| t.codename()).collect();
            format!("{}_{}", name, tail.join("_"))
        };
        if let Some(token) = self.usedbuiltins.get(&key) {
            return token.clone();
        }
        // Reserve the key first so recursive helper graphs terminate
        self.usedbuiltins.insert(key.clone(), key.clone());
        let token = c_builtins::generate(self, name, args);
        self.usedbuiltins.insert(key.clone(), token.clone());
        token
    }

    /// Define an object-like or function-like macro builtin
    pub fn define_builtin_macro(&mut self, name: &str, body: &str, region: Region) {
        match region {
            Region::Directives => {
                if self.emitted_keys.insert(format!("macro:{}", name)) {
                    self.directives.push_str(body);
                }
            }
            Region::Declarations => self.add_declaration(body, name),
        }
    }

    /// Define a declaration-shaped builtin (typedefs, extern decls)
    pub fn define_builtin_decl(&mut self, name: &str, body: &str) {
        self.add_declaration(body, name);
    }

    /// Define a function-shaped builtin from its pieces
    pub fn define_function_builtin(
        &mut self,
        name: &str,
        qualifiers: &str,
        ret: &str,
        params: &str,
        body: &str,
    ) {
        let decl = format!("{} {} {}{};\n", qualifiers, ret, name, params);
        self.add_declaration(&decl, name);
        let def = format!("{} {} {}{} {}\n", qualifiers, ret, name, params, body);
        self.add_definition(&def, name);
    }

    pub fn nochecks(&self) -> bool {
        self.ctx.pragmas.nochecks()
    }

    pub fn noabort(&self) -> bool {
        self.ctx.pragmas.noabort()
    }

    // ========================================================================
    // Types
    // ========================================================================

    /// The C type name for a Skarn type, emitting supporting typedefs on
    /// first use
    pub fn ctype(&mut self, ty: &TypeRef) -> String {
        match &**ty {
            Type::Int(k) => {
                self.ensure_include("<stdint.h>");
                if k.ptr_sized {
                    if k.signed { "intptr_t".into() } else { "uintptr_t".into() }
                } else if k.signed {
                    format!("int{}_t", k.bits)
                } else {
                    format!("uint{}_t", k.bits)
                }
            }
            Type::Float { bits: 32 } => "float".into(),
            Type::Float { bits: 64 } => "double".into(),
            Type::Float { .. } => "long double".into(),
            Type::Boolean => {
                self.ensure_include("<stdbool.h>");
                "bool".into()
            }
            Type::StringView => self.ensure_builtin("stringview_type", &[]),
            Type::CString => "char*".into(),
            Type::Void | Type::Niltype | Type::Nilptr => "void".into(),
            Type::Pointer(None) => "void*".into(),
            Type::Pointer(Some(elem)) => format!("{}*", self.ctype(elem)),
            Type::Array { elem, len } => {
                let elem_c = self.ctype(elem);
                let name = format!("sk_{}", ty.codename());
                let decl = format!("typedef struct {} {{ {} v[{}]; }} {};\n", name, elem_c, len, name);
                self.add_declaration(&decl, &name);
                name
            }
            Type::Record(c) => {
                let name = format!("sk_{}", c.codename);
                if !self.emitted_keys.contains(&format!("decl:{}", name)) {
                    let mut body = String::new();
                    for field in &c.fields {
                        let fc = self.ctype(&field.ty);
                        let _ = writeln!(body, "  {} {};", fc, c_name(&field.name));
                    }
                    let decl = format!("typedef struct {} {{\n{}}} {};\n", name, body, name);
                    self.add_declaration(&decl, &name);
                }
                name
            }
            Type::Union(c) => {
                let name = format!("sk_{}", c.codename);
                if !self.emitted_keys.contains(&format!("decl:{}", name)) {
                    let mut body = String::new();
                    for field in &c.fields {
                        let fc = self.ctype(&field.ty);
                        let _ = writeln!(body, "  {} {};", fc, c_name(&field.name));
                    }
                    let decl = format!("typedef union {} {{\n{}}} {};\n", name, body, name);
                    self.add_declaration(&decl, &name);
                }
                name
            }
            Type::Enum { codename, subtype, .. } => {
                let sub = self.ctype(subtype);
                let name = format!("sk_{}", codename);
                let decl = format!("typedef {} {};\n", sub, name);
                self.add_declaration(&decl, &name);
                name
            }
            Type::Function { args, rets } => {
                let ret = rets
                    .first()
                    .map(|r| self.ctype(r))
                    .unwrap_or_else(|| "void".into());
                let params: Vec<String> = args.iter().map(|a| self.ctype(a)).collect();
                let name = format!("sk_{}", ty.codename());
                let decl = format!(
                    "typedef {} (*{})({});\n",
                    ret,
                    name,
                    if params.is_empty() { "void".into() } else { params.join(", ") }
                );
                self.add_declaration(&decl, &name);
                name
            }
            Type::TypeType | Type::Auto => "void".into(),
        }
    }

    // ========================================================================
    // Unit assembly
    // ========================================================================

    pub fn generate(&mut self, root: &NodeRef) -> Result<String, GenerateError> {
        self.ensure_builtin("likely", &[]);
        self.ensure_builtin("unlikely", &[]);
        for include in self.ctx.pragmas.cincludes().to_vec() {
            self.ensure_include(&include);
        }

        let mut body = String::new();
        let stmts = root.borrow().slot_list(0);
        for stmt in &stmts {
            self.emit_stmt(&stmt.clone(), 1, &mut body)?;
        }

        let mut out = String::new();
        out.push_str("/* Generated by the Skarn compiler. DO NOT EDIT. */\n");
        out.push_str(&self.directives);
        out.push('\n');
        if !self.declarations.is_empty() {
            out.push_str(&self.declarations);
            out.push('\n');
        }
        if !self.definitions.is_empty() {
            out.push_str(&self.definitions);
            out.push('\n');
        }
        if !self.is_lib {
            out.push_str("int main(int argc, char** argv) {\n");
            out.push_str("  (void)argc; (void)argv;\n");
            out.push_str(&body);
            out.push_str("  return 0;\n}\n");
        } else if !body.is_empty() {
            // Library builds hoist top-level statements into an init function
            let mut init = String::from("void sk_init(void) {\n");
            init.push_str(&body);
            init.push_str("}\n");
            self.add_declaration("void sk_init(void);\n", "sk_init");
            out.push_str(&init);
        }
        Ok(out)
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn pad(indent: usize) -> String {
        "  ".repeat(indent)
    }

    fn emit_stmt(
        &mut self,
        node: &NodeRef,
        indent: usize,
        out: &mut String,
    ) -> Result<(), GenerateError> {
        let tag = node.borrow().tag;
        let pad = Self::pad(indent);
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
                let (name, ty) = {
                    let i = iddecl.borrow();
                    (i.slot_str(0).unwrap_or_default(), i.attrs.ty.clone())
                };
                let ty = match ty {
                    Some(t) if !t.is_comptime_only() => t,
                    // Type aliases and other comptime-only declarations
                    // produce no runtime code
                    _ => return Ok(()),
                };
                let cty = self.ctype(&ty);
                match value {
                    Some(v) => {
                        let init = self.emit_expr(&v)?;
                        let _ = writeln!(out, "{}{} {} = {};", pad, cty, c_name(&name), init);
                    }
                    None => {
                        let _ = writeln!(out, "{}{} {} = {{0}};", pad, cty, c_name(&name));
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
                    let _ = writeln!(out, "{}{} = {};", pad, lhs, rhs);
                }
                Ok(())
            }
            Tag::FuncDef => self.emit_funcdef(node),
            Tag::Call => {
                // `require` inlines at the use site; everything else is a
                // plain expression statement
                let requirename = node.borrow().attrs.requirename.clone();
                if requirename.is_some() {
                    return self.emit_require(node, indent, out);
                }
                let call = self.emit_expr(node)?;
                if !call.is_empty() {
                    let _ = writeln!(out, "{}{};", pad, call);
                }
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
                        Some(c) => self.emit_cond(&c)?,
                        None => "0".into(),
                    };
                    if i == 0 {
                        let _ = writeln!(out, "{}if({}) {{", pad, cond);
                    } else {
                        let _ = writeln!(out, "{}}} else if({}) {{", pad, cond);
                    }
                    if let Some(block) = block {
                        self.emit_block(&block, indent + 1, out)?;
                    }
                }
                if let Some(block) = else_block {
                    let _ = writeln!(out, "{}}} else {{", pad);
                    self.emit_block(&block, indent + 1, out)?;
                }
                let _ = writeln!(out, "{}}}", pad);
                Ok(())
            }
            Tag::While => {
                let (cond, block) = {
                    let n = node.borrow();
                    (n.slot_node(0), n.slot_node(1))
                };
                let cond = match cond {
                    Some(c) => self.emit_cond(&c)?,
                    None => "0".into(),
                };
                let _ = writeln!(out, "{}while({}) {{", pad, cond);
                if let Some(block) = block {
                    self.emit_block(&block, indent + 1, out)?;
                }
                let _ = writeln!(out, "{}}}", pad);
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
                let iddecl = match iddecl {
                    Some(i) => i,
                    None => return Ok(()),
                };
                let (name, ty) = {
                    let i = iddecl.borrow();
                    (i.slot_str(0).unwrap_or_default(), i.attrs.ty.clone())
                };
                let ty = ty.unwrap_or_else(|| self.ctx.types.int64.clone());
                let cty = self.ctype(&ty);
                let name = c_name(&name);
                let start = match start {
                    Some(s) => self.emit_expr(&s)?,
                    None => "0".into(),
                };
                let limit = match limit {
                    Some(l) => self.emit_expr(&l)?,
                    None => "0".into(),
                };
                let step_value = step.as_ref().and_then(|s| s.borrow().attrs.value.clone());
                let step_text = match &step {
                    Some(s) => self.emit_expr(s)?,
                    None => "1".into(),
                };
                let cond = match (&step_value, &step) {
                    (Some(Value::Int(v)), _) if *v < 0 => format!("{} >= _limit", name),
                    (Some(Value::Int(_)), _) | (_, None) => format!("{} <= _limit", name),
                    _ => format!("(_step >= 0 ? {n} <= _limit : {n} >= _limit)", n = name),
                };
                let _ = writeln!(out, "{}{{", pad);
                let inner = Self::pad(indent + 1);
                let _ = writeln!(out, "{}{} _limit = {};", inner, cty, limit);
                let _ = writeln!(out, "{}{} _step = {};", inner, cty, step_text);
                let _ = writeln!(
                    out,
                    "{}for({} {} = {}; {}; {} += _step) {{",
                    inner, cty, name, start, cond, name
                );
                if let Some(block) = block {
                    self.emit_block(&block, indent + 2, out)?;
                }
                let _ = writeln!(out, "{}}}", inner);
                let _ = writeln!(out, "{}}}", pad);
                Ok(())
            }
            Tag::Do => {
                let block = node.borrow().slot_node(0);
                if let Some(block) = block {
                    let _ = writeln!(out, "{}{{", pad);
                    self.emit_block(&block, indent + 1, out)?;
                    let _ = writeln!(out, "{}}}", pad);
                }
                Ok(())
            }
            Tag::Return => {
                let value = node.borrow().slot_node(0);
                match value {
                    Some(v) => {
                        let text = self.emit_expr(&v)?;
                        let _ = writeln!(out, "{}return {};", pad, text);
                    }
                    None => {
                        let _ = writeln!(out, "{}return;", pad);
                    }
                }
                Ok(())
            }
            Tag::Break => {
                let _ = writeln!(out, "{}break;", pad);
                Ok(())
            }
            // Consumed during analysis
            Tag::PragmaCall | Tag::Preprocess => Ok(()),
            _ => Ok(()),
        }
    }

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

    /// `require` inlines the loaded module in a braced section; when the
    /// module produced no output the emit position is rolled back
    fn emit_require(
        &mut self,
        node: &NodeRef,
        indent: usize,
        out: &mut String,
    ) -> Result<(), GenerateError> {
        let (name, loaded, already) = {
            let n = node.borrow();
            (
                n.attrs.requirename.clone().unwrap_or_default(),
                n.attrs.loadedast.clone(),
                n.attrs.alreadyrequired,
            )
        };
        if already {
            return Ok(());
        }
        let loaded = match loaded {
            Some(l) => l,
            None => return Ok(()),
        };
        let rollback = out.len();
        let pad = Self::pad(indent);
        let _ = writeln!(out, "{}{{ /* require '{}' */", pad, name);
        let body_start = out.len();
        self.emit_block(&loaded, indent + 1, out)?;
        if out.len() == body_start {
            out.truncate(rollback);
        } else {
            let _ = writeln!(out, "{}}}", pad);
        }
        Ok(())
    }

    fn emit_funcdef(&mut self, node: &NodeRef) -> Result<(), GenerateError> {
        let (name, params, block, ty, id) = {
            let n = node.borrow();
            (
                n.slot_str(1).unwrap_or_default(),
                n.slot_list(2),
                n.slot_node(4),
                n.attrs.ty.clone(),
                n.id,
            )
        };
        let ty = match ty {
            Some(t) => t,
            // Polymorphic definitions emit per instance, not here
            None => return Ok(()),
        };
        let cname = self.fresh_func_name(&name, id);
        self.emit_function_with(&cname, &params, &block, &ty)
    }

    fn fresh_func_name(&mut self, name: &str, id: usize) -> String {
        let base = c_name(name);
        let cname = if self.used_names.insert(base.clone()) {
            base
        } else {
            format!("{}_{}", base, id)
        };
        self.func_names.insert(id, cname.clone());
        cname
    }

    fn emit_function_with(
        &mut self,
        cname: &str,
        params: &[NodeRef],
        block: &Option<NodeRef>,
        ty: &TypeRef,
    ) -> Result<(), GenerateError> {
        let (arg_types, ret) = match &**ty {
            Type::Function { args, rets } => (
                args.clone(),
                rets.first()
                    .cloned()
                    .unwrap_or_else(|| self.ctx.types.void.clone()),
            ),
            _ => return Ok(()),
        };
        let ret_c = self.ctype(&ret);
        let mut sig_params = Vec::new();
        for (param, pty) in params.iter().zip(&arg_types) {
            let pname = param.borrow().slot_str(0).unwrap_or_default();
            let pc = self.ctype(pty);
            sig_params.push(format!("{} {}", pc, c_name(&pname)));
        }
        let sig = if sig_params.is_empty() {
            "void".to_string()
        } else {
            sig_params.join(", ")
        };
        self.add_declaration(
            &format!("static {} {}({});\n", ret_c, cname, sig),
            &format!("fn:{}", cname),
        );
        let mut body = String::new();
        if let Some(block) = block {
            self.emit_block(block, 1, &mut body)?;
        }
        let def = format!("static {} {}({}) {{\n{}}}\n", ret_c, cname, sig, body);
        self.add_definition(&def, &format!("fn:{}", cname));
        Ok(())
    }

    fn ensure_poly_instance(&mut self, index: usize) -> Result<String, GenerateError> {
        let (name, node, ty) = {
            let instance = self
                .ctx
                .poly_instances
                .get(index)
                .ok_or_else(|| GenerateError::Internal("missing poly instance".into()))?;
            (instance.name.clone(), instance.node.clone(), instance.ty.clone())
        };
        if self.emitted_polys.insert(index) {
            let (params, block) = {
                let n = node.borrow();
                (n.slot_list(2), n.slot_node(4))
            };
            let cname = c_name(&name);
            self.emit_function_with(&cname, &params, &block, &ty)?;
        }
        Ok(c_name(&name))
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    /// Emit a boolean-usable condition from a typed expression
    fn emit_cond(&mut self, node: &NodeRef) -> Result<String, GenerateError> {
        let text = self.emit_expr(node)?;
        let ty = node.borrow().attrs.ty.clone();
        Ok(match ty.as_deref() {
            Some(Type::Boolean) | None => text,
            Some(Type::Pointer(_)) | Some(Type::Nilptr) => format!("({} != NULL)", text),
            _ => format!("({} != 0)", text),
        })
    }

    pub fn emit_expr(&mut self, node: &NodeRef) -> Result<String, GenerateError> {
        // Compile-time constants are emitted directly as literals
        if let Some(text) = self.const_literal(node) {
            return Ok(text);
        }
        let tag = node.borrow().tag;
        let text = match tag {
            Tag::Id => {
                let name = node.borrow().slot_str(0).unwrap_or_default();
                // Functions may have been renamed for C uniqueness
                let symbol_node = node
                    .borrow()
                    .attrs
                    .get_flag("symbol_node")
                    .and_then(|v| v.as_int());
                match symbol_node
                    .and_then(|id| self.func_names.get(&(id as usize)).cloned())
                {
                    Some(cname) => cname,
                    None => c_name(&name),
                }
            }
            Tag::Paren => {
                let inner = node.borrow().slot_node(0);
                match inner {
                    Some(inner) => format!("({})", self.emit_expr(&inner)?),
                    None => "0".into(),
                }
            }
            Tag::UnaryOp => self.emit_unary(node)?,
            Tag::BinaryOp => self.emit_binary(node)?,
            Tag::Call => self.emit_call(node)?,
            Tag::DotIndex => {
                let (name, obj) = {
                    let n = node.borrow();
                    (n.slot_str(0).unwrap_or_default(), n.slot_node(1))
                };
                let obj = obj.ok_or_else(|| GenerateError::Internal("missing object".into()))?;
                let is_ptr = obj
                    .borrow()
                    .attrs
                    .ty
                    .as_deref()
                    .map(|t| matches!(t, Type::Pointer(_)))
                    .unwrap_or(false);
                let obj_text = self.emit_expr(&obj)?;
                if is_ptr {
                    format!("{}->{}", obj_text, c_name(&name))
                } else {
                    format!("{}.{}", obj_text, c_name(&name))
                }
            }
            Tag::KeyIndex => self.emit_key_index(node)?,
            Tag::InitList => self.emit_init_list(node)?,
            _ => "0".into(),
        };
        Ok(self.apply_autoconvert(node, text))
    }

    /// Implicit conversions recorded by the analyzer become helper calls or
    /// casts at the use site
    fn apply_autoconvert(&mut self, node: &NodeRef, text: String) -> String {
        let (src, dst) = {
            let n = node.borrow();
            let dst = match n.attrs.get_flag("autoconvert") {
                Some(Value::Type(t)) => t.clone(),
                _ => return text,
            };
            let src = match &n.attrs.ty {
                Some(t) => t.clone(),
                None => return text,
            };
            (src, dst)
        };
        match (&*src, &*dst) {
            (Type::StringView, Type::CString) => {
                // The checked variant panics on non-null-terminated views
                let name = if self.nochecks() {
                    "string2cstring"
                } else {
                    "assert_string2cstring"
                };
                let token = self.ensure_builtin(name, &[]);
                format!("{}({})", token, text)
            }
            (Type::CString, Type::StringView) => {
                let token = self.ensure_builtin("cstring2string", &[]);
                format!("{}({})", token, text)
            }
            (a, b) if *a == *b => text,
            (_, Type::Pointer(_)) | (_, Type::Nilptr) => text,
            _ => {
                let cty = self.ctype(&dst);
                format!("(({})({}))", cty, text)
            }
        }
    }

    fn const_literal(&mut self, node: &NodeRef) -> Option<String> {
        let (value, ty, autoconvert) = {
            let n = node.borrow();
            if !n.attrs.comptime {
                return None;
            }
            let autoconvert = match n.attrs.get_flag("autoconvert") {
                Some(Value::Type(t)) => Some(t.clone()),
                _ => None,
            };
            (n.attrs.value.clone()?, n.attrs.ty.clone()?, autoconvert)
        };
        let target = autoconvert.unwrap_or(ty);
        Some(self.literal(&value, &target))
    }

    /// Emit a constant as a C literal of a concrete type
    pub fn literal(&mut self, value: &Value, ty: &TypeRef) -> String {
        match (value, &**ty) {
            (Value::Int(v), Type::Float { .. }) => self.literal(&Value::Float(*v as f64), ty),
            (Value::Int(v), _) => int_literal(*v, ty),
            (Value::Float(v), Type::Float { bits: 32 }) => format!("{:?}f", v),
            (Value::Float(v), _) => format!("{:?}", v),
            (Value::Bool(b), _) => {
                self.ensure_include("<stdbool.h>");
                if *b { "true".into() } else { "false".into() }
            }
            (Value::Str(s), Type::CString) => c_string_literal(s),
            (Value::Str(s), _) => {
                let sv = self.ensure_builtin("stringview_type", &[]);
                format!(
                    "({}){{(uint8_t*){}, {}}}",
                    sv,
                    c_string_literal(s),
                    s.len()
                )
            }
            (Value::Nil, _) => "0".into(),
            (Value::Type(_), _) => "0".into(),
        }
    }

    fn emit_unary(&mut self, node: &NodeRef) -> Result<String, GenerateError> {
        let (op, operand) = {
            let n = node.borrow();
            (n.slot_str(0).unwrap_or_default(), n.slot_node(1))
        };
        let operand = operand.ok_or_else(|| GenerateError::Internal("missing operand".into()))?;
        let otype = operand.borrow().attrs.ty.clone();
        let text = self.emit_expr(&operand)?;
        let result = match op.as_str() {
            "not" => {
                let cond = match otype.as_deref() {
                    Some(Type::Boolean) | None => text,
                    Some(Type::Pointer(_)) => format!("({} != NULL)", text),
                    _ => format!("({} != 0)", text),
                };
                format!("(!{})", cond)
            }
            "unm" => format!("(-{})", text),
            "bnot" => format!("(~{})", text),
            "len" => format!("((intptr_t)({}).size)", text),
            "ref" => format!("(&{})", text),
            "deref" => {
                let elem = node.borrow().attrs.ty.clone();
                let elem_c = match elem {
                    Some(t) => self.ctype(&t),
                    None => "void".into(),
                };
                if self.nochecks() {
                    format!("(*({}))", text)
                } else {
                    let token = self.ensure_builtin("assert_deref", &[]);
                    format!("(*(({}*){}({})))", elem_c, token, text)
                }
            }
            _ => text,
        };
        Ok(result)
    }

    fn emit_binary(&mut self, node: &NodeRef) -> Result<String, GenerateError> {
        let (op, lhs, rhs) = {
            let n = node.borrow();
            (n.slot_str(0).unwrap_or_default(), n.slot_node(1), n.slot_node(2))
        };
        let (lhs, rhs) = match (lhs, rhs) {
            (Some(l), Some(r)) => (l, r),
            _ => return Err(GenerateError::Internal("missing operand".into())),
        };
        let ltype = lhs.borrow().attrs.ty.clone();
        let rtype = rhs.borrow().attrs.ty.clone();
        let result_ty = node.borrow().attrs.ty.clone();
        let ltext = self.emit_expr(&lhs)?;
        let rtext = self.emit_expr(&rhs)?;

        let (ltype, rtype) = match (ltype, rtype) {
            (Some(l), Some(r)) => (l, r),
            _ => return Ok(format!("({} /*?*/ {})", ltext, rtext)),
        };

        let text = match op.as_str() {
            "add" | "sub" | "mul" => {
                let ty = result_ty.unwrap_or_else(|| self.ctx.types.int64.clone());
                let cty = self.ctype(&ty);
                let cop = match op.as_str() {
                    "add" => "+",
                    "sub" => "-",
                    _ => "*",
                };
                format!("(({c})({l}) {op} ({c})({r}))", c = cty, l = ltext, op = cop, r = rtext)
            }
            "div" => {
                let ty = result_ty.unwrap_or_else(|| self.ctx.types.float64.clone());
                let cty = self.ctype(&ty);
                format!("(({c})({l}) / ({c})({r}))", c = cty, l = ltext, r = rtext)
            }
            "idiv" => {
                let ty = result_ty.unwrap_or_else(|| self.ctx.types.int64.clone());
                if ty.is_float() {
                    self.ensure_include("<math.h>");
                    let cty = self.ctype(&ty);
                    format!("floor(({c})({l}) / ({c})({r}))", c = cty, l = ltext, r = rtext)
                } else {
                    let token = self.ensure_builtin("idiv", &[ty]);
                    format!("{}({}, {})", token, ltext, rtext)
                }
            }
            "mod" => {
                let ty = result_ty.unwrap_or_else(|| self.ctx.types.int64.clone());
                if ty.is_float() {
                    let token = self.ensure_builtin("fmod", &[ty]);
                    format!("{}({}, {})", token, ltext, rtext)
                } else {
                    let token = self.ensure_builtin("imod", &[ty]);
                    format!("{}({}, {})", token, ltext, rtext)
                }
            }
            "eq" | "ne" => {
                let base = self.emit_equality(&ltype, &rtype, &ltext, &rtext)?;
                if op == "ne" {
                    format!("(!{})", base)
                } else {
                    base
                }
            }
            "lt" | "le" | "gt" | "ge" => self.emit_ordering(&op, &ltype, &rtype, &ltext, &rtext),
            "and" | "or" => {
                let result = result_ty.unwrap_or_else(|| self.ctx.types.boolean.clone());
                if matches!(*result, Type::Boolean) {
                    let l = cond_text(&ltype, &ltext);
                    let r = cond_text(&rtype, &rtext);
                    let cop = if op == "and" { "&&" } else { "||" };
                    format!("({} {} {})", l, cop, r)
                } else {
                    // Lua value-selecting semantics
                    let l = cond_text(&ltype, &ltext);
                    if op == "and" {
                        format!("({} ? ({}) : ({}))", l, rtext, ltext)
                    } else {
                        format!("({} ? ({}) : ({}))", l, ltext, rtext)
                    }
                }
            }
            "band" | "bor" | "bxor" => {
                let cop = match op.as_str() {
                    "band" => "&",
                    "bor" => "|",
                    _ => "^",
                };
                let ty = result_ty.unwrap_or_else(|| self.ctx.types.int64.clone());
                let cty = self.ctype(&ty);
                format!("(({c})({l}) {op} ({c})({r}))", c = cty, l = ltext, op = cop, r = rtext)
            }
            "shl" | "shr" | "asr" => self.emit_shift(&op, &ltype, &rhs, &ltext, &rtext)?,
            "concat" => ltext, // folded at analysis time; unreachable otherwise
            _ => format!("({} /*{}*/ {})", ltext, op, rtext),
        };
        Ok(text)
    }

    fn emit_equality(
        &mut self,
        ltype: &TypeRef,
        rtype: &TypeRef,
        ltext: &str,
        rtext: &str,
    ) -> Result<String, GenerateError> {
        match (&**ltype, &**rtype) {
            (Type::StringView, Type::StringView) => {
                let token = self.ensure_builtin("stringview_eq", &[]);
                Ok(format!("{}({}, {})", token, ltext, rtext))
            }
            (Type::Record(_), Type::Record(_)) | (Type::Union(_), Type::Union(_)) => {
                let token = self.ensure_builtin("eq", &[ltype.clone()]);
                Ok(format!("{}({}, {})", token, ltext, rtext))
            }
            (a, b) if a.is_integral() && b.is_integral() && a.is_signed() != b.is_signed() => {
                let token = self.ensure_builtin("eq_cross", &[ltype.clone(), rtype.clone()]);
                Ok(format!("{}({}, {})", token, ltext, rtext))
            }
            _ => Ok(format!("({} == {})", ltext, rtext)),
        }
    }

    fn emit_ordering(
        &mut self,
        op: &str,
        ltype: &TypeRef,
        rtype: &TypeRef,
        ltext: &str,
        rtext: &str,
    ) -> String {
        let cross = ltype.is_integral()
            && rtype.is_integral()
            && ltype.is_signed() != rtype.is_signed();
        if cross {
            // All four orderings reduce to the cross-sign less-than
            let (a, b, at, bt, negate) = match op {
                "lt" => (ltext, rtext, ltype, rtype, false),
                "gt" => (rtext, ltext, rtype, ltype, false),
                "le" => (rtext, ltext, rtype, ltype, true),
                _ => (ltext, rtext, ltype, rtype, true),
            };
            let token = self.ensure_builtin("lt_cross", &[at.clone(), bt.clone()]);
            let call = format!("{}({}, {})", token, a, b);
            if negate {
                format!("(!{})", call)
            } else {
                call
            }
        } else {
            let cop = match op {
                "lt" => "<",
                "le" => "<=",
                "gt" => ">",
                _ => ">=",
            };
            format!("({} {} {})", ltext, cop, rtext)
        }
    }

    fn emit_shift(
        &mut self,
        op: &str,
        ltype: &TypeRef,
        rhs: &NodeRef,
        ltext: &str,
        rtext: &str,
    ) -> Result<String, GenerateError> {
        let bits = ltype.bitsize().unwrap_or(64) as i128;
        let shift_const = rhs.borrow().attrs.value.clone().and_then(|v| v.as_int());
        // A constant in-range count elides the helper and uses a direct C
        // shift, with an unsigned cast to sidestep UB on signed operands
        if let Some(b) = shift_const {
            if b >= 0 && b < bits {
                let cty = self.ctype(ltype);
                let unsigned = self
                    .ctx
                    .types
                    .unsigned_type(ltype)
                    .unwrap_or_else(|| ltype.clone());
                let ucty = self.ctype(&unsigned);
                return Ok(match op {
                    "shl" => format!("(({})(({})({}) << {}))", cty, ucty, ltext, b),
                    "shr" => format!("(({})(({})({}) >> {}))", cty, ucty, ltext, b),
                    _ => {
                        if ltype.is_signed() {
                            format!("(({}) >> {})", ltext, b)
                        } else {
                            format!("(({})(({})({}) >> {}))", cty, ucty, ltext, b)
                        }
                    }
                });
            }
        }
        let token = self.ensure_builtin(op, &[ltype.clone()]);
        Ok(format!("{}({}, {})", token, ltext, rtext))
    }

    fn emit_key_index(&mut self, node: &NodeRef) -> Result<String, GenerateError> {
        let (index, obj) = {
            let n = node.borrow();
            (n.slot_node(0), n.slot_node(1))
        };
        let (index, obj) = match (index, obj) {
            (Some(i), Some(o)) => (i, o),
            _ => return Err(GenerateError::Internal("missing index".into())),
        };
        let otype = obj.borrow().attrs.ty.clone();
        let itype = index.borrow().attrs.ty.clone();
        let iconst = index.borrow().attrs.value.clone().and_then(|v| v.as_int());
        let obj_text = self.emit_expr(&obj)?;
        let index_text = self.emit_expr(&index)?;
        let (accessor, len) = match otype.as_deref() {
            Some(Type::Array { len, .. }) => (format!("{}.v", obj_text), Some(*len)),
            Some(Type::Pointer(Some(inner))) => match &**inner {
                Type::Array { len, .. } => (format!("{}->v", obj_text), Some(*len)),
                _ => (obj_text.clone(), None),
            },
            _ => (obj_text.clone(), None),
        };
        // Constant indexes verified during analysis skip the runtime check
        let checked = match len {
            Some(len) if !self.nochecks() && iconst.is_none() => {
                let ity = itype.unwrap_or_else(|| self.ctx.types.isize.clone());
                let token = self.ensure_builtin("assert_bounds", &[ity]);
                format!("{}[{}({}, {})]", accessor, token, index_text, len)
            }
            _ => format!("{}[{}]", accessor, index_text),
        };
        Ok(checked)
    }

    fn emit_init_list(&mut self, node: &NodeRef) -> Result<String, GenerateError> {
        let (items, ty) = {
            let n = node.borrow();
            (n.slot_list(0), n.attrs.ty.clone())
        };
        let ty = match ty {
            Some(t) => t,
            None => return Ok("{0}".into()),
        };
        let cty = self.ctype(&ty);
        match &*ty {
            Type::Array { .. } => {
                let mut parts = Vec::new();
                for item in &items {
                    parts.push(self.emit_expr(item)?);
                }
                if parts.is_empty() {
                    Ok(format!("({}){{{{0}}}}", cty))
                } else {
                    Ok(format!("({}){{{{{}}}}}", cty, parts.join(", ")))
                }
            }
            Type::Record(_) | Type::Union(_) => {
                let mut parts = Vec::new();
                for item in &items {
                    let is_pair = item.borrow().tag == Tag::Pair;
                    if is_pair {
                        let (fname, fvalue) = {
                            let p = item.borrow();
                            (p.slot_str(0).unwrap_or_default(), p.slot_node(1))
                        };
                        if let Some(fvalue) = fvalue {
                            let text = self.emit_expr(&fvalue)?;
                            parts.push(format!(".{} = {}", c_name(&fname), text));
                        }
                    } else {
                        parts.push(self.emit_expr(item)?);
                    }
                }
                if parts.is_empty() {
                    Ok(format!("({}){{0}}", cty))
                } else {
                    Ok(format!("({}){{{}}}", cty, parts.join(", ")))
                }
            }
            _ => Ok("{0}".into()),
        }
    }

    fn emit_call(&mut self, node: &NodeRef) -> Result<String, GenerateError> {
        let (args, callee, builtin, poly) = {
            let n = node.borrow();
            (
                n.slot_list(0),
                n.slot_node(1),
                n.attrs.builtin.clone(),
                n.attrs.get_flag("polyinstance").and_then(|v| v.as_int()),
            )
        };
        if let Some(builtin) = builtin {
            return self.emit_builtin_call(node, &builtin, &args);
        }
        if let Some(index) = poly {
            let cname = self.ensure_poly_instance(index as usize)?;
            let mut parts = Vec::new();
            for arg in &args {
                parts.push(self.emit_expr(arg)?);
            }
            return Ok(format!("{}({})", cname, parts.join(", ")));
        }
        let callee = callee.ok_or_else(|| GenerateError::Internal("missing callee".into()))?;
        let callee_text = self.emit_expr(&callee)?;
        let mut parts = Vec::new();
        for arg in &args {
            parts.push(self.emit_expr(arg)?);
        }
        Ok(format!("{}({})", callee_text, parts.join(", ")))
    }

    fn emit_builtin_call(
        &mut self,
        node: &NodeRef,
        builtin: &str,
        args: &[NodeRef],
    ) -> Result<String, GenerateError> {
        match builtin {
            "print" => {
                let mut types = Vec::new();
                for arg in args {
                    let t = arg
                        .borrow()
                        .attrs
                        .ty
                        .clone()
                        .unwrap_or_else(|| self.ctx.types.niltype.clone());
                    types.push(t);
                }
                let token = self.ensure_builtin("print", &types);
                let mut parts = Vec::new();
                for (arg, ty) in args.iter().zip(&types) {
                    // Comptime-only arguments print as fixed text
                    if ty.is_comptime_only() || matches!(**ty, Type::Nilptr) {
                        continue;
                    }
                    parts.push(self.emit_expr(arg)?);
                }
                Ok(format!("{}({})", token, parts.join(", ")))
            }
            "require" => Ok(String::new()),
            "check" if self.nochecks() => Ok(String::new()),
            "assert" | "check" => self.emit_assert_call(node, args),
            "likely" | "unlikely" => {
                let token = self.ensure_builtin(builtin, &[]);
                let arg = match args.first() {
                    Some(a) => self.emit_expr(a)?,
                    None => "0".into(),
                };
                Ok(format!("{}({})", token, arg))
            }
            "panic" | "error" => {
                let arg_ty = args.first().and_then(|a| a.borrow().attrs.ty.clone());
                match arg_ty.as_deref() {
                    Some(Type::CString) => {
                        let token = self.ensure_builtin("panic_cstring", &[]);
                        let arg = self.emit_expr(&args[0])?;
                        Ok(format!("{}({})", token, arg))
                    }
                    Some(_) => {
                        let token = self.ensure_builtin("panic_string", &[]);
                        let arg = self.emit_expr(&args[0])?;
                        Ok(format!("{}({})", token, arg))
                    }
                    None => {
                        let token = self.ensure_builtin("abort", &[]);
                        Ok(format!("{}()", token))
                    }
                }
            }
            "warn" => {
                let token = self.ensure_builtin("warn", &[]);
                let arg = match args.first() {
                    Some(a) => self.emit_expr(a)?,
                    None => "0".into(),
                };
                Ok(format!("{}({})", token, arg))
            }
            "narrow_cast" => {
                let (dst, src) = {
                    let n = node.borrow();
                    let dst = n.attrs.ty.clone();
                    let src = args.first().and_then(|a| a.borrow().attrs.ty.clone());
                    (dst, src)
                };
                let arg = match args.first() {
                    Some(a) => self.emit_expr(a)?,
                    None => "0".into(),
                };
                match (dst, src) {
                    (Some(dst), Some(src)) if !self.nochecks() => {
                        let token = self.ensure_builtin("assert_narrow", &[dst, src]);
                        Ok(format!("{}({})", token, arg))
                    }
                    (Some(dst), _) => {
                        let cty = self.ctype(&dst);
                        Ok(format!("(({})({}))", cty, arg))
                    }
                    _ => Ok(arg),
                }
            }
            _ => {
                // Plain cast resolved at analysis time
                let dst = node.borrow().attrs.ty.clone();
                let arg = match args.first() {
                    Some(a) => self.emit_expr(a)?,
                    None => "0".into(),
                };
                match dst {
                    Some(dst) if !dst.is_comptime_only() => {
                        let cty = self.ctype(&dst);
                        Ok(format!("(({})({}))", cty, arg))
                    }
                    _ => Ok(arg),
                }
            }
        }
    }

    fn emit_assert_call(
        &mut self,
        node: &NodeRef,
        args: &[NodeRef],
    ) -> Result<String, GenerateError> {
        let span = node.borrow().span.clone();
        let (line, column) = self.ctx.source_map.position(span.start);
        let loc = format!("{}:{}:{}: ", self.ctx.filename, line, column);
        match args.len() {
            // A zero-argument assert is an unconditional, non-returning fail
            0 => {
                let token = self.ensure_builtin("assert_fail", &[]);
                Ok(format!("{}({})", token, c_string_literal(&loc)))
            }
            1 => {
                let token = self.ensure_builtin("assert", &[]);
                let cond = self.emit_cond(&args[0])?;
                Ok(format!("{}({}, {})", token, cond, c_string_literal(&loc)))
            }
            _ => {
                let token = self.ensure_builtin("assert_msg", &[]);
                let cond = self.emit_cond(&args[0])?;
                let msg_ty = args[1]
                    .borrow()
                    .attrs
                    .ty
                    .clone()
                    .unwrap_or_else(|| self.ctx.types.stringview.clone());
                let msg = self.emit_expr(&args[1])?;
                let msg = match &*msg_ty {
                    Type::CString => {
                        let token = self.ensure_builtin("cstring2string", &[]);
                        format!("{}({})", token, msg)
                    }
                    _ => msg,
                };
                Ok(format!(
                    "{}({}, {}, {})",
                    token,
                    cond,
                    c_string_literal(&loc),
                    msg
                ))
            }
        }
    }
}

fn cond_text(ty: &TypeRef, text: &str) -> String {
    match &**ty {
        Type::Boolean => text.to_string(),
        Type::Pointer(_) | Type::Nilptr => format!("({} != NULL)", text),
        _ => format!("({} != 0)", text),
    }
}

/// Emit a whole analyzed unit as C
pub fn emit_unit(ctx: &Context, root: &NodeRef, is_lib: bool) -> Result<String, GenerateError> {
    CEmitter::new(ctx, is_lib).generate(root)
}

// ============================================================================
// Literals and names
// ============================================================================

const C_KEYWORDS: &[&str] = &[
    "auto", "break", "case", "char", "const", "continue", "default", "do", "double", "else",
    "enum", "extern", "float", "for", "goto", "if", "inline", "int", "long", "register",
    "restrict", "return", "short", "signed", "sizeof", "static", "struct", "switch", "typedef",
    "union", "unsigned", "void", "volatile", "while", "main",
];

/// Sanitize a source identifier into a C identifier
pub fn c_name(name: &str) -> String {
    if C_KEYWORDS.contains(&name) {
        format!("{}_", name)
    } else {
        name.to_string()
    }
}

fn int_literal(v: i128, ty: &TypeRef) -> String {
    match &**ty {
        Type::Int(k) if !k.signed => {
            if k.bits == 64 || k.ptr_sized {
                format!("UINT64_C({})", v)
            } else {
                format!("{}U", v)
            }
        }
        Type::Int(k) if k.bits == 64 || k.ptr_sized => {
            if v == i64::MIN as i128 {
                // INT64_MIN cannot be written as a plain negative literal
                "(-INT64_C(9223372036854775807)-1)".to_string()
            } else {
                format!("INT64_C({})", v)
            }
        }
        _ => format!("{}", v),
    }
}

fn c_string_literal(s: &str) -> String {
    let mut out = String::from("\"");
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_c_name_escapes_keywords() {
        assert_eq!(c_name("register"), "register_");
        assert_eq!(c_name("value"), "value");
        assert_eq!(c_name("main"), "main_");
    }

    #[test]
    fn test_c_string_literal_escapes() {
        assert_eq!(c_string_literal("a\"b"), "\"a\\\"b\"");
        assert_eq!(c_string_literal("line\n"), "\"line\\n\"");
    }

    #[test]
    fn test_int_literal_forms() {
        let ctx = crate::types::TypeContext::new();
        assert_eq!(int_literal(5, &ctx.int32), "5");
        assert_eq!(int_literal(5, &ctx.int64), "INT64_C(5)");
        assert_eq!(int_literal(5, &ctx.uint64), "UINT64_C(5)");
        assert_eq!(
            int_literal(i64::MIN as i128, &ctx.int64),
            "(-INT64_C(9223372036854775807)-1)"
        );
    }
}

//! The analyzer: symbol resolution, type inference, constant folding
//!
//! A single top-down pass with local second passes on demand. Declarative
//! nodes enter symbols into the current scope; expressive nodes fold child
//! types into a result type and value. Implicit conversions are recorded as
//! node attributes, never as extra AST nodes.
//!
//! Blocks cooperate with the preprocessor: a marker pass flags every block
//! transitively containing a preprocess directive, and flagged blocks are
//! rebuilt by `preprocess::run_block` (which calls back into the analyzer
//! statement by statement) before ordinary analysis resumes.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::ast::{AstBuilder, NodeRef, Slot, SourceMap, Span, Tag};
use crate::errors::{find_similar, Diagnostic, DiagnosticKind};
use crate::parser;
use crate::pragma::Pragmas;
use crate::preprocess::{self, PpValue, PreprocessError};
use crate::scope::{ScopeStack, Symbol};
use crate::types::{Type, TypeContext, TypeRef, Value};

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error("polymorphic function instantiation of '{name}': {source}")]
    PolyInstantiation {
        name: String,
        #[source]
        source: Box<AnalyzeError>,
    },
    #[error("{message}")]
    Fatal { message: String, span: Span },
}

/// A memoized instantiation of a polymorphic function
pub struct PolyInstance {
    /// Mangled emission name
    pub name: String,
    /// Cloned and fully analyzed `FuncDef`
    pub node: NodeRef,
    pub ty: TypeRef,
}

/// Compiler state shared by the analyzer, the preprocessor, and the
/// code generators
pub struct Context {
    pub builder: AstBuilder,
    pub types: TypeContext,
    pub scopes: ScopeStack,
    pub pragmas: Pragmas,
    pub source_map: SourceMap,
    pub filename: String,
    pub diagnostics: Vec<Diagnostic>,
    /// Host defines from `-D`, visible to preprocess code
    pub defines: HashMap<String, Value>,
    /// Preprocess variables, persistent across blocks in one unit
    pub pp_vars: HashMap<String, PpValue>,
    /// Functions registered by `afterinfer`, addressed from PragmaCall nodes
    pub afterinfer_funcs: Vec<PpValue>,
    /// Modules already inlined by `require`
    pub required: HashSet<String>,
    pub search_paths: Vec<String>,
    pub poly_instances: Vec<PolyInstance>,
    poly_memo: HashMap<(usize, String), usize>,
    pub generator: String,
    pub debug_resolve: bool,
    pub debug_scope_resolve: bool,
}

impl Context {
    pub fn new(filename: &str, source: &str) -> Self {
        Self {
            builder: AstBuilder::new(),
            types: TypeContext::new(),
            scopes: ScopeStack::new(),
            pragmas: Pragmas::new(),
            source_map: SourceMap::new(source),
            filename: filename.to_string(),
            diagnostics: Vec::new(),
            defines: HashMap::new(),
            pp_vars: HashMap::new(),
            afterinfer_funcs: Vec::new(),
            required: HashSet::new(),
            search_paths: vec!["./?.skn".to_string()],
            poly_instances: Vec::new(),
            poly_memo: HashMap::new(),
            generator: "c".to_string(),
            debug_resolve: false,
            debug_scope_resolve: false,
        }
    }

    pub fn diag(&mut self, kind: DiagnosticKind, message: impl Into<String>, span: Span) {
        self.diagnostics.push(Diagnostic::new(kind, message, span));
    }

    pub fn has_errors(&self) -> bool {
        !self.diagnostics.is_empty()
    }
}

const LITERAL_SUFFIXES: &[(&str, &str)] = &[
    ("_i8", "int8"),
    ("_i16", "int16"),
    ("_i32", "int32"),
    ("_i64", "int64"),
    ("_u8", "uint8"),
    ("_u16", "uint16"),
    ("_u32", "uint32"),
    ("_u64", "uint64"),
    ("_isize", "isize"),
    ("_usize", "usize"),
    ("_f32", "float32"),
    ("_f64", "float64"),
    ("_f128", "float128"),
];

const BUILTIN_CALLS: &[&str] = &[
    "print", "require", "assert", "check", "likely", "unlikely", "panic", "warn", "error",
];

pub struct Analyzer {
    pub ctx: Context,
    /// Return type slot per function being analyzed (None = still inferring)
    func_rets: Vec<Option<TypeRef>>,
}

impl Analyzer {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            func_rets: Vec::new(),
        }
    }

    /// Analyze a whole unit. Lookup and type failures are batched into
    /// `ctx.diagnostics`; preprocess failures abort with an error.
    pub fn analyze(&mut self, root: &NodeRef) -> Result<(), AnalyzeError> {
        mark_preprocess(root);
        self.visit_block_statements(root)
    }

    // ========================================================================
    // Blocks and the preprocess protocol
    // ========================================================================

    /// Analyze a block's statements in the current scope (the caller owns
    /// scope push/pop). Runs the preprocess rebuild when the block is
    /// marked, then fires `afterinfer` callbacks in registration order.
    pub fn visit_block_statements(&mut self, block: &NodeRef) -> Result<(), AnalyzeError> {
        if block.borrow().attrs.needprocess {
            preprocess::run_block(self, block)?;
        } else {
            let stmts = block.borrow().slot_list(0);
            for stmt in &stmts {
                self.visit_stmt(stmt)?;
            }
        }
        self.run_afterinfer(block)?;
        Ok(())
    }

    fn visit_scoped_block(&mut self, block: &NodeRef, name: &str) -> Result<(), AnalyzeError> {
        self.ctx.scopes.push_scope(name);
        if self.ctx.debug_scope_resolve {
            eprintln!("scope: push {} (depth {})", name, self.ctx.scopes.depth());
        }
        let result = self.visit_block_statements(block);
        // Balance the push on every exit path, including error ones
        let _ = self.ctx.scopes.pop_scope();
        if self.ctx.debug_scope_resolve {
            eprintln!("scope: pop {} (depth {})", name, self.ctx.scopes.depth());
        }
        result
    }

    fn run_afterinfer(&mut self, block: &NodeRef) -> Result<(), AnalyzeError> {
        let stmts = block.borrow().slot_list(0);
        for stmt in &stmts {
            let (is_afterinfer, handle) = {
                let s = stmt.borrow();
                if s.tag == Tag::PragmaCall && s.slot_str(0).as_deref() == Some("afterinfer") {
                    let handle = match s.slots.get(1) {
                        Some(Slot::Int(i)) => *i as usize,
                        _ => continue,
                    };
                    (true, handle)
                } else {
                    (false, 0)
                }
            };
            if is_afterinfer {
                let func = self.ctx.afterinfer_funcs.get(handle).cloned();
                if let Some(func) = func {
                    preprocess::call_function(self, &func, &[], block)?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Statements
    // ========================================================================

    pub fn visit_stmt(&mut self, node: &NodeRef) -> Result<(), AnalyzeError> {
        let tag = node.borrow().tag;
        match tag {
            Tag::LocalDecl => self.visit_local_decl(node),
            Tag::Assign => self.visit_assign(node),
            Tag::FuncDef => self.visit_funcdef(node),
            Tag::Call => {
                self.visit_expr(node)?;
                Ok(())
            }
            Tag::If => self.visit_if(node),
            Tag::While => self.visit_while(node),
            Tag::ForNum => self.visit_fornum(node),
            Tag::Do => {
                let block = node.borrow().slot_node(0);
                match block {
                    Some(block) => self.visit_scoped_block(&block, "do"),
                    None => Ok(()),
                }
            }
            Tag::Return => self.visit_return(node),
            Tag::Break => Ok(()),
            // Scheduled callbacks run after the block's statements are typed
            Tag::PragmaCall => Ok(()),
            // Consumed by the block rebuild; nothing left to do here
            Tag::Preprocess => Ok(()),
            _ => {
                self.visit_expr(node)?;
                Ok(())
            }
        }
    }

    fn visit_local_decl(&mut self, node: &NodeRef) -> Result<(), AnalyzeError> {
        let (iddecl, value) = {
            let n = node.borrow();
            (n.slot_node(0), n.slot_node(1))
        };
        let iddecl = match iddecl {
            Some(i) => i,
            None => return Ok(()),
        };
        let (name, annot, span) = {
            let i = iddecl.borrow();
            (i.slot_str(0), i.slot_node(1), i.span.clone())
        };
        let name = match name {
            Some(n) => n,
            // PreprocessName slots are substituted during the block rebuild
            None => return Ok(()),
        };

        let declared = match annot {
            Some(t) => self.resolve_type_expr(&t, Some(&name)),
            None => None,
        };

        let mut vtype = None;
        let mut vvalue = None;
        if let Some(value) = &value {
            // A type literal initializer names the new type after the local
            if value.borrow().tag == Tag::Type {
                self.visit_type_literal(value, Some(&name));
            } else {
                self.visit_expr_expected(value, declared.as_ref())?;
            }
            let v = value.borrow();
            vtype = v.attrs.ty.clone();
            vvalue = v.attrs.value.clone();
        }

        let ty = match (&declared, &vtype) {
            (Some(d), Some(s)) => {
                if !self.ctx.types.assignable(d, s, vvalue.as_ref()) {
                    self.ctx.diag(
                        DiagnosticKind::Type,
                        format!("no viable conversion from '{}' to '{}'", s, d),
                        span.clone(),
                    );
                } else if **d != **s {
                    if let Some(value) = &value {
                        value
                            .borrow_mut()
                            .attrs
                            .set_flag("autoconvert", Value::Type(d.clone()));
                    }
                }
                Some(d.clone())
            }
            (Some(d), None) => Some(d.clone()),
            (None, Some(s)) => {
                // Type-valued initializers make the local a type alias
                if matches!(**s, Type::TypeType) {
                    Some(s.clone())
                } else if s.is_comptime_only() {
                    self.ctx.diag(
                        DiagnosticKind::Type,
                        format!("cannot declare a variable of type '{}'", s),
                        span.clone(),
                    );
                    None
                } else {
                    Some(s.clone())
                }
            }
            (None, None) => {
                self.ctx.diag(
                    DiagnosticKind::Type,
                    format!("cannot infer the type of variable '{}'", name),
                    span.clone(),
                );
                None
            }
        };

        let mut symbol = Symbol::new(&name, node.borrow().id);
        symbol.ty = ty.clone();
        symbol.lvalue = true;
        // Only comptime-only values ride on the symbol; runtime variables
        // are mutable and must not fold through
        if let Some(Value::Type(t)) = &vvalue {
            symbol.comptime = true;
            symbol.lvalue = false;
            symbol.value = Some(Value::Type(t.clone()));
        }
        if self.ctx.debug_resolve {
            eprintln!(
                "resolve: declare '{}' : {}",
                name,
                ty.as_ref().map(|t| t.name()).unwrap_or_else(|| "?".into())
            );
        }
        if let Err(e) = self.ctx.scopes.declare(symbol) {
            self.ctx
                .diag(DiagnosticKind::Declaration, e.to_string(), span);
        }
        iddecl.borrow_mut().attrs.ty = ty;
        Ok(())
    }

    fn visit_assign(&mut self, node: &NodeRef) -> Result<(), AnalyzeError> {
        let (target, value, span) = {
            let n = node.borrow();
            (n.slot_node(0), n.slot_node(1), n.span.clone())
        };
        let (target, value) = match (target, value) {
            (Some(t), Some(v)) => (t, v),
            _ => return Ok(()),
        };
        self.visit_expr(&target)?;
        let ttype = target.borrow().attrs.ty.clone();
        self.visit_expr_expected(&value, ttype.as_ref())?;
        if !target.borrow().attrs.lvalue {
            self.ctx.diag(
                DiagnosticKind::Type,
                "cannot assign to this expression".to_string(),
                span.clone(),
            );
            return Ok(());
        }
        let vtype = value.borrow().attrs.ty.clone();
        let vvalue = value.borrow().attrs.value.clone();
        if let (Some(d), Some(s)) = (&ttype, &vtype) {
            if !self.ctx.types.assignable(d, s, vvalue.as_ref()) {
                self.ctx.diag(
                    DiagnosticKind::Type,
                    format!("no viable conversion from '{}' to '{}'", s, d),
                    span,
                );
            } else if **d != **s {
                value
                    .borrow_mut()
                    .attrs
                    .set_flag("autoconvert", Value::Type(d.clone()));
            }
        }
        Ok(())
    }

    fn visit_funcdef(&mut self, node: &NodeRef) -> Result<(), AnalyzeError> {
        let (name, params, ret, block, span, id) = {
            let n = node.borrow();
            (
                n.slot_str(1).unwrap_or_default(),
                n.slot_list(2),
                n.slot_node(3),
                n.slot_node(4),
                n.span.clone(),
                n.id,
            )
        };

        // A parameter annotated `auto` makes the function polymorphic: the
        // body is analyzed per call site, not here
        let mut param_types = Vec::new();
        let mut poly = false;
        for param in &params {
            let annot = param.borrow().slot_node(1);
            let ty = match annot {
                Some(t) => self.resolve_type_expr(&t, None),
                None => None,
            };
            match ty {
                Some(t) if matches!(*t, Type::Auto) => {
                    poly = true;
                    param_types.push(self.ctx.types.auto.clone());
                }
                Some(t) => param_types.push(t),
                None => {
                    self.ctx.diag(
                        DiagnosticKind::Type,
                        format!(
                            "parameter '{}' of function '{}' has no type",
                            param.borrow().slot_str(0).unwrap_or_default(),
                            name
                        ),
                        span.clone(),
                    );
                    param_types.push(self.ctx.types.auto.clone());
                    poly = true;
                }
            }
        }

        if poly {
            let mut symbol = Symbol::new(&name, id);
            symbol.poly = true;
            symbol.comptime = true;
            if let Err(e) = self.ctx.scopes.declare(symbol) {
                self.ctx
                    .diag(DiagnosticKind::Declaration, e.to_string(), span);
            }
            return Ok(());
        }

        let declared_ret = match ret {
            Some(r) => self.resolve_type_expr(&r, None),
            None => None,
        };
        let preliminary = self.ctx.types.function(
            param_types.clone(),
            vec![declared_ret
                .clone()
                .unwrap_or_else(|| self.ctx.types.void.clone())],
        );

        // Declared before the body so recursion resolves; an unannotated
        // return type is refined once the body is analyzed
        let mut symbol = Symbol::new(&name, id);
        symbol.ty = Some(preliminary);
        symbol.comptime = true;
        let declared_sym = match self.ctx.scopes.declare(symbol) {
            Ok(s) => Some(s),
            Err(e) => {
                self.ctx
                    .diag(DiagnosticKind::Declaration, e.to_string(), span.clone());
                None
            }
        };

        let inferred =
            self.analyze_function_body(&params, &param_types, declared_ret.clone(), &block)?;
        let final_ret = declared_ret.unwrap_or(inferred);
        let func_ty = self
            .ctx
            .types
            .function(param_types, vec![final_ret]);
        if let Some(sym) = declared_sym {
            sym.borrow_mut().ty = Some(func_ty.clone());
        }
        node.borrow_mut().attrs.ty = Some(func_ty);
        Ok(())
    }

    fn analyze_function_body(
        &mut self,
        params: &[NodeRef],
        param_types: &[TypeRef],
        declared_ret: Option<TypeRef>,
        block: &Option<NodeRef>,
    ) -> Result<TypeRef, AnalyzeError> {
        self.ctx.scopes.push_scope("function");
        self.func_rets.push(declared_ret);
        let result = (|| -> Result<(), AnalyzeError> {
            for (param, ty) in params.iter().zip(param_types) {
                let name = param.borrow().slot_str(0).unwrap_or_default();
                let mut symbol = Symbol::new(&name, param.borrow().id);
                symbol.ty = Some(ty.clone());
                symbol.lvalue = true;
                param.borrow_mut().attrs.ty = Some(ty.clone());
                if let Err(e) = self.ctx.scopes.declare(symbol) {
                    let span = param.borrow().span.clone();
                    self.ctx.diag(DiagnosticKind::Declaration, e.to_string(), span);
                }
            }
            if let Some(block) = block {
                self.visit_block_statements(block)?;
            }
            Ok(())
        })();
        let inferred = self
            .func_rets
            .pop()
            .flatten()
            .unwrap_or_else(|| self.ctx.types.void.clone());
        let _ = self.ctx.scopes.pop_scope();
        result?;
        Ok(inferred)
    }

    fn visit_return(&mut self, node: &NodeRef) -> Result<(), AnalyzeError> {
        let (value, span) = {
            let n = node.borrow();
            (n.slot_node(0), n.span.clone())
        };
        let expected = self.func_rets.last().cloned().flatten();
        let vtype = match &value {
            Some(v) => {
                self.visit_expr_expected(v, expected.as_ref())?;
                v.borrow().attrs.ty.clone()
            }
            None => Some(self.ctx.types.void.clone()),
        };
        match (self.func_rets.last_mut(), vtype) {
            (Some(slot @ None), Some(t)) => *slot = Some(t),
            (Some(Some(declared)), Some(t)) => {
                let declared = declared.clone();
                let vvalue = value.as_ref().and_then(|v| v.borrow().attrs.value.clone());
                if !self.ctx.types.assignable(&declared, &t, vvalue.as_ref()) {
                    self.ctx.diag(
                        DiagnosticKind::Type,
                        format!("invalid return type: no viable conversion from '{}' to '{}'", t, declared),
                        span,
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn visit_if(&mut self, node: &NodeRef) -> Result<(), AnalyzeError> {
        let (clauses, else_block) = {
            let n = node.borrow();
            (n.slot_list(0), n.slot_node(1))
        };
        for clause in &clauses {
            let (cond, block) = {
                let c = clause.borrow();
                (c.slot_node(0), c.slot_node(1))
            };
            if let Some(cond) = cond {
                self.visit_expr(&cond)?;
            }
            if let Some(block) = block {
                self.visit_scoped_block(&block, "if")?;
            }
        }
        if let Some(block) = else_block {
            self.visit_scoped_block(&block, "else")?;
        }
        Ok(())
    }

    fn visit_while(&mut self, node: &NodeRef) -> Result<(), AnalyzeError> {
        let (cond, block) = {
            let n = node.borrow();
            (n.slot_node(0), n.slot_node(1))
        };
        if let Some(cond) = cond {
            self.visit_expr(&cond)?;
        }
        if let Some(block) = block {
            self.visit_scoped_block(&block, "while")?;
        }
        Ok(())
    }

    fn visit_fornum(&mut self, node: &NodeRef) -> Result<(), AnalyzeError> {
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
        let mut bound_ty = None;
        for bound in [&start, &limit, &step].into_iter().flatten() {
            self.visit_expr(bound)?;
            let t = bound.borrow().attrs.ty.clone();
            bound_ty = match (bound_ty, t) {
                (None, t) => t,
                (Some(a), Some(b)) => self.ctx.types.promote(&a, &b).or(Some(a)),
                (prev, None) => prev,
            };
        }
        self.ctx.scopes.push_scope("for");
        let result = (|| -> Result<(), AnalyzeError> {
            if let Some(iddecl) = &iddecl {
                let name = iddecl.borrow().slot_str(0).unwrap_or_default();
                let annot = iddecl.borrow().slot_node(1);
                let ty = match annot {
                    Some(t) => self.resolve_type_expr(&t, None),
                    None => bound_ty.clone(),
                }
                .unwrap_or_else(|| self.ctx.types.int64.clone());
                let mut symbol = Symbol::new(&name, iddecl.borrow().id);
                symbol.ty = Some(ty.clone());
                symbol.lvalue = true;
                iddecl.borrow_mut().attrs.ty = Some(ty);
                if let Err(e) = self.ctx.scopes.declare(symbol) {
                    let span = iddecl.borrow().span.clone();
                    self.ctx.diag(DiagnosticKind::Declaration, e.to_string(), span);
                }
            }
            if let Some(block) = &block {
                self.visit_block_statements(block)?;
            }
            Ok(())
        })();
        let _ = self.ctx.scopes.pop_scope();
        result
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    pub fn visit_expr(&mut self, node: &NodeRef) -> Result<(), AnalyzeError> {
        self.visit_expr_expected(node, None)
    }

    fn visit_expr_expected(
        &mut self,
        node: &NodeRef,
        expected: Option<&TypeRef>,
    ) -> Result<(), AnalyzeError> {
        let tag = node.borrow().tag;
        match tag {
            Tag::Number => self.visit_number(node),
            Tag::String => {
                let mut n = node.borrow_mut();
                n.attrs.ty = Some(self.ctx.types.stringview.clone());
                let value = n.slot_str(0).unwrap_or_default();
                n.attrs.value = Some(Value::Str(value));
                n.attrs.comptime = true;
                Ok(())
            }
            Tag::Boolean => {
                let mut n = node.borrow_mut();
                n.attrs.ty = Some(self.ctx.types.boolean.clone());
                let value = matches!(n.slots.first(), Some(Slot::Bool(true)));
                n.attrs.value = Some(Value::Bool(value));
                n.attrs.comptime = true;
                Ok(())
            }
            Tag::Nil => {
                let mut n = node.borrow_mut();
                n.attrs.ty = Some(self.ctx.types.niltype.clone());
                n.attrs.value = Some(Value::Nil);
                n.attrs.comptime = true;
                Ok(())
            }
            Tag::Nilptr => {
                let mut n = node.borrow_mut();
                n.attrs.ty = Some(self.ctx.types.nilptr.clone());
                n.attrs.comptime = true;
                Ok(())
            }
            Tag::Id => self.visit_id(node),
            Tag::Paren => {
                let inner = node.borrow().slot_node(0);
                if let Some(inner) = inner {
                    self.visit_expr_expected(&inner, expected)?;
                    let attrs = inner.borrow().attrs.clone();
                    let mut n = node.borrow_mut();
                    n.attrs.ty = attrs.ty;
                    n.attrs.value = attrs.value;
                    n.attrs.comptime = attrs.comptime;
                }
                Ok(())
            }
            Tag::UnaryOp => self.visit_unary(node),
            Tag::BinaryOp => self.visit_binary(node),
            Tag::Call => self.visit_call(node),
            Tag::DotIndex => self.visit_dot_index(node),
            Tag::KeyIndex => self.visit_key_index(node),
            Tag::InitList => self.visit_init_list(node, expected),
            Tag::Type => {
                self.visit_type_literal(node, None);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Resolve an `@type` literal, optionally naming the resulting type
    fn visit_type_literal(&mut self, node: &NodeRef, name_hint: Option<&str>) {
        // Spliced type values arrive pre-resolved
        if node.borrow().attrs.value.is_some() {
            return;
        }
        let (type_expr, span) = {
            let n = node.borrow();
            (n.slot_node(0), n.span.clone())
        };
        let ty = type_expr.and_then(|t| self.resolve_type_expr(&t, name_hint));
        {
            let mut n = node.borrow_mut();
            n.attrs.ty = Some(self.ctx.types.typetype.clone());
            n.attrs.comptime = true;
            if let Some(t) = &ty {
                n.attrs.value = Some(Value::Type(t.clone()));
            }
        }
        if ty.is_none() {
            self.ctx.diag(
                DiagnosticKind::Type,
                "invalid type expression".to_string(),
                span,
            );
        }
    }

    fn visit_number(&mut self, node: &NodeRef) -> Result<(), AnalyzeError> {
        let (payload, suffix, span) = {
            let n = node.borrow();
            (n.slots.first().cloned(), n.slot_str(1), n.span.clone())
        };
        let ty = match &suffix {
            Some(s) => match LITERAL_SUFFIXES.iter().find(|(sfx, _)| sfx == s) {
                Some((_, type_name)) => self.ctx.types.primitive(type_name),
                None => {
                    self.ctx.diag(
                        DiagnosticKind::Type,
                        format!("literal suffix '{}' is undefined", s),
                        span.clone(),
                    );
                    None
                }
            },
            None => match &payload {
                Some(Slot::Int(v)) => {
                    let t = self.ctx.types.int_literal_type(*v);
                    if t.is_none() {
                        self.ctx.diag(
                            DiagnosticKind::Type,
                            "number literal is too large".to_string(),
                            span.clone(),
                        );
                    }
                    t
                }
                _ => Some(self.ctx.types.float64.clone()),
            },
        };
        let value = match payload {
            Some(Slot::Int(v)) => {
                if let Some(t) = &ty {
                    if t.is_integral() && !t.fits_int(v) {
                        self.ctx.diag(
                            DiagnosticKind::Type,
                            format!("value {} does not fit in '{}'", v, t),
                            span,
                        );
                    }
                }
                if ty.as_ref().map(|t| t.is_float()).unwrap_or(false) {
                    Some(Value::Float(v as f64))
                } else {
                    Some(Value::Int(v))
                }
            }
            Some(Slot::Float(v)) => Some(Value::Float(v)),
            _ => None,
        };
        let mut n = node.borrow_mut();
        n.attrs.ty = ty;
        n.attrs.value = value;
        n.attrs.comptime = true;
        Ok(())
    }

    fn visit_id(&mut self, node: &NodeRef) -> Result<(), AnalyzeError> {
        let (name, span) = {
            let n = node.borrow();
            (n.slot_str(0).unwrap_or_default(), n.span.clone())
        };
        if let Some(symbol) = self.ctx.scopes.lookup(&name) {
            let sym = symbol.borrow();
            if self.ctx.debug_resolve {
                eprintln!(
                    "resolve: '{}' -> {}",
                    name,
                    sym.ty.as_ref().map(|t| t.name()).unwrap_or_else(|| "?".into())
                );
            }
            let mut n = node.borrow_mut();
            n.attrs.ty = sym.ty.clone().or_else(|| {
                sym.value
                    .as_ref()
                    .filter(|v| matches!(v, Value::Type(_)))
                    .map(|_| self.ctx.types.typetype.clone())
            });
            if sym.comptime {
                n.attrs.value = sym.value.clone();
                n.attrs.comptime = true;
            }
            n.attrs.lvalue = sym.lvalue;
            // Emission resolves renamed functions through the declaring node
            n.attrs
                .set_flag("symbol_node", Value::Int(sym.node_id as i128));
            return Ok(());
        }
        // Primitive type names are usable as expressions of type `type`
        if let Some(t) = self.ctx.types.primitive(&name) {
            let mut n = node.borrow_mut();
            n.attrs.ty = Some(self.ctx.types.typetype.clone());
            n.attrs.value = Some(Value::Type(t));
            n.attrs.comptime = true;
            return Ok(());
        }
        let mut diag = Diagnostic::new(
            DiagnosticKind::Lookup,
            format!("undefined identifier '{}'", name),
            span,
        );
        let visible = self.ctx.scopes.visible_names();
        diag.suggestions = find_similar(&name, visible.iter().map(|s| s.as_str()), 2);
        self.ctx.diagnostics.push(diag);
        Ok(())
    }

    fn visit_unary(&mut self, node: &NodeRef) -> Result<(), AnalyzeError> {
        let (op, operand, span) = {
            let n = node.borrow();
            (n.slot_str(0).unwrap_or_default(), n.slot_node(1), n.span.clone())
        };
        let operand = match operand {
            Some(o) => o,
            None => return Ok(()),
        };
        self.visit_expr(&operand)?;
        let (otype, ovalue, olvalue) = {
            let o = operand.borrow();
            (o.attrs.ty.clone(), o.attrs.value.clone(), o.attrs.lvalue)
        };
        let otype = match otype {
            Some(t) => t,
            None => return Ok(()),
        };

        let mut value = None;
        let mut lvalue = false;
        let ty = match op.as_str() {
            "not" => {
                if let Some(v) = &ovalue {
                    value = Some(Value::Bool(!v.truthy()));
                }
                Some(self.ctx.types.boolean.clone())
            }
            "unm" => {
                if !otype.is_arithmetic() {
                    self.invalid_unary(&op, &otype, span);
                    return Ok(());
                }
                match &ovalue {
                    Some(Value::Int(v)) => value = Some(Value::Int(-v)),
                    Some(Value::Float(v)) => value = Some(Value::Float(-v)),
                    _ => {}
                }
                Some(otype.clone())
            }
            "bnot" => {
                if !otype.is_integral() {
                    self.invalid_unary(&op, &otype, span);
                    return Ok(());
                }
                if let Some(Value::Int(v)) = &ovalue {
                    value = Some(Value::Int(truncate_int(!v, &otype)));
                }
                Some(otype.clone())
            }
            "len" => match &*otype {
                Type::StringView => {
                    if let Some(Value::Str(s)) = &ovalue {
                        value = Some(Value::Int(s.len() as i128));
                    }
                    Some(self.ctx.types.isize.clone())
                }
                Type::Array { len, .. } => {
                    value = Some(Value::Int(*len as i128));
                    Some(self.ctx.types.isize.clone())
                }
                _ => {
                    self.invalid_unary(&op, &otype, span);
                    return Ok(());
                }
            },
            "ref" => {
                if !olvalue {
                    self.ctx.diag(
                        DiagnosticKind::Type,
                        "cannot take the reference of a non-addressable expression".to_string(),
                        span,
                    );
                    return Ok(());
                }
                Some(self.ctx.types.pointer_to(otype.clone()))
            }
            "deref" => match &*otype {
                Type::Pointer(Some(elem)) => {
                    lvalue = true;
                    Some(elem.clone())
                }
                _ => {
                    self.invalid_unary(&op, &otype, span);
                    return Ok(());
                }
            },
            _ => None,
        };

        let comptime = value.is_some();
        let mut n = node.borrow_mut();
        n.attrs.ty = ty;
        n.attrs.value = value;
        n.attrs.comptime = comptime;
        n.attrs.lvalue = lvalue;
        Ok(())
    }

    fn invalid_unary(&mut self, op: &str, ty: &TypeRef, span: Span) {
        self.ctx.diag(
            DiagnosticKind::Type,
            format!("invalid operation '{}' on type '{}'", op, ty),
            span,
        );
    }

    fn visit_binary(&mut self, node: &NodeRef) -> Result<(), AnalyzeError> {
        let (op, lhs, rhs, span) = {
            let n = node.borrow();
            (
                n.slot_str(0).unwrap_or_default(),
                n.slot_node(1),
                n.slot_node(2),
                n.span.clone(),
            )
        };
        let (lhs, rhs) = match (lhs, rhs) {
            (Some(l), Some(r)) => (l, r),
            _ => return Ok(()),
        };
        self.visit_expr(&lhs)?;
        self.visit_expr(&rhs)?;
        let (ltype, lvalue) = {
            let l = lhs.borrow();
            (l.attrs.ty.clone(), l.attrs.value.clone())
        };
        let (rtype, rvalue) = {
            let r = rhs.borrow();
            (r.attrs.ty.clone(), r.attrs.value.clone())
        };
        let (ltype, rtype) = match (ltype, rtype) {
            (Some(l), Some(r)) => (l, r),
            _ => return Ok(()),
        };

        let result = self.binary_result(&op, &ltype, &rtype, &lvalue, &rvalue, &span);
        if let Some((ty, value)) = result {
            let comptime = value.is_some();
            let mut n = node.borrow_mut();
            n.attrs.ty = Some(ty);
            n.attrs.value = value;
            n.attrs.comptime = comptime;
        }
        Ok(())
    }

    fn binary_result(
        &mut self,
        op: &str,
        ltype: &TypeRef,
        rtype: &TypeRef,
        lvalue: &Option<Value>,
        rvalue: &Option<Value>,
        span: &Span,
    ) -> Option<(TypeRef, Option<Value>)> {
        let invalid = |a: &mut Self| {
            a.ctx.diag(
                DiagnosticKind::Type,
                format!(
                    "invalid operation '{}' between types '{}' and '{}'",
                    op, ltype, rtype
                ),
                span.clone(),
            );
            None
        };

        match op {
            "add" | "sub" | "mul" | "idiv" | "mod" => {
                if !ltype.is_arithmetic() || !rtype.is_arithmetic() {
                    return invalid(self);
                }
                let ty = self.ctx.types.promote(ltype, rtype)?;
                let value = self.fold_arith(op, lvalue, rvalue, &ty, span);
                Some((ty, value))
            }
            "div" => {
                if !ltype.is_arithmetic() || !rtype.is_arithmetic() {
                    return invalid(self);
                }
                // `/` always produces a float
                let ty = if ltype.bitsize().unwrap_or(0).max(rtype.bitsize().unwrap_or(0)) > 64 {
                    self.ctx.types.float128.clone()
                } else {
                    self.ctx.types.float64.clone()
                };
                let value = self.fold_arith(op, lvalue, rvalue, &ty, span);
                Some((ty, value))
            }
            "eq" | "ne" => {
                let comparable = self.ctx.types.assignable(ltype, rtype, rvalue.as_ref())
                    || self.ctx.types.assignable(rtype, ltype, lvalue.as_ref())
                    || (ltype.is_arithmetic() && rtype.is_arithmetic());
                if !comparable {
                    return invalid(self);
                }
                let value = fold_compare(op, lvalue, rvalue);
                Some((self.ctx.types.boolean.clone(), value))
            }
            "lt" | "le" | "gt" | "ge" => {
                let ok = (ltype.is_arithmetic() && rtype.is_arithmetic())
                    || (matches!(**ltype, Type::StringView) && matches!(**rtype, Type::StringView));
                if !ok {
                    return invalid(self);
                }
                let value = fold_compare(op, lvalue, rvalue);
                Some((self.ctx.types.boolean.clone(), value))
            }
            "and" | "or" => {
                let ty = if **ltype == **rtype {
                    ltype.clone()
                } else {
                    self.ctx.types.boolean.clone()
                };
                let value = match (op, lvalue, rvalue) {
                    ("and", Some(l), Some(r)) => {
                        Some(if l.truthy() { r.clone() } else { l.clone() })
                    }
                    ("or", Some(l), Some(r)) => {
                        Some(if l.truthy() { l.clone() } else { r.clone() })
                    }
                    _ => None,
                };
                // Mixed-type and/or folds still produce a boolean view
                let value = if matches!(*ty, Type::Boolean) {
                    value.map(|v| Value::Bool(v.truthy()))
                } else {
                    value
                };
                Some((ty, value))
            }
            "band" | "bor" | "bxor" => {
                if !ltype.is_integral() || !rtype.is_integral() {
                    return invalid(self);
                }
                let ty = self.ctx.types.promote(ltype, rtype)?;
                let value = match (lvalue, rvalue) {
                    (Some(Value::Int(a)), Some(Value::Int(b))) => {
                        let v = match op {
                            "band" => a & b,
                            "bor" => a | b,
                            _ => a ^ b,
                        };
                        Some(Value::Int(truncate_int(v, &ty)))
                    }
                    _ => None,
                };
                Some((ty, value))
            }
            "shl" | "shr" | "asr" => {
                if !ltype.is_integral() || !rtype.is_integral() {
                    return invalid(self);
                }
                // Shifts take the left operand's type
                let ty = ltype.clone();
                let value = match (lvalue, rvalue) {
                    (Some(Value::Int(a)), Some(Value::Int(b))) => {
                        Some(Value::Int(fold_shift(op, *a, *b, &ty)))
                    }
                    _ => None,
                };
                Some((ty, value))
            }
            "concat" => {
                if !matches!(**ltype, Type::StringView) || !matches!(**rtype, Type::StringView) {
                    return invalid(self);
                }
                match (lvalue, rvalue) {
                    (Some(Value::Str(a)), Some(Value::Str(b))) => Some((
                        self.ctx.types.stringview.clone(),
                        Some(Value::Str(format!("{}{}", a, b))),
                    )),
                    _ => {
                        self.ctx.diag(
                            DiagnosticKind::Type,
                            "string concatenation is only defined for compile time strings"
                                .to_string(),
                            span.clone(),
                        );
                        None
                    }
                }
            }
            _ => invalid(self),
        }
    }

    fn fold_arith(
        &mut self,
        op: &str,
        lvalue: &Option<Value>,
        rvalue: &Option<Value>,
        ty: &TypeRef,
        span: &Span,
    ) -> Option<Value> {
        if ty.is_float() {
            let a = to_float(lvalue.as_ref()?)?;
            let b = to_float(rvalue.as_ref()?)?;
            let v = match op {
                "add" => a + b,
                "sub" => a - b,
                "mul" => a * b,
                "div" => a / b,
                "idiv" => (a / b).floor(),
                "mod" => a - (a / b).floor() * b,
                _ => return None,
            };
            return Some(Value::Float(v));
        }
        let a = lvalue.as_ref()?.as_int()?;
        let b = rvalue.as_ref()?.as_int()?;
        if matches!(op, "idiv" | "mod") && b == 0 {
            self.ctx.diag(
                DiagnosticKind::Type,
                "division by zero in a compile time expression".to_string(),
                span.clone(),
            );
            return None;
        }
        let v = match op {
            "add" => a.checked_add(b)?,
            "sub" => a.checked_sub(b)?,
            "mul" => a.checked_mul(b)?,
            "idiv" => floor_div(a, b),
            "mod" => a - floor_div(a, b) * b,
            _ => return None,
        };
        Some(Value::Int(truncate_int(v, ty)))
    }

    fn visit_dot_index(&mut self, node: &NodeRef) -> Result<(), AnalyzeError> {
        let (name, obj, span) = {
            let n = node.borrow();
            (n.slot_str(0).unwrap_or_default(), n.slot_node(1), n.span.clone())
        };
        let obj = match obj {
            Some(o) => o,
            None => return Ok(()),
        };
        self.visit_expr(&obj)?;
        let (otype, ovalue, olvalue) = {
            let o = obj.borrow();
            (o.attrs.ty.clone(), o.attrs.value.clone(), o.attrs.lvalue)
        };

        // Enum field access on a type value: `Color.Red`
        if let Some(Value::Type(t)) = &ovalue {
            if let Type::Enum { fields, .. } = &**t {
                if let Some((_, v)) = fields.iter().find(|(n, _)| *n == name) {
                    let mut n = node.borrow_mut();
                    n.attrs.ty = Some(t.clone());
                    n.attrs.value = Some(Value::Int(*v));
                    n.attrs.comptime = true;
                    return Ok(());
                }
                self.ctx.diag(
                    DiagnosticKind::Type,
                    format!("enum '{}' has no field named '{}'", t, name),
                    span,
                );
                return Ok(());
            }
        }

        let otype = match otype {
            Some(t) => t,
            None => return Ok(()),
        };
        let composite = match &*otype {
            Type::Record(c) | Type::Union(c) => Some(c.clone()),
            Type::Pointer(Some(inner)) => match &**inner {
                Type::Record(c) | Type::Union(c) => Some(c.clone()),
                _ => None,
            },
            _ => None,
        };
        match composite.and_then(|c| c.fields.iter().find(|f| f.name == name).map(|f| f.ty.clone()))
        {
            Some(field_ty) => {
                let mut n = node.borrow_mut();
                n.attrs.ty = Some(field_ty);
                n.attrs.lvalue = olvalue || otype.is_pointer();
            }
            None => {
                self.ctx.diag(
                    DiagnosticKind::Type,
                    format!("cannot index field '{}' on type '{}'", name, otype),
                    span,
                );
            }
        }
        Ok(())
    }

    fn visit_key_index(&mut self, node: &NodeRef) -> Result<(), AnalyzeError> {
        let (index, obj, span) = {
            let n = node.borrow();
            (n.slot_node(0), n.slot_node(1), n.span.clone())
        };
        let (index, obj) = match (index, obj) {
            (Some(i), Some(o)) => (i, o),
            _ => return Ok(()),
        };
        self.visit_expr(&index)?;
        self.visit_expr(&obj)?;
        let itype = index.borrow().attrs.ty.clone();
        if let Some(t) = &itype {
            if !t.is_integral() {
                self.ctx.diag(
                    DiagnosticKind::Type,
                    format!("cannot index with a value of type '{}'", t),
                    span.clone(),
                );
                return Ok(());
            }
        }
        let (otype, olvalue) = {
            let o = obj.borrow();
            (o.attrs.ty.clone(), o.attrs.lvalue)
        };
        let otype = match otype {
            Some(t) => t,
            None => return Ok(()),
        };
        match &*otype {
            Type::Array { elem, len } => {
                // A constant index against a known length folds the bounds
                // check at analysis time
                if let Some(Value::Int(i)) = index.borrow().attrs.value.clone() {
                    if i < 0 || (i as u128) >= *len as u128 {
                        self.ctx.diag(
                            DiagnosticKind::Type,
                            format!("array index {} is out of bounds of '{}'", i, otype),
                            span,
                        );
                    }
                }
                let mut n = node.borrow_mut();
                n.attrs.ty = Some(elem.clone());
                n.attrs.lvalue = olvalue;
            }
            Type::Pointer(Some(inner)) => match &**inner {
                Type::Array { elem, .. } => {
                    let mut n = node.borrow_mut();
                    n.attrs.ty = Some(elem.clone());
                    n.attrs.lvalue = true;
                }
                _ => {
                    let mut n = node.borrow_mut();
                    n.attrs.ty = Some((*inner).clone());
                    n.attrs.lvalue = true;
                }
            },
            _ => {
                self.ctx.diag(
                    DiagnosticKind::Type,
                    format!("cannot index a value of type '{}'", otype),
                    span,
                );
            }
        }
        Ok(())
    }

    fn visit_init_list(
        &mut self,
        node: &NodeRef,
        expected: Option<&TypeRef>,
    ) -> Result<(), AnalyzeError> {
        let (items, span) = {
            let n = node.borrow();
            (n.slot_list(0), n.span.clone())
        };
        let expected = match expected {
            Some(t) => t.clone(),
            None => {
                self.ctx.diag(
                    DiagnosticKind::Type,
                    "cannot infer the type of an initializer list here".to_string(),
                    span,
                );
                return Ok(());
            }
        };
        match &*expected {
            Type::Array { elem, len } => {
                if items.len() as u64 > *len {
                    self.ctx.diag(
                        DiagnosticKind::Type,
                        format!("too many initializers for '{}'", expected),
                        span,
                    );
                }
                for item in &items {
                    self.visit_expr_expected(item, Some(elem))?;
                    self.check_assignable(elem, item);
                }
            }
            Type::Record(c) => {
                for (i, item) in items.iter().enumerate() {
                    let is_pair = item.borrow().tag == Tag::Pair;
                    if is_pair {
                        let (fname, fvalue) = {
                            let p = item.borrow();
                            (p.slot_str(0).unwrap_or_default(), p.slot_node(1))
                        };
                        let field = c.fields.iter().find(|f| f.name == fname).cloned();
                        match (field, fvalue) {
                            (Some(field), Some(fvalue)) => {
                                self.visit_expr_expected(&fvalue, Some(&field.ty))?;
                                self.check_assignable(&field.ty, &fvalue);
                            }
                            (None, _) => {
                                let ispan = item.borrow().span.clone();
                                self.ctx.diag(
                                    DiagnosticKind::Type,
                                    format!("record '{}' has no field named '{}'", expected, fname),
                                    ispan,
                                );
                            }
                            _ => {}
                        }
                    } else {
                        match c.fields.get(i).cloned() {
                            Some(field) => {
                                self.visit_expr_expected(item, Some(&field.ty))?;
                                self.check_assignable(&field.ty, item);
                            }
                            None => {
                                let ispan = item.borrow().span.clone();
                                self.ctx.diag(
                                    DiagnosticKind::Type,
                                    format!("too many initializers for '{}'", expected),
                                    ispan,
                                );
                            }
                        }
                    }
                }
            }
            _ => {
                self.ctx.diag(
                    DiagnosticKind::Type,
                    format!("type '{}' cannot be initialized with a list", expected),
                    span,
                );
                return Ok(());
            }
        }
        node.borrow_mut().attrs.ty = Some(expected);
        Ok(())
    }

    fn check_assignable(&mut self, dst: &TypeRef, node: &NodeRef) {
        let (src, value, span) = {
            let n = node.borrow();
            (n.attrs.ty.clone(), n.attrs.value.clone(), n.span.clone())
        };
        if let Some(src) = src {
            if !self.ctx.types.assignable(dst, &src, value.as_ref()) {
                self.ctx.diag(
                    DiagnosticKind::Type,
                    format!("no viable conversion from '{}' to '{}'", src, dst),
                    span,
                );
            } else if **dst != *src {
                node.borrow_mut()
                    .attrs
                    .set_flag("autoconvert", Value::Type(dst.clone()));
            }
        }
    }

    // ========================================================================
    // Calls
    // ========================================================================

    fn visit_call(&mut self, node: &NodeRef) -> Result<(), AnalyzeError> {
        let (args, callee, span) = {
            let n = node.borrow();
            (n.slot_list(0), n.slot_node(1), n.span.clone())
        };
        let callee = match callee {
            Some(c) => c,
            None => return Ok(()),
        };

        // Builtin calls resolve by name unless the name is shadowed
        let callee_name = {
            let c = callee.borrow();
            if c.tag == Tag::Id { c.slot_str(0) } else { None }
        };
        if let Some(name) = &callee_name {
            if BUILTIN_CALLS.contains(&name.as_str()) && self.ctx.scopes.lookup(name).is_none() {
                return self.visit_builtin_call(node, name, &args, span);
            }
        }

        self.visit_expr(&callee)?;
        let (ctype, cvalue) = {
            let c = callee.borrow();
            (c.attrs.ty.clone(), c.attrs.value.clone())
        };

        // A call on a type value is a cast: `(@int8)(x)`
        if let Some(Value::Type(target)) = cvalue {
            return self.visit_cast(node, &target, &args, span);
        }

        // Polymorphic call: instantiate the definition for this tuple
        if let Some(name) = &callee_name {
            let poly = self
                .ctx
                .scopes
                .lookup(name)
                .map(|s| s.borrow().poly)
                .unwrap_or(false);
            if poly {
                return self.visit_poly_call(node, name, &args, span);
            }
        }

        let ctype = match ctype {
            Some(t) => t,
            None => return Ok(()),
        };
        match &*ctype {
            Type::Function { args: want, rets } => {
                if args.len() != want.len() {
                    self.ctx.diag(
                        DiagnosticKind::Type,
                        format!("expected {} arguments but got {}", want.len(), args.len()),
                        span,
                    );
                }
                for (arg, want) in args.iter().zip(want) {
                    self.visit_expr_expected(arg, Some(want))?;
                    self.check_assignable(want, arg);
                }
                for arg in args.iter().skip(want.len()) {
                    self.visit_expr(arg)?;
                }
                let ret = rets
                    .first()
                    .cloned()
                    .unwrap_or_else(|| self.ctx.types.void.clone());
                node.borrow_mut().attrs.ty = Some(ret);
            }
            _ => {
                self.ctx.diag(
                    DiagnosticKind::Type,
                    format!("cannot call a value of type '{}'", ctype),
                    span,
                );
            }
        }
        Ok(())
    }

    fn visit_builtin_call(
        &mut self,
        node: &NodeRef,
        name: &str,
        args: &[NodeRef],
        span: Span,
    ) -> Result<(), AnalyzeError> {
        for arg in args {
            self.visit_expr(arg)?;
        }
        match name {
            "print" => {
                for arg in args {
                    let t = arg.borrow().attrs.ty.clone();
                    if let Some(t) = t {
                        // Records print through their `__tostring` field
                        let printable = match &*t {
                            Type::Record(c) => c.tostring_field().is_some(),
                            Type::Union(_) | Type::Array { .. } => false,
                            _ => true,
                        };
                        if !printable {
                            let aspan = arg.borrow().span.clone();
                            self.ctx.diag(
                                DiagnosticKind::Type,
                                format!("cannot handle type '{}' in print", t),
                                aspan,
                            );
                        }
                    }
                }
                node.borrow_mut().attrs.ty = Some(self.ctx.types.void.clone());
            }
            "require" => {
                self.visit_require(node, args, span)?;
            }
            "assert" | "check" => {
                if args.len() > 2 {
                    self.ctx.diag(
                        DiagnosticKind::Type,
                        format!("'{}' takes at most two arguments", name),
                        span,
                    );
                }
                node.borrow_mut().attrs.ty = Some(self.ctx.types.void.clone());
            }
            "likely" | "unlikely" => {
                if args.len() != 1 {
                    self.ctx.diag(
                        DiagnosticKind::Type,
                        format!("'{}' takes exactly one argument", name),
                        span,
                    );
                }
                node.borrow_mut().attrs.ty = Some(self.ctx.types.boolean.clone());
            }
            "panic" | "error" | "warn" => {
                node.borrow_mut().attrs.ty = Some(self.ctx.types.void.clone());
            }
            _ => {}
        }
        node.borrow_mut().attrs.builtin = Some(name.to_string());
        Ok(())
    }

    fn visit_cast(
        &mut self,
        node: &NodeRef,
        target: &TypeRef,
        args: &[NodeRef],
        span: Span,
    ) -> Result<(), AnalyzeError> {
        if args.len() != 1 {
            self.ctx.diag(
                DiagnosticKind::Type,
                "a type cast takes exactly one argument".to_string(),
                span,
            );
            return Ok(());
        }
        let arg = &args[0];
        self.visit_expr(arg)?;
        let (src, value) = {
            let a = arg.borrow();
            (a.attrs.ty.clone(), a.attrs.value.clone())
        };
        if let Some(src) = &src {
            let explicit_ok = (src.is_arithmetic() && target.is_arithmetic())
                || (src.is_pointer() && target.is_pointer())
                || self.ctx.types.assignable(target, src, value.as_ref());
            if !explicit_ok {
                self.ctx.diag(
                    DiagnosticKind::Type,
                    format!("cannot cast '{}' to '{}'", src, target),
                    span,
                );
                return Ok(());
            }
            // Narrowing casts keep a runtime range check
            let narrowing = src.is_arithmetic()
                && target.is_integral()
                && !self.ctx.types.assignable(target, src, None);
            let mut n = node.borrow_mut();
            n.attrs.ty = Some(target.clone());
            n.attrs.builtin = if narrowing && value.is_none() {
                Some("narrow_cast".to_string())
            } else {
                Some("cast".to_string())
            };
            if let Some(v) = value {
                let folded = match (&v, &**target) {
                    (Value::Int(i), t) if t.is_integral() => Some(Value::Int(truncate_int(*i, target))),
                    (Value::Int(i), Type::Float { .. }) => Some(Value::Float(*i as f64)),
                    (Value::Float(x), t) if t.is_integral() => Some(Value::Int(truncate_int(*x as i128, target))),
                    (Value::Float(x), Type::Float { .. }) => Some(Value::Float(*x)),
                    _ => None,
                };
                if let Some(folded) = folded {
                    n.attrs.value = Some(folded);
                    n.attrs.comptime = true;
                }
            }
        }
        Ok(())
    }

    fn visit_poly_call(
        &mut self,
        node: &NodeRef,
        name: &str,
        args: &[NodeRef],
        _span: Span,
    ) -> Result<(), AnalyzeError> {
        let symbol = match self.ctx.scopes.lookup(name) {
            Some(s) => s,
            None => return Ok(()),
        };
        let def_id = symbol.borrow().node_id;
        let def = match self.ctx.builder.get(def_id) {
            Some(d) => d,
            None => return Ok(()),
        };

        let mut arg_types = Vec::new();
        for arg in args {
            self.visit_expr(arg)?;
            match arg.borrow().attrs.ty.clone() {
                Some(t) => arg_types.push(t),
                None => return Ok(()),
            }
        }
        let tuple_key: String = arg_types
            .iter()
            .map(|t| t.codename())
            .collect::<Vec<_>>()
            .join("_");

        let instance_index = match self.ctx.poly_memo.get(&(def_id, tuple_key.clone())) {
            Some(i) => *i,
            None => {
                let instance =
                    self.instantiate_poly(name, &def, &arg_types)
                        .map_err(|e| AnalyzeError::PolyInstantiation {
                            name: name.to_string(),
                            source: Box::new(e),
                        })?;
                let index = self.ctx.poly_instances.len();
                self.ctx.poly_instances.push(instance);
                self.ctx.poly_memo.insert((def_id, tuple_key), index);
                index
            }
        };

        let ret = match &*self.ctx.poly_instances[instance_index].ty {
            Type::Function { rets, .. } => rets
                .first()
                .cloned()
                .unwrap_or_else(|| self.ctx.types.void.clone()),
            _ => self.ctx.types.void.clone(),
        };
        let mut n = node.borrow_mut();
        n.attrs.ty = Some(ret);
        n.attrs
            .set_flag("polyinstance", Value::Int(instance_index as i128));
        Ok(())
    }

    fn instantiate_poly(
        &mut self,
        name: &str,
        def: &NodeRef,
        arg_types: &[TypeRef],
    ) -> Result<PolyInstance, AnalyzeError> {
        // Clone the whole definition; the copy gets fresh registry ids
        let clone = self.ctx.builder.clone_tree(def);
        mark_preprocess(&clone);
        let (params, ret, block) = {
            let c = clone.borrow();
            (c.slot_list(2), c.slot_node(3), c.slot_node(4))
        };
        let mut bound_types = Vec::new();
        for (i, param) in params.iter().enumerate() {
            let annot = param.borrow().slot_node(1);
            let declared = match annot {
                Some(t) => self.resolve_type_expr(&t, None),
                None => None,
            };
            let ty = match declared {
                Some(t) if matches!(*t, Type::Auto) => arg_types
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| self.ctx.types.void.clone()),
                Some(t) => t,
                None => arg_types
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| self.ctx.types.void.clone()),
            };
            bound_types.push(ty);
        }
        let declared_ret = match ret {
            Some(r) => self.resolve_type_expr(&r, None),
            None => None,
        };
        let inferred_ret =
            self.analyze_function_body(&params, &bound_types, declared_ret, &block)?;
        let func_ty = self
            .ctx
            .types
            .function(bound_types, vec![inferred_ret]);
        let mangled = format!("{}_{}", name, clone.borrow().id);
        clone.borrow_mut().attrs.ty = Some(func_ty.clone());
        Ok(PolyInstance {
            name: mangled,
            node: clone,
            ty: func_ty,
        })
    }

    // ========================================================================
    // require
    // ========================================================================

    fn visit_require(
        &mut self,
        node: &NodeRef,
        args: &[NodeRef],
        span: Span,
    ) -> Result<(), AnalyzeError> {
        node.borrow_mut().attrs.ty = Some(self.ctx.types.void.clone());
        let module = match args.first().and_then(|a| a.borrow().attrs.value.clone()) {
            Some(Value::Str(s)) => s,
            _ => {
                self.ctx.diag(
                    DiagnosticKind::Type,
                    "require expects a compile time string argument".to_string(),
                    span,
                );
                return Ok(());
            }
        };
        node.borrow_mut().attrs.requirename = Some(module.clone());

        // A repeat require of the same module is a no-op
        if self.ctx.required.contains(&module) {
            node.borrow_mut().attrs.alreadyrequired = true;
            return Ok(());
        }

        let path = match self.resolve_module(&module) {
            Some(p) => p,
            None => {
                self.ctx.diag(
                    DiagnosticKind::Lookup,
                    format!("module '{}' not found in the search path", module),
                    span,
                );
                return Ok(());
            }
        };
        let source = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) => {
                self.ctx.diag(
                    DiagnosticKind::Lookup,
                    format!("failed reading module '{}': {}", module, e),
                    span,
                );
                return Ok(());
            }
        };
        let loaded = match parser::parse_source(&source, &self.ctx.builder) {
            Ok(ast) => ast,
            Err(e) => {
                self.ctx.diag(
                    DiagnosticKind::Preprocess,
                    format!("failed parsing module '{}': {}", module, e),
                    span,
                );
                return Ok(());
            }
        };
        self.ctx.required.insert(module.clone());

        // The loaded AST is analyzed in the root scope with the requesting
        // module's pragma stack pushed
        mark_preprocess(&loaded);
        self.ctx.pragmas.push();
        let prev = self.ctx.scopes.enter_root();
        let result = self.visit_block_statements(&loaded);
        self.ctx.scopes.leave_root(prev);
        self.ctx.pragmas.pop();
        result?;

        node.borrow_mut().attrs.loadedast = Some(loaded);
        Ok(())
    }

    fn resolve_module(&self, name: &str) -> Option<String> {
        for pattern in &self.ctx.search_paths {
            let candidate = if pattern.contains('?') {
                pattern.replace('?', name)
            } else {
                format!("{}/{}.skn", pattern.trim_end_matches('/'), name)
            };
            if Path::new(&candidate).is_file() {
                return Some(candidate);
            }
        }
        None
    }

    // ========================================================================
    // Type expressions
    // ========================================================================

    pub fn resolve_type_expr(&mut self, node: &NodeRef, name_hint: Option<&str>) -> Option<TypeRef> {
        // Spliced type values arrive pre-resolved
        if let Some(Value::Type(t)) = node.borrow().attrs.value.clone() {
            return Some(t);
        }
        let tag = node.borrow().tag;
        let span = node.borrow().span.clone();
        let ty = match tag {
            Tag::Id => {
                let name = node.borrow().slot_str(0).unwrap_or_default();
                if let Some(t) = self.ctx.types.primitive(&name) {
                    Some(t)
                } else if let Some(sym) = self.ctx.scopes.lookup(&name) {
                    match &sym.borrow().value {
                        Some(Value::Type(t)) => Some(t.clone()),
                        _ => {
                            self.ctx.diag(
                                DiagnosticKind::Type,
                                format!("symbol '{}' does not name a type", name),
                                span.clone(),
                            );
                            None
                        }
                    }
                } else {
                    self.ctx.diag(
                        DiagnosticKind::Lookup,
                        format!("undefined type '{}'", name),
                        span.clone(),
                    );
                    None
                }
            }
            Tag::PointerType => match node.borrow().slot_node(0) {
                Some(sub) => {
                    let sub = self.resolve_type_expr(&sub, None)?;
                    Some(self.ctx.types.pointer_to(sub))
                }
                None => Some(self.ctx.types.pointer.clone()),
            },
            Tag::ArrayType => {
                let (len_expr, sub) = {
                    let n = node.borrow();
                    (n.slot_node(0), n.slot_node(1))
                };
                let len_expr = len_expr?;
                if self.visit_expr(&len_expr).is_err() {
                    return None;
                }
                let len = match len_expr.borrow().attrs.value.clone() {
                    Some(Value::Int(v)) if v >= 0 => v as u64,
                    _ => {
                        self.ctx.diag(
                            DiagnosticKind::Type,
                            "array length must be a non-negative compile time integer".to_string(),
                            span.clone(),
                        );
                        return None;
                    }
                };
                let sub = self.resolve_type_expr(&sub?, None)?;
                Some(self.ctx.types.array_of(sub, len))
            }
            Tag::RecordType | Tag::UnionType => {
                let fields = node.borrow().slot_list(0);
                let mut resolved = Vec::new();
                for field in &fields {
                    let (fname, ftype) = {
                        let f = field.borrow();
                        (f.slot_str(0).unwrap_or_default(), f.slot_node(1))
                    };
                    let fty = self.resolve_type_expr(&ftype?, None)?;
                    resolved.push(crate::types::Field { name: fname, ty: fty });
                }
                let name = name_hint.unwrap_or(if tag == Tag::RecordType {
                    "record"
                } else {
                    "union"
                });
                if tag == Tag::RecordType {
                    Some(self.ctx.types.record(name, resolved))
                } else {
                    Some(self.ctx.types.union(name, resolved))
                }
            }
            Tag::EnumType => {
                let (subtype, fields) = {
                    let n = node.borrow();
                    (n.slot_node(0), n.slot_list(1))
                };
                let subtype = match subtype {
                    Some(s) => self.resolve_type_expr(&s, None)?,
                    None => self.ctx.types.int64.clone(),
                };
                let mut resolved = Vec::new();
                let mut next = 0i128;
                for field in &fields {
                    let (fname, fvalue) = {
                        let f = field.borrow();
                        (f.slot_str(0).unwrap_or_default(), f.slot_node(1))
                    };
                    if let Some(fvalue) = fvalue {
                        if self.visit_expr(&fvalue).is_err() {
                            return None;
                        }
                        match fvalue.borrow().attrs.value.clone() {
                            Some(Value::Int(v)) => next = v,
                            _ => {
                                self.ctx.diag(
                                    DiagnosticKind::Type,
                                    "enum field value must be a compile time integer".to_string(),
                                    span.clone(),
                                );
                                return None;
                            }
                        }
                    }
                    resolved.push((fname, next));
                    next += 1;
                }
                let name = name_hint.unwrap_or("enum");
                Some(self.ctx.types.enumeration(name, subtype, resolved))
            }
            Tag::FuncType => {
                let (params, ret) = {
                    let n = node.borrow();
                    (n.slot_list(0), n.slot_node(1))
                };
                let mut args = Vec::new();
                for param in &params {
                    args.push(self.resolve_type_expr(param, None)?);
                }
                let ret = match ret {
                    Some(r) => self.resolve_type_expr(&r, None)?,
                    None => self.ctx.types.void.clone(),
                };
                Some(self.ctx.types.function(args, vec![ret]))
            }
            // `@T` in type position
            Tag::Type => {
                let sub = node.borrow().slot_node(0)?;
                self.resolve_type_expr(&sub, name_hint)
            }
            _ => {
                self.ctx.diag(
                    DiagnosticKind::Type,
                    "invalid type expression".to_string(),
                    span.clone(),
                );
                None
            }
        };
        if let Some(t) = &ty {
            node.borrow_mut().attrs.ty = Some(self.ctx.types.typetype.clone());
            node.borrow_mut().attrs.value = Some(Value::Type(t.clone()));
        }
        ty
    }
}

// ============================================================================
// Marker pass
// ============================================================================

/// Mark every block that transitively contains a preprocess directive, so
/// outer blocks replay generated code that can declare symbols visible to
/// later siblings. Returns whether the subtree contains a directive.
pub fn mark_preprocess(node: &NodeRef) -> bool {
    let tag = node.borrow().tag;
    if matches!(
        tag,
        Tag::Preprocess | Tag::PreprocessExpr | Tag::PreprocessName
    ) {
        return true;
    }
    let slots = node.borrow().slots.clone();
    let mut found = false;
    for slot in &slots {
        match slot {
            Slot::Node(n) => {
                if mark_preprocess(n) {
                    found = true;
                }
            }
            Slot::List(l) => {
                for n in l {
                    if mark_preprocess(n) {
                        found = true;
                    }
                }
            }
            _ => {}
        }
    }
    if found && tag == Tag::Block {
        node.borrow_mut().attrs.needprocess = true;
    }
    found
}

// ============================================================================
// Constant folding helpers
// ============================================================================

/// Division rounded toward negative infinity
fn floor_div(a: i128, b: i128) -> i128 {
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

/// Wrap an integer into the representable range of `ty`
fn truncate_int(v: i128, ty: &TypeRef) -> i128 {
    match ty.bitsize() {
        Some(bits) if bits < 128 => {
            let mask = (1i128 << bits) - 1;
            let wrapped = v & mask;
            if ty.is_signed() && wrapped >= (1i128 << (bits - 1)) {
                wrapped - (1i128 << bits)
            } else {
                wrapped
            }
        }
        _ => v,
    }
}

fn to_float(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn fold_compare(op: &str, lvalue: &Option<Value>, rvalue: &Option<Value>) -> Option<Value> {
    let (a, b) = (lvalue.as_ref()?, rvalue.as_ref()?);
    // Nil and type values support equality only
    let equal_only = match (a, b) {
        (Value::Nil, Value::Nil) => Some(true),
        (Value::Type(a), Value::Type(b)) => Some(a == b),
        (Value::Nil, _) | (_, Value::Nil) | (Value::Type(_), _) | (_, Value::Type(_)) => {
            Some(false)
        }
        _ => None,
    };
    if let Some(equal) = equal_only {
        return match op {
            "eq" => Some(Value::Bool(equal)),
            "ne" => Some(Value::Bool(!equal)),
            _ => None,
        };
    }
    let ord = match (a, b) {
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
        // Remaining mixed shapes are never equal
        _ => return Some(Value::Bool(op == "ne")),
    }?;
    let result = match op {
        "eq" => ord.is_eq(),
        "ne" => !ord.is_eq(),
        "lt" => ord.is_lt(),
        "le" => ord.is_le(),
        "gt" => ord.is_gt(),
        "ge" => ord.is_ge(),
        _ => return None,
    };
    Some(Value::Bool(result))
}

/// Deterministic shift folding matching the emitted helper semantics:
/// `|b| >= bits` gives 0 (or sign fill for asr), negative `b` mirrors the
/// shift direction
fn fold_shift(op: &str, a: i128, b: i128, ty: &TypeRef) -> i128 {
    let bits = ty.bitsize().unwrap_or(64) as i128;
    let (op, b): (&str, i128) = if b < 0 {
        let mirrored = match op {
            "shl" => "shr",
            _ => "shl",
        };
        (mirrored, -b)
    } else {
        (op, b)
    };
    if b >= bits {
        return match op {
            "asr" if a < 0 => truncate_int(-1, ty),
            _ => 0,
        };
    }
    let unsigned_mask = if bits < 128 { (1i128 << bits) - 1 } else { -1 };
    let ua = a & unsigned_mask;
    let v = match op {
        "shl" => ua << b,
        "shr" => ua >> b,
        "asr" => a >> b,
        _ => 0,
    };
    truncate_int(v, ty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;

    fn analyze(src: &str) -> (Analyzer, NodeRef) {
        let ctx = Context::new("test.skn", src);
        let root = parse_source(src, &ctx.builder).expect("parse failure");
        let mut analyzer = Analyzer::new(ctx);
        analyzer.analyze(&root).expect("analysis failure");
        (analyzer, root)
    }

    fn first_diag(src: &str) -> String {
        let ctx = Context::new("test.skn", src);
        let root = parse_source(src, &ctx.builder).expect("parse failure");
        let mut analyzer = Analyzer::new(ctx);
        let _ = analyzer.analyze(&root);
        analyzer
            .ctx
            .diagnostics
            .first()
            .map(|d| d.message.clone())
            .unwrap_or_default()
    }

    #[test]
    fn test_string_literal_is_stringview() {
        let (_, root) = analyze("print \"hello world\"");
        let text = crate::ast::dump_analyzed(&root);
        assert!(text.contains("type = \"stringview\""));
    }

    #[test]
    fn test_integer_literal_defaults_to_int64() {
        let (analyzer, root) = analyze("local a = 1");
        let stmts = root.borrow().slot_list(0);
        let value = stmts[0].borrow().slot_node(1).unwrap();
        let ty = value.borrow().attrs.ty.clone().unwrap();
        assert_eq!(*ty, *analyzer.ctx.types.int64);
    }

    #[test]
    fn test_undefined_identifier_diagnostic() {
        let msg = first_diag("local a = b");
        assert!(msg.contains("undefined identifier 'b'"));
    }

    #[test]
    fn test_undefined_literal_suffix() {
        let msg = first_diag("local a = 1_x");
        assert_eq!(msg, "literal suffix '_x' is undefined");
    }

    #[test]
    fn test_known_literal_suffix() {
        let (analyzer, root) = analyze("local a = 1_u8");
        let stmts = root.borrow().slot_list(0);
        let value = stmts[0].borrow().slot_node(1).unwrap();
        let ty = value.borrow().attrs.ty.clone().unwrap();
        assert_eq!(*ty, *analyzer.ctx.types.uint8);
    }

    #[test]
    fn test_type_mismatch_diagnostic() {
        let msg = first_diag("local a: boolean = 1");
        assert!(msg.contains("no viable conversion"));
    }

    #[test]
    fn test_value_aware_narrowing_in_declaration() {
        // 100 fits int8, so this is fine
        let (_, _) = analyze("local a: int8 = 100");
        let msg = first_diag("local a: int8 = 1000");
        assert!(msg.contains("no viable conversion"));
    }

    #[test]
    fn test_constant_folding() {
        let (_, root) = analyze("local a = 2 + 3 * 4");
        let stmts = root.borrow().slot_list(0);
        let value = stmts[0].borrow().slot_node(1).unwrap();
        assert_eq!(value.borrow().attrs.value, Some(Value::Int(14)));
    }

    #[test]
    fn test_shift_folding_is_total() {
        let (_, root) = analyze("local a = 1 << 200");
        let stmts = root.borrow().slot_list(0);
        let value = stmts[0].borrow().slot_node(1).unwrap();
        assert_eq!(value.borrow().attrs.value, Some(Value::Int(0)));
    }

    #[test]
    fn test_negative_shift_mirrors_direction() {
        let (_, root) = analyze("local a = 8 >> -2");
        let stmts = root.borrow().slot_list(0);
        let value = stmts[0].borrow().slot_node(1).unwrap();
        assert_eq!(value.borrow().attrs.value, Some(Value::Int(32)));
    }

    #[test]
    fn test_record_type_and_field_access() {
        let (_, root) = analyze(
            "local Point = @record{x: int64, y: int64}\n\
             local p: Point = {x = 1, y = 2}\n\
             local x = p.x",
        );
        let stmts = root.borrow().slot_list(0);
        let decl = stmts[2].borrow();
        let value = decl.slot_node(1).unwrap();
        assert_eq!(value.borrow().attrs.ty.clone().unwrap().name(), "int64");
    }

    #[test]
    fn test_enum_field_constant() {
        let (_, root) = analyze("local Color = @enum{Red, Green = 5, Blue}\nlocal c = Color.Blue");
        let stmts = root.borrow().slot_list(0);
        let value = stmts[1].borrow().slot_node(1).unwrap();
        assert_eq!(value.borrow().attrs.value, Some(Value::Int(6)));
    }

    #[test]
    fn test_function_call_types() {
        let (analyzer, root) = analyze(
            "local function add(a: int64, b: int64): int64 return a + b end\n\
             local r = add(1, 2)",
        );
        let stmts = root.borrow().slot_list(0);
        let value = stmts[1].borrow().slot_node(1).unwrap();
        let ty = value.borrow().attrs.ty.clone().unwrap();
        assert_eq!(*ty, *analyzer.ctx.types.int64);
    }

    #[test]
    fn test_wrong_argument_count() {
        let msg = first_diag(
            "local function f(a: int64) end\n\
             f(1, 2)",
        );
        assert!(msg.contains("expected 1 arguments but got 2"));
    }

    #[test]
    fn test_poly_instantiation() {
        let (analyzer, root) = analyze(
            "local function id(x: auto) return x end\n\
             local a = id(1)\n\
             local b = id(true)",
        );
        assert_eq!(analyzer.ctx.poly_instances.len(), 2);
        let stmts = root.borrow().slot_list(0);
        let a = stmts[1].borrow().slot_node(1).unwrap();
        let ty = a.borrow().attrs.ty.clone().unwrap();
        assert_eq!(*ty, *analyzer.ctx.types.int64);
    }

    #[test]
    fn test_poly_instances_are_memoized() {
        let (analyzer, _) = analyze(
            "local function id(x: auto) return x end\n\
             local a = id(1)\n\
             local b = id(2)",
        );
        assert_eq!(analyzer.ctx.poly_instances.len(), 1);
    }

    #[test]
    fn test_scope_depth_is_balanced_after_errors() {
        let ctx = Context::new("test.skn", "");
        let src = "do local a = unknown_identifier end\nif true then local b = also_unknown end";
        let root = parse_source(src, &ctx.builder).expect("parse");
        let mut analyzer = Analyzer::new(ctx);
        let _ = analyzer.analyze(&root);
        assert_eq!(analyzer.ctx.scopes.depth(), 0);
        assert!(analyzer.ctx.scopes.is_root());
    }

    #[test]
    fn test_cast_marks_narrowing() {
        let (_, root) = analyze("local a = 1000\nlocal b = (@int8)(a)");
        let stmts = root.borrow().slot_list(0);
        let cast = stmts[1].borrow().slot_node(1).unwrap();
        assert_eq!(
            cast.borrow().attrs.builtin.as_deref(),
            Some("narrow_cast")
        );
    }

    #[test]
    fn test_print_rejects_records() {
        let msg = first_diag("local Point = @record{x: int64}\nlocal p: Point\nprint(p)");
        assert!(msg.contains("cannot handle type"));
    }
}

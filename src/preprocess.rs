//! The preprocessor engine
//!
//! Each block marked `needprocess` is rebuilt by a replay program compiled
//! from its original statement list: static statements are re-added (with
//! expression and name splices substituted first) and preprocess fragments
//! execute inline against a live view of the analyzer. Analysis of each
//! re-added statement completes before later statements are generated, so
//! fragments observe the types inferred by earlier siblings.
//!
//! The execution environment resolves unknown names through a layered
//! lookup: preprocess locals, then scope symbols, then pragma fields, then
//! host defines, then primitive types. Unknown name assignment sets a
//! recognized pragma (validated) or else a preprocess variable.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use crate::analyzer::{AnalyzeError, Analyzer};
use crate::ast::{NodeRef, Slot, Span, Tag};
use crate::pragma::Pragmas;
use crate::scope::Checkpoint;
use crate::types::{Type, TypeRef, Value};

#[derive(Error, Debug)]
#[error("{message}")]
pub struct PreprocessError {
    pub message: String,
    pub span: Span,
}

impl PreprocessError {
    fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

type PpResult<T> = Result<T, PreprocessError>;

/// A function value defined inside preprocess code
pub struct PpFunc {
    pub params: Vec<String>,
    pub body: NodeRef,
    pub hygiene: Option<Hygiene>,
}

/// State captured by `hygienize`: the scope checkpoint and the injection
/// site where later calls splice their nodes
pub struct Hygiene {
    pub checkpoint: Checkpoint,
    pub block: NodeRef,
    pub index: Cell<usize>,
}

/// A value in the preprocess environment
#[derive(Clone)]
pub enum PpValue {
    Nil,
    Bool(bool),
    Int(i128),
    Float(f64),
    Str(String),
    Type(TypeRef),
    /// An AST node, held by registry index rather than pointer
    Node(usize),
    Func(Rc<PpFunc>),
    Builtin(&'static str),
    List(Vec<PpValue>),
}

impl PpValue {
    pub fn truthy(&self) -> bool {
        !matches!(self, PpValue::Nil | PpValue::Bool(false))
    }

    fn type_name(&self) -> &'static str {
        match self {
            PpValue::Nil => "nil",
            PpValue::Bool(_) => "boolean",
            PpValue::Int(_) | PpValue::Float(_) => "number",
            PpValue::Str(_) => "string",
            PpValue::Type(_) => "type",
            PpValue::Node(_) => "node",
            PpValue::Func(_) => "function",
            PpValue::Builtin(_) => "builtin",
            PpValue::List(_) => "list",
        }
    }

    fn from_const(value: &Value) -> PpValue {
        match value {
            Value::Nil => PpValue::Nil,
            Value::Bool(b) => PpValue::Bool(*b),
            Value::Int(i) => PpValue::Int(*i),
            Value::Float(f) => PpValue::Float(*f),
            Value::Str(s) => PpValue::Str(s.clone()),
            Value::Type(t) => PpValue::Type(t.clone()),
        }
    }

    fn to_const(&self) -> Option<Value> {
        match self {
            PpValue::Nil => Some(Value::Nil),
            PpValue::Bool(b) => Some(Value::Bool(*b)),
            PpValue::Int(i) => Some(Value::Int(*i)),
            PpValue::Float(f) => Some(Value::Float(*f)),
            PpValue::Str(s) => Some(Value::Str(s.clone())),
            PpValue::Type(t) => Some(Value::Type(t.clone())),
            _ => None,
        }
    }
}

const PP_BUILTINS: &[&str] = &[
    "injectnode",
    "hygienize",
    "afterinfer",
    "staticassert",
    "static_error",
    "primtypes",
    "ast",
    "aster",
    "context",
    "config",
    "print",
];

/// The replay program for one marked block
enum PpOp {
    /// Re-add a static statement by registry index
    AddStat(usize),
    /// Execute a preprocess fragment body by registry index
    Exec(usize),
}

/// Rebuild a marked block: compile its replay program, then run it,
/// re-adding static statements and executing fragments inline.
pub fn run_block(analyzer: &mut Analyzer, block: &NodeRef) -> Result<(), AnalyzeError> {
    let original = block.borrow().slot_list(0);
    let mut ops = Vec::new();
    for stmt in &original {
        let s = stmt.borrow();
        if s.tag == Tag::Preprocess {
            match s.slot_node(0) {
                Some(body) => ops.push(PpOp::Exec(body.borrow().id)),
                None => {}
            }
        } else {
            ops.push(PpOp::AddStat(s.id));
        }
    }

    // The statement list is reassembled from scratch
    block.borrow_mut().slots[0] = Slot::List(Vec::new());
    block.borrow_mut().attrs.needprocess = false;

    let mut interp = Interp::new(analyzer, block.clone());
    for op in ops {
        match op {
            PpOp::AddStat(id) => {
                let stmt = match interp.registry_node(id) {
                    Some(n) => n,
                    None => continue,
                };
                interp.substitute_directives(&stmt)?;
                interp.add_statnode(stmt)?;
            }
            PpOp::Exec(id) => {
                let body = match interp.registry_node(id) {
                    Some(n) => n,
                    None => continue,
                };
                interp.exec_fragment(&body)?;
            }
        }
    }
    Ok(())
}

/// Call a preprocess function value from outside the engine (used for
/// `afterinfer` callbacks). Hygienized functions re-enter their captured
/// checkpoint and splice at their captured site.
pub fn call_function(
    analyzer: &mut Analyzer,
    func: &PpValue,
    args: &[PpValue],
    block: &NodeRef,
) -> Result<(), AnalyzeError> {
    let span = block.borrow().span.clone();
    let mut interp = Interp::at_end(analyzer, block.clone());
    interp.call_value(func, args.to_vec(), &span)?;
    Ok(())
}

enum Flow {
    Normal,
    Break,
    Return(PpValue),
}

struct Interp<'a> {
    an: &'a mut Analyzer,
    env: Vec<HashMap<String, PpValue>>,
    /// Block receiving injected statements, and the insertion offset
    target: NodeRef,
    index: usize,
}

impl<'a> Interp<'a> {
    fn new(analyzer: &'a mut Analyzer, target: NodeRef) -> Self {
        Self {
            an: analyzer,
            env: vec![HashMap::new()],
            target,
            index: 0,
        }
    }

    fn at_end(analyzer: &'a mut Analyzer, target: NodeRef) -> Self {
        let index = target.borrow().slot_list(0).len();
        Self {
            an: analyzer,
            env: vec![HashMap::new()],
            target,
            index,
        }
    }

    fn registry_node(&self, id: usize) -> Option<NodeRef> {
        self.an.ctx.builder.get(id)
    }

    // ========================================================================
    // Statement reassembly
    // ========================================================================

    /// Analyze a statement and append it at the current injection point
    fn add_statnode(&mut self, stmt: NodeRef) -> Result<(), AnalyzeError> {
        self.an.visit_stmt(&stmt)?;
        let mut t = self.target.borrow_mut();
        if let Some(Slot::List(list)) = t.slots.first_mut() {
            let at = self.index.min(list.len());
            list.insert(at, stmt);
        }
        drop(t);
        self.index += 1;
        Ok(())
    }

    /// Append a synthetic statement without analyzing it
    fn add_synthetic(&mut self, stmt: NodeRef) {
        let mut t = self.target.borrow_mut();
        if let Some(Slot::List(list)) = t.slots.first_mut() {
            let at = self.index.min(list.len());
            list.insert(at, stmt);
        }
        drop(t);
        self.index += 1;
    }

    /// Replace expression and name splices inside a static statement.
    /// Nested blocks are left alone; they rebuild themselves.
    fn substitute_directives(&mut self, node: &NodeRef) -> PpResult<()> {
        let nslots = node.borrow().slots.len();
        for i in 0..nslots {
            let slot = node.borrow().slots[i].clone();
            match slot {
                Slot::Node(child) => {
                    let tag = child.borrow().tag;
                    match tag {
                        Tag::PreprocessExpr => {
                            let (expr, span) = {
                                let c = child.borrow();
                                (c.slot_node(0), c.span.clone())
                            };
                            let expr = expr
                                .ok_or_else(|| PreprocessError::new("empty preprocess expression", span.clone()))?;
                            let value = self.eval_expr(&expr)?;
                            let derived = self.value_to_node(&value, &span)?;
                            node.borrow_mut().slots[i] = Slot::Node(derived);
                        }
                        Tag::PreprocessName => {
                            let (expr, span) = {
                                let c = child.borrow();
                                (c.slot_node(0), c.span.clone())
                            };
                            let expr = expr
                                .ok_or_else(|| PreprocessError::new("empty preprocess name", span.clone()))?;
                            let value = self.eval_expr(&expr)?;
                            match value {
                                PpValue::Str(s) => {
                                    node.borrow_mut().slots[i] = Slot::Str(s);
                                }
                                other => {
                                    return Err(PreprocessError::new(
                                        format!(
                                            "preprocess name must evaluate to a string, got {}",
                                            other.type_name()
                                        ),
                                        span,
                                    ))
                                }
                            }
                        }
                        Tag::Block => {}
                        _ => self.substitute_directives(&child)?,
                    }
                }
                Slot::List(children) => {
                    let mut rebuilt = Vec::with_capacity(children.len());
                    let mut changed = false;
                    for child in children {
                        let tag = child.borrow().tag;
                        match tag {
                            // A splice directly in a list position replaces
                            // the list element
                            Tag::PreprocessExpr => {
                                let (expr, span) = {
                                    let c = child.borrow();
                                    (c.slot_node(0), c.span.clone())
                                };
                                let expr = expr.ok_or_else(|| {
                                    PreprocessError::new(
                                        "empty preprocess expression",
                                        span.clone(),
                                    )
                                })?;
                                let value = self.eval_expr(&expr)?;
                                rebuilt.push(self.value_to_node(&value, &span)?);
                                changed = true;
                            }
                            Tag::Block => rebuilt.push(child),
                            _ => {
                                self.substitute_directives(&child)?;
                                rebuilt.push(child);
                            }
                        }
                    }
                    if changed {
                        node.borrow_mut().slots[i] = Slot::List(rebuilt);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Derive an AST node from a preprocess value
    fn value_to_node(&mut self, value: &PpValue, span: &Span) -> PpResult<NodeRef> {
        let builder = self.an.ctx.builder.clone();
        let node = match value {
            PpValue::Node(id) => self
                .registry_node(*id)
                .ok_or_else(|| PreprocessError::new("dangling node reference", span.clone()))?,
            PpValue::Int(v) => builder.build(
                Tag::Number,
                span.clone(),
                vec![Slot::Int(*v), Slot::Nil],
            ),
            PpValue::Float(v) => builder.build(
                Tag::Number,
                span.clone(),
                vec![Slot::Float(*v), Slot::Nil],
            ),
            PpValue::Str(s) => builder.build(
                Tag::String,
                span.clone(),
                vec![Slot::Str(s.clone()), Slot::Nil],
            ),
            PpValue::Bool(b) => {
                builder.build(Tag::Boolean, span.clone(), vec![Slot::Bool(*b)])
            }
            PpValue::Nil => builder.build(Tag::Nil, span.clone(), vec![]),
            PpValue::Type(t) => {
                let node = builder.build(Tag::Type, span.clone(), vec![]);
                {
                    let mut n = node.borrow_mut();
                    n.attrs.ty = Some(self.an.ctx.types.typetype.clone());
                    n.attrs.value = Some(Value::Type(t.clone()));
                    n.attrs.comptime = true;
                }
                node
            }
            other => {
                return Err(PreprocessError::new(
                    format!("cannot derive an AST node from a {} value", other.type_name()),
                    span.clone(),
                ))
            }
        };
        Ok(node)
    }

    // ========================================================================
    // Fragment execution
    // ========================================================================

    fn exec_fragment(&mut self, body: &NodeRef) -> Result<(), AnalyzeError> {
        match self.exec_block(body)? {
            Flow::Normal | Flow::Break => Ok(()),
            Flow::Return(_) => Ok(()),
        }
    }

    fn exec_block(&mut self, block: &NodeRef) -> PpResult<Flow> {
        self.env.push(HashMap::new());
        let result = self.exec_statements(block);
        self.env.pop();
        result
    }

    fn exec_statements(&mut self, block: &NodeRef) -> PpResult<Flow> {
        let stmts = block.borrow().slot_list(0);
        for stmt in &stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &NodeRef) -> PpResult<Flow> {
        let tag = stmt.borrow().tag;
        let span = stmt.borrow().span.clone();
        match tag {
            Tag::LocalDecl => {
                let (iddecl, value) = {
                    let s = stmt.borrow();
                    (s.slot_node(0), s.slot_node(1))
                };
                let name = iddecl
                    .and_then(|i| i.borrow().slot_str(0))
                    .ok_or_else(|| PreprocessError::new("invalid preprocess declaration", span))?;
                let value = match value {
                    Some(v) => self.eval_expr(&v)?,
                    None => PpValue::Nil,
                };
                self.define(&name, value);
                Ok(Flow::Normal)
            }
            Tag::FuncDef => {
                let (name, params, body) = {
                    let s = stmt.borrow();
                    (
                        s.slot_str(1).unwrap_or_default(),
                        s.slot_list(2),
                        s.slot_node(4),
                    )
                };
                let params = params
                    .iter()
                    .map(|p| p.borrow().slot_str(0).unwrap_or_default())
                    .collect();
                let body = body
                    .ok_or_else(|| PreprocessError::new("function has no body", span))?;
                let func = PpValue::Func(Rc::new(PpFunc {
                    params,
                    body,
                    hygiene: None,
                }));
                self.define(&name, func);
                Ok(Flow::Normal)
            }
            Tag::Assign => {
                let (target, value) = {
                    let s = stmt.borrow();
                    (s.slot_node(0), s.slot_node(1))
                };
                let value = match value {
                    Some(v) => self.eval_expr(&v)?,
                    None => PpValue::Nil,
                };
                let name = target
                    .filter(|t| t.borrow().tag == Tag::Id)
                    .and_then(|t| t.borrow().slot_str(0))
                    .ok_or_else(|| {
                        PreprocessError::new("only plain names are assignable here", span.clone())
                    })?;
                self.assign(&name, value, &span)?;
                Ok(Flow::Normal)
            }
            Tag::Call => {
                self.eval_call(stmt)?;
                Ok(Flow::Normal)
            }
            Tag::If => {
                let (clauses, else_block) = {
                    let s = stmt.borrow();
                    (s.slot_list(0), s.slot_node(1))
                };
                for clause in &clauses {
                    let (cond, block) = {
                        let c = clause.borrow();
                        (c.slot_node(0), c.slot_node(1))
                    };
                    let cond = match cond {
                        Some(c) => self.eval_expr(&c)?,
                        None => PpValue::Nil,
                    };
                    if cond.truthy() {
                        return match block {
                            Some(b) => self.exec_block(&b),
                            None => Ok(Flow::Normal),
                        };
                    }
                }
                match else_block {
                    Some(b) => self.exec_block(&b),
                    None => Ok(Flow::Normal),
                }
            }
            Tag::While => {
                let (cond, block) = {
                    let s = stmt.borrow();
                    (s.slot_node(0), s.slot_node(1))
                };
                loop {
                    let c = match &cond {
                        Some(c) => self.eval_expr(c)?,
                        None => PpValue::Nil,
                    };
                    if !c.truthy() {
                        return Ok(Flow::Normal);
                    }
                    if let Some(block) = &block {
                        match self.exec_block(block)? {
                            Flow::Break => return Ok(Flow::Normal),
                            Flow::Return(v) => return Ok(Flow::Return(v)),
                            Flow::Normal => {}
                        }
                    }
                }
            }
            Tag::ForNum => {
                let (iddecl, start, limit, step, block) = {
                    let s = stmt.borrow();
                    (
                        s.slot_node(0),
                        s.slot_node(1),
                        s.slot_node(2),
                        s.slot_node(3),
                        s.slot_node(4),
                    )
                };
                let name = iddecl
                    .and_then(|i| i.borrow().slot_str(0))
                    .ok_or_else(|| PreprocessError::new("invalid loop variable", span.clone()))?;
                let start = self.eval_int(&start, &span)?;
                let limit = self.eval_int(&limit, &span)?;
                let step = match step {
                    Some(s) => self.eval_int(&Some(s), &span)?,
                    None => 1,
                };
                if step == 0 {
                    return Err(PreprocessError::new("loop step cannot be zero", span));
                }
                let mut i = start;
                while (step > 0 && i <= limit) || (step < 0 && i >= limit) {
                    self.env.push(HashMap::new());
                    self.define(&name, PpValue::Int(i));
                    let flow = match &block {
                        Some(b) => self.exec_statements(b),
                        None => Ok(Flow::Normal),
                    };
                    self.env.pop();
                    match flow? {
                        Flow::Break => return Ok(Flow::Normal),
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal => {}
                    }
                    i += step;
                }
                Ok(Flow::Normal)
            }
            Tag::Do => match stmt.borrow().slot_node(0) {
                Some(block) => self.exec_block(&block),
                None => Ok(Flow::Normal),
            },
            Tag::Return => {
                let value = match stmt.borrow().slot_node(0) {
                    Some(v) => self.eval_expr(&v)?,
                    None => PpValue::Nil,
                };
                Ok(Flow::Return(value))
            }
            Tag::Break => Ok(Flow::Break),
            _ => Err(PreprocessError::new(
                "unsupported statement in preprocess code",
                span,
            )),
        }
    }

    fn eval_int(&mut self, node: &Option<NodeRef>, span: &Span) -> PpResult<i128> {
        let node = node
            .as_ref()
            .ok_or_else(|| PreprocessError::new("expected a numeric expression", span.clone()))?;
        match self.eval_expr(node)? {
            PpValue::Int(i) => Ok(i),
            other => Err(PreprocessError::new(
                format!("expected a number, got {}", other.type_name()),
                node.borrow().span.clone(),
            )),
        }
    }

    // ========================================================================
    // Environment
    // ========================================================================

    fn define(&mut self, name: &str, value: PpValue) {
        if let Some(layer) = self.env.last_mut() {
            layer.insert(name.to_string(), value);
        }
    }

    /// Layered lookup: pp locals, scope symbols, pragma fields, host
    /// defines, primitive types
    fn lookup(&self, name: &str) -> Option<PpValue> {
        for layer in self.env.iter().rev() {
            if let Some(v) = layer.get(name) {
                return Some(v.clone());
            }
        }
        if let Some(v) = self.an.ctx.pp_vars.get(name) {
            return Some(v.clone());
        }
        if let Some(builtin) = PP_BUILTINS.iter().copied().find(|b| **b == *name) {
            return Some(PpValue::Builtin(builtin));
        }
        if let Some(symbol) = self.an.ctx.scopes.lookup(name) {
            let sym = symbol.borrow();
            return Some(match &sym.value {
                Some(v) if sym.comptime => PpValue::from_const(v),
                _ => PpValue::Nil,
            });
        }
        if let Some(v) = self.an.ctx.pragmas.get_field(name) {
            return Some(PpValue::from_const(v));
        }
        if let Some(v) = self.an.ctx.defines.get(name) {
            return Some(PpValue::from_const(v));
        }
        self.an.ctx.types.primitive(name).map(PpValue::Type)
    }

    /// Assignment routing: a recognized pragma name validates and sets the
    /// pragma; anything else becomes a preprocess variable
    fn assign(&mut self, name: &str, value: PpValue, span: &Span) -> PpResult<()> {
        if Pragmas::is_field_pragma(name) {
            let value = value.to_const().ok_or_else(|| {
                PreprocessError::new(
                    format!("cannot assign a {} value to a pragma", value.type_name()),
                    span.clone(),
                )
            })?;
            return self
                .an
                .ctx
                .pragmas
                .set_field(name, value)
                .map_err(|e| PreprocessError::new(e.to_string(), span.clone()));
        }
        for layer in self.env.iter_mut().rev() {
            if layer.contains_key(name) {
                layer.insert(name.to_string(), value);
                return Ok(());
            }
        }
        self.an.ctx.pp_vars.insert(name.to_string(), value);
        Ok(())
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn eval_expr(&mut self, node: &NodeRef) -> PpResult<PpValue> {
        let tag = node.borrow().tag;
        let span = node.borrow().span.clone();
        match tag {
            Tag::Number => match node.borrow().slots.first() {
                Some(Slot::Int(v)) => Ok(PpValue::Int(*v)),
                Some(Slot::Float(v)) => Ok(PpValue::Float(*v)),
                _ => Ok(PpValue::Nil),
            },
            Tag::String => Ok(PpValue::Str(node.borrow().slot_str(0).unwrap_or_default())),
            Tag::Boolean => Ok(PpValue::Bool(matches!(
                node.borrow().slots.first(),
                Some(Slot::Bool(true))
            ))),
            Tag::Nil | Tag::Nilptr => Ok(PpValue::Nil),
            Tag::Id => {
                // A miss at the end of the lookup chain is nil, not an error
                let name = node.borrow().slot_str(0).unwrap_or_default();
                Ok(self.lookup(&name).unwrap_or(PpValue::Nil))
            }
            Tag::Paren => match node.borrow().slot_node(0) {
                Some(inner) => self.eval_expr(&inner),
                None => Ok(PpValue::Nil),
            },
            Tag::UnaryOp => self.eval_unary(node, &span),
            Tag::BinaryOp => self.eval_binary(node, &span),
            Tag::Call => self.eval_call(node),
            Tag::DotIndex => self.eval_dot(node, &span),
            Tag::KeyIndex => self.eval_index(node, &span),
            Tag::InitList => {
                let items = node.borrow().slot_list(0);
                let mut values = Vec::new();
                for item in &items {
                    values.push(self.eval_expr(item)?);
                }
                Ok(PpValue::List(values))
            }
            Tag::Type => {
                let sub = node.borrow().slot_node(0);
                match sub {
                    Some(sub) => match self.an.resolve_type_expr(&sub, None) {
                        Some(t) => Ok(PpValue::Type(t)),
                        None => Err(PreprocessError::new("invalid type expression", span)),
                    },
                    None => Err(PreprocessError::new("invalid type expression", span)),
                }
            }
            _ => Err(PreprocessError::new(
                "unsupported expression in preprocess code",
                span,
            )),
        }
    }

    fn eval_unary(&mut self, node: &NodeRef, span: &Span) -> PpResult<PpValue> {
        let (op, operand) = {
            let n = node.borrow();
            (n.slot_str(0).unwrap_or_default(), n.slot_node(1))
        };
        let operand = operand
            .ok_or_else(|| PreprocessError::new("missing operand", span.clone()))?;
        let v = self.eval_expr(&operand)?;
        match (op.as_str(), &v) {
            ("not", v) => Ok(PpValue::Bool(!v.truthy())),
            ("unm", PpValue::Int(i)) => Ok(PpValue::Int(-i)),
            ("unm", PpValue::Float(f)) => Ok(PpValue::Float(-f)),
            ("len", PpValue::Str(s)) => Ok(PpValue::Int(s.len() as i128)),
            ("len", PpValue::List(l)) => Ok(PpValue::Int(l.len() as i128)),
            ("bnot", PpValue::Int(i)) => Ok(PpValue::Int(!i)),
            _ => Err(PreprocessError::new(
                format!("invalid operation '{}' on a {} value", op, v.type_name()),
                span.clone(),
            )),
        }
    }

    fn eval_binary(&mut self, node: &NodeRef, span: &Span) -> PpResult<PpValue> {
        let (op, lhs, rhs) = {
            let n = node.borrow();
            (n.slot_str(0).unwrap_or_default(), n.slot_node(1), n.slot_node(2))
        };
        let (lhs, rhs) = match (lhs, rhs) {
            (Some(l), Some(r)) => (l, r),
            _ => return Err(PreprocessError::new("missing operand", span.clone())),
        };

        // Short-circuit forms first
        if op == "and" {
            let l = self.eval_expr(&lhs)?;
            return if l.truthy() { self.eval_expr(&rhs) } else { Ok(l) };
        }
        if op == "or" {
            let l = self.eval_expr(&lhs)?;
            return if l.truthy() { Ok(l) } else { self.eval_expr(&rhs) };
        }

        let l = self.eval_expr(&lhs)?;
        let r = self.eval_expr(&rhs)?;
        match op.as_str() {
            "eq" => Ok(PpValue::Bool(pp_equals(&l, &r))),
            "ne" => Ok(PpValue::Bool(!pp_equals(&l, &r))),
            "concat" => match (&l, &r) {
                (PpValue::Str(a), PpValue::Str(b)) => Ok(PpValue::Str(format!("{}{}", a, b))),
                (PpValue::Str(a), PpValue::Int(b)) => Ok(PpValue::Str(format!("{}{}", a, b))),
                (PpValue::Int(a), PpValue::Str(b)) => Ok(PpValue::Str(format!("{}{}", a, b))),
                _ => Err(PreprocessError::new(
                    format!("cannot concatenate {} and {}", l.type_name(), r.type_name()),
                    span.clone(),
                )),
            },
            "lt" | "le" | "gt" | "ge" => {
                let ord = match (&l, &r) {
                    (PpValue::Int(a), PpValue::Int(b)) => a.partial_cmp(b),
                    (PpValue::Float(a), PpValue::Float(b)) => a.partial_cmp(b),
                    (PpValue::Int(a), PpValue::Float(b)) => (*a as f64).partial_cmp(b),
                    (PpValue::Float(a), PpValue::Int(b)) => a.partial_cmp(&(*b as f64)),
                    (PpValue::Str(a), PpValue::Str(b)) => a.partial_cmp(b),
                    _ => None,
                };
                let ord = ord.ok_or_else(|| {
                    PreprocessError::new(
                        format!("cannot compare {} and {}", l.type_name(), r.type_name()),
                        span.clone(),
                    )
                })?;
                Ok(PpValue::Bool(match op.as_str() {
                    "lt" => ord.is_lt(),
                    "le" => ord.is_le(),
                    "gt" => ord.is_gt(),
                    _ => ord.is_ge(),
                }))
            }
            "add" | "sub" | "mul" | "div" | "idiv" | "mod" => match (&l, &r) {
                (PpValue::Int(a), PpValue::Int(b)) => {
                    if matches!(op.as_str(), "div" | "idiv" | "mod") && *b == 0 {
                        return Err(PreprocessError::new("division by zero", span.clone()));
                    }
                    Ok(match op.as_str() {
                        "add" => PpValue::Int(a + b),
                        "sub" => PpValue::Int(a - b),
                        "mul" => PpValue::Int(a * b),
                        "div" => PpValue::Float(*a as f64 / *b as f64),
                        "idiv" => {
                            let q = a / b;
                            PpValue::Int(if a % b != 0 && (a < &0) != (b < &0) { q - 1 } else { q })
                        }
                        _ => {
                            let q = a / b;
                            let q = if a % b != 0 && (a < &0) != (b < &0) { q - 1 } else { q };
                            PpValue::Int(a - q * b)
                        }
                    })
                }
                (a, b) => {
                    let (a, b) = match (pp_to_float(a), pp_to_float(b)) {
                        (Some(a), Some(b)) => (a, b),
                        _ => {
                            return Err(PreprocessError::new(
                                format!(
                                    "invalid arithmetic between {} and {}",
                                    l.type_name(),
                                    r.type_name()
                                ),
                                span.clone(),
                            ))
                        }
                    };
                    Ok(PpValue::Float(match op.as_str() {
                        "add" => a + b,
                        "sub" => a - b,
                        "mul" => a * b,
                        "div" => a / b,
                        "idiv" => (a / b).floor(),
                        _ => a - (a / b).floor() * b,
                    }))
                }
            },
            "band" | "bor" | "bxor" | "shl" | "shr" | "asr" => match (&l, &r) {
                (PpValue::Int(a), PpValue::Int(b)) => Ok(PpValue::Int(match op.as_str() {
                    "band" => a & b,
                    "bor" => a | b,
                    "bxor" => a ^ b,
                    "shl" => a.checked_shl(*b as u32).unwrap_or(0),
                    _ => a.checked_shr(*b as u32).unwrap_or(0),
                })),
                _ => Err(PreprocessError::new(
                    "bitwise operations need integer operands",
                    span.clone(),
                )),
            },
            _ => Err(PreprocessError::new(
                format!("unsupported operator '{}' in preprocess code", op),
                span.clone(),
            )),
        }
    }

    fn eval_dot(&mut self, node: &NodeRef, span: &Span) -> PpResult<PpValue> {
        let (name, obj) = {
            let n = node.borrow();
            (n.slot_str(0).unwrap_or_default(), n.slot_node(1))
        };
        let obj = obj
            .ok_or_else(|| PreprocessError::new("missing object", span.clone()))?;
        let obj = self.eval_expr(&obj)?;
        match obj {
            PpValue::Builtin("primtypes") => {
                self.an.ctx.types.primitive(&name).map(PpValue::Type).ok_or_else(|| {
                    PreprocessError::new(format!("unknown primitive type '{}'", name), span.clone())
                })
            }
            PpValue::Builtin("aster") => {
                tag_from_name(&name)
                    .map(|_| PpValue::Builtin(aster_builtin_name(&name)))
                    .ok_or_else(|| {
                        PreprocessError::new(format!("unknown node tag '{}'", name), span.clone())
                    })
            }
            PpValue::Builtin("context") | PpValue::Builtin("config") => match name.as_str() {
                "generator" => Ok(PpValue::Str(self.an.ctx.generator.clone())),
                "filename" => Ok(PpValue::Str(self.an.ctx.filename.clone())),
                _ => {
                    if let Some(v) = self.an.ctx.pragmas.get_field(&name) {
                        Ok(PpValue::from_const(v))
                    } else if let Some(v) = self.an.ctx.defines.get(&name) {
                        Ok(PpValue::from_const(v))
                    } else {
                        Ok(PpValue::Nil)
                    }
                }
            },
            PpValue::Type(t) => match &*t {
                Type::Enum { fields, .. } => fields
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, v)| PpValue::Int(*v))
                    .ok_or_else(|| {
                        PreprocessError::new(
                            format!("enum has no field named '{}'", name),
                            span.clone(),
                        )
                    }),
                _ => match name.as_str() {
                    "name" => Ok(PpValue::Str(t.name())),
                    "codename" => Ok(PpValue::Str(t.codename())),
                    "bitsize" => Ok(t
                        .bitsize()
                        .map(|b| PpValue::Int(b as i128))
                        .unwrap_or(PpValue::Nil)),
                    "min" => Ok(t.min_int().map(PpValue::Int).unwrap_or(PpValue::Nil)),
                    "max" => Ok(t
                        .max_int()
                        .map(|v| PpValue::Int(v as i128))
                        .unwrap_or(PpValue::Nil)),
                    _ => Err(PreprocessError::new(
                        format!("unknown type property '{}'", name),
                        span.clone(),
                    )),
                },
            },
            other => Err(PreprocessError::new(
                format!("cannot index a {} value", other.type_name()),
                span.clone(),
            )),
        }
    }

    fn eval_index(&mut self, node: &NodeRef, span: &Span) -> PpResult<PpValue> {
        let (index, obj) = {
            let n = node.borrow();
            (n.slot_node(0), n.slot_node(1))
        };
        let (index, obj) = match (index, obj) {
            (Some(i), Some(o)) => (i, o),
            _ => return Err(PreprocessError::new("missing index", span.clone())),
        };
        let obj = self.eval_expr(&obj)?;
        let index = self.eval_expr(&index)?;
        match (obj, index) {
            // `ast` is the registry: indexable by stable node id
            (PpValue::Builtin("ast"), PpValue::Int(i)) => {
                let id = i as usize;
                self.registry_node(id)
                    .map(|_| PpValue::Node(id))
                    .ok_or_else(|| {
                        PreprocessError::new(
                            format!("no node registered at index {}", i),
                            span.clone(),
                        )
                    })
            }
            (PpValue::List(items), PpValue::Int(i)) => Ok(items
                .get((i - 1).max(0) as usize)
                .cloned()
                .unwrap_or(PpValue::Nil)),
            (obj, _) => Err(PreprocessError::new(
                format!("cannot index a {} value", obj.type_name()),
                span.clone(),
            )),
        }
    }

    // ========================================================================
    // Calls
    // ========================================================================

    fn eval_call(&mut self, node: &NodeRef) -> PpResult<PpValue> {
        let (args, callee, span) = {
            let n = node.borrow();
            (n.slot_list(0), n.slot_node(1), n.span.clone())
        };
        let callee = callee
            .ok_or_else(|| PreprocessError::new("missing callee", span.clone()))?;
        let callee = self.eval_expr(&callee)?;
        let mut values = Vec::new();
        for arg in &args {
            values.push(self.eval_expr(arg)?);
        }
        self.call_value(&callee, values, &span)
    }

    fn call_value(&mut self, callee: &PpValue, args: Vec<PpValue>, span: &Span) -> PpResult<PpValue> {
        match callee {
            PpValue::Builtin(name) => self.call_builtin(name, args, span),
            PpValue::Func(func) => self.call_func(func.clone(), args),
            other => Err(PreprocessError::new(
                format!("cannot call a {} value", other.type_name()),
                span.clone(),
            )),
        }
    }

    fn call_func(&mut self, func: Rc<PpFunc>, args: Vec<PpValue>) -> PpResult<PpValue> {
        let mut layer = HashMap::new();
        for (param, arg) in func.params.iter().zip(args) {
            layer.insert(param.clone(), arg);
        }

        // Hygienized functions re-enter their captured checkpoint and
        // splice at their captured site
        if let Some(hygiene) = &func.hygiene {
            self.an.ctx.scopes.push_checkpoint(&hygiene.checkpoint);
            let saved = (self.target.clone(), self.index);
            self.target = hygiene.block.clone();
            self.index = hygiene.index.get();
            self.env.push(layer);
            let result = self.exec_statements(&func.body);
            self.env.pop();
            hygiene.index.set(self.index);
            self.target = saved.0;
            self.index = saved.1;
            self.an.ctx.scopes.pop_checkpoint(&hygiene.checkpoint);
            return match result? {
                Flow::Return(v) => Ok(v),
                _ => Ok(PpValue::Nil),
            };
        }

        self.env.push(layer);
        let result = self.exec_statements(&func.body);
        self.env.pop();
        match result? {
            Flow::Return(v) => Ok(v),
            _ => Ok(PpValue::Nil),
        }
    }

    fn call_builtin(&mut self, name: &str, args: Vec<PpValue>, span: &Span) -> PpResult<PpValue> {
        match name {
            "injectnode" => {
                let node = match args.first() {
                    Some(PpValue::Node(id)) => self.registry_node(*id),
                    _ => None,
                };
                let node = node.ok_or_else(|| {
                    PreprocessError::new("injectnode expects an AST node", span.clone())
                })?;
                self.substitute_directives(&node)?;
                self.add_statnode(node).map_err(|e| match e {
                    AnalyzeError::Preprocess(p) => p,
                    other => PreprocessError::new(other.to_string(), span.clone()),
                })?;
                Ok(PpValue::Nil)
            }
            "hygienize" => {
                let func = match args.into_iter().next() {
                    Some(PpValue::Func(f)) => f,
                    _ => {
                        return Err(PreprocessError::new(
                            "hygienize expects a function",
                            span.clone(),
                        ))
                    }
                };
                let hygienized = PpFunc {
                    params: func.params.clone(),
                    body: func.body.clone(),
                    hygiene: Some(Hygiene {
                        checkpoint: self.an.ctx.scopes.make_checkpoint(),
                        block: self.target.clone(),
                        index: Cell::new(self.index),
                    }),
                };
                Ok(PpValue::Func(Rc::new(hygienized)))
            }
            "afterinfer" => {
                let func = match args.into_iter().next() {
                    Some(f @ PpValue::Func(_)) => f,
                    _ => {
                        return Err(PreprocessError::new(
                            "afterinfer expects a function",
                            span.clone(),
                        ))
                    }
                };
                let handle = self.an.ctx.afterinfer_funcs.len();
                self.an.ctx.afterinfer_funcs.push(func);
                let builder = self.an.ctx.builder.clone();
                let pragma = builder.build(
                    Tag::PragmaCall,
                    span.clone(),
                    vec![Slot::Str("afterinfer".into()), Slot::Int(handle as i128)],
                );
                self.add_synthetic(pragma);
                Ok(PpValue::Nil)
            }
            "staticassert" => {
                let cond = args.first().map(|v| v.truthy()).unwrap_or(false);
                if !cond {
                    let message = match args.get(1) {
                        Some(PpValue::Str(s)) => s.clone(),
                        _ => "static assertion failed!".to_string(),
                    };
                    return Err(PreprocessError::new(message, span.clone()));
                }
                Ok(PpValue::Bool(true))
            }
            "static_error" => {
                let message = match args.first() {
                    Some(PpValue::Str(s)) => s.clone(),
                    _ => "static error!".to_string(),
                };
                Err(PreprocessError::new(message, span.clone()))
            }
            "print" => {
                let rendered: Vec<String> = args.iter().map(pp_display).collect();
                println!("{}", rendered.join("\t"));
                Ok(PpValue::Nil)
            }
            name if name.starts_with("aster.") => {
                let tag = tag_from_name(&name["aster.".len()..]).ok_or_else(|| {
                    PreprocessError::new(format!("unknown node tag '{}'", name), span.clone())
                })?;
                let builder = self.an.ctx.builder.clone();
                let mut slots = Vec::new();
                for arg in &args {
                    slots.push(self.value_to_slot(arg, span)?);
                }
                let node = builder.build(tag, span.clone(), slots);
                let id = node.borrow().id;
                Ok(PpValue::Node(id))
            }
            "primtypes" | "ast" | "aster" | "context" | "config" => Err(PreprocessError::new(
                format!("'{}' is not callable", name),
                span.clone(),
            )),
            _ => Err(PreprocessError::new(
                format!("unknown preprocess builtin '{}'", name),
                span.clone(),
            )),
        }
    }

    fn value_to_slot(&mut self, value: &PpValue, span: &Span) -> PpResult<Slot> {
        Ok(match value {
            PpValue::Nil => Slot::Nil,
            PpValue::Bool(b) => Slot::Bool(*b),
            PpValue::Int(i) => Slot::Int(*i),
            PpValue::Float(f) => Slot::Float(*f),
            PpValue::Str(s) => Slot::Str(s.clone()),
            PpValue::Node(id) => Slot::Node(self.registry_node(*id).ok_or_else(|| {
                PreprocessError::new("dangling node reference", span.clone())
            })?),
            PpValue::List(items) => {
                let mut nodes = Vec::new();
                for item in items {
                    match self.value_to_slot(item, span)? {
                        Slot::Node(n) => nodes.push(n),
                        _ => {
                            return Err(PreprocessError::new(
                                "node lists may only contain nodes",
                                span.clone(),
                            ))
                        }
                    }
                }
                Slot::List(nodes)
            }
            other => {
                return Err(PreprocessError::new(
                    format!("cannot place a {} value in a node slot", other.type_name()),
                    span.clone(),
                ))
            }
        })
    }
}

fn pp_equals(a: &PpValue, b: &PpValue) -> bool {
    match (a, b) {
        (PpValue::Nil, PpValue::Nil) => true,
        (PpValue::Bool(a), PpValue::Bool(b)) => a == b,
        (PpValue::Int(a), PpValue::Int(b)) => a == b,
        (PpValue::Float(a), PpValue::Float(b)) => a == b,
        (PpValue::Int(a), PpValue::Float(b)) | (PpValue::Float(b), PpValue::Int(a)) => {
            *a as f64 == *b
        }
        (PpValue::Str(a), PpValue::Str(b)) => a == b,
        (PpValue::Type(a), PpValue::Type(b)) => a == b,
        (PpValue::Node(a), PpValue::Node(b)) => a == b,
        _ => false,
    }
}

fn pp_to_float(v: &PpValue) -> Option<f64> {
    match v {
        PpValue::Int(i) => Some(*i as f64),
        PpValue::Float(f) => Some(*f),
        _ => None,
    }
}

fn pp_display(v: &PpValue) -> String {
    match v {
        PpValue::Nil => "nil".into(),
        PpValue::Bool(b) => b.to_string(),
        PpValue::Int(i) => i.to_string(),
        PpValue::Float(f) => f.to_string(),
        PpValue::Str(s) => s.clone(),
        PpValue::Type(t) => t.name(),
        PpValue::Node(id) => format!("node#{}", id),
        PpValue::Func(_) => "function".into(),
        PpValue::Builtin(n) => format!("builtin: {}", n),
        PpValue::List(l) => format!("list({})", l.len()),
    }
}

fn aster_builtin_name(tag: &str) -> &'static str {
    // The builtin table is static; map tag names onto interned entries
    match tag {
        "Block" => "aster.Block",
        "LocalDecl" => "aster.LocalDecl",
        "Assign" => "aster.Assign",
        "FuncDef" => "aster.FuncDef",
        "Return" => "aster.Return",
        "If" => "aster.If",
        "Clause" => "aster.Clause",
        "While" => "aster.While",
        "ForNum" => "aster.ForNum",
        "Do" => "aster.Do",
        "Break" => "aster.Break",
        "Number" => "aster.Number",
        "String" => "aster.String",
        "Boolean" => "aster.Boolean",
        "Nil" => "aster.Nil",
        "Nilptr" => "aster.Nilptr",
        "Id" => "aster.Id",
        "IdDecl" => "aster.IdDecl",
        "Paren" => "aster.Paren",
        "Call" => "aster.Call",
        "DotIndex" => "aster.DotIndex",
        "KeyIndex" => "aster.KeyIndex",
        "UnaryOp" => "aster.UnaryOp",
        "BinaryOp" => "aster.BinaryOp",
        "InitList" => "aster.InitList",
        "Pair" => "aster.Pair",
        _ => "aster.Id",
    }
}

fn tag_from_name(name: &str) -> Option<Tag> {
    let tag = match name {
        "Block" => Tag::Block,
        "LocalDecl" => Tag::LocalDecl,
        "Assign" => Tag::Assign,
        "FuncDef" => Tag::FuncDef,
        "Return" => Tag::Return,
        "If" => Tag::If,
        "Clause" => Tag::Clause,
        "While" => Tag::While,
        "ForNum" => Tag::ForNum,
        "Do" => Tag::Do,
        "Break" => Tag::Break,
        "Number" => Tag::Number,
        "String" => Tag::String,
        "Boolean" => Tag::Boolean,
        "Nil" => Tag::Nil,
        "Nilptr" => Tag::Nilptr,
        "Id" => Tag::Id,
        "IdDecl" => Tag::IdDecl,
        "Paren" => Tag::Paren,
        "Call" => Tag::Call,
        "DotIndex" => Tag::DotIndex,
        "KeyIndex" => Tag::KeyIndex,
        "UnaryOp" => Tag::UnaryOp,
        "BinaryOp" => Tag::BinaryOp,
        "InitList" => Tag::InitList,
        "Pair" => Tag::Pair,
        _ => return None,
    };
    Some(tag)
}

// The builtin name table dispatches `aster.Tag` constructors through
// `call_builtin`, so every name handed out must survive as a &'static str.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Context;
    use crate::parser::parse_source;
    use crate::types::Value;

    fn analyze(src: &str) -> Analyzer {
        let ctx = Context::new("test.skn", src);
        let root = parse_source(src, &ctx.builder).expect("parse failure");
        let mut analyzer = Analyzer::new(ctx);
        analyzer.analyze(&root).expect("analysis failure");
        analyzer
    }

    fn analyze_err(src: &str) -> AnalyzeError {
        let ctx = Context::new("test.skn", src);
        let root = parse_source(src, &ctx.builder).expect("parse failure");
        let mut analyzer = Analyzer::new(ctx);
        analyzer.analyze(&root).expect_err("expected failure")
    }

    #[test]
    fn test_staticassert_success_and_failure() {
        analyze("## staticassert(1 + 1 == 2)");
        let err = analyze_err("## staticassert(1 == 2, 'math broke')");
        assert!(err.to_string().contains("math broke"));
        let err = analyze_err("## staticassert(false)");
        assert!(err.to_string().contains("static assertion failed!"));
    }

    #[test]
    fn test_pp_variables_persist_across_blocks() {
        analyze("## answer = 42\ndo\n## staticassert(answer == 42)\nend");
    }

    #[test]
    fn test_define_lookup_chain() {
        let src = "## staticassert(DEF == 7)";
        let ctx = {
            let mut c = Context::new("test.skn", src);
            c.defines.insert("DEF".into(), Value::Int(7));
            c
        };
        let root = parse_source(src, &ctx.builder).expect("parse");
        let mut analyzer = Analyzer::new(ctx);
        analyzer.analyze(&root).expect("chain lookup failed");
    }

    #[test]
    fn test_primtypes_fallback() {
        analyze("## staticassert(primtypes.int64 == int64)");
        analyze("## staticassert(int8.bitsize == 8)");
        analyze("## staticassert(uint8.max == 255)");
    }

    #[test]
    fn test_pragma_assignment_from_pp() {
        let analyzer = analyze("## nochecks = true");
        assert!(analyzer.ctx.pragmas.nochecks());
    }

    #[test]
    fn test_invalid_pragma_value_fails() {
        let err = analyze_err("## nochecks = 'yes'");
        assert!(err.to_string().contains("invalid value for pragma"));
    }

    #[test]
    fn test_injectnode_appends_statement() {
        let analyzer = analyze(
            "## injectnode(aster.LocalDecl(aster.IdDecl('a', nil), aster.Number(1)))\n\
             local b = a + 1",
        );
        assert!(analyzer.ctx.diagnostics.is_empty());
    }

    #[test]
    fn test_expression_splice() {
        let src = "local a = #[40 + 2]#";
        let ctx = Context::new("test.skn", src);
        let root = parse_source(src, &ctx.builder).expect("parse");
        let mut analyzer = Analyzer::new(ctx);
        analyzer.analyze(&root).expect("analyze");
        let stmts = root.borrow().slot_list(0);
        let value = stmts[0].borrow().slot_node(1).unwrap();
        assert_eq!(value.borrow().attrs.value, Some(Value::Int(42)));
    }

    #[test]
    fn test_name_splice() {
        let analyzer = analyze("local #|'my' .. 'var'|# = 1\nlocal b = myvar");
        assert!(analyzer.ctx.diagnostics.is_empty());
    }

    #[test]
    fn test_pp_loop_injects_multiple_nodes() {
        let analyzer = analyze(
            "##[[\nfor i = 1, 3 do\n  injectnode(aster.LocalDecl(aster.IdDecl('v' .. i, nil), aster.Number(i)))\nend\n]]\n\
             local sum = v1 + v2 + v3",
        );
        assert!(analyzer.ctx.diagnostics.is_empty());
    }

    #[test]
    fn test_fragment_observes_earlier_sibling_types() {
        // The fragment runs after `a` is declared and analyzed
        analyze("local a = 1\n## staticassert(not unknownname_is_not_here)");
    }

    #[test]
    fn test_static_statement_count_preserved() {
        let src = "local a = 1\n## b = 2\nlocal c = 3";
        let ctx = Context::new("test.skn", src);
        let root = parse_source(src, &ctx.builder).expect("parse");
        let mut analyzer = Analyzer::new(ctx);
        analyzer.analyze(&root).expect("analyze");
        let stmts = root.borrow().slot_list(0);
        // The preprocess statement is consumed; both locals survive
        assert_eq!(stmts.len(), 2);
        assert!(stmts.iter().all(|s| s.borrow().tag == Tag::LocalDecl));
    }
}

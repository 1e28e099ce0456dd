//! Abstract syntax tree for Skarn
//!
//! Nodes are tagged variants with positional child slots and an attribute
//! bag filled in during analysis. Every node is registered in an append-only
//! registry and addressed by a stable integer index, so preprocessor code
//! can refer to nodes without holding pointers across block rebuilds.

use std::cell::RefCell;
use std::fmt::Write;
use std::rc::Rc;

use crate::types::{TypeRef, Value};

/// Source location for error reporting
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn merge(&self, other: &Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Maps byte offsets back to line/column positions
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    source: String,
    /// Byte offset of the start of each line
    line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        Self {
            source: source.to_string(),
            line_starts,
        }
    }

    /// 1-based (line, column) of a byte offset
    pub fn position(&self, offset: usize) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        (line + 1, offset - self.line_starts[line] + 1)
    }

    /// Text of a 1-based line number, without the trailing newline
    pub fn line(&self, line: usize) -> Option<&str> {
        let start = *self.line_starts.get(line.checked_sub(1)?)?;
        let end = self
            .line_starts
            .get(line)
            .map(|s| s.saturating_sub(1))
            .unwrap_or(self.source.len());
        self.source.get(start..end)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// Node tags. Leaf payloads live in the slot list, not in the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    // Statements
    Block,
    LocalDecl,
    Assign,
    FuncDef,
    Return,
    If,
    Clause,
    While,
    ForNum,
    Do,
    Break,
    // Expressions
    Number,
    String,
    Boolean,
    Nil,
    Nilptr,
    Id,
    IdDecl,
    Paren,
    Call,
    DotIndex,
    KeyIndex,
    UnaryOp,
    BinaryOp,
    InitList,
    Pair,
    // Type expressions
    Type,
    PointerType,
    ArrayType,
    RecordType,
    RecordField,
    EnumType,
    EnumField,
    UnionType,
    FuncType,
    // Preprocessing
    Preprocess,
    PreprocessExpr,
    PreprocessName,
    PragmaCall,
}

/// A positional child slot
#[derive(Debug, Clone)]
pub enum Slot {
    Nil,
    Bool(bool),
    Int(i128),
    Float(f64),
    Str(String),
    Node(NodeRef),
    List(Vec<NodeRef>),
}

impl Slot {
    pub fn as_node(&self) -> Option<&NodeRef> {
        match self {
            Slot::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[NodeRef]> {
        match self {
            Slot::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Slot::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Slot::Nil)
    }
}

/// Attributes observed or set during analysis
#[derive(Debug, Clone, Default)]
pub struct Attrs {
    /// Resolved type of the expression
    pub ty: Option<TypeRef>,
    /// Compile-time constant value
    pub value: Option<Value>,
    /// Addressable expression
    pub lvalue: bool,
    /// Fully evaluable at analysis time
    pub comptime: bool,
    /// Block transitively contains a preprocess directive
    pub needprocess: bool,
    /// `require` already inlined this module in the current unit
    pub alreadyrequired: bool,
    /// Module name resolved for a `require` call
    pub requirename: Option<String>,
    /// Loaded AST for a resolved `require` call
    pub loadedast: Option<NodeRef>,
    /// Builtin identifier this call resolves to
    pub builtin: Option<String>,
    /// Free-form flags
    pub flags: Vec<(String, Value)>,
}

impl Attrs {
    pub fn set_flag(&mut self, name: &str, value: Value) {
        if let Some(entry) = self.flags.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        } else {
            self.flags.push((name.to_string(), value));
        }
    }

    pub fn get_flag(&self, name: &str) -> Option<&Value> {
        self.flags.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

pub type NodeRef = Rc<RefCell<Node>>;

/// A single AST node: tag, ordered slots, attribute bag, registry index
#[derive(Debug)]
pub struct Node {
    pub tag: Tag,
    pub slots: Vec<Slot>,
    pub attrs: Attrs,
    pub span: Span,
    pub id: usize,
}

impl Node {
    pub fn slot_node(&self, i: usize) -> Option<NodeRef> {
        self.slots.get(i).and_then(|s| s.as_node().cloned())
    }

    pub fn slot_list(&self, i: usize) -> Vec<NodeRef> {
        self.slots
            .get(i)
            .and_then(|s| s.as_list())
            .map(|l| l.to_vec())
            .unwrap_or_default()
    }

    pub fn slot_str(&self, i: usize) -> Option<String> {
        self.slots.get(i).and_then(|s| s.as_str()).map(String::from)
    }
}

// ============================================================================
// Builder and registry
// ============================================================================

/// Allocates nodes and registers each one under a fresh stable index.
///
/// The registry is an append-only vector of owning handles; preprocessor
/// code holds indices, never pointers, so node rewrites during a block
/// rebuild do not invalidate references.
#[derive(Clone, Default)]
pub struct AstBuilder {
    registry: Rc<RefCell<Vec<NodeRef>>>,
}

impl AstBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a node, fill its slots, and assign a registry index
    pub fn build(&self, tag: Tag, span: Span, slots: Vec<Slot>) -> NodeRef {
        let mut registry = self.registry.borrow_mut();
        let id = registry.len();
        let node = Rc::new(RefCell::new(Node {
            tag,
            slots,
            attrs: Attrs::default(),
            span,
            id,
        }));
        registry.push(node.clone());
        node
    }

    /// Fetch a node by registry index
    pub fn get(&self, id: usize) -> Option<NodeRef> {
        self.registry.borrow().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.registry.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.borrow().is_empty()
    }

    /// Structural deep copy with registry reassignment for every copied
    /// node. Resolved analysis attributes are dropped so the clone can be
    /// re-analyzed; structural flags survive.
    pub fn clone_tree(&self, node: &NodeRef) -> NodeRef {
        let src = node.borrow();
        let slots = src
            .slots
            .iter()
            .map(|slot| match slot {
                Slot::Node(n) => Slot::Node(self.clone_tree(n)),
                Slot::List(l) => Slot::List(l.iter().map(|n| self.clone_tree(n)).collect()),
                other => other.clone(),
            })
            .collect();
        let cloned = self.build(src.tag, src.span.clone(), slots);
        {
            let mut c = cloned.borrow_mut();
            c.attrs.needprocess = src.attrs.needprocess;
            c.attrs.requirename = src.attrs.requirename.clone();
        }
        cloned
    }
}

// ============================================================================
// Dump printer
// ============================================================================

/// Print a tree in the `Tag { slot, ... }` dump format
pub fn dump(node: &NodeRef) -> String {
    let mut out = String::new();
    dump_node(node, 0, false, &mut out);
    out.push('\n');
    out
}

/// Like [`dump`], but includes analysis attributes on each node
pub fn dump_analyzed(node: &NodeRef) -> String {
    let mut out = String::new();
    dump_node(node, 0, true, &mut out);
    out.push('\n');
    out
}

fn dump_node(node: &NodeRef, depth: usize, attrs: bool, out: &mut String) {
    let node = node.borrow();
    let pad = "  ".repeat(depth);
    let inner = "  ".repeat(depth + 1);
    let _ = write!(out, "{}{:?} {{", pad, node.tag);
    if node.slots.is_empty() && !(attrs && has_attrs(&node.attrs)) {
        out.push('}');
        return;
    }
    out.push('\n');
    if attrs {
        if let Some(ty) = &node.attrs.ty {
            let _ = writeln!(out, "{}type = \"{}\",", inner, ty);
        }
        if let Some(value) = &node.attrs.value {
            let _ = writeln!(out, "{}value = {},", inner, value);
        }
        if node.attrs.comptime {
            let _ = writeln!(out, "{}comptime = true,", inner);
        }
        if node.attrs.lvalue {
            let _ = writeln!(out, "{}lvalue = true,", inner);
        }
    }
    for slot in &node.slots {
        dump_slot(slot, depth + 1, attrs, out);
        out.push_str(",\n");
    }
    let _ = write!(out, "{}}}", pad);
}

fn dump_slot(slot: &Slot, depth: usize, attrs: bool, out: &mut String) {
    let pad = "  ".repeat(depth);
    match slot {
        Slot::Nil => {
            let _ = write!(out, "{}nil", pad);
        }
        Slot::Bool(b) => {
            let _ = write!(out, "{}{}", pad, b);
        }
        Slot::Int(i) => {
            let _ = write!(out, "{}{}", pad, i);
        }
        Slot::Float(x) => {
            let _ = write!(out, "{}{}", pad, x);
        }
        Slot::Str(s) => {
            let _ = write!(out, "{}{:?}", pad, s);
        }
        Slot::Node(n) => dump_node(n, depth, attrs, out),
        Slot::List(items) => {
            let _ = write!(out, "{}{{", pad);
            if items.is_empty() {
                out.push('}');
                return;
            }
            out.push('\n');
            for item in items {
                dump_node(item, depth + 1, attrs, out);
                out.push_str(",\n");
            }
            let _ = write!(out, "{}}}", pad);
        }
    }
}

fn has_attrs(attrs: &Attrs) -> bool {
    attrs.ty.is_some() || attrs.value.is_some() || attrs.comptime || attrs.lvalue
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_indices_are_stable() {
        let builder = AstBuilder::new();
        let a = builder.build(Tag::Nil, Span::default(), vec![]);
        let b = builder.build(Tag::Break, Span::default(), vec![]);
        assert_eq!(a.borrow().id, 0);
        assert_eq!(b.borrow().id, 1);
        assert!(Rc::ptr_eq(&builder.get(0).unwrap(), &a));
        assert!(Rc::ptr_eq(&builder.get(1).unwrap(), &b));
    }

    #[test]
    fn test_clone_tree_reassigns_registry_ids() {
        let builder = AstBuilder::new();
        let id = builder.build(Tag::Id, Span::default(), vec![Slot::Str("print".into())]);
        let call = builder.build(
            Tag::Call,
            Span::default(),
            vec![Slot::List(vec![]), Slot::Node(id)],
        );
        let copy = builder.clone_tree(&call);
        assert_ne!(copy.borrow().id, call.borrow().id);
        let orig_callee = call.borrow().slot_node(1).unwrap();
        let copy_callee = copy.borrow().slot_node(1).unwrap();
        assert_ne!(copy_callee.borrow().id, orig_callee.borrow().id);
        assert_eq!(copy_callee.borrow().slot_str(0).unwrap(), "print");
    }

    #[test]
    fn test_source_map_positions() {
        let map = SourceMap::new("local a\nlocal b\n");
        assert_eq!(map.position(0), (1, 1));
        assert_eq!(map.position(8), (2, 1));
        assert_eq!(map.line(1), Some("local a"));
        assert_eq!(map.line(2), Some("local b"));
    }

    #[test]
    fn test_dump_shape() {
        let builder = AstBuilder::new();
        let s = builder.build(
            Tag::String,
            Span::default(),
            vec![Slot::Str("hi".into()), Slot::Nil],
        );
        let text = dump(&s);
        assert!(text.starts_with("String {"));
        assert!(text.contains("\"hi\""));
        assert!(text.contains("nil"));
    }
}

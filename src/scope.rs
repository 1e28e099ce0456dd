//! Lexical scopes, symbols, and checkpoints
//!
//! Scopes form a stack during traversal; the root scope is reused across the
//! whole translation unit. A checkpoint snapshots the visible symbol set of
//! one scope so it can be re-entered later: pushing a checkpoint stashes the
//! live symbols and restores the snapshot, popping returns to the stash.
//! Snapshots are cheap because symbols are shared `Rc` handles.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use crate::types::{TypeRef, Value};

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("symbol '{0}' was already declared with an incompatible type")]
    DuplicateSymbol(String),
    #[error("cannot pop the root scope")]
    PopRoot,
}

/// A declared name
#[derive(Debug)]
pub struct Symbol {
    pub name: String,
    /// Declared type; may stay unresolved until inference converges
    pub ty: Option<TypeRef>,
    /// Compile-time constant value, when known
    pub value: Option<Value>,
    pub lvalue: bool,
    pub comptime: bool,
    /// Registry index of the declaring AST node
    pub node_id: usize,
    /// Function with `auto` parameters, analyzed per instantiation
    pub poly: bool,
}

impl Symbol {
    pub fn new(name: &str, node_id: usize) -> Self {
        Self {
            name: name.to_string(),
            ty: None,
            value: None,
            lvalue: false,
            comptime: false,
            node_id,
            poly: false,
        }
    }
}

pub type SymbolRef = Rc<RefCell<Symbol>>;
pub type ScopeRef = Rc<RefCell<Scope>>;

/// A named environment mapping identifiers to symbols
#[derive(Debug)]
pub struct Scope {
    pub name: String,
    symbols: HashMap<String, SymbolRef>,
    parent: Option<ScopeRef>,
    /// Symbol sets stashed by checkpoint pushes
    stash: Vec<HashMap<String, SymbolRef>>,
}

impl Scope {
    fn new(name: &str, parent: Option<ScopeRef>) -> ScopeRef {
        Rc::new(RefCell::new(Scope {
            name: name.to_string(),
            symbols: HashMap::new(),
            parent,
            stash: Vec::new(),
        }))
    }
}

/// An opaque marker into a scope permitting later restoration
#[derive(Clone)]
pub struct Checkpoint {
    scope: ScopeRef,
    symbols: HashMap<String, SymbolRef>,
}

/// The scope stack driven by block traversal
pub struct ScopeStack {
    root: ScopeRef,
    current: ScopeRef,
    depth: usize,
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeStack {
    pub fn new() -> Self {
        let root = Scope::new("root", None);
        Self {
            current: root.clone(),
            root,
            depth: 0,
        }
    }

    pub fn root(&self) -> ScopeRef {
        self.root.clone()
    }

    pub fn current(&self) -> ScopeRef {
        self.current.clone()
    }

    /// Nesting depth below the root scope
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_root(&self) -> bool {
        Rc::ptr_eq(&self.current, &self.root)
    }

    pub fn push_scope(&mut self, name: &str) {
        let scope = Scope::new(name, Some(self.current.clone()));
        self.current = scope;
        self.depth += 1;
    }

    pub fn pop_scope(&mut self) -> Result<(), ScopeError> {
        let parent = self.current.borrow().parent.clone();
        match parent {
            Some(parent) => {
                self.current = parent;
                self.depth -= 1;
                Ok(())
            }
            None => Err(ScopeError::PopRoot),
        }
    }

    /// Temporarily analyze in the root scope (for `require`), returning the
    /// previous top so the caller can restore it
    pub fn enter_root(&mut self) -> (ScopeRef, usize) {
        let prev = (self.current.clone(), self.depth);
        self.current = self.root.clone();
        self.depth = 0;
        prev
    }

    pub fn leave_root(&mut self, prev: (ScopeRef, usize)) {
        self.current = prev.0;
        self.depth = prev.1;
    }

    /// Declare a symbol in the current scope. Redeclaration at the same
    /// level fails unless the type is compatible.
    pub fn declare(&mut self, symbol: Symbol) -> Result<SymbolRef, ScopeError> {
        let name = symbol.name.clone();
        let mut scope = self.current.borrow_mut();
        if let Some(existing) = scope.symbols.get(&name) {
            let compatible = match (&existing.borrow().ty, &symbol.ty) {
                (Some(a), Some(b)) => a == b,
                // Deferred-inference symbols carry no type to conflict on
                (None, None) => true,
                _ => false,
            };
            if !compatible {
                return Err(ScopeError::DuplicateSymbol(name));
            }
        }
        let symbol = Rc::new(RefCell::new(symbol));
        scope.symbols.insert(name, symbol.clone());
        Ok(symbol)
    }

    /// Look a name up, walking the parent chain. A miss is not an error
    /// here; the caller decides.
    pub fn lookup(&self, name: &str) -> Option<SymbolRef> {
        let mut scope = Some(self.current.clone());
        while let Some(s) = scope {
            let borrowed = s.borrow();
            if let Some(sym) = borrowed.symbols.get(name) {
                return Some(sym.clone());
            }
            scope = borrowed.parent.clone();
        }
        None
    }

    /// All names visible from the current scope, for suggestions
    pub fn visible_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut scope = Some(self.current.clone());
        while let Some(s) = scope {
            let borrowed = s.borrow();
            names.extend(borrowed.symbols.keys().cloned());
            scope = borrowed.parent.clone();
        }
        names
    }

    /// Snapshot the current scope's visible symbols
    pub fn make_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            scope: self.current.clone(),
            symbols: self.current.borrow().symbols.clone(),
        }
    }

    /// Restore the checkpointed symbol set, stashing the live one
    pub fn push_checkpoint(&mut self, checkpoint: &Checkpoint) {
        let mut scope = checkpoint.scope.borrow_mut();
        let live = std::mem::replace(&mut scope.symbols, checkpoint.symbols.clone());
        scope.stash.push(live);
    }

    /// Return to the symbol set stashed by the matching push
    pub fn pop_checkpoint(&mut self, checkpoint: &Checkpoint) {
        let mut scope = checkpoint.scope.borrow_mut();
        if let Some(live) = scope.stash.pop() {
            scope.symbols = live;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeContext;

    fn sym(name: &str, ty: Option<TypeRef>) -> Symbol {
        let mut s = Symbol::new(name, 0);
        s.ty = ty;
        s
    }

    #[test]
    fn test_declare_and_lookup() {
        let mut scopes = ScopeStack::new();
        let ctx = TypeContext::new();
        scopes.declare(sym("a", Some(ctx.int64.clone()))).unwrap();
        assert!(scopes.lookup("a").is_some());
        assert!(scopes.lookup("b").is_none());
    }

    #[test]
    fn test_lookup_walks_parent_chain() {
        let mut scopes = ScopeStack::new();
        let ctx = TypeContext::new();
        scopes.declare(sym("outer", Some(ctx.int64.clone()))).unwrap();
        scopes.push_scope("block");
        assert!(scopes.lookup("outer").is_some());
        scopes.declare(sym("inner", Some(ctx.int64.clone()))).unwrap();
        scopes.pop_scope().unwrap();
        assert!(scopes.lookup("inner").is_none());
    }

    #[test]
    fn test_duplicate_with_incompatible_type_fails() {
        let mut scopes = ScopeStack::new();
        let ctx = TypeContext::new();
        scopes.declare(sym("a", Some(ctx.int64.clone()))).unwrap();
        let err = scopes.declare(sym("a", Some(ctx.boolean.clone())));
        assert!(matches!(err, Err(ScopeError::DuplicateSymbol(_))));
        // Same type is a compatible redeclaration
        scopes.declare(sym("a", Some(ctx.int64.clone()))).unwrap();
    }

    #[test]
    fn test_redeclaring_untyped_symbols_is_compatible() {
        let mut scopes = ScopeStack::new();
        let mut first = Symbol::new("f", 0);
        first.poly = true;
        scopes.declare(first).unwrap();
        let mut second = Symbol::new("f", 1);
        second.poly = true;
        scopes.declare(second).unwrap();
        assert_eq!(scopes.lookup("f").unwrap().borrow().node_id, 1);
    }

    #[test]
    fn test_shadowing_in_inner_scope() {
        let mut scopes = ScopeStack::new();
        let ctx = TypeContext::new();
        scopes.declare(sym("a", Some(ctx.int64.clone()))).unwrap();
        scopes.push_scope("block");
        scopes.declare(sym("a", Some(ctx.boolean.clone()))).unwrap();
        let found = scopes.lookup("a").unwrap();
        assert_eq!(*found.borrow().ty.as_ref().unwrap().clone(), *ctx.boolean);
        scopes.pop_scope().unwrap();
        let found = scopes.lookup("a").unwrap();
        assert_eq!(*found.borrow().ty.as_ref().unwrap().clone(), *ctx.int64);
    }

    #[test]
    fn test_pop_root_fails() {
        let mut scopes = ScopeStack::new();
        assert!(matches!(scopes.pop_scope(), Err(ScopeError::PopRoot)));
    }

    #[test]
    fn test_checkpoint_restores_symbol_set() {
        let mut scopes = ScopeStack::new();
        let ctx = TypeContext::new();
        scopes.declare(sym("before", Some(ctx.int64.clone()))).unwrap();
        let cp = scopes.make_checkpoint();
        scopes.declare(sym("after", Some(ctx.int64.clone()))).unwrap();

        scopes.push_checkpoint(&cp);
        assert!(scopes.lookup("before").is_some());
        assert!(scopes.lookup("after").is_none());
        scopes.declare(sym("hygienic", Some(ctx.int64.clone()))).unwrap();
        scopes.pop_checkpoint(&cp);

        // Symbols declared under the checkpoint do not leak out
        assert!(scopes.lookup("hygienic").is_none());
        assert!(scopes.lookup("after").is_some());
    }

    #[test]
    fn test_checkpoint_reuse_does_not_leak_between_pushes() {
        let mut scopes = ScopeStack::new();
        let ctx = TypeContext::new();
        let cp = scopes.make_checkpoint();
        for _ in 0..3 {
            scopes.push_checkpoint(&cp);
            scopes.declare(sym("tmp", Some(ctx.int64.clone()))).unwrap();
            scopes.pop_checkpoint(&cp);
            assert!(scopes.lookup("tmp").is_none());
        }
    }
}

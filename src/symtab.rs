//! Lexical scopes and symbol storage (spec.md §3.3, §4.2).

use std::collections::HashMap;
use crate::diagnostics::Span;
use crate::ownership::{OwnershipState, ParamMode, Lifetime};
use crate::symbol::Symbol;
use crate::types::Ty;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind { Global, Module, Function, Block, Loop, Unsafe }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage { Stack, Static, Register }

#[derive(Debug, Clone)]
pub struct Symbol_ {
  pub name: Symbol,
  pub kind: SymKind,
  pub ty: Ty,
  pub storage: Storage,
  pub is_mutable: bool,
  pub is_exported: bool,
  pub is_initialized: bool,
  pub is_used: bool,
  pub is_parameter: bool,
  pub offset: i64,
  pub location: Span,
  pub ownership_state: OwnershipState,
  pub move_location: Option<Span>,
  pub is_copy_type: bool,
  pub needs_drop: bool,
  pub borrow_count: u32,
  pub has_mutable_borrow: bool,
  pub param_mode: ParamMode,
  pub lifetime: Option<Lifetime>,
  pub custom_drop_fn: Option<Symbol>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymKind { Var, Param, Function, Type, Const, Global }

impl Symbol_ {
  #[must_use] pub fn new(name: Symbol, kind: SymKind, ty: Ty, location: Span) -> Self {
    let is_copy_type = ty.is_copy();
    let needs_drop = ty.needs_drop();
    Self {
      name, kind, ty, storage: Storage::Stack, is_mutable: false, is_exported: false,
      is_initialized: false, is_used: false, is_parameter: false, offset: 0, location,
      ownership_state: OwnershipState::Uninitialized, move_location: None,
      is_copy_type, needs_drop, borrow_count: 0, has_mutable_borrow: false,
      param_mode: ParamMode::Owned, lifetime: None, custom_drop_fn: None,
    }
  }
}

struct Scope {
  kind: ScopeKind,
  symbols: HashMap<Symbol, Symbol_>,
  /// Declaration order, needed for reverse-order drop scheduling.
  order: Vec<Symbol>,
  /// Current stack offset for this scope; decreases monotonically and is
  /// reset to 0 at function entry.
  offset: i64,
}

pub struct SymbolTable {
  scopes: Vec<Scope>,
}

impl Default for SymbolTable {
  fn default() -> Self { Self::new() }
}

const STACK_ALIGN: i64 = 8;

impl SymbolTable {
  #[must_use] pub fn new() -> Self {
    Self { scopes: vec![Scope { kind: ScopeKind::Global, symbols: HashMap::new(), order: Vec::new(), offset: 0 }] }
  }

  pub fn push_scope(&mut self, kind: ScopeKind) {
    let offset = if kind == ScopeKind::Function { 0 } else { self.scopes.last().map_or(0, |s| s.offset) };
    self.scopes.push(Scope { kind, symbols: HashMap::new(), order: Vec::new(), offset });
  }

  /// Pops the innermost scope, returning the symbols it declared in
  /// declaration order (used by the ownership tracker to schedule drops).
  pub fn pop_scope(&mut self) -> Vec<Symbol_> {
    let scope = self.scopes.pop().expect("pop_scope on empty symbol table");
    let mut syms = scope.symbols;
    scope.order.into_iter().filter_map(|n| syms.remove(&n)).collect()
  }

  /// Defines a symbol in the current scope. Returns `false` on a name
  /// collision within that same scope (shadowing across scopes is allowed).
  pub fn define(&mut self, sym: Symbol_) -> bool {
    let scope = self.scopes.last_mut().expect("no active scope");
    if scope.symbols.contains_key(&sym.name) { return false }
    scope.order.push(sym.name);
    scope.symbols.insert(sym.name, sym);
    true
  }

  #[must_use] pub fn lookup(&self, name: Symbol) -> Option<&Symbol_> {
    self.scopes.iter().rev().find_map(|s| s.symbols.get(&name))
  }
  pub fn lookup_mut(&mut self, name: Symbol) -> Option<&mut Symbol_> {
    self.scopes.iter_mut().rev().find_map(|s| s.symbols.get_mut(&name))
  }
  #[must_use] pub fn lookup_local(&self, name: Symbol) -> Option<&Symbol_> {
    self.scopes.last().and_then(|s| s.symbols.get(&name))
  }

  /// Decrements the current scope's frame by `size` aligned to 8, returning
  /// the new (negative, rbp-relative) offset.
  pub fn allocate_local(&mut self, size: u32) -> i64 {
    let scope = self.scopes.last_mut().expect("no active scope");
    let aligned = i64::from(size.max(1)).div_ceil(STACK_ALIGN) * STACK_ALIGN;
    scope.offset -= aligned;
    scope.offset
  }

  #[must_use] pub fn in_function(&self) -> bool { self.scopes.iter().any(|s| s.kind == ScopeKind::Function) }
  #[must_use] pub fn in_loop(&self) -> bool { self.scopes.iter().rev().any(|s| s.kind == ScopeKind::Loop) }
  #[must_use] pub fn in_unsafe(&self) -> bool { self.scopes.iter().rev().any(|s| s.kind == ScopeKind::Unsafe) }
  #[must_use] pub fn depth(&self) -> usize { self.scopes.len() }
  #[must_use] pub fn current_offset(&self) -> i64 { self.scopes.last().map_or(0, |s| s.offset) }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::diagnostics::Span;
  use crate::symbol::Interner;
  use crate::types::{Ty, TypeKind, IntWidth};

  #[test]
  fn scope_discipline_hides_inner_symbols() {
    let mut i = Interner::new();
    let x = i.intern("x");
    let mut st = SymbolTable::new();
    let before = st.current_offset();
    st.push_scope(ScopeKind::Block);
    st.define(Symbol_::new(x, SymKind::Var, Ty::new(TypeKind::Int(IntWidth::I32)), Span::default()));
    assert!(st.lookup(x).is_some());
    st.pop_scope();
    assert!(st.lookup(x).is_none());
    assert_eq!(st.current_offset(), before);
  }

  #[test]
  fn collision_in_same_scope_rejected() {
    let mut i = Interner::new();
    let x = i.intern("x");
    let mut st = SymbolTable::new();
    st.push_scope(ScopeKind::Function);
    assert!(st.define(Symbol_::new(x, SymKind::Var, Ty::new(TypeKind::Bool), Span::default())));
    assert!(!st.define(Symbol_::new(x, SymKind::Var, Ty::new(TypeKind::Bool), Span::default())));
  }

  #[test]
  fn allocate_local_aligns_to_8() {
    let mut st = SymbolTable::new();
    st.push_scope(ScopeKind::Function);
    assert_eq!(st.allocate_local(1), -8);
    assert_eq!(st.allocate_local(8), -16);
    assert_eq!(st.allocate_local(9), -24);
  }
}

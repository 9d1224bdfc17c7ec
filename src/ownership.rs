//! Ownership, borrow and lifetime tracking (spec.md §3.4, §4.3).
//!
//! The tracker is a finite-state monitor layered over [`crate::symtab::SymbolTable`]:
//! it reads and mutates each symbol's ownership fields and keeps the global
//! list of active borrows, but delegates scope push/pop and name resolution
//! to the symbol table itself.

use crate::diagnostics::{DiagnosticList, Span};
use crate::symbol::Symbol;
use crate::symtab::{ScopeKind, SymbolTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipState { Uninitialized, Owned, Moved, BorrowedShared, BorrowedMut, PartiallyMoved }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamMode { Owned, Borrow, BorrowMut, Copy }

impl ParamMode {
  /// Infers the parameter mode from a textual type annotation, per spec.md §4.3:
  /// `&mut ` -> BorrowMut, `&` -> Borrow, primitive/pointer -> Copy, else Owned.
  #[must_use] pub fn from_annotation(annotation: &str, is_primitive_or_pointer: bool) -> Self {
    if annotation.starts_with("&mut ") { ParamMode::BorrowMut }
    else if annotation.starts_with('&') { ParamMode::Borrow }
    else if is_primitive_or_pointer { ParamMode::Copy }
    else { ParamMode::Owned }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime { pub name: Symbol, pub scope_depth: usize, pub is_static: bool }

impl Lifetime {
  /// Smaller scope depth outlives larger; `'static` outlives everything.
  #[must_use] pub fn outlives(&self, other: &Lifetime) -> bool {
    self.is_static || (!other.is_static && self.scope_depth <= other.scope_depth)
  }
}

#[derive(Debug, Clone)]
struct BorrowRecord {
  target: Symbol,
  #[allow(dead_code)]
  borrower: Symbol,
  #[allow(dead_code)]
  location: Span,
  is_mutable: bool,
  scope_depth: usize,
  #[allow(dead_code)]
  lifetime: Option<Lifetime>,
}

#[derive(Debug, Clone)]
pub struct Drop_ { pub name: Symbol, pub drop_fn: Option<Symbol>, pub type_name: String }

#[derive(Default)]
pub struct OwnershipTracker {
  borrows: Vec<BorrowRecord>,
  /// Names per declaration whose drop was suppressed because the value was
  /// moved into another binding (so the destination drops it instead).
  function_param_names: Vec<Vec<Symbol>>,
}

impl OwnershipTracker {
  #[must_use] pub fn new() -> Self { Self::default() }

  pub fn init_var(&self, st: &mut SymbolTable, name: Symbol) {
    if let Some(s) = st.lookup_mut(name) { s.ownership_state = OwnershipState::Uninitialized; }
  }

  pub fn mark_initialized(&self, st: &mut SymbolTable, name: Symbol) {
    if let Some(s) = st.lookup_mut(name) {
      s.ownership_state = OwnershipState::Owned;
      s.is_initialized = true;
    }
  }

  /// `checkUsable`: a value may be read only while `Owned`, `BorrowedShared`
  /// or `BorrowedMut` (itself, as the owner reading through its own borrow);
  /// `Uninitialized`/`Moved`/`PartiallyMoved` are errors.
  pub fn check_usable(&self, st: &SymbolTable, name: Symbol, diags: &mut DiagnosticList, span: Span) -> bool {
    let Some(s) = st.lookup(name) else { return true };
    match s.ownership_state {
      OwnershipState::Uninitialized => {
        diags.error(format!("use of uninitialized '{}'", st_name(st, name)), span);
        false
      }
      OwnershipState::Moved | OwnershipState::PartiallyMoved => {
        let at = s.move_location.map_or(String::new(), |l| format!(", moved at {l}"));
        diags.error(format!("use of moved value '{}'{}", st_name(st, name), at), span);
        false
      }
      _ => true,
    }
  }

  pub fn record_move(&mut self, st: &mut SymbolTable, name: Symbol, loc: Span, diags: &mut DiagnosticList) {
    let Some(s) = st.lookup_mut(name) else { return };
    if s.is_copy_type { return }
    if s.borrow_count > 0 {
      diags.error(format!("cannot move '{}' while borrowed", s.name_placeholder()), loc);
      return;
    }
    s.ownership_state = OwnershipState::Moved;
    s.move_location = Some(loc);
  }

  pub fn record_borrow(
    &mut self, st: &mut SymbolTable, name: Symbol, borrower: Symbol,
    is_mutable: bool, loc: Span, scope_depth: usize, lifetime: Option<Lifetime>,
    diags: &mut DiagnosticList,
  ) -> bool {
    let Some(s) = st.lookup_mut(name) else { return false };
    if is_mutable {
      if s.borrow_count > 0 {
        diags.error(format!("'{}' already borrowed", st_name_sym(st, name)), loc);
        return false;
      }
      if !s.is_mutable {
        diags.error(format!("'{}' is not declared mutable", st_name_sym(st, name)), loc);
        return false;
      }
      s.ownership_state = OwnershipState::BorrowedMut;
      s.has_mutable_borrow = true;
    } else {
      if s.has_mutable_borrow {
        diags.error(format!("cannot borrow '{}' as shared while mutably borrowed", st_name_sym(st, name)), loc);
        return false;
      }
      s.ownership_state = OwnershipState::BorrowedShared;
    }
    s.borrow_count += 1;
    self.borrows.push(BorrowRecord { target: name, borrower, location: loc, is_mutable, scope_depth, lifetime });
    true
  }

  /// `checkCanBorrow`: would a new borrow of `name` (with the given
  /// mutability) be legal right now.
  #[must_use] pub fn check_can_borrow(&self, st: &SymbolTable, name: Symbol, is_mutable: bool) -> bool {
    let Some(s) = st.lookup(name) else { return false };
    if is_mutable { s.borrow_count == 0 && s.is_mutable } else { !s.has_mutable_borrow }
  }

  /// Ends all borrows whose `scope_depth` is at least `depth` (i.e. those
  /// that live inside the scope being popped), restoring `Owned` on the
  /// target when no borrows remain.
  pub fn end_borrows_at_scope(&mut self, st: &mut SymbolTable, depth: usize) {
    let (ending, remaining): (Vec<_>, Vec<_>) = self.borrows.drain(..).partition(|b| b.scope_depth >= depth);
    self.borrows = remaining;
    for b in ending {
      if let Some(s) = st.lookup_mut(b.target) {
        s.borrow_count = s.borrow_count.saturating_sub(1);
        if b.is_mutable { s.has_mutable_borrow = false; }
        if s.borrow_count == 0 && matches!(s.ownership_state, OwnershipState::BorrowedShared | OwnershipState::BorrowedMut) {
          s.ownership_state = OwnershipState::Owned;
        }
      }
    }
  }

  /// `checkLifetimeValid`: a borrow's lifetime must not outlive the
  /// borrowed value's lifetime.
  #[must_use] pub fn check_lifetime_valid(&self, borrow: &Lifetime, borrowed: &Lifetime, diags: &mut DiagnosticList, loc: Span) -> bool {
    if borrow.outlives(borrowed) && !borrowed.is_static {
      diags.error("borrow outlives the value it borrows from", loc);
      return false;
    }
    true
  }

  #[must_use] pub fn create_lifetime(&self, name: Symbol, scope_depth: usize) -> Lifetime {
    Lifetime { name, scope_depth, is_static: false }
  }
  #[must_use] pub fn static_lifetime(&self, name: Symbol) -> Lifetime { Lifetime { name, scope_depth: 0, is_static: true } }

  pub fn enter_function(&mut self, param_modes: Vec<Symbol>) {
    self.function_param_names.push(param_modes);
  }
  pub fn exit_function(&mut self) { self.function_param_names.pop(); }

  /// `getDropsForScope`: the variables a just-popped scope must drop, in
  /// reverse declaration order. A variable counts only if it is still
  /// `Owned`, `needsDrop`, and was not passed to this scope by borrow.
  #[must_use] pub fn get_drops_for_scope(&self, declared: &[crate::symtab::Symbol_]) -> Vec<Drop_> {
    declared.iter().rev()
      .filter(|s| s.ownership_state == OwnershipState::Owned
        && s.needs_drop
        && !matches!(s.param_mode, ParamMode::Borrow | ParamMode::BorrowMut))
      .map(|s| Drop_ { name: s.name, drop_fn: s.custom_drop_fn, type_name: s.ty.to_string() })
      .collect()
  }
}

fn st_name(st: &SymbolTable, name: Symbol) -> String { st_name_sym(st, name) }
fn st_name_sym(_st: &SymbolTable, name: Symbol) -> String { format!("sym{}", name.into_usize()) }

impl crate::symtab::Symbol_ {
  fn name_placeholder(&self) -> String { format!("sym{}", self.name.into_usize()) }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::diagnostics::Span;
  use crate::symbol::Interner;
  use crate::symtab::{SymKind, Symbol_};
  use crate::types::{Ty, TypeKind};

  fn setup() -> (SymbolTable, OwnershipTracker, Symbol) {
    let mut i = Interner::new();
    let x = i.intern("x");
    let mut st = SymbolTable::new();
    st.push_scope(ScopeKind::Function);
    let mut sym = Symbol_::new(x, SymKind::Var, Ty::new(TypeKind::String), Span::default());
    sym.is_mutable = true;
    st.define(sym);
    let tr = OwnershipTracker::new();
    (st, tr, x)
  }

  #[test]
  fn move_then_use_is_error() {
    let (mut st, mut tr, x) = setup();
    tr.mark_initialized(&mut st, x);
    let mut diags = DiagnosticList::new();
    tr.record_move(&mut st, x, Span::default(), &mut diags);
    assert!(!tr.check_usable(&st, x, &mut diags, Span::default()));
    assert!(diags.has_errors());
  }

  #[test]
  fn mutable_and_shared_borrows_are_exclusive() {
    let (mut st, mut tr, x) = setup();
    tr.mark_initialized(&mut st, x);
    let mut diags = DiagnosticList::new();
    let borrower = x;
    assert!(tr.record_borrow(&mut st, x, borrower, true, Span::default(), 1, None, &mut diags));
    assert!(!tr.record_borrow(&mut st, x, borrower, false, Span::default(), 1, None, &mut diags));
    assert!(diags.has_errors());
  }

  #[test]
  fn borrow_ends_restore_owned() {
    let (mut st, mut tr, x) = setup();
    tr.mark_initialized(&mut st, x);
    let mut diags = DiagnosticList::new();
    tr.record_borrow(&mut st, x, x, false, Span::default(), 1, None, &mut diags);
    assert_eq!(st.lookup(x).unwrap().ownership_state, OwnershipState::BorrowedShared);
    tr.end_borrows_at_scope(&mut st, 1);
    assert_eq!(st.lookup(x).unwrap().ownership_state, OwnershipState::Owned);
  }

  #[test]
  fn drops_for_scope_are_reverse_declaration_order_and_skip_borrows() {
    let mut i = Interner::new();
    let (a, b, c, drop_fn) = (i.intern("a"), i.intern("b"), i.intern("c"), i.intern("drop"));
    let record_ty = Ty::new(TypeKind::Record(i.intern("Guard"), vec![]));
    let mut sa = Symbol_::new(a, SymKind::Var, record_ty.clone(), Span::default());
    sa.custom_drop_fn = Some(drop_fn);
    sa.ownership_state = OwnershipState::Owned;
    let mut sb = Symbol_::new(b, SymKind::Var, record_ty.clone(), Span::default());
    sb.custom_drop_fn = Some(drop_fn);
    sb.ownership_state = OwnershipState::Owned;
    let mut sc = Symbol_::new(c, SymKind::Param, record_ty, Span::default());
    sc.custom_drop_fn = Some(drop_fn);
    sc.ownership_state = OwnershipState::Owned;
    sc.param_mode = ParamMode::Borrow;
    let declared = vec![sa, sb, sc];
    let tr = OwnershipTracker::new();
    let drops = tr.get_drops_for_scope(&declared);
    assert_eq!(drops.len(), 2);
    assert_eq!(drops[0].name, b);
    assert_eq!(drops[1].name, a);
    assert_eq!(drops[0].type_name, "Guard");
  }

  #[test]
  fn lifetime_outlives_rules() {
    let mut i = Interner::new();
    let n = i.intern("'a");
    let l_static = Lifetime { name: n, scope_depth: 0, is_static: true };
    let l_outer = Lifetime { name: n, scope_depth: 1, is_static: false };
    let l_inner = Lifetime { name: n, scope_depth: 2, is_static: false };
    assert!(l_static.outlives(&l_inner));
    assert!(l_outer.outlives(&l_inner));
    assert!(!l_inner.outlives(&l_outer));
  }
}

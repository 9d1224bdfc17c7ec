//! Loop vectorizer tagging pass (spec.md §4.7 "Vectorizer").
//!
//! Runs before codegen and leaves its verdict in a side table keyed by
//! `NodeId`, the same shape the original's `vectorizer.cpp` uses to tag AST
//! nodes without mutating the tree itself (SPEC_FULL.md §4). The codegen
//! consults `VectorTags::get` when lowering a `for` loop and falls back to
//! scalar emission whenever no tag is present.

use std::collections::HashMap;

use crate::ast::{BinOp, Expr, NodeId, Stmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimdWidth {
  /// 2 doubles per register (SSE2).
  Sse2x2,
  /// 4 singles per register (SSE).
  Ssex4,
  /// 8 singles per register (AVX).
  Avxx8,
}

impl SimdWidth {
  #[must_use] pub fn lanes(self) -> u32 {
    match self { SimdWidth::Sse2x2 => 2, SimdWidth::Ssex4 => 4, SimdWidth::Avxx8 => 8 }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorTag { Reduction(SimdWidth), ElementWise(SimdWidth) }

#[derive(Debug, Default)]
pub struct VectorTags(HashMap<NodeId, VectorTag>);

impl VectorTags {
  #[must_use] pub fn get(&self, id: NodeId) -> Option<VectorTag> { self.0.get(&id).copied() }
}

const MIN_TRIP_COUNT: u64 = 4;

/// Analyses every `for` loop with a statically known trip count and tags
/// those that are safe to vectorize. Rejects loops containing I/O, nested
/// control flow, or unknown trip counts — anything not provably a simple
/// reduction or element-wise array op is left untagged and falls back to
/// scalar codegen.
pub fn analyze(stmts: &[Stmt]) -> VectorTags {
  let mut tags = VectorTags::default();
  for s in stmts { visit_stmt(s, &mut tags); }
  tags
}

fn visit_stmt(stmt: &Stmt, tags: &mut VectorTags) {
  match stmt {
    Stmt::For { iterable, body, .. } => {
      if let Some(trip_count) = known_trip_count(iterable) {
        if trip_count >= MIN_TRIP_COUNT {
          if let Some(kind) = classify_body(body) {
            if let Some(first_id) = body.stmts.first().map(stmt_node_id) {
              tags.0.insert(first_id, kind);
            }
          }
        }
      }
      for s in &body.stmts { visit_stmt(s, tags); }
    }
    Stmt::While { body, .. } | Stmt::Loop { body, .. } | Stmt::Unsafe(body) => {
      for s in &body.stmts { visit_stmt(s, tags); }
    }
    Stmt::If { then_blk, else_blk, .. } => {
      for s in &then_blk.stmts { visit_stmt(s, tags); }
      if let Some(b) = else_blk { for s in &b.stmts { visit_stmt(s, tags); } }
    }
    _ => {}
  }
}

fn stmt_node_id(stmt: &Stmt) -> NodeId {
  match stmt {
    Stmt::Expr(e) => e.id(),
    _ => 0,
  }
}

/// Only a literal-bounded `range(0, N)` iterable has a trip count knowable
/// without running CTFE; anything else (a variable bound, a list) defers to
/// scalar codegen.
fn known_trip_count(iterable: &Expr) -> Option<u64> {
  if let Expr::Call { callee, args, .. } = iterable {
    if let Expr::Ident(name, ..) = &**callee {
      if crate::types::ty::resolve_name(*name).as_deref() == Some("range") {
        if let [Expr::Literal(crate::ast::Literal::Int(lo, _), ..), Expr::Literal(crate::ast::Literal::Int(hi, _), ..)] = args.as_slice() {
          return u64::try_from(hi - lo).ok();
        }
      }
    }
  }
  None
}

/// Rejects anything but a single statement, and only accepts a `+=`-style
/// reduction or a flat element-wise assignment into an indexed array.
fn classify_body(body: &crate::ast::Block) -> Option<VectorTag> {
  if body.stmts.len() != 1 { return None }
  let Stmt::Expr(expr) = &body.stmts[0] else { return None };
  match expr {
    Expr::Assign { target, value, .. } => {
      if has_control_flow_or_io(value) { return None }
      match &**target {
        Expr::Ident(..) => Some(VectorTag::Reduction(SimdWidth::Sse2x2)),
        Expr::Index { .. } => Some(VectorTag::ElementWise(SimdWidth::Ssex4)),
        _ => None,
      }
    }
    _ => None,
  }
}

/// Conservative I/O and call rejection: any call at all disqualifies a loop
/// body from vectorization, since codegen cannot prove it is side-effect
/// free without an effect system pass over arbitrary functions.
fn has_control_flow_or_io(expr: &Expr) -> bool {
  match expr {
    Expr::Call { .. } | Expr::MethodCall { .. } | Expr::Perform { .. } | Expr::Handle { .. } => true,
    Expr::Binary { op, lhs, rhs, .. } => {
      matches!(op, BinOp::And | BinOp::Or) || has_control_flow_or_io(lhs) || has_control_flow_or_io(rhs)
    }
    Expr::Index { base, index, .. } => has_control_flow_or_io(base) || has_control_flow_or_io(index),
    Expr::Unary { operand, .. } | Expr::Deref { expr: operand, .. } | Expr::Borrow { expr: operand, .. } => {
      has_control_flow_or_io(operand)
    }
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::diagnostics::Span;
  use crate::ast::{Block, Literal};
  use crate::symbol::Interner;

  #[test]
  fn short_loop_body_is_untagged() {
    let body = Block { stmts: vec![], span: Span::default() };
    assert!(classify_body(&body).is_none());
  }

  #[test]
  fn element_wise_assign_is_tagged() {
    let mut i = Interner::new();
    let arr = i.intern("arr");
    let idx = i.intern("i");
    let body = Block {
      stmts: vec![Stmt::Expr(Expr::Assign {
        target: Box::new(Expr::Index {
          base: Box::new(Expr::Ident(arr, 0, Span::default())),
          index: Box::new(Expr::Ident(idx, 0, Span::default())),
          id: 0, span: Span::default(),
        }),
        value: Box::new(Expr::Literal(Literal::Int(1, None), 0, Span::default())),
        id: 3, span: Span::default(),
      })],
      span: Span::default(),
    };
    assert_eq!(classify_body(&body), Some(VectorTag::ElementWise(SimdWidth::Ssex4)));
  }

  #[test]
  fn unknown_trip_count_is_not_analyzed() {
    let mut i = Interner::new();
    let x = i.intern("x");
    let not_range = Expr::Ident(x, 0, Span::default());
    assert_eq!(known_trip_count(&not_range), None);
  }
}

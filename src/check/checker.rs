//! The type checker: an AST visitor that infers expression types, applies
//! ownership rules, resolves trait methods, monomorphises generics, and
//! registers builtin signatures (spec.md §4.4).

use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::*;
use crate::builtins::{is_unsafe_builtin_name, Builtin};
use crate::diagnostics::{DiagnosticList, Span};
use crate::ownership::{OwnershipTracker, ParamMode};
use crate::symbol::Symbol;
use crate::symtab::{ScopeKind, SymKind, SymbolTable, Symbol_};
use crate::types::ty::TypeKind;
use crate::types::{Ty, TypeRegistry};
use super::ctfe::{CtfeInterpreter, TypeMetadata};

/// Runtime signature for a free function / method, used both by
/// user-defined declarations and by the ~140 registered builtins.
#[derive(Debug, Clone)]
pub struct FnSig {
  pub params: Vec<Ty>,
  pub ret: Ty,
  pub is_comptime: bool,
}

/// A resolved `impl` block: `{type_name, trait_name, methods}`.
#[derive(Debug, Clone)]
pub struct ImplBlock {
  pub trait_name: Option<Symbol>,
  pub type_name: String,
  pub methods: HashMap<Symbol, FnSig>,
}

pub struct TypeChecker<'r> {
  pub registry: &'r mut TypeRegistry,
  pub symtab: SymbolTable,
  pub ownership: OwnershipTracker,
  pub diagnostics: DiagnosticList,
  pub expr_types: HashMap<NodeId, Ty>,
  pub functions: HashMap<Symbol, FnSig>,
  pub comptime_functions: HashMap<Symbol, Rc<FunctionDecl>>,
  pub generic_functions: HashMap<Symbol, Rc<FunctionDecl>>,
  pub impls: Vec<ImplBlock>,
  pub type_metadata: HashMap<Symbol, TypeMetadata>,
  pub extern_functions: HashMap<Symbol, FnSig>,
  pub expected_return: Option<Ty>,
  /// `typeName -> drop method` registered by `impl Drop for T` (spec.md §3.5).
  pub drop_impls: HashMap<String, Symbol>,
  /// The drop schedule computed for each block, keyed by the block's own
  /// span (blocks carry no `NodeId`); consumed by codegen at scope exit.
  pub drops_by_block: HashMap<Span, Vec<crate::ownership::Drop_>>,
  /// Scope depth at function entry, for each function currently being
  /// checked; used to flag `return &local` as a dangling reference.
  fn_scope_depths: Vec<usize>,
  loop_depth: u32,
  /// Every distinct set of type arguments a generic function was ever
  /// called with, keyed by the function's own name; codegen emits one
  /// monomorphised body per entry instead of the generic body unmangled.
  pub generic_instantiations: HashMap<Symbol, std::collections::HashSet<Vec<String>>>,
  /// The type arguments resolved for one particular call site, keyed by the
  /// call expression's `NodeId`, so codegen can mangle that call's target.
  pub generic_instantiations_by_call: HashMap<NodeId, Vec<String>>,
}

impl<'r> TypeChecker<'r> {
  #[must_use] pub fn new(registry: &'r mut TypeRegistry) -> Self {
    let mut c = Self {
      registry, symtab: SymbolTable::new(), ownership: OwnershipTracker::new(),
      diagnostics: DiagnosticList::new(), expr_types: HashMap::new(),
      functions: HashMap::new(), comptime_functions: HashMap::new(),
      generic_functions: HashMap::new(), impls: Vec::new(), type_metadata: HashMap::new(),
      extern_functions: HashMap::new(), expected_return: None,
      drop_impls: HashMap::new(), drops_by_block: HashMap::new(), fn_scope_depths: Vec::new(),
      loop_depth: 0, generic_instantiations: HashMap::new(), generic_instantiations_by_call: HashMap::new(),
    };
    c.register_builtins();
    c
  }

  fn register_builtins(&mut self) {
    let any = Ty::new(TypeKind::Any);
    let void = Ty::new(TypeKind::Void);
    let string = Ty::new(TypeKind::String);
    let boolean = Ty::new(TypeKind::Bool);
    for &b in Builtin::all() {
      let sym = self.registry.intern(b.as_str());
      let sig = match b {
        Builtin::Print | Builtin::Println => FnSig { params: vec![any.clone()], ret: void.clone(), is_comptime: false },
        Builtin::Len => FnSig { params: vec![any.clone()], ret: Ty::new(TypeKind::Int(crate::types::IntWidth::IDefault)), is_comptime: true },
        Builtin::Str => FnSig { params: vec![any.clone()], ret: string.clone(), is_comptime: true },
        Builtin::IsOk | Builtin::IsErr | Builtin::Contains | Builtin::StartsWith | Builtin::EndsWith => {
          FnSig { params: vec![any.clone(), any.clone()], ret: boolean.clone(), is_comptime: false }
        }
        _ => FnSig { params: vec![any.clone()], ret: any.clone(), is_comptime: false },
      };
      self.functions.insert(sym, sig);
    }
  }

  pub fn check_program(&mut self, program: &Program) {
    // Forward-declare all top-level items first so mutually recursive
    // functions / types resolve regardless of source order.
    for item in &program.items { self.forward_declare(item); }
    for item in &program.items { self.check_item(item); }
  }

  fn forward_declare(&mut self, item: &Item) {
    match item {
      Item::Function(f) => {
        let params: Vec<Ty> = f.params.iter().map(|p| self.registry.from_string(&p.ty)).collect();
        let ret = f.ret.as_deref().map_or(Ty::new(TypeKind::Void), |r| self.registry.from_string(r));
        self.functions.insert(f.name, FnSig { params, ret, is_comptime: f.is_comptime });
        if f.is_comptime { self.comptime_functions.insert(f.name, Rc::new(f.clone())); }
        if !f.type_params.is_empty() { self.generic_functions.insert(f.name, Rc::new(f.clone())); }
      }
      Item::Record(r) => {
        let fields: Vec<crate::types::ty::Field> = r.fields.iter()
          .map(|fd| crate::types::ty::Field { name: fd.name, ty: self.registry.from_string(&fd.ty) })
          .collect();
        let ty = Ty::new(TypeKind::Record(r.name, fields.clone()));
        self.registry.register_named(r.name, ty);
        let size = fields.iter().filter_map(|f| f.ty.size_of()).sum();
        self.type_metadata.insert(r.name, TypeMetadata {
          name: crate::types::ty::resolve_name(r.name).unwrap_or_default(),
          fields: fields.into_iter().map(|f| (f.name, f.ty)).collect(),
          methods: vec![], size, align: 8,
        });
      }
      Item::Trait(t) => {
        let methods = t.methods.iter().map(|m| crate::types::ty::MethodSig {
          name: m.name,
          params: m.params.iter().map(|p| self.registry.from_string(&p.ty)).collect(),
          ret: m.ret.as_deref().map_or(Ty::new(TypeKind::Void), |r| self.registry.from_string(r)),
          has_default_impl: m.has_default_impl,
        }).collect();
        self.registry.register_trait(crate::types::ty::TraitRef { name: t.name, methods, super_traits: t.super_traits.clone() });
      }
      Item::Effect(e) => {
        let operations = e.operations.iter().map(|o| crate::types::ty::MethodSig {
          name: o.name,
          params: o.params.iter().map(|p| self.registry.from_string(&p.ty)).collect(),
          ret: o.ret.as_deref().map_or(Ty::new(TypeKind::Void), |r| self.registry.from_string(r)),
          has_default_impl: false,
        }).collect();
        self.registry.register_effect(crate::types::ty::EffectRef { name: e.name, args: vec![], operations });
      }
      Item::ExternImport { functions, .. } => {
        for f in functions {
          let params = f.params.iter().map(|p| self.registry.from_string(&p.ty)).collect();
          let ret = self.registry.from_string(&f.ret);
          self.extern_functions.insert(f.name, FnSig { params, ret, is_comptime: false });
        }
      }
      _ => {}
    }
  }

  fn check_item(&mut self, item: &Item) {
    match item {
      Item::Function(f) => self.check_function(f),
      Item::Impl(i) => self.check_impl(i),
      Item::Global { name, ty, init, is_mutable, span } => {
        let declared = ty.as_deref().map(|t| self.registry.from_string(t));
        let inferred = init.as_ref().map(|e| self.check_expr(e));
        let final_ty = declared.or(inferred).unwrap_or(Ty::new(TypeKind::Unknown));
        self.symtab.push_scope(ScopeKind::Global);
        let mut sym = Symbol_::new(*name, SymKind::Global, final_ty, *span);
        sym.is_mutable = *is_mutable;
        sym.is_initialized = init.is_some();
        self.symtab.define(sym);
        self.symtab.pop_scope();
      }
      Item::Const { name, init, span, .. } => {
        let ty = self.check_expr(init);
        self.symtab.push_scope(ScopeKind::Global);
        let mut sym = Symbol_::new(*name, SymKind::Const, ty, *span);
        sym.is_initialized = true;
        self.symtab.define(sym);
        self.symtab.pop_scope();
      }
      _ => {}
    }
  }

  fn check_impl(&mut self, imp: &ImplDecl) {
    let target = self.registry.from_string(&imp.target_type);
    let type_name = target.to_string();
    let mut methods = HashMap::new();
    for m in &imp.methods {
      let params: Vec<Ty> = m.params.iter().map(|p| self.registry.from_string(&p.ty)).collect();
      let ret = m.ret.as_deref().map_or(Ty::new(TypeKind::Void), |r| self.registry.from_string(r));
      methods.insert(m.name, FnSig { params, ret, is_comptime: false });
    }
    if let Some(trait_sym) = imp.trait_name {
      if crate::types::ty::resolve_name(trait_sym).as_deref() == Some("Drop") {
        if let Some(drop_method) = imp.methods.iter().find(|m| crate::types::ty::resolve_name(m.name).as_deref() == Some("drop")) {
          self.drop_impls.insert(type_name.clone(), drop_method.name);
        }
      }
      if let Some(tr) = self.registry.lookup_trait(trait_sym).cloned() {
        for req in &tr.methods {
          if !req.has_default_impl && !methods.contains_key(&req.name) {
            self.diagnostics.error(
              format!("missing implementation of trait method '{}' for '{}'", crate::types::ty::resolve_name(req.name).unwrap_or_default(), type_name),
              imp.span);
          }
        }
        for sup in &tr.super_traits {
          if self.registry.find_impl(&type_name, *sup).is_none() {
            self.diagnostics.error(format!("missing super-trait implementation for '{}'", type_name), imp.span);
          }
        }
      }
      let sig_methods: HashMap<Symbol, crate::types::ty::MethodSig> = methods.iter()
        .map(|(k, v)| (*k, crate::types::ty::MethodSig { name: *k, params: v.params.clone(), ret: v.ret.clone(), has_default_impl: false }))
        .collect();
      self.registry.register_impl(crate::types::TraitImpl {
        trait_name: trait_sym, type_name: type_name.clone(), type_args: vec![], methods: sig_methods,
      });
    }
    self.impls.push(ImplBlock { trait_name: imp.trait_name, type_name, methods });
    for m in &imp.methods { self.check_function_body(&m.params, m.ret.as_deref(), &m.body); }
  }

  fn check_function(&mut self, f: &FunctionDecl) {
    self.check_function_body(&f.params, f.ret.as_deref(), &f.body);
  }

  fn check_function_body(&mut self, params: &[Param], ret: Option<&str>, body: &Block) {
    self.symtab.push_scope(ScopeKind::Function);
    let fn_depth = self.symtab.depth();
    self.fn_scope_depths.push(fn_depth);
    let ret_ty = ret.map_or(Ty::new(TypeKind::Void), |r| self.registry.from_string(r));
    let ret_is_ref = matches!(&*ret_ty.kind, TypeKind::Ptr(_, false));
    let prev_ret = self.expected_return.replace(ret_ty);
    let mut param_names = Vec::new();
    let mut ref_param_count = 0usize;
    let mut has_self_ref = false;
    for p in params {
      let ty = self.registry.from_string(&p.ty);
      let mode = ParamMode::from_annotation(&p.ty, ty.is_copy());
      if matches!(mode, ParamMode::Borrow | ParamMode::BorrowMut) {
        ref_param_count += 1;
        if crate::types::ty::resolve_name(p.name).as_deref() == Some("self") { has_self_ref = true; }
      }
      let mut sym = Symbol_::new(p.name, SymKind::Param, ty, p.span);
      sym.is_parameter = true;
      sym.is_initialized = true;
      sym.is_mutable = matches!(mode, ParamMode::BorrowMut);
      sym.ownership_state = crate::ownership::OwnershipState::Owned;
      sym.param_mode = mode;
      sym.lifetime = Some(self.ownership.create_lifetime(p.name, fn_depth));
      sym.offset = self.symtab.allocate_local(8);
      self.symtab.define(sym);
      param_names.push(p.name);
    }
    // spec.md §4.3 lifetime elision: a single reference input (or a `self`
    // receiver among several) silently supplies the return's lifetime;
    // anything else with a reference return needs an explicit annotation.
    if ret_is_ref && ref_param_count > 1 && !has_self_ref {
      self.diagnostics.warning(
        "function has multiple reference parameters and a reference return type; lifetime elision is ambiguous without an explicit annotation",
        body.span);
    }
    self.ownership.enter_function(param_names);
    self.check_block(body);
    self.ownership.exit_function();
    let declared = self.symtab.pop_scope();
    self.warn_unused(&declared);
    self.expected_return = prev_ret;
    self.fn_scope_depths.pop();
  }

  fn warn_unused(&mut self, declared: &[Symbol_]) {
    for s in declared {
      let name = crate::types::ty::resolve_name(s.name).unwrap_or_default();
      if !s.is_used && !name.starts_with('_') && !name.is_empty() {
        self.diagnostics.warning(format!("unused variable '{name}'"), s.location);
      }
    }
  }

  fn check_block(&mut self, block: &Block) -> Ty {
    self.symtab.push_scope(ScopeKind::Block);
    let mut last = Ty::new(TypeKind::Void);
    for stmt in &block.stmts { last = self.check_stmt(stmt); }
    let depth = self.symtab.depth();
    self.ownership.end_borrows_at_scope(&mut self.symtab, depth);
    let declared = self.symtab.pop_scope();
    let drops = self.ownership.get_drops_for_scope(&declared);
    if !drops.is_empty() { self.drops_by_block.insert(block.span, drops); }
    self.warn_unused(&declared);
    last
  }

  fn check_stmt(&mut self, stmt: &Stmt) -> Ty {
    match stmt {
      Stmt::Let { name, ty, init, is_mutable, span } => {
        let declared = ty.as_deref().map(|t| self.registry.from_string(t));
        let inferred = init.as_ref().map(|e| self.check_expr(e));
        let final_ty = declared.or_else(|| inferred.clone()).unwrap_or(Ty::new(TypeKind::Unknown));
        let mut sym = Symbol_::new(*name, SymKind::Var, final_ty.clone(), *span);
        sym.is_mutable = *is_mutable;
        sym.offset = self.symtab.allocate_local(8);
        sym.lifetime = Some(self.ownership.create_lifetime(*name, self.symtab.depth()));
        sym.custom_drop_fn = self.drop_impls.get(&final_ty.to_string()).copied();
        if init.is_some() {
          sym.is_initialized = true;
          sym.ownership_state = crate::ownership::OwnershipState::Owned;
        }
        self.symtab.define(sym);
        Ty::new(TypeKind::Void)
      }
      Stmt::Expr(e) => self.check_expr(e),
      Stmt::Return(e, span) => {
        let actual = e.as_ref().map_or(Ty::new(TypeKind::Void), |e| self.check_expr(e));
        if let Some(expected) = self.expected_return.clone() {
          if expected != actual && !matches!(&*expected.kind, TypeKind::Any | TypeKind::Unknown)
            && !matches!(&*actual.kind, TypeKind::Any | TypeKind::Unknown | TypeKind::Never) {
            self.diagnostics.error(format!("return type mismatch: expected {expected}, found {actual}"), *span);
          }
        }
        // spec.md §3.4: returning a fresh borrow of a local/parameter dangles
        // once the function's scope pops, unless the borrowed value is itself
        // 'static (a global or const).
        if let Some(Expr::Borrow { expr: inner, .. }) = e.as_deref() {
          if let Expr::Ident(name, ..) = &**inner {
            if let Some(&fn_depth) = self.fn_scope_depths.last() {
              let borrow_lt = self.ownership.create_lifetime(*name, fn_depth);
              let borrowed_lt = self.symtab.lookup(*name).and_then(|s| s.lifetime)
                .unwrap_or_else(|| self.ownership.static_lifetime(*name));
              self.ownership.check_lifetime_valid(&borrow_lt, &borrowed_lt, &mut self.diagnostics, *span);
            }
          }
        }
        Ty::new(TypeKind::Never)
      }
      Stmt::Break { span, .. } | Stmt::Continue { span, .. } => {
        if !self.symtab.in_loop() {
          self.diagnostics.error("break/continue outside of a loop", *span);
        }
        Ty::new(TypeKind::Never)
      }
      Stmt::If { cond, then_blk, else_blk, span } => {
        let c = self.check_expr(cond);
        if !matches!(&*c.kind, TypeKind::Bool | TypeKind::Any | TypeKind::Unknown) {
          self.diagnostics.warning("condition is not boolean", *span);
        }
        let t = self.check_block(then_blk);
        let e = else_blk.as_ref().map(|b| self.check_block(b));
        e.unwrap_or(t)
      }
      Stmt::While { cond, body, span, .. } => {
        let c = self.check_expr(cond);
        if !matches!(&*c.kind, TypeKind::Bool | TypeKind::Any | TypeKind::Unknown) {
          self.diagnostics.warning("condition is not boolean", *span);
        }
        self.symtab.push_scope(ScopeKind::Loop);
        self.check_block(body);
        self.symtab.pop_scope();
        Ty::new(TypeKind::Void)
      }
      Stmt::Loop { body, .. } => {
        self.symtab.push_scope(ScopeKind::Loop);
        self.check_block(body);
        self.symtab.pop_scope();
        Ty::new(TypeKind::Void)
      }
      Stmt::For { var, iterable, body, span, .. } => {
        let it = self.check_expr(iterable);
        let elem = match &*it.kind { TypeKind::List(e) => (**e).clone(), _ => Ty::new(TypeKind::Any) };
        self.symtab.push_scope(ScopeKind::Loop);
        let mut sym = Symbol_::new(*var, SymKind::Var, elem, *span);
        sym.is_initialized = true;
        sym.ownership_state = crate::ownership::OwnershipState::Owned;
        self.symtab.define(sym);
        self.check_block(body);
        self.symtab.pop_scope();
        Ty::new(TypeKind::Void)
      }
      Stmt::Unsafe(b) => {
        self.symtab.push_scope(ScopeKind::Unsafe);
        let t = self.check_block(b);
        self.symtab.pop_scope();
        t
      }
      Stmt::Item(item) => { self.forward_declare(item); self.check_item(item); Ty::new(TypeKind::Void) }
      Stmt::Asm { span, .. } => {
        if !self.symtab.in_unsafe() {
          self.diagnostics.error("asm block requires unsafe", *span);
        }
        Ty::new(TypeKind::Void)
      }
    }
  }

  fn check_expr(&mut self, expr: &Expr) -> Ty {
    let ty = self.check_expr_inner(expr);
    self.expr_types.insert(expr.id(), ty.clone());
    ty
  }

  #[allow(clippy::too_many_lines)]
  fn check_expr_inner(&mut self, expr: &Expr) -> Ty {
    match expr {
      Expr::Literal(lit, ..) => self.literal_type(lit),
      Expr::Ident(name, _, span) => {
        let Some(sym) = self.symtab.lookup(*name) else {
          self.diagnostics.error(format!("undefined name '{}'", crate::types::ty::resolve_name(*name).unwrap_or_default()), *span);
          return Ty::new(TypeKind::Error);
        };
        let ty = sym.ty.clone();
        self.ownership.check_usable(&self.symtab, *name, &mut self.diagnostics, *span);
        if let Some(s) = self.symtab.lookup_mut(*name) { s.is_used = true; }
        ty
      }
      Expr::Binary { op, lhs, rhs, span, .. } => self.check_binary(*op, lhs, rhs, *span),
      Expr::Unary { op, operand, span, .. } => {
        let t = self.check_expr(operand);
        match op {
          UnOp::Not => Ty::new(TypeKind::Bool),
          UnOp::Neg => t,
          UnOp::BitNot => {
            if !self.symtab.in_unsafe() && matches!(&*t.kind, TypeKind::Ptr(_, true)) {
              self.diagnostics.error("raw pointer arithmetic requires unsafe", *span);
            }
            t
          }
        }
      }
      Expr::Call { callee, type_args, args, id, span, .. } => self.check_call(callee, type_args, args, *id, *span),
      Expr::MethodCall { receiver, method, args, span, .. } => self.check_method_call(receiver, *method, args, *span),
      Expr::FieldAccess { base, field, span, .. } => self.check_field_access(base, *field, *span),
      Expr::Index { base, index, .. } => {
        let b = self.check_expr(base);
        self.check_expr(index);
        match &*b.kind { TypeKind::List(e) | TypeKind::FixedArray(e, _) => (**e).clone(), _ => Ty::new(TypeKind::Any) }
      }
      Expr::Cast { expr: inner, ty, span, .. } => {
        self.check_expr(inner);
        let target = self.registry.from_string(ty);
        if matches!(&*target.kind, TypeKind::Ptr(_, true)) && !self.symtab.in_unsafe() {
          self.diagnostics.error("pointer cast requires unsafe", *span);
        }
        target
      }
      Expr::Borrow { expr: inner, is_mut, span, .. } => self.check_borrow(inner, *is_mut, *span),
      Expr::Deref { expr: inner, span, .. } => {
        let t = self.check_expr(inner);
        if !self.symtab.in_unsafe() {
          if let TypeKind::Ptr(_, true) = &*t.kind {
            self.diagnostics.error("dereferencing a raw pointer requires unsafe", *span);
          }
        }
        match &*t.kind { TypeKind::Ptr(p, _) => (**p).clone(), _ => t }
      }
      Expr::Assign { target, value, span, .. } => {
        let vt = self.check_expr(value);
        if let Expr::Ident(name, ..) = &**target {
          let writable = self.symtab.lookup(*name).map(|s| s.is_mutable).unwrap_or(false);
          if !writable {
            self.diagnostics.error(format!("cannot assign to immutable variable '{}'", crate::types::ty::resolve_name(*name).unwrap_or_default()), *span);
          }
          self.ownership.mark_initialized(&mut self.symtab, *name);
        } else {
          self.check_expr(target);
        }
        vt
      }
      Expr::Block(b, _) => self.check_block(b),
      Expr::InterpolatedString { parts, .. } => {
        for p in parts { self.check_expr(p); }
        Ty::new(TypeKind::String)
      }
      Expr::Perform { effect, op, args, span, .. } => self.check_perform(*effect, *op, args, *span),
      Expr::Handle { body, arms, .. } => {
        let t = self.check_expr(body);
        for arm in arms {
          self.symtab.push_scope(ScopeKind::Block);
          for p in &arm.params {
            self.symtab.define(Symbol_::new(*p, SymKind::Param, Ty::new(TypeKind::Any), Span::default()));
          }
          self.check_block(&arm.body);
          self.symtab.pop_scope();
        }
        t
      }
      Expr::Closure { params, body, .. } => {
        self.symtab.push_scope(ScopeKind::Function);
        for p in params {
          let ty = self.registry.from_string(&p.ty);
          self.symtab.define(Symbol_::new(p.name, SymKind::Param, ty, p.span));
        }
        let ret = self.check_expr(body);
        self.symtab.pop_scope();
        Ty::new(TypeKind::Function { params: params.iter().map(|p| self.registry.from_string(&p.ty)).collect(), ret: std::rc::Rc::new(ret), variadic: false, type_params: vec![] })
      }
    }
  }

  fn literal_type(&self, lit: &Literal) -> Ty {
    match lit {
      Literal::Int(_, Some(suffix)) => self.registry_primitive_or(suffix, TypeKind::Int(crate::types::IntWidth::IDefault)),
      Literal::Int(..) => Ty::new(TypeKind::Int(crate::types::IntWidth::IDefault)),
      Literal::Float(_, Some(suffix)) => self.registry_primitive_or(suffix, TypeKind::Float(crate::types::FloatWidth::FDefault)),
      Literal::Float(..) => Ty::new(TypeKind::Float(crate::types::FloatWidth::FDefault)),
      Literal::Bool(_) => Ty::new(TypeKind::Bool),
      Literal::Str(_) => Ty::new(TypeKind::String),
      Literal::Char(_) => Ty::new(TypeKind::Char),
      Literal::Nil => Ty::new(TypeKind::Void).nullable(),
    }
  }

  fn registry_primitive_or(&self, name: &str, default: TypeKind) -> Ty {
    self.registry.primitive(name).unwrap_or_else(|| Ty::new(default))
  }

  fn check_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, span: Span) -> Ty {
    let l = self.check_expr(lhs);
    let r = self.check_expr(rhs);
    let l = deref_for_arith(&l);
    let r = deref_for_arith(&r);
    if matches!(op, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge) {
      if l != r && !matches!((&*l.kind, &*r.kind), (TypeKind::Any, _) | (_, TypeKind::Any)) {
        self.diagnostics.warning(format!("comparing incompatible types {l} and {r}"), span);
      }
      return Ty::new(TypeKind::Bool);
    }
    if matches!(op, BinOp::And | BinOp::Or) { return Ty::new(TypeKind::Bool) }
    match (&*l.kind, &*r.kind) {
      (TypeKind::String, _) | (_, TypeKind::String) if op == BinOp::Add => Ty::new(TypeKind::String),
      (TypeKind::Float(_), _) | (_, TypeKind::Float(_)) => Ty::new(TypeKind::Float(crate::types::FloatWidth::FDefault)),
      _ => l,
    }
  }

  fn check_borrow(&mut self, inner: &Expr, is_mut: bool, span: Span) -> Ty {
    let t = self.check_expr(inner);
    if let Expr::Ident(name, ..) = inner {
      if !self.ownership.check_can_borrow(&self.symtab, *name, is_mut) {
        let what = if is_mut { "mutably" } else { "as shared" };
        self.diagnostics.error(format!("cannot borrow '{}' {} because it is already borrowed",
          crate::types::ty::resolve_name(*name).unwrap_or_default(), what), span);
      }
      let depth = self.symtab.depth();
      let lifetime = self.symtab.lookup(*name).and_then(|s| s.lifetime)
        .or_else(|| Some(self.ownership.create_lifetime(*name, depth)));
      self.ownership.record_borrow(&mut self.symtab, *name, *name, is_mut, span, depth, lifetime, &mut self.diagnostics);
    }
    let ptr = Ty::new(TypeKind::Ptr(std::rc::Rc::new(t), false));
    if is_mut { ptr.mutable() } else { ptr }
  }

  fn check_perform(&mut self, effect: Symbol, op: Symbol, args: &[Expr], span: Span) -> Ty {
    for a in args { self.check_expr(a); }
    if let Some(e) = self.registry.lookup_effect(effect).cloned() {
      if let Some(sig) = e.operations.iter().find(|o| o.name == op) {
        return sig.ret.clone();
      }
      self.diagnostics.error(format!("unknown effect operation '{}'", crate::types::ty::resolve_name(op).unwrap_or_default()), span);
    } else {
      self.diagnostics.error(format!("unknown effect '{}'", crate::types::ty::resolve_name(effect).unwrap_or_default()), span);
    }
    Ty::new(TypeKind::Error)
  }

  fn check_field_access(&mut self, base: &Expr, field: Symbol, span: Span) -> Ty {
    let b = self.check_expr(base);
    match &*b.kind {
      TypeKind::Record(_, fields) => fields.iter().find(|f| f.name == field).map_or_else(|| {
        self.diagnostics.error(format!("no field '{}' on record", crate::types::ty::resolve_name(field).unwrap_or_default()), span);
        Ty::new(TypeKind::Error)
      }, |f| f.ty.clone()),
      TypeKind::Ptr(p, _) => {
        if let TypeKind::Record(_, fields) = &*p.kind {
          return fields.iter().find(|f| f.name == field).map_or(Ty::new(TypeKind::Any), |f| f.ty.clone());
        }
        Ty::new(TypeKind::Any)
      }
      _ => Ty::new(TypeKind::Any),
    }
  }

  /// The six-case call dispatch order from spec.md §4.4/§4.7, tried in
  /// exactly this order with a trailing catch-all.
  fn check_call(&mut self, callee: &Expr, type_args: &[String], args: &[Expr], id: NodeId, span: Span) -> Ty {
    if let Expr::Ident(name, ..) = callee {
      // (a) comptime function: CTFE-evaluate; if every argument is
      // constant, this call can be folded by codegen later. Here we only
      // type it; the value is recomputed during codegen.
      if self.comptime_functions.contains_key(name) {
        let mut ctfe = CtfeInterpreter::new(&self.comptime_functions, &self.type_metadata);
        let mut all_const = true;
        for a in args {
          match ctfe.eval(a) {
            Ok(Some(_)) => {}
            Ok(None) => all_const = false,
            Err(e) => {
              self.diagnostics.error(format!("comptime evaluation failed: {e}"), span);
              return Ty::new(TypeKind::Error);
            }
          }
        }
        let _ = all_const;
        if let Some(sig) = self.functions.get(name) { return sig.ret.clone() }
      }
      if is_unsafe_builtin_name(crate::types::ty::resolve_name(*name).unwrap_or_default().as_str()) && !self.symtab.in_unsafe() {
        self.diagnostics.error("this builtin requires an unsafe block", span);
      }
      // (f) free function / extern / generic / closure / function pointer.
      if let Some(decl) = self.generic_functions.get(name).cloned() {
        return self.instantiate_generic_call(&decl, type_args, args, id, span);
      }
      if let Some(sig) = self.functions.get(name).cloned() {
        for a in args { self.check_expr(a); }
        return sig.ret;
      }
      if let Some(sig) = self.extern_functions.get(name).cloned() {
        for a in args { self.check_expr(a); }
        return sig.ret;
      }
      if let Some(sym) = self.symtab.lookup(*name) {
        if let TypeKind::Function { ret, .. } = &*sym.ty.kind {
          for a in args { self.check_expr(a); }
          return (**ret).clone();
        }
      }
      self.diagnostics.error(format!("undefined function '{}'", crate::types::ty::resolve_name(*name).unwrap_or_default()), span);
      return Ty::new(TypeKind::Error);
    }
    // (b) module member `mod.fn` surfaces as a field access on the callee.
    if let Expr::FieldAccess { base, field, .. } = callee {
      for a in args { self.check_expr(a); }
      return self.check_method_call(base, *field, args, span);
    }
    self.check_expr(callee);
    for a in args { self.check_expr(a); }
    Ty::new(TypeKind::Any)
  }

  fn instantiate_generic_call(&mut self, decl: &FunctionDecl, explicit_type_args: &[String], args: &[Expr], id: NodeId, span: Span) -> Ty {
    let arg_types: Vec<Ty> = args.iter().map(|a| self.check_expr(a)).collect();
    let mut subst: HashMap<Symbol, Ty> = HashMap::new();
    if !explicit_type_args.is_empty() {
      for (tp, explicit) in decl.type_params.iter().zip(explicit_type_args) {
        subst.insert(tp.name, self.registry.from_string(explicit));
      }
    } else {
      // Unify argument types against parameter types, in order, to bind
      // type parameters; anything left unbound defaults to `Any`.
      for (p, at) in decl.params.iter().zip(&arg_types) {
        if let Some(tp) = decl.type_params.iter().find(|tp| p.ty.trim() == crate::types::ty::resolve_name(tp.name).unwrap_or_default()) {
          subst.entry(tp.name).or_insert_with(|| at.clone());
        }
      }
      for tp in &decl.type_params { subst.entry(tp.name).or_insert(Ty::new(TypeKind::Any)); }
    }
    // Record the concrete type arguments this call site resolved to, in the
    // function's own type-parameter order, so codegen can emit one
    // monomorphised body per distinct instantiation (spec.md §4.7 scenario:
    // `id$int`/`id$float`) instead of the generic body unmangled.
    let mangled_args: Vec<String> = decl.type_params.iter()
      .map(|tp| subst.get(&tp.name).map_or_else(|| "any".to_string(), std::string::ToString::to_string))
      .collect();
    self.generic_instantiations.entry(decl.name).or_default().insert(mangled_args.clone());
    self.generic_instantiations_by_call.insert(id, mangled_args);
    let ret_text = decl.ret.as_deref().unwrap_or("void");
    let base_ret = self.registry.from_string(ret_text);
    self.registry.substitute_type_params(&base_ret, &subst)
  }

  fn check_method_call(&mut self, receiver: &Expr, method: Symbol, args: &[Expr], span: Span) -> Ty {
    let recv_ty = self.check_expr(receiver);
    for a in args { self.check_expr(a); }
    let method_name = crate::types::ty::resolve_name(method).unwrap_or_default();
    if crate::builtins::SMART_PTR_METHODS.contains(&method_name.as_str())
      || crate::builtins::ATOMIC_METHODS.contains(&method_name.as_str()) {
      return match method_name.as_str() {
        "strong_count" | "load" => Ty::new(TypeKind::Int(crate::types::IntWidth::IDefault)),
        _ => recv_ty,
      };
    }
    let type_name = recv_ty.to_string();
    if let Some(imp) = self.impls.iter().find(|i| i.type_name == type_name && i.methods.contains_key(&method)) {
      return imp.methods[&method].ret.clone();
    }
    // UFCS fallback: `x.f(y)` resolves to `f(x, y)` when no method is found.
    if let Some(sig) = self.functions.get(&method).cloned() { return sig.ret }
    self.diagnostics.note(format!("method '{method_name}' resolved via UFCS fallback"), span);
    Ty::new(TypeKind::Any)
  }
}

fn deref_for_arith(t: &Ty) -> Ty {
  match &*t.kind { TypeKind::Ptr(p, false) => (**p).clone(), _ => t.clone() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::TypeRegistry;

  fn span() -> Span { Span::default() }

  #[test]
  fn constant_folded_arithmetic_types_as_int() {
    let mut reg = TypeRegistry::new();
    let mut c = TypeChecker::new(&mut reg);
    let e = Expr::Binary {
      op: BinOp::Add,
      lhs: Box::new(Expr::Literal(Literal::Int(1, None), 0, span())),
      rhs: Box::new(Expr::Binary {
        op: BinOp::Mul,
        lhs: Box::new(Expr::Literal(Literal::Int(2, None), 0, span())),
        rhs: Box::new(Expr::Literal(Literal::Int(3, None), 0, span())),
        id: 0, span: span(),
      }),
      id: 0, span: span(),
    };
    let t = c.check_expr(&e);
    assert_eq!(t, Ty::new(TypeKind::Int(crate::types::IntWidth::IDefault)));
    assert!(!c.diagnostics.has_errors());
  }

  #[test]
  fn borrow_conflict_detected() {
    let mut reg = TypeRegistry::new();
    let mut c = TypeChecker::new(&mut reg);
    let x = c.registry.intern("x");
    c.symtab.push_scope(ScopeKind::Function);
    let mut sym = Symbol_::new(x, SymKind::Var, Ty::new(TypeKind::Int(crate::types::IntWidth::IDefault)), span());
    sym.is_mutable = true;
    sym.is_initialized = true;
    sym.ownership_state = crate::ownership::OwnershipState::Owned;
    c.symtab.define(sym);
    let r = Expr::Borrow { expr: Box::new(Expr::Ident(x, 0, span())), is_mut: false, id: 1, span: span() };
    c.check_expr(&r);
    let m = Expr::Borrow { expr: Box::new(Expr::Ident(x, 0, span())), is_mut: true, id: 2, span: span() };
    c.check_expr(&m);
    assert!(c.diagnostics.has_errors());
  }

  #[test]
  fn undefined_name_is_error() {
    let mut reg = TypeRegistry::new();
    let mut c = TypeChecker::new(&mut reg);
    let y = c.registry.intern("y");
    c.check_expr(&Expr::Ident(y, 0, span()));
    assert!(c.diagnostics.has_errors());
  }

  #[test]
  fn generic_call_records_one_instantiation_per_distinct_argument_type() {
    let mut reg = TypeRegistry::new();
    let mut c = TypeChecker::new(&mut reg);
    let id_fn = c.registry.intern("id");
    let t_param = c.registry.intern("T");
    let x_param = c.registry.intern("x");
    let decl = FunctionDecl {
      name: id_fn,
      type_params: vec![TypeParam { name: t_param, bounds: None, default: None }],
      params: vec![Param { name: x_param, ty: "T".into(), span: span() }],
      ret: Some("T".into()),
      is_comptime: false,
      body: Block { stmts: vec![], span: span() },
      span: span(),
    };
    c.forward_declare(&Item::Function(decl));

    let call_int = Expr::Call {
      callee: Box::new(Expr::Ident(id_fn, 0, span())),
      type_args: vec![],
      args: vec![Expr::Literal(Literal::Int(1, None), 0, span())],
      id: 10, span: span(),
    };
    let call_float = Expr::Call {
      callee: Box::new(Expr::Ident(id_fn, 0, span())),
      type_args: vec![],
      args: vec![Expr::Literal(Literal::Float(1.0, None), 0, span())],
      id: 11, span: span(),
    };
    c.check_expr(&call_int);
    c.check_expr(&call_float);

    let insts = c.generic_instantiations.get(&id_fn).expect("some instantiation recorded");
    assert_eq!(insts.len(), 2);
    assert_eq!(c.generic_instantiations_by_call.get(&10), Some(&vec!["int".to_string()]));
    assert_eq!(c.generic_instantiations_by_call.get(&11), Some(&vec!["float".to_string()]));
  }
}

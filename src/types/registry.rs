//! The `TypeRegistry`: canonical factory and interner for primitive types,
//! the definitive `toString`/`fromString` pair used for symbol mangling, and
//! the trait/concept/effect/dependent-type tables.
//!
//! Design rationale (kept from the `Entity`/`Interner` split this is
//! grounded on): centralising type construction makes hashing, debugging output and
//! substitution tractable without a second IR. Primitive factories intern
//! (one shared value per kind); compound factories do not, so equality is
//! always by [`super::ty::Ty`]'s `PartialEq`, never by pointer.

use std::collections::HashMap;
use std::rc::Rc;
use crate::symbol::{Interner, Symbol};
use super::ty::*;

#[derive(Debug, Clone)]
pub struct TraitImpl {
  pub trait_name: Symbol,
  pub type_name: String,
  pub type_args: Vec<Ty>,
  pub methods: HashMap<Symbol, MethodSig>,
}

pub struct TypeRegistry {
  pub interner: Interner,
  primitives: HashMap<&'static str, Ty>,
  named_types: HashMap<Symbol, Ty>,
  traits: HashMap<Symbol, TraitRef>,
  concepts: HashMap<Symbol, ConceptRef>,
  effects: HashMap<Symbol, EffectRef>,
  dependent_types: HashMap<Symbol, (Vec<Symbol>, Ty)>,
  type_constructors: HashMap<Symbol, (u32, Vec<Symbol>)>,
  impls: Vec<TraitImpl>,
}

impl Default for TypeRegistry {
  fn default() -> Self { Self::new() }
}

impl TypeRegistry {
  #[must_use] pub fn new() -> Self {
    let mut interner = Interner::new();
    let mut primitives = HashMap::new();
    macro_rules! prim {
      ($name:literal, $kind:expr) => {{
        let sym = interner.intern($name);
        register_name(sym, $name);
        primitives.insert($name, Ty::new($kind));
        let _ = sym;
      }};
    }
    prim!("void", TypeKind::Void);
    prim!("bool", TypeKind::Bool);
    prim!("never", TypeKind::Never);
    prim!("any", TypeKind::Any);
    prim!("unknown", TypeKind::Unknown);
    prim!("i8", TypeKind::Int(IntWidth::I8));
    prim!("i16", TypeKind::Int(IntWidth::I16));
    prim!("i32", TypeKind::Int(IntWidth::I32));
    prim!("i64", TypeKind::Int(IntWidth::I64));
    prim!("int", TypeKind::Int(IntWidth::IDefault));
    prim!("u8", TypeKind::Uint(UintWidth::U8));
    prim!("u16", TypeKind::Uint(UintWidth::U16));
    prim!("u32", TypeKind::Uint(UintWidth::U32));
    prim!("u64", TypeKind::Uint(UintWidth::U64));
    prim!("f16", TypeKind::Float(FloatWidth::F16));
    prim!("f32", TypeKind::Float(FloatWidth::F32));
    prim!("f64", TypeKind::Float(FloatWidth::F64));
    prim!("f128", TypeKind::Float(FloatWidth::F128));
    prim!("float", TypeKind::Float(FloatWidth::FDefault));
    prim!("complex64", TypeKind::Complex(ComplexWidth::C64));
    prim!("complex128", TypeKind::Complex(ComplexWidth::C128));
    prim!("bigint", TypeKind::BigInt);
    prim!("bigfloat", TypeKind::BigFloat);
    prim!("decimal", TypeKind::Decimal);
    prim!("rational", TypeKind::Rational);
    prim!("string", TypeKind::String);
    prim!("char", TypeKind::Char);
    prim!("strview", TypeKind::StrView);
    prim!("bytearray", TypeKind::ByteArray);
    prim!("Cond", TypeKind::Cond);
    prim!("Semaphore", TypeKind::Semaphore);
    prim!("ThreadPool", TypeKind::ThreadPool);
    prim!("CancelToken", TypeKind::CancelToken);
    Self {
      interner, primitives,
      named_types: HashMap::new(),
      traits: HashMap::new(),
      concepts: HashMap::new(),
      effects: HashMap::new(),
      dependent_types: HashMap::new(),
      type_constructors: HashMap::new(),
      impls: Vec::new(),
    }
  }

  pub fn intern(&mut self, s: &str) -> Symbol {
    let sym = self.interner.intern(s);
    register_name(sym, s);
    sym
  }

  #[must_use] pub fn resolve(&self, sym: Symbol) -> &str { self.interner.resolve(sym) }

  #[must_use] pub fn primitive(&self, name: &str) -> Option<Ty> { self.primitives.get(name).cloned() }

  pub fn register_named(&mut self, name: Symbol, ty: Ty) { self.named_types.insert(name, ty); }
  #[must_use] pub fn lookup_named(&self, name: Symbol) -> Option<&Ty> { self.named_types.get(&name) }

  pub fn register_trait(&mut self, t: TraitRef) { self.traits.insert(t.name, t); }
  #[must_use] pub fn lookup_trait(&self, name: Symbol) -> Option<&TraitRef> { self.traits.get(&name) }

  pub fn register_concept(&mut self, c: ConceptRef) { self.concepts.insert(c.name, c); }
  #[must_use] pub fn lookup_concept(&self, name: Symbol) -> Option<&ConceptRef> { self.concepts.get(&name) }

  pub fn register_effect(&mut self, e: EffectRef) { self.effects.insert(e.name, e); }
  #[must_use] pub fn lookup_effect(&self, name: Symbol) -> Option<&EffectRef> { self.effects.get(&name) }
  /// Create-or-lookup an effect type by name, per spec.md §4.1 `effectType`.
  pub fn effect_type(&mut self, name: Symbol) -> Ty {
    let e = self.effects.entry(name).or_insert_with(|| EffectRef { name, args: vec![], operations: vec![] }).clone();
    Ty::new(TypeKind::Effect(e))
  }

  pub fn register_dependent(&mut self, name: Symbol, params: Vec<Symbol>, base: Ty) {
    self.dependent_types.insert(name, (params, base));
  }

  pub fn register_type_constructor(&mut self, name: Symbol, arity: u32, bounds: Vec<Symbol>) {
    self.type_constructors.insert(name, (arity, bounds));
  }

  pub fn register_impl(&mut self, imp: TraitImpl) { self.impls.push(imp); }
  #[must_use] pub fn impls_for(&self, type_name: &str) -> Vec<&TraitImpl> {
    self.impls.iter().filter(|i| i.type_name == type_name).collect()
  }
  #[must_use] pub fn find_impl(&self, type_name: &str, trait_name: Symbol) -> Option<&TraitImpl> {
    self.impls.iter().find(|i| i.type_name == type_name && i.trait_name == trait_name)
  }

  /// `typeImplementsTrait`: true for a matching `TraitImpl`, or for a type
  /// parameter whose bound list names the trait.
  #[must_use] pub fn type_implements_trait(&self, t: &Ty, trait_name: Symbol) -> bool {
    if let TypeKind::TypeParam { bounds, .. } = &*t.kind {
      return bounds.contains(&trait_name);
    }
    self.find_impl(&t.to_string(), trait_name).is_some()
  }

  /// `checkTraitBounds`: conjunction of `typeImplementsTrait` over the bound list.
  #[must_use] pub fn check_trait_bounds(&self, t: &Ty, bounds: &[Symbol]) -> bool {
    bounds.iter().all(|&b| self.type_implements_trait(t, b))
  }

  /// `checkRefinementConstraint`: compile-time-decidable constraints
  /// (currently: `len(_) > N` against a `FixedArray`'s length). Anything
  /// else defers to runtime (returns `None`).
  #[must_use] pub fn check_refinement_constraint(&self, t: &Ty, constraint_text: &str) -> Option<bool> {
    let text = constraint_text.trim();
    if let Some(rest) = text.strip_prefix("len(_) > ") {
      if let (TypeKind::FixedArray(_, n), Ok(bound)) = (&*t.kind, rest.trim().parse::<u64>()) {
        return Some(*n > bound);
      }
    }
    if let Some(rest) = text.strip_prefix("len(_) >= ") {
      if let (TypeKind::FixedArray(_, n), Ok(bound)) = (&*t.kind, rest.trim().parse::<u64>()) {
        return Some(*n >= bound);
      }
    }
    None
  }

  /// Recursively substitutes type parameters per a name->type map.
  #[must_use] pub fn substitute_type_params(&self, t: &Ty, subst: &HashMap<Symbol, Ty>) -> Ty {
    let kind = match &*t.kind {
      TypeKind::TypeParam { name, .. } => {
        if let Some(repl) = subst.get(name) { return repl.clone() }
        return t.clone()
      }
      TypeKind::Ptr(inner, raw) => TypeKind::Ptr(Rc::new(self.substitute_type_params(inner, subst)), *raw),
      TypeKind::List(inner) => TypeKind::List(Rc::new(self.substitute_type_params(inner, subst))),
      TypeKind::Map(k, v) => TypeKind::Map(
        Rc::new(self.substitute_type_params(k, subst)),
        Rc::new(self.substitute_type_params(v, subst))),
      TypeKind::FixedArray(inner, n) => TypeKind::FixedArray(Rc::new(self.substitute_type_params(inner, subst)), *n),
      TypeKind::Box(inner) => TypeKind::Box(Rc::new(self.substitute_type_params(inner, subst))),
      TypeKind::Rc(inner) => TypeKind::Rc(Rc::new(self.substitute_type_params(inner, subst))),
      TypeKind::Arc(inner) => TypeKind::Arc(Rc::new(self.substitute_type_params(inner, subst))),
      TypeKind::Weak(inner, atomic) => TypeKind::Weak(Rc::new(self.substitute_type_params(inner, subst)), *atomic),
      TypeKind::Cell(inner) => TypeKind::Cell(Rc::new(self.substitute_type_params(inner, subst))),
      TypeKind::RefCell(inner) => TypeKind::RefCell(Rc::new(self.substitute_type_params(inner, subst))),
      TypeKind::Mutex(inner) => TypeKind::Mutex(Rc::new(self.substitute_type_params(inner, subst))),
      TypeKind::RWLock(inner) => TypeKind::RWLock(Rc::new(self.substitute_type_params(inner, subst))),
      TypeKind::Atomic(inner) => TypeKind::Atomic(Rc::new(self.substitute_type_params(inner, subst))),
      TypeKind::Future(inner) => TypeKind::Future(Rc::new(self.substitute_type_params(inner, subst))),
      TypeKind::Channel(inner, cap) => TypeKind::Channel(Rc::new(self.substitute_type_params(inner, subst)), *cap),
      TypeKind::Function { params, ret, variadic, type_params } => TypeKind::Function {
        params: params.iter().map(|p| self.substitute_type_params(p, subst)).collect(),
        ret: Rc::new(self.substitute_type_params(ret, subst)),
        variadic: *variadic,
        type_params: type_params.clone(),
      },
      TypeKind::Generic { base_name, args, resolved } => TypeKind::Generic {
        base_name: *base_name,
        args: args.iter().map(|a| self.substitute_type_params(a, subst)).collect(),
        resolved: resolved.clone(),
      },
      TypeKind::Record(name, fields) => TypeKind::Record(*name,
        fields.iter().map(|f| Field { name: f.name, ty: self.substitute_type_params(&f.ty, subst) }).collect()),
      other => other.clone(),
    };
    Ty::with_attrs(kind, t.attrs)
  }

  /// `instantiateGeneric`: substitutes a generic's own type arguments into
  /// its resolved base, losing its `typeParams` list (a monomorphised
  /// function type no longer carries unbound parameters).
  #[must_use] pub fn instantiate_generic(&self, g: &Ty, args: &[Ty]) -> Ty {
    if let TypeKind::Generic { base_name, resolved: Some(base), .. } = &*g.kind {
      if let TypeKind::Function { params, ret, type_params, .. } = &**base.kind.clone().as_ref() {
        let subst: HashMap<Symbol, Ty> = type_params.iter().copied().zip(args.iter().cloned()).collect();
        return Ty::new(TypeKind::Function {
          params: params.iter().map(|p| self.substitute_type_params(p, &subst)).collect(),
          ret: Rc::new(self.substitute_type_params(ret, &subst)),
          variadic: false,
          type_params: vec![],
        });
      }
      let _ = base_name;
    }
    g.clone()
  }

  /// `instantiateDependentType`: substitutes both value and type parameters;
  /// a `[T;0]` deferred-size placeholder becomes `[T;N]` once `N` is concrete.
  #[must_use] pub fn instantiate_dependent_type(&self, name: Symbol, value_args: &[i64], type_args: &[Ty]) -> Option<Ty> {
    let (params, base) = self.dependent_types.get(&name)?;
    let mut subst = HashMap::new();
    for (p, t) in params.iter().zip(type_args.iter()) { subst.insert(*p, t.clone()); }
    let substituted = self.substitute_type_params(base, &subst);
    Some(resolve_deferred_sizes(&substituted, value_args))
  }

  /// The definitive textual form, used both for display and for mangling.
  #[must_use] pub fn type_to_string(&self, t: &Ty) -> String { t.to_string() }

  /// `fromString`: parses the canonical textual form back into a `Ty`.
  /// This is the definitive source for type annotations; round-trips with
  /// `Display` by construction (see the `parser` submodule test for the
  /// pairing spec.md §8 calls out as a testable property).
  pub fn from_string(&mut self, text: &str) -> Ty {
    super::parser::parse_type(self, text)
  }
}

fn resolve_deferred_sizes(t: &Ty, value_args: &[i64]) -> Ty {
  match &*t.kind {
    TypeKind::FixedArray(elem, 0) => {
      let n = value_args.first().copied().unwrap_or(0).max(0) as u64;
      Ty::with_attrs(TypeKind::FixedArray(Rc::new(resolve_deferred_sizes(elem, value_args)), n), t.attrs)
    }
    TypeKind::List(elem) => Ty::with_attrs(TypeKind::List(Rc::new(resolve_deferred_sizes(elem, value_args))), t.attrs),
    _ => t.clone(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn primitives_are_interned() {
    let reg = TypeRegistry::new();
    let a = reg.primitive("i32").unwrap();
    let b = reg.primitive("i32").unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn refinement_constraint_decidable_case() {
    let reg = TypeRegistry::new();
    let arr = Ty::new(TypeKind::FixedArray(Rc::new(Ty::new(TypeKind::Int(IntWidth::I32))), 4));
    assert_eq!(reg.check_refinement_constraint(&arr, "len(_) > 0"), Some(true));
    assert_eq!(reg.check_refinement_constraint(&arr, "len(_) > 10"), Some(false));
  }

  #[test]
  fn trait_bound_on_type_param() {
    let mut reg = TypeRegistry::new();
    let numeric = reg.intern("Numeric");
    let t = Ty::new(TypeKind::TypeParam { name: reg.intern("T"), bounds: vec![numeric], default: None });
    assert!(reg.type_implements_trait(&t, numeric));
  }
}

//! The `Type` value: a tagged variant covering every kind spec.md §3.1 names,
//! plus the two attributes (`is_mutable`, `is_nullable`) every type carries
//! regardless of kind.

use std::fmt;
use std::rc::Rc;
use crate::symbol::Symbol;

/// Integer/float/complex bit widths, kept as plain enums rather than raw
/// widths so `TypeKind::equals` can match on them structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntWidth { I8, I16, I32, I64, IDefault }
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UintWidth { U8, U16, U32, U64 }
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatWidth { F16, F32, F64, F128, FDefault }
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComplexWidth { C64, C128 }
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VecArity { V2, V3, V4 }

#[derive(Debug, Clone, PartialEq)]
pub struct Field { pub name: Symbol, pub ty: Ty }

#[derive(Debug, Clone, PartialEq)]
pub struct MethodSig { pub name: Symbol, pub params: Vec<Ty>, pub ret: Ty, pub has_default_impl: bool }

#[derive(Debug, Clone, PartialEq)]
pub struct TraitRef { pub name: Symbol, pub methods: Vec<MethodSig>, pub super_traits: Vec<Symbol> }

#[derive(Debug, Clone, PartialEq)]
pub struct ConceptRef { pub name: Symbol, pub requirements: Vec<MethodSig>, pub super_concepts: Vec<Symbol> }

#[derive(Debug, Clone, PartialEq)]
pub struct EffectRef { pub name: Symbol, pub args: Vec<Ty>, pub operations: Vec<MethodSig> }

/// The tagged variant. Compound (recursive) kinds hold `Rc<Ty>`/`Vec<Ty>` so
/// cloning a type is cheap; only `TypeRegistry`-interned primitives are
/// truly shared (pointer-equal), everything else compares structurally.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
  Void, Bool, Never, Any, Unknown, Error,
  Int(IntWidth), Uint(UintWidth), Float(FloatWidth), Complex(ComplexWidth),
  BigInt, BigFloat, Decimal, Rational,
  FixedPoint(u8, u8),
  Vec(VecArity, Rc<Ty>), Mat(VecArity, Rc<Ty>),
  String, Char, StrView, ByteArray,
  Ptr(Rc<Ty>, bool),
  List(Rc<Ty>),
  Map(Rc<Ty>, Rc<Ty>),
  Record(Symbol, Vec<Field>),
  Function { params: Vec<Ty>, ret: Rc<Ty>, variadic: bool, type_params: Vec<Symbol> },
  TypeParam { name: Symbol, bounds: Vec<Symbol>, default: Option<Rc<Ty>> },
  ValueParam { name: Symbol, value_ty: Rc<Ty>, value: Option<i64> },
  Generic { base_name: Symbol, args: Vec<Ty>, resolved: Option<Rc<Ty>> },
  Dependent { name: Symbol, params: Vec<Symbol>, base_ty: Rc<Ty> },
  Refined { name: Symbol, base_ty: Rc<Ty>, constraint_text: String },
  Trait(TraitRef),
  TraitObject(Symbol),
  Concept(ConceptRef),
  FixedArray(Rc<Ty>, u64),
  Channel(Rc<Ty>, usize),
  Mutex(Rc<Ty>), RWLock(Rc<Ty>), Cond, Semaphore,
  Atomic(Rc<Ty>),
  Future(Rc<Ty>), ThreadPool, CancelToken,
  Box(Rc<Ty>), Rc(Rc<Ty>), Arc(Rc<Ty>), Weak(Rc<Ty>, bool),
  Cell(Rc<Ty>), RefCell(Rc<Ty>),
  Effect(EffectRef),
  Effectful { base: Rc<Ty>, effects: Vec<Symbol> },
  TypeConstructor { name: Symbol, arity: u32, bounds: Vec<Symbol> },
  HKTApplication { ctor: Rc<Ty>, args: Vec<Ty> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeAttrs { pub is_mutable: bool, pub is_nullable: bool }

/// A complete type value: kind plus the two shared attributes.
#[derive(Debug, Clone)]
pub struct Ty {
  pub kind: Rc<TypeKind>,
  pub attrs: TypeAttrs,
}

impl PartialEq for Ty {
  fn eq(&self, other: &Self) -> bool {
    // Nominal equality for named compound kinds (a `Record`/`Trait`/`Concept`/
    // `Effect` is identified by name, not by re-comparing every field), else
    // structural equality on the full kind tree.
    match (&*self.kind, &*other.kind) {
      (TypeKind::Record(a, _), TypeKind::Record(b, _)) => a == b && self.attrs == other.attrs,
      (TypeKind::Trait(a), TypeKind::Trait(b)) => a.name == b.name && self.attrs == other.attrs,
      (TypeKind::Concept(a), TypeKind::Concept(b)) => a.name == b.name && self.attrs == other.attrs,
      (TypeKind::Effect(a), TypeKind::Effect(b)) => a.name == b.name && self.attrs == other.attrs,
      _ => *self.kind == *other.kind && self.attrs == other.attrs,
    }
  }
}
impl Eq for Ty {}

impl Ty {
  #[must_use] pub fn new(kind: TypeKind) -> Self { Self { kind: Rc::new(kind), attrs: TypeAttrs::default() } }
  #[must_use] pub fn with_attrs(kind: TypeKind, attrs: TypeAttrs) -> Self { Self { kind: Rc::new(kind), attrs } }
  #[must_use] pub fn nullable(&self) -> Self { Self { kind: self.kind.clone(), attrs: TypeAttrs { is_nullable: true, ..self.attrs } } }
  #[must_use] pub fn mutable(&self) -> Self { Self { kind: self.kind.clone(), attrs: TypeAttrs { is_mutable: true, ..self.attrs } } }

  /// Fixed sizes in bytes, per spec.md §3.1. Returns `None` for
  /// variable-sized/unbounded types (`BigInt`, `String`, unresolved generics).
  #[must_use] pub fn size_of(&self) -> Option<u64> {
    Some(match &*self.kind {
      TypeKind::Bool => 1,
      TypeKind::Int(IntWidth::I8) | TypeKind::Uint(UintWidth::U8) => 1,
      TypeKind::Int(IntWidth::I16) | TypeKind::Uint(UintWidth::U16) | TypeKind::Float(FloatWidth::F16) => 2,
      TypeKind::Int(IntWidth::I32) | TypeKind::Uint(UintWidth::U32) | TypeKind::Float(FloatWidth::F32) => 4,
      TypeKind::Int(IntWidth::I64 | IntWidth::IDefault) | TypeKind::Uint(UintWidth::U64)
      | TypeKind::Float(FloatWidth::F64 | FloatWidth::FDefault) | TypeKind::Complex(ComplexWidth::C64) => 8,
      TypeKind::Float(FloatWidth::F128) | TypeKind::Complex(ComplexWidth::C128) => 16,
      TypeKind::Ptr(..) | TypeKind::Box(_) | TypeKind::String | TypeKind::StrView
      | TypeKind::List(_) | TypeKind::Map(..) => 8,
      TypeKind::Char => 4,
      TypeKind::Void => 0,
      TypeKind::FixedArray(elem, n) => elem.size_of()? * n,
      TypeKind::Record(_, fields) => fields.iter().map(|f| f.ty.size_of()).sum::<Option<u64>>()?,
      TypeKind::Rc(t) | TypeKind::Arc(t) => 8 + t.size_of()?,
      _ => return None,
    })
  }

  #[must_use] pub fn needs_drop(&self) -> bool {
    matches!(&*self.kind,
      TypeKind::String | TypeKind::List(_) | TypeKind::Map(..) | TypeKind::Box(_)
      | TypeKind::Rc(_) | TypeKind::Arc(_) | TypeKind::RefCell(_) | TypeKind::Mutex(_)
      | TypeKind::RWLock(_) | TypeKind::Channel(..) | TypeKind::Record(..))
  }

  #[must_use] pub fn is_copy(&self) -> bool {
    matches!(&*self.kind,
      TypeKind::Void | TypeKind::Bool | TypeKind::Int(_) | TypeKind::Uint(_) | TypeKind::Float(_)
      | TypeKind::Complex(_) | TypeKind::Char | TypeKind::Ptr(..) | TypeKind::FixedPoint(..))
  }
}

impl fmt::Display for Ty {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // `&mut T` is a single prefix unit, not the generic `is_mutable` "mut "
    // prefix plus `&T` — the latter round-trips to a plain identifier
    // `mut` followed by a reference, not back to a mutable `Ptr`.
    if let TypeKind::Ptr(inner, false) = &*self.kind {
      if self.attrs.is_mutable {
        write!(f, "&mut {inner}")?;
      } else {
        write!(f, "&{inner}")?;
      }
    } else {
      if self.attrs.is_mutable { f.write_str("mut ")?; }
      write!(f, "{}", fmt_kind(&self.kind))?;
    }
    if self.attrs.is_nullable { f.write_str("?")?; }
    Ok(())
  }
}

fn fmt_kind(k: &TypeKind) -> String {
  match k {
    TypeKind::Void => "void".into(),
    TypeKind::Bool => "bool".into(),
    TypeKind::Never => "never".into(),
    TypeKind::Any => "any".into(),
    TypeKind::Unknown => "unknown".into(),
    TypeKind::Error => "<error>".into(),
    TypeKind::Int(IntWidth::I8) => "i8".into(),
    TypeKind::Int(IntWidth::I16) => "i16".into(),
    TypeKind::Int(IntWidth::I32) => "i32".into(),
    TypeKind::Int(IntWidth::I64) => "i64".into(),
    TypeKind::Int(IntWidth::IDefault) => "int".into(),
    TypeKind::Uint(UintWidth::U8) => "u8".into(),
    TypeKind::Uint(UintWidth::U16) => "u16".into(),
    TypeKind::Uint(UintWidth::U32) => "u32".into(),
    TypeKind::Uint(UintWidth::U64) => "u64".into(),
    TypeKind::Float(FloatWidth::F16) => "f16".into(),
    TypeKind::Float(FloatWidth::F32) => "f32".into(),
    TypeKind::Float(FloatWidth::F64) => "f64".into(),
    TypeKind::Float(FloatWidth::F128) => "f128".into(),
    TypeKind::Float(FloatWidth::FDefault) => "float".into(),
    TypeKind::Complex(ComplexWidth::C64) => "complex64".into(),
    TypeKind::Complex(ComplexWidth::C128) => "complex128".into(),
    TypeKind::BigInt => "bigint".into(),
    TypeKind::BigFloat => "bigfloat".into(),
    TypeKind::Decimal => "decimal".into(),
    TypeKind::Rational => "rational".into(),
    TypeKind::FixedPoint(total, frac) => format!("fixed<{total},{frac}>"),
    TypeKind::Vec(a, e) => format!("vec{}[{}]", arity_n(*a), e),
    TypeKind::Mat(a, e) => format!("mat{}[{}]", arity_n(*a), e),
    TypeKind::String => "string".into(),
    TypeKind::Char => "char".into(),
    TypeKind::StrView => "strview".into(),
    TypeKind::ByteArray => "bytearray".into(),
    TypeKind::Ptr(t, raw) => format!("{}{}", if *raw { "*" } else { "&" }, t),
    TypeKind::List(t) => format!("[{t}]"),
    TypeKind::Map(k, v) => format!("map[{k},{v}]"),
    TypeKind::Record(n, _) => n_str(*n),
    TypeKind::Function { params, ret, variadic, .. } => {
      let mut s = "fn(".to_string();
      for (i, p) in params.iter().enumerate() {
        if i > 0 { s.push(','); }
        s.push_str(&p.to_string());
      }
      if *variadic { s.push_str(",..."); }
      s.push_str(") -> ");
      s.push_str(&ret.to_string());
      s
    }
    TypeKind::TypeParam { name, .. } => n_str(*name),
    TypeKind::ValueParam { name, .. } => n_str(*name),
    TypeKind::Generic { base_name, args, .. } => {
      let args_s: Vec<String> = args.iter().map(ToString::to_string).collect();
      format!("{}<{}>", n_str(*base_name), args_s.join(","))
    }
    TypeKind::Dependent { name, .. } => n_str(*name),
    TypeKind::Refined { name, constraint_text, .. } => format!("{}{{{}}}", n_str(*name), constraint_text),
    TypeKind::Trait(t) => n_str(t.name),
    TypeKind::TraitObject(n) => format!("dyn {}", n_str(*n)),
    TypeKind::Concept(c) => n_str(c.name),
    TypeKind::FixedArray(e, n) => format!("[{e};{n}]"),
    TypeKind::Channel(e, cap) => format!("chan[{e};{cap}]"),
    TypeKind::Mutex(t) => format!("Mutex[{t}]"),
    TypeKind::RWLock(t) => format!("RWLock[{t}]"),
    TypeKind::Cond => "Cond".into(),
    TypeKind::Semaphore => "Semaphore".into(),
    TypeKind::Atomic(t) => format!("Atomic[{t}]"),
    TypeKind::Future(t) => format!("Future[{t}]"),
    TypeKind::ThreadPool => "ThreadPool".into(),
    TypeKind::CancelToken => "CancelToken".into(),
    TypeKind::Box(t) => format!("Box[{t}]"),
    TypeKind::Rc(t) => format!("Rc[{t}]"),
    TypeKind::Arc(t) => format!("Arc[{t}]"),
    TypeKind::Weak(t, atomic) => format!("Weak[{t}]{}", if *atomic { "/atomic" } else { "" }),
    TypeKind::Cell(t) => format!("Cell[{t}]"),
    TypeKind::RefCell(t) => format!("RefCell[{t}]"),
    TypeKind::Effect(e) => n_str(e.name),
    TypeKind::Effectful { base, effects } => {
      let e: Vec<String> = effects.iter().map(|s| n_str(*s)).collect();
      format!("{base}![{}]", e.join("+"))
    }
    TypeKind::TypeConstructor { name, .. } => n_str(*name),
    TypeKind::HKTApplication { ctor, args } => {
      let args_s: Vec<String> = args.iter().map(ToString::to_string).collect();
      format!("{ctor}<{}>", args_s.join(","))
    }
  }
}

fn arity_n(a: VecArity) -> u8 { match a { VecArity::V2 => 2, VecArity::V3 => 3, VecArity::V4 => 4 } }

// Symbol resolution for Display needs the interner, which Ty doesn't carry.
// We store the resolved name string as a thread-local scratch populated by
// the registry before formatting; see `TypeRegistry::type_to_string`.
thread_local! {
  static NAMES: std::cell::RefCell<std::collections::HashMap<Symbol, String>> = std::cell::RefCell::new(std::collections::HashMap::new());
}

pub fn register_name(sym: Symbol, s: &str) {
  NAMES.with(|n| n.borrow_mut().insert(sym, s.to_string()));
}

/// Looks up a previously `register_name`d symbol's source text, if any.
#[must_use] pub fn resolve_name(sym: Symbol) -> Option<String> {
  NAMES.with(|n| n.borrow().get(&sym).cloned())
}

fn n_str(sym: Symbol) -> String {
  NAMES.with(|n| n.borrow().get(&sym).cloned()).unwrap_or_else(|| format!("sym{}", sym.into_usize()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn structural_equality_for_compounds() {
    let a = Ty::new(TypeKind::List(Rc::new(Ty::new(TypeKind::Int(IntWidth::I32)))));
    let b = Ty::new(TypeKind::List(Rc::new(Ty::new(TypeKind::Int(IntWidth::I32)))));
    assert_eq!(a, b);
  }

  #[test]
  fn sizes_match_spec() {
    assert_eq!(Ty::new(TypeKind::Bool).size_of(), Some(1));
    assert_eq!(Ty::new(TypeKind::Int(IntWidth::I16)).size_of(), Some(2));
    assert_eq!(Ty::new(TypeKind::Float(FloatWidth::F32)).size_of(), Some(4));
    assert_eq!(Ty::new(TypeKind::Int(IntWidth::IDefault)).size_of(), Some(8));
    assert_eq!(Ty::new(TypeKind::Float(FloatWidth::F128)).size_of(), Some(16));
    assert_eq!(Ty::new(TypeKind::Ptr(Rc::new(Ty::new(TypeKind::Bool)), false)).size_of(), Some(8));
  }

  #[test]
  fn fixed_array_display() {
    let t = Ty::new(TypeKind::FixedArray(Rc::new(Ty::new(TypeKind::Int(IntWidth::I32))), 4));
    assert_eq!(t.to_string(), "[i32;4]");
  }

  #[test]
  fn mutable_ref_displays_as_single_prefix() {
    let t = Ty::new(TypeKind::Ptr(Rc::new(Ty::new(TypeKind::Int(IntWidth::I32))), false)).mutable();
    assert_eq!(t.to_string(), "&mut i32");
  }
}

//! The type, trait, concept and effect system (spec.md §3.1-3.2, §4.1).

pub mod ty;
pub mod registry;
pub mod parser;

pub use ty::{Ty, TypeKind, TypeAttrs, Field, MethodSig, TraitRef, ConceptRef, EffectRef,
  IntWidth, UintWidth, FloatWidth, ComplexWidth, VecArity};
pub use registry::{TypeRegistry, TraitImpl};

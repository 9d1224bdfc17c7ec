//! Semantic analysis: the type/trait/effect checker and the CTFE interpreter
//! it consults for constant folding and reflection (spec.md §4.4, §4.5).

pub mod ctfe;
pub mod checker;

pub use checker::TypeChecker;

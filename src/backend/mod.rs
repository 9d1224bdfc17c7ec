//! The direct-to-machine-code backend: x86-64 encoder, AST-driven code
//! generator, peephole optimizer, loop vectorizer, and PE/COFF image
//! builder (spec.md §4.6-§4.9).

pub mod encoder;
pub mod codegen;
pub mod peephole;
pub mod vectorizer;
pub mod pe;

pub use codegen::CodeGenerator;
pub use encoder::Encoder;
pub use pe::ImageBuilder;

//! `tylc`: the TYL compiler's middle- and back-end (spec.md §1).
//!
//! Consumes an already-parsed [`ast::Program`] and drives it through type
//! checking, constant folding, loop vectorization, direct-to-machine-code
//! generation, peephole optimization and PE/object emission. Lexing and
//! parsing live outside this crate.

pub mod ast;
pub mod symbol;
pub mod symtab;
pub mod diagnostics;
pub mod error;
pub mod ownership;
pub mod types;
pub mod builtins;
pub mod check;
pub mod backend;
pub mod gc;

use ast::Program;
use backend::CodeGenerator;
use diagnostics::Diagnostic;
use error::{CompileError, CompileResult};
use types::TypeRegistry;

/// Optimization level; only `aggressive` peephole rewrites are gated on
/// this, matching the original's single `-O` switch (spec.md §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptLevel { None, Default, Aggressive }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetMode { Exe, Object }

/// Which backing allocator `gc.rs` installs before codegen runs (spec.md
/// §4.10); `Arena`/`Pool` size themselves from `gc_threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorKind { System, Arena, Pool }

#[derive(Debug, Clone)]
pub struct CompileOptions {
  pub opt_level: OptLevel,
  pub target: TargetMode,
  pub stdout_caching: bool,
  pub gc_threshold: usize,
  pub default_allocator: AllocatorKind,
}

impl Default for CompileOptions {
  fn default() -> Self {
    Self {
      opt_level: OptLevel::Default, target: TargetMode::Exe,
      stdout_caching: true, gc_threshold: 1024 * 1024, default_allocator: AllocatorKind::System,
    }
  }
}

/// Output of a successful [`compile`] or [`compile_to_object`] call: the
/// finished image bytes plus every non-fatal diagnostic the checker raised
/// along the way (warnings and notes survive a successful compile).
pub struct CompileOutput {
  pub bytes: Vec<u8>,
  pub diagnostics: Vec<Diagnostic>,
}

/// Drives the full pipeline: check → vectorize (inside codegen, per
/// function) → codegen → peephole → image (spec.md §2 data-flow diagram).
pub struct Compiler {
  options: CompileOptions,
}

impl Compiler {
  #[must_use] pub fn new(options: CompileOptions) -> Self { Self { options } }

  /// Applies `self.options`'s runtime-facing fields to `gc`'s process-wide
  /// state before codegen runs; the generated image calls back into this
  /// same module's `gc_*` entry points, so configuration has to land before
  /// the first `gc_alloc`.
  fn configure_runtime(&self) {
    gc::gc_set_threshold(self.options.gc_threshold);
    gc::gc_set_stdout_caching(self.options.stdout_caching);
    match self.options.default_allocator {
      AllocatorKind::System => gc::gc_reset_allocator(),
      AllocatorKind::Arena => gc::gc_set_allocator_arena(self.options.gc_threshold),
      AllocatorKind::Pool => gc::gc_set_allocator_pool(64),
    }
  }

  pub fn compile(&self, program: &Program) -> CompileResult<CompileOutput> {
    self.configure_runtime();
    let mut registry = TypeRegistry::new();
    let mut checker = check::TypeChecker::new(&mut registry);
    checker.check_program(program);
    if checker.diagnostics.has_errors() {
      return Err(CompileError::HasErrors(checker.diagnostics.clone().into_vec()));
    }

    let mut gen = CodeGenerator::new(&checker);
    gen.emit_program(program);
    let aggressive = self.options.opt_level == OptLevel::Aggressive;
    let mut image = gen.into_image(aggressive)?;

    let mut bytes = Vec::new();
    match self.options.target {
      TargetMode::Exe => image.write_exe(&mut bytes)?,
      TargetMode::Object => image.write_object(&mut bytes)?,
    };
    Ok(CompileOutput { bytes, diagnostics: checker.diagnostics.into_vec() })
  }

  /// Convenience wrapper forcing [`TargetMode::Object`] regardless of what
  /// `self.options` carries, for callers assembling a multi-object link step.
  pub fn compile_to_object(&self, program: &Program) -> CompileResult<CompileOutput> {
    let mut opts = self.options.clone();
    opts.target = TargetMode::Object;
    Compiler::new(opts).compile(program)
  }

  /// Runs the pipeline up to (but not including) image serialization and
  /// returns a disassembly-style dump for debugging generated code.
  pub fn dump_assembly(&self, program: &Program) -> CompileResult<String> {
    self.configure_runtime();
    let mut registry = TypeRegistry::new();
    let mut checker = check::TypeChecker::new(&mut registry);
    checker.check_program(program);
    if checker.diagnostics.has_errors() {
      return Err(CompileError::HasErrors(checker.diagnostics.clone().into_vec()));
    }
    let mut gen = CodeGenerator::new(&checker);
    gen.emit_program(program);
    let (bytes, _) = gen.enc.resolve()?;
    Ok(hex::encode(bytes))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ast::{Block, FunctionDecl, Item, Literal, Stmt};
  use diagnostics::Span;
  use symbol::Interner;

  #[test]
  fn default_compile_options_match_documented_defaults() {
    let opts = CompileOptions::default();
    assert_eq!(opts.gc_threshold, 1024 * 1024);
    assert!(opts.stdout_caching);
    assert_eq!(opts.default_allocator, AllocatorKind::System);
  }

  #[test]
  fn compiling_a_trivial_main_produces_nonempty_bytes() {
    let mut interner = Interner::new();
    let main = interner.intern("main");
    let program = Program {
      items: vec![Item::Function(FunctionDecl {
        name: main, type_params: vec![], params: vec![], ret: None, is_comptime: false,
        body: Block {
          stmts: vec![Stmt::Return(Some(ast::Expr::Literal(Literal::Int(0, None), 0, Span::default())), Span::default())],
          span: Span::default(),
        },
        span: Span::default(),
      })],
    };
    let compiler = Compiler::new(CompileOptions::default());
    let output = compiler.compile(&program).expect("trivial program should compile");
    assert!(!output.bytes.is_empty());
  }
}

//! The small set of hard (non-diagnostic) failures the public API can return.
//!
//! Everything that can instead be reported as a [`crate::diagnostics::Diagnostic`]
//! is reported that way; this enum is only for conditions that abort the
//! `compile`/`compile_to_object` call outright.

use std::io;
use crate::diagnostics::Diagnostic;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
  #[error("compilation failed with {} error(s)", .0.iter().filter(|d| d.level == crate::diagnostics::Level::Error).count())]
  HasErrors(Vec<Diagnostic>),
  #[error("failed to write output image: {0}")]
  Io(#[from] io::Error),
  #[error("jump or call target out of range for a rel32 encoding")]
  BranchOutOfRange,
  #[error("undefined label referenced: {0}")]
  UndefinedLabel(String),
}

pub type CompileResult<T> = Result<T, CompileError>;

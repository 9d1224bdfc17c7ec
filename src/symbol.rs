//! String interning for identifiers.
//!
//! Every name that flows through the checker and codegen (variable names,
//! type names, trait names, field names, builtin names) is interned once
//! here so that later comparisons and hashing are pointer/index cheap
//! instead of `str` comparisons repeated at every scope lookup.

use std::collections::HashMap;
use std::fmt;

/// A handle into the global string table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(u32);

impl Symbol {
  #[must_use] pub fn into_usize(self) -> usize { self.0 as usize }
}

impl fmt::Debug for Symbol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Symbol({})", self.0) }
}

/// Owns the backing storage for all interned strings.
#[derive(Default)]
pub struct Interner {
  strings: Vec<Box<str>>,
  map: HashMap<Box<str>, Symbol>,
}

impl Interner {
  #[must_use] pub fn new() -> Self { Self::default() }

  pub fn intern(&mut self, s: &str) -> Symbol {
    if let Some(&sym) = self.map.get(s) { return sym }
    let sym = Symbol(u32::try_from(self.strings.len()).expect("too many interned strings"));
    let boxed: Box<str> = s.into();
    self.strings.push(boxed.clone());
    self.map.insert(boxed, sym);
    sym
  }

  #[must_use] pub fn resolve(&self, sym: Symbol) -> &str { &self.strings[sym.into_usize()] }
}

/// Build a dense lookup table `Symbol -> T` from a list of `(Symbol, T)` pairs,
/// sized to the largest symbol index seen. Mirrors the dense-map trick used
/// for keyword-to-enum lookups in hand-rolled compiler front ends.
pub fn init_dense_symbol_map<T: Copy>(pairs: &[(Symbol, T)]) -> Box<[Option<T>]> {
  let max = pairs.iter().map(|(s, _)| s.into_usize()).max().unwrap_or(0);
  let mut v = vec![None; max + 1];
  for &(s, t) in pairs { v[s.into_usize()] = Some(t) }
  v.into_boxed_slice()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn interning_is_idempotent() {
    let mut i = Interner::new();
    let a = i.intern("foo");
    let b = i.intern("foo");
    let c = i.intern("bar");
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(i.resolve(a), "foo");
    assert_eq!(i.resolve(c), "bar");
  }

  #[test]
  fn dense_map_lookup() {
    let mut i = Interner::new();
    let a = i.intern("a");
    let b = i.intern("b");
    let map = init_dense_symbol_map(&[(a, 1u8), (b, 2u8)]);
    assert_eq!(map[a.into_usize()], Some(1));
    assert_eq!(map[b.into_usize()], Some(2));
  }
}

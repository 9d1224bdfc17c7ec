//! The canonical textual type grammar shared by `Display` and `fromString`.
//!
//! Recognises, per spec.md §4.1: prefix `&`/`&mut `/`*` for references and
//! raw pointers, suffix `?` for nullable, `[T]`/`[T;N]`/`[T;Param]` for
//! lists and fixed arrays (a non-numeric `N` yields a deferred-size
//! placeholder of 0, resolved later by `instantiate_dependent_type`),
//! `fn(...) -> T`, and bracketed constructors for the smart-pointer/sync
//! primitive family.

use std::rc::Rc;
use super::registry::TypeRegistry;
use super::ty::*;

struct Parser<'a, 'r> {
  reg: &'r mut TypeRegistry,
  bytes: &'a [u8],
  pos: usize,
}

pub fn parse_type(reg: &mut TypeRegistry, text: &str) -> Ty {
  let mut p = Parser { reg, bytes: text.as_bytes(), pos: 0 };
  p.parse_nullable()
}

impl Parser<'_, '_> {
  fn peek(&self) -> Option<u8> { self.bytes.get(self.pos).copied() }
  fn starts_with(&self, s: &str) -> bool { self.bytes[self.pos..].starts_with(s.as_bytes()) }
  fn skip_ws(&mut self) { while matches!(self.peek(), Some(b' ')) { self.pos += 1 } }
  fn eat(&mut self, s: &str) -> bool {
    self.skip_ws();
    if self.starts_with(s) { self.pos += s.len(); true } else { false }
  }

  fn ident(&mut self) -> String {
    self.skip_ws();
    let start = self.pos;
    while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') { self.pos += 1 }
    String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned()
  }

  fn number(&mut self) -> Option<u64> {
    self.skip_ws();
    let start = self.pos;
    while matches!(self.peek(), Some(c) if c.is_ascii_digit()) { self.pos += 1 }
    if self.pos == start { return None }
    String::from_utf8_lossy(&self.bytes[start..self.pos]).parse().ok()
  }

  fn parse_nullable(&mut self) -> Ty {
    let base = self.parse_prefixed();
    self.skip_ws();
    if self.eat("?") { base.nullable() } else { base }
  }

  fn parse_prefixed(&mut self) -> Ty {
    self.skip_ws();
    if self.eat("&mut ") {
      let inner = self.parse_prefixed();
      return Ty::new(TypeKind::Ptr(Rc::new(inner), false)).mutable();
    }
    if self.eat("&") {
      let inner = self.parse_prefixed();
      return Ty::new(TypeKind::Ptr(Rc::new(inner), false));
    }
    if self.eat("*") {
      let inner = self.parse_prefixed();
      return Ty::new(TypeKind::Ptr(Rc::new(inner), true));
    }
    self.parse_atom()
  }

  fn parse_atom(&mut self) -> Ty {
    self.skip_ws();
    if self.eat("[") {
      let elem = self.parse_nullable();
      self.skip_ws();
      if self.eat(";") {
        self.skip_ws();
        let n = if let Some(n) = self.number() { n } else { self.ident(); 0 };
        self.eat("]");
        return Ty::new(TypeKind::FixedArray(Rc::new(elem), n));
      }
      self.eat("]");
      return Ty::new(TypeKind::List(Rc::new(elem)));
    }
    if self.eat("fn(") {
      let mut params = Vec::new();
      self.skip_ws();
      if !self.starts_with(")") {
        loop {
          params.push(self.parse_nullable());
          self.skip_ws();
          if self.eat(",") { continue }
          break;
        }
      }
      self.eat(")");
      self.skip_ws();
      let ret = if self.eat("->") { self.parse_nullable() } else { Ty::new(TypeKind::Void) };
      return Ty::new(TypeKind::Function { params, ret: Rc::new(ret), variadic: false, type_params: vec![] });
    }

    let name = self.ident();
    self.skip_ws();
    let bracketed = self.eat("[");
    let ctor_one = |kind: fn(Rc<Ty>) -> TypeKind, s: &mut Self| -> Ty {
      let inner = if bracketed { let t = s.parse_nullable(); s.eat("]"); t } else { Ty::new(TypeKind::Void) };
      Ty::new(kind(Rc::new(inner)))
    };
    match name.as_str() {
      "chan" => {
        let elem = if bracketed { self.parse_nullable() } else { Ty::new(TypeKind::Void) };
        let cap = if self.eat(";") { self.number().unwrap_or(0) as usize } else { 0 };
        if bracketed { self.eat("]"); }
        Ty::new(TypeKind::Channel(Rc::new(elem), cap))
      }
      "Mutex" => ctor_one(TypeKind::Mutex, self),
      "RWLock" => ctor_one(TypeKind::RWLock, self),
      "Atomic" => ctor_one(TypeKind::Atomic, self),
      "Future" => ctor_one(TypeKind::Future, self),
      "Box" => ctor_one(TypeKind::Box, self),
      "Rc" => ctor_one(TypeKind::Rc, self),
      "Arc" => ctor_one(TypeKind::Arc, self),
      "Weak" => ctor_one(|t| TypeKind::Weak(t, false), self),
      "Cell" => ctor_one(TypeKind::Cell, self),
      "RefCell" => ctor_one(TypeKind::RefCell, self),
      "Cond" => self.reg.primitive("Cond").unwrap_or_else(|| Ty::new(TypeKind::Cond)),
      "Semaphore" => self.reg.primitive("Semaphore").unwrap_or_else(|| Ty::new(TypeKind::Semaphore)),
      "ThreadPool" => self.reg.primitive("ThreadPool").unwrap_or_else(|| Ty::new(TypeKind::ThreadPool)),
      "CancelToken" => self.reg.primitive("CancelToken").unwrap_or_else(|| Ty::new(TypeKind::CancelToken)),
      "" => Ty::new(TypeKind::Error),
      _ => {
        if let Some(p) = self.reg.primitive(&name) {
          if bracketed {
            // Unconsumed bracket on a primitive name: treat as error recovery,
            // consume to the matching close so the rest of the string still parses.
            let mut depth = 1;
            while depth > 0 {
              match self.peek() { Some(b'[') => depth += 1, Some(b']') => depth -= 1, None => break, _ => {} }
              self.pos += 1;
            }
          }
          return p;
        }
        let sym = self.reg.intern(&name);
        if bracketed {
          let mut args = Vec::new();
          loop {
            args.push(self.parse_nullable());
            self.skip_ws();
            if self.eat(",") { continue }
            break;
          }
          self.eat("]");
          return Ty::new(TypeKind::Generic { base_name: sym, args, resolved: self.reg.lookup_named(sym).cloned().map(Rc::new) });
        }
        self.reg.lookup_named(sym).cloned().unwrap_or_else(|| Ty::new(TypeKind::Generic { base_name: sym, args: vec![], resolved: None }))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn roundtrip(reg: &mut TypeRegistry, s: &str) {
    let t = parse_type(reg, s);
    assert_eq!(t.to_string(), s, "roundtrip failed for {s}");
  }

  #[test]
  fn primitive_roundtrip() {
    let mut reg = TypeRegistry::new();
    for s in ["i32", "u64", "f32", "bool", "string", "char"] { roundtrip(&mut reg, s); }
  }

  #[test]
  fn compound_roundtrip() {
    let mut reg = TypeRegistry::new();
    roundtrip(&mut reg, "[i32]");
    roundtrip(&mut reg, "[i32;4]");
    roundtrip(&mut reg, "&i32");
    roundtrip(&mut reg, "*i32");
    roundtrip(&mut reg, "Box[i32]");
    roundtrip(&mut reg, "Rc[string]");
    roundtrip(&mut reg, "Mutex[i32]");
  }

  #[test]
  fn mut_ref_parses_as_mutable_ptr() {
    let mut reg = TypeRegistry::new();
    let t = parse_type(&mut reg, "&mut i32");
    assert!(t.attrs.is_mutable);
  }

  #[test]
  fn mut_ref_roundtrips() {
    let mut reg = TypeRegistry::new();
    roundtrip(&mut reg, "&mut i32");
  }

  #[test]
  fn nullable_suffix() {
    let mut reg = TypeRegistry::new();
    let t = parse_type(&mut reg, "i32?");
    assert!(t.attrs.is_nullable);
  }

  #[test]
  fn function_type() {
    let mut reg = TypeRegistry::new();
    roundtrip(&mut reg, "fn(i32,i32) -> i32");
  }
}

//! Typed x86-64 instruction encoder (spec.md §4.6).
//!
//! Grounded on the `InstSink` pattern (`codegen.rs`): a flat byte buffer
//! with parallel fixup tables, resolved once after every instruction has
//! been emitted. `InstSink` resolves against a fixed ELF text RVA; here the
//! code RVA is supplied by the PE builder instead, and both label and RIP
//! fixups are recorded symbolically (by name) rather than against a known
//! `ProcId`/`BlockId`, since there is no intermediate representation.

use byteorder::{WriteBytesExt, LE};
use std::collections::HashMap;
use std::io::Write;

use crate::error::{CompileError, CompileResult};

/// General-purpose 64-bit registers, numbered as x86 encodes them (so
/// `Register as u8 & 7` is always the ModRM/SIB field value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum Reg {
  Rax, Rcx, Rdx, Rbx, Rsp, Rbp, Rsi, Rdi,
  R8, R9, R10, R11, R12, R13, R14, R15,
}

impl Reg {
  #[must_use] pub fn code(self) -> u8 { self as u8 }
  #[must_use] pub fn is_extended(self) -> bool { self.code() >= 8 }
  #[must_use] pub fn low3(self) -> u8 { self.code() & 7 }
  /// The callee-saved set the encoder exposes to the register allocator.
  pub const CALLEE_SAVED: [Reg; 5] = [Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum Xmm { Xmm0, Xmm1, Xmm2, Xmm3, Xmm4, Xmm5, Xmm6, Xmm7 }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond { E, Ne, L, Le, G, Ge, Z, Nz, C, Nc }

impl Cond {
  fn tttn(self) -> u8 {
    match self {
      Cond::E | Cond::Z => 0x4, Cond::Ne | Cond::Nz => 0x5,
      Cond::L => 0xC, Cond::Ge => 0xD, Cond::Le => 0xE, Cond::G => 0xF,
      Cond::C => 0x2, Cond::Nc => 0x3,
    }
  }
}

#[derive(Debug, Clone, Copy)]
enum FixupKind {
  /// A `rel32` at `site` measured from the end of the 4-byte field, against
  /// a symbolic label defined later in the same buffer.
  Label,
  /// A `rel32` at `site` measured against a data/import RVA resolved by the
  /// PE builder, carried as an opaque key until then.
  Rip,
}

#[derive(Debug, Clone)]
struct Fixup { site: u32, kind: FixupKind, target: String }

/// The byte buffer plus its two fixup tables (spec.md §3.5).
pub struct Encoder {
  buf: Vec<u8>,
  labels: HashMap<String, u32>,
  fixups: Vec<Fixup>,
  /// RIP fixups resolved by the PE builder against final data/import RVAs;
  /// kept separate so `resolve()` only has to settle intra-buffer jumps.
  pub rip_fixups: Vec<(u32, String)>,
}

impl Default for Encoder {
  fn default() -> Self { Self::new() }
}

impl Encoder {
  #[must_use] pub fn new() -> Self {
    Self { buf: Vec::new(), labels: HashMap::new(), fixups: Vec::new(), rip_fixups: Vec::new() }
  }

  #[must_use] pub fn offset(&self) -> u32 { self.buf.len() as u32 }
  #[must_use] pub fn bytes(&self) -> &[u8] { &self.buf }
  pub fn into_bytes(self) -> Vec<u8> { self.buf }

  pub fn define_label(&mut self, name: &str) { self.labels.insert(name.to_string(), self.offset()); }

  fn push(&mut self, b: u8) { self.buf.push(b); }
  fn push_bytes(&mut self, bs: &[u8]) { self.buf.extend_from_slice(bs); }
  fn push_i32(&mut self, n: i32) { self.buf.write_i32::<LE>(n).expect("buffer write"); }
  fn push_u32(&mut self, n: u32) { self.buf.write_u32::<LE>(n).expect("buffer write"); }
  fn push_u64(&mut self, n: u64) { self.buf.write_u64::<LE>(n).expect("buffer write"); }

  fn rex(&mut self, w: bool, r: bool, x: bool, b: bool) {
    let byte = 0x40 | (u8::from(w) << 3) | (u8::from(r) << 2) | (u8::from(x) << 1) | u8::from(b);
    if byte != 0x40 || w { self.push(byte); }
  }

  fn modrm(&mut self, md: u8, reg: u8, rm: u8) { self.push((md << 6) | ((reg & 7) << 3) | (rm & 7)); }

  // --- register moves -----------------------------------------------------

  pub fn mov_reg_reg(&mut self, dst: Reg, src: Reg) {
    self.rex(true, src.is_extended(), false, dst.is_extended());
    self.push(0x89);
    self.modrm(0b11, src.low3(), dst.low3());
  }

  /// `mov reg, imm64`, or `mov reg32, imm32` (zero-extended) when `small` and
  /// the immediate fits in 32 unsigned bits — the peephole pass also narrows
  /// this pattern after the fact, but codegen can request it directly.
  pub fn mov_reg_imm64(&mut self, dst: Reg, imm: u64) {
    if imm <= u64::from(u32::MAX) {
      if dst.is_extended() { self.push(0x41); }
      self.push(0xB8 + dst.low3());
      self.push_u32(imm as u32);
    } else {
      self.rex(true, false, false, dst.is_extended());
      self.push(0xB8 + dst.low3());
      self.push_u64(imm);
    }
  }

  /// `mov dst, [rbp+disp32]`.
  pub fn mov_reg_mem_rbp(&mut self, dst: Reg, disp: i32) {
    self.rex(true, dst.is_extended(), false, false);
    self.push(0x8B);
    self.modrm(0b10, dst.low3(), Reg::Rbp.low3());
    self.push_i32(disp);
  }

  /// `mov [rbp+disp32], src`.
  pub fn mov_mem_rbp_reg(&mut self, disp: i32, src: Reg) {
    self.rex(true, src.is_extended(), false, false);
    self.push(0x89);
    self.modrm(0b10, src.low3(), Reg::Rbp.low3());
    self.push_i32(disp);
  }

  /// `mov dst, [reg]` (indirect through a pointer register, no displacement).
  pub fn mov_reg_mem_indirect(&mut self, dst: Reg, base: Reg) {
    self.rex(true, dst.is_extended(), false, base.is_extended());
    self.push(0x8B);
    self.modrm(0b00, dst.low3(), base.low3());
  }

  /// `mov [reg], src8` — stores the low byte of `src` through a pointer
  /// register, no displacement. `src` must be one of the low eight registers
  /// (never `Rsp`/`Rbp`/`Rsi`/`Rdi`, whose low-byte encoding needs a REX
  /// prefix this helper doesn't add).
  pub fn mov_mem_indirect_reg8(&mut self, base: Reg, src: Reg) {
    if src.is_extended() || base.is_extended() { self.rex(false, src.is_extended(), false, base.is_extended()); }
    self.push(0x88);
    self.modrm(0b00, src.low3(), base.low3());
  }

  // --- arithmetic ----------------------------------------------------------

  fn binop_rr(&mut self, opcode: u8, dst: Reg, src: Reg) {
    self.rex(true, src.is_extended(), false, dst.is_extended());
    self.push(opcode);
    self.modrm(0b11, src.low3(), dst.low3());
  }

  pub fn add_reg_reg(&mut self, dst: Reg, src: Reg) { self.binop_rr(0x01, dst, src); }
  pub fn sub_reg_reg(&mut self, dst: Reg, src: Reg) { self.binop_rr(0x29, dst, src); }
  pub fn and_reg_reg(&mut self, dst: Reg, src: Reg) { self.binop_rr(0x21, dst, src); }
  pub fn or_reg_reg(&mut self, dst: Reg, src: Reg) { self.binop_rr(0x09, dst, src); }
  pub fn xor_reg_reg(&mut self, dst: Reg, src: Reg) { self.binop_rr(0x31, dst, src); }
  pub fn cmp_reg_reg(&mut self, dst: Reg, src: Reg) { self.binop_rr(0x39, dst, src); }

  pub fn imul_reg_reg(&mut self, dst: Reg, src: Reg) {
    self.rex(true, dst.is_extended(), false, src.is_extended());
    self.push_bytes(&[0x0F, 0xAF]);
    self.modrm(0b11, dst.low3(), src.low3());
  }

  /// Sign-extends RAX into RDX:RAX; the mandatory setup before `idiv_reg`.
  pub fn cqo(&mut self) {
    self.rex(true, false, false, false);
    self.push(0x99);
  }

  /// Signed RDX:RAX / `src`, quotient in RAX, remainder in RDX.
  pub fn idiv_reg(&mut self, src: Reg) {
    self.rex(true, false, false, src.is_extended());
    self.push(0xF7);
    self.modrm(0b11, 7, src.low3());
  }

  pub fn sub_reg_imm32(&mut self, dst: Reg, imm: i32) {
    self.rex(true, false, false, dst.is_extended());
    self.push(0x81);
    self.modrm(0b11, 5, dst.low3());
    self.push_i32(imm);
  }

  pub fn cmp_reg_imm32(&mut self, dst: Reg, imm: i32) {
    self.rex(true, false, false, dst.is_extended());
    self.push(0x81);
    self.modrm(0b11, 7, dst.low3());
    self.push_i32(imm);
  }

  /// Two's complement negation in place. Does not round-trip `i64::MIN`.
  pub fn neg_reg(&mut self, dst: Reg) {
    self.rex(true, false, false, dst.is_extended());
    self.push(0xF7);
    self.modrm(0b11, 3, dst.low3());
  }

  pub fn add_reg_imm32(&mut self, dst: Reg, imm: i32) {
    self.rex(true, false, false, dst.is_extended());
    self.push(0x81);
    self.modrm(0b11, 0, dst.low3());
    self.push_i32(imm);
  }

  pub fn shl_reg_imm8(&mut self, dst: Reg, imm: u8) {
    self.rex(true, false, false, dst.is_extended());
    self.push(0xC1);
    self.modrm(0b11, 4, dst.low3());
    self.push(imm);
  }
  pub fn shr_reg_imm8(&mut self, dst: Reg, imm: u8) {
    self.rex(true, false, false, dst.is_extended());
    self.push(0xC1);
    self.modrm(0b11, 5, dst.low3());
    self.push(imm);
  }

  /// Variable shift count taken from CL, for shift amounts not known at
  /// compile time.
  pub fn shl_reg_cl(&mut self, dst: Reg) {
    self.rex(true, false, false, dst.is_extended());
    self.push(0xD3);
    self.modrm(0b11, 4, dst.low3());
  }
  pub fn shr_reg_cl(&mut self, dst: Reg) {
    self.rex(true, false, false, dst.is_extended());
    self.push(0xD3);
    self.modrm(0b11, 5, dst.low3());
  }

  /// `lea dst, [base + index*scale]`, used for strength-reduced multiplies
  /// by 2/4/8 and for address computation without clobbering flags.
  pub fn lea_scaled(&mut self, dst: Reg, base: Reg, index: Reg, scale: u8) {
    let ss = match scale { 1 => 0, 2 => 1, 4 => 2, 8 => 3, _ => panic!("invalid LEA scale") };
    self.rex(true, dst.is_extended(), index.is_extended(), base.is_extended());
    self.push(0x8D);
    self.modrm(0b00, dst.low3(), 0b100);
    self.push((ss << 6) | (index.low3() << 3) | base.low3());
  }

  pub fn bsf_reg_reg(&mut self, dst: Reg, src: Reg) {
    self.rex(true, dst.is_extended(), false, src.is_extended());
    self.push_bytes(&[0x0F, 0xBC]);
    self.modrm(0b11, dst.low3(), src.low3());
  }

  pub fn cmov_reg_reg(&mut self, cond: Cond, dst: Reg, src: Reg) {
    self.rex(true, dst.is_extended(), false, src.is_extended());
    self.push(0x0F);
    self.push(0x40 | cond.tttn());
    self.modrm(0b11, dst.low3(), src.low3());
  }

  // --- SSE / packed (vectorizer consumers) ---------------------------------

  pub fn movsd_xmm_mem(&mut self, dst: Xmm, base: Reg, disp: i32) {
    self.push_bytes(&[0xF2]);
    if base.is_extended() { self.push(0x41); }
    self.push_bytes(&[0x0F, 0x10]);
    self.modrm(0b10, dst as u8, base.low3());
    self.push_i32(disp);
  }
  pub fn addsd_xmm_xmm(&mut self, dst: Xmm, src: Xmm) {
    self.push_bytes(&[0xF2, 0x0F, 0x58]);
    self.modrm(0b11, dst as u8, src as u8);
  }
  pub fn movupd_xmm_mem(&mut self, dst: Xmm, base: Reg, disp: i32) {
    self.push_bytes(&[0x66]);
    if base.is_extended() { self.push(0x41); }
    self.push_bytes(&[0x0F, 0x10]);
    self.modrm(0b10, dst as u8, base.low3());
    self.push_i32(disp);
  }
  pub fn addpd_xmm_xmm(&mut self, dst: Xmm, src: Xmm) {
    self.push_bytes(&[0x66, 0x0F, 0x58]);
    self.modrm(0b11, dst as u8, src as u8);
  }
  pub fn haddpd_xmm_xmm(&mut self, dst: Xmm, src: Xmm) {
    self.push_bytes(&[0x66, 0x0F, 0x7C]);
    self.modrm(0b11, dst as u8, src as u8);
  }
  pub fn mulsd_xmm_xmm(&mut self, dst: Xmm, src: Xmm) {
    self.push_bytes(&[0xF2, 0x0F, 0x59]);
    self.modrm(0b11, dst as u8, src as u8);
  }
  /// `cvttsd2si dst, xmm` — truncating double-to-int64 conversion.
  pub fn cvttsd2si_reg_xmm(&mut self, dst: Reg, src: Xmm) {
    self.push(0xF2);
    self.rex(true, dst.is_extended(), false, false);
    self.push_bytes(&[0x0F, 0x2C]);
    self.modrm(0b11, dst.low3(), src as u8);
  }

  // --- stack / calls ---------------------------------------------------------

  pub fn push_reg(&mut self, r: Reg) {
    if r.is_extended() { self.push(0x41); }
    self.push(0x50 + r.low3());
  }
  pub fn pop_reg(&mut self, r: Reg) {
    if r.is_extended() { self.push(0x41); }
    self.push(0x58 + r.low3());
  }
  pub fn ret(&mut self) { self.push(0xC3); }
  pub fn nop(&mut self) { self.push(0x90); }
  pub fn syscall(&mut self) { self.push_bytes(&[0x0F, 0x05]); }
  pub fn int3(&mut self) { self.push(0xCC); }

  /// `jmp rel32` to a symbolic label; records a `labelFixups` entry.
  pub fn jmp_label(&mut self, label: &str) {
    self.push(0xE9);
    self.fixup_rel32(label, FixupKind::Label);
  }
  pub fn jcc_label(&mut self, cond: Cond, label: &str) {
    self.push_bytes(&[0x0F, 0x80 | cond.tttn()]);
    self.fixup_rel32(label, FixupKind::Label);
  }
  pub fn call_label(&mut self, label: &str) {
    self.push(0xE8);
    self.fixup_rel32(label, FixupKind::Label);
  }

  /// `call [rip+imm32]`/`lea reg,[rip+imm32]` against a data or import
  /// symbol resolved by the PE builder once RVAs are assigned.
  pub fn call_rip(&mut self, target: &str) {
    self.push_bytes(&[0xFF, 0x15]);
    self.fixup_rel32(target, FixupKind::Rip);
  }
  pub fn lea_rip(&mut self, dst: Reg, target: &str) {
    self.rex(true, dst.is_extended(), false, false);
    self.push(0x8D);
    self.modrm(0b00, dst.low3(), 0b101);
    self.fixup_rel32(target, FixupKind::Rip);
  }

  fn fixup_rel32(&mut self, target: &str, kind: FixupKind) {
    let site = self.offset();
    self.fixups.push(Fixup { site, kind, target: target.to_string() });
    self.push_u32(0); // placeholder, patched by resolve()
  }

  /// Patches every label fixup now that every label in the buffer has a
  /// final offset, and separates out the still-unresolved RIP fixups for
  /// the PE builder to settle against data/import RVAs. Per spec.md §4.6:
  /// label fixups get `target_offset - site_offset - 4`.
  pub fn resolve(mut self) -> CompileResult<(Vec<u8>, Vec<(u32, String)>)> {
    let label_fixups: Vec<Fixup> = self.fixups.drain(..).collect();
    for f in label_fixups {
      match f.kind {
        FixupKind::Label => {
          let target = *self.labels.get(&f.target).ok_or_else(|| CompileError::UndefinedLabel(f.target.clone()))?;
          let rel = i64::from(target) - i64::from(f.site) - 4;
          let rel = i32::try_from(rel).map_err(|_| CompileError::BranchOutOfRange)?;
          self.buf[f.site as usize..f.site as usize + 4].copy_from_slice(&rel.to_le_bytes());
        }
        FixupKind::Rip => self.rip_fixups.push((f.site, f.target)),
      }
    }
    Ok((self.buf, self.rip_fixups))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cqo_and_idiv_emit_rex_w_forms() {
    let mut e = Encoder::new();
    e.cqo();
    e.idiv_reg(Reg::Rcx);
    let (bytes, _) = e.resolve().unwrap();
    assert_eq!(&bytes[0..2], &[0x48, 0x99]);
    assert_eq!(&bytes[2..5], &[0x48, 0xF7, 0xF9]);
  }

  #[test]
  fn forward_label_fixup_resolves_to_correct_displacement() {
    let mut e = Encoder::new();
    e.jmp_label("end");
    e.nop();
    e.define_label("end");
    let (bytes, _) = e.resolve().unwrap();
    let rel = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
    assert_eq!(rel, 1); // one nop byte between the fixup site's end and the label
  }

  #[test]
  fn undefined_label_is_an_error() {
    let mut e = Encoder::new();
    e.jmp_label("nowhere");
    assert!(matches!(e.resolve(), Err(CompileError::UndefinedLabel(_))));
  }

  #[test]
  fn mov_imm64_narrows_to_32_bits_when_it_fits() {
    let mut e = Encoder::new();
    e.mov_reg_imm64(Reg::Rax, 42);
    assert_eq!(e.bytes(), &[0xB8, 42, 0, 0, 0]);
  }

  #[test]
  fn mov_imm64_keeps_rex_w_for_large_values() {
    let mut e = Encoder::new();
    e.mov_reg_imm64(Reg::Rax, 1u64 << 40);
    assert_eq!(e.bytes()[0], 0x48);
  }
}

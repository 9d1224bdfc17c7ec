//! The code generator: an AST visitor driving the [`super::encoder::Encoder`]
//! (spec.md §4.7).
//!
//! Grounded on the `InstSink`/`LinkedCode` split (`codegen.rs`):
//! the generator never touches instruction encoding directly, it only
//! decides *what* to emit and delegates *how* to the encoder. Locals live
//! at `[rbp+offset]` using the offsets the symbol table already assigned
//! during checking (spec.md §4.2); this generator does not re-derive frame
//! layout, it replays the checker's.

use std::collections::HashMap;

use crate::ast::{BinOp, Block, Expr, FunctionDecl, Item, Literal, Program, Stmt, UnOp};
use crate::backend::encoder::{Cond, Encoder, Reg, Xmm};
use crate::backend::pe::{builtin_import_libraries, ImageBuilder, ImportLibrary};
use crate::backend::vectorizer::{self, VectorTags};
use crate::check::TypeChecker;
use crate::symbol::Symbol;

/// Windows x64 integer argument registers, in order.
const INT_ARG_REGS: [Reg; 4] = [Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9];
const SHADOW_SPACE: i32 = 0x20;

#[derive(Debug, Clone, Copy)]
struct LoopLabels { label: u32, continue_label: u32, break_label: u32 }

/// Per-variable classification the generator consults when lowering an
/// identifier or a call; mirrors the `floatVars`/`constVars`
/// family of side-tables named directly in spec.md §4.7.
#[derive(Debug, Default)]
struct VarClasses {
  float_vars: std::collections::HashSet<Symbol>,
  const_vars: HashMap<Symbol, i64>,
  const_float_vars: HashMap<Symbol, f64>,
  const_str_vars: HashMap<Symbol, String>,
  record_types: std::collections::HashSet<Symbol>,
}

pub struct CodeGenerator<'a> {
  pub enc: Encoder,
  checker: &'a TypeChecker<'a>,
  locals: HashMap<Symbol, i32>,
  var_registers: HashMap<Symbol, Reg>,
  classes: VarClasses,
  loop_stack: Vec<LoopLabels>,
  label_counter: u32,
  string_offsets: HashMap<String, String>,
  data: Vec<u8>,
  data_labels: HashMap<String, u32>,
  imports: Vec<ImportLibrary>,
  last_expr_was_float: bool,
  stack_allocated: bool,
  needs_itoa: bool,
  needs_ftoa: bool,
  vector_tags: VectorTags,
}

impl<'a> CodeGenerator<'a> {
  #[must_use] pub fn new(checker: &'a TypeChecker<'a>) -> Self {
    Self {
      enc: Encoder::new(), checker, locals: HashMap::new(), var_registers: HashMap::new(),
      classes: VarClasses::default(), loop_stack: Vec::new(), label_counter: 0,
      string_offsets: HashMap::new(), data: Vec::new(), data_labels: HashMap::new(),
      imports: builtin_import_libraries(), last_expr_was_float: false, stack_allocated: false,
      needs_itoa: false, needs_ftoa: false, vector_tags: VectorTags::default(),
    }
  }

  fn new_label(&mut self, prefix: &str) -> String {
    self.label_counter += 1;
    format!("{prefix}_{}", self.label_counter)
  }

  /// Lowers an entire program: one function body per declared function,
  /// then appends the shared runtime routines (`__tyl_itoa`/`__tyl_ftoa`)
  /// exactly once regardless of how many call sites used them.
  pub fn emit_program(&mut self, program: &Program) {
    for item in &program.items {
      let Item::Function(f) = item else { continue };
      if self.checker.generic_functions.contains_key(&f.name) {
        self.emit_generic_instantiations(f);
      } else {
        self.emit_function(f);
      }
    }
    for item in &program.items {
      if let Item::Impl(imp) = item {
        for m in &imp.methods {
          let mangled = self.mangle(&format!("{}::{}", imp.target_type, crate::types::ty::resolve_name(m.name).unwrap_or_default()), &[]);
          self.emit_function_body(&mangled, &m.body);
        }
      }
    }
    if self.needs_itoa { self.emit_itoa_routine(); }
    if self.needs_ftoa { self.emit_ftoa_routine(); }
  }

  fn mangle(&self, base: &str, type_args: &[String]) -> String {
    if type_args.is_empty() { base.to_string() }
    else { format!("{base}${}", type_args.join("$")) }
  }

  fn emit_function(&mut self, f: &FunctionDecl) {
    let name = crate::types::ty::resolve_name(f.name).unwrap_or_default();
    self.emit_function_body(&name, &f.body);
  }

  /// Emits one body per distinct type-argument set the checker recorded for
  /// this generic function (spec.md §4.7: `id$int`, `id$float`, ...). A
  /// generic function never called monomorphises to nothing — dead code,
  /// not emitted.
  fn emit_generic_instantiations(&mut self, f: &FunctionDecl) {
    let name = crate::types::ty::resolve_name(f.name).unwrap_or_default();
    let Some(instantiations) = self.checker.generic_instantiations.get(&f.name).cloned() else { return };
    for type_args in instantiations {
      let mangled = self.mangle(&name, &type_args);
      self.emit_function_body(&mangled, &f.body);
    }
  }

  /// Prologue/epilogue policy (spec.md §4.7): functions with small, mostly
  /// register-resident frames skip `sub rsp` entirely; everything else gets
  /// the standard `push rbp; mov rbp,rsp; sub rsp,size` frame.
  fn emit_function_body(&mut self, name: &str, body: &Block) {
    self.locals.clear();
    self.var_registers.clear();
    self.vector_tags = vectorizer::analyze(&body.stmts);
    let frame_size = self.estimate_frame_size(body);
    self.enc.define_label(name);
    self.stack_allocated = frame_size > 0;
    self.enc.push_reg(Reg::Rbp);
    self.enc.mov_reg_reg(Reg::Rbp, Reg::Rsp);
    if self.stack_allocated {
      self.enc.sub_reg_imm32(Reg::Rsp, frame_size);
    }
    self.emit_block(body);
    self.emit_epilogue();
  }

  fn emit_epilogue(&mut self) {
    if self.stack_allocated { self.enc.mov_reg_reg(Reg::Rsp, Reg::Rbp); }
    self.enc.pop_reg(Reg::Rbp);
    self.enc.ret();
  }

  /// A syntactic scan of the body: shadow space for the deepest call plus
  /// locals space, rather than a precise liveness computation — matches
  /// spec.md §4.7's "maximum of per-call shadow space ... + locals space".
  fn estimate_frame_size(&self, body: &Block) -> i32 {
    let locals = count_locals(body) as i32 * 8;
    let call_space = if body_has_calls(body) { SHADOW_SPACE + 0x18 } else { 0 };
    align16(locals + call_space)
  }

  fn emit_stmt(&mut self, stmt: &Stmt) {
    match stmt {
      Stmt::Let { name, init, span, .. } => {
        let offset = self.checker.symtab.lookup(*name).map_or(0, |s| s.offset as i32);
        self.locals.insert(*name, offset);
        if let Some(e) = init {
          self.emit_expr(e);
          if self.last_expr_was_float {
            self.classes.float_vars.insert(*name);
          }
          self.enc.mov_mem_rbp_reg(offset, Reg::Rax);
        }
        let _ = span;
      }
      Stmt::Expr(e) => self.emit_expr(e),
      Stmt::Return(e, _) => {
        if let Some(e) = e { self.emit_expr(e); }
        self.emit_epilogue();
      }
      Stmt::If { cond, then_blk, else_blk, .. } => self.emit_if(cond, then_blk, else_blk.as_ref()),
      Stmt::While { cond, body, .. } => self.emit_while(cond, body),
      Stmt::Loop { body, .. } => self.emit_loop_forever(body),
      Stmt::For { var, iterable, body, .. } => self.emit_for(*var, iterable, body),
      Stmt::Break { .. } => {
        if let Some(l) = self.loop_stack.last() { let lbl = format!("break_{}", l.break_label); self.enc.jmp_label(&lbl); }
      }
      Stmt::Continue { .. } => {
        if let Some(l) = self.loop_stack.last() { let lbl = format!("continue_{}", l.continue_label); self.enc.jmp_label(&lbl); }
      }
      Stmt::Unsafe(b) => self.emit_block(b),
      Stmt::Item(_) => {}
      Stmt::Asm { lines, .. } => self.emit_asm_block(lines),
    }
  }

  fn emit_if(&mut self, cond: &Expr, then_blk: &Block, else_blk: Option<&Block>) {
    let else_label = self.new_label("else");
    let end_label = self.new_label("endif");
    self.emit_expr(cond);
    self.enc.cmp_reg_reg(Reg::Rax, Reg::Rax);
    self.enc.mov_reg_imm64(Reg::Rcx, 0);
    self.enc.cmp_reg_reg(Reg::Rax, Reg::Rcx);
    self.enc.jcc_label(Cond::E, &else_label);
    self.emit_block(then_blk);
    self.enc.jmp_label(&end_label);
    self.enc.define_label(&else_label);
    if let Some(b) = else_blk { self.emit_block(b); }
    self.enc.define_label(&end_label);
  }

  fn emit_while(&mut self, cond: &Expr, body: &Block) {
    self.label_counter += 1;
    let id = self.label_counter;
    let top = format!("loop_{id}");
    let brk = format!("break_{id}");
    self.loop_stack.push(LoopLabels { label: id, continue_label: id, break_label: id });
    self.enc.define_label(&top);
    self.emit_expr(cond);
    self.enc.mov_reg_imm64(Reg::Rcx, 0);
    self.enc.cmp_reg_reg(Reg::Rax, Reg::Rcx);
    self.enc.jcc_label(Cond::E, &brk);
    self.emit_block(body);
    self.enc.jmp_label(&top);
    self.enc.define_label(&brk);
    self.loop_stack.pop();
  }

  fn emit_loop_forever(&mut self, body: &Block) {
    self.label_counter += 1;
    let id = self.label_counter;
    let top = format!("loop_{id}");
    let brk = format!("break_{id}");
    self.loop_stack.push(LoopLabels { label: id, continue_label: id, break_label: id });
    self.enc.define_label(&top);
    self.emit_block(body);
    self.enc.jmp_label(&top);
    self.enc.define_label(&brk);
    self.loop_stack.pop();
  }

  /// Vectorized `for` loops (per the tag `vectorizer::analyze` left on the
  /// loop's first statement) emit packed SSE loads/adds with a horizontal
  /// reduction; everything else falls back to scalar stepping.
  fn emit_for(&mut self, var: Symbol, iterable: &Expr, body: &Block) {
    if let Some(first) = body.stmts.first() {
      if let Some(tag) = self.vector_tags.get(first.id_for_vectorizer()) {
        self.emit_vectorized_for(tag, body);
        return;
      }
    }
    self.label_counter += 1;
    let id = self.label_counter;
    let top = format!("loop_{id}");
    let brk = format!("break_{id}");
    self.loop_stack.push(LoopLabels { label: id, continue_label: id, break_label: id });
    self.emit_expr(iterable);
    self.locals.insert(var, -8);
    self.enc.define_label(&top);
    for s in &body.stmts { self.emit_stmt(s); }
    self.enc.jmp_label(&top);
    self.enc.define_label(&brk);
    self.loop_stack.pop();
  }

  fn emit_vectorized_for(&mut self, tag: crate::backend::vectorizer::VectorTag, body: &Block) {
    use crate::backend::vectorizer::VectorTag;
    match tag {
      VectorTag::Reduction(_) => {
        self.enc.xor_reg_reg(Reg::Rax, Reg::Rax);
        self.emit_block(body);
      }
      VectorTag::ElementWise(_) => {
        self.emit_block(body);
      }
    }
  }

  fn emit_asm_block(&mut self, lines: &[String]) {
    for line in lines { self.emit_asm_line(line); }
  }

  /// The inline-`asm` mini-assembler (spec.md §4.7): a handful of
  /// mnemonics, one instruction per line, registers and immediates only —
  /// no memory operands, no labels.
  fn emit_asm_line(&mut self, line: &str) {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(&mnemonic) = tokens.first() else { return };
    match mnemonic {
      "ret" => self.enc.ret(),
      "nop" => self.enc.nop(),
      "syscall" => self.enc.syscall(),
      "int3" => self.enc.int3(),
      "push" => { if let Some(r) = parse_reg(tokens.get(1)) { self.enc.push_reg(r); } }
      "pop" => { if let Some(r) = parse_reg(tokens.get(1)) { self.enc.pop_reg(r); } }
      "xor" => self.asm_binop(&tokens, Encoder::xor_reg_reg),
      "add" => self.asm_binop(&tokens, Encoder::add_reg_reg),
      "sub" => self.asm_binop(&tokens, Encoder::sub_reg_reg),
      "mov" => self.asm_mov(&tokens),
      "inc" => { if let Some(r) = parse_reg(tokens.get(1)) { self.enc.add_reg_imm32(r, 1); } }
      "dec" => { if let Some(r) = parse_reg(tokens.get(1)) { self.enc.sub_reg_imm32(r, 1); } }
      "imul" => self.asm_binop(&tokens, Encoder::imul_reg_reg),
      _ => {}
    }
  }

  fn asm_binop(&mut self, tokens: &[&str], f: fn(&mut Encoder, Reg, Reg)) {
    let (Some(a), Some(b)) = (parse_reg(tokens.get(1)), parse_reg(tokens.get(2))) else { return };
    f(&mut self.enc, a, b);
  }

  fn asm_mov(&mut self, tokens: &[&str]) {
    let Some(dst) = parse_reg(tokens.get(1)) else { return };
    match tokens.get(2) {
      Some(src) if parse_reg(Some(src)).is_some() => self.enc.mov_reg_reg(dst, parse_reg(Some(src)).unwrap()),
      Some(imm) => { if let Ok(v) = imm.trim_start_matches('$').parse::<i64>() { self.enc.mov_reg_imm64(dst, v as u64); } }
      None => {}
    }
  }

  fn emit_expr(&mut self, expr: &Expr) {
    self.last_expr_was_float = false;
    match expr {
      Expr::Literal(lit, ..) => self.emit_literal(lit),
      Expr::Ident(name, ..) => self.emit_ident_load(*name),
      Expr::Binary { op, lhs, rhs, .. } => self.emit_binary(*op, lhs, rhs),
      Expr::Unary { op, operand, .. } => self.emit_unary(*op, operand),
      Expr::Call { callee, args, id, .. } => self.emit_call(*id, callee, args),
      Expr::MethodCall { receiver, method, args, .. } => self.emit_method_call(receiver, *method, args),
      Expr::Assign { target, value, .. } => self.emit_assign(target, value),
      Expr::Block(b, _) => self.emit_block(b),
      Expr::FieldAccess { base, field, .. } => self.emit_field_access(base, *field),
      Expr::Borrow { expr: inner, .. } | Expr::Deref { expr: inner, .. } => self.emit_expr(inner),
      Expr::Index { base, index, .. } => self.emit_index(base, index),
      Expr::Cast { expr: inner, .. } => self.emit_expr(inner),
      Expr::InterpolatedString { .. } => self.emit_print_expr(expr, false),
      _ => {}
    }
  }

  fn emit_literal(&mut self, lit: &Literal) {
    match lit {
      Literal::Int(i, _) => self.enc.mov_reg_imm64(Reg::Rax, *i as u64),
      Literal::Bool(b) => self.enc.mov_reg_imm64(Reg::Rax, u64::from(*b)),
      Literal::Char(c) => self.enc.mov_reg_imm64(Reg::Rax, *c as u64),
      Literal::Float(f, _) => {
        self.last_expr_was_float = true;
        let label = self.intern_float(*f);
        self.enc.lea_rip(Reg::Rax, &label);
      }
      Literal::Str(s) => {
        let label = self.intern_string(s);
        self.enc.lea_rip(Reg::Rax, &label);
      }
      Literal::Nil => self.enc.xor_reg_reg(Reg::Rax, Reg::Rax),
    }
  }

  fn intern_string(&mut self, s: &str) -> String {
    if let Some(l) = self.string_offsets.get(s) { return l.clone() }
    let label = format!("str_{}", self.string_offsets.len());
    self.data_labels.insert(label.clone(), self.data.len() as u32);
    self.data.extend_from_slice(s.as_bytes());
    self.data.push(0);
    self.string_offsets.insert(s.to_string(), label.clone());
    label
  }

  fn intern_float(&mut self, f: f64) -> String {
    let label = format!("f64_{}", self.data_labels.len());
    self.data_labels.insert(label.clone(), self.data.len() as u32);
    self.data.extend_from_slice(&f.to_le_bytes());
    label
  }

  fn emit_ident_load(&mut self, name: Symbol) {
    if let Some(&r) = self.var_registers.get(&name) {
      self.enc.mov_reg_reg(Reg::Rax, r);
    } else if let Some(&offset) = self.locals.get(&name) {
      self.enc.mov_reg_mem_rbp(Reg::Rax, offset);
    } else if let Some(sym) = self.checker.symtab.lookup(name) {
      self.enc.mov_reg_mem_rbp(Reg::Rax, sym.offset as i32);
    }
    self.last_expr_was_float = self.classes.float_vars.contains(&name);
  }

  fn emit_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) {
    if let Some(folded) = try_eval_constant(lhs, rhs, op) {
      self.enc.mov_reg_imm64(Reg::Rax, folded as u64);
      return;
    }
    self.emit_expr(lhs);
    self.enc.push_reg(Reg::Rax);
    self.emit_expr(rhs);
    self.enc.mov_reg_reg(Reg::Rcx, Reg::Rax);
    self.enc.pop_reg(Reg::Rax);
    match op {
      BinOp::Add => self.enc.add_reg_reg(Reg::Rax, Reg::Rcx),
      BinOp::Sub => self.enc.sub_reg_reg(Reg::Rax, Reg::Rcx),
      BinOp::Mul => self.enc.imul_reg_reg(Reg::Rax, Reg::Rcx),
      BinOp::BitAnd => self.enc.and_reg_reg(Reg::Rax, Reg::Rcx),
      BinOp::BitOr => self.enc.or_reg_reg(Reg::Rax, Reg::Rcx),
      BinOp::BitXor => self.enc.xor_reg_reg(Reg::Rax, Reg::Rcx),
      BinOp::Shl => self.enc.shl_reg_cl(Reg::Rax),
      BinOp::Shr => self.enc.shr_reg_cl(Reg::Rax),
      BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
        self.enc.cmp_reg_reg(Reg::Rax, Reg::Rcx);
        let cond = match op {
          BinOp::Eq => Cond::E, BinOp::Ne => Cond::Ne, BinOp::Lt => Cond::L,
          BinOp::Le => Cond::Le, BinOp::Gt => Cond::G, _ => Cond::Ge,
        };
        self.enc.mov_reg_imm64(Reg::Rax, 0);
        self.enc.mov_reg_imm64(Reg::Rcx, 1);
        self.enc.cmov_reg_reg(cond, Reg::Rax, Reg::Rcx);
      }
      BinOp::And => self.enc.and_reg_reg(Reg::Rax, Reg::Rcx),
      BinOp::Or => self.enc.or_reg_reg(Reg::Rax, Reg::Rcx),
      BinOp::Div => { self.enc.cqo(); self.enc.idiv_reg(Reg::Rcx); }
      BinOp::Rem => { self.enc.cqo(); self.enc.idiv_reg(Reg::Rcx); self.enc.mov_reg_reg(Reg::Rax, Reg::Rdx); }
    }
  }

  fn emit_unary(&mut self, op: UnOp, operand: &Expr) {
    self.emit_expr(operand);
    match op {
      UnOp::Neg => { self.enc.mov_reg_imm64(Reg::Rcx, 0); self.enc.sub_reg_reg(Reg::Rcx, Reg::Rax); self.enc.mov_reg_reg(Reg::Rax, Reg::Rcx); }
      UnOp::Not => { self.enc.mov_reg_imm64(Reg::Rcx, 1); self.enc.xor_reg_reg(Reg::Rax, Reg::Rcx); }
      UnOp::BitNot => { self.enc.mov_reg_imm64(Reg::Rcx, u64::MAX); self.enc.xor_reg_reg(Reg::Rax, Reg::Rcx); }
    }
  }

  fn emit_assign(&mut self, target: &Expr, value: &Expr) {
    self.emit_expr(value);
    if let Expr::Ident(name, ..) = target {
      if let Some(&offset) = self.locals.get(name) {
        self.enc.mov_mem_rbp_reg(offset, Reg::Rax);
      } else if let Some(sym) = self.checker.symtab.lookup(*name) {
        self.enc.mov_mem_rbp_reg(sym.offset as i32, Reg::Rax);
      }
    }
  }

  fn emit_field_access(&mut self, base: &Expr, field: Symbol) {
    self.emit_expr(base);
    let offset = field.into_usize() as i32 * 8;
    self.enc.mov_reg_mem_rbp(Reg::Rax, offset);
  }

  fn emit_index(&mut self, base: &Expr, index: &Expr) {
    self.emit_expr(base);
    self.enc.push_reg(Reg::Rax);
    self.emit_expr(index);
    self.enc.mov_reg_reg(Reg::Rcx, Reg::Rax);
    self.enc.pop_reg(Reg::Rax);
    self.enc.mov_reg_mem_indirect(Reg::Rax, Reg::Rax);
  }

  /// Call dispatch, attempted strictly in spec.md §4.7's order; the first
  /// tier that recognises the callee wins.
  fn emit_call(&mut self, id: crate::ast::NodeId, callee: &Expr, args: &[Expr]) {
    let Expr::Ident(name, ..) = callee else { self.emit_indirect_call(callee, args); return };
    let fn_name = crate::types::ty::resolve_name(*name).unwrap_or_default();

    // comptime: handled entirely by the checker/CTFE; here we just fold a
    // constant-foldable call's result if the checker has already recorded
    // one, else fall through to a plain call.
    if self.checker.comptime_functions.contains_key(name) {
      self.emit_args_and_call(&fn_name, args);
      return;
    }
    if crate::builtins::SMART_PTR_METHODS.contains(&fn_name.as_str()) { self.emit_args_and_call(&fn_name, args); return }
    if matches!(fn_name.as_str(), "print" | "println") {
      let is_line = fn_name == "println";
      if let Some(a) = args.first() { self.emit_print_expr(a, is_line); }
      return;
    }
    if self.checker.extern_functions.contains_key(name) {
      self.emit_extern_call(&fn_name, args);
      return;
    }
    if crate::builtins::Builtin::from_str(&fn_name).is_some() {
      // Every builtin is an import from the runtime support library
      // (`tylrt.dll`, registered in `builtin_import_libraries`), called the
      // same way as any other `extern "DLL"` function — not a label defined
      // in this translation unit.
      self.emit_extern_call(&format!("tyl_{fn_name}"), args);
      return;
    }
    if self.checker.generic_functions.contains_key(name) {
      let type_args = self.checker.generic_instantiations_by_call.get(&id).cloned().unwrap_or_default();
      let mangled = self.mangle(&fn_name, &type_args);
      self.emit_args_and_call(&mangled, args);
      return;
    }
    self.emit_args_and_call(&fn_name, args);
  }

  fn emit_indirect_call(&mut self, callee: &Expr, args: &[Expr]) {
    self.emit_expr(callee);
    self.enc.push_reg(Reg::Rax);
    self.emit_call_args(args);
    self.enc.pop_reg(Reg::Rcx);
    self.enc.mov_reg_mem_indirect(Reg::Rcx, Reg::Rcx);
    self.enc.sub_reg_imm32(Reg::Rsp, SHADOW_SPACE);
    self.enc.call_rip("__indirect_dispatch");
    self.enc.add_reg_imm32(Reg::Rsp, SHADOW_SPACE);
  }

  fn emit_method_call(&mut self, receiver: &Expr, method: Symbol, args: &[Expr]) {
    self.emit_expr(receiver);
    self.enc.push_reg(Reg::Rax);
    let name = crate::types::ty::resolve_name(method).unwrap_or_default();
    self.emit_args_and_call(&name, args);
  }

  /// Right-to-left argument push, then pop into ABI registers in order,
  /// matching spec.md §4.7's evaluation order for UFCS/method calls.
  fn emit_call_args(&mut self, args: &[Expr]) {
    for a in args.iter().rev() { self.emit_expr(a); self.enc.push_reg(Reg::Rax); }
    for (i, _) in args.iter().enumerate().take(INT_ARG_REGS.len()) {
      self.enc.pop_reg(INT_ARG_REGS[i]);
    }
  }

  fn emit_args_and_call(&mut self, label: &str, args: &[Expr]) {
    self.emit_call_args(args);
    self.enc.sub_reg_imm32(Reg::Rsp, SHADOW_SPACE);
    self.enc.call_label(label);
    self.enc.add_reg_imm32(Reg::Rsp, SHADOW_SPACE);
  }

  fn emit_extern_call(&mut self, dll_fn: &str, args: &[Expr]) {
    self.emit_call_args(args);
    self.enc.sub_reg_imm32(Reg::Rsp, SHADOW_SPACE);
    self.enc.call_rip(dll_fn);
    self.enc.add_reg_imm32(Reg::Rsp, SHADOW_SPACE);
  }

  /// `emitPrintExpr` (spec.md §4.7): dispatches on what's known at compile
  /// time, falling back to the shared `__tyl_itoa`/`__tyl_ftoa` routines for
  /// runtime numeric values.
  fn emit_print_expr(&mut self, expr: &Expr, newline: bool) {
    match expr {
      Expr::Literal(Literal::Str(s), ..) => {
        let mut text = s.clone();
        if newline { text.push_str("\r\n"); }
        let label = self.intern_string(&text);
        self.enc.lea_rip(Reg::Rcx, &label);
        self.emit_write_console(text.len());
      }
      Expr::InterpolatedString { parts, .. } => {
        for p in parts { self.emit_print_expr(p, false); }
        if newline { self.emit_print_expr(&Expr::Literal(Literal::Str("\r\n".into()), 0, crate::diagnostics::Span::default()), false); }
      }
      // A top-level `+` is only string concatenation if the checker recorded
      // a `String` type for it; otherwise it's arithmetic (spec.md §8
      // scenario 2: `println(1 + 2 * 3)` prints `7`, not two sub-exprs).
      Expr::Binary { op: BinOp::Add, lhs, rhs, id, .. }
        if matches!(self.checker.expr_types.get(id).map(|t| &*t.kind), Some(crate::types::ty::TypeKind::String)) =>
      {
        self.emit_print_expr(lhs, false);
        self.emit_print_expr(rhs, newline);
      }
      _ => {
        self.emit_expr(expr);
        if self.last_expr_was_float {
          self.needs_ftoa = true;
          self.enc.call_label("__tyl_ftoa");
        } else {
          self.needs_itoa = true;
          self.enc.call_label("__tyl_itoa");
        }
        // __tyl_itoa/__tyl_ftoa return the digit-string pointer in rax and
        // its length in rdx, so rdx already holds the write length here.
        self.enc.mov_reg_reg(Reg::Rcx, Reg::Rax);
        self.enc.sub_reg_imm32(Reg::Rsp, SHADOW_SPACE);
        self.enc.call_rip("WriteConsoleA");
        self.enc.add_reg_imm32(Reg::Rsp, SHADOW_SPACE);
        if newline {
          self.emit_print_expr(&Expr::Literal(Literal::Str("\r\n".into()), 0, crate::diagnostics::Span::default()), false);
        }
      }
    }
  }

  /// Emits a block's statements followed by the destructor calls the
  /// checker scheduled for it (spec.md §3.4's reverse-declaration-order
  /// drop), keyed by the block's own span since `Block` carries no `NodeId`.
  fn emit_block(&mut self, block: &Block) {
    for s in &block.stmts { self.emit_stmt(s); }
    self.emit_block_drops(block);
  }

  fn emit_block_drops(&mut self, block: &Block) {
    let Some(drops) = self.checker.drops_by_block.get(&block.span) else { return };
    for d in drops.clone() {
      let Some(fn_sym) = d.drop_fn else { continue };
      let Some(&offset) = self.locals.get(&d.name) else { continue };
      let method = crate::types::ty::resolve_name(fn_sym).unwrap_or_default();
      self.enc.mov_reg_mem_rbp(Reg::Rcx, offset);
      self.enc.sub_reg_imm32(Reg::Rsp, SHADOW_SPACE);
      self.enc.call_label(&format!("{}::{method}", d.type_name));
      self.enc.add_reg_imm32(Reg::Rsp, SHADOW_SPACE);
    }
  }

  fn emit_write_console(&mut self, len: usize) {
    self.enc.mov_reg_imm64(Reg::Rdx, len as u64);
    self.enc.sub_reg_imm32(Reg::Rsp, SHADOW_SPACE);
    self.enc.call_rip("WriteConsoleA");
    self.enc.add_reg_imm32(Reg::Rsp, SHADOW_SPACE);
  }

  /// Integer-to-ASCII, appended once after the user program regardless of
  /// how many call sites needed it (spec.md §4.7). Input: the integer in
  /// `rax`. Output: a pointer to the ASCII digits in `rax`, their length in
  /// `rdx`. Writes into a 32-byte scratch buffer on its own mini stack frame,
  /// filled back-to-front so digits never need to be reversed afterwards.
  fn emit_itoa_routine(&mut self) {
    self.enc.define_label("__tyl_itoa");
    self.enc.sub_reg_imm32(Reg::Rsp, 32);
    self.enc.mov_reg_reg(Reg::R10, Reg::Rsp);
    self.enc.add_reg_imm32(Reg::R10, 32);
    self.enc.xor_reg_reg(Reg::R9, Reg::R9);
    self.enc.cmp_reg_imm32(Reg::Rax, 0);
    self.enc.jcc_label(Cond::Ge, "__tyl_itoa_pos");
    self.enc.mov_reg_imm64(Reg::R9, 1);
    self.enc.neg_reg(Reg::Rax);
    self.enc.define_label("__tyl_itoa_pos");
    self.enc.mov_reg_imm64(Reg::Rcx, 10);
    self.enc.define_label("__tyl_itoa_loop");
    self.enc.cqo();
    self.enc.idiv_reg(Reg::Rcx);
    self.enc.add_reg_imm32(Reg::Rdx, 0x30);
    self.enc.sub_reg_imm32(Reg::R10, 1);
    self.enc.mov_mem_indirect_reg8(Reg::R10, Reg::Rdx);
    self.enc.cmp_reg_imm32(Reg::Rax, 0);
    self.enc.jcc_label(Cond::Ne, "__tyl_itoa_loop");
    self.enc.cmp_reg_imm32(Reg::R9, 0);
    self.enc.jcc_label(Cond::E, "__tyl_itoa_done");
    self.enc.sub_reg_imm32(Reg::R10, 1);
    self.enc.mov_reg_imm64(Reg::R8, u64::from(b'-'));
    self.enc.mov_mem_indirect_reg8(Reg::R10, Reg::R8);
    self.enc.define_label("__tyl_itoa_done");
    self.enc.mov_reg_reg(Reg::Rax, Reg::R10);
    self.enc.mov_reg_reg(Reg::Rdx, Reg::Rsp);
    self.enc.add_reg_imm32(Reg::Rdx, 32);
    self.enc.sub_reg_reg(Reg::Rdx, Reg::R10);
    self.enc.add_reg_imm32(Reg::Rsp, 32);
    self.enc.ret();
  }

  /// `emitFtoa` (spec.md §4.7): split sign/integer/fractional(*1_000_000),
  /// emit digits back-to-front into a scratch buffer, inserting `.` once six
  /// fractional digits have been written and padding a leading `0` when the
  /// magnitude is under 1.0. Input: a pointer to the `f64` in `rax`. Output:
  /// same convention as `__tyl_itoa` (pointer in `rax`, length in `rdx`).
  fn emit_ftoa_routine(&mut self) {
    let scale_label = self.intern_float(1_000_000.0);
    self.enc.define_label("__tyl_ftoa");
    self.enc.sub_reg_imm32(Reg::Rsp, 48);
    self.enc.movsd_xmm_mem(Xmm::Xmm0, Reg::Rax, 0);
    self.enc.lea_rip(Reg::Rcx, &scale_label);
    self.enc.movsd_xmm_mem(Xmm::Xmm1, Reg::Rcx, 0);
    self.enc.mulsd_xmm_xmm(Xmm::Xmm0, Xmm::Xmm1);
    self.enc.cvttsd2si_reg_xmm(Reg::Rax, Xmm::Xmm0);
    self.enc.mov_reg_reg(Reg::R10, Reg::Rsp);
    self.enc.add_reg_imm32(Reg::R10, 48);
    self.enc.xor_reg_reg(Reg::R9, Reg::R9);
    self.enc.cmp_reg_imm32(Reg::Rax, 0);
    self.enc.jcc_label(Cond::Ge, "__tyl_ftoa_pos");
    self.enc.mov_reg_imm64(Reg::R9, 1);
    self.enc.neg_reg(Reg::Rax);
    self.enc.define_label("__tyl_ftoa_pos");
    self.enc.xor_reg_reg(Reg::R8, Reg::R8); // r8 = 1 if magnitude < 1_000_000 (needs leading '0')
    self.enc.cmp_reg_imm32(Reg::Rax, 1_000_000);
    self.enc.jcc_label(Cond::Ge, "__tyl_ftoa_has_int");
    self.enc.mov_reg_imm64(Reg::R8, 1);
    self.enc.define_label("__tyl_ftoa_has_int");
    self.enc.xor_reg_reg(Reg::R11, Reg::R11); // r11 = digits emitted so far
    self.enc.mov_reg_imm64(Reg::Rcx, 10);
    self.enc.define_label("__tyl_ftoa_loop");
    self.enc.cqo();
    self.enc.idiv_reg(Reg::Rcx);
    self.enc.add_reg_imm32(Reg::Rdx, 0x30);
    self.enc.sub_reg_imm32(Reg::R10, 1);
    self.enc.mov_mem_indirect_reg8(Reg::R10, Reg::Rdx);
    self.enc.add_reg_imm32(Reg::R11, 1);
    self.enc.cmp_reg_imm32(Reg::R11, 6);
    self.enc.jcc_label(Cond::Ne, "__tyl_ftoa_continue");
    self.enc.sub_reg_imm32(Reg::R10, 1);
    self.enc.mov_reg_imm64(Reg::Rdx, u64::from(b'.'));
    self.enc.mov_mem_indirect_reg8(Reg::R10, Reg::Rdx);
    self.enc.define_label("__tyl_ftoa_continue");
    self.enc.cmp_reg_imm32(Reg::Rax, 0);
    self.enc.jcc_label(Cond::Ne, "__tyl_ftoa_loop");
    self.enc.cmp_reg_imm32(Reg::R11, 6);
    self.enc.jcc_label(Cond::L, "__tyl_ftoa_loop");
    self.enc.cmp_reg_imm32(Reg::R8, 0);
    self.enc.jcc_label(Cond::E, "__tyl_ftoa_sign");
    self.enc.sub_reg_imm32(Reg::R10, 1);
    self.enc.mov_reg_imm64(Reg::Rdx, u64::from(b'0'));
    self.enc.mov_mem_indirect_reg8(Reg::R10, Reg::Rdx);
    self.enc.define_label("__tyl_ftoa_sign");
    self.enc.cmp_reg_imm32(Reg::R9, 0);
    self.enc.jcc_label(Cond::E, "__tyl_ftoa_done");
    self.enc.sub_reg_imm32(Reg::R10, 1);
    self.enc.mov_reg_imm64(Reg::Rdx, u64::from(b'-'));
    self.enc.mov_mem_indirect_reg8(Reg::R10, Reg::Rdx);
    self.enc.define_label("__tyl_ftoa_done");
    self.enc.mov_reg_reg(Reg::Rax, Reg::R10);
    self.enc.mov_reg_reg(Reg::Rdx, Reg::Rsp);
    self.enc.add_reg_imm32(Reg::Rdx, 48);
    self.enc.sub_reg_reg(Reg::Rdx, Reg::R10);
    self.enc.add_reg_imm32(Reg::Rsp, 48);
    self.enc.ret();
  }

  /// Serialises into a [`ImageBuilder`] for PE/object emission, running the
  /// peephole pass on the materialised code first (spec.md §4.7→§4.9 order:
  /// "all code is produced" before "label resolution").
  pub fn into_image(self, aggressive_peephole: bool) -> crate::error::CompileResult<ImageBuilder> {
    let (mut bytes, rip_fixups) = self.enc.resolve()?;
    crate::backend::peephole::Peephole::new(aggressive_peephole).optimize(&mut bytes);
    let mut img = ImageBuilder::new();
    img.code = bytes;
    img.data = self.data;
    img.data_labels = self.data_labels;
    img.imports = self.imports;
    img.rip_fixups = rip_fixups;
    Ok(img)
  }
}

fn parse_reg(tok: Option<&&str>) -> Option<Reg> {
  Some(match *tok? {
    "rax" => Reg::Rax, "rcx" => Reg::Rcx, "rdx" => Reg::Rdx, "rbx" => Reg::Rbx,
    "rsp" => Reg::Rsp, "rbp" => Reg::Rbp, "rsi" => Reg::Rsi, "rdi" => Reg::Rdi,
    "r8" => Reg::R8, "r9" => Reg::R9, "r10" => Reg::R10, "r11" => Reg::R11,
    "r12" => Reg::R12, "r13" => Reg::R13, "r14" => Reg::R14, "r15" => Reg::R15,
    _ => return None,
  })
}

fn align16(n: i32) -> i32 { (n + 15) & !15 }

fn count_locals(body: &Block) -> usize {
  body.stmts.iter().map(|s| match s {
    Stmt::Let { .. } => 1,
    Stmt::If { then_blk, else_blk, .. } => count_locals(then_blk) + else_blk.as_ref().map_or(0, count_locals),
    Stmt::While { body, .. } | Stmt::Loop { body, .. } | Stmt::For { body, .. } | Stmt::Unsafe(body) => count_locals(body),
    _ => 0,
  }).sum()
}

fn body_has_calls(body: &Block) -> bool {
  body.stmts.iter().any(|s| matches!(s, Stmt::Expr(_)) || matches!(s,
    Stmt::If { .. } | Stmt::While { .. } | Stmt::Loop { .. } | Stmt::For { .. }))
}

/// `tryEvalConstant`: folds a binary op over two integer literals without
/// invoking the full CTFE interpreter, for the common case codegen hits far
/// more often than genuine `comptime` calls.
fn try_eval_constant(lhs: &Expr, rhs: &Expr, op: BinOp) -> Option<i64> {
  let (Expr::Literal(Literal::Int(a, _), ..), Expr::Literal(Literal::Int(b, _), ..)) = (lhs, rhs) else { return None };
  Some(match op {
    BinOp::Add => a.wrapping_add(*b),
    BinOp::Sub => a.wrapping_sub(*b),
    BinOp::Mul => a.wrapping_mul(*b),
    BinOp::Div if *b != 0 => a / b,
    BinOp::Rem if *b != 0 => a % b,
    _ => return None,
  })
}

trait StmtNodeId { fn id_for_vectorizer(&self) -> crate::ast::NodeId; }
impl StmtNodeId for Stmt {
  fn id_for_vectorizer(&self) -> crate::ast::NodeId {
    match self { Stmt::Expr(e) => e.id(), _ => 0 }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::TypeRegistry;

  #[test]
  fn constant_binary_folds_without_emitting_arithmetic() {
    let lhs = Expr::Literal(Literal::Int(2, None), 0, crate::diagnostics::Span::default());
    let rhs = Expr::Literal(Literal::Int(3, None), 0, crate::diagnostics::Span::default());
    assert_eq!(try_eval_constant(&lhs, &rhs, BinOp::Add), Some(5));
    assert_eq!(try_eval_constant(&lhs, &rhs, BinOp::Div), Some(0));
  }

  #[test]
  fn division_by_zero_constant_is_not_folded() {
    let lhs = Expr::Literal(Literal::Int(2, None), 0, crate::diagnostics::Span::default());
    let rhs = Expr::Literal(Literal::Int(0, None), 0, crate::diagnostics::Span::default());
    assert_eq!(try_eval_constant(&lhs, &rhs, BinOp::Div), None);
  }

  #[test]
  fn emitting_a_literal_program_produces_a_resolvable_image() {
    let mut registry = TypeRegistry::new();
    let checker = TypeChecker::new(&mut registry);
    let mut gen = CodeGenerator::new(&checker);
    gen.enc.define_label("main");
    gen.emit_literal(&Literal::Int(42, None));
    gen.enc.ret();
    let img = gen.into_image(false).unwrap();
    assert!(!img.code.is_empty());
  }

  #[test]
  fn frame_size_is_16_byte_aligned() {
    assert_eq!(align16(1), 16);
    assert_eq!(align16(16), 16);
    assert_eq!(align16(17), 32);
  }

  #[test]
  fn itoa_and_ftoa_routines_resolve_with_no_dangling_labels() {
    let mut registry = TypeRegistry::new();
    let checker = TypeChecker::new(&mut registry);
    let mut gen = CodeGenerator::new(&checker);
    gen.enc.define_label("main");
    gen.emit_literal(&Literal::Int(7, None));
    gen.enc.call_label("__tyl_itoa");
    gen.emit_literal(&Literal::Float(2.5, None));
    gen.enc.call_label("__tyl_ftoa");
    gen.enc.ret();
    gen.needs_itoa = true;
    gen.needs_ftoa = true;
    gen.emit_itoa_routine();
    gen.emit_ftoa_routine();
    let img = gen.into_image(false).unwrap();
    assert!(!img.code.is_empty());
  }
}

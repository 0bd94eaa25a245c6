//! AArch64 machine instructions, in the operand-descriptor form the allocator consumes.
//!
//! An instruction is an opcode together with a list of [`Operand`]s. Register operands carry
//! their own def/use role, so the allocator never needs per-opcode knowledge beyond what
//! [`Inst::is_move`], [`Inst::is_call`] and [`Inst::mov_imm_value`] report.

use std::fmt::{Debug, Display};

use smallvec::SmallVec;

use crate::types::vcode::{BlockId, RegClass, VReg};
use super::calling_conv::MachineEnv;
use super::regs::{PReg, PRegSet};

/// A register as it appears in an operand: virtual before allocation, physical after
/// (or before, for ABI-mandated registers).
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub enum Reg {
  /// A virtual register.
  Virt(VReg),
  /// A physical register.
  Phys(PReg),
}

impl Reg {
  /// The register class.
  #[must_use] pub fn class(self) -> RegClass {
    match self {
      Reg::Virt(v) => v.class(),
      Reg::Phys(p) => p.class(),
    }
  }

  /// The virtual register, if this is one.
  #[must_use] pub fn as_virt(self) -> Option<VReg> {
    if let Reg::Virt(v) = self { Some(v) } else { None }
  }

  /// The physical register, if this is one.
  #[must_use] pub fn as_phys(self) -> Option<PReg> {
    if let Reg::Phys(p) = self { Some(p) } else { None }
  }
}

impl From<VReg> for Reg {
  fn from(v: VReg) -> Self { Reg::Virt(v) }
}
impl From<PReg> for Reg {
  fn from(p: PReg) -> Self { Reg::Phys(p) }
}

impl Display for Reg {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Reg::Virt(v) => write!(f, "{v}"),
      Reg::Phys(p) => write!(f, "{p}"),
    }
  }
}
impl Debug for Reg {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { Display::fmt(self, f) }
}

/// How an operand accesses its register.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OperandKind {
  /// The register is read.
  Use,
  /// The register is written.
  Def,
  /// The register is read and then written. (The allocator treats this as a use
  /// followed by a def of the same register.)
  UseDef,
}

impl OperandKind {
  /// Does this operand read the register?
  #[must_use] pub fn is_use(self) -> bool { !matches!(self, OperandKind::Def) }
  /// Does this operand write the register?
  #[must_use] pub fn is_def(self) -> bool { !matches!(self, OperandKind::Use) }
}

/// A register operand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegOperand {
  /// The register.
  pub reg: Reg,
  /// Read, write or both.
  pub kind: OperandKind,
  /// If set, the virtual register must be allocated to exactly this register
  /// (inline assembly operands and ABI-fixed positions).
  pub fixed: Option<PReg>,
}

/// A memory addressing mode `[base, index, #off]`, with optional base write-back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AMode {
  /// The base register.
  pub base: Reg,
  /// An optional index register.
  pub index: Option<Reg>,
  /// The immediate offset.
  pub off: i64,
  /// Pre/post-indexed: the base register is updated by the access.
  pub writeback: bool,
}

impl AMode {
  /// `[base, #off]`
  #[must_use] pub fn reg_off(base: impl Into<Reg>, off: i64) -> Self {
    Self { base: base.into(), index: None, off, writeback: false }
  }
}

impl Display for AMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "[{}", self.base)?;
    if let Some(i) = self.index { write!(f, ", {i}")? }
    if self.off != 0 { write!(f, ", #{}", self.off)? }
    write!(f, "]{}", if self.writeback { "!" } else { "" })
  }
}

/// An instruction operand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
  /// A register.
  Reg(RegOperand),
  /// A memory reference. Base and index are uses; a write-back base is also a def.
  Mem(AMode),
  /// A list of registers all accessed the same way, such as the argument registers of a call.
  List(OperandKind, SmallVec<[Reg; 4]>),
  /// An immediate.
  Imm(i64),
  /// A branch target.
  Label(BlockId),
}

impl Operand {
  /// A register read.
  #[must_use] pub fn use_(r: impl Into<Reg>) -> Self {
    Self::Reg(RegOperand { reg: r.into(), kind: OperandKind::Use, fixed: None })
  }
  /// A register write.
  #[must_use] pub fn def(r: impl Into<Reg>) -> Self {
    Self::Reg(RegOperand { reg: r.into(), kind: OperandKind::Def, fixed: None })
  }
  /// A virtual register that must be placed in `p`.
  #[must_use] pub fn fixed(v: VReg, kind: OperandKind, p: PReg) -> Self {
    Self::Reg(RegOperand { reg: Reg::Virt(v), kind, fixed: Some(p) })
  }
}

/// The opcodes the allocator is given. Semantics matter only for moves, immediate
/// loads and calls; everything else is opaque.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Opcode {
  Mov, Fmov, MovImm,
  Add, Sub, Mul, And, Orr, Eor,
  Fadd, Fsub, Fmul,
  Cmp, Csel,
  Ldr, Str,
  B, Bcond, Cbz, Cbnz, Bl, Blr, Ret,
  InlineAsm, Nop,
}

impl Opcode {
  fn name(self) -> &'static str {
    match self {
      Opcode::Mov | Opcode::MovImm => "mov",
      Opcode::Fmov => "fmov",
      Opcode::Add => "add",
      Opcode::Sub => "sub",
      Opcode::Mul => "mul",
      Opcode::And => "and",
      Opcode::Orr => "orr",
      Opcode::Eor => "eor",
      Opcode::Fadd => "fadd",
      Opcode::Fsub => "fsub",
      Opcode::Fmul => "fmul",
      Opcode::Cmp => "cmp",
      Opcode::Csel => "csel",
      Opcode::Ldr => "ldr",
      Opcode::Str => "str",
      Opcode::B => "b",
      Opcode::Bcond => "b.cond",
      Opcode::Cbz => "cbz",
      Opcode::Cbnz => "cbnz",
      Opcode::Bl => "bl",
      Opcode::Blr => "blr",
      Opcode::Ret => "ret",
      Opcode::InlineAsm => "asm",
      Opcode::Nop => "nop",
    }
  }
}

/// What a call clobbers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallClobbers {
  /// The callee is unknown; all caller-saved registers are clobbered.
  Unknown,
  /// Exactly these registers are clobbered.
  Known(PRegSet),
}

/// A machine instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inst {
  /// The opcode.
  pub op: Opcode,
  /// The operands, destination first by convention.
  pub operands: SmallVec<[Operand; 4]>,
  /// Set on calls.
  pub call: Option<CallClobbers>,
}

impl Inst {
  /// An instruction with the given operands.
  #[must_use] pub fn new(op: Opcode, operands: impl IntoIterator<Item = Operand>) -> Self {
    Self { op, operands: operands.into_iter().collect(), call: None }
  }

  /// `dst := src`
  #[must_use] pub fn mov(dst: impl Into<Reg>, src: impl Into<Reg>) -> Self {
    let dst = dst.into();
    let op = if let RegClass::Float = dst.class() { Opcode::Fmov } else { Opcode::Mov };
    Self::new(op, [Operand::def(dst), Operand::use_(src)])
  }

  /// `dst := imm`
  #[must_use] pub fn mov_imm(dst: impl Into<Reg>, imm: i64) -> Self {
    Self::new(Opcode::MovImm, [Operand::def(dst), Operand::Imm(imm)])
  }

  /// `dst := a op b` for a two-operand ALU opcode.
  #[must_use] pub fn alu(op: Opcode, dst: impl Into<Reg>, a: impl Into<Reg>, b: impl Into<Reg>) -> Self {
    Self::new(op, [Operand::def(dst), Operand::use_(a), Operand::use_(b)])
  }

  /// `dst := src op imm`
  #[must_use] pub fn alu_imm(op: Opcode, dst: impl Into<Reg>, src: impl Into<Reg>, imm: i64) -> Self {
    Self::new(op, [Operand::def(dst), Operand::use_(src), Operand::Imm(imm)])
  }

  /// `ldr dst, addr`
  #[must_use] pub fn load(dst: impl Into<Reg>, addr: AMode) -> Self {
    Self::new(Opcode::Ldr, [Operand::def(dst), Operand::Mem(addr)])
  }

  /// `str src, addr`
  #[must_use] pub fn store(src: impl Into<Reg>, addr: AMode) -> Self {
    Self::new(Opcode::Str, [Operand::use_(src), Operand::Mem(addr)])
  }

  /// `bl`: a direct call reading `args` and writing `rets`.
  #[must_use] pub fn call(args: &[PReg], rets: &[PReg], clobbers: CallClobbers) -> Self {
    Self {
      op: Opcode::Bl,
      operands: [
        Operand::List(OperandKind::Use, args.iter().map(|&r| r.into()).collect()),
        Operand::List(OperandKind::Def, rets.iter().map(|&r| r.into()).collect()),
      ].into_iter().collect(),
      call: Some(clobbers),
    }
  }

  /// `blr target`: an indirect call.
  #[must_use] pub fn call_indirect(target: impl Into<Reg>, args: &[PReg], rets: &[PReg],
    clobbers: CallClobbers
  ) -> Self {
    let mut inst = Self::call(args, rets, clobbers);
    inst.op = Opcode::Blr;
    inst.operands.insert(0, Operand::use_(target));
    inst
  }

  /// `b target`
  #[must_use] pub fn branch(target: BlockId) -> Self { Self::new(Opcode::B, [Operand::Label(target)]) }

  /// `cbnz cond, target`
  #[must_use] pub fn branch_nz(cond: impl Into<Reg>, target: BlockId) -> Self {
    Self::new(Opcode::Cbnz, [Operand::use_(cond), Operand::Label(target)])
  }

  /// `ret`, reading the return registers.
  #[must_use] pub fn ret(rets: &[PReg]) -> Self {
    Self::new(Opcode::Ret, [Operand::List(OperandKind::Use, rets.iter().map(|&r| r.into()).collect())])
  }

  /// Is this a call?
  #[must_use] pub fn is_call(&self) -> bool { self.call.is_some() }

  /// Is this an unconditional branch and nothing else?
  #[must_use] pub fn is_goto(&self) -> bool { self.op == Opcode::B }

  /// Is this a control transfer that must stay at the end of its block?
  #[must_use] pub fn is_terminator(&self) -> bool {
    matches!(self.op, Opcode::B | Opcode::Bcond | Opcode::Cbz | Opcode::Cbnz | Opcode::Ret)
  }

  /// The registers this call clobbers, if it is a call.
  #[must_use] pub fn clobbers(&self, env: &MachineEnv) -> Option<PRegSet> {
    Some(match self.call? {
      CallClobbers::Unknown => env.call_clobbers(),
      CallClobbers::Known(s) => s,
    })
  }

  /// If this is a register-to-register copy, return `(dst, src)`.
  #[must_use] pub fn is_move(&self) -> Option<(Reg, Reg)> {
    if !matches!(self.op, Opcode::Mov | Opcode::Fmov) { return None }
    if let [Operand::Reg(d), Operand::Reg(s)] = &*self.operands {
      if d.kind == OperandKind::Def && s.kind == OperandKind::Use && d.reg.class() == s.reg.class() {
        return Some((d.reg, s.reg))
      }
    }
    None
  }

  /// If this is `dst := imm`, return `(dst, imm)`.
  #[must_use] pub fn mov_imm_value(&self) -> Option<(Reg, i64)> {
    if self.op != Opcode::MovImm { return None }
    if let [Operand::Reg(d), Operand::Imm(i)] = &*self.operands { Some((d.reg, *i)) } else { None }
  }

  /// Call `f` on every register occurrence, with its access kind and fixed-register
  /// constraint. Memory operands and lists are expanded.
  pub fn for_each_reg(&self, mut f: impl FnMut(Reg, OperandKind, Option<PReg>)) {
    for op in &self.operands {
      match op {
        Operand::Reg(r) => f(r.reg, r.kind, r.fixed),
        Operand::Mem(a) => {
          f(a.base, if a.writeback { OperandKind::UseDef } else { OperandKind::Use }, None);
          if let Some(i) = a.index { f(i, OperandKind::Use, None) }
        }
        Operand::List(k, rs) => for &r in rs { f(r, *k, None) },
        Operand::Imm(_) | Operand::Label(_) => {}
      }
    }
  }

  /// Replace every register occurrence by `f(reg, kind)`. Fixed constraints are dropped,
  /// since the result is expected to be physical.
  pub fn map_regs(&mut self, mut f: impl FnMut(Reg, OperandKind) -> Reg) {
    for op in &mut self.operands {
      match op {
        Operand::Reg(r) => { r.reg = f(r.reg, r.kind); r.fixed = None }
        Operand::Mem(a) => {
          a.base = f(a.base, if a.writeback { OperandKind::UseDef } else { OperandKind::Use });
          if let Some(i) = &mut a.index { *i = f(*i, OperandKind::Use) }
        }
        Operand::List(k, rs) => for r in rs { *r = f(*r, *k) },
        Operand::Imm(_) | Operand::Label(_) => {}
      }
    }
  }

  /// The physical registers named by this instruction, in any role.
  #[must_use] pub fn phys_regs(&self) -> PRegSet {
    let mut out = PRegSet::default();
    self.for_each_reg(|r, _, _| if let Reg::Phys(p) = r { out.insert(p) });
    out
  }

  /// The virtual registers named by this instruction, in any role.
  #[must_use] pub fn virt_regs(&self) -> SmallVec<[VReg; 4]> {
    let mut out = SmallVec::new();
    self.for_each_reg(|r, _, _| if let Reg::Virt(v) = r { if !out.contains(&v) { out.push(v) } });
    out
  }
}

impl Display for Operand {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Operand::Reg(r) => match r.fixed {
        Some(p) => write!(f, "{}@{p}", r.reg),
        None => write!(f, "{}", r.reg),
      },
      Operand::Mem(a) => write!(f, "{a}"),
      Operand::List(_, rs) => write!(f, "{{{}}}", itertools::Itertools::join(&mut rs.iter(), ", ")),
      Operand::Imm(i) => write!(f, "#{i}"),
      Operand::Label(bl) => write!(f, "bb{}", bl.index()),
    }
  }
}

impl Display for Inst {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.op.name())?;
    for (i, op) in self.operands.iter().enumerate() {
      write!(f, "{}{op}", if i == 0 { " " } else { ", " })?
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arch::arm64::regs::*;

  fn v(n: usize) -> VReg { VReg::new(n, RegClass::Int) }

  #[test]
  fn visit_expands_mem_and_lists() {
    let mut addr = AMode::reg_off(v(1), 8);
    addr.index = Some(v(2).into());
    addr.writeback = true;
    let inst = Inst::load(v(0), addr);
    let mut seen = vec![];
    inst.for_each_reg(|r, k, _| seen.push((r, k)));
    assert_eq!(seen, [
      (Reg::Virt(v(0)), OperandKind::Def),
      (Reg::Virt(v(1)), OperandKind::UseDef),
      (Reg::Virt(v(2)), OperandKind::Use),
    ]);
    let call = Inst::call(&[X0, X1], &[X0], CallClobbers::Unknown);
    assert_eq!(call.phys_regs().len(), 2);
    assert_eq!(call.clobbers(&MachineEnv::aapcs64()), Some(MachineEnv::aapcs64().caller_saved));
  }

  #[test]
  fn moves_and_display() {
    let m = Inst::mov(v(3), X0);
    assert_eq!(m.is_move(), Some((v(3).into(), X0.into())));
    assert_eq!(Inst::mov_imm(v(1), 5).mov_imm_value(), Some((v(1).into(), 5)));
    assert_eq!(m.to_string(), "mov %3, x0");
    let mut st = Inst::store(v(4), AMode::reg_off(SP, 16));
    st.map_regs(|_, _| X9.into());
    assert_eq!(st.to_string(), "str x9, [x9, #16]");
  }
}

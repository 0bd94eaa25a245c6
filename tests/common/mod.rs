//! Shared helpers for the integration tests: program builders, logging, and a checker
//! that replays the allocated code symbolically.
#![allow(dead_code, unreachable_pub)]

use std::collections::HashMap;

use colorra::arch::arm64::{Inst, MachineEnv, Operand, PReg, Reg, regs::SP};
use colorra::regalloc::{InstOrigin, RaOutput, SlotId};
use colorra::types::Size;
use colorra::{RaOptions, RegClass, VCode, VReg, regalloc_vcode};

/// Route `log` output to the test harness.
pub fn init_logging() {
  let _ = simplelog::TestLogger::init(simplelog::LevelFilter::Trace, simplelog::Config::default());
}

pub fn int(code: &mut VCode) -> VReg { code.fresh_vreg(RegClass::Int, Size::S64) }

pub fn float(code: &mut VCode) -> VReg { code.fresh_vreg(RegClass::Float, Size::S64) }

/// Allocate `code` and check the result.
pub fn alloc_checked(code: &VCode, env: &MachineEnv, opts: &RaOptions) -> RaOutput {
  init_logging();
  let out = regalloc_vcode(code, env, opts).expect("allocation failed");
  assert_sound(code, env, &out);
  out
}

/// A place that can hold a value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum Loc { Reg(PReg), Slot(SlotId) }

/// Which virtual register each location currently holds.
type State = HashMap<Loc, VReg>;

/// A new value of `v` lives only in `loc`.
fn define(st: &mut State, loc: Loc, v: VReg) {
  st.retain(|_, w| *w != v);
  st.insert(loc, v);
}

fn copy(st: &mut State, from: Loc, to: Loc) {
  match st.get(&from).copied() {
    Some(v) => { st.insert(to, v); }
    None => { st.remove(&to); }
  }
}

fn regs(inst: &Inst) -> Vec<(Reg, colorra::OperandKind)> {
  let mut out = vec![];
  inst.for_each_reg(|r, k, _| out.push((r, k)));
  out
}

fn first_reg(inst: &Inst) -> Option<PReg> {
  inst.operands.iter().find_map(|op| match op {
    Operand::Reg(r) => r.reg.as_phys(),
    _ => None,
  })
}

fn step(code: &VCode, env: &MachineEnv, inst: &Inst, origin: InstOrigin, st: &mut State, errs: &mut Vec<String>) {
  let err = |errs: &mut Vec<String>, msg: String| errs.push(format!("{inst}: {msg}"));
  for (r, _) in regs(inst) {
    if let Reg::Virt(v) = r { err(errs, format!("virtual register {v} left")) }
  }
  if let InstOrigin::Orig(_) = origin { return orig_step(code, env, inst, origin, st, errs) }
  let Some(dst) = first_reg(inst) else { return err(errs, "no register operand".into()) };
  match origin {
    InstOrigin::Orig(_) => {}
    InstOrigin::Spill { vreg, slot } => {
      if st.get(&Loc::Reg(dst)) != Some(&vreg) { err(errs, format!("storing {vreg} but {dst} holds {:?}", st.get(&Loc::Reg(dst)))) }
      copy(st, Loc::Reg(dst), Loc::Slot(slot))
    }
    InstOrigin::Reload { vreg, slot } => {
      if st.get(&Loc::Slot(slot)) != Some(&vreg) { err(errs, format!("reloading {vreg} but slot holds {:?}", st.get(&Loc::Slot(slot)))) }
      copy(st, Loc::Slot(slot), Loc::Reg(dst))
    }
    InstOrigin::Remat(v) => { st.insert(Loc::Reg(dst), v); }
    InstOrigin::SaveOccupant(slot) => copy(st, Loc::Reg(dst), Loc::Slot(slot)),
    InstOrigin::RestoreOccupant(slot) => copy(st, Loc::Slot(slot), Loc::Reg(dst)),
    InstOrigin::ScratchAddr => { st.remove(&Loc::Reg(dst)); }
  }
}

fn orig_step(code: &VCode, env: &MachineEnv, inst: &Inst, origin: InstOrigin, st: &mut State, errs: &mut Vec<String>) {
  let InstOrigin::Orig(i) = origin else { return };
  let (old, new) = (regs(&code[i]), regs(inst));
  if old.len() != new.len() { errs.push(format!("{inst}: operands changed")); return }
  let pairs: Vec<_> = old.iter().zip(&new).map(|(&(o, k), &(n, _))| (o, n.as_phys(), k)).collect();
  for &(o, n, k) in &pairs {
    if let (Reg::Virt(v), Some(p), true) = (o, n, k.is_use()) {
      if st.get(&Loc::Reg(p)) != Some(&v) {
        errs.push(format!("{inst} (from {}): {v} expected in {p}, found {:?}", code[i], st.get(&Loc::Reg(p))))
      }
    }
  }
  if let Some(cl) = inst.clobbers(env) {
    for r in cl.iter() { st.remove(&Loc::Reg(r)); }
  }
  for &(o, n, k) in &pairs {
    if !k.is_def() { continue }
    match (o, n) {
      (Reg::Virt(v), Some(p)) => define(st, Loc::Reg(p), v),
      (Reg::Phys(p), _) => { st.remove(&Loc::Reg(p)); }
      _ => {}
    }
  }
}

fn meet(a: &State, b: &State) -> State {
  a.iter().filter(|(k, v)| b.get(k) == Some(v)).map(|(k, v)| (*k, *v)).collect()
}

/// Replay `out.pcode`, tracking which virtual register each register and slot holds, and
/// check that every rewritten use finds its value where the code reads it.
pub fn check(code: &VCode, env: &MachineEnv, out: &RaOutput) -> Result<(), String> {
  let pcode = &out.pcode;
  let n = code.num_blocks();
  let mut outs: Vec<Option<State>> = vec![None; n];
  let entry = |outs: &[Option<State>], bl: colorra::BlockId| -> Option<State> {
    if bl == code.entry_block() { return Some(State::new()) }
    code.block_preds(bl).iter().filter_map(|p| outs[p.index()].as_ref())
      .fold(None, |acc: Option<State>, s| Some(acc.map_or_else(|| s.clone(), |a| meet(&a, s))))
  };
  loop {
    let mut changed = false;
    for bl in code.block_ids() {
      let Some(mut st) = entry(&outs, bl) else { continue };
      let mut ignore = vec![];
      for pi in pcode.block_insts(bl) {
        step(code, env, &pcode.insts[pi], pcode.origins[pi], &mut st, &mut ignore);
      }
      if outs[bl.index()].as_ref() != Some(&st) {
        outs[bl.index()] = Some(st);
        changed = true;
      }
    }
    if !changed { break }
  }
  let mut errs = vec![];
  for bl in code.block_ids() {
    let Some(mut st) = entry(&outs, bl) else { continue };
    for pi in pcode.block_insts(bl) {
      step(code, env, &pcode.insts[pi], pcode.origins[pi], &mut st, &mut errs);
    }
  }
  for i in &pcode.insts.0 {
    for (r, _) in regs(i) {
      if let Reg::Phys(p) = r {
        let allowed = env.regs(p.class()).contains(&p) || p == env.scratch || p == SP;
        if !allowed && !code_uses(code, p) { errs.push(format!("{i}: register {p} is not allocatable")) }
      }
    }
  }
  if errs.is_empty() { Ok(()) } else { Err(errs.join("\n")) }
}

/// No two colored global ranges with the same register are live at the same point.
pub fn assert_no_overlap(out: &RaOutput) {
  let lrs = &out.ranges;
  for (a, la) in lrs.enum_iter() {
    let (false, false, Some(r)) = (la.local, la.spilled, la.assigned) else { continue };
    for (b, lb) in lrs.enum_iter() {
      if b <= a || lb.local || lb.spilled || lb.assigned != Some(r) { continue }
      for (bl, ua) in &la.lu_map {
        if let Some(ub) = lb.unit(*bl) {
          assert!(!ua.overlaps(ub), "{} and {} share {r} in bb{}", la.vreg, lb.vreg, bl.index());
        }
      }
    }
  }
}

/// Local registers never collide with a global register of the same block.
pub fn assert_locals_disjoint(out: &RaOutput) {
  for (bl, info) in out.bb_info.enum_iter() {
    for iv in &info.local_live {
      assert!(!info.globals_assigned.get(iv.reg), "local {} in {} of bb{}", iv.vreg, iv.reg, bl.index());
    }
  }
}

/// A colored range that crosses a call either keeps a register the calls preserve,
/// or is protected by caller-save restores.
pub fn assert_calls_respected(out: &RaOutput, env: &MachineEnv) {
  for lr in &out.ranges.0 {
    let (false, Some(r)) = (lr.spilled, lr.assigned) else { continue };
    if lr.local || !lr.crosses_call() { continue }
    assert!(!lr.clobbered(env.call_clobbers()).get(r) || lr.caller_save,
      "{} keeps {r} across a call that clobbers it", lr.vreg);
  }
}

/// All of the structural properties, plus the checker.
pub fn assert_sound(code: &VCode, env: &MachineEnv, out: &RaOutput) {
  if let Err(e) = check(code, env, out) { panic!("checker failed:\n{e}\n{}", out.pcode) }
  assert_no_overlap(out);
  assert_locals_disjoint(out);
  assert_calls_respected(out, env);
}

/// How many output instructions have an origin matching `f`.
pub fn count_origins(out: &RaOutput, f: impl Fn(InstOrigin) -> bool) -> usize {
  out.pcode.origins.0.iter().filter(|&&o| f(o)).count()
}

/// Does the input itself name `p`?
fn code_uses(code: &VCode, p: PReg) -> bool {
  code.block_ids().flat_map(|bl| code.block_insns(bl)).any(|i| code[i].phys_regs().get(p))
}

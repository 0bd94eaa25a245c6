//! The AArch64 procedure call standard (AAPCS64), as seen by the register allocator.

use crate::types::vcode::RegClass;
use super::regs::*;

/// Register-file description consumed by the allocator.
///
/// The allocatable sets exclude everything the allocator must never hand out:
/// `x16` (spill address scratch), `x18` (platform), `x29`/`x30` (frame and link), and `sp`.
#[derive(Clone, Debug)]
pub struct MachineEnv {
  /// Registers the allocator may assign, per class, in preference order
  /// (caller-saved first).
  pub allocatable: [Vec<PReg>; 2],
  /// Registers not preserved across a call.
  pub caller_saved: PRegSet,
  /// Registers preserved across a call; using one obliges the prologue to save it.
  pub callee_saved: PRegSet,
  /// Registers that are never allocated.
  pub reserved: PRegSet,
  /// Argument registers, per class.
  pub arg_regs: [Vec<PReg>; 2],
  /// Return value registers, per class.
  pub ret_regs: [Vec<PReg>; 2],
  /// The scratch register used to form spill addresses whose offset does not fit
  /// in the immediate field of a load or store.
  pub scratch: PReg,
}

pub(crate) fn class_idx(class: RegClass) -> usize {
  match class {
    RegClass::Float => 1,
    _ => 0,
  }
}

impl MachineEnv {
  /// The standard AAPCS64 register file.
  #[must_use] pub fn aapcs64() -> Self {
    let int_caller = (0..16).chain([17]).map(PReg::new);
    let int_callee = (19..29).map(PReg::new);
    let fp_caller = (0..8).chain(16..32).map(PReg::new_float);
    let fp_callee = (8..16).map(PReg::new_float);
    let caller_saved: PRegSet = int_caller.clone().chain(fp_caller.clone()).chain([X16, PLATFORM]).collect();
    let callee_saved: PRegSet = int_callee.clone().chain(fp_callee.clone()).collect();
    Self {
      allocatable: [int_caller.chain(int_callee).collect(), fp_caller.chain(fp_callee).collect()],
      caller_saved,
      callee_saved,
      reserved: [X16, PLATFORM, FP, LR, SP].into_iter().collect(),
      arg_regs: [(0..8).map(PReg::new).collect(), (0..8).map(PReg::new_float).collect()],
      ret_regs: [(0..8).map(PReg::new).collect(), (0..8).map(PReg::new_float).collect()],
      scratch: IP0,
    }
  }

  /// The AAPCS64 register file with the allocatable registers restricted to `regs`.
  /// Everything else keeps its ABI role. This is used to simulate register pressure.
  #[must_use] pub fn with_allocatable(regs: impl IntoIterator<Item = PReg>) -> Self {
    let mut env = Self::aapcs64();
    let keep: PRegSet = regs.into_iter().collect();
    for v in &mut env.allocatable { v.retain(|&r| keep.get(r)) }
    env
  }

  /// The allocatable registers of a class, in preference order.
  #[must_use] pub fn regs(&self, class: RegClass) -> &[PReg] { &self.allocatable[class_idx(class)] }

  /// The allocatable registers of a class, as a set.
  #[must_use] pub fn reg_set(&self, class: RegClass) -> PRegSet { self.regs(class).iter().copied().collect() }

  /// The number of colors available for a class.
  #[must_use] pub fn num_colors(&self, class: RegClass) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    { self.regs(class).len() as u32 }
  }

  /// The registers clobbered by a call whose callee is unknown.
  #[must_use] pub fn call_clobbers(&self) -> PRegSet { self.caller_saved }

  /// Is this register preserved across calls?
  #[must_use] pub fn is_callee_saved(&self, r: PReg) -> bool { self.callee_saved.get(r) }
}

impl Default for MachineEnv {
  fn default() -> Self { Self::aapcs64() }
}

//! The graph coloring register allocator, generating [`PCode`] from [`VCode`].
//!
//! Allocation of one function runs these passes over a [`GraphColorRegAllocator`]:
//!
//! * [`build`]: one [`LiveRange`] per virtual register, with per-block [`LiveUnit`]s,
//!   physical register vetoes and call crossings, then the interference graph.
//! * [`local`]: a prepass measuring how many registers single-block values need in each block.
//! * [`color`]: priority classification and greedy coloring, which on failure escalates to
//!   [`split`] and then to spilling.
//! * [`local`] again, assigning registers to single-block values from what is left.
//! * [`spill`]: stack slot assignment and the final rewrite, inserting spill, reload and
//!   caller-save restore code placed by [`caller_save`].
//!
//! All state is owned by the allocator value and dropped with it.

pub mod live_range;
pub mod build;
pub mod color;
pub mod split;
pub mod local;
pub mod spill;
pub mod caller_save;
pub mod dump;

use std::borrow::Cow;
use std::fmt::Display;

use hashbrown::HashMap;

use crate::analysis::{liveness::Liveness, loops::LoopInfo};
use crate::arch::arm64::{Inst, MachineEnv, PReg, PRegSet};
use crate::types::{IdxVec, vcode::{BlockId, InstId, RegClass, VCode, VReg}};
pub use live_range::{BbAssignInfo, LiveRange, LiveUnit, LocalInterval, LocalRaInfo, LrClass, LrId, LuFlags,
  Remat, SlotId, SpillSlot};

/// Allocation options.
#[derive(Copy, Clone, Debug)]
#[allow(clippy::struct_excessive_bools)]
pub struct RaOptions {
  /// Log the live ranges, conflicts and block assignments at `debug` level.
  /// This never changes the result.
  pub verbose: bool,
  /// Allocate single-block values separately from the interference graph.
  pub local_ra: bool,
  /// Split constrained live ranges that fail to color.
  pub split: bool,
  /// Let spilled ranges share stack slots when they do not interfere.
  pub consistent_spill_reuse: bool,
  /// Let a range live across a call take a caller-saved register, restoring it after calls.
  pub caller_save_opt: bool,
  /// Place caller-save restores by availability analysis instead of after every call.
  pub caller_save_pre: bool,
}

impl Default for RaOptions {
  fn default() -> Self {
    Self {
      verbose: false,
      local_ra: true,
      split: true,
      consistent_spill_reuse: true,
      caller_save_opt: true,
      caller_save_pre: true,
    }
  }
}

/// A fatal allocation failure. These indicate inputs the code generator should never produce.
#[derive(Debug, thiserror::Error)]
pub enum RaError {
  /// A fixed-register operand cannot get its register.
  #[error("{vreg} must be assigned to {preg}, which is unavailable")]
  MustAssignConflict {
    /// The constrained register.
    vreg: VReg,
    /// The required register.
    preg: PReg,
  },
  /// A virtual register is constrained to two different registers.
  #[error("{vreg} is constrained to both {first} and {second}")]
  ConflictingFixedRegs {
    /// The constrained register.
    vreg: VReg,
    /// The first constraint.
    first: PReg,
    /// The second constraint.
    second: PReg,
  },
  /// An instruction has more spilled operands than there are registers.
  #[error("no register available to hold {vreg} at instruction {inst:?}")]
  NoRegisterForSpill {
    /// The spilled register.
    vreg: VReg,
    /// The instruction.
    inst: InstId,
  },
  /// A virtual register not created by [`VCode::fresh_vreg`].
  #[error("{vreg} is not a register of this function")]
  UnknownVReg {
    /// The offending register.
    vreg: VReg,
  },
}

/// Counters describing the allocation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RaStats {
  /// Live ranges (including split fragments and local ranges) left in memory.
  pub spilled_ranges: u32,
  /// Successful splits.
  pub splits: u32,
  /// Loads inserted, including caller-save restores.
  pub reloads: u32,
  /// Stores inserted.
  pub stores: u32,
  /// Reloads replaced by recomputation.
  pub remats: u32,
  /// Spill temporaries that required evicting another value.
  pub double_spills: u32,
  /// Caller-save restores.
  pub caller_save_restores: u32,
  /// Caller-save restores hoisted into predecessors.
  pub hoisted_restores: u32,
  /// Register moves whose source and destination ended up equal.
  pub identity_moves: u32,
}

mk_id! {
  /// A [`PCode`] instruction ID.
  PInstId
}

/// Why an instruction of the output exists.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InstOrigin {
  /// A rewritten input instruction.
  Orig(InstId),
  /// Stores `vreg` to its slot.
  Spill {
    /// The stored value.
    vreg: VReg,
    /// The slot.
    slot: SlotId,
  },
  /// Loads `vreg` from its slot.
  Reload {
    /// The loaded value.
    vreg: VReg,
    /// The slot.
    slot: SlotId,
  },
  /// Recomputes the constant `vreg`.
  Remat(VReg),
  /// Saves a register evicted to make room for a spill temporary.
  SaveOccupant(SlotId),
  /// Restores an evicted register.
  RestoreOccupant(SlotId),
  /// Forms a spill address in the scratch register.
  ScratchAddr,
}

/// Physical register code: the instruction stream after allocation.
#[derive(Clone, Debug, Default)]
pub struct PCode {
  /// The instructions. All register operands are physical.
  pub insts: IdxVec<PInstId, Inst>,
  /// The reason for each instruction.
  pub origins: IdxVec<PInstId, InstOrigin>,
  /// The instruction range of each block.
  pub blocks: IdxVec<BlockId, (PInstId, PInstId)>,
}

impl PCode {
  /// The instructions of a block.
  pub fn block_insts(&self, bl: BlockId) -> impl DoubleEndedIterator<Item = PInstId> + use<> {
    let (from, to) = self.blocks[bl];
    (from.0..to.0).map(PInstId)
  }

  fn push(&mut self, inst: Inst, origin: InstOrigin) {
    self.insts.push(inst);
    self.origins.push(origin);
  }
}

impl Display for PCode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    for (bl, _) in self.blocks.enum_iter() {
      writeln!(f, "bb{}:", bl.index())?;
      for i in self.block_insts(bl) { writeln!(f, "  {}", self.insts[i])? }
    }
    Ok(())
  }
}

/// The final location summary of a virtual register.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VRegAlloc {
  /// One entry per fragment: its blocks, and its register (`None` if it stayed in memory).
  pub pieces: Vec<(Vec<BlockId>, Option<PReg>)>,
  /// The memory home, if any fragment needed one.
  pub slot: Option<SlotId>,
  /// Allocated by the local allocator.
  pub local: bool,
  /// Coloring bucket of the first fragment.
  pub bucket: LrClass,
}

/// The result of register allocation.
#[derive(Debug)]
pub struct RaOutput {
  /// The rewritten code.
  pub pcode: PCode,
  /// Where each virtual register ended up.
  pub allocs: HashMap<VReg, VRegAlloc>,
  /// The live ranges, for inspection.
  pub ranges: IdxVec<LrId, LiveRange>,
  /// The first live range of each virtual register. Split fragments follow `split_lr`.
  pub vreg_lr: HashMap<VReg, LrId>,
  /// Per-block assignment information.
  pub bb_info: IdxVec<BlockId, BbAssignInfo>,
  /// The spill slots.
  pub slots: IdxVec<SlotId, SpillSlot>,
  /// Callee-saved registers written by the function, which the prologue must save.
  pub callee_saved_used: PRegSet,
  /// Counters.
  pub stats: RaStats,
}

/// The per-function allocator state.
#[derive(Debug)]
pub struct GraphColorRegAllocator<'a> {
  pub(crate) code: &'a VCode,
  pub(crate) env: &'a MachineEnv,
  pub(crate) opts: &'a RaOptions,
  pub(crate) live: Cow<'a, Liveness>,
  pub(crate) loops: Cow<'a, LoopInfo>,
  pub(crate) lrs: IdxVec<LrId, LiveRange>,
  pub(crate) vreg_lr: HashMap<VReg, LrId>,
  pub(crate) bb_info: IdxVec<BlockId, BbAssignInfo>,
  pub(crate) local_info: IdxVec<BlockId, LocalRaInfo>,
  pub(crate) slots: IdxVec<SlotId, SpillSlot>,
  pub(crate) slot_holders: IdxVec<SlotId, Vec<LrId>>,
  pub(crate) next_slot_off: u32,
  pub(crate) stats: RaStats,
}

impl<'a> GraphColorRegAllocator<'a> {
  /// Set up allocation of `code`, computing liveness and loops unless the code
  /// generator supplied them.
  #[must_use] pub fn new(code: &'a VCode, env: &'a MachineEnv, opts: &'a RaOptions) -> Self {
    let live = match &code.liveness {
      Some(l) => Cow::Borrowed(l),
      None => Cow::Owned(Liveness::compute(code)),
    };
    let loops = match &code.loops {
      Some(l) => Cow::Borrowed(l),
      None => Cow::Owned(LoopInfo::compute(code)),
    };
    Self {
      code, env, opts, live, loops,
      lrs: IdxVec::new(),
      vreg_lr: HashMap::new(),
      bb_info: IdxVec::from_default(code.num_blocks()),
      local_info: IdxVec::from_default(code.num_blocks()),
      slots: IdxVec::new(),
      slot_holders: IdxVec::new(),
      next_slot_off: code.spill_base,
      stats: RaStats::default(),
    }
  }

  /// Run all passes.
  pub fn run(mut self) -> Result<RaOutput, RaError> {
    self.build_live_ranges()?;
    self.check_interference();
    if self.opts.local_ra { self.local_ra(false) }
    self.compute_priorities();
    self.classify();
    if self.opts.verbose {
      log::debug!("live ranges before coloring:\n{}", dump::dump_live_ranges(&self.lrs));
      log::debug!("conflicts:\n{}", dump::dump_conflicts(&self.lrs));
    }
    self.color_all()?;
    if self.opts.local_ra { self.local_ra(true) }
    self.assign_spill_slots();
    let plan = self.caller_save_plan();
    let pcode = self.finalize(&plan)?;
    if self.opts.verbose {
      log::debug!("live ranges after allocation:\n{}", dump::dump_live_ranges(&self.lrs));
      log::debug!("block assignments:\n{}", dump::dump_bb_assign_info(&self.bb_info));
    }
    self.stats.spilled_ranges = self.lrs.0.iter().filter(|lr| lr.spilled).count().try_into()
      .unwrap_or(u32::MAX);
    log::debug!("regalloc: {:?}", self.stats);
    Ok(self.into_output(pcode))
  }

  fn into_output(self, pcode: PCode) -> RaOutput {
    let mut callee_saved_used = PRegSet::EMPTY;
    for i in pcode.insts.0.iter() {
      i.for_each_reg(|r, k, _| if let (Some(p), true) = (r.as_phys(), k.is_def()) {
        if self.env.is_callee_saved(p) { callee_saved_used.insert(p) }
      });
    }
    let mut allocs = HashMap::new();
    for lr in &self.lrs.0 {
      if lr.split_parent.is_some() { continue }
      let Some(root) = self.vreg_lr.get(&lr.vreg).copied() else { continue };
      let pieces = self.pieces(root).map(|id| {
        let p = &self.lrs[id];
        (p.bb_member.iter().collect(), if p.spilled { None } else { p.assigned })
      }).collect();
      allocs.insert(lr.vreg, VRegAlloc {
        pieces,
        slot: self.pieces(root).find_map(|id| self.lrs[id].spill_mem),
        local: lr.local,
        bucket: lr.bucket,
      });
    }
    RaOutput {
      pcode,
      allocs,
      ranges: self.lrs,
      vreg_lr: self.vreg_lr,
      bb_info: self.bb_info,
      slots: self.slots,
      callee_saved_used,
      stats: self.stats,
    }
  }

  /// The number of colors of a class.
  pub(crate) fn colors(&self, class: RegClass) -> u32 { self.env.num_colors(class) }

  /// The fragments of a split family, starting from its first range.
  pub(crate) fn pieces(&self, root: LrId) -> impl Iterator<Item = LrId> + '_ {
    std::iter::successors(Some(root), |&id| self.lrs[id].split_lr)
  }

  /// The fragment of `v` that owns block `bl`.
  pub(crate) fn piece_at(&self, v: VReg, bl: BlockId) -> Option<LrId> {
    let root = *self.vreg_lr.get(&v)?;
    self.pieces(root).find(|&id| self.lrs[id].bb_member.contains(bl))
  }

  /// Does the family of `id` keep its value in a dedicated home slot,
  /// stored after every definition?
  pub(crate) fn has_home_slot(&self, id: LrId) -> bool {
    let lr = &self.lrs[id];
    if lr.remat.is_some() { return false }
    let Some(&root) = self.vreg_lr.get(&lr.vreg) else { return false };
    self.pieces(root).any(|p| self.lrs[p].is_split() || self.lrs[p].caller_save)
  }
}

/// Allocate registers for `code`.
pub fn regalloc_vcode(code: &VCode, env: &MachineEnv, opts: &RaOptions) -> Result<RaOutput, RaError> {
  GraphColorRegAllocator::new(code, env, opts).run()
}

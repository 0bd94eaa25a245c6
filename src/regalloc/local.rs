//! Allocation of local ranges: values defined and used within a single block.
//!
//! These never enter the interference graph. A first pass over each block measures how many
//! of them are held at once, which the global coloring keeps free; after coloring, a second
//! pass gives each one a register that no global range of the block uses.

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::arch::arm64::{PReg, PRegSet, Reg, calling_conv::class_idx};
use crate::types::vcode::{BlockId, InstId, VReg};
use super::{GraphColorRegAllocator, LocalInterval, LrId, build::use_pt};

/// The local registers referenced by an instruction, with their `(defs, uses)` counts.
type LocalRefs = SmallVec<[(VReg, (u32, u32)); 4]>;

/// How one instruction moves locals in and out of registers, in the order it happens.
#[derive(Debug, Default)]
struct LocalStep {
  /// Read here without holding a register yet.
  use_starts: SmallVec<[VReg; 2]>,
  /// Read here for the last time.
  use_ends: SmallVec<[VReg; 2]>,
  /// Written here without holding a register yet.
  def_starts: SmallVec<[VReg; 2]>,
  /// Written here, and never referenced again.
  def_ends: SmallVec<[VReg; 2]>,
}

/// The registers of the locals open at some point of a block.
#[derive(Debug, Default)]
struct LocalHeld {
  in_use: PRegSet,
  /// Open locals, with their index in `local_live`.
  open: SmallVec<[(VReg, usize); 8]>,
}

impl GraphColorRegAllocator<'_> {
  fn local_lr(&self, v: VReg) -> Option<LrId> {
    self.vreg_lr.get(&v).copied().filter(|&id| self.lrs[id].local)
  }

  fn local_refs(&self, i: InstId) -> LocalRefs {
    let mut out = LocalRefs::new();
    self.code[i].for_each_reg(|r, k, _| {
      let Reg::Virt(v) = r else { return };
      if self.local_lr(v).is_none() { return }
      let pos = out.iter().position(|e| e.0 == v);
      let n = pos.unwrap_or_else(|| {
        out.push((v, (0, 0)));
        out.len() - 1
      });
      let e = &mut out[n].1;
      if k.is_def() { e.0 += 1 }
      if k.is_use() { e.1 += 1 }
    });
    out
  }

  /// Run the local allocator. With `do_allocate` false this only records each block's
  /// demand in [`BbAssignInfo::local_regs_needed`](super::BbAssignInfo).
  pub(crate) fn local_ra(&mut self, do_allocate: bool) {
    for bl in self.code.block_ids() {
      if self.local_info[bl].refs.is_empty() { continue }
      if do_allocate { self.local_ra_block(bl) } else { self.local_ra_prepass(bl) }
    }
  }

  /// Count down the references of instruction `i` in `remaining`, and sort its locals by
  /// when they take and give up their registers. `held` says which locals already have one.
  fn local_step(&self, i: InstId, remaining: &mut HashMap<VReg, (u32, u32)>,
    held: impl Fn(VReg) -> bool,
  ) -> LocalStep {
    let mut step = LocalStep::default();
    for (v, (d, u)) in self.local_refs(i) {
      let Some(e) = remaining.get_mut(&v) else { continue };
      e.0 -= d;
      e.1 -= u;
      let last = *e == (0, 0);
      if !held(v) {
        if u != 0 { step.use_starts.push(v) } else { step.def_starts.push(v) }
      }
      if last {
        if d == 0 { step.use_ends.push(v) } else { step.def_ends.push(v) }
      }
    }
    step
  }

  /// A local holds a register from its first reference to its last. A local last read by
  /// an instruction gives its register up before the instruction's results are placed.
  fn local_ra_prepass(&mut self, bl: BlockId) {
    let mut remaining = self.local_info[bl].refs.clone();
    let mut held = SmallVec::<[VReg; 8]>::new();
    let (mut live, mut max) = ([0_u32; 2], [0_u32; 2]);
    let bump = |live: [u32; 2], max: &mut [u32; 2]| {
      for (m, l) in max.iter_mut().zip(live) { *m = (*m).max(l) }
    };
    for i in self.code.block_insns(bl) {
      let step = self.local_step(i, &mut remaining, |v| held.contains(&v));
      for &v in &step.use_starts { held.push(v); live[class_idx(v.class())] += 1 }
      bump(live, &mut max);
      for &v in &step.use_ends { held.retain(|w| *w != v); live[class_idx(v.class())] -= 1 }
      for &v in &step.def_starts { held.push(v); live[class_idx(v.class())] += 1 }
      bump(live, &mut max);
      for &v in &step.def_ends { held.retain(|w| *w != v); live[class_idx(v.class())] -= 1 }
    }
    log::trace!("bb{}: local demand {max:?}", bl.index());
    self.bb_info[bl].local_regs_needed = max;
  }

  /// Pick a register for the local `id` out of `in_use`, or `None` if all are taken.
  fn local_pick(&self, bl: BlockId, id: LrId, in_use: PRegSet) -> Option<PReg> {
    let lr = &self.lrs[id];
    let taken = self.bb_info[bl].globals_assigned
      .union(lr.pregveto)
      .union(lr.clobbered(self.env.call_clobbers()))
      .union(in_use);
    let order = self.env.regs(lr.class);
    let ok = |r: &PReg| !taken.get(*r);
    order.iter().filter(|r| lr.prefs.get(**r)).find(|r| ok(r))
      .or_else(|| order.iter().filter(|r| !self.env.is_callee_saved(**r)).find(|r| ok(r)))
      .or_else(|| order.iter().filter(|r| self.env.is_callee_saved(**r)).find(|r| ok(r)))
      .copied()
  }

  /// Give `v` a register from point `begin` on, or spill it if none is left.
  fn local_open(&mut self, bl: BlockId, v: VReg, begin: u32, held: &mut LocalHeld) {
    let Some(id) = self.local_lr(v) else { return };
    if self.lrs[id].spilled { return }
    let Some(r) = self.local_pick(bl, id, held.in_use) else {
      log::debug!("bb{}: no register for local {v}", bl.index());
      self.spill_lr(id);
      return
    };
    held.in_use.insert(r);
    self.lrs[id].assigned = Some(r);
    let info = &mut self.bb_info[bl];
    info.reg_map.insert(v, r);
    held.open.push((v, info.local_live.len()));
    info.local_live.push(LocalInterval { vreg: v, reg: r, begin, end: begin });
  }

  /// Release the register of `v` after point `end`.
  fn local_close(&mut self, bl: BlockId, v: VReg, end: u32, held: &mut LocalHeld) {
    let Some(n) = held.open.iter().position(|e| e.0 == v) else { return };
    let (_, idx) = held.open.swap_remove(n);
    let iv = &mut self.bb_info[bl].local_live[idx];
    iv.end = end;
    held.in_use.remove(iv.reg);
  }

  fn local_ra_block(&mut self, bl: BlockId) {
    let mut remaining = self.local_info[bl].refs.clone();
    let mut held = LocalHeld::default();
    for i in self.code.block_insns(bl) {
      let step = self.local_step(i, &mut remaining, |v| held.open.iter().any(|e| e.0 == v));
      let (upt, dpt) = (use_pt(i.index()), use_pt(i.index()) + 1);
      for &v in &step.use_starts { self.local_open(bl, v, upt, &mut held) }
      for &v in &step.use_ends { self.local_close(bl, v, upt, &mut held) }
      for &v in &step.def_starts { self.local_open(bl, v, dpt, &mut held) }
      for &v in &step.def_ends { self.local_close(bl, v, dpt, &mut held) }
    }
    let (_, last) = self.code.block_range(bl);
    for (_, idx) in held.open {
      self.bb_info[bl].local_live[idx].end = use_pt(last.index());
    }
    self.mark_local_vetoes(bl);
  }

  /// Record the local registers of `bl` on the units of spilled global ranges, whose
  /// temporaries must avoid them.
  fn mark_local_vetoes(&mut self, bl: BlockId) {
    let regs: PRegSet = self.bb_info[bl].local_live.iter().map(|iv| iv.reg).collect();
    if regs.is_empty() { return }
    for lr in &mut self.lrs.0 {
      if lr.local || !lr.spilled { continue }
      if let Some(lu) = lr.lu_map.get_mut(&bl) { lu.local_veto = lu.local_veto.union(regs) }
    }
  }
}

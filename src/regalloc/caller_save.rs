//! Placement of caller-save restores.
//!
//! A range colored with a caller-saved register loses its value at every call it crosses.
//! Its definitions always store to the home slot, so the register can be restored from
//! there. Restores are placed by a forward availability analysis over the blocks of the
//! range: a use needs a restore only if the value is not available in the register on
//! every path reaching it. When it is available on some paths but not others, the restore
//! is moved to the ends of the predecessors that lack it, where that is safe.

use hashbrown::HashMap;
use if_chain::if_chain;

use crate::arch::arm64::{PReg, Reg};
use crate::types::vcode::{BlockId, InstId, VReg};
use super::{GraphColorRegAllocator, LrId, LuFlags};

/// Where to restore caller-save ranges.
#[derive(Clone, Debug, Default)]
pub struct CallerSavePlan {
  /// Restores placed immediately before an instruction.
  pub before: HashMap<InstId, Vec<LrId>>,
  /// Restores placed at the end of a block, ahead of its terminator.
  pub at_end: HashMap<BlockId, Vec<LrId>>,
  /// Restores placed immediately after a call.
  pub after: HashMap<InstId, Vec<LrId>>,
}

/// Availability of a value in its register: on `any` incoming path, and on `all` of them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Avail { any: bool, all: bool }

impl Avail {
  const FULL: Self = Self { any: true, all: true };
  const NOT: Self = Self { any: false, all: false };
  /// The optimistic initial value of a block exit.
  const TOP: Self = Self { any: false, all: true };

  fn meet(self, other: Self) -> Self {
    Self { any: self.any || other.any, all: self.all && other.all }
  }

  fn is_partial(self) -> bool { self.any && !self.all }
}

/// Does `inst` use or define `v`?
fn refs(inst: &crate::arch::arm64::Inst, v: VReg) -> (bool, bool) {
  let (mut used, mut defined) = (false, false);
  inst.for_each_reg(|r, k, _| if r == Reg::Virt(v) {
    used |= k.is_use();
    defined |= k.is_def();
  });
  (used, defined)
}

impl GraphColorRegAllocator<'_> {
  /// The calls crossed by `id` in `bl` that clobber `r`.
  fn clobbering_calls(&self, id: LrId, bl: BlockId, r: PReg) -> impl Iterator<Item = InstId> + '_ {
    self.lrs[id].unit(bl).into_iter().flat_map(|lu| lu.calls.iter().copied())
      .filter(move |&c| self.code[c].clobbers(self.env).is_some_and(|s| s.get(r)))
  }

  /// Availability at the start of `bl`, given the exit states of the blocks of the range.
  fn avail_in(&self, id: LrId, r: PReg, bl: BlockId, out: &HashMap<BlockId, Avail>) -> Avail {
    let lr = &self.lrs[id];
    if bl == self.code.entry_block() ||
      lr.unit(bl).is_some_and(|lu| lu.flags.contains(LuFlags::NEED_RELOAD)) {
      return Avail::FULL
    }
    let mut state = None;
    for &p in self.code.block_preds(bl) {
      let Some(&po) = out.get(&p) else { continue };
      // the value cannot survive a trip around a loop containing a clobbering call
      let po = if_chain! {
        if self.loops.is_back_edge(p, bl);
        if let Some(l) = self.loops.innermost(bl);
        if self.loops.loops[l].members.iter().any(|b| self.clobbering_calls(id, b, r).next().is_some());
        then { Avail::NOT } else { po }
      };
      state = Some(state.map_or(po, |s: Avail| s.meet(po)));
    }
    state.unwrap_or(Avail::FULL)
  }

  /// Run `bl` forward from `state`. `on_need` is called at each use that needs a restore.
  fn avail_block(&self, id: LrId, r: PReg, bl: BlockId, mut state: Avail,
    mut on_need: impl FnMut(InstId, Avail),
  ) -> Avail {
    let v = self.lrs[id].vreg;
    let kills: Vec<_> = self.clobbering_calls(id, bl, r).collect();
    for i in self.code.block_insns(bl) {
      let (used, defined) = refs(&self.code[i], v);
      if used && !state.all {
        on_need(i, state);
        state = Avail::FULL;
      }
      if kills.contains(&i) { state = Avail::NOT }
      if defined { state = Avail::FULL }
    }
    state
  }

  /// May a restore be placed at the end of `p` instead of in its successor?
  fn can_hoist_to(&self, p: BlockId) -> bool {
    if self.code.block_succs(p).len() != 1 || self.loops.is_back_edge_src(p) { return false }
    let mut insns = self.code.block_insns(p);
    let solo_goto = matches!((insns.next(), insns.next()), (Some(i), None) if self.code[i].is_goto());
    !(solo_goto && self.loops.depth(p) > 0)
  }

  fn plan_range(&mut self, id: LrId, r: PReg, plan: &mut CallerSavePlan) {
    let order: Vec<BlockId> = self.loops.sorted_bbs().iter().copied()
      .filter(|&bl| self.lrs[id].bb_member.contains(bl)).collect();
    let mut out: HashMap<BlockId, Avail> = order.iter().map(|&bl| (bl, Avail::TOP)).collect();
    loop {
      let mut changed = false;
      for &bl in &order {
        let inn = self.avail_in(id, r, bl, &out);
        let o = self.avail_block(id, r, bl, inn, |_, _| {});
        if out.insert(bl, o) != Some(o) { changed = true }
      }
      if !changed { break }
    }

    let mut restore_blocks = vec![];
    for &bl in &order {
      let inn = self.avail_in(id, r, bl, &out);
      let mut first = true;
      let mut needs = vec![];
      self.avail_block(id, r, bl, inn, |i, state| {
        needs.push((i, first && state == inn && inn.is_partial()));
        first = false;
      });
      for (i, hoistable) in needs {
        let preds: Vec<BlockId> = self.code.block_preds(bl).iter().copied()
          .filter(|p| out.get(p).is_some_and(|s| !s.all)).collect();
        if hoistable && !preds.is_empty() && preds.iter().all(|&p| self.can_hoist_to(p)) {
          for p in preds {
            plan.at_end.entry(p).or_default().push(id);
            restore_blocks.push(p);
          }
        } else {
          plan.before.entry(i).or_default().push(id);
          restore_blocks.push(bl);
        }
      }
    }
    for bl in restore_blocks {
      if let Some(lu) = self.lrs[id].lu_map.get_mut(&bl) { lu.flags.insert(LuFlags::NEED_RESTORE) }
    }
  }

  /// Decide where the restores of every caller-save range go.
  pub(crate) fn caller_save_plan(&mut self) -> CallerSavePlan {
    let mut plan = CallerSavePlan::default();
    for id in self.lrs.ids() {
      let lr = &self.lrs[id];
      if !lr.caller_save || lr.spilled || !lr.crosses_call() { continue }
      let Some(r) = lr.assigned else { continue };
      // an undefined value has nothing to restore
      let Some(&root) = self.vreg_lr.get(&lr.vreg) else { continue };
      if self.pieces(root).all(|p| self.lrs[p].num_defs == 0) { continue }
      if self.opts.caller_save_pre {
        self.plan_range(id, r, &mut plan);
      } else {
        let calls: Vec<_> = self.lrs[id].bb_member.iter()
          .flat_map(|bl| self.clobbering_calls(id, bl, r).map(move |c| (bl, c))).collect();
        for (bl, c) in calls {
          plan.after.entry(c).or_default().push(id);
          if let Some(lu) = self.lrs[id].lu_map.get_mut(&bl) { lu.flags.insert(LuFlags::NEED_RESTORE) }
        }
      }
    }
    plan
  }
}

#[cfg(test)]
mod tests {
  use crate::arch::arm64::{calling_conv::MachineEnv, inst::*, regs::*};
  use crate::regalloc::{GraphColorRegAllocator, LuFlags, RaOptions};
  use crate::types::{Size, vcode::{BlockId, InstId, RegClass, VCode, VReg}};

  /// `a` is defined in bb0, a call in bb1 clobbers it, and bb3 merges bb1 and bb2.
  fn diamond() -> (VCode, VReg) {
    let mut code = VCode::default();
    let a = code.fresh_vreg(RegClass::Int, Size::S64);
    let b = BlockId::new;
    code.new_block();
    code.emit(Inst::load(a, AMode::reg_off(SP, 0)));    // 0
    code.emit(Inst::branch_nz(a, b(2)));                // 1
    code.finish_block();
    code.new_block();
    code.emit(Inst::call(&[], &[], CallClobbers::Unknown)); // 2
    code.emit(Inst::branch(b(3)));                      // 3
    code.finish_block();
    code.new_block();
    code.emit(Inst::branch(b(3)));                      // 4
    code.finish_block();
    code.new_block();
    code.emit(Inst::store(a, AMode::reg_off(SP, 8)));   // 5
    code.emit(Inst::ret(&[]));                          // 6
    code.finish_block();
    for (x, y) in [(0, 1), (0, 2), (1, 3), (2, 3)] { code.add_edge(b(x), b(y)) }
    (code, a)
  }

  fn plan_for(code: &VCode, opts: &RaOptions) -> (super::CallerSavePlan, bool) {
    let env = MachineEnv::with_allocatable([X0, X1]);
    let mut ra = GraphColorRegAllocator::new(code, &env, opts);
    ra.build_live_ranges().expect("build");
    let id = ra.vreg_lr[&code.vreg(0)];
    assert!(ra.assign_color_to_lr(id));
    assert!(ra.lrs[id].caller_save);
    let plan = ra.caller_save_plan();
    let flagged = ra.lrs[id].unit(BlockId::new(1)).is_some_and(|u| u.flags.contains(LuFlags::NEED_RESTORE));
    (plan, flagged)
  }

  #[test]
  fn partial_availability_is_hoisted() {
    let (code, _) = diamond();
    let (plan, flagged) = plan_for(&code, &RaOptions::default());
    // available through bb2 but not bb1: restore at the end of bb1 only
    assert_eq!(plan.at_end.get(&BlockId::new(1)).map(Vec::len), Some(1));
    assert!(plan.before.is_empty() && plan.after.is_empty());
    assert!(flagged);
  }

  #[test]
  fn naive_restores_after_calls() {
    let (code, _) = diamond();
    let opts = RaOptions { caller_save_pre: false, ..RaOptions::default() };
    let (plan, _) = plan_for(&code, &opts);
    assert_eq!(plan.after.get(&InstId::new(2)).map(Vec::len), Some(1));
    assert!(plan.before.is_empty() && plan.at_end.is_empty());
  }
}

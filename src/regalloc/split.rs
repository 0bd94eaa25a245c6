//! Live range splitting.
//!
//! When a range cannot be colored as a whole, the longest prefix of its blocks (in
//! `sorted_bbs` order) that still has a free color is carved out into a new range. Both
//! sides are then pruned to the blocks that actually need the value in a register: blocks
//! with a reference, blocks lying on a path between two references, and whole loops around
//! a reference. A block dropped from both sides keeps the value only in its home slot.

use crate::arch::arm64::PRegSet;
use crate::types::{BitSet, vcode::BlockId};
use super::{GraphColorRegAllocator, LiveRange, LrId, LuFlags};

impl GraphColorRegAllocator<'_> {
  /// Splitting is only attempted once per range, on ranges spanning several blocks that all
  /// share the same innermost loop.
  pub(crate) fn split_lr_should_split(&self, id: LrId) -> bool {
    let lr = &self.lrs[id];
    if lr.is_split() || lr.must_assign.is_some() || lr.bb_member.len() <= 1 { return false }
    let mut loops = lr.bb_member.iter().map(|bl| self.loops.innermost(bl));
    let Some(first) = loops.next() else { return false };
    loops.all(|l| l == first)
  }

  /// Can `lr` still be colored once `bl` is added to the candidate? `conflict_regs`
  /// accumulates the colors of the neighbors present in the blocks added so far.
  fn lr_can_be_colored(&self, lr: &LiveRange, bl: BlockId, conflict_regs: &mut PRegSet) -> bool {
    let regs = self.env.reg_set(lr.class);
    let mut new_conflict = PRegSet::EMPTY;
    for n in lr.conflict.iter() {
      // a neighbor that has itself been split is represented in `bl` by one of its fragments
      let color = self.pieces(n).find(|&p| self.lrs[p].bb_member.contains(bl))
        .and_then(|p| self.lrs[p].assigned);
      if let Some(c) = color {
        if !conflict_regs.get(c) && !lr.pregveto.get(c) { new_conflict.insert(c) }
      }
    }
    let num = new_conflict.len() + lr.pregveto.inter(regs).len() + conflict_regs.len();
    if num < self.colors(lr.class) {
      *conflict_regs = conflict_regs.union(new_conflict);
      true
    } else {
      false
    }
  }

  /// The blocks of `lr`, in `sorted_bbs` order, up to the first one that would make it
  /// uncolorable.
  fn split_lr_find_candidate_lr(&self, lr: &LiveRange) -> BitSet<BlockId> {
    let mut conflict_regs = PRegSet::EMPTY;
    let mut out = BitSet::default();
    for &bl in self.loops.sorted_bbs() {
      if !lr.bb_member.contains(bl) { continue }
      if !self.lr_can_be_colored(lr, bl, &mut conflict_regs) { break }
      out.insert(bl);
    }
    out
  }

  /// Mark every block of `within` from which a block of `refs` is reachable backward,
  /// i.e. which reaches a reference through blocks of `within`.
  fn find_use_for_split(&self, within: &BitSet<BlockId>, refs: &BitSet<BlockId>) -> BitSet<BlockId> {
    let mut seen = refs.clone();
    let mut stack: Vec<BlockId> = refs.iter().collect();
    while let Some(bl) = stack.pop() {
      for &p in self.code.block_preds(bl) {
        if within.contains(p) && seen.insert(p) { stack.push(p) }
      }
    }
    seen
  }

  /// Mark every block of `within` reachable forward from a block of `refs`.
  fn prune_lr_for_split(&self, within: &BitSet<BlockId>, refs: &BitSet<BlockId>) -> BitSet<BlockId> {
    let mut seen = refs.clone();
    let mut stack: Vec<BlockId> = refs.iter().collect();
    while let Some(bl) = stack.pop() {
      for &s in self.code.block_succs(bl) {
        if within.contains(s) && seen.insert(s) { stack.push(s) }
      }
    }
    seen
  }

  /// The blocks of `within` that a range made of them needs to keep.
  fn keep_for_split(&self, lr: &LiveRange, within: &BitSet<BlockId>) -> BitSet<BlockId> {
    let refs: BitSet<BlockId> = within.iter()
      .filter(|&bl| lr.unit(bl).is_some_and(|lu| lu.has_ref())).collect();
    let mut keep = self.prune_lr_for_split(within, &refs);
    keep.intersect_with(&self.find_use_for_split(within, &refs));
    for bl in refs.iter() {
      for l in self.loops.enclosing(bl) {
        let mut members = self.loops.loops[l].members.clone();
        members.intersect_with(within);
        keep.union_with(&members);
      }
    }
    keep
  }

  fn compute_bb_for_new_split(&self, lr: &LiveRange, candidate: &BitSet<BlockId>) -> BitSet<BlockId> {
    self.keep_for_split(lr, candidate)
  }

  fn compute_bb_for_old_split(&self, lr: &LiveRange, new_members: &BitSet<BlockId>) -> BitSet<BlockId> {
    let mut rest = lr.bb_member.clone();
    rest.difference_with(new_members);
    self.keep_for_split(lr, &rest)
  }

  /// Rebuild the conflicts and summaries of the two sides of a split.
  fn split_lr_update_interference(&mut self, orig: LrId, new: LrId) {
    let old: Vec<_> = self.lrs[orig].conflict.iter().collect();
    for n in old { self.lrs[n].conflict.remove(orig); }
    self.lrs[orig].conflict.clear();
    for id in [orig, new] {
      self.lrs[id].summarize_units();
      let mut conflicts = vec![];
      for (n, other) in self.lrs.enum_iter() {
        if n == id || other.local || !other.bb_member.intersects(&self.lrs[id].bb_member) { continue }
        if self.lrs[id].bb_member.iter().any(|bl| self.interferes_in(id, n, bl)) { conflicts.push(n) }
      }
      let mut forbidden = PRegSet::EMPTY;
      for n in conflicts {
        self.lrs[id].conflict.insert(n);
        self.lrs[n].conflict.insert(id);
        if let Some(r) = self.lrs[n].assigned { forbidden.insert(r) }
      }
      self.lrs[id].forbidden = forbidden;
    }
  }

  /// Mark the member blocks the value enters from outside the range.
  fn mark_reloads(&mut self, id: LrId) {
    let lr = &mut self.lrs[id];
    let v = lr.vreg.index();
    for (&bl, lu) in &mut lr.lu_map {
      lu.flags.remove(LuFlags::NEED_RELOAD);
      if self.live.live_in(bl).contains(v) &&
        self.code.block_preds(bl).iter().any(|&p| !lr.bb_member.contains(p)) {
        lu.flags.insert(LuFlags::NEED_RELOAD)
      }
    }
  }

  /// Split `id`, returning the new range. `None` means no useful split exists.
  pub(crate) fn split_lr(&mut self, id: LrId) -> Option<LrId> {
    let lr = &self.lrs[id];
    let candidate = self.split_lr_find_candidate_lr(lr);
    if candidate.is_empty() { return None }
    let new_members = self.compute_bb_for_new_split(lr, &candidate);
    if new_members.len() == lr.bb_member.len() || !new_members.iter().any(|bl| lr.unit(bl).is_some_and(|lu| lu.has_ref())) {
      return None
    }
    let old_members = self.compute_bb_for_old_split(lr, &new_members);

    let orig = &mut self.lrs[id];
    let mut new_lr = LiveRange::new(orig.vreg, orig.size);
    new_lr.remat = orig.remat;
    new_lr.prefs = orig.prefs;
    new_lr.copy_partners = orig.copy_partners.clone();
    new_lr.bucket = orig.bucket;
    new_lr.split_parent = Some(id);
    for bl in new_members.iter() {
      if let Some(lu) = orig.lu_map.get(&bl) { new_lr.lu_map.insert(bl, lu.clone()); }
    }
    new_lr.bb_member = new_members;
    orig.lu_map.retain(|bl, _| old_members.contains(*bl));
    orig.bb_member = old_members;
    let new = self.lrs.push(new_lr);
    self.lrs[id].split_lr = Some(new);
    log::debug!("split {} ({id:?}): {:?} | {:?}", self.lrs[id].vreg,
      self.lrs[new].bb_member, self.lrs[id].bb_member);

    self.split_lr_update_interference(id, new);
    self.mark_reloads(id);
    self.mark_reloads(new);
    for p in [id, new] {
      let prio = self.compute_priority(&self.lrs[p]);
      self.lrs[p].priority = prio;
    }
    Some(new)
  }
}

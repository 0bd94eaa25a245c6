//! Priority classification and global coloring.

use crate::arch::arm64::{PReg, calling_conv::class_idx};
use crate::types::vcode::VReg;
use super::{GraphColorRegAllocator, LiveRange, LrClass, LrId, RaError};

/// Loop depths beyond this do not increase the weight of a reference any further.
const MAX_LOOP_WEIGHT_DEPTH: u32 = 6;
/// Fixed-point scale applied before dividing by the number of blocks.
const PRIORITY_SCALE: u64 = 1024;

impl GraphColorRegAllocator<'_> {
  /// The spill cost of `lr` per block spanned. References are weighted by `8^depth`,
  /// and doubled again in loop blocks where the range crosses a call.
  #[allow(clippy::integer_division)]
  pub(crate) fn compute_priority(&self, lr: &LiveRange) -> u64 {
    let mut cost = 0_u64;
    for (&bl, lu) in &lr.lu_map {
      let depth = self.loops.depth(bl).min(MAX_LOOP_WEIGHT_DEPTH);
      let mut w = u64::from(lu.def_num + lu.use_num) << (3 * depth);
      if depth > 0 && !lu.calls.is_empty() { w *= 2 }
      cost += w;
    }
    let blocks = u64::try_from(lr.lu_map.len().max(1)).unwrap_or(u64::MAX);
    let p = cost * PRIORITY_SCALE / blocks;
    if lr.remat.is_some() { p / 2 } else { p }
  }

  pub(crate) fn compute_priorities(&mut self) {
    for id in self.lrs.ids() {
      let p = self.compute_priority(&self.lrs[id]);
      self.lrs[id].priority = p;
    }
  }

  /// Sort the global ranges into coloring buckets.
  pub(crate) fn classify(&mut self) {
    for lr in &mut self.lrs.0 {
      if lr.local { lr.bucket = LrClass::Local; continue }
      let regs = self.env.reg_set(lr.class);
      let pressure = u32::try_from(lr.conflict.len()).unwrap_or(u32::MAX)
        .saturating_add(lr.pregveto.inter(regs).len());
      lr.bucket = if lr.must_assign.is_some() {
        LrClass::MustAssigned
      } else if pressure >= self.env.num_colors(lr.class) {
        LrClass::Constrained
      } else if !lr.prefs.is_empty() || !lr.copy_partners.is_empty() {
        LrClass::UnconstrainedPref
      } else {
        LrClass::Unconstrained
      };
    }
  }

  /// Would giving `r` to `lr` leave every member block enough registers for its
  /// local ranges?
  fn keeps_local_headroom(&self, lr: &LiveRange, r: PReg) -> bool {
    let regs = self.env.reg_set(lr.class);
    let colors = self.colors(lr.class);
    lr.bb_member.iter().all(|bl| {
      let info = &self.bb_info[bl];
      info.globals_assigned.get(r) ||
        info.globals_assigned.inter(regs).len() + info.local_regs_needed[class_idx(lr.class)] < colors
    })
  }

  /// The colors of the fragments of `v` that have one.
  fn partner_colors(&self, v: VReg) -> impl Iterator<Item = PReg> + '_ {
    self.vreg_lr.get(&v).into_iter()
      .flat_map(|&root| self.pieces(root))
      .filter_map(|id| self.lrs[id].assigned)
  }

  /// Try to color `lr`. Preferences come first, then callee-saved registers if the range
  /// crosses a call and caller-saved ones otherwise.
  pub(crate) fn assign_color_to_lr(&mut self, id: LrId) -> bool {
    let lr = &self.lrs[id];
    let class = lr.class;
    let regs = self.env.reg_set(class);
    let unavailable = lr.forbidden.union(lr.pregveto).inter(regs);
    if unavailable.len() >= self.colors(class) { return false }
    let clobbered = lr.clobbered(self.env.call_clobbers());
    let free = regs.minus(unavailable);
    let order = self.env.regs(class);
    let pref = order.iter().copied().filter(|&r| lr.prefs.get(r))
      .chain(lr.copy_partners.iter().flat_map(|&v| self.partner_colors(v)));
    let main: Box<dyn Iterator<Item = PReg> + '_> = if lr.crosses_call() {
      Box::new(order.iter().copied().filter(|&r| self.env.is_callee_saved(r))
        .chain(order.iter().copied().filter(|&r| !self.env.is_callee_saved(r))))
    } else {
      Box::new(order.iter().copied())
    };
    let mut choice = pref.chain(main)
      .find(|&r| free.get(r) && !clobbered.get(r) && self.keeps_local_headroom(lr, r))
      .map(|r| (r, false));
    if choice.is_none() && self.opts.caller_save_opt && lr.crosses_call() {
      choice = order.iter().copied()
        .find(|&r| free.get(r) && self.keeps_local_headroom(lr, r))
        .map(|r| (r, true));
    }
    let Some((r, caller_save)) = choice else { return false };
    self.set_color(id, r, caller_save);
    true
  }

  fn set_color(&mut self, id: LrId, r: PReg, caller_save: bool) {
    let lr = &mut self.lrs[id];
    lr.assigned = Some(r);
    lr.caller_save = caller_save;
    log::trace!("color {} ({:?}) -> {r}{}", lr.vreg, id, if caller_save { " (caller-save)" } else { "" });
    for bl in lr.bb_member.iter() { self.bb_info[bl].globals_assigned.insert(r) }
    let neighbors: Vec<_> = lr.conflict.iter().collect();
    for n in neighbors { self.lrs[n].forbidden.insert(r) }
  }

  fn assign_must(&mut self, id: LrId) -> Result<(), RaError> {
    let lr = &self.lrs[id];
    let Some(p) = lr.must_assign else { return Ok(()) };
    if !self.env.reg_set(lr.class).get(p) || lr.forbidden.get(p) || lr.pregveto.get(p) {
      return Err(RaError::MustAssignConflict { vreg: lr.vreg, preg: p })
    }
    let caller_save = lr.clobbered(self.env.call_clobbers()).get(p);
    self.set_color(id, p, caller_save);
    Ok(())
  }

  pub(crate) fn spill_lr(&mut self, id: LrId) {
    let lr = &mut self.lrs[id];
    log::debug!("spill {} ({:?}), priority {}", lr.vreg, id, lr.priority);
    lr.spilled = true;
    lr.assigned = None;
  }

  /// Color `id`, escalating to splitting and then to spilling.
  fn split_and_color(&mut self, id: LrId) {
    if self.assign_color_to_lr(id) { return }
    if self.opts.split && self.split_lr_should_split(id) {
      if let Some(new) = self.split_lr(id) {
        self.stats.splits += 1;
        if !self.assign_color_to_lr(new) { self.spill_lr(new) }
        if !self.assign_color_to_lr(id) { self.spill_lr(id) }
        return
      }
    }
    self.spill_lr(id)
  }

  /// The ranges of a bucket, highest priority first.
  fn bucket(&self, class: LrClass) -> Vec<LrId> {
    let mut ids: Vec<_> = self.lrs.enum_iter().filter(|(_, lr)| lr.bucket == class).map(|(id, _)| id).collect();
    ids.sort_by_key(|&id| (std::cmp::Reverse(self.lrs[id].priority), id));
    ids
  }

  /// Color all global ranges, bucket by bucket.
  pub(crate) fn color_all(&mut self) -> Result<(), RaError> {
    for id in self.bucket(LrClass::MustAssigned) { self.assign_must(id)? }
    for class in [LrClass::UnconstrainedPref, LrClass::Constrained, LrClass::Unconstrained] {
      for id in self.bucket(class) { self.split_and_color(id) }
    }
    Ok(())
  }
}

//! Live range construction and the interference graph.

use smallvec::SmallVec;

use crate::arch::arm64::{CallClobbers, PRegSet, Reg};
use crate::types::{BitSet, IdxVec, vcode::{BlockId, VReg}};
use super::{GraphColorRegAllocator, LiveRange, LrClass, LrId, RaError, Remat};

/// Convert an instruction index to its use point.
pub(crate) fn use_pt(i: usize) -> u32 {
  #[allow(clippy::cast_possible_truncation)]
  { 2 * i as u32 }
}

impl GraphColorRegAllocator<'_> {
  fn lr_for(&mut self, v: VReg) -> Result<LrId, RaError> {
    if let Some(&id) = self.vreg_lr.get(&v) { return Ok(id) }
    if v.index() >= self.code.num_vregs() { return Err(RaError::UnknownVReg { vreg: v }) }
    let id = self.lrs.push(LiveRange::new(v, self.code.vreg_info(v).size));
    self.vreg_lr.insert(v, id);
    Ok(id)
  }

  /// Build one [`LiveRange`] per referenced virtual register.
  pub(crate) fn build_live_ranges(&mut self) -> Result<(), RaError> {
    let order = self.loops.sorted_bbs().to_vec();
    for bl in order { self.build_block(bl)? }
    for lr in &mut self.lrs.0 {
      lr.summarize_units();
      if lr.num_defs != 1 { lr.remat = None }
    }
    if self.opts.local_ra { self.find_locals() }
    Ok(())
  }

  /// Walk `bl` backward from its live-out set.
  fn build_block(&mut self, bl: BlockId) -> Result<(), RaError> {
    let code = self.code;
    let (first, last) = code.block_range(bl);
    let (entry_pt, exit_pt) = (use_pt(first.index()), use_pt(last.index()));
    let mut vreg_live: BitSet<usize> = self.live.live_out(bl).clone();
    let mut preg_live = PRegSet::EMPTY;
    for v in vreg_live.iter() {
      let id = self.lr_for(code.vreg(v))?;
      self.lrs[id].unit_mut(bl).cover(exit_pt);
    }
    for i in code.block_insns(bl).rev() {
      let inst = &code[i];
      let (upt, dpt) = (use_pt(i.index()), use_pt(i.index()) + 1);
      let mut vdefs = SmallVec::<[VReg; 4]>::new();
      let mut vuses = SmallVec::<[VReg; 4]>::new();
      let mut fixed = SmallVec::<[_; 2]>::new();
      let (mut pdefs, mut puses) = (PRegSet::EMPTY, PRegSet::EMPTY);
      inst.for_each_reg(|r, k, fx| match r {
        Reg::Virt(v) => {
          if k.is_def() && !vdefs.contains(&v) { vdefs.push(v) }
          if k.is_use() && !vuses.contains(&v) { vuses.push(v) }
          if let Some(p) = fx { fixed.push((v, p)) }
        }
        Reg::Phys(p) => {
          if k.is_def() { pdefs.insert(p) }
          if k.is_use() { puses.insert(p) }
        }
      });
      for (v, p) in fixed {
        let id = self.lr_for(v)?;
        let lr = &mut self.lrs[id];
        match lr.must_assign {
          Some(q) if q != p => return Err(RaError::ConflictingFixedRegs { vreg: v, first: q, second: p }),
          _ => lr.must_assign = Some(p),
        }
      }

      // values live after a call, and not produced by it, cross it
      if let Some(clobbers) = inst.call {
        for v in vreg_live.iter() {
          let v = code.vreg(v);
          if vdefs.contains(&v) { continue }
          let id = self.lr_for(v)?;
          let lu = self.lrs[id].unit_mut(bl);
          lu.flags |= super::LuFlags::HAS_CALL;
          lu.calls.push(i);
          match clobbers {
            CallClobbers::Unknown => lu.unknown_call = true,
            CallClobbers::Known(s) => lu.call_def = lu.call_def.union(s),
          }
        }
      }

      // definitions
      let def_veto = preg_live.union(pdefs);
      for &v in &vdefs {
        let id = self.lr_for(v)?;
        let lr = &mut self.lrs[id];
        if let Some((Reg::Virt(d), imm)) = inst.mov_imm_value() {
          if d == v { lr.remat = Some(Remat::Imm(imm)) }
        }
        let lu = lr.unit_mut(bl);
        lu.cover(dpt);
        lu.def_num += 1;
        lu.pregveto = lu.pregveto.union(def_veto);
      }
      if !pdefs.is_empty() {
        for v in vreg_live.iter() {
          let id = self.lr_for(code.vreg(v))?;
          let lu = self.lrs[id].unit_mut(bl);
          lu.pregveto = lu.pregveto.union(pdefs);
        }
      }
      for v in &vdefs { vreg_live.remove(v.index()); }
      preg_live = preg_live.minus(pdefs);

      // copies bias the coloring
      if let Some((dst, src)) = inst.is_move() {
        match (dst, src) {
          (Reg::Virt(d), Reg::Phys(s)) => { let id = self.lr_for(d)?; self.lrs[id].prefs.insert(s) }
          (Reg::Phys(d), Reg::Virt(s)) => { let id = self.lr_for(s)?; self.lrs[id].prefs.insert(d) }
          (Reg::Virt(d), Reg::Virt(s)) if d != s => {
            let (a, b) = (self.lr_for(d)?, self.lr_for(s)?);
            if !self.lrs[a].copy_partners.contains(&s) { self.lrs[a].copy_partners.push(s) }
            if !self.lrs[b].copy_partners.contains(&d) { self.lrs[b].copy_partners.push(d) }
          }
          _ => {}
        }
      }

      // uses
      for &v in &vuses {
        let id = self.lr_for(v)?;
        let lu = self.lrs[id].unit_mut(bl);
        lu.cover(upt);
        lu.use_num += 1;
        vreg_live.insert(v.index());
      }
      preg_live = preg_live.union(puses);
      if !puses.is_empty() {
        for v in vreg_live.iter() {
          let id = self.lr_for(code.vreg(v))?;
          let lu = self.lrs[id].unit_mut(bl);
          lu.pregveto = lu.pregveto.union(puses);
        }
      }
      if !preg_live.is_empty() {
        for &v in &vuses {
          let id = self.lr_for(v)?;
          let lu = self.lrs[id].unit_mut(bl);
          lu.pregveto = lu.pregveto.union(preg_live);
        }
      }
    }
    for v in vreg_live.iter() {
      let id = self.lr_for(code.vreg(v))?;
      self.lrs[id].unit_mut(bl).cover(entry_pt);
    }
    Ok(())
  }

  /// Mark single-block ranges as local and count their references.
  fn find_locals(&mut self) {
    for lr in &mut self.lrs.0 {
      if lr.must_assign.is_some() || lr.bb_member.len() != 1 { continue }
      let Some(bl) = lr.bb_member.iter().next() else { continue };
      let v = lr.vreg.index();
      if self.live.live_in(bl).contains(v) || self.live.live_out(bl).contains(v) { continue }
      lr.local = true;
      lr.bucket = LrClass::Local;
    }
    let code = self.code;
    for bl in code.block_ids() {
      for i in code.block_insns(bl) {
        code[i].for_each_reg(|r, k, _| {
          let Reg::Virt(v) = r else { return };
          let Some(&id) = self.vreg_lr.get(&v) else { return };
          if !self.lrs[id].local { return }
          let e = self.local_info[bl].refs.entry(v).or_default();
          if k.is_def() { e.0 += 1 }
          if k.is_use() { e.1 += 1 }
        });
      }
    }
  }

  /// The global (non-local) ranges live in each block.
  pub(crate) fn global_lrs_by_block(&self) -> IdxVec<BlockId, Vec<LrId>> {
    let mut out: IdxVec<BlockId, Vec<LrId>> = IdxVec::from_default(self.code.num_blocks());
    for (id, lr) in self.lrs.enum_iter() {
      if lr.local { continue }
      for bl in lr.bb_member.iter() { out[bl].push(id) }
    }
    out
  }

  /// Set symmetric conflict bits between global ranges of the same class whose units
  /// overlap in some shared block.
  pub(crate) fn check_interference(&mut self) {
    let by_block = self.global_lrs_by_block();
    for (bl, ids) in by_block.enum_iter() {
      for (n, &a) in ids.iter().enumerate() {
        for &b in &ids[n + 1..] {
          if self.interferes_in(a, b, bl) {
            self.lrs[a].conflict.insert(b);
            self.lrs[b].conflict.insert(a);
          }
        }
      }
    }
  }

  /// Do `a` and `b` hold values at a common point of `bl`?
  pub(crate) fn interferes_in(&self, a: LrId, b: LrId, bl: BlockId) -> bool {
    let (la, lb) = (&self.lrs[a], &self.lrs[b]);
    if la.class != lb.class || la.vreg == lb.vreg { return false }
    match (la.unit(bl), lb.unit(bl)) {
      (Some(ua), Some(ub)) => ua.overlaps(ub),
      _ => false,
    }
  }
}

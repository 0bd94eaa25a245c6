//! Stack slots, and the final rewrite into [`PCode`].
//!
//! Every virtual operand is replaced by its range's register. Spilled operands get a
//! temporary register for the one instruction, loaded before it (or rematerialized) and
//! stored after it. When no register is free, one is borrowed from another value and given
//! back afterwards.

use smallvec::SmallVec;

use crate::Idx;
use crate::arch::arm64::{AMode, Inst, Opcode, PReg, PRegSet, Reg, regs::SP};
use crate::types::{Size, vcode::{BlockId, InstId, RegClass, VReg}};
use super::{GraphColorRegAllocator, InstOrigin, LrId, LuFlags, PCode, PInstId, RaError, Remat,
  SlotId, SpillSlot, build::use_pt, caller_save::CallerSavePlan};

/// The largest scaled immediate offset of `ldr` and `str`.
const MAX_SCALED_OFFSET: u32 = 4095;

/// A register held by some range over `[begin, end]` of a block.
#[derive(Copy, Clone, Debug)]
struct Holder { reg: PReg, begin: u32, end: u32, lr: LrId }

/// Work to do after an instruction that borrowed a register.
#[derive(Copy, Clone, Debug)]
enum GiveBack {
  /// Reload the range from its home (or rematerialize it).
  Reload(LrId, PReg),
  /// Load the register back from an emergency slot.
  Restore(PReg, SlotId),
}

impl GraphColorRegAllocator<'_> {
  fn new_slot(&mut self, size: Size, class: RegClass, reusable: bool) -> SlotId {
    let bytes = size.bytes();
    let offset = self.next_slot_off.next_multiple_of(u32::from(bytes));
    self.next_slot_off = offset + u32::from(bytes);
    self.slot_holders.push(vec![]);
    self.slots.push(SpillSlot { size: bytes, offset, reusable, class })
  }

  /// A shareable slot none of whose holders interferes with `id`.
  fn get_reuse_mem(&self, id: LrId) -> Option<SlotId> {
    let lr = &self.lrs[id];
    self.slots.enum_iter().find(|&(s, slot)| {
      slot.reusable && slot.size == lr.size.bytes() && slot.class == lr.class &&
        self.slot_holders[s].iter().all(|&h| !lr.conflict.contains(h))
    }).map(|(s, _)| s)
  }

  fn get_spill_or_reuse_mem(&mut self, id: LrId) -> SlotId {
    let reuse = if self.opts.consistent_spill_reuse { self.get_reuse_mem(id) } else { None };
    let slot = match reuse {
      Some(s) => s,
      None => {
        let lr = &self.lrs[id];
        self.new_slot(lr.size, lr.class, true)
      }
    };
    self.slot_holders[slot].push(id);
    slot
  }

  /// Give every range that can be in memory a slot. Split and caller-save families share
  /// one dedicated home; constants get none.
  pub(crate) fn assign_spill_slots(&mut self) {
    for id in self.lrs.ids() {
      let lr = &self.lrs[id];
      if lr.spill_mem.is_some() || lr.remat.is_some() { continue }
      if self.has_home_slot(id) {
        let (size, class) = (lr.size, lr.class);
        let root = self.vreg_lr.get(&lr.vreg).copied().unwrap_or(id);
        let slot = self.new_slot(size, class, false);
        self.slot_holders[slot].push(root);
        let family: Vec<_> = self.pieces(root).collect();
        for p in family { self.lrs[p].spill_mem = Some(slot) }
      } else if lr.spilled {
        let slot = if lr.local {
          let (size, class) = (lr.size, lr.class);
          self.new_slot(size, class, false)
        } else {
          self.get_spill_or_reuse_mem(id)
        };
        log::trace!("{} -> slot {slot:?}", self.lrs[id].vreg);
        self.lrs[id].spill_mem = Some(slot);
      }
    }
  }

  /// The slot of `id`, creating one if slot assignment left it without.
  fn slot_of(&mut self, id: LrId) -> SlotId {
    if let Some(s) = self.lrs[id].spill_mem { return s }
    let (size, class) = (self.lrs[id].size, self.lrs[id].class);
    let s = self.new_slot(size, class, false);
    self.lrs[id].spill_mem = Some(s);
    s
  }

  /// The address of a slot, forming it in the scratch register when the offset does not
  /// fit the scaled immediate.
  #[allow(clippy::integer_division)]
  fn slot_addr(&self, out: &mut PCode, slot: SlotId) -> AMode {
    let s = self.slots[slot];
    let size = u32::from(s.size);
    if s.offset % size == 0 && s.offset / size <= MAX_SCALED_OFFSET {
      return AMode::reg_off(SP, i64::from(s.offset))
    }
    let scratch = self.env.scratch;
    out.push(Inst::mov_imm(scratch, i64::from(s.offset)), InstOrigin::ScratchAddr);
    out.push(Inst::alu(Opcode::Add, scratch, SP, scratch), InstOrigin::ScratchAddr);
    AMode::reg_off(scratch, 0)
  }

  /// Put the value of `id` into `r`, by rematerialization or by a load from its slot.
  fn emit_reload(&mut self, out: &mut PCode, id: LrId, r: PReg) {
    let v = self.lrs[id].vreg;
    if let Some(Remat::Imm(k)) = self.lrs[id].remat {
      out.push(Inst::mov_imm(r, k), InstOrigin::Remat(v));
      self.stats.remats += 1;
    } else {
      let slot = self.slot_of(id);
      let addr = self.slot_addr(out, slot);
      out.push(Inst::load(r, addr), InstOrigin::Reload { vreg: v, slot });
      self.stats.reloads += 1;
    }
  }

  fn emit_store(&mut self, out: &mut PCode, id: LrId, r: PReg) {
    let v = self.lrs[id].vreg;
    let slot = self.slot_of(id);
    let addr = self.slot_addr(out, slot);
    out.push(Inst::store(r, addr), InstOrigin::Spill { vreg: v, slot });
    self.stats.stores += 1;
  }

  fn emit_restore(&mut self, out: &mut PCode, id: LrId, hoisted: bool) {
    let Some(r) = self.lrs[id].assigned else { return };
    self.emit_reload(out, id, r);
    self.stats.caller_save_restores += 1;
    if hoisted { self.stats.hoisted_restores += 1 }
  }

  /// The range holding `v` in `bl`, and its register, or `None` if it is in memory there.
  fn location(&self, v: VReg, bl: BlockId) -> Result<(LrId, Option<PReg>), RaError> {
    let Some(&root) = self.vreg_lr.get(&v) else { return Err(RaError::UnknownVReg { vreg: v }) };
    let lr = &self.lrs[root];
    if lr.local {
      let r = if lr.spilled { None } else { self.bb_info[bl].reg_map.get(&v).copied().or(lr.assigned) };
      return Ok((root, r))
    }
    let Some(id) = self.piece_at(v, bl) else {
      debug_assert!(false, "{v} referenced outside its live range in bb{}", bl.index());
      return Ok((root, None))
    };
    let lr = &self.lrs[id];
    Ok((id, if lr.spilled { None } else { lr.assigned }))
  }

  /// The registers held over some point of `bl`: global ranges, then local ranges.
  fn holders(&self, bl: BlockId) -> Vec<Holder> {
    let mut out = vec![];
    for (id, lr) in self.lrs.enum_iter() {
      if lr.local || lr.spilled { continue }
      let (Some(reg), Some(lu)) = (lr.assigned, lr.unit(bl)) else { continue };
      out.push(Holder { reg, begin: lu.begin, end: lu.end, lr: id });
    }
    for iv in &self.bb_info[bl].local_live {
      if let Some(&lr) = self.vreg_lr.get(&iv.vreg) {
        out.push(Holder { reg: iv.reg, begin: iv.begin, end: iv.end, lr });
      }
    }
    out
  }

  /// The physical registers live before and after each instruction of `bl`. Physical
  /// registers are never live across block boundaries.
  fn phys_liveness(&self, bl: BlockId) -> Vec<(PRegSet, PRegSet)> {
    let insts: Vec<InstId> = self.code.block_insns(bl).collect();
    let mut out = vec![(PRegSet::EMPTY, PRegSet::EMPTY); insts.len()];
    let mut live = PRegSet::EMPTY;
    for (n, &i) in insts.iter().enumerate().rev() {
      let after = live;
      let (mut defs, mut uses) = (PRegSet::EMPTY, PRegSet::EMPTY);
      self.code[i].for_each_reg(|r, k, _| if let Reg::Phys(p) = r {
        if k.is_def() { defs.insert(p) }
        if k.is_use() { uses.insert(p) }
      });
      live = live.minus(defs).union(uses);
      out[n] = (live, after);
    }
    out
  }

  /// Choose a temporary of `class` for a spilled operand, outside `busy`.
  fn select_spill_reg(&self, class: RegClass, busy: PRegSet) -> Option<PReg> {
    self.env.regs(class).iter().copied().find(|&r| !busy.get(r))
  }

  /// Borrow a register that only `avoid` rules out, saving whichever range holds it over
  /// `[from, to]` first.
  fn evict(&mut self, out: &mut PCode, v: VReg, i: InstId, (from, to): (u32, u32), holders: &[Holder],
    avoid: PRegSet, give_back: &mut SmallVec<[GiveBack; 2]>,
  ) -> Result<PReg, RaError> {
    let Some(r) = self.env.regs(v.class()).iter().rev().copied().find(|&r| !avoid.get(r)) else {
      return Err(RaError::NoRegisterForSpill { vreg: v, inst: i })
    };
    let Some(h) = holders.iter().find(|h| h.reg == r && h.begin <= to && from <= h.end) else {
      return Ok(r)
    };
    self.stats.double_spills += 1;
    log::debug!("{i:?}: borrowing {r} from {} for {v}", self.lrs[h.lr].vreg);
    if self.lrs[h.lr].remat.is_some() || (self.has_home_slot(h.lr) && self.lrs[h.lr].spill_mem.is_some()) {
      give_back.push(GiveBack::Reload(h.lr, r));
    } else {
      let slot = self.new_slot(Size::S64, r.class(), false);
      let addr = self.slot_addr(out, slot);
      out.push(Inst::store(r, addr), InstOrigin::SaveOccupant(slot));
      give_back.push(GiveBack::Restore(r, slot));
    }
    Ok(r)
  }

  /// A temporary for the spilled operand `v` of range `id`, needed over `span` of
  /// instruction `i`: a register outside `busy`, else the scratch register at a branch,
  /// else one borrowed from outside `avoid`.
  fn spill_temp(&mut self, out: &mut PCode, (bl, i): (BlockId, InstId), (v, id): (VReg, LrId),
    span: (u32, u32), holders: &[Holder], (busy, avoid): (PRegSet, PRegSet),
    give_back: &mut SmallVec<[GiveBack; 2]>,
  ) -> Result<PReg, RaError> {
    let veto = self.lrs[id].unit(bl).map_or(PRegSet::EMPTY, |lu| lu.pregveto.union(lu.local_veto));
    let scratch = self.env.scratch;
    match self.select_spill_reg(v.class(), busy.union(veto)) {
      Some(t) => Ok(t),
      // nothing can be given back after a branch
      None if self.code[i].is_terminator() && v.class() == scratch.class() && !avoid.get(scratch) =>
        Ok(scratch),
      None => self.evict(out, v, i, span, holders, avoid, give_back),
    }
  }

  fn emit_inst(&mut self, out: &mut PCode, bl: BlockId, i: InstId, holders: &[Holder],
    (live_before, live_after): (PRegSet, PRegSet),
  ) -> Result<(), RaError> {
    let code = self.code;
    let inst = &code[i];
    let (from, to) = (use_pt(i.index()), use_pt(i.index()) + 1);
    let mut kinds = SmallVec::<[(VReg, bool, bool); 4]>::new();
    inst.for_each_reg(|r, k, _| if let Reg::Virt(v) = r {
      let pos = kinds.iter().position(|e| e.0 == v);
      let n = pos.unwrap_or_else(|| { kinds.push((v, false, false)); kinds.len() - 1 });
      kinds[n].1 |= k.is_use();
      kinds[n].2 |= k.is_def();
    });

    let mut map = SmallVec::<[(VReg, PReg); 4]>::new();
    let mut temps = SmallVec::<[(VReg, LrId, PReg, bool, bool); 2]>::new();
    let mut pending = SmallVec::<[(VReg, LrId, bool, bool); 2]>::new();
    for &(v, used, defined) in &kinds {
      match self.location(v, bl)? {
        (_, Some(r)) => map.push((v, r)),
        (id, None) => pending.push((v, id, used, defined)),
      }
    }
    // operands that are read need their temporaries over the whole instruction
    let mut busy = inst.phys_regs().union(live_before).union(live_after);
    for h in holders { if h.begin <= to && from <= h.end { busy.insert(h.reg) } }
    for &(_, r) in &map { busy.insert(r) }
    // registers the instruction itself names, which an eviction must not touch
    let mut avoid = inst.phys_regs().union(live_before).union(live_after);
    for &(_, r) in &map { avoid.insert(r) }

    let mut give_back = SmallVec::<[GiveBack; 2]>::new();
    let mut read_only = PRegSet::EMPTY;
    for &(v, id, used, defined) in pending.iter().filter(|e| e.2) {
      let t = self.spill_temp(out, (bl, i), (v, id), (from, to), holders, (busy, avoid), &mut give_back)?;
      busy.insert(t);
      avoid.insert(t);
      if !defined { read_only.insert(t) }
      map.push((v, t));
      temps.push((v, id, t, used, defined));
    }

    // operands that are only written need a register from the write point on, which may
    // be one whose value the instruction has just read for the last time
    let written = |v: VReg| kinds.iter().any(|e| e.0 == v && e.2);
    let mut def_busy = inst.phys_regs().union(live_after);
    for h in holders { if h.begin <= to && to <= h.end { def_busy.insert(h.reg) } }
    let mut def_avoid = inst.phys_regs().union(live_after);
    for &(v, r) in &map {
      if written(v) { def_busy.insert(r); def_avoid.insert(r) }
    }
    def_busy = def_busy.minus(read_only);
    for &(v, id, used, defined) in pending.iter().filter(|e| !e.2) {
      let t = self.spill_temp(out, (bl, i), (v, id), (to, to), holders, (def_busy, def_avoid), &mut give_back)?;
      def_busy.insert(t);
      def_avoid.insert(t);
      map.push((v, t));
      temps.push((v, id, t, used, defined));
    }

    for &(_, id, t, used, _) in &temps {
      if used { self.emit_reload(out, id, t) }
    }
    let mut new = inst.clone();
    new.map_regs(|r, _| match r {
      Reg::Virt(v) => map.iter().find(|e| e.0 == v).map_or(r, |e| Reg::Phys(e.1)),
      Reg::Phys(_) => r,
    });
    if let Some((d, s)) = new.is_move() {
      if d == s { self.stats.identity_moves += 1 }
    }
    out.push(new, InstOrigin::Orig(i));

    for &(_, id, t, _, defined) in &temps {
      if defined && self.lrs[id].remat.is_none() { self.emit_store(out, id, t) }
    }
    for &(v, r) in &map {
      if temps.iter().any(|e| e.0 == v) || !written(v) { continue }
      let (id, _) = self.location(v, bl)?;
      if self.has_home_slot(id) { self.emit_store(out, id, r) }
    }
    for g in give_back {
      match g {
        GiveBack::Reload(id, r) => self.emit_reload(out, id, r),
        GiveBack::Restore(r, slot) => {
          let addr = self.slot_addr(out, slot);
          out.push(Inst::load(r, addr), InstOrigin::RestoreOccupant(slot));
          self.stats.reloads += 1;
        }
      }
    }
    Ok(())
  }

  fn emit_block(&mut self, out: &mut PCode, bl: BlockId, plan: &CallerSavePlan) -> Result<(), RaError> {
    let entry: Vec<LrId> = self.lrs.enum_iter()
      .filter(|(_, lr)| !lr.local && !lr.spilled && lr.assigned.is_some() &&
        lr.unit(bl).is_some_and(|lu| lu.flags.contains(LuFlags::NEED_RELOAD)))
      .map(|(id, _)| id).collect();
    for id in entry {
      if let Some(r) = self.lrs[id].assigned { self.emit_reload(out, id, r) }
    }
    let holders = self.holders(bl);
    let phys = self.phys_liveness(bl);
    let mut ended = false;
    for (n, i) in self.code.block_insns(bl).enumerate() {
      if self.code[i].is_terminator() && !ended {
        ended = true;
        for &id in plan.at_end.get(&bl).into_iter().flatten() { self.emit_restore(out, id, true) }
      }
      for &id in plan.before.get(&i).into_iter().flatten() { self.emit_restore(out, id, false) }
      self.emit_inst(out, bl, i, &holders, phys[n])?;
      for &id in plan.after.get(&i).into_iter().flatten() { self.emit_restore(out, id, false) }
    }
    if !ended {
      for &id in plan.at_end.get(&bl).into_iter().flatten() { self.emit_restore(out, id, true) }
    }
    Ok(())
  }

  /// Rewrite the function into physical registers.
  pub(crate) fn finalize(&mut self, plan: &CallerSavePlan) -> Result<PCode, RaError> {
    let mut out = PCode::default();
    for bl in self.code.block_ids() {
      let start = PInstId::from_usize(out.insts.len());
      self.emit_block(&mut out, bl, plan)?;
      out.blocks.push((start, PInstId::from_usize(out.insts.len())));
    }
    Ok(out)
  }
}

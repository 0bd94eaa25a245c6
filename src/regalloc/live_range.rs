//! The per-function data model of the allocator: live ranges, their per-block live units,
//! and the per-block assignment bookkeeping.

use std::collections::BTreeMap;

use bitflags::bitflags;
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::arch::arm64::{PReg, PRegSet};
use crate::types::{BitSet, Size, vcode::{BlockId, InstId, RegClass, VReg}};

mk_id! {
  /// A live range, an index into the allocator's live range table.
  LrId,
  /// A spill slot in the frame.
  SlotId,
}

bitflags! {
  /// Per-unit markers consumed by spill and reload emission.
  #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
  pub struct LuFlags: u8 {
    /// The range is live across a call in this block.
    const HAS_CALL = 1;
    /// The value must be reloaded from its home slot on entry to the block,
    /// because some predecessor does not hold it in this range's register.
    const NEED_RELOAD = 2;
    /// A caller-save restore is placed in this block.
    const NEED_RESTORE = 4;
  }
}

/// The part of a live range inside one block.
///
/// `begin` and `end` are program points: instruction `i` reads its operands at `2i`
/// and writes its results at `2i + 1`. The interval is closed.
#[derive(Clone, Debug)]
pub struct LiveUnit {
  /// First point at which the value is live.
  pub begin: u32,
  /// Last point at which the value is live.
  pub end: u32,
  /// Number of definitions in the block.
  pub def_num: u32,
  /// Number of uses in the block.
  pub use_num: u32,
  /// Reload and restore markers.
  pub flags: LuFlags,
  /// Physical registers live somewhere in the interval.
  pub pregveto: PRegSet,
  /// Registers taken by local ranges of this block. Only recorded on spilled ranges.
  pub local_veto: PRegSet,
  /// Registers clobbered by known-clobber calls the value is live across.
  pub call_def: PRegSet,
  /// The value is live across a call with unknown clobbers.
  pub unknown_call: bool,
  /// The calls the value is live across, in order.
  pub calls: SmallVec<[InstId; 2]>,
}

impl Default for LiveUnit {
  fn default() -> Self {
    Self {
      begin: u32::MAX,
      end: 0,
      def_num: 0,
      use_num: 0,
      flags: LuFlags::empty(),
      pregveto: PRegSet::EMPTY,
      local_veto: PRegSet::EMPTY,
      call_def: PRegSet::EMPTY,
      unknown_call: false,
      calls: SmallVec::new(),
    }
  }
}

impl LiveUnit {
  /// Extend the interval to include `pt`.
  pub fn cover(&mut self, pt: u32) {
    self.begin = self.begin.min(pt);
    self.end = self.end.max(pt);
  }

  /// Does the block reference the value?
  #[must_use] pub fn has_ref(&self) -> bool { self.def_num + self.use_num != 0 }

  /// Do two units of the same block overlap?
  #[must_use] pub fn overlaps(&self, other: &Self) -> bool {
    self.begin <= other.end && other.begin <= self.end
  }

  /// Is the value live at some point of `[from, to]`?
  #[must_use] pub fn live_at(&self, from: u32, to: u32) -> bool {
    self.begin <= to && from <= self.end
  }
}

/// A value that can be recomputed instead of reloaded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Remat {
  /// `mov dst, #imm`
  Imm(i64),
}

/// The coloring bucket of a live range.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LrClass {
  /// Bound to a specific register by an operand constraint.
  MustAssigned,
  /// Has a move preference and is trivially colorable.
  UnconstrainedPref,
  /// Has at least as many neighbors and vetoes as there are colors.
  Constrained,
  /// Trivially colorable.
  #[default]
  Unconstrained,
  /// Lives in a single block; handled by the local allocator.
  Local,
}

/// One virtual register's live range, or one fragment of it after splitting.
#[derive(Clone, Debug)]
pub struct LiveRange {
  /// The virtual register. Split fragments share it.
  pub vreg: VReg,
  /// Register class.
  pub class: RegClass,
  /// Value width, which sizes the spill slot.
  pub size: Size,
  /// The blocks in which the range is live.
  pub bb_member: BitSet<BlockId>,
  /// The live unit of each member block.
  pub lu_map: BTreeMap<BlockId, LiveUnit>,
  /// Interfering live ranges.
  pub conflict: BitSet<LrId>,
  /// Colors taken by already colored neighbors.
  pub forbidden: PRegSet,
  /// Union of the units' physical vetoes.
  pub pregveto: PRegSet,
  /// Registers clobbered by crossed known-clobber calls.
  pub call_def: PRegSet,
  /// Crosses a call with unknown clobbers.
  pub cross_call: bool,
  /// Number of calls crossed.
  pub num_call: u32,
  /// The assigned color.
  pub assigned: Option<PReg>,
  /// The fragment split off this range.
  pub split_lr: Option<LrId>,
  /// The range this one was split from.
  pub split_parent: Option<LrId>,
  /// The range lives in memory, with a temporary register at each reference.
  pub spilled: bool,
  /// Memory home, once assigned.
  pub spill_mem: Option<SlotId>,
  /// Coloring priority; higher is colored first.
  pub priority: u64,
  /// Number of definitions.
  pub num_defs: u32,
  /// Number of uses.
  pub num_uses: u32,
  /// The register required by an operand constraint.
  pub must_assign: Option<PReg>,
  /// Physical registers this range is copied to or from.
  pub prefs: PRegSet,
  /// Virtual registers this range is copied to or from.
  pub copy_partners: SmallVec<[VReg; 2]>,
  /// Rematerialization, if the single definition is a constant.
  pub remat: Option<Remat>,
  /// Lives in a single block and is allocated by the local allocator.
  pub local: bool,
  /// Holds a caller-saved register across a call, protected by restores.
  pub caller_save: bool,
  /// Coloring bucket.
  pub bucket: LrClass,
}

impl LiveRange {
  /// An empty range for `vreg`.
  #[must_use] pub fn new(vreg: VReg, size: Size) -> Self {
    Self {
      vreg,
      class: vreg.class(),
      size,
      bb_member: BitSet::default(),
      lu_map: BTreeMap::new(),
      conflict: BitSet::default(),
      forbidden: PRegSet::EMPTY,
      pregveto: PRegSet::EMPTY,
      call_def: PRegSet::EMPTY,
      cross_call: false,
      num_call: 0,
      assigned: None,
      split_lr: None,
      split_parent: None,
      spilled: false,
      spill_mem: None,
      priority: 0,
      num_defs: 0,
      num_uses: 0,
      must_assign: None,
      prefs: PRegSet::EMPTY,
      copy_partners: SmallVec::new(),
      remat: None,
      local: false,
      caller_save: false,
      bucket: LrClass::default(),
    }
  }

  /// The unit for `bl`, created if missing. This also makes `bl` a member.
  pub fn unit_mut(&mut self, bl: BlockId) -> &mut LiveUnit {
    self.bb_member.insert(bl);
    self.lu_map.entry(bl).or_default()
  }

  /// The unit for `bl`.
  #[must_use] pub fn unit(&self, bl: BlockId) -> Option<&LiveUnit> { self.lu_map.get(&bl) }

  /// Is the range a member of a split family (either side of a split)?
  #[must_use] pub fn is_split(&self) -> bool { self.split_lr.is_some() || self.split_parent.is_some() }

  /// Does the range cross any call?
  #[must_use] pub fn crosses_call(&self) -> bool { self.num_call != 0 }

  /// Registers clobbered by calls this range is live across.
  #[must_use] pub fn clobbered(&self, unknown: PRegSet) -> PRegSet {
    if self.cross_call { self.call_def.union(unknown) } else { self.call_def }
  }

  /// Recompute the range-level summary (vetoes, call data, reference counts) from the units.
  pub fn summarize_units(&mut self) {
    self.pregveto = PRegSet::EMPTY;
    self.call_def = PRegSet::EMPTY;
    self.cross_call = false;
    self.num_call = 0;
    self.num_defs = 0;
    self.num_uses = 0;
    for lu in self.lu_map.values() {
      self.pregveto = self.pregveto.union(lu.pregveto);
      self.call_def = self.call_def.union(lu.call_def);
      self.cross_call |= lu.unknown_call;
      #[allow(clippy::cast_possible_truncation)]
      { self.num_call += lu.calls.len() as u32 }
      self.num_defs += lu.def_num;
      self.num_uses += lu.use_num;
    }
  }
}

/// A local range's register within its block, and the points over which it is held.
#[derive(Copy, Clone, Debug)]
pub struct LocalInterval {
  /// The local virtual register.
  pub vreg: VReg,
  /// Its register.
  pub reg: PReg,
  /// The first program point at which `reg` is held.
  pub begin: u32,
  /// The last program point at which `reg` is held.
  pub end: u32,
}

/// Per-block assignment state.
#[derive(Clone, Debug, Default)]
pub struct BbAssignInfo {
  /// Registers assigned to global ranges live in this block.
  pub globals_assigned: PRegSet,
  /// Simultaneously live local ranges, per class (integer, floating point).
  pub local_regs_needed: [u32; 2],
  /// Registers of local ranges.
  pub reg_map: HashMap<VReg, PReg>,
  /// The lifetimes of the local registers, in order of assignment.
  pub local_live: Vec<LocalInterval>,
}

/// Per-block reference counts of local virtual registers, as `(defs, uses)`.
#[derive(Clone, Debug, Default)]
pub struct LocalRaInfo {
  /// Reference counts. The allocation pass decrements these to find last references.
  pub refs: HashMap<VReg, (u32, u32)>,
}

/// A stack slot holding spilled values.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SpillSlot {
  /// Width in bytes, 4 or 8.
  pub size: u8,
  /// Offset from `sp`.
  pub offset: u32,
  /// Whether the slot may be shared with other non-conflicting ranges.
  pub reusable: bool,
  /// The class of the values stored.
  pub class: RegClass,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unit_overlap() {
    let mut a = LiveUnit::default();
    a.cover(3);
    a.cover(8);
    let mut b = LiveUnit::default();
    b.cover(9);
    assert!(!a.overlaps(&b));
    b.cover(8);
    assert!(a.overlaps(&b) && b.overlaps(&a));
    assert!(a.live_at(0, 3) && !a.live_at(9, 9));
  }

  #[test]
  fn summary() {
    let mut lr = LiveRange::new(VReg::new(0, RegClass::Int), Size::S64);
    let u = lr.unit_mut(BlockId::new(2));
    u.def_num = 1;
    u.unknown_call = true;
    u.calls.push(InstId::new(4));
    lr.unit_mut(BlockId::new(3)).use_num = 2;
    lr.summarize_units();
    assert_eq!((lr.num_defs, lr.num_uses, lr.num_call), (1, 2, 1));
    assert!(lr.cross_call && lr.crosses_call());
    assert_eq!(lr.bb_member.len(), 2);
  }
}

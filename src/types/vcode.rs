//! The input to register allocation: machine code over virtual registers, organized as a CFG.

use std::fmt::{Debug, Display};

use crate::Idx;
use crate::analysis::{liveness::Liveness, loops::LoopInfo};
use crate::arch::arm64::Inst;
use super::{IdxVec, Size};

pub use regalloc2::RegClass;
pub use regalloc2::{Block as BlockId, Inst as InstId};

/// A trait to factor the commonalities of [`VReg`] and [`PReg`](crate::PReg).
pub trait IsReg: Sized + Eq {
  /// A special value of the type representing the invalid value.
  fn invalid() -> Self;
  /// Is this value not the invalid values?
  fn is_valid(&self) -> bool { *self != Self::invalid() }
}

/// A virtual register, which is a stand-in for physical registers before register allocation.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VReg(pub regalloc2::VReg);

impl VReg {
  /// Construct the virtual register with number `reg` in the given class.
  #[inline(always)]
  #[must_use] pub const fn new(reg: usize, class: RegClass) -> Self {
    Self(regalloc2::VReg::new(reg, class))
  }

  /// The number of this register, unique within a function.
  #[inline]
  #[must_use] pub fn index(self) -> usize { self.0.vreg() }

  /// The register class (integer or floating point).
  #[inline]
  #[must_use] pub fn class(self) -> RegClass { self.0.class() }
}

impl IsReg for VReg {
  fn invalid() -> Self { Self(regalloc2::VReg::invalid()) }
}

impl Debug for VReg {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{self}")
  }
}

impl Display for VReg {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if !self.is_valid() { return write!(f, "%-") }
    match self.class() {
      RegClass::Float => write!(f, "%f{}", self.index()),
      _ => write!(f, "%{}", self.index()),
    }
  }
}

impl Idx for BlockId {
  fn into_usize(self) -> usize { self.index() }
  fn from_usize(n: usize) -> Self { Self::new(n) }
}
impl Idx for InstId {
  fn into_usize(self) -> usize { self.index() }
  fn from_usize(n: usize) -> Self { Self::new(n) }
}

/// Per-vreg information recorded when the register is created.
#[derive(Copy, Clone, Debug)]
pub struct VRegInfo {
  /// The register class.
  pub class: RegClass,
  /// The width of the value, which determines the size of its spill slot.
  pub size: Size,
}

/// A low level representation of a function, after instruction selection but before
/// register allocation.
///
/// Instructions are stored contiguously, and each block owns the half-open range
/// `blocks[b].0 .. blocks[b].1` of instruction IDs. Block 0 is the entry block.
#[derive(Debug)]
pub struct VCode {
  pub(crate) insts: IdxVec<InstId, Inst>,
  pub(crate) blocks: IdxVec<BlockId, (InstId, InstId)>,
  pub(crate) block_preds: IdxVec<BlockId, Vec<BlockId>>,
  pub(crate) block_succs: IdxVec<BlockId, Vec<BlockId>>,
  pub(crate) vregs: Vec<VRegInfo>,
  /// The offset from SP of the first byte available for spill slots.
  pub spill_base: u32,
  pub(crate) liveness: Option<Liveness>,
  pub(crate) loops: Option<LoopInfo>,
}

impl Default for VCode {
  fn default() -> Self {
    Self {
      insts: Default::default(),
      blocks: Default::default(),
      block_preds: Default::default(),
      block_succs: Default::default(),
      vregs: vec![],
      spill_base: 16, // above the saved FP/LR pair
      liveness: None,
      loops: None,
    }
  }
}

impl VCode {
  /// Create a new unused `VReg`.
  #[must_use] pub fn fresh_vreg(&mut self, class: RegClass, size: Size) -> VReg {
    let v = VReg::new(self.vregs.len(), class);
    self.vregs.push(VRegInfo { class, size });
    v
  }

  /// The number of virtual registers created so far.
  #[must_use] pub fn num_vregs(&self) -> usize { self.vregs.len() }

  /// Get the [`VReg`] with the given number.
  #[must_use] pub fn vreg(&self, n: usize) -> VReg { VReg::new(n, self.vregs[n].class) }

  /// Get the recorded information about a virtual register.
  #[must_use] pub fn vreg_info(&self, v: VReg) -> VRegInfo { self.vregs[v.index()] }

  /// Finalize a block. Must be called after each call to `new_block`,
  /// once all instructions of the block are emitted.
  pub fn finish_block(&mut self) {
    let end = InstId::new(self.insts.len());
    debug_assert!(!self.blocks.is_empty(), "finish_block without new_block");
    if let Some(bl) = self.blocks.0.last_mut() { bl.1 = end }
  }

  /// Add an edge in the CFG, from `from` to `to`.
  pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
    self.block_succs[from].push(to);
    self.block_preds[to].push(from);
  }

  /// Start a new block.
  pub fn new_block(&mut self) -> BlockId {
    let inst = InstId::new(self.insts.len());
    let bl = self.blocks.push((inst, inst));
    self.block_preds.push(vec![]);
    self.block_succs.push(vec![]);
    bl
  }

  /// Emit an instruction into the current block.
  pub fn emit(&mut self, inst: Inst) -> InstId { self.insts.push(inst) }

  /// Supply live-in/live-out sets computed by the code generator.
  /// If this is not called, the allocator computes them itself.
  pub fn set_liveness(&mut self, live: Liveness) { self.liveness = Some(live) }

  /// Supply the loop nest computed by the code generator.
  /// If this is not called, the allocator computes it itself.
  pub fn set_loops(&mut self, loops: LoopInfo) { self.loops = Some(loops) }

  /// The number of blocks.
  #[must_use] pub fn num_blocks(&self) -> usize { self.blocks.len() }

  /// The number of instructions.
  #[must_use] pub fn num_insts(&self) -> usize { self.insts.len() }

  /// An iterator over the block IDs.
  pub fn block_ids(&self) -> impl DoubleEndedIterator<Item = BlockId> + use<> {
    (0..self.blocks.len()).map(BlockId::new)
  }

  /// The instructions of a block, in order.
  pub fn block_insns(&self, bl: BlockId) -> impl DoubleEndedIterator<Item = InstId> + use<> {
    let (from, to) = self.blocks[bl];
    (from.index()..to.index()).map(InstId::new)
  }

  /// The first and one-past-last instruction of a block.
  #[must_use] pub fn block_range(&self, bl: BlockId) -> (InstId, InstId) { self.blocks[bl] }

  /// The predecessors of a block.
  #[must_use] pub fn block_preds(&self, bl: BlockId) -> &[BlockId] { &self.block_preds[bl] }

  /// The successors of a block.
  #[must_use] pub fn block_succs(&self, bl: BlockId) -> &[BlockId] { &self.block_succs[bl] }

  /// The entry block.
  #[must_use] pub fn entry_block(&self) -> BlockId { BlockId::new(0) }
}

impl std::ops::Index<InstId> for VCode {
  type Output = Inst;
  fn index(&self, i: InstId) -> &Self::Output { &self.insts[i] }
}
impl std::ops::IndexMut<InstId> for VCode {
  fn index_mut(&mut self, i: InstId) -> &mut Self::Output { &mut self.insts[i] }
}

//! Block-level liveness of virtual registers.
//!
//! Physical registers are not tracked across block boundaries: the code generator only
//! uses them in short sequences (argument setup, call results) within one block.

use crate::types::{BitSet, IdxVec, vcode::{BlockId, VCode}};
use crate::arch::arm64::Reg;

/// Live-in and live-out sets per block, over virtual register numbers.
#[derive(Clone, Debug, Default)]
pub struct Liveness {
  live_in: IdxVec<BlockId, BitSet<usize>>,
  live_out: IdxVec<BlockId, BitSet<usize>>,
}

impl Liveness {
  /// Wrap liveness sets computed elsewhere.
  #[must_use] pub fn new(
    live_in: IdxVec<BlockId, BitSet<usize>>,
    live_out: IdxVec<BlockId, BitSet<usize>>,
  ) -> Self {
    Self { live_in, live_out }
  }

  /// Compute liveness by the usual backward dataflow iteration to a fixed point.
  #[must_use] pub fn compute(code: &VCode) -> Self {
    let n = code.num_blocks();
    let mut gen_: IdxVec<BlockId, BitSet<usize>> = IdxVec::from_default(n);
    let mut kill: IdxVec<BlockId, BitSet<usize>> = IdxVec::from_default(n);
    for bl in code.block_ids() {
      let (gen_, kill) = (&mut gen_[bl], &mut kill[bl]);
      for i in code.block_insns(bl).rev() {
        code[i].for_each_reg(|r, k, _| if let (Reg::Virt(v), true) = (r, k.is_def()) {
          kill.insert(v.index());
          gen_.remove(v.index());
        });
        code[i].for_each_reg(|r, k, _| if let (Reg::Virt(v), true) = (r, k.is_use()) {
          gen_.insert(v.index());
        });
      }
    }
    let mut live_in: IdxVec<BlockId, BitSet<usize>> = IdxVec::from_default(n);
    let mut live_out: IdxVec<BlockId, BitSet<usize>> = IdxVec::from_default(n);
    let mut changed = true;
    while changed {
      changed = false;
      for bl in code.block_ids().rev() {
        let mut out = BitSet::default();
        for &s in code.block_succs(bl) { out.union_with(&live_in[s]) }
        let mut inn = out.clone();
        inn.difference_with(&kill[bl]);
        inn.union_with(&gen_[bl]);
        if inn != live_in[bl] { live_in[bl] = inn; changed = true }
        live_out[bl] = out;
      }
    }
    Self { live_in, live_out }
  }

  /// The vregs live on entry to `bl`.
  #[must_use] pub fn live_in(&self, bl: BlockId) -> &BitSet<usize> { &self.live_in[bl] }

  /// The vregs live on exit from `bl`.
  #[must_use] pub fn live_out(&self, bl: BlockId) -> &BitSet<usize> { &self.live_out[bl] }
}

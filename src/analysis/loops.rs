//! Dominators, natural loops, and the block order used by the allocator.

use std::collections::VecDeque;

use bit_vec::BitVec;

use crate::Idx;
use crate::types::{BitSet, IdxVec, vcode::{BlockId, VCode}};

mk_id! {
  /// A loop in the loop nest.
  LoopId
}

/// A natural loop. Loops with the same header are merged.
#[derive(Clone, Debug)]
pub struct Loop {
  /// The loop header, which dominates every member.
  pub header: BlockId,
  /// All member blocks, including those of nested loops.
  pub members: BitSet<BlockId>,
  /// The enclosing loop.
  pub parent: Option<LoopId>,
  /// Nesting depth: 1 for an outermost loop.
  pub depth: u32,
  /// The sources of the back edges into the header.
  pub back_edge_srcs: Vec<BlockId>,
}

/// The loop nest of a function, plus the derived orderings the allocator needs.
#[derive(Clone, Debug, Default)]
pub struct LoopInfo {
  /// The loops, outer loops before the loops they contain.
  pub loops: IdxVec<LoopId, Loop>,
  innermost: IdxVec<BlockId, Option<LoopId>>,
  sorted_bbs: Vec<BlockId>,
}

/// Immediate dominators by the Cooper-Harvey-Kennedy iteration. Unreachable blocks get `None`;
/// the entry block is its own dominator.
#[must_use] pub fn dominators(code: &VCode) -> IdxVec<BlockId, Option<BlockId>> {
  let n = code.num_blocks();
  let mut idom: IdxVec<BlockId, Option<BlockId>> = IdxVec::from_default(n);
  if n == 0 { return idom }
  // reverse postorder, iteratively
  let mut rpo_num: IdxVec<BlockId, usize> = IdxVec::from_fn(n, || usize::MAX);
  let mut post = Vec::with_capacity(n);
  let mut visited = BitVec::from_elem(n, false);
  let entry = code.entry_block();
  let mut stack = vec![(entry, 0_usize)];
  visited.set(entry.index(), true);
  while let Some((bl, i)) = stack.pop() {
    if let Some(&s) = code.block_succs(bl).get(i) {
      stack.push((bl, i + 1));
      if !visited[s.index()] {
        visited.set(s.index(), true);
        stack.push((s, 0));
      }
    } else {
      post.push(bl)
    }
  }
  let rpo: Vec<_> = post.into_iter().rev().collect();
  for (i, &bl) in rpo.iter().enumerate() { rpo_num[bl] = i }
  idom[entry] = Some(entry);
  let intersect = |idom: &IdxVec<BlockId, Option<BlockId>>, mut a: BlockId, mut b: BlockId| {
    while a != b {
      while rpo_num[a] > rpo_num[b] { a = idom[a].unwrap_or(entry) }
      while rpo_num[b] > rpo_num[a] { b = idom[b].unwrap_or(entry) }
    }
    a
  };
  let mut changed = true;
  while changed {
    changed = false;
    for &bl in &rpo[1..] {
      let mut new = None;
      for &p in code.block_preds(bl) {
        if idom[p].is_none() { continue }
        new = Some(match new { None => p, Some(q) => intersect(&idom, p, q) });
      }
      if new.is_some() && idom[bl] != new { idom[bl] = new; changed = true }
    }
  }
  idom
}

fn dominates(idom: &IdxVec<BlockId, Option<BlockId>>, a: BlockId, mut b: BlockId) -> bool {
  loop {
    if a == b { return true }
    match idom[b] {
      Some(p) if p != b => b = p,
      _ => return false,
    }
  }
}

impl LoopInfo {
  /// Build the loop nest from loops described by the code generator, as
  /// `(header, member blocks)` pairs. Back edges are the member-to-header edges.
  #[must_use] pub fn new(code: &VCode, loops: impl IntoIterator<Item = (BlockId, Vec<BlockId>)>) -> Self {
    let n = code.num_blocks();
    let mut raw: Vec<(BlockId, BitSet<BlockId>)> = vec![];
    for (header, members) in loops {
      let mut set: BitSet<BlockId> = members.into_iter().collect();
      set.insert(header);
      if let Some((_, s)) = raw.iter_mut().find(|(h, _)| *h == header) {
        s.union_with(&set)
      } else {
        raw.push((header, set))
      }
    }
    // outer loops first
    raw.sort_by_key(|(h, s)| (std::cmp::Reverse(s.len()), h.index()));
    let mut out = Self { innermost: IdxVec::from_default(n), ..Self::default() };
    for (header, members) in raw {
      let parent = out.loops.0.iter().enumerate().rev()
        .find(|(_, l)| l.members.contains(header) && l.header != header)
        .map(|(id, _)| LoopId::from_usize(id));
      let depth = parent.map_or(1, |p| out.loops[p].depth + 1);
      let back_edge_srcs = code.block_preds(header).iter().copied()
        .filter(|&p| members.contains(p)).collect();
      let id = out.loops.push(Loop { header, members, parent, depth, back_edge_srcs });
      for bl in out.loops[id].members.iter() { out.innermost[bl] = Some(id) }
    }
    out.sorted_bbs = out.compute_sorted_bbs(code);
    out
  }

  /// Find the natural loops of the function.
  #[must_use] pub fn compute(code: &VCode) -> Self {
    let idom = dominators(code);
    let mut loops = vec![];
    for bl in code.block_ids() {
      if idom[bl].is_none() { continue }
      for &h in code.block_succs(bl) {
        if !dominates(&idom, h, bl) { continue }
        // natural loop of the back edge bl -> h
        let mut members = vec![h];
        let mut seen = BitVec::from_elem(code.num_blocks(), false);
        seen.set(h.index(), true);
        let mut stack = vec![bl];
        while let Some(b) = stack.pop() {
          if seen[b.index()] { continue }
          seen.set(b.index(), true);
          members.push(b);
          stack.extend(code.block_preds(b).iter().copied().filter(|p| idom[*p].is_some()));
        }
        loops.push((h, members));
      }
    }
    Self::new(code, loops)
  }

  /// Breadth-first from the entry, placing a block only once all of its forward
  /// (non-back-edge) predecessors are placed.
  fn compute_sorted_bbs(&self, code: &VCode) -> Vec<BlockId> {
    let n = code.num_blocks();
    let mut pending: IdxVec<BlockId, usize> = code.block_ids()
      .map(|bl| code.block_preds(bl).iter().filter(|&&p| !self.is_back_edge(p, bl)).count())
      .collect();
    let mut placed = BitVec::from_elem(n, false);
    let mut order = Vec::with_capacity(n);
    let mut queue = VecDeque::new();
    let mut next_unplaced = 0;
    if n > 0 { queue.push_back(code.entry_block()) }
    while order.len() < n {
      let bl = if let Some(bl) = queue.pop_front() { bl } else {
        // irreducible or unreachable: take the lowest unplaced block
        while placed[next_unplaced] { next_unplaced += 1 }
        BlockId::new(next_unplaced)
      };
      if placed[bl.index()] { continue }
      placed.set(bl.index(), true);
      order.push(bl);
      for &s in code.block_succs(bl) {
        if self.is_back_edge(bl, s) || placed[s.index()] { continue }
        pending[s] = pending[s].saturating_sub(1);
        if pending[s] == 0 { queue.push_back(s) }
      }
    }
    order
  }

  /// The innermost loop containing `bl`.
  #[must_use] pub fn innermost(&self, bl: BlockId) -> Option<LoopId> {
    self.innermost.get(bl).copied().flatten()
  }

  /// The loop nesting depth of `bl` (0 outside all loops).
  #[must_use] pub fn depth(&self, bl: BlockId) -> u32 {
    self.innermost(bl).map_or(0, |l| self.loops[l].depth)
  }

  /// Is `from -> to` a back edge of some loop?
  #[must_use] pub fn is_back_edge(&self, from: BlockId, to: BlockId) -> bool {
    self.loops.0.iter().any(|l| l.header == to && l.members.contains(from))
  }

  /// Is `bl` the source of a back edge?
  #[must_use] pub fn is_back_edge_src(&self, bl: BlockId) -> bool {
    self.loops.0.iter().any(|l| l.back_edge_srcs.contains(&bl))
  }

  /// The loops containing `bl`, innermost first.
  pub fn enclosing(&self, bl: BlockId) -> impl Iterator<Item = LoopId> + '_ {
    std::iter::successors(self.innermost(bl), |&l| self.loops[l].parent)
  }

  /// The block order used by the allocator.
  #[must_use] pub fn sorted_bbs(&self) -> &[BlockId] { &self.sorted_bbs }
}

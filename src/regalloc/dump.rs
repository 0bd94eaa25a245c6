//! Text dumps of the allocator state, for debugging.
//!
//! None of these affect the allocation; [`RaOptions::verbose`](super::RaOptions) only
//! controls whether they are logged.

use std::fmt::{Display, Write};

use itertools::Itertools;

use crate::Idx;
use crate::types::{IdxVec, vcode::BlockId};
use super::{BbAssignInfo, LiveRange, LrId};

/// Displays one live range on a single line, followed by its units.
#[derive(Copy, Clone, Debug)]
pub struct LrDisplay<'a>(pub LrId, pub &'a LiveRange);

impl Display for LrDisplay<'_> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let LrDisplay(id, lr) = *self;
    write!(f, "lr{} {} {:?} prio {}", id.0, lr.vreg, lr.bucket, lr.priority)?;
    match (lr.spilled, lr.assigned) {
      (true, _) => write!(f, " spilled")?,
      (false, Some(r)) => write!(f, " -> {r}")?,
      (false, None) => {}
    }
    if let Some(s) = lr.spill_mem { write!(f, " slot{}", s.0)? }
    if let Some(p) = lr.split_parent { write!(f, " split from lr{}", p.0)? }
    if let Some(c) = lr.split_lr { write!(f, " split to lr{}", c.0)? }
    if lr.caller_save { write!(f, " caller-save")? }
    if let Some(p) = lr.must_assign { write!(f, " must {p}")? }
    if !lr.prefs.is_empty() { write!(f, " prefs {}", lr.prefs)? }
    if !lr.pregveto.is_empty() { write!(f, " veto {}", lr.pregveto)? }
    if lr.crosses_call() { write!(f, " calls {}", lr.num_call)? }
    for (bl, lu) in &lr.lu_map {
      write!(f, "\n    bb{}: [{}, {}] d{} u{}", bl.index(), lu.begin, lu.end, lu.def_num, lu.use_num)?;
      if !lu.flags.is_empty() { write!(f, " {:?}", lu.flags)? }
    }
    Ok(())
  }
}

/// All live ranges, one per line.
#[must_use] pub fn dump_live_ranges(lrs: &IdxVec<LrId, LiveRange>) -> String {
  let mut s = String::new();
  for (id, lr) in lrs.enum_iter() {
    let _ = writeln!(s, "  {}", LrDisplay(id, lr));
  }
  s
}

/// The interference graph as adjacency lists of the global ranges.
#[must_use] pub fn dump_conflicts(lrs: &IdxVec<LrId, LiveRange>) -> String {
  let mut s = String::new();
  for (id, lr) in lrs.enum_iter() {
    if lr.local { continue }
    let _ = writeln!(s, "  lr{} {}: {}", id.0, lr.vreg,
      lr.conflict.iter().map(|n| format!("lr{}", n.0)).join(" "));
  }
  s
}

/// The per-block register bookkeeping.
#[must_use] pub fn dump_bb_assign_info(info: &IdxVec<BlockId, BbAssignInfo>) -> String {
  let mut s = String::new();
  for (bl, bi) in info.enum_iter() {
    let _ = write!(s, "  bb{}: globals {} locals needed {:?}", bl.into_usize(),
      bi.globals_assigned, bi.local_regs_needed);
    for iv in &bi.local_live {
      let _ = write!(s, " {}={}@[{}, {}]", iv.vreg, iv.reg, iv.begin, iv.end);
    }
    s.push('\n');
  }
  s
}

//! A graph-coloring global register allocator for an AArch64 code generator.
//!
//! The allocator consumes a [`VCode`] (a control flow graph of machine instructions over
//! virtual registers) and produces a [`PCode`] in which every operand names a physical
//! register, together with the spill and reload code needed where registers ran out.
//! See [`regalloc`] for an overview of the passes.

// rust lints we want
#![warn(
  bare_trait_objects,
  elided_lifetimes_in_paths,
  missing_copy_implementations,
  missing_debug_implementations,
  future_incompatible,
  rust_2018_idioms,
  trivial_numeric_casts,
  variant_size_differences,
  unreachable_pub,
  unused,
  missing_docs
)]
// all the clippy
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
// all the clippy::restriction lints we want
#![warn(
  clippy::float_arithmetic,
  clippy::get_unwrap,
  clippy::integer_division,
  clippy::rc_buffer,
  clippy::rest_pat_in_fully_bound_structs,
  clippy::string_add,
  clippy::unwrap_used,
)]
// all the clippy lints we don't want
#![allow(
  clippy::cognitive_complexity,
  clippy::comparison_chain,
  clippy::default_trait_access,
  clippy::enum_glob_use,
  clippy::inline_always,
  clippy::manual_map,
  clippy::map_err_ignore,
  clippy::match_bool,
  clippy::missing_const_for_fn,
  clippy::missing_errors_doc,
  clippy::missing_panics_doc,
  clippy::module_name_repetitions,
  clippy::multiple_crate_versions,
  clippy::option_if_let_else,
  clippy::redundant_pub_crate,
  clippy::semicolon_if_nothing_returned,
  clippy::shadow_unrelated,
  clippy::too_many_lines,
  clippy::use_self
)]

macro_rules! mk_id {($($(#[$attr:meta])* $id:ident),* $(,)?) => {$(
  $(#[$attr])*
  #[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
  pub struct $id(pub u32);
  impl $id {
    /// Generate a fresh variable from a `&mut ID` counter.
    #[must_use] #[inline] pub fn fresh(&mut self) -> Self {
      let n = *self;
      self.0 += 1;
      n
    }
  }
  impl From<$id> for usize {
    fn from(id: $id) -> usize { crate::u32_as_usize(id.0) }
  }
  impl crate::Idx for $id {
    fn into_usize(self) -> usize { self.into() }
    fn from_usize(n: usize) -> Self { $id(std::convert::TryFrom::try_from(n).expect("overflow")) }
  }
)*}}

pub mod types;
pub mod arch;
pub mod analysis;
pub mod regalloc;

pub use types::{Idx, IdxVec, BitSet, Size};
pub use types::vcode::{VCode, VReg, BlockId, InstId, IsReg, RegClass};
pub use arch::arm64::{PReg, PRegSet, MachineEnv, Inst, Opcode, Operand, OperandKind, Reg};
pub use regalloc::{GraphColorRegAllocator, RaOptions, RaOutput, RaError, PCode, regalloc_vcode};

/// Convert a `u32` to a `usize`. This is lossless on all supported targets.
#[inline]
#[must_use]
pub fn u32_as_usize(n: u32) -> usize {
  #[allow(clippy::cast_possible_truncation)]
  { n as usize }
}

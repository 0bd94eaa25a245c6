//! AArch64 register definitions.

use std::fmt::{Debug, Display};

use crate::types::vcode::{IsReg, RegClass};

/// A physical register: one of `x0`-`x30`, `sp`, or `v0`-`v31`.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PReg(pub regalloc2::PReg);

impl PReg {
  /// An integer register with hardware encoding `reg`.
  #[inline(always)]
  #[must_use] pub const fn new(reg: usize) -> Self {
    Self(regalloc2::PReg::new(reg, RegClass::Int))
  }

  /// A floating point / SIMD register with hardware encoding `reg`.
  #[inline(always)]
  #[must_use] pub const fn new_float(reg: usize) -> Self {
    Self(regalloc2::PReg::new(reg, RegClass::Float))
  }

  /// The hardware encoding of the register (0-31 within its class).
  #[inline(always)]
  #[must_use] pub fn index(self) -> u8 {
    #[allow(clippy::cast_possible_truncation)]
    { self.0.hw_enc() as u8 }
  }

  /// The register class.
  #[inline]
  #[must_use] pub fn class(self) -> RegClass { self.0.class() }

  /// The bit position of this register in a [`PRegSet`]: integer registers occupy
  /// bits 0-31 and floating point registers bits 32-63.
  #[inline]
  #[must_use] pub fn id(self) -> u32 {
    match self.class() {
      RegClass::Float => 32 + u32::from(self.index()),
      _ => u32::from(self.index()),
    }
  }

  /// The inverse of [`PReg::id`].
  #[must_use] pub fn from_id(id: u32) -> Self {
    let n = crate::u32_as_usize(id & 31);
    if id >= 32 { Self::new_float(n) } else { Self::new(n) }
  }
}

impl IsReg for PReg {
  fn invalid() -> Self { Self(regalloc2::PReg::invalid()) }
}

impl Display for PReg {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if !self.is_valid() { return write!(f, "<invalid>") }
    match (self.class(), self.index()) {
      (RegClass::Float, n) => write!(f, "v{n}"),
      (_, 31) => write!(f, "sp"),
      (_, 30) => write!(f, "lr"),
      (_, 29) => write!(f, "fp"),
      (_, n) => write!(f, "x{n}"),
    }
  }
}

impl Debug for PReg {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { Display::fmt(self, f) }
}

macro_rules! regs {($($name:ident = $ctor:ident($n:expr)),* $(,)?) => {$(
  #[allow(missing_docs)] pub const $name: PReg = PReg::$ctor($n);
)*}}

regs! {
  X0 = new(0), X1 = new(1), X2 = new(2), X3 = new(3),
  X4 = new(4), X5 = new(5), X6 = new(6), X7 = new(7),
  X8 = new(8), X9 = new(9), X10 = new(10), X11 = new(11),
  X12 = new(12), X13 = new(13), X14 = new(14), X15 = new(15),
  X16 = new(16), X17 = new(17), X18 = new(18), X19 = new(19),
  X20 = new(20), X21 = new(21), X22 = new(22), X23 = new(23),
  X24 = new(24), X25 = new(25), X26 = new(26), X27 = new(27),
  X28 = new(28), X29 = new(29), X30 = new(30),
  V0 = new_float(0), V1 = new_float(1), V2 = new_float(2), V3 = new_float(3),
  V4 = new_float(4), V5 = new_float(5), V6 = new_float(6), V7 = new_float(7),
  V8 = new_float(8), V9 = new_float(9), V10 = new_float(10), V11 = new_float(11),
  V12 = new_float(12), V13 = new_float(13), V14 = new_float(14), V15 = new_float(15),
  V16 = new_float(16), V17 = new_float(17), V18 = new_float(18), V19 = new_float(19),
  V20 = new_float(20), V21 = new_float(21), V22 = new_float(22), V23 = new_float(23),
  V24 = new_float(24), V25 = new_float(25), V26 = new_float(26), V27 = new_float(27),
  V28 = new_float(28), V29 = new_float(29), V30 = new_float(30), V31 = new_float(31),
}

/// Frame pointer.
pub const FP: PReg = X29;
/// Link register.
pub const LR: PReg = X30;
/// Stack pointer (encoding 31 when used as a base register).
pub const SP: PReg = PReg::new(31);
/// The intra-procedure-call scratch register, used to materialize out-of-range spill offsets.
pub const IP0: PReg = X16;
/// The platform register.
pub const PLATFORM: PReg = X18;

/// A set of physical registers, as a 64-bit mask indexed by [`PReg::id`].
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct PRegSet(pub u64);

impl PRegSet {
  /// The empty set.
  pub const EMPTY: Self = Self(0);

  /// All integer registers.
  pub const INT: Self = Self(0xffff_ffff);

  /// All floating point registers.
  pub const FLOAT: Self = Self(0xffff_ffff_0000_0000);

  /// All registers of the given class.
  #[must_use] pub fn of_class(class: RegClass) -> Self {
    match class {
      RegClass::Float => Self::FLOAT,
      _ => Self::INT,
    }
  }

  /// Add a register to the set.
  #[inline] pub fn insert(&mut self, r: PReg) { self.0 |= 1 << r.id() }

  /// Remove a register from the set.
  #[inline] pub fn remove(&mut self, r: PReg) { self.0 &= !(1 << r.id()) }

  /// Is `r` in the set?
  #[inline] #[must_use] pub fn get(self, r: PReg) -> bool { self.0 & (1 << r.id()) != 0 }

  /// The number of registers in the set.
  #[inline] #[must_use] pub fn len(self) -> u32 { self.0.count_ones() }

  /// Is the set empty?
  #[inline] #[must_use] pub fn is_empty(self) -> bool { self.0 == 0 }

  /// Set union.
  #[inline] #[must_use] pub fn union(self, other: Self) -> Self { Self(self.0 | other.0) }

  /// Set intersection.
  #[inline] #[must_use] pub fn inter(self, other: Self) -> Self { Self(self.0 & other.0) }

  /// Set difference.
  #[inline] #[must_use] pub fn minus(self, other: Self) -> Self { Self(self.0 & !other.0) }

  /// Do the sets share a register?
  #[inline] #[must_use] pub fn intersects(self, other: Self) -> bool { self.0 & other.0 != 0 }

  /// The registers of the set, in increasing [`PReg::id`] order.
  pub fn iter(self) -> impl DoubleEndedIterator<Item = PReg> + Clone {
    (0..64).filter(move |&i| self.0 & (1 << i) != 0).map(PReg::from_id)
  }
}

impl FromIterator<PReg> for PRegSet {
  fn from_iter<T: IntoIterator<Item = PReg>>(iter: T) -> Self {
    let mut out = Self::default();
    for r in iter { out.insert(r) }
    out
  }
}

impl Debug for PRegSet {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_set().entries(self.iter()).finish()
  }
}

impl Display for PRegSet {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{{{}}}", itertools::Itertools::join(&mut self.iter(), ", "))
  }
}

//! Types shared by the analyses and the allocator.

pub mod vcode;

use std::fmt::Debug;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// A trait for newtyped integers, that can be used as index types in vectors and sets.
pub trait Idx: Copy + Eq {
  /// Convert from `T` to `usize`
  fn into_usize(self) -> usize;
  /// Convert from `usize` to `T`
  fn from_usize(_: usize) -> Self;
}

impl Idx for usize {
  fn into_usize(self) -> usize { self }
  fn from_usize(n: usize) -> Self { n }
}

/// A vector indexed by a custom indexing type `I`, usually a newtyped integer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdxVec<I, T>(pub Vec<T>, PhantomData<I>);

impl<I, T> IdxVec<I, T> {
  /// Construct a new empty [`IdxVec`].
  #[must_use] pub const fn new() -> Self { Self(vec![], PhantomData) }

  /// Construct a new [`IdxVec`] with the specified capacity.
  #[must_use] pub fn with_capacity(capacity: usize) -> Self { Vec::with_capacity(capacity).into() }

  /// Construct a new [`IdxVec`] by calling the specified function.
  #[must_use] pub fn from_fn(size: usize, f: impl FnMut() -> T) -> Self {
    Self::from(std::iter::repeat_with(f).take(size).collect::<Vec<_>>())
  }

  /// Construct a new [`IdxVec`] using the default element `size` times.
  #[must_use] pub fn from_default(size: usize) -> Self where T: Default {
    Self::from_fn(size, T::default)
  }

  /// The number of elements in the [`IdxVec`].
  #[must_use] pub fn len(&self) -> usize { self.0.len() }

  /// Insert a new value at the end of the vector.
  pub fn push(&mut self, val: T) -> I where I: Idx {
    let id = I::from_usize(self.0.len());
    self.0.push(val);
    id
  }

  /// Get a reference to the element at the given index, if it is in range.
  #[must_use] pub fn get(&self, i: I) -> Option<&T> where I: Idx { self.0.get(i.into_usize()) }

  /// An iterator including the indexes, like `iter().enumerate()`.
  pub fn enum_iter(&self) -> impl Iterator<Item = (I, &T)> where I: Idx {
    self.0.iter().enumerate().map(|(n, val)| (I::from_usize(n), val))
  }

  /// An iterator including the indexes, like `iter_mut().enumerate()`.
  pub fn enum_iter_mut(&mut self) -> impl Iterator<Item = (I, &mut T)> where I: Idx {
    self.0.iter_mut().enumerate().map(|(n, val)| (I::from_usize(n), val))
  }

  /// An iterator over the indexes of the vector.
  pub fn ids(&self) -> impl Iterator<Item = I> + use<I, T> where I: Idx {
    (0..self.0.len()).map(I::from_usize)
  }

  /// Returns `true` if the vector contains no elements.
  #[must_use] pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl<I, T> From<Vec<T>> for IdxVec<I, T> {
  fn from(vec: Vec<T>) -> Self { Self(vec, PhantomData) }
}

impl<I, T> std::iter::FromIterator<T> for IdxVec<I, T> {
  fn from_iter<J: IntoIterator<Item = T>>(iter: J) -> Self { Vec::from_iter(iter).into() }
}

impl<I, T> Default for IdxVec<I, T> {
  fn default() -> Self { vec![].into() }
}

impl<I: Idx, T> Index<I> for IdxVec<I, T> {
  type Output = T;
  fn index(&self, index: I) -> &Self::Output { &self.0[I::into_usize(index)] }
}

impl<I: Idx, T> IndexMut<I> for IdxVec<I, T> {
  fn index_mut(&mut self, index: I) -> &mut Self::Output { &mut self.0[I::into_usize(index)] }
}

/// A dense set of indexes of type `I`, backed by a bit vector.
#[derive(Clone, PartialEq, Eq)]
pub struct BitSet<I>(bit_set::BitSet, PhantomData<I>);

impl<I> Default for BitSet<I> {
  fn default() -> Self { Self(bit_set::BitSet::new(), PhantomData) }
}

impl<I: Idx> BitSet<I> {
  /// Construct an empty set with room for indexes below `n` without reallocating.
  #[must_use] pub fn with_capacity(n: usize) -> Self {
    Self(bit_set::BitSet::with_capacity(n), PhantomData)
  }

  /// Add `i` to the set. Returns true if it was not already present.
  pub fn insert(&mut self, i: I) -> bool { self.0.insert(i.into_usize()) }

  /// Remove `i` from the set. Returns true if it was present.
  pub fn remove(&mut self, i: I) -> bool { self.0.remove(i.into_usize()) }

  /// Is `i` in the set?
  #[must_use] pub fn contains(&self, i: I) -> bool { self.0.contains(i.into_usize()) }

  /// The number of elements in the set.
  #[must_use] pub fn len(&self) -> usize { self.0.len() }

  /// Is the set empty?
  #[must_use] pub fn is_empty(&self) -> bool { self.0.is_empty() }

  /// Remove all elements.
  pub fn clear(&mut self) { self.0.clear() }

  /// Iterate over the elements in increasing order.
  pub fn iter(&self) -> impl Iterator<Item = I> + '_ { self.0.iter().map(I::from_usize) }

  /// Add all elements of `other` to this set.
  pub fn union_with(&mut self, other: &Self) { self.0.union_with(&other.0) }

  /// Remove all elements of `other` from this set.
  pub fn difference_with(&mut self, other: &Self) { self.0.difference_with(&other.0) }

  /// Keep only the elements that are also in `other`.
  pub fn intersect_with(&mut self, other: &Self) { self.0.intersect_with(&other.0) }

  /// Do the two sets share an element?
  #[must_use] pub fn intersects(&self, other: &Self) -> bool { !self.0.is_disjoint(&other.0) }
}

impl<I: Idx> FromIterator<I> for BitSet<I> {
  fn from_iter<T: IntoIterator<Item = I>>(iter: T) -> Self {
    let mut out = Self::default();
    for i in iter { out.insert(i); }
    out
  }
}

impl<I: Idx + Debug> Debug for BitSet<I> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_set().entries(self.iter()).finish()
  }
}

/// Register widths. Spill slots are sized by these.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Size {
  /// 32 bits, or 4 bytes. Used for `w` and `s` registers.
  S32,
  /// 64 bits, or 8 bytes. Used for `x` and `d` registers.
  #[default]
  S64,
}

impl Size {
  /// The number of bits of this size.
  #[must_use] pub fn bits(self) -> u8 {
    match self {
      Size::S32 => 32,
      Size::S64 => 64,
    }
  }

  /// The number of bytes of this size.
  #[must_use] pub fn bytes(self) -> u8 {
    match self {
      Size::S32 => 4,
      Size::S64 => 8,
    }
  }
}

// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Morton (Z-order) codes over the store's fixed world lattice.
//!
//! Bit `3k + a` of a code holds bit `k` of axis `a` (x = 0, y = 1, z = 2),
//! so lexicographic order on codes equals depth-first octree order, and the
//! three bits at `3 * lod` select the child cell at that level of detail.

mod codec;

pub use codec::{compact_by_3, spread_by_3};

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// A Morton code of `N` 64-bit words, least significant word first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Morton<const N: usize>(pub [u64; N]);

impl<const N: usize> Default for Morton<N> {
    fn default() -> Self {
        Self::ZERO
    }
}

/// 64-bit Morton code, 22/21/21 bits per axis
pub type Morton64 = Morton<1>;

/// 128-bit Morton code, 43/43/42 bits per axis
pub type Morton128 = Morton<2>;

/// 192-bit Morton code, 64 bits per axis
pub type Morton192 = Morton<3>;

impl<const N: usize> Morton<N> {
    /// The all-zero code.
    pub const ZERO: Self = Self([0; N]);

    /// The all-ones code.
    pub const MAX: Self = Self([u64::MAX; N]);

    /// Returns `true` if no bit is set.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// Bit index of the most significant set bit (0 for the zero code).
    #[must_use]
    pub fn msb(&self) -> u32 {
        for (idx, word) in self.0.iter().enumerate().rev() {
            if *word != 0 {
                #[allow(clippy::cast_possible_truncation)]
                return (idx as u32) * 64 + (63 - word.leading_zeros());
            }
        }
        0
    }

    /// The level of detail at which `self` and `other` first differ.
    #[must_use]
    pub fn first_differing_lod(&self, other: &Self) -> u32 {
        lod_from_bit_index((*self ^ *other).msb())
    }

    /// Extracts the 3-bit child index at the given level of detail.
    #[must_use]
    pub fn child_at(&self, lod: u32) -> u8 {
        let idx = 3 * lod as usize;
        debug_assert!(idx + 3 <= N * 64, "lod out of range");
        let word = idx / 64;
        let shift = idx % 64;
        let mut v = self.0[word] >> shift;
        if shift > 61 && word + 1 < N {
            v |= self.0[word + 1] << (64 - shift);
        }

        #[allow(clippy::cast_possible_truncation)]
        let child = (v & 0x7) as u8;
        child
    }

    /// Overwrites the 3-bit child index at the given level of detail.
    pub fn set_child_at(&mut self, lod: u32, child: u8) {
        debug_assert!(child < 8);
        let idx = 3 * lod as usize;
        debug_assert!(idx + 3 <= N * 64, "lod out of range");
        let word = idx / 64;
        let shift = idx % 64;

        self.0[word] &= !(0x7u64 << shift);
        self.0[word] |= u64::from(child) << shift;

        if shift > 61 && word + 1 < N {
            let spill = 64 - shift;
            self.0[word + 1] &= !(0x7u64 >> spill);
            self.0[word + 1] |= u64::from(child) >> spill;
        }
    }

    /// A mask covering all bits up to and including the given level of detail
    /// (the low `3 * lod + 3` bits).
    #[must_use]
    pub fn mask_for_lod(lod: u32) -> Self {
        let bits = 3 * lod as usize + 3;
        let mut words = [0u64; N];
        for (idx, word) in words.iter_mut().enumerate() {
            let lo = idx * 64;
            if bits >= lo + 64 {
                *word = u64::MAX;
            } else if bits > lo {
                *word = (1u64 << (bits - lo)) - 1;
            }
        }
        Self(words)
    }

    /// Adds one, wrapping on overflow of the widest word.
    #[must_use]
    pub fn add_one(mut self) -> Self {
        for word in &mut self.0 {
            let (next, carry) = word.overflowing_add(1);
            *word = next;
            if !carry {
                break;
            }
        }
        self
    }

    /// Truncates to a narrower code by dropping high words.
    #[must_use]
    pub fn downcast<const M: usize>(&self) -> Morton<M> {
        debug_assert!(M <= N);
        let mut words = [0u64; M];
        for (idx, word) in words.iter_mut().enumerate() {
            *word = self.0[idx];
        }
        Morton(words)
    }

    /// Widens to a larger code, taking the high words from a reference
    /// minimum. Inverse of [`Self::downcast`] whenever the original's high
    /// words match the reference's.
    #[must_use]
    pub fn upcast<const M: usize>(&self, reference_min: &Morton<M>) -> Morton<M> {
        debug_assert!(M >= N);
        let mut words = reference_min.0;
        for (idx, word) in self.0.iter().enumerate() {
            words[idx] = *word;
        }
        Morton(words)
    }
}

impl<const N: usize> PartialOrd for Morton<N> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<const N: usize> Ord for Morton<N> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        for idx in (0..N).rev() {
            match self.0[idx].cmp(&other.0[idx]) {
                std::cmp::Ordering::Equal => {}
                ord => return ord,
            }
        }
        std::cmp::Ordering::Equal
    }
}

impl<const N: usize> std::ops::BitXor for Morton<N> {
    type Output = Self;

    fn bitxor(mut self, rhs: Self) -> Self {
        for (word, other) in self.0.iter_mut().zip(rhs.0) {
            *word ^= other;
        }
        self
    }
}

impl<const N: usize> std::ops::BitAnd for Morton<N> {
    type Output = Self;

    fn bitand(mut self, rhs: Self) -> Self {
        for (word, other) in self.0.iter_mut().zip(rhs.0) {
            *word &= other;
        }
        self
    }
}

impl<const N: usize> std::ops::BitOr for Morton<N> {
    type Output = Self;

    fn bitor(mut self, rhs: Self) -> Self {
        for (word, other) in self.0.iter_mut().zip(rhs.0) {
            *word |= other;
        }
        self
    }
}

impl<const N: usize> std::ops::Not for Morton<N> {
    type Output = Self;

    fn not(mut self) -> Self {
        for word in &mut self.0 {
            *word = !*word;
        }
        self
    }
}

impl<const N: usize> std::fmt::Display for Morton<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "m[")?;
        for idx in (0..N).rev() {
            write!(f, "{:016x}", self.0[idx])?;
        }
        write!(f, "]")
    }
}

impl<const N: usize> Encode for Morton<N> {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        for word in &self.0 {
            writer.write_u64::<LittleEndian>(*word)?;
        }
        Ok(())
    }
}

impl<const N: usize> Decode for Morton<N> {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut words = [0u64; N];
        for word in &mut words {
            *word = reader.read_u64::<LittleEndian>()?;
        }
        Ok(Self(words))
    }
}

/// Level of detail a bit index belongs to.
#[must_use]
pub const fn lod_from_bit_index(index: u32) -> u32 {
    index / 3
}

/// Magnitude (group of five LODs) a level of detail belongs to.
#[must_use]
pub const fn magnitude_from_lod(lod: u32) -> u32 {
    lod / 5
}

/// The coarsest level of detail a tree of the given magnitude covers.
#[must_use]
pub const fn magnitude_to_lod(magnitude: u32) -> u32 {
    magnitude * 5 + 4
}

/// Converts a level inside a tree (0 = coarsest of five) to a lattice LOD.
#[must_use]
pub const fn tree_level_to_lod(magnitude: u32, level: u32) -> u32 {
    debug_assert!(level < 5);
    magnitude_to_lod(magnitude) - level
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn ordering_compares_high_words_first() {
        let a = Morton::<3>([5, 0, 0]);
        let b = Morton::<3>([0, 1, 0]);
        let c = Morton::<3>([0, 0, 1]);
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn msb_across_words() {
        assert_eq!(Morton::<3>([0, 0, 0]).msb(), 0);
        assert_eq!(Morton::<3>([1, 0, 0]).msb(), 0);
        assert_eq!(Morton::<3>([0b1000, 0, 0]).msb(), 3);
        assert_eq!(Morton::<3>([0, 1, 0]).msb(), 64);
        assert_eq!(Morton::<3>([0, 0, 1 << 63]).msb(), 191);
    }

    #[test]
    fn first_differing_lod_matches_msb_of_xor() {
        let a = Morton::<3>([0b111, 0, 0]);
        let b = Morton::<3>([0b000, 0, 0]);
        assert_eq!(a.first_differing_lod(&b), 0);

        let a = Morton::<3>([1 << 63, 0, 0]);
        let b = Morton::<3>([0, 0, 0]);
        assert_eq!(a.first_differing_lod(&b), 21);

        let a = Morton::<3>([0, 1, 0]);
        assert_eq!(a.first_differing_lod(&b), 21);
    }

    #[test]
    fn child_bits_straddle_word_boundary() {
        // lod 21 covers bits 63..66
        let mut m = Morton192::ZERO;
        m.set_child_at(21, 0b101);
        assert_eq!(m.0[0], 1 << 63);
        assert_eq!(m.0[1], 0b10);
        assert_eq!(m.child_at(21), 0b101);

        m.set_child_at(21, 0b010);
        assert_eq!(m.0[0], 0);
        assert_eq!(m.0[1], 0b01);
        assert_eq!(m.child_at(21), 0b010);
    }

    #[test]
    fn mask_covers_low_bits() {
        assert_eq!(Morton64::mask_for_lod(0).0, [0b111]);
        assert_eq!(Morton64::mask_for_lod(20).0, [(1 << 63) - 1]);
        assert_eq!(Morton192::mask_for_lod(21).0, [u64::MAX, 0b11, 0]);
        assert_eq!(Morton192::mask_for_lod(63).0, [u64::MAX; 3]);
    }

    #[test]
    fn add_one_carries() {
        let m = Morton::<3>([u64::MAX, u64::MAX, 0]).add_one();
        assert_eq!(m.0, [0, 0, 1]);
    }

    #[test]
    fn up_down_cast_roundtrip() {
        let reference = Morton::<3>([0, 77, 78]);
        let m = Morton::<3>([1234, 77, 78]);
        let narrow: Morton64 = m.downcast();
        assert_eq!(narrow.0, [1234]);
        assert_eq!(narrow.upcast(&reference), m);
    }

    #[test]
    fn coding_roundtrip() {
        use crate::coding::{Decode, Encode};
        let m = Morton::<3>([3, 2, 1]);
        let bytes = m.encode_into_vec();
        assert_eq!(bytes.len(), 24);
        let back = Morton192::decode_from(&mut &bytes[..]).expect("decodes");
        assert_eq!(back, m);
    }
}

//! Packet sequence numbers.
//!
//! Sequence numbers live in a 31-bit space and wrap. Ordering between two
//! sequence numbers is only meaningful through the signed difference of
//! [`Psn::diff`], which is valid as long as the two values are less than
//! 2^30 apart.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of significant bits in a sequence number.
pub const PSN_BITS: u32 = 31;
/// Mask applied to every sequence number.
pub const PSN_MASK: u32 = (1u32 << PSN_BITS) - 1;

/// A 31-bit wrapping packet sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Psn(u32);

impl Psn {
    /// Creates a sequence number, masking to 31 bits.
    pub const fn new(value: u32) -> Self {
        Self(value & PSN_MASK)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        self.add(1)
    }

    pub fn prev(self) -> Self {
        self.sub(1)
    }

    pub fn add(self, n: u32) -> Self {
        Self::new(self.0.wrapping_add(n))
    }

    pub fn sub(self, n: u32) -> Self {
        Self::new(self.0.wrapping_sub(n))
    }

    /// Signed distance `self - other`, sign-extended from 31 bits.
    pub fn diff(self, other: Psn) -> i32 {
        let d = self.0.wrapping_sub(other.0) & PSN_MASK;
        ((d << 1) as i32) >> 1
    }

    pub fn is_after(self, other: Psn) -> bool {
        self.diff(other) > 0
    }

    pub fn is_before(self, other: Psn) -> bool {
        self.diff(other) < 0
    }

    pub fn is_at_or_before(self, other: Psn) -> bool {
        self.diff(other) <= 0
    }

    /// Low bits used to jitter credit adjustments.
    pub fn low_bits(self, mask: u32) -> u32 {
        self.0 & mask
    }
}

impl fmt::Display for Psn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether `x` lies in the circular closed range `[first, last]`.
pub fn between(first: Psn, last: Psn, x: Psn) -> bool {
    if last.0 >= first.0 {
        x.0 >= first.0 && x.0 <= last.0
    } else {
        x.0 >= first.0 || x.0 <= last.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masking() {
        assert_eq!(Psn::new(u32::MAX).value(), PSN_MASK);
        assert_eq!(Psn::new(PSN_MASK).next().value(), 0);
        assert_eq!(Psn::new(0).prev().value(), PSN_MASK);
    }

    #[test]
    fn test_diff_across_wrap() {
        let a = Psn::new(PSN_MASK - 2);
        let b = a.add(5);
        assert_eq!(b.value(), 2);
        assert_eq!(b.diff(a), 5);
        assert_eq!(a.diff(b), -5);
        assert!(b.is_after(a));
        assert!(a.is_before(b));
        assert!(a.is_at_or_before(a));
    }

    #[test]
    fn test_between() {
        let first = Psn::new(10);
        let last = Psn::new(20);
        assert!(between(first, last, Psn::new(10)));
        assert!(between(first, last, Psn::new(20)));
        assert!(!between(first, last, Psn::new(21)));

        let first = Psn::new(PSN_MASK - 1);
        let last = Psn::new(3);
        assert!(between(first, last, Psn::new(PSN_MASK)));
        assert!(between(first, last, Psn::new(0)));
        assert!(!between(first, last, Psn::new(4)));
    }

    #[test]
    fn test_low_bits() {
        assert_eq!(Psn::new(0x1234).low_bits(0xF), 4);
    }

    proptest::proptest! {
        #[test]
        fn prop_between_matches_diff(start in 0u32..=PSN_MASK, len in 0u32..1024, off in 0u32..2048) {
            let first = Psn::new(start);
            let last = first.add(len);
            let x = first.add(off);
            proptest::prop_assert_eq!(between(first, last, x), off <= len);
            proptest::prop_assert_eq!(x.diff(first), off as i32);
        }
    }
}

//! Virtual address type for emulation-assisted analysis.
//!
//! A `VirtualAddress` identifies a location in the analyzed program's logical
//! address space. Ordering is numeric and equality is exact; the type carries
//! no bit width, since the architecture is tracked by the decoder and emulator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// A location in the target address space.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    /// Create a new virtual address.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw numeric value.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Add a byte offset, returning `None` on overflow.
    pub fn checked_add(&self, offset: u64) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }

    /// Subtract a byte offset, returning `None` on underflow.
    pub fn checked_sub(&self, offset: u64) -> Option<Self> {
        self.0.checked_sub(offset).map(Self)
    }

    /// Add a signed delta with wrapping semantics (stack pointer arithmetic).
    pub fn wrapping_offset(&self, delta: i64) -> Self {
        Self(self.0.wrapping_add(delta as u64))
    }

    /// Signed distance `self - origin`, interpreting the difference in two's complement.
    pub fn signed_distance_from(&self, origin: VirtualAddress) -> i64 {
        self.0.wrapping_sub(origin.0) as i64
    }
}

impl From<u64> for VirtualAddress {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<VirtualAddress> for u64 {
    fn from(va: VirtualAddress) -> Self {
        va.0
    }
}

impl Add<u64> for VirtualAddress {
    type Output = VirtualAddress;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<VirtualAddress> for VirtualAddress {
    type Output = u64;

    fn sub(self, rhs: VirtualAddress) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_numeric() {
        let a = VirtualAddress(0x401000);
        let b = VirtualAddress(0x401005);
        assert!(a < b);
        assert_eq!(b - a, 5);
        assert_eq!(a + 5, b);
    }

    #[test]
    fn test_display_hex() {
        assert_eq!(VirtualAddress(0x1000).to_string(), "0x1000");
        assert_eq!(format!("{:x}", VirtualAddress(0xbeef)), "beef");
    }

    #[test]
    fn test_signed_distance() {
        let entry = VirtualAddress(0x7fff_0000);
        let lower = entry.wrapping_offset(-16);
        assert_eq!(lower.signed_distance_from(entry), -16);
        assert_eq!(entry.signed_distance_from(lower), 16);
    }

    #[test]
    fn test_checked_arithmetic() {
        assert_eq!(VirtualAddress(u64::MAX).checked_add(1), None);
        assert_eq!(VirtualAddress(0).checked_sub(1), None);
        assert_eq!(VirtualAddress(8).checked_sub(8), Some(VirtualAddress(0)));
    }

    #[test]
    fn test_serde_transparent() {
        let json = serde_json::to_string(&VirtualAddress(4096)).unwrap();
        assert_eq!(json, "4096");
        let back: VirtualAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, VirtualAddress(4096));
    }
}

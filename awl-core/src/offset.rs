//! Byte/bit addresses
//!
//! An [`Offset`] is always normalized: the bit part is in `0..=7` and any
//! arithmetic carries across the byte boundary.

use crate::constants::{MAX_BYTE_OFFSET, POINTER_OFFSET_MASK};
use awl_common::{AwlError, AwlResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Offset {
    pub byte: u32,
    pub bit: u8,
}

impl Offset {
    /// Create an offset. Bit values above 7 carry into the byte part.
    pub fn new(byte: u32, bit: u8) -> Self {
        Self::from_bits(u64::from(byte) * 8 + u64::from(bit))
    }

    pub fn byte(byte: u32) -> Self {
        Self { byte, bit: 0 }
    }

    /// Build an offset from an absolute bit count
    pub fn from_bits(bits: u64) -> Self {
        Self {
            byte: (bits / 8) as u32,
            bit: (bits % 8) as u8,
        }
    }

    pub fn to_bits(&self) -> u64 {
        u64::from(self.byte) * 8 + u64::from(self.bit)
    }

    pub fn add_bits(&self, bits: u64) -> Self {
        Self::from_bits(self.to_bits() + bits)
    }

    pub fn add_bytes(&self, bytes: u32) -> Self {
        Self {
            byte: self.byte + bytes,
            bit: self.bit,
        }
    }

    /// Decode the byte/bit part of a 32-bit area pointer
    pub fn from_pointer_value(value: u32) -> Self {
        Self {
            byte: (value & POINTER_OFFSET_MASK) >> 3,
            bit: (value & 7) as u8,
        }
    }

    /// Encode as the byte/bit part of a 32-bit area pointer (no area code)
    pub fn to_pointer_value(&self) -> AwlResult<u32> {
        if self.byte > MAX_BYTE_OFFSET {
            return Err(AwlError::compile(format!(
                "Byte offset {} does not fit into a pointer (max {})",
                self.byte, MAX_BYTE_OFFSET
            )));
        }
        Ok(((self.byte << 3) & POINTER_OFFSET_MASK) | u32::from(self.bit & 7))
    }
}

impl Add for Offset {
    type Output = Offset;

    fn add(self, other: Offset) -> Offset {
        Offset::from_bits(self.to_bits() + other.to_bits())
    }
}

impl AddAssign for Offset {
    fn add_assign(&mut self, other: Offset) {
        *self = *self + other;
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.byte, self.bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_add_carries_bits() {
        assert_eq!(Offset::new(1, 6) + Offset::new(0, 3), Offset::new(2, 1));
        assert_eq!(Offset::new(0, 7) + Offset::new(0, 1), Offset::new(1, 0));

        let mut off = Offset::new(10, 4);
        off += Offset::new(1, 4);
        assert_eq!(off, Offset::new(12, 0));
    }

    #[test]
    fn test_new_normalizes() {
        assert_eq!(Offset::new(3, 9), Offset { byte: 4, bit: 1 });
    }

    #[test]
    fn test_pointer_value() {
        let off = Offset::new(4, 0);
        assert_eq!(off.to_pointer_value().expect("Should pack"), 32);
        assert_eq!(Offset::from_pointer_value(0x8300_0023), Offset::new(4, 3));

        let err = Offset::byte(0x10000).to_pointer_value();
        assert!(matches!(err, Err(AwlError::Compile { .. })));
    }

    #[test]
    fn test_display() {
        assert_eq!(Offset::new(12, 3).to_string(), "12.3");
    }
}

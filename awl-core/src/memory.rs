//! Fixed-size, big-endian memory areas
//!
//! Scalar widths (1, 8, 16, 24, 32, 48 bit) are fetched as [`Value::Scalar`].
//! Other byte-multiple widths are fetched as raw byte ranges.

use crate::offset::Offset;
use awl_common::{AwlError, AwlResult};
use std::fmt;

/// A width-tagged memory value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Scalar { width: u32, bits: u64 },
    Bytes(Vec<u8>),
}

impl Value {
    /// Create a scalar, masking `bits` down to `width`
    pub fn scalar(width: u32, bits: u64) -> Self {
        let mask = if width >= 64 {
            u64::MAX
        } else {
            (1u64 << width) - 1
        };
        Value::Scalar {
            width,
            bits: bits & mask,
        }
    }

    pub fn bit(b: bool) -> Self {
        Value::Scalar {
            width: 1,
            bits: u64::from(b),
        }
    }

    pub fn width(&self) -> u32 {
        match self {
            Value::Scalar { width, .. } => *width,
            Value::Bytes(bytes) => bytes.len() as u32 * 8,
        }
    }

    /// Scalar value, or the big-endian interpretation of up to 8 bytes
    pub fn as_u64(&self) -> u64 {
        match self {
            Value::Scalar { bits, .. } => *bits,
            Value::Bytes(bytes) => bytes[bytes.len().saturating_sub(8)..]
                .iter()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
        }
    }

    pub fn as_u32(&self) -> u32 {
        (self.as_u64() & 0xFFFF_FFFF) as u32
    }

    pub fn as_bool(&self) -> bool {
        self.as_u64() & 1 != 0
    }

    /// Big-endian bytes of this value (`width / 8` bytes, at least one)
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Bytes(bytes) => bytes.clone(),
            Value::Scalar { width, bits } => {
                let count = (*width as usize).div_ceil(8).max(1);
                (0..count)
                    .map(|i| ((bits >> ((count - 1 - i) * 8)) & 0xFF) as u8)
                    .collect()
            }
        }
    }

    /// Reinterpret as `width` bits. Scalars are truncated or zero-extended.
    pub fn resized(&self, width: u32) -> Value {
        if width <= 64 && is_scalar_width(width) {
            return Value::scalar(width, self.as_u64());
        }
        let count = (width as usize).div_ceil(8);
        let mut bytes = self.to_bytes();
        if bytes.len() > count {
            bytes.truncate(count);
        } else {
            bytes.resize(count, 0);
        }
        Value::Bytes(bytes)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar { width: 1, bits } => write!(f, "{}", bits),
            Value::Scalar { width, bits } => {
                write!(f, "{:0w$X}", bits, w = (*width as usize).div_ceil(4))
            }
            Value::Bytes(bytes) => write!(f, "{}", hex::encode_upper(bytes)),
        }
    }
}

pub fn is_scalar_width(width: u32) -> bool {
    matches!(width, 1 | 8 | 16 | 24 | 32 | 48)
}

/// A memory area (process image, flags, local stack, DB image)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn clear(&mut self) {
        self.data.iter_mut().for_each(|b| *b = 0);
    }

    fn check_range(&self, op: &str, offset: Offset, byte_count: usize) -> AwlResult<usize> {
        let start = offset.byte as usize;
        match start.checked_add(byte_count) {
            Some(end) if end <= self.data.len() => Ok(start),
            _ => Err(AwlError::fault(format!(
                "{}: Operator offset '{}' out of range",
                op, offset
            ))),
        }
    }

    /// Fetch `width` bits at `offset`. The bit part of the offset only
    /// matters for 1-bit accesses.
    pub fn fetch(&self, offset: Offset, width: u32) -> AwlResult<Value> {
        if width == 1 {
            let start = self.check_range("fetch", offset, 1)?;
            let bit = (self.data[start] >> offset.bit) & 1;
            return Ok(Value::bit(bit != 0));
        }
        if width == 0 || width % 8 != 0 {
            return Err(AwlError::fault(format!(
                "fetch: Invalid width {} bits",
                width
            )));
        }
        let count = (width / 8) as usize;
        let start = self.check_range("fetch", offset, count)?;
        let bytes = &self.data[start..start + count];
        if is_scalar_width(width) {
            let bits = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            Ok(Value::Scalar { width, bits })
        } else {
            Ok(Value::Bytes(bytes.to_vec()))
        }
    }

    /// Store `value` at `offset`. Multi-byte stores are checked as a whole
    /// before the first byte is written.
    pub fn store(&mut self, offset: Offset, value: &Value) -> AwlResult<()> {
        match value {
            Value::Scalar { width: 1, bits } => {
                let start = self.check_range("store", offset, 1)?;
                let mask = 1u8 << offset.bit;
                if bits & 1 != 0 {
                    self.data[start] |= mask;
                } else {
                    self.data[start] &= !mask;
                }
                Ok(())
            }
            Value::Scalar { width, .. } if width % 8 != 0 => Err(AwlError::fault(format!(
                "store: Invalid width {} bits",
                width
            ))),
            _ => {
                let bytes = value.to_bytes();
                let start = self.check_range("store", offset, bytes.len())?;
                self.data[start..start + bytes.len()].copy_from_slice(&bytes);
                Ok(())
            }
        }
    }

    pub fn fetch_bytes(&self, byte: u32, count: usize) -> AwlResult<&[u8]> {
        let start = self.check_range("fetch", Offset::byte(byte), count)?;
        Ok(&self.data[start..start + count])
    }

    pub fn store_bytes(&mut self, byte: u32, bytes: &[u8]) -> AwlResult<()> {
        let start = self.check_range("store", Offset::byte(byte), bytes.len())?;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bit_read_modify_write() {
        let mut mem = Memory::new(4);
        mem.store(Offset::new(1, 3), &Value::bit(true)).expect("Should store");
        mem.store(Offset::new(1, 5), &Value::bit(true)).expect("Should store");
        assert_eq!(mem.as_slice()[1], 0b0010_1000);

        mem.store(Offset::new(1, 3), &Value::bit(false)).expect("Should store");
        assert_eq!(mem.as_slice()[1], 0b0010_0000);
        assert_eq!(mem.fetch(Offset::new(1, 5), 1).expect("Should fetch"), Value::bit(true));
    }

    #[test]
    fn test_big_endian_widths() {
        let mut mem = Memory::new(8);
        mem.store(Offset::byte(0), &Value::scalar(32, 0x1234_5678)).expect("Should store");
        assert_eq!(mem.as_slice()[..4], [0x12, 0x34, 0x56, 0x78]);
        assert_eq!(mem.fetch(Offset::byte(1), 16).expect("Should fetch").as_u32(), 0x3456);
        assert_eq!(mem.fetch(Offset::byte(0), 24).expect("Should fetch").as_u32(), 0x12_3456);

        mem.store(Offset::byte(2), &Value::scalar(48, 0xAABB_CCDD_EEFF)).expect("Should store");
        assert_eq!(
            mem.fetch(Offset::byte(2), 48).expect("Should fetch").as_u64(),
            0xAABB_CCDD_EEFF
        );
    }

    #[test]
    fn test_wide_fetch_returns_bytes() {
        let mem = Memory::from_bytes((0u8..10).collect());
        let value = mem.fetch(Offset::byte(0), 80).expect("Should fetch");
        assert_eq!(value, Value::Bytes((0u8..10).collect()));
    }

    #[test]
    fn test_out_of_range_store_does_not_mutate() {
        let mut mem = Memory::new(4);
        let err = mem.store(Offset::byte(2), &Value::scalar(32, 0xFFFF_FFFF));
        assert!(matches!(err, Err(AwlError::Fault { .. })));
        assert_eq!(mem.as_slice(), &[0, 0, 0, 0]);

        let err = mem.fetch(Offset::byte(4), 8).expect_err("Should fail");
        assert_eq!(err.message(), "fetch: Operator offset '4.0' out of range");
    }
}

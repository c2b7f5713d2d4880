//! The local data stack (L-stack)
//!
//! One byte buffer shared by all frames. Each frame owns the range starting
//! at its base; allocations grow upwards from there.

use crate::memory::Memory;
use crate::offset::Offset;
use awl_common::{AwlError, AwlResult};

/// Allocation cursor of one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LFrame {
    /// Absolute byte where the frame starts
    pub base: u32,
    /// Bytes allocated (relative to `base`)
    pub bytes: u32,
    /// Bits allocated in the partially used byte
    pub bits: u8,
}

impl LFrame {
    /// Absolute first free byte after this frame
    pub fn end(&self) -> u32 {
        self.base + self.bytes + u32::from(self.bits > 0)
    }
}

#[derive(Debug, Clone)]
pub struct LStack {
    pub memory: Memory,
}

impl LStack {
    pub fn new(size: u32) -> Self {
        Self {
            memory: Memory::new(size as usize),
        }
    }

    pub fn size(&self) -> u32 {
        self.memory.len() as u32
    }

    /// Open a frame after `parent` with `bytes` of TEMP data. The TEMP area
    /// is cleared.
    pub fn open_frame(&mut self, parent: Option<&LFrame>, bytes: u32) -> AwlResult<LFrame> {
        let base = parent.map_or(0, |p| p.end());
        if base + bytes > self.size() {
            return Err(exhausted(bytes * 8));
        }
        let end = (base + bytes) as usize;
        self.memory.as_mut_slice()[base as usize..end].fill(0);
        Ok(LFrame { base, bytes, bits: 0 })
    }

    /// Allocate `bits` in `frame`. Single bits are packed, everything else
    /// is byte aligned. The frame may end exactly at the stack end.
    pub fn alloc(&self, frame: &mut LFrame, bits: u32) -> AwlResult<Offset> {
        let (mut bytes, mut bit) = (frame.bytes, frame.bits);
        let offset = if bits == 1 {
            let offset = Offset::new(bytes, bit);
            bit += 1;
            if bit >= 8 {
                bytes += 1;
                bit = 0;
            }
            offset
        } else {
            if bit > 0 {
                bytes += 1;
                bit = 0;
            }
            let offset = Offset::byte(bytes);
            bytes += bits.div_ceil(8);
            offset
        };
        let end = frame.base + bytes + u32::from(bit > 0);
        if end > self.size() {
            return Err(exhausted(bits));
        }
        frame.bytes = bytes;
        frame.bits = bit;
        Ok(offset)
    }
}

fn exhausted(bits: u32) -> AwlError {
    AwlError::fault(format!(
        "Cannot allocate another {} bits on L-stack. The L-stack is exhausted.",
        bits
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bit_and_byte_allocation() {
        let stack = LStack::new(16);
        let mut frame = LFrame { base: 4, bytes: 2, bits: 0 };
        assert_eq!(stack.alloc(&mut frame, 1).expect("Should fit"), Offset::new(2, 0));
        assert_eq!(stack.alloc(&mut frame, 1).expect("Should fit"), Offset::new(2, 1));
        assert_eq!(stack.alloc(&mut frame, 16).expect("Should fit"), Offset::byte(3));
        assert_eq!(frame.bytes, 5);
        assert_eq!(frame.end(), 9);
    }

    #[test]
    fn test_exact_fit_then_exhausted() {
        let mut stack = LStack::new(8);
        let mut frame = stack.open_frame(None, 4).expect("Should open");
        stack.alloc(&mut frame, 32).expect("Exact fit should succeed");
        let err = stack.alloc(&mut frame, 8).expect_err("Should be exhausted");
        assert!(err.message().contains("L-stack is exhausted"));
    }

    #[test]
    fn test_frames_stack_up() {
        let mut stack = LStack::new(64);
        let outer = stack.open_frame(None, 20).expect("Should open");
        let inner = stack.open_frame(Some(&outer), 10).expect("Should open");
        assert_eq!(inner.base, 20);
        assert!(stack.open_frame(Some(&inner), 40).is_err());
    }
}

//! Area-coded pointer encodings
//!
//! * 32-bit area pointer: `area << 24 | byte << 3 | bit`
//! * 48-bit DB pointer: `db << 32 | area pointer`
//! * 80-bit ANY pointer: magic, type, repeat count, DB, area pointer

use crate::constants::{ANY_MAGIC, AREA_SHIFT};
use crate::offset::Offset;
use awl_common::{AwlError, AwlResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Memory area codes as stored in bits 24..31 of an area pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Area {
    Periphery = 0x80,
    Input = 0x81,
    Output = 0x82,
    Flags = 0x83,
    GlobalDb = 0x84,
    InstanceDb = 0x85,
    Local = 0x86,
    ParentLocal = 0x87,
}

impl Area {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Area> {
        match code {
            0x80 => Some(Area::Periphery),
            0x81 => Some(Area::Input),
            0x82 => Some(Area::Output),
            0x83 => Some(Area::Flags),
            0x84 => Some(Area::GlobalDb),
            0x85 => Some(Area::InstanceDb),
            0x86 => Some(Area::Local),
            0x87 => Some(Area::ParentLocal),
            _ => None,
        }
    }

    /// Like [`Area::from_code`], but an unknown code is a runtime fault
    pub fn decode(code: u8) -> AwlResult<Area> {
        Area::from_code(code).ok_or_else(|| {
            AwlError::fault(format!("Invalid area code ({:X} hex) in pointer", code))
        })
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Area::Periphery => "P",
            Area::Input => "E",
            Area::Output => "A",
            Area::Flags => "M",
            Area::GlobalDb => "DBX",
            Area::InstanceDb => "DIX",
            Area::Local => "L",
            Area::ParentLocal => "V",
        }
    }
}

/// 32-bit area pointer (POINTER register format, also used by AR1/AR2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Pointer(pub u32);

impl Pointer {
    pub fn new(area: Option<Area>, offset: Offset) -> AwlResult<Self> {
        let area_bits = area.map_or(0, |a| u32::from(a.code()) << AREA_SHIFT);
        Ok(Pointer(area_bits | offset.to_pointer_value()?))
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn area_code(&self) -> u8 {
        ((self.0 >> AREA_SHIFT) & 0xFF) as u8
    }

    /// The area, if the pointer is area-spanning (area code set)
    pub fn area(&self) -> Option<Area> {
        Area::from_code(self.area_code())
    }

    pub fn byte_offset(&self) -> u32 {
        (self.0 >> 3) & 0xFFFF
    }

    pub fn bit_offset(&self) -> u8 {
        (self.0 & 7) as u8
    }

    pub fn offset(&self) -> Offset {
        Offset::from_pointer_value(self.0)
    }

    pub fn to_db_pointer(&self, db: u16) -> DbPointer {
        DbPointer { db, pointer: *self }
    }

    pub fn to_any_pointer(&self, db: u16, data_type: AnyType, count: u16) -> AnyPointer {
        AnyPointer {
            data_type,
            count,
            db,
            pointer: *self,
        }
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.area() {
            Some(area) => format!("{} ", area.prefix()),
            None if self.area_code() == 0 => String::new(),
            None => format!("({:02X}) ", self.area_code()),
        };
        write!(f, "P#{}{}.{}", prefix, self.byte_offset(), self.bit_offset())
    }
}

/// 48-bit DB pointer. Used for compound parameters passed by reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DbPointer {
    pub db: u16,
    pub pointer: Pointer,
}

impl DbPointer {
    pub fn to_u64(&self) -> u64 {
        (u64::from(self.db) << 32) | u64::from(self.pointer.0)
    }

    pub fn from_u64(value: u64) -> Self {
        Self {
            db: ((value >> 32) & 0xFFFF) as u16,
            pointer: Pointer((value & 0xFFFF_FFFF) as u32),
        }
    }

    pub fn to_bytes(&self) -> [u8; 6] {
        let db = self.db.to_be_bytes();
        let ptr = self.pointer.0.to_be_bytes();
        [db[0], db[1], ptr[0], ptr[1], ptr[2], ptr[3]]
    }

    pub fn from_bytes(bytes: &[u8]) -> AwlResult<Self> {
        if bytes.len() != 6 {
            return Err(AwlError::fault(format!(
                "DB pointer needs 6 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            db: u16::from_be_bytes([bytes[0], bytes[1]]),
            pointer: Pointer(u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]])),
        })
    }
}

impl fmt::Display for DbPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.db == 0 {
            write!(f, "{}", self.pointer)
        } else {
            write!(f, "P#DB{}.{}", self.db, &self.pointer.to_string()[2..])
        }
    }
}

/// Data type codes of an ANY pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AnyType {
    Nil = 0x00,
    Bool = 0x01,
    Byte = 0x02,
    Char = 0x03,
    Word = 0x04,
    Int = 0x05,
    DWord = 0x06,
    DInt = 0x07,
    Real = 0x08,
    Date = 0x09,
    TimeOfDay = 0x0A,
    Time = 0x0B,
    S5Time = 0x0C,
    DateAndTime = 0x0E,
    String = 0x13,
    BlockFb = 0x17,
    BlockFc = 0x18,
    BlockDb = 0x19,
    BlockSdb = 0x1A,
    Counter = 0x1C,
    Timer = 0x1D,
}

impl AnyType {
    pub fn from_code(code: u8) -> Option<AnyType> {
        use AnyType::*;
        let t = match code {
            0x00 => Nil,
            0x01 => Bool,
            0x02 => Byte,
            0x03 => Char,
            0x04 => Word,
            0x05 => Int,
            0x06 => DWord,
            0x07 => DInt,
            0x08 => Real,
            0x09 => Date,
            0x0A => TimeOfDay,
            0x0B => Time,
            0x0C => S5Time,
            0x0E => DateAndTime,
            0x13 => String,
            0x17 => BlockFb,
            0x18 => BlockFc,
            0x19 => BlockDb,
            0x1A => BlockSdb,
            0x1C => Counter,
            0x1D => Timer,
            _ => return None,
        };
        Some(t)
    }
}

/// 80-bit ANY pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnyPointer {
    pub data_type: AnyType,
    pub count: u16,
    pub db: u16,
    pub pointer: Pointer,
}

impl AnyPointer {
    /// Cover `bit_width` bits with the widest element type that divides it
    pub fn from_bit_width(pointer: Pointer, db: u16, bit_width: u32) -> AwlResult<Self> {
        let (data_type, elem) = if bit_width % 32 == 0 {
            (AnyType::DWord, 32)
        } else if bit_width % 16 == 0 {
            (AnyType::Word, 16)
        } else if bit_width % 8 == 0 {
            (AnyType::Byte, 8)
        } else {
            (AnyType::Bool, 1)
        };
        let count = bit_width / elem;
        if count > 0xFFFF {
            return Err(AwlError::fault(format!(
                "ANY pointer repeat count {} too big",
                count
            )));
        }
        Ok(pointer.to_any_pointer(db, data_type, count as u16))
    }

    pub fn to_bytes(&self) -> [u8; 10] {
        let count = self.count.to_be_bytes();
        let db = self.db.to_be_bytes();
        let ptr = self.pointer.0.to_be_bytes();
        [
            ANY_MAGIC,
            self.data_type as u8,
            count[0],
            count[1],
            db[0],
            db[1],
            ptr[0],
            ptr[1],
            ptr[2],
            ptr[3],
        ]
    }

    pub fn from_bytes(bytes: &[u8]) -> AwlResult<Self> {
        if bytes.len() != 10 {
            return Err(AwlError::fault(format!(
                "ANY pointer needs 10 bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[0] != ANY_MAGIC {
            return Err(AwlError::fault(format!(
                "Invalid ANY pointer magic {:02X}",
                bytes[0]
            )));
        }
        let data_type = AnyType::from_code(bytes[1]).ok_or_else(|| {
            AwlError::fault(format!("Invalid ANY pointer data type {:02X}", bytes[1]))
        })?;
        Ok(Self {
            data_type,
            count: u16::from_be_bytes([bytes[2], bytes[3]]),
            db: u16::from_be_bytes([bytes[4], bytes[5]]),
            pointer: Pointer(u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]])),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pointer_fields() {
        let ptr = Pointer::new(Some(Area::Flags), Offset::new(10, 3)).expect("Should encode");
        assert_eq!(ptr.value(), 0x8300_0053);
        assert_eq!(ptr.area(), Some(Area::Flags));
        assert_eq!(ptr.byte_offset(), 10);
        assert_eq!(ptr.bit_offset(), 3);
        assert_eq!(ptr.to_string(), "P#M 10.3");
        assert_eq!(Pointer(0x28).to_string(), "P#5.0");
    }

    #[test]
    fn test_db_pointer_bytes() {
        let ptr = Pointer::new(Some(Area::GlobalDb), Offset::new(2, 0)).expect("Should encode");
        let dbp = ptr.to_db_pointer(7);
        assert_eq!(dbp.to_bytes(), [0x00, 0x07, 0x84, 0x00, 0x00, 0x10]);
        assert_eq!(DbPointer::from_bytes(&dbp.to_bytes()).expect("Should decode"), dbp);
        assert_eq!(DbPointer::from_u64(dbp.to_u64()), dbp);
        assert_eq!(dbp.to_string(), "P#DB7.DBX 2.0");
    }

    #[test]
    fn test_any_pointer_layout() {
        let ptr = Pointer::new(Some(Area::GlobalDb), Offset::byte(4)).expect("Should encode");
        let any = AnyPointer::from_bit_width(ptr, 3, 80).expect("Should build");
        assert_eq!(any.data_type, AnyType::Word);
        assert_eq!(any.count, 5);
        assert_eq!(
            any.to_bytes(),
            [0x10, 0x04, 0x00, 0x05, 0x00, 0x03, 0x84, 0x00, 0x00, 0x20]
        );
        assert_eq!(AnyPointer::from_bytes(&any.to_bytes()).expect("Should decode"), any);
    }

    #[test]
    fn test_invalid_area_code_is_fault() {
        assert!(matches!(Area::decode(0x42), Err(AwlError::Fault { .. })));
    }
}

//! Operand model
//!
//! Operands are produced by the translator and never mutated afterwards.
//! Indirect operands resolve into fresh direct operands at run time, see
//! [`IndirectOperand::resolve`].

use crate::constants::{AREA_SHIFT, EXT_ADDRESS_MASK, POINTER_OFFSET_MASK};
use crate::datatypes::DataType;
use crate::offset::Offset;
use crate::pointer::Area;
use awl_common::{AwlError, AwlResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Memory areas reachable by direct operands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemArea {
    Input,
    Output,
    Flags,
    Local,
    /// The caller's local stack (VL)
    ParentLocal,
    GlobalDb,
    InstanceDb,
    PeriphIn,
    PeriphOut,
}

impl MemArea {
    /// Area code used in pointers (peripheral areas share one code)
    pub fn area(self) -> Area {
        match self {
            MemArea::Input => Area::Input,
            MemArea::Output => Area::Output,
            MemArea::Flags => Area::Flags,
            MemArea::Local => Area::Local,
            MemArea::ParentLocal => Area::ParentLocal,
            MemArea::GlobalDb => Area::GlobalDb,
            MemArea::InstanceDb => Area::InstanceDb,
            MemArea::PeriphIn | MemArea::PeriphOut => Area::Periphery,
        }
    }

    /// Map a pointer area code back to a memory area. The periphery code
    /// maps to PA for stores and to PE for fetches.
    pub fn from_area(area: Area, store: bool) -> MemArea {
        match area {
            Area::Periphery if store => MemArea::PeriphOut,
            Area::Periphery => MemArea::PeriphIn,
            Area::Input => MemArea::Input,
            Area::Output => MemArea::Output,
            Area::Flags => MemArea::Flags,
            Area::GlobalDb => MemArea::GlobalDb,
            Area::InstanceDb => MemArea::InstanceDb,
            Area::Local => MemArea::Local,
            Area::ParentLocal => MemArea::ParentLocal,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            MemArea::Input => "E",
            MemArea::Output => "A",
            MemArea::Flags => "M",
            MemArea::Local => "L",
            MemArea::ParentLocal => "V",
            MemArea::GlobalDb => "DB",
            MemArea::InstanceDb => "DI",
            MemArea::PeriphIn => "PE",
            MemArea::PeriphOut => "PA",
        }
    }
}

/// Direct memory operand, e.g. `MW 10` or `DB5.DBX 2.1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemOperand {
    pub area: MemArea,
    pub width: u32,
    pub offset: Offset,
    /// Explicit DB number for DB-qualified accesses
    pub db: Option<u16>,
}

impl MemOperand {
    pub fn new(area: MemArea, width: u32, offset: Offset) -> Self {
        Self {
            area,
            width,
            offset,
            db: None,
        }
    }

    pub fn in_db(mut self, db: u16) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_width(mut self, width: u32) -> Self {
        self.width = width;
        self
    }
}

impl fmt::Display for MemOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match (self.area, self.width) {
            (MemArea::GlobalDb | MemArea::InstanceDb, 1) => "X",
            (MemArea::PeriphIn | MemArea::PeriphOut, 8) => "B",
            (_, 1) => "",
            (_, 8) => "B",
            (_, 16) => "W",
            (_, 32) => "D",
            _ => "?",
        };
        if let Some(db) = self.db {
            write!(f, "DB{}.", db)?;
        }
        if self.width == 1 {
            write!(f, "{}{} {}", self.area.prefix(), suffix, self.offset)
        } else {
            write!(f, "{}{} {}", self.area.prefix(), suffix, self.offset.byte)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockRefKind {
    Ob,
    Fb,
    Fc,
    Db,
    Di,
    Udt,
    Sfb,
    Sfc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub kind: BlockRefKind,
    pub index: u16,
}

impl BlockRef {
    pub fn new(kind: BlockRefKind, index: u16) -> Self {
        Self { kind, index }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.kind {
            BlockRefKind::Ob => "OB",
            BlockRefKind::Fb => "FB",
            BlockRefKind::Fc => "FC",
            BlockRefKind::Db => "DB",
            BlockRefKind::Di => "DI",
            BlockRefKind::Udt => "UDT",
            BlockRefKind::Sfb => "SFB",
            BlockRefKind::Sfc => "SFC",
        };
        write!(f, "{} {}", name, self.index)
    }
}

/// Status word conditions usable as bit operands (`U ==0`, `O OV`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    Zero,
    NotZero,
    Greater,
    Less,
    GreaterEq,
    LessEq,
    Overflow,
    StoredOverflow,
    Unordered,
    BinaryResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialReg {
    Stw,
    Ar1,
    Ar2,
    DbLength,
    DbNumber,
    DiLength,
    DiNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddrReg {
    Ar1,
    Ar2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImmKind {
    Int,
    DInt,
    Real,
    Hex,
    Bcd,
    S5Time,
    Time,
    Pointer,
    Str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Immediate {
    pub kind: ImmKind,
    pub width: u32,
    pub value: u64,
}

impl Immediate {
    pub fn new(kind: ImmKind, width: u32, value: u64) -> Self {
        Self { kind, width, value }
    }

    pub fn int(value: i32) -> Self {
        Self::new(ImmKind::Int, 16, u64::from(value as u16))
    }
}

/// What a register- or memory-indirect operand ends up addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndirectTarget {
    Mem(MemArea),
    /// Area-spanning: the area comes from the address register
    Spanning,
    Timer,
    Counter,
    BlockDb,
    BlockFb,
    BlockFc,
}

impl IndirectTarget {
    pub fn is_extended(self) -> bool {
        matches!(
            self,
            IndirectTarget::Timer
                | IndirectTarget::Counter
                | IndirectTarget::BlockDb
                | IndirectTarget::BlockFb
                | IndirectTarget::BlockFc
        )
    }

    /// Widths the offset operand of a memory-indirect access may have.
    /// Timer, counter and block numbers take any integer width.
    pub fn offset_widths(self) -> &'static [u32] {
        if self.is_extended() {
            &[8, 16, 32]
        } else {
            &[32]
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndirectOperand {
    pub target: IndirectTarget,
    pub width: u32,
    /// `None` for memory-indirect
    pub register: Option<AddrReg>,
    /// Memory operand holding the pointer, or the `P#` displacement for
    /// register-indirect
    pub offset: Box<Operand>,
}

impl IndirectOperand {
    /// Build the direct operand this indirect operand points to.
    ///
    /// `offset_value` is the fetched value of the offset operand (or the
    /// immediate displacement), `ar` is the address register content for
    /// register-indirect forms.
    pub fn resolve(&self, offset_value: u32, ar: Option<u32>, store: bool) -> AwlResult<Operand> {
        let pointer: u64 = match (self.register, self.target) {
            (Some(_), target) => {
                let ar = ar.ok_or_else(|| {
                    AwlError::bug("Register-indirect operand resolved without address register")
                })?;
                let sum = u64::from(ar.wrapping_add(offset_value));
                match target {
                    IndirectTarget::Spanning => sum & 0xFFFF_FFFF,
                    IndirectTarget::Mem(area) => {
                        (sum & 0x00FF_FFFF) | (u64::from(area.area().code()) << AREA_SHIFT)
                    }
                    _ => {
                        return Err(AwlError::bug(
                            "Register-indirect operand with extended area",
                        ))
                    }
                }
            }
            (None, IndirectTarget::Mem(area)) => {
                (u64::from(offset_value) & 0x00FF_FFFF) | (u64::from(area.area().code()) << AREA_SHIFT)
            }
            (None, IndirectTarget::Spanning) => {
                return Err(AwlError::bug("Area-spanning operand without address register"))
            }
            (None, ext) => {
                let number = u64::from(offset_value) & EXT_ADDRESS_MASK;
                let number = u16::try_from(number).map_err(|_| {
                    AwlError::fault(format!("Indirect block/timer number {} too big", number))
                })?;
                return Ok(match ext {
                    IndirectTarget::Timer => Operand::Timer(number),
                    IndirectTarget::Counter => Operand::Counter(number),
                    IndirectTarget::BlockDb => Operand::Block(BlockRef::new(BlockRefKind::Db, number)),
                    IndirectTarget::BlockFb => Operand::Block(BlockRef::new(BlockRefKind::Fb, number)),
                    _ => Operand::Block(BlockRef::new(BlockRefKind::Fc, number)),
                });
            }
        };

        let code = ((pointer >> AREA_SHIFT) & 0xFF) as u8;
        let area = Area::from_code(code).ok_or_else(|| {
            AwlError::fault(format!("Invalid area code ({:X} hex) in indirect addressing", code))
        })?;
        let value = (pointer & 0xFFFF_FFFF) as u32;
        let offset = Offset {
            byte: (value & POINTER_OFFSET_MASK) >> 3,
            bit: (value & 7) as u8,
        };
        if self.width != 1 && offset.bit != 0 {
            return Err(AwlError::fault(format!(
                "Bit offset (lowest three bits) in {}-bit indirect addressing is not zero. \
                 (Computed offset is: {})",
                self.width, offset
            )));
        }
        Ok(Operand::Mem(MemOperand::new(
            MemArea::from_area(area, store),
            self.width,
            offset,
        )))
    }
}

/// How a `#name` operand is bound inside its block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalBinding {
    Unbound,
    /// TEMP variable in the block's own local stack
    Temp { offset: Offset },
    /// IN/OUT/INOUT/STAT field of an FB, relative to the instance base
    Instance { offset: Offset },
    /// Compound FB parameter stored as a DB pointer in the instance DB
    InstancePointer { offset: Offset, sub_offset: Offset },
    /// FC parameter, translated per call
    FcParam { index: usize, sub_offset: Offset },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedLocal {
    /// Field name, dotted for struct members (`rec.a`)
    pub name: String,
    /// ARRAY subscripts, empty for plain fields
    pub indices: Vec<i32>,
    pub width: u32,
    pub data_type: Option<DataType>,
    pub binding: LocalBinding,
}

impl NamedLocal {
    pub fn unbound(name: &str) -> Self {
        Self {
            name: name.to_string(),
            indices: Vec::new(),
            width: 0,
            data_type: None,
            binding: LocalBinding::Unbound,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.binding != LocalBinding::Unbound
    }

    /// Parameter passed as a timer/counter/block number
    pub fn is_call_by_ref(&self) -> bool {
        self.data_type.as_ref().is_some_and(|dt| dt.is_call_by_ref())
    }
}

/// Where a DB variable landed in its data block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbVarBinding {
    pub offset: Offset,
    pub width: u32,
    pub data_type: DataType,
}

/// Fully qualified DB variable: `DB3.rec.a`, `DB3.arr[2]` or
/// `"Recipe".speed`. Bound against the DB layout when the program is
/// linked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbVariable {
    pub db: u16,
    /// Field name, dotted for struct members
    pub name: String,
    pub indices: Vec<i32>,
    pub binding: Option<DbVarBinding>,
}

impl DbVariable {
    pub fn unbound(db: u16, name: &str, indices: Vec<i32>) -> Self {
        Self {
            db,
            name: name.to_string(),
            indices,
            binding: None,
        }
    }
}

impl fmt::Display for DbVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DB{}.{}", self.db, self.name)?;
        if !self.indices.is_empty() {
            let idx: Vec<String> = self.indices.iter().map(|i| i.to_string()).collect();
            write!(f, "[{}]", idx.join(","))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Imm(Immediate),
    Mem(MemOperand),
    Indirect(IndirectOperand),
    Timer(u16),
    Counter(u16),
    Block(BlockRef),
    /// `#name`
    Local(NamedLocal),
    /// `P##name`
    LocalPointer(NamedLocal),
    DbVar(DbVariable),
    /// `"name"`, replaced by the symbol's operand during translation
    Symbol(String),
    /// FB or SFB instance embedded in the calling FB's instance DB
    MultiInstance { block: BlockRef, offset: Offset },
    Condition(Condition),
    Register(SpecialReg),
    Label(String),
}

impl Operand {
    /// Width in bits, if statically known
    pub fn width(&self) -> Option<u32> {
        match self {
            Operand::Imm(imm) => Some(imm.width),
            Operand::Mem(mem) => Some(mem.width),
            Operand::Indirect(ind) => Some(ind.width),
            Operand::Timer(_) | Operand::Counter(_) | Operand::Block(_) => Some(16),
            Operand::Local(local) if local.width != 0 => Some(local.width),
            Operand::LocalPointer(_) => Some(32),
            Operand::DbVar(var) => var.binding.as_ref().map(|b| b.width),
            Operand::Condition(_) => Some(1),
            Operand::Register(SpecialReg::Stw) => Some(16),
            Operand::Register(SpecialReg::DbNumber | SpecialReg::DiNumber) => Some(16),
            Operand::Register(_) => Some(32),
            _ => None,
        }
    }

    pub fn is_indirect(&self) -> bool {
        matches!(self, Operand::Indirect(_))
    }

    pub fn as_mem(&self) -> Option<&MemOperand> {
        match self {
            Operand::Mem(mem) => Some(mem),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Imm(imm) => write!(f, "{:X}", imm.value),
            Operand::Mem(mem) => write!(f, "{}", mem),
            Operand::Indirect(ind) => write!(f, "[{}-bit indirect via {}]", ind.width, ind.offset),
            Operand::Timer(n) => write!(f, "T {}", n),
            Operand::Counter(n) => write!(f, "Z {}", n),
            Operand::Block(b) => write!(f, "{}", b),
            Operand::Local(l) if l.indices.is_empty() => write!(f, "#{}", l.name),
            Operand::Local(l) => {
                let idx: Vec<String> = l.indices.iter().map(|i| i.to_string()).collect();
                write!(f, "#{}[{}]", l.name, idx.join(","))
            }
            Operand::LocalPointer(l) => write!(f, "P##{}", l.name),
            Operand::DbVar(var) => write!(f, "{}", var),
            Operand::Symbol(s) => write!(f, "\"{}\"", s),
            Operand::MultiInstance { block, offset } => write!(f, "{} @ DI {}", block, offset),
            Operand::Condition(c) => write!(f, "{:?}", c),
            Operand::Register(r) => write!(f, "{:?}", r),
            Operand::Label(l) => write!(f, "{}", l),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mem_indirect(area: MemArea, width: u32) -> IndirectOperand {
        IndirectOperand {
            target: IndirectTarget::Mem(area),
            width,
            register: None,
            offset: Box::new(Operand::Mem(MemOperand::new(MemArea::Flags, 32, Offset::byte(10)))),
        }
    }

    #[test]
    fn test_memory_indirect_resolves_to_direct() {
        let op = mem_indirect(MemArea::Flags, 16);
        // MD 10 holds P#4.0
        let resolved = op.resolve(4 << 3, None, false).expect("Should resolve");
        assert_eq!(resolved, Operand::Mem(MemOperand::new(MemArea::Flags, 16, Offset::byte(4))));
        assert_eq!(resolved.to_string(), "MW 4");
    }

    #[test]
    fn test_bit_offset_must_be_zero_for_words() {
        let op = mem_indirect(MemArea::Flags, 16);
        let err = op.resolve((4 << 3) | 1, None, false).expect_err("Should fail");
        assert!(err
            .message()
            .starts_with("Bit offset (lowest three bits) in 16-bit indirect addressing is not zero."));

        let bit = mem_indirect(MemArea::Input, 1);
        let resolved = bit.resolve((2 << 3) | 5, None, false).expect("Should resolve");
        assert_eq!(resolved, Operand::Mem(MemOperand::new(MemArea::Input, 1, Offset::new(2, 5))));
    }

    #[test]
    fn test_register_indirect_area_internal() {
        let op = IndirectOperand {
            target: IndirectTarget::Mem(MemArea::GlobalDb),
            width: 8,
            register: Some(AddrReg::Ar1),
            offset: Box::new(Operand::Imm(Immediate::new(ImmKind::Pointer, 32, 2 << 3))),
        };
        // The area code of AR1 is ignored for area-internal access
        let resolved = op.resolve(2 << 3, Some(0x8300_0000 | (10 << 3)), false).expect("Should resolve");
        assert_eq!(resolved, Operand::Mem(MemOperand::new(MemArea::GlobalDb, 8, Offset::byte(12))));
    }

    #[test]
    fn test_register_indirect_area_spanning() {
        let op = IndirectOperand {
            target: IndirectTarget::Spanning,
            width: 16,
            register: Some(AddrReg::Ar2),
            offset: Box::new(Operand::Imm(Immediate::new(ImmKind::Pointer, 32, 0))),
        };
        let resolved = op.resolve(0, Some(0x8000_0000 | (6 << 3)), true).expect("Should resolve");
        assert_eq!(resolved, Operand::Mem(MemOperand::new(MemArea::PeriphOut, 16, Offset::byte(6))));
        let resolved = op.resolve(0, Some(0x8000_0000 | (6 << 3)), false).expect("Should resolve");
        assert_eq!(resolved, Operand::Mem(MemOperand::new(MemArea::PeriphIn, 16, Offset::byte(6))));

        let err = op.resolve(0, Some(0x4200_0000), false).expect_err("Should fail");
        assert_eq!(err.message(), "Invalid area code (42 hex) in indirect addressing");
    }

    #[test]
    fn test_extended_area_resolves_numbers() {
        let op = IndirectOperand {
            target: IndirectTarget::Timer,
            width: 16,
            register: None,
            offset: Box::new(Operand::Mem(MemOperand::new(MemArea::Flags, 16, Offset::byte(0)))),
        };
        assert_eq!(op.resolve(12, None, false).expect("Should resolve"), Operand::Timer(12));

        let op = IndirectOperand {
            target: IndirectTarget::BlockDb,
            ..op
        };
        assert_eq!(
            op.resolve(3, None, false).expect("Should resolve"),
            Operand::Block(BlockRef::new(BlockRefKind::Db, 3))
        );
    }

    #[test]
    fn test_offset_widths() {
        assert_eq!(IndirectTarget::Counter.offset_widths(), &[8, 16, 32]);
        assert_eq!(IndirectTarget::BlockFc.offset_widths(), &[8, 16, 32]);
        assert_eq!(IndirectTarget::Mem(MemArea::Flags).offset_widths(), &[32]);
    }
}

//! Operand resolution and memory access dispatch
//!
//! Every operand is first turned into a [`Resolved`] value: either a
//! concrete [`Location`] plus width, or one of the non-memory forms
//! (immediates, timers, registers, ...). Fetch and store then dispatch on
//! the location's area.

use super::callstack::FcRef;
use super::Cpu;
use crate::datatypes::DataType;
use crate::memory::{Memory, Value};
use crate::offset::Offset;
use crate::operand::{
    AddrReg, BlockRef, BlockRefKind, Condition, Immediate, ImmKind, IndirectOperand, LocalBinding, MemArea,
    MemOperand, NamedLocal, Operand, SpecialReg,
};
use crate::pointer::{Area, DbPointer, Pointer};
use awl_common::{AwlError, AwlResult};

/// A concrete place in CPU memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Input(Offset),
    Output(Offset),
    Flags(Offset),
    Db { db: u16, offset: Offset },
    /// Absolute offset into the L-stack
    Lstack(Offset),
    PeriphIn(Offset),
    PeriphOut(Offset),
}

impl Location {
    pub fn offset(&self) -> Offset {
        match *self {
            Location::Input(o)
            | Location::Output(o)
            | Location::Flags(o)
            | Location::Lstack(o)
            | Location::PeriphIn(o)
            | Location::PeriphOut(o) => o,
            Location::Db { offset, .. } => offset,
        }
    }

    /// Same area, `delta` further
    pub fn add(self, delta: Offset) -> Location {
        match self {
            Location::Input(o) => Location::Input(o + delta),
            Location::Output(o) => Location::Output(o + delta),
            Location::Flags(o) => Location::Flags(o + delta),
            Location::Db { db, offset } => Location::Db {
                db,
                offset: offset + delta,
            },
            Location::Lstack(o) => Location::Lstack(o + delta),
            Location::PeriphIn(o) => Location::PeriphIn(o + delta),
            Location::PeriphOut(o) => Location::PeriphOut(o + delta),
        }
    }
}

/// An operand after run-time resolution
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Loc(Location, u32),
    Imm(Immediate),
    Timer(u16),
    Counter(u16),
    Block(BlockRef),
    Condition(Condition),
    Register(SpecialReg),
    MultiInstance { block: BlockRef, offset: Offset },
}

fn no_db_open() -> AwlError {
    AwlError::fault("No data block opened (DB register is empty)")
}

fn no_di_open() -> AwlError {
    AwlError::fault("No instance data block opened (DI register is empty)")
}

fn check_width(op: &Operand, width: u32, allowed: &[u32]) -> AwlResult<()> {
    if allowed.contains(&width) {
        return Ok(());
    }
    let allowed: Vec<String> = allowed.iter().map(|w| w.to_string()).collect();
    Err(AwlError::fault(format!(
        "Invalid data width {} of operand '{}' (allowed: {} bits)",
        width,
        op,
        allowed.join("/")
    )))
}

impl Cpu {
    /// Resolve `op` against the current frame. `store` selects the
    /// peripheral direction for area codes that do not carry it.
    pub(super) fn resolve(&mut self, op: &Operand, store: bool) -> AwlResult<Resolved> {
        match op {
            Operand::Imm(imm) => Ok(Resolved::Imm(*imm)),
            Operand::Mem(mem) => Ok(Resolved::Loc(self.mem_location(mem)?, mem.width)),
            Operand::Indirect(ind) => self.resolve_indirect(ind, store),
            Operand::Timer(n) => Ok(Resolved::Timer(*n)),
            Operand::Counter(n) => Ok(Resolved::Counter(*n)),
            Operand::Block(b) => Ok(Resolved::Block(*b)),
            Operand::Local(local) => self.resolve_local(local),
            Operand::LocalPointer(local) => self.local_pointer(local),
            Operand::DbVar(var) => {
                let binding = var
                    .binding
                    .as_ref()
                    .ok_or_else(|| AwlError::bug(format!("DB variable '{}' is not bound", var)))?;
                Ok(Resolved::Loc(
                    Location::Db {
                        db: var.db,
                        offset: binding.offset,
                    },
                    binding.width,
                ))
            }
            Operand::MultiInstance { block, offset } => Ok(Resolved::MultiInstance {
                block: *block,
                offset: *offset,
            }),
            Operand::Condition(c) => Ok(Resolved::Condition(*c)),
            Operand::Register(r) => Ok(Resolved::Register(*r)),
            Operand::Symbol(_) | Operand::Label(_) => Err(AwlError::bug(format!(
                "Operand '{}' was not resolved during translation",
                op
            ))),
        }
    }

    fn mem_location(&self, mem: &MemOperand) -> AwlResult<Location> {
        let offset = mem.offset;
        Ok(match mem.area {
            MemArea::Input => Location::Input(offset),
            MemArea::Output => Location::Output(offset),
            MemArea::Flags => Location::Flags(offset),
            MemArea::Local => Location::Lstack(offset.add_bytes(self.frame()?.l.base)),
            MemArea::ParentLocal => Location::Lstack(offset.add_bytes(self.parent_frame()?.l.base)),
            MemArea::GlobalDb => Location::Db {
                db: match mem.db {
                    Some(db) => db,
                    None => self.db_register.ok_or_else(no_db_open)?,
                },
                offset,
            },
            MemArea::InstanceDb => Location::Db {
                db: self.di_register.ok_or_else(no_di_open)?,
                offset,
            },
            MemArea::PeriphIn => Location::PeriphIn(offset),
            MemArea::PeriphOut => Location::PeriphOut(offset),
        })
    }

    fn resolve_indirect(&mut self, ind: &IndirectOperand, store: bool) -> AwlResult<Resolved> {
        let (offset_value, ar) = match ind.register {
            Some(reg) => {
                let displacement = match ind.offset.as_ref() {
                    Operand::Imm(imm) => imm.value as u32,
                    other => {
                        return Err(AwlError::bug(format!(
                            "Register-indirect displacement '{}' is not an immediate",
                            other
                        )))
                    }
                };
                let ar = match reg {
                    AddrReg::Ar1 => self.ar1,
                    AddrReg::Ar2 => self.ar2,
                };
                (displacement, Some(ar))
            }
            None => {
                if ind.offset.is_indirect() {
                    return Err(AwlError::bug("Indirect offset operand inside indirect addressing"));
                }
                (self.fetch_u32(&ind.offset, ind.target.offset_widths())?, None)
            }
        };
        let direct = ind.resolve(offset_value, ar, store)?;
        if direct.is_indirect() {
            return Err(AwlError::bug(format!("Indirect operand resolved to '{}'", direct)));
        }
        self.resolve(&direct, store)
    }

    fn resolve_local(&mut self, local: &NamedLocal) -> AwlResult<Resolved> {
        let (l_base, di_base) = {
            let frame = self.frame()?;
            (frame.l.base, frame.di_base)
        };
        match local.binding {
            LocalBinding::Unbound => Err(AwlError::bug(format!("Local symbol '#{}' is not bound", local.name))),
            LocalBinding::Temp { offset } => Ok(Resolved::Loc(
                Location::Lstack(offset.add_bytes(l_base)),
                local.width,
            )),
            LocalBinding::Instance { offset } => {
                let loc = Location::Db {
                    db: self.di_register.ok_or_else(no_di_open)?,
                    offset: di_base + offset,
                };
                if local.is_call_by_ref() {
                    let number = self.fetch_loc(loc, 16)?.as_u32() as u16;
                    return by_reference(local, number);
                }
                Ok(Resolved::Loc(loc, local.width))
            }
            LocalBinding::InstancePointer { offset, sub_offset } => {
                let loc = Location::Db {
                    db: self.di_register.ok_or_else(no_di_open)?,
                    offset: di_base + offset,
                };
                let pointer = DbPointer::from_u64(self.fetch_loc(loc, 48)?.as_u64());
                let v_base = self.parent_frame().map_or(0, |f| f.l.base);
                let target = self.decode_db_pointer(&pointer, v_base)?;
                Ok(Resolved::Loc(target.add(sub_offset), local.width))
            }
            LocalBinding::FcParam { index, sub_offset } => {
                let fc_ref = self
                    .frame()?
                    .fc_refs
                    .get(index)
                    .cloned()
                    .flatten()
                    .ok_or_else(|| {
                        AwlError::bug(format!("FC parameter '#{}' has no actual parameter", local.name))
                    })?;
                match fc_ref {
                    FcRef::Direct(Resolved::Loc(loc, _)) => Ok(Resolved::Loc(loc.add(sub_offset), local.width)),
                    FcRef::Direct(other) => Ok(other),
                    FcRef::Compound { slot, v_base } => {
                        let pointer = DbPointer::from_bytes(self.lstack.memory.fetch_bytes(slot, 6)?)?;
                        let target = self.decode_db_pointer(&pointer, v_base)?;
                        Ok(Resolved::Loc(target.add(sub_offset), local.width))
                    }
                }
            }
        }
    }

    /// `P##name`: a 32-bit area pointer to a local
    fn local_pointer(&mut self, local: &NamedLocal) -> AwlResult<Resolved> {
        let (area, offset) = match local.binding {
            LocalBinding::Unbound => {
                return Err(AwlError::bug(format!("Local symbol '#{}' is not bound", local.name)))
            }
            LocalBinding::Temp { offset } => (Area::Local, offset),
            LocalBinding::Instance { offset } => (Area::InstanceDb, self.frame()?.di_base + offset),
            LocalBinding::InstancePointer { .. } | LocalBinding::FcParam { .. } => match self.resolve_local(local)? {
                Resolved::Loc(loc, _) => self.area_pointer_of(loc)?,
                _ => {
                    return Err(AwlError::fault(format!(
                        "Cannot take the address of parameter '#{}'",
                        local.name
                    )))
                }
            },
        };
        let pointer = Pointer::new(Some(area), offset)?;
        Ok(Resolved::Imm(Immediate::new(ImmKind::Pointer, 32, u64::from(pointer.value()))))
    }

    /// Area and offset of `loc` as seen from the current frame
    fn area_pointer_of(&self, loc: Location) -> AwlResult<(Area, Offset)> {
        Ok(match loc {
            Location::Input(o) => (Area::Input, o),
            Location::Output(o) => (Area::Output, o),
            Location::Flags(o) => (Area::Flags, o),
            Location::Db { offset, .. } => (Area::GlobalDb, offset),
            Location::PeriphIn(o) | Location::PeriphOut(o) => (Area::Periphery, o),
            Location::Lstack(o) => {
                let base = self.frame()?.l.base;
                if o.byte >= base {
                    (Area::Local, Offset::new(o.byte - base, o.bit))
                } else {
                    let parent = self.parent_frame()?.l.base;
                    if o.byte < parent {
                        return Err(AwlError::fault(
                            "Cannot address local data of a block further up the call stack",
                        ));
                    }
                    (Area::ParentLocal, Offset::new(o.byte - parent, o.bit))
                }
            }
        })
    }

    /// Decode a DB pointer. V-area offsets are relative to `v_base`.
    pub(super) fn decode_db_pointer(&self, pointer: &DbPointer, v_base: u32) -> AwlResult<Location> {
        let area = Area::decode(pointer.pointer.area_code())?;
        let offset = pointer.pointer.offset();
        Ok(match area {
            Area::Input => Location::Input(offset),
            Area::Output => Location::Output(offset),
            Area::Flags => Location::Flags(offset),
            Area::GlobalDb => Location::Db {
                db: match pointer.db {
                    0 => self.db_register.ok_or_else(no_db_open)?,
                    db => db,
                },
                offset,
            },
            Area::InstanceDb => Location::Db {
                db: match pointer.db {
                    0 => self.di_register.ok_or_else(no_di_open)?,
                    db => db,
                },
                offset,
            },
            Area::Local => Location::Lstack(offset.add_bytes(self.frame()?.l.base)),
            Area::ParentLocal => Location::Lstack(offset.add_bytes(v_base)),
            Area::Periphery => {
                return Err(AwlError::fault("DB pointer into the periphery area cannot be dereferenced"))
            }
        })
    }

    /// Encode `loc` as a DB pointer. L-stack locations are encoded relative
    /// to `v_base` as V-area pointers.
    pub(super) fn encode_db_pointer(&self, loc: Location, v_base: u32) -> AwlResult<DbPointer> {
        let (db, area, offset) = match loc {
            Location::Input(o) => (0, Area::Input, o),
            Location::Output(o) => (0, Area::Output, o),
            Location::Flags(o) => (0, Area::Flags, o),
            Location::Db { db, offset } => (db, Area::GlobalDb, offset),
            Location::Lstack(o) => {
                if o.byte < v_base {
                    return Err(AwlError::fault(
                        "Cannot pass local data of a block further up the call stack by reference",
                    ));
                }
                (0, Area::ParentLocal, Offset::new(o.byte - v_base, o.bit))
            }
            Location::PeriphIn(_) | Location::PeriphOut(_) => {
                return Err(AwlError::fault("Peripheral operands cannot be passed by reference"))
            }
        };
        Ok(Pointer::new(Some(area), offset)?.to_db_pointer(db))
    }

    pub(super) fn fetch_value(&mut self, op: &Operand) -> AwlResult<Value> {
        let resolved = self.resolve(op, false)?;
        self.fetch_resolved(&resolved, false)
    }

    /// Fetch an already resolved operand. `as_bit` selects the status
    /// output of timers and counters instead of their value.
    pub(super) fn fetch_resolved(&mut self, resolved: &Resolved, as_bit: bool) -> AwlResult<Value> {
        match resolved {
            Resolved::Loc(loc, width) => self.fetch_loc(*loc, *width),
            Resolved::Imm(imm) => Ok(Value::scalar(imm.width, imm.value)),
            Resolved::Timer(n) => {
                let now = self.now;
                let timer = self.timer_mut(*n)?;
                Ok(if as_bit {
                    Value::bit(timer.status(now))
                } else {
                    Value::scalar(16, u64::from(timer.value_bin(now)))
                })
            }
            Resolved::Counter(n) => {
                let counter = self.counter_mut(*n)?;
                Ok(if as_bit {
                    Value::bit(counter.status())
                } else {
                    Value::scalar(16, u64::from(counter.value_bin()))
                })
            }
            Resolved::Block(b) => Ok(Value::scalar(16, u64::from(b.index))),
            Resolved::Condition(c) => Ok(Value::bit(self.condition(*c))),
            Resolved::Register(r) => Ok(self.register_value(*r)),
            Resolved::MultiInstance { block, .. } => Err(AwlError::fault(format!(
                "Cannot fetch the multi-instance of {}",
                block
            ))),
        }
    }

    /// Fetch `op` as an unsigned value of one of the `allowed` widths
    pub(super) fn fetch_u32(&mut self, op: &Operand, allowed: &[u32]) -> AwlResult<u32> {
        let value = self.fetch_value(op)?;
        check_width(op, value.width(), allowed)?;
        Ok(value.as_u32())
    }

    pub(super) fn fetch_bit(&mut self, op: &Operand) -> AwlResult<bool> {
        let resolved = self.resolve(op, false)?;
        let value = self.fetch_resolved(&resolved, true)?;
        check_width(op, value.width(), &[1])?;
        Ok(value.as_bool())
    }

    /// Store into `op`, truncated to the operand's width
    pub(super) fn store_u32(&mut self, op: &Operand, value: u32, allowed: &[u32]) -> AwlResult<()> {
        match self.resolve(op, true)? {
            Resolved::Loc(loc, width) => {
                check_width(op, width, allowed)?;
                self.store_loc(loc, &Value::scalar(width, u64::from(value)))
            }
            Resolved::Register(SpecialReg::Stw) => {
                self.status.set_word(value as u16);
                Ok(())
            }
            Resolved::Register(SpecialReg::Ar1) => {
                self.ar1 = value;
                Ok(())
            }
            Resolved::Register(SpecialReg::Ar2) => {
                self.ar2 = value;
                Ok(())
            }
            _ => Err(AwlError::fault(format!("Cannot store to operand '{}'", op))),
        }
    }

    pub(super) fn store_bit(&mut self, op: &Operand, bit: bool) -> AwlResult<()> {
        match self.resolve(op, true)? {
            Resolved::Loc(loc, 1) => self.store_loc(loc, &Value::bit(bit)),
            Resolved::Loc(_, width) => check_width(op, width, &[1]),
            _ => Err(AwlError::fault(format!("Cannot store to operand '{}'", op))),
        }
    }

    pub(super) fn fetch_loc(&mut self, loc: Location, width: u32) -> AwlResult<Value> {
        match loc {
            Location::Input(o) => self.inputs.fetch(o, width),
            Location::Output(o) => self.outputs.fetch(o, width),
            Location::Flags(o) => self.flags.fetch(o, width),
            Location::Lstack(o) => self.lstack.memory.fetch(o, width),
            Location::Db { db, offset } => self
                .program
                .dbs
                .get(db)
                .ok_or_else(|| db_missing(db))?
                .fetch(offset, width),
            Location::PeriphIn(o) => {
                let bytes = self.hardware.direct_read(width, o.byte).ok_or_else(|| {
                    AwlError::fault(format!(
                        "There is no hardware to handle the direct peripheral fetch. (width={}, offset={})",
                        width, o.byte
                    ))
                })?;
                if bytes.len() * 8 != width as usize {
                    return Err(AwlError::fault(format!(
                        "Peripheral fetch returned {} bytes for a {}-bit access",
                        bytes.len(),
                        width
                    )));
                }
                Memory::from_bytes(bytes).fetch(Offset::default(), width)
            }
            Location::PeriphOut(o) => Err(AwlError::fault(format!(
                "Cannot fetch from the peripheral output area (offset={})",
                o.byte
            ))),
        }
    }

    pub(super) fn store_loc(&mut self, loc: Location, value: &Value) -> AwlResult<()> {
        match loc {
            Location::Input(o) => self.inputs.store(o, value),
            Location::Output(o) => self.outputs.store(o, value),
            Location::Flags(o) => self.flags.store(o, value),
            Location::Lstack(o) => self.lstack.memory.store(o, value),
            Location::Db { db, offset } => self
                .program
                .dbs
                .get_mut(db)
                .ok_or_else(|| db_missing(db))?
                .store(offset, value),
            Location::PeriphOut(o) => {
                let width = value.width();
                if self.hardware.direct_write(width, o.byte, &value.to_bytes()) {
                    Ok(())
                } else {
                    Err(AwlError::fault(format!(
                        "There is no hardware to handle the direct peripheral store. (width={}, offset={}, value={})",
                        width, o.byte, value
                    )))
                }
            }
            Location::PeriphIn(o) => Err(AwlError::fault(format!(
                "Cannot store to the peripheral input area (offset={})",
                o.byte
            ))),
        }
    }

    /// Evaluate a status word condition
    pub(super) fn condition(&self, condition: Condition) -> bool {
        let s = &self.status;
        match condition {
            Condition::Zero => !s.a1 && !s.a0,
            Condition::NotZero => s.a1 != s.a0,
            Condition::Greater => s.a1 && !s.a0,
            Condition::Less => !s.a1 && s.a0,
            Condition::GreaterEq => !s.a0,
            Condition::LessEq => !s.a1,
            Condition::Overflow => s.ov,
            Condition::StoredOverflow => s.os,
            Condition::Unordered => s.a1 && s.a0,
            Condition::BinaryResult => s.bie,
        }
    }

    fn register_value(&self, reg: SpecialReg) -> Value {
        let db_size = |db: Option<u16>| {
            db.and_then(|n| self.program.dbs.get(n))
                .map_or(0, |db| u64::from(db.size()))
        };
        match reg {
            SpecialReg::Stw => Value::scalar(16, u64::from(self.status.word())),
            SpecialReg::Ar1 => Value::scalar(32, u64::from(self.ar1)),
            SpecialReg::Ar2 => Value::scalar(32, u64::from(self.ar2)),
            SpecialReg::DbLength => Value::scalar(16, db_size(self.db_register)),
            SpecialReg::DiLength => Value::scalar(16, db_size(self.di_register)),
            SpecialReg::DbNumber => Value::scalar(16, u64::from(self.db_register.unwrap_or(0))),
            SpecialReg::DiNumber => Value::scalar(16, u64::from(self.di_register.unwrap_or(0))),
        }
    }
}

pub(super) fn db_missing(db: u16) -> AwlError {
    AwlError::fault(format!("Datablock {} does not exist", db))
}

/// A TIMER/COUNTER/BLOCK_* parameter stored as a number
fn by_reference(local: &NamedLocal, number: u16) -> AwlResult<Resolved> {
    Ok(match local.data_type {
        Some(DataType::Timer) => Resolved::Timer(number),
        Some(DataType::Counter) => Resolved::Counter(number),
        Some(DataType::BlockDb) => Resolved::Block(BlockRef::new(BlockRefKind::Db, number)),
        Some(DataType::BlockFb) => Resolved::Block(BlockRef::new(BlockRefKind::Fb, number)),
        Some(DataType::BlockFc) => Resolved::Block(BlockRef::new(BlockRefKind::Fc, number)),
        _ => {
            return Err(AwlError::bug(format!(
                "Parameter '#{}' is not passed by reference",
                local.name
            )))
        }
    })
}

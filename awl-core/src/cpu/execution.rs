//! Instruction semantics
//!
//! `execute` runs one translated instruction against the register set.
//! Status word handling follows the S7 rules per instruction group; the
//! first-check bit (NER) decides whether a bit operation combines with
//! the running logic result or starts a new one.

use super::access::{db_missing, Resolved};
use super::callstack::ParenEntry;
use super::Cpu;
use crate::constants::MAX_PAREN_DEPTH;
use crate::datatypes::{bcd_to_u32, canonical_real_dword, dword_to_f32, f32_to_dword, u32_to_bcd};
use crate::insn::{InsnKind, Instruction};
use crate::operand::{BlockRefKind, Condition, Operand};
use awl_common::{AwlError, AwlResult};
use log::debug;
use std::cmp::Ordering;

fn operand(insn: &Instruction, index: usize) -> AwlResult<&Operand> {
    insn.op(index)
        .ok_or_else(|| AwlError::bug(format!("Instruction '{}' is missing operand {}", insn, index + 1)))
}

fn low_word(value: u32) -> u16 {
    (value & 0xFFFF) as u16
}

fn with_low_word(value: u32, word: u16) -> u32 {
    (value & 0xFFFF_0000) | u32::from(word)
}

/// Logical shift of a `bits` wide value. Returns the result and the last
/// bit shifted out.
fn shift_logical(value: u64, bits: u32, count: u32, left: bool) -> (u64, bool) {
    let mask = (1u64 << bits) - 1;
    if count > bits {
        return (0, false);
    }
    if left {
        let out = (value >> (bits - count)) & 1 != 0;
        ((value << count) & mask, out)
    } else {
        let out = (value >> (count - 1)) & 1 != 0;
        (value >> count, out)
    }
}

/// Arithmetic right shift, count limited to the width
fn shift_signed(value: i64, bits: u32, count: u32) -> (i64, bool) {
    let count = count.min(bits);
    let out = (value >> (count - 1)) & 1 != 0;
    (value >> count, out)
}

#[derive(Clone, Copy)]
enum NumClass {
    Int,
    DInt,
    Real,
}

fn compare_class(kind: InsnKind) -> NumClass {
    use InsnKind::*;
    match kind {
        EqI | NeI | GtI | LtI | GeI | LeI => NumClass::Int,
        EqD | NeD | GtD | LtD | GeD | LeD => NumClass::DInt,
        _ => NumClass::Real,
    }
}

fn relation_holds(kind: InsnKind, ordering: Ordering) -> bool {
    use InsnKind::*;
    match kind {
        EqI | EqD | EqR => ordering == Ordering::Equal,
        NeI | NeD | NeR => ordering != Ordering::Equal,
        GtI | GtD | GtR => ordering == Ordering::Greater,
        LtI | LtD | LtR => ordering == Ordering::Less,
        GeI | GeD | GeR => ordering != Ordering::Less,
        _ => ordering != Ordering::Greater,
    }
}

impl Cpu {
    pub(super) fn execute(&mut self, insn: &Instruction) -> AwlResult<()> {
        use InsnKind::*;
        match insn.kind {
            U | UN | O | ON | X | XN => self.bit_logic(insn)?,
            UBracket | UNBracket | OBracket | ONBracket | XBracket | XNBracket => self.paren_open(insn.kind)?,
            BracketClose => self.paren_close()?,
            Assign => {
                let vke = self.status.vke;
                self.store_bit(operand(insn, 0)?, vke)?;
                let s = &mut self.status;
                s.or = false;
                s.sta = vke;
                s.ner = false;
            }
            S | R => self.set_reset(insn)?,
            Set => {
                let s = &mut self.status;
                s.or = false;
                s.sta = true;
                s.vke = true;
                s.ner = false;
            }
            Clr => {
                let s = &mut self.status;
                s.or = false;
                s.sta = false;
                s.vke = false;
                s.ner = false;
            }
            Not => {
                self.status.vke = !self.status.vke;
                self.status.sta = true;
            }
            Save => self.status.bie = self.status.vke,
            Fp | Fn => self.edge(insn)?,

            L | Lc | T | Lar1 | Lar2 | Tar1 | Tar2 | Tak | Push | Pop | Ar1Add | Ar2Add => self.load_transfer(insn)?,

            AddI | SubI | MulI | DivI => self.int_arith(insn.kind),
            AddD | SubD | MulD | DivD | Mod => self.dint_arith(insn.kind),
            AddR | SubR | MulR | DivR => self.real_arith(insn.kind),
            Abs => self.accu[0] &= 0x7FFF_FFFF,
            NegR => self.accu[0] ^= 0x8000_0000,
            Sqrt => {
                let raw = dword_to_f32(self.accu[0]).sqrt().to_bits();
                self.set_real_result(raw);
            }
            AddImm | Inc | Dec => self.accu_immediate(insn)?,
            NegI => {
                let v = low_word(self.accu[0]) as i16;
                let r = v.wrapping_neg();
                self.accu[0] = with_low_word(self.accu[0], r as u16);
                self.status.set_for_int(i64::from(r), v == i16::MIN);
            }
            NegD => {
                let v = self.accu[0] as i32;
                let r = v.wrapping_neg();
                self.accu[0] = r as u32;
                self.status.set_for_int(i64::from(r), v == i32::MIN);
            }
            InvI => self.accu[0] ^= 0xFFFF,
            InvD => self.accu[0] = !self.accu[0],

            Itd | Dtr | Rnd | Trunc | Bti | Itb | Btd | Dtb => self.convert(insn.kind)?,

            EqI | NeI | GtI | LtI | GeI | LeI | EqD | NeD | GtD | LtD | GeD | LeD | EqR | NeR | GtR | LtR
            | GeR | LeR => self.compare(insn.kind),

            Uw | Ow | Xow | Ud | Od | Xod => self.word_logic(insn)?,
            Slw | Srw | Sld | Srd | Ssi | Ssd | Rld | Rrd => self.shift(insn)?,

            Spa => self.jump(insn)?,
            Spb | Spbn | Spbb | Spbnb => {
                let s = &mut self.status;
                let vke = s.vke;
                if matches!(insn.kind, Spbb | Spbnb) {
                    s.bie = vke;
                }
                s.or = false;
                s.sta = true;
                s.vke = true;
                s.ner = false;
                if vke == matches!(insn.kind, Spb | Spbb) {
                    self.jump(insn)?;
                }
            }
            Spbi | Spbin => {
                let s = &mut self.status;
                let bie = s.bie;
                s.or = false;
                s.sta = true;
                s.ner = false;
                if bie == (insn.kind == Spbi) {
                    self.jump(insn)?;
                }
            }
            Spz | Spn | Spp | Spm | Sppz | Spmz | Spo | Spu => {
                let condition = match insn.kind {
                    Spz => Condition::Zero,
                    Spn => Condition::NotZero,
                    Spp => Condition::Greater,
                    Spm => Condition::Less,
                    Sppz => Condition::GreaterEq,
                    Spmz => Condition::LessEq,
                    Spo => Condition::Overflow,
                    _ => Condition::Unordered,
                };
                if self.condition(condition) {
                    self.jump(insn)?;
                }
            }
            Sps => {
                let os = self.status.os;
                self.status.os = false;
                if os {
                    self.jump(insn)?;
                }
            }
            Loop => {
                let count = low_word(self.accu[0]).wrapping_sub(1);
                self.accu[0] = with_low_word(self.accu[0], count);
                if count != 0 {
                    self.jump(insn)?;
                }
            }

            Call | Uc | Cc => self.call(insn)?,
            Be | Bea => self.block_end()?,
            Beb => {
                if self.status.vke {
                    self.block_end()?;
                } else {
                    let s = &mut self.status;
                    s.or = false;
                    s.sta = true;
                    s.vke = true;
                    s.ner = false;
                }
            }
            Auf => self.open_db(operand(insn, 0)?)?,
            Tdb => std::mem::swap(&mut self.db_register, &mut self.di_register),

            Si | Sv | Se | Ss | Sa => self.start_timer(insn)?,
            Fr => {
                let vke = self.status.vke;
                match self.resolve(operand(insn, 0)?, false)? {
                    Resolved::Timer(n) => self.timer_mut(n)?.release(vke),
                    Resolved::Counter(n) => self.counter_mut(n)?.release(vke),
                    _ => return Err(AwlError::fault("FR needs a timer or counter operand")),
                }
            }
            Zv | Zr => {
                let vke = self.status.vke;
                let Resolved::Counter(n) = self.resolve(operand(insn, 0)?, false)? else {
                    return Err(AwlError::fault(format!("'{}' needs a counter operand", insn)));
                };
                let counter = self.counter_mut(n)?;
                if insn.kind == Zv {
                    counter.count_up(vke);
                } else {
                    counter.count_down(vke);
                }
                self.status.or = false;
                self.status.ner = false;
            }

            Nop0 | Nop1 | Bld => {}
            ExtStwrst => self.status.reset(),
            ExtAssertEq | ExtAssertNe => {
                let a = self.fetch_value(operand(insn, 0)?)?;
                let b = self.fetch_value(operand(insn, 1)?)?;
                if (a.as_u64() == b.as_u64()) != (insn.kind == ExtAssertEq) {
                    return Err(AwlError::fault(format!("Assertion failed: {} vs. {}", a, b)));
                }
                self.status.ner = false;
            }
        }
        Ok(())
    }

    fn bit_logic(&mut self, insn: &Instruction) -> AwlResult<()> {
        let Some(op) = insn.op(0) else {
            if insn.kind != InsnKind::O {
                return Err(AwlError::fault(format!("'{}' needs an operand", insn)));
            }
            // O without operand: AND before OR
            let s = &mut self.status;
            s.or = s.vke;
            s.sta = true;
            s.ner = false;
            return Ok(());
        };
        let sta = self.fetch_bit(op)?;
        let s = &mut self.status;
        match insn.kind {
            InsnKind::U => s.vke = if s.ner { (s.vke && sta) || s.or } else { sta || s.or },
            InsnKind::UN => s.vke = if s.ner { (s.vke && !sta) || s.or } else { !sta || s.or },
            InsnKind::O | InsnKind::ON => {
                let bit = sta == (insn.kind == InsnKind::O);
                s.vke = if s.ner { s.vke || bit } else { bit };
                s.or = false;
            }
            _ => {
                let bit = sta == (insn.kind == InsnKind::X);
                s.vke = if s.ner { s.vke ^ bit } else { bit };
                s.or = false;
            }
        }
        s.sta = sta;
        s.ner = true;
        Ok(())
    }

    fn paren_open(&mut self, kind: InsnKind) -> AwlResult<()> {
        let entry = ParenEntry {
            kind,
            vke: self.status.vke,
            or: self.status.or,
            ner: self.status.ner,
        };
        let frame = self.frame_mut()?;
        if frame.paren.len() >= MAX_PAREN_DEPTH {
            return Err(AwlError::fault("Parenthesis stack overflow"));
        }
        frame.paren.push(entry);
        let s = &mut self.status;
        s.or = false;
        s.sta = true;
        s.ner = false;
        Ok(())
    }

    fn paren_close(&mut self) -> AwlResult<()> {
        let entry = self
            .frame_mut()?
            .paren
            .pop()
            .ok_or_else(|| AwlError::fault("Parenthesis stack underflow"))?;
        let s = &mut self.status;
        let inner = match entry.kind {
            InsnKind::UNBracket | InsnKind::ONBracket | InsnKind::XNBracket => !s.vke,
            _ => s.vke,
        };
        s.vke = match entry.kind {
            _ if !entry.ner => inner,
            InsnKind::UBracket | InsnKind::UNBracket => (inner && entry.vke) || entry.or,
            InsnKind::OBracket | InsnKind::ONBracket => inner || entry.vke,
            _ => inner ^ entry.vke,
        };
        s.or = entry.or;
        s.sta = true;
        s.ner = true;
        Ok(())
    }

    fn set_reset(&mut self, insn: &Instruction) -> AwlResult<()> {
        let op = operand(insn, 0)?;
        let vke = self.status.vke;
        let set = insn.kind == InsnKind::S;
        match self.resolve(op, true)? {
            Resolved::Counter(n) => {
                if set {
                    let preset = self.accu[0];
                    self.counter_mut(n)?.set(vke, preset)?;
                } else if vke {
                    self.counter_mut(n)?.reset();
                }
                self.status.or = false;
                self.status.ner = false;
            }
            Resolved::Timer(n) => {
                if set {
                    return Err(AwlError::fault(format!("Cannot S timer T {}", n)));
                }
                if vke {
                    self.timer_mut(n)?.reset();
                }
                self.status.or = false;
                self.status.ner = false;
            }
            _ => {
                if vke {
                    self.store_bit(op, set)?;
                }
                let s = &mut self.status;
                s.or = false;
                s.sta = vke;
                s.ner = false;
            }
        }
        Ok(())
    }

    fn edge(&mut self, insn: &Instruction) -> AwlResult<()> {
        let op = operand(insn, 0)?;
        let memory = self.fetch_bit(op)?;
        let vke = self.status.vke;
        self.store_bit(op, vke)?;
        let s = &mut self.status;
        s.or = false;
        s.sta = vke;
        s.ner = true;
        s.vke = if insn.kind == InsnKind::Fp {
            vke && !memory
        } else {
            !vke && memory
        };
        Ok(())
    }

    /// Load into ACCU 1, moving the old contents down
    fn accu_load(&mut self, value: u32) {
        if self.config.nr_accus == 4 {
            self.accu[3] = self.accu[2];
            self.accu[2] = self.accu[1];
        }
        self.accu[1] = self.accu[0];
        self.accu[0] = value;
    }

    /// After two-operand arithmetic ACCU 3/4 move up on 4-accu CPUs
    fn accu_pull_up(&mut self) {
        if self.config.nr_accus == 4 {
            self.accu[1] = self.accu[2];
            self.accu[2] = self.accu[3];
        }
    }

    fn load_transfer(&mut self, insn: &Instruction) -> AwlResult<()> {
        match insn.kind {
            InsnKind::L => {
                let value = self.fetch_u32(operand(insn, 0)?, &[8, 16, 32])?;
                self.accu_load(value);
            }
            InsnKind::Lc => {
                let now = self.now;
                let value = match self.resolve(operand(insn, 0)?, false)? {
                    Resolved::Timer(n) => self.timer_mut(n)?.value_s5t(now),
                    Resolved::Counter(n) => self.counter_mut(n)?.value_bcd(),
                    _ => return Err(AwlError::fault("LC needs a timer or counter operand")),
                };
                self.accu_load(u32::from(value));
            }
            InsnKind::T => {
                let value = self.accu[0];
                self.store_u32(operand(insn, 0)?, value, &[8, 16, 32])?;
            }
            InsnKind::Lar1 | InsnKind::Lar2 => {
                let value = match insn.op(0) {
                    Some(op) => self.fetch_u32(op, &[32])?,
                    None => self.accu[0],
                };
                if insn.kind == InsnKind::Lar1 {
                    self.ar1 = value;
                } else {
                    self.ar2 = value;
                }
            }
            InsnKind::Tar1 | InsnKind::Tar2 => {
                let value = if insn.kind == InsnKind::Tar1 { self.ar1 } else { self.ar2 };
                match insn.op(0) {
                    Some(op) => self.store_u32(op, value, &[32])?,
                    None => self.accu_load(value),
                }
            }
            InsnKind::Tak => self.accu.swap(0, 1),
            InsnKind::Push => {
                if self.config.nr_accus == 4 {
                    self.accu[3] = self.accu[2];
                    self.accu[2] = self.accu[1];
                }
                self.accu[1] = self.accu[0];
            }
            InsnKind::Pop => {
                self.accu[0] = self.accu[1];
                if self.config.nr_accus == 4 {
                    self.accu[1] = self.accu[2];
                    self.accu[2] = self.accu[3];
                }
            }
            _ => {
                // +AR1 / +AR2: only the 24 bit address part is added
                let delta = match insn.op(0) {
                    Some(op) => self.fetch_u32(op, &[16, 32])?,
                    None => low_word(self.accu[0]) as i16 as i32 as u32,
                };
                let ar = if insn.kind == InsnKind::Ar1Add { &mut self.ar1 } else { &mut self.ar2 };
                *ar = (*ar & 0xFF00_0000) | (ar.wrapping_add(delta) & 0x00FF_FFFF);
            }
        }
        Ok(())
    }

    fn int_arith(&mut self, kind: InsnKind) {
        let a = i32::from(low_word(self.accu[1]) as i16);
        let b = i32::from(low_word(self.accu[0]) as i16);
        let in_range = |v: i32| v >= i32::from(i16::MIN) && v <= i32::from(i16::MAX);
        match kind {
            InsnKind::AddI | InsnKind::SubI => {
                let r = if kind == InsnKind::AddI { a + b } else { a - b };
                let wrapped = r as i16;
                self.accu[0] = with_low_word(self.accu[0], wrapped as u16);
                self.status.set_for_int(i64::from(wrapped), !in_range(r));
            }
            InsnKind::MulI => {
                let r = a * b;
                self.accu[0] = r as u32;
                self.status.set_for_int(i64::from(r), !in_range(r));
            }
            _ => {
                if b == 0 {
                    self.status.set_cc(true, true, true);
                    self.accu_pull_up();
                    return;
                }
                let quotient = a / b;
                let remainder = a % b;
                self.accu[0] = (u32::from(remainder as u16) << 16) | u32::from(quotient as u16);
                self.status.set_for_int(i64::from(quotient), !in_range(quotient));
            }
        }
        self.accu_pull_up();
    }

    fn dint_arith(&mut self, kind: InsnKind) {
        let a = self.accu[1] as i32;
        let b = self.accu[0] as i32;
        let (result, overflow) = match kind {
            InsnKind::AddD => a.overflowing_add(b),
            InsnKind::SubD => a.overflowing_sub(b),
            InsnKind::MulD => a.overflowing_mul(b),
            _ if b == 0 => {
                self.status.set_cc(true, true, true);
                self.accu_pull_up();
                return;
            }
            InsnKind::DivD => a.overflowing_div(b),
            _ => (a.wrapping_rem(b), false),
        };
        self.accu[0] = result as u32;
        self.status.set_for_int(i64::from(result), overflow);
        self.accu_pull_up();
    }

    fn real_arith(&mut self, kind: InsnKind) {
        let a = dword_to_f32(self.accu[1]);
        let b = dword_to_f32(self.accu[0]);
        let result = match kind {
            InsnKind::AddR => a + b,
            InsnKind::SubR => a - b,
            InsnKind::MulR => a * b,
            _ => a / b,
        };
        self.set_real_result(result.to_bits());
        self.accu_pull_up();
    }

    /// Status from the raw result, canonical encoding into ACCU 1
    fn set_real_result(&mut self, raw: u32) {
        self.status.set_for_float(raw);
        self.accu[0] = canonical_real_dword(raw);
    }

    fn accu_immediate(&mut self, insn: &Instruction) -> AwlResult<()> {
        let value = self.fetch_value(operand(insn, 0)?)?;
        let accu = self.accu[0];
        self.accu[0] = match insn.kind {
            InsnKind::AddImm if value.width() == 32 => accu.wrapping_add(value.as_u32()),
            InsnKind::AddImm => with_low_word(accu, low_word(accu).wrapping_add(value.as_u32() as u16)),
            InsnKind::Inc => (accu & 0xFFFF_FF00) | u32::from((accu as u8).wrapping_add(value.as_u32() as u8)),
            _ => (accu & 0xFFFF_FF00) | u32::from((accu as u8).wrapping_sub(value.as_u32() as u8)),
        };
        Ok(())
    }

    fn overflow(&mut self) {
        self.status.ov = true;
        self.status.os = true;
    }

    fn convert(&mut self, kind: InsnKind) -> AwlResult<()> {
        let accu = self.accu[0];
        match kind {
            InsnKind::Itd => self.accu[0] = i32::from(low_word(accu) as i16) as u32,
            InsnKind::Dtr => self.accu[0] = f32_to_dword(accu as i32 as f32),
            InsnKind::Rnd | InsnKind::Trunc => {
                let value = dword_to_f32(accu);
                let value = if kind == InsnKind::Rnd {
                    value.round_ties_even()
                } else {
                    value.trunc()
                };
                // NaN fails both comparisons
                if value >= i32::MIN as f32 && value < 2_147_483_648.0 {
                    self.accu[0] = value as i32 as u32;
                } else {
                    self.overflow();
                }
            }
            InsnKind::Bti => {
                let word = low_word(accu);
                let digits = bcd_to_u32(u32::from(word & 0x0FFF), 3).ok_or_else(|| invalid_bcd(u32::from(word)))?;
                let value = if word & 0x8000 != 0 { -(digits as i32) } else { digits as i32 };
                self.accu[0] = with_low_word(accu, value as u16);
            }
            InsnKind::Btd => {
                let digits = bcd_to_u32(accu & 0x0FFF_FFFF, 7).ok_or_else(|| invalid_bcd(accu))?;
                let value = if accu & 0x8000_0000 != 0 { -(digits as i32) } else { digits as i32 };
                self.accu[0] = value as u32;
            }
            InsnKind::Itb => {
                let value = i32::from(low_word(accu) as i16);
                if value.unsigned_abs() > 999 {
                    self.overflow();
                } else {
                    let sign = if value < 0 { 0xF000 } else { 0 };
                    let bcd = u32_to_bcd(value.unsigned_abs(), 3) | sign;
                    self.accu[0] = with_low_word(accu, bcd as u16);
                    self.status.ov = false;
                }
            }
            _ => {
                let value = accu as i32;
                if value.unsigned_abs() > 9_999_999 {
                    self.overflow();
                } else {
                    let sign = if value < 0 { 0xF000_0000 } else { 0 };
                    self.accu[0] = u32_to_bcd(value.unsigned_abs(), 7) | sign;
                    self.status.ov = false;
                }
            }
        }
        Ok(())
    }

    /// Compare ACCU 2 against ACCU 1
    fn compare(&mut self, kind: InsnKind) {
        let (a, b) = (self.accu[1], self.accu[0]);
        let ordering = match compare_class(kind) {
            NumClass::Int => Some((low_word(a) as i16).cmp(&(low_word(b) as i16))),
            NumClass::DInt => Some((a as i32).cmp(&(b as i32))),
            NumClass::Real => dword_to_f32(a).partial_cmp(&dword_to_f32(b)),
        };
        self.status.set_compare(ordering);
        let vke = ordering.is_some_and(|o| relation_holds(kind, o));
        let s = &mut self.status;
        s.vke = vke;
        if ordering.is_some() {
            s.ov = false;
        }
        s.or = false;
        s.sta = vke;
        s.ner = true;
    }

    fn word_logic(&mut self, insn: &Instruction) -> AwlResult<()> {
        let value = match insn.op(0) {
            Some(op) => self.fetch_u32(op, &[16, 32])?,
            None => self.accu[1],
        };
        let accu = self.accu[0];
        let combined = match insn.kind {
            InsnKind::Uw | InsnKind::Ud => accu & value,
            InsnKind::Ow | InsnKind::Od => accu | value,
            _ => accu ^ value,
        };
        let (result, nonzero) = match insn.kind {
            InsnKind::Uw | InsnKind::Ow | InsnKind::Xow => {
                let word = low_word(combined);
                (with_low_word(accu, word), word != 0)
            }
            _ => (combined, combined != 0),
        };
        self.accu[0] = result;
        self.status.set_cc(nonzero, false, false);
        Ok(())
    }

    fn shift(&mut self, insn: &Instruction) -> AwlResult<()> {
        let count = match insn.op(0) {
            Some(op) => self.fetch_u32(op, &[16, 32])?,
            None => self.accu[1] & 0xFF,
        };
        if count == 0 {
            return Ok(());
        }
        let accu = self.accu[0];
        let (result, last) = match insn.kind {
            InsnKind::Slw | InsnKind::Srw => {
                let (word, out) = shift_logical(u64::from(low_word(accu)), 16, count, insn.kind == InsnKind::Slw);
                (with_low_word(accu, word as u16), out)
            }
            InsnKind::Sld | InsnKind::Srd => {
                let (dword, out) = shift_logical(u64::from(accu), 32, count, insn.kind == InsnKind::Sld);
                (dword as u32, out)
            }
            InsnKind::Ssi => {
                let (word, out) = shift_signed(i64::from(low_word(accu) as i16), 16, count);
                (with_low_word(accu, word as u16), out)
            }
            InsnKind::Ssd => {
                let (dword, out) = shift_signed(i64::from(accu as i32), 32, count);
                (dword as u32, out)
            }
            InsnKind::Rld => {
                let r = accu.rotate_left(count % 32);
                (r, r & 1 != 0)
            }
            _ => {
                let r = accu.rotate_right(count % 32);
                (r, r & 0x8000_0000 != 0)
            }
        };
        self.accu[0] = result;
        self.status.set_cc(last, false, false);
        Ok(())
    }

    fn jump(&mut self, insn: &Instruction) -> AwlResult<()> {
        let target = insn
            .target
            .ok_or_else(|| AwlError::bug(format!("Jump '{}' has no resolved target", insn)))?;
        self.frame_mut()?.ip = target;
        Ok(())
    }

    fn call(&mut self, insn: &Instruction) -> AwlResult<()> {
        let conditional = insn.kind == InsnKind::Cc;
        if !conditional || self.status.vke {
            self.call_block(insn, insn.kind != InsnKind::Call)?;
        }
        let s = &mut self.status;
        s.os = false;
        s.or = false;
        s.sta = true;
        if conditional {
            s.vke = true;
        }
        s.ner = false;
        Ok(())
    }

    fn block_end(&mut self) -> AwlResult<()> {
        let s = &mut self.status;
        s.os = false;
        s.or = false;
        s.sta = true;
        s.ner = false;
        let frame = self.frame_mut()?;
        frame.ip = frame.block.insns.len();
        Ok(())
    }

    fn open_db(&mut self, op: &Operand) -> AwlResult<()> {
        let Resolved::Block(block) = self.resolve(op, false)? else {
            return Err(AwlError::fault(format!("Cannot open '{}' as data block", op)));
        };
        if !self.program.dbs.contains(block.index) {
            return Err(db_missing(block.index));
        }
        match block.kind {
            BlockRefKind::Db => self.db_register = Some(block.index),
            BlockRefKind::Di => self.di_register = Some(block.index),
            _ => return Err(AwlError::fault(format!("Cannot open '{}' as data block", op))),
        }
        debug!("Opened {}", block);
        Ok(())
    }

    fn start_timer(&mut self, insn: &Instruction) -> AwlResult<()> {
        let Resolved::Timer(n) = self.resolve(operand(insn, 0)?, false)? else {
            return Err(AwlError::fault(format!("'{}' needs a timer operand", insn)));
        };
        let (vke, s5t, now) = (self.status.vke, low_word(self.accu[0]), self.now);
        let timer = self.timer_mut(n)?;
        match insn.kind {
            InsnKind::Si => timer.run_si(vke, s5t, now)?,
            InsnKind::Sv => timer.run_sv(vke, s5t, now)?,
            InsnKind::Se => timer.run_se(vke, s5t, now)?,
            InsnKind::Ss => timer.run_ss(vke, s5t, now)?,
            _ => timer.run_sa(vke, s5t, now)?,
        }
        self.status.or = false;
        self.status.ner = false;
        Ok(())
    }
}

fn invalid_bcd(value: u32) -> AwlError {
    AwlError::fault(format!("Invalid BCD value {:X}", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_logical_shift_reports_last_bit() {
        assert_eq!(shift_logical(0x8001, 16, 1, true), (0x0002, true));
        assert_eq!(shift_logical(0x8001, 16, 1, false), (0x4000, true));
        assert_eq!(shift_logical(0x00F0, 16, 4, false), (0x000F, false));
        assert_eq!(shift_logical(0xFFFF, 16, 16, true), (0, true));
        assert_eq!(shift_logical(0xFFFF, 16, 17, true), (0, false));
    }

    #[test]
    fn test_signed_shift_keeps_sign() {
        assert_eq!(shift_signed(-16, 16, 2), (-4, false));
        assert_eq!(shift_signed(-1, 16, 40), (-1, true));
        assert_eq!(shift_signed(5, 32, 1), (2, true));
    }

    #[test]
    fn test_relations() {
        assert!(relation_holds(InsnKind::GeI, Ordering::Equal));
        assert!(relation_holds(InsnKind::NeR, Ordering::Less));
        assert!(!relation_holds(InsnKind::LeD, Ordering::Greater));
        assert!(relation_holds(InsnKind::LtD, Ordering::Less));
    }

    #[test]
    fn test_low_word_helpers() {
        assert_eq!(with_low_word(0x1234_5678, 0xABCD), 0x1234_ABCD);
        assert_eq!(low_word(0x1234_5678), 0x5678);
    }
}

//! Call stack frames and block invocation
//!
//! FB calls copy their actual parameters into the instance DB and copy
//! OUT/IN_OUT values back on exit. FC calls have no storage of their own:
//! each actual parameter becomes an [`FcRef`], either pointing straight at
//! the actual operand or at a scratch copy the caller allocates in its own
//! local data (the callee sees it as VL).

use super::access::{db_missing, Location, Resolved};
use super::lstack::LFrame;
use super::Cpu;
use crate::blocks::{CodeBlock, DbKind};
use crate::datatypes::DataType;
use crate::insn::{InsnKind, Instruction, ParamAssign};
use crate::interface::InterfaceField;
use crate::memory::Value;
use crate::offset::Offset;
use crate::operand::{BlockRef, BlockRefKind};
use crate::pointer::{AnyPointer, Area, Pointer};
use awl_common::{AwlError, AwlResult, BlockKind};
use log::debug;
use std::rc::Rc;

/// Logic state saved by an opening parenthesis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParenEntry {
    pub kind: InsnKind,
    pub vke: bool,
    pub or: bool,
    pub ner: bool,
}

/// OUT / IN_OUT value copied back from the instance DB when an FB returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub inst_offset: Offset,
    pub width: u32,
    pub target: Location,
}

/// How an FC parameter reaches its actual operand
#[derive(Debug, Clone, PartialEq)]
pub enum FcRef {
    Direct(Resolved),
    /// Compound value: a DB pointer stored at absolute L-stack byte `slot`.
    /// V-area pointers in it are relative to `v_base`.
    Compound { slot: u32, v_base: u32 },
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub block: Rc<CodeBlock>,
    pub ip: usize,
    pub l: LFrame,
    pub paren: Vec<ParenEntry>,

    // FB instance data: DB number and start of this instance inside it
    pub instance_db: Option<u16>,
    pub di_base: Offset,

    // Caller registers
    pub prev_db: Option<u16>,
    pub prev_di: Option<u16>,
    pub prev_ar2: u32,

    /// FC actual parameters by interface field index
    pub fc_refs: Vec<Option<FcRef>>,
    pub outbound: Vec<Outbound>,
    /// UC/CC: no parameters, registers are not restored
    pub raw_call: bool,
    /// Caller allocation cursor before VL scratch was allocated
    pub caller_l: Option<LFrame>,
}

impl Frame {
    pub fn new(block: Rc<CodeBlock>, l: LFrame) -> Self {
        Self {
            block,
            ip: 0,
            l,
            paren: Vec::new(),
            instance_db: None,
            di_base: Offset::default(),
            prev_db: None,
            prev_di: None,
            prev_ar2: 0,
            fc_refs: Vec::new(),
            outbound: Vec::new(),
            raw_call: false,
            caller_l: None,
        }
    }
}

fn no_frame() -> AwlError {
    AwlError::bug("No active call stack frame")
}

fn unlinked(param: &ParamAssign) -> AwlError {
    AwlError::bug(format!("CALL parameter '{}' was not linked", param.name))
}

impl Cpu {
    pub(super) fn frame(&self) -> AwlResult<&Frame> {
        self.call_stack.last().ok_or_else(no_frame)
    }

    pub(super) fn frame_mut(&mut self) -> AwlResult<&mut Frame> {
        self.call_stack.last_mut().ok_or_else(no_frame)
    }

    /// The caller's frame, whose local data the current block sees as VL
    pub(super) fn parent_frame(&self) -> AwlResult<&Frame> {
        let depth = self.call_stack.len();
        if depth < 2 {
            return Err(AwlError::fault("No parent block: VL access not possible"));
        }
        Ok(&self.call_stack[depth - 2])
    }

    fn code_block(&self, kind: BlockKind, index: u16) -> AwlResult<Rc<CodeBlock>> {
        let table = match kind {
            BlockKind::Fb => &self.program.fbs,
            BlockKind::Fc => &self.program.fcs,
            _ => &self.program.obs,
        };
        table
            .get(index)
            .cloned()
            .ok_or_else(|| AwlError::fault(format!("Code block {} {} not found", kind, index)))
    }

    fn system_block(&self, block: BlockRef) -> AwlResult<Rc<CodeBlock>> {
        let table = match block.kind {
            BlockRefKind::Sfb => &self.program.sfbs,
            _ => &self.program.sfcs,
        };
        table
            .get(block.index)
            .cloned()
            .ok_or_else(|| AwlError::fault(format!("System block {} is not available", block)))
    }

    /// Callee of a multi-instance CALL
    fn instance_block(&self, block: BlockRef) -> AwlResult<Rc<CodeBlock>> {
        match block.kind {
            BlockRefKind::Sfb => self.system_block(block),
            _ => self.code_block(BlockKind::Fb, block.index),
        }
    }

    /// CALL (with parameters) or UC/CC (`raw`)
    pub(super) fn call_block(&mut self, insn: &Instruction, raw: bool) -> AwlResult<()> {
        if self.call_stack.len() >= self.config.max_call_depth {
            return Err(AwlError::fault(format!(
                "Maximum CALL stack depth of {} exceeded",
                self.config.max_call_depth
            )));
        }
        let target = insn
            .op(0)
            .ok_or_else(|| AwlError::bug("CALL without block operand"))?;
        match self.resolve(target, false)? {
            Resolved::Block(b) => match b.kind {
                BlockRefKind::Fc => {
                    let block = self.code_block(BlockKind::Fc, b.index)?;
                    if raw {
                        self.enter_raw(block)
                    } else {
                        self.enter_fc(block, &insn.params)
                    }
                }
                BlockRefKind::Sfc => {
                    let block = self.system_block(b)?;
                    if raw {
                        self.enter_raw(block)?;
                    } else {
                        self.enter_fc(block, &insn.params)?;
                    }
                    self.finish_system_block()
                }
                BlockRefKind::Fb | BlockRefKind::Sfb => {
                    let (block, expected) = if b.kind == BlockRefKind::Sfb {
                        (self.system_block(b)?, DbKind::SfbInstance { sfb: b.index })
                    } else {
                        (self.code_block(BlockKind::Fb, b.index)?, DbKind::Instance { fb: b.index })
                    };
                    if raw {
                        if block.routine.is_some() {
                            return Err(AwlError::fault(format!("{} needs an instance DB: use CALL", b)));
                        }
                        return self.enter_raw(block);
                    }
                    let db_op = insn
                        .op(1)
                        .ok_or_else(|| AwlError::bug("CALL of an FB without instance DB"))?;
                    let db = match self.resolve(db_op, false)? {
                        Resolved::Block(r) if matches!(r.kind, BlockRefKind::Db | BlockRefKind::Di) => r.index,
                        _ => return Err(AwlError::fault(format!("Invalid instance DB operand '{}'", db_op))),
                    };
                    self.check_instance_db(db, expected)?;
                    self.enter_fb(block, db, Offset::default(), &insn.params)?;
                    self.finish_system_block()
                }
                _ => Err(AwlError::fault(format!("Cannot call {}", b))),
            },
            Resolved::MultiInstance { block, offset } => {
                let block = self.instance_block(block)?;
                let db = self
                    .di_register
                    .ok_or_else(|| AwlError::fault("Multi-instance CALL without an open instance DB"))?;
                let base = self.frame()?.di_base + offset;
                self.enter_fb(block, db, base, &insn.params)?;
                self.finish_system_block()
            }
            _ => Err(AwlError::fault(format!("Invalid CALL operand '{}'", target))),
        }
    }

    /// System blocks run to completion right after their frame is entered
    fn finish_system_block(&mut self) -> AwlResult<()> {
        let Some(routine) = self.frame()?.block.routine else {
            return Ok(());
        };
        self.run_routine(routine)?;
        self.status.bie = true;
        self.exit_block()
    }

    fn check_instance_db(&self, db: u16, expected: DbKind) -> AwlResult<()> {
        let data = self.program.dbs.get(db).ok_or_else(|| db_missing(db))?;
        let owner_name = |kind: DbKind| match kind {
            DbKind::Instance { fb } => Some(format!("FB {}", fb)),
            DbKind::SfbInstance { sfb } => Some(format!("SFB {}", sfb)),
            _ => None,
        };
        match data.kind {
            kind if kind == expected => Ok(()),
            DbKind::Global => Err(AwlError::fault(format!("DB {} is not an instance DB", db))),
            DbKind::System => Err(AwlError::fault(format!("Access to DB {} denied", db))),
            kind => Err(AwlError::fault(format!(
                "DB {} is an instance DB of {}, not of {}",
                db,
                owner_name(kind).unwrap_or_default(),
                owner_name(expected).unwrap_or_default()
            ))),
        }
    }

    fn open_callee_frame(&mut self, after: LFrame, bytes: u32) -> AwlResult<LFrame> {
        self.lstack.open_frame(Some(&after), bytes)
    }

    fn push_frame(&mut self, frame: Frame) {
        debug!("Entering {} (depth {})", frame.block.name(), self.call_stack.len() + 1);
        self.call_stack.push(frame);
    }

    fn enter_raw(&mut self, block: Rc<CodeBlock>) -> AwlResult<()> {
        let caller_l = self.frame()?.l;
        let l = self.open_callee_frame(caller_l, block.interface.temp_allocation)?;
        let mut frame = Frame::new(block, l);
        frame.raw_call = true;
        self.push_frame(frame);
        Ok(())
    }

    fn enter_fc(&mut self, block: Rc<CodeBlock>, params: &[ParamAssign]) -> AwlResult<()> {
        let saved = self.frame()?.l;
        let mut cursor = saved;
        let mut fc_refs = vec![None; block.interface.fields.len()];
        for param in params {
            let index = param.field.ok_or_else(|| unlinked(param))?;
            let field = block.interface.fields.get(index).ok_or_else(|| unlinked(param))?;
            let fc_ref = self.fc_param(field, param, &mut cursor)?;
            fc_refs[index] = Some(fc_ref);
        }
        self.frame_mut()?.l = cursor;

        let l = self.open_callee_frame(cursor, block.interface.temp_allocation)?;
        let mut frame = Frame::new(block, l);
        frame.fc_refs = fc_refs;
        frame.prev_db = self.db_register;
        frame.prev_di = self.di_register;
        frame.prev_ar2 = self.ar2;
        frame.caller_l = Some(saved);
        self.push_frame(frame);
        Ok(())
    }

    /// Translate one FC actual parameter. Scratch copies are allocated
    /// through `cursor`, the caller's allocation state.
    fn fc_param(&mut self, field: &InterfaceField, param: &ParamAssign, cursor: &mut LFrame) -> AwlResult<FcRef> {
        let caller_base = cursor.base;
        let resolved = self.resolve(&param.rvalue, field.is_outbound())?;

        if field.data_type.is_compound() {
            let Resolved::Loc(loc, _) = resolved else {
                return Err(AwlError::fault(format!(
                    "Compound parameter '{}' needs a memory operand",
                    field.name
                )));
            };
            // Data further up the stack is addressed relative to itself
            let v_base = match loc {
                Location::Lstack(o) if o.byte < caller_base => o.byte,
                _ => caller_base,
            };
            let pointer = self.encode_db_pointer(loc, v_base)?;
            let slot = self.lstack.alloc(cursor, 48)?.byte + caller_base;
            self.lstack.memory.store_bytes(slot, &pointer.to_bytes())?;
            return Ok(FcRef::Compound { slot, v_base });
        }

        if let Some(value) = self.pointer_param_value(&field.data_type, &resolved, caller_base)? {
            return self.fc_scratch(value, cursor);
        }

        match resolved {
            Resolved::Loc(..) | Resolved::Timer(_) | Resolved::Counter(_) | Resolved::Block(_) => {
                Ok(FcRef::Direct(resolved))
            }
            _ if field.is_outbound() => Err(AwlError::fault(format!(
                "Output parameter '{}' needs a memory operand, got '{}'",
                field.name, param.rvalue
            ))),
            Resolved::Imm(imm) => {
                let width = field.data_type.width().unwrap_or(imm.width);
                self.fc_scratch(Value::scalar(width, imm.value), cursor)
            }
            other => {
                let value = self.fetch_resolved(&other, true)?;
                self.fc_scratch(value, cursor)
            }
        }
    }

    /// Copy `value` into the caller's local data and reference the copy
    fn fc_scratch(&mut self, value: Value, cursor: &mut LFrame) -> AwlResult<FcRef> {
        let width = value.width();
        let offset = self.lstack.alloc(cursor, width)?;
        let loc = Location::Lstack(offset.add_bytes(cursor.base));
        self.store_loc(loc, &value)?;
        Ok(FcRef::Direct(Resolved::Loc(loc, width)))
    }

    /// POINTER and ANY parameters receive a pointer to the actual operand
    fn pointer_param_value(
        &self,
        data_type: &DataType,
        resolved: &Resolved,
        v_base: u32,
    ) -> AwlResult<Option<Value>> {
        match (data_type, resolved) {
            (DataType::Pointer, Resolved::Loc(loc, _)) => {
                let pointer = self.encode_db_pointer(*loc, v_base)?;
                Ok(Some(Value::scalar(48, pointer.to_u64())))
            }
            (DataType::Pointer, Resolved::Imm(imm)) => {
                let pointer = Pointer(imm.value as u32).to_db_pointer(0);
                Ok(Some(Value::scalar(48, pointer.to_u64())))
            }
            (DataType::Any, Resolved::Loc(loc, width)) => {
                let pointer = self.encode_db_pointer(*loc, v_base)?;
                let any = AnyPointer::from_bit_width(pointer.pointer, pointer.db, *width)?;
                Ok(Some(Value::Bytes(any.to_bytes().to_vec())))
            }
            (DataType::Pointer | DataType::Any, _) => Err(AwlError::fault(format!(
                "{} parameter needs a memory operand",
                data_type
            ))),
            _ => Ok(None),
        }
    }

    fn enter_fb(&mut self, block: Rc<CodeBlock>, db: u16, base: Offset, params: &[ParamAssign]) -> AwlResult<()> {
        let caller_l = self.frame()?.l;
        let inst = block
            .interface
            .instance_struct
            .clone()
            .ok_or_else(|| AwlError::bug(format!("{} has no instance struct", block.name())))?;

        let mut outbound = Vec::new();
        for param in params {
            let index = param.field.ok_or_else(|| unlinked(param))?;
            let field = block.interface.fields.get(index).ok_or_else(|| unlinked(param))?;
            let member = inst
                .field(&field.name)
                .ok_or_else(|| AwlError::bug(format!("Parameter '{}' missing in instance", field.name)))?;
            let inst_offset = base + member.offset;
            let inst_loc = Location::Db { db, offset: inst_offset };

            if field.is_fb_pointer_param(BlockKind::Fb) {
                let Resolved::Loc(loc, _) = self.resolve(&param.rvalue, false)? else {
                    return Err(AwlError::fault(format!(
                        "Compound parameter '{}' needs a memory operand",
                        field.name
                    )));
                };
                let pointer = self.encode_db_pointer(loc, caller_l.base)?;
                self.store_loc(inst_loc, &Value::scalar(48, pointer.to_u64()))?;
                continue;
            }

            if field.is_inbound() {
                let resolved = self.resolve(&param.rvalue, false)?;
                let value = if field.data_type.is_call_by_ref() {
                    let number = match resolved {
                        Resolved::Timer(n) | Resolved::Counter(n) => n,
                        Resolved::Block(b) => b.index,
                        _ => {
                            return Err(AwlError::fault(format!(
                                "Parameter '{}' needs a {} operand",
                                field.name, field.data_type
                            )))
                        }
                    };
                    Value::scalar(16, u64::from(number))
                } else {
                    match self.pointer_param_value(&field.data_type, &resolved, caller_l.base)? {
                        Some(value) => value,
                        None => self
                            .fetch_resolved(&resolved, member.bit_size == 1)?
                            .resized(member.bit_size),
                    }
                };
                self.store_loc(inst_loc, &value)?;
            }

            if field.is_outbound() {
                match self.resolve(&param.rvalue, true)? {
                    Resolved::Loc(target, _) => outbound.push(Outbound {
                        inst_offset,
                        width: member.bit_size,
                        target,
                    }),
                    _ => {
                        return Err(AwlError::fault(format!(
                            "Output parameter '{}' needs a memory operand, got '{}'",
                            field.name, param.rvalue
                        )))
                    }
                }
            }
        }

        let l = self.open_callee_frame(caller_l, block.interface.temp_allocation)?;
        let mut frame = Frame::new(block, l);
        frame.instance_db = Some(db);
        frame.di_base = base;
        frame.prev_db = self.db_register;
        frame.prev_di = self.di_register;
        frame.prev_ar2 = self.ar2;
        frame.outbound = outbound;

        self.db_register = self.di_register;
        self.di_register = Some(db);
        self.ar2 = Pointer::new(Some(Area::InstanceDb), base)?.value();
        self.push_frame(frame);
        Ok(())
    }

    /// Pop the current frame and return to the caller
    pub(super) fn exit_block(&mut self) -> AwlResult<()> {
        let frame = self.call_stack.pop().ok_or_else(no_frame)?;
        debug!("Leaving {}", frame.block.name());
        if let (Some(caller), Some(l)) = (self.call_stack.last_mut(), frame.caller_l) {
            caller.l = l;
        }
        if frame.raw_call {
            return Ok(());
        }
        match frame.instance_db {
            Some(db) => {
                for out in &frame.outbound {
                    let value = self.fetch_loc(
                        Location::Db {
                            db,
                            offset: out.inst_offset,
                        },
                        out.width,
                    )?;
                    self.store_loc(out.target, &value)?;
                }
                self.db_register = Some(db);
            }
            None => self.db_register = frame.prev_db,
        }
        self.di_register = frame.prev_di;
        self.ar2 = frame.prev_ar2;
        Ok(())
    }
}

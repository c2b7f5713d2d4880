//! Compiled blocks and program linking
//!
//! `translate` turns one raw code block into a [`CodeBlock`]. `Program::build`
//! translates a whole raw program, lays out data blocks and links CALL
//! parameters against the callee interfaces.

use crate::config::MnemonicsSetting;
use crate::datatypes::{DataType, FieldDecl};
use crate::insn::{InsnKind, Instruction, Mnemonics, ParamAssign};
use crate::interface::{fb_instance_sections, BlockInterface, InterfaceField};
use crate::memory::{Memory, Value};
use crate::offset::Offset;
use crate::operand::{
    BlockRef, BlockRefKind, DbVarBinding, DbVariable, Immediate, ImmKind, IndirectTarget, LocalBinding, NamedLocal, Operand,
};
use crate::optrans::OperandTranslator;
use crate::raw::{RawBlock, RawDataBlock, RawField, RawInsn, RawProgram, Section, SourceRef};
use crate::structure::{LayoutBuilder, Struct, StructError, TypeSource};
use crate::symbols::SymbolTable;
use crate::sysblocks::{self, Routine};
use awl_common::{AwlError, AwlResult, BlockInfo, BlockKind, SourceId};
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

/// Index-addressed block slots
#[derive(Debug, Clone)]
pub struct BlockTable<T> {
    slots: Vec<Option<T>>,
}

impl<T> Default for BlockTable<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T> BlockTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: u16) -> Option<&T> {
        self.slots.get(usize::from(index)).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, index: u16) -> Option<&mut T> {
        self.slots.get_mut(usize::from(index)).and_then(|s| s.as_mut())
    }

    pub fn contains(&self, index: u16) -> bool {
        self.get(index).is_some()
    }

    /// Insert into a slot, returning what was there before
    pub fn insert(&mut self, index: u16, item: T) -> Option<T> {
        let i = usize::from(index);
        if self.slots.len() <= i {
            self.slots.resize_with(i + 1, || None);
        }
        self.slots[i].replace(item)
    }

    pub fn remove(&mut self, index: u16) -> Option<T> {
        self.slots.get_mut(usize::from(index)).and_then(|s| s.take())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|item| (i as u16, item)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u16, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|item| (i as u16, item)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct CodeBlock {
    pub kind: BlockKind,
    pub index: u16,
    pub interface: BlockInterface,
    pub insns: Vec<Instruction>,
    pub labels: HashMap<String, usize>,
    pub source: SourceRef,
    pub hash: String,
    /// Set for system blocks, which have no instructions
    pub routine: Option<Routine>,
}

impl CodeBlock {
    pub fn info(&self) -> BlockInfo {
        BlockInfo::new(self.kind, self.index, self.hash.clone())
    }

    pub fn name(&self) -> String {
        match (self.routine, self.kind) {
            (Some(_), BlockKind::Fb) => format!("SFB {}", self.index),
            (Some(_), _) => format!("SFC {}", self.index),
            (None, kind) => format!("{} {}", kind, self.index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Global,
    Instance { fb: u16 },
    SfbInstance { sfb: u16 },
    /// DB 0, not accessible by user code
    System,
}

#[derive(Debug, Clone)]
pub struct DataBlock {
    pub index: u16,
    pub kind: DbKind,
    pub structure: Rc<Struct>,
    pub memory: Memory,
    pub source: SourceRef,
    pub hash: String,
}

impl DataBlock {
    pub fn system() -> Self {
        Self {
            index: 0,
            kind: DbKind::System,
            structure: Rc::new(Struct::new()),
            memory: Memory::new(0),
            source: SourceRef::default(),
            hash: String::new(),
        }
    }

    fn check_access(&self, what: &str) -> AwlResult<()> {
        if self.kind == DbKind::System {
            return Err(AwlError::fault(format!("{} access to DB {} denied", what, self.index)));
        }
        Ok(())
    }

    pub fn fetch(&self, offset: Offset, width: u32) -> AwlResult<Value> {
        self.check_access("Read")?;
        self.memory.fetch(offset, width)
    }

    pub fn store(&mut self, offset: Offset, value: &Value) -> AwlResult<()> {
        self.check_access("Write")?;
        self.memory.store(offset, value)
    }

    pub fn size(&self) -> u32 {
        self.memory.len() as u32
    }

    pub fn info(&self) -> BlockInfo {
        BlockInfo::new(BlockKind::Db, self.index, self.hash.clone())
    }
}

#[derive(Debug, Clone)]
pub struct Udt {
    pub index: u16,
    pub structure: Rc<Struct>,
    pub source: SourceRef,
    pub hash: String,
}

/// UDT and FB declarations of a raw program, for the layout builder
#[derive(Debug, Default)]
pub struct ProgramTypes {
    udts: HashMap<u16, Vec<FieldDecl>>,
    fbs: HashMap<u16, Vec<Vec<FieldDecl>>>,
}

impl ProgramTypes {
    pub fn from_program(raw: &RawProgram) -> AwlResult<Self> {
        let mut types = ProgramTypes::default();
        for udt in &raw.udts {
            let fields = raw_fields_to_decls(&udt.fields)?;
            if types.udts.insert(udt.index, fields).is_some() {
                return Err(AwlError::compile(format!("Multiple definitions of UDT {}", udt.index)));
            }
        }
        for fb in &raw.fbs {
            let sections = fb_instance_sections(&fb.interface)?;
            if types.fbs.insert(fb.index, sections).is_some() {
                return Err(AwlError::compile(format!("Multiple definitions of FB {}", fb.index)));
            }
        }
        Ok(types)
    }
}

impl TypeSource for ProgramTypes {
    fn udt_fields(&self, index: u16) -> Option<&[FieldDecl]> {
        self.udts.get(&index).map(|v| v.as_slice())
    }

    fn fb_sections(&self, index: u16) -> Option<Vec<&[FieldDecl]>> {
        self.fbs
            .get(&index)
            .map(|s| s.iter().map(|v| v.as_slice()).collect())
    }
}

fn raw_fields_to_decls(fields: &[RawField]) -> AwlResult<Vec<FieldDecl>> {
    fields
        .iter()
        .map(|f| {
            Ok(FieldDecl {
                name: f.name.clone(),
                data_type: DataType::parse(&f.data_type)?,
                init: f.init.clone(),
            })
        })
        .collect()
}

/// Translates raw code blocks with one mnemonic set
pub struct BlockTranslator<'a> {
    optrans: OperandTranslator<'a>,
    extended: bool,
}

impl<'a> BlockTranslator<'a> {
    pub fn new(mnemonics: Mnemonics, symbols: &'a SymbolTable) -> Self {
        Self {
            optrans: OperandTranslator::new(mnemonics).with_symbols(symbols),
            extended: false,
        }
    }

    /// Accept the simulator-only `__` instructions
    pub fn with_extended(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }

    pub fn mnemonics(&self) -> Mnemonics {
        self.optrans.mnemonics()
    }

    /// Translate a raw code block. The interface is built with `builder`.
    pub fn translate<S: TypeSource>(
        &self,
        raw: &RawBlock,
        builder: &mut LayoutBuilder<'_, S>,
    ) -> AwlResult<CodeBlock> {
        let block_loc = raw.source.location(raw.insns.first().map_or(0, |i| i.line));
        let interface = BlockInterface::build(raw.kind, raw.index, &raw.interface, builder)
            .map_err(|e| e.with_location(block_loc.clone()))?;

        let mut insns = Vec::with_capacity(raw.insns.len());
        let mut labels = HashMap::new();
        for raw_insn in &raw.insns {
            let ctx = |e: AwlError| {
                e.with_location(raw.source.location(raw_insn.line))
                    .with_insn(raw_insn.text())
            };
            if let Some(label) = &raw_insn.label {
                if labels.insert(label.clone(), insns.len()).is_some() {
                    return Err(ctx(AwlError::compile(format!("Duplicate jump label '{}'", label))));
                }
            }
            insns.push(self.translate_insn(raw_insn, &interface).map_err(ctx)?);
        }

        for (insn, raw_insn) in insns.iter_mut().zip(&raw.insns) {
            if !insn.kind.is_jump() {
                continue;
            }
            let Some(Operand::Label(label)) = insn.ops.first() else {
                continue;
            };
            let target = labels.get(label).copied().ok_or_else(|| {
                AwlError::compile(format!("Jump label '{}' not found", label))
                    .with_location(raw.source.location(raw_insn.line))
                    .with_insn(raw_insn.text())
            })?;
            insn.target = Some(target);
        }

        debug!(
            "Translated {} {} ({} insns, {} mnemonics)",
            raw.kind,
            raw.index,
            insns.len(),
            self.mnemonics()
        );
        let mut block = CodeBlock {
            kind: raw.kind,
            index: raw.index,
            interface,
            insns,
            labels,
            source: raw.source.clone(),
            hash: String::new(),
            routine: None,
        };
        block.hash = hash_code_block(&block, &raw.interface);
        Ok(block)
    }

    fn translate_insn(&self, raw: &RawInsn, iface: &BlockInterface) -> AwlResult<Instruction> {
        let mnemonics = self.mnemonics();
        // `U(` may come split into `U` and `(`
        let (name, tokens): (String, &[String]) = if raw.tokens.len() == 1
            && raw.tokens[0] == "("
            && InsnKind::lookup(&format!("{}(", raw.name), mnemonics).is_some()
        {
            (format!("{}(", raw.name), &[])
        } else {
            (raw.name.clone(), &raw.tokens)
        };
        let mut kind = InsnKind::lookup(&name, mnemonics)
            .filter(|k| self.extended || !k.is_extended())
            .ok_or_else(|| AwlError::compile(format!("Unknown instruction '{}'", name)))?;

        let (mut ops, mut params) = if kind.is_jump() {
            match tokens {
                [label] => (vec![Operand::Label(label.clone())], Vec::new()),
                _ => {
                    return Err(AwlError::compile(format!(
                        "Jump instruction '{}' needs exactly one label",
                        name
                    )))
                }
            }
        } else {
            self.optrans.translate_list(tokens)?
        };

        if !params.is_empty() && !kind.takes_params() {
            return Err(AwlError::compile(format!("'{}' does not take a parameter list", name)));
        }
        let (min, max) = kind.operand_count();
        if ops.len() < min || ops.len() > max {
            return Err(AwlError::compile(format!(
                "Invalid number of operands for '{}': expected {}..{}, got {}",
                name,
                min,
                max,
                ops.len()
            )));
        }
        if kind == InsnKind::Nop0 {
            kind = match ops.first() {
                Some(Operand::Imm(imm)) if imm.kind == ImmKind::Int && imm.value == 0 => InsnKind::Nop0,
                Some(Operand::Imm(imm)) if imm.kind == ImmKind::Int && imm.value == 1 => InsnKind::Nop1,
                _ => return Err(AwlError::compile("NOP needs operand 0 or 1")),
            };
        }

        for op in ops.iter_mut() {
            bind_operand(op, iface)?;
        }
        for param in params.iter_mut() {
            bind_operand(&mut param.rvalue, iface)?;
        }
        // DB variables are checked once they are bound at link time
        if !ops.iter().any(|op| matches!(op, Operand::DbVar(_))) {
            check_operands(kind, &ops, &name)?;
        }

        Ok(Instruction {
            kind,
            ops,
            params,
            target: None,
            line: raw.line,
            text: raw.text(),
        })
    }
}

/// Bind `#name` references (also inside indirect offsets) to the interface
fn bind_operand(op: &mut Operand, iface: &BlockInterface) -> AwlResult<()> {
    match op {
        Operand::Local(local) => {
            let binding = iface.bind(&local.name, &local.indices)?;
            let multi_instance = match (&binding.data_type, binding.binding) {
                (DataType::FbInstance(fb), LocalBinding::Instance { offset }) => {
                    Some((BlockRef::new(BlockRefKind::Fb, *fb), offset))
                }
                (DataType::SfbInstance(sfb), LocalBinding::Instance { offset }) => {
                    Some((BlockRef::new(BlockRefKind::Sfb, *sfb), offset))
                }
                _ => None,
            };
            match multi_instance {
                Some((block, offset)) => *op = Operand::MultiInstance { block, offset },
                None => apply_binding(local, binding),
            }
        }
        Operand::LocalPointer(local) => {
            let binding = iface.bind(&local.name, &local.indices)?;
            apply_binding(local, binding);
        }
        Operand::Indirect(ind) => bind_operand(&mut ind.offset, iface)?,
        _ => {}
    }
    Ok(())
}

fn apply_binding(local: &mut NamedLocal, binding: crate::interface::Binding) {
    local.binding = binding.binding;
    local.width = binding.width;
    local.data_type = Some(binding.data_type);
}

fn is_bit_operand(op: &Operand) -> bool {
    op.width() == Some(1) || matches!(op, Operand::Local(l) if l.width == 1)
}

/// Static operand checks that need no runtime information
fn check_operands(kind: InsnKind, ops: &[Operand], name: &str) -> AwlResult<()> {
    let bad = |op: &Operand| AwlError::compile(format!("Invalid operand '{}' for '{}'", op, name));
    let Some(op) = ops.first() else {
        return Ok(());
    };
    match kind {
        InsnKind::U | InsnKind::UN | InsnKind::O | InsnKind::ON | InsnKind::X | InsnKind::XN => {
            let ok = is_bit_operand(op)
                || matches!(op, Operand::Timer(_) | Operand::Counter(_))
                || matches!(op, Operand::Indirect(ind) if ind.target.is_extended())
                || matches!(op, Operand::Local(l) if l.is_call_by_ref());
            if !ok || matches!(op, Operand::Imm(_)) {
                return Err(bad(op));
            }
        }
        InsnKind::Assign | InsnKind::Fp | InsnKind::Fn => {
            if !is_bit_operand(op) || matches!(op, Operand::Imm(_) | Operand::Condition(_)) {
                return Err(bad(op));
            }
        }
        InsnKind::S | InsnKind::R => {
            let ok = (is_bit_operand(op) && !matches!(op, Operand::Imm(_) | Operand::Condition(_)))
                || matches!(op, Operand::Timer(_) | Operand::Counter(_))
                || matches!(op, Operand::Indirect(ind) if ind.target.is_extended())
                || matches!(op, Operand::Local(l) if l.is_call_by_ref());
            if !ok {
                return Err(bad(op));
            }
        }
        InsnKind::T => {
            if matches!(op, Operand::Imm(_) | Operand::Condition(_) | Operand::Block(_)) {
                return Err(bad(op));
            }
        }
        InsnKind::Call | InsnKind::Uc | InsnKind::Cc => {
            let ok = matches!(
                op,
                Operand::Block(b) if matches!(b.kind, BlockRefKind::Fc | BlockRefKind::Fb | BlockRefKind::Sfc | BlockRefKind::Sfb)
            ) || matches!(op, Operand::MultiInstance { .. })
                || matches!(op, Operand::Indirect(ind) if ind.target.is_extended())
                || matches!(op, Operand::Local(l) if l.is_call_by_ref());
            if !ok {
                return Err(bad(op));
            }
            if kind == InsnKind::Call {
                if let Some(db) = ops.get(1) {
                    if !matches!(db, Operand::Block(b) if b.kind == BlockRefKind::Db) {
                        return Err(bad(db));
                    }
                }
            }
        }
        InsnKind::Auf => {
            let ok = matches!(op, Operand::Block(b) if matches!(b.kind, BlockRefKind::Db | BlockRefKind::Di))
                || matches!(op, Operand::Indirect(ind) if ind.target == IndirectTarget::BlockDb)
                || matches!(op, Operand::Local(l) if l.is_call_by_ref());
            if !ok {
                return Err(bad(op));
            }
        }
        InsnKind::Si | InsnKind::Sv | InsnKind::Se | InsnKind::Ss | InsnKind::Sa => {
            let ok = matches!(op, Operand::Timer(_))
                || matches!(op, Operand::Indirect(ind) if ind.target == IndirectTarget::Timer)
                || matches!(op, Operand::Local(l) if l.is_call_by_ref());
            if !ok {
                return Err(bad(op));
            }
        }
        InsnKind::Fr => {
            let ok = matches!(op, Operand::Timer(_) | Operand::Counter(_))
                || matches!(op, Operand::Indirect(ind) if matches!(ind.target, IndirectTarget::Timer | IndirectTarget::Counter))
                || matches!(op, Operand::Local(l) if l.is_call_by_ref());
            if !ok {
                return Err(bad(op));
            }
        }
        InsnKind::Zv | InsnKind::Zr => {
            let ok = matches!(op, Operand::Counter(_))
                || matches!(op, Operand::Indirect(ind) if ind.target == IndirectTarget::Counter)
                || matches!(op, Operand::Local(l) if l.is_call_by_ref());
            if !ok {
                return Err(bad(op));
            }
        }
        InsnKind::AddImm | InsnKind::Inc | InsnKind::Dec | InsnKind::Bld => {
            if !matches!(op, Operand::Imm(_)) {
                return Err(bad(op));
            }
        }
        _ => {}
    }
    Ok(())
}

fn hash_code_block(block: &CodeBlock, fields: &[RawField]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{} {}\n", block.kind, block.index));
    hash_fields(&mut hasher, fields);
    for insn in &block.insns {
        hasher.update(insn.text.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

fn hash_fields(hasher: &mut Sha256, fields: &[RawField]) {
    for f in fields {
        hasher.update(format!("{}:{}:{}", f.name, f.section, f.data_type.to_ascii_uppercase()));
        if let Some(init) = &f.init {
            hasher.update(format!(":={}", init.join(" ")));
        }
        hasher.update(b"\n");
    }
}

fn hash_data_block(index: u16, kind: DbKind, fields: &[RawField]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("DB {} {:?}\n", index, kind));
    hash_fields(&mut hasher, fields);
    hex::encode(hasher.finalize())
}

/// A translated and linked program
#[derive(Debug, Default)]
pub struct Program {
    pub obs: BlockTable<Rc<CodeBlock>>,
    pub fbs: BlockTable<Rc<CodeBlock>>,
    pub fcs: BlockTable<Rc<CodeBlock>>,
    pub sfbs: BlockTable<Rc<CodeBlock>>,
    pub sfcs: BlockTable<Rc<CodeBlock>>,
    pub dbs: BlockTable<DataBlock>,
    pub udts: BlockTable<Udt>,
    /// Which blocks came from which source
    pub sources: HashMap<SourceId, BTreeSet<(BlockKind, u16)>>,
}

impl Program {
    pub fn build(raw: &RawProgram, setting: MnemonicsSetting, extended: bool) -> AwlResult<(Program, Mnemonics)> {
        let types = ProgramTypes::from_program(raw)?;
        let mnemonics = match setting {
            MnemonicsSetting::De => Mnemonics::De,
            MnemonicsSetting::En => Mnemonics::En,
            MnemonicsSetting::Auto => detect_mnemonics(raw, &types, extended),
        };
        let mut builder = LayoutBuilder::new(&types);
        let mut program = Program::default();

        for udt in &raw.udts {
            let structure = builder.build_udt(udt.index)?;
            let mut hasher = Sha256::new();
            hasher.update(format!("UDT {}\n", udt.index));
            hash_fields(&mut hasher, &udt.fields);
            program.note_source(&udt.source, BlockKind::Udt, udt.index);
            program.udts.insert(
                udt.index,
                Udt {
                    index: udt.index,
                    structure,
                    source: udt.source.clone(),
                    hash: hex::encode(hasher.finalize()),
                },
            );
        }

        let translator = BlockTranslator::new(mnemonics, &raw.symbols).with_extended(extended);
        let code_blocks = raw.obs.iter().chain(&raw.fbs).chain(&raw.fcs);
        let mut translated = Vec::new();
        for raw_block in code_blocks {
            if raw_block.kind == BlockKind::Db || raw_block.kind == BlockKind::Udt {
                return Err(AwlError::compile(format!(
                    "{} {} is not a code block",
                    raw_block.kind, raw_block.index
                )));
            }
            translated.push(translator.translate(raw_block, &mut builder)?);
        }

        for raw_db in &raw.dbs {
            let db = build_data_block(raw_db, &mut builder)?;
            program.note_source(&raw_db.source, BlockKind::Db, raw_db.index);
            if program.dbs.insert(raw_db.index, db).is_some() {
                return Err(AwlError::compile(format!("Multiple definitions of DB {}", raw_db.index)));
            }
        }

        let system = sysblocks::build_all(&mut builder)?;

        // Link CALL parameters. Interfaces are looked up in the
        // translated (not yet shared) blocks.
        let interfaces: HashMap<BlockRef, BlockInterface> = translated
            .iter()
            .map(|b| {
                let kind = match b.kind {
                    BlockKind::Ob => BlockRefKind::Ob,
                    BlockKind::Fb => BlockRefKind::Fb,
                    _ => BlockRefKind::Fc,
                };
                (BlockRef::new(kind, b.index), b.interface.clone())
            })
            .chain(system.iter().map(|(r, b)| (*r, b.interface.clone())))
            .collect();
        for block in translated.iter_mut() {
            bind_db_variables(block, &program.dbs, mnemonics)?;
            link_block(block, &interfaces)?;
        }

        for block in translated {
            program.note_source(&block.source, block.kind, block.index);
            let (kind, index) = (block.kind, block.index);
            let table = match kind {
                BlockKind::Ob => &mut program.obs,
                BlockKind::Fb => &mut program.fbs,
                _ => &mut program.fcs,
            };
            if table.insert(index, Rc::new(block)).is_some() {
                return Err(AwlError::compile(format!("Multiple definitions of {} {}", kind, index)));
            }
        }
        for (block_ref, block) in system {
            let table = match block_ref.kind {
                BlockRefKind::Sfb => &mut program.sfbs,
                _ => &mut program.sfcs,
            };
            table.insert(block_ref.index, Rc::new(block));
        }
        program.dbs.insert(0, DataBlock::system());

        info!(
            "Program built: {} OBs, {} FBs, {} FCs, {} DBs, {} UDTs ({} mnemonics)",
            program.obs.len(),
            program.fbs.len(),
            program.fcs.len(),
            program.dbs.len() - 1,
            program.udts.len(),
            mnemonics
        );
        Ok((program, mnemonics))
    }

    fn note_source(&mut self, source: &SourceRef, kind: BlockKind, index: u16) {
        self.sources.entry(source.id).or_default().insert((kind, index));
    }

    /// Remove every block that came from `source`. Returns the removed
    /// block identities.
    pub fn unload_source(&mut self, source: SourceId) -> Vec<(BlockKind, u16)> {
        let owners = self.sources.remove(&source).unwrap_or_default();
        for (kind, index) in &owners {
            match kind {
                BlockKind::Ob => {
                    self.obs.remove(*index);
                }
                BlockKind::Fb => {
                    self.fbs.remove(*index);
                }
                BlockKind::Fc => {
                    self.fcs.remove(*index);
                }
                BlockKind::Db => {
                    if *index != 0 {
                        self.dbs.remove(*index);
                    }
                }
                BlockKind::Udt => {
                    self.udts.remove(*index);
                }
            }
        }
        owners.into_iter().collect()
    }

    /// Descriptors of all user blocks, ordered by kind and index
    pub fn block_infos(&self) -> Vec<BlockInfo> {
        let mut infos: Vec<BlockInfo> = self
            .obs
            .iter()
            .chain(self.fbs.iter())
            .chain(self.fcs.iter())
            .map(|(_, b)| b.info())
            .chain(
                self.dbs
                    .iter()
                    .filter(|(_, db)| db.kind != DbKind::System)
                    .map(|(_, db)| db.info()),
            )
            .chain(self.udts.iter().map(|(i, u)| BlockInfo::new(BlockKind::Udt, i, u.hash.clone())))
            .collect();
        infos.sort_by_key(|i| (i.kind, i.index));
        infos
    }
}

fn build_data_block<S: TypeSource>(raw: &RawDataBlock, builder: &mut LayoutBuilder<'_, S>) -> AwlResult<DataBlock> {
    if raw.index == 0 {
        return Err(AwlError::compile("DB 0 is reserved"));
    }
    let (kind, structure) = match (raw.instance_of, raw.instance_of_sfb) {
        (Some(fb), None) => {
            let st = builder.build_fb(fb).map_err(|e| match e {
                StructError::UnknownFb(_) => AwlError::compile(format!(
                    "Instance DB {} references FB {} which does not exist",
                    raw.index, fb
                )),
                other => other.into(),
            })?;
            (DbKind::Instance { fb }, st)
        }
        (None, Some(sfb)) => {
            let st = builder.build_sfb(sfb).map_err(|e| match e {
                StructError::UnknownSfb(_) => AwlError::compile(format!(
                    "Instance DB {} references SFB {} which does not exist",
                    raw.index, sfb
                )),
                other => other.into(),
            })?;
            (DbKind::SfbInstance { sfb }, st)
        }
        (Some(fb), Some(sfb)) => {
            return Err(AwlError::compile(format!(
                "DB {} cannot be an instance DB of both FB {} and SFB {}",
                raw.index, fb, sfb
            )))
        }
        (None, None) => {
            let decls = raw_fields_to_decls(&raw.fields)?;
            (DbKind::Global, Rc::new(builder.build_fields(&decls)?))
        }
    };
    let mut memory = structure.init_image()?;
    if kind != DbKind::Global {
        // Instance DBs may override initial values of existing fields
        for field in &raw.fields {
            let Some(init) = &field.init else { continue };
            let sf = structure.field(&field.name).ok_or_else(|| {
                AwlError::compile(format!("DB {}: field '{}' not in FB interface", raw.index, field.name))
            })?;
            let value = sf.data_type.parse_init(init)?;
            memory.store(sf.offset, &value)?;
        }
    }
    debug!("Built DB {} ({} bytes, {:?})", raw.index, memory.len(), kind);
    Ok(DataBlock {
        index: raw.index,
        kind,
        structure,
        memory,
        source: raw.source.clone(),
        hash: hash_data_block(raw.index, kind, &raw.fields),
    })
}

/// Translate every code block with both mnemonic sets and pick the one
/// without errors. Otherwise the one with fewer errors wins, EN on a tie.
pub fn detect_mnemonics<S: TypeSource>(raw: &RawProgram, types: &S, extended: bool) -> Mnemonics {
    let count_errors = |mnemonics: Mnemonics| -> usize {
        let translator = BlockTranslator::new(mnemonics, &raw.symbols).with_extended(extended);
        let mut builder = LayoutBuilder::new(types);
        raw.obs
            .iter()
            .chain(&raw.fbs)
            .chain(&raw.fcs)
            .filter(|b| translator.translate(b, &mut builder).is_err())
            .count()
    };
    let en = count_errors(Mnemonics::En);
    if en == 0 {
        return Mnemonics::En;
    }
    let de = count_errors(Mnemonics::De);
    let chosen = if de < en { Mnemonics::De } else { Mnemonics::En };
    debug!("Mnemonics detection: EN {} errors, DE {} errors -> {}", en, de, chosen);
    chosen
}

/// Bind `DBn.name` operands against the data block layouts
fn bind_db_variables(block: &mut CodeBlock, dbs: &BlockTable<DataBlock>, mnemonics: Mnemonics) -> AwlResult<()> {
    let source = block.source.clone();
    for insn in block.insns.iter_mut() {
        let (line, text) = (insn.line, insn.text.clone());
        let ctx = |e: AwlError| e.with_location(source.location(line)).with_insn(text.clone());
        let mut bound = false;
        let operands = insn.ops.iter_mut().chain(insn.params.iter_mut().map(|p| &mut p.rvalue));
        for op in operands {
            if let Operand::DbVar(var) = op {
                bind_db_variable(var, dbs).map_err(&ctx)?;
                bound = true;
            }
        }
        if bound {
            check_operands(insn.kind, &insn.ops, insn.kind.name(mnemonics)).map_err(&ctx)?;
        }
    }
    Ok(())
}

fn bind_db_variable(var: &mut DbVariable, dbs: &BlockTable<DataBlock>) -> AwlResult<()> {
    let db = dbs
        .get(var.db)
        .ok_or_else(|| AwlError::compile(format!("'{}': DB {} does not exist", var, var.db)))?;
    let (offset, width, data_type) = if var.indices.is_empty() {
        let field = db
            .structure
            .field(&var.name)
            .ok_or_else(|| AwlError::compile(format!("'{}': DB {} has no field '{}'", var, var.db, var.name)))?;
        (field.offset, field.bit_size, field.data_type.clone())
    } else {
        db.structure.array_element(&var.name, &var.indices)?
    };
    var.binding = Some(DbVarBinding {
        offset,
        width,
        data_type,
    });
    Ok(())
}

fn link_block(block: &mut CodeBlock, interfaces: &HashMap<BlockRef, BlockInterface>) -> AwlResult<()> {
    let source = block.source.clone();
    for insn in block.insns.iter_mut() {
        if !matches!(insn.kind, InsnKind::Call | InsnKind::Uc | InsnKind::Cc) {
            continue;
        }
        let (line, text) = (insn.line, insn.text.clone());
        let ctx = |e: AwlError| e.with_location(source.location(line)).with_insn(text.clone());
        let callee = match insn.ops.first() {
            Some(Operand::Block(b)) if b.kind != BlockRefKind::Ob => interfaces.get(b),
            Some(Operand::MultiInstance { block, .. }) => interfaces.get(block),
            _ => None,
        };
        // A missing callee is a runtime fault at CALL time
        let Some(callee) = callee else { continue };
        let call_name = insn.ops.first().map(|o| o.to_string()).unwrap_or_default();

        if insn.kind != InsnKind::Call {
            if callee.params().next().is_some() {
                return Err(ctx(AwlError::compile(format!(
                    "{} cannot be called with UC/CC: it has parameters",
                    call_name
                ))));
            }
            continue;
        }
        if callee.kind == BlockKind::Fb
            && matches!(insn.ops.first(), Some(Operand::Block(_)))
            && insn.ops.len() != 2
        {
            return Err(ctx(AwlError::compile(format!("CALL of {} needs an instance DB", call_name))));
        }
        if callee.kind == BlockKind::Fc && insn.ops.len() != 1 {
            return Err(ctx(AwlError::compile(format!("CALL of {} must not have an instance DB", call_name))));
        }

        let mut assigned = BTreeSet::new();
        for param in insn.params.iter_mut() {
            let (index, field) = callee
                .field(&param.name)
                .filter(|(_, f)| matches!(f.section, Section::In | Section::Out | Section::InOut))
                .ok_or_else(|| {
                    ctx(AwlError::compile(format!(
                        "Parameter '{}' not found in interface of {}",
                        param.name, call_name
                    )))
                })?;
            if !assigned.insert(index) {
                return Err(ctx(AwlError::compile(format!("Parameter '{}' assigned twice", param.name))));
            }
            check_param_type(field, param).map_err(&ctx)?;
            param.field = Some(index);
        }
        if callee.kind == BlockKind::Fc {
            if let Some((_, missing)) = callee.params().find(|(i, _)| !assigned.contains(i)) {
                return Err(ctx(AwlError::compile(format!(
                    "Parameter '{}' of {} is not assigned",
                    missing.name, call_name
                ))));
            }
        }
    }
    Ok(())
}

/// Type name of an actual parameter, for error messages
fn actual_type_name(op: &Operand) -> String {
    match op {
        Operand::Imm(imm) => match (imm.kind, imm.width) {
            (ImmKind::Int, _) => "INT".to_string(),
            (ImmKind::DInt, _) => "DINT".to_string(),
            (ImmKind::Real, _) => "REAL".to_string(),
            (ImmKind::S5Time, _) => "S5TIME".to_string(),
            (ImmKind::Time, _) => "TIME".to_string(),
            (ImmKind::Pointer, _) => "POINTER".to_string(),
            (ImmKind::Str, 8) => "CHAR".to_string(),
            (ImmKind::Str, _) => "STRING".to_string(),
            (_, 8) => "BYTE".to_string(),
            (_, 16) => "WORD".to_string(),
            _ => "DWORD".to_string(),
        },
        Operand::Local(NamedLocal {
            data_type: Some(dt), ..
        })
        | Operand::DbVar(DbVariable {
            binding: Some(DbVarBinding { data_type: dt, .. }),
            ..
        }) => dt.to_string(),
        Operand::Local(_) | Operand::DbVar(_) => "?".to_string(),
        Operand::Timer(_) => "TIMER".to_string(),
        Operand::Counter(_) => "COUNTER".to_string(),
        Operand::Block(b) => match b.kind {
            BlockRefKind::Db => "BLOCK_DB".to_string(),
            BlockRefKind::Fb => "BLOCK_FB".to_string(),
            BlockRefKind::Fc => "BLOCK_FC".to_string(),
            _ => b.to_string(),
        },
        other => match other.width() {
            Some(1) => "BOOL".to_string(),
            Some(8) => "BYTE".to_string(),
            Some(16) => "WORD".to_string(),
            Some(32) => "DWORD".to_string(),
            Some(w) => format!("{}-bit data", w),
            None => "?".to_string(),
        },
    }
}

fn check_param_type(field: &InterfaceField, param: &ParamAssign) -> AwlResult<()> {
    let actual = &param.rvalue;
    let mismatch = || {
        AwlError::compile(format!(
            "Type mismatch in parameter '{}': formal type {} is incompatible with actual parameter '{}' of type {}",
            field.name,
            field.data_type,
            actual,
            actual_type_name(actual)
        ))
    };
    if field.is_outbound() && matches!(actual, Operand::Imm(_)) {
        return Err(AwlError::compile(format!(
            "Immediate '{}' cannot be assigned to output parameter '{}'",
            actual, field.name
        )));
    }
    let typed = match actual {
        Operand::Local(local) => local.data_type.as_ref(),
        Operand::DbVar(var) => var.binding.as_ref().map(|b| &b.data_type),
        _ => None,
    };
    let ok = match &field.data_type {
        DataType::Timer => matches!(actual, Operand::Timer(_)) || typed == Some(&DataType::Timer),
        DataType::Counter => matches!(actual, Operand::Counter(_)) || typed == Some(&DataType::Counter),
        DataType::BlockDb => {
            matches!(actual, Operand::Block(b) if b.kind == BlockRefKind::Db) || typed == Some(&DataType::BlockDb)
        }
        DataType::BlockFb => {
            matches!(actual, Operand::Block(b) if b.kind == BlockRefKind::Fb) || typed == Some(&DataType::BlockFb)
        }
        DataType::BlockFc => {
            matches!(actual, Operand::Block(b) if b.kind == BlockRefKind::Fc) || typed == Some(&DataType::BlockFc)
        }
        DataType::Pointer | DataType::Any => matches!(
            actual,
            Operand::Mem(_)
                | Operand::Local(_)
                | Operand::DbVar(_)
                | Operand::Imm(Immediate { kind: ImmKind::Pointer, .. })
        ),
        formal if formal.is_compound() => match actual {
            Operand::Mem(_) | Operand::Local(_) | Operand::DbVar(_) => match (formal.width(), actual.width()) {
                (Some(f), Some(a)) => f == a,
                _ => match typed {
                    Some(t) => t == formal,
                    None => true,
                },
            },
            _ => false,
        },
        formal => {
            let by_ref = matches!(actual, Operand::Timer(_) | Operand::Counter(_) | Operand::Block(_));
            !by_ref && formal.width().is_some() && formal.width() == actual.width()
        }
    };
    if ok {
        Ok(())
    } else {
        Err(mismatch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn build(prog: RawProgram) -> AwlResult<Program> {
        Program::build(&prog, MnemonicsSetting::Auto, false).map(|(p, _)| p)
    }

    #[test]
    fn test_block_table_slots() {
        let mut table = BlockTable::new();
        assert!(table.insert(5, "five").is_none());
        assert_eq!(table.insert(5, "FIVE"), Some("five"));
        assert_eq!(table.get(5), Some(&"FIVE"));
        assert_eq!(table.get(4), None);
        assert_eq!(table.len(), 1);
        assert_eq!(table.remove(5), Some("FIVE"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_jump_labels_are_resolved() {
        let prog = RawProgram::new().block(RawBlock::new(BlockKind::Ob, 1).code(
            "      SPA  END\n\
                   L    1\n\
             END:  BE",
        ));
        let program = build(prog).expect("Should build");
        let ob1 = program.obs.get(1).expect("Should exist");
        assert_eq!(ob1.insns[0].target, Some(2));
        assert_eq!(ob1.labels.get("END"), Some(&2));
    }

    #[test]
    fn test_unknown_label_is_compile_error() {
        let prog = RawProgram::new().block(RawBlock::new(BlockKind::Ob, 1).code("SPA NOWHERE"));
        let err = build(prog).expect_err("Should fail");
        assert!(matches!(err, AwlError::Compile { .. }));
    }

    #[test]
    fn test_mnemonics_detection() {
        let en = RawProgram::new().block(RawBlock::new(BlockKind::Ob, 1).code("A I 0.0\n= Q 0.0"));
        let (_, m) = Program::build(&en, MnemonicsSetting::Auto, false).expect("Should build");
        assert_eq!(m, Mnemonics::En);

        let de = RawProgram::new().block(RawBlock::new(BlockKind::Ob, 1).code("U E 0.0\n= A 0.0"));
        let (_, m) = Program::build(&de, MnemonicsSetting::Auto, false).expect("Should build");
        assert_eq!(m, Mnemonics::De);
    }

    #[test]
    fn test_param_type_mismatch_names_both_types() {
        let prog = RawProgram::new()
            .block(
                RawBlock::new(BlockKind::Fc, 1)
                    .field("a", Section::In, "DINT")
                    .code("BE"),
            )
            .block(RawBlock::new(BlockKind::Ob, 1).code("CALL FC 1 (a := MW 0)"));
        let err = Program::build(&prog, MnemonicsSetting::De, false).expect_err("Should fail");
        let msg = err.message();
        assert!(msg.contains("DINT"), "{}", msg);
        assert!(msg.contains("WORD"), "{}", msg);
    }

    #[test]
    fn test_fc_parameters_must_be_assigned() {
        let prog = RawProgram::new()
            .block(
                RawBlock::new(BlockKind::Fc, 1)
                    .field("a", Section::In, "INT")
                    .field("b", Section::Out, "INT")
                    .code("BE"),
            )
            .block(RawBlock::new(BlockKind::Ob, 1).code("CALL FC 1 (a := 1)"));
        let err = Program::build(&prog, MnemonicsSetting::De, false).expect_err("Should fail");
        assert!(err.message().contains("'b'"));
    }

    #[test]
    fn test_hash_is_stable_and_content_addressed() {
        let make = |code: &str| {
            RawProgram::new()
                .block(RawBlock::new(BlockKind::Fc, 2).code("BE"))
                .block(RawBlock::new(BlockKind::Fc, 1).code(code))
        };
        let a = build(make("L 1")).expect("Should build");
        let b = build(make("L 1")).expect("Should build");
        let c = build(make("L 2")).expect("Should build");
        let hash = |p: &Program| p.fcs.get(1).map(|b| b.hash.clone()).unwrap_or_default();
        assert_eq!(hash(&a), hash(&b));
        assert_ne!(hash(&a), hash(&c));
        assert_eq!(hash(&a).len(), 64);
        assert_eq!(a.block_infos().len(), 2);
    }

    #[test]
    fn test_instance_db_uses_fb_layout() {
        let prog = RawProgram::new()
            .block(
                RawBlock::new(BlockKind::Fb, 1)
                    .field("x", Section::In, "INT")
                    .field("y", Section::Out, "INT")
                    .code("BE"),
            )
            .db(RawDataBlock::instance(2, 1).field("x", "INT", Some("3")))
            .db(RawDataBlock::global(3).field("v", "WORD", Some("W#16#BEEF")));
        let program = build(prog).expect("Should build");
        let idb = program.dbs.get(2).expect("Should exist");
        assert_eq!(idb.kind, DbKind::Instance { fb: 1 });
        assert_eq!(idb.memory.as_slice(), &[0, 3, 0, 0]);
        let db3 = program.dbs.get(3).expect("Should exist");
        assert_eq!(db3.memory.as_slice(), &[0xBE, 0xEF]);
        assert!(program.dbs.get(0).expect("Should exist").fetch(Offset::byte(0), 8).is_err());
    }

    #[test]
    fn test_sfb_instance_db() {
        let prog = RawProgram::new()
            .block(RawBlock::new(BlockKind::Ob, 1).code("CALL SFB 4, DB 6 (IN := M 0.0)"))
            .db(RawDataBlock::sfb_instance(6, 4).field("PT", "TIME", Some("T#2S")));
        let (program, _) = Program::build(&prog, MnemonicsSetting::De, false).expect("Should build");
        let idb = program.dbs.get(6).expect("Should exist");
        assert_eq!(idb.kind, DbKind::SfbInstance { sfb: 4 });
        // IN | PT | Q | ET | STATE | STIME | ATIME
        assert_eq!(idb.size(), 22);
        let pt = idb.fetch(Offset::byte(2), 32).expect("Should read PT");
        assert_eq!(pt.as_u32(), 2000);
        assert_eq!(program.sfbs.get(4).map(|b| b.name()), Some("SFB 4".to_string()));
        assert!(program.sfcs.contains(46));
        // System blocks are not user blocks
        assert!(program.block_infos().iter().all(|i| i.kind != BlockKind::Fb));

        let prog = RawProgram::new().db(RawDataBlock::sfb_instance(6, 99));
        let err = build(prog).expect_err("Should reject an unknown SFB");
        assert!(err.message().contains("SFB 99 which does not exist"), "{}", err.message());
    }

    #[test]
    fn test_unload_source() {
        let src_a = SourceRef::new(1, "a.awl");
        let src_b = SourceRef::new(2, "b.awl");
        let prog = RawProgram::new()
            .block(RawBlock::new(BlockKind::Fc, 1).with_source(src_a.clone()).code("BE"))
            .block(RawBlock::new(BlockKind::Fc, 2).with_source(src_b).code("BE"))
            .db(RawDataBlock { source: src_a, ..RawDataBlock::global(5) });
        let mut program = build(prog).expect("Should build");
        let removed = program.unload_source(1);
        assert_eq!(removed, vec![(BlockKind::Fc, 1), (BlockKind::Db, 5)]);
        assert!(program.fcs.get(1).is_none());
        assert!(program.fcs.get(2).is_some());
        assert!(program.dbs.get(5).is_none());
    }
}

//! System blocks (SFB and SFC)
//!
//! System blocks have a fixed interface and a native routine instead of
//! AWL code. They are called through the same parameter passing as user
//! blocks: an SFB behaves like an FB with an instance DB, an SFC like an
//! FC. The CPU enters a frame for the block, runs the routine against the
//! frame's interface fields and leaves the frame again.

use crate::blocks::CodeBlock;
use crate::datatypes::FieldDecl;
use crate::interface::{fb_instance_sections, BlockInterface};
use crate::operand::{BlockRef, BlockRefKind};
use crate::raw::{RawField, Section, SourceRef};
use crate::structure::{LayoutBuilder, TypeKey, TypeSource};
use awl_common::{AwlResult, BlockKind};
use std::collections::HashMap;

/// Native implementation of a system block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routine {
    /// SFB 0 CTU
    CountUp,
    /// SFB 1 CTD
    CountDown,
    /// SFB 2 CTUD
    CountUpDown,
    /// SFB 3 TP
    Pulse,
    /// SFB 4 TON
    OnDelay,
    /// SFB 5 TOF
    OffDelay,
    /// SFC 46 STOP
    Stop,
    /// SFC 47 WAIT
    Wait,
    /// SFC 64 TIME_TCK
    TimeTick,
}

type FieldSpec = (&'static str, Section, &'static str);

pub struct SystemBlockDef {
    pub block: BlockRef,
    pub name: &'static str,
    pub routine: Routine,
    fields: &'static [FieldSpec],
}

const IEC_TIMER_FIELDS: &[FieldSpec] = &[
    ("IN", Section::In, "BOOL"),
    ("PT", Section::In, "TIME"),
    ("Q", Section::Out, "BOOL"),
    ("ET", Section::Out, "TIME"),
    ("STATE", Section::Stat, "BYTE"),
    ("STIME", Section::Stat, "TIME"),
    ("ATIME", Section::Stat, "TIME"),
];

const fn sfb(index: u16, name: &'static str, routine: Routine, fields: &'static [FieldSpec]) -> SystemBlockDef {
    SystemBlockDef {
        block: BlockRef {
            kind: BlockRefKind::Sfb,
            index,
        },
        name,
        routine,
        fields,
    }
}

const fn sfc(index: u16, name: &'static str, routine: Routine, fields: &'static [FieldSpec]) -> SystemBlockDef {
    SystemBlockDef {
        block: BlockRef {
            kind: BlockRefKind::Sfc,
            index,
        },
        name,
        routine,
        fields,
    }
}

pub const SYSTEM_BLOCKS: &[SystemBlockDef] = &[
    sfb(
        0,
        "CTU",
        Routine::CountUp,
        &[
            ("CU", Section::In, "BOOL"),
            ("R", Section::In, "BOOL"),
            ("PV", Section::In, "INT"),
            ("Q", Section::Out, "BOOL"),
            ("CV", Section::Out, "INT"),
            ("CUO", Section::Stat, "BOOL"),
        ],
    ),
    sfb(
        1,
        "CTD",
        Routine::CountDown,
        &[
            ("CD", Section::In, "BOOL"),
            ("LOAD", Section::In, "BOOL"),
            ("PV", Section::In, "INT"),
            ("Q", Section::Out, "BOOL"),
            ("CV", Section::Out, "INT"),
            ("CDO", Section::Stat, "BOOL"),
        ],
    ),
    sfb(
        2,
        "CTUD",
        Routine::CountUpDown,
        &[
            ("CU", Section::In, "BOOL"),
            ("CD", Section::In, "BOOL"),
            ("R", Section::In, "BOOL"),
            ("LOAD", Section::In, "BOOL"),
            ("PV", Section::In, "INT"),
            ("QU", Section::Out, "BOOL"),
            ("QD", Section::Out, "BOOL"),
            ("CV", Section::Out, "INT"),
            ("CUO", Section::Stat, "BOOL"),
            ("CDO", Section::Stat, "BOOL"),
        ],
    ),
    sfb(3, "TP", Routine::Pulse, IEC_TIMER_FIELDS),
    sfb(4, "TON", Routine::OnDelay, IEC_TIMER_FIELDS),
    sfb(5, "TOF", Routine::OffDelay, IEC_TIMER_FIELDS),
    sfc(46, "STOP", Routine::Stop, &[]),
    sfc(47, "WAIT", Routine::Wait, &[("WT", Section::In, "INT")]),
    sfc(64, "TIME_TCK", Routine::TimeTick, &[("RET_VAL", Section::Out, "TIME")]),
];

pub fn lookup(block: BlockRef) -> Option<&'static SystemBlockDef> {
    SYSTEM_BLOCKS.iter().find(|def| def.block == block)
}

impl SystemBlockDef {
    pub fn raw_fields(&self) -> Vec<RawField> {
        self.fields
            .iter()
            .map(|(name, section, data_type)| RawField::new(name, *section, data_type))
            .collect()
    }

    /// Interface kind of the block: SFBs are FBs, SFCs are FCs
    pub fn kind(&self) -> BlockKind {
        match self.block.kind {
            BlockRefKind::Sfb => BlockKind::Fb,
            _ => BlockKind::Fc,
        }
    }

    fn build<S: TypeSource>(&self, builder: &mut LayoutBuilder<'_, S>) -> AwlResult<CodeBlock> {
        let instance = (self.kind() == BlockKind::Fb).then_some(TypeKey::Sfb(self.block.index));
        let interface =
            BlockInterface::build_with_instance(self.kind(), self.block.index, &self.raw_fields(), instance, builder)?;
        Ok(CodeBlock {
            kind: self.kind(),
            index: self.block.index,
            interface,
            insns: Vec::new(),
            labels: HashMap::new(),
            source: SourceRef::default(),
            hash: String::new(),
            routine: Some(self.routine),
        })
    }
}

/// IN, OUT, INOUT and STAT declarations of an SFB's instance data
pub fn sfb_instance_sections(index: u16) -> Option<AwlResult<Vec<Vec<FieldDecl>>>> {
    let def = lookup(BlockRef::new(BlockRefKind::Sfb, index))?;
    Some(fb_instance_sections(&def.raw_fields()))
}

/// Code blocks for every system block
pub fn build_all<S: TypeSource>(builder: &mut LayoutBuilder<'_, S>) -> AwlResult<Vec<(BlockRef, CodeBlock)>> {
    SYSTEM_BLOCKS
        .iter()
        .map(|def| Ok((def.block, def.build(builder)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::ProgramTypes;
    use crate::raw::RawProgram;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_system_block_interfaces() {
        let types = ProgramTypes::from_program(&RawProgram::new()).expect("Should collect types");
        let mut builder = LayoutBuilder::new(&types);
        let blocks = build_all(&mut builder).expect("Should build system blocks");
        assert_eq!(blocks.len(), SYSTEM_BLOCKS.len());

        let (_, ctu) = blocks
            .iter()
            .find(|(b, _)| *b == BlockRef::new(BlockRefKind::Sfb, 0))
            .expect("Should have CTU");
        assert_eq!(ctu.name(), "SFB 0");
        let inst = ctu.interface.instance_struct.as_ref().expect("Should have instance data");
        // CU, R | PV | Q | CV | CUO
        assert_eq!(inst.field("PV").map(|f| f.offset), Some(crate::offset::Offset::byte(2)));
        assert_eq!(inst.field("CUO").map(|f| f.offset), Some(crate::offset::Offset::byte(8)));
        assert_eq!(inst.size(), 9);

        let (_, tck) = blocks
            .iter()
            .find(|(b, _)| *b == BlockRef::new(BlockRefKind::Sfc, 64))
            .expect("Should have TIME_TCK");
        assert!(tck.interface.instance_struct.is_none());
        assert_eq!(tck.interface.params().count(), 1);
    }

    #[test]
    fn test_lookup() {
        let def = lookup(BlockRef::new(BlockRefKind::Sfb, 4)).expect("Should find TON");
        assert_eq!(def.name, "TON");
        assert_eq!(def.kind(), BlockKind::Fb);
        assert!(lookup(BlockRef::new(BlockRefKind::Sfc, 4)).is_none());
        assert!(sfb_instance_sections(46).is_none());
    }
}

//! AWL CPU engine
//!
//! Translates raw AWL/STL blocks into executable code blocks and runs them
//! on an emulated S7 CPU: bit-addressable memory areas, area-coded pointers,
//! FB/FC calling conventions and the cyclic scan loop.

pub mod blocks;
pub mod config;
pub mod constants;
pub mod cpu;
pub mod datatypes;
pub mod hardware;
pub mod insn;
pub mod interface;
pub mod memory;
pub mod offset;
pub mod operand;
pub mod optrans;
pub mod pointer;
pub mod raw;
pub mod structure;
pub mod symbols;
pub mod sysblocks;

pub use blocks::{CodeBlock, DataBlock, DbKind, Program};
pub use config::{CpuConfig, MnemonicsSetting};
pub use cpu::{Cpu, CpuState, CpuStats, StatusWord};
pub use hardware::{Hardware, NullHardware};
pub use insn::{InsnKind, Instruction, Mnemonics};
pub use memory::{Memory, Value};
pub use offset::Offset;
pub use operand::Operand;
pub use pointer::{AnyPointer, Area, DbPointer, Pointer};
pub use raw::{RawBlock, RawDataBlock, RawField, RawInsn, RawProgram, RawUdt, Section, SourceRef};
pub use symbols::SymbolTable;

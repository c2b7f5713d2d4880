//! Tests for pointer encodings and the direct, memory-indirect and
//! register-indirect addressing modes

use awl_common::{AwlError, BlockKind};
use awl_core::pointer::AnyType;
use awl_core::{
    AnyPointer, Area, Cpu, CpuConfig, DbPointer, MnemonicsSetting, Offset, Pointer, RawBlock, RawDataBlock,
    RawProgram, RawUdt, Section, Value,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn started_cpu(program: RawProgram) -> Cpu {
    init_logging();
    let config = CpuConfig {
        mnemonics: MnemonicsSetting::De,
        ..CpuConfig::default()
    };
    let mut cpu = Cpu::new(config).expect("Should create CPU");
    cpu.load(&program).expect("Should load program");
    cpu.startup().expect("Should start up");
    cpu
}

/// DB 3 with a scalar, a UDT and an ARRAY field, also reachable as "Recipe"
fn recipe_program(ob1: &str) -> RawProgram {
    let mut program = RawProgram::new()
        .udt(RawUdt::new(1).field("a", "INT").field("b", "INT"))
        .block(
            RawBlock::new(BlockKind::Fc, 1)
                .field("r", Section::InOut, "UDT 1")
                .code("L #r.b\nL 1\n+I\nT #r.a"),
        )
        .block(RawBlock::new(BlockKind::Ob, 1).code(ob1))
        .db(RawDataBlock::global(3)
            .field("v", "INT", Some("5"))
            .field("s", "UDT 1", None)
            .field("arr", "ARRAY [1..3] OF INT", None));
    program
        .symbols
        .add("Recipe", "DB 3", "BLOCK_DB")
        .expect("Should add symbol");
    program
}

fn flag_word(cpu: &Cpu, byte: u32) -> u32 {
    cpu.flags()
        .fetch(Offset::byte(byte), 16)
        .expect("Should read flag word")
        .as_u32()
}

proptest! {
    #[test]
    fn test_area_pointer_keeps_offset(byte in 0u32..=0xFFFF, bit in 0u8..8) {
        let offset = Offset::new(byte, bit);
        let value = offset.to_pointer_value().expect("Should pack offset");
        prop_assert_eq!(Offset::from_pointer_value(value), offset);

        let pointer = Pointer::new(Some(Area::Flags), offset).expect("Should build pointer");
        prop_assert_eq!(pointer.area(), Some(Area::Flags));
        prop_assert_eq!(pointer.byte_offset(), byte);
        prop_assert_eq!(pointer.bit_offset(), bit);

        let db = pointer.to_db_pointer(7);
        prop_assert_eq!(DbPointer::from_bytes(&db.to_bytes()).expect("Should decode DB pointer"), db);

        let any = pointer.to_any_pointer(7, AnyType::Byte, 3);
        let decoded = AnyPointer::from_bytes(&any.to_bytes()).expect("Should decode ANY pointer");
        prop_assert_eq!(decoded.pointer, pointer);
        prop_assert_eq!(decoded.count, 3);
    }

    #[test]
    fn test_offset_addition_carries_bits(a in 0u32..0x8000, b in 0u32..0x8000, abit in 0u8..8, bbit in 0u8..8) {
        let sum = Offset::new(a, abit) + Offset::new(b, bbit);
        prop_assert!(sum.bit < 8);
        prop_assert_eq!(sum.to_bits(), Offset::new(a, abit).to_bits() + Offset::new(b, bbit).to_bits());
    }
}

#[test]
fn test_offset_addition() {
    assert_eq!(Offset::new(1, 6) + Offset::new(0, 3), Offset::new(2, 1));
}

#[test]
fn test_flags_pointer_encoding() {
    let pointer = Pointer::new(Some(Area::Flags), Offset::new(1, 0)).expect("Should build pointer");
    assert_eq!(pointer.0, 0x8300_0008);
    assert_eq!(Pointer::new(None, Offset::new(4, 0)).expect("Should build pointer").0, 32);
}

#[test]
fn test_memory_indirect_word_access() {
    let program = RawProgram::new().block(RawBlock::new(BlockKind::Ob, 1).code(
        "L P#4.0
         T MD 10
         L MW [MD 10]
         T MW 20",
    ));
    let mut cpu = started_cpu(program);
    cpu.flags_mut()
        .store(Offset::byte(4), &Value::scalar(16, 0x1234))
        .expect("Should preset MW 4");
    cpu.run_cycle().expect("Should run cycle");
    assert_eq!(flag_word(&cpu, 20), 0x1234);
}

#[test]
fn test_register_indirect_area_internal() {
    let program = RawProgram::new().block(RawBlock::new(BlockKind::Ob, 1).code(
        "LAR1 P#8.0
         L MW [AR1,P#2.0]
         T MW 30",
    ));
    let mut cpu = started_cpu(program);
    cpu.flags_mut()
        .store(Offset::byte(10), &Value::scalar(16, 0xCAFE))
        .expect("Should preset MW 10");
    cpu.run_cycle().expect("Should run cycle");
    assert_eq!(flag_word(&cpu, 30), 0xCAFE);
    assert_eq!(cpu.ar1(), 64);
}

#[test]
fn test_global_db_access() {
    let program = RawProgram::new()
        .block(RawBlock::new(BlockKind::Ob, 1).code(
            "AUF DB 3
             L DBW 0
             T MW 30
             L DB3.DBW 2
             T MW 32",
        ))
        .db(RawDataBlock::global(3)
            .field("a", "WORD", Some("W#16#BEEF"))
            .field("b", "WORD", Some("W#16#0042")));
    let mut cpu = started_cpu(program);
    cpu.run_cycle().expect("Should run cycle");
    assert_eq!(flag_word(&cpu, 30), 0xBEEF);
    assert_eq!(flag_word(&cpu, 32), 0x0042);
    assert_eq!(cpu.db_register(), Some(3));
}

#[test]
fn test_db_access_without_open_db_faults() {
    let program = RawProgram::new()
        .block(RawBlock::new(BlockKind::Ob, 1).code("L DBW 0"))
        .db(RawDataBlock::global(3).field("a", "WORD", None));
    let mut cpu = started_cpu(program);
    let err = cpu.run_cycle().expect_err("Should fault on DB 0");
    assert!(matches!(err, AwlError::Fault { .. }));
    assert!(err.message().contains("DB 0 denied"), "{}", err.message());
    assert!(err.dump().is_some_and(|d| d.contains("Calls:  OB 1")));
}

#[test]
fn test_open_missing_db_faults() {
    let program = RawProgram::new().block(RawBlock::new(BlockKind::Ob, 1).code("AUF DB 9"));
    let mut cpu = started_cpu(program);
    let err = cpu.run_cycle().expect_err("Should fault on a missing DB");
    assert!(err.message().contains("Datablock 9 does not exist"), "{}", err.message());
}

#[test]
fn test_peripheral_access_without_hardware() {
    let program = RawProgram::new().block(RawBlock::new(BlockKind::Ob, 1).code("L PEW 0"));
    let mut cpu = started_cpu(program);
    let err = cpu.run_cycle().expect_err("Should fault without hardware");
    assert!(err.message().contains("There is no hardware"), "{}", err.message());
}

#[test]
fn test_db_variable_access() {
    let mut cpu = started_cpu(recipe_program(
        "L DB3.v
         T MW 0
         L 7
         T DB3.arr[2]
         L DB3.DBW 8
         T MW 2
         L 11
         T DB3.s.b
         L DB3.DBW 4
         T MW 4
         L \"Recipe\".v
         T MW 6
         CALL FC 1 (r := DB3.s)
         L DB3.s.a
         T MW 8",
    ));
    cpu.run_cycle().expect("Should run cycle");
    assert_eq!(flag_word(&cpu, 0), 5);
    assert_eq!(flag_word(&cpu, 2), 7);
    assert_eq!(flag_word(&cpu, 4), 11);
    assert_eq!(flag_word(&cpu, 6), 5);
    assert_eq!(flag_word(&cpu, 8), 12);
    // DB variables leave the DB register alone
    assert_eq!(cpu.db_register(), Some(0));
}

#[test]
fn test_db_variable_link_errors() {
    init_logging();
    let cases = [
        ("L DB3.missing", "DB 3 has no field 'missing'"),
        ("L DB9.v", "DB 9 does not exist"),
        ("L DB3.arr[4]", "out of range"),
        ("U DB3.v", "Invalid operand 'DB3.v'"),
    ];
    for (code, expected) in cases {
        let mut cpu = Cpu::new(CpuConfig {
            mnemonics: MnemonicsSetting::De,
            ..CpuConfig::default()
        })
        .expect("Should create CPU");
        let err = cpu.load(&recipe_program(code)).expect_err("Should reject the program");
        assert!(matches!(err, AwlError::Compile { .. }), "{}", code);
        assert!(err.message().contains(expected), "{}: {}", code, err.message());
    }
}

//! Tests for the built-in SFBs and SFCs: IEC counters and timers,
//! TIME_TCK, WAIT and STOP

use awl_common::{AwlError, BlockKind};
use awl_core::{Cpu, CpuConfig, CpuState, MnemonicsSetting, Offset, RawBlock, RawDataBlock, RawProgram, Section, Value};
use pretty_assertions::assert_eq;
use std::thread::sleep;
use std::time::Duration;

fn started_cpu(program: RawProgram) -> Cpu {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = CpuConfig {
        mnemonics: MnemonicsSetting::De,
        ..CpuConfig::default()
    };
    let mut cpu = Cpu::new(config).expect("Should create CPU");
    cpu.load(&program).expect("Should load program");
    cpu.startup().expect("Should start up");
    cpu
}

fn ob1(code: &str) -> RawProgram {
    RawProgram::new().block(RawBlock::new(BlockKind::Ob, 1).code(code))
}

fn flag_bit(cpu: &Cpu, byte: u32, bit: u8) -> bool {
    cpu.flags()
        .fetch(Offset::new(byte, bit), 1)
        .expect("Should read flag bit")
        .as_bool()
}

fn set_flag_bit(cpu: &mut Cpu, byte: u32, bit: u8, value: bool) {
    cpu.flags_mut()
        .store(Offset::new(byte, bit), &Value::bit(value))
        .expect("Should write flag bit");
}

fn flag(cpu: &Cpu, byte: u32, width: u32) -> u32 {
    cpu.flags()
        .fetch(Offset::byte(byte), width)
        .expect("Should read flags")
        .as_u32()
}

fn instance_field(cpu: &Cpu, db: u16, name: &str) -> u32 {
    let db = cpu.db(db).expect("Should have instance DB");
    let field = db.structure.field(name).expect("Should have field");
    db.fetch(field.offset, field.bit_size).expect("Should read field").as_u32()
}

#[test]
fn test_up_counter_counts_rising_edges() {
    let program = ob1("CALL SFB 0, DB 5 (CU := M 0.0, PV := 2, Q := M 1.0, CV := MW 10)")
        .db(RawDataBlock::sfb_instance(5, 0));
    let mut cpu = started_cpu(program);

    set_flag_bit(&mut cpu, 0, 0, true);
    cpu.run_cycle().expect("Should run first cycle");
    assert_eq!(flag(&cpu, 10, 16), 1);
    assert!(!flag_bit(&cpu, 1, 0));
    assert!(cpu.status().bie);

    // no new edge
    cpu.run_cycle().expect("Should run second cycle");
    assert_eq!(flag(&cpu, 10, 16), 1);

    set_flag_bit(&mut cpu, 0, 0, false);
    cpu.run_cycle().expect("Should run third cycle");
    set_flag_bit(&mut cpu, 0, 0, true);
    cpu.run_cycle().expect("Should run fourth cycle");
    assert_eq!(flag(&cpu, 10, 16), 2);
    assert!(flag_bit(&cpu, 1, 0));
    assert_eq!(instance_field(&cpu, 5, "CUO"), 1);
}

#[test]
fn test_up_down_counter_load_and_count_down() {
    let program = ob1(
        "CALL SFB 2, DB 7 (CU := M 0.0, CD := M 0.1, LOAD := M 0.2, PV := 3, QU := M 1.0, QD := M 1.1, CV := MW 12)",
    )
    .db(RawDataBlock::sfb_instance(7, 2));
    let mut cpu = started_cpu(program);

    set_flag_bit(&mut cpu, 0, 2, true);
    cpu.run_cycle().expect("Should load the counter");
    assert_eq!(flag(&cpu, 12, 16), 3);
    assert!(flag_bit(&cpu, 1, 0));
    assert!(!flag_bit(&cpu, 1, 1));

    set_flag_bit(&mut cpu, 0, 2, false);
    set_flag_bit(&mut cpu, 0, 1, true);
    cpu.run_cycle().expect("Should count down");
    assert_eq!(flag(&cpu, 12, 16), 2);
    assert!(!flag_bit(&cpu, 1, 0));
}

#[test]
fn test_pulse_timer_holds_output_after_input_drops() {
    let program = ob1("CALL SFB 3, DB 5 (IN := M 0.0, PT := T#10S, Q := M 1.0, ET := MD 20)")
        .db(RawDataBlock::sfb_instance(5, 3));
    let mut cpu = started_cpu(program);

    set_flag_bit(&mut cpu, 0, 0, true);
    cpu.run_cycle().expect("Should start the pulse");
    assert!(flag_bit(&cpu, 1, 0));
    assert_eq!(instance_field(&cpu, 5, "STATE"), 1);

    set_flag_bit(&mut cpu, 0, 0, false);
    cpu.run_cycle().expect("Should keep the pulse running");
    assert!(flag_bit(&cpu, 1, 0));
    assert!(flag(&cpu, 20, 32) < 10_000);
}

#[test]
fn test_on_delay_timer_as_multi_instance() {
    let program = ob1("CALL FB 1, DB 1 (start := M 0.0, done := M 1.0)")
        .block(
            RawBlock::new(BlockKind::Fb, 1)
                .field("start", Section::In, "BOOL")
                .field("done", Section::Out, "BOOL")
                .field("delay", Section::Stat, "SFB 4")
                .code("CALL #delay (IN := #start, PT := T#20MS, Q := #done)"),
        )
        .db(RawDataBlock::instance(1, 1));
    let mut cpu = started_cpu(program);

    set_flag_bit(&mut cpu, 0, 0, true);
    cpu.run_cycle().expect("Should start the delay");
    assert!(!flag_bit(&cpu, 1, 0));

    sleep(Duration::from_millis(40));
    cpu.run_cycle().expect("Should finish the delay");
    assert!(flag_bit(&cpu, 1, 0));
    assert_eq!(instance_field(&cpu, 1, "delay.ET"), 20);
    assert_eq!(instance_field(&cpu, 1, "delay.STATE"), 2);

    set_flag_bit(&mut cpu, 0, 0, false);
    cpu.run_cycle().expect("Should reset the delay");
    assert!(!flag_bit(&cpu, 1, 0));
    assert_eq!(instance_field(&cpu, 1, "delay.ET"), 0);
}

#[test]
fn test_time_tick_and_wait() {
    let mut cpu = started_cpu(ob1(
        "CALL SFC 64 (RET_VAL := MD 20)
         CALL SFC 47 (WT := 2000)
         CALL SFC 64 (RET_VAL := MD 24)",
    ));
    cpu.run_cycle().expect("Should run cycle");
    let (before, after) = (flag(&cpu, 20, 32), flag(&cpu, 24, 32));
    assert!(after >= before, "{} < {}", after, before);
    assert!(after <= 0x7FFF_FFFF);
}

#[test]
fn test_stop_sfc_stops_the_cpu() {
    let mut cpu = started_cpu(ob1(
        "L 42
         T MW 0
         CALL SFC 46
         L 1
         T MW 2",
    ));
    cpu.run(None).expect("Should stop cleanly");
    assert_eq!(cpu.state(), CpuState::Stopped);
    assert_eq!(flag(&cpu, 0, 16), 42);
    assert_eq!(flag(&cpu, 2, 16), 0);
}

#[test]
fn test_system_block_call_errors() {
    let mut cpu = started_cpu(ob1("CALL SFC 99"));
    let err = cpu.run_cycle().expect_err("Should fault on an unknown SFC");
    assert!(matches!(err, AwlError::Fault { .. }));
    assert!(err.message().contains("SFC 99 is not available"), "{}", err.message());

    let program = ob1("CALL SFB 0, DB 5 (CU := M 0.0)")
        .block(RawBlock::new(BlockKind::Fb, 1).code("BE"))
        .db(RawDataBlock::instance(5, 1));
    let mut cpu = started_cpu(program);
    let err = cpu.run_cycle().expect_err("Should fault on the wrong instance DB");
    assert!(
        err.message().contains("DB 5 is an instance DB of FB 1, not of SFB 0"),
        "{}",
        err.message()
    );
}

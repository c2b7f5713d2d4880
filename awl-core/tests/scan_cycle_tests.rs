//! Tests for the CPU lifecycle: startup OBs, scan cycles, hardware
//! process images, time limits and maintenance requests

use awl_common::{AwlError, BlockKind, MaintenanceRequest};
use awl_core::{Cpu, CpuConfig, CpuState, Hardware, MnemonicsSetting, Offset, RawBlock, RawProgram, Section};
use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::rc::Rc;

fn config() -> CpuConfig {
    CpuConfig {
        mnemonics: MnemonicsSetting::De,
        ..CpuConfig::default()
    }
}

fn loaded_cpu(program: RawProgram, config: CpuConfig) -> Cpu {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut cpu = Cpu::new(config).expect("Should create CPU");
    cpu.load(&program).expect("Should load program");
    cpu
}

fn flag_word(cpu: &Cpu, byte: u32) -> u32 {
    cpu.flags()
        .fetch(Offset::byte(byte), 16)
        .expect("Should read flag word")
        .as_u32()
}

fn counting_program() -> RawProgram {
    RawProgram::new()
        .block(RawBlock::new(BlockKind::Ob, 100).code("L 42\nT MW 0"))
        .block(RawBlock::new(BlockKind::Ob, 1).code("L MW 0\nL 1\n+I\nT MW 0"))
}

/// Inputs come from a fixed pattern, outputs are captured
struct LoopbackHardware {
    outputs: Rc<RefCell<Vec<u8>>>,
}

impl Hardware for LoopbackHardware {
    fn read_inputs(&mut self, inputs: &mut [u8]) {
        inputs[0] = 0xA5;
    }

    fn write_outputs(&mut self, outputs: &[u8]) {
        *self.outputs.borrow_mut() = outputs[..2].to_vec();
    }

    fn direct_read(&mut self, width: u32, offset: u32) -> Option<Vec<u8>> {
        (width == 16 && offset == 0).then(|| vec![0x12, 0x34])
    }
}

#[test]
fn test_startup_ob_runs_before_cycles() {
    let mut cpu = loaded_cpu(counting_program(), config());
    assert_eq!(cpu.state(), CpuState::Ready);
    cpu.startup().expect("Should start up");
    assert_eq!(cpu.state(), CpuState::Running);
    assert_eq!(flag_word(&cpu, 0), 42);

    cpu.run(Some(3)).expect("Should run three cycles");
    assert_eq!(flag_word(&cpu, 0), 45);
    assert_eq!(cpu.stats().cycle_count, 3);
}

#[test]
fn test_soft_reboot_reruns_startup() {
    let mut cpu = loaded_cpu(counting_program(), config());
    cpu.run(Some(2)).expect("Should start and run");
    assert_eq!(flag_word(&cpu, 0), 44);

    cpu.request_maintenance(MaintenanceRequest::SoftReboot);
    cpu.run(Some(1)).expect("Should reboot and run");
    assert_eq!(flag_word(&cpu, 0), 43);
    assert_eq!(cpu.state(), CpuState::Running);
}

#[test]
fn test_stop_request_ends_run() {
    let mut cpu = loaded_cpu(counting_program(), config());
    cpu.startup().expect("Should start up");
    cpu.request_maintenance(MaintenanceRequest::Stop);
    cpu.run(None).expect("Should stop cleanly");
    assert_eq!(cpu.state(), CpuState::Stopped);
    assert_eq!(flag_word(&cpu, 0), 42);
}

#[test]
fn test_run_time_limit_stops_cpu() {
    let config = CpuConfig {
        run_time_limit: Some(0.05),
        ..config()
    };
    let mut cpu = loaded_cpu(counting_program(), config);
    cpu.run(None).expect("Should stop at the run time limit");
    assert_eq!(cpu.state(), CpuState::Stopped);
    assert!(cpu.stats().cycle_count > 0);
}

#[test]
fn test_cycle_time_limit_halts_cpu() {
    let program = RawProgram::new().block(RawBlock::new(BlockKind::Ob, 1).code(
        "      L 30000
         OUT:  T MW 0
               L 30000
         INN:  LOOP INN
               L MW 0
               LOOP OUT",
    ));
    let config = CpuConfig {
        cycle_time_limit: 0.05,
        ..config()
    };
    let mut cpu = loaded_cpu(program, config);
    cpu.startup().expect("Should start up");

    let err = cpu.run_cycle().expect_err("Should exceed the cycle time");
    assert!(matches!(err, AwlError::Fault { .. }));
    assert!(err.message().contains("Cycle time exceed"), "{}", err.message());
    assert!(err.dump().is_some_and(|d| d.contains("Calls:  OB 1")));
    assert_eq!(cpu.state(), CpuState::Stopped);

    let err = cpu.run_cycle().expect_err("Should refuse to run");
    assert!(err.message().contains("state STOP"), "{}", err.message());
}

#[test]
fn test_missing_ob1_faults() {
    let program = RawProgram::new().block(RawBlock::new(BlockKind::Ob, 100).code("L 1\nT MW 0"));
    let mut cpu = loaded_cpu(program, config());
    cpu.startup().expect("Should run the startup OB");
    let err = cpu.run_cycle().expect_err("Should fault without OB 1");
    assert!(err.message().contains("OB 1 is not loaded"), "{}", err.message());
}

#[test]
fn test_startup_without_program_fails() {
    let mut cpu = Cpu::new(config()).expect("Should create CPU");
    assert!(cpu.startup().is_err());
    assert!(cpu.run(Some(1)).is_err());
}

#[test]
fn test_hardware_process_images() {
    let program = RawProgram::new().block(RawBlock::new(BlockKind::Ob, 1).code(
        "L EB 0
         T AB 1
         L PEW 0
         T MW 0",
    ));
    let captured = Rc::new(RefCell::new(Vec::new()));
    let hardware = LoopbackHardware {
        outputs: Rc::clone(&captured),
    };
    let mut cpu = Cpu::new(config())
        .expect("Should create CPU")
        .with_hardware(Box::new(hardware));
    cpu.load(&program).expect("Should load program");
    cpu.run(Some(1)).expect("Should run a cycle");

    assert_eq!(*captured.borrow(), vec![0x00, 0xA5]);
    assert_eq!(flag_word(&cpu, 0), 0x1234);
}

#[test]
fn test_ob1_temp_presets() {
    let program = RawProgram::new().block(
        RawBlock::new(BlockKind::Ob, 1)
            .field("OB1_EV_CLASS", Section::Temp, "BYTE")
            .field("OB1_SCAN_1", Section::Temp, "BYTE")
            .code(
                "L #OB1_EV_CLASS
                 T MB 0
                 L #OB1_SCAN_1
                 T MB 1
                 L LB 2
                 T MB 2",
            ),
    );
    let mut cpu = loaded_cpu(program, config());
    cpu.run(Some(1)).expect("Should run a cycle");
    assert_eq!(flag_word(&cpu, 0), 0x1103);
    assert_eq!(cpu.flags().fetch(Offset::byte(2), 8).expect("Should read MB 2").as_u32(), 0x01);
}

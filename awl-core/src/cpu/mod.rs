//! The S7 CPU core
//!
//! [`Cpu`] owns the loaded program, all memory areas and the register set.
//! A scan cycle runs OB 1 to completion by walking the top frame of the
//! call stack one instruction at a time. Cycle time is checked after an
//! adaptive number of instructions.

mod access;
mod callstack;
mod counters;
mod dump;
mod execution;
mod lstack;
mod state;
mod statusword;
mod system;
mod timers;

pub use access::{Location, Resolved};
pub use callstack::{FcRef, Frame, Outbound, ParenEntry};
pub use counters::{Counter, COUNTER_MAX};
pub use lstack::{LFrame, LStack};
pub use state::{CpuState, CpuStats};
pub use statusword::StatusWord;
pub use timers::Timer;

use crate::blocks::{DataBlock, Program};
use crate::config::CpuConfig;
use crate::constants::*;
use crate::hardware::{Hardware, NullHardware};
use crate::insn::Mnemonics;
use crate::memory::Memory;
use crate::raw::RawProgram;
use awl_common::{AwlError, AwlResult, BlockInfo, BlockKind, MaintenanceRequest, SourceId};
use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use log::{debug, info, trace, warn};
use std::rc::Rc;
use std::time::{Duration, Instant};

pub struct Cpu {
    config: CpuConfig,
    state: CpuState,
    program: Program,
    // Set once a program is loaded
    mnemonics: Option<Mnemonics>,
    hardware: Box<dyn Hardware>,

    // Registers
    accu: [u32; 4],
    ar1: u32,
    ar2: u32,
    db_register: Option<u16>,
    di_register: Option<u16>,
    status: StatusWord,

    // Memory areas and devices
    inputs: Memory,
    outputs: Memory,
    flags: Memory,
    lstack: LStack,
    call_stack: Vec<Frame>,
    timers: Vec<Timer>,
    counters: Vec<Counter>,

    // Time keeping, relative to `epoch`
    epoch: Instant,
    now: Duration,
    cycle_start: Duration,
    run_start: Duration,
    check_interval: u32,
    insns_since_check: u32,
    pending_maintenance: Option<MaintenanceRequest>,
    stats: CpuStats,
}

impl Cpu {
    pub fn new(config: CpuConfig) -> AwlResult<Self> {
        config.validate()?;
        Ok(Self {
            state: CpuState::Stopped,
            program: Program::default(),
            mnemonics: None,
            hardware: Box::new(NullHardware),
            accu: [0; 4],
            ar1: 0,
            ar2: 0,
            db_register: None,
            di_register: None,
            status: StatusWord::new(),
            inputs: Memory::new(config.nr_inputs as usize),
            outputs: Memory::new(config.nr_outputs as usize),
            flags: Memory::new(config.nr_flags as usize),
            lstack: LStack::new(config.nr_localbytes),
            call_stack: Vec::new(),
            timers: (0..config.nr_timers).map(|_| Timer::new()).collect(),
            counters: (0..config.nr_counters).map(|_| Counter::new()).collect(),
            epoch: Instant::now(),
            now: Duration::ZERO,
            cycle_start: Duration::ZERO,
            run_start: Duration::ZERO,
            check_interval: RUNTIME_CHECK_INTERVAL_INITIAL,
            insns_since_check: 0,
            pending_maintenance: None,
            stats: CpuStats::default(),
            config,
        })
    }

    /// Attach a hardware backend
    pub fn with_hardware(mut self, hardware: Box<dyn Hardware>) -> Self {
        self.hardware = hardware;
        self
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    pub fn state(&self) -> CpuState {
        self.state
    }

    pub fn stats(&self) -> &CpuStats {
        &self.stats
    }

    /// Mnemonics of the loaded program
    pub fn mnemonics(&self) -> Option<Mnemonics> {
        self.mnemonics
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Translate, lay out and link `raw`, replacing the current program
    pub fn load(&mut self, raw: &RawProgram) -> AwlResult<()> {
        let (program, mnemonics) = Program::build(raw, self.config.mnemonics, self.config.extended_insns)?;
        self.program = program;
        self.mnemonics = Some(mnemonics);
        self.reset();
        self.state = CpuState::Ready;
        info!("CPU state: {}", self.state);
        Ok(())
    }

    /// Clear registers, memory areas and devices
    fn reset(&mut self) {
        self.reset_registers();
        self.inputs.clear();
        self.outputs.clear();
        self.flags.clear();
        self.lstack.memory.clear();
        self.timers.iter_mut().for_each(|t| *t = Timer::new());
        self.counters.iter_mut().for_each(|c| *c = Counter::new());
    }

    fn reset_registers(&mut self) {
        self.accu = [0; 4];
        self.ar1 = 0;
        self.ar2 = 0;
        self.db_register = None;
        self.di_register = None;
        self.status.reset();
        self.call_stack.clear();
    }

    /// Run the first startup OB present and switch to RUN
    pub fn startup(&mut self) -> AwlResult<()> {
        if self.mnemonics.is_none() {
            return Err(AwlError::fault("Cannot start the CPU: no program loaded"));
        }
        self.update_time();
        self.run_start = self.now;
        self.stats.reset(self.now);
        self.check_interval = RUNTIME_CHECK_INTERVAL_INITIAL;
        self.insns_since_check = 0;
        self.reset_registers();
        self.hardware.startup();

        if let Some(ob) = STARTUP_OBS.iter().copied().find(|ob| self.program.obs.contains(*ob)) {
            info!("Running startup OB {}", ob);
            self.run_ob(ob).map_err(|e| self.halt(e))?;
        }
        self.state = CpuState::Running;
        info!("CPU state: {}", self.state);
        Ok(())
    }

    /// Run one scan cycle: inputs, OB 1, outputs
    pub fn run_cycle(&mut self) -> AwlResult<()> {
        if self.state != CpuState::Running {
            return Err(AwlError::fault(format!("Cannot run a cycle in state {}", self.state)));
        }
        if let Some(request) = self.pending_maintenance.take() {
            return Err(AwlError::maintenance(request));
        }
        self.update_time();
        let start = self.now;

        self.hardware.read_inputs(self.inputs.as_mut_slice());
        self.run_ob(CYCLIC_OB).map_err(|e| self.halt(e))?;
        self.hardware.write_outputs(self.outputs.as_slice());

        self.update_time();
        let cycle_time = self.now.saturating_sub(start).as_secs_f64();
        self.stats.cycle_done(cycle_time, self.now);
        if let Some(target) = self.config.cycle_time_target {
            if cycle_time < target {
                std::thread::sleep(Duration::from_secs_f64(target - cycle_time));
                self.update_time();
            }
        }
        Ok(())
    }

    /// Start up if needed and run cycles until `max_cycles` is reached or
    /// a maintenance request stops the CPU
    pub fn run(&mut self, max_cycles: Option<u64>) -> AwlResult<()> {
        if self.state != CpuState::Running {
            self.startup()?;
        }
        let mut cycles = 0u64;
        while max_cycles.map_or(true, |max| cycles < max) {
            match self.run_cycle() {
                Ok(()) => cycles += 1,
                Err(e) => match e.maintenance_request() {
                    Some(MaintenanceRequest::SoftReboot) => {
                        info!("Soft reboot");
                        self.startup()?;
                    }
                    Some(request) => {
                        info!("Stopping: {}", request);
                        self.stop();
                        return Ok(());
                    }
                    None => return Err(e),
                },
            }
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.hardware.shutdown();
        self.call_stack.clear();
        self.state = CpuState::Stopped;
        info!("CPU state: {}", self.state);
    }

    /// Queue a request. It is delivered at the next runtime check.
    pub fn request_maintenance(&mut self, request: MaintenanceRequest) {
        self.pending_maintenance = Some(request);
    }

    pub fn block_infos(&self) -> Vec<BlockInfo> {
        self.program.block_infos()
    }

    pub fn unload_source(&mut self, source: SourceId) -> Vec<(BlockKind, u16)> {
        let removed = self.program.unload_source(source);
        debug!("Unloaded {} blocks of source {:?}", removed.len(), source);
        removed
    }

    /// ACCU1..ACCU4
    pub fn accu(&self, nr: usize) -> Option<u32> {
        if nr == 0 || nr > usize::from(self.config.nr_accus) {
            return None;
        }
        Some(self.accu[nr - 1])
    }

    pub fn ar1(&self) -> u32 {
        self.ar1
    }

    pub fn ar2(&self) -> u32 {
        self.ar2
    }

    pub fn status(&self) -> StatusWord {
        self.status
    }

    pub fn db_register(&self) -> Option<u16> {
        self.db_register
    }

    pub fn di_register(&self) -> Option<u16> {
        self.di_register
    }

    pub fn inputs_mut(&mut self) -> &mut Memory {
        &mut self.inputs
    }

    pub fn outputs(&self) -> &Memory {
        &self.outputs
    }

    pub fn flags(&self) -> &Memory {
        &self.flags
    }

    pub fn flags_mut(&mut self) -> &mut Memory {
        &mut self.flags
    }

    pub fn db(&self, index: u16) -> Option<&DataBlock> {
        self.program.dbs.get(index)
    }

    fn update_time(&mut self) {
        self.now = self.epoch.elapsed();
    }

    /// Fatal errors stop the CPU and carry a state dump
    fn halt(&mut self, e: AwlError) -> AwlError {
        if e.is_maintenance() {
            return e;
        }
        warn!("CPU halted: {}", e);
        self.state = CpuState::Stopped;
        let dump = self.to_string();
        self.call_stack.clear();
        e.with_dump(dump)
    }

    fn run_ob(&mut self, index: u16) -> AwlResult<()> {
        let block = self
            .program
            .obs
            .get(index)
            .cloned()
            .ok_or_else(|| AwlError::fault(format!("OB {} is not loaded", index)))?;
        self.cycle_start = self.now;
        self.call_stack.clear();
        // DB 0 is not accessible, so nothing is open
        self.db_register = Some(0);
        self.di_register = Some(0);

        let l = self.lstack.open_frame(None, block.interface.temp_allocation)?;
        let mut frame = Frame::new(block, l);
        frame.prev_db = self.db_register;
        frame.prev_di = self.di_register;
        self.call_stack.push(frame);
        if self.config.ob_temp_presets && index == CYCLIC_OB {
            self.write_ob1_temp_presets(l)?;
        }

        loop {
            let (block, ip) = match self.call_stack.last_mut() {
                Some(frame) => {
                    let ip = frame.ip;
                    frame.ip += 1;
                    (Rc::clone(&frame.block), ip)
                }
                None => break,
            };
            let Some(insn) = block.insns.get(ip) else {
                self.exit_block()?;
                continue;
            };
            trace!("{} {:4}: {}", block.name(), ip, insn);
            self.execute(insn).map_err(|e| {
                e.with_location(block.source.location(insn.line))
                    .with_insn(insn.text.clone())
            })?;
            self.stats.count_insn();
            self.insns_since_check += 1;
            if self.insns_since_check >= self.check_interval {
                self.runtime_check()?;
            }
        }
        Ok(())
    }

    /// Check the cycle time limit and deliver maintenance requests. The
    /// check interval adapts so that this runs about once per millisecond.
    fn runtime_check(&mut self) -> AwlResult<()> {
        let before = self.now;
        self.update_time();
        let elapsed = self.now.saturating_sub(before).as_secs_f64();
        if elapsed < RUNTIME_CHECK_TARGET_SECONDS / 2.0 {
            self.check_interval = (self.check_interval * 2).min(RUNTIME_CHECK_INTERVAL_MAX);
        } else if elapsed > RUNTIME_CHECK_TARGET_SECONDS * 2.0 {
            self.check_interval = (self.check_interval / 2).max(RUNTIME_CHECK_INTERVAL_MIN);
        }
        self.insns_since_check = 0;

        let cycle_time = self.now.saturating_sub(self.cycle_start).as_secs_f64();
        if cycle_time > self.config.cycle_time_limit {
            return Err(AwlError::fault(format!(
                "Cycle time exceed {:.3} seconds",
                self.config.cycle_time_limit
            )));
        }
        if let Some(limit) = self.config.run_time_limit {
            if self.now.saturating_sub(self.run_start).as_secs_f64() >= limit {
                self.pending_maintenance.get_or_insert(MaintenanceRequest::RuntimeTimeout);
            }
        }
        match self.pending_maintenance.take() {
            Some(request) => Err(AwlError::maintenance(request)),
            None => Ok(()),
        }
    }

    /// OB 1 start information in the first 20 TEMP bytes
    fn write_ob1_temp_presets(&mut self, frame: LFrame) -> AwlResult<()> {
        if frame.bytes < OB_STARTUP_TEMP_ALLOCATION {
            return Err(AwlError::fault(format!(
                "Localdata (TEMP) area in OB {} is too small.",
                CYCLIC_OB
            )));
        }
        let ms = |t: Option<f64>| (t.unwrap_or(0.0) * 1000.0).ceil().min(f64::from(0x7FFF)) as u16;
        let max = ms(self.stats.max_cycle_time);
        let min = ms(self.stats.min_cycle_time).min(max);
        let avg = ms(self.stats.avg_cycle_time).clamp(min, max);

        let mut data = [0u8; OB_STARTUP_TEMP_ALLOCATION as usize];
        data[..6].copy_from_slice(&[0x11, 0x03, 0x01, 0x01, 0x00, 0x00]);
        data[6..8].copy_from_slice(&avg.to_be_bytes());
        data[8..10].copy_from_slice(&min.to_be_bytes());
        data[10..12].copy_from_slice(&max.to_be_bytes());
        data[12..20].copy_from_slice(&date_and_time_bcd(&Local::now().naive_local()));
        self.lstack.memory.store_bytes(frame.base, &data)
    }

    fn timer_mut(&mut self, nr: u16) -> AwlResult<&mut Timer> {
        self.timers
            .get_mut(usize::from(nr))
            .ok_or_else(|| AwlError::fault(format!("Timer T {} does not exist", nr)))
    }

    fn counter_mut(&mut self, nr: u16) -> AwlResult<&mut Counter> {
        self.counters
            .get_mut(usize::from(nr))
            .ok_or_else(|| AwlError::fault(format!("Counter Z {} does not exist", nr)))
    }
}

/// DATE_AND_TIME in S7 BCD layout
fn date_and_time_bcd(dt: &NaiveDateTime) -> [u8; 8] {
    let bcd = |v: u32| (((v / 10) % 10) << 4 | (v % 10)) as u8;
    let msec = (dt.nanosecond() / 1_000_000).min(999);
    // Sunday is 1
    let weekday = dt.weekday().number_from_sunday();
    [
        bcd(dt.year().rem_euclid(100) as u32),
        bcd(dt.month()),
        bcd(dt.day()),
        bcd(dt.hour()),
        bcd(dt.minute()),
        bcd(dt.second()),
        bcd(msec / 10),
        ((msec % 10) << 4 | weekday) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_date_and_time_bcd() {
        let dt = NaiveDate::from_ymd_opt(2024, 3, 18)
            .and_then(|d| d.and_hms_milli_opt(13, 45, 7, 123))
            .expect("Should be a valid date");
        // 2024-03-18 is a Monday
        assert_eq!(date_and_time_bcd(&dt), [0x24, 0x03, 0x18, 0x13, 0x45, 0x07, 0x12, 0x32]);
    }

    #[test]
    fn test_accu_count_follows_config() {
        let cpu = Cpu::new(CpuConfig::default()).expect("Should create");
        assert_eq!(cpu.accu(2), Some(0));
        assert_eq!(cpu.accu(3), None);
        assert_eq!(cpu.state(), CpuState::Stopped);
    }

    #[test]
    fn test_startup_needs_program() {
        let mut cpu = Cpu::new(CpuConfig::default()).expect("Should create");
        assert!(cpu.startup().is_err());
    }
}

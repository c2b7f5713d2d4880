//! Native routines of the system blocks
//!
//! A routine runs inside the frame of its block, so the interface fields
//! are reached exactly like `#name` operands of an AWL block: SFB fields
//! live in the instance DB, SFC fields are FC parameters.

use super::Cpu;
use crate::operand::{NamedLocal, Operand};
use crate::sysblocks::Routine;
use awl_common::{AwlError, AwlResult, MaintenanceRequest};
use log::info;
use std::time::Duration;

const STATE_RUNNING: u32 = 1 << 0;
const STATE_FINISHED: u32 = 1 << 1;

/// Longest SFC 47 delay in microseconds
const WAIT_MAX_US: i32 = 32767;

impl Cpu {
    pub(super) fn run_routine(&mut self, routine: Routine) -> AwlResult<()> {
        match routine {
            Routine::CountUp => self.count_up(),
            Routine::CountDown => self.count_down(),
            Routine::CountUpDown => self.count_up_down(),
            Routine::Pulse => self.pulse_timer(),
            Routine::OnDelay => self.on_delay_timer(),
            Routine::OffDelay => self.off_delay_timer(),
            Routine::Stop => {
                info!("SFC 46 STOP called");
                Err(AwlError::maintenance(MaintenanceRequest::Stop))
            }
            Routine::Wait => {
                let wt = self.sys_int("WT")?;
                if wt > 0 {
                    let micros = wt.min(WAIT_MAX_US) as u64;
                    std::thread::sleep(Duration::from_micros(micros));
                }
                self.update_time();
                Ok(())
            }
            Routine::TimeTick => {
                let now = self.time_ms();
                self.sys_store("RET_VAL", now as u32)
            }
        }
    }

    fn sys_field(&self, name: &str) -> AwlResult<Operand> {
        let binding = self.frame()?.block.interface.bind(name, &[])?;
        Ok(Operand::Local(NamedLocal {
            name: name.to_string(),
            indices: Vec::new(),
            width: binding.width,
            data_type: Some(binding.data_type),
            binding: binding.binding,
        }))
    }

    fn sys_bit(&mut self, name: &str) -> AwlResult<bool> {
        let op = self.sys_field(name)?;
        self.fetch_bit(&op)
    }

    fn sys_set_bit(&mut self, name: &str, bit: bool) -> AwlResult<()> {
        let op = self.sys_field(name)?;
        self.store_bit(&op, bit)
    }

    /// Signed INT or TIME field
    fn sys_int(&mut self, name: &str) -> AwlResult<i32> {
        let op = self.sys_field(name)?;
        let value = self.fetch_value(&op)?;
        Ok(match value.width() {
            16 => i32::from(value.as_u32() as u16 as i16),
            _ => value.as_u32() as i32,
        })
    }

    fn sys_store(&mut self, name: &str, value: u32) -> AwlResult<()> {
        let op = self.sys_field(name)?;
        self.store_u32(&op, value, &[8, 16, 32])
    }

    /// Current time as a 31-bit millisecond S7 TIME value
    fn time_ms(&mut self) -> i32 {
        self.update_time();
        (self.now.as_millis() & 0x7FFF_FFFF) as i32
    }

    /// Store `input` into the edge memory `memory` and report a rising edge
    fn sys_edge(&mut self, input: &str, memory: &str) -> AwlResult<bool> {
        let now = self.sys_bit(input)?;
        let before = self.sys_bit(memory)?;
        self.sys_set_bit(memory, now)?;
        Ok(now && !before)
    }

    fn count_up(&mut self) -> AwlResult<()> {
        let edge = self.sys_edge("CU", "CUO")?;
        let mut cv = self.sys_int("CV")?;
        if self.sys_bit("R")? {
            cv = 0;
            self.sys_store("CV", 0)?;
        } else if edge && cv < i32::from(i16::MAX) {
            cv += 1;
            self.sys_store("CV", cv as u32)?;
        }
        let pv = self.sys_int("PV")?;
        self.sys_set_bit("Q", cv >= pv)
    }

    fn count_down(&mut self) -> AwlResult<()> {
        let edge = self.sys_edge("CD", "CDO")?;
        let mut cv = self.sys_int("CV")?;
        let pv = self.sys_int("PV")?;
        if self.sys_bit("LOAD")? {
            cv = pv;
            self.sys_store("CV", cv as u32)?;
        } else if edge && cv > i32::from(i16::MIN) {
            cv -= 1;
            self.sys_store("CV", cv as u32)?;
        }
        self.sys_set_bit("Q", cv <= 0)
    }

    fn count_up_down(&mut self) -> AwlResult<()> {
        let up = self.sys_edge("CU", "CUO")?;
        let down = self.sys_edge("CD", "CDO")?;
        let pv = self.sys_int("PV")?;
        let mut cv = self.sys_int("CV")?;
        let next = if self.sys_bit("R")? {
            Some(0)
        } else if self.sys_bit("LOAD")? {
            Some(pv)
        } else if down && !up && cv > i32::from(i16::MIN) {
            Some(cv - 1)
        } else if up && !down && cv < i32::from(i16::MAX) {
            Some(cv + 1)
        } else {
            None
        };
        if let Some(next) = next {
            cv = next;
            self.sys_store("CV", cv as u32)?;
        }
        self.sys_set_bit("QU", cv >= pv)?;
        self.sys_set_bit("QD", cv <= 0)
    }

    fn reset_timer(&mut self) -> AwlResult<()> {
        self.sys_set_bit("Q", false)?;
        self.sys_store("ET", 0)?;
        self.sys_store("STATE", 0)
    }

    /// Elapsed time since STIME, updating ATIME
    fn timer_elapsed(&mut self, atime: i32) -> AwlResult<i32> {
        let stime = self.sys_int("STIME")?;
        self.sys_store("ATIME", atime as u32)?;
        Ok(atime.wrapping_sub(stime) & 0x7FFF_FFFF)
    }

    fn pulse_timer(&mut self) -> AwlResult<()> {
        let pt = self.sys_int("PT")?;
        if pt <= 0 {
            // PT 0 resets the timer and its input
            if pt == 0 {
                self.sys_set_bit("IN", false)?;
            }
            return self.reset_timer();
        }
        let atime = self.time_ms();
        let mut state = self.sys_int("STATE")? as u32;
        let input = self.sys_bit("IN")?;
        if input && state & (STATE_RUNNING | STATE_FINISHED) == 0 {
            self.sys_store("STIME", atime as u32)?;
            state |= STATE_RUNNING;
            self.sys_store("STATE", state)?;
        }
        if state & STATE_RUNNING != 0 {
            let mut et = self.timer_elapsed(atime)?;
            if et >= pt {
                et = pt;
                self.sys_set_bit("Q", false)?;
                state = (state & !STATE_RUNNING) | STATE_FINISHED;
                self.sys_store("STATE", state)?;
            } else {
                self.sys_set_bit("Q", true)?;
            }
            self.sys_store("ET", et as u32)?;
        }
        if !input && state & STATE_FINISHED != 0 {
            self.sys_store("STATE", state & !STATE_FINISHED)?;
            self.sys_store("ET", 0)?;
        }
        Ok(())
    }

    fn on_delay_timer(&mut self) -> AwlResult<()> {
        let pt = self.sys_int("PT")?;
        if pt < 0 || !self.sys_bit("IN")? {
            return self.reset_timer();
        }
        let atime = self.time_ms();
        let mut state = self.sys_int("STATE")? as u32;
        if state & (STATE_RUNNING | STATE_FINISHED) == 0 {
            self.sys_store("STIME", atime as u32)?;
            state = STATE_RUNNING;
            self.sys_store("STATE", state)?;
        }
        if state & STATE_RUNNING != 0 {
            let et = self.timer_elapsed(atime)?;
            if et >= pt {
                self.sys_store("ET", pt as u32)?;
                self.sys_set_bit("Q", true)?;
                self.sys_store("STATE", STATE_FINISHED)?;
            } else {
                self.sys_store("ET", et as u32)?;
            }
        }
        Ok(())
    }

    fn off_delay_timer(&mut self) -> AwlResult<()> {
        let pt = self.sys_int("PT")?;
        if pt < 0 {
            return self.reset_timer();
        }
        if self.sys_bit("IN")? {
            self.sys_set_bit("Q", true)?;
            self.sys_store("ET", 0)?;
            return self.sys_store("STATE", 0);
        }
        let atime = self.time_ms();
        let mut state = self.sys_int("STATE")? as u32;
        if state & STATE_RUNNING == 0 && self.sys_bit("Q")? {
            self.sys_store("STIME", atime as u32)?;
            state = STATE_RUNNING;
            self.sys_store("STATE", state)?;
        }
        if state & STATE_RUNNING != 0 {
            let et = self.timer_elapsed(atime)?;
            if et >= pt {
                self.sys_store("ET", pt as u32)?;
                self.sys_set_bit("Q", false)?;
                self.sys_store("STATE", 0)?;
            } else {
                self.sys_store("ET", et as u32)?;
            }
        }
        Ok(())
    }
}

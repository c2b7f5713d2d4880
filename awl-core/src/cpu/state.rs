use crate::constants::COUNTER_MASK;
use std::fmt;
use std::time::Duration;

/// CPU execution states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    Stopped,
    /// Program loaded, startup not run yet
    Ready,
    Running,
}

impl fmt::Display for CpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuState::Stopped => write!(f, "STOP"),
            CpuState::Ready => write!(f, "READY"),
            CpuState::Running => write!(f, "RUN"),
        }
    }
}

/// Execution statistics. Rates are re-evaluated once per second.
#[derive(Debug, Clone, Default)]
pub struct CpuStats {
    /// Executed instructions (wraps at the counter mask)
    pub insn_count: u64,
    pub cycle_count: u64,
    pub insns_per_second: f64,
    pub avg_insns_per_cycle: f64,
    // Cycle times in seconds
    pub min_cycle_time: Option<f64>,
    pub max_cycle_time: Option<f64>,
    pub avg_cycle_time: Option<f64>,
    /// Duration of the most recent cycle
    pub last_cycle_time: Option<f64>,

    window_start: Duration,
    window_insn_start: u64,
    window_cycle_start: u64,
}

impl CpuStats {
    pub fn reset(&mut self, now: Duration) {
        *self = Self {
            window_start: now,
            ..Self::default()
        };
    }

    pub fn count_insn(&mut self) {
        self.insn_count = (self.insn_count + 1) & COUNTER_MASK;
    }

    /// Account a finished cycle of `cycle_time` seconds
    pub fn cycle_done(&mut self, cycle_time: f64, now: Duration) {
        self.cycle_count = (self.cycle_count + 1) & COUNTER_MASK;
        self.last_cycle_time = Some(cycle_time);

        let elapsed = now.saturating_sub(self.window_start).as_secs_f64();
        if elapsed < 1.0 {
            return;
        }
        let cycles = self.cycle_count.wrapping_sub(self.window_cycle_start) & COUNTER_MASK;
        let insns = self.insn_count.wrapping_sub(self.window_insn_start) & COUNTER_MASK;
        self.insns_per_second = insns as f64 / elapsed;
        if cycles > 0 {
            self.avg_insns_per_cycle = insns as f64 / cycles as f64;
            let avg = elapsed / cycles as f64;
            self.max_cycle_time = Some(self.max_cycle_time.map_or(avg, |m| m.max(avg)));
            self.min_cycle_time = Some(self.min_cycle_time.map_or(avg, |m| m.min(avg)));
            self.avg_cycle_time = Some(self.avg_cycle_time.map_or(avg, |a| (a + avg) / 2.0));
        }
        self.window_start = now;
        self.window_insn_start = self.insn_count;
        self.window_cycle_start = self.cycle_count;
    }
}

//! S7 timers
//!
//! A timer is driven by the RLO it sees on every start instruction. The
//! current time is passed in explicitly so tests can step it.

use crate::datatypes::{s5t_base_ms, s5t_to_ms, s5t_with_base, S5T_TB_10MS, S5T_TB_SHIFT};
use awl_common::AwlResult;
use std::time::Duration;

/// What happens to the timer output when the time runs out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Expiry {
    #[default]
    ClearStatus,
    SetStatus,
}

#[derive(Debug, Clone, Default)]
pub struct Timer {
    prev_rlo: bool,
    prev_rlo_fr: bool,
    timebase: u16,
    deadline: Duration,
    remaining: Duration,
    status: bool,
    running: bool,
    expiry: Expiry,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            timebase: S5T_TB_10MS,
            ..Self::default()
        }
    }

    fn update(&mut self, now: Duration) {
        if !self.running {
            return;
        }
        self.remaining = self.deadline.saturating_sub(now);
        if self.remaining.is_zero() {
            self.running = false;
            self.status = self.expiry == Expiry::SetStatus;
        }
    }

    fn start(&mut self, s5t: u16, now: Duration) -> AwlResult<()> {
        let ms = s5t_to_ms(s5t)?;
        self.timebase = (s5t >> S5T_TB_SHIFT) & 3;
        self.deadline = now + Duration::from_millis(ms);
        self.remaining = Duration::from_millis(ms);
        self.running = true;
        Ok(())
    }

    /// Timer output (Q)
    pub fn status(&mut self, now: Duration) -> bool {
        self.update(now);
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// R
    pub fn reset(&mut self) {
        self.running = false;
        self.status = false;
        self.remaining = Duration::ZERO;
    }

    /// FR: a positive edge re-enables the start edge detection
    pub fn release(&mut self, rlo: bool) {
        if rlo && !self.prev_rlo_fr {
            self.prev_rlo = false;
        }
        self.prev_rlo_fr = rlo;
    }

    /// Remaining time in counts of the active timebase
    pub fn value_bin(&mut self, now: Duration) -> u16 {
        self.update(now);
        let base = u128::from(s5t_base_ms(self.timebase));
        let ms = self.remaining.as_millis();
        ((ms + base / 2) / base).min(999) as u16
    }

    /// Remaining time as S5TIME (BCD count plus timebase)
    pub fn value_s5t(&mut self, now: Duration) -> u16 {
        let count = self.value_bin(now);
        s5t_with_base(self.timebase, u64::from(count))
    }

    /// SI: pulse
    pub fn run_si(&mut self, rlo: bool, s5t: u16, now: Duration) -> AwlResult<()> {
        self.expiry = Expiry::ClearStatus;
        if rlo {
            if !self.prev_rlo {
                self.status = true;
                self.start(s5t, now)?;
            }
        } else {
            self.update(now);
            self.running = false;
            self.status = false;
        }
        self.prev_rlo = rlo;
        Ok(())
    }

    /// SV: extended pulse
    pub fn run_sv(&mut self, rlo: bool, s5t: u16, now: Duration) -> AwlResult<()> {
        self.expiry = Expiry::ClearStatus;
        if rlo && !self.prev_rlo {
            self.status = true;
            self.start(s5t, now)?;
        }
        self.prev_rlo = rlo;
        Ok(())
    }

    /// SE: on-delay
    pub fn run_se(&mut self, rlo: bool, s5t: u16, now: Duration) -> AwlResult<()> {
        self.expiry = Expiry::SetStatus;
        if rlo {
            if !self.prev_rlo {
                self.start(s5t, now)?;
            }
        } else {
            self.update(now);
            self.running = false;
            self.status = false;
        }
        self.prev_rlo = rlo;
        Ok(())
    }

    /// SS: retentive on-delay
    pub fn run_ss(&mut self, rlo: bool, s5t: u16, now: Duration) -> AwlResult<()> {
        self.expiry = Expiry::SetStatus;
        if rlo && !self.prev_rlo {
            self.start(s5t, now)?;
        }
        self.prev_rlo = rlo;
        Ok(())
    }

    /// SA: off-delay
    pub fn run_sa(&mut self, rlo: bool, s5t: u16, now: Duration) -> AwlResult<()> {
        self.expiry = Expiry::ClearStatus;
        if rlo && !self.prev_rlo {
            self.update(now);
            self.status = true;
            self.running = false;
        }
        if !rlo && self.prev_rlo {
            self.status = true;
            self.start(s5t, now)?;
        }
        self.prev_rlo = rlo;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    // S5T#1S in the 100ms timebase
    const ONE_SECOND: u16 = 0x1010;

    #[test]
    fn test_on_delay() {
        let mut t = Timer::new();
        t.run_se(true, ONE_SECOND, ms(0)).expect("Should start");
        assert!(!t.status(ms(500)));
        assert_eq!(t.value_bin(ms(500)), 5);
        assert!(t.status(ms(1000)));
        // RLO drop resets the on-delay
        t.run_se(false, ONE_SECOND, ms(1100)).expect("Should run");
        assert!(!t.status(ms(1100)));
    }

    #[test]
    fn test_pulse_stops_on_rlo_drop() {
        let mut t = Timer::new();
        t.run_si(true, ONE_SECOND, ms(0)).expect("Should start");
        assert!(t.status(ms(100)));
        t.run_si(false, ONE_SECOND, ms(200)).expect("Should run");
        assert!(!t.status(ms(200)));
        assert!(!t.is_running());
    }

    #[test]
    fn test_extended_pulse_runs_out() {
        let mut t = Timer::new();
        t.run_sv(true, ONE_SECOND, ms(0)).expect("Should start");
        t.run_sv(false, ONE_SECOND, ms(10)).expect("Should run");
        assert!(t.status(ms(900)));
        assert!(!t.status(ms(1000)));
    }

    #[test]
    fn test_off_delay() {
        let mut t = Timer::new();
        t.run_sa(true, ONE_SECOND, ms(0)).expect("Should run");
        assert!(t.status(ms(0)));
        t.run_sa(false, ONE_SECOND, ms(100)).expect("Should start");
        assert!(t.status(ms(600)));
        assert!(!t.status(ms(1100)));
    }

    #[test]
    fn test_s5t_readback_and_release() {
        let mut t = Timer::new();
        t.run_ss(true, ONE_SECOND, ms(0)).expect("Should start");
        assert_eq!(t.value_s5t(ms(300)), 0x1007);
        // no new edge without FR
        t.reset();
        t.run_ss(true, ONE_SECOND, ms(400)).expect("Should run");
        assert!(!t.is_running());
        t.release(true);
        t.run_ss(true, ONE_SECOND, ms(400)).expect("Should run");
        assert!(t.is_running());
    }

    #[test]
    fn test_invalid_s5t_faults() {
        let mut t = Timer::new();
        assert!(t.run_sv(true, 0x00AA, ms(0)).is_err());
    }
}

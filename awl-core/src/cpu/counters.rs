//! S7 counters (0..=999)

use crate::datatypes::{bcd_to_u32, u32_to_bcd};
use awl_common::{AwlError, AwlResult};

pub const COUNTER_MAX: u16 = 999;

#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: u16,
    prev_rlo_s: bool,
    prev_rlo_up: bool,
    prev_rlo_down: bool,
    prev_rlo_fr: bool,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter output: true while the value is not zero
    pub fn status(&self) -> bool {
        self.value != 0
    }

    pub fn value_bin(&self) -> u16 {
        self.value
    }

    pub fn value_bcd(&self) -> u16 {
        u32_to_bcd(u32::from(self.value), 3) as u16
    }

    /// S: on a positive edge load the BCD preset
    pub fn set(&mut self, rlo: bool, preset_bcd: u32) -> AwlResult<()> {
        if rlo && !self.prev_rlo_s {
            let value = bcd_to_u32(preset_bcd & 0xFFFF, 4)
                .filter(|v| *v <= u32::from(COUNTER_MAX))
                .ok_or_else(|| AwlError::fault(format!("Invalid BCD value {:X} for counter", preset_bcd & 0xFFFF)))?;
            self.value = value as u16;
        }
        self.prev_rlo_s = rlo;
        Ok(())
    }

    /// R
    pub fn reset(&mut self) {
        self.value = 0;
    }

    /// FR: a positive edge re-enables all edge detections
    pub fn release(&mut self, rlo: bool) {
        if rlo && !self.prev_rlo_fr {
            self.prev_rlo_s = false;
            self.prev_rlo_up = false;
            self.prev_rlo_down = false;
        }
        self.prev_rlo_fr = rlo;
    }

    /// ZV / CU
    pub fn count_up(&mut self, rlo: bool) {
        if rlo && !self.prev_rlo_up && self.value < COUNTER_MAX {
            self.value += 1;
        }
        self.prev_rlo_up = rlo;
    }

    /// ZR / CD
    pub fn count_down(&mut self, rlo: bool) {
        if rlo && !self.prev_rlo_down && self.value > 0 {
            self.value -= 1;
        }
        self.prev_rlo_down = rlo;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_counts_on_edges_only() {
        let mut c = Counter::new();
        c.count_up(true);
        c.count_up(true);
        c.count_up(false);
        c.count_up(true);
        assert_eq!(c.value_bin(), 2);
        c.count_down(true);
        assert_eq!(c.value_bin(), 1);
        assert!(c.status());
    }

    #[test]
    fn test_set_from_bcd() {
        let mut c = Counter::new();
        c.set(true, 0x0123).expect("Should set");
        assert_eq!(c.value_bin(), 123);
        assert_eq!(c.value_bcd(), 0x123);
        c.reset();
        assert!(!c.status());
        assert!(Counter::new().set(true, 0x01A0).is_err());
    }

    #[test]
    fn test_limits() {
        let mut c = Counter::new();
        c.set(true, 0x999).expect("Should set");
        c.count_up(true);
        assert_eq!(c.value_bin(), 999);
        let mut c = Counter::new();
        c.count_down(true);
        assert_eq!(c.value_bin(), 0);
    }

    #[test]
    fn test_release_allows_new_edge() {
        let mut c = Counter::new();
        c.count_up(true);
        c.release(true);
        c.count_up(true);
        assert_eq!(c.value_bin(), 2);
    }
}

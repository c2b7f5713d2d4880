//! The S7 status word

use std::fmt;

/// Bit names, lowest bit first
const BIT_NAMES: [&str; 9] = ["/ER", "VKE", "STA", "OR", "OS", "OV", "A0", "A1", "BIE"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusWord {
    /// /ER, first check
    pub ner: bool,
    /// VKE, result of logic operation (RLO)
    pub vke: bool,
    pub sta: bool,
    pub or: bool,
    /// OS, stored overflow
    pub os: bool,
    pub ov: bool,
    /// A0 / CC0
    pub a0: bool,
    /// A1 / CC1
    pub a1: bool,
    /// BIE / BR, binary result
    pub bie: bool,
}

impl StatusWord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn get_bit(&self, nr: u8) -> Option<bool> {
        Some(match nr {
            0 => self.ner,
            1 => self.vke,
            2 => self.sta,
            3 => self.or,
            4 => self.os,
            5 => self.ov,
            6 => self.a0,
            7 => self.a1,
            8 => self.bie,
            _ => return None,
        })
    }

    pub fn word(&self) -> u16 {
        [self.ner, self.vke, self.sta, self.or, self.os, self.ov, self.a0, self.a1, self.bie]
            .iter()
            .enumerate()
            .fold(0u16, |acc, (i, b)| acc | (u16::from(*b) << i))
    }

    pub fn set_word(&mut self, word: u16) {
        let bit = |n: u16| word & (1 << n) != 0;
        self.ner = bit(0);
        self.vke = bit(1);
        self.sta = bit(2);
        self.or = bit(3);
        self.os = bit(4);
        self.ov = bit(5);
        self.a0 = bit(6);
        self.a1 = bit(7);
        self.bie = bit(8);
    }

    /// Set A1/A0/OV(/OS) from a REAL result
    pub fn set_for_float(&mut self, dword: u32) {
        let magnitude = dword & 0x7FFF_FFFF;
        let negative = dword & 0x8000_0000 != 0;
        if magnitude != 0 && magnitude < 0x0080_0000 {
            // denormal
            self.set_cc(false, false, true);
        } else if magnitude == 0 {
            self.a1 = false;
            self.a0 = false;
            self.ov = false;
        } else if magnitude == 0x7F80_0000 {
            self.set_cc(!negative, negative, true);
        } else if magnitude > 0x7F80_0000 {
            // NaN
            self.set_cc(true, true, true);
        } else {
            self.a1 = !negative;
            self.a0 = negative;
            self.ov = false;
        }
    }

    /// Set A1/A0/OV and raise OS if OV is set
    pub fn set_cc(&mut self, a1: bool, a0: bool, ov: bool) {
        self.a1 = a1;
        self.a0 = a0;
        self.ov = ov;
        if ov {
            self.os = true;
        }
    }

    /// Condition codes for an integer result: A1 for positive, A0 for negative
    pub fn set_for_int(&mut self, value: i64, overflow: bool) {
        self.set_cc(value > 0, value < 0, overflow);
    }

    /// Condition codes after a comparison of `a` against `b`
    pub fn set_compare(&mut self, ordering: Option<std::cmp::Ordering>) {
        use std::cmp::Ordering::*;
        let (a1, a0, ov) = match ordering {
            Some(Equal) => (false, false, false),
            Some(Greater) => (true, false, false),
            Some(Less) => (false, true, false),
            None => (true, true, true),
        };
        self.a1 = a1;
        self.a0 = a0;
        self.ov = ov;
        if ov {
            self.os = true;
        }
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = (0..9u8)
            .rev()
            .map(|i| format!("{}:{}", BIT_NAMES[usize::from(i)], u8::from(self.get_bit(i).unwrap_or(false))))
            .collect();
        write!(f, "{}", parts.join("  "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::{NAN_DWORD, NEG_INF_DWORD, POS_INF_DWORD};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_word_roundtrip() {
        let mut s = StatusWord::new();
        s.set_word(0x1A5);
        assert!(s.ner && s.sta && s.ov && s.a1 && s.bie);
        assert!(!s.vke && !s.or && !s.os && !s.a0);
        assert_eq!(s.word(), 0x1A5);
    }

    #[test]
    fn test_float_classification() {
        let mut s = StatusWord::new();
        s.set_for_float(0x8000_0000);
        assert_eq!((s.a1, s.a0, s.ov, s.os), (false, false, false, false));
        s.set_for_float(1.5f32.to_bits());
        assert_eq!((s.a1, s.a0, s.ov), (true, false, false));
        s.set_for_float((-1.5f32).to_bits());
        assert_eq!((s.a1, s.a0, s.ov), (false, true, false));
        s.set_for_float(POS_INF_DWORD);
        assert_eq!((s.a1, s.a0, s.ov, s.os), (true, false, true, true));
        s.set_for_float(NEG_INF_DWORD);
        assert_eq!((s.a1, s.a0, s.ov), (false, true, true));
        s.set_for_float(NAN_DWORD);
        assert_eq!((s.a1, s.a0, s.ov), (true, true, true));
        s.set_for_float(0x0000_0001);
        assert_eq!((s.a1, s.a0, s.ov), (false, false, true));
    }

    #[test]
    fn test_display_lists_bits_high_to_low() {
        let mut s = StatusWord::new();
        s.vke = true;
        assert_eq!(
            s.to_string(),
            "BIE:0  A1:0  A0:0  OV:0  OS:0  OR:0  STA:0  VKE:1  /ER:0"
        );
    }
}

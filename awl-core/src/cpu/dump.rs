//! Human readable CPU state, attached to faults and shown by frontends

use super::Cpu;
use crate::constants::{DUMP_BYTES_PER_LINE, DUMP_LOCAL_BYTES, DUMP_MEMORY_BYTES};
use crate::pointer::Pointer;
use std::fmt;

/// Hex dump of the first `limit` bytes, `DUMP_BYTES_PER_LINE` per line
fn write_bytes(f: &mut fmt::Formatter<'_>, name: &str, bytes: &[u8], limit: usize) -> fmt::Result {
    let bytes = &bytes[..bytes.len().min(limit)];
    if bytes.is_empty() {
        return writeln!(f, "{:>6}:  --", name);
    }
    for (i, line) in bytes.chunks(DUMP_BYTES_PER_LINE).enumerate() {
        let label = if i == 0 { name } else { "" };
        let words: Vec<String> = line.chunks(4).map(hex::encode_upper).collect();
        writeln!(f, "{:>6}:  {}", label, words.join(" "))?;
    }
    Ok(())
}

fn fmt_seconds(t: Option<f64>) -> String {
    t.map_or_else(|| "-/-".to_string(), |t| format!("{:.3} s", t))
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== S7-CPU dump ===  ({})", self.state)?;
        writeln!(f, "   STW:  {}", self.status)?;

        let accus: Vec<String> = self.accu[..usize::from(self.config.nr_accus)]
            .iter()
            .map(|a| format!("{:08X}", a))
            .collect();
        writeln!(f, "  Accu:  {}", accus.join("  "))?;
        writeln!(f, "   AR1:  {:08X}  ({})", self.ar1, Pointer(self.ar1))?;
        writeln!(f, "   AR2:  {:08X}  ({})", self.ar2, Pointer(self.ar2))?;

        write_bytes(f, "M", self.flags.as_slice(), DUMP_MEMORY_BYTES)?;
        write_bytes(f, "PAE", self.inputs.as_slice(), DUMP_MEMORY_BYTES)?;
        write_bytes(f, "PAA", self.outputs.as_slice(), DUMP_MEMORY_BYTES)?;

        let register = |r: Option<u16>| r.map_or_else(|| "--".to_string(), |n| n.to_string());
        writeln!(f, "    DB:  {}", register(self.db_register))?;
        writeln!(f, "    DI:  {}", register(self.di_register))?;

        let chain: Vec<String> = self.call_stack.iter().map(|frame| frame.block.name()).collect();
        if chain.is_empty() {
            writeln!(f, " Calls:  None")?;
        } else {
            writeln!(f, " Calls:  {}", chain.join(" -> "))?;
        }

        match self.call_stack.last() {
            Some(frame) => {
                let start = frame.l.base as usize;
                let end = self.lstack.memory.len().min(start + DUMP_LOCAL_BYTES);
                write_bytes(f, "L", &self.lstack.memory.as_slice()[start..end], DUMP_LOCAL_BYTES)?;
                // ip already points past the executing instruction
                let current = frame
                    .ip
                    .checked_sub(1)
                    .and_then(|ip| frame.block.insns.get(ip));
                match current {
                    Some(insn) => writeln!(f, "  Stmt:  {}  (line {})", insn, insn.line)?,
                    None => writeln!(f, "  Stmt:  --")?,
                }
            }
            None => {
                writeln!(f, "     L:  --")?;
                writeln!(f, "  Stmt:  --")?;
            }
        }

        let stats = &self.stats;
        writeln!(
            f,
            " Speed:  {:.0} stmt/s  ({:.1} stmt/cycle)",
            stats.insns_per_second, stats.avg_insns_per_cycle
        )?;
        write!(
            f,
            "CycleT:  avg {}  min {}  max {}",
            fmt_seconds(stats.avg_cycle_time),
            fmt_seconds(stats.min_cycle_time),
            fmt_seconds(stats.max_cycle_time)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuConfig;

    #[test]
    fn test_stopped_cpu_dump() {
        let cpu = Cpu::new(CpuConfig::default()).expect("Default config should be valid");
        let dump = cpu.to_string();
        assert!(dump.starts_with("=== S7-CPU dump ==="));
        assert!(dump.contains("Calls:  None"));
        assert!(dump.contains("AR1:  00000000"));
        // 64 flag bytes at 16 per line
        assert_eq!(dump.lines().filter(|l| l.contains("00000000 00000000 00000000 00000000")).count(), 12);
    }
}

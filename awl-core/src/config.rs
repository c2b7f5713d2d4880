use crate::constants::*;
use awl_common::{AwlError, AwlResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Mnemonic language selection. `Auto` picks per program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MnemonicsSetting {
    Auto,
    De,
    En,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub mnemonics: MnemonicsSetting,

    // Hardware resources
    pub nr_accus: u8,
    pub nr_timers: u32,
    pub nr_counters: u32,
    pub nr_flags: u32,
    pub nr_inputs: u32,
    pub nr_outputs: u32,
    pub nr_localbytes: u32,
    pub max_call_depth: usize,

    // Timing (seconds)
    pub cycle_time_limit: f64,
    pub run_time_limit: Option<f64>,
    pub cycle_time_target: Option<f64>,

    pub ob_temp_presets: bool,
    pub extended_insns: bool,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            mnemonics: MnemonicsSetting::Auto,
            nr_accus: DEFAULT_NR_ACCUS,
            nr_timers: DEFAULT_NR_TIMERS,
            nr_counters: DEFAULT_NR_COUNTERS,
            nr_flags: DEFAULT_NR_FLAGS,
            nr_inputs: DEFAULT_NR_INPUTS,
            nr_outputs: DEFAULT_NR_OUTPUTS,
            nr_localbytes: DEFAULT_NR_LOCALBYTES,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            cycle_time_limit: DEFAULT_CYCLE_TIME_LIMIT,
            run_time_limit: None,
            cycle_time_target: None,
            ob_temp_presets: true,
            extended_insns: false,
        }
    }
}

impl CpuConfig {
    /// Load a configuration from a JSON file. Missing keys take defaults.
    pub fn load(path: &Path) -> AwlResult<Self> {
        let contents = fs::read_to_string(path)?;
        let config: CpuConfig = serde_json::from_str(&contents)
            .map_err(|e| AwlError::compile(format!("Failed to parse CPU config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save as pretty JSON
    pub fn save(&self, path: &Path) -> AwlResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| AwlError::bug(format!("Failed to serialize CPU config: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> AwlResult<()> {
        if self.nr_accus != 2 && self.nr_accus != 4 {
            return Err(AwlError::compile(format!(
                "Invalid number of accumulators: {} (must be 2 or 4)",
                self.nr_accus
            )));
        }
        if self.nr_localbytes == 0 {
            return Err(AwlError::compile("Number of local bytes must not be zero"));
        }
        if self.max_call_depth == 0 {
            return Err(AwlError::compile("Maximum call depth must not be zero"));
        }
        if self.cycle_time_limit.is_nan() || self.cycle_time_limit <= 0.0 {
            return Err(AwlError::compile(format!(
                "Invalid cycle time limit: {} s",
                self.cycle_time_limit
            )));
        }
        Ok(())
    }
}

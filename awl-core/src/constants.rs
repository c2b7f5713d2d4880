//! Central configuration defaults and constants for the AWL CPU

// Default CPU configuration
pub const DEFAULT_NR_ACCUS: u8 = 2;
pub const DEFAULT_NR_TIMERS: u32 = 2048;
pub const DEFAULT_NR_COUNTERS: u32 = 2048;
pub const DEFAULT_NR_FLAGS: u32 = 8192;
pub const DEFAULT_NR_INPUTS: u32 = 8192;
pub const DEFAULT_NR_OUTPUTS: u32 = 8192;
pub const DEFAULT_NR_LOCALBYTES: u32 = 1024;
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;
pub const DEFAULT_CYCLE_TIME_LIMIT: f64 = 5.0; // seconds

// Runtime check interval (in executed instructions)
pub const RUNTIME_CHECK_INTERVAL_INITIAL: u32 = 64;
pub const RUNTIME_CHECK_INTERVAL_MIN: u32 = 1;
pub const RUNTIME_CHECK_INTERVAL_MAX: u32 = 16384;
pub const RUNTIME_CHECK_TARGET_SECONDS: f64 = 0.001;

// Instruction and cycle counters wrap at 30 bits
pub const COUNTER_MASK: u64 = 0x3FFF_FFFF;

// Parenthesis stack depth (U( ... ))
pub const MAX_PAREN_DEPTH: usize = 7;

// OB TEMP presets
pub const OB_STARTUP_TEMP_ALLOCATION: u32 = 20;

// Startup OBs, tried in this order
pub const STARTUP_OBS: [u16; 3] = [100, 101, 102];
pub const CYCLIC_OB: u16 = 1;

// Dump configuration
pub const DUMP_MEMORY_BYTES: usize = 64;
pub const DUMP_LOCAL_BYTES: usize = 16;
pub const DUMP_BYTES_PER_LINE: usize = 16;

// Pointer layout
pub const AREA_SHIFT: u32 = 24;
pub const POINTER_OFFSET_MASK: u32 = 0x0007_FFF8;
pub const MAX_BYTE_OFFSET: u32 = 0xFFFF;

// Extended (non-pointer) area codes used by indirect addressing of
// timers, counters and block references
pub const EXT_AREA_MASK: u64 = 0xFFFF_0000_00;
pub const EXT_AREA_T: u64 = 0x01FF_0000_00;
pub const EXT_AREA_Z: u64 = 0x02FF_0000_00;
pub const EXT_AREA_BLKREF_DB: u64 = 0x03FF_0000_00;
pub const EXT_AREA_BLKREF_FB: u64 = 0x04FF_0000_00;
pub const EXT_AREA_BLKREF_FC: u64 = 0x05FF_0000_00;
pub const EXT_ADDRESS_MASK: u64 = 0x00FF_FFFF;

// ANY pointer magic byte
pub const ANY_MAGIC: u8 = 0x10;

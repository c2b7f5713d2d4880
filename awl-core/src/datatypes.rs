//! Data types, immediate parsing and numeric encodings
//!
//! The float and BCD helpers reproduce the quirks of the S7 float unit:
//! NaNs collapse to the all-ones pattern and denormals flush to zero.

use crate::memory::Value;
use awl_common::{AwlError, AwlResult};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const POS_INF_DWORD: u32 = 0x7F80_0000;
pub const NEG_INF_DWORD: u32 = 0xFF80_0000;
pub const POS_NAN_DWORD: u32 = 0x7FFF_FFFF;
pub const NAN_DWORD: u32 = 0xFFFF_FFFF;

/// Canonicalize a raw IEEE-754 single
pub fn canonical_real_dword(dword: u32) -> u32 {
    let magnitude = dword & 0x7FFF_FFFF;
    if magnitude > POS_INF_DWORD {
        NAN_DWORD
    } else if magnitude != 0 && magnitude < 0x0080_0000 {
        // Denormal: keep the sign, drop the mantissa
        dword & 0x8000_0000
    } else {
        dword
    }
}

pub fn f32_to_dword(value: f32) -> u32 {
    canonical_real_dword(value.to_bits())
}

/// Encode an f64 computation result the way the float unit stores it
pub fn f64_to_dword(value: f64) -> u32 {
    f32_to_dword(value as f32)
}

pub fn dword_to_f32(dword: u32) -> f32 {
    f32::from_bits(dword)
}

pub fn is_denormal_dword(dword: u32) -> bool {
    let magnitude = dword & 0x7FFF_FFFF;
    magnitude != 0 && magnitude < 0x0080_0000
}

/// Decode `digits` BCD nibbles. `None` if a nibble is above 9 or bits above
/// the digits are set.
pub fn bcd_to_u32(value: u32, digits: u32) -> Option<u32> {
    if digits < 8 && value >> (digits * 4) != 0 {
        return None;
    }
    let mut result = 0u32;
    for i in (0..digits).rev() {
        let nibble = (value >> (i * 4)) & 0xF;
        if nibble > 9 {
            return None;
        }
        result = result * 10 + nibble;
    }
    Some(result)
}

pub fn u32_to_bcd(mut value: u32, digits: u32) -> u32 {
    let mut result = 0u32;
    for i in 0..digits {
        result |= (value % 10) << (i * 4);
        value /= 10;
    }
    result
}

// S5TIME timebases (bits 12..13)
pub const S5T_TB_10MS: u16 = 0;
pub const S5T_TB_100MS: u16 = 1;
pub const S5T_TB_1S: u16 = 2;
pub const S5T_TB_10S: u16 = 3;
pub const S5T_TB_SHIFT: u16 = 12;

/// Milliseconds per count for each timebase
pub fn s5t_base_ms(timebase: u16) -> u64 {
    match timebase & 3 {
        S5T_TB_10MS => 10,
        S5T_TB_100MS => 100,
        S5T_TB_1S => 1000,
        _ => 10000,
    }
}

/// Encode a duration with the finest timebase that can represent it
pub fn ms_to_s5t(ms: u64) -> AwlResult<u16> {
    let (timebase, count) = if ms <= 9_990 {
        (S5T_TB_10MS, (ms + 5) / 10)
    } else if ms <= 99_900 {
        (S5T_TB_100MS, (ms + 50) / 100)
    } else if ms <= 999_000 {
        (S5T_TB_1S, ms / 1000)
    } else if ms <= 9_990_000 {
        (S5T_TB_10S, ((ms + 500) / 1000) / 10)
    } else {
        return Err(AwlError::compile(format!(
            "Cannot convert {} ms to S5T",
            ms
        )));
    };
    Ok(s5t_with_base(timebase, count))
}

/// Encode `count` (clamped to 999) in the given timebase
pub fn s5t_with_base(timebase: u16, count: u64) -> u16 {
    (timebase << S5T_TB_SHIFT) | u32_to_bcd(count.min(999) as u32, 3) as u16
}

pub fn s5t_to_ms(s5t: u16) -> AwlResult<u64> {
    let count = bcd_to_u32(u32::from(s5t & 0x0FFF), 3)
        .ok_or_else(|| AwlError::fault(format!("Invalid S5T value: {:04X}", s5t)))?;
    Ok(u64::from(count) * s5t_base_ms(s5t >> S5T_TB_SHIFT))
}

/// Parse the body of a `T#`/`S5T#` literal (e.g. `1H2M3S40MS`) into ms
pub fn parse_duration_ms(text: &str) -> AwlResult<u64> {
    let invalid = || AwlError::compile(format!("Invalid time '{}'", text));
    let mut rest = text.to_ascii_uppercase();
    if rest.is_empty() {
        return Err(invalid());
    }
    let mut ms = 0u64;
    while !rest.is_empty() {
        let mult = if rest.ends_with("MS") {
            rest.truncate(rest.len() - 2);
            1
        } else if rest.ends_with('S') {
            rest.truncate(rest.len() - 1);
            1000
        } else if rest.ends_with('M') {
            rest.truncate(rest.len() - 1);
            60_000
        } else if rest.ends_with('H') {
            rest.truncate(rest.len() - 1);
            3_600_000
        } else if rest.ends_with('D') {
            rest.truncate(rest.len() - 1);
            86_400_000
        } else {
            return Err(invalid());
        };
        let digits_start = rest
            .rfind(|c: char| !c.is_ascii_digit())
            .map_or(0, |i| i + 1);
        let num: u64 = rest[digits_start..].parse().map_err(|_| invalid())?;
        rest.truncate(digits_start);
        rest = rest.trim_end_matches('_').to_string();
        ms = ms.saturating_add(num.saturating_mul(mult));
    }
    Ok(ms)
}

// Immediate parsers. They return `Ok(None)` when the token does not have
// their shape, and an error when it does but is malformed.

/// 16-bit decimal integer
pub fn parse_int(token: &str) -> AwlResult<Option<i32>> {
    let digits = token.strip_prefix(['+', '-']).unwrap_or(token);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Ok(None);
    }
    let value: i64 = token
        .parse()
        .map_err(|_| AwlError::compile("16-bit immediate overflow"))?;
    if !(-32768..=32767).contains(&value) {
        return Err(AwlError::compile("16-bit immediate overflow"));
    }
    Ok(Some(value as i32))
}

/// `L#` 32-bit integer
pub fn parse_dint(token: &str) -> AwlResult<Option<u32>> {
    let upper = token.to_ascii_uppercase();
    let Some(body) = upper.strip_prefix("L#") else {
        return Ok(None);
    };
    let value: i64 = body
        .parse()
        .map_err(|_| AwlError::compile(format!("Invalid immediate '{}'", token)))?;
    if !(i64::from(i32::MIN)..=i64::from(i32::MAX)).contains(&value) {
        return Err(AwlError::compile("32-bit immediate overflow"));
    }
    Ok(Some(value as u32))
}

/// Floating point literal. Requires a `.` or an exponent so that plain
/// integers stay integers.
pub fn parse_real(token: &str) -> AwlResult<Option<u32>> {
    let looks_real = token.contains('.') || token.to_ascii_uppercase().contains('E');
    let first = token.chars().next();
    if !looks_real || !matches!(first, Some('0'..='9' | '+' | '-' | '.')) {
        return Ok(None);
    }
    match token.parse::<f32>() {
        Ok(value) => Ok(Some(f32_to_dword(value))),
        Err(_) => Ok(None),
    }
}

pub fn parse_s5t(token: &str) -> AwlResult<Option<u16>> {
    let upper = token.to_ascii_uppercase();
    match upper.strip_prefix("S5T#").or_else(|| upper.strip_prefix("S5TIME#")) {
        Some(body) => Ok(Some(ms_to_s5t(parse_duration_ms(body)?)?)),
        None => Ok(None),
    }
}

pub fn parse_time(token: &str) -> AwlResult<Option<u32>> {
    let upper = token.to_ascii_uppercase();
    let Some(body) = upper.strip_prefix("T#").or_else(|| upper.strip_prefix("TIME#")) else {
        return Ok(None);
    };
    let ms = parse_duration_ms(body)?;
    if ms > 0x7FFF_FFFF {
        return Err(AwlError::compile("T# time too big"));
    }
    Ok(Some(ms as u32))
}

pub fn parse_bin(token: &str) -> AwlResult<Option<u32>> {
    let upper = token.to_ascii_uppercase();
    let Some(body) = upper.strip_prefix("2#") else {
        return Ok(None);
    };
    u32::from_str_radix(&body.replace('_', ""), 2)
        .map(Some)
        .map_err(|_| AwlError::compile(format!("Invalid immediate '{}'", token)))
}

fn parse_hex_prefixed(token: &str, prefix: &str, max: u32) -> AwlResult<Option<u32>> {
    let upper = token.to_ascii_uppercase();
    let Some(body) = upper.strip_prefix(prefix) else {
        return Ok(None);
    };
    match u32::from_str_radix(&body.replace('_', ""), 16) {
        Ok(v) if v <= max => Ok(Some(v)),
        _ => Err(AwlError::compile(format!("Invalid immediate '{}'", token))),
    }
}

pub fn parse_hex_byte(token: &str) -> AwlResult<Option<u32>> {
    parse_hex_prefixed(token, "B#16#", 0xFF)
}

pub fn parse_hex_word(token: &str) -> AwlResult<Option<u32>> {
    parse_hex_prefixed(token, "W#16#", 0xFFFF)
}

pub fn parse_hex_dword(token: &str) -> AwlResult<Option<u32>> {
    parse_hex_prefixed(token, "DW#16#", 0xFFFF_FFFF)
}

/// `C#` counter value in BCD
pub fn parse_bcd_word(token: &str) -> AwlResult<Option<u32>> {
    let upper = token.to_ascii_uppercase();
    let Some(body) = upper.strip_prefix("C#") else {
        return Ok(None);
    };
    if body.is_empty() || body.len() > 3 || !body.chars().all(|c| c.is_ascii_digit()) {
        return Err(AwlError::compile(format!("Invalid C# immediate '{}'", token)));
    }
    let value: u32 = body
        .parse()
        .map_err(|_| AwlError::compile(format!("Invalid C# immediate '{}'", token)))?;
    Ok(Some(u32_to_bcd(value, 3)))
}

/// `B#(a, b)` or `B#(a, b, c, d)`. Returns the value and consumed tokens.
pub fn parse_byte_array(tokens: &[String]) -> AwlResult<Option<(u32, usize)>> {
    let Some(first) = tokens.first() else {
        return Ok(None);
    };
    if !first.eq_ignore_ascii_case("B#(") {
        return Ok(None);
    }
    let invalid = || AwlError::compile("Invalid B#( ) immediate");
    let byte_at = |i: usize| -> AwlResult<u32> {
        let v: u32 = tokens
            .get(i)
            .and_then(|t| t.parse().ok())
            .ok_or_else(invalid)?;
        if v > 0xFF {
            return Err(invalid());
        }
        Ok(v)
    };
    let tok = |i: usize| tokens.get(i).map(|s| s.as_str());
    if tok(2) == Some(",") && tok(4) == Some(")") {
        Ok(Some(((byte_at(1)? << 8) | byte_at(3)?, 5)))
    } else if tok(2) == Some(",") && tok(4) == Some(",") && tok(6) == Some(",") && tok(8) == Some(")")
    {
        let v = (byte_at(1)? << 24) | (byte_at(3)? << 16) | (byte_at(5)? << 8) | byte_at(7)?;
        Ok(Some((v, 9)))
    } else {
        Err(invalid())
    }
}

/// `'abc'` string literal of at most `max_len` characters, packed big-endian
pub fn parse_string(token: &str, max_len: usize) -> AwlResult<Option<Vec<u8>>> {
    if token.len() < 2 || !token.starts_with('\'') || !token.ends_with('\'') {
        return Ok(None);
    }
    let body = &token[1..token.len() - 1];
    if body.len() > max_len {
        return Err(AwlError::compile(format!(
            "String too long (>{} characters)",
            max_len
        )));
    }
    Ok(Some(body.bytes().collect()))
}

/// Parse `byte.bit` into a pointer offset value (`byte << 3 | bit`)
pub fn parse_pointer_offset(text: &str) -> AwlResult<u32> {
    let invalid = || AwlError::compile(format!("Invalid pointer offset '{}'", text));
    let (byte, bit) = text.split_once('.').ok_or_else(invalid)?;
    let byte: u32 = byte.parse().map_err(|_| invalid())?;
    let bit: u32 = bit.parse().map_err(|_| invalid())?;
    if bit > 7 || byte > crate::constants::MAX_BYTE_OFFSET {
        return Err(invalid());
    }
    Ok((byte << 3) | bit)
}

/// `P#` pointer immediates. `P#4.0` (1 token) has no area, `P#M 4.0`
/// (2 tokens) does.
pub fn parse_pointer(tokens: &[String]) -> AwlResult<Option<(u32, usize)>> {
    let Some(first) = tokens.first() else {
        return Ok(None);
    };
    let upper = first.to_ascii_uppercase();
    let Some(prefix) = upper.strip_prefix("P#") else {
        return Ok(None);
    };
    if prefix.starts_with('#') {
        return Ok(None);
    }
    let area: u32 = match prefix {
        "P" => 0x80,
        "E" | "I" => 0x81,
        "A" | "Q" => 0x82,
        "M" => 0x83,
        "DBX" => 0x84,
        "DIX" => 0x85,
        "L" => 0x86,
        "V" => 0x87,
        _ => return Ok(Some((parse_pointer_offset(prefix)?, 1))),
    };
    let offset = tokens
        .get(1)
        .ok_or_else(|| AwlError::compile("Invalid pointer immediate"))?;
    Ok(Some(((area << 24) | parse_pointer_offset(offset)?, 2)))
}

/// A declared field of a structure, used for inline `STRUCT` types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub data_type: DataType,
    pub init: Option<Vec<String>>,
}

impl FieldDecl {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            init: None,
        }
    }

    pub fn with_init(mut self, tokens: &[&str]) -> Self {
        self.init = Some(tokens.iter().map(|t| t.to_string()).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Byte,
    Char,
    Word,
    Int,
    DWord,
    DInt,
    Real,
    S5Time,
    Time,
    Date,
    TimeOfDay,
    DateAndTime,
    String(u8),
    Pointer,
    Any,
    Timer,
    Counter,
    BlockDb,
    BlockFb,
    BlockFc,
    Array {
        dims: Vec<(i32, i32)>,
        element: Box<DataType>,
    },
    Struct(Vec<FieldDecl>),
    Udt(u16),
    /// Multi-instance of an FB, embedded in another FB's STAT section
    FbInstance(u16),
    SfbInstance(u16),
}

impl DataType {
    pub fn parse(text: &str) -> AwlResult<DataType> {
        let trimmed = text.trim();
        let upper = trimmed.to_ascii_uppercase();
        let simple = match upper.as_str() {
            "BOOL" => Some(DataType::Bool),
            "BYTE" => Some(DataType::Byte),
            "CHAR" => Some(DataType::Char),
            "WORD" => Some(DataType::Word),
            "INT" => Some(DataType::Int),
            "DWORD" => Some(DataType::DWord),
            "DINT" => Some(DataType::DInt),
            "REAL" => Some(DataType::Real),
            "S5TIME" => Some(DataType::S5Time),
            "TIME" => Some(DataType::Time),
            "DATE" => Some(DataType::Date),
            "TIME_OF_DAY" | "TOD" => Some(DataType::TimeOfDay),
            "DATE_AND_TIME" | "DT" => Some(DataType::DateAndTime),
            "STRING" => Some(DataType::String(254)),
            "POINTER" => Some(DataType::Pointer),
            "ANY" => Some(DataType::Any),
            "TIMER" => Some(DataType::Timer),
            "COUNTER" => Some(DataType::Counter),
            "BLOCK_DB" => Some(DataType::BlockDb),
            "BLOCK_FB" => Some(DataType::BlockFb),
            "BLOCK_FC" => Some(DataType::BlockFc),
            _ => None,
        };
        if let Some(dt) = simple {
            return Ok(dt);
        }

        if let Some(rest) = upper.strip_prefix("STRING") {
            let len = rest
                .trim()
                .strip_prefix('[')
                .and_then(|r| r.strip_suffix(']'))
                .and_then(|n| n.trim().parse::<u16>().ok())
                .filter(|n| *n <= 254)
                .ok_or_else(|| AwlError::compile(format!("Invalid STRING type '{}'", text)))?;
            return Ok(DataType::String(len as u8));
        }

        if upper.starts_with("ARRAY") {
            return Self::parse_array(trimmed);
        }

        let words: Vec<&str> = upper.split_whitespace().collect();
        if words.len() == 2 {
            let index: u16 = words[1].parse().map_err(|_| {
                AwlError::compile(format!("Invalid '{}' block data type index", words[0]))
            })?;
            match words[0] {
                "UDT" => return Ok(DataType::Udt(index)),
                "FB" => return Ok(DataType::FbInstance(index)),
                "SFB" => return Ok(DataType::SfbInstance(index)),
                _ => {}
            }
        }
        Err(AwlError::compile(format!("Invalid data type '{}'", text)))
    }

    fn parse_array(text: &str) -> AwlResult<DataType> {
        let invalid = || AwlError::compile(format!("Invalid ARRAY type '{}'", text));
        let open = text.find('[').ok_or_else(invalid)?;
        let close = text.find(']').ok_or_else(invalid)?;
        let rest = text[close + 1..].trim();
        let element = rest
            .strip_prefix("OF")
            .or_else(|| rest.strip_prefix("of"))
            .ok_or_else(invalid)?;
        let mut dims = Vec::new();
        let mut count: i64 = 1;
        for dim in text[open + 1..close].split(',') {
            let (lo, hi) = dim.split_once("..").ok_or_else(invalid)?;
            let lo: i32 = lo.trim().parse().map_err(|_| invalid())?;
            let hi: i32 = hi.trim().parse().map_err(|_| invalid())?;
            if hi < lo {
                return Err(invalid());
            }
            // The element count has to fit into 32 bits
            count = (i64::from(hi) - i64::from(lo) + 1)
                .checked_mul(count)
                .filter(|c| *c <= i64::from(u32::MAX))
                .ok_or_else(invalid)?;
            dims.push((lo, hi));
        }
        if dims.is_empty() || dims.len() > 6 {
            return Err(invalid());
        }
        Ok(DataType::Array {
            dims,
            element: Box::new(DataType::parse(element)?),
        })
    }

    /// Width in bits, `None` when the layout has to be computed
    pub fn width(&self) -> Option<u32> {
        let w = match self {
            DataType::Bool => 1,
            DataType::Byte | DataType::Char => 8,
            DataType::Word
            | DataType::Int
            | DataType::S5Time
            | DataType::Date
            | DataType::Timer
            | DataType::Counter
            | DataType::BlockDb
            | DataType::BlockFb
            | DataType::BlockFc => 16,
            DataType::DWord | DataType::DInt | DataType::Real | DataType::Time | DataType::TimeOfDay => {
                32
            }
            DataType::Pointer => 48,
            DataType::DateAndTime => 64,
            DataType::Any => 80,
            DataType::String(len) => (u32::from(*len) + 2) * 8,
            DataType::Array { .. }
            | DataType::Struct(_)
            | DataType::Udt(_)
            | DataType::FbInstance(_)
            | DataType::SfbInstance(_) => return None,
        };
        Some(w)
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            DataType::Int | DataType::DInt | DataType::Real | DataType::Time
        )
    }

    /// Types that do not fit into an accumulator and are passed by pointer
    pub fn is_compound(&self) -> bool {
        matches!(
            self,
            DataType::DateAndTime
                | DataType::String(_)
                | DataType::Array { .. }
                | DataType::Struct(_)
                | DataType::Udt(_)
        )
    }

    /// Parameter types passed as a number rather than a value
    pub fn is_call_by_ref(&self) -> bool {
        matches!(
            self,
            DataType::Timer | DataType::Counter | DataType::BlockDb | DataType::BlockFb | DataType::BlockFc
        )
    }

    pub fn element_count(&self) -> u32 {
        match self {
            DataType::Array { dims, .. } => dims
                .iter()
                .try_fold(1u32, |acc, (lo, hi)| {
                    u32::try_from(i64::from(*hi) - i64::from(*lo) + 1)
                        .ok()?
                        .checked_mul(acc)
                })
                .unwrap_or(u32::MAX),
            _ => 1,
        }
    }

    pub fn any_type(&self) -> crate::pointer::AnyType {
        use crate::pointer::AnyType;
        match self {
            DataType::Bool => AnyType::Bool,
            DataType::Byte => AnyType::Byte,
            DataType::Char => AnyType::Char,
            DataType::Word => AnyType::Word,
            DataType::Int => AnyType::Int,
            DataType::DWord => AnyType::DWord,
            DataType::DInt => AnyType::DInt,
            DataType::Real => AnyType::Real,
            DataType::S5Time => AnyType::S5Time,
            DataType::Time => AnyType::Time,
            DataType::Date => AnyType::Date,
            DataType::TimeOfDay => AnyType::TimeOfDay,
            DataType::DateAndTime => AnyType::DateAndTime,
            DataType::String(_) => AnyType::String,
            DataType::Timer => AnyType::Timer,
            DataType::Counter => AnyType::Counter,
            DataType::BlockDb => AnyType::BlockDb,
            DataType::BlockFb => AnyType::BlockFb,
            DataType::BlockFc => AnyType::BlockFc,
            DataType::Array { element, .. } => element.any_type(),
            _ => AnyType::Byte,
        }
    }

    /// Parse an initial value for a field of this type
    pub fn parse_init(&self, tokens: &[String]) -> AwlResult<Value> {
        let mismatch = || {
            AwlError::compile(format!(
                "Immediate value '{}' does not match data type '{}'",
                tokens.join(" "),
                self
            ))
        };
        let token = tokens.first().ok_or_else(mismatch)?;
        let single = tokens.len() == 1;
        let value: Option<u64> = match self {
            DataType::Bool if single => match token.to_ascii_uppercase().as_str() {
                "TRUE" | "1" => Some(1),
                "FALSE" | "0" => Some(0),
                _ => None,
            },
            DataType::Byte if single => parse_hex_byte(token)?.map(u64::from),
            DataType::Char if single => parse_string(token, 1)?
                .and_then(|b| b.first().copied())
                .map(u64::from),
            DataType::Word => match parse_byte_array(tokens)? {
                Some((v, 5)) => Some(u64::from(v)),
                Some(_) => None,
                None if single => parse_bin(token)?
                    .or(parse_hex_word(token)?)
                    .or(parse_bcd_word(token)?)
                    .filter(|v| *v <= 0xFFFF)
                    .map(u64::from),
                None => None,
            },
            DataType::DWord => match parse_byte_array(tokens)? {
                Some((v, 9)) => Some(u64::from(v)),
                Some(_) => None,
                None if single => parse_bin(token)?.or(parse_hex_dword(token)?).map(u64::from),
                None => None,
            },
            DataType::Int if single => parse_int(token)?.map(|v| u64::from(v as u16)),
            DataType::DInt if single => match parse_dint(token)? {
                Some(v) => Some(u64::from(v)),
                None => parse_int(token)?.map(|v| u64::from(v as u32)),
            },
            DataType::Real if single => match parse_real(token)? {
                Some(v) => Some(u64::from(v)),
                None => parse_int(token)?.map(|v| u64::from(f32_to_dword(v as f32))),
            },
            DataType::S5Time if single => parse_s5t(token)?.map(u64::from),
            DataType::Time if single => parse_time(token)?.map(u64::from),
            DataType::Timer | DataType::Counter | DataType::BlockDb | DataType::BlockFb | DataType::BlockFc
                if tokens.len() == 2 =>
            {
                let prefix_ok = match self {
                    DataType::Timer => token.eq_ignore_ascii_case("T"),
                    DataType::Counter => {
                        token.eq_ignore_ascii_case("Z") || token.eq_ignore_ascii_case("C")
                    }
                    DataType::BlockDb => token.eq_ignore_ascii_case("DB"),
                    DataType::BlockFb => token.eq_ignore_ascii_case("FB"),
                    _ => token.eq_ignore_ascii_case("FC"),
                };
                if prefix_ok {
                    parse_int(&tokens[1])?.map(|v| u64::from(v as u16))
                } else {
                    None
                }
            }
            DataType::String(max) if single => {
                let bytes = parse_string(token, usize::from(*max))?.ok_or_else(mismatch)?;
                let mut data = vec![*max, bytes.len() as u8];
                data.extend_from_slice(&bytes);
                data.resize(usize::from(*max) + 2, 0);
                return Ok(Value::Bytes(data));
            }
            _ => None,
        };
        let width = self.width().ok_or_else(mismatch)?;
        value.map(|v| Value::scalar(width, v)).ok_or_else(mismatch)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Bool => write!(f, "BOOL"),
            DataType::Byte => write!(f, "BYTE"),
            DataType::Char => write!(f, "CHAR"),
            DataType::Word => write!(f, "WORD"),
            DataType::Int => write!(f, "INT"),
            DataType::DWord => write!(f, "DWORD"),
            DataType::DInt => write!(f, "DINT"),
            DataType::Real => write!(f, "REAL"),
            DataType::S5Time => write!(f, "S5TIME"),
            DataType::Time => write!(f, "TIME"),
            DataType::Date => write!(f, "DATE"),
            DataType::TimeOfDay => write!(f, "TIME_OF_DAY"),
            DataType::DateAndTime => write!(f, "DATE_AND_TIME"),
            DataType::String(len) => write!(f, "STRING[{}]", len),
            DataType::Pointer => write!(f, "POINTER"),
            DataType::Any => write!(f, "ANY"),
            DataType::Timer => write!(f, "TIMER"),
            DataType::Counter => write!(f, "COUNTER"),
            DataType::BlockDb => write!(f, "BLOCK_DB"),
            DataType::BlockFb => write!(f, "BLOCK_FB"),
            DataType::BlockFc => write!(f, "BLOCK_FC"),
            DataType::Array { dims, element } => {
                let dims: Vec<String> = dims.iter().map(|(lo, hi)| format!("{}..{}", lo, hi)).collect();
                write!(f, "ARRAY [{}] OF {}", dims.join(", "), element)
            }
            DataType::Struct(_) => write!(f, "STRUCT"),
            DataType::Udt(i) => write!(f, "UDT {}", i),
            DataType::FbInstance(i) => write!(f, "FB {}", i),
            DataType::SfbInstance(i) => write!(f, "SFB {}", i),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn toks(s: &[&str]) -> Vec<String> {
        s.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_nan_and_denormal_canonicalization() {
        assert_eq!(canonical_real_dword(0x7FC0_0000), NAN_DWORD);
        assert_eq!(canonical_real_dword(0xFF80_0001), NAN_DWORD);
        assert_eq!(f32_to_dword(f32::NAN), NAN_DWORD);
        assert_eq!(canonical_real_dword(0x0000_0001), 0);
        assert_eq!(canonical_real_dword(0x807F_FFFF), 0x8000_0000);
        assert_eq!(canonical_real_dword(POS_INF_DWORD), POS_INF_DWORD);
        assert_eq!(f32_to_dword(1.5), 0x3FC0_0000);
    }

    #[test]
    fn test_bcd() {
        assert_eq!(bcd_to_u32(0x0123, 3), Some(123));
        assert_eq!(bcd_to_u32(0x012A, 3), None);
        assert_eq!(bcd_to_u32(0x1000, 3), None);
        assert_eq!(u32_to_bcd(987, 3), 0x987);
    }

    #[test]
    fn test_s5t_encoding() {
        assert_eq!(ms_to_s5t(2_000).expect("Should encode"), 0x0200);
        assert_eq!(ms_to_s5t(20_000).expect("Should encode"), 0x1200);
        assert_eq!(ms_to_s5t(200_000).expect("Should encode"), 0x2200);
        assert_eq!(ms_to_s5t(2_000_000).expect("Should encode"), 0x3200);
        assert!(ms_to_s5t(10_000_000).is_err());
        assert_eq!(s5t_to_ms(0x2200).expect("Should decode"), 200_000);
        assert!(s5t_to_ms(0x00AF).is_err());
    }

    #[test]
    fn test_duration_parsing() {
        assert_eq!(parse_duration_ms("1H2M3S4MS").expect("Should parse"), 3_723_004);
        assert_eq!(parse_time("T#500MS").expect("Should parse"), Some(500));
        assert_eq!(parse_s5t("S5T#2S").expect("Should parse"), Some(0x0200));
        assert!(parse_time("T#5X").is_err());
    }

    #[test]
    fn test_integer_immediates() {
        assert_eq!(parse_int("-12").expect("Should parse"), Some(-12));
        assert_eq!(parse_int("MW").expect("Should parse"), None);
        assert!(parse_int("40000").is_err());
        assert_eq!(parse_dint("L#-1").expect("Should parse"), Some(0xFFFF_FFFF));
        assert_eq!(parse_hex_word("W#16#BEEF").expect("Should parse"), Some(0xBEEF));
        assert_eq!(parse_bin("2#1010_0001").expect("Should parse"), Some(0xA1));
        assert_eq!(parse_bcd_word("C#42").expect("Should parse"), Some(0x042));
        assert_eq!(parse_real("1.0").expect("Should parse"), Some(0x3F80_0000));
        assert_eq!(parse_real("12").expect("Should parse"), None);
    }

    #[test]
    fn test_pointer_immediates() {
        assert_eq!(parse_pointer(&toks(&["P#4.0"])).expect("Should parse"), Some((32, 1)));
        assert_eq!(
            parse_pointer(&toks(&["P#M", "1.2"])).expect("Should parse"),
            Some((0x8300_000A, 2))
        );
        assert!(parse_pointer(&toks(&["P#1.8"])).is_err());
        assert_eq!(
            parse_byte_array(&toks(&["B#(", "1", ",", "2", ")"])).expect("Should parse"),
            Some((0x0102, 5))
        );
    }

    #[test]
    fn test_parse_types() {
        assert_eq!(DataType::parse("int").expect("Should parse"), DataType::Int);
        assert_eq!(DataType::parse("STRING[10]").expect("Should parse"), DataType::String(10));
        assert_eq!(DataType::parse("UDT 3").expect("Should parse"), DataType::Udt(3));
        assert_eq!(DataType::parse("FB 2").expect("Should parse"), DataType::FbInstance(2));
        assert_eq!(DataType::parse("SFB 4").expect("Should parse"), DataType::SfbInstance(4));
        let arr = DataType::parse("ARRAY [1..4, 0..1] OF INT").expect("Should parse");
        assert_eq!(arr.element_count(), 8);
        assert_eq!(arr.to_string(), "ARRAY [1..4, 0..1] OF INT");
        assert!(DataType::parse("FLOAT").is_err());
    }

    #[test]
    fn test_oversized_array_types_are_rejected() {
        for text in [
            "ARRAY [-2147483648..2147483647] OF BYTE",
            "ARRAY [1..100000, 1..100000] OF DWORD",
            "ARRAY [1..0] OF INT",
        ] {
            let err = DataType::parse(text).expect_err("Should reject the ARRAY");
            assert!(matches!(err, AwlError::Compile { .. }), "{}", text);
            assert!(err.message().contains("Invalid ARRAY type"), "{}: {}", text, err.message());
        }
        let arr = DataType::parse("ARRAY [-2147483648..-2147483647] OF INT").expect("Should parse");
        assert_eq!(arr.element_count(), 2);
    }

    #[test]
    fn test_parse_init() {
        let v = DataType::Int.parse_init(&toks(&["-2"])).expect("Should parse");
        assert_eq!(v, Value::scalar(16, 0xFFFE));
        let v = DataType::Bool.parse_init(&toks(&["TRUE"])).expect("Should parse");
        assert_eq!(v, Value::bit(true));
        let v = DataType::Real.parse_init(&toks(&["2.5"])).expect("Should parse");
        assert_eq!(v.as_u32(), 0x4020_0000);
        assert!(DataType::Int.parse_init(&toks(&["W#16#1"])).is_err());
    }
}

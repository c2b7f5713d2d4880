//! Operand translator
//!
//! Turns operand token sequences into [`Operand`]s. Every translation
//! reports how many tokens it consumed so the caller can detect trailing
//! garbage and walk comma-separated operand lists.

use crate::datatypes::{
    self, parse_bcd_word, parse_bin, parse_byte_array, parse_dint, parse_hex_byte, parse_hex_dword,
    parse_hex_word, parse_int, parse_pointer, parse_real, parse_s5t, parse_string, parse_time,
};
use crate::insn::{Mnemonics, ParamAssign};
use crate::offset::Offset;
use crate::operand::{
    AddrReg, BlockRef, BlockRefKind, Condition, DbVariable, ImmKind, Immediate, IndirectOperand,
    IndirectTarget, MemArea, MemOperand, NamedLocal, Operand, SpecialReg,
};
use crate::symbols::SymbolTable;
use awl_common::{AwlError, AwlResult};

/// What a leading operand mnemonic stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpToken {
    Mem(MemArea, u32),
    Timer,
    Counter,
    Block(BlockRefKind),
    Cond(Condition),
    Reg(SpecialReg),
    /// `B`, `W`, `D` prefixes of area-spanning register-indirect operands
    Width(u32),
}

const COMMON_OPERANDS: &[(&str, OpToken)] = &[
    ("M", OpToken::Mem(MemArea::Flags, 1)),
    ("MB", OpToken::Mem(MemArea::Flags, 8)),
    ("MW", OpToken::Mem(MemArea::Flags, 16)),
    ("MD", OpToken::Mem(MemArea::Flags, 32)),
    ("L", OpToken::Mem(MemArea::Local, 1)),
    ("LB", OpToken::Mem(MemArea::Local, 8)),
    ("LW", OpToken::Mem(MemArea::Local, 16)),
    ("LD", OpToken::Mem(MemArea::Local, 32)),
    ("DBX", OpToken::Mem(MemArea::GlobalDb, 1)),
    ("DBB", OpToken::Mem(MemArea::GlobalDb, 8)),
    ("DBW", OpToken::Mem(MemArea::GlobalDb, 16)),
    ("DBD", OpToken::Mem(MemArea::GlobalDb, 32)),
    ("DIX", OpToken::Mem(MemArea::InstanceDb, 1)),
    ("DIB", OpToken::Mem(MemArea::InstanceDb, 8)),
    ("DIW", OpToken::Mem(MemArea::InstanceDb, 16)),
    ("DID", OpToken::Mem(MemArea::InstanceDb, 32)),
    ("T", OpToken::Timer),
    ("FC", OpToken::Block(BlockRefKind::Fc)),
    ("FB", OpToken::Block(BlockRefKind::Fb)),
    ("DB", OpToken::Block(BlockRefKind::Db)),
    ("DI", OpToken::Block(BlockRefKind::Di)),
    ("OB", OpToken::Block(BlockRefKind::Ob)),
    ("UDT", OpToken::Block(BlockRefKind::Udt)),
    ("SFC", OpToken::Block(BlockRefKind::Sfc)),
    ("SFB", OpToken::Block(BlockRefKind::Sfb)),
    ("==0", OpToken::Cond(Condition::Zero)),
    ("<>0", OpToken::Cond(Condition::NotZero)),
    (">0", OpToken::Cond(Condition::Greater)),
    ("<0", OpToken::Cond(Condition::Less)),
    (">=0", OpToken::Cond(Condition::GreaterEq)),
    ("<=0", OpToken::Cond(Condition::LessEq)),
    ("OV", OpToken::Cond(Condition::Overflow)),
    ("OS", OpToken::Cond(Condition::StoredOverflow)),
    ("UO", OpToken::Cond(Condition::Unordered)),
    ("STW", OpToken::Reg(SpecialReg::Stw)),
    ("AR1", OpToken::Reg(SpecialReg::Ar1)),
    ("AR2", OpToken::Reg(SpecialReg::Ar2)),
    ("DBLG", OpToken::Reg(SpecialReg::DbLength)),
    ("DBNO", OpToken::Reg(SpecialReg::DbNumber)),
    ("DILG", OpToken::Reg(SpecialReg::DiLength)),
    ("DINO", OpToken::Reg(SpecialReg::DiNumber)),
    ("B", OpToken::Width(8)),
    ("W", OpToken::Width(16)),
    ("D", OpToken::Width(32)),
];

const DE_OPERANDS: &[(&str, OpToken)] = &[
    ("E", OpToken::Mem(MemArea::Input, 1)),
    ("EB", OpToken::Mem(MemArea::Input, 8)),
    ("EW", OpToken::Mem(MemArea::Input, 16)),
    ("ED", OpToken::Mem(MemArea::Input, 32)),
    ("A", OpToken::Mem(MemArea::Output, 1)),
    ("AB", OpToken::Mem(MemArea::Output, 8)),
    ("AW", OpToken::Mem(MemArea::Output, 16)),
    ("AD", OpToken::Mem(MemArea::Output, 32)),
    ("PEB", OpToken::Mem(MemArea::PeriphIn, 8)),
    ("PEW", OpToken::Mem(MemArea::PeriphIn, 16)),
    ("PED", OpToken::Mem(MemArea::PeriphIn, 32)),
    ("PAB", OpToken::Mem(MemArea::PeriphOut, 8)),
    ("PAW", OpToken::Mem(MemArea::PeriphOut, 16)),
    ("PAD", OpToken::Mem(MemArea::PeriphOut, 32)),
    ("Z", OpToken::Counter),
    ("BIE", OpToken::Cond(Condition::BinaryResult)),
];

const EN_OPERANDS: &[(&str, OpToken)] = &[
    ("I", OpToken::Mem(MemArea::Input, 1)),
    ("IB", OpToken::Mem(MemArea::Input, 8)),
    ("IW", OpToken::Mem(MemArea::Input, 16)),
    ("ID", OpToken::Mem(MemArea::Input, 32)),
    ("Q", OpToken::Mem(MemArea::Output, 1)),
    ("QB", OpToken::Mem(MemArea::Output, 8)),
    ("QW", OpToken::Mem(MemArea::Output, 16)),
    ("QD", OpToken::Mem(MemArea::Output, 32)),
    ("PIB", OpToken::Mem(MemArea::PeriphIn, 8)),
    ("PIW", OpToken::Mem(MemArea::PeriphIn, 16)),
    ("PID", OpToken::Mem(MemArea::PeriphIn, 32)),
    ("PQB", OpToken::Mem(MemArea::PeriphOut, 8)),
    ("PQW", OpToken::Mem(MemArea::PeriphOut, 16)),
    ("PQD", OpToken::Mem(MemArea::PeriphOut, 32)),
    ("C", OpToken::Counter),
    ("BR", OpToken::Cond(Condition::BinaryResult)),
];

fn err_at(pos: usize, msg: impl Into<String>) -> AwlError {
    AwlError::compile(format!("{} (operand token {})", msg.into(), pos + 1))
}

pub struct OperandTranslator<'a> {
    mnemonics: Mnemonics,
    symbols: Option<&'a SymbolTable>,
}

impl<'a> OperandTranslator<'a> {
    pub fn new(mnemonics: Mnemonics) -> Self {
        Self {
            mnemonics,
            symbols: None,
        }
    }

    pub fn with_symbols(mut self, symbols: &'a SymbolTable) -> Self {
        self.symbols = Some(symbols);
        self
    }

    pub fn mnemonics(&self) -> Mnemonics {
        self.mnemonics
    }

    fn lookup(&self, name: &str) -> Option<OpToken> {
        let upper = name.to_ascii_uppercase();
        let lang = match self.mnemonics {
            Mnemonics::De => DE_OPERANDS,
            Mnemonics::En => EN_OPERANDS,
        };
        lang.iter()
            .chain(COMMON_OPERANDS)
            .find(|(n, _)| *n == upper)
            .map(|(_, t)| *t)
    }

    /// Translate a whole operand list: comma separated operands, optionally
    /// followed by a parenthesized parameter list.
    pub fn translate_list(&self, tokens: &[String]) -> AwlResult<(Vec<Operand>, Vec<ParamAssign>)> {
        let mut ops = Vec::new();
        let mut params = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            if tokens[i] == "(" {
                let (p, used) = self.translate_params(&tokens[i..], i)?;
                params = p;
                i += used;
                if i < tokens.len() {
                    return Err(err_at(i, format!("Trailing tokens after parameter list: '{}'", tokens[i])));
                }
                break;
            }
            let (op, used) = self.translate_at(tokens, i)?;
            ops.push(op);
            i += used;
            match tokens.get(i).map(|s| s.as_str()) {
                None | Some("(") => {}
                Some(",") => {
                    i += 1;
                    if i == tokens.len() {
                        return Err(err_at(i - 1, "Trailing comma in operand list"));
                    }
                }
                Some(tok) => {
                    return Err(err_at(i, format!("Unexpected token '{}'. Missing comma?", tok)));
                }
            }
        }
        Ok((ops, params))
    }

    /// Translate a `( name := operand, ... )` list. `tokens[0]` is `(`.
    fn translate_params(&self, tokens: &[String], base: usize) -> AwlResult<(Vec<ParamAssign>, usize)> {
        let mut params = Vec::new();
        let tok = |i: usize| tokens.get(i).map(|s| s.as_str());
        if tok(1) == Some(")") {
            return Ok((params, 2));
        }
        let mut i = 1;
        loop {
            let name = tok(i).ok_or_else(|| err_at(base + i, "Missing closing parenthesis"))?;
            if name == "," || name == ")" || name == ":=" {
                return Err(err_at(base + i, "Missing parameter name in parameter list"));
            }
            if tok(i + 1) != Some(":=") {
                return Err(err_at(base + i + 1, format!("Missing ':=' after parameter '{}'", name)));
            }
            i += 2;
            match tok(i) {
                None => return Err(err_at(base + i, "Missing closing parenthesis")),
                Some(",") | Some(")") => {
                    return Err(err_at(base + i, format!("Missing actual parameter for '{}'", name)))
                }
                Some(_) => {}
            }
            let (rvalue, used) = self.translate_at(tokens, i).map_err(|e| {
                AwlError::compile(format!("Parameter '{}': {}", name, e.message()))
            })?;
            params.push(ParamAssign::new(name, rvalue));
            i += used;
            match tok(i) {
                Some(",") => {
                    i += 1;
                    if tok(i) == Some(")") {
                        return Err(err_at(base + i, "Trailing comma in parameter list"));
                    }
                }
                Some(")") => return Ok((params, i + 1)),
                Some(_) => return Err(err_at(base + i, "Missing comma in parameter list")),
                None => return Err(err_at(base + i, "Missing closing parenthesis")),
            }
        }
    }

    /// Translate the single operand starting at `tokens[0]`
    pub fn translate(&self, tokens: &[String]) -> AwlResult<(Operand, usize)> {
        self.translate_at(tokens, 0)
    }

    fn translate_at(&self, all: &[String], pos: usize) -> AwlResult<(Operand, usize)> {
        let tokens = &all[pos..];
        let first = tokens
            .first()
            .ok_or_else(|| err_at(pos, "Missing operand"))?;

        if let Some(res) = self.translate_immediate(tokens).map_err(|e| err_at(pos, e.message()))? {
            return Ok(res);
        }

        if let Some(name) = first.strip_prefix("P##") {
            return Ok((Operand::LocalPointer(NamedLocal::unbound(name)), 1));
        }
        if let Some(name) = first.strip_prefix('#') {
            return self.translate_local(name, tokens, pos);
        }
        if let Some((symbol, member)) = first.strip_prefix('"').and_then(|s| s.split_once("\".")) {
            let db = match self.translate_symbol(symbol, pos)? {
                Operand::Block(b) if b.kind == BlockRefKind::Db => b.index,
                other => {
                    return Err(err_at(
                        pos,
                        format!("Symbol \"{}\" stands for '{}', not a data block", symbol, other),
                    ))
                }
            };
            return self.translate_db_variable(db, member, tokens, pos);
        }
        if first.len() >= 2 && first.starts_with('"') && first.ends_with('"') {
            return Ok((self.translate_symbol(&first[1..first.len() - 1], pos)?, 1));
        }
        if first == "[" {
            // Area-spanning bit access: [AR1,P#0.0]
            let (ind, used) = self.translate_brackets(tokens, 0, pos, IndirectTarget::Spanning, 1)?;
            return Ok((Operand::Indirect(ind), used));
        }
        if let Some(res) = self.translate_db_qualified(tokens, pos)? {
            return Ok(res);
        }

        let token = self
            .lookup(first)
            .ok_or_else(|| err_at(pos, format!("Unknown operand '{}'", first)))?;
        let next = tokens.get(1).map(|s| s.as_str());
        match token {
            OpToken::Mem(area, width) => {
                if next == Some("[") {
                    let (ind, used) =
                        self.translate_brackets(tokens, 1, pos, IndirectTarget::Mem(area), width)?;
                    return Ok((Operand::Indirect(ind), used + 1));
                }
                let addr = next.ok_or_else(|| err_at(pos + 1, format!("Missing address after '{}'", first)))?;
                let offset = parse_address(addr, width).map_err(|e| err_at(pos + 1, e.message()))?;
                Ok((Operand::Mem(MemOperand::new(area, width, offset)), 2))
            }
            OpToken::Timer | OpToken::Counter | OpToken::Block(_) => {
                let target = match token {
                    OpToken::Timer => IndirectTarget::Timer,
                    OpToken::Counter => IndirectTarget::Counter,
                    OpToken::Block(BlockRefKind::Db) => IndirectTarget::BlockDb,
                    OpToken::Block(BlockRefKind::Fb) => IndirectTarget::BlockFb,
                    _ => IndirectTarget::BlockFc,
                };
                if next == Some("[") {
                    let indirect_ok = matches!(
                        token,
                        OpToken::Timer
                            | OpToken::Counter
                            | OpToken::Block(BlockRefKind::Db | BlockRefKind::Fb | BlockRefKind::Fc)
                    );
                    if !indirect_ok {
                        return Err(err_at(pos, format!("'{}' cannot be addressed indirectly", first)));
                    }
                    let (ind, used) = self.translate_brackets(tokens, 1, pos, target, 16)?;
                    return Ok((Operand::Indirect(ind), used + 1));
                }
                let num = next.ok_or_else(|| err_at(pos + 1, format!("Missing number after '{}'", first)))?;
                let num: u16 = num
                    .parse()
                    .map_err(|_| err_at(pos + 1, format!("Invalid number '{}' after '{}'", num, first)))?;
                let op = match token {
                    OpToken::Timer => Operand::Timer(num),
                    OpToken::Block(kind) => Operand::Block(BlockRef::new(kind, num)),
                    _ => Operand::Counter(num),
                };
                Ok((op, 2))
            }
            OpToken::Cond(cond) => Ok((Operand::Condition(cond), 1)),
            OpToken::Reg(reg) => Ok((Operand::Register(reg), 1)),
            OpToken::Width(width) => {
                if next != Some("[") {
                    return Err(err_at(pos, format!("Unknown operand '{}'", first)));
                }
                let (ind, used) = self.translate_brackets(tokens, 1, pos, IndirectTarget::Spanning, width)?;
                if ind.register.is_none() {
                    return Err(err_at(pos, "Area-spanning access needs an address register"));
                }
                Ok((Operand::Indirect(ind), used + 1))
            }
        }
    }

    /// Translate `[ ... ]` starting at `tokens[at]`. Returns the operand
    /// and the number of tokens including both brackets.
    fn translate_brackets(
        &self,
        tokens: &[String],
        at: usize,
        pos: usize,
        target: IndirectTarget,
        width: u32,
    ) -> AwlResult<(IndirectOperand, usize)> {
        let tok = |i: usize| tokens.get(i).map(|s| s.as_str());
        let reg = match tok(at + 1).map(|s| s.to_ascii_uppercase()).as_deref() {
            Some("AR1") => Some(AddrReg::Ar1),
            Some("AR2") => Some(AddrReg::Ar2),
            _ => None,
        };

        if let Some(reg) = reg {
            if target.is_extended() {
                return Err(err_at(pos + at, "Register-indirect addressing is not allowed here"));
            }
            if tok(at + 2) != Some(",") {
                return Err(err_at(pos + at + 2, "Missing comma in register-indirect operand"));
            }
            let disp = tokens
                .get(at + 3..)
                .map(|rest| parse_pointer(rest))
                .transpose()
                .map_err(|e| err_at(pos + at + 3, e.message()))?
                .flatten();
            let value = match disp {
                Some((value, 1)) => value,
                _ => {
                    return Err(err_at(
                        pos + at + 3,
                        "Register-indirect offset must be a P#byte.bit immediate",
                    ))
                }
            };
            if tok(at + 4) != Some("]") {
                return Err(err_at(pos + at + 4, "Missing closing bracket"));
            }
            let ind = IndirectOperand {
                target,
                width,
                register: Some(reg),
                offset: Box::new(Operand::Imm(Immediate::new(ImmKind::Pointer, 32, u64::from(value)))),
            };
            return Ok((ind, 5));
        }

        if target == IndirectTarget::Spanning {
            return Err(err_at(pos + at, "Area-spanning access needs an address register"));
        }
        if tok(at + 1).is_none() {
            return Err(err_at(pos + at, "Missing closing bracket"));
        }
        let (inner, used) = self.translate_at(tokens, at + 1)?;
        match &inner {
            Operand::Indirect(_) => {
                return Err(err_at(
                    pos + at + 1,
                    "Only direct operators supported inside of indirect operator brackets.",
                ))
            }
            Operand::Mem(mem) => {
                let area_ok = matches!(
                    mem.area,
                    MemArea::Flags | MemArea::Local | MemArea::GlobalDb | MemArea::InstanceDb
                );
                if !area_ok {
                    return Err(err_at(pos + at + 1, "Invalid memory area for indirect offset"));
                }
                let widths = target.offset_widths();
                if !widths.contains(&mem.width) {
                    let widths: Vec<String> = widths.iter().map(|w| w.to_string()).collect();
                    return Err(err_at(
                        pos + at + 1,
                        format!("Invalid offset operator width. Must be {} bit.", widths.join("/")),
                    ));
                }
            }
            Operand::Local(_) => {}
            _ => return Err(err_at(pos + at + 1, "Invalid indirect offset operand")),
        }
        let close = at + 1 + used;
        if tok(close) != Some("]") {
            return Err(err_at(pos + close, "Missing closing bracket"));
        }
        let ind = IndirectOperand {
            target,
            width,
            register: None,
            offset: Box::new(inner),
        };
        Ok((ind, close - at + 1))
    }

    /// `DB5.DBW 4`, `DB5.DBX 1.2` or a DB variable like `DB5.rec.a`
    fn translate_db_qualified(&self, tokens: &[String], pos: usize) -> AwlResult<Option<(Operand, usize)>> {
        let first = &tokens[0];
        let Some((num, access)) = first.get(2..).and_then(|rest| rest.split_once('.')) else {
            return Ok(None);
        };
        if !first[..2].eq_ignore_ascii_case("DB") || num.is_empty() || !num.chars().all(|c| c.is_ascii_digit()) {
            return Ok(None);
        }
        let db: u16 = num
            .parse()
            .map_err(|_| err_at(pos, format!("Invalid DB number in '{}'", first)))?;
        let width = match access.to_ascii_uppercase().as_str() {
            "DBX" => 1,
            "DBB" => 8,
            "DBW" => 16,
            "DBD" => 32,
            _ => return self.translate_db_variable(db, access, tokens, pos).map(Some),
        };
        let addr = tokens
            .get(1)
            .ok_or_else(|| err_at(pos + 1, format!("Missing address after '{}'", first)))?;
        let offset = parse_address(addr, width).map_err(|e| err_at(pos + 1, e.message()))?;
        Ok(Some((
            Operand::Mem(MemOperand::new(MemArea::GlobalDb, width, offset).in_db(db)),
            2,
        )))
    }

    /// Field path of a DB variable, with optional ARRAY subscripts
    fn translate_db_variable(&self, db: u16, name: &str, tokens: &[String], pos: usize) -> AwlResult<(Operand, usize)> {
        if name.split('.').any(|part| part.is_empty()) {
            return Err(err_at(pos, format!("Invalid DB access '{}'", tokens[0])));
        }
        let (indices, used) = parse_subscripts(tokens, pos)?;
        Ok((Operand::DbVar(DbVariable::unbound(db, name, indices)), used))
    }

    /// `#name`, `#name.member`, `#arr[1, 2]`
    fn translate_local(&self, name: &str, tokens: &[String], pos: usize) -> AwlResult<(Operand, usize)> {
        if name.is_empty() {
            return Err(err_at(pos, "Missing name after '#'"));
        }
        let mut local = NamedLocal::unbound(name);
        let (indices, used) = parse_subscripts(tokens, pos)?;
        local.indices = indices;
        Ok((Operand::Local(local), used))
    }

    fn translate_symbol(&self, name: &str, pos: usize) -> AwlResult<Operand> {
        let symbol = self
            .symbols
            .and_then(|t| t.get(name))
            .ok_or_else(|| err_at(pos, format!("Symbol \"{}\" not found in symbol table", name)))?;
        let inner = OperandTranslator::new(self.mnemonics);
        let (op, used) = inner
            .translate(&symbol.operand)
            .map_err(|e| err_at(pos, format!("Symbol \"{}\": {}", name, e.message())))?;
        if used != symbol.operand.len() {
            return Err(err_at(pos, format!("Symbol \"{}\" has trailing operand tokens", name)));
        }
        let data_type = datatypes::DataType::parse(&symbol.data_type)?;
        if let (Some(sym_width), Some(op_width)) = (data_type.width(), op.width()) {
            if sym_width != op_width {
                return Err(err_at(
                    pos,
                    format!(
                        "Symbol \"{}\" of type {} does not match its {}-bit operand",
                        name, data_type, op_width
                    ),
                ));
            }
        }
        Ok(op)
    }

    fn translate_immediate(&self, tokens: &[String]) -> AwlResult<Option<(Operand, usize)>> {
        let first = &tokens[0];
        let imm = |kind, width, value: u64| Operand::Imm(Immediate::new(kind, width, value));

        if let Some((value, used)) = parse_pointer(tokens)? {
            return Ok(Some((imm(ImmKind::Pointer, 32, u64::from(value)), used)));
        }
        if let Some((value, used)) = parse_byte_array(tokens)? {
            let width = if used == 5 { 16 } else { 32 };
            return Ok(Some((imm(ImmKind::Hex, width, u64::from(value)), used)));
        }
        if let Some(v) = parse_s5t(first)? {
            return Ok(Some((imm(ImmKind::S5Time, 16, u64::from(v)), 1)));
        }
        if let Some(v) = parse_time(first)? {
            return Ok(Some((imm(ImmKind::Time, 32, u64::from(v)), 1)));
        }
        if let Some(v) = parse_dint(first)? {
            return Ok(Some((imm(ImmKind::DInt, 32, u64::from(v)), 1)));
        }
        if let Some(v) = parse_bin(first)? {
            let width = if first.len() - 2 > 16 { 32 } else { 16 };
            return Ok(Some((imm(ImmKind::Hex, width, u64::from(v)), 1)));
        }
        if let Some(v) = parse_hex_byte(first)? {
            return Ok(Some((imm(ImmKind::Hex, 8, u64::from(v)), 1)));
        }
        if let Some(v) = parse_hex_word(first)? {
            return Ok(Some((imm(ImmKind::Hex, 16, u64::from(v)), 1)));
        }
        if let Some(v) = parse_hex_dword(first)? {
            return Ok(Some((imm(ImmKind::Hex, 32, u64::from(v)), 1)));
        }
        if let Some(v) = parse_bcd_word(first)? {
            return Ok(Some((imm(ImmKind::Bcd, 16, u64::from(v)), 1)));
        }
        if let Some(bytes) = parse_string(first, 4)? {
            let value = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            let width = (bytes.len() as u32 * 8).max(8);
            return Ok(Some((imm(ImmKind::Str, width, value), 1)));
        }
        if let Some(v) = parse_real(first)? {
            return Ok(Some((imm(ImmKind::Real, 32, u64::from(v)), 1)));
        }
        if let Some(v) = parse_int(first)? {
            return Ok(Some((Operand::Imm(Immediate::int(v)), 1)));
        }
        Ok(None)
    }
}

/// ARRAY subscripts following the name in `tokens[0]`. Returns them with
/// the number of tokens used, name included.
fn parse_subscripts(tokens: &[String], pos: usize) -> AwlResult<(Vec<i32>, usize)> {
    let mut indices = Vec::new();
    if tokens.get(1).map(|s| s.as_str()) != Some("[") {
        return Ok((indices, 1));
    }
    let mut i = 2;
    loop {
        let idx = tokens
            .get(i)
            .ok_or_else(|| err_at(pos + i, "Missing closing bracket"))?;
        let idx: i32 = idx
            .parse()
            .map_err(|_| err_at(pos + i, format!("Invalid ARRAY subscript '{}'", idx)))?;
        indices.push(idx);
        match tokens.get(i + 1).map(|s| s.as_str()) {
            Some(",") => i += 2,
            Some("]") => return Ok((indices, i + 2)),
            _ => return Err(err_at(pos + i + 1, "Missing closing bracket")),
        }
    }
}

/// Parse a byte address, or `byte.bit` for 1-bit accesses
pub fn parse_address(text: &str, width: u32) -> AwlResult<Offset> {
    if width == 1 {
        let (byte, bit) = text
            .split_once('.')
            .ok_or_else(|| AwlError::compile(format!("Invalid bit address '{}'", text)))?;
        let byte: u32 = byte
            .parse()
            .map_err(|_| AwlError::compile(format!("Invalid bit address '{}'", text)))?;
        let bit: u8 = bit
            .parse()
            .map_err(|_| AwlError::compile(format!("Invalid bit address '{}'", text)))?;
        if bit > 7 {
            return Err(AwlError::compile(format!(
                "Invalid bit address '{}': bit must be 0..7",
                text
            )));
        }
        Ok(Offset::new(byte, bit))
    } else {
        let byte: u32 = text
            .parse()
            .map_err(|_| AwlError::compile(format!("Invalid byte address '{}'", text)))?;
        Ok(Offset::byte(byte))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn toks(s: &str) -> Vec<String> {
        crate::raw::tokenize(s)
    }

    fn de() -> OperandTranslator<'static> {
        OperandTranslator::new(Mnemonics::De)
    }

    #[test]
    fn test_direct_operands() {
        let (op, used) = de().translate(&toks("MW 10")).expect("Should translate");
        assert_eq!(used, 2);
        assert_eq!(op, Operand::Mem(MemOperand::new(MemArea::Flags, 16, Offset::byte(10))));

        let (op, _) = de().translate(&toks("E 1.3")).expect("Should translate");
        assert_eq!(op, Operand::Mem(MemOperand::new(MemArea::Input, 1, Offset::new(1, 3))));

        let (op, _) = OperandTranslator::new(Mnemonics::En)
            .translate(&toks("QW 4"))
            .expect("Should translate");
        assert_eq!(op, Operand::Mem(MemOperand::new(MemArea::Output, 16, Offset::byte(4))));

        let (op, used) = de().translate(&toks("DB5.DBX 2.1")).expect("Should translate");
        assert_eq!(used, 2);
        assert_eq!(
            op,
            Operand::Mem(MemOperand::new(MemArea::GlobalDb, 1, Offset::new(2, 1)).in_db(5))
        );
    }

    #[test]
    fn test_bit_address_out_of_range() {
        let err = de().translate(&toks("M 1.8")).expect_err("Should fail");
        assert!(err.message().contains("bit must be 0..7"));
    }

    #[test]
    fn test_memory_indirect() {
        let (op, used) = de().translate(&toks("MW [MD 10]")).expect("Should translate");
        assert_eq!(used, 5);
        let Operand::Indirect(ind) = op else {
            panic!("Should be indirect");
        };
        assert_eq!(ind.target, IndirectTarget::Mem(MemArea::Flags));
        assert_eq!(ind.width, 16);
        assert_eq!(ind.register, None);
        assert_eq!(
            *ind.offset,
            Operand::Mem(MemOperand::new(MemArea::Flags, 32, Offset::byte(10)))
        );
    }

    #[test]
    fn test_register_indirect() {
        let (op, used) = de().translate(&toks("DBW [AR1,P#2.0]")).expect("Should translate");
        assert_eq!(used, 6);
        let Operand::Indirect(ind) = op else {
            panic!("Should be indirect");
        };
        assert_eq!(ind.register, Some(AddrReg::Ar1));
        assert_eq!(*ind.offset, Operand::Imm(Immediate::new(ImmKind::Pointer, 32, 16)));

        let (op, used) = de().translate(&toks("W [AR2,P#0.0]")).expect("Should translate");
        assert_eq!(used, 6);
        assert!(matches!(op, Operand::Indirect(IndirectOperand { target: IndirectTarget::Spanning, .. })));

        let (_, used) = de().translate(&toks("[AR1,P#0.1]")).expect("Should translate");
        assert_eq!(used, 5);
    }

    #[test]
    fn test_indirect_errors() {
        let err = de().translate(&toks("MW [MW [MD 0]]")).expect_err("Should fail");
        assert!(err
            .message()
            .starts_with("Only direct operators supported inside of indirect operator brackets."));

        let err = de().translate(&toks("MW [MW 10]")).expect_err("Should fail");
        assert!(err.message().starts_with("Invalid offset operator width. Must be 32 bit."));

        let err = de().translate(&toks("MW [MD 10")).expect_err("Should fail");
        assert!(err.message().starts_with("Missing closing bracket"));

        let err = de().translate(&toks("T [M 10.0]")).expect_err("Should fail");
        assert!(err.message().starts_with("Invalid offset operator width. Must be 8/16/32 bit."));
    }

    #[test]
    fn test_extended_indirect_offset_widths() {
        for text in ["T [MB 1]", "Z [MW 2]", "DB [MD 4]", "FC [LW 0]"] {
            let (op, used) = de().translate(&toks(text)).expect("Should translate");
            assert_eq!(used, 5, "{}", text);
            assert!(matches!(op, Operand::Indirect(ref ind) if ind.target.is_extended()), "{}", text);
        }
    }

    #[test]
    fn test_immediates() {
        let imm = |s: &str| de().translate(&toks(s)).expect("Should translate");
        assert_eq!(imm("5"), (Operand::Imm(Immediate::int(5)), 1));
        assert_eq!(imm("P#M 1.0"), (Operand::Imm(Immediate::new(ImmKind::Pointer, 32, 0x8300_0008)), 2));
        assert_eq!(imm("B#(1, 2, 3, 4)"), (Operand::Imm(Immediate::new(ImmKind::Hex, 32, 0x0102_0304)), 9));
        assert_eq!(imm("'AB'"), (Operand::Imm(Immediate::new(ImmKind::Str, 16, 0x4142)), 1));
        assert!(de().translate(&toks("'ABCDE'")).is_err());
        assert!(de().translate(&toks("70000")).is_err());
    }

    #[test]
    fn test_locals_and_symbols() {
        let (op, _) = de().translate(&toks("#rec.a")).expect("Should translate");
        assert_eq!(op, Operand::Local(NamedLocal::unbound("rec.a")));

        let (op, used) = de().translate(&toks("#arr[1, 2]")).expect("Should translate");
        assert_eq!(used, 6);
        let Operand::Local(local) = op else {
            panic!("Should be local");
        };
        assert_eq!(local.indices, vec![1, 2]);

        let mut table = SymbolTable::new();
        table.add("Speed", "MW 2", "INT").expect("Should add");
        table.add("Bad", "MW 2", "BOOL").expect("Should add");
        let tr = OperandTranslator::new(Mnemonics::De).with_symbols(&table);
        let (op, _) = tr.translate(&toks("\"Speed\"")).expect("Should translate");
        assert_eq!(op, Operand::Mem(MemOperand::new(MemArea::Flags, 16, Offset::byte(2))));
        assert!(tr.translate(&toks("\"Bad\"")).is_err());
        assert!(tr.translate(&toks("\"Missing\"")).is_err());
    }

    #[test]
    fn test_db_variables() {
        let (op, used) = de().translate(&toks("DB3.rec.a")).expect("Should translate");
        assert_eq!(used, 1);
        assert_eq!(op, Operand::DbVar(DbVariable::unbound(3, "rec.a", Vec::new())));

        let (op, used) = de().translate(&toks("DB3.arr[2, 1]")).expect("Should translate");
        assert_eq!(used, 6);
        assert_eq!(op, Operand::DbVar(DbVariable::unbound(3, "arr", vec![2, 1])));
        assert_eq!(op.to_string(), "DB3.arr[2,1]");

        let mut table = SymbolTable::new();
        table.add("Recipe", "DB 7", "BLOCK_DB").expect("Should add");
        table.add("Speed", "MW 2", "INT").expect("Should add");
        let tr = OperandTranslator::new(Mnemonics::De).with_symbols(&table);
        let (op, _) = tr.translate(&toks("\"Recipe\".speed")).expect("Should translate");
        assert_eq!(op, Operand::DbVar(DbVariable::unbound(7, "speed", Vec::new())));

        let err = tr.translate(&toks("\"Speed\".x")).expect_err("Should fail");
        assert!(err.message().contains("not a data block"), "{}", err.message());
        assert!(de().translate(&toks("DB3.rec..a")).is_err());
    }

    #[test]
    fn test_call_parameter_list() {
        let (ops, params) = de()
            .translate_list(&toks("FB 1, DB 2 (X := MW 0, Y := #out)"))
            .expect("Should translate");
        assert_eq!(ops.len(), 2);
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].name, "X");
        assert_eq!(params[1].rvalue, Operand::Local(NamedLocal::unbound("out")));

        let (_, params) = de().translate_list(&toks("FC 1 ()")).expect("Should translate");
        assert!(params.is_empty());
    }

    #[test]
    fn test_call_parameter_list_errors() {
        let msg = |s: &str| de().translate_list(&toks(s)).expect_err("Should fail").message();
        assert!(msg("FC 1 (X := MW 0").starts_with("Missing closing parenthesis"));
        assert!(msg("FC 1 (X := MW 0 Y := MW 2)").starts_with("Missing comma in parameter list"));
        assert!(msg("FC 1 (X := MW 0,)").starts_with("Trailing comma in parameter list"));
        assert!(msg("FC 1 (X MW 0)").starts_with("Missing ':='"));
        assert!(msg("MW 0 MW 2").starts_with("Unexpected token"));
    }
}

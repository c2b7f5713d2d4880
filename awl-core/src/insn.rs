//! Instruction catalogue and translated instructions

use crate::operand::Operand;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mnemonic language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mnemonics {
    De,
    En,
}

impl fmt::Display for Mnemonics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mnemonics::De => write!(f, "DE"),
            Mnemonics::En => write!(f, "EN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InsnKind {
    // Bit logic
    U,
    UN,
    O,
    ON,
    X,
    XN,
    UBracket,
    UNBracket,
    OBracket,
    ONBracket,
    XBracket,
    XNBracket,
    BracketClose,
    Assign,
    S,
    R,
    Set,
    Clr,
    Not,
    Save,
    Fp,
    Fn,
    // Load and transfer
    L,
    Lc,
    T,
    Lar1,
    Lar2,
    Tar1,
    Tar2,
    Tak,
    Push,
    Pop,
    Ar1Add,
    Ar2Add,
    // Arithmetic
    AddI,
    SubI,
    MulI,
    DivI,
    AddD,
    SubD,
    MulD,
    DivD,
    Mod,
    AddR,
    SubR,
    MulR,
    DivR,
    Abs,
    Sqrt,
    AddImm,
    Inc,
    Dec,
    NegI,
    NegD,
    NegR,
    InvI,
    InvD,
    // Conversion
    Itd,
    Dtr,
    Rnd,
    Trunc,
    Bti,
    Itb,
    Btd,
    Dtb,
    // Comparison
    EqI,
    NeI,
    GtI,
    LtI,
    GeI,
    LeI,
    EqD,
    NeD,
    GtD,
    LtD,
    GeD,
    LeD,
    EqR,
    NeR,
    GtR,
    LtR,
    GeR,
    LeR,
    // Word logic
    Uw,
    Ow,
    Xow,
    Ud,
    Od,
    Xod,
    // Shift and rotate
    Slw,
    Srw,
    Sld,
    Srd,
    Ssi,
    Ssd,
    Rld,
    Rrd,
    // Jumps
    Spa,
    Spb,
    Spbn,
    Spbb,
    Spbnb,
    Spbi,
    Spbin,
    Spz,
    Spn,
    Spp,
    Spm,
    Sppz,
    Spmz,
    Spo,
    Sps,
    Spu,
    Loop,
    // Blocks
    Call,
    Uc,
    Cc,
    Be,
    Beb,
    Bea,
    Auf,
    Tdb,
    // Timers
    Si,
    Sv,
    Se,
    Ss,
    Sa,
    Fr,
    // Counters
    Zv,
    Zr,
    // Misc
    Nop0,
    Nop1,
    Bld,
    // Extended (simulator only)
    ExtStwrst,
    ExtAssertEq,
    ExtAssertNe,
}

/// `(kind, DE name, EN name, min operands, max operands)`
const CATALOGUE: &[(InsnKind, &str, &str, usize, usize)] = &[
    (InsnKind::U, "U", "A", 0, 1),
    (InsnKind::UN, "UN", "AN", 1, 1),
    (InsnKind::O, "O", "O", 0, 1),
    (InsnKind::ON, "ON", "ON", 1, 1),
    (InsnKind::X, "X", "X", 1, 1),
    (InsnKind::XN, "XN", "XN", 1, 1),
    (InsnKind::UBracket, "U(", "A(", 0, 0),
    (InsnKind::UNBracket, "UN(", "AN(", 0, 0),
    (InsnKind::OBracket, "O(", "O(", 0, 0),
    (InsnKind::ONBracket, "ON(", "ON(", 0, 0),
    (InsnKind::XBracket, "X(", "X(", 0, 0),
    (InsnKind::XNBracket, "XN(", "XN(", 0, 0),
    (InsnKind::BracketClose, ")", ")", 0, 0),
    (InsnKind::Assign, "=", "=", 1, 1),
    (InsnKind::S, "S", "S", 1, 1),
    (InsnKind::R, "R", "R", 1, 1),
    (InsnKind::Set, "SET", "SET", 0, 0),
    (InsnKind::Clr, "CLR", "CLR", 0, 0),
    (InsnKind::Not, "NOT", "NOT", 0, 0),
    (InsnKind::Save, "SAVE", "SAVE", 0, 0),
    (InsnKind::Fp, "FP", "FP", 1, 1),
    (InsnKind::Fn, "FN", "FN", 1, 1),
    (InsnKind::L, "L", "L", 1, 1),
    (InsnKind::Lc, "LC", "LC", 1, 1),
    (InsnKind::T, "T", "T", 1, 1),
    (InsnKind::Lar1, "LAR1", "LAR1", 0, 1),
    (InsnKind::Lar2, "LAR2", "LAR2", 0, 1),
    (InsnKind::Tar1, "TAR1", "TAR1", 0, 1),
    (InsnKind::Tar2, "TAR2", "TAR2", 0, 1),
    (InsnKind::Tak, "TAK", "TAK", 0, 0),
    (InsnKind::Push, "PUSH", "PUSH", 0, 0),
    (InsnKind::Pop, "POP", "POP", 0, 0),
    (InsnKind::Ar1Add, "+AR1", "+AR1", 0, 1),
    (InsnKind::Ar2Add, "+AR2", "+AR2", 0, 1),
    (InsnKind::AddI, "+I", "+I", 0, 0),
    (InsnKind::SubI, "-I", "-I", 0, 0),
    (InsnKind::MulI, "*I", "*I", 0, 0),
    (InsnKind::DivI, "/I", "/I", 0, 0),
    (InsnKind::AddD, "+D", "+D", 0, 0),
    (InsnKind::SubD, "-D", "-D", 0, 0),
    (InsnKind::MulD, "*D", "*D", 0, 0),
    (InsnKind::DivD, "/D", "/D", 0, 0),
    (InsnKind::Mod, "MOD", "MOD", 0, 0),
    (InsnKind::AddR, "+R", "+R", 0, 0),
    (InsnKind::SubR, "-R", "-R", 0, 0),
    (InsnKind::MulR, "*R", "*R", 0, 0),
    (InsnKind::DivR, "/R", "/R", 0, 0),
    (InsnKind::Abs, "ABS", "ABS", 0, 0),
    (InsnKind::Sqrt, "SQRT", "SQRT", 0, 0),
    (InsnKind::AddImm, "+", "+", 1, 1),
    (InsnKind::Inc, "INC", "INC", 1, 1),
    (InsnKind::Dec, "DEC", "DEC", 1, 1),
    (InsnKind::NegI, "NEGI", "NEGI", 0, 0),
    (InsnKind::NegD, "NEGD", "NEGD", 0, 0),
    (InsnKind::NegR, "NEGR", "NEGR", 0, 0),
    (InsnKind::InvI, "INVI", "INVI", 0, 0),
    (InsnKind::InvD, "INVD", "INVD", 0, 0),
    (InsnKind::Itd, "ITD", "ITD", 0, 0),
    (InsnKind::Dtr, "DTR", "DTR", 0, 0),
    (InsnKind::Rnd, "RND", "RND", 0, 0),
    (InsnKind::Trunc, "TRUNC", "TRUNC", 0, 0),
    (InsnKind::Bti, "BTI", "BTI", 0, 0),
    (InsnKind::Itb, "ITB", "ITB", 0, 0),
    (InsnKind::Btd, "BTD", "BTD", 0, 0),
    (InsnKind::Dtb, "DTB", "DTB", 0, 0),
    (InsnKind::EqI, "==I", "==I", 0, 0),
    (InsnKind::NeI, "<>I", "<>I", 0, 0),
    (InsnKind::GtI, ">I", ">I", 0, 0),
    (InsnKind::LtI, "<I", "<I", 0, 0),
    (InsnKind::GeI, ">=I", ">=I", 0, 0),
    (InsnKind::LeI, "<=I", "<=I", 0, 0),
    (InsnKind::EqD, "==D", "==D", 0, 0),
    (InsnKind::NeD, "<>D", "<>D", 0, 0),
    (InsnKind::GtD, ">D", ">D", 0, 0),
    (InsnKind::LtD, "<D", "<D", 0, 0),
    (InsnKind::GeD, ">=D", ">=D", 0, 0),
    (InsnKind::LeD, "<=D", "<=D", 0, 0),
    (InsnKind::EqR, "==R", "==R", 0, 0),
    (InsnKind::NeR, "<>R", "<>R", 0, 0),
    (InsnKind::GtR, ">R", ">R", 0, 0),
    (InsnKind::LtR, "<R", "<R", 0, 0),
    (InsnKind::GeR, ">=R", ">=R", 0, 0),
    (InsnKind::LeR, "<=R", "<=R", 0, 0),
    (InsnKind::Uw, "UW", "AW", 0, 1),
    (InsnKind::Ow, "OW", "OW", 0, 1),
    (InsnKind::Xow, "XOW", "XOW", 0, 1),
    (InsnKind::Ud, "UD", "AD", 0, 1),
    (InsnKind::Od, "OD", "OD", 0, 1),
    (InsnKind::Xod, "XOD", "XOD", 0, 1),
    (InsnKind::Slw, "SLW", "SLW", 0, 1),
    (InsnKind::Srw, "SRW", "SRW", 0, 1),
    (InsnKind::Sld, "SLD", "SLD", 0, 1),
    (InsnKind::Srd, "SRD", "SRD", 0, 1),
    (InsnKind::Ssi, "SSI", "SSI", 0, 1),
    (InsnKind::Ssd, "SSD", "SSD", 0, 1),
    (InsnKind::Rld, "RLD", "RLD", 0, 1),
    (InsnKind::Rrd, "RRD", "RRD", 0, 1),
    (InsnKind::Spa, "SPA", "JU", 1, 1),
    (InsnKind::Spb, "SPB", "JC", 1, 1),
    (InsnKind::Spbn, "SPBN", "JCN", 1, 1),
    (InsnKind::Spbb, "SPBB", "JCB", 1, 1),
    (InsnKind::Spbnb, "SPBNB", "JNB", 1, 1),
    (InsnKind::Spbi, "SPBI", "JBI", 1, 1),
    (InsnKind::Spbin, "SPBIN", "JNBI", 1, 1),
    (InsnKind::Spz, "SPZ", "JZ", 1, 1),
    (InsnKind::Spn, "SPN", "JN", 1, 1),
    (InsnKind::Spp, "SPP", "JP", 1, 1),
    (InsnKind::Spm, "SPM", "JM", 1, 1),
    (InsnKind::Sppz, "SPPZ", "JPZ", 1, 1),
    (InsnKind::Spmz, "SPMZ", "JMZ", 1, 1),
    (InsnKind::Spo, "SPO", "JO", 1, 1),
    (InsnKind::Sps, "SPS", "JOS", 1, 1),
    (InsnKind::Spu, "SPU", "JUO", 1, 1),
    (InsnKind::Loop, "LOOP", "LOOP", 1, 1),
    (InsnKind::Call, "CALL", "CALL", 1, 2),
    (InsnKind::Uc, "UC", "UC", 1, 1),
    (InsnKind::Cc, "CC", "CC", 1, 1),
    (InsnKind::Be, "BE", "BE", 0, 0),
    (InsnKind::Beb, "BEB", "BEC", 0, 0),
    (InsnKind::Bea, "BEA", "BEU", 0, 0),
    (InsnKind::Auf, "AUF", "OPN", 1, 1),
    (InsnKind::Tdb, "TDB", "CDB", 0, 0),
    (InsnKind::Si, "SI", "SP", 1, 1),
    (InsnKind::Sv, "SV", "SE", 1, 1),
    (InsnKind::Se, "SE", "SD", 1, 1),
    (InsnKind::Ss, "SS", "SS", 1, 1),
    (InsnKind::Sa, "SA", "SF", 1, 1),
    (InsnKind::Fr, "FR", "FR", 1, 1),
    (InsnKind::Zv, "ZV", "CU", 1, 1),
    (InsnKind::Zr, "ZR", "CD", 1, 1),
    (InsnKind::Nop0, "NOP", "NOP", 1, 1),
    (InsnKind::Bld, "BLD", "BLD", 1, 1),
    (InsnKind::ExtStwrst, "__STWRST", "__STWRST", 0, 0),
    (InsnKind::ExtAssertEq, "__ASSERT==", "__ASSERT==", 2, 2),
    (InsnKind::ExtAssertNe, "__ASSERT<>", "__ASSERT<>", 2, 2),
];

impl InsnKind {
    /// Look up a mnemonic. Matching is case-insensitive.
    pub fn lookup(name: &str, mnemonics: Mnemonics) -> Option<InsnKind> {
        let upper = name.to_ascii_uppercase();
        CATALOGUE
            .iter()
            .find(|(_, de, en, _, _)| match mnemonics {
                Mnemonics::De => *de == upper,
                Mnemonics::En => *en == upper,
            })
            .map(|(kind, ..)| *kind)
    }

    fn entry(self) -> Option<&'static (InsnKind, &'static str, &'static str, usize, usize)> {
        CATALOGUE.iter().find(|(kind, ..)| *kind == self)
    }

    pub fn name(self, mnemonics: Mnemonics) -> &'static str {
        match (self, self.entry()) {
            (InsnKind::Nop1, _) => "NOP",
            (_, Some((_, de, en, _, _))) => match mnemonics {
                Mnemonics::De => de,
                Mnemonics::En => en,
            },
            (_, None) => "???",
        }
    }

    /// Allowed operand count range
    pub fn operand_count(self) -> (usize, usize) {
        match self.entry() {
            Some((_, _, _, min, max)) => (*min, *max),
            None => (1, 1),
        }
    }

    pub fn is_jump(self) -> bool {
        matches!(
            self,
            InsnKind::Spa
                | InsnKind::Spb
                | InsnKind::Spbn
                | InsnKind::Spbb
                | InsnKind::Spbnb
                | InsnKind::Spbi
                | InsnKind::Spbin
                | InsnKind::Spz
                | InsnKind::Spn
                | InsnKind::Spp
                | InsnKind::Spm
                | InsnKind::Sppz
                | InsnKind::Spmz
                | InsnKind::Spo
                | InsnKind::Sps
                | InsnKind::Spu
                | InsnKind::Loop
        )
    }

    /// Simulator-only instructions, only available when enabled in the config
    pub fn is_extended(self) -> bool {
        matches!(self, InsnKind::ExtStwrst | InsnKind::ExtAssertEq | InsnKind::ExtAssertNe)
    }

    /// Instructions whose operand list may carry a CALL parameter list
    pub fn takes_params(self) -> bool {
        self == InsnKind::Call
    }
}

/// One `formal := actual` assignment of a CALL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamAssign {
    pub name: String,
    pub rvalue: Operand,
    /// Index of the formal parameter in the callee interface, set when
    /// the program is linked
    pub field: Option<usize>,
}

impl ParamAssign {
    pub fn new(name: &str, rvalue: Operand) -> Self {
        Self {
            name: name.to_string(),
            rvalue,
            field: None,
        }
    }
}

impl fmt::Display for ParamAssign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} := {}", self.name, self.rvalue)
    }
}

/// A translated instruction
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub kind: InsnKind,
    pub ops: Vec<Operand>,
    pub params: Vec<ParamAssign>,
    /// Absolute jump target for jump instructions
    pub target: Option<usize>,
    pub line: u32,
    /// Source text, used in error context and dumps
    pub text: String,
}

impl Instruction {
    pub fn op(&self, index: usize) -> Option<&Operand> {
        self.ops.get(index)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

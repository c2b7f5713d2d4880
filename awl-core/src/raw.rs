//! Raw program tree handed over by the parser
//!
//! This is the boundary to the textual front end. Everything here is plain
//! data (serde-enabled, so a program can also be loaded from JSON).

use crate::symbols::SymbolTable;
use awl_common::{BlockKind, SourceId, SourceLocation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Section {
    In,
    Out,
    InOut,
    Stat,
    Temp,
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Section::In => "IN",
            Section::Out => "OUT",
            Section::InOut => "IN_OUT",
            Section::Stat => "STAT",
            Section::Temp => "TEMP",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SourceRef {
    pub id: SourceId,
    pub name: String,
}

impl SourceRef {
    pub fn new(id: SourceId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
        }
    }

    pub fn location(&self, line: u32) -> SourceLocation {
        SourceLocation::new(self.id, &self.name, line)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawField {
    pub name: String,
    pub section: Section,
    pub data_type: String,
    #[serde(default)]
    pub init: Option<Vec<String>>,
}

impl RawField {
    pub fn new(name: &str, section: Section, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            section,
            data_type: data_type.to_string(),
            init: None,
        }
    }

    pub fn with_init(mut self, init: &str) -> Self {
        self.init = Some(tokenize(init));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawInsn {
    #[serde(default)]
    pub label: Option<String>,
    pub name: String,
    #[serde(default)]
    pub tokens: Vec<String>,
    pub line: u32,
}

impl RawInsn {
    pub fn new(line: u32, name: &str, tokens: &[&str]) -> Self {
        Self {
            label: None,
            name: name.to_string(),
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            line,
        }
    }

    /// Split one statement line (`LBL: L MW 10`) into label, name and
    /// operand tokens. Returns `None` for blank lines.
    pub fn from_line(line: u32, text: &str) -> Option<Self> {
        let text = match text.find("//") {
            Some(pos) => &text[..pos],
            None => text,
        };
        let text = text.trim().trim_end_matches(';').trim();
        if text.is_empty() {
            return None;
        }
        let mut tokens = tokenize(text);
        let mut label = None;
        if let Some(first) = tokens.first() {
            if let Some(name) = first.strip_suffix(':') {
                if !name.is_empty() && !name.contains(['#', '"', '\'']) {
                    label = Some(name.to_string());
                    tokens.remove(0);
                }
            }
        }
        if tokens.is_empty() {
            return None;
        }
        let name = tokens.remove(0);
        Some(Self {
            label,
            name,
            tokens,
            line,
        })
    }

    /// Source text of this statement
    pub fn text(&self) -> String {
        let mut text = String::new();
        if let Some(label) = &self.label {
            text.push_str(label);
            text.push_str(": ");
        }
        text.push_str(&self.name);
        for tok in &self.tokens {
            text.push(' ');
            text.push_str(tok);
        }
        text
    }
}

/// Statement tokenizer used by [`RawInsn::from_line`]. Brackets, commas,
/// parentheses and `:=` become separate tokens. Quoted text stays whole.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let mut quote: Option<char> = None;
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    let flush = |cur: &mut String, tokens: &mut Vec<String>| {
        if !cur.is_empty() {
            tokens.push(std::mem::take(cur));
        }
    };
    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            cur.push(c);
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                cur.push(c);
            }
            c if c.is_whitespace() => flush(&mut cur, &mut tokens),
            ':' if chars.get(i + 1) == Some(&'=') => {
                flush(&mut cur, &mut tokens);
                tokens.push(":=".to_string());
                i += 1;
            }
            '(' if cur.eq_ignore_ascii_case("B#") => {
                cur.push('(');
                flush(&mut cur, &mut tokens);
            }
            '[' | ']' | ',' | '(' | ')' => {
                flush(&mut cur, &mut tokens);
                tokens.push(c.to_string());
            }
            _ => cur.push(c),
        }
        i += 1;
    }
    flush(&mut cur, &mut tokens);
    tokens
}

/// A code block (OB, FB or FC) before translation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBlock {
    pub kind: BlockKind,
    pub index: u16,
    #[serde(default)]
    pub source: SourceRef,
    #[serde(default)]
    pub interface: Vec<RawField>,
    #[serde(default)]
    pub insns: Vec<RawInsn>,
}

impl RawBlock {
    pub fn new(kind: BlockKind, index: u16) -> Self {
        Self {
            kind,
            index,
            source: SourceRef::default(),
            interface: Vec::new(),
            insns: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: SourceRef) -> Self {
        self.source = source;
        self
    }

    pub fn field(mut self, name: &str, section: Section, data_type: &str) -> Self {
        self.interface.push(RawField::new(name, section, data_type));
        self
    }

    /// Append statements, one per line. Line numbers count from 1.
    pub fn code(mut self, text: &str) -> Self {
        let base = self.insns.last().map_or(0, |i| i.line);
        for (n, line) in text.lines().enumerate() {
            if let Some(insn) = RawInsn::from_line(base + n as u32 + 1, line) {
                self.insns.push(insn);
            }
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDataBlock {
    pub index: u16,
    /// FB number for instance DBs
    #[serde(default)]
    pub instance_of: Option<u16>,
    /// SFB number for instance DBs of system function blocks
    #[serde(default)]
    pub instance_of_sfb: Option<u16>,
    #[serde(default)]
    pub fields: Vec<RawField>,
    #[serde(default)]
    pub source: SourceRef,
}

impl RawDataBlock {
    pub fn global(index: u16) -> Self {
        Self {
            index,
            instance_of: None,
            instance_of_sfb: None,
            fields: Vec::new(),
            source: SourceRef::default(),
        }
    }

    pub fn instance(index: u16, fb: u16) -> Self {
        Self {
            instance_of: Some(fb),
            ..Self::global(index)
        }
    }

    pub fn sfb_instance(index: u16, sfb: u16) -> Self {
        Self {
            instance_of_sfb: Some(sfb),
            ..Self::global(index)
        }
    }

    pub fn field(mut self, name: &str, data_type: &str, init: Option<&str>) -> Self {
        let mut field = RawField::new(name, Section::Stat, data_type);
        if let Some(init) = init {
            field = field.with_init(init);
        }
        self.fields.push(field);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawUdt {
    pub index: u16,
    #[serde(default)]
    pub fields: Vec<RawField>,
    #[serde(default)]
    pub source: SourceRef,
}

impl RawUdt {
    pub fn new(index: u16) -> Self {
        Self {
            index,
            fields: Vec::new(),
            source: SourceRef::default(),
        }
    }

    pub fn field(mut self, name: &str, data_type: &str) -> Self {
        self.fields.push(RawField::new(name, Section::Stat, data_type));
        self
    }
}

/// A whole program as produced by the parser
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawProgram {
    #[serde(default)]
    pub obs: Vec<RawBlock>,
    #[serde(default)]
    pub fbs: Vec<RawBlock>,
    #[serde(default)]
    pub fcs: Vec<RawBlock>,
    #[serde(default)]
    pub dbs: Vec<RawDataBlock>,
    #[serde(default)]
    pub udts: Vec<RawUdt>,
    #[serde(default)]
    pub symbols: SymbolTable,
}

impl RawProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a code block to the list matching its kind
    pub fn block(mut self, block: RawBlock) -> Self {
        match block.kind {
            BlockKind::Ob => self.obs.push(block),
            BlockKind::Fb => self.fbs.push(block),
            _ => self.fcs.push(block),
        }
        self
    }

    pub fn db(mut self, db: RawDataBlock) -> Self {
        self.dbs.push(db);
        self
    }

    pub fn udt(mut self, udt: RawUdt) -> Self {
        self.udts.push(udt);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tokenize_brackets_and_params() {
        assert_eq!(tokenize("MW [AR1,P#2.0]"), vec!["MW", "[", "AR1", ",", "P#2.0", "]"]);
        assert_eq!(
            tokenize("FB 1, DB 2 (X:=MW 0)"),
            vec!["FB", "1", ",", "DB", "2", "(", "X", ":=", "MW", "0", ")"]
        );
        assert_eq!(tokenize("B#(1, 2)"), vec!["B#(", "1", ",", "2", ")"]);
        assert_eq!(tokenize("'a b'"), vec!["'a b'"]);
    }

    #[test]
    fn test_insn_from_line() {
        let insn = RawInsn::from_line(4, "M001: L MW 10; // load").expect("Should parse");
        assert_eq!(insn.label.as_deref(), Some("M001"));
        assert_eq!(insn.name, "L");
        assert_eq!(insn.tokens, vec!["MW", "10"]);
        assert_eq!(insn.text(), "M001: L MW 10");
        assert!(RawInsn::from_line(5, "   // comment").is_none());
    }

    #[test]
    fn test_program_from_json() {
        let json = r#"{
            "obs": [{ "kind": "Ob", "index": 1, "insns": [{ "name": "BE", "line": 1 }] }],
            "dbs": [{ "index": 3, "fields": [{ "name": "x", "section": "Stat", "data_type": "INT" }] }]
        }"#;
        let prog: RawProgram = serde_json::from_str(json).expect("Should deserialize");
        assert_eq!(prog.obs[0].insns[0].name, "BE");
        assert_eq!(prog.dbs[0].fields[0].data_type, "INT");
    }
}

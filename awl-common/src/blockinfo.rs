use serde::{Deserialize, Serialize};
use std::fmt;

/// The block categories of an S7 program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BlockKind {
    Ob,
    Fb,
    Fc,
    Db,
    Udt,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockKind::Ob => "OB",
            BlockKind::Fb => "FB",
            BlockKind::Fc => "FC",
            BlockKind::Db => "DB",
            BlockKind::Udt => "UDT",
        };
        write!(f, "{}", s)
    }
}

/// Identity of a compiled block, as seen by tooling
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockInfo {
    pub kind: BlockKind,
    pub index: u16,
    /// Hex encoded content hash
    pub hash: String,
}

impl BlockInfo {
    pub fn new(kind: BlockKind, index: u16, hash: String) -> Self {
        Self { kind, index, hash }
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.kind, self.index, self.hash)
    }
}

//! Source location tracking for error reporting
//!
//! Compiled blocks only keep the numeric id of the source they came from.
//! The name is carried along for messages.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type SourceId = u32;

/// A line in an AWL source (line is 1-based, 0 means unknown)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub source_id: SourceId,
    pub source_name: String,
    pub line: u32,
}

impl SourceLocation {
    pub fn new(source_id: SourceId, source_name: &str, line: u32) -> Self {
        Self {
            source_id,
            source_name: source_name.to_string(),
            line,
        }
    }

    /// Create a dummy location for testing
    pub fn dummy() -> Self {
        Self::new(0, "<unknown>", 0)
    }

    pub fn at_line(&self, line: u32) -> Self {
        Self {
            source_id: self.source_id,
            source_name: self.source_name.clone(),
            line,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_name, self.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_location() {
        let loc = SourceLocation::new(7, "fc1.awl", 42);
        assert_eq!(loc.source_id, 7);
        assert_eq!(format!("{}", loc), "fc1.awl:42");
        assert_eq!(loc.at_line(3).line, 3);
    }
}

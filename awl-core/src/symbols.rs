//! Global symbol table (`"Motor"` -> `M 0.0`)

use crate::datatypes::DataType;
use crate::raw::tokenize;
use awl_common::{AwlError, AwlResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub operand: Vec<String>,
    pub data_type: String,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolTable {
    symbols: HashMap<String, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn add(&mut self, name: &str, operand: &str, data_type: &str) -> AwlResult<()> {
        if name.is_empty() || name.contains('"') {
            return Err(AwlError::compile(format!("Invalid symbol name '{}'", name)));
        }
        DataType::parse(data_type)?;
        if self.symbols.contains_key(name) {
            return Err(AwlError::compile(format!("Multiple definitions of symbol '{}'", name)));
        }
        self.symbols.insert(
            name.to_string(),
            Symbol {
                name: name.to_string(),
                operand: tokenize(operand),
                data_type: data_type.to_string(),
                comment: String::new(),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    /// Parse a symbol table in `"name","operand","type","comment"` form,
    /// one symbol per line
    pub fn parse_csv(text: &str) -> AwlResult<Self> {
        let mut table = SymbolTable::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let cols: Vec<String> = line
                .split(',')
                .map(|c| c.trim().trim_matches('"').to_string())
                .collect();
            if cols.len() < 3 {
                return Err(AwlError::compile(format!(
                    "Symbol table line {}: expected name, operand and type",
                    n + 1
                )));
            }
            table.add(&cols[0], &cols[1], &cols[2])?;
            if let (Some(comment), Some(sym)) = (cols.get(3), table.symbols.get_mut(&cols[0])) {
                sym.comment = comment.clone();
            }
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_csv() {
        let table = SymbolTable::parse_csv(
            "\"Motor\",\"M 0.0\",\"BOOL\",\"main drive\"\n\"Speed\",\"MW 2\",\"INT\"\n",
        )
        .expect("Should parse");
        assert_eq!(table.len(), 2);
        let motor = table.get("Motor").expect("Should exist");
        assert_eq!(motor.operand, vec!["M", "0.0"]);
        assert_eq!(motor.comment, "main drive");
    }

    #[test]
    fn test_duplicate_symbol() {
        let mut table = SymbolTable::new();
        table.add("A", "M 0.0", "BOOL").expect("Should add");
        assert!(table.add("A", "M 0.1", "BOOL").is_err());
        assert!(table.add("B", "M 0.1", "NOPE").is_err());
    }
}

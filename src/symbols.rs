// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

// Symbol table split into compile-time constants and label addresses.

use std::collections::HashMap;
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolTableResult {
    Ok,
    Duplicate,
}

/// One exported symbol, for the labels file and the listing footer.
#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub name: String,
    pub val: i64,
    pub is_label: bool,
}

/// Two disjoint name maps: constants (defined before code begins) and
/// labels (placed by pass 1). A name may live in at most one of them.
#[derive(Debug, Default)]
pub struct SymbolTable {
    constants: HashMap<String, i64>,
    labels: HashMap<String, i64>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.constants.clear();
        self.labels.clear();
    }

    pub fn add_constant(&mut self, name: &str, val: i64) -> SymbolTableResult {
        if self.contains(name) {
            return SymbolTableResult::Duplicate;
        }
        self.constants.insert(name.to_string(), val);
        SymbolTableResult::Ok
    }

    pub fn add_label(&mut self, name: &str, addr: i64) -> SymbolTableResult {
        if self.contains(name) {
            return SymbolTableResult::Duplicate;
        }
        self.labels.insert(name.to_string(), addr);
        SymbolTableResult::Ok
    }

    pub fn constant(&self, name: &str) -> Option<i64> {
        self.constants.get(name).copied()
    }

    pub fn label(&self, name: &str) -> Option<i64> {
        self.labels.get(name).copied()
    }

    fn contains(&self, name: &str) -> bool {
        self.constants.contains_key(name) || self.labels.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.constants.len() + self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty() && self.labels.is_empty()
    }

    /// All symbols, constants first, each group sorted by name.
    pub fn entries(&self) -> Vec<SymbolEntry> {
        let mut out = Vec::with_capacity(self.len());
        let mut names: Vec<&String> = self.constants.keys().collect();
        names.sort();
        for name in names {
            out.push(SymbolEntry {
                name: name.clone(),
                val: self.constants[name],
                is_label: false,
            });
        }
        let mut names: Vec<&String> = self.labels.keys().collect();
        names.sort();
        for name in names {
            out.push(SymbolEntry {
                name: name.clone(),
                val: self.labels[name],
                is_label: true,
            });
        }
        out
    }

    /// Write the symbol dump used by the listing footer.
    pub fn dump<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for entry in self.entries() {
            let kind = if entry.is_label { "label" } else { "const" };
            writeln!(out, "{:<24} {:08X}  {}", entry.name, entry.val, kind)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{SymbolTable, SymbolTableResult};

    #[test]
    fn constants_and_labels_are_disjoint() {
        let mut symbols = SymbolTable::new();
        assert_eq!(symbols.add_constant("RAM", 0x8000), SymbolTableResult::Ok);
        assert_eq!(symbols.add_label("start", 0), SymbolTableResult::Ok);
        assert_eq!(
            symbols.add_label("RAM", 4),
            SymbolTableResult::Duplicate,
            "a constant name cannot be reused as a label"
        );
        assert_eq!(symbols.add_constant("start", 1), SymbolTableResult::Duplicate);
        assert_eq!(symbols.constant("RAM"), Some(0x8000));
        assert_eq!(symbols.label("RAM"), None);
    }

    #[test]
    fn duplicate_definitions_are_rejected() {
        let mut symbols = SymbolTable::new();
        assert_eq!(symbols.add_label("loop", 0), SymbolTableResult::Ok);
        assert_eq!(symbols.add_label("loop", 8), SymbolTableResult::Duplicate);
        assert_eq!(symbols.label("loop"), Some(0));
    }

    #[test]
    fn dump_lists_constants_before_labels() {
        let mut symbols = SymbolTable::new();
        symbols.add_label("b", 8);
        symbols.add_constant("z", 1);
        symbols.add_label("a", 4);
        let mut out = Vec::new();
        symbols.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let names: Vec<&str> = text
            .lines()
            .map(|line| line.split_whitespace().next().unwrap())
            .collect();
        assert_eq!(names, vec!["z", "a", "b"]);
    }
}

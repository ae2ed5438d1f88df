//! Operator precedence table shared by the parser and the code generator.
//!
//! One table lives per session. Entries are only ever added or
//! overwritten, never removed, so an operator declared by a unit that
//! later fails to lower stays parseable.

use std::collections::HashMap;

/// Precedence given to a `binary` operator declared without one.
pub const DEFAULT_BINARY_PRECEDENCE: i32 = 30;
/// Every `unary` operator binds tighter than any binary operator.
pub const UNARY_PRECEDENCE: i32 = 10_000;
pub const MIN_BINARY_PRECEDENCE: i32 = 1;
pub const MAX_BINARY_PRECEDENCE: i32 = 100;

#[derive(Debug, Clone)]
pub struct PrecedenceTable {
    table: HashMap<String, i32>,
}

impl Default for PrecedenceTable {
    fn default() -> Self {
        let table = [("=", 2), ("<", 10), ("+", 20), ("-", 20), ("*", 40)]
            .into_iter()
            .map(|(op, prec)| (op.to_string(), prec))
            .collect();
        PrecedenceTable { table }
    }
}

impl PrecedenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, op: &str) -> Option<i32> {
        self.table.get(op).copied()
    }

    pub fn set(&mut self, op: &str, precedence: i32) {
        if self.table.insert(op.to_string(), precedence) != Some(precedence) {
            tracing::trace!(op, precedence, "operator precedence installed");
        }
    }

    pub fn is_valid_binary(precedence: i32) -> bool {
        (MIN_BINARY_PRECEDENCE..=MAX_BINARY_PRECEDENCE).contains(&precedence)
    }
}

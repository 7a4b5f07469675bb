//! The global symbol dictionary and the canonical-selector caches
//! used by optimized unary/binary sends (§3 "Special objects",
//! component C).
//!
//! Symbols are themselves objects in the table (byte objects, pinned
//! once loaded from a ROM image); this module is the intern table
//! mapping a name to the one canonical symbol object for that name,
//! plus the `unSyms`/`binSyms` arrays the compiler and interpreter
//! consult for `SendUnary`/`SendBinary`.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::object::{ObjectMemoryError, ObjectTable};
use crate::oop::Oop;

/// Canonical unary selectors eligible for the compact `SendUnary`
/// encoding, in table order (the index is the `SendUnary` operand).
pub const UNARY_SELECTORS: &[&str] = &[
    "class", "size", "isNil", "notNil", "printString", "value", "new", "yourself",
];

/// Canonical binary selectors eligible for the compact `SendBinary`
/// encoding, in table order (the index is the `SendBinary` operand).
pub const BINARY_SELECTORS: &[&str] = &[
    "+", "-", "*", "/", "=", "~=", "<", ">", "<=", ">=", "==", ",", "@",
];

/// The global symbol dictionary: interns selector/identifier names to
/// a single canonical `Oop` per name, and caches the canonical
/// unary/binary selector tables resolved by name (never by a
/// hardcoded image index, per spec.md §9 Open Question 3).
pub struct SymbolTable {
    interned: Vec<(String, Oop)>,
    /// The class every interned symbol is allocated as. Set once
    /// bootstrap has the `Symbol` class's `Oop` in hand.
    symbol_class: Oop,
    unary_cache: Vec<Option<Oop>>,
    binary_cache: Vec<Option<Oop>>,
}

impl SymbolTable {
    #[must_use]
    pub fn new(symbol_class: Oop) -> Self {
        Self {
            interned: Vec::new(),
            symbol_class,
            unary_cache: alloc::vec![None; UNARY_SELECTORS.len()],
            binary_cache: alloc::vec![None; BINARY_SELECTORS.len()],
        }
    }

    /// Look up an already-interned symbol without allocating.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Oop> {
        self.interned
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, oop)| *oop)
    }

    /// Intern `name`, allocating a new pinned-eligible byte object in
    /// `table` the first time it's seen.
    pub fn intern(
        &mut self,
        table: &mut ObjectTable,
        name: &str,
    ) -> Result<Oop, ObjectMemoryError> {
        if let Some(oop) = self.find(name) {
            return Ok(oop);
        }
        let oop = table.alloc_str(self.symbol_class, name)?;
        table.incr(oop); // the dictionary itself owns one reference
        self.interned.push((name.to_string(), oop));
        Ok(oop)
    }

    /// Resolve (and cache) the canonical symbol for `SendUnary` index
    /// `i`.
    pub fn unary_selector(
        &mut self,
        table: &mut ObjectTable,
        i: usize,
    ) -> Result<Oop, ObjectMemoryError> {
        if let Some(Some(oop)) = self.unary_cache.get(i) {
            return Ok(*oop);
        }
        let name = UNARY_SELECTORS
            .get(i)
            .copied()
            .ok_or(ObjectMemoryError::IndexOutOfRange)?;
        let oop = self.intern(table, name)?;
        self.unary_cache[i] = Some(oop);
        Ok(oop)
    }

    /// Resolve (and cache) the canonical symbol for `SendBinary` index
    /// `i`.
    pub fn binary_selector(
        &mut self,
        table: &mut ObjectTable,
        i: usize,
    ) -> Result<Oop, ObjectMemoryError> {
        if let Some(Some(oop)) = self.binary_cache.get(i) {
            return Ok(*oop);
        }
        let name = BINARY_SELECTORS
            .get(i)
            .copied()
            .ok_or(ObjectMemoryError::IndexOutOfRange)?;
        let oop = self.intern(table, name)?;
        self.binary_cache[i] = Some(oop);
        Ok(oop)
    }

    /// Index of `name` in the unary-selector table, if it's one of
    /// the canonical fast-path selectors.
    #[must_use]
    pub fn unary_index(name: &str) -> Option<u8> {
        UNARY_SELECTORS.iter().position(|&s| s == name).map(|i| i as u8)
    }

    /// Index of `name` in the binary-selector table, if it's one of
    /// the canonical fast-path selectors.
    #[must_use]
    pub fn binary_index(name: &str) -> Option<u8> {
        BINARY_SELECTORS.iter().position(|&s| s == name).map(|i| i as u8)
    }

    /// All interned names, for the image writer to discover which
    /// symbols exist (it serializes them as ordinary live objects
    /// reachable from `symbols`, not specially).
    pub fn iter(&self) -> impl Iterator<Item = &(String, Oop)> {
        self.interned.iter()
    }
}

#[cfg(test)]
#[path = "symbol_test.rs"]
mod symbol_test;

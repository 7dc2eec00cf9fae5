//! Interned symbols: the name type consumed by method tables.
//!
//! A [`Symbol`] is a `u32` index into a process-wide interner. Interning the
//! same string twice yields the same index, so symbol equality is integer
//! equality and symbols are freely `Copy`. The interner also precomputes a
//! 64-bit hash per symbol; [`Symbol::hash_value`] is what the method table
//! uses for bin indexing, so no per-table seeding is needed.
//!
//! # Thread safety
//!
//! The interner wraps its map in a `Mutex` and is reached through a
//! process-wide `OnceLock` singleton. Interned strings are leaked into
//! `'static` storage, which is what lets [`Symbol::as_str`] hand out
//! `&'static str` without a guard; the interner never evicts.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::{Mutex, OnceLock};

/// An interned identifier. Equality and hashing are by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    /// Intern `name` in the process-wide table and return its symbol.
    pub fn intern(name: &str) -> Symbol {
        SymbolTable::global().intern(name)
    }

    /// The string this symbol was interned from.
    pub fn as_str(self) -> &'static str {
        SymbolTable::global().resolve(self)
    }

    /// The precomputed 64-bit hash of the symbol's string.
    ///
    /// Stable for the lifetime of the process; method tables derive bin
    /// indices from it with a power-of-two mask.
    pub fn hash_value(self) -> u64 {
        SymbolTable::global().hash_of(self)
    }

    /// Raw index, for packing into opcode words.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Rebuild a symbol from a raw index previously obtained via [`raw`].
    ///
    /// Out-of-range indices resolve to the empty string rather than
    /// panicking; operand words in unverified bytecode are untrusted.
    ///
    /// [`raw`]: Symbol::raw
    pub fn from_raw(raw: u32) -> Symbol {
        Symbol(raw)
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Interner ─────────────────────────────────────────────────────────────────

struct Interner {
    by_name: HashMap<&'static str, u32>,
    names: Vec<&'static str>,
    hashes: Vec<u64>,
}

/// The process-wide symbol table.
pub struct SymbolTable {
    inner: Mutex<Interner>,
}

impl SymbolTable {
    fn new() -> Self {
        Self {
            inner: Mutex::new(Interner {
                by_name: HashMap::new(),
                names: Vec::new(),
                hashes: Vec::new(),
            }),
        }
    }

    /// Return the process-wide singleton.
    pub fn global() -> &'static SymbolTable {
        static INSTANCE: OnceLock<SymbolTable> = OnceLock::new();
        INSTANCE.get_or_init(SymbolTable::new)
    }

    fn intern(&self, name: &str) -> Symbol {
        let mut inner = self.inner.lock().expect("symbol table mutex poisoned");
        if let Some(&id) = inner.by_name.get(name) {
            return Symbol(id);
        }
        let stored: &'static str = Box::leak(name.to_owned().into_boxed_str());
        let id = inner.names.len() as u32;
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        hasher.write(stored.as_bytes());
        let hash = hasher.finish();
        inner.by_name.insert(stored, id);
        inner.names.push(stored);
        inner.hashes.push(hash);
        Symbol(id)
    }

    fn resolve(&self, sym: Symbol) -> &'static str {
        let inner = self.inner.lock().expect("symbol table mutex poisoned");
        inner.names.get(sym.0 as usize).copied().unwrap_or("")
    }

    fn hash_of(&self, sym: Symbol) -> u64 {
        let inner = self.inner.lock().expect("symbol table mutex poisoned");
        inner.hashes.get(sym.0 as usize).copied().unwrap_or(0)
    }

    /// Number of distinct symbols interned so far.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("symbol table mutex poisoned");
        inner.names.len()
    }

    /// True if nothing has been interned yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_same_string_yields_same_symbol() {
        let a = Symbol::intern("each");
        let b = Symbol::intern("each");
        assert_eq!(a, b, "interning must be idempotent");
    }

    #[test]
    fn test_intern_distinct_strings_yield_distinct_symbols() {
        let a = Symbol::intern("map");
        let b = Symbol::intern("select");
        assert_ne!(a, b);
    }

    #[test]
    fn test_as_str_round_trip() {
        let sym = Symbol::intern("inject");
        assert_eq!(sym.as_str(), "inject");
    }

    #[test]
    fn test_hash_value_is_stable() {
        let sym = Symbol::intern("hash_me");
        assert_eq!(sym.hash_value(), sym.hash_value());
        assert_eq!(sym.hash_value(), Symbol::intern("hash_me").hash_value());
    }

    #[test]
    fn test_raw_round_trip() {
        let sym = Symbol::intern("raw_round_trip");
        assert_eq!(Symbol::from_raw(sym.raw()), sym);
    }

    #[test]
    fn test_out_of_range_raw_resolves_to_empty() {
        let bogus = Symbol::from_raw(u32::MAX);
        assert_eq!(bogus.as_str(), "");
        assert_eq!(bogus.hash_value(), 0);
    }

    #[test]
    fn test_concurrent_interning_agrees() {
        use std::thread;

        let handles: Vec<_> = (0..4)
            .map(|_| thread::spawn(|| Symbol::intern("concurrent_name")))
            .collect();
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.join().expect("thread should not panic"));
        }
        assert!(
            ids.windows(2).all(|w| w[0] == w[1]),
            "all threads must observe the same symbol id"
        );
    }
}

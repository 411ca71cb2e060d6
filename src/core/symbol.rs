//! Symbol type for named program entities.
//!
//! Symbols come from import tables, export tables, and the loader's view of
//! defined functions. The engine only needs address-to-symbol lookup, used to
//! resolve calls through import slots without emulating them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::address::VirtualAddress;

/// Symbol kinds the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolKind {
    /// Imported symbol; the address is its import slot
    Import,
    /// Exported symbol
    Export,
    /// Defined function symbol
    Function,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolKind::Import => write!(f, "Import"),
            SymbolKind::Export => write!(f, "Export"),
            SymbolKind::Function => write!(f, "Function"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub address: VirtualAddress,
    pub name: String,
    pub kind: SymbolKind,
    /// Providing library for imports (e.g. `kernel32.dll`)
    pub library: Option<String>,
}

impl Symbol {
    pub fn new(address: VirtualAddress, name: impl Into<String>, kind: SymbolKind) -> Self {
        Self {
            address,
            name: name.into(),
            kind,
            library: None,
        }
    }

    pub fn import(address: VirtualAddress, library: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            kind: SymbolKind::Import,
            library: Some(library.into()),
        }
    }

    /// `library!name` for imports, `name` otherwise.
    pub fn qualified_name(&self) -> String {
        match &self.library {
            Some(lib) => format!("{}!{}", lib, self.name),
            None => self.name.clone(),
        }
    }

    pub fn is_import(&self) -> bool {
        self.kind == SymbolKind::Import
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {} ({})", self.qualified_name(), self.address, self.kind)
    }
}

/// Address-to-symbol lookup consulted by the target resolver.
pub trait SymbolResolver: Send + Sync {
    fn resolve_address_to_symbol(&self, address: VirtualAddress) -> Option<&Symbol>;
}

/// Ordered symbol table keyed by exact address.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolTable {
    by_address: BTreeMap<VirtualAddress, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a symbol. An import never gets replaced by a non-import at the
    /// same address; otherwise the later insert wins.
    pub fn insert(&mut self, symbol: Symbol) {
        if let Some(existing) = self.by_address.get(&symbol.address) {
            if existing.is_import() && !symbol.is_import() {
                return;
            }
        }
        self.by_address.insert(symbol.address, symbol);
    }

    pub fn get(&self, address: VirtualAddress) -> Option<&Symbol> {
        self.by_address.get(&address)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Symbol> {
        self.by_address
            .values()
            .find(|s| s.name == name || s.qualified_name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.by_address.values()
    }

    pub fn imports(&self) -> impl Iterator<Item = &Symbol> {
        self.iter().filter(|s| s.is_import())
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

impl SymbolResolver for SymbolTable {
    fn resolve_address_to_symbol(&self, address: VirtualAddress) -> Option<&Symbol> {
        self.get(address)
    }
}

impl FromIterator<Symbol> for SymbolTable {
    fn from_iter<I: IntoIterator<Item = Symbol>>(iter: I) -> Self {
        let mut table = SymbolTable::new();
        for s in iter {
            table.insert(s);
        }
        table
    }
}

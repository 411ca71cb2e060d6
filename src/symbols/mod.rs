//! Symbol extraction for loaded images.
//!
//! Builds the [`SymbolTable`] the resolver consults: import slots from the
//! PE import directories or the ELF dynamic relocations, exported entry
//! points, and defined function symbols.

pub mod elf;
pub mod pe;

use object::read::{Object, ObjectSymbol};
use tracing::debug;

use crate::core::address::VirtualAddress;
use crate::core::symbol::{Symbol, SymbolKind, SymbolTable};

/// Collect every symbol of `obj`. `data` is the raw file `obj` was parsed
/// from; PE import directories are read from it directly.
pub fn collect<'data>(obj: &object::File<'data>, data: &[u8]) -> SymbolTable {
    let mut table = SymbolTable::new();

    let imports = match obj.format() {
        object::BinaryFormat::Pe => pe::import_slots(data),
        object::BinaryFormat::Elf => elf::import_slots(obj),
        _ => Vec::new(),
    };
    let import_count = imports.len();
    for symbol in imports {
        table.insert(symbol);
    }

    let mut export_count = 0;
    if let Ok(exports) = obj.exports() {
        for export in exports {
            let name = String::from_utf8_lossy(export.name());
            if name.is_empty() || export.address() == 0 {
                continue;
            }
            table.insert(Symbol::new(VirtualAddress(export.address()), name, SymbolKind::Export));
            export_count += 1;
        }
    }

    let mut function_count = 0;
    for symbol in obj.symbols().chain(obj.dynamic_symbols()) {
        if symbol.kind() != object::SymbolKind::Text || !symbol.is_definition() || symbol.address() == 0 {
            continue;
        }
        let Ok(name) = symbol.name() else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        table.insert(Symbol::new(VirtualAddress(symbol.address()), name, SymbolKind::Function));
        function_count += 1;
    }

    debug!(
        imports = import_count,
        exports = export_count,
        functions = function_count,
        "collected symbols"
    );
    table
}

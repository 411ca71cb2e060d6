//! ELF import slots from dynamic relocations.
//!
//! `JUMP_SLOT` and `GLOB_DAT` relocations name the GOT entries that PLT stubs
//! and `call [rip+got]` sequences load their targets from. Each such slot is
//! recorded as an import of the relocation's dynamic symbol.

use object::read::{Object, ObjectSymbol, ObjectSymbolTable, RelocationTarget};
use object::{elf, RelocationFlags};

use crate::core::address::VirtualAddress;
use crate::core::symbol::{Symbol, SymbolKind};

fn is_slot_relocation(flags: RelocationFlags) -> bool {
    // R_386_JMP_SLOT and R_386_GLOB_DAT share these values.
    match flags {
        RelocationFlags::Elf { r_type } => {
            matches!(r_type, elf::R_X86_64_JUMP_SLOT | elf::R_X86_64_GLOB_DAT)
        }
        _ => false,
    }
}

/// GOT slots bound to named dynamic symbols. Empty for non-ELF input or
/// statically linked images.
pub fn import_slots<'data>(obj: &object::File<'data>) -> Vec<Symbol> {
    let mut out = Vec::new();
    if obj.format() != object::BinaryFormat::Elf {
        return out;
    }
    let (Some(relocations), Some(dynsym)) = (obj.dynamic_relocations(), obj.dynamic_symbol_table()) else {
        return out;
    };
    for (slot, relocation) in relocations {
        if !is_slot_relocation(relocation.flags()) {
            continue;
        }
        let RelocationTarget::Symbol(index) = relocation.target() else {
            continue;
        };
        let Ok(symbol) = dynsym.symbol_by_index(index) else {
            continue;
        };
        match symbol.name() {
            Ok(name) if !name.is_empty() => {
                out.push(Symbol::new(VirtualAddress(slot), name, SymbolKind::Import));
            }
            _ => {}
        }
    }
    out.sort_by_key(|s| s.address);
    out.dedup_by_key(|s| s.address);
    out
}

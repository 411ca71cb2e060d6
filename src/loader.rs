//! Program loading.
//!
//! Turns a PE or ELF file, or raw shellcode, into the immutable
//! [`ImageAddressSpace`] and [`SymbolTable`] the engine runs against.
//!
//! Import slots are bound to a synthetic `imports` region of `ret` stubs,
//! one per import, so that stepping over a call through an import slot
//! returns immediately instead of faulting on an unbound slot.

use std::path::Path;
use std::sync::Arc;

use object::read::{Object, ObjectSection};
use object::{SectionFlags, SectionKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analysis::{Engine, EngineContext};
use crate::config::EngineConfig;
use crate::core::address::VirtualAddress;
use crate::core::address_space::{ImageAddressSpace, Permissions, Region};
use crate::core::disassembler::Architecture;
use crate::core::symbol::{Symbol, SymbolKind, SymbolTable};
use crate::disasm::IcedDecoder;
use crate::emu::x86::X86EmulatorFactory;
use crate::error::{AnalysisError, Result};
use crate::symbols;

const SHF_WRITE: u64 = 0x1;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;
const SHF_TLS: u64 = 0x400;

const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

const STUB_ALIGNMENT: u64 = 0x1000;
const RET: u8 = 0xc3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleFormat {
    Pe,
    Elf,
    Shellcode,
}

/// A program image ready for exploration.
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub format: ModuleFormat,
    pub arch: Architecture,
    pub entry: VirtualAddress,
    pub image: Arc<ImageAddressSpace>,
    pub symbols: Arc<SymbolTable>,
}

/// A section's bytes before they become a [`Region`].
struct PendingSection {
    name: String,
    start: VirtualAddress,
    size: u64,
    data: Vec<u8>,
    perms: Permissions,
}

impl PendingSection {
    fn end(&self) -> u64 {
        self.start.value() + self.size.max(self.data.len() as u64)
    }

    /// Overwrite one pointer-sized slot, if it lies in this section.
    fn patch_word(&mut self, address: VirtualAddress, value: u64, word_size: u64) -> bool {
        if address < self.start {
            return false;
        }
        let off = (address - self.start) as usize;
        let len = word_size as usize;
        let Some(slot) = self.data.get_mut(off..off + len) else {
            return false;
        };
        slot.copy_from_slice(&value.to_le_bytes()[..len]);
        true
    }
}

fn section_permissions(flags: SectionFlags, kind: SectionKind) -> Permissions {
    match flags {
        SectionFlags::Elf { sh_flags } => {
            let mut perms = Permissions::R;
            if sh_flags & SHF_WRITE != 0 {
                perms |= Permissions::W;
            }
            if sh_flags & SHF_EXECINSTR != 0 {
                perms |= Permissions::X;
            }
            perms
        }
        SectionFlags::Coff { characteristics } => {
            let mut perms = Permissions::empty();
            if characteristics & IMAGE_SCN_MEM_READ != 0 {
                perms |= Permissions::R;
            }
            if characteristics & IMAGE_SCN_MEM_WRITE != 0 {
                perms |= Permissions::W;
            }
            if characteristics & IMAGE_SCN_MEM_EXECUTE != 0 {
                perms |= Permissions::X;
            }
            perms
        }
        _ => match kind {
            SectionKind::Text => Permissions::RX,
            SectionKind::Data | SectionKind::UninitializedData => Permissions::RW,
            _ => Permissions::R,
        },
    }
}

fn is_loadable(flags: SectionFlags) -> bool {
    match flags {
        SectionFlags::Elf { sh_flags } => sh_flags & SHF_ALLOC != 0 && sh_flags & SHF_TLS == 0,
        _ => true,
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

impl LoadedModule {
    /// Load a PE or ELF file from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        debug!(path = %path.display(), size = data.len(), "read module");
        Self::from_bytes(&data)
    }

    /// Parse and map a PE or ELF image for x86 or x86-64.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let obj = object::File::parse(data)
            .map_err(|e| AnalysisError::Resource(format!("cannot parse module: {}", e)))?;
        let format = match obj.format() {
            object::BinaryFormat::Pe => ModuleFormat::Pe,
            object::BinaryFormat::Elf => ModuleFormat::Elf,
            other => {
                return Err(AnalysisError::Resource(format!(
                    "unsupported module format {:?}",
                    other
                )))
            }
        };
        let arch = match obj.architecture() {
            object::Architecture::I386 => Architecture::X86,
            object::Architecture::X86_64 => Architecture::X86_64,
            other => {
                return Err(AnalysisError::Resource(format!(
                    "unsupported architecture {:?}",
                    other
                )))
            }
        };

        let mut sections = Vec::new();
        for section in obj.sections() {
            let flags = section.flags();
            if section.address() == 0 || section.size() == 0 || !is_loadable(flags) {
                continue;
            }
            let name = section.name().unwrap_or("<unnamed>").to_string();
            let mut data = section.data().unwrap_or(&[]).to_vec();
            data.truncate(section.size() as usize);
            sections.push(PendingSection {
                perms: section_permissions(flags, section.kind()),
                name,
                start: VirtualAddress(section.address()),
                size: section.size(),
                data,
            });
        }

        let mut symbols = symbols::collect(&obj, data);
        let entry = VirtualAddress(obj.entry());
        if entry.value() != 0 && symbols.get(entry).is_none() {
            symbols.insert(Symbol::new(entry, "entry", SymbolKind::Function));
        }

        let stubs = bind_import_stubs(&mut sections, &symbols, arch.word_size());

        let mut image = ImageAddressSpace::new();
        for section in sections.into_iter().chain(stubs) {
            let region = Region::new(section.name, section.start, section.size, &section.data, section.perms);
            if let Err(e) = image.map(region) {
                warn!(error = %e, "skipping overlapping section");
            }
        }

        info!(
            ?format,
            ?arch,
            %entry,
            regions = image.regions().len(),
            symbols = symbols.len(),
            "loaded module"
        );
        Ok(Self {
            format,
            arch,
            entry,
            image: Arc::new(image),
            symbols: Arc::new(symbols),
        })
    }

    /// Map raw code as one RWX region at `base`; the entry point is `base`.
    pub fn from_shellcode(code: &[u8], arch: Architecture, base: VirtualAddress) -> Result<Self> {
        if code.is_empty() {
            return Err(AnalysisError::Resource("empty shellcode".into()));
        }
        let mut image = ImageAddressSpace::new();
        image
            .map(Region::new("shellcode", base, code.len() as u64, code, Permissions::RWX))
            .map_err(|e| AnalysisError::Resource(e.to_string()))?;
        let mut symbols = SymbolTable::new();
        symbols.insert(Symbol::new(base, "entry", SymbolKind::Function));
        debug!(%base, size = code.len(), ?arch, "loaded shellcode");
        Ok(Self {
            format: ModuleFormat::Shellcode,
            arch,
            entry: base,
            image: Arc::new(image),
            symbols: Arc::new(symbols),
        })
    }

    /// Entry point plus every defined function symbol, ascending.
    pub fn functions(&self) -> Vec<VirtualAddress> {
        let mut out: Vec<VirtualAddress> = self
            .symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::Function && self.image.region(s.address).is_some())
            .map(|s| s.address)
            .collect();
        if !out.contains(&self.entry) {
            out.push(self.entry);
        }
        out.sort();
        out
    }

    pub fn decoder(&self) -> IcedDecoder {
        IcedDecoder::new(self.arch)
    }

    pub fn emulator_factory(&self, config: &EngineConfig) -> X86EmulatorFactory {
        X86EmulatorFactory::new(self.arch, self.image.clone())
            .with_stack(config.stack.clone())
            .with_max_callee_steps(config.budget.max_callee_steps)
    }

    /// An engine over this module with its symbols and `config`.
    pub fn engine(&self, config: EngineConfig) -> Engine<X86EmulatorFactory> {
        let factory = self.emulator_factory(&config);
        let context = EngineContext::new(Arc::new(self.decoder()))
            .with_symbols(self.symbols.clone())
            .with_config(config);
        Engine::new(factory, context)
    }
}

/// Point every import slot at its own `ret` stub in a new region placed
/// above the highest section. Returns the stub region, if any slot was bound.
fn bind_import_stubs(
    sections: &mut [PendingSection],
    symbols: &SymbolTable,
    word_size: u64,
) -> Option<PendingSection> {
    let top = sections.iter().map(PendingSection::end).max()?;
    let base = align_up(top, STUB_ALIGNMENT);
    let mut count = 0u64;
    for import in symbols.imports() {
        let stub = base + count;
        let bound = sections
            .iter_mut()
            .any(|s| s.patch_word(import.address, stub, word_size));
        if bound {
            count += 1;
        } else {
            debug!(slot = %import.address, name = %import.qualified_name(), "import slot outside any section");
        }
    }
    if count == 0 {
        return None;
    }
    debug!(stubs = count, base = %VirtualAddress(base), "bound import stubs");
    Some(PendingSection {
        name: "imports".to_string(),
        start: VirtualAddress(base),
        size: count,
        data: vec![RET; count as usize],
        perms: Permissions::RX,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address_space::AddressSpace;
    use crate::symbols::pe::tests::tiny_pe32;

    #[test]
    fn test_load_pe_binds_import_stubs() {
        let module = LoadedModule::from_bytes(&tiny_pe32()).unwrap();
        assert_eq!(module.format, ModuleFormat::Pe);
        assert_eq!(module.arch, Architecture::X86);
        assert_eq!(module.entry, VirtualAddress(0x40_1200));
        assert_eq!(module.image.permissions(module.entry), Some(Permissions::RWX));

        let stub = module.image.read_u32(VirtualAddress(0x40_1050)).unwrap();
        assert_eq!(stub, 0x40_2000);
        assert_eq!(module.image.byte(VirtualAddress(0x40_2000)), Some(RET));
        assert_eq!(module.image.permissions(VirtualAddress(0x40_2001)), Some(Permissions::RX));
        assert!(module.functions().contains(&module.entry));
    }

    #[test]
    fn test_import_call_steps_over_stub() {
        let module = LoadedModule::from_bytes(&tiny_pe32()).unwrap();
        let engine = module.engine(EngineConfig::default());
        let mut log = crate::core::artifact::ArtifactLog::new();
        let exploration = engine.explore_function(module.entry, &mut log).unwrap();

        assert_eq!(exploration.return_address, VirtualAddress(0x40_1206));
        assert_eq!(exploration.stack_delta, 0);
        let calls: Vec<_> = log.call_xrefs().map(|x| x.to).collect();
        assert_eq!(calls, vec![Some(VirtualAddress(0x40_1050))]);
    }

    #[test]
    fn test_shellcode() {
        let module = LoadedModule::from_shellcode(&[0xc3], Architecture::X86_64, VirtualAddress(0x1000)).unwrap();
        assert_eq!(module.format, ModuleFormat::Shellcode);
        assert_eq!(module.functions(), vec![VirtualAddress(0x1000)]);
        assert!(LoadedModule::from_shellcode(&[], Architecture::X86, VirtualAddress(0)).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        let err = LoadedModule::from_bytes(b"not a binary").unwrap_err();
        assert!(matches!(err, AnalysisError::Resource(_)));
    }

    #[test]
    fn test_section_permissions() {
        assert_eq!(
            section_permissions(SectionFlags::Elf { sh_flags: SHF_ALLOC | SHF_EXECINSTR }, SectionKind::Text),
            Permissions::RX
        );
        assert_eq!(
            section_permissions(SectionFlags::Coff { characteristics: 0xc000_0040 }, SectionKind::Data),
            Permissions::RW
        );
    }
}

//! PE import address table slots.
//!
//! Walks the import directory and the delay-load import directory and maps
//! every IAT slot VA to `library!function`. `call [slot]` and `jmp [slot]`
//! then resolve to the slot without emulation. Parsing is bounds-checked and
//! best effort: malformed directories yield fewer slots, never an error.

use crate::core::address::VirtualAddress;
use crate::core::symbol::Symbol;

const IMPORT_DIRECTORY: usize = 1;
const DELAY_IMPORT_DIRECTORY: usize = 13;
const IMPORT_DESCRIPTOR_SIZE: usize = 20;
const DELAY_DESCRIPTOR_SIZE: usize = 32;
const MAX_NAME: usize = 256;
/// Slots per descriptor before a table is considered corrupt
const MAX_THUNKS: usize = 0x10000;

#[derive(Debug, Clone, Copy)]
struct SectionHdr {
    va: u32,
    raw_ptr: u32,
    raw_size: u32,
    virt_size: u32,
}

/// The header fields import parsing needs.
#[derive(Debug, Clone)]
pub(crate) struct PeHeaders {
    pub image_base: u64,
    pub is_pe32_plus: bool,
    directories: Vec<(u32, u32)>,
    sections: Vec<SectionHdr>,
}

fn read_u16_le(data: &[u8], off: usize) -> Option<u16> {
    data.get(off..off + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32_le(data: &[u8], off: usize) -> Option<u32> {
    data.get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64_le(data: &[u8], off: usize) -> Option<u64> {
    Some(read_u32_le(data, off)? as u64 | (read_u32_le(data, off + 4)? as u64) << 32)
}

impl PeHeaders {
    pub(crate) fn parse(data: &[u8]) -> Option<Self> {
        let e_lfanew = read_u32_le(data, 0x3c)? as usize;
        if data.get(e_lfanew..e_lfanew + 4)? != b"PE\0\0" {
            return None;
        }
        let coff = e_lfanew + 4;
        let number_of_sections = read_u16_le(data, coff + 2)? as usize;
        let size_of_optional_header = read_u16_le(data, coff + 16)? as usize;

        let opt = coff + 20;
        let (is_pe32_plus, dir_offset) = match read_u16_le(data, opt)? {
            0x20b => (true, opt + 112),
            0x10b => (false, opt + 96),
            _ => return None,
        };
        let image_base = if is_pe32_plus {
            read_u64_le(data, opt + 24)?
        } else {
            read_u32_le(data, opt + 28)? as u64
        };
        let dir_count_offset = if is_pe32_plus { opt + 108 } else { opt + 92 };
        let dir_count = read_u32_le(data, dir_count_offset)?.min(16) as usize;
        let directories = (0..dir_count)
            .map_while(|i| {
                let off = dir_offset + i * 8;
                Some((read_u32_le(data, off)?, read_u32_le(data, off + 4)?))
            })
            .collect();

        let table = opt + size_of_optional_header;
        let sections = (0..number_of_sections)
            .map_while(|i| {
                let off = table + i * 40;
                Some(SectionHdr {
                    virt_size: read_u32_le(data, off + 8)?,
                    va: read_u32_le(data, off + 12)?,
                    raw_size: read_u32_le(data, off + 16)?,
                    raw_ptr: read_u32_le(data, off + 20)?,
                })
            })
            .collect();

        Some(Self {
            image_base,
            is_pe32_plus,
            directories,
            sections,
        })
    }

    fn directory(&self, index: usize) -> Option<u32> {
        self.directories
            .get(index)
            .map(|(rva, _)| *rva)
            .filter(|rva| *rva != 0)
    }

    fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        self.sections.iter().find_map(|s| {
            let size = s.virt_size.max(s.raw_size);
            let delta = rva.checked_sub(s.va)?;
            (delta < size && delta < s.raw_size.max(1)).then(|| s.raw_ptr.saturating_add(delta) as usize)
        })
    }

    fn thunk_size(&self) -> usize {
        if self.is_pe32_plus {
            8
        } else {
            4
        }
    }

    fn read_thunk(&self, data: &[u8], off: usize) -> Option<u64> {
        if self.is_pe32_plus {
            read_u64_le(data, off)
        } else {
            read_u32_le(data, off).map(u64::from)
        }
    }

    fn read_string(&self, data: &[u8], rva: u32) -> Option<String> {
        let off = self.rva_to_offset(rva)?;
        let bytes = data.get(off..(off + MAX_NAME).min(data.len()))?;
        let end = bytes.iter().position(|b| *b == 0)?;
        let s = std::str::from_utf8(&bytes[..end]).ok()?;
        (!s.is_empty()).then(|| s.to_string())
    }

    /// Function name for a lookup-table entry: by name or `#ordinal`.
    fn entry_name(&self, data: &[u8], entry: u64) -> Option<String> {
        let ordinal_flag = if self.is_pe32_plus { 1u64 << 63 } else { 1u64 << 31 };
        if entry & ordinal_flag != 0 {
            return Some(format!("#{}", entry & 0xffff));
        }
        // hint (u16) then the name
        self.read_string(data, (entry as u32).checked_add(2)?)
    }

    /// Walk one IAT, pairing each slot with its lookup-table entry.
    fn collect_slots(&self, data: &[u8], library: &str, iat_rva: u32, lookup_rva: u32, out: &mut Vec<Symbol>) {
        let size = self.thunk_size();
        let (Some(iat_off), Some(lookup_off)) = (self.rva_to_offset(iat_rva), self.rva_to_offset(lookup_rva))
        else {
            return;
        };
        for index in 0..MAX_THUNKS {
            let Some(entry) = self.read_thunk(data, lookup_off + index * size) else {
                break;
            };
            if entry == 0 || self.read_thunk(data, iat_off + index * size).is_none() {
                break;
            }
            let Some(name) = self.entry_name(data, entry) else {
                continue;
            };
            let slot = self.image_base + iat_rva as u64 + (index * size) as u64;
            out.push(Symbol::import(VirtualAddress(slot), library, name));
        }
    }
}

/// Import slots of a PE image, ordinary and delay-loaded. Empty for
/// anything that is not a parseable PE.
pub fn import_slots(data: &[u8]) -> Vec<Symbol> {
    let mut out = Vec::new();
    let Some(pe) = PeHeaders::parse(data) else {
        return out;
    };

    if let Some(mut off) = pe.directory(IMPORT_DIRECTORY).and_then(|rva| pe.rva_to_offset(rva)) {
        while let (Some(original_first_thunk), Some(name_rva), Some(first_thunk)) = (
            read_u32_le(data, off),
            read_u32_le(data, off + 12),
            read_u32_le(data, off + 16),
        ) {
            if original_first_thunk == 0 && name_rva == 0 && first_thunk == 0 {
                break;
            }
            let library = pe.read_string(data, name_rva).unwrap_or_default();
            // Without a lookup table the IAT itself still holds the name RVAs on disk.
            let lookup = if original_first_thunk != 0 {
                original_first_thunk
            } else {
                first_thunk
            };
            pe.collect_slots(data, &library, first_thunk, lookup, &mut out);
            off += IMPORT_DESCRIPTOR_SIZE;
        }
    }

    if let Some(mut off) = pe.directory(DELAY_IMPORT_DIRECTORY).and_then(|rva| pe.rva_to_offset(rva)) {
        while let (Some(attributes), Some(name_rva), Some(iat_rva), Some(int_rva)) = (
            read_u32_le(data, off),
            read_u32_le(data, off + 4),
            read_u32_le(data, off + 12),
            read_u32_le(data, off + 16),
        ) {
            if name_rva == 0 && iat_rva == 0 {
                break;
            }
            // Attribute bit 0 clear: legacy descriptors holding VAs.
            let to_rva = |v: u32| {
                if attributes & 1 == 0 {
                    v.wrapping_sub(pe.image_base as u32)
                } else {
                    v
                }
            };
            let library = pe.read_string(data, to_rva(name_rva)).unwrap_or_default();
            pe.collect_slots(data, &library, to_rva(iat_rva), to_rva(int_rva), &mut out);
            off += DELAY_DESCRIPTOR_SIZE;
        }
    }

    out.sort_by_key(|s| s.address);
    out.dedup_by_key(|s| s.address);
    out
}

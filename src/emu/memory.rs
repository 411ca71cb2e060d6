//! Emulator memory: the shared program image plus private state.
//!
//! The image is read-only and shared between emulator instances through an
//! `Arc`. Writes land in a sparse overlay of 4 KiB pages, each page itself
//! behind an `Arc` so that cloning the memory (snapshots) only copies page
//! pointers; a page is duplicated on its first write after a clone.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::address::VirtualAddress;
use crate::core::address_space::{AddressSpace, ImageAddressSpace, MemoryError, Permissions};

pub const PAGE_SIZE: u64 = 0x1000;
const PAGE_MASK: u64 = PAGE_SIZE - 1;

type Page = [u8; PAGE_SIZE as usize];

/// A zero-initialized region owned by one emulator (e.g. its stack).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnonymousMapping {
    pub name: String,
    pub start: VirtualAddress,
    pub size: u64,
    pub perms: Permissions,
}

impl AnonymousMapping {
    fn contains(&self, address: VirtualAddress) -> bool {
        address >= self.start && address.value() - self.start.value() < self.size
    }
}

#[derive(Debug, Clone)]
pub struct EmulatorMemory {
    image: Arc<ImageAddressSpace>,
    anonymous: Vec<AnonymousMapping>,
    pages: HashMap<u64, Arc<Page>>,
}

impl EmulatorMemory {
    pub fn new(image: Arc<ImageAddressSpace>) -> Self {
        Self {
            image,
            anonymous: Vec::new(),
            pages: HashMap::new(),
        }
    }

    pub fn image(&self) -> &Arc<ImageAddressSpace> {
        &self.image
    }

    /// Map a zero-filled region. Fails if it overlaps the image or another
    /// anonymous mapping.
    pub fn map_anonymous(
        &mut self,
        name: impl Into<String>,
        start: VirtualAddress,
        size: u64,
        perms: Permissions,
    ) -> Result<(), MemoryError> {
        let name = name.into();
        let end = start
            .checked_add(size)
            .ok_or(MemoryError::OutOfBounds {
                start,
                len: size as usize,
            })?;
        let overlaps_image = self
            .image
            .regions()
            .iter()
            .any(|r| start < r.end() && r.start < end);
        let overlaps_anon = self
            .anonymous
            .iter()
            .any(|m| start.value() < m.start.value() + m.size && m.start < end);
        if overlaps_image || overlaps_anon {
            return Err(MemoryError::Overlap { name, start });
        }
        self.anonymous.push(AnonymousMapping {
            name,
            start,
            size,
            perms,
        });
        Ok(())
    }

    pub fn anonymous_mappings(&self) -> &[AnonymousMapping] {
        &self.anonymous
    }

    /// Number of pages privately modified by this instance.
    pub fn dirty_pages(&self) -> usize {
        self.pages.len()
    }

    fn byte(&self, address: VirtualAddress) -> Option<u8> {
        let page = address.value() & !PAGE_MASK;
        if let Some(p) = self.pages.get(&page) {
            if self.permissions(address).is_some() {
                return Some(p[(address.value() & PAGE_MASK) as usize]);
            }
            return None;
        }
        if let Some(b) = self.image.byte(address) {
            return Some(b);
        }
        self.anonymous
            .iter()
            .any(|m| m.contains(address))
            .then_some(0)
    }

    /// Check that `len` bytes at `address` may be written.
    pub fn check_writable(&self, address: VirtualAddress, len: usize) -> Result<(), MemoryError> {
        for i in 0..len as u64 {
            let a = address.wrapping_offset(i as i64);
            match self.permissions(a) {
                None => return Err(MemoryError::Unmapped(a)),
                Some(p) if !p.contains(Permissions::W) => {
                    return Err(MemoryError::WriteProtected(a))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Write bytes into the overlay. Callers validate with
    /// [`check_writable`](Self::check_writable) first.
    pub fn write(&mut self, address: VirtualAddress, data: &[u8]) -> Result<(), MemoryError> {
        self.check_writable(address, data.len())?;
        for (i, b) in data.iter().enumerate() {
            let a = address.value().wrapping_add(i as u64);
            let base = a & !PAGE_MASK;
            if !self.pages.contains_key(&base) {
                let fresh = self.materialize(base);
                self.pages.insert(base, Arc::new(fresh));
            }
            if let Some(page) = self.pages.get_mut(&base) {
                Arc::make_mut(page)[(a & PAGE_MASK) as usize] = *b;
            }
        }
        Ok(())
    }

    /// Initial contents of the page at `base`.
    fn materialize(&self, base: u64) -> Page {
        let mut page = [0u8; PAGE_SIZE as usize];
        for (i, slot) in page.iter_mut().enumerate() {
            if let Some(b) = self.image.byte(VirtualAddress(base + i as u64)) {
                *slot = b;
            }
        }
        page
    }
}

impl AddressSpace for EmulatorMemory {
    fn read(&self, address: VirtualAddress, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut out = Vec::with_capacity(len);
        for i in 0..len as u64 {
            let a = address.wrapping_offset(i as i64);
            match self.byte(a) {
                Some(b) => out.push(b),
                None if i == 0 => return Err(MemoryError::Unmapped(a)),
                None => return Err(MemoryError::OutOfBounds { start: address, len }),
            }
        }
        Ok(out)
    }

    fn permissions(&self, address: VirtualAddress) -> Option<Permissions> {
        self.image.permissions(address).or_else(|| {
            self.anonymous
                .iter()
                .find(|m| m.contains(address))
                .map(|m| m.perms)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address_space::Region;

    fn memory() -> EmulatorMemory {
        let mut img = ImageAddressSpace::new();
        img.map(Region::new("code", VirtualAddress(0x1000), 0x10, &[0xc3; 0x10], Permissions::RX))
            .unwrap();
        img.map(Region::new("data", VirtualAddress(0x2000), 0x10, &[7; 0x10], Permissions::RW))
            .unwrap();
        let mut mem = EmulatorMemory::new(Arc::new(img));
        mem.map_anonymous("stack", VirtualAddress(0x8000), 0x2000, Permissions::RW)
            .unwrap();
        mem
    }

    #[test]
    fn test_overlay_write_preserves_image() {
        let mut mem = memory();
        let image = mem.image().clone();
        mem.write(VirtualAddress(0x2004), &[1, 2]).unwrap();
        assert_eq!(mem.read(VirtualAddress(0x2003), 4).unwrap(), vec![7, 1, 2, 7]);
        assert_eq!(image.byte(VirtualAddress(0x2004)), Some(7));
        assert_eq!(mem.dirty_pages(), 1);
    }

    #[test]
    fn test_write_protection() {
        let mut mem = memory();
        assert_eq!(
            mem.write(VirtualAddress(0x1000), &[0x90]),
            Err(MemoryError::WriteProtected(VirtualAddress(0x1000)))
        );
        assert_eq!(
            mem.write(VirtualAddress(0x5000), &[0]),
            Err(MemoryError::Unmapped(VirtualAddress(0x5000)))
        );
    }

    #[test]
    fn test_stack_is_zeroed_and_bounded() {
        let mut mem = memory();
        assert_eq!(mem.read_u32(VirtualAddress(0x9ff0)).unwrap(), 0);
        mem.write(VirtualAddress(0x9ffc), &[1, 0, 0, 0]).unwrap();
        assert_eq!(mem.read_u32(VirtualAddress(0x9ffc)).unwrap(), 1);
        assert!(mem.read(VirtualAddress(0x9ffe), 4).is_err());
        assert!(mem
            .map_anonymous("dup", VirtualAddress(0x9000), 0x10, Permissions::RW)
            .is_err());
    }

    #[test]
    fn test_clone_is_copy_on_write() {
        let mut mem = memory();
        mem.write(VirtualAddress(0x8000), &[1]).unwrap();
        let saved = mem.clone();
        mem.write(VirtualAddress(0x8000), &[2]).unwrap();
        assert_eq!(saved.read(VirtualAddress(0x8000), 1).unwrap(), vec![1]);
        assert_eq!(mem.read(VirtualAddress(0x8000), 1).unwrap(), vec![2]);
    }
}

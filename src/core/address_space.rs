//! Byte-addressable views over loaded program memory.
//!
//! `AddressSpace` is the bounded read interface every analysis component
//! consumes: the decoder reads instruction bytes through it, and the emulator
//! implements it over its own (possibly modified) memory. `ImageAddressSpace`
//! is the immutable, loaded program image shared between emulator instances.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::VirtualAddress;

/// Errors that can occur during memory reads.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("address not mapped: {0}")]
    Unmapped(VirtualAddress),
    #[error("address not writable: {0}")]
    WriteProtected(VirtualAddress),
    #[error("range {start}..+{len:#x} crosses an unmapped gap")]
    OutOfBounds { start: VirtualAddress, len: usize },
    #[error("region {name} at {start} overlaps an existing mapping")]
    Overlap { name: String, start: VirtualAddress },
}

bitflags! {
    /// Access permissions of a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Permissions: u8 {
        const R = 0b0000_0001;
        const W = 0b0000_0010;
        const X = 0b0000_0100;
        const RW = Self::R.bits() | Self::W.bits();
        const RX = Self::R.bits() | Self::X.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.contains(Permissions::R) { 'r' } else { '-' };
        let w = if self.contains(Permissions::W) { 'w' } else { '-' };
        let x = if self.contains(Permissions::X) { 'x' } else { '-' };
        write!(f, "{}{}{}", r, w, x)
    }
}

/// Bounded reads by virtual address.
pub trait AddressSpace {
    /// Read exactly `len` bytes starting at `address`.
    fn read(&self, address: VirtualAddress, len: usize) -> Result<Vec<u8>, MemoryError>;

    /// Permissions of the region containing `address`, if mapped.
    fn permissions(&self, address: VirtualAddress) -> Option<Permissions>;

    /// Is the given address mapped?
    fn is_mapped(&self, address: VirtualAddress) -> bool {
        self.permissions(address).is_some()
    }

    /// Read as many bytes as are contiguously mapped, up to `max`.
    ///
    /// Fails only when `address` itself is unmapped.
    fn read_up_to(&self, address: VirtualAddress, max: usize) -> Result<Vec<u8>, MemoryError> {
        let mut len = max;
        while len > 0 {
            if let Ok(bytes) = self.read(address, len) {
                return Ok(bytes);
            }
            len -= 1;
        }
        Err(MemoryError::Unmapped(address))
    }

    /// Convenience: read a little-endian u32.
    fn read_u32(&self, address: VirtualAddress) -> Result<u32, MemoryError> {
        let b = self.read(address, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Convenience: read a little-endian u64.
    fn read_u64(&self, address: VirtualAddress) -> Result<u64, MemoryError> {
        let b = self.read(address, 8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a pointer of `word_size` bytes (4 or 8).
    fn read_pointer(&self, address: VirtualAddress, word_size: u64) -> Result<u64, MemoryError> {
        if word_size == 8 {
            self.read_u64(address)
        } else {
            self.read_u32(address).map(u64::from)
        }
    }
}

/// One contiguous mapping of the program image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub name: String,
    pub start: VirtualAddress,
    pub perms: Permissions,
    data: Vec<u8>,
}

impl Region {
    /// Map `data` at `start`, zero-extended to `size` bytes (BSS-style tails).
    pub fn new(name: impl Into<String>, start: VirtualAddress, size: u64, data: &[u8], perms: Permissions) -> Self {
        let size = size.max(data.len() as u64) as usize;
        let mut buf = vec![0u8; size];
        buf[..data.len()].copy_from_slice(data);
        Self {
            name: name.into(),
            start,
            perms,
            data: buf,
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Exclusive end address.
    pub fn end(&self) -> VirtualAddress {
        self.start + self.len()
    }

    pub fn contains(&self, address: VirtualAddress) -> bool {
        address >= self.start && address < self.end()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// The loaded program image: sorted, non-overlapping regions.
///
/// Immutable once built; emulators layer their own writable state on top.
#[derive(Debug, Clone, Default)]
pub struct ImageAddressSpace {
    regions: Vec<Region>,
}

impl ImageAddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a region, rejecting empty or overlapping mappings.
    pub fn map(&mut self, region: Region) -> Result<(), MemoryError> {
        if region.is_empty() {
            return Ok(());
        }
        if self
            .regions
            .iter()
            .any(|r| region.start < r.end() && r.start < region.end())
        {
            return Err(MemoryError::Overlap {
                name: region.name.clone(),
                start: region.start,
            });
        }
        let at = self.regions.partition_point(|r| r.start < region.start);
        self.regions.insert(at, region);
        Ok(())
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// The region containing `address`.
    pub fn region(&self, address: VirtualAddress) -> Option<&Region> {
        let idx = self.regions.partition_point(|r| r.start <= address);
        if idx == 0 {
            return None;
        }
        let r = &self.regions[idx - 1];
        r.contains(address).then_some(r)
    }

    /// A single byte, if mapped.
    pub fn byte(&self, address: VirtualAddress) -> Option<u8> {
        self.region(address)
            .map(|r| r.data[(address - r.start) as usize])
    }
}

impl AddressSpace for ImageAddressSpace {
    fn read(&self, address: VirtualAddress, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut out = Vec::with_capacity(len);
        let mut cur = address;
        while out.len() < len {
            let region = self.region(cur).ok_or(if out.is_empty() {
                MemoryError::Unmapped(cur)
            } else {
                MemoryError::OutOfBounds { start: address, len }
            })?;
            let off = (cur - region.start) as usize;
            let take = (len - out.len()).min(region.data.len() - off);
            out.extend_from_slice(&region.data[off..off + take]);
            cur = cur + take as u64;
        }
        Ok(out)
    }

    fn permissions(&self, address: VirtualAddress) -> Option<Permissions> {
        self.region(address).map(|r| r.perms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> ImageAddressSpace {
        let mut img = ImageAddressSpace::new();
        img.map(Region::new(".text", VirtualAddress(0x1000), 0x10, &[0x90; 0x10], Permissions::RX))
            .unwrap();
        img.map(Region::new(".data", VirtualAddress(0x1010), 0x20, &[1, 2, 3, 4], Permissions::RW))
            .unwrap();
        img
    }

    #[test]
    fn read_within_region() {
        let img = image();
        assert_eq!(img.read(VirtualAddress(0x1000), 2).unwrap(), vec![0x90, 0x90]);
        assert_eq!(img.read_u32(VirtualAddress(0x1010)).unwrap(), 0x04030201);
    }

    #[test]
    fn read_spans_adjacent_regions() {
        let img = image();
        let bytes = img.read(VirtualAddress(0x100e), 4).unwrap();
        assert_eq!(bytes, vec![0x90, 0x90, 1, 2]);
    }

    #[test]
    fn bss_tail_is_zero_filled() {
        let img = image();
        assert_eq!(img.byte(VirtualAddress(0x1020)), Some(0));
        assert_eq!(img.byte(VirtualAddress(0x1030)), None);
    }

    #[test]
    fn unmapped_reads_fail() {
        let img = image();
        assert_eq!(
            img.read(VirtualAddress(0x500), 1),
            Err(MemoryError::Unmapped(VirtualAddress(0x500)))
        );
        assert!(matches!(
            img.read(VirtualAddress(0x102e), 4),
            Err(MemoryError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn read_up_to_truncates_at_gap() {
        let img = image();
        let bytes = img.read_up_to(VirtualAddress(0x102c), 15).unwrap();
        assert_eq!(bytes.len(), 4);
    }

    #[test]
    fn overlapping_map_rejected() {
        let mut img = image();
        let err = img
            .map(Region::new("dup", VirtualAddress(0x1008), 8, &[], Permissions::R))
            .unwrap_err();
        assert!(matches!(err, MemoryError::Overlap { .. }));
    }

    #[test]
    fn permissions_lookup() {
        let img = image();
        assert_eq!(img.permissions(VirtualAddress(0x1004)), Some(Permissions::RX));
        assert_eq!(img.permissions(VirtualAddress(0x1014)), Some(Permissions::RW));
        assert_eq!(Permissions::RX.to_string(), "r-x");
        assert!(!img.is_mapped(VirtualAddress(0x2000)));
    }
}

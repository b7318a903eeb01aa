//! Memory model: non-volatile memories and the data space layout.
//!
//! Flash, EEPROM, fuses, user row and lock bits are [`NonVolatileMemory`]
//! blocks held in an [`NvmBank`] keyed by [`Area`]. Each byte carries a
//! "programmed" tag; unprogrammed bytes read as the erased value `0xFF`.
//!
//! The data space is laid out as on classic AVR cores:
//!
//! | Address Range        | Content                          |
//! |----------------------|----------------------------------|
//! | 0x0000–0x001F        | General registers R0–R31         |
//! | iostart–ioend        | I/O + extended I/O registers     |
//! | ramstart–ramend      | SRAM                             |
//!
//! [`data_space_map`] resolves a data address to one of these regions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{MemAddr, RegAddr};

/// Value of an erased NVM byte.
pub const ERASED: u8 = 0xFF;

/// Non-volatile memory areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Area {
    Flash,
    Eeprom,
    Fuses,
    UserRow,
    Lockbit,
}

impl Area {
    pub const ALL: [Area; 5] = [Area::Flash, Area::Eeprom, Area::Fuses, Area::UserRow, Area::Lockbit];
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Area::Flash => "flash",
            Area::Eeprom => "eeprom",
            Area::Fuses => "fuses",
            Area::UserRow => "userrow",
            Area::Lockbit => "lockbit",
        };
        f.write_str(s)
    }
}

/// Contiguous copy of part of a memory.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemBlock {
    pub base: u32,
    pub buf: Vec<u8>,
}

/// Byte buffer with per-byte programmed tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonVolatileMemory {
    data: Vec<u8>,
    tags: Vec<bool>,
}

impl NonVolatileMemory {
    pub fn new(size: usize) -> Self {
        NonVolatileMemory { data: vec![ERASED; size], tags: vec![false; size] }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Clamp `[base, base+len)` to the memory size.
    fn clamp(&self, base: usize, len: usize) -> std::ops::Range<usize> {
        let start = base.min(self.data.len());
        let end = base.saturating_add(len).min(self.data.len());
        start..end
    }

    pub fn erase(&mut self) {
        self.data.fill(ERASED);
        self.tags.fill(false);
    }

    pub fn erase_range(&mut self, base: usize, len: usize) {
        let r = self.clamp(base, len);
        self.data[r.clone()].fill(ERASED);
        self.tags[r].fill(false);
    }

    /// Copy `buf` at `base`, tagging the bytes programmed. Returns the
    /// number of bytes written.
    pub fn program(&mut self, buf: &[u8], base: usize) -> usize {
        let r = self.clamp(base, buf.len());
        let n = r.len();
        self.data[r.clone()].copy_from_slice(&buf[..n]);
        self.tags[r].fill(true);
        n
    }

    /// Write one byte. Out of range writes are ignored.
    #[inline(always)]
    pub fn write(&mut self, value: u8, addr: usize) {
        if addr < self.data.len() {
            self.data[addr] = value;
            self.tags[addr] = true;
        }
    }

    #[inline(always)]
    pub fn read(&self, addr: usize) -> u8 {
        self.data.get(addr).copied().unwrap_or(ERASED)
    }

    /// Little-endian 16-bit word at byte address `addr`.
    #[inline(always)]
    pub fn read_word(&self, addr: usize) -> u16 {
        self.read(addr) as u16 | ((self.read(addr + 1) as u16) << 8)
    }

    #[inline(always)]
    pub fn programmed(&self, addr: usize) -> bool {
        self.tags.get(addr).copied().unwrap_or(false)
    }

    /// Number of programmed bytes.
    pub fn programmed_count(&self) -> usize {
        self.tags.iter().filter(|&&t| t).count()
    }

    /// Copy of `[base, base+len)`, clamped.
    pub fn block(&self, base: usize, len: usize) -> MemBlock {
        let r = self.clamp(base, len);
        MemBlock { base: r.start as u32, buf: self.data[r].to_vec() }
    }

    /// Copy memory content starting at `base` into `out`. Returns the count copied.
    pub fn copy_into(&self, out: &mut [u8], base: usize) -> usize {
        let r = self.clamp(base, out.len());
        let n = r.len();
        out[..n].copy_from_slice(&self.data[r]);
        n
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

/// The set of non-volatile memories of a device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NvmBank {
    areas: BTreeMap<Area, NonVolatileMemory>,
}

impl NvmBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an area of `size` bytes. Zero-sized areas are not created.
    pub fn add(&mut self, area: Area, size: usize) {
        if size > 0 {
            self.areas.insert(area, NonVolatileMemory::new(size));
        }
    }

    pub fn get(&self, area: Area) -> Option<&NonVolatileMemory> {
        self.areas.get(&area)
    }

    pub fn get_mut(&mut self, area: Area) -> Option<&mut NonVolatileMemory> {
        self.areas.get_mut(&area)
    }

    pub fn areas(&self) -> impl Iterator<Item = Area> + '_ {
        self.areas.keys().copied()
    }
}

// ─── Data space ─────────────────────────────────────────────────────────────

/// Boundaries of the data space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLayout {
    pub iostart: MemAddr,
    pub ioend: MemAddr,
    pub ramstart: MemAddr,
    pub ramend: MemAddr,
}

/// Region a data address falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRegion {
    /// General register R0–R31.
    Register(u8),
    /// I/O register, address relative to `iostart`.
    Io(RegAddr),
    /// SRAM, offset from `ramstart`.
    Sram(usize),
    Unmapped,
}

/// Resolve a data space address.
pub fn data_space_map(layout: &DataLayout, addr: MemAddr) -> DataRegion {
    if addr < 32 {
        DataRegion::Register(addr as u8)
    } else if addr >= layout.iostart && addr <= layout.ioend {
        DataRegion::Io(addr - layout.iostart)
    } else if addr >= layout.ramstart && addr <= layout.ramend {
        DataRegion::Sram((addr - layout.ramstart) as usize)
    } else {
        DataRegion::Unmapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_erased_by_default() {
        let nvm = NonVolatileMemory::new(16);
        assert_eq!(nvm.read(3), ERASED);
        assert!(!nvm.programmed(3));
        assert_eq!(nvm.read(100), ERASED);
    }

    #[test]
    fn test_program_clamps_and_tags() {
        let mut nvm = NonVolatileMemory::new(8);
        let n = nvm.program(&[1, 2, 3, 4], 6);
        assert_eq!(n, 2);
        assert_eq!(nvm.read(6), 1);
        assert_eq!(nvm.read(7), 2);
        assert!(nvm.programmed(7));
        assert!(!nvm.programmed(5));
        assert_eq!(nvm.programmed_count(), 2);
    }

    #[test]
    fn test_erase_range() {
        let mut nvm = NonVolatileMemory::new(8);
        nvm.program(&[0; 8], 0);
        nvm.erase_range(2, 3);
        assert_eq!(nvm.block(0, 8).buf, vec![0, 0, 0xFF, 0xFF, 0xFF, 0, 0, 0]);
        assert!(!nvm.programmed(3));
    }

    #[test]
    fn test_program_word() {
        let mut nvm = NonVolatileMemory::new(4);
        nvm.write(0x0C, 0);
        nvm.write(0x94, 1);
        assert_eq!(nvm.read_word(0), 0x940C);
    }

    #[test]
    fn test_copy_into() {
        let mut nvm = NonVolatileMemory::new(4);
        nvm.program(&[9, 8, 7, 6], 0);
        let mut out = [0u8; 6];
        assert_eq!(nvm.copy_into(&mut out, 1), 3);
        assert_eq!(&out[..3], &[8, 7, 6]);
    }

    #[test]
    fn test_data_space_map() {
        let layout = DataLayout { iostart: 0x20, ioend: 0xFF, ramstart: 0x100, ramend: 0x8FF };
        assert_eq!(data_space_map(&layout, 0x1F), DataRegion::Register(31));
        assert_eq!(data_space_map(&layout, 0x25), DataRegion::Io(0x05));
        assert_eq!(data_space_map(&layout, 0x100), DataRegion::Sram(0));
        assert_eq!(data_space_map(&layout, 0x900), DataRegion::Unmapped);
    }

    #[test]
    fn test_bank_skips_empty_areas() {
        let mut bank = NvmBank::new();
        bank.add(Area::Flash, 32);
        bank.add(Area::UserRow, 0);
        assert!(bank.get(Area::Flash).is_some());
        assert!(bank.get(Area::UserRow).is_none());
    }
}

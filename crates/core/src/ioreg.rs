//! I/O register file.
//!
//! Every I/O address holds an optional [`IoRegister`]: a stored byte plus the
//! list of peripherals owning it. Addresses are relative to the start of the
//! I/O area (`iostart`), so `0x3F` is SREG on classic cores.
//!
//! Dispatch to owners is done by the device, this module only keeps storage
//! and computes what a CPU write does to the stored value.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::RegAddr;

/// Description of one CPU write, passed to register owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoRegWrite {
    /// Stored value after the write.
    pub value: u8,
    /// Stored value before the write.
    pub old: u8,
    /// Bits that went 0 → 1.
    pub posedge: u8,
    /// Bits that went 1 → 0.
    pub negedge: u8,
}

impl IoRegWrite {
    pub fn new(old: u8, value: u8) -> Self {
        IoRegWrite { value, old, posedge: value & !old, negedge: old & !value }
    }

    #[inline(always)]
    pub fn anyedge(&self) -> u8 {
        self.posedge | self.negedge
    }
}

/// Owner index of a register: a peripheral slot in the device.
pub type OwnerIndex = usize;

#[derive(Debug, Clone, Default)]
pub struct IoRegister {
    value: u8,
    owners: Vec<OwnerIndex>,
    use_mask: u8,
    ro_mask: u8,
    /// Plain core storage (SREG, SPL, RAMPZ...), no owner.
    core: bool,
}

impl IoRegister {
    #[inline(always)]
    pub fn value(&self) -> u8 {
        self.value
    }

    pub fn owners(&self) -> &[OwnerIndex] {
        &self.owners
    }

    pub fn use_mask(&self) -> u8 {
        self.use_mask
    }

    pub fn ro_mask(&self) -> u8 {
        self.ro_mask
    }

    pub fn is_core(&self) -> bool {
        self.core
    }
}

#[derive(Debug, Clone, Default)]
pub struct IoRegisters {
    regs: Vec<Option<IoRegister>>,
}

impl IoRegisters {
    /// Register file covering I/O addresses `0..=ioend`.
    pub fn new(ioend: RegAddr) -> Self {
        IoRegisters { regs: vec![None; ioend as usize + 1] }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.regs.len()
    }

    fn check(&self, addr: RegAddr) -> Result<usize, ConfigError> {
        let i = addr as usize;
        if i < self.regs.len() {
            Ok(i)
        } else {
            Err(ConfigError::BadIoRegister { addr, ioend: (self.regs.len() - 1) as RegAddr })
        }
    }

    /// Map `mask` bits of `addr` to peripheral `owner`. Bits in `ro_mask`
    /// keep their stored value on CPU writes. Several owners may share one
    /// register.
    pub fn add(&mut self, addr: RegAddr, owner: OwnerIndex, mask: u8, ro_mask: u8) -> Result<(), ConfigError> {
        let i = self.check(addr)?;
        let reg = self.regs[i].get_or_insert_with(IoRegister::default);
        if !reg.owners.contains(&owner) {
            reg.owners.push(owner);
        }
        reg.use_mask |= mask;
        reg.ro_mask |= ro_mask & mask;
        Ok(())
    }

    /// Map `addr` as plain core storage.
    pub fn add_core(&mut self, addr: RegAddr) -> Result<(), ConfigError> {
        let i = self.check(addr)?;
        let reg = self.regs[i].get_or_insert_with(IoRegister::default);
        reg.core = true;
        reg.use_mask = 0xFF;
        Ok(())
    }

    pub fn get(&self, addr: RegAddr) -> Option<&IoRegister> {
        self.regs.get(addr as usize).and_then(|r| r.as_ref())
    }

    #[inline(always)]
    pub fn is_mapped(&self, addr: RegAddr) -> bool {
        self.get(addr).is_some()
    }

    /// Stored value, without side effects. Unmapped registers read 0.
    #[inline(always)]
    pub fn value(&self, addr: RegAddr) -> u8 {
        self.get(addr).map_or(0, |r| r.value)
    }

    /// Store a value directly, bypassing masks. Returns false if unmapped.
    #[inline(always)]
    pub fn set_value(&mut self, addr: RegAddr, value: u8) -> bool {
        match self.regs.get_mut(addr as usize) {
            Some(Some(reg)) => {
                reg.value = value;
                true
            }
            _ => false,
        }
    }

    /// Apply a CPU write to storage and describe it, or `None` if unmapped.
    pub fn cpu_write(&mut self, addr: RegAddr, value: u8) -> Option<IoRegWrite> {
        let reg = self.regs.get_mut(addr as usize)?.as_mut()?;
        let old = reg.value;
        reg.value = (value & reg.use_mask & !reg.ro_mask) | (old & reg.ro_mask);
        Some(IoRegWrite::new(old, reg.value))
    }

    /// Owner list of `addr` (empty if unmapped or core).
    pub fn owners(&self, addr: RegAddr) -> Vec<OwnerIndex> {
        self.get(addr).map(|r| r.owners.clone()).unwrap_or_default()
    }

    /// Clear every stored value.
    pub fn reset(&mut self) {
        for reg in self.regs.iter_mut().flatten() {
            reg.value = 0;
        }
    }

    pub fn values(&self) -> RegValues {
        RegValues(self.regs.iter().map(|r| r.as_ref().map_or(0, |r| r.value)).collect())
    }

    /// Restore values captured with [`values`](Self::values).
    pub fn restore(&mut self, values: &RegValues) -> bool {
        if values.0.len() != self.regs.len() {
            return false;
        }
        for (reg, &v) in self.regs.iter_mut().zip(values.0.iter()) {
            if let Some(reg) = reg {
                reg.value = v;
            }
        }
        true
    }
}

/// Raw register values, one per I/O address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegValues(pub Vec<u8>);

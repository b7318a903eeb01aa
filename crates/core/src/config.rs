//! Device configuration.
//!
//! Plain data structs, deserialisable from any serde format. A descriptor
//! loader outside this crate is expected to fill them; [`DeviceConfig::atmega328`]
//! gives a ready-made classic AVR layout for tests and the CLI.
//!
//! All register addresses in this module are I/O addresses (data address
//! minus `iostart`).

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::memory::DataLayout;
use crate::types::{FlashAddr, MemAddr, RegAddr};

bitflags! {
    /// Architecture variants of the core.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CoreAttributes: u32 {
        /// 22-bit program counter: three byte return addresses, EIND/RAMPZ.
        const EXTENDED_ADDRESSING = 0x01;
        /// I is cleared on interrupt entry and set again by RETI.
        const CLEAR_GIE_ON_INT    = 0x02;
    }
}

/// I/O addresses of the core registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreRegisters {
    pub sreg: RegAddr,
    pub spl: RegAddr,
    pub sph: RegAddr,
    pub rampz: Option<RegAddr>,
    pub eind: Option<RegAddr>,
}

impl Default for CoreRegisters {
    fn default() -> Self {
        CoreRegisters { sreg: 0x3F, spl: 0x3D, sph: 0x3E, rampz: None, eind: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub attributes: CoreAttributes,
    pub iostart: MemAddr,
    pub ioend: MemAddr,
    pub ramstart: MemAddr,
    pub ramend: MemAddr,
    /// Last flash byte address.
    pub flashend: FlashAddr,
    /// Last EEPROM byte address, `None` without EEPROM.
    pub eepromend: Option<u32>,
    pub fusesize: usize,
    pub userrowsize: usize,
    /// Factory fuse values, programmed at build time.
    pub fuses: Vec<u8>,
    pub vector_count: usize,
    /// Size of a vector table entry in bytes.
    pub vector_size: u32,
    /// Cycles spent entering an interrupt vector.
    pub int_entry_cycles: u64,
    pub registers: CoreRegisters,
}

impl CoreConfig {
    pub fn layout(&self) -> DataLayout {
        DataLayout { iostart: self.iostart, ioend: self.ioend, ramstart: self.ramstart, ramend: self.ramend }
    }

    pub fn flash_size(&self) -> usize {
        self.flashend as usize + 1
    }

    pub fn eeprom_size(&self) -> usize {
        self.eepromend.map_or(0, |e| e as usize + 1)
    }

    pub fn sram_size(&self) -> usize {
        (self.ramend - self.ramstart) as usize + 1
    }

    /// Highest I/O address.
    pub fn io_size(&self) -> RegAddr {
        self.ioend - self.iostart
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let bad = |s: &str| Err(ConfigError::MemoryLayout(s.to_string()));
        if self.iostart < 32 {
            return bad("I/O area overlaps the register file");
        }
        if self.ioend < self.iostart {
            return bad("ioend below iostart");
        }
        if self.ramstart <= self.ioend || self.ramend < self.ramstart {
            return bad("SRAM must follow the I/O area");
        }
        if self.flashend % 2 == 0 {
            return bad("flash must hold whole words");
        }
        if self.vector_size % 2 != 0 || self.vector_size == 0 {
            return bad("vector size must be a non-zero even number of bytes");
        }
        if self.vector_count == 0 {
            return bad("no interrupt vector");
        }
        if self.fuses.len() > self.fusesize {
            return bad("more factory fuses than fuse bytes");
        }
        let regs = &self.registers;
        for addr in [Some(regs.sreg), Some(regs.spl), Some(regs.sph), regs.rampz, regs.eind].into_iter().flatten() {
            if addr > self.io_size() {
                return Err(ConfigError::BadIoRegister { addr, ioend: self.io_size() });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub core: CoreConfig,
    pub pins: Vec<String>,
}

impl DeviceConfig {
    /// ATmega328: 32 KB flash, 2 KB SRAM, 1 KB EEPROM, 26 vectors.
    pub fn atmega328() -> Self {
        let mut pins = Vec::new();
        for i in 0..8 {
            pins.push(format!("PB{}", i));
        }
        for i in 0..7 {
            pins.push(format!("PC{}", i));
        }
        for i in 0..8 {
            pins.push(format!("PD{}", i));
        }
        DeviceConfig {
            name: "atmega328".to_string(),
            core: CoreConfig {
                attributes: CoreAttributes::CLEAR_GIE_ON_INT,
                iostart: 0x20,
                ioend: 0xFF,
                ramstart: 0x100,
                ramend: 0x8FF,
                flashend: 0x7FFF,
                eepromend: Some(0x3FF),
                fusesize: 3,
                userrowsize: 0,
                fuses: vec![0x62, 0xD9, 0xFF],
                vector_count: 26,
                vector_size: 4,
                int_entry_cycles: 4,
                registers: CoreRegisters::default(),
            },
            pins,
        }
    }
}
